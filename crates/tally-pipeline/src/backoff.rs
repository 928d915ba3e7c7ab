use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

/// Exponential delays for retrying one operation; unbounded in attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
    current: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        let current = config.initial;
        Self {
            config,
            attempt: 0,
            current,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn next_delay(&mut self) -> Duration {
        self.attempt += 1;
        if self.attempt > 1 {
            let scaled = self.current.as_secs_f64() * self.config.multiplier.max(1.0);
            self.current = if scaled >= self.config.max.as_secs_f64() {
                self.config.max
            } else {
                Duration::from_secs_f64(scaled)
            };
        }
        self.current.min(self.config.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current = self.config.initial;
    }
}
