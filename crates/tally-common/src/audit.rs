use std::{fmt, net::IpAddr, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TallyError};

const MAX_SESSION_KEY_LEN: usize = 64;
const MAX_TEXT_LEN: usize = 255;
const UNSPECIFIED_ADDRESS: &str = "0.0.0.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Login,
    ViewMetrics,
    ExportData,
    ViewApplications,
    ViewAudit,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::ViewMetrics => "view_metrics",
            Self::ExportData => "export_data",
            Self::ViewApplications => "view_applications",
            Self::ViewAudit => "view_audit",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = TallyError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "login" => Ok(Self::Login),
            "view_metrics" => Ok(Self::ViewMetrics),
            "export_data" => Ok(Self::ExportData),
            "view_applications" => Ok(Self::ViewApplications),
            "view_audit" => Ok(Self::ViewAudit),
            other => Err(TallyError::Validation(format!("unknown audit action: {other}"))),
        }
    }
}

/// Append-only record of one access to the read side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Option<i64>,
    pub user_id: Option<i64>,
    pub session_key: Option<String>,
    pub action: AuditAction,
    pub target: Option<String>,
    pub ip_address: String,
    pub user_agent: Option<String>,
    pub status_code: u16,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: Option<i64>,
        session_key: Option<&str>,
        action: AuditAction,
        target: Option<&str>,
        ip_address: &str,
        user_agent: Option<&str>,
        status_code: u16,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            user_id,
            session_key: session_key.map(|key| truncate(key, MAX_SESSION_KEY_LEN)),
            action,
            target: target.map(|target| truncate(target, MAX_TEXT_LEN)),
            ip_address: sanitize_ip(ip_address),
            user_agent: user_agent.map(|agent| truncate(agent, MAX_TEXT_LEN)),
            status_code,
            timestamp,
        }
    }
}

fn sanitize_ip(raw: &str) -> String {
    let raw = raw.trim();
    let candidate = raw
        .strip_prefix("::ffff:")
        .filter(|rest| rest.contains('.'))
        .unwrap_or(raw);

    match candidate.parse::<IpAddr>() {
        Ok(addr) => addr.to_string(),
        Err(_) => UNSPECIFIED_ADDRESS.to_string(),
    }
}

fn truncate(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}
