use std::hash::{Hash, Hasher};

use crate::{
    error::{Result, TallyError},
    types::{AttributeValue, Attributes},
};

/// Normalized `(name, attributes, bounds)` tuple that identifies one metric.
///
/// Equality and hashing use the canonical attribute text and the bit patterns
/// of the bounds, so two keys compare equal exactly when the storage unique
/// index would treat them as the same row.
#[derive(Debug, Clone)]
pub struct CanonicalKey {
    name: String,
    attributes: Attributes,
    attributes_json: String,
    bounds: Vec<f64>,
}

impl CanonicalKey {
    pub fn new(name: &str, attributes: &Attributes, bounds: Option<&[f64]>) -> Result<Self> {
        if name.trim().is_empty() {
            return Err(TallyError::InvalidEnvelope(
                "metric name is required".to_string(),
            ));
        }

        let attributes = canonical_attributes(attributes)?;
        let attributes_json = serde_json::to_string(&attributes).map_err(|err| {
            TallyError::InternalError(format!("failed to encode attributes: {err}"))
        })?;
        let bounds = canonical_bounds(bounds.unwrap_or_default())?;

        Ok(Self {
            name: name.to_string(),
            attributes,
            attributes_json,
            bounds,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Sorted-key JSON object text; stable across processes.
    pub fn attributes_json(&self) -> &str {
        &self.attributes_json
    }

    pub fn bounds(&self) -> &[f64] {
        &self.bounds
    }
}

impl PartialEq for CanonicalKey {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.attributes_json == other.attributes_json
            && self.bounds.len() == other.bounds.len()
            && self
                .bounds
                .iter()
                .zip(&other.bounds)
                .all(|(left, right)| left.to_bits() == right.to_bits())
    }
}

impl Eq for CanonicalKey {}

impl Hash for CanonicalKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.attributes_json.hash(state);
        for bound in &self.bounds {
            bound.to_bits().hash(state);
        }
    }
}

fn canonical_attributes(attributes: &Attributes) -> Result<Attributes> {
    attributes
        .iter()
        .map(|(key, value)| Ok((key.clone(), value.clone().normalized()?)))
        .collect()
}

fn canonical_bounds(bounds: &[f64]) -> Result<Vec<f64>> {
    let mut canonical: Vec<f64> = Vec::with_capacity(bounds.len());
    for &bound in bounds {
        if !bound.is_finite() {
            return Err(TallyError::InvalidEnvelope(format!(
                "non-finite histogram bound: {bound}"
            )));
        }
        // -0.0 and 0.0 must land on the same key.
        let bound = if bound == 0.0 { 0.0 } else { bound };
        if canonical.last().is_some_and(|previous| *previous >= bound) {
            return Err(TallyError::InvalidEnvelope(
                "histogram bounds must be strictly increasing".to_string(),
            ));
        }
        canonical.push(bound);
    }
    Ok(canonical)
}

pub fn attribute(key: &str, value: impl Into<AttributeValue>) -> (String, AttributeValue) {
    (key.to_string(), value.into())
}
