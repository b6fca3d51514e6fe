//! Attribute constraints used to place workers on specific agents.
//!
//! Operators configure constraints as a JSON object keyed by worker label,
//! e.g. `{"linux": {"os": "ubuntu", "zone": "a"}}`. Parsing is lenient: a
//! malformed document or entry is logged and treated as "no constraint" so a
//! configuration mistake never blocks every offer.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::offer::Attribute;

/// Required agent attributes for a worker: every pair must be present on the
/// offer with an equal value. Extra offer attributes are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeSelector(BTreeMap<String, String>);

impl AttributeSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a required attribute.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Converts a JSON object into a selector.
    ///
    /// Scalar values are compared by their text form. Returns `None` if the
    /// value is not an object or contains nested values.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        let object = value.as_object()?;
        let mut selector = BTreeMap::new();
        for (name, value) in object {
            let text = match value {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Bool(b) => b.to_string(),
                _ => return None,
            };
            selector.insert(name.clone(), text);
        }
        Some(Self(selector))
    }

    /// Parses a selector, falling back to "no constraint" on any error.
    pub fn parse_lenient(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() {
            return Self::default();
        }

        match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(value) => Self::from_json(&value).unwrap_or_else(|| {
                warn!(raw, "Attribute constraint is not a flat JSON object, ignoring");
                Self::default()
            }),
            Err(e) => {
                warn!(raw, error = %e, "Failed to parse attribute constraint, ignoring");
                Self::default()
            }
        }
    }

    /// Returns the required attributes the offer does not satisfy.
    pub fn unmet<'a>(&'a self, attributes: &[Attribute]) -> Vec<(&'a str, &'a str)> {
        self.iter()
            .filter(|(name, value)| {
                !attributes
                    .iter()
                    .any(|a| a.name == *name && a.value == *value)
            })
            .collect()
    }

    /// Returns true if every required attribute is present with an equal value.
    pub fn matches(&self, attributes: &[Attribute]) -> bool {
        self.unmet(attributes).is_empty()
    }
}

/// Attribute selectors keyed by worker label.
#[derive(Debug, Clone, Default)]
pub struct LabelConstraints {
    by_label: HashMap<String, AttributeSelector>,
}

impl LabelConstraints {
    /// Parses `{label: {attribute: value}}`.
    ///
    /// Invalid entries are logged and skipped; an unparseable document yields
    /// no constraints at all.
    pub fn parse_lenient(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() {
            return Self::default();
        }

        let value = match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Failed to parse label constraints, ignoring all");
                return Self::default();
            }
        };

        let Some(object) = value.as_object() else {
            warn!("Label constraints must be a JSON object, ignoring all");
            return Self::default();
        };

        let mut by_label = HashMap::new();
        for (label, selector) in object {
            match AttributeSelector::from_json(selector) {
                Some(selector) => {
                    by_label.insert(label.clone(), selector);
                }
                None => warn!(label = %label, "Invalid constraint for label, ignoring"),
            }
        }
        Self { by_label }
    }

    pub fn insert(&mut self, label: impl Into<String>, selector: AttributeSelector) {
        self.by_label.insert(label.into(), selector);
    }

    /// Selector for `label`, if one was configured.
    pub fn selector_for(&self, label: &str) -> Option<&AttributeSelector> {
        self.by_label.get(label)
    }

    pub fn len(&self) -> usize {
        self.by_label.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_label.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> Vec<Attribute> {
        pairs
            .iter()
            .map(|(name, value)| Attribute {
                name: name.to_string(),
                value: value.to_string(),
            })
            .collect()
    }

    #[test]
    fn test_empty_selector_matches_anything() {
        assert!(AttributeSelector::new().matches(&[]));
        assert!(AttributeSelector::new().matches(&attrs(&[("os", "linux")])));
    }

    #[test]
    fn test_subset_matches() {
        let selector = AttributeSelector::new().with("os", "linux");
        assert!(selector.matches(&attrs(&[("os", "linux"), ("zone", "a")])));
    }

    #[test]
    fn test_value_mismatch_is_reported() {
        let selector = AttributeSelector::new().with("os", "linux").with("zone", "b");
        let unmet = selector.unmet(&attrs(&[("os", "linux"), ("zone", "a")]));
        assert_eq!(unmet, vec![("zone", "b")]);
    }

    #[test]
    fn test_parse_coerces_scalars() {
        let selector = AttributeSelector::parse_lenient(r#"{"gpu": true, "rack": 7}"#);
        assert!(selector.matches(&attrs(&[("gpu", "true"), ("rack", "7")])));
    }

    #[test]
    fn test_parse_garbage_is_permissive() {
        assert!(AttributeSelector::parse_lenient("{not json").is_empty());
        assert!(AttributeSelector::parse_lenient("[1, 2]").is_empty());
        assert!(AttributeSelector::parse_lenient(r#"{"a": {"b": 1}}"#).is_empty());
    }

    #[test]
    fn test_label_constraints_skip_bad_entries() {
        let constraints = LabelConstraints::parse_lenient(
            r#"{"linux": {"os": "ubuntu"}, "broken": "nope"}"#,
        );
        assert_eq!(constraints.len(), 1);
        assert!(constraints.selector_for("linux").is_some());
        assert!(constraints.selector_for("broken").is_none());
    }

    #[test]
    fn test_label_constraints_unparseable() {
        assert!(LabelConstraints::parse_lenient("}{").is_empty());
        assert!(LabelConstraints::parse_lenient("").is_empty());
    }
}
