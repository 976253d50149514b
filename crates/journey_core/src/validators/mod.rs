//! Form validators.
//!
//! A validator turns raw submission bytes into normalized JSON plus a small
//! summary, or reports every issue it found. The engine only ever stores
//! the normalized form. Validators are idempotent: feeding the normalized
//! output back in yields the same output.

pub mod app7;
pub mod profile;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::error::{JourneyError, Result};
use crate::playbook::Node;

pub use app7::App7Validator;
pub use profile::ProfileValidator;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct ValidationIssue {
    /// Dotted location of the offending value, e.g. `sections.ip[2]`.
    pub path: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            f.write_str(&self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationResult {
    Ok {
        normalized: serde_json::Value,
        summary: serde_json::Value,
    },
    Err(Vec<ValidationIssue>),
}

impl ValidationResult {
    /// Collapse into the engine's error type. Issues are rendered, sorted and
    /// joined with `; `.
    pub fn into_result(self) -> Result<(serde_json::Value, serde_json::Value)> {
        match self {
            Self::Ok {
                normalized,
                summary,
            } => Ok((normalized, summary)),
            Self::Err(issues) => Err(JourneyError::InvalidInput(join_issues(&issues))),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }
}

pub fn join_issues(issues: &[ValidationIssue]) -> String {
    let mut rendered: Vec<String> = issues.iter().map(|i| i.to_string()).collect();
    rendered.sort();
    rendered.dedup();
    rendered.join("; ")
}

pub trait FormValidator: Send + Sync {
    /// Registry key, also usable as `requirements.validator` in a playbook.
    fn key(&self) -> &'static str;

    fn validate(&self, raw: &[u8]) -> ValidationResult;
}

/// Parse bytes as a JSON object or report a single issue.
pub(crate) fn parse_object(
    raw: &[u8],
) -> std::result::Result<serde_json::Map<String, serde_json::Value>, ValidationIssue> {
    match serde_json::from_slice::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(_) => Err(ValidationIssue::new("", "payload must be a JSON object")),
        Err(e) => Err(ValidationIssue::new("", format!("malformed JSON: {e}"))),
    }
}

/// Maps nodes to validators.
///
/// Resolution order: an explicit binding for the node id, then the node's
/// `requirements.validator` key.
#[derive(Clone, Default)]
pub struct ValidatorRegistry {
    by_key: HashMap<&'static str, Arc<dyn FormValidator>>,
    by_node: HashMap<String, &'static str>,
}

impl ValidatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the profile and publications validators bound to their
    /// well-known nodes.
    pub fn with_defaults(profile_node: &str, publications_node: &str) -> Self {
        let mut reg = Self::new();
        reg.register(Arc::new(ProfileValidator::default()));
        reg.register(Arc::new(App7Validator));
        reg.bind_node(profile_node, profile::KEY);
        reg.bind_node(publications_node, app7::KEY);
        reg
    }

    pub fn register(&mut self, validator: Arc<dyn FormValidator>) {
        self.by_key.insert(validator.key(), validator);
    }

    pub fn bind_node(&mut self, node_id: impl Into<String>, key: &'static str) {
        self.by_node.insert(node_id.into(), key);
    }

    pub fn resolve(&self, node: &Node) -> Option<Arc<dyn FormValidator>> {
        let key = self
            .by_node
            .get(&node.id)
            .copied()
            .or(node.requirements.validator.as_deref())?;
        self.by_key.get(key).cloned()
    }

    /// Validate a submission for `node`.
    ///
    /// Nodes without a validator accept any JSON object unchanged. A node
    /// that names an unknown validator key is a playbook error.
    pub fn validate(
        &self,
        node: &Node,
        raw: &[u8],
    ) -> Result<(serde_json::Value, serde_json::Value)> {
        if let Some(v) = self.resolve(node) {
            return v.validate(raw).into_result();
        }
        if let Some(key) = node.requirements.validator.as_deref() {
            return Err(JourneyError::Internal(anyhow::anyhow!(
                "node '{}' names unknown validator '{}'",
                node.id,
                key
            )));
        }
        let map = parse_object(raw).map_err(|i| JourneyError::InvalidInput(i.to_string()))?;
        Ok((serde_json::Value::Object(map), serde_json::Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playbook::Requirements;

    fn node(id: &str, validator: Option<&str>) -> Node {
        Node {
            id: id.into(),
            world_id: "W1".into(),
            title: Default::default(),
            kind: "form".into(),
            requirements: Requirements {
                validator: validator.map(String::from),
                ..Default::default()
            },
            prerequisites: vec![],
            next: vec![],
        }
    }

    #[test]
    fn issues_are_sorted_and_joined() {
        let issues = vec![
            ValidationIssue::new("b[1]", "z"),
            ValidationIssue::new("a[2]", "y"),
            ValidationIssue::new("a[1]", "x"),
        ];
        assert_eq!(join_issues(&issues), "a[1]: x; a[2]: y; b[1]: z");
    }

    #[test]
    fn resolves_by_node_binding_then_key() {
        let reg = ValidatorRegistry::with_defaults("S1_profile", "S1_publications_list");
        assert_eq!(
            reg.resolve(&node("S1_profile", None)).unwrap().key(),
            "profile"
        );
        assert_eq!(
            reg.resolve(&node("other", Some("app7"))).unwrap().key(),
            "app7"
        );
        assert!(reg.resolve(&node("plain", None)).is_none());
    }

    #[test]
    fn plain_nodes_accept_objects_only() {
        let reg = ValidatorRegistry::new();
        let (normalized, summary) = reg
            .validate(&node("plain", None), br#"{"answer": 42}"#)
            .unwrap();
        assert_eq!(normalized["answer"], 42);
        assert!(summary.is_null());

        let err = reg.validate(&node("plain", None), b"[1,2]").unwrap_err();
        assert!(matches!(err, JourneyError::InvalidInput(_)));
    }

    #[test]
    fn unknown_validator_key_is_internal() {
        let reg = ValidatorRegistry::new();
        let err = reg
            .validate(&node("x", Some("nope")), b"{}")
            .unwrap_err();
        assert!(matches!(err, JourneyError::Internal(_)));
    }
}
