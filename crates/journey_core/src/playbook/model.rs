//! Serde shape of a playbook document.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Locale code to text.
pub type LocalizedText = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybookDocument {
    #[serde(default)]
    pub playbook_id: Option<String>,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub locale_default: Option<String>,
    #[serde(default)]
    pub worlds: Vec<WorldDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldDef {
    pub id: String,
    #[serde(default)]
    pub title: LocalizedText,
    #[serde(default)]
    pub nodes: Vec<NodeDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDef {
    pub id: String,
    #[serde(default)]
    pub title: LocalizedText,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub requirements: Option<Requirements>,
    /// Nodes that must be `done` before this one may open.
    #[serde(default)]
    pub prerequisites: Vec<String>,
    #[serde(default)]
    pub next: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Requirements {
    #[serde(default)]
    pub form_schema: Option<serde_json::Value>,
    /// Key into the validator registry, e.g. `profile` or `app7`.
    #[serde(default)]
    pub validator: Option<String>,
    #[serde(default)]
    pub uploads: Vec<UploadRequirement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadRequirement {
    pub key: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub mime: Vec<String>,
    #[serde(default)]
    pub max_size: Option<i64>,
    #[serde(default)]
    pub label: LocalizedText,
    #[serde(default)]
    pub accept: Option<String>,
}

impl UploadRequirement {
    /// An empty `mime` list accepts any content type.
    pub fn accepts_mime(&self, content_type: &str) -> bool {
        let ct = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        self.mime.is_empty() || self.mime.iter().any(|m| m.eq_ignore_ascii_case(&ct))
    }
}
