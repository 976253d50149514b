//! Playbook catalog.
//!
//! A playbook is an immutable JSON document describing worlds and the node
//! DAG inside them. [`Playbook`] is the read-only index built from one
//! stored version; [`PlaybookCatalog`] keeps the current index per tenant.

mod catalog;
mod model;

pub use catalog::{IngestStatus, Ingested, PlaybookCatalog};
pub use model::{LocalizedText, NodeDef, PlaybookDocument, Requirements, UploadRequirement, WorldDef};

use std::collections::{HashMap, HashSet, VecDeque};

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{JourneyError, Result};
use crate::store::PlaybookVersion;

/// Locale used when neither the caller nor the playbook names one.
pub const FALLBACK_LOCALE: &str = "ru";

/// A node with its world resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: String,
    pub world_id: String,
    pub title: LocalizedText,
    pub kind: String,
    pub requirements: Requirements,
    pub prerequisites: Vec<String>,
    pub next: Vec<String>,
}

impl Node {
    pub fn uploads(&self) -> &[UploadRequirement] {
        &self.requirements.uploads
    }

    pub fn upload(&self, slot_key: &str) -> Option<&UploadRequirement> {
        self.requirements.uploads.iter().find(|u| u.key == slot_key)
    }

    pub fn required_slots(&self) -> impl Iterator<Item = &UploadRequirement> {
        self.requirements.uploads.iter().filter(|u| u.required)
    }

    pub fn is_form(&self) -> bool {
        self.kind == "form"
    }
}

/// Parse, key-sort and hash raw playbook bytes.
///
/// Returns the canonical JSON value and the lowercase hex SHA-256 of its
/// serialized form. Key order and whitespace in the input do not affect the
/// checksum.
pub fn canonicalize(raw: &[u8]) -> Result<(serde_json::Value, String)> {
    let value: serde_json::Value = serde_json::from_slice(raw)
        .map_err(|e| JourneyError::InvalidPlaybook(format!("malformed JSON: {e}")))?;
    let canonical = sort_keys(value);
    let bytes = serde_json::to_vec(&canonical)
        .map_err(|e| JourneyError::Internal(anyhow::anyhow!("serialize playbook: {e}")))?;
    let checksum = hex::encode(Sha256::digest(&bytes));
    Ok((canonical, checksum))
}

fn sort_keys(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<_> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            serde_json::Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, sort_keys(v)))
                    .collect(),
            )
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(sort_keys).collect())
        }
        other => other,
    }
}

/// Read-only index over one playbook version.
#[derive(Debug, Clone)]
pub struct Playbook {
    pub version_id: Uuid,
    pub tenant_id: Uuid,
    pub version: String,
    pub checksum: String,
    pub locale_default: String,
    nodes: HashMap<String, Node>,
    parents_of: HashMap<String, Vec<String>>,
    worlds_order: Vec<String>,
    world_nodes: HashMap<String, Vec<String>>,
    world_titles: HashMap<String, LocalizedText>,
}

impl Playbook {
    /// Build the index for a stored version.
    pub fn from_version(row: &PlaybookVersion) -> Result<Self> {
        let doc: PlaybookDocument = serde_json::from_value(row.raw_json.clone())
            .map_err(|e| JourneyError::InvalidPlaybook(e.to_string()))?;
        Self::build(row.id, row.tenant_id, row.checksum.clone(), doc)
    }

    /// Validate a document and build its index.
    pub fn build(
        version_id: Uuid,
        tenant_id: Uuid,
        checksum: String,
        doc: PlaybookDocument,
    ) -> Result<Self> {
        if doc.version.trim().is_empty() {
            return Err(JourneyError::InvalidPlaybook("missing version".into()));
        }
        if doc.worlds.is_empty() {
            return Err(JourneyError::InvalidPlaybook("playbook has no worlds".into()));
        }

        let mut nodes = HashMap::new();
        let mut worlds_order = Vec::with_capacity(doc.worlds.len());
        let mut world_nodes = HashMap::new();
        let mut world_titles = HashMap::new();

        for world in doc.worlds {
            if world.id.trim().is_empty() {
                return Err(JourneyError::InvalidPlaybook("world without id".into()));
            }
            if world_nodes.contains_key(&world.id) {
                return Err(JourneyError::PlaybookConflict(format!(
                    "duplicate world id '{}'",
                    world.id
                )));
            }
            let mut ids = Vec::with_capacity(world.nodes.len());
            for def in world.nodes {
                if def.id.trim().is_empty() {
                    return Err(JourneyError::InvalidPlaybook(format!(
                        "node without id in world '{}'",
                        world.id
                    )));
                }
                if nodes.contains_key(&def.id) {
                    return Err(JourneyError::PlaybookConflict(format!(
                        "duplicate node id '{}'",
                        def.id
                    )));
                }
                let mut seen_slots = HashSet::new();
                let requirements = def.requirements.unwrap_or_default();
                for up in &requirements.uploads {
                    if !seen_slots.insert(up.key.as_str()) {
                        return Err(JourneyError::InvalidPlaybook(format!(
                            "node '{}' declares slot '{}' twice",
                            def.id, up.key
                        )));
                    }
                }
                ids.push(def.id.clone());
                nodes.insert(
                    def.id.clone(),
                    Node {
                        id: def.id,
                        world_id: world.id.clone(),
                        title: def.title,
                        kind: def.kind,
                        requirements,
                        prerequisites: def.prerequisites,
                        next: def.next,
                    },
                );
            }
            worlds_order.push(world.id.clone());
            world_titles.insert(world.id.clone(), world.title);
            world_nodes.insert(world.id, ids);
        }

        let mut parents_of: HashMap<String, Vec<String>> = HashMap::new();
        for node in nodes.values() {
            for target in node.next.iter().chain(node.prerequisites.iter()) {
                if !nodes.contains_key(target) {
                    return Err(JourneyError::InvalidPlaybook(format!(
                        "node '{}' references unknown node '{}'",
                        node.id, target
                    )));
                }
            }
            for target in &node.next {
                parents_of
                    .entry(target.clone())
                    .or_default()
                    .push(node.id.clone());
            }
        }
        for parents in parents_of.values_mut() {
            parents.sort();
        }

        let pb = Self {
            version_id,
            tenant_id,
            version: doc.version,
            checksum,
            locale_default: doc
                .locale_default
                .filter(|l| !l.trim().is_empty())
                .unwrap_or_else(|| FALLBACK_LOCALE.to_string()),
            nodes,
            parents_of,
            worlds_order,
            world_nodes,
            world_titles,
        };
        pb.ensure_acyclic()?;
        Ok(pb)
    }

    // Kahn's algorithm over `next` edges.
    fn ensure_acyclic(&self) -> Result<()> {
        let mut indegree: HashMap<&str, usize> =
            self.nodes.keys().map(|k| (k.as_str(), 0)).collect();
        for node in self.nodes.values() {
            for t in &node.next {
                if let Some(d) = indegree.get_mut(t.as_str()) {
                    *d += 1;
                }
            }
        }
        let mut queue: VecDeque<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(k, _)| *k)
            .collect();
        let mut visited = 0;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            for t in self.next_of(id) {
                if let Some(d) = indegree.get_mut(t.as_str()) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(t.as_str());
                    }
                }
            }
        }
        if visited == self.nodes.len() {
            Ok(())
        } else {
            Err(JourneyError::InvalidPlaybook(
                "node graph contains a cycle".into(),
            ))
        }
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn require_node(&self, id: &str) -> Result<&Node> {
        self.node(id)
            .ok_or_else(|| JourneyError::NotFound(format!("node '{id}'")))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn world_of(&self, node_id: &str) -> Option<&str> {
        self.nodes.get(node_id).map(|n| n.world_id.as_str())
    }

    pub fn next_of(&self, node_id: &str) -> &[String] {
        self.nodes
            .get(node_id)
            .map(|n| n.next.as_slice())
            .unwrap_or(&[])
    }

    pub fn parents_of(&self, node_id: &str) -> &[String] {
        self.parents_of
            .get(node_id)
            .map(|p| p.as_slice())
            .unwrap_or(&[])
    }

    /// Explicit prerequisites plus DAG parents, deduplicated.
    pub fn gating_predecessors(&self, node_id: &str) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        let explicit = self
            .nodes
            .get(node_id)
            .map(|n| n.prerequisites.as_slice())
            .unwrap_or(&[]);
        for id in explicit.iter().chain(self.parents_of(node_id)) {
            if !out.contains(&id.as_str()) {
                out.push(id.as_str());
            }
        }
        out
    }

    pub fn worlds_order(&self) -> &[String] {
        &self.worlds_order
    }

    pub fn world_nodes(&self, world_id: &str) -> &[String] {
        self.world_nodes
            .get(world_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn nodes_in_world(&self, world_id: &str) -> usize {
        self.world_nodes(world_id).len()
    }

    pub fn world_title(&self, world_id: &str, locale: &str) -> Option<String> {
        self.world_titles
            .get(world_id)
            .and_then(|t| self.pick_title(t, locale))
    }

    /// Resolve the locale to use: the requested one, else the playbook
    /// default.
    pub fn resolve_locale(&self, requested: Option<&str>) -> String {
        requested
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .unwrap_or_else(|| self.locale_default.clone())
    }

    pub fn node_title(&self, node_id: &str, locale: &str) -> Option<String> {
        self.nodes
            .get(node_id)
            .and_then(|n| self.pick_title(&n.title, locale))
    }

    fn pick_title(&self, titles: &LocalizedText, locale: &str) -> Option<String> {
        titles
            .get(locale)
            .or_else(|| titles.get(&self.locale_default))
            .or_else(|| titles.get(FALLBACK_LOCALE))
            .or_else(|| titles.values().next())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn build(doc: serde_json::Value) -> Result<Playbook> {
        let doc: PlaybookDocument = serde_json::from_value(doc).unwrap();
        Playbook::build(Uuid::new_v4(), Uuid::new_v4(), "sum".into(), doc)
    }

    fn sample() -> serde_json::Value {
        json!({
            "version": "2025.1",
            "locale_default": "en",
            "worlds": [
                {"id": "W1", "title": {"en": "Start"}, "nodes": [
                    {"id": "fork", "type": "form", "title": {"en": "Fork", "ru": "Развилка"},
                     "next": ["branch_a", "branch_b"]},
                    {"id": "branch_a", "type": "confirmTask", "next": ["join"]},
                    {"id": "branch_b", "type": "confirmTask", "next": ["join"]}
                ]},
                {"id": "W2", "nodes": [
                    {"id": "join", "type": "form", "prerequisites": ["branch_a", "branch_b"]}
                ]}
            ]
        })
    }

    #[test]
    fn canonical_checksum_ignores_key_order_and_whitespace() {
        let a = br#"{"version":"1","worlds":[{"id":"W1","nodes":[]}]}"#;
        let b = br#"{ "worlds" : [ { "nodes": [], "id": "W1" } ],
                    "version": "1" }"#;
        let (_, ca) = canonicalize(a).unwrap();
        let (_, cb) = canonicalize(b).unwrap();
        assert_eq!(ca, cb);
        assert_eq!(ca.len(), 64);
    }

    #[test]
    fn malformed_json_is_invalid_playbook() {
        let err = canonicalize(b"{not json").unwrap_err();
        assert!(matches!(err, JourneyError::InvalidPlaybook(_)));
    }

    #[test]
    fn builds_indexes() {
        let pb = build(sample()).unwrap();
        assert_eq!(pb.worlds_order(), &["W1".to_string(), "W2".to_string()]);
        assert_eq!(pb.nodes_in_world("W1"), 3);
        assert_eq!(pb.nodes_in_world("W9"), 0);
        assert_eq!(pb.world_of("join"), Some("W2"));
        assert_eq!(pb.next_of("fork"), &["branch_a".to_string(), "branch_b".to_string()]);
        assert!(pb.next_of("join").is_empty());
        assert_eq!(pb.parents_of("join"), &["branch_a".to_string(), "branch_b".to_string()]);
        assert_eq!(pb.gating_predecessors("join"), vec!["branch_a", "branch_b"]);
        assert!(pb.gating_predecessors("fork").is_empty());
        assert_eq!(pb.node_count(), 4);
    }

    #[test]
    fn duplicate_node_across_worlds_conflicts() {
        let doc = json!({
            "version": "1",
            "worlds": [
                {"id": "W1", "nodes": [{"id": "n1"}]},
                {"id": "W2", "nodes": [{"id": "n1"}]}
            ]
        });
        assert!(matches!(
            build(doc).unwrap_err(),
            JourneyError::PlaybookConflict(_)
        ));
    }

    #[test]
    fn dangling_next_is_invalid() {
        let doc = json!({"version": "1", "worlds": [{"id": "W1", "nodes": [{"id": "n1", "next": ["ghost"]}]}]});
        assert!(matches!(
            build(doc).unwrap_err(),
            JourneyError::InvalidPlaybook(_)
        ));
    }

    #[test]
    fn cycle_is_invalid() {
        let doc = json!({"version": "1", "worlds": [{"id": "W1", "nodes": [
            {"id": "a", "next": ["b"]},
            {"id": "b", "next": ["a"]}
        ]}]});
        let err = build(doc).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn titles_fall_back_through_locales() {
        let pb = build(sample()).unwrap();
        assert_eq!(pb.node_title("fork", "ru").as_deref(), Some("Развилка"));
        assert_eq!(pb.node_title("fork", "kk").as_deref(), Some("Fork"));
        assert_eq!(pb.node_title("branch_a", "en"), None);
        assert_eq!(pb.resolve_locale(None), "en");
        assert_eq!(pb.resolve_locale(Some(" ")), "en");
        assert_eq!(pb.resolve_locale(Some("kk")), "kk");
    }

    #[test]
    fn missing_locale_default_falls_back_to_ru() {
        let doc = json!({"version": "1", "worlds": [{"id": "W1", "nodes": [{"id": "n"}]}]});
        assert_eq!(build(doc).unwrap().locale_default, FALLBACK_LOCALE);
    }
}
