//! Publications list ("Appendix 7").
//!
//! Four sections of entries: indexed journal articles (`wos_scopus`),
//! articles in journals recommended by the national committee (`kokson`),
//! conference papers and intellectual property. Older clients send the
//! sections flat at the top level, or only per-section counts; both are
//! folded into the normalized shape:
//!
//! ```text
//! { "sections": { "wos_scopus": [..], "kokson": [..], "conferences": [..], "ip": [..] },
//!   "legacy_counts": { "wos_scopus": 3, .. } }      // only when counts were sent
//! ```

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{json, Map, Value};

use super::{parse_object, FormValidator, ValidationIssue, ValidationResult};

pub const KEY: &str = "app7";

pub const SECTIONS: [&str; 4] = ["wos_scopus", "kokson", "conferences", "ip"];

const MAX_TITLE_CHARS: usize = 1000;

const TEXT_FIELDS: [&str; 16] = [
    "title",
    "format",
    "format_other",
    "journal",
    "year",
    "volume_issue",
    "pages_or_sheets",
    "doi",
    "issn",
    "issn_print",
    "issn_online",
    "indexing",
    "indexing_other",
    "ip_type",
    "ip_type_other",
    "certificate_no",
];

// Fields carried in addition to TEXT_FIELDS.
const ISBN_FIELD: &str = "isbn";

static DOI_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^10\.[0-9]{4,9}/[-._;()/:A-Z0-9]+$").unwrap());

static ISSN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]{4}-[0-9]{3}[0-9Xx]$").unwrap());

static YEAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(18|19|20)\d{2}([/\\-](18|19|20)\d{2})?$").unwrap());

#[derive(Debug, Clone, Copy, Default)]
pub struct App7Validator;

impl FormValidator for App7Validator {
    fn key(&self) -> &'static str {
        KEY
    }

    fn validate(&self, raw: &[u8]) -> ValidationResult {
        let mut input = match parse_object(raw) {
            Ok(map) => map,
            Err(issue) => return ValidationResult::Err(vec![issue]),
        };

        let mut issues = Vec::new();
        let sections_in = match input.remove("sections") {
            Some(Value::Object(map)) => map,
            Some(Value::Null) | None => Map::new(),
            Some(_) => {
                return ValidationResult::Err(vec![ValidationIssue::new(
                    "sections",
                    "must be an object",
                )])
            }
        };

        let mut sections = Map::new();
        let mut counts = Map::new();
        for section in SECTIONS {
            // Nested form wins; flat top-level arrays are the legacy shape.
            let raw_entries = sections_in
                .get(section)
                .or_else(|| input.get(section))
                .cloned()
                .unwrap_or(Value::Null);
            let entries = match raw_entries {
                Value::Array(items) => items,
                Value::Null => Vec::new(),
                _ => {
                    issues.push(ValidationIssue::new(
                        format!("sections.{section}"),
                        "must be an array",
                    ));
                    Vec::new()
                }
            };

            let mut normalized = Vec::with_capacity(entries.len());
            for (idx, entry) in entries.into_iter().enumerate() {
                let path = format!("sections.{section}[{}]", idx + 1);
                match entry {
                    Value::Object(obj) => {
                        let (clean, mut entry_issues) = normalize_entry(section, &path, obj);
                        issues.append(&mut entry_issues);
                        normalized.push(Value::Object(clean));
                    }
                    _ => issues.push(ValidationIssue::new(path, "entry must be an object")),
                }
            }
            sections.insert(section.to_string(), Value::Array(normalized));

            if let Some(n) = legacy_count(&input, section) {
                counts.insert(section.to_string(), json!(n));
            }
        }

        if !issues.is_empty() {
            return ValidationResult::Err(issues);
        }

        let summary = summarize(&sections);
        let mut out = Map::new();
        out.insert("sections".into(), Value::Object(sections));
        if !counts.is_empty() {
            out.insert("legacy_counts".into(), Value::Object(counts));
        }
        ValidationResult::Ok {
            normalized: Value::Object(out),
            summary,
        }
    }
}

/// Per-section count from either `legacy_counts.{section}` or the older
/// `count_{section}` top-level key.
fn legacy_count(input: &Map<String, Value>, section: &str) -> Option<u64> {
    input
        .get("legacy_counts")
        .and_then(|c| c.get(section))
        .or_else(|| input.get(&format!("count_{section}")))
        .and_then(|v| match v {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
}

fn trimmed(v: Option<&Value>) -> Option<String> {
    match v? {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn normalize_entry(
    section: &str,
    path: &str,
    obj: Map<String, Value>,
) -> (Map<String, Value>, Vec<ValidationIssue>) {
    let mut clean = Map::new();
    let mut issues = Vec::new();

    for field in TEXT_FIELDS.iter().chain(std::iter::once(&ISBN_FIELD)) {
        if let Some(mut s) = trimmed(obj.get(*field)) {
            if field.starts_with("issn") {
                s = s.to_ascii_uppercase();
            }
            clean.insert(field.to_string(), Value::String(s));
        }
    }

    if let Some(Value::Array(items)) = obj.get("coauthors") {
        let names: Vec<Value> = items
            .iter()
            .filter_map(|v| trimmed(Some(v)))
            .map(Value::String)
            .collect();
        if !names.is_empty() {
            clean.insert("coauthors".into(), Value::Array(names));
        }
    }

    let text = |k: &str| clean.get(k).and_then(Value::as_str);

    match text("title") {
        None => issues.push(ValidationIssue::new(path, "title is required")),
        Some(t) if t.chars().count() > MAX_TITLE_CHARS => issues.push(ValidationIssue::new(
            path,
            format!("title exceeds {MAX_TITLE_CHARS} characters"),
        )),
        Some(_) => {}
    }
    if let Some(y) = text("year") {
        if !YEAR_RE.is_match(y) {
            issues.push(ValidationIssue::new(
                path,
                "year must be in format YYYY or YYYY/YYYY",
            ));
        }
    }
    if let Some(d) = text("doi") {
        if !DOI_RE.is_match(d) {
            issues.push(ValidationIssue::new(path, "invalid DOI"));
        }
    }
    for (field, label) in [
        ("issn", "invalid ISSN"),
        ("issn_print", "invalid ISSN print"),
        ("issn_online", "invalid ISSN online"),
    ] {
        if let Some(v) = text(field) {
            if !ISSN_RE.is_match(v) {
                issues.push(ValidationIssue::new(path, label));
            }
        }
    }
    if section == "ip" && text("ip_type").is_none() && text("ip_type_other").is_none() {
        issues.push(ValidationIssue::new(
            path,
            "type is required for intellectual property entries",
        ));
    }

    (clean, issues)
}

fn summarize(sections: &Map<String, Value>) -> Value {
    let mut summary = Map::new();
    let mut total = 0;
    for section in SECTIONS {
        let n = sections
            .get(section)
            .and_then(Value::as_array)
            .map_or(0, Vec::len);
        total += n;
        summary.insert(section.to_string(), json!(n));
    }
    summary.insert("total".into(), json!(total));
    Value::Object(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(v: Value) -> ValidationResult {
        App7Validator.validate(&serde_json::to_vec(&v).unwrap())
    }

    fn issues(v: Value) -> Vec<String> {
        match run(v) {
            ValidationResult::Err(issues) => {
                let mut out: Vec<String> = issues.iter().map(|i| i.to_string()).collect();
                out.sort();
                out
            }
            ValidationResult::Ok { .. } => panic!("expected issues"),
        }
    }

    fn ok(v: Value) -> (Value, Value) {
        match run(v) {
            ValidationResult::Ok {
                normalized,
                summary,
            } => (normalized, summary),
            ValidationResult::Err(issues) => panic!("unexpected issues: {issues:?}"),
        }
    }

    #[test]
    fn reports_every_issue_per_entry() {
        let got = issues(json!({"sections": {"wos_scopus": [
            {"title": "", "year": "abc"},
            {"doi": "not-a-doi"}
        ]}}));
        assert_eq!(
            got,
            vec![
                "sections.wos_scopus[1]: title is required",
                "sections.wos_scopus[1]: year must be in format YYYY or YYYY/YYYY",
                "sections.wos_scopus[2]: invalid DOI",
                "sections.wos_scopus[2]: title is required",
            ]
        );
    }

    #[test]
    fn accepts_valid_entries_and_trims() {
        let (normalized, summary) = ok(json!({"sections": {
            "wos_scopus": [{
                "title": "  Deep results ",
                "year": "2021/2022",
                "doi": "10.1016/J.CELL.2020.01.001",
                "issn_print": "1234-567x",
                "coauthors": [" A. Author ", "", "  "]
            }],
            "ip": [{"title": "Patent", "ip_type": "patent"}]
        }}));
        let entry = &normalized["sections"]["wos_scopus"][0];
        assert_eq!(entry["title"], "Deep results");
        assert_eq!(entry["issn_print"], "1234-567X");
        assert_eq!(entry["coauthors"], json!(["A. Author"]));
        assert_eq!(summary["wos_scopus"], 1);
        assert_eq!(summary["ip"], 1);
        assert_eq!(summary["total"], 2);
        assert_eq!(normalized["sections"]["kokson"], json!([]));
    }

    #[test]
    fn ip_entries_need_a_type() {
        let got = issues(json!({"sections": {"ip": [{"title": "Invention"}]}}));
        assert_eq!(
            got,
            vec!["sections.ip[1]: type is required for intellectual property entries"]
        );
        ok(json!({"sections": {"ip": [{"title": "Invention", "ip_type_other": "utility model"}]}}));
    }

    #[test]
    fn title_length_limit() {
        let got = issues(json!({"sections": {"kokson": [{"title": "x".repeat(1001)}]}}));
        assert_eq!(got, vec!["sections.kokson[1]: title exceeds 1000 characters"]);
        ok(json!({"sections": {"kokson": [{"title": "x".repeat(1000)}]}}));
    }

    #[test]
    fn issn_variants() {
        let got = issues(json!({"sections": {"conferences": [{
            "title": "t", "issn": "12345678", "issn_online": "1234-56789"
        }]}}));
        assert_eq!(
            got,
            vec![
                "sections.conferences[1]: invalid ISSN",
                "sections.conferences[1]: invalid ISSN online",
            ]
        );
    }

    #[test]
    fn flat_sections_and_legacy_counts_are_folded() {
        let (normalized, _) = ok(json!({
            "wos_scopus": [{"title": "Flat"}],
            "count_kokson": "2",
            "legacy_counts": {"ip": 1}
        }));
        assert_eq!(normalized["sections"]["wos_scopus"][0]["title"], "Flat");
        assert_eq!(normalized["legacy_counts"], json!({"kokson": 2, "ip": 1}));
    }

    #[test]
    fn validation_is_idempotent() {
        let (first, s1) = ok(json!({
            "wos_scopus": [{"title": " A ", "year": 2020, "coauthors": ["x", " "]}],
            "count_ip": 3
        }));
        let (second, s2) = ok(first.clone());
        assert_eq!(first, second);
        assert_eq!(s1, s2);
    }

    #[test]
    fn non_array_section_is_reported() {
        let got = issues(json!({"sections": {"ip": "nope"}}));
        assert_eq!(got, vec!["sections.ip: must be an array"]);
    }
}
