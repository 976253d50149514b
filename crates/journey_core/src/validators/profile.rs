//! Student profile form.

use serde_json::{json, Map, Value};

use super::{parse_object, FormValidator, ValidationIssue, ValidationResult};

pub const KEY: &str = "profile";

/// Years after graduation beyond which a research plan is required.
pub const RP_THRESHOLD_YEARS: f64 = 3.0;

#[derive(Debug, Clone)]
pub struct ProfileValidator {
    /// `(field, max chars)` limits.
    pub limits: Vec<(&'static str, usize)>,
}

impl Default for ProfileValidator {
    fn default() -> Self {
        Self {
            limits: vec![("phone", 32), ("cohort", 64), ("program", 128)],
        }
    }
}

impl FormValidator for ProfileValidator {
    fn key(&self) -> &'static str {
        KEY
    }

    fn validate(&self, raw: &[u8]) -> ValidationResult {
        let input = match parse_object(raw) {
            Ok(map) => map,
            Err(issue) => return ValidationResult::Err(vec![issue]),
        };

        let mut issues = Vec::new();
        let mut out = Map::with_capacity(input.len() + 1);
        for (k, v) in input {
            out.insert(k, coerce_blank(v));
        }

        for (field, max) in &self.limits {
            if let Some(Value::String(s)) = out.get(*field) {
                if s.chars().count() > *max {
                    issues.push(ValidationIssue::new(
                        *field,
                        format!("{field} exceeds {max} characters"),
                    ));
                }
            }
        }

        let years = match out.get("years_since_graduation") {
            None | Some(Value::Null) => None,
            Some(v) => match as_years(v) {
                Some(y) => {
                    out.insert("years_since_graduation".into(), number(y));
                    Some(y)
                }
                None => {
                    issues.push(ValidationIssue::new(
                        "years_since_graduation",
                        "must be a non-negative number",
                    ));
                    None
                }
            },
        };

        if !issues.is_empty() {
            return ValidationResult::Err(issues);
        }

        let rp_required = years.is_some_and(|y| y > RP_THRESHOLD_YEARS);
        out.insert("rp_required".into(), Value::Bool(rp_required));

        ValidationResult::Ok {
            normalized: Value::Object(out),
            summary: json!({ "rp_required": rp_required }),
        }
    }
}

/// Trim strings; blank strings become null.
fn coerce_blank(v: Value) -> Value {
    match v {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                Value::Null
            } else {
                Value::String(trimmed.to_string())
            }
        }
        other => other,
    }
}

fn as_years(v: &Value) -> Option<f64> {
    let y = match v {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    (y.is_finite() && y >= 0.0).then_some(y)
}

// Whole years stay integers so the normalized form round-trips unchanged.
fn number(y: f64) -> Value {
    if y.fract() == 0.0 && y <= i64::MAX as f64 {
        json!(y as i64)
    } else {
        json!(y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(v: Value) -> ValidationResult {
        ProfileValidator::default().validate(&serde_json::to_vec(&v).unwrap())
    }

    fn ok(v: Value) -> Value {
        match run(v) {
            ValidationResult::Ok { normalized, .. } => normalized,
            ValidationResult::Err(issues) => panic!("unexpected issues: {issues:?}"),
        }
    }

    #[test]
    fn blank_strings_become_null() {
        let out = ok(json!({"phone": "  ", "program": " PhD "}));
        assert_eq!(out["phone"], Value::Null);
        assert_eq!(out["program"], "PhD");
    }

    #[test]
    fn rp_required_is_strictly_greater_than_three() {
        assert_eq!(ok(json!({"years_since_graduation": 3}))["rp_required"], false);
        assert_eq!(ok(json!({"years_since_graduation": 4}))["rp_required"], true);
        assert_eq!(ok(json!({"years_since_graduation": "3.5"}))["rp_required"], true);
        assert_eq!(ok(json!({}))["rp_required"], false);
    }

    #[test]
    fn numeric_strings_are_normalized_to_numbers() {
        let out = ok(json!({"years_since_graduation": " 5 "}));
        assert_eq!(out["years_since_graduation"], 5);
    }

    #[test]
    fn length_limits_are_enforced() {
        let long = "9".repeat(33);
        match run(json!({"phone": long, "cohort": "c".repeat(65)})) {
            ValidationResult::Err(issues) => {
                let msgs: Vec<String> = issues.iter().map(|i| i.to_string()).collect();
                assert!(msgs.contains(&"phone: phone exceeds 32 characters".to_string()));
                assert!(msgs.contains(&"cohort: cohort exceeds 64 characters".to_string()));
            }
            other => panic!("expected issues, got {other:?}"),
        }
    }

    #[test]
    fn negative_years_rejected() {
        assert!(!run(json!({"years_since_graduation": -1})).is_ok());
        assert!(!run(json!({"years_since_graduation": "soon"})).is_ok());
    }

    #[test]
    fn validation_is_idempotent() {
        let first = ok(json!({
            "phone": " +7 700 000 00 00 ",
            "cohort": "",
            "years_since_graduation": "4",
            "rp_required": false
        }));
        let second = ok(first.clone());
        assert_eq!(first, second);
        assert_eq!(second["rp_required"], true);
    }

    #[test]
    fn non_object_rejected() {
        assert!(!run(json!([1, 2, 3])).is_ok());
    }
}
