//! Output validation: parse a raw provider answer and grade it against the
//! expected schema and format.
//!
//! Quality is a weighted combination of format compliance (0.30), structure
//! compliance (0.30), completeness (0.20) and an accuracy heuristic (0.20).
//! Every defect is emitted as an issue tagged with a refinement trigger so
//! the controller can route it to a rule.

use chorus_providers::{ExpectedSchema, OutputFormat};
use serde::{Deserialize, Serialize};

use crate::refinement::RefinementTrigger;

const FORMAT_WEIGHT: f64 = 0.30;
const STRUCTURE_WEIGHT: f64 = 0.30;
const COMPLETENESS_WEIGHT: f64 = 0.20;
const ACCURACY_WEIGHT: f64 = 0.20;

const HEDGING_PHRASES: [&str; 6] = [
    "maybe",
    "perhaps",
    "might be",
    "could be",
    "not sure",
    "possibly",
];
const ASSERTIVE_WORDS: [&str; 5] = ["is", "are", "will", "must", "definitely"];

/// A single validation defect, routed by its trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub trigger: RefinementTrigger,
    pub detail: String,
}

impl Issue {
    fn new(trigger: RefinementTrigger, detail: impl Into<String>) -> Self {
        Self {
            trigger,
            detail: detail.into(),
        }
    }
}

/// Everything the validator learned about one raw answer.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    /// Parsed JSON value, when one could be recovered from the text.
    pub parsed_value: Option<serde_json::Value>,
    pub quality_score: f64,
    pub format_compliance: f64,
    pub structure_compliance: f64,
    pub completeness: f64,
    pub accuracy: f64,
    pub issues: Vec<Issue>,
}

/// Grades raw provider output. Stateless and deterministic.
#[derive(Debug, Default, Clone, Copy)]
pub struct OutputValidator;

impl OutputValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(
        &self,
        raw: &str,
        schema: &ExpectedSchema,
        format: OutputFormat,
    ) -> ValidationReport {
        let mut issues = Vec::new();

        let (format_compliance, parsed_value) = self.check_format(raw, format);
        if format_compliance < 0.5 {
            let detail = match format {
                OutputFormat::Json => "response is not valid JSON format".to_string(),
                other => format!("response doesn't match {other} format"),
            };
            issues.push(Issue::new(RefinementTrigger::FormatMismatch, detail));
        }

        let structure_compliance = self.check_structure(raw, parsed_value.as_ref(), schema);
        if structure_compliance < 0.5 {
            let missing = self.missing_terms(raw, parsed_value.as_ref(), schema);
            let detail = if missing.is_empty() {
                "response missing required structure elements".to_string()
            } else {
                format!(
                    "response missing required structure elements: {}",
                    missing.join(", ")
                )
            };
            issues.push(Issue::new(RefinementTrigger::MissingFields, detail));
        }

        // A structured schema expects an object at the top level; anything
        // else that parsed is a structure error, not a missing field.
        if let (ExpectedSchema::Structured { .. }, Some(value)) = (schema, parsed_value.as_ref()) {
            if !value.is_object() {
                issues.push(Issue::new(
                    RefinementTrigger::StructureError,
                    "parsed value is not an object at the top level",
                ));
            } else {
                for field in self.empty_fields(value, schema) {
                    issues.push(Issue::new(
                        RefinementTrigger::InvalidData,
                        format!("field '{field}' is present but empty"),
                    ));
                }
            }
        }

        let completeness = self.check_completeness(raw);
        if completeness < 0.5 {
            issues.push(Issue::new(
                RefinementTrigger::IncompleteResponse,
                "response appears incomplete or too brief",
            ));
        }

        let accuracy = self.check_accuracy(raw);
        if accuracy < 0.5 {
            issues.push(Issue::new(
                RefinementTrigger::ContentMismatch,
                "response content may be inaccurate or irrelevant",
            ));
        }

        let quality_score = (format_compliance * FORMAT_WEIGHT
            + structure_compliance * STRUCTURE_WEIGHT
            + completeness * COMPLETENESS_WEIGHT
            + accuracy * ACCURACY_WEIGHT)
            .clamp(0.0, 1.0);

        ValidationReport {
            parsed_value,
            quality_score,
            format_compliance,
            structure_compliance,
            completeness,
            accuracy,
            issues,
        }
    }

    /// Format compliance plus whatever value could be parsed out of the text.
    ///
    /// JSON gets full credit only for a strict parse of the whole (trimmed)
    /// text; an embedded object earns fractional credit but is still parsed
    /// so downstream consumers see the value.
    fn check_format(&self, raw: &str, format: OutputFormat) -> (f64, Option<serde_json::Value>) {
        match format {
            OutputFormat::Json => {
                let trimmed = raw.trim();
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
                    return (1.0, Some(value));
                }
                if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
                    if start < end {
                        let embedded = &trimmed[start..=end];
                        let value = serde_json::from_str::<serde_json::Value>(embedded).ok();
                        return (0.3, value);
                    }
                }
                (0.0, None)
            }
            OutputFormat::StructuredText => {
                let score = if raw.contains(':') && raw.contains('\n') {
                    0.8
                } else if raw.contains(':') {
                    0.5
                } else {
                    0.2
                };
                (score, None)
            }
            OutputFormat::Markdown => {
                let indicators = ["#", "**", "*", "- ", "```"];
                let found = indicators.iter().filter(|i| raw.contains(**i)).count();
                ((found as f64 * 0.2).min(1.0), None)
            }
            OutputFormat::Xml => {
                let trimmed = raw.trim();
                let score = if trimmed.starts_with('<') && trimmed.ends_with('>') {
                    1.0
                } else if raw.contains('<') && raw.contains('>') {
                    0.4
                } else {
                    0.0
                };
                (score, None)
            }
        }
    }

    fn check_structure(
        &self,
        raw: &str,
        parsed: Option<&serde_json::Value>,
        schema: &ExpectedSchema,
    ) -> f64 {
        let terms = schema.required_terms();
        if terms.is_empty() {
            return 0.5;
        }

        let found = match (schema, parsed) {
            (ExpectedSchema::Structured { .. }, Some(serde_json::Value::Object(map))) => terms
                .iter()
                .filter(|term| map.contains_key(**term))
                .count(),
            _ => {
                let lower = raw.to_lowercase();
                terms
                    .iter()
                    .filter(|term| lower.contains(&term.to_lowercase()))
                    .count()
            }
        };

        found as f64 / terms.len() as f64
    }

    fn missing_terms(
        &self,
        raw: &str,
        parsed: Option<&serde_json::Value>,
        schema: &ExpectedSchema,
    ) -> Vec<String> {
        let lower = raw.to_lowercase();
        schema
            .required_terms()
            .iter()
            .filter(|term| {
                match (schema, parsed) {
                    (ExpectedSchema::Structured { .. }, Some(serde_json::Value::Object(map))) => {
                        !map.contains_key(**term)
                    }
                    _ => !lower.contains(&term.to_lowercase()),
                }
            })
            .map(|term| term.to_string())
            .collect()
    }

    fn empty_fields(&self, value: &serde_json::Value, schema: &ExpectedSchema) -> Vec<String> {
        let serde_json::Value::Object(map) = value else {
            return Vec::new();
        };
        schema
            .required_terms()
            .iter()
            .filter(|term| match map.get(**term) {
                Some(serde_json::Value::Null) => true,
                Some(serde_json::Value::String(s)) => s.is_empty(),
                _ => false,
            })
            .map(|term| term.to_string())
            .collect()
    }

    /// Piecewise-linear length heuristic saturating at 200 characters.
    fn check_completeness(&self, raw: &str) -> f64 {
        let len = raw.chars().count();
        if len < 20 {
            0.1
        } else if len < 50 {
            0.4
        } else if len > 200 {
            1.0
        } else {
            len as f64 / 200.0
        }
    }

    /// Penalise hedging vocabulary, reward assertive language.
    fn check_accuracy(&self, raw: &str) -> f64 {
        let lower = raw.to_lowercase();
        let hedging = HEDGING_PHRASES
            .iter()
            .filter(|phrase| lower.contains(**phrase))
            .count();
        let assertive = lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|word| ASSERTIVE_WORDS.contains(word))
            .count();

        if hedging > assertive {
            0.3
        } else if assertive > 0 {
            0.8
        } else {
            0.5
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_providers::ExpectedSchema;

    fn colors_schema() -> ExpectedSchema {
        ExpectedSchema::structured([("colors", Some("[]"))])
    }

    #[test]
    fn strict_json_parses_with_full_format_credit() {
        let validator = OutputValidator::new();
        let report = validator.validate(
            r#"{"colors": ["red", "green", "blue"]}"#,
            &colors_schema(),
            OutputFormat::Json,
        );
        assert_eq!(report.format_compliance, 1.0);
        assert_eq!(report.structure_compliance, 1.0);
        assert!(report.parsed_value.is_some());
        assert!(report
            .issues
            .iter()
            .all(|i| i.trigger != RefinementTrigger::FormatMismatch));
    }

    #[test]
    fn embedded_json_gets_fractional_credit_and_a_format_issue() {
        let validator = OutputValidator::new();
        let report = validator.validate(
            r#"Here you go: { "colors": ["red","green","blue"] }"#,
            &colors_schema(),
            OutputFormat::Json,
        );
        assert_eq!(report.format_compliance, 0.3);
        assert!(report.parsed_value.is_some());
        assert!(report
            .issues
            .iter()
            .any(|i| i.trigger == RefinementTrigger::FormatMismatch));
    }

    #[test]
    fn missing_fields_are_named_in_the_issue() {
        let validator = OutputValidator::new();
        let report = validator.validate(
            r#"{"shades": ["crimson"]}"#,
            &colors_schema(),
            OutputFormat::Json,
        );
        assert_eq!(report.structure_compliance, 0.0);
        let issue = report
            .issues
            .iter()
            .find(|i| i.trigger == RefinementTrigger::MissingFields)
            .expect("missing-fields issue");
        assert!(issue.detail.contains("colors"));
    }

    #[test]
    fn non_object_top_level_is_a_structure_error() {
        let validator = OutputValidator::new();
        let report = validator.validate(r#"["red", "green"]"#, &colors_schema(), OutputFormat::Json);
        assert!(report
            .issues
            .iter()
            .any(|i| i.trigger == RefinementTrigger::StructureError));
    }

    #[test]
    fn null_required_field_is_invalid_data() {
        let validator = OutputValidator::new();
        let report =
            validator.validate(r#"{"colors": null}"#, &colors_schema(), OutputFormat::Json);
        assert!(report
            .issues
            .iter()
            .any(|i| i.trigger == RefinementTrigger::InvalidData));
    }

    #[test]
    fn short_answers_are_incomplete() {
        let validator = OutputValidator::new();
        let report = validator.validate(
            "red",
            &ExpectedSchema::freeform("colors", vec!["red".into()]),
            OutputFormat::StructuredText,
        );
        assert_eq!(report.completeness, 0.1);
        assert!(report
            .issues
            .iter()
            .any(|i| i.trigger == RefinementTrigger::IncompleteResponse));
    }

    #[test]
    fn hedging_lowers_accuracy() {
        let validator = OutputValidator::new();
        let hedged = "It might be the case, perhaps, that the answer could be unclear; not sure.";
        let report = validator.validate(
            hedged,
            &ExpectedSchema::freeform("anything", vec![]),
            OutputFormat::Markdown,
        );
        assert_eq!(report.accuracy, 0.3);
        assert!(report
            .issues
            .iter()
            .any(|i| i.trigger == RefinementTrigger::ContentMismatch));
    }

    #[test]
    fn freeform_keywords_drive_structure_score() {
        let validator = OutputValidator::new();
        let schema =
            ExpectedSchema::freeform("outlook", vec!["prices".into(), "forecast".into()]);
        let report = validator.validate(
            "Prices: flat. No other commentary.",
            &schema,
            OutputFormat::StructuredText,
        );
        assert_eq!(report.structure_compliance, 0.5);
    }

    #[test]
    fn quality_stays_in_unit_interval() {
        let validator = OutputValidator::new();
        let long_answer = format!(
            "{{\"colors\": [\"red\", \"green\", \"blue\"], \"note\": \"{}\"}}",
            "these are definitely the primary colors. ".repeat(10)
        );
        let report = validator.validate(&long_answer, &colors_schema(), OutputFormat::Json);
        assert!(report.quality_score <= 1.0);
        assert!(report.quality_score >= 0.9);
    }

    #[test]
    fn parsed_value_round_trips_with_full_format_credit() {
        let validator = OutputValidator::new();
        let report = validator.validate(
            r#"noise before { "colors": ["red","green","blue"] } noise after"#,
            &colors_schema(),
            OutputFormat::Json,
        );
        let parsed = report.parsed_value.expect("embedded value parsed");

        let reserialized = serde_json::to_string(&parsed).unwrap();
        let second = validator.validate(&reserialized, &colors_schema(), OutputFormat::Json);
        assert_eq!(second.format_compliance, 1.0);
    }
}
