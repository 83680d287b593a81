//! Core data model shared by the provider layer and the orchestrator.
//!
//! The types here are the vocabulary of the whole system: which provider a
//! request targets, which output format the caller wants, and what shape the
//! answer is expected to have. Everything is a tagged enum or a plain struct
//! with serde derives so records can be persisted as canonical strings or
//! JSON blobs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// The fixed set of conversational-AI providers the orchestrator can drive.
///
/// Each provider carries a reliability weight used in confidence scoring,
/// a default concurrency cap, and a default minimum inter-request interval.
/// All three are overridable through configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    /// Anthropic Claude
    Claude,
    /// Google Gemini
    Gemini,
    /// Perplexity
    Perplexity,
    /// Local LLM served over an Ollama-compatible API
    Local,
}

impl ProviderId {
    /// All known providers, in canonical order.
    pub const ALL: [ProviderId; 4] = [
        ProviderId::Claude,
        ProviderId::Gemini,
        ProviderId::Perplexity,
        ProviderId::Local,
    ];

    /// Canonical lowercase identifier, used for persistence and logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::Claude => "claude",
            ProviderId::Gemini => "gemini",
            ProviderId::Perplexity => "perplexity",
            ProviderId::Local => "local",
        }
    }

    /// Human-facing display name.
    pub fn display_name(&self) -> &'static str {
        match self {
            ProviderId::Claude => "Claude",
            ProviderId::Gemini => "Gemini",
            ProviderId::Perplexity => "Perplexity",
            ProviderId::Local => "Local LLM",
        }
    }

    /// Base reliability weight in [0, 1] used as the starting point for
    /// per-answer confidence scores.
    pub fn default_weight(&self) -> f64 {
        match self {
            ProviderId::Claude => 0.95,
            ProviderId::Gemini => 0.92,
            ProviderId::Perplexity => 0.90,
            ProviderId::Local => 0.80,
        }
    }

    /// Default cap on in-flight calls per provider.
    pub fn default_max_concurrent(&self) -> u32 {
        match self {
            ProviderId::Claude => 2,
            ProviderId::Gemini => 2,
            ProviderId::Perplexity => 1,
            ProviderId::Local => 3,
        }
    }

    /// Default minimum interval between consecutive calls. Web providers
    /// are paced; the local model is not.
    pub fn default_min_interval(&self) -> Duration {
        match self {
            ProviderId::Local => Duration::ZERO,
            _ => Duration::from_secs(5),
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude" => Ok(ProviderId::Claude),
            "gemini" => Ok(ProviderId::Gemini),
            "perplexity" => Ok(ProviderId::Perplexity),
            "local" => Ok(ProviderId::Local),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

/// Output formats the validator knows how to grade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Json,
    StructuredText,
    Markdown,
    Xml,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::StructuredText => "structured_text",
            OutputFormat::Markdown => "markdown",
            OutputFormat::Xml => "xml",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied hint describing the wanted shape of a provider answer.
///
/// `Structured` lists required top-level field names (with optional value
/// hints shown to the provider); `Freeform` is a text description plus
/// keywords the answer must contain. Validators specialize on the variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExpectedSchema {
    Structured {
        /// Required field name -> optional value hint (e.g. `"[]"` or `"0"`).
        fields: BTreeMap<String, Option<String>>,
    },
    Freeform {
        description: String,
        keywords: Vec<String>,
    },
}

impl ExpectedSchema {
    /// Build a structured schema from `(field, value hint)` pairs.
    pub fn structured<I, K, V>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, Option<V>)>,
        K: Into<String>,
        V: Into<String>,
    {
        ExpectedSchema::Structured {
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.map(Into::into)))
                .collect(),
        }
    }

    /// Build a freeform schema from a description and required keywords.
    pub fn freeform(description: impl Into<String>, keywords: Vec<String>) -> Self {
        ExpectedSchema::Freeform {
            description: description.into(),
            keywords,
        }
    }

    /// Required top-level keys (structured) or required keywords (freeform).
    pub fn required_terms(&self) -> Vec<&str> {
        match self {
            ExpectedSchema::Structured { fields } => {
                fields.keys().map(String::as_str).collect()
            }
            ExpectedSchema::Freeform { keywords, .. } => {
                keywords.iter().map(String::as_str).collect()
            }
        }
    }

    /// Render the schema the way a provider should see it for a given format.
    /// JSON uses literal braces, XML uses fenced tags, the text formats use
    /// labeled lines.
    pub fn render(&self, format: OutputFormat) -> String {
        match self {
            ExpectedSchema::Structured { fields } => match format {
                OutputFormat::Json => {
                    let body = fields
                        .iter()
                        .map(|(k, hint)| {
                            format!("\"{}\": {}", k, hint.as_deref().unwrap_or("\"...\""))
                        })
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!("{{{body}}}")
                }
                OutputFormat::Xml => {
                    let body = fields
                        .keys()
                        .map(|k| format!("  <{k}>...</{k}>"))
                        .collect::<Vec<_>>()
                        .join("\n");
                    format!("<response>\n{body}\n</response>")
                }
                OutputFormat::StructuredText | OutputFormat::Markdown => fields
                    .iter()
                    .map(|(k, hint)| format!("{}: {}", k, hint.as_deref().unwrap_or("...")))
                    .collect::<Vec<_>>()
                    .join("\n"),
            },
            ExpectedSchema::Freeform {
                description,
                keywords,
            } => {
                if keywords.is_empty() {
                    description.clone()
                } else {
                    format!("{} (must cover: {})", description, keywords.join(", "))
                }
            }
        }
    }
}

/// A single provider answer as returned by an adapter.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Raw text exactly as the provider produced it.
    pub text: String,
    /// Wall-clock latency of the call that produced the text.
    pub latency: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_id_round_trips_through_str() {
        for provider in ProviderId::ALL {
            assert_eq!(provider.as_str().parse::<ProviderId>(), Ok(provider));
        }
    }

    #[test]
    fn provider_defaults_are_in_range() {
        for provider in ProviderId::ALL {
            let weight = provider.default_weight();
            assert!((0.0..=1.0).contains(&weight));
            assert!(provider.default_max_concurrent() >= 1);
        }
    }

    #[test]
    fn structured_schema_renders_json_with_literal_braces() {
        let schema = ExpectedSchema::structured([("colors", Some("[]"))]);
        let rendered = schema.render(OutputFormat::Json);
        assert_eq!(rendered, "{\"colors\": []}");
    }

    #[test]
    fn structured_schema_renders_xml_tags() {
        let schema = ExpectedSchema::structured([("summary", None::<String>)]);
        let rendered = schema.render(OutputFormat::Xml);
        assert!(rendered.contains("<summary>...</summary>"));
    }

    #[test]
    fn freeform_schema_lists_keywords() {
        let schema = ExpectedSchema::freeform(
            "a short market outlook",
            vec!["prices".to_string(), "forecast".to_string()],
        );
        let rendered = schema.render(OutputFormat::Markdown);
        assert!(rendered.contains("prices"));
        assert!(rendered.contains("forecast"));
    }
}
