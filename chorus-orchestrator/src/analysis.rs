//! Per-answer analysis: classify the content, pull out key facts and
//! sources, and score confidence.
//!
//! Classification is an ordered rule cascade over the lowercased text;
//! key-fact extraction is delegated to the local LLM with a fixed prompt
//! and degrades to an empty list when the model is unreachable.

use chorus_providers::{GenerateRequest, LlmGenerator, ProviderId};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::records::{ResponseRecord, ResponseStatus};

const MAX_KEY_FACTS: usize = 10;

const HEDGING_INDICATORS: [&str; 5] =
    ["might be", "possibly", "perhaps", "unsure", "not certain"];

/// Coarse content classification of one answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Factual,
    Creative,
    Analytical,
    Technical,
    News,
    Data,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Factual => "factual",
            ContentType::Creative => "creative",
            ContentType::Analytical => "analytical",
            ContentType::Technical => "technical",
            ContentType::News => "news",
            ContentType::Data => "data",
        }
    }
}

/// One provider answer, analyzed and scored for synthesis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzedAnswer {
    pub provider: ProviderId,
    pub content: String,
    /// Seconds the provider call took, when known.
    pub response_time: f64,
    pub status: ResponseStatus,
    pub confidence: f64,
    pub content_type: ContentType,
    pub key_facts: Vec<String>,
    pub sources: Vec<String>,
}

/// Analyzes finished responses. Shared and immutable after construction.
pub struct ResponseAnalyzer {
    llm: Option<Arc<dyn LlmGenerator>>,
    weights: HashMap<ProviderId, f64>,
    url_pattern: Regex,
    numeric_pattern: Regex,
    citation_patterns: Vec<Regex>,
}

impl ResponseAnalyzer {
    pub fn new(llm: Option<Arc<dyn LlmGenerator>>, weights: HashMap<ProviderId, f64>) -> Self {
        let citation_patterns = vec![
            Regex::new(r"(?i)according to ([^,\n.]+)").expect("static pattern"),
            Regex::new(r"(?i)source:\s*([^,\n]+)").expect("static pattern"),
            Regex::new(r"(?i)from ([A-Z][^,\n]+)").expect("static pattern"),
            Regex::new(r"\[(\d+)\]").expect("static pattern"),
        ];
        Self {
            llm,
            weights,
            url_pattern: Regex::new(r"https?://[^\s)>\]]+").expect("static pattern"),
            numeric_pattern: Regex::new(r"\d+%|\$\d+|\d+\.\d+").expect("static pattern"),
            citation_patterns,
        }
    }

    /// Analyze one finished response.
    pub async fn analyze(&self, response: &ResponseRecord) -> AnalyzedAnswer {
        let content = response.raw_text.clone();
        let content_type = self.classify(&content);
        let key_facts = self.extract_key_facts(&content).await;
        let sources = self.extract_sources(&content);
        let response_time = response.response_time.unwrap_or(0.0);
        let confidence = self.confidence(response.provider, &content, response_time);

        AnalyzedAnswer {
            provider: response.provider,
            content,
            response_time,
            status: response.status,
            confidence,
            content_type,
            key_facts,
            sources,
        }
    }

    /// Ordered cascade: technical, news, data, creative, analytical, then
    /// factual as the default.
    pub fn classify(&self, content: &str) -> ContentType {
        let lower = content.to_lowercase();
        let has = |cues: &[&str]| cues.iter().any(|cue| lower.contains(cue));

        if has(&[
            "code",
            "function",
            "algorithm",
            "programming",
            "api",
            "data structure",
        ]) {
            ContentType::Technical
        } else if has(&[
            "reported",
            "according to",
            "sources say",
            "breaking",
            "announced",
        ]) {
            ContentType::News
        } else if lower.contains("statistics")
            || lower.contains("data shows")
            || lower.contains("research indicates")
            || self.numeric_pattern.is_match(&lower)
        {
            ContentType::Data
        } else if has(&["story", "imagine", "creative", "narrative", "character"]) {
            ContentType::Creative
        } else if has(&[
            "analysis",
            "compare",
            "evaluate",
            "pros and cons",
            "assessment",
        ]) {
            ContentType::Analytical
        } else {
            ContentType::Factual
        }
    }

    /// Ask the local model for key facts, one per line, capped at ten.
    /// Empty on any model failure.
    async fn extract_key_facts(&self, content: &str) -> Vec<String> {
        let Some(llm) = self.llm.as_ref() else {
            return Vec::new();
        };
        if content.trim().is_empty() {
            return Vec::new();
        }

        let excerpt: String = content.chars().take(1000).collect();
        let prompt = format!(
            "Extract the key facts from this text. Return them as a simple list, one fact per line.\n\n\
Text: {excerpt}\n\nKey facts:"
        );

        match llm
            .generate(
                GenerateRequest::new(prompt)
                    .with_max_tokens(300)
                    .with_temperature(0.2),
            )
            .await
        {
            Ok(generation) => generation
                .text
                .lines()
                .map(|line| line.trim().trim_start_matches(['-', '*', '•']).trim())
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .take(MAX_KEY_FACTS)
                .map(str::to_string)
                .collect(),
            Err(err) => {
                tracing::warn!("key fact extraction failed: {err}");
                Vec::new()
            }
        }
    }

    /// URLs plus citation phrases plus bracketed numerics, deduplicated.
    pub fn extract_sources(&self, content: &str) -> Vec<String> {
        let mut sources: Vec<String> = Vec::new();
        let mut push_unique = |source: String| {
            let trimmed = source.trim().to_string();
            if !trimmed.is_empty() && !sources.contains(&trimmed) {
                sources.push(trimmed);
            }
        };

        for m in self.url_pattern.find_iter(content) {
            push_unique(m.as_str().to_string());
        }
        for pattern in &self.citation_patterns {
            for captures in pattern.captures_iter(content) {
                if let Some(group) = captures.get(1) {
                    push_unique(group.as_str().to_string());
                }
            }
        }
        sources
    }

    /// Reliability weight adjusted by length, latency and hedging, clamped
    /// to [0, 1].
    pub fn confidence(&self, provider: ProviderId, content: &str, response_time: f64) -> f64 {
        let mut confidence = self
            .weights
            .get(&provider)
            .copied()
            .unwrap_or_else(|| provider.default_weight());

        let length = content.chars().count();
        if length < 50 {
            confidence *= 0.7;
        } else if length > 500 {
            confidence *= 1.1;
        }

        if response_time > 0.0 {
            if response_time < 2.0 {
                confidence *= 1.05;
            } else if response_time > 30.0 {
                confidence *= 0.9;
            }
        }

        let lower = content.to_lowercase();
        if HEDGING_INDICATORS.iter().any(|h| lower.contains(h)) {
            confidence *= 0.8;
        }

        confidence.clamp(0.0, 1.0)
    }
}
