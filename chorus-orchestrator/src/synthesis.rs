//! Response synthesis: fuse the surviving per-provider answers into one
//! coherent reply.
//!
//! A strategy is picked by a first-match cascade, the local LLM does the
//! actual fusing, and every strategy has a deterministic fallback
//! (labeled-block concatenation) so synthesis never fails outright.
//! Contradiction detection is a keyword-pair heuristic, kept deliberately
//! small; a stronger checker can replace `detect_contradictions` without
//! touching the contract.

use chorus_providers::{GenerateRequest, LlmGenerator, ProviderId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use crate::analysis::AnalyzedAnswer;
use crate::records::ResponseStatus;

/// Opposing keyword pairs used for conflict detection.
const OPPOSING_PAIRS: [(&str, &str); 7] = [
    ("increase", "decrease"),
    ("rise", "fall"),
    ("up", "down"),
    ("more", "less"),
    ("higher", "lower"),
    ("true", "false"),
    ("yes", "no"),
];

const COMPARATIVE_CUES: [&str; 5] = ["compare", "vs", "versus", "difference", "better"];

/// How the surviving answers get fused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisStrategy {
    Merge,
    Compare,
    Prioritize,
    Complement,
    FactCheck,
}

impl SynthesisStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SynthesisStrategy::Merge => "merge",
            SynthesisStrategy::Compare => "compare",
            SynthesisStrategy::Prioritize => "prioritize",
            SynthesisStrategy::Complement => "complement",
            SynthesisStrategy::FactCheck => "fact_check",
        }
    }
}

/// A detected disagreement between two providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contradiction {
    pub provider_a: ProviderId,
    pub provider_b: ProviderId,
    pub excerpt_a: String,
    pub excerpt_b: String,
    /// "content_contradiction" or "fact_conflict".
    pub kind: String,
}

/// Key facts from different providers that match opposing patterns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactConflict {
    pub fact_a: String,
    pub provider_a: ProviderId,
    pub fact_b: String,
    pub provider_b: ProviderId,
}

/// Cross-provider fact-check summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactCheckReport {
    pub total_facts: usize,
    pub conflicts: Vec<FactConflict>,
    pub conflict_ratio: f64,
}

/// The fused reply plus everything learned while fusing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisResult {
    pub synthesized_text: String,
    pub strategy: SynthesisStrategy,
    /// Provider -> normalized contribution share; sums to 1 when at least
    /// one provider succeeded, empty otherwise.
    pub contributions: BTreeMap<ProviderId, f64>,
    pub overall_confidence: f64,
    pub contradictions: Vec<Contradiction>,
    pub unique_insights: BTreeMap<ProviderId, Vec<String>>,
    pub sources: Vec<String>,
    pub fact_check: Option<FactCheckReport>,
    /// Seconds spent synthesizing.
    pub processing_time: f64,
}

/// Fuses analyzed answers. Holds the shared local-LLM handle.
pub struct Synthesizer {
    llm: Option<Arc<dyn LlmGenerator>>,
    fallback_only: bool,
}

impl Synthesizer {
    pub fn new(llm: Option<Arc<dyn LlmGenerator>>, fallback_only: bool) -> Self {
        Self { llm, fallback_only }
    }

    /// Fuse the answers for `query`, optionally forcing a strategy.
    pub async fn synthesize(
        &self,
        answers: &[AnalyzedAnswer],
        query: &str,
        strategy_override: Option<SynthesisStrategy>,
    ) -> SynthesisResult {
        let started = Instant::now();
        let survivors: Vec<&AnalyzedAnswer> = answers
            .iter()
            .filter(|a| a.status == ResponseStatus::Completed && !a.content.trim().is_empty())
            .collect();

        if survivors.is_empty() {
            return SynthesisResult {
                synthesized_text: "No successful responses received from services.".to_string(),
                strategy: SynthesisStrategy::Merge,
                contributions: BTreeMap::new(),
                overall_confidence: 0.0,
                contradictions: Vec::new(),
                unique_insights: BTreeMap::new(),
                sources: Vec::new(),
                fact_check: None,
                processing_time: started.elapsed().as_secs_f64(),
            };
        }

        let strategy =
            strategy_override.unwrap_or_else(|| self.pick_strategy(&survivors, query));
        let synthesized_text = self.fuse(&survivors, query, strategy).await;

        let contradictions = self.detect_contradictions(&survivors);
        let fact_check = self.fact_check(&survivors);
        let contributions = contributions(&survivors);
        let overall_confidence = overall_confidence(&survivors, contradictions.len());
        let unique_insights = self.unique_insights(&survivors).await;
        let sources = collect_sources(&survivors);

        SynthesisResult {
            synthesized_text,
            strategy,
            contributions,
            overall_confidence,
            contradictions,
            unique_insights,
            sources,
            fact_check: Some(fact_check),
            processing_time: started.elapsed().as_secs_f64(),
        }
    }

    /// First match wins: single answer, conflicts, complementary types,
    /// comparative query, three-plus providers, then prioritize.
    fn pick_strategy(&self, answers: &[&AnalyzedAnswer], query: &str) -> SynthesisStrategy {
        if answers.len() == 1 {
            return SynthesisStrategy::Merge;
        }
        if !self.detect_contradictions(answers).is_empty() {
            return SynthesisStrategy::FactCheck;
        }
        let distinct_types = answers
            .iter()
            .map(|a| a.content_type)
            .collect::<std::collections::HashSet<_>>()
            .len();
        if distinct_types > 1 {
            return SynthesisStrategy::Complement;
        }
        let query_lower = query.to_lowercase();
        if COMPARATIVE_CUES.iter().any(|cue| query_lower.contains(cue)) {
            return SynthesisStrategy::Compare;
        }
        let distinct_providers = answers
            .iter()
            .map(|a| a.provider)
            .collect::<std::collections::HashSet<_>>()
            .len();
        if distinct_providers >= 3 {
            return SynthesisStrategy::Merge;
        }
        SynthesisStrategy::Prioritize
    }

    async fn fuse(
        &self,
        answers: &[&AnalyzedAnswer],
        query: &str,
        strategy: SynthesisStrategy,
    ) -> String {
        if self.fallback_only {
            return fallback_merge(answers);
        }
        let Some(llm) = self.llm.as_ref() else {
            return fallback_merge(answers);
        };

        let prompt = match strategy {
            SynthesisStrategy::Merge => merge_prompt(answers, query),
            SynthesisStrategy::Compare => compare_prompt(answers, query),
            SynthesisStrategy::Prioritize => prioritize_prompt(answers, query),
            SynthesisStrategy::Complement => complement_prompt(answers, query),
            SynthesisStrategy::FactCheck => fact_check_prompt(answers, query),
        };

        match llm
            .generate(GenerateRequest::new(prompt).with_max_tokens(900))
            .await
        {
            Ok(generation) if !generation.text.trim().is_empty() => generation.text,
            Ok(_) => fallback_merge(answers),
            Err(err) => {
                tracing::warn!(strategy = strategy.as_str(), "LLM fusion failed: {err}");
                match strategy {
                    SynthesisStrategy::Prioritize => answers
                        .iter()
                        .max_by(|a, b| {
                            a.confidence
                                .partial_cmp(&b.confidence)
                                .unwrap_or(std::cmp::Ordering::Equal)
                        })
                        .map(|a| a.content.clone())
                        .unwrap_or_default(),
                    _ => fallback_merge(answers),
                }
            }
        }
    }

    /// Pairwise opposing-keyword scan over answer contents, plus direct
    /// key-fact disagreements. Heuristic by design.
    pub fn detect_contradictions(&self, answers: &[&AnalyzedAnswer]) -> Vec<Contradiction> {
        let mut contradictions = Vec::new();

        for (i, a) in answers.iter().enumerate() {
            for b in answers.iter().skip(i + 1) {
                if contents_conflict(&a.content, &b.content) {
                    contradictions.push(Contradiction {
                        provider_a: a.provider,
                        provider_b: b.provider,
                        excerpt_a: excerpt(&a.content),
                        excerpt_b: excerpt(&b.content),
                        kind: "content_contradiction".to_string(),
                    });
                }
            }
        }

        for conflict in self.fact_conflicts(answers) {
            contradictions.push(Contradiction {
                provider_a: conflict.provider_a,
                provider_b: conflict.provider_b,
                excerpt_a: conflict.fact_a,
                excerpt_b: conflict.fact_b,
                kind: "fact_conflict".to_string(),
            });
        }

        contradictions
    }

    fn fact_conflicts(&self, answers: &[&AnalyzedAnswer]) -> Vec<FactConflict> {
        let mut facts: Vec<(&str, ProviderId)> = Vec::new();
        for answer in answers {
            for fact in &answer.key_facts {
                facts.push((fact.as_str(), answer.provider));
            }
        }

        let mut conflicts = Vec::new();
        for (i, (fact_a, provider_a)) in facts.iter().enumerate() {
            for (fact_b, provider_b) in facts.iter().skip(i + 1) {
                if provider_a != provider_b && contents_conflict(fact_a, fact_b) {
                    conflicts.push(FactConflict {
                        fact_a: fact_a.to_string(),
                        provider_a: *provider_a,
                        fact_b: fact_b.to_string(),
                        provider_b: *provider_b,
                    });
                }
            }
        }
        conflicts
    }

    fn fact_check(&self, answers: &[&AnalyzedAnswer]) -> FactCheckReport {
        let total_facts: usize = answers.iter().map(|a| a.key_facts.len()).sum();
        let conflicts = self.fact_conflicts(answers);
        let conflict_ratio = conflicts.len() as f64 / total_facts.max(1) as f64;
        FactCheckReport {
            total_facts,
            conflicts,
            conflict_ratio,
        }
    }

    /// Up to three unique insights per provider, via the local model.
    /// Skipped entirely in fallback-only mode.
    async fn unique_insights(
        &self,
        answers: &[&AnalyzedAnswer],
    ) -> BTreeMap<ProviderId, Vec<String>> {
        let mut insights = BTreeMap::new();
        if self.fallback_only {
            return insights;
        }
        let Some(llm) = self.llm.as_ref() else {
            return insights;
        };

        for answer in answers {
            let prompt = format!(
                "Identify the unique insights or perspectives in this response that might not be found elsewhere:\n\n\
{}\n\nList 2-3 unique insights or key points:",
                answer.content
            );
            let entry = match llm
                .generate(GenerateRequest::new(prompt).with_max_tokens(200))
                .await
            {
                Ok(generation) => generation
                    .text
                    .lines()
                    .map(|line| line.trim().trim_start_matches(['-', '*', '•']).trim())
                    .filter(|line| !line.is_empty())
                    .take(3)
                    .map(str::to_string)
                    .collect(),
                Err(err) => {
                    tracing::debug!(provider = %answer.provider, "insight extraction failed: {err}");
                    Vec::new()
                }
            };
            insights.insert(answer.provider, entry);
        }
        insights
    }
}

fn contents_conflict(a: &str, b: &str) -> bool {
    let a_lower = a.to_lowercase();
    let b_lower = b.to_lowercase();
    OPPOSING_PAIRS.iter().any(|(pos, neg)| {
        (a_lower.contains(pos) && b_lower.contains(neg))
            || (a_lower.contains(neg) && b_lower.contains(pos))
    })
}

fn excerpt(content: &str) -> String {
    let cut: String = content.chars().take(200).collect();
    if cut.len() < content.len() {
        format!("{cut}...")
    } else {
        cut
    }
}

/// `contribution(p) = confidence(p) / sum(confidence)`, uniform when every
/// confidence is zero.
fn contributions(answers: &[&AnalyzedAnswer]) -> BTreeMap<ProviderId, f64> {
    let total: f64 = answers.iter().map(|a| a.confidence).sum();
    if total <= f64::EPSILON {
        let share = 1.0 / answers.len() as f64;
        return answers.iter().map(|a| (a.provider, share)).collect();
    }
    answers
        .iter()
        .map(|a| (a.provider, a.confidence / total))
        .collect()
}

/// `mean + min(0.05 * N, 0.2) - 0.1 * |contradictions|`, clamped to [0, 1].
fn overall_confidence(answers: &[&AnalyzedAnswer], contradiction_count: usize) -> f64 {
    if answers.is_empty() {
        return 0.0;
    }
    let mean: f64 = answers.iter().map(|a| a.confidence).sum::<f64>() / answers.len() as f64;
    let agreement_bonus = (answers.len() as f64 * 0.05).min(0.2);
    let contradiction_penalty = contradiction_count as f64 * 0.1;
    (mean + agreement_bonus - contradiction_penalty).clamp(0.0, 1.0)
}

fn collect_sources(answers: &[&AnalyzedAnswer]) -> Vec<String> {
    let mut sources = Vec::new();
    for answer in answers {
        let name = answer.provider.as_str().to_string();
        if !sources.contains(&name) {
            sources.push(name);
        }
        for source in &answer.sources {
            if !sources.contains(source) {
                sources.push(source.clone());
            }
        }
    }
    sources
}

fn labeled_blocks(answers: &[&AnalyzedAnswer]) -> String {
    answers
        .iter()
        .map(|a| {
            format!(
                "From {}:\n{}",
                a.provider.display_name().to_uppercase(),
                a.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn fallback_merge(answers: &[&AnalyzedAnswer]) -> String {
    let mut merged = format!("Combined responses from {} services:\n\n", answers.len());
    for answer in answers {
        merged.push_str(&format!(
            "**{}**:\n{}\n\n",
            answer.provider.display_name().to_uppercase(),
            answer.content
        ));
    }
    merged.trim_end().to_string()
}

fn merge_prompt(answers: &[&AnalyzedAnswer], query: &str) -> String {
    format!(
        "Combine these responses into a single, coherent answer to the query: \"{query}\"\n\n\
Responses:\n{}\n\n\
Create a comprehensive response that:\n\
1. Integrates information from all sources\n\
2. Removes redundancy while preserving important details\n\
3. Maintains a natural, flowing narrative\n\
4. Preserves every unique factual claim\n\n\
Comprehensive Answer:",
        labeled_blocks(answers)
    )
}

fn compare_prompt(answers: &[&AnalyzedAnswer], query: &str) -> String {
    let blocks = answers
        .iter()
        .enumerate()
        .map(|(i, a)| {
            format!(
                "Response {} ({}):\n{}",
                i + 1,
                a.provider.display_name().to_uppercase(),
                a.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");
    format!(
        "Compare and analyze these different responses to: \"{query}\"\n\n{blocks}\n\n\
Provide a comparative analysis that:\n\
1. Identifies key similarities and differences\n\
2. Evaluates the strengths of each response\n\
3. Highlights unique insights from each source\n\
4. Provides a balanced conclusion naming each source\n\n\
Comparative Analysis:"
    )
}

fn prioritize_prompt(answers: &[&AnalyzedAnswer], query: &str) -> String {
    let mut sorted: Vec<&&AnalyzedAnswer> = answers.iter().collect();
    sorted.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let primary = sorted[0];
    let supporting = sorted[1..]
        .iter()
        .map(|a| {
            let cut: String = a.content.chars().take(200).collect();
            format!(
                "From {}: {}...",
                a.provider.display_name().to_uppercase(),
                cut
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "Create a comprehensive answer to: \"{query}\"\n\n\
Primary source ({}):\n{}\n\n\
Supporting information:\n{supporting}\n\n\
Provide an answer that:\n\
1. Uses the primary source as the main foundation\n\
2. Incorporates supporting details from other sources\n\
3. Maintains consistency and coherence\n\
4. Indicates confidence levels where appropriate\n\n\
Prioritized Answer:",
        primary.provider.display_name().to_uppercase(),
        primary.content
    )
}

fn complement_prompt(answers: &[&AnalyzedAnswer], query: &str) -> String {
    let mut groups: BTreeMap<&'static str, Vec<&&AnalyzedAnswer>> = BTreeMap::new();
    for answer in answers {
        groups
            .entry(answer.content_type.as_str())
            .or_default()
            .push(answer);
    }

    let mut prompt = format!(
        "Combine these complementary responses to provide a comprehensive answer to: \"{query}\"\n"
    );
    for (content_type, group) in groups {
        prompt.push_str(&format!("\n{} PERSPECTIVE:\n", content_type.to_uppercase()));
        for answer in group {
            let cut: String = answer.content.chars().take(300).collect();
            prompt.push_str(&format!("- {}: {}...\n", answer.provider, cut));
        }
    }
    prompt.push_str(
        "\nCreate a comprehensive response that:\n\
1. Integrates different perspectives and types of information\n\
2. Shows how different aspects complement each other\n\
3. Provides a well-rounded, complete answer\n\
4. Maintains logical flow between different types of content\n\n\
Comprehensive Answer:",
    );
    prompt
}

fn fact_check_prompt(answers: &[&AnalyzedAnswer], query: &str) -> String {
    let blocks = answers
        .iter()
        .enumerate()
        .map(|(i, a)| format!("Source {} ({}):\n{}", i + 1, a.provider, a.content))
        .collect::<Vec<_>>()
        .join("\n\n");
    format!(
        "Analyze these responses for factual accuracy and resolve any conflicts for the query: \"{query}\"\n\n\
{blocks}\n\n\
Provide a fact-checked synthesis that:\n\
1. Identifies any conflicting information\n\
2. Evaluates the reliability of different claims\n\
3. Resolves conflicts based on source credibility and evidence\n\
4. Presents the most accurate information available\n\
5. Notes any residual uncertainties or areas where sources disagree\n\n\
Fact-Checked Analysis:"
    )
}
