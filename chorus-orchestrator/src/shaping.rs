//! Prompt shaping: deterministic, provider- and format-specific rewriting of
//! a user prompt before it is sent, plus templated refinement prompts for
//! the feedback loop.
//!
//! Shaping is idempotent: a prompt that already carries the machine-readable
//! footer is passed through untouched, so re-shaping a shaped prompt is a
//! no-op up to whitespace. The shaper is the only component that renders
//! templates.

use chorus_providers::{ExpectedSchema, OutputFormat, ProviderId};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::refinement::RefinementAction;

/// Marker line that closes every shaped prompt. Its presence is what makes
/// shaping idempotent.
const CHECKLIST_HEADER: &str = "VALIDATION CHECKLIST before responding:";

const VALIDATION_CHECKLIST: &str = "\n\nVALIDATION CHECKLIST before responding:\n\
1. Response matches the exact format specified\n\
2. All required fields are included\n\
3. Data types are correct (strings, numbers, arrays, etc.)\n\
4. No extra text or explanations outside the specified format\n\
5. Output is machine-parseable\n\
\n\
If any check fails, correct the response before sending it.";

/// Rewriting strategies the shaper can apply on top of the elision pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapingStrategy {
    TokenMinimization,
    ClarityMaximization,
    StructureEnforcement,
    PrecisionTargeting,
}

impl ShapingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShapingStrategy::TokenMinimization => "token_minimization",
            ShapingStrategy::ClarityMaximization => "clarity_maximization",
            ShapingStrategy::StructureEnforcement => "structure_enforcement",
            ShapingStrategy::PrecisionTargeting => "precision_targeting",
        }
    }
}

/// Coarse classification of what a prompt asks for. Used to pick strategy
/// defaults and recorded for analytics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptCategory {
    InformationExtraction,
    DataAnalysis,
    CreativeGeneration,
    ProblemSolving,
    Research,
    Comparison,
}

impl PromptCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromptCategory::InformationExtraction => "information_extraction",
            PromptCategory::DataAnalysis => "data_analysis",
            PromptCategory::CreativeGeneration => "creative_generation",
            PromptCategory::ProblemSolving => "problem_solving",
            PromptCategory::Research => "research",
            PromptCategory::Comparison => "comparison",
        }
    }
}

/// A shaped prompt with its heuristic quality estimates.
#[derive(Debug, Clone)]
pub struct ShapedPrompt {
    pub text: String,
    pub category: PromptCategory,
    pub strategy: ShapingStrategy,
    /// Estimated tokens saved by elisions relative to the base prompt.
    pub token_reduction: u32,
    pub clarity_score: f64,
    pub structure_compliance: f64,
}

/// A template with named holes, rendered as `{hole}` replacement. Keeping
/// rendering in one place makes refinement prompts testable.
#[derive(Debug, Clone, Copy)]
pub struct PromptTemplate {
    body: &'static str,
}

impl PromptTemplate {
    pub const fn new(body: &'static str) -> Self {
        Self { body }
    }

    pub fn render(&self, vars: &[(&str, &str)]) -> String {
        let mut out = self.body.to_string();
        for (name, value) in vars {
            out = out.replace(&format!("{{{name}}}"), value);
        }
        out
    }
}

const CLARIFY_FORMAT_TEMPLATE: PromptTemplate = PromptTemplate::new(
    "The previous response didn't match the required format.\n\n\
ISSUES DETECTED:\n{issues}\n\n\
ORIGINAL REQUEST:\n{original_prompt}\n\n\
PREVIOUS RESPONSE:\n{failed_response}\n\n\
REQUIRED FORMAT:\n{expected_output}\n\n\
Provide a response that EXACTLY matches the required format:\n\
1. Use the exact format specified\n\
2. Include all required fields\n\
3. Ensure proper data types\n\
4. No additional text outside the format\n\n\
Corrected response:",
);

const REQUEST_MISSING_DATA_TEMPLATE: PromptTemplate = PromptTemplate::new(
    "Your previous response was missing required information.\n\n\
MISSING ELEMENTS:\n{issues}\n\n\
ORIGINAL REQUEST:\n{original_prompt}\n\n\
PREVIOUS INCOMPLETE RESPONSE:\n{failed_response}\n\n\
Provide a COMPLETE response that includes:\n{expected_output}\n\n\
Make sure to address all missing elements identified above.\n\n\
Complete response:",
);

const FIX_STRUCTURE_TEMPLATE: PromptTemplate = PromptTemplate::new(
    "The structure of your previous response needs correction.\n\n\
STRUCTURAL ISSUES:\n{issues}\n\n\
CORRECT STRUCTURE NEEDED:\n{expected_output}\n\n\
PREVIOUS RESPONSE (with issues):\n{failed_response}\n\n\
Reformat your response to match the correct structure exactly.\n\n\
Corrected response:",
);

const PROVIDE_EXAMPLES_TEMPLATE: PromptTemplate = PromptTemplate::new(
    "The format wasn't clear from the previous response. Here's exactly what is needed:\n\n\
ORIGINAL REQUEST:\n{original_prompt}\n\n\
EXACT FORMAT REQUIRED:\n{expected_output}\n\n\
EXAMPLE of correct format:\n{example}\n\n\
ISSUES WITH PREVIOUS RESPONSE:\n{issues}\n\n\
Provide your response using EXACTLY the format shown in the example above.\n\n\
Response:",
);

const SIMPLIFY_REQUEST_TEMPLATE: PromptTemplate = PromptTemplate::new(
    "A simpler version of the request:\n\n\
SIMPLIFIED REQUEST:\n{simplified_prompt}\n\n\
REQUIRED OUTPUT FORMAT:\n{expected_output}\n\n\
ISSUES TO AVOID:\n{issues}\n\n\
Provide a response that follows the format exactly.\n\n\
Response:",
);

const SPLIT_REQUEST_TEMPLATE: PromptTemplate = PromptTemplate::new(
    "The request is split into smaller parts. Answer each part in order.\n\n\
PARTS:\n{simplified_prompt}\n\n\
REQUIRED OUTPUT FORMAT:\n{expected_output}\n\n\
ISSUES WITH PREVIOUS RESPONSE:\n{issues}\n\n\
Answer every part, then combine the answers into the required format.\n\n\
Response:",
);

struct ElisionSet {
    global: Vec<(Regex, &'static str)>,
    per_provider: BTreeMap<ProviderId, Vec<(Regex, &'static str)>>,
}

/// Deterministic prompt shaper. All state is the compiled pattern tables;
/// shaping the same input always produces the same output.
pub struct PromptShaper {
    elisions: ElisionSet,
    whitespace: Regex,
}

impl Default for PromptShaper {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptShaper {
    pub fn new() -> Self {
        let ci = |pattern: &str| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .expect("static elision pattern")
        };

        let global = vec![
            (ci(r"\bplease\b"), ""),
            (ci(r"\bkindly\b"), ""),
            (ci(r"\bi would like you to\b"), ""),
            (ci(r"\bwould you\b"), ""),
            (ci(r"\bcan you\b"), ""),
        ];

        let mut per_provider = BTreeMap::new();
        per_provider.insert(
            ProviderId::Claude,
            vec![
                (ci(r"\bI need you to\b"), ""),
                (ci(r"\bCould you please\b"), ""),
            ],
        );
        per_provider.insert(
            ProviderId::Gemini,
            vec![
                (ci(r"\bHelp me\b"), ""),
                (ci(r"\bI want you to\b"), ""),
            ],
        );
        per_provider.insert(
            ProviderId::Perplexity,
            vec![
                (ci(r"\bSearch for\b"), "Find"),
                (ci(r"\bLook up\b"), "Find"),
            ],
        );

        Self {
            elisions: ElisionSet {
                global,
                per_provider,
            },
            whitespace: Regex::new(r"[ \t]+").expect("static pattern"),
        }
    }

    /// Default shaping strategy for a prompt category. Creative work gets
    /// clarity, research and comparison get precision hints, everything
    /// else gets structure enforcement.
    pub fn strategy_for(&self, category: PromptCategory) -> ShapingStrategy {
        match category {
            PromptCategory::CreativeGeneration => ShapingStrategy::ClarityMaximization,
            PromptCategory::Research | PromptCategory::Comparison => {
                ShapingStrategy::PrecisionTargeting
            }
            _ => ShapingStrategy::StructureEnforcement,
        }
    }

    /// Classify a prompt into its category.
    pub fn classify(&self, prompt: &str) -> PromptCategory {
        let lower = prompt.to_lowercase();
        let has = |words: &[&str]| words.iter().any(|w| lower.contains(w));

        if has(&["extract", "find", "identify", "locate"]) {
            PromptCategory::InformationExtraction
        } else if has(&["analyze", "examine", "evaluate", "assess"]) {
            PromptCategory::DataAnalysis
        } else if has(&["create", "generate", "write", "compose"]) {
            PromptCategory::CreativeGeneration
        } else if has(&["solve", "fix", "resolve", "troubleshoot"]) {
            PromptCategory::ProblemSolving
        } else if has(&["research", "investigate", "explore", "discover"]) {
            PromptCategory::Research
        } else if has(&["compare", "contrast", "versus", "difference"]) {
            PromptCategory::Comparison
        } else {
            PromptCategory::InformationExtraction
        }
    }

    /// Shape a prompt for one provider and one output format.
    ///
    /// Pipeline: provider elisions, strategy transform, machine-readable
    /// structural block quoting the schema, validation checklist footer.
    pub fn shape(
        &self,
        prompt: &str,
        provider: ProviderId,
        schema: &ExpectedSchema,
        format: OutputFormat,
        strategy: ShapingStrategy,
    ) -> ShapedPrompt {
        let category = self.classify(prompt);

        // Already shaped: pass through untouched.
        if prompt.contains(CHECKLIST_HEADER) {
            let text = prompt.trim().to_string();
            let clarity_score = self.assess_clarity(&text);
            let structure_compliance = self.assess_structure(&text, format);
            return ShapedPrompt {
                text,
                category,
                strategy,
                token_reduction: 0,
                clarity_score,
                structure_compliance,
            };
        }

        let elided = self.apply_elisions(prompt, provider);
        let transformed = self.apply_strategy(&elided, provider, format, strategy);
        let structured = self.add_structural_block(&transformed, schema, format, provider);
        let text = format!("{structured}{VALIDATION_CHECKLIST}");

        let token_reduction =
            estimate_tokens(prompt).saturating_sub(estimate_tokens(&transformed)) as u32;
        let clarity_score = self.assess_clarity(&text);
        let structure_compliance = self.assess_structure(&text, format);

        ShapedPrompt {
            text,
            category,
            strategy,
            token_reduction,
            clarity_score,
            structure_compliance,
        }
    }

    /// Shape one base prompt for several providers at once.
    pub fn shape_for_providers(
        &self,
        prompt: &str,
        providers: &[ProviderId],
        schema: &ExpectedSchema,
        format: OutputFormat,
        strategy: ShapingStrategy,
    ) -> BTreeMap<ProviderId, ShapedPrompt> {
        providers
            .iter()
            .map(|&provider| (provider, self.shape(prompt, provider, schema, format, strategy)))
            .collect()
    }

    /// Render a refinement prompt for a chosen action.
    ///
    /// `example` is only used by `ProvideExamples`; `simplified` by
    /// `SimplifyRequest` and `SplitRequest`. Callers that have no generated
    /// text pass `None` and the schema/original prompt stand in.
    pub fn refinement_prompt(
        &self,
        action: RefinementAction,
        original_prompt: &str,
        failed_response: &str,
        issues: &[String],
        schema: &ExpectedSchema,
        format: OutputFormat,
        example: Option<&str>,
        simplified: Option<&str>,
    ) -> String {
        let template = match action {
            RefinementAction::ClarifyFormat => CLARIFY_FORMAT_TEMPLATE,
            RefinementAction::RequestMissingData => REQUEST_MISSING_DATA_TEMPLATE,
            RefinementAction::FixStructure => FIX_STRUCTURE_TEMPLATE,
            RefinementAction::ProvideExamples => PROVIDE_EXAMPLES_TEMPLATE,
            RefinementAction::SimplifyRequest => SIMPLIFY_REQUEST_TEMPLATE,
            RefinementAction::SplitRequest => SPLIT_REQUEST_TEMPLATE,
        };

        let issues_block = if issues.is_empty() {
            "- response did not meet the quality threshold".to_string()
        } else {
            issues
                .iter()
                .map(|issue| format!("- {issue}"))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let expected = schema.render(format);
        let snippet = truncate(failed_response, 300);
        let fallback_example = expected.clone();

        template.render(&[
            ("issues", issues_block.as_str()),
            ("original_prompt", original_prompt),
            ("failed_response", snippet.as_str()),
            ("expected_output", expected.as_str()),
            ("example", example.unwrap_or(fallback_example.as_str())),
            ("simplified_prompt", simplified.unwrap_or(original_prompt)),
        ])
    }

    /// Human-readable description of what a refinement should fix, recorded
    /// on the attempt.
    pub fn expected_fix(&self, action: RefinementAction, issues: &[String]) -> String {
        let base = match action {
            RefinementAction::ClarifyFormat => "Correct the output format to match specifications",
            RefinementAction::RequestMissingData => "Include all missing required fields and data",
            RefinementAction::FixStructure => "Restructure the response to match expected format",
            RefinementAction::ProvideExamples => "Follow the provided example format exactly",
            RefinementAction::SimplifyRequest => "Address the simplified, clearer request",
            RefinementAction::SplitRequest => "Address each part of the split request separately",
        };
        if issues.is_empty() {
            base.to_string()
        } else {
            let listed = issues
                .iter()
                .take(2)
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            format!("{base}. Specific issues: {listed}")
        }
    }

    fn apply_elisions(&self, prompt: &str, provider: ProviderId) -> String {
        let mut text = prompt.to_string();
        for (pattern, replacement) in &self.elisions.global {
            text = pattern.replace_all(&text, *replacement).into_owned();
        }
        if let Some(patterns) = self.elisions.per_provider.get(&provider) {
            for (pattern, replacement) in patterns {
                text = pattern.replace_all(&text, *replacement).into_owned();
            }
        }
        self.whitespace.replace_all(text.trim(), " ").into_owned()
    }

    fn apply_strategy(
        &self,
        prompt: &str,
        provider: ProviderId,
        format: OutputFormat,
        strategy: ShapingStrategy,
    ) -> String {
        match strategy {
            // Elisions already did the heavy lifting; collapse what remains.
            ShapingStrategy::TokenMinimization => {
                self.whitespace.replace_all(prompt.trim(), " ").into_owned()
            }
            ShapingStrategy::ClarityMaximization => {
                let mut text = prompt.trim().to_string();
                for lead in ["can you ", "could you ", "would you "] {
                    if text.to_lowercase().starts_with(lead) {
                        text = text[lead.len()..].to_string();
                        break;
                    }
                }
                let mut chars = text.chars();
                if let Some(first) = chars.next() {
                    text = first.to_uppercase().collect::<String>() + chars.as_str();
                }
                if !text.ends_with(['.', '!', '?', ':']) {
                    text.push('.');
                }
                text
            }
            ShapingStrategy::StructureEnforcement => {
                let enforcement = match format {
                    OutputFormat::Json => "Return only valid JSON format.",
                    OutputFormat::StructuredText => {
                        "Use structured text with clear field labels."
                    }
                    OutputFormat::Markdown => "Use proper markdown formatting.",
                    OutputFormat::Xml => "Return valid XML with proper tags.",
                };
                if prompt.contains(enforcement) {
                    prompt.to_string()
                } else {
                    format!("{prompt} {enforcement}")
                }
            }
            ShapingStrategy::PrecisionTargeting => {
                let addition = match provider {
                    ProviderId::Claude => "Be precise and analytical.",
                    ProviderId::Gemini => "Provide accurate, factual information.",
                    ProviderId::Perplexity => "Focus on relevant, current information.",
                    ProviderId::Local => "Answer directly and concisely.",
                };
                if prompt.contains(addition) {
                    prompt.to_string()
                } else {
                    format!("{prompt} {addition}")
                }
            }
        }
    }

    fn add_structural_block(
        &self,
        prompt: &str,
        schema: &ExpectedSchema,
        format: OutputFormat,
        provider: ProviderId,
    ) -> String {
        let rendered = schema.render(format);
        let instruction = match format {
            OutputFormat::Json => format!(
                "CRITICAL: Your response must be valid JSON with this exact structure:\n{rendered}\n\n\
Do not include any text before or after the JSON. Start with {{ and end with }}."
            ),
            OutputFormat::StructuredText => format!(
                "CRITICAL: Format your response exactly as follows:\n{rendered}\n\n\
Use the exact field names and structure shown above."
            ),
            OutputFormat::Markdown => format!(
                "CRITICAL: Use markdown format with this structure:\n{rendered}\n\n\
Follow markdown syntax precisely."
            ),
            OutputFormat::Xml => format!(
                "CRITICAL: Provide XML output with this structure:\n{rendered}\n\n\
Ensure proper XML syntax with opening and closing tags."
            ),
        };

        let service_note = match provider {
            ProviderId::Claude => {
                "\n\nBe precise and follow the format exactly. Do not add explanations or extra text."
            }
            ProviderId::Gemini => "\n\nEnsure the output is machine-readable and parseable.",
            ProviderId::Perplexity => {
                "\n\nProvide structured, factual information in the specified format."
            }
            ProviderId::Local => "",
        };

        format!("{prompt}\n\n{instruction}{service_note}")
    }

    fn assess_clarity(&self, prompt: &str) -> f64 {
        let mut score: f64 = 0.5;
        if [":", "-", "1.", "2."].iter().any(|m| prompt.contains(m)) {
            score += 0.2;
        }
        let lower = prompt.to_lowercase();
        if !lower.starts_with("can you")
            && !lower.starts_with("could you")
            && !lower.starts_with("would you")
        {
            score += 0.1;
        }
        if ["exact", "specific", "precise", "must"]
            .iter()
            .any(|w| lower.contains(w))
        {
            score += 0.1;
        }
        let word_count = prompt.split_whitespace().count();
        if (20..=160).contains(&word_count) {
            score += 0.1;
        }
        score.min(1.0)
    }

    fn assess_structure(&self, prompt: &str, format: OutputFormat) -> f64 {
        let lower = prompt.to_lowercase();
        let indicators: &[&str] = match format {
            OutputFormat::Json => &["json", "{", "}", "format"],
            OutputFormat::StructuredText => &["structure", "format", "field"],
            OutputFormat::Markdown => &["markdown", "#", "**"],
            OutputFormat::Xml => &["xml", "<", ">", "tag"],
        };
        let found = indicators.iter().filter(|i| lower.contains(**i)).count();

        let mut score = 0.5 + (found as f64 * 0.1).min(0.4);
        if lower.contains("validation") || lower.contains("checklist") {
            score += 0.1;
        }
        score.min(1.0)
    }
}

fn estimate_tokens(text: &str) -> usize {
    let words = text.split_whitespace().count();
    let punctuation = text.chars().filter(char::is_ascii_punctuation).count();
    words + punctuation
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        text.to_string()
    } else {
        let cut: String = text.chars().take(limit).collect();
        format!("{cut}...")
    }
}
