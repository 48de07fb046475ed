//! Submission scoring.
//!
//! The pipeline treats the scorer as a black box: a synchronous, pure
//! function from content to a 0..=100 score and feedback text. Any error it
//! returns is retried like any other transient failure.

use serde::Serialize;

use crate::models::submission::SubmissionContent;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScoreResult {
    pub score: i32,
    pub feedback: String,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("scorer failed: {0}")]
pub struct ScorerError(String);

impl ScorerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

pub trait Scorer: Send + Sync + 'static {
    fn score(&self, content: &SubmissionContent) -> Result<ScoreResult, ScorerError>;
}

/// Relative weight of each rubric category.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RubricWeights {
    pub code_quality: f64,
    pub correctness: f64,
    pub documentation: f64,
    pub performance: f64,
}

impl Default for RubricWeights {
    fn default() -> Self {
        Self {
            code_quality: 0.3,
            correctness: 0.4,
            documentation: 0.2,
            performance: 0.1,
        }
    }
}

impl RubricWeights {
    pub fn total(&self) -> f64 {
        self.code_quality + self.correctness + self.documentation + self.performance
    }
}

const PERFORMANCE_KEYWORDS: &[&str] = &[
    "optimize", "cache", "async", "await", "return", "map", "reduce",
];

/// Keyword and structure heuristics grouped into four weighted categories.
#[derive(Debug, Clone, Default)]
pub struct RubricScorer {
    weights: RubricWeights,
}

impl RubricScorer {
    pub fn new(weights: RubricWeights) -> Self {
        Self { weights }
    }

    /// Length, modern syntax and comments. Returns a 0..=1 ratio.
    fn code_quality(code: &str, feedback: &mut Vec<String>) -> f64 {
        let mut points = 0.0;
        if code.chars().count() > 20 {
            points += 10.0;
        }
        if code.contains("const ") || code.contains("let ") || code.contains("=>") {
            points += 20.0;
            feedback.push("Code Quality: Modern syntax detected (ES6+).".to_string());
        } else {
            feedback.push("Code Quality: Consider using 'const/let' instead of 'var'.".to_string());
        }
        if code.contains("//") || code.contains("/*") {
            points += 10.0;
            feedback.push("Code Quality: Good commenting practice.".to_string());
        }
        points / 40.0
    }

    /// Non-empty code with balanced delimiters.
    fn correctness(code: &str, feedback: &mut Vec<String>) -> f64 {
        if code.trim().is_empty() {
            feedback.push("Correctness: No source code submitted.".to_string());
            return 0.0;
        }
        if delimiters_balanced(code) {
            feedback.push("Correctness: Delimiters are balanced.".to_string());
            1.0
        } else {
            feedback.push("Correctness: Unbalanced brackets or braces.".to_string());
            0.25
        }
    }

    fn documentation(docs: &str, feedback: &mut Vec<String>) -> f64 {
        if docs.chars().count() > 10 {
            feedback.push("Documentation: Explanation provided.".to_string());
            1.0
        } else {
            feedback.push("Documentation: Missing or too short (-30%).".to_string());
            0.0
        }
    }

    fn performance(code: &str, feedback: &mut Vec<String>) -> f64 {
        let lower = code.to_lowercase();
        let found: Vec<&str> = PERFORMANCE_KEYWORDS
            .iter()
            .copied()
            .filter(|keyword| lower.contains(keyword))
            .collect();
        if found.is_empty() {
            feedback.push("Performance: Basic implementation.".to_string());
            1.0 / 3.0
        } else {
            feedback.push(format!("Performance: Used keywords: {}.", found.join(", ")));
            1.0
        }
    }
}

impl Scorer for RubricScorer {
    fn score(&self, content: &SubmissionContent) -> Result<ScoreResult, ScorerError> {
        let total = self.weights.total();
        if !total.is_finite() || total <= 0.0 {
            return Err(ScorerError::new("rubric weights sum to zero"));
        }

        let code = content.source_code.as_str();
        let mut feedback = Vec::new();
        let weighted = Self::code_quality(code, &mut feedback) * self.weights.code_quality
            + Self::correctness(code, &mut feedback) * self.weights.correctness
            + Self::documentation(&content.documentation, &mut feedback)
                * self.weights.documentation
            + Self::performance(code, &mut feedback) * self.weights.performance;

        let score = (weighted / total * 100.0).round().clamp(0.0, 100.0) as i32;
        Ok(ScoreResult {
            score,
            feedback: feedback.join("\n"),
        })
    }
}

fn delimiters_balanced(code: &str) -> bool {
    let mut stack = Vec::new();
    for c in code.chars() {
        match c {
            '(' | '[' | '{' => stack.push(c),
            ')' | ']' | '}' => {
                let expected = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                if stack.pop() != Some(expected) {
                    return false;
                }
            }
            _ => {}
        }
    }
    stack.is_empty()
}
