//! Intent parsing — maps a free-text description to a structured intent.
//!
//! The core treats the parser as a black box behind [`IntentParser`]; the
//! bundled [`KeywordIntentParser`] is a keyword matcher, not a language
//! model, and callers must not assume any accuracy from it. Parser failure
//! never blocks submission — the task is stored with no parsed intent and
//! routed to the default processor.

use async_trait::async_trait;
use regex::Regex;

use crate::tasks::model::ParsedIntent;

/// Intent assigned when parsing fails or confidence is too low.
pub const DEFAULT_INTENT: &str = "general";

#[derive(Debug, thiserror::Error)]
pub enum IntentError {
    #[error("Intent parsing failed: {0}")]
    ParseFailed(String),
}

/// External collaborator contract for intent parsing.
#[async_trait]
pub trait IntentParser: Send + Sync {
    async fn parse(&self, description: &str) -> Result<ParsedIntent, IntentError>;
}

/// One keyword rule: any match assigns the intent; more matches, more
/// confidence.
struct IntentRule {
    intent: &'static str,
    pattern: Regex,
}

/// Keyword-matching parser.
pub struct KeywordIntentParser {
    rules: Vec<IntentRule>,
}

impl KeywordIntentParser {
    pub fn new() -> Self {
        let rules = [
            (
                "content_generation",
                r"(?i)\b(caption|post|write|draft|copy|announce|blog)\b",
            ),
            (
                "image_generation",
                r"(?i)\b(image|photo|picture|logo|banner|illustration)\b",
            ),
            (
                "analytics",
                r"(?i)\b(report|analy[sz]e|metrics|performance|stats)\b",
            ),
            (
                "engagement",
                r"(?i)\b(reply|respond|comment|answer|follow.?up)\b",
            ),
        ]
        .into_iter()
        .map(|(intent, pattern)| IntentRule {
            intent,
            // Patterns are static literals; a bad one is a programmer error.
            pattern: Regex::new(pattern).expect("invalid built-in intent pattern"),
        })
        .collect();

        Self { rules }
    }
}

impl Default for KeywordIntentParser {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IntentParser for KeywordIntentParser {
    async fn parse(&self, description: &str) -> Result<ParsedIntent, IntentError> {
        let mut best: Option<(&'static str, usize)> = None;

        for rule in &self.rules {
            let hits = rule.pattern.find_iter(description).count();
            if hits > 0 && best.is_none_or(|(_, n)| hits > n) {
                best = Some((rule.intent, hits));
            }
        }

        let (intent, hits) = match best {
            Some(found) => found,
            None => (DEFAULT_INTENT, 0),
        };

        // Crude confidence: one hit is a weak signal, three or more a strong one.
        let confidence = match hits {
            0 => 0.1,
            1 => 0.6,
            2 => 0.8,
            _ => 0.95,
        };

        let mut entities = std::collections::HashMap::new();
        if hits > 0 {
            entities.insert(
                "keyword_hits".to_string(),
                serde_json::Value::from(hits as u64),
            );
        }

        Ok(ParsedIntent {
            intent: intent.to_string(),
            entities,
            confidence,
        })
    }
}
