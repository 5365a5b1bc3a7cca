//! # Sensitive Topic Detection
//!
//! Optional guard consulted before any flow logic runs. The detector is an
//! opaque interface: given the raw text of the latest user message it
//! decides whether the turn must be short-circuited, and names the action
//! to run instead. Implementations may call out to external models, so
//! `check` is async; the flow interpreter behind the gate stays fully
//! synchronous.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Guard interface for the turn gate.
#[async_trait]
pub trait SensitiveTopicDetector: Send + Sync {
    /// Whether the given user text touches a sensitive topic.
    async fn check(&self, text: &str) -> bool;

    /// The action to predict when [`check`](Self::check) fires.
    fn action(&self) -> String;
}

/// Configuration for the built-in keyword detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Case-insensitive substrings that mark a message as sensitive.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Action predicted on a hit.
    #[serde(default = "default_gate_action")]
    pub action: String,
}

fn default_gate_action() -> String {
    "utter_cannot_help".to_string()
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            keywords: Vec::new(),
            action: default_gate_action(),
        }
    }
}

/// Keyword-based detector, the default implementation behind
/// [`crate::FlowPolicy`]. Matches case-insensitive substrings.
pub struct KeywordTopicDetector {
    keywords: Vec<String>,
    action: String,
}

impl KeywordTopicDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            keywords: config
                .keywords
                .into_iter()
                .map(|keyword| keyword.to_lowercase())
                .collect(),
            action: config.action,
        }
    }
}

#[async_trait]
impl SensitiveTopicDetector for KeywordTopicDetector {
    async fn check(&self, text: &str) -> bool {
        let lowered = text.to_lowercase();
        self.keywords.iter().any(|keyword| lowered.contains(keyword))
    }

    fn action(&self) -> String {
        self.action.clone()
    }
}
