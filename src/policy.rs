//! # Flow Policy - The Turn Gate
//!
//! The per-turn entry point wrapping the interpreter. For each turn the
//! policy, in strict order:
//!
//! 1. consults the sensitive-topic detector (if configured) on the first
//!    prediction after a user message and short-circuits on a hit,
//! 2. abstains when an active loop owns the turn,
//! 3. otherwise rebuilds a [`FlowExecutor`] from the tracker and delegates.
//!
//! The outcome is rendered as a probability vector over the domain's
//! actions, plus the slot events the interpreter emitted. Errors from the
//! interpreter are surfaced untouched; the outer pipeline is expected to
//! log them and fall back to another policy.

use crate::catalog::FlowCatalog;
use crate::detector::{DetectorConfig, KeywordTopicDetector, SensitiveTopicDetector};
use crate::domain::Domain;
use crate::executor::FlowExecutor;
use crate::tracker::{SlotSet, Tracker};
use crate::{ACTION_LISTEN, FlowError, FlowResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Default priority relative to other policies in the outer pipeline.
pub const DEFAULT_POLICY_PRIORITY: usize = 1;

/// Flow policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_priority")]
    pub priority: usize,
    /// Number of past turns considered by featurizing policies. Carried
    /// for pipeline compatibility; the flow policy itself only reads the
    /// current tracker snapshot.
    #[serde(default)]
    pub max_history: Option<usize>,
    #[serde(default)]
    pub sensitive_topic_detector: Option<DetectorConfig>,
}

fn default_priority() -> usize {
    DEFAULT_POLICY_PRIORITY
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            priority: DEFAULT_POLICY_PRIORITY,
            max_history: None,
            sensitive_topic_detector: None,
        }
    }
}

/// A policy prediction: one probability per domain action, plus the
/// events to apply before running the chosen action.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyPrediction {
    pub probabilities: Vec<f64>,
    pub events: Vec<SlotSet>,
}

impl PolicyPrediction {
    /// Probability assigned to the given action.
    pub fn score_for(&self, action_name: &str, domain: &Domain) -> Option<f64> {
        domain
            .index_for_action(action_name)
            .and_then(|index| self.probabilities.get(index))
            .copied()
    }

    /// Highest probability in the vector, 0.0 for an empty domain.
    pub fn max_score(&self) -> f64 {
        self.probabilities.iter().copied().fold(0.0, f64::max)
    }
}

/// Decides the next action of the dialogue system based on flows.
pub struct FlowPolicy {
    config: PolicyConfig,
    detector: Option<Box<dyn SensitiveTopicDetector>>,
}

impl FlowPolicy {
    /// Build a policy from configuration. A configured detector section
    /// instantiates the built-in keyword detector.
    pub fn new(config: PolicyConfig) -> Self {
        let detector = config.sensitive_topic_detector.clone().map(|detector_config| {
            Box::new(KeywordTopicDetector::new(detector_config))
                as Box<dyn SensitiveTopicDetector>
        });
        Self { config, detector }
    }

    /// Build a policy with a custom detector implementation.
    pub fn with_detector(config: PolicyConfig, detector: Box<dyn SensitiveTopicDetector>) -> Self {
        Self {
            config,
            detector: Some(detector),
        }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Whether the tracker ends with a listen, meaning we have just
    /// received a user message.
    fn is_first_prediction_after_user_message(tracker: &Tracker) -> bool {
        tracker.latest_action_name.as_deref() == Some(ACTION_LISTEN)
    }

    /// Predict the next action for the turn described by the tracker.
    pub async fn predict_action_probabilities(
        &self,
        tracker: &Tracker,
        domain: &Domain,
        flows: &FlowCatalog,
    ) -> FlowResult<PolicyPrediction> {
        if let Some(detector) = &self.detector {
            if Self::is_first_prediction_after_user_message(tracker) {
                if let Some(message) = &tracker.latest_message {
                    if detector.check(&message.text).await {
                        let action = detector.action();
                        info!(action = %action, "sensitive topic detected");
                        return self.prediction_result(Some(&action), domain, 1.0, Vec::new());
                    }
                    debug!(text = %message.text, "no sensitive topic detected");
                }
            }
        }

        if tracker.active_loop.is_some() {
            // some other component owns this turn
            debug!("we are in a loop, skipping prediction");
            return self.prediction_result(None, domain, 0.0, Vec::new());
        }

        let executor = FlowExecutor::from_tracker(tracker, flows)?;
        let next = executor.select_next_action(tracker, domain)?;
        self.prediction_result(next.action_name.as_deref(), domain, next.score, next.events)
    }

    fn prediction_result(
        &self,
        action_name: Option<&str>,
        domain: &Domain,
        score: f64,
        events: Vec<SlotSet>,
    ) -> FlowResult<PolicyPrediction> {
        let mut probabilities = domain.default_action_probabilities();
        if let Some(name) = action_name {
            let index = domain
                .index_for_action(name)
                .ok_or_else(|| FlowError::UnknownAction(name.to_string()))?;
            probabilities[index] = score;
        }
        Ok(PolicyPrediction {
            probabilities,
            events,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Flow;
    use crate::step::FlowStep;
    use crate::tracker::Message;

    fn catalog() -> FlowCatalog {
        FlowCatalog::new(vec![Flow::new(
            "greet",
            vec![FlowStep::user_message("start", "hello")],
        )])
    }

    fn domain() -> Domain {
        Domain::new(
            vec![],
            vec![
                ACTION_LISTEN.to_string(),
                "flow_greet".to_string(),
                "utter_cannot_help".to_string(),
            ],
        )
    }

    #[tokio::test]
    async fn test_detector_short_circuits_the_interpreter() {
        let policy = FlowPolicy::new(PolicyConfig {
            sensitive_topic_detector: Some(DetectorConfig {
                keywords: vec!["diagnosis".to_string()],
                ..DetectorConfig::default()
            }),
            ..PolicyConfig::default()
        });

        // the message would also trigger the greet flow; the detector wins
        let tracker = Tracker::new("t")
            .with_latest_action(ACTION_LISTEN)
            .with_message(Message::new("give me a diagnosis").with_intent("hello"));

        let prediction = policy
            .predict_action_probabilities(&tracker, &domain(), &catalog())
            .await
            .unwrap();

        assert_eq!(
            prediction.score_for("utter_cannot_help", &domain()),
            Some(1.0)
        );
        assert_eq!(prediction.score_for("flow_greet", &domain()), Some(0.0));
        assert!(prediction.events.is_empty());
    }

    #[tokio::test]
    async fn test_detector_only_runs_after_a_user_message() {
        let policy = FlowPolicy::new(PolicyConfig {
            sensitive_topic_detector: Some(DetectorConfig {
                keywords: vec!["diagnosis".to_string()],
                ..DetectorConfig::default()
            }),
            ..PolicyConfig::default()
        });

        // latest action is not a listen, so the detector is bypassed
        let tracker = Tracker::new("t")
            .with_latest_action("utter_hello")
            .with_message(Message::new("give me a diagnosis").with_intent("hello"));

        let prediction = policy
            .predict_action_probabilities(&tracker, &domain(), &catalog())
            .await
            .unwrap();
        assert_eq!(prediction.score_for("flow_greet", &domain()), Some(1.0));
    }

    #[tokio::test]
    async fn test_active_loop_abstains() {
        let policy = FlowPolicy::new(PolicyConfig::default());
        let tracker = Tracker::new("t")
            .with_active_loop("form_order")
            .with_message(Message::new("hi").with_intent("hello"));

        let prediction = policy
            .predict_action_probabilities(&tracker, &domain(), &catalog())
            .await
            .unwrap();

        assert_eq!(prediction.max_score(), 0.0);
        assert!(prediction.events.is_empty());
    }

    #[tokio::test]
    async fn test_delegates_to_the_interpreter() {
        let policy = FlowPolicy::new(PolicyConfig::default());
        let tracker = Tracker::new("t")
            .with_latest_action(ACTION_LISTEN)
            .with_message(Message::new("hi").with_intent("hello"));

        let prediction = policy
            .predict_action_probabilities(&tracker, &domain(), &catalog())
            .await
            .unwrap();
        assert_eq!(prediction.score_for("flow_greet", &domain()), Some(1.0));
    }

    #[tokio::test]
    async fn test_unknown_action_is_a_configuration_error() {
        let policy = FlowPolicy::new(PolicyConfig::default());
        let tracker = Tracker::new("t")
            .with_latest_action(ACTION_LISTEN)
            .with_message(Message::new("hi").with_intent("hello"));
        let empty_domain = Domain::new(vec![], vec![]);

        let result = policy
            .predict_action_probabilities(&tracker, &empty_domain, &catalog())
            .await;
        assert!(matches!(result, Err(FlowError::UnknownAction(name)) if name == "flow_greet"));
    }

    #[test]
    fn test_config_defaults() {
        let config: PolicyConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.priority, DEFAULT_POLICY_PRIORITY);
        assert!(config.max_history.is_none());
        assert!(config.sensitive_topic_detector.is_none());
    }
}
