//! # ConvoFlow-RS
//!
//! A deterministic, stack-based conversational flow engine in Rust.
//!
//! ConvoFlow models a dialogue system's behavior as **Flows + Tracker**:
//! - **Flow**: a declarative graph of typed steps (user message, question,
//!   action, sub-flow link) joined by static, conditional and fallback
//!   links
//! - **Tracker**: the per-conversation snapshot of slot values, the latest
//!   user message and the latest executed action
//! - **Events**: the engine never mutates the tracker; each turn returns
//!   `SlotSet` events the outer pipeline applies and persists
//!
//! ## Architecture
//!
//! Three state machines cooperate, reconstructed from persisted slots on
//! every turn:
//!
//! - the **step graph** of the active flow, advanced one step per turn by
//!   [`FlowExecutor`]
//! - the **call stack** of paused caller frames ([`FlowStack`]), pushed on
//!   sub-flow links and popped when a callee finishes
//! - the **turn gate** ([`FlowPolicy`]), which short-circuits sensitive
//!   topics, abstains while a loop owns the turn, and otherwise delegates
//!   to the interpreter
//!
//! Link conditions are written in a small predicate language (see
//! [`predicate`]) evaluated against the tracker's slot values.
//!
//! ## Example
//!
//! ```rust
//! use convoflow_rs::prelude::*;
//!
//! let catalog = FlowCatalog::new(vec![Flow::new(
//!     "greet",
//!     vec![
//!         FlowStep::user_message("start", "hello")
//!             .with_next(vec![FlowLink::always("respond")]),
//!         FlowStep::action("respond", "utter_hello"),
//!     ],
//! )]);
//!
//! let tracker = Tracker::new("conversation-1")
//!     .with_latest_action(ACTION_LISTEN)
//!     .with_message(Message::new("hi there").with_intent("hello"));
//! let domain = Domain::new(vec![], vec!["flow_greet".into(), "utter_hello".into()]);
//!
//! let executor = FlowExecutor::from_tracker(&tracker, &catalog).unwrap();
//! let next = executor.select_next_action(&tracker, &domain).unwrap();
//! assert_eq!(next.action_name.as_deref(), Some("flow_greet"));
//! ```

pub mod catalog;
pub mod detector;
pub mod domain;
pub mod executor;
pub mod policy;
pub mod predicate;
pub mod stack;
pub mod step;
pub mod tracker;

// ============================================================================
// RESERVED NAMES
// ============================================================================

/// Action name signalling "wait for the next user message".
pub const ACTION_LISTEN: &str = "action_listen";

/// Prefix of the action that starts a flow: `flow_` + flow id.
pub const FLOW_PREFIX: &str = "flow_";

/// Prefix of the action that asks a question: `question_` + slot name.
pub const QUESTION_PREFIX: &str = "question_";

/// Tracker slot persisting the current flow cursor.
pub const FLOW_STATE_SLOT: &str = "flow_state";

/// Tracker slot persisting the stack of paused caller frames.
pub const FLOW_STACK_SLOT: &str = "flow_stack";

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use catalog::{Flow, FlowCatalog};
pub use detector::{DetectorConfig, KeywordTopicDetector, SensitiveTopicDetector};
pub use domain::{Domain, Slot};
pub use executor::{FlowExecutor, MAX_LINK_DEPTH, NextAction};
pub use policy::{DEFAULT_POLICY_PRIORITY, FlowPolicy, PolicyConfig, PolicyPrediction};
pub use predicate::{PredicateEnv, PredicateError};
pub use stack::{FlowStack, FlowState, asked_question_slots};
pub use step::{FlowLink, FlowStep};
pub use tracker::{Entity, Intent, Message, SlotSet, Tracker};

/// Commonly used external types
pub use serde_json::Value as JsonValue;

/// Convenient re-exports for common types and traits
pub mod prelude {
    pub use crate::{
        ACTION_LISTEN, DetectorConfig, Domain, FLOW_PREFIX, FLOW_STACK_SLOT, FLOW_STATE_SLOT,
        Flow, FlowCatalog, FlowError, FlowExecutor, FlowLink, FlowPolicy, FlowResult, FlowStack,
        FlowState, FlowStep, KeywordTopicDetector, Message, NextAction, PolicyConfig,
        PolicyPrediction, QUESTION_PREFIX, SensitiveTopicDetector, Slot, SlotSet, Tracker,
    };

    pub use serde_json::Value as JsonValue;
}

// ============================================================================
// ERROR HANDLING
// ============================================================================

/// Result type alias for flow engine operations
pub type FlowResult<T> = Result<T, FlowError>;

/// Errors raised while interpreting flows. All variants are fatal to the
/// turn; the outer pipeline is expected to log and fall back to another
/// policy. A legitimate "no prediction" is not an error but an abstaining
/// [`NextAction`].
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    /// Persisted flow state or a flow definition failed to (de)serialize
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A sub-flow call names a flow the catalog does not contain
    #[error("Flow '{0}' is not part of the catalog")]
    MissingFlow(String),

    /// A referenced step id does not resolve within its flow
    #[error("Step '{step_id}' not found in flow '{flow_id}'")]
    MissingStep { flow_id: String, step_id: String },

    /// A flow definition has no resolvable start step
    #[error("Flow '{0}' has no start step")]
    EmptyFlow(String),

    /// A question step names a slot missing from the domain
    #[error("Question '{0}' does not map to an existing slot")]
    UnknownQuestionSlot(String),

    /// An action step carries no action name
    #[error("Action not specified for step '{0}'")]
    MissingAction(String),

    /// A step's links selected no target even though links are present
    #[error("No link was selected, but links are present. Links must cover all possible cases")]
    UncoveredLinks,

    /// The current step is incomplete and no handler is defined for it
    #[error("Not quite sure what to do here yet")]
    StateInconsistency,

    /// Tried to materialize something that is not a runnable step
    #[error("Unknown step type")]
    UnknownStepKind,

    /// Sub-flow links recursed past the safety limit
    #[error("Link cycle or depth exceeded (limit {0})")]
    LinkDepthExceeded(usize),

    /// A predicted action is not part of the domain
    #[error("Action '{0}' is not part of the domain")]
    UnknownAction(String),

    /// A link condition failed to parse or evaluate
    #[error(transparent)]
    Predicate(#[from] PredicateError),
}

// ============================================================================
// INTEGRATION TESTS
// ============================================================================
