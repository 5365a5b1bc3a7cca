//! # Step Model - The Building Blocks of Flows
//!
//! A flow is a directed graph of typed steps. Each step carries a stable id
//! (unique within its flow), a variant describing what the dialogue system
//! does when the step is reached, and a set of outgoing [`FlowLink`]s that
//! decide where to go next.
//!
//! Steps and links are tagged serde enums so that flow definitions can be
//! written declaratively and round-tripped through JSON:
//!
//! ```json
//! {
//!   "type": "question",
//!   "id": "ask_size",
//!   "question": "size",
//!   "ephemeral": true,
//!   "next": [{ "type": "static", "target": "confirm" }]
//! }
//! ```
//!
//! Dispatch happens on the variant, not through trait objects, which keeps
//! the interpreter's state machine fully visible in one place.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One node in a flow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowStep {
    /// Triggering step: matches the latest user message against an intent
    /// and a required set of entity types. Only meaningful as a start step.
    UserMessage {
        id: String,
        intent: String,
        #[serde(default)]
        entities: Vec<String>,
        #[serde(default)]
        next: Vec<FlowLink>,
    },

    /// Asks the user for a value that fills the named slot.
    Question {
        id: String,
        question: String,
        #[serde(default)]
        ephemeral: bool,
        #[serde(default)]
        skip_if_filled: bool,
        #[serde(default)]
        next: Vec<FlowLink>,
    },

    /// Executes a named action.
    Action {
        id: String,
        action: String,
        #[serde(default)]
        next: Vec<FlowLink>,
    },

    /// Calls another flow by id. `next` is consulted only once the callee
    /// returns.
    Link {
        id: String,
        link: String,
        #[serde(default)]
        next: Vec<FlowLink>,
    },
}

/// An outgoing edge from a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowLink {
    /// Unconditional transition.
    Static { target: String },

    /// Taken when `condition` evaluates to true against the slot values.
    If { condition: String, target: String },

    /// Taken only when no `If` link matched.
    Else { target: String },
}

impl FlowStep {
    /// Create a user-message step with no required entities.
    pub fn user_message(id: impl Into<String>, intent: impl Into<String>) -> Self {
        FlowStep::UserMessage {
            id: id.into(),
            intent: intent.into(),
            entities: Vec::new(),
            next: Vec::new(),
        }
    }

    /// Create a question step for the given slot.
    pub fn question(id: impl Into<String>, question: impl Into<String>) -> Self {
        FlowStep::Question {
            id: id.into(),
            question: question.into(),
            ephemeral: false,
            skip_if_filled: false,
            next: Vec::new(),
        }
    }

    /// Create an action step.
    pub fn action(id: impl Into<String>, action: impl Into<String>) -> Self {
        FlowStep::Action {
            id: id.into(),
            action: action.into(),
            next: Vec::new(),
        }
    }

    /// Create a link step calling the flow with the given id.
    pub fn link(id: impl Into<String>, flow_id: impl Into<String>) -> Self {
        FlowStep::Link {
            id: id.into(),
            link: flow_id.into(),
            next: Vec::new(),
        }
    }

    /// Replace the outgoing links of this step.
    pub fn with_next(mut self, links: Vec<FlowLink>) -> Self {
        match &mut self {
            FlowStep::UserMessage { next, .. }
            | FlowStep::Question { next, .. }
            | FlowStep::Action { next, .. }
            | FlowStep::Link { next, .. } => *next = links,
        }
        self
    }

    /// Require the given entity types for triggering. No effect on variants
    /// other than [`FlowStep::UserMessage`].
    pub fn with_entities(mut self, required: Vec<String>) -> Self {
        if let FlowStep::UserMessage { entities, .. } = &mut self {
            *entities = required;
        }
        self
    }

    /// Mark a question slot as ephemeral, resetting it to its initial value
    /// when the flow finishes. No effect on other variants.
    pub fn with_ephemeral(mut self) -> Self {
        if let FlowStep::Question { ephemeral, .. } = &mut self {
            *ephemeral = true;
        }
        self
    }

    /// Mark a question as skippable when its slot is already filled. No
    /// effect on other variants.
    pub fn with_skip_if_filled(mut self) -> Self {
        if let FlowStep::Question { skip_if_filled, .. } = &mut self {
            *skip_if_filled = true;
        }
        self
    }

    /// The id of this step, stable within its flow.
    pub fn id(&self) -> &str {
        match self {
            FlowStep::UserMessage { id, .. }
            | FlowStep::Question { id, .. }
            | FlowStep::Action { id, .. }
            | FlowStep::Link { id, .. } => id,
        }
    }

    /// The outgoing links of this step.
    pub fn next(&self) -> &[FlowLink] {
        match self {
            FlowStep::UserMessage { next, .. }
            | FlowStep::Question { next, .. }
            | FlowStep::Action { next, .. }
            | FlowStep::Link { next, .. } => next,
        }
    }

    /// True iff the step has any outgoing link.
    pub fn has_next(&self) -> bool {
        !self.next().is_empty()
    }

    /// Whether the latest user message triggers this step. Only
    /// user-message steps can trigger; the intent must match and every
    /// required entity type must appear among the observed ones.
    pub fn is_triggered(&self, intent: Option<&str>, entity_types: &[&str]) -> bool {
        match self {
            FlowStep::UserMessage {
                intent: expected,
                entities,
                ..
            } => {
                intent == Some(expected.as_str())
                    && entities
                        .iter()
                        .all(|required| entity_types.contains(&required.as_str()))
            }
            _ => false,
        }
    }
}

impl fmt::Display for FlowStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowStep::UserMessage { id, intent, .. } => {
                write!(f, "user_message({id}, intent={intent})")
            }
            FlowStep::Question { id, question, .. } => write!(f, "question({id}, slot={question})"),
            FlowStep::Action { id, action, .. } => write!(f, "action({id}, {action})"),
            FlowStep::Link { id, link, .. } => write!(f, "link({id}, flow={link})"),
        }
    }
}

impl FlowLink {
    /// Unconditional link to the given step id.
    pub fn always(target: impl Into<String>) -> Self {
        FlowLink::Static {
            target: target.into(),
        }
    }

    /// Conditional link, taken when the predicate holds.
    pub fn when(condition: impl Into<String>, target: impl Into<String>) -> Self {
        FlowLink::If {
            condition: condition.into(),
            target: target.into(),
        }
    }

    /// Fallback link, taken when no conditional link matched.
    pub fn otherwise(target: impl Into<String>) -> Self {
        FlowLink::Else {
            target: target.into(),
        }
    }

    /// The step id this link points at.
    pub fn target(&self) -> &str {
        match self {
            FlowLink::Static { target }
            | FlowLink::If { target, .. }
            | FlowLink::Else { target } => target,
        }
    }
}
