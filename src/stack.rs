//! # Frames and the Flow Stack
//!
//! A [`FlowState`] is the cursor of the currently executing flow: which
//! flow, and which step within it. When a flow calls another flow, the
//! caller's cursor is pushed onto a [`FlowStack`] and popped again when the
//! callee finishes.
//!
//! Neither type holds references into the catalog; frames carry only ids
//! and all resolution goes back through [`crate::FlowCatalog`]. Both
//! serialize into dedicated tracker slots between turns, so every turn is
//! resumable from persisted state alone. The wire layout is pinned:
//! `{"flow_id": <string>, "step_id": <string|null>}` per frame, and an
//! array of frames (top last) for the stack.

use crate::catalog::FlowCatalog;
use crate::tracker::Tracker;
use crate::{FLOW_STACK_SLOT, FlowResult};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashSet;

/// The `(flow_id, step_id)` cursor identifying where a conversation is
/// within its flows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowState {
    pub flow_id: String,
    #[serde(default)]
    pub step_id: Option<String>,
}

impl FlowState {
    /// Cursor for a flow that was started but has not reached a step yet.
    pub fn new(flow_id: impl Into<String>) -> Self {
        Self {
            flow_id: flow_id.into(),
            step_id: None,
        }
    }

    /// Cursor pointing at a concrete step.
    pub fn at_step(flow_id: impl Into<String>, step_id: impl Into<String>) -> Self {
        Self {
            flow_id: flow_id.into(),
            step_id: Some(step_id.into()),
        }
    }

    /// Copy of this cursor moved to the given step.
    pub fn with_updated_id(&self, step_id: &str) -> Self {
        Self {
            flow_id: self.flow_id.clone(),
            step_id: Some(step_id.to_string()),
        }
    }

    /// The persisted slot representation of this cursor.
    pub fn as_value(&self) -> Value {
        json!({ "flow_id": self.flow_id, "step_id": self.step_id })
    }
}

/// Ordered sequence of paused caller frames, top of stack last.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowStack {
    frames: Vec<FlowState>,
}

impl FlowStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the stack from a persisted slot value. Absent and `null`
    /// both mean the empty stack.
    pub fn from_slot(value: Option<&Value>) -> FlowResult<Self> {
        match value {
            None | Some(Value::Null) => Ok(Self::new()),
            Some(value) => Ok(serde_json::from_value(value.clone())?),
        }
    }

    /// Read the stack from the tracker's dedicated slot.
    pub fn from_tracker(tracker: &Tracker) -> FlowResult<Self> {
        Self::from_slot(tracker.get_slot(FLOW_STACK_SLOT))
    }

    pub fn push(&mut self, frame: FlowState) {
        self.frames.push(frame);
    }

    pub fn pop(&mut self) -> Option<FlowState> {
        self.frames.pop()
    }

    pub fn peek(&self) -> Option<&FlowState> {
        self.frames.last()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn frames(&self) -> &[FlowState] {
        &self.frames
    }

    /// The persisted slot representation of this stack.
    pub fn as_value(&self) -> Value {
        Value::Array(self.frames.iter().map(FlowState::as_value).collect())
    }
}

/// Question slots the conversation has already passed on its way to the
/// current cursor, across the active flow and every paused caller.
///
/// Ancillary helper for components that want to avoid re-asking filled
/// questions; the interpreter itself does not consult it.
pub fn asked_question_slots(
    state: Option<&FlowState>,
    stack: &FlowStack,
    catalog: &FlowCatalog,
) -> HashSet<String> {
    let mut asked = HashSet::new();

    let frames = state
        .into_iter()
        .chain(stack.frames.iter().rev());
    for frame in frames {
        let Some(step_id) = frame.step_id.as_deref() else {
            continue;
        };
        let Some(flow) = catalog.flow_by_id(&frame.flow_id) else {
            continue;
        };
        asked.extend(flow.previously_asked_questions(step_id));
    }

    asked
}
