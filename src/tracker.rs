//! # Conversation Tracker
//!
//! The per-conversation state snapshot the engine reads from: current slot
//! values, the latest executed action, the latest user message and any
//! active loop. The interpreter never writes to a tracker; every intended
//! mutation is expressed as a [`SlotSet`] event returned to the outer
//! pipeline, which applies events in order and persists the result.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// The recognized intent of a user message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub name: String,
}

/// An entity extracted from a user message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(default)]
    pub value: Option<Value>,
}

/// The latest user message as produced by the NLU pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub text: String,
    #[serde(default)]
    pub intent: Option<Intent>,
    #[serde(default)]
    pub entities: Vec<Entity>,
}

impl Message {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            intent: None,
            entities: Vec::new(),
        }
    }

    pub fn with_intent(mut self, name: impl Into<String>) -> Self {
        self.intent = Some(Intent { name: name.into() });
        self
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>) -> Self {
        self.entities.push(Entity {
            entity_type: entity_type.into(),
            value: None,
        });
        self
    }
}

/// A slot mutation emitted by the engine: set `slot` to `value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotSet {
    pub slot: String,
    pub value: Value,
}

impl SlotSet {
    pub fn new(slot: impl Into<String>, value: Value) -> Self {
        Self {
            slot: slot.into(),
            value,
        }
    }
}

/// Read-only conversation snapshot.
#[derive(Debug, Clone)]
pub struct Tracker {
    pub sender_id: String,
    pub latest_action_name: Option<String>,
    pub latest_message: Option<Message>,
    pub active_loop: Option<String>,
    slots: HashMap<String, Value>,
}

impl Tracker {
    pub fn new(sender_id: impl Into<String>) -> Self {
        Self {
            sender_id: sender_id.into(),
            latest_action_name: None,
            latest_message: None,
            active_loop: None,
            slots: HashMap::new(),
        }
    }

    /// Current value of a slot. A stored `null` counts as unset.
    pub fn get_slot(&self, name: &str) -> Option<&Value> {
        self.slots.get(name).filter(|value| !value.is_null())
    }

    pub fn set_slot(&mut self, name: impl Into<String>, value: Value) {
        self.slots.insert(name.into(), value);
    }

    /// Apply emitted events in order. Order matters: later writes to the
    /// same slot win.
    pub fn apply(&mut self, events: &[SlotSet]) {
        for event in events {
            self.set_slot(event.slot.clone(), event.value.clone());
        }
    }

    pub fn slots(&self) -> &HashMap<String, Value> {
        &self.slots
    }

    pub fn with_latest_action(mut self, action: impl Into<String>) -> Self {
        self.latest_action_name = Some(action.into());
        self
    }

    pub fn with_message(mut self, message: Message) -> Self {
        self.latest_message = Some(message);
        self
    }

    pub fn with_active_loop(mut self, loop_name: impl Into<String>) -> Self {
        self.active_loop = Some(loop_name.into());
        self
    }

    pub fn with_slot(mut self, name: impl Into<String>, value: Value) -> Self {
        self.set_slot(name, value);
        self
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }
}
