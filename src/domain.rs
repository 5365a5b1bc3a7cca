//! # Domain
//!
//! Static knowledge about the assistant: every slot the conversation can
//! hold (with its initial value) and the ordered list of actions the outer
//! pipeline can execute. The action order defines the layout of prediction
//! probability vectors.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A slot definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slot {
    pub name: String,
    #[serde(default)]
    pub initial_value: Value,
}

impl Slot {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            initial_value: Value::Null,
        }
    }

    pub fn with_initial_value(mut self, value: Value) -> Self {
        self.initial_value = value;
        self
    }
}

/// Slots and actions known to the assistant. Immutable after construction
/// and safely shared across concurrent turns.
#[derive(Debug, Clone, Default)]
pub struct Domain {
    slots: Vec<Slot>,
    actions: Vec<String>,
    action_index: HashMap<String, usize>,
}

impl Domain {
    pub fn new(slots: Vec<Slot>, actions: Vec<String>) -> Self {
        let mut action_index = HashMap::with_capacity(actions.len());
        for (index, action) in actions.iter().enumerate() {
            action_index.entry(action.clone()).or_insert(index);
        }
        Self {
            slots,
            actions,
            action_index,
        }
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn slot(&self, name: &str) -> Option<&Slot> {
        self.slots.iter().find(|slot| slot.name == name)
    }

    /// Initial value of the named slot, `null` when the slot is unknown.
    pub fn initial_value(&self, name: &str) -> Value {
        self.slot(name)
            .map(|slot| slot.initial_value.clone())
            .unwrap_or(Value::Null)
    }

    pub fn actions(&self) -> &[String] {
        &self.actions
    }

    /// Position of an action in the probability vector.
    pub fn index_for_action(&self, name: &str) -> Option<usize> {
        self.action_index.get(name).copied()
    }

    /// All-zero probability vector, one entry per action.
    pub fn default_action_probabilities(&self) -> Vec<f64> {
        vec![0.0; self.actions.len()]
    }
}
