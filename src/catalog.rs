//! # Flow Catalog
//!
//! An immutable, id-indexed store of [`Flow`] definitions. The catalog is
//! built once (programmatically or from JSON) and then shared read-only by
//! every turn; lookups never mutate and lookup misses return `None` rather
//! than erroring. The interpreter decides where a miss is fatal.

use crate::domain::Domain;
use crate::step::FlowStep;
use crate::{FlowError, FlowResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

/// A named directed step graph defining one conversational sub-procedure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub id: String,
    /// Designated start step. Defaults to the first listed step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_step_id: Option<String>,
    pub steps: Vec<FlowStep>,
}

impl Flow {
    pub fn new(id: impl Into<String>, steps: Vec<FlowStep>) -> Self {
        Self {
            id: id.into(),
            start_step_id: None,
            steps,
        }
    }

    /// Designate a start step other than the first listed one.
    pub fn with_start_step(mut self, step_id: impl Into<String>) -> Self {
        self.start_step_id = Some(step_id.into());
        self
    }

    /// The step the flow begins with, if any.
    pub fn start_step(&self) -> Option<&FlowStep> {
        match &self.start_step_id {
            Some(id) => self.step_by_id(id),
            None => self.steps.first(),
        }
    }

    /// Find a step by its id. Ids are unique only within one flow.
    pub fn step_by_id(&self, step_id: &str) -> Option<&FlowStep> {
        self.steps.iter().find(|step| step.id() == step_id)
    }

    /// Question slot names reachable from the start step without passing
    /// through `step_id`, in breadth-first visit order. Used by stack
    /// utilities to work out which slots a paused flow has already asked
    /// for.
    pub fn previously_asked_questions(&self, step_id: &str) -> Vec<String> {
        let mut questions = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = VecDeque::new();

        if let Some(start) = self.start_step() {
            queue.push_back(start.id().to_string());
        }

        while let Some(id) = queue.pop_front() {
            if id == step_id || !visited.insert(id.clone()) {
                continue;
            }
            let Some(step) = self.step_by_id(&id) else {
                continue;
            };
            if let FlowStep::Question { question, .. } = step {
                if !questions.contains(question) {
                    questions.push(question.clone());
                }
            }
            for link in step.next() {
                queue.push_back(link.target().to_string());
            }
        }

        questions
    }
}

/// All flows known to the dialogue system, indexed by flow id.
#[derive(Debug, Clone, Default)]
pub struct FlowCatalog {
    flows: Vec<Flow>,
    index: HashMap<String, usize>,
}

impl FlowCatalog {
    pub fn new(flows: Vec<Flow>) -> Self {
        let mut index = HashMap::with_capacity(flows.len());
        for (position, flow) in flows.iter().enumerate() {
            // first definition wins, matching catalog iteration order
            index.entry(flow.id.clone()).or_insert(position);
        }
        Self { flows, index }
    }

    /// Build a catalog from a JSON array of flow definitions.
    pub fn from_json(json: &str) -> FlowResult<Self> {
        Ok(Self::new(serde_json::from_str(json)?))
    }

    /// Build a catalog from an already parsed JSON value.
    pub fn from_json_value(value: serde_json::Value) -> FlowResult<Self> {
        Ok(Self::new(serde_json::from_value(value)?))
    }

    pub fn flow_by_id(&self, flow_id: &str) -> Option<&Flow> {
        self.index.get(flow_id).map(|&position| &self.flows[position])
    }

    /// Resolve a step id within the given flow.
    pub fn step_by_id(&self, step_id: &str, flow_id: &str) -> Option<&FlowStep> {
        self.flow_by_id(flow_id)?.step_by_id(step_id)
    }

    /// The start step of the given flow.
    pub fn first_step(&self, flow_id: &str) -> Option<&FlowStep> {
        self.flow_by_id(flow_id)?.start_step()
    }

    /// Flows in catalog order. Iteration order is the tie-break for
    /// trigger matching, so it is stable.
    pub fn iter(&self) -> std::slice::Iter<'_, Flow> {
        self.flows.iter()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Check the catalog against the configuration errors the interpreter
    /// would otherwise only hit mid-conversation: unresolvable start steps
    /// and link targets, questions without a domain slot, action steps
    /// without an action, and sub-flow calls to unknown flows.
    pub fn validate(&self, domain: &Domain) -> FlowResult<()> {
        for flow in &self.flows {
            if flow.start_step().is_none() {
                return Err(FlowError::EmptyFlow(flow.id.clone()));
            }
            for step in &flow.steps {
                match step {
                    FlowStep::Question { question, .. } => {
                        if domain.slot(question).is_none() {
                            return Err(FlowError::UnknownQuestionSlot(question.clone()));
                        }
                    }
                    FlowStep::Action { id, action, .. } => {
                        if action.is_empty() {
                            return Err(FlowError::MissingAction(id.clone()));
                        }
                    }
                    FlowStep::Link { link, .. } => {
                        if self.flow_by_id(link).is_none() {
                            return Err(FlowError::MissingFlow(link.clone()));
                        }
                    }
                    FlowStep::UserMessage { .. } => {}
                }
                for link in step.next() {
                    let target = link.target();
                    if flow.step_by_id(target).is_none() {
                        return Err(FlowError::MissingStep {
                            flow_id: flow.id.clone(),
                            step_id: target.to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}
