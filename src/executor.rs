//! # Flow Interpreter
//!
//! The per-turn virtual machine over the step graphs in a
//! [`FlowCatalog`]. An executor is rebuilt from persisted tracker state at
//! the start of every turn, advances the conversation by exactly one step,
//! and hands back the action to run together with the slot mutations that
//! record the new cursor and call stack.
//!
//! ## Per-turn decision procedure
//!
//! 1. **Idle**: no flow is active. If the latest user message triggers a
//!    flow, predict that flow's trigger action; otherwise abstain.
//! 2. **Cold start**: a flow was just started (cursor has no step yet).
//!    The effective first step is the start step, except that a
//!    user-message start step is skipped through its links.
//! 3. **Awaiting fill**: the current step exists but is not completed.
//!    This is a hard error today.
//! 4. **Advance**: the current step is completed; its links choose the
//!    next step.
//! 5. A next step materializes into an action plus events. No next step
//!    means the flow finished: ephemeral question slots are reset and the
//!    conversation either returns to the caller frame on the stack or, if
//!    the stack is empty, listens for the next user message.
//!
//! Sub-flow calls go through the executor recursively: a link step pushes
//! the caller's cursor onto the persisted stack and immediately asks the
//! callee for its first action within the same turn. Recursion is bounded
//! by [`MAX_LINK_DEPTH`] to defend against link cycles in malformed
//! catalogs.
//!
//! Every decision is a pure function of (tracker snapshot, domain,
//! catalog): the executor performs no I/O, never blocks, and never mutates
//! the tracker. Callers must apply the returned events in order, since
//! later events overwrite earlier writes to the same slot.

use crate::catalog::{Flow, FlowCatalog};
use crate::domain::Domain;
use crate::predicate;
use crate::stack::{FlowStack, FlowState};
use crate::step::{FlowLink, FlowStep};
use crate::tracker::{SlotSet, Tracker};
use crate::{
    ACTION_LISTEN, FLOW_PREFIX, FLOW_STACK_SLOT, FLOW_STATE_SLOT, FlowError, FlowResult,
    QUESTION_PREFIX,
};
use serde_json::Value;
use tracing::debug;

/// Upper bound on link expansions within a single turn.
pub const MAX_LINK_DEPTH: usize = 32;

/// Outcome of one turn: the action to execute (if any), the slot
/// mutations to apply in order, and the prediction confidence.
#[derive(Debug, Clone, PartialEq)]
pub struct NextAction {
    pub action_name: Option<String>,
    pub events: Vec<SlotSet>,
    pub score: f64,
}

impl NextAction {
    fn predicted(action_name: Option<String>, events: Vec<SlotSet>) -> Self {
        Self {
            action_name,
            events,
            score: 1.0,
        }
    }

    /// The legitimate "no prediction" outcome.
    fn abstain() -> Self {
        Self {
            action_name: None,
            events: Vec::new(),
            score: 0.0,
        }
    }
}

/// Interprets flows against one tracker snapshot.
pub struct FlowExecutor<'f> {
    flow_state: Option<FlowState>,
    flows: &'f FlowCatalog,
}

impl<'f> FlowExecutor<'f> {
    pub fn new(flow_state: Option<FlowState>, flows: &'f FlowCatalog) -> Self {
        Self { flow_state, flows }
    }

    /// Rebuild the executor from the cursor persisted in the tracker. A
    /// missing or `null` cursor yields an idle executor.
    pub fn from_tracker(tracker: &Tracker, flows: &'f FlowCatalog) -> FlowResult<Self> {
        let flow_state = match tracker.get_slot(FLOW_STATE_SLOT) {
            Some(value) => Some(serde_json::from_value(value.clone())?),
            None => None,
        };
        Ok(Self::new(flow_state, flows))
    }

    pub fn flow_state(&self) -> Option<&FlowState> {
        self.flow_state.as_ref()
    }

    /// Find a flow the latest user message can start: the first flow in
    /// catalog order whose start step is a triggered user-message step.
    pub fn find_startable_flow(&self, tracker: &Tracker) -> Option<&'f Flow> {
        let message = tracker.latest_message.as_ref()?;
        let intent = message.intent.as_ref().map(|intent| intent.name.as_str());
        let entity_types: Vec<&str> = message
            .entities
            .iter()
            .map(|entity| entity.entity_type.as_str())
            .collect();

        self.flows.iter().find(|flow| {
            flow.start_step()
                .is_some_and(|step| step.is_triggered(intent, &entity_types))
        })
    }

    /// Decide the single action for this turn.
    pub fn select_next_action(&self, tracker: &Tracker, domain: &Domain) -> FlowResult<NextAction> {
        self.select_with_depth(tracker, domain, 0)
    }

    fn select_with_depth(
        &self,
        tracker: &Tracker,
        domain: &Domain,
        depth: usize,
    ) -> FlowResult<NextAction> {
        if depth > MAX_LINK_DEPTH {
            return Err(FlowError::LinkDepthExceeded(MAX_LINK_DEPTH));
        }

        let Some((state, current_flow)) = self.current_flow() else {
            if let Some(flow) = self.find_startable_flow(tracker) {
                debug!(flow_id = %flow.id, "found startable flow");
                return Ok(NextAction::predicted(
                    Some(format!("{FLOW_PREFIX}{}", flow.id)),
                    Vec::new(),
                ));
            }
            debug!("no startable flow found, skipping prediction");
            return Ok(NextAction::abstain());
        };

        let current_step = state
            .step_id
            .as_deref()
            .and_then(|step_id| current_flow.step_by_id(step_id));

        let next_step = match current_step {
            // the flow was just started; move to its effective first step
            None => self.starting_step(current_flow, tracker, domain)?,
            Some(step) if !Self::is_step_completed(step, tracker) => {
                return Err(FlowError::StateInconsistency);
            }
            Some(step) => self.next_step(step, &state.flow_id, tracker, domain)?,
        };

        if next_step.is_some() {
            let (action_name, events) =
                self.action_for_next_step(next_step, state, tracker, domain, depth)?;
            return Ok(NextAction::predicted(action_name, events));
        }

        // the current flow is finished; clean up and unwind
        let mut events = Self::reset_ephemeral_slots(current_flow, domain);

        let mut stack = FlowStack::from_tracker(tracker)?;
        let Some(caller) = stack.pop() else {
            events.push(SlotSet::new(FLOW_STATE_SLOT, Value::Null));
            return Ok(NextAction::predicted(
                Some(ACTION_LISTEN.to_string()),
                events,
            ));
        };

        let caller_step = caller
            .step_id
            .as_deref()
            .and_then(|step_id| self.flows.step_by_id(step_id, &caller.flow_id))
            .ok_or_else(|| FlowError::MissingStep {
                flow_id: caller.flow_id.clone(),
                step_id: caller.step_id.clone().unwrap_or_default(),
            })?;

        let next = self.next_step(caller_step, &caller.flow_id, tracker, domain)?;
        let (action_name, action_events) =
            self.action_for_next_step(next, state, tracker, domain, depth)?;
        let resumed = FlowState {
            flow_id: caller.flow_id.clone(),
            step_id: next.map(|step| step.id().to_string()),
        };

        events.extend(action_events);
        events.push(SlotSet::new(FLOW_STACK_SLOT, stack.as_value()));
        events.push(SlotSet::new(FLOW_STATE_SLOT, resumed.as_value()));
        Ok(NextAction::predicted(action_name, events))
    }

    fn current_flow(&self) -> Option<(&FlowState, &'f Flow)> {
        let state = self.flow_state.as_ref()?;
        let flow = self.flows.flow_by_id(&state.flow_id)?;
        Some((state, flow))
    }

    /// Effective first step of a just-started flow. A user-message start
    /// step already happened (it triggered the flow), so it is skipped
    /// through its links.
    fn starting_step(
        &self,
        flow: &'f Flow,
        tracker: &Tracker,
        domain: &Domain,
    ) -> FlowResult<Option<&'f FlowStep>> {
        let Some(first) = flow.start_step() else {
            return Ok(None);
        };
        match first {
            FlowStep::UserMessage { .. } => self.next_step(first, &flow.id, tracker, domain),
            _ => Ok(Some(first)),
        }
    }

    fn next_step(
        &self,
        step: &FlowStep,
        flow_id: &str,
        tracker: &Tracker,
        domain: &Domain,
    ) -> FlowResult<Option<&'f FlowStep>> {
        match Self::evaluate_links(step.next(), tracker, domain)? {
            Some(target) => Ok(self.flows.step_by_id(target, flow_id)),
            None => Ok(None),
        }
    }

    /// Pick the target of a step's link set: a single static link wins
    /// outright, otherwise the first satisfied conditional link, otherwise
    /// the first fallback link. A non-empty link set that selects nothing
    /// is a configuration error; an empty one means the flow is done.
    fn evaluate_links<'a>(
        links: &'a [FlowLink],
        tracker: &Tracker,
        domain: &Domain,
    ) -> FlowResult<Option<&'a str>> {
        if let [FlowLink::Static { target }] = links {
            return Ok(Some(target));
        }

        for link in links {
            if let FlowLink::If { condition, target } = link {
                if !condition.is_empty() && Self::is_condition_satisfied(condition, tracker, domain)?
                {
                    return Ok(Some(target));
                }
            }
        }

        for link in links {
            if let FlowLink::Else { target } = link {
                return Ok(Some(target));
            }
        }

        if links.is_empty() {
            Ok(None)
        } else {
            Err(FlowError::UncoveredLinks)
        }
    }

    fn is_condition_satisfied(
        condition: &str,
        tracker: &Tracker,
        domain: &Domain,
    ) -> FlowResult<bool> {
        let env = predicate::slot_env(tracker, domain);
        Ok(predicate::evaluate(condition, &env)?)
    }

    /// Whether the conversation can move past the given step. Questions
    /// complete once their slot holds a value; link steps complete only
    /// when the callee returns and pops the stack.
    fn is_step_completed(step: &FlowStep, tracker: &Tracker) -> bool {
        match step {
            FlowStep::Question { question, .. } => tracker.get_slot(question).is_some(),
            FlowStep::Link { .. } => false,
            _ => true,
        }
    }

    /// Events resetting every ephemeral question slot of a finished flow
    /// back to its initial value.
    fn reset_ephemeral_slots(flow: &Flow, domain: &Domain) -> Vec<SlotSet> {
        let mut events = Vec::new();
        for step in &flow.steps {
            if let FlowStep::Question {
                question,
                ephemeral: true,
                ..
            } = step
            {
                events.push(SlotSet::new(question.clone(), domain.initial_value(question)));
            }
        }
        events
    }

    /// Turn the chosen step into an action name plus events. The cursor
    /// update is emitted relative to `state`; when unwinding to a caller
    /// frame the caller appends a corrected cursor event afterwards.
    fn action_for_next_step(
        &self,
        next_step: Option<&FlowStep>,
        state: &FlowState,
        tracker: &Tracker,
        domain: &Domain,
        depth: usize,
    ) -> FlowResult<(Option<String>, Vec<SlotSet>)> {
        let Some(step) = next_step else {
            return Err(FlowError::UnknownStepKind);
        };
        let mut events = Vec::new();

        match step {
            FlowStep::Question {
                id,
                question,
                skip_if_filled,
                ..
            } => {
                let initial = domain.initial_value(question);
                let current = tracker.get_slot(question).cloned().unwrap_or(Value::Null);
                if *skip_if_filled {
                    // TODO: a filled question should advance to the
                    //  following step instead of being asked again; forms
                    //  currently paper over this
                } else if current != initial {
                    events.push(SlotSet::new(question.clone(), initial));
                }
                events.push(SlotSet::new(
                    FLOW_STATE_SLOT,
                    state.with_updated_id(id).as_value(),
                ));
                Ok((Some(format!("{QUESTION_PREFIX}{question}")), events))
            }
            FlowStep::Action { id, action, .. } => {
                if action.is_empty() {
                    return Err(FlowError::MissingAction(id.clone()));
                }
                events.push(SlotSet::new(
                    FLOW_STATE_SLOT,
                    state.with_updated_id(id).as_value(),
                ));
                Ok((Some(action.clone()), events))
            }
            FlowStep::Link { id, link, .. } => {
                let mut stack = FlowStack::from_tracker(tracker)?;
                stack.push(state.with_updated_id(id));
                events.push(SlotSet::new(FLOW_STACK_SLOT, stack.as_value()));

                let callee = FlowExecutor::new(Some(FlowState::new(link.clone())), self.flows);
                let sub = callee.select_with_depth(tracker, domain, depth + 1)?;
                events.extend(sub.events);
                Ok((sub.action_name, events))
            }
            FlowStep::UserMessage { .. } => Err(FlowError::UnknownStepKind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Slot;
    use crate::tracker::Message;
    use serde_json::json;

    fn greet_catalog() -> FlowCatalog {
        FlowCatalog::new(vec![Flow::new(
            "greet",
            vec![
                FlowStep::user_message("start", "hello")
                    .with_next(vec![FlowLink::always("s1")]),
                FlowStep::action("s1", "utter_hello"),
            ],
        )])
    }

    fn domain_with(slots: Vec<Slot>) -> Domain {
        Domain::new(slots, Vec::new())
    }

    #[test]
    fn test_idle_turn_triggers_matching_flow() {
        let catalog = greet_catalog();
        let tracker = Tracker::new("t")
            .with_latest_action(ACTION_LISTEN)
            .with_message(Message::new("hi").with_intent("hello"));

        let executor = FlowExecutor::from_tracker(&tracker, &catalog).unwrap();
        let next = executor
            .select_next_action(&tracker, &domain_with(vec![]))
            .unwrap();

        assert_eq!(next.action_name.as_deref(), Some("flow_greet"));
        assert!(next.events.is_empty());
        assert_eq!(next.score, 1.0);
    }

    #[test]
    fn test_idle_turn_abstains_without_match() {
        let catalog = greet_catalog();
        let no_message = Tracker::new("t");
        let executor = FlowExecutor::from_tracker(&no_message, &catalog).unwrap();
        let next = executor
            .select_next_action(&no_message, &domain_with(vec![]))
            .unwrap();
        assert_eq!(next, NextAction::abstain());

        let wrong_intent = Tracker::new("t").with_message(Message::new("hm").with_intent("bye"));
        let executor = FlowExecutor::from_tracker(&wrong_intent, &catalog).unwrap();
        let next = executor
            .select_next_action(&wrong_intent, &domain_with(vec![]))
            .unwrap();
        assert_eq!(next.score, 0.0);
        assert!(next.action_name.is_none());
    }

    #[test]
    fn test_cold_start_skips_user_message_step() {
        let catalog = greet_catalog();
        let tracker =
            Tracker::new("t").with_slot(FLOW_STATE_SLOT, FlowState::new("greet").as_value());

        let executor = FlowExecutor::from_tracker(&tracker, &catalog).unwrap();
        let next = executor
            .select_next_action(&tracker, &domain_with(vec![]))
            .unwrap();

        assert_eq!(next.action_name.as_deref(), Some("utter_hello"));
        assert_eq!(
            next.events,
            vec![SlotSet::new(
                FLOW_STATE_SLOT,
                FlowState::at_step("greet", "s1").as_value()
            )]
        );
    }

    #[test]
    fn test_awaiting_unfilled_question_is_an_error() {
        let catalog = FlowCatalog::new(vec![Flow::new(
            "order",
            vec![FlowStep::question("ask_size", "size")],
        )]);
        let tracker = Tracker::new("t").with_slot(
            FLOW_STATE_SLOT,
            FlowState::at_step("order", "ask_size").as_value(),
        );

        let executor = FlowExecutor::from_tracker(&tracker, &catalog).unwrap();
        let result = executor.select_next_action(&tracker, &domain_with(vec![Slot::new("size")]));
        assert!(matches!(result, Err(FlowError::StateInconsistency)));
    }

    #[test]
    fn test_conditional_branching() {
        let catalog = FlowCatalog::new(vec![Flow::new(
            "age_gate",
            vec![
                FlowStep::action("check", "utter_checking").with_next(vec![
                    FlowLink::when("age > 18", "adult"),
                    FlowLink::otherwise("minor"),
                ]),
                FlowStep::action("adult", "utter_adult"),
                FlowStep::action("minor", "utter_minor"),
            ],
        )]);
        let domain = domain_with(vec![Slot::new("age")]);

        let tracker = Tracker::new("t")
            .with_slot(FLOW_STATE_SLOT, FlowState::at_step("age_gate", "check").as_value())
            .with_slot("age", json!(21));
        let executor = FlowExecutor::from_tracker(&tracker, &catalog).unwrap();
        let next = executor.select_next_action(&tracker, &domain).unwrap();
        assert_eq!(next.action_name.as_deref(), Some("utter_adult"));

        let tracker = Tracker::new("t")
            .with_slot(FLOW_STATE_SLOT, FlowState::at_step("age_gate", "check").as_value())
            .with_slot("age", json!(12));
        let executor = FlowExecutor::from_tracker(&tracker, &catalog).unwrap();
        let next = executor.select_next_action(&tracker, &domain).unwrap();
        assert_eq!(next.action_name.as_deref(), Some("utter_minor"));
    }

    #[test]
    fn test_uncovered_links_raise() {
        let catalog = FlowCatalog::new(vec![Flow::new(
            "partial",
            vec![
                FlowStep::action("check", "utter_checking")
                    .with_next(vec![FlowLink::when("age > 18", "adult")]),
                FlowStep::action("adult", "utter_adult"),
            ],
        )]);
        let tracker = Tracker::new("t")
            .with_slot(FLOW_STATE_SLOT, FlowState::at_step("partial", "check").as_value())
            .with_slot("age", json!(12));

        let executor = FlowExecutor::from_tracker(&tracker, &catalog).unwrap();
        let result =
            executor.select_next_action(&tracker, &domain_with(vec![Slot::new("age")]));
        assert!(matches!(result, Err(FlowError::UncoveredLinks)));
    }

    #[test]
    fn test_question_emits_reset_for_prefilled_slot() {
        let catalog = FlowCatalog::new(vec![Flow::new(
            "order",
            vec![
                FlowStep::action("intro", "utter_intro")
                    .with_next(vec![FlowLink::always("ask_size")]),
                FlowStep::question("ask_size", "size"),
            ],
        )]);
        let domain = domain_with(vec![Slot::new("size")]);
        let tracker = Tracker::new("t")
            .with_slot(FLOW_STATE_SLOT, FlowState::at_step("order", "intro").as_value())
            .with_slot("size", json!("L"));

        let executor = FlowExecutor::from_tracker(&tracker, &catalog).unwrap();
        let next = executor.select_next_action(&tracker, &domain).unwrap();

        assert_eq!(next.action_name.as_deref(), Some("question_size"));
        assert_eq!(
            next.events,
            vec![
                SlotSet::new("size", Value::Null),
                SlotSet::new(
                    FLOW_STATE_SLOT,
                    FlowState::at_step("order", "ask_size").as_value()
                ),
            ]
        );
    }

    #[test]
    fn test_skip_if_filled_question_is_still_asked() {
        let catalog = FlowCatalog::new(vec![Flow::new(
            "order",
            vec![
                FlowStep::action("intro", "utter_intro")
                    .with_next(vec![FlowLink::always("ask_size")]),
                FlowStep::question("ask_size", "size").with_skip_if_filled(),
            ],
        )]);
        let domain = domain_with(vec![Slot::new("size")]);
        let tracker = Tracker::new("t")
            .with_slot(FLOW_STATE_SLOT, FlowState::at_step("order", "intro").as_value())
            .with_slot("size", json!("L"));

        let executor = FlowExecutor::from_tracker(&tracker, &catalog).unwrap();
        let next = executor.select_next_action(&tracker, &domain).unwrap();

        // the question is asked anyway, but the filled slot is left alone
        assert_eq!(next.action_name.as_deref(), Some("question_size"));
        assert_eq!(
            next.events,
            vec![SlotSet::new(
                FLOW_STATE_SLOT,
                FlowState::at_step("order", "ask_size").as_value()
            )]
        );
    }

    #[test]
    fn test_finished_flow_resets_ephemeral_slots_and_listens() {
        let catalog = FlowCatalog::new(vec![Flow::new(
            "order",
            vec![FlowStep::question("ask_size", "size").with_ephemeral()],
        )]);
        let domain = domain_with(vec![Slot::new("size")]);
        let tracker = Tracker::new("t")
            .with_slot(FLOW_STATE_SLOT, FlowState::at_step("order", "ask_size").as_value())
            .with_slot("size", json!("L"));

        let executor = FlowExecutor::from_tracker(&tracker, &catalog).unwrap();
        let next = executor.select_next_action(&tracker, &domain).unwrap();

        assert_eq!(next.action_name.as_deref(), Some(ACTION_LISTEN));
        assert_eq!(
            next.events,
            vec![
                SlotSet::new("size", Value::Null),
                SlotSet::new(FLOW_STATE_SLOT, Value::Null),
            ]
        );
        assert_eq!(next.score, 1.0);
    }

    #[test]
    fn test_empty_action_step_is_an_error() {
        let catalog = FlowCatalog::new(vec![Flow::new(
            "broken",
            vec![FlowStep::action("noop", "")],
        )]);
        let tracker =
            Tracker::new("t").with_slot(FLOW_STATE_SLOT, FlowState::new("broken").as_value());

        let executor = FlowExecutor::from_tracker(&tracker, &catalog).unwrap();
        let result = executor.select_next_action(&tracker, &domain_with(vec![]));
        assert!(matches!(result, Err(FlowError::MissingAction(id)) if id == "noop"));
    }

    #[test]
    fn test_link_cycle_hits_depth_limit() {
        let catalog = FlowCatalog::new(vec![Flow::new(
            "loops",
            vec![FlowStep::link("again", "loops")],
        )]);
        let tracker =
            Tracker::new("t").with_slot(FLOW_STATE_SLOT, FlowState::new("loops").as_value());

        let executor = FlowExecutor::from_tracker(&tracker, &catalog).unwrap();
        let result = executor.select_next_action(&tracker, &domain_with(vec![]));
        assert!(matches!(
            result,
            Err(FlowError::LinkDepthExceeded(MAX_LINK_DEPTH))
        ));
    }

    #[test]
    fn test_unknown_flow_in_state_falls_back_to_triggering() {
        // a cursor pointing at a flow the catalog no longer contains is
        // treated like the idle phase
        let catalog = greet_catalog();
        let tracker = Tracker::new("t")
            .with_slot(FLOW_STATE_SLOT, FlowState::new("retired").as_value())
            .with_message(Message::new("hi").with_intent("hello"));

        let executor = FlowExecutor::from_tracker(&tracker, &catalog).unwrap();
        let next = executor
            .select_next_action(&tracker, &domain_with(vec![]))
            .unwrap();
        assert_eq!(next.action_name.as_deref(), Some("flow_greet"));
    }

    #[test]
    fn test_corrupt_flow_state_slot_is_an_error() {
        let catalog = greet_catalog();
        let tracker = Tracker::new("t").with_slot(FLOW_STATE_SLOT, json!(["nonsense"]));
        let result = FlowExecutor::from_tracker(&tracker, &catalog);
        assert!(matches!(result, Err(FlowError::Serialization(_))));
    }

    #[test]
    fn test_determinism() {
        let catalog = greet_catalog();
        let tracker =
            Tracker::new("t").with_slot(FLOW_STATE_SLOT, FlowState::new("greet").as_value());
        let domain = domain_with(vec![]);

        let executor = FlowExecutor::from_tracker(&tracker, &catalog).unwrap();
        let first = executor.select_next_action(&tracker, &domain).unwrap();
        let second = executor.select_next_action(&tracker, &domain).unwrap();
        assert_eq!(first, second);
    }
}
