use crate::external::{ExternalDataLinker, ExternalRequirement};
use crate::nodes::{ConditionNode, EvaluatorNode, NodeMemory, TaskNode};
use anyhow::{anyhow, bail, Result};
use smallvec::SmallVec;
use std::sync::Arc;

pub type StateIndex = u16;

pub const ROOT_STATE: StateIndex = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionTrigger {
    OnTick,
    OnCompleted,
    OnSucceeded,
    OnFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionTarget {
    State(StateIndex),
    TreeSucceeded,
    TreeFailed,
}

pub(crate) struct TaskSlot {
    pub node: Box<dyn TaskNode>,
    pub memory_slot: usize,
}

pub(crate) struct EvaluatorSlot {
    pub node: Box<dyn EvaluatorNode>,
    pub memory_slot: usize,
}

pub(crate) struct TransitionDef {
    pub trigger: TransitionTrigger,
    pub condition: Option<Box<dyn ConditionNode>>,
    pub target: TransitionTarget,
    pub gate_seconds: f32,
}

pub(crate) struct StateDef {
    pub name: String,
    pub parent: Option<StateIndex>,
    pub children: Vec<StateIndex>,
    pub enter_conditions: Vec<Box<dyn ConditionNode>>,
    pub evaluators: Vec<EvaluatorSlot>,
    pub tasks: Vec<TaskSlot>,
    pub transitions: Vec<TransitionDef>,
    pub reenter_on_reselect: bool,
}

impl StateDef {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Immutable, compiled tree description. Built once, shared by every entity
/// that uses it through an `Arc`; read-only at runtime.
pub struct StateTreeAsset {
    name: String,
    states: Vec<StateDef>,
    global_evaluators: Vec<EvaluatorSlot>,
    external_schema: Vec<ExternalRequirement>,
    memory_slots: usize,
}

impl StateTreeAsset {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    pub fn state_name(&self, index: StateIndex) -> &str {
        &self.states[index as usize].name
    }

    pub fn external_schema(&self) -> &[ExternalRequirement] {
        &self.external_schema
    }

    pub(crate) fn state(&self, index: StateIndex) -> &StateDef {
        &self.states[index as usize]
    }

    pub(crate) fn global_evaluators(&self) -> &[EvaluatorSlot] {
        &self.global_evaluators
    }

    /// Path from the root to `state`, inclusive.
    pub(crate) fn lineage(&self, state: StateIndex) -> SmallVec<[StateIndex; 8]> {
        let mut out: SmallVec<[StateIndex; 8]> = SmallVec::new();
        let mut cursor = Some(state);
        while let Some(index) = cursor {
            out.push(index);
            cursor = self.states[index as usize].parent;
        }
        out.reverse();
        out
    }

    /// Fresh per-instance memory, one entry per instanced node, in the same
    /// order the builder assigned slots.
    pub(crate) fn instantiate_memory(&self) -> Vec<NodeMemory> {
        let mut memory = Vec::with_capacity(self.memory_slots);
        for evaluator in &self.global_evaluators {
            debug_assert_eq!(evaluator.memory_slot, memory.len());
            memory.push(evaluator.node.instantiate());
        }
        for state in &self.states {
            for evaluator in &state.evaluators {
                debug_assert_eq!(evaluator.memory_slot, memory.len());
                memory.push(evaluator.node.instantiate());
            }
            for task in &state.tasks {
                debug_assert_eq!(task.memory_slot, memory.len());
                memory.push(task.node.instantiate());
            }
        }
        memory
    }
}

// ---------- Builder ----------

/// One transition rule under construction. Declaration order on the owning
/// state is priority order at runtime.
pub struct Transition {
    trigger: TransitionTrigger,
    condition: Option<Box<dyn ConditionNode>>,
    target: Option<TransitionTarget>,
    gate_seconds: f32,
}

impl Transition {
    pub fn on_tick(condition: impl ConditionNode + 'static) -> Self {
        Self {
            trigger: TransitionTrigger::OnTick,
            condition: Some(Box::new(condition)),
            target: None,
            gate_seconds: 0.0,
        }
    }

    pub fn on_completed() -> Self {
        Self { trigger: TransitionTrigger::OnCompleted, condition: None, target: None, gate_seconds: 0.0 }
    }

    pub fn on_succeeded() -> Self {
        Self { trigger: TransitionTrigger::OnSucceeded, condition: None, target: None, gate_seconds: 0.0 }
    }

    pub fn on_failed() -> Self {
        Self { trigger: TransitionTrigger::OnFailed, condition: None, target: None, gate_seconds: 0.0 }
    }

    pub fn when(mut self, condition: impl ConditionNode + 'static) -> Self {
        self.condition = Some(Box::new(condition));
        self
    }

    pub fn to_state(mut self, state: StateIndex) -> Self {
        self.target = Some(TransitionTarget::State(state));
        self
    }

    pub fn to_tree_succeeded(mut self) -> Self {
        self.target = Some(TransitionTarget::TreeSucceeded);
        self
    }

    pub fn to_tree_failed(mut self) -> Self {
        self.target = Some(TransitionTarget::TreeFailed);
        self
    }

    /// Minimum dwell time before the rule may fire once it matches.
    pub fn gated(mut self, seconds: f32) -> Self {
        self.gate_seconds = seconds;
        self
    }
}

struct BuilderState {
    name: String,
    parent: Option<StateIndex>,
    children: Vec<StateIndex>,
    enter_conditions: Vec<Box<dyn ConditionNode>>,
    evaluators: Vec<Box<dyn EvaluatorNode>>,
    tasks: Vec<Box<dyn TaskNode>>,
    transitions: Vec<Transition>,
    reenter_on_reselect: bool,
}

pub struct StateTreeBuilder {
    name: String,
    states: Vec<BuilderState>,
    global_evaluators: Vec<Box<dyn EvaluatorNode>>,
}

impl StateTreeBuilder {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), states: Vec::new(), global_evaluators: Vec::new() }
    }

    /// Adds a state. The first state added is the root and must have no
    /// parent; every later state names an already-added parent.
    pub fn add_state(&mut self, name: &str, parent: Option<StateIndex>) -> StateIndex {
        let index = self.states.len() as StateIndex;
        if let Some(parent) = parent {
            if let Some(state) = self.states.get_mut(parent as usize) {
                state.children.push(index);
            }
        }
        self.states.push(BuilderState {
            name: name.to_string(),
            parent,
            children: Vec::new(),
            enter_conditions: Vec::new(),
            evaluators: Vec::new(),
            tasks: Vec::new(),
            transitions: Vec::new(),
            reenter_on_reselect: true,
        });
        index
    }

    pub fn add_task(&mut self, state: StateIndex, task: impl TaskNode + 'static) {
        if let Some(state) = self.states.get_mut(state as usize) {
            state.tasks.push(Box::new(task));
        }
    }

    pub fn add_evaluator(&mut self, state: StateIndex, evaluator: impl EvaluatorNode + 'static) {
        if let Some(state) = self.states.get_mut(state as usize) {
            state.evaluators.push(Box::new(evaluator));
        }
    }

    pub fn add_enter_condition(&mut self, state: StateIndex, condition: impl ConditionNode + 'static) {
        if let Some(state) = self.states.get_mut(state as usize) {
            state.enter_conditions.push(Box::new(condition));
        }
    }

    pub fn add_transition(&mut self, state: StateIndex, transition: Transition) {
        if let Some(state) = self.states.get_mut(state as usize) {
            state.transitions.push(transition);
        }
    }

    pub fn add_global_evaluator(&mut self, evaluator: impl EvaluatorNode + 'static) {
        self.global_evaluators.push(Box::new(evaluator));
    }

    /// Whether a transition retargeting through this already-active state
    /// exits and re-enters its subtree. On by default.
    pub fn set_reenter_on_reselect(&mut self, state: StateIndex, reenter: bool) {
        if let Some(state) = self.states.get_mut(state as usize) {
            state.reenter_on_reselect = reenter;
        }
    }

    /// Validates the structure, links every node's external-data requirements
    /// and freezes the result.
    pub fn build(self) -> Result<Arc<StateTreeAsset>> {
        if self.states.is_empty() {
            bail!("State tree '{}' has no states", self.name);
        }
        let state_count = self.states.len();
        for (index, state) in self.states.iter().enumerate() {
            match state.parent {
                None if index != 0 => {
                    bail!("State '{}' has no parent but is not the root", state.name)
                }
                Some(parent) if index == 0 => {
                    bail!("Root state '{}' must not have a parent (got {})", state.name, parent)
                }
                Some(parent) if parent as usize >= index => {
                    bail!("State '{}' must be added after its parent", state.name)
                }
                _ => {}
            }
            if state.children.is_empty() && state.tasks.is_empty() {
                bail!("Leaf state '{}' must hold at least one task", state.name);
            }
            if !state.children.is_empty() && !state.tasks.is_empty() {
                bail!("Selector state '{}' must not hold tasks", state.name);
            }
            for transition in &state.transitions {
                let target = transition
                    .target
                    .ok_or_else(|| anyhow!("Transition on state '{}' has no target", state.name))?;
                if let TransitionTarget::State(target) = target {
                    if target as usize >= state_count {
                        bail!("Transition on state '{}' targets unknown state {}", state.name, target);
                    }
                }
                if !transition.gate_seconds.is_finite() || transition.gate_seconds < 0.0 {
                    bail!("Transition on state '{}' has an invalid gate time", state.name);
                }
            }
        }

        let mut linker = ExternalDataLinker::new();
        let mut memory_slots = 0usize;
        let mut global_evaluators = Vec::with_capacity(self.global_evaluators.len());
        for mut node in self.global_evaluators {
            node.link(&mut linker)?;
            global_evaluators.push(EvaluatorSlot { node, memory_slot: memory_slots });
            memory_slots += 1;
        }

        let mut states = Vec::with_capacity(state_count);
        for state in self.states {
            let mut evaluators = Vec::with_capacity(state.evaluators.len());
            for mut node in state.evaluators {
                node.link(&mut linker)?;
                evaluators.push(EvaluatorSlot { node, memory_slot: memory_slots });
                memory_slots += 1;
            }
            let mut tasks = Vec::with_capacity(state.tasks.len());
            for mut node in state.tasks {
                node.link(&mut linker)?;
                tasks.push(TaskSlot { node, memory_slot: memory_slots });
                memory_slots += 1;
            }
            let mut enter_conditions = Vec::with_capacity(state.enter_conditions.len());
            for mut node in state.enter_conditions {
                node.link(&mut linker)?;
                enter_conditions.push(node);
            }
            let mut transitions = Vec::with_capacity(state.transitions.len());
            for transition in state.transitions {
                let Some(target) = transition.target else {
                    bail!("Transition on state '{}' has no target", state.name);
                };
                let mut condition = transition.condition;
                if let Some(node) = condition.as_mut() {
                    node.link(&mut linker)?;
                }
                transitions.push(TransitionDef {
                    trigger: transition.trigger,
                    condition,
                    target,
                    gate_seconds: transition.gate_seconds,
                });
            }
            states.push(StateDef {
                name: state.name,
                parent: state.parent,
                children: state.children,
                enter_conditions,
                evaluators,
                tasks,
                transitions,
                reenter_on_reselect: state.reenter_on_reselect,
            });
        }

        Ok(Arc::new(StateTreeAsset {
            name: self.name,
            states,
            global_evaluators,
            external_schema: linker.finish(),
            memory_slots,
        }))
    }
}
