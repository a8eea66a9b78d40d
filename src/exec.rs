use crate::asset::{
    EvaluatorSlot, StateIndex, StateTreeAsset, TaskSlot, TransitionTarget, TransitionTrigger,
    ROOT_STATE,
};
use crate::events::{BehaviorEvent, EventBus};
use crate::external::{ExternalDataHandle, ExternalRequirement, ExternalViewMut, Externals};
use crate::nodes::{ConditionNode, NodeMemory, RunStatus};
use crate::pool::{InstanceData, PendingGate};
use crate::signal::{names, OutboundSignal, SignalName, SignalOutbox};
use crate::smart_objects::SmartObjectRegistry;
use bevy_ecs::prelude::Entity;
use smallvec::SmallVec;
use std::sync::Arc;

/// What a node sees while it runs: its own instanced memory, the resolved
/// external views, and a buffered signal surface. Never outlives the call.
pub struct NodeContext<'r, 'w> {
    pub entity: Entity,
    pub now: f64,
    schema: &'r [ExternalRequirement],
    memory: Option<&'r mut NodeMemory>,
    externals: &'r mut Externals<'w>,
    outbox: &'r mut SignalOutbox,
}

impl<'r, 'w> NodeContext<'r, 'w> {
    pub fn memory<T: std::any::Any>(&self) -> Option<&T> {
        self.memory.as_ref()?.get()
    }

    pub fn memory_mut<T: std::any::Any>(&mut self) -> Option<&mut T> {
        self.memory.as_mut()?.get_mut()
    }

    /// Resolved view for a handle acquired at link time. `None` when an
    /// optional item is unresolved for this entity.
    pub fn external(&mut self, handle: ExternalDataHandle) -> Option<ExternalViewMut<'_>> {
        let entry = self.schema.get(handle.index())?;
        self.externals.view_mut(entry.kind)
    }

    pub fn location_mut(&mut self, handle: ExternalDataHandle) -> Option<&mut crate::external::AgentLocation> {
        match self.external(handle)? {
            ExternalViewMut::AgentLocation(view) => Some(view),
            _ => None,
        }
    }

    pub fn so_user_mut(&mut self, handle: ExternalDataHandle) -> Option<&mut crate::external::SmartObjectUser> {
        match self.external(handle)? {
            ExternalViewMut::SmartObjectUser(view) => Some(view),
            _ => None,
        }
    }

    pub fn profile(&mut self, handle: ExternalDataHandle) -> Option<&crate::external::AgentProfile> {
        match self.external(handle)? {
            ExternalViewMut::AgentProfile(view) => Some(view),
            _ => None,
        }
    }

    pub fn smart_objects(&mut self, handle: ExternalDataHandle) -> Option<&mut SmartObjectRegistry> {
        match self.external(handle)? {
            ExternalViewMut::SmartObjects(view) => Some(view),
            _ => None,
        }
    }

    /// Queues an immediate signal to this entity, flushed after the tick.
    pub fn send_signal(&mut self, name: impl Into<SignalName>) {
        let entity = self.entity;
        self.outbox.push(name, entity);
    }

    pub fn signal_entity(&mut self, name: impl Into<SignalName>, entity: Entity) {
        self.outbox.push(name, entity);
    }

    pub fn delay_signal(&mut self, name: impl Into<SignalName>, delay_seconds: f32) {
        let entity = self.entity;
        self.outbox.push_delayed(name, entity, delay_seconds);
    }
}

enum Decision {
    Take { state: StateIndex, index: usize },
    Pending,
}

/// Binds one instance, its tree and one entity's resolved externals for the
/// duration of a start/stop/tick call. Nothing here persists between ticks
/// except what lives inside `InstanceData`.
pub struct ExecutionContext<'a> {
    entity: Entity,
    now: f64,
    tree: Arc<StateTreeAsset>,
    instance: &'a mut InstanceData,
    externals: Externals<'a>,
    events: &'a mut EventBus,
    outbox: SignalOutbox,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(
        entity: Entity,
        instance: &'a mut InstanceData,
        externals: Externals<'a>,
        events: &'a mut EventBus,
        now: f64,
    ) -> Self {
        let tree = instance.tree.clone();
        Self { entity, now, tree, instance, externals, events, outbox: SignalOutbox::default() }
    }

    pub fn status(&self) -> RunStatus {
        self.instance.status
    }

    pub fn are_external_data_views_valid(&self) -> bool {
        self.externals.satisfies(self.tree.external_schema())
    }

    /// Signals the nodes asked to send, for the caller to flush into the
    /// scheduler at the frame's serialization point.
    pub fn take_outbox(&mut self) -> Vec<OutboundSignal> {
        self.outbox.drain()
    }

    /// Runs global evaluators, selects from the root and enters the chosen
    /// path. `Failed` if nothing selects or an enter fails.
    pub fn start(&mut self) -> RunStatus {
        let tree = self.tree.clone();
        if self.instance.status.is_running() || !self.instance.active.is_empty() {
            self.stop();
        }
        for evaluator in tree.global_evaluators() {
            self.eval_start(&tree, evaluator);
        }
        self.instance.globals_active = true;
        self.instance.gate = None;
        match self.select_path(&tree, ROOT_STATE) {
            Some(path) => {
                if self.enter_path(&tree, &path, 0) {
                    self.instance.status = RunStatus::Running;
                } else {
                    self.instance.status = RunStatus::Failed;
                }
            }
            None => self.instance.status = RunStatus::Failed,
        }
        self.instance.state_change_count = self.instance.state_change_count.wrapping_add(1);
        self.instance.status
    }

    /// One simulation step: evaluators, tasks root-to-leaf, then transition
    /// rules. Returns the instance status afterwards.
    pub fn tick(&mut self, dt: f32) -> RunStatus {
        if !self.instance.status.is_running() {
            return self.instance.status;
        }
        let tree = self.tree.clone();
        for evaluator in tree.global_evaluators() {
            self.eval_tick(&tree, evaluator, dt);
        }
        let active: SmallVec<[StateIndex; 8]> = self.instance.active.clone();
        for &state in &active {
            for evaluator in &tree.state(state).evaluators {
                self.eval_tick(&tree, evaluator, dt);
            }
        }
        let mut completion: Option<RunStatus> = None;
        for &state in &active {
            for task in &tree.state(state).tasks {
                match self.task_tick(&tree, task, dt) {
                    RunStatus::Failed => completion = Some(RunStatus::Failed),
                    RunStatus::Succeeded => {
                        if completion.is_none() {
                            completion = Some(RunStatus::Succeeded);
                        }
                    }
                    _ => {}
                }
            }
        }
        match self.find_transition(&tree, &active, completion) {
            Some(Decision::Take { state, index }) => {
                let target = tree.state(state).transitions[index].target;
                self.apply_transition(&tree, target);
            }
            Some(Decision::Pending) => {}
            None => {
                if let Some(status) = completion {
                    // Tasks completed with no matching rule: the tree is done.
                    self.finish(&tree, status);
                }
            }
        }
        self.instance.status
    }

    /// Forces the instance out of whatever is active: exit leaf-to-root,
    /// completion callbacks, then global evaluator shutdown.
    pub fn stop(&mut self) -> RunStatus {
        let tree = self.tree.clone();
        let terminal = match self.instance.status {
            RunStatus::Succeeded => RunStatus::Succeeded,
            _ => RunStatus::Failed,
        };
        if !self.instance.active.is_empty() {
            let old: SmallVec<[StateIndex; 8]> = self.instance.active.clone();
            while let Some(state) = self.instance.active.pop() {
                self.exit_state(&tree, state);
            }
            for &state in old.iter().rev() {
                self.completed_state(&tree, state, terminal);
            }
            self.instance.state_change_count = self.instance.state_change_count.wrapping_add(1);
        }
        if self.instance.globals_active {
            for evaluator in tree.global_evaluators().iter().rev() {
                self.eval_stop(&tree, evaluator);
            }
            self.instance.globals_active = false;
        }
        self.instance.gate = None;
        self.instance.status = terminal;
        terminal
    }

    // ---------- Transition machinery ----------

    fn find_transition(
        &mut self,
        tree: &StateTreeAsset,
        active: &[StateIndex],
        completion: Option<RunStatus>,
    ) -> Option<Decision> {
        let mut matched: Option<(StateIndex, usize)> = None;
        // Conditional rules are considered every tick, leaf upwards, in
        // declaration order; the first match wins.
        'conditional: for &state in active.iter().rev() {
            for (index, transition) in tree.state(state).transitions.iter().enumerate() {
                if transition.trigger != TransitionTrigger::OnTick {
                    continue;
                }
                if self.transition_condition_passes(tree, state, index) {
                    matched = Some((state, index));
                    break 'conditional;
                }
            }
        }
        if matched.is_none() {
            if let Some(status) = completion {
                'completion: for &state in active.iter().rev() {
                    for (index, transition) in tree.state(state).transitions.iter().enumerate() {
                        let trigger_matches = match transition.trigger {
                            TransitionTrigger::OnTick => false,
                            TransitionTrigger::OnCompleted => status.is_terminal(),
                            TransitionTrigger::OnSucceeded => status == RunStatus::Succeeded,
                            TransitionTrigger::OnFailed => status == RunStatus::Failed,
                        };
                        if trigger_matches && self.transition_condition_passes(tree, state, index) {
                            matched = Some((state, index));
                            break 'completion;
                        }
                    }
                }
            }
        }
        let Some((state, index)) = matched else {
            // No rule matches any more; a gate armed for a lapsed rule is
            // dropped so a later re-match starts a fresh dwell.
            self.instance.gate = None;
            return None;
        };
        let gate_seconds = tree.state(state).transitions[index].gate_seconds;
        if gate_seconds <= 0.0 {
            return Some(Decision::Take { state, index });
        }
        match self.instance.gate {
            Some(gate) if gate.state == state && gate.transition as usize == index => {
                if self.now >= gate.fire_at {
                    self.instance.gate = None;
                    Some(Decision::Take { state, index })
                } else {
                    Some(Decision::Pending)
                }
            }
            _ => {
                self.instance.gate = Some(PendingGate {
                    state,
                    transition: index as u16,
                    fire_at: self.now + gate_seconds as f64,
                });
                let entity = self.entity;
                self.outbox.push_delayed(names::GATE_ELAPSED, entity, gate_seconds);
                Some(Decision::Pending)
            }
        }
    }

    fn transition_condition_passes(
        &mut self,
        tree: &StateTreeAsset,
        state: StateIndex,
        index: usize,
    ) -> bool {
        match &tree.state(state).transitions[index].condition {
            Some(condition) => self.test_condition(tree, condition.as_ref()),
            None => true,
        }
    }

    fn apply_transition(&mut self, tree: &StateTreeAsset, target: TransitionTarget) {
        self.instance.gate = None;
        match target {
            TransitionTarget::TreeSucceeded => self.finish(tree, RunStatus::Succeeded),
            TransitionTarget::TreeFailed => self.finish(tree, RunStatus::Failed),
            TransitionTarget::State(target) => {
                let old: SmallVec<[StateIndex; 8]> = self.instance.active.clone();
                match self.select_path(tree, target) {
                    None => {
                        // Nothing selectable below the target; keep enter/exit
                        // symmetric and let the driver restart or re-signal.
                        while let Some(state) = self.instance.active.pop() {
                            self.exit_state(tree, state);
                        }
                        self.instance.status = RunStatus::Failed;
                        self.instance.state_change_count =
                            self.instance.state_change_count.wrapping_add(1);
                    }
                    Some(path) => {
                        let mut common = old
                            .iter()
                            .zip(path.iter())
                            .take_while(|(a, b)| a == b)
                            .count();
                        // Retargeting through an active ancestor re-enters its
                        // subtree unless the state opts out.
                        if let Some(depth) = old.iter().position(|&state| state == target) {
                            if tree.state(target).reenter_on_reselect {
                                common = common.min(depth);
                            }
                        }
                        while self.instance.active.len() > common {
                            if let Some(state) = self.instance.active.pop() {
                                self.exit_state(tree, state);
                            }
                        }
                        let entered = self.enter_path(tree, &path, common);
                        if !entered {
                            self.instance.status = RunStatus::Failed;
                        }
                        self.instance.state_change_count =
                            self.instance.state_change_count.wrapping_add(1);
                        let from = old.last().map(|&s| tree.state_name(s).to_string()).unwrap_or_default();
                        let to = self
                            .instance
                            .active
                            .last()
                            .map(|&s| tree.state_name(s).to_string())
                            .unwrap_or_default();
                        self.events.push(BehaviorEvent::StateChanged { entity: self.entity, from, to });
                    }
                }
            }
        }
    }

    fn finish(&mut self, tree: &StateTreeAsset, status: RunStatus) {
        let old: SmallVec<[StateIndex; 8]> = self.instance.active.clone();
        while let Some(state) = self.instance.active.pop() {
            self.exit_state(tree, state);
        }
        for &state in old.iter().rev() {
            self.completed_state(tree, state, status);
        }
        self.instance.status = status;
        self.instance.gate = None;
        self.instance.state_change_count = self.instance.state_change_count.wrapping_add(1);
        self.events.push(BehaviorEvent::TreeCompleted { entity: self.entity, status });
    }

    // ---------- Selection and enter/exit ----------

    /// Depth-first selection: validates enter conditions down the lineage,
    /// then descends from `target` picking the first selectable child.
    fn select_path(
        &mut self,
        tree: &StateTreeAsset,
        target: StateIndex,
    ) -> Option<SmallVec<[StateIndex; 8]>> {
        let lineage = tree.lineage(target);
        let mut path: SmallVec<[StateIndex; 8]> = SmallVec::new();
        for &state in &lineage {
            if !self.check_enter_conditions(tree, state) {
                return None;
            }
            path.push(state);
        }
        if self.descend_into(tree, target, &mut path) {
            Some(path)
        } else {
            None
        }
    }

    fn descend_into(
        &mut self,
        tree: &StateTreeAsset,
        state: StateIndex,
        path: &mut SmallVec<[StateIndex; 8]>,
    ) -> bool {
        let def = tree.state(state);
        if def.is_leaf() {
            return true;
        }
        for index in 0..def.children.len() {
            let child = tree.state(state).children[index];
            if self.check_enter_conditions(tree, child) {
                path.push(child);
                if self.descend_into(tree, child, path) {
                    return true;
                }
                path.pop();
            }
        }
        false
    }

    fn check_enter_conditions(&mut self, tree: &StateTreeAsset, state: StateIndex) -> bool {
        for index in 0..tree.state(state).enter_conditions.len() {
            let condition = tree.state(state).enter_conditions[index].as_ref();
            if !self.test_condition(tree, condition) {
                return false;
            }
        }
        true
    }

    /// Enters `path[from_depth..]` root-to-leaf, maintaining the active set
    /// as it goes. On an enter failure the states entered so far are exited
    /// again in reverse and the common prefix is left untouched.
    fn enter_path(&mut self, tree: &StateTreeAsset, path: &[StateIndex], from_depth: usize) -> bool {
        for &state in &path[from_depth..] {
            if self.enter_state(tree, state) {
                self.instance.active.push(state);
            } else {
                while self.instance.active.len() > from_depth {
                    if let Some(entered) = self.instance.active.pop() {
                        self.exit_state(tree, entered);
                    }
                }
                return false;
            }
        }
        true
    }

    fn enter_state(&mut self, tree: &StateTreeAsset, state: StateIndex) -> bool {
        let def = tree.state(state);
        for evaluator in &def.evaluators {
            self.eval_start(tree, evaluator);
        }
        for index in 0..def.tasks.len() {
            let status = self.task_enter(tree, &def.tasks[index]);
            if status == RunStatus::Failed {
                for done in def.tasks[..index].iter().rev() {
                    self.task_exit(tree, done);
                }
                for evaluator in def.evaluators.iter().rev() {
                    self.eval_stop(tree, evaluator);
                }
                return false;
            }
        }
        true
    }

    fn exit_state(&mut self, tree: &StateTreeAsset, state: StateIndex) {
        let def = tree.state(state);
        for task in def.tasks.iter().rev() {
            self.task_exit(tree, task);
        }
        for evaluator in def.evaluators.iter().rev() {
            self.eval_stop(tree, evaluator);
        }
    }

    fn completed_state(&mut self, tree: &StateTreeAsset, state: StateIndex, status: RunStatus) {
        let def = tree.state(state);
        for task in def.tasks.iter().rev() {
            self.task_completed(tree, task, status);
        }
    }

    // ---------- Node invocation ----------

    fn task_enter(&mut self, tree: &StateTreeAsset, task: &TaskSlot) -> RunStatus {
        let mut ctx = NodeContext {
            entity: self.entity,
            now: self.now,
            schema: tree.external_schema(),
            memory: Some(&mut self.instance.node_memory[task.memory_slot]),
            externals: &mut self.externals,
            outbox: &mut self.outbox,
        };
        task.node.enter(&mut ctx)
    }

    fn task_tick(&mut self, tree: &StateTreeAsset, task: &TaskSlot, dt: f32) -> RunStatus {
        let mut ctx = NodeContext {
            entity: self.entity,
            now: self.now,
            schema: tree.external_schema(),
            memory: Some(&mut self.instance.node_memory[task.memory_slot]),
            externals: &mut self.externals,
            outbox: &mut self.outbox,
        };
        task.node.tick(&mut ctx, dt)
    }

    fn task_exit(&mut self, tree: &StateTreeAsset, task: &TaskSlot) {
        let mut ctx = NodeContext {
            entity: self.entity,
            now: self.now,
            schema: tree.external_schema(),
            memory: Some(&mut self.instance.node_memory[task.memory_slot]),
            externals: &mut self.externals,
            outbox: &mut self.outbox,
        };
        task.node.exit(&mut ctx);
    }

    fn task_completed(&mut self, tree: &StateTreeAsset, task: &TaskSlot, status: RunStatus) {
        let mut ctx = NodeContext {
            entity: self.entity,
            now: self.now,
            schema: tree.external_schema(),
            memory: Some(&mut self.instance.node_memory[task.memory_slot]),
            externals: &mut self.externals,
            outbox: &mut self.outbox,
        };
        task.node.state_completed(&mut ctx, status);
    }

    fn eval_start(&mut self, tree: &StateTreeAsset, evaluator: &EvaluatorSlot) {
        let mut ctx = NodeContext {
            entity: self.entity,
            now: self.now,
            schema: tree.external_schema(),
            memory: Some(&mut self.instance.node_memory[evaluator.memory_slot]),
            externals: &mut self.externals,
            outbox: &mut self.outbox,
        };
        evaluator.node.start(&mut ctx);
    }

    fn eval_tick(&mut self, tree: &StateTreeAsset, evaluator: &EvaluatorSlot, dt: f32) {
        let mut ctx = NodeContext {
            entity: self.entity,
            now: self.now,
            schema: tree.external_schema(),
            memory: Some(&mut self.instance.node_memory[evaluator.memory_slot]),
            externals: &mut self.externals,
            outbox: &mut self.outbox,
        };
        evaluator.node.tick(&mut ctx, dt);
    }

    fn eval_stop(&mut self, tree: &StateTreeAsset, evaluator: &EvaluatorSlot) {
        let mut ctx = NodeContext {
            entity: self.entity,
            now: self.now,
            schema: tree.external_schema(),
            memory: Some(&mut self.instance.node_memory[evaluator.memory_slot]),
            externals: &mut self.externals,
            outbox: &mut self.outbox,
        };
        evaluator.node.stop(&mut ctx);
    }

    fn test_condition(&mut self, tree: &StateTreeAsset, condition: &dyn ConditionNode) -> bool {
        let mut ctx = NodeContext {
            entity: self.entity,
            now: self.now,
            schema: tree.external_schema(),
            memory: None,
            externals: &mut self.externals,
            outbox: &mut self.outbox,
        };
        condition.test(&mut ctx)
    }
}
