use bevy_ecs::prelude::{Entity, Resource};
use std::borrow::Cow;
use std::collections::{HashMap, VecDeque};

pub type SignalName = Cow<'static, str>;

/// Signal names the engine itself raises. Anything else is fair game for
/// leaf nodes and host code.
pub mod names {
    pub const TREE_ACTIVATED: &str = "tree_activated";
    pub const NEEDS_NEW_TASK: &str = "needs_new_task";
    pub const GATE_ELAPSED: &str = "transition_gate_elapsed";
    pub const CLAIM_INVALIDATED: &str = "claim_invalidated";
}

#[derive(Debug, Clone)]
struct DelayedSignal {
    name: SignalName,
    entity: Entity,
    fire_at: f64,
}

/// Decouples "a thing happened" from "this entity gets re-ticked". Immediate
/// signals land in name-keyed buckets drained once per frame; delayed signals
/// wait in a fire-time-ordered queue until promoted. Plain bookkeeping, all
/// mutation happens at fixed points on the simulation thread.
#[derive(Resource, Default)]
pub struct SignalScheduler {
    buckets: HashMap<SignalName, Vec<Entity>>,
    delayed: VecDeque<DelayedSignal>,
}

impl SignalScheduler {
    pub fn signal(&mut self, name: impl Into<SignalName>, entity: Entity) {
        self.buckets.entry(name.into()).or_default().push(entity);
    }

    pub fn signal_entities(
        &mut self,
        name: impl Into<SignalName>,
        entities: impl IntoIterator<Item = Entity>,
    ) {
        let bucket = self.buckets.entry(name.into()).or_default();
        bucket.extend(entities);
    }

    /// Schedules delivery no earlier than `now + delay_seconds`. Duplicates
    /// are kept; delivery is at-least-once.
    pub fn delay_signal(
        &mut self,
        name: impl Into<SignalName>,
        entity: Entity,
        delay_seconds: f32,
        now: f64,
    ) {
        let fire_at = now + delay_seconds.max(0.0) as f64;
        let entry = DelayedSignal { name: name.into(), entity, fire_at };
        // Insert after equal fire times so same-time entries keep FIFO order.
        let at = self.delayed.partition_point(|pending| pending.fire_at <= fire_at);
        self.delayed.insert(at, entry);
    }

    pub fn delay_signal_entities(
        &mut self,
        name: impl Into<SignalName>,
        entities: impl IntoIterator<Item = Entity>,
        delay_seconds: f32,
        now: f64,
    ) {
        let name = name.into();
        for entity in entities {
            self.delay_signal(name.clone(), entity, delay_seconds, now);
        }
    }

    /// Moves every due delayed entry into the immediate buckets. Called once
    /// per frame before the tick pass.
    pub fn promote_due(&mut self, now: f64) -> usize {
        let mut promoted = 0;
        while let Some(front) = self.delayed.front() {
            if front.fire_at > now {
                break;
            }
            if let Some(entry) = self.delayed.pop_front() {
                self.buckets.entry(entry.name).or_default().push(entry.entity);
                promoted += 1;
            }
        }
        promoted
    }

    /// Drains the per-frame buckets. Delivery order is FIFO within one name;
    /// order across names is unspecified.
    pub fn take_signaled(&mut self) -> Vec<(SignalName, Entity)> {
        let mut out = Vec::new();
        for (name, entities) in self.buckets.drain() {
            for entity in entities {
                out.push((name.clone(), entity));
            }
        }
        out
    }

    pub fn pending_immediate(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    pub fn pending_delayed(&self) -> usize {
        self.delayed.len()
    }
}

/// Signal requests buffered during a tick and flushed into the scheduler at
/// the frame's serialization point, never mid-chunk.
#[derive(Debug, Clone)]
pub struct OutboundSignal {
    pub name: SignalName,
    pub entity: Entity,
    pub delay_seconds: f32,
}

#[derive(Default)]
pub struct SignalOutbox {
    requests: Vec<OutboundSignal>,
}

impl SignalOutbox {
    pub fn push(&mut self, name: impl Into<SignalName>, entity: Entity) {
        self.requests.push(OutboundSignal { name: name.into(), entity, delay_seconds: 0.0 });
    }

    pub fn push_delayed(&mut self, name: impl Into<SignalName>, entity: Entity, delay_seconds: f32) {
        self.requests.push(OutboundSignal { name: name.into(), entity, delay_seconds });
    }

    pub fn drain(&mut self) -> Vec<OutboundSignal> {
        std::mem::take(&mut self.requests)
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}
