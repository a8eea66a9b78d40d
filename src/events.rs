use crate::external::ExternalDataKind;
use crate::nodes::RunStatus;
use crate::signal::SignalName;
use crate::smart_objects::SmartObjectId;
use bevy_ecs::prelude::{Entity, Resource};
use std::fmt;

/// Scheduler happenings mirrored for debug UIs and tests. Purely
/// observational; nothing reads these back into simulation state.
#[derive(Debug, Clone)]
pub enum BehaviorEvent {
    TreeActivated { entity: Entity, tree: String },
    StateChanged { entity: Entity, from: String, to: String },
    TreeCompleted { entity: Entity, status: RunStatus },
    SignalSent { name: SignalName, entity: Entity },
    ClaimInvalidated { entity: Entity, object: SmartObjectId },
    AgentSkipped { entity: Entity, missing: ExternalDataKind },
}

impl fmt::Display for BehaviorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BehaviorEvent::TreeActivated { entity, tree } => {
                write!(f, "TreeActivated entity={} tree={}", entity.index(), tree)
            }
            BehaviorEvent::StateChanged { entity, from, to } => {
                write!(f, "StateChanged entity={} from={} to={}", entity.index(), from, to)
            }
            BehaviorEvent::TreeCompleted { entity, status } => {
                write!(f, "TreeCompleted entity={} status={}", entity.index(), status.label())
            }
            BehaviorEvent::SignalSent { name, entity } => {
                write!(f, "SignalSent name={} entity={}", name, entity.index())
            }
            BehaviorEvent::ClaimInvalidated { entity, object } => {
                write!(f, "ClaimInvalidated entity={} object={:?}", entity.index(), object)
            }
            BehaviorEvent::AgentSkipped { entity, missing } => {
                write!(f, "AgentSkipped entity={} missing={}", entity.index(), missing.label())
            }
        }
    }
}

#[derive(Default, Resource)]
pub struct EventBus {
    events: Vec<BehaviorEvent>,
}

impl EventBus {
    pub fn push(&mut self, event: BehaviorEvent) {
        self.events.push(event);
    }

    pub fn drain(&mut self) -> Vec<BehaviorEvent> {
        self.events.drain(..).collect()
    }
}
