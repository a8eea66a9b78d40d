use crate::asset::{StateIndex, StateTreeAsset};
use crate::nodes::{NodeMemory, RunStatus};
use bevy_ecs::prelude::{Entity, Resource};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::Arc;

/// Identifies a slot in the instance pool. Valid only while the slot still
/// carries the same generation; freed slots bump theirs, so stale handles fail
/// validation instead of aliasing reused memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceHandle {
    pub index: u32,
    pub generation: u16,
}

/// A transition that matched but carries a dwell time. Cleared by any state
/// change, which makes the scheduled wake-up signal a no-op when it lands.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PendingGate {
    pub state: StateIndex,
    pub transition: u16,
    pub fire_at: f64,
}

/// Per-entity state-machine memory. Exactly one per entity while it uses a
/// tree; created by `TreeInstancePool::allocate`, destroyed by `free`.
pub struct InstanceData {
    pub(crate) tree: Arc<StateTreeAsset>,
    pub(crate) entity: Entity,
    pub(crate) status: RunStatus,
    pub(crate) active: SmallVec<[StateIndex; 8]>,
    pub(crate) node_memory: Vec<NodeMemory>,
    pub(crate) state_change_count: u32,
    pub(crate) gate: Option<PendingGate>,
    pub(crate) globals_active: bool,
}

impl InstanceData {
    fn new(entity: Entity, tree: Arc<StateTreeAsset>) -> Self {
        let node_memory = tree.instantiate_memory();
        Self {
            tree,
            entity,
            status: RunStatus::Unset,
            active: SmallVec::new(),
            node_memory,
            state_change_count: 0,
            gate: None,
            globals_active: false,
        }
    }

    pub fn entity(&self) -> Entity {
        self.entity
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn tree(&self) -> &Arc<StateTreeAsset> {
        &self.tree
    }

    pub fn active_states(&self) -> &[StateIndex] {
        &self.active
    }

    pub fn state_change_count(&self) -> u32 {
        self.state_change_count
    }
}

struct PoolSlot {
    generation: u16,
    data: Option<InstanceData>,
}

/// Generational slot allocator for instance memory. Alloc and free are O(1)
/// amortized; lookups on stale handles return `None`.
#[derive(Resource, Default)]
pub struct TreeInstancePool {
    slots: Vec<PoolSlot>,
    free: Vec<u32>,
    by_entity: HashMap<Entity, InstanceHandle>,
}

impl TreeInstancePool {
    pub fn allocate(&mut self, entity: Entity, tree: Arc<StateTreeAsset>) -> InstanceHandle {
        if let Some(stale) = self.by_entity.get(&entity).copied() {
            self.free(stale);
        }
        let data = InstanceData::new(entity, tree);
        let handle = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.data = Some(data);
                InstanceHandle { index, generation: slot.generation }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(PoolSlot { generation: 0, data: Some(data) });
                InstanceHandle { index, generation: 0 }
            }
        };
        self.by_entity.insert(entity, handle);
        handle
    }

    /// Drops the slot's instance memory and invalidates every outstanding
    /// handle to it. Freeing an invalid handle is a no-op.
    pub fn free(&mut self, handle: InstanceHandle) -> bool {
        if !self.is_valid(handle) {
            return false;
        }
        let slot = &mut self.slots[handle.index as usize];
        if let Some(data) = slot.data.take() {
            self.by_entity.remove(&data.entity);
        }
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        true
    }

    pub fn is_valid(&self, handle: InstanceHandle) -> bool {
        self.slots
            .get(handle.index as usize)
            .map_or(false, |slot| slot.generation == handle.generation && slot.data.is_some())
    }

    pub fn get(&self, handle: InstanceHandle) -> Option<&InstanceData> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.data.as_ref()
    }

    pub fn get_mut(&mut self, handle: InstanceHandle) -> Option<&mut InstanceData> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.data.as_mut()
    }

    pub fn handle_for_entity(&self, entity: Entity) -> Option<InstanceHandle> {
        self.by_entity.get(&entity).copied()
    }

    pub fn live_count(&self) -> usize {
        self.by_entity.len()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}
