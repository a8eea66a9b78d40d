use bevy_ecs::prelude::Entity;
use goshawk::asset::{StateTreeAsset, StateTreeBuilder};
use goshawk::exec::NodeContext;
use goshawk::nodes::{RunStatus, TaskNode};
use goshawk::pool::TreeInstancePool;
use std::sync::Arc;

struct IdleTask;

impl TaskNode for IdleTask {
    fn tick(&self, _ctx: &mut NodeContext<'_, '_>, _dt: f32) -> RunStatus {
        RunStatus::Running
    }
}

fn idle_tree() -> Arc<StateTreeAsset> {
    let mut builder = StateTreeBuilder::new("idle");
    let root = builder.add_state("root", None);
    builder.add_task(root, IdleTask);
    builder.build().expect("idle tree builds")
}

#[test]
fn handle_is_valid_until_freed() {
    let tree = idle_tree();
    let mut pool = TreeInstancePool::default();
    let handle = pool.allocate(Entity::from_raw(1), tree);
    assert!(pool.is_valid(handle));
    assert!(pool.get(handle).is_some());
    assert_eq!(pool.live_count(), 1);

    assert!(pool.free(handle));
    assert!(!pool.is_valid(handle));
    assert!(pool.get(handle).is_none());
    assert_eq!(pool.live_count(), 0);
}

#[test]
fn reused_slot_gets_a_new_generation() {
    let tree = idle_tree();
    let mut pool = TreeInstancePool::default();
    let first = pool.allocate(Entity::from_raw(1), tree.clone());
    pool.free(first);

    let second = pool.allocate(Entity::from_raw(2), tree);
    assert_eq!(second.index, first.index);
    assert_ne!(second.generation, first.generation);
    assert!(!pool.is_valid(first));
    assert!(pool.is_valid(second));
    assert_eq!(pool.capacity(), 1);
}

#[test]
fn double_free_is_a_noop() {
    let tree = idle_tree();
    let mut pool = TreeInstancePool::default();
    let handle = pool.allocate(Entity::from_raw(3), tree);
    assert!(pool.free(handle));
    assert!(!pool.free(handle));
    assert_eq!(pool.live_count(), 0);
    assert_eq!(pool.capacity(), 1);
}

#[test]
fn allocate_replaces_an_existing_instance_for_the_entity() {
    let tree = idle_tree();
    let mut pool = TreeInstancePool::default();
    let entity = Entity::from_raw(4);
    let first = pool.allocate(entity, tree.clone());
    let second = pool.allocate(entity, tree);
    assert!(!pool.is_valid(first));
    assert!(pool.is_valid(second));
    assert_eq!(pool.handle_for_entity(entity), Some(second));
    assert_eq!(pool.live_count(), 1);
}

#[test]
fn stale_handle_never_reaches_reused_memory() {
    let tree = idle_tree();
    let mut pool = TreeInstancePool::default();
    let stale = pool.allocate(Entity::from_raw(5), tree.clone());
    pool.free(stale);
    let fresh = pool.allocate(Entity::from_raw(6), tree);

    assert!(pool.get(stale).is_none());
    assert_eq!(pool.get(fresh).map(|i| i.entity()), Some(Entity::from_raw(6)));
}
