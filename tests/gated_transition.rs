use bevy_ecs::prelude::Entity;
use goshawk::asset::{StateTreeAsset, StateTreeBuilder, Transition};
use goshawk::config::{ActivationTier, BehaviorConfig};
use goshawk::events::EventBus;
use goshawk::exec::{ExecutionContext, NodeContext};
use goshawk::external::Externals;
use goshawk::nodes::{ConditionNode, RunStatus, TaskNode};
use goshawk::pool::TreeInstancePool;
use goshawk::signal::names;
use goshawk::BehaviorWorld;
use std::sync::Arc;

struct IdleTask;

impl TaskNode for IdleTask {
    fn tick(&self, _ctx: &mut NodeContext<'_, '_>, _dt: f32) -> RunStatus {
        RunStatus::Running
    }
}

struct AlwaysTrue;

impl ConditionNode for AlwaysTrue {
    fn test(&self, _ctx: &mut NodeContext<'_, '_>) -> bool {
        true
    }
}

fn gated_tree(gate_seconds: f32) -> Arc<StateTreeAsset> {
    let mut builder = StateTreeBuilder::new("gated");
    let root = builder.add_state("root", None);
    let idle = builder.add_state("idle", Some(root));
    let next = builder.add_state("next", Some(root));
    builder.add_task(idle, IdleTask);
    builder.add_task(next, IdleTask);
    builder.add_transition(idle, Transition::on_tick(AlwaysTrue).to_state(next).gated(gate_seconds));
    builder.build().unwrap()
}

fn active_names(pool: &TreeInstancePool, handle: goshawk::pool::InstanceHandle) -> Vec<String> {
    let instance = pool.get(handle).unwrap();
    let tree = instance.tree().clone();
    instance.active_states().iter().map(|&s| tree.state_name(s).to_string()).collect()
}

/// The matched-but-gated rule must not fire before its dwell elapses, and
/// must fire exactly at the boundary.
#[test]
fn gate_holds_until_the_exact_boundary() {
    let tree = gated_tree(2.0);
    let mut pool = TreeInstancePool::default();
    let mut events = EventBus::default();
    let entity = Entity::from_raw(21);
    let handle = pool.allocate(entity, tree);

    let mut ctx =
        ExecutionContext::new(entity, pool.get_mut(handle).unwrap(), Externals::default(), &mut events, 0.0);
    assert_eq!(ctx.start(), RunStatus::Running);
    drop(ctx);

    // First tick arms the gate and schedules the wake-up.
    let mut ctx =
        ExecutionContext::new(entity, pool.get_mut(handle).unwrap(), Externals::default(), &mut events, 0.0);
    assert_eq!(ctx.tick(0.0), RunStatus::Running);
    let outbox = ctx.take_outbox();
    drop(ctx);
    assert_eq!(outbox.len(), 1);
    assert_eq!(outbox[0].name, names::GATE_ELAPSED);
    assert_eq!(outbox[0].delay_seconds, 2.0);
    assert_eq!(active_names(&pool, handle), vec!["root", "idle"]);

    // Repeated ticks before the boundary neither fire nor re-arm.
    for &now in &[0.5, 1.0, 1.999] {
        let mut ctx = ExecutionContext::new(
            entity,
            pool.get_mut(handle).unwrap(),
            Externals::default(),
            &mut events,
            now,
        );
        assert_eq!(ctx.tick(0.1), RunStatus::Running);
        assert!(ctx.take_outbox().is_empty());
        drop(ctx);
        assert_eq!(active_names(&pool, handle), vec!["root", "idle"]);
    }

    // At the boundary the rule is re-evaluated and taken.
    let mut ctx =
        ExecutionContext::new(entity, pool.get_mut(handle).unwrap(), Externals::default(), &mut events, 2.0);
    assert_eq!(ctx.tick(0.1), RunStatus::Running);
    drop(ctx);
    assert_eq!(active_names(&pool, handle), vec!["root", "next"]);
}

/// Driven through the world: the delayed wake signal is what re-ticks the
/// dormant agent, no earlier than requested.
#[test]
fn delayed_wake_fires_the_gate_through_the_driver() {
    let mut world = BehaviorWorld::new(BehaviorConfig::default());
    let tree = gated_tree(2.0);
    let agent = world.spawn_agent(tree, ActivationTier::Normal);

    // Activation frame: the tree starts and the first tick arms the gate at
    // now + 2.0.
    world.tick(0.5);
    assert_eq!(world.active_state_names(agent), vec!["root", "idle"]);

    // Dormant until the wake lands; nothing changes meanwhile.
    world.tick(0.5);
    world.tick(0.5);
    world.tick(0.5);
    assert_eq!(world.active_state_names(agent), vec!["root", "idle"]);
    assert!(world.now() < 2.5);

    // now reaches 2.5 == arm time 0.5 + 2.0; the wake is promoted and the
    // transition fires in the same frame.
    world.tick(0.5);
    assert!((world.now() - 2.5).abs() < 1e-9);
    assert_eq!(world.active_state_names(agent), vec!["root", "next"]);
    assert_eq!(world.instance_status(agent), Some(RunStatus::Running));
}
