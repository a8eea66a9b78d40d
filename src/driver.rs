use crate::asset::StateTreeAsset;
use crate::config::{ActivationTier, BehaviorConfig};
use crate::events::{BehaviorEvent, EventBus};
use crate::exec::ExecutionContext;
use crate::external::{
    AgentLocation, ExternalDataKind, ExternalRequirement, Externals, Requirement, SharedProfile,
    SmartObjectUser,
};
use crate::pool::{InstanceHandle, TreeInstancePool};
use crate::signal::{names, SignalScheduler};
use crate::smart_objects::SmartObjectRegistry;
use crate::telemetry::DriverTelemetry;
use crate::time::{SimClock, TimeDelta};
use bevy_ecs::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

/// Marks an entity as a behavior-tree agent. Activation picks these up,
/// allocates instance memory and starts the tree.
#[derive(Component, Clone)]
pub struct StateTreeRef {
    pub tree: Arc<StateTreeAsset>,
    pub tier: ActivationTier,
}

/// Inserted once an agent's instance memory exists.
#[derive(Component, Clone, Copy)]
pub struct TreeInstance {
    pub handle: InstanceHandle,
}

#[derive(Resource, Default)]
pub struct DriverState {
    warned_missing_scheduler: bool,
}

#[derive(Clone, Copy)]
struct GatherEntry {
    entity: Entity,
    handle: InstanceHandle,
    tree_key: usize,
}

/// Gather buffers and the per-batch binding cache, reused across frames.
#[derive(Resource, Default)]
pub struct DriverScratch {
    gathered: Vec<GatherEntry>,
    seen: HashSet<Entity>,
    cached_tree: Option<Arc<StateTreeAsset>>,
    cached_missing: Option<ExternalDataKind>,
}

type AgentFragments<'w, 's> = Query<
    'w,
    's,
    (Option<&'static mut AgentLocation>, Option<&'static SharedProfile>, Option<&'static mut SmartObjectUser>),
>;

fn build_externals<'a>(
    location: Option<Mut<'a, AgentLocation>>,
    profile: Option<&'a SharedProfile>,
    so_user: Option<Mut<'a, SmartObjectUser>>,
    smart: Option<&'a mut SmartObjectRegistry>,
    clock: &'a SimClock,
) -> Externals<'a> {
    Externals {
        location: location.map(Mut::into_inner),
        so_user: so_user.map(Mut::into_inner),
        profile: profile.map(|shared| shared.0.as_ref()),
        smart_objects: smart,
        clock: Some(clock),
    }
}

/// Subsystem-level binding check, resolved once per batch of entities that
/// share a tree. Fragment-level entries are checked per entity instead.
fn missing_required_subsystem(
    schema: &[ExternalRequirement],
    have_smart_objects: bool,
) -> Option<ExternalDataKind> {
    schema
        .iter()
        .find(|entry| {
            entry.requirement == Requirement::Required
                && entry.kind.is_subsystem()
                && match entry.kind {
                    ExternalDataKind::SmartObjects => !have_smart_objects,
                    _ => false,
                }
        })
        .map(|entry| entry.kind)
}

pub fn sys_begin_frame(mut telemetry: ResMut<DriverTelemetry>) {
    telemetry.begin_frame();
}

/// The one place per frame where due delayed signals become immediate ones.
pub fn sys_promote_delayed_signals(
    mut telemetry: ResMut<DriverTelemetry>,
    clock: Res<SimClock>,
    scheduler: Option<ResMut<SignalScheduler>>,
) {
    let Some(mut scheduler) = scheduler else {
        return;
    };
    let _scope = telemetry.scope("sys_promote_delayed_signals");
    scheduler.promote_due(clock.now());
}

/// Stops and frees instances whose agent component went away, before the
/// entity memory itself is reclaimed.
pub fn sys_release_despawned_agents(
    mut telemetry: ResMut<DriverTelemetry>,
    mut removed: RemovedComponents<StateTreeRef>,
    mut pool: ResMut<TreeInstancePool>,
    mut events: ResMut<EventBus>,
    clock: Res<SimClock>,
    smart: Option<ResMut<SmartObjectRegistry>>,
    mut commands: Commands,
) {
    let _scope = telemetry.scope("sys_release_despawned_agents");
    let mut smart = smart;
    for entity in removed.read() {
        if let Some(smart) = smart.as_deref_mut() {
            smart.release_all_for_user(entity);
        }
        let Some(handle) = pool.handle_for_entity(entity) else {
            continue;
        };
        if let Some(instance) = pool.get_mut(handle) {
            let mut ctx =
                ExecutionContext::new(entity, instance, Externals::default(), &mut events, clock.now());
            ctx.stop();
        }
        pool.free(handle);
        if let Some(mut entity_commands) = commands.get_entity(entity) {
            entity_commands.remove::<TreeInstance>();
        }
    }
}

/// Activation phase: allocate, start, tag through the command buffer and
/// queue an immediate signal so the first real tick happens without waiting
/// for an external event. Budgeted per priority tier.
pub fn sys_activate_agents(
    mut telemetry: ResMut<DriverTelemetry>,
    mut commands: Commands,
    clock: Res<SimClock>,
    config: Res<BehaviorConfig>,
    scheduler: Option<ResMut<SignalScheduler>>,
    mut pool: ResMut<TreeInstancePool>,
    mut events: ResMut<EventBus>,
    smart: Option<ResMut<SmartObjectRegistry>>,
    pending: Query<(Entity, &StateTreeRef), Without<TreeInstance>>,
    mut fragments: AgentFragments,
) {
    let Some(mut scheduler) = scheduler else {
        return;
    };
    let started = Instant::now();
    let mut smart = smart;
    let mut used = [0u32; 3];
    for (entity, tree_ref) in pending.iter() {
        let tier = tree_ref.tier;
        if used[tier as usize] >= config.activation.budget(tier) {
            continue;
        }
        if pool.handle_for_entity(entity).is_some() {
            continue;
        }
        let Ok((location, profile, so_user)) = fragments.get_mut(entity) else {
            continue;
        };
        let externals = build_externals(location, profile, so_user, smart.as_deref_mut(), &clock);
        if let Some(missing) = externals.missing_required(tree_ref.tree.external_schema()) {
            warn!(
                entity = entity.index(),
                tree = tree_ref.tree.name(),
                missing = missing.label(),
                "Required external data unresolved; activation skipped"
            );
            events.push(BehaviorEvent::AgentSkipped { entity, missing });
            telemetry.frame.skipped += 1;
            continue;
        }
        let handle = pool.allocate(entity, tree_ref.tree.clone());
        let Some(instance) = pool.get_mut(handle) else {
            continue;
        };
        let mut ctx = ExecutionContext::new(entity, instance, externals, &mut events, clock.now());
        ctx.start();
        let outbox = ctx.take_outbox();
        drop(ctx);
        for out in outbox {
            if out.delay_seconds > 0.0 {
                scheduler.delay_signal(out.name, out.entity, out.delay_seconds, clock.now());
            } else {
                scheduler.signal(out.name, out.entity);
            }
        }
        commands.entity(entity).insert(TreeInstance { handle });
        scheduler.signal(names::TREE_ACTIVATED, entity);
        events.push(BehaviorEvent::TreeActivated {
            entity,
            tree: tree_ref.tree.name().to_string(),
        });
        telemetry.frame.activated += 1;
        used[tier as usize] += 1;
    }
    telemetry.record_scope("sys_activate_agents", started.elapsed().as_secs_f32() * 1000.0);
}

/// Turns forced claim releases into claim-invalidated wake signals.
pub fn sys_deliver_invalidations(
    mut telemetry: ResMut<DriverTelemetry>,
    scheduler: Option<ResMut<SignalScheduler>>,
    smart: Option<ResMut<SmartObjectRegistry>>,
    mut events: ResMut<EventBus>,
) {
    let (Some(mut scheduler), Some(mut smart)) = (scheduler, smart) else {
        return;
    };
    let _scope = telemetry.scope("sys_deliver_invalidations");
    for (entity, object) in smart.drain_invalidation_signals() {
        scheduler.signal(names::CLAIM_INVALIDATED, entity);
        events.push(BehaviorEvent::ClaimInvalidated { entity, object });
    }
}

/// The asynchronous candidate-search batch pass.
pub fn sys_process_candidate_searches(
    mut telemetry: ResMut<DriverTelemetry>,
    smart: Option<ResMut<SmartObjectRegistry>>,
) {
    let Some(mut smart) = smart else {
        return;
    };
    let _scope = telemetry.scope("sys_process_candidate_searches");
    smart.process_requests();
}

/// Steady-state pass: gather everything signaled since last frame, group by
/// tree asset, bind once per batch and tick each instance. Entities that end
/// the frame non-running get one same-frame restart and a needs-new-task
/// signal; the rest stay dormant until their next signal.
pub fn sys_tick_agents(
    mut telemetry: ResMut<DriverTelemetry>,
    mut state: ResMut<DriverState>,
    clock: Res<SimClock>,
    dt: Res<TimeDelta>,
    scheduler: Option<ResMut<SignalScheduler>>,
    mut pool: ResMut<TreeInstancePool>,
    mut scratch: ResMut<DriverScratch>,
    mut events: ResMut<EventBus>,
    smart: Option<ResMut<SmartObjectRegistry>>,
    mut fragments: AgentFragments,
) {
    let Some(mut scheduler) = scheduler else {
        if !state.warned_missing_scheduler {
            warn!("Signal scheduler missing; behavior driver disabled for this world");
            state.warned_missing_scheduler = true;
        }
        return;
    };
    let started = Instant::now();
    let mut smart = smart;
    let have_smart_objects = smart.is_some();
    let scratch = &mut *scratch;

    scratch.gathered.clear();
    scratch.seen.clear();
    for (name, entity) in scheduler.take_signaled() {
        telemetry.frame.signals_delivered += 1;
        events.push(BehaviorEvent::SignalSent { name, entity });
        if !scratch.seen.insert(entity) {
            continue;
        }
        let Some(handle) = pool.handle_for_entity(entity) else {
            continue;
        };
        let Some(instance) = pool.get(handle) else {
            continue;
        };
        scratch.gathered.push(GatherEntry {
            entity,
            handle,
            tree_key: Arc::as_ptr(instance.tree()) as usize,
        });
    }
    scratch.gathered.sort_by_key(|entry| entry.tree_key);

    for index in 0..scratch.gathered.len() {
        let entry = scratch.gathered[index];
        let Some(instance) = pool.get_mut(entry.handle) else {
            continue;
        };
        let tree = instance.tree().clone();
        let rebind = match &scratch.cached_tree {
            Some(cached) => !Arc::ptr_eq(cached, &tree),
            None => true,
        };
        if rebind {
            scratch.cached_missing = missing_required_subsystem(tree.external_schema(), have_smart_objects);
            scratch.cached_tree = Some(tree.clone());
            telemetry.frame.batch_rebinds += 1;
        }
        if let Some(missing) = scratch.cached_missing {
            warn!(
                entity = entry.entity.index(),
                tree = tree.name(),
                missing = missing.label(),
                "Required subsystem unresolved; agent tick skipped"
            );
            events.push(BehaviorEvent::AgentSkipped { entity: entry.entity, missing });
            telemetry.frame.skipped += 1;
            continue;
        }
        let Ok((location, profile, so_user)) = fragments.get_mut(entry.entity) else {
            continue;
        };
        let externals = build_externals(location, profile, so_user, smart.as_deref_mut(), &clock);
        if let Some(missing) = externals.missing_required_fragment(tree.external_schema()) {
            warn!(
                entity = entry.entity.index(),
                tree = tree.name(),
                missing = missing.label(),
                "Required fragment unresolved; agent tick skipped"
            );
            events.push(BehaviorEvent::AgentSkipped { entity: entry.entity, missing });
            telemetry.frame.skipped += 1;
            continue;
        }
        let mut ctx =
            ExecutionContext::new(entry.entity, instance, externals, &mut events, clock.now());
        let status = ctx.tick(dt.0);
        let completed = !status.is_running();
        if completed {
            // One same-frame restart absorbs trivial multi-step transitions.
            ctx.stop();
            ctx.start();
            telemetry.frame.restarted += 1;
        }
        let outbox = ctx.take_outbox();
        drop(ctx);
        for out in outbox {
            if out.delay_seconds > 0.0 {
                scheduler.delay_signal(out.name, out.entity, out.delay_seconds, clock.now());
            } else {
                scheduler.signal(out.name, out.entity);
            }
        }
        if completed {
            scheduler.signal(names::NEEDS_NEW_TASK, entry.entity);
        }
        telemetry.frame.ticked += 1;
    }
    telemetry.record_scope("sys_tick_agents", started.elapsed().as_secs_f32() * 1000.0);
}
