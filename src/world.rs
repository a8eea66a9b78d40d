use crate::asset::StateTreeAsset;
use crate::config::{ActivationTier, BehaviorConfig};
use crate::driver::{
    sys_activate_agents, sys_begin_frame, sys_deliver_invalidations, sys_process_candidate_searches,
    sys_promote_delayed_signals, sys_release_despawned_agents, sys_tick_agents, DriverScratch,
    DriverState, StateTreeRef, TreeInstance,
};
use crate::events::{BehaviorEvent, EventBus};
use crate::exec::ExecutionContext;
use crate::external::{AgentLocation, Externals, SmartObjectUser};
use crate::nodes::RunStatus;
use crate::pool::{InstanceHandle, TreeInstancePool};
use crate::signal::{SignalName, SignalScheduler};
use crate::smart_objects::{SmartObjectId, SmartObjectRegistry};
use crate::telemetry::{DriverTelemetry, FrameCounters, ScopeSummary};
use crate::time::{SimClock, TimeDelta};
use bevy_ecs::prelude::{Entity, Mut, Schedule, World};
use bevy_ecs::schedule::IntoSystemConfigs;
use glam::Vec2;
use std::sync::Arc;

// ---------- World container ----------

/// Owns the ECS world and the behavior schedule. Services live as resources
/// from construction to drop; one `tick` advances the clock and runs the
/// whole driver chain once.
pub struct BehaviorWorld {
    pub world: World,
    schedule: Schedule,
}

impl Default for BehaviorWorld {
    fn default() -> Self {
        Self::new(BehaviorConfig::default())
    }
}

impl BehaviorWorld {
    pub fn new(config: BehaviorConfig) -> Self {
        let mut world = World::new();
        world.insert_resource(SimClock::new());
        world.insert_resource(TimeDelta(0.0));
        world.insert_resource(SignalScheduler::default());
        world.insert_resource(TreeInstancePool::default());
        world.insert_resource(EventBus::default());
        world.insert_resource(DriverTelemetry::default());
        world.insert_resource(DriverState::default());
        world.insert_resource(DriverScratch::default());
        world.insert_resource(SmartObjectRegistry::new(&config.search));
        world.insert_resource(config);

        let mut schedule = Schedule::default();
        schedule.add_systems(
            (
                sys_begin_frame,
                sys_promote_delayed_signals,
                sys_release_despawned_agents,
                sys_activate_agents,
                sys_deliver_invalidations,
                sys_process_candidate_searches,
                sys_tick_agents,
            )
                .chain(),
        );

        Self { world, schedule }
    }

    pub fn tick(&mut self, dt: f32) {
        self.world.resource_mut::<TimeDelta>().0 = dt;
        self.world.resource_mut::<SimClock>().advance(dt);
        self.schedule.run(&mut self.world);
    }

    pub fn now(&self) -> f64 {
        self.world.resource::<SimClock>().now()
    }

    // ---------- Agents ----------

    pub fn spawn_agent(&mut self, tree: Arc<StateTreeAsset>, tier: ActivationTier) -> Entity {
        self.world.spawn((StateTreeRef { tree, tier },)).id()
    }

    pub fn spawn_agent_at(
        &mut self,
        tree: Arc<StateTreeAsset>,
        tier: ActivationTier,
        position: Vec2,
    ) -> Entity {
        self.world
            .spawn((
                StateTreeRef { tree, tier },
                AgentLocation(position),
                SmartObjectUser::default(),
            ))
            .id()
    }

    /// Stops the tree and frees its instance before the entity goes away.
    pub fn despawn_agent(&mut self, entity: Entity) -> bool {
        let handle = self.world.resource::<TreeInstancePool>().handle_for_entity(entity);
        if let Some(handle) = handle {
            let now = self.world.resource::<SimClock>().now();
            self.world.resource_scope(|world, mut pool: Mut<TreeInstancePool>| {
                world.resource_scope(|_world, mut events: Mut<EventBus>| {
                    if let Some(instance) = pool.get_mut(handle) {
                        let mut ctx = ExecutionContext::new(
                            entity,
                            instance,
                            Externals::default(),
                            &mut events,
                            now,
                        );
                        ctx.stop();
                    }
                });
                pool.free(handle);
            });
        }
        if let Some(mut smart) = self.world.get_resource_mut::<SmartObjectRegistry>() {
            smart.release_all_for_user(entity);
        }
        self.world.despawn(entity)
    }

    // ---------- Signals ----------

    pub fn signal(&mut self, name: impl Into<SignalName>, entity: Entity) {
        self.world.resource_mut::<SignalScheduler>().signal(name, entity);
    }

    pub fn delay_signal(&mut self, name: impl Into<SignalName>, entity: Entity, delay_seconds: f32) {
        let now = self.world.resource::<SimClock>().now();
        self.world.resource_mut::<SignalScheduler>().delay_signal(name, entity, delay_seconds, now);
    }

    // ---------- Smart objects ----------

    pub fn register_smart_object(&mut self, position: Vec2, slot_count: u16) -> SmartObjectId {
        self.world.resource_mut::<SmartObjectRegistry>().register_object(position, slot_count)
    }

    pub fn unregister_smart_object(&mut self, id: SmartObjectId) -> bool {
        self.world.resource_mut::<SmartObjectRegistry>().unregister_object(id)
    }

    // ---------- Inspection ----------

    pub fn instance_handle(&self, entity: Entity) -> Option<InstanceHandle> {
        self.world.resource::<TreeInstancePool>().handle_for_entity(entity)
    }

    pub fn is_handle_valid(&self, handle: InstanceHandle) -> bool {
        self.world.resource::<TreeInstancePool>().is_valid(handle)
    }

    pub fn instance_status(&self, entity: Entity) -> Option<RunStatus> {
        let pool = self.world.resource::<TreeInstancePool>();
        let handle = pool.handle_for_entity(entity)?;
        pool.get(handle).map(|instance| instance.status())
    }

    pub fn active_state_names(&self, entity: Entity) -> Vec<String> {
        let pool = self.world.resource::<TreeInstancePool>();
        let Some(handle) = pool.handle_for_entity(entity) else {
            return Vec::new();
        };
        let Some(instance) = pool.get(handle) else {
            return Vec::new();
        };
        let tree = instance.tree();
        instance
            .active_states()
            .iter()
            .map(|&state| tree.state_name(state).to_string())
            .collect()
    }

    pub fn state_change_count(&self, entity: Entity) -> Option<u32> {
        let pool = self.world.resource::<TreeInstancePool>();
        let handle = pool.handle_for_entity(entity)?;
        pool.get(handle).map(|instance| instance.state_change_count())
    }

    pub fn drain_events(&mut self) -> Vec<BehaviorEvent> {
        self.world.resource_mut::<EventBus>().drain()
    }

    /// Counters for the most recently completed `tick`.
    pub fn frame_counters(&self) -> FrameCounters {
        self.world.resource::<DriverTelemetry>().frame
    }

    pub fn telemetry_summaries(&self) -> Vec<ScopeSummary> {
        self.world.resource::<DriverTelemetry>().summaries()
    }

    /// Removes the agent component; the driver stops and frees the instance
    /// on the next frame, leaving the entity itself alive.
    pub fn retire_agent(&mut self, entity: Entity) {
        if let Ok(mut entity_mut) = self.world.get_entity_mut(entity) {
            entity_mut.remove::<(StateTreeRef, TreeInstance)>();
        }
    }
}
