use bevy_ecs::prelude::Resource;

/// Seconds since simulation start. Advanced once per frame by the world
/// shell; everything that needs `now()` reads this service instead of wall
/// clock so delayed signals stay deterministic.
#[derive(Resource, Clone, Copy, Debug, Default)]
pub struct SimClock {
    now: f64,
}

impl SimClock {
    pub fn new() -> Self {
        Self { now: 0.0 }
    }

    pub fn advance(&mut self, dt: f32) {
        self.now += dt.max(0.0) as f64;
    }

    pub fn now(&self) -> f64 {
        self.now
    }
}

#[derive(Resource, Clone, Copy, Default)]
pub struct TimeDelta(pub f32);
