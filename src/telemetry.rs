use bevy_ecs::prelude::Resource;
use std::collections::HashMap;
use std::time::Instant;

#[derive(Clone, Copy, Debug)]
pub struct ScopeSummary {
    pub name: &'static str,
    pub last_ms: f32,
    pub average_ms: f32,
    pub max_ms: f32,
    pub samples: u64,
}

#[derive(Default)]
struct ScopeTiming {
    last_ms: f32,
    total_ms: f32,
    max_ms: f32,
    samples: u64,
}

/// What the driver did this frame.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameCounters {
    pub activated: u32,
    pub ticked: u32,
    pub skipped: u32,
    pub restarted: u32,
    pub batch_rebinds: u32,
    pub signals_delivered: u32,
}

/// Driver timings and counters. Scope timings accumulate across the run;
/// frame counters roll over on `begin_frame`.
#[derive(Resource, Default)]
pub struct DriverTelemetry {
    timings: HashMap<&'static str, ScopeTiming>,
    pub frame: FrameCounters,
    last_frame: FrameCounters,
}

impl DriverTelemetry {
    pub fn begin_frame(&mut self) {
        self.last_frame = self.frame;
        self.frame = FrameCounters::default();
    }

    pub fn scope(&mut self, name: &'static str) -> TelemetryScope<'_> {
        TelemetryScope { name, telemetry: self, start: Instant::now() }
    }

    pub fn last_frame(&self) -> FrameCounters {
        self.last_frame
    }

    /// For systems that also mutate counters mid-scope and cannot hold the
    /// RAII guard across the whole body.
    pub fn record_scope(&mut self, name: &'static str, duration_ms: f32) {
        self.record(name, duration_ms);
    }

    fn record(&mut self, name: &'static str, duration_ms: f32) {
        let entry = self.timings.entry(name).or_default();
        entry.last_ms = duration_ms;
        entry.max_ms = entry.max_ms.max(duration_ms);
        entry.total_ms += duration_ms;
        entry.samples += 1;
    }

    pub fn summaries(&self) -> Vec<ScopeSummary> {
        let mut out = Vec::with_capacity(self.timings.len());
        for (&name, timing) in &self.timings {
            let average_ms =
                if timing.samples == 0 { 0.0 } else { timing.total_ms / timing.samples as f32 };
            out.push(ScopeSummary {
                name,
                last_ms: timing.last_ms,
                average_ms,
                max_ms: timing.max_ms,
                samples: timing.samples,
            });
        }
        out.sort_by(|a, b| b.last_ms.partial_cmp(&a.last_ms).unwrap_or(std::cmp::Ordering::Equal));
        out
    }
}

pub struct TelemetryScope<'a> {
    name: &'static str,
    telemetry: &'a mut DriverTelemetry,
    start: Instant,
}

impl Drop for TelemetryScope<'_> {
    fn drop(&mut self) {
        let duration_ms = self.start.elapsed().as_secs_f32() * 1000.0;
        self.telemetry.record(self.name, duration_ms);
    }
}
