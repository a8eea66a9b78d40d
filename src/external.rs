use crate::smart_objects::{ClaimHandle, SmartObjectRegistry};
use crate::time::SimClock;
use bevy_ecs::prelude::Component;
use glam::Vec2;
use std::sync::Arc;

// ---------- Closed external-data schema ----------

/// Everything a node may bind to, enumerated up front. Binding resolves kinds
/// into a flat per-batch view; nodes never look data up by name at tick time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalDataKind {
    AgentLocation,
    SmartObjectUser,
    AgentProfile,
    SmartObjects,
    Clock,
}

impl ExternalDataKind {
    /// Subsystem kinds are resolved once per batch; the rest per entity.
    pub fn is_subsystem(self) -> bool {
        matches!(self, ExternalDataKind::SmartObjects | ExternalDataKind::Clock)
    }

    pub fn label(self) -> &'static str {
        match self {
            ExternalDataKind::AgentLocation => "agent_location",
            ExternalDataKind::SmartObjectUser => "smart_object_user",
            ExternalDataKind::AgentProfile => "agent_profile",
            ExternalDataKind::SmartObjects => "smart_objects",
            ExternalDataKind::Clock => "clock",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    Required,
    Optional,
}

/// Index into a tree asset's external-data schema, assigned at link time and
/// baked into the node that requested it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalDataHandle(u16);

impl ExternalDataHandle {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExternalRequirement {
    pub kind: ExternalDataKind,
    pub requirement: Requirement,
}

/// Collects requirements while an asset is being built. Requirements of the
/// same kind share one handle; `Required` wins over `Optional`.
pub struct ExternalDataLinker {
    entries: Vec<ExternalRequirement>,
}

impl ExternalDataLinker {
    pub(crate) fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn require(&mut self, kind: ExternalDataKind, requirement: Requirement) -> ExternalDataHandle {
        if let Some(index) = self.entries.iter().position(|entry| entry.kind == kind) {
            if requirement == Requirement::Required {
                self.entries[index].requirement = Requirement::Required;
            }
            return ExternalDataHandle(index as u16);
        }
        self.entries.push(ExternalRequirement { kind, requirement });
        ExternalDataHandle((self.entries.len() - 1) as u16)
    }

    pub(crate) fn finish(self) -> Vec<ExternalRequirement> {
        self.entries
    }
}

// ---------- Fragments ----------

#[derive(Component, Clone, Copy, Debug, Default)]
pub struct AgentLocation(pub Vec2);

/// Per-archetype constants shared by many agents through an `Arc`.
#[derive(Debug, Clone)]
pub struct AgentProfile {
    pub search_radius: f32,
    pub move_speed: f32,
}

impl Default for AgentProfile {
    fn default() -> Self {
        Self { search_radius: 25.0, move_speed: 1.0 }
    }
}

#[derive(Component, Clone)]
pub struct SharedProfile(pub Arc<AgentProfile>);

/// Claim bookkeeping carried by agents that interact with smart objects.
#[derive(Component, Clone, Copy, Debug, Default)]
pub struct SmartObjectUser {
    pub claim: Option<ClaimHandle>,
    pub next_search_at: f64,
}

impl SmartObjectUser {
    pub fn search_allowed(&self, now: f64) -> bool {
        now >= self.next_search_at
    }
}

// ---------- Resolved views ----------

/// The flat view table one entity ticks against. Subsystem entries are shared
/// by the whole batch; fragment entries are re-pointed per entity.
#[derive(Default)]
pub struct Externals<'w> {
    pub location: Option<&'w mut AgentLocation>,
    pub so_user: Option<&'w mut SmartObjectUser>,
    pub profile: Option<&'w AgentProfile>,
    pub smart_objects: Option<&'w mut SmartObjectRegistry>,
    pub clock: Option<&'w SimClock>,
}

pub enum ExternalViewMut<'v> {
    AgentLocation(&'v mut AgentLocation),
    SmartObjectUser(&'v mut SmartObjectUser),
    AgentProfile(&'v AgentProfile),
    SmartObjects(&'v mut SmartObjectRegistry),
    Clock(&'v SimClock),
}

impl<'w> Externals<'w> {
    pub fn has(&self, kind: ExternalDataKind) -> bool {
        match kind {
            ExternalDataKind::AgentLocation => self.location.is_some(),
            ExternalDataKind::SmartObjectUser => self.so_user.is_some(),
            ExternalDataKind::AgentProfile => self.profile.is_some(),
            ExternalDataKind::SmartObjects => self.smart_objects.is_some(),
            ExternalDataKind::Clock => self.clock.is_some(),
        }
    }

    pub fn view_mut(&mut self, kind: ExternalDataKind) -> Option<ExternalViewMut<'_>> {
        match kind {
            ExternalDataKind::AgentLocation => {
                self.location.as_deref_mut().map(ExternalViewMut::AgentLocation)
            }
            ExternalDataKind::SmartObjectUser => {
                self.so_user.as_deref_mut().map(ExternalViewMut::SmartObjectUser)
            }
            ExternalDataKind::AgentProfile => self.profile.map(ExternalViewMut::AgentProfile),
            ExternalDataKind::SmartObjects => {
                self.smart_objects.as_deref_mut().map(ExternalViewMut::SmartObjects)
            }
            ExternalDataKind::Clock => self.clock.map(ExternalViewMut::Clock),
        }
    }

    /// First unresolved `Required` entry of any kind, if any.
    pub fn missing_required(&self, schema: &[ExternalRequirement]) -> Option<ExternalDataKind> {
        schema
            .iter()
            .find(|entry| entry.requirement == Requirement::Required && !self.has(entry.kind))
            .map(|entry| entry.kind)
    }

    /// First unresolved `Required` fragment-level entry, if any.
    pub fn missing_required_fragment(&self, schema: &[ExternalRequirement]) -> Option<ExternalDataKind> {
        schema
            .iter()
            .find(|entry| {
                entry.requirement == Requirement::Required
                    && !entry.kind.is_subsystem()
                    && !self.has(entry.kind)
            })
            .map(|entry| entry.kind)
    }

    /// Full validity check across the schema, exposed to the host scheduler.
    pub fn satisfies(&self, schema: &[ExternalRequirement]) -> bool {
        schema
            .iter()
            .all(|entry| entry.requirement == Requirement::Optional || self.has(entry.kind))
    }
}
