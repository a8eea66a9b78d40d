use anyhow::{Context, Result};
use bevy_ecs::prelude::Resource;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::warn;

/// Activation urgency. Budgets cap how many agents of each tier may activate
/// in one frame; the rest wait for the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationTier {
    High,
    #[default]
    Normal,
    Low,
}

impl ActivationTier {
    pub fn label(self) -> &'static str {
        match self {
            ActivationTier::High => "high",
            ActivationTier::Normal => "normal",
            ActivationTier::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActivationConfig {
    #[serde(default = "ActivationConfig::default_high_per_frame")]
    pub high_per_frame: u32,
    #[serde(default = "ActivationConfig::default_normal_per_frame")]
    pub normal_per_frame: u32,
    #[serde(default = "ActivationConfig::default_low_per_frame")]
    pub low_per_frame: u32,
}

impl ActivationConfig {
    const fn default_high_per_frame() -> u32 {
        64
    }

    const fn default_normal_per_frame() -> u32 {
        32
    }

    const fn default_low_per_frame() -> u32 {
        16
    }

    pub fn budget(&self, tier: ActivationTier) -> u32 {
        match tier {
            ActivationTier::High => self.high_per_frame,
            ActivationTier::Normal => self.normal_per_frame,
            ActivationTier::Low => self.low_per_frame,
        }
    }
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            high_per_frame: Self::default_high_per_frame(),
            normal_per_frame: Self::default_normal_per_frame(),
            low_per_frame: Self::default_low_per_frame(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "SearchConfig::default_max_candidates")]
    pub max_candidates: usize,
    #[serde(default = "SearchConfig::default_retry_cooldown")]
    pub retry_cooldown_seconds: f32,
}

impl SearchConfig {
    const fn default_max_candidates() -> usize {
        8
    }

    fn default_retry_cooldown() -> f32 {
        1.5
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_candidates: Self::default_max_candidates(),
            retry_cooldown_seconds: Self::default_retry_cooldown(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Resource)]
pub struct BehaviorConfig {
    #[serde(default)]
    pub activation: ActivationConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

impl BehaviorConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(err) => {
                warn!("Config load error: {err:?}. Falling back to defaults.");
                Self::default()
            }
        }
    }
}
