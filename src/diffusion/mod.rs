pub mod noise;
pub mod noise_schedule;
pub mod process;
pub mod sampling;

// Re-export key types
pub use noise_schedule::{BetaSchedule, NoiseSchedule};
pub use process::DiffusionProcess;
pub use sampling::{timestep_pairs, FinalStep, Transition};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::models::TimeUnetConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub diffusion: DiffusionConfig,
    #[serde(default)]
    pub sampling: SamplingConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<TimeUnetConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffusionConfig {
    pub num_timesteps: usize,
    pub beta_schedule: BetaSchedule,
    pub final_step: FinalStep,
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self {
            num_timesteps: 1000,
            beta_schedule: BetaSchedule::Linear,
            final_step: FinalStep::Keep,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub step_interval: usize,
    pub seed: Option<u64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            step_interval: 50,
            seed: None,
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = serde_yaml::from_str(&config_str)
        .with_context(|| "Failed to parse YAML config")?;

    Ok(config)
}
