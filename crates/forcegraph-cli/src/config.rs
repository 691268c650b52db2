//! CLI configuration management.
//!
//! Values come from environment variables (`FGSIM_*`, `.env` included), then
//! the JSON config file, then defaults.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use forcegraph_sim::SimConfig;
use serde::{Deserialize, Serialize};

/// Overrides the config file location.
pub const CONFIG_ENV: &str = "FGSIM_CONFIG";

/// Compute backend to run layouts on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// GPU when an adapter is available, host otherwise.
    #[default]
    Auto,
    Cpu,
    Gpu,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Auto => "auto",
            Self::Cpu => "cpu",
            Self::Gpu => "gpu",
        })
    }
}

impl FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "gpu" => Ok(Self::Gpu),
            other => anyhow::bail!("Unknown backend: {}. Valid backends: auto, cpu, gpu", other),
        }
    }
}

/// Application-wide configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: Backend,

    /// Ticks run by `fgsim run` when `--ticks` is not given.
    pub ticks: u32,

    /// Physics, device profile and locks handed to the simulator.
    pub simulation: SimConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: Backend::Auto,
            ticks: 100,
            simulation: SimConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables and config file.
    pub fn load() -> Result<Self> {
        // Load .env file if present (silently ignore if missing)
        let _ = dotenvy::dotenv();

        let mut config = match Self::config_file_path() {
            Some(path) if path.exists() => {
                let contents = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config from {}", path.display()))?;
                serde_json::from_str(&contents)
                    .with_context(|| format!("Failed to parse config file {}", path.display()))?
            }
            _ => Self::default(),
        };

        // Environment takes precedence over the file
        for (var, key) in [
            ("FGSIM_BACKEND", "backend"),
            ("FGSIM_TICKS", "ticks"),
            ("FGSIM_TAU", "tau"),
            ("FGSIM_GRAVITY", "gravity"),
            ("FGSIM_SCALING_RATIO", "scaling-ratio"),
            ("FGSIM_BLOCK_COUNT", "block-count"),
            ("FGSIM_WARP_SIZE", "warp-size"),
        ] {
            if let Ok(value) = std::env::var(var) {
                config
                    .apply(key, &value)
                    .with_context(|| format!("Invalid {}", var))?;
            }
        }

        config
            .simulation
            .physics
            .validate()
            .context("Invalid physics configuration")?;
        Ok(config)
    }

    /// Save current configuration to the config file.
    pub fn save(&self) -> Result<()> {
        if let Some(config_path) = Self::config_file_path() {
            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create config directory: {}", parent.display())
                })?;
            }
            let contents = serde_json::to_string_pretty(self)?;
            std::fs::write(&config_path, contents)
                .with_context(|| format!("Failed to write config to {}", config_path.display()))?;
        }
        Ok(())
    }

    /// Get the path to the config file.
    pub fn config_file_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Some(PathBuf::from(path));
        }
        ProjectDirs::from("dev", "forcegraph", "fgsim")
            .map(|dirs| dirs.config_dir().join("config.json"))
    }

    /// Set one value by its CLI key.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        let physics = &mut self.simulation.physics;
        let device = &mut self.simulation.device;
        match key {
            "backend" => self.backend = value.parse()?,
            "ticks" => self.ticks = value.parse()?,
            "tau" | "theta" => physics.tau = value.parse()?,
            "gravity" => physics.gravity = value.parse()?,
            "scaling-ratio" => physics.scaling_ratio = value.parse()?,
            "edge-influence" => physics.edge_influence = value.parse()?,
            "jitter-tolerance" => physics.jitter_tolerance = value.parse()?,
            "prevent-overlap" => physics.prevent_overlap = value.parse()?,
            "strong-gravity" => physics.strong_gravity = value.parse()?,
            "dissuade-hubs" => physics.dissuade_hubs = value.parse()?,
            "lin-log" => physics.lin_log = value.parse()?,
            "lock-points" => self.simulation.locks.lock_points = value.parse()?,
            "block-count" => device.block_count = value.parse()?,
            "warp-size" => {
                device.warp_size = match value {
                    "" | "auto" => None,
                    _ => Some(value.parse()?),
                }
            }
            _ => anyhow::bail!("Unknown config key: {}. Valid keys: {}", key, KEYS.join(", ")),
        }
        Ok(())
    }

    /// Read one value by its CLI key.
    pub fn value(&self, key: &str) -> Result<String> {
        let physics = &self.simulation.physics;
        let device = &self.simulation.device;
        Ok(match key {
            "backend" => self.backend.to_string(),
            "ticks" => self.ticks.to_string(),
            "tau" | "theta" => physics.tau.to_string(),
            "gravity" => physics.gravity.to_string(),
            "scaling-ratio" => physics.scaling_ratio.to_string(),
            "edge-influence" => physics.edge_influence.to_string(),
            "jitter-tolerance" => physics.jitter_tolerance.to_string(),
            "prevent-overlap" => physics.prevent_overlap.to_string(),
            "strong-gravity" => physics.strong_gravity.to_string(),
            "dissuade-hubs" => physics.dissuade_hubs.to_string(),
            "lin-log" => physics.lin_log.to_string(),
            "lock-points" => self.simulation.locks.lock_points.to_string(),
            "block-count" => device.block_count.to_string(),
            "warp-size" => device
                .warp_size
                .map(|w| w.to_string())
                .unwrap_or_else(|| "auto".to_string()),
            _ => anyhow::bail!("Unknown config key: {}", key),
        })
    }
}

/// Every key accepted by `fgsim config set|get`.
pub const KEYS: &[&str] = &[
    "backend",
    "ticks",
    "tau",
    "gravity",
    "scaling-ratio",
    "edge-influence",
    "jitter-tolerance",
    "prevent-overlap",
    "strong-gravity",
    "dissuade-hubs",
    "lin-log",
    "lock-points",
    "block-count",
    "warp-size",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_and_read_back() {
        let mut config = Config::default();
        config.apply("tau", "0.25").unwrap();
        config.apply("backend", "CPU").unwrap();
        config.apply("warp-size", "64").unwrap();
        config.apply("lin-log", "true").unwrap();

        assert_eq!(config.value("tau").unwrap(), "0.25");
        assert_eq!(config.backend, Backend::Cpu);
        assert_eq!(config.simulation.device.warp_size, Some(64));
        assert!(config.simulation.physics.lin_log);

        config.apply("warp-size", "auto").unwrap();
        assert_eq!(config.value("warp-size").unwrap(), "auto");
    }

    #[test]
    fn test_unknown_key_rejected() {
        let mut config = Config::default();
        assert!(config.apply("colour", "red").is_err());
        assert!(config.value("colour").is_err());
        assert!(config.apply("ticks", "many").is_err());
    }

    #[test]
    fn test_every_key_readable() {
        let config = Config::default();
        for key in KEYS {
            assert!(config.value(key).is_ok(), "{key}");
        }
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = serde_json::from_str(r#"{"ticks": 7, "backend": "gpu"}"#).unwrap();
        assert_eq!(config.ticks, 7);
        assert_eq!(config.backend, Backend::Gpu);
        assert_eq!(config.simulation, SimConfig::default());
    }
}
