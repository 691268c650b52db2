//! Simulation configuration.

use serde::{Deserialize, Serialize};

use crate::error::SimError;
use crate::fa2::{
    ForceParams, FLAG_DISSUADE_HUBS, FLAG_LIN_LOG, FLAG_PREVENT_OVERLAP, FLAG_STRONG_GRAVITY,
};
use crate::sizes::{StageGeometry, DEFAULT_BLOCK_COUNT};
use crate::Result;

/// ForceAtlas2 physics parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForceAtlas2Config {
    /// Repulsion strength (kr).
    pub scaling_ratio: f32,
    /// Gravity strength (kg).
    pub gravity: f32,
    /// Exponent applied to edge weights.
    pub edge_influence: f32,
    /// Tolerated swinging before the global speed is reduced.
    pub jitter_tolerance: f32,
    /// Barnes-Hut opening angle.
    pub tau: f32,
    pub prevent_overlap: bool,
    pub strong_gravity: bool,
    pub dissuade_hubs: bool,
    pub lin_log: bool,
}

impl Default for ForceAtlas2Config {
    fn default() -> Self {
        Self {
            scaling_ratio: 1.0,
            gravity: 1.0,
            edge_influence: 0.0,
            jitter_tolerance: 1.0,
            tau: 0.5,
            prevent_overlap: false,
            strong_gravity: false,
            dissuade_hubs: false,
            lin_log: false,
        }
    }
}

impl ForceAtlas2Config {
    pub fn validate(&self) -> Result<()> {
        let finite = [
            ("scaling_ratio", self.scaling_ratio),
            ("gravity", self.gravity),
            ("edge_influence", self.edge_influence),
            ("jitter_tolerance", self.jitter_tolerance),
            ("tau", self.tau),
        ];
        for (name, value) in finite {
            if !value.is_finite() {
                return Err(SimError::invalid(format!("{name} must be finite")));
            }
        }
        if self.scaling_ratio <= 0.0 {
            return Err(SimError::invalid("scaling_ratio must be positive"));
        }
        if self.gravity < 0.0 {
            return Err(SimError::invalid("gravity must not be negative"));
        }
        if self.jitter_tolerance <= 0.0 {
            return Err(SimError::invalid("jitter_tolerance must be positive"));
        }
        if self.tau <= 0.0 || self.tau > 1.0 {
            return Err(SimError::invalid("tau must be in (0, 1]"));
        }
        Ok(())
    }

    pub(crate) fn force_params(&self) -> ForceParams {
        let mut flags = 0;
        if self.prevent_overlap {
            flags |= FLAG_PREVENT_OVERLAP;
        }
        if self.strong_gravity {
            flags |= FLAG_STRONG_GRAVITY;
        }
        if self.dissuade_hubs {
            flags |= FLAG_DISSUADE_HUBS;
        }
        if self.lin_log {
            flags |= FLAG_LIN_LOG;
        }
        ForceParams {
            scaling_ratio: self.scaling_ratio,
            gravity: self.gravity,
            edge_influence: self.edge_influence,
            tau: self.tau,
            flags,
        }
    }
}

/// Device parallelism parameters used to size the tree and dispatches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceProfile {
    /// Overrides the warp size the device reports.
    pub warp_size: Option<u32>,
    pub block_count: u32,
    pub stages: StageGeometry,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            warp_size: None,
            block_count: DEFAULT_BLOCK_COUNT,
            stages: StageGeometry::default(),
        }
    }
}

/// Point locks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Locks {
    /// Freeze every point; ticks dispatch nothing.
    pub lock_points: bool,
}

/// Everything a simulator needs besides its device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub physics: ForceAtlas2Config,
    pub device: DeviceProfile,
    pub locks: Locks,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(ForceAtlas2Config::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_tau() {
        let config = ForceAtlas2Config {
            tau: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ForceAtlas2Config {
            tau: f32::NAN,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_flags_packed() {
        let config = ForceAtlas2Config {
            prevent_overlap: true,
            lin_log: true,
            ..Default::default()
        };
        let params = config.force_params();
        assert_eq!(params.flags, FLAG_PREVENT_OVERLAP | FLAG_LIN_LOG);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SimConfig =
            serde_json::from_str(r#"{"physics": {"gravity": 3.0}}"#).unwrap();
        assert_eq!(config.physics.gravity, 3.0);
        assert_eq!(config.physics.tau, 0.5);
        assert_eq!(config.device.block_count, DEFAULT_BLOCK_COUNT);
    }
}
