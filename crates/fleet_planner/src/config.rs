use crate::interface::RetryPolicy;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Offset between the physical corner markers and the usable rectangle.
const CORNER_OFFSET_CM: f64 = 0.5;

/// Scalars consumed by the planning pipeline.
///
/// Every field has a default matching the reference arena (a 61.5 × 92 cm
/// board with corner markers inset by half a centimetre), so a partial JSON
/// document only needs to name what it overrides.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Edge length of one grid cell in centimetres.
    pub block_size_cm: f64,
    /// Physical extent of the arena along the image y axis.
    pub arena_height_cm: f64,
    /// Physical extent of the arena along the image x axis.
    pub arena_length_cm: f64,
    /// Nodes closer than this (pixels) to an obstacle outline get penalised.
    pub obstacle_proximity_px: f64,
    /// Obstacle outlines at or below this area (square pixels) are noise.
    pub obstacle_min_area_px: f64,
    /// Multiplicative factor applied to edges touching a penalised node.
    pub obstacle_penalty: f64,
    /// Milliseconds needed to travel one centimetre.
    pub move_ms_per_cm: f64,
    /// Milliseconds needed to turn through 45 degrees.
    pub turn_ms_per_45deg: f64,
    /// Deadline handed to every generated task.
    pub deadline_sentinel: u64,
    /// Cost-matrix entry for pairs with no path.
    pub unreachable_cost: u64,
    pub calibration: CalibrationConfig,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            block_size_cm: 3.0,
            arena_height_cm: 61.5 - 2.0 * CORNER_OFFSET_CM,
            arena_length_cm: 92.0 - 2.0 * CORNER_OFFSET_CM,
            obstacle_proximity_px: 60.0,
            obstacle_min_area_px: 3000.0,
            obstacle_penalty: 25.0,
            move_ms_per_cm: 13.0,
            turn_ms_per_45deg: 50.0,
            deadline_sentinel: 100_000_000,
            unreachable_cost: 10_000_000,
            calibration: CalibrationConfig::default(),
        }
    }
}

impl PlannerConfig {
    /// Reads a JSON override file; missing fields keep their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("block_size_cm", self.block_size_cm),
            ("arena_height_cm", self.arena_height_cm),
            ("arena_length_cm", self.arena_length_cm),
            ("obstacle_penalty", self.obstacle_penalty),
            ("calibration.target", self.calibration.target),
            ("calibration.eps", self.calibration.eps),
            ("calibration.initial_move", self.calibration.initial_move),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::Invalid { name, value });
            }
        }
        if self.obstacle_penalty < 1.0 {
            return Err(ConfigError::Invalid {
                name: "obstacle_penalty",
                value: self.obstacle_penalty,
            });
        }
        Ok(())
    }
}

/// Parameters of the closed-loop movement calibration search.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Squared displacement the search aims for, in position units².
    pub target: f64,
    pub eps: f64,
    /// First `move` amount tried.
    pub initial_move: f64,
    pub max_iterations: usize,
    /// Attempts per link call before a lost packet fails the search.
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
    /// Upper bound on one link call.
    pub command_timeout_ms: u64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            target: 1.0,
            eps: 1e-2,
            initial_move: 1.0,
            max_iterations: 64,
            retry_attempts: 3,
            retry_backoff_ms: 50,
            command_timeout_ms: 2000,
        }
    }
}

impl CalibrationConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry_attempts,
            backoff: Duration::from_millis(self.retry_backoff_ms),
            attempt_timeout: Duration::from_millis(self.command_timeout_ms),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read planner config '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse planner config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("planner config value {name} = {value} is out of range")]
    Invalid { name: &'static str, value: f64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config: PlannerConfig =
            serde_json::from_str(r#"{ "block_size_cm": 5.0, "calibration": { "eps": 0.001 } }"#)
                .unwrap();
        assert_eq!(config.block_size_cm, 5.0);
        assert_eq!(config.arena_length_cm, 91.0);
        assert_eq!(config.calibration.eps, 0.001);
        assert_eq!(config.calibration.max_iterations, 64);
        assert_eq!(config.calibration.retry_policy().attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_non_positive_block_size() {
        let config = PlannerConfig {
            block_size_cm: 0.0,
            ..PlannerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { name: "block_size_cm", .. })
        ));
    }
}
