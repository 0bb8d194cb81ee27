//! JSON description of a simulated arena run.

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use crate::camera::{CameraSettings, SimulatedCamera};
use crate::impairment::{LinkProfile, ProfileError};
use crate::robot::SimulatedRobot;
use crate::world::{ArenaWorld, FloorPoint, Pose};

#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    #[error("failed to read scenario '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse scenario: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("robot '{robot}': {source}")]
    Link {
        robot: String,
        #[source]
        source: ProfileError,
    },
    #[error("robot '{robot}' has non-positive gain {gain}")]
    Gain { robot: String, gain: f64 },
    #[error("duplicate actor name '{0}'")]
    Duplicate(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RobotSpec {
    pub name: String,
    pub x_cm: f64,
    pub y_cm: f64,
    #[serde(default)]
    pub heading_deg: f64,
    /// Centimetres travelled per command unit.
    #[serde(default = "unit_gain")]
    pub gain: f64,
    #[serde(default)]
    pub link: LinkProfile,
}

fn unit_gain() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PointSpec {
    pub name: String,
    pub x_cm: f64,
    pub y_cm: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Scenario {
    pub length_cm: f64,
    pub height_cm: f64,
    #[serde(default)]
    pub camera: CameraSettings,
    pub robots: Vec<RobotSpec>,
    #[serde(default)]
    pub action_points: Vec<PointSpec>,
    /// Polygons in centimetres.
    #[serde(default)]
    pub obstacles: Vec<Vec<[f64; 2]>>,
}

/// A ready-to-run simulation.
pub struct SimArena {
    pub world: Arc<ArenaWorld>,
    pub robots: Vec<Arc<SimulatedRobot>>,
    pub camera: SimulatedCamera,
}

impl Scenario {
    pub fn from_json_file(path: &Path) -> Result<Self, ScenarioError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ScenarioError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let scenario: Self = serde_json::from_str(&raw)?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn validate(&self) -> Result<(), ScenarioError> {
        let mut seen = std::collections::HashSet::new();
        let names = self
            .robots
            .iter()
            .map(|r| &r.name)
            .chain(self.action_points.iter().map(|p| &p.name));
        for name in names {
            if !seen.insert(name) {
                return Err(ScenarioError::Duplicate(name.clone()));
            }
        }
        for robot in &self.robots {
            robot.link.validate().map_err(|source| ScenarioError::Link {
                robot: robot.name.clone(),
                source,
            })?;
            if !(robot.gain.is_finite() && robot.gain > 0.0) {
                return Err(ScenarioError::Gain {
                    robot: robot.name.clone(),
                    gain: robot.gain,
                });
            }
        }
        Ok(())
    }

    pub fn build(&self) -> SimArena {
        let world = self
            .action_points
            .iter()
            .fold(ArenaWorld::new(self.length_cm, self.height_cm), |w, p| {
                w.with_action_point(p.name.clone(), FloorPoint::new(p.x_cm, p.y_cm))
            });
        let world = self.obstacles.iter().fold(world, |w, outline| {
            w.with_obstacle(outline.iter().map(|[x, y]| FloorPoint::new(*x, *y)).collect())
        });
        let world = Arc::new(world);

        let robots = self
            .robots
            .iter()
            .map(|spec| {
                world.place_robot(spec.name.clone(), Pose::new(spec.x_cm, spec.y_cm, spec.heading_deg));
                Arc::new(SimulatedRobot::new(
                    spec.name.clone(),
                    world.clone(),
                    spec.gain,
                    spec.link.clone(),
                ))
            })
            .collect();

        tracing::info!(
            robots = self.robots.len(),
            action_points = self.action_points.len(),
            obstacles = self.obstacles.len(),
            "Simulated arena built"
        );
        SimArena {
            camera: SimulatedCamera::new(world.clone(), self.camera.clone()),
            world,
            robots,
        }
    }
}
