use std::sync::Arc;

use fleet_planner::actor::{ActorDetection, BoundingBox, Observation, PerceptionError, PerceptionSource};
use fleet_planner::arena::{Corner, PixelPoint};
use fleet_planner::graph::Obstacle;
use rand::Rng;
use serde::Deserialize;

use crate::world::{ArenaWorld, FloorPoint};

/// How the overhead camera sees the arena.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    /// Pixel position of the arena's top-left corner.
    pub origin_px: [f64; 2],
    pub px_per_cm: f64,
    /// Edge of the square bounding box drawn around every actor.
    pub actor_size_px: f64,
    /// Corners are re-detected on the first frame and every this many frames.
    pub corner_interval_frames: u64,
    /// Uniform noise added to actor centres, in pixels.
    pub position_noise_px: f64,
    /// The stream ends after this many frames.
    pub max_frames: Option<u64>,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            origin_px: [40.0, 30.0],
            px_per_cm: 10.0,
            actor_size_px: 30.0,
            corner_interval_frames: 30,
            position_noise_px: 0.0,
            max_frames: None,
        }
    }
}

/// Renders the [`ArenaWorld`] into per-frame observations.
pub struct SimulatedCamera {
    world: Arc<ArenaWorld>,
    settings: CameraSettings,
    frame: u64,
    released: bool,
}

impl SimulatedCamera {
    pub fn new(world: Arc<ArenaWorld>, settings: CameraSettings) -> Self {
        Self {
            world,
            settings,
            frame: 0,
            released: false,
        }
    }

    pub fn frames_captured(&self) -> u64 {
        self.frame
    }

    pub fn to_pixel(&self, p: FloorPoint) -> PixelPoint {
        let [ox, oy] = self.settings.origin_px;
        PixelPoint::new(ox + p.x * self.settings.px_per_cm, oy + p.y * self.settings.px_per_cm)
    }

    fn corners(&self) -> Vec<(String, PixelPoint)> {
        let (l, h) = (self.world.length_cm(), self.world.height_cm());
        Corner::ALL
            .iter()
            .map(|c| {
                let at = match c {
                    Corner::TopLeft => FloorPoint::new(0.0, 0.0),
                    Corner::TopRight => FloorPoint::new(l, 0.0),
                    Corner::BottomLeft => FloorPoint::new(0.0, h),
                    Corner::BottomRight => FloorPoint::new(l, h),
                };
                (c.name().to_string(), self.to_pixel(at))
            })
            .collect()
    }

    fn detect(&self, name: &str, at: FloorPoint, orientation: Option<f64>) -> ActorDetection {
        let mut center = self.to_pixel(at);
        let noise = self.settings.position_noise_px;
        if noise > 0.0 {
            let mut rng = rand::thread_rng();
            center.x += rng.gen_range(-noise..=noise);
            center.y += rng.gen_range(-noise..=noise);
        }
        ActorDetection {
            name: name.to_string(),
            bbox: BoundingBox::around(center, self.settings.actor_size_px),
            orientation,
        }
    }
}

impl PerceptionSource for SimulatedCamera {
    fn capture(&mut self) -> Result<Observation, PerceptionError> {
        if self.released {
            return Err(PerceptionError::Device("camera already released".into()));
        }
        if self.settings.max_frames.is_some_and(|max| self.frame >= max) {
            return Err(PerceptionError::StreamEnded);
        }
        self.frame += 1;

        let interval = self.settings.corner_interval_frames.max(1);
        let corners = (self.frame == 1 || self.frame % interval == 0).then(|| self.corners());

        let mut actors: Vec<ActorDetection> = self
            .world
            .robots()
            .into_iter()
            .map(|(name, pose)| self.detect(&name, pose.position, Some(pose.image_orientation())))
            .collect();
        actors.extend(
            self.world
                .action_points()
                .iter()
                .map(|(name, at)| self.detect(name, *at, None)),
        );

        let obstacles = self
            .world
            .obstacles()
            .iter()
            .map(|outline| Obstacle::new(outline.iter().map(|p| self.to_pixel(*p)).collect()))
            .collect();

        Ok(Observation {
            corners,
            actors,
            obstacles,
        })
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            tracing::info!(frames = self.frame, "Simulated camera released");
        }
    }
}
