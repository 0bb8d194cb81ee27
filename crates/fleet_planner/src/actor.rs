//! Tracked actors and the perception collaborator seam.

use std::collections::HashMap;

use serde::Deserialize;

use crate::arena::PixelPoint;
use crate::graph::Obstacle;
use crate::path::Direction;

/// What a tracked actor is. Fixed once, when the actor is first seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActorRole {
    Robot,
    ActionPoint,
    Other,
}

impl ActorRole {
    /// `robot*` names are robots, `action*` names are action points.
    pub fn from_name(name: &str) -> Self {
        if name.starts_with("robot") {
            ActorRole::Robot
        } else if name.starts_with("action") {
            ActorRole::ActionPoint
        } else {
            ActorRole::Other
        }
    }
}

/// Axis-aligned pixel box: top-left corner plus size.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    /// Box of `size` pixels centred on `center`.
    pub fn around(center: PixelPoint, size: f64) -> Self {
        Self::new(center.x - size / 2.0, center.y - size / 2.0, size, size)
    }

    pub fn center(&self) -> PixelPoint {
        PixelPoint::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// One actor as reported by perception in a single frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ActorDetection {
    pub name: String,
    pub bbox: BoundingBox,
    /// Image-frame heading in degrees, when the detector provides one.
    pub orientation: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackedActor {
    name: String,
    role: ActorRole,
    bbox: BoundingBox,
    orientation: Option<f64>,
    last_seen_frame: u64,
}

impl TrackedActor {
    fn new(detection: &ActorDetection, frame: u64) -> Self {
        Self {
            role: ActorRole::from_name(&detection.name),
            name: detection.name.clone(),
            bbox: detection.bbox,
            orientation: detection.orientation,
            last_seen_frame: frame,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> ActorRole {
        self.role
    }

    pub fn bbox(&self) -> BoundingBox {
        self.bbox
    }

    /// Pixel centre of the bounding box.
    pub fn location(&self) -> PixelPoint {
        self.bbox.center()
    }

    pub fn orientation(&self) -> Option<f64> {
        self.orientation
    }

    /// Orientation rounded to the nearest compass heading.
    pub fn heading(&self) -> Option<Direction> {
        self.orientation.map(Direction::from_image_heading)
    }

    pub fn last_seen_frame(&self) -> u64 {
        self.last_seen_frame
    }
}

/// Every actor ever seen, in first-seen order. Actors are never removed.
#[derive(Debug, Clone, Default)]
pub struct ActorTable {
    actors: Vec<TrackedActor>,
    index: HashMap<String, usize>,
}

impl ActorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or updates actors from one frame's detections. Returns how
    /// many actors were seen for the first time.
    pub fn observe(&mut self, detections: &[ActorDetection], frame: u64) -> usize {
        let mut created = 0;
        for detection in detections {
            match self.index.get(&detection.name) {
                Some(&i) => {
                    let actor = &mut self.actors[i];
                    actor.bbox = detection.bbox;
                    if detection.orientation.is_some() {
                        actor.orientation = detection.orientation;
                    }
                    actor.last_seen_frame = frame;
                }
                None => {
                    let actor = TrackedActor::new(detection, frame);
                    tracing::info!(name = %actor.name, role = ?actor.role, "Tracking new actor");
                    self.index.insert(actor.name.clone(), self.actors.len());
                    self.actors.push(actor);
                    created += 1;
                }
            }
        }
        created
    }

    pub fn get(&self, name: &str) -> Option<&TrackedActor> {
        self.index.get(name).map(|&i| &self.actors[i])
    }

    pub fn len(&self) -> usize {
        self.actors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackedActor> {
        self.actors.iter()
    }

    pub fn with_role(&self, role: ActorRole) -> Vec<TrackedActor> {
        self.actors.iter().filter(|a| a.role == role).cloned().collect()
    }

    pub fn robots(&self) -> Vec<TrackedActor> {
        self.with_role(ActorRole::Robot)
    }

    pub fn action_points(&self) -> Vec<TrackedActor> {
        self.with_role(ActorRole::ActionPoint)
    }

    /// Immutable copy for handing to another task.
    pub fn snapshot(&self) -> Vec<TrackedActor> {
        self.actors.clone()
    }
}

/// Everything perception extracted from one frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Observation {
    /// Named corner detections (`top_left`, …) when the arena was
    /// (re)detected this frame.
    pub corners: Option<Vec<(String, PixelPoint)>>,
    pub actors: Vec<ActorDetection>,
    pub obstacles: Vec<Obstacle>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PerceptionError {
    #[error("camera stream ended")]
    StreamEnded,
    #[error("camera failure: {0}")]
    Device(String),
}

/// Camera plus detector, owned by the perception activity.
pub trait PerceptionSource: Send {
    fn capture(&mut self) -> Result<Observation, PerceptionError>;

    /// Releases the camera. Called once at teardown.
    fn release(&mut self) {}
}
