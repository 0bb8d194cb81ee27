//! Ground truth shared by the simulated robots and the simulated camera.

use std::collections::BTreeMap;

use nalgebra::{Point2, Vector2};
use parking_lot::RwLock;

/// A point on the arena floor in centimetres, origin at the top-left corner,
/// y growing towards the bottom edge.
pub type FloorPoint = Point2<f64>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub position: FloorPoint,
    /// Compass heading in degrees: 0 towards the top edge, clockwise.
    pub heading_deg: f64,
}

impl Pose {
    pub fn new(x_cm: f64, y_cm: f64, heading_deg: f64) -> Self {
        Self {
            position: FloorPoint::new(x_cm, y_cm),
            heading_deg: heading_deg.rem_euclid(360.0),
        }
    }

    pub fn forward(&self) -> Vector2<f64> {
        let r = self.heading_deg.to_radians();
        Vector2::new(r.sin(), -r.cos())
    }

    pub fn advance(&mut self, distance_cm: f64) {
        self.position += self.forward() * distance_cm;
    }

    /// Positive angles turn clockwise.
    pub fn rotate(&mut self, angle_deg: f64) {
        self.heading_deg = (self.heading_deg + angle_deg).rem_euclid(360.0);
    }

    /// Heading as an image angle: 0 along +x, growing towards +y.
    pub fn image_orientation(&self) -> f64 {
        self.heading_deg - 90.0
    }
}

#[derive(Debug)]
pub struct ArenaWorld {
    length_cm: f64,
    height_cm: f64,
    robots: RwLock<BTreeMap<String, Pose>>,
    action_points: Vec<(String, FloorPoint)>,
    obstacles: Vec<Vec<FloorPoint>>,
}

impl ArenaWorld {
    pub fn new(length_cm: f64, height_cm: f64) -> Self {
        Self {
            length_cm,
            height_cm,
            robots: RwLock::new(BTreeMap::new()),
            action_points: Vec::new(),
            obstacles: Vec::new(),
        }
    }

    pub fn with_action_point(mut self, name: impl Into<String>, at: FloorPoint) -> Self {
        self.action_points.push((name.into(), at));
        self
    }

    pub fn with_obstacle(mut self, outline: Vec<FloorPoint>) -> Self {
        self.obstacles.push(outline);
        self
    }

    pub fn place_robot(&self, name: impl Into<String>, pose: Pose) {
        self.robots.write().insert(name.into(), pose);
    }

    pub fn length_cm(&self) -> f64 {
        self.length_cm
    }

    pub fn height_cm(&self) -> f64 {
        self.height_cm
    }

    pub fn pose(&self, robot: &str) -> Option<Pose> {
        self.robots.read().get(robot).copied()
    }

    /// Applies `f` to the robot's pose. Returns false for unknown robots.
    pub fn update(&self, robot: &str, f: impl FnOnce(&mut Pose)) -> bool {
        match self.robots.write().get_mut(robot) {
            Some(pose) => {
                f(pose);
                true
            }
            None => false,
        }
    }

    pub fn robots(&self) -> Vec<(String, Pose)> {
        self.robots
            .read()
            .iter()
            .map(|(name, pose)| (name.clone(), *pose))
            .collect()
    }

    pub fn action_points(&self) -> &[(String, FloorPoint)] {
        &self.action_points
    }

    pub fn obstacles(&self) -> &[Vec<FloorPoint>] {
        &self.obstacles
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advancing_follows_compass_heading() {
        let mut pose = Pose::new(10.0, 10.0, 0.0);
        pose.advance(5.0);
        assert!((pose.position - FloorPoint::new(10.0, 5.0)).norm() < 1e-9);

        pose.rotate(90.0);
        pose.advance(2.0);
        assert!((pose.position - FloorPoint::new(12.0, 5.0)).norm() < 1e-9);

        pose.rotate(-180.0);
        assert_eq!(pose.heading_deg, 270.0);
        assert_eq!(pose.image_orientation(), 180.0);
    }

    #[test]
    fn updates_reach_only_known_robots() {
        let world = ArenaWorld::new(90.0, 60.0);
        world.place_robot("robot1", Pose::new(0.0, 0.0, 90.0));
        assert!(world.update("robot1", |p| p.advance(3.0)));
        assert!(!world.update("robot9", |p| p.advance(3.0)));
        assert!((world.pose("robot1").unwrap().position.x - 3.0).abs() < 1e-9);
    }
}
