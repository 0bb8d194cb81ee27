use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use fleet_planner::interface::{InterfaceError, PhysicalInterface};
use parking_lot::Mutex;

use crate::impairment::{LinkOutcome, LinkProfile};
use crate::world::ArenaWorld;

/// A differential-drive robot living in an [`ArenaWorld`].
///
/// One command unit moves the robot `gain` centimetres, so an uncalibrated
/// robot over- or under-shoots by that factor. Every command crosses the
/// robot's [`LinkProfile`].
pub struct SimulatedRobot {
    name: String,
    world: Arc<ArenaWorld>,
    gain: f64,
    link: LinkProfile,
    calibration: Mutex<f64>,
    connected: AtomicBool,
    delivered: AtomicU64,
}

impl SimulatedRobot {
    pub fn new(name: impl Into<String>, world: Arc<ArenaWorld>, gain: f64, link: LinkProfile) -> Self {
        Self {
            name: name.into(),
            world,
            gain,
            link,
            calibration: Mutex::new(1.0),
            connected: AtomicBool::new(false),
            delivered: AtomicU64::new(0),
        }
    }

    pub fn gain(&self) -> f64 {
        self.gain
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Commands that made it through the link.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    fn unreachable(&self, reason: &str) -> InterfaceError {
        InterfaceError::RobotUnreachable {
            robot: self.name.clone(),
            reason: reason.to_string(),
        }
    }

    async fn send(&self, verb: &str) -> Result<(), InterfaceError> {
        if !self.is_connected() {
            return Err(self.unreachable("not connected"));
        }
        match self.link.transmit().await {
            LinkOutcome::Delivered => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            LinkOutcome::Dropped => {
                tracing::debug!(robot = %self.name, verb, "Simulated link dropped command");
                Err(self.unreachable("command lost on link"))
            }
            LinkOutcome::Rejected => Err(InterfaceError::CommandRejected {
                robot: self.name.clone(),
                reason: format!("{verb} refused by firmware"),
            }),
        }
    }

    fn apply(&self, f: impl FnOnce(&mut crate::world::Pose)) -> Result<(), InterfaceError> {
        if self.world.update(&self.name, f) {
            Ok(())
        } else {
            Err(self.unreachable("robot is not in the arena"))
        }
    }
}

#[async_trait]
impl PhysicalInterface for SimulatedRobot {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<(), InterfaceError> {
        if self.link.transmit().await == LinkOutcome::Dropped {
            return Err(self.unreachable("connection attempt timed out"));
        }
        self.connected.store(true, Ordering::Release);
        tracing::info!(robot = %self.name, "Simulated robot connected");
        Ok(())
    }

    async fn move_by(&self, distance: f64) -> Result<(), InterfaceError> {
        let units = distance * *self.calibration.lock();
        self.send("move").await?;
        let travelled = units * self.gain;
        self.apply(|pose| pose.advance(travelled))
    }

    async fn turn(&self, angle_degrees: f64) -> Result<(), InterfaceError> {
        self.send("turn").await?;
        self.apply(|pose| pose.rotate(angle_degrees))
    }

    async fn disconnect(&self) -> Result<(), InterfaceError> {
        self.connected.store(false, Ordering::Release);
        tracing::info!(robot = %self.name, "Simulated robot disconnected");
        Ok(())
    }

    fn set_calibration(&self, factor: f64) {
        *self.calibration.lock() = factor;
    }

    fn calibration(&self) -> f64 {
        *self.calibration.lock()
    }

    async fn location(&self) -> Result<(f64, f64), InterfaceError> {
        if self.link.transmit().await == LinkOutcome::Dropped {
            return Err(self.unreachable("position readout lost"));
        }
        self.world
            .pose(&self.name)
            .map(|p| (p.position.x, p.position.y))
            .ok_or_else(|| self.unreachable("robot is not in the arena"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::Pose;
    use fleet_planner::calibration::calibrate;
    use fleet_planner::config::CalibrationConfig;

    fn robot(gain: f64, link: LinkProfile) -> (Arc<ArenaWorld>, SimulatedRobot) {
        let world = Arc::new(ArenaWorld::new(90.0, 60.0));
        world.place_robot("robot1", Pose::new(30.0, 30.0, 90.0));
        let robot = SimulatedRobot::new("robot1", world.clone(), gain, link);
        (world, robot)
    }

    #[tokio::test]
    async fn movement_is_scaled_by_gain_and_calibration() {
        let (world, robot) = robot(2.0, LinkProfile::ideal());
        robot.connect().await.unwrap();

        robot.move_by(5.0).await.unwrap();
        assert!((world.pose("robot1").unwrap().position.x - 40.0).abs() < 1e-9);

        robot.set_calibration(0.5);
        robot.move_by(5.0).await.unwrap();
        assert!((world.pose("robot1").unwrap().position.x - 45.0).abs() < 1e-9);
        assert_eq!(robot.delivered(), 2);
    }

    #[tokio::test]
    async fn turns_are_clockwise() {
        let (world, robot) = robot(1.0, LinkProfile::ideal());
        robot.connect().await.unwrap();
        robot.turn(90.0).await.unwrap();
        assert_eq!(world.pose("robot1").unwrap().heading_deg, 180.0);
        robot.turn(-270.0).await.unwrap();
        assert_eq!(world.pose("robot1").unwrap().heading_deg, 270.0);
    }

    #[tokio::test]
    async fn link_failures_are_classified() {
        let (_, idle) = robot(1.0, LinkProfile::ideal());
        assert!(idle.move_by(1.0).await.unwrap_err().is_transient());

        let (world, stubborn) = robot(
            1.0,
            LinkProfile {
                reject_chance_percent: 100,
                ..LinkProfile::ideal()
            },
        );
        stubborn.connect().await.unwrap();
        let err = stubborn.move_by(1.0).await.unwrap_err();
        assert!(matches!(err, InterfaceError::CommandRejected { .. }));
        assert!(!err.is_transient());
        // Rejected commands do not move the robot.
        assert_eq!(world.pose("robot1").unwrap().position.x, 30.0);
    }

    #[tokio::test]
    async fn calibration_recovers_the_inverse_gain() {
        let (world, robot) = robot(2.5, LinkProfile::ideal());
        robot.connect().await.unwrap();
        let config = CalibrationConfig {
            eps: 1e-4,
            ..CalibrationConfig::default()
        };
        let outcome = calibrate(&robot, &config).await.unwrap();
        assert!((outcome.factor - 0.4).abs() < 1e-3);

        let start = world.pose("robot1").unwrap().position;
        assert!((start.x - 30.0).abs() < 1e-6);
        robot.move_by(10.0).await.unwrap();
        assert!((world.pose("robot1").unwrap().position.x - 40.0).abs() < 0.05);
    }

    #[tokio::test]
    async fn calibration_survives_a_lossy_link() {
        let config = CalibrationConfig {
            retry_attempts: 8,
            retry_backoff_ms: 1,
            ..CalibrationConfig::default()
        };
        for _ in 0..50 {
            let (world, robot) = robot(
                1.8,
                LinkProfile {
                    drop_chance_percent: 5,
                    ..LinkProfile::ideal()
                },
            );
            while robot.connect().await.is_err() {}
            let outcome = calibrate(&robot, &config).await.unwrap();
            assert!((outcome.factor - 1.0 / 1.8).abs() < 1e-2);
            let end = world.pose("robot1").unwrap().position;
            assert!((end.x - 30.0).abs() < 1e-6 && (end.y - 30.0).abs() < 1e-6);
        }
    }
}
