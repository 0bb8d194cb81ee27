//! Closed-loop search for the command-unit → distance factor of one robot.
//!
//! The robot is commanded forward by `move_amount`, the squared displacement
//! is measured, and the robot is sent back. Overshooting halves the amount,
//! undershooting doubles it; once the target has been bracketed from both
//! sides the search bisects the bracket instead. This is a heuristic: with
//! noisy actuation it need not converge, so it stops after
//! `max_iterations` and reports [`CalibrationError::CalibrationFailed`].
//!
//! Every link call goes through the configured [`RetryPolicy`](crate::interface::RetryPolicy), and the
//! return move is sent even when the measurement after the forward move
//! was lost.

use crate::config::CalibrationConfig;
use crate::interface::{InterfaceError, PhysicalInterface};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CalibrationError {
    #[error("calibration of '{robot}' did not converge after {iterations} iterations (last squared displacement {last_displacement})")]
    CalibrationFailed {
        robot: String,
        iterations: usize,
        last_displacement: f64,
    },
    #[error(transparent)]
    Interface(#[from] InterfaceError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationOutcome {
    /// Command units per unit of target displacement.
    pub factor: f64,
    pub move_amount: f64,
    pub iterations: usize,
    pub displacement: f64,
}

/// Runs the search and installs the resulting factor on `robot`.
pub async fn calibrate(
    robot: &dyn PhysicalInterface,
    config: &CalibrationConfig,
) -> Result<CalibrationOutcome, CalibrationError> {
    let failed = |iterations, last_displacement| CalibrationError::CalibrationFailed {
        robot: robot.name().to_string(),
        iterations,
        last_displacement,
    };

    // Measure raw command units.
    robot.set_calibration(1.0);

    let mut move_amount = config.initial_move;
    let mut undershoot: Option<f64> = None;
    let mut overshoot: Option<f64> = None;
    let mut displacement = f64::NAN;

    let policy = config.retry_policy();
    let name = robot.name();
    let log_retry = |attempt: u32, e: &InterfaceError| {
        tracing::warn!(robot = name, attempt, error = %e, "Calibration link call failed; retrying");
    };

    for iteration in 1..=config.max_iterations {
        let (x0, y0) = policy.run(name, || robot.location(), log_retry).await?;
        policy.run(name, || robot.move_by(move_amount), log_retry).await?;
        let measured = policy.run(name, || robot.location(), log_retry).await;
        // Go back to the start even when the readout was lost.
        let returned = policy.run(name, || robot.move_by(-move_amount), log_retry).await;
        let (x1, y1) = measured?;
        returned?;
        displacement = (x1 - x0).powi(2) + (y1 - y0).powi(2);

        tracing::debug!(
            robot = robot.name(),
            iteration,
            move_amount,
            displacement,
            "Calibration step"
        );

        if !displacement.is_finite() {
            return Err(failed(iteration, displacement));
        }
        if (displacement - config.target).abs() <= config.eps {
            let factor = move_amount / config.target;
            robot.set_calibration(factor);
            tracing::info!(robot = robot.name(), factor, iterations = iteration, "Robot calibrated");
            return Ok(CalibrationOutcome {
                factor,
                move_amount,
                iterations: iteration,
                displacement,
            });
        }

        if displacement > config.target {
            overshoot = Some(move_amount);
            move_amount = match undershoot {
                Some(low) => (low + move_amount) / 2.0,
                None => move_amount / 2.0,
            };
        } else {
            undershoot = Some(move_amount);
            move_amount = match overshoot {
                Some(high) => (move_amount + high) / 2.0,
                None => move_amount * 2.0,
            };
        }

        if !(move_amount.is_finite() && move_amount > 0.0) {
            return Err(failed(iteration, displacement));
        }
    }

    Err(failed(config.max_iterations, displacement))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Moves `gain × distance × calibration` along x, optionally capped.
    struct Actuator {
        gain: f64,
        cap: Option<f64>,
        position: Mutex<(f64, f64)>,
        factor: Mutex<f64>,
        /// Decides from the 1-based call number whether a readout is lost.
        drops_location: Box<dyn Fn(usize) -> bool + Send + Sync>,
        location_calls: AtomicUsize,
    }

    impl Actuator {
        fn linear(gain: f64) -> Self {
            Self {
                gain,
                cap: None,
                position: Mutex::new((0.0, 0.0)),
                factor: Mutex::new(1.0),
                drops_location: Box::new(|_| false),
                location_calls: AtomicUsize::new(0),
            }
        }

        fn x(&self) -> f64 {
            self.position.lock().unwrap().0
        }
    }

    #[async_trait]
    impl PhysicalInterface for Actuator {
        fn name(&self) -> &str {
            "robot-test"
        }

        async fn connect(&self) -> Result<(), InterfaceError> {
            Ok(())
        }

        async fn move_by(&self, distance: f64) -> Result<(), InterfaceError> {
            let mut step = self.gain * distance * *self.factor.lock().unwrap();
            if let Some(cap) = self.cap {
                step = step.clamp(-cap, cap);
            }
            self.position.lock().unwrap().0 += step;
            Ok(())
        }

        async fn turn(&self, _angle_degrees: f64) -> Result<(), InterfaceError> {
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), InterfaceError> {
            Ok(())
        }

        fn set_calibration(&self, factor: f64) {
            *self.factor.lock().unwrap() = factor;
        }

        fn calibration(&self) -> f64 {
            *self.factor.lock().unwrap()
        }

        async fn location(&self) -> Result<(f64, f64), InterfaceError> {
            let call = self.location_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if (self.drops_location)(call) {
                return Err(InterfaceError::RobotUnreachable {
                    robot: "robot-test".into(),
                    reason: "link down".into(),
                });
            }
            Ok(*self.position.lock().unwrap())
        }
    }

    fn config(eps: f64) -> CalibrationConfig {
        CalibrationConfig {
            target: 1.0,
            eps,
            initial_move: 1.0,
            max_iterations: 64,
            retry_backoff_ms: 1,
            ..CalibrationConfig::default()
        }
    }

    #[tokio::test]
    async fn converges_to_inverse_gain() {
        let robot = Actuator::linear(3.0);
        let outcome = calibrate(&robot, &config(1e-3)).await.unwrap();
        assert!((outcome.factor - 1.0 / 3.0).abs() <= 1e-3);
        assert!(outcome.iterations <= 20, "took {}", outcome.iterations);
        assert_eq!(robot.calibration(), outcome.factor);
        // Every trial move is undone.
        assert!(robot.position.lock().unwrap().0.abs() < 1e-9);
    }

    #[tokio::test]
    async fn iterations_grow_logarithmically_with_precision() {
        let coarse = calibrate(&Actuator::linear(0.7), &config(1e-2)).await.unwrap();
        let fine = calibrate(&Actuator::linear(0.7), &config(1e-8)).await.unwrap();
        assert!((fine.factor - 1.0 / 0.7).abs() <= 1e-6);
        // Six extra decimal digits cost roughly log2(1e6) ≈ 20 extra trial moves.
        assert!(fine.iterations <= coarse.iterations + 24);
    }

    #[tokio::test]
    async fn exact_power_of_two_gain_is_hit_directly() {
        let outcome = calibrate(&Actuator::linear(4.0), &config(1e-6)).await.unwrap();
        assert_eq!(outcome.move_amount, 0.25);
        assert_eq!(outcome.iterations, 3);
    }

    #[tokio::test]
    async fn stuck_robot_hits_iteration_cap() {
        let stuck = Actuator {
            gain: 0.0,
            ..Actuator::linear(1.0)
        };
        let mut cfg = config(1e-3);
        cfg.max_iterations = 12;
        let err = calibrate(&stuck, &cfg).await.unwrap_err();
        assert!(matches!(
            err,
            CalibrationError::CalibrationFailed { iterations: 12, .. }
        ));
    }

    #[tokio::test]
    async fn saturation_above_target_does_not_matter() {
        let robot = Actuator {
            cap: Some(2.0),
            ..Actuator::linear(10.0)
        };
        let outcome = calibrate(&robot, &config(1e-3)).await.unwrap();
        assert!((outcome.factor - 0.1).abs() <= 1e-3);
    }

    #[tokio::test]
    async fn link_failure_is_propagated() {
        let robot = Actuator {
            drops_location: Box::new(|_| true),
            ..Actuator::linear(1.0)
        };
        let err = calibrate(&robot, &config(1e-3)).await.unwrap_err();
        assert!(matches!(
            err,
            CalibrationError::Interface(InterfaceError::RobotUnreachable { .. })
        ));
        assert_eq!(robot.location_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn lost_readout_after_the_move_is_retried() {
        let robot = Actuator {
            drops_location: Box::new(|call| call == 2),
            ..Actuator::linear(2.0)
        };
        let outcome = calibrate(&robot, &config(1e-3)).await.unwrap();
        assert!((outcome.factor - 0.5).abs() <= 1e-3);
        assert!(robot.x().abs() < 1e-9);
    }

    #[tokio::test]
    async fn robot_is_returned_before_a_lost_readout_fails_the_search() {
        let robot = Actuator {
            drops_location: Box::new(|call| call >= 2),
            ..Actuator::linear(2.0)
        };
        let err = calibrate(&robot, &config(1e-3)).await.unwrap_err();
        assert!(matches!(err, CalibrationError::Interface(_)));
        assert!(robot.x().abs() < 1e-9);
    }
}
