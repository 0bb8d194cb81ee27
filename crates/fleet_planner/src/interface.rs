//! The physical robot link, seen from the planner.
//!
//! Transport details (Bluetooth bridge, HTTP relay, simulator) live behind
//! [`PhysicalInterface`]; the planner only needs the movement verbs and a
//! position readout.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InterfaceError {
    /// The link did not answer or timed out. Worth retrying.
    #[error("robot '{robot}' unreachable: {reason}")]
    RobotUnreachable { robot: String, reason: String },
    /// The robot answered and refused the command. Retrying will not help.
    #[error("robot '{robot}' rejected command: {reason}")]
    CommandRejected { robot: String, reason: String },
}

impl InterfaceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, InterfaceError::RobotUnreachable { .. })
    }
}

/// Bounded retries of transient link failures, with doubling backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    /// Delay before the first retry.
    pub backoff: Duration,
    /// A single attempt that takes longer counts as unreachable.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(100),
            attempt_timeout: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff * 2u32.saturating_pow(attempt.saturating_sub(1))
    }

    /// Runs `op` until it succeeds, fails permanently or runs out of
    /// attempts. `on_retry` sees each transient failure about to be retried.
    pub async fn run<T, F, Fut>(
        &self,
        robot: &str,
        mut op: F,
        mut on_retry: impl FnMut(u32, &InterfaceError),
    ) -> Result<T, InterfaceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, InterfaceError>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(self.attempt_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(InterfaceError::RobotUnreachable {
                    robot: robot.to_string(),
                    reason: format!("no answer within {} ms", self.attempt_timeout.as_millis()),
                }),
            };
            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < attempts => {
                    on_retry(attempt, &e);
                    tokio::time::sleep(self.delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Capability object held by a robot actor.
///
/// `move_by` distances are multiplied by the factor last installed with
/// [`set_calibration`](PhysicalInterface::set_calibration) before they are
/// sent; the factor starts at 1.
#[async_trait]
pub trait PhysicalInterface: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<(), InterfaceError>;

    async fn move_by(&self, distance: f64) -> Result<(), InterfaceError>;

    /// Positive angles turn clockwise (right).
    async fn turn(&self, angle_degrees: f64) -> Result<(), InterfaceError>;

    async fn disconnect(&self) -> Result<(), InterfaceError>;

    fn set_calibration(&self, factor: f64);

    fn calibration(&self) -> f64;

    /// Current position as seen by the positioning system.
    async fn location(&self) -> Result<(f64, f64), InterfaceError>;
}
