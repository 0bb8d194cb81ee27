use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// `fleet_orchestrator` - perception-driven task allocation and dispatch for
/// a small robot fleet.
///
/// Watches the arena through the camera, allocates pickup/dropoff tasks once
/// the actors are known, and dispatches the compiled movement instructions to
/// every registered robot.
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// The listen address for the Prometheus metrics server.
    #[arg(long, env = "FLEET_METRICS_LISTEN_ADDR", default_value = "0.0.0.0:9091")]
    pub metrics_listen_addr: SocketAddr,

    /// JSON robot registry (`{"devices": [{"name", "address", "write_uuid"}]}`).
    ///
    /// Only robots listed here are calibrated and dispatched to.
    #[arg(long, env = "FLEET_REGISTRY_PATH")]
    pub registry_path: PathBuf,

    /// JSON description of the simulated arena the camera and robots live in.
    #[arg(long, env = "FLEET_SCENARIO_PATH")]
    pub scenario_path: PathBuf,

    /// Optional JSON file overriding planner constants.
    #[arg(long, env = "FLEET_PLANNER_CONFIG")]
    pub planner_config: Option<PathBuf>,

    /// Control loop ticks per second.
    #[arg(long, env = "FLEET_TICK_RATE_HZ", default_value_t = 10)]
    pub tick_rate_hz: u64,

    /// Camera frames captured per second.
    #[arg(long, env = "FLEET_FRAME_RATE_HZ", default_value_t = 30)]
    pub frame_rate_hz: u64,

    /// Rebuild the grid graph every this many frames, or whenever corners
    /// are re-detected.
    #[arg(long, env = "FLEET_GRAPH_REFRESH_FRAMES", default_value_t = 15)]
    pub graph_refresh_frames: u64,

    /// Attempts per instruction before an unreachable robot is left for
    /// the next tick.
    #[arg(long, env = "FLEET_DISPATCH_RETRY_ATTEMPTS", default_value_t = 3)]
    pub dispatch_retry_attempts: u32,

    /// Backoff before the first retry; doubles on each further attempt.
    #[arg(long, env = "FLEET_DISPATCH_BACKOFF_MS", default_value_t = 100)]
    pub dispatch_backoff_ms: u64,

    /// Per-attempt deadline for a robot to answer a command.
    #[arg(long, env = "FLEET_DISPATCH_TIMEOUT_MS", default_value_t = 2000)]
    pub dispatch_timeout_ms: u64,

    /// How long to wait for the control and perception tasks at shutdown.
    #[arg(long, env = "FLEET_JOIN_TIMEOUT_MS", default_value_t = 2000)]
    pub join_timeout_ms: u64,

    /// Skip the movement calibration before allocation.
    #[arg(long, env = "FLEET_SKIP_CALIBRATION")]
    pub skip_calibration: bool,
}

impl Config {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(1000 / self.tick_rate_hz.max(1))
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(1000 / self.frame_rate_hz.max(1))
    }

    pub fn dispatch_backoff(&self) -> Duration {
        Duration::from_millis(self.dispatch_backoff_ms)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}
