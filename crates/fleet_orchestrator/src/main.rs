mod config;
mod control;
mod dispatch;
mod metrics;
mod perception;
mod planning;
mod registry;

use crate::config::Config;
use crate::control::{ControlLoop, Outcome};
use crate::dispatch::Dispatcher;
use crate::metrics::Metrics;
use crate::perception::{PerceptionLoop, PerceptionSettings};
use crate::planning::{CalibrationTable, PlanningSession};
use crate::registry::RobotRegistry;
use anyhow::Context;
use clap::Parser;
use fleet_planner::allocation::GreedyOracle;
use fleet_planner::graph::GraphBuilder;
use fleet_planner::interface::{PhysicalInterface, RetryPolicy};
use fleet_planner::PlannerConfig;
use sim_arena::Scenario;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let config = Config::parse();
    tracing::info!(config = ?config, "Loaded configuration");

    let mut planner_config = match &config.planner_config {
        Some(path) => PlannerConfig::from_json_file(path).context("Failed to load planner config")?,
        None => PlannerConfig::default(),
    };
    let registry = RobotRegistry::from_json_file(&config.registry_path)?;
    let scenario = Scenario::from_json_file(&config.scenario_path).context("Failed to load scenario")?;

    // The simulated board is the physical arena of this run.
    planner_config.arena_length_cm = scenario.length_cm;
    planner_config.arena_height_cm = scenario.height_cm;
    planner_config.validate().context("Scenario arena size is invalid")?;

    let arena = scenario.build();
    let metrics = Arc::new(Metrics::new());

    let mut robots: HashMap<String, Arc<dyn PhysicalInterface>> = HashMap::new();
    for robot in &arena.robots {
        let Some(device) = registry.get(robot.name()) else {
            tracing::warn!(robot = robot.name(), "Robot not in registry; it will not be commanded");
            continue;
        };
        match robot.connect().await {
            Ok(()) => {
                tracing::info!(
                    robot = robot.name(),
                    address = %device.address,
                    write_uuid = %device.write_uuid,
                    "Robot connected"
                );
                robots.insert(robot.name().to_string(), robot.clone());
            }
            Err(e) => tracing::error!(robot = robot.name(), error = %e, "Failed to connect robot"),
        }
    }
    for device in registry.devices() {
        if !robots.contains_key(&device.name) {
            tracing::warn!(robot = %device.name, "Registered robot missing from the arena");
        }
    }

    let (running_tx, running_rx) = watch::channel(true);
    // One slot: perception drops frames rather than queue stale ones.
    let (frame_tx, frame_rx) = mpsc::channel(1);

    // Spawn the metrics server
    let metrics_handle = {
        let router = metrics.router();
        let addr = config.metrics_listen_addr;
        tokio::spawn(async move {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, router.into_make_service()).await?;
            Ok::<(), anyhow::Error>(())
        })
    };

    // Spawn the perception task
    let mut perception_handle = PerceptionLoop::new(
        arena.camera,
        GraphBuilder::new(planner_config.clone()),
        PerceptionSettings {
            frame_interval: config.frame_interval(),
            refresh_every: config.graph_refresh_frames,
        },
        frame_tx,
        metrics.clone(),
    )
    .spawn(running_rx.clone());

    let session = PlanningSession {
        oracle: Arc::new(GreedyOracle::new(planner_config.unreachable_cost)),
        config: planner_config,
        robots: robots.clone(),
        calibrations: Arc::new(CalibrationTable::default()),
        skip_calibration: config.skip_calibration,
        metrics: metrics.clone(),
    };
    let dispatcher = Dispatcher::new(
        robots.clone(),
        RetryPolicy {
            attempts: config.dispatch_retry_attempts,
            backoff: config.dispatch_backoff(),
            attempt_timeout: config.dispatch_timeout(),
        },
        metrics.clone(),
    );
    let control = ControlLoop::new(Arc::new(session), dispatcher, config.tick_interval());
    let mut control_handle = tokio::spawn(control.run(frame_rx, running_rx));

    tracing::info!("All services started. Awaiting shutdown signal...");

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received. Terminating services...");
        }
        outcome = &mut control_handle => match outcome {
            Ok(Outcome::Completed) => tracing::info!("All instructions dispatched."),
            Ok(outcome) => tracing::warn!(outcome = ?outcome, "Control loop ended early."),
            Err(e) => tracing::error!(error = %e, "Control loop task failed."),
        },
    }

    let _ = running_tx.send(false);

    if !control_handle.is_finished() {
        match tokio::time::timeout(config.join_timeout(), &mut control_handle).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "Control loop task failed."),
            Err(_) => {
                tracing::warn!("Control loop did not stop in time; aborting it.");
                control_handle.abort();
            }
        }
    }

    match tokio::time::timeout(config.join_timeout(), &mut perception_handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "Perception task failed."),
        Err(_) => {
            tracing::warn!("Perception task did not stop in time; aborting it.");
            perception_handle.abort();
        }
    }

    for robot in robots.values() {
        if let Err(e) = robot.disconnect().await {
            tracing::warn!(robot = robot.name(), error = %e, "Failed to disconnect robot");
        }
    }

    metrics_handle.abort();
    tracing::info!("Orchestrator shut down gracefully.");
    Ok(())
}

/// Listens for OS shutdown signals (SIGINT, SIGTERM) and resolves when one is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
