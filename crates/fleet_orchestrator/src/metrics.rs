use axum::{response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, GaugeVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// All Prometheus collectors of the orchestrator, shared behind an `Arc`.
pub struct Metrics {
    pub registry: Registry,
    pub frames_captured_total: IntCounter,
    /// Frames not published because the consumer had not taken the last one.
    pub frames_dropped_total: IntCounter,
    pub graph_rebuilds_total: IntCounter,
    pub graph_rebuild_failures_total: IntCounter,
    pub tracked_actors: IntGauge,
    pub allocation_runs_total: IntCounter,
    pub allocation_infeasible_total: IntCounter,
    pub instructions_dispatched_total: IntCounterVec,
    pub dispatch_retries_total: IntCounter,
    pub dispatch_rejections_total: IntCounter,
    pub calibration_factor: GaugeVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("fleet_orchestrator".into()), None)
            .expect("Failed to create custom metrics registry");

        macro_rules! reg {
            ($metric:expr) => {{
                let collector = $metric;
                registry
                    .register(Box::new(collector.clone()))
                    .expect("Failed to register metric");
                collector
            }};
        }

        Self {
            frames_captured_total: reg!(IntCounter::new(
                "frames_captured_total",
                "Total camera frames processed by the perception task"
            )
            .unwrap()),
            frames_dropped_total: reg!(IntCounter::new(
                "frames_dropped_total",
                "Frames not published because the frame queue was full"
            )
            .unwrap()),
            graph_rebuilds_total: reg!(IntCounter::new(
                "graph_rebuilds_total",
                "Successful grid graph rebuilds"
            )
            .unwrap()),
            graph_rebuild_failures_total: reg!(IntCounter::new(
                "graph_rebuild_failures_total",
                "Graph rebuilds that kept the previous graph"
            )
            .unwrap()),
            tracked_actors: reg!(IntGauge::new("tracked_actors", "Actors tracked so far").unwrap()),
            allocation_runs_total: reg!(IntCounter::new(
                "allocation_runs_total",
                "Allocation oracle invocations"
            )
            .unwrap()),
            allocation_infeasible_total: reg!(IntCounter::new(
                "allocation_infeasible_total",
                "Allocation runs that produced no schedule"
            )
            .unwrap()),
            instructions_dispatched_total: reg!(IntCounterVec::new(
                Opts::new("instructions_dispatched_total", "Instructions acknowledged by robots"),
                &["robot"]
            )
            .unwrap()),
            dispatch_retries_total: reg!(IntCounter::new(
                "dispatch_retries_total",
                "Dispatch attempts retried after a transient failure"
            )
            .unwrap()),
            dispatch_rejections_total: reg!(IntCounter::new(
                "dispatch_rejections_total",
                "Instructions refused by a robot"
            )
            .unwrap()),
            calibration_factor: reg!(GaugeVec::new(
                Opts::new("calibration_factor", "Command units per centimetre, per robot"),
                &["robot"]
            )
            .unwrap()),
            registry,
        }
    }

    /// Creates an `axum::Router` that serves the metrics on the `/metrics` endpoint.
    pub fn router(&self) -> Router {
        let registry = self.registry.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let registry = registry.clone();
                async move { encode(&registry).into_response() }
            }),
        )
    }
}

fn encode(registry: &Registry) -> String {
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("Failed to encode metrics");
    String::from_utf8(buffer).expect("Metrics buffer is not valid UTF-8")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collectors_are_prefixed_and_labelled() {
        let metrics = Metrics::new();
        metrics.frames_dropped_total.inc();
        metrics.calibration_factor.with_label_values(&["robot1"]).set(0.77);
        let text = encode(&metrics.registry);
        assert!(text.contains("fleet_orchestrator_frames_dropped_total 1"));
        assert!(text.contains(r#"fleet_orchestrator_calibration_factor{robot="robot1"} 0.77"#));
    }
}
