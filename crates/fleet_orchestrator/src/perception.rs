use crate::metrics::Metrics;
use chrono::{DateTime, Utc};
use fleet_planner::actor::{ActorTable, PerceptionError, PerceptionSource, TrackedActor};
use fleet_planner::graph::{GraphBuilder, GridGraph};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

/// Immutable snapshot handed from perception to the control loop.
#[derive(Debug, Clone)]
pub struct Frame {
    pub seq: u64,
    pub captured_at: DateTime<Utc>,
    /// Latest good graph, if one was ever built.
    pub graph: Option<Arc<GridGraph>>,
    pub actors: Vec<TrackedActor>,
}

#[derive(Debug, Clone, Copy)]
pub struct PerceptionSettings {
    pub frame_interval: Duration,
    /// Rebuild the graph every this many frames even without new corners.
    pub refresh_every: u64,
}

/// What one capture cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Published,
    Dropped,
    Skipped,
    Finished,
}

/// Owns the camera, the graph and the actor table.
pub struct PerceptionLoop<S> {
    source: S,
    builder: GraphBuilder,
    actors: ActorTable,
    settings: PerceptionSettings,
    frames: mpsc::Sender<Frame>,
    metrics: Arc<Metrics>,
    seq: u64,
}

impl<S: PerceptionSource + 'static> PerceptionLoop<S> {
    pub fn new(
        source: S,
        builder: GraphBuilder,
        settings: PerceptionSettings,
        frames: mpsc::Sender<Frame>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            source,
            builder,
            actors: ActorTable::new(),
            settings,
            frames,
            metrics,
            seq: 0,
        }
    }

    /// Runs until `running` turns false, the stream ends or the consumer
    /// goes away. The camera is released on every exit path.
    ///
    /// Capture and graph rebuilds block, so each step runs on the blocking
    /// pool and the runtime workers stay free for dispatch.
    pub fn spawn(self, mut running: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("Perception task started.");
            let mut interval = tokio::time::interval(self.settings.frame_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut this = self;

            loop {
                tokio::select! {
                    changed = running.changed() => {
                        if changed.is_err() || !*running.borrow() {
                            tracing::info!("Perception task stopping.");
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        let stepped = tokio::task::spawn_blocking(move || {
                            let step = this.step();
                            (this, step)
                        })
                        .await;
                        let step;
                        (this, step) = match stepped {
                            Ok(stepped) => stepped,
                            Err(e) => {
                                tracing::error!(error = %e, "Perception step panicked; camera not released");
                                return;
                            }
                        };
                        if step == Step::Finished {
                            break;
                        }
                    }
                }
            }

            this.source.release();
            tracing::info!(frames = this.seq, "Perception task finished.");
        })
    }

    pub fn step(&mut self) -> Step {
        let observation = match self.source.capture() {
            Ok(observation) => observation,
            Err(PerceptionError::StreamEnded) => {
                tracing::info!("Camera stream ended");
                return Step::Finished;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Frame capture failed");
                return Step::Skipped;
            }
        };
        self.seq += 1;
        self.metrics.frames_captured_total.inc();

        self.actors.observe(&observation.actors, self.seq);
        self.metrics.tracked_actors.set(self.actors.len() as i64);

        let due = self.seq % self.settings.refresh_every.max(1) == 0;
        if observation.corners.is_some() || due {
            match self
                .builder
                .refresh(observation.corners.as_deref(), &observation.obstacles)
            {
                Ok(graph) => {
                    self.metrics.graph_rebuilds_total.inc();
                    tracing::debug!(
                        frame = self.seq,
                        cols = graph.cols(),
                        rows = graph.rows(),
                        obstacles = observation.obstacles.len(),
                        "Graph refreshed"
                    );
                }
                Err(_) => self.metrics.graph_rebuild_failures_total.inc(),
            }
        }

        let frame = Frame {
            seq: self.seq,
            captured_at: Utc::now(),
            graph: self.builder.current(),
            actors: self.actors.snapshot(),
        };
        match self.frames.try_send(frame) {
            Ok(()) => Step::Published,
            Err(TrySendError::Full(_)) => {
                self.metrics.frames_dropped_total.inc();
                Step::Dropped
            }
            Err(TrySendError::Closed(_)) => {
                tracing::info!("Frame consumer closed");
                Step::Finished
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_planner::actor::Observation;
    use fleet_planner::PlannerConfig;
    use sim_arena::camera::{CameraSettings, SimulatedCamera};
    use sim_arena::world::{ArenaWorld, FloorPoint, Pose};

    fn camera(max_frames: Option<u64>) -> SimulatedCamera {
        let world = ArenaWorld::new(91.0, 60.5).with_action_point("action1", FloorPoint::new(10.0, 10.0));
        world.place_robot("robot1", Pose::new(50.0, 40.0, 0.0));
        SimulatedCamera::new(
            Arc::new(world),
            CameraSettings {
                max_frames,
                ..CameraSettings::default()
            },
        )
    }

    fn perception<S: PerceptionSource + 'static>(
        source: S,
        capacity: usize,
    ) -> (PerceptionLoop<S>, mpsc::Receiver<Frame>, Arc<Metrics>) {
        let (tx, rx) = mpsc::channel(capacity);
        let metrics = Arc::new(Metrics::new());
        let settings = PerceptionSettings {
            frame_interval: Duration::from_millis(1),
            refresh_every: 5,
        };
        let p = PerceptionLoop::new(source, GraphBuilder::new(PlannerConfig::default()), settings, tx, metrics.clone());
        (p, rx, metrics)
    }

    #[test]
    fn full_queue_drops_instead_of_blocking() {
        let (mut p, mut rx, metrics) = perception(camera(None), 1);
        assert_eq!(p.step(), Step::Published);
        assert_eq!(p.step(), Step::Dropped);
        assert_eq!(p.step(), Step::Dropped);
        assert_eq!(metrics.frames_dropped_total.get(), 2);

        // The consumer sees the first frame, then room opens up again.
        let first = rx.try_recv().unwrap();
        assert_eq!(first.seq, 1);
        assert!(first.graph.is_some());
        assert_eq!(first.actors.len(), 2);
        assert_eq!(p.step(), Step::Published);
        assert_eq!(rx.try_recv().unwrap().seq, 4);
    }

    struct CornerlessCamera;

    impl PerceptionSource for CornerlessCamera {
        fn capture(&mut self) -> Result<Observation, PerceptionError> {
            Ok(Observation::default())
        }
    }

    #[test]
    fn graph_refresh_runs_on_its_own_cadence() {
        let (mut p, _rx, metrics) = perception(CornerlessCamera, 16);
        for _ in 0..10 {
            p.step();
        }
        // Every fifth frame tries, and without corners each attempt fails.
        assert_eq!(metrics.graph_rebuild_failures_total.get(), 2);
        assert_eq!(metrics.graph_rebuilds_total.get(), 0);
        assert_eq!(metrics.frames_captured_total.get(), 10);
    }

    #[tokio::test]
    async fn stops_at_end_of_stream() {
        let (p, mut rx, metrics) = perception(camera(Some(3)), 8);
        let (_running_tx, running_rx) = watch::channel(true);
        p.spawn(running_rx).await.unwrap();
        assert_eq!(metrics.frames_captured_total.get(), 3);
        let mut seqs = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            seqs.push(frame.seq);
        }
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    /// Blocks the calling thread for every capture.
    struct SlowCamera;

    impl PerceptionSource for SlowCamera {
        fn capture(&mut self) -> Result<Observation, PerceptionError> {
            std::thread::sleep(Duration::from_millis(100));
            Ok(Observation::default())
        }
    }

    #[tokio::test]
    async fn slow_capture_leaves_the_runtime_responsive() {
        let (p, _rx, metrics) = perception(SlowCamera, 4);
        let (running_tx, running_rx) = watch::channel(true);
        let handle = p.spawn(running_rx);
        // Let the first capture start.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let started = std::time::Instant::now();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(started.elapsed() < Duration::from_millis(80));

        running_tx.send(false).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("perception task did not stop")
            .unwrap();
        assert!(metrics.frames_captured_total.get() >= 1);
    }

    #[tokio::test]
    async fn stops_when_running_flag_clears() {
        let (p, _rx, _) = perception(camera(None), 1);
        let (running_tx, running_rx) = watch::channel(true);
        let handle = p.spawn(running_rx);
        tokio::time::sleep(Duration::from_millis(10)).await;
        running_tx.send(false).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("perception task did not stop")
            .unwrap();
    }
}
