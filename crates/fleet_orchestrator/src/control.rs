use crate::dispatch::Dispatcher;
use crate::perception::Frame;
use crate::planning::{Plan, PlanningSession};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// How the control loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every robot queue drained or faulted.
    Completed,
    /// The running flag was cleared.
    Stopped,
    /// Frames stopped arriving before any plan was made.
    Starved,
}

/// Consumes frames, plans once the arena is known and drives dispatch.
///
/// At most one planning session is in flight; a failed session is retried
/// on a later frame. After a plan is loaded, frames are only drained.
pub struct ControlLoop {
    session: Arc<PlanningSession>,
    dispatcher: Dispatcher,
    tick: Duration,
}

impl ControlLoop {
    pub fn new(session: Arc<PlanningSession>, dispatcher: Dispatcher, tick: Duration) -> Self {
        Self {
            session,
            dispatcher,
            tick,
        }
    }

    pub async fn run(mut self, mut frames: mpsc::Receiver<Frame>, mut running: watch::Receiver<bool>) -> Outcome {
        tracing::info!("Control loop started.");
        let (plan_tx, mut plan_rx) = mpsc::channel::<anyhow::Result<Plan>>(1);
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut in_flight = false;
        let mut planned = false;
        let mut frames_open = true;

        loop {
            tokio::select! {
                changed = running.changed() => {
                    if changed.is_err() || !*running.borrow() {
                        tracing::info!("Control loop stopping.");
                        return Outcome::Stopped;
                    }
                }
                frame = frames.recv(), if frames_open => match frame {
                    Some(frame) if !planned && !in_flight => {
                        if let Some(graph) = frame.graph.clone().filter(|_| !frame.actors.is_empty()) {
                            tracing::info!(
                                frame = frame.seq,
                                captured_at = %frame.captured_at,
                                actors = frame.actors.len(),
                                "Starting planning session"
                            );
                            in_flight = true;
                            let session = self.session.clone();
                            let tx = plan_tx.clone();
                            tokio::spawn(async move {
                                let result = session.run(graph, frame.actors).await;
                                let _ = tx.send(result).await;
                            });
                        }
                    }
                    Some(_) => {}
                    None => {
                        frames_open = false;
                        if !planned && !in_flight {
                            tracing::warn!("Frame stream closed before a plan was made");
                            return Outcome::Starved;
                        }
                    }
                },
                Some(result) = plan_rx.recv() => {
                    in_flight = false;
                    match result {
                        Ok(plan) => {
                            tracing::info!(session = %plan.id, robots = plan.programs.len(), "Plan loaded");
                            planned = true;
                            self.dispatcher.load(plan.programs);
                        }
                        Err(e) if frames_open => {
                            tracing::error!(error = ?e, "Planning failed; retrying on a later frame");
                        }
                        Err(e) => {
                            tracing::error!(error = ?e, "Planning failed and no frames remain");
                            return Outcome::Starved;
                        }
                    }
                }
                _ = interval.tick(), if planned => {
                    self.dispatcher.tick();
                    if self.dispatcher.all_settled() {
                        for queue in self.dispatcher.queues() {
                            tracing::info!(
                                robot = queue.robot(),
                                state = ?queue.state(),
                                remaining = queue.len(),
                                head = ?queue.head(),
                                "Robot queue settled"
                            );
                        }
                        return Outcome::Completed;
                    }
                }
            }
        }
    }
}
