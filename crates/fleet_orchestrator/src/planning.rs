use crate::metrics::Metrics;
use anyhow::Context;
use dashmap::DashMap;
use fleet_planner::actor::{ActorRole, TrackedActor};
use fleet_planner::allocation::{allocate, AllocationError, AllocationOracle};
use fleet_planner::calibration::calibrate;
use fleet_planner::compiler::{compile_all, RobotProgram};
use fleet_planner::graph::GridGraph;
use fleet_planner::interface::PhysicalInterface;
use fleet_planner::path::CostModel;
use fleet_planner::PlannerConfig;
use std::collections::HashMap;
use std::sync::Arc;

/// Calibration factor per robot, as last measured.
#[derive(Debug, Default)]
pub struct CalibrationTable {
    factors: DashMap<String, f64>,
}

impl CalibrationTable {
    pub fn record(&self, robot: &str, factor: f64) {
        self.factors.insert(robot.to_string(), factor);
    }

    pub fn get(&self, robot: &str) -> Option<f64> {
        self.factors.get(robot).map(|f| *f)
    }
}

/// The outcome of one planning session.
#[derive(Debug, Clone)]
pub struct Plan {
    pub id: uuid::Uuid,
    pub programs: Vec<RobotProgram>,
}

/// Calibrates the fleet, allocates tasks and compiles instructions.
///
/// The oracle runs on the blocking pool; callers keep at most one session
/// in flight.
pub struct PlanningSession {
    pub config: PlannerConfig,
    pub oracle: Arc<dyn AllocationOracle>,
    /// Registered, connected robots by name.
    pub robots: HashMap<String, Arc<dyn PhysicalInterface>>,
    pub calibrations: Arc<CalibrationTable>,
    pub skip_calibration: bool,
    pub metrics: Arc<Metrics>,
}

impl PlanningSession {
    pub async fn run(&self, graph: Arc<GridGraph>, actors: Vec<TrackedActor>) -> anyhow::Result<Plan> {
        let id = uuid::Uuid::new_v4();

        let (robots, unregistered): (Vec<TrackedActor>, Vec<TrackedActor>) = actors
            .iter()
            .filter(|a| a.role() == ActorRole::Robot)
            .cloned()
            .partition(|a| self.robots.contains_key(a.name()));
        for robot in &unregistered {
            tracing::warn!(robot = robot.name(), "Robot seen but not registered; leaving it out");
        }
        let action_points: Vec<TrackedActor> = actors
            .iter()
            .filter(|a| a.role() == ActorRole::ActionPoint)
            .cloned()
            .collect();

        if !self.skip_calibration {
            self.calibrate_fleet(&robots).await;
        }

        tracing::info!(
            session = %id,
            robots = robots.len(),
            action_points = action_points.len(),
            "Starting allocation"
        );
        self.metrics.allocation_runs_total.inc();

        let config = self.config.clone();
        let oracle = self.oracle.clone();
        let result = tokio::task::spawn_blocking(move || {
            let (_, schedules) = allocate(&graph, &robots, &action_points, oracle.as_ref(), &config)?;
            let model = CostModel::from_config(&config);
            Ok::<_, AllocationError>(compile_all(&schedules, &graph, &model))
        })
        .await
        .context("Allocation task panicked")?;

        let programs = match result {
            Ok(programs) => programs,
            Err(e) => {
                if e == AllocationError::Infeasible {
                    self.metrics.allocation_infeasible_total.inc();
                }
                return Err(e).with_context(|| format!("Planning session {id} failed"));
            }
        };

        for program in &programs {
            tracing::info!(
                session = %id,
                robot = %program.robot,
                instructions = program.instructions.len(),
                calibration = ?self.calibrations.get(&program.robot),
                "Robot program ready"
            );
        }
        Ok(Plan { id, programs })
    }

    async fn calibrate_fleet(&self, robots: &[TrackedActor]) {
        for actor in robots {
            let Some(robot) = self.robots.get(actor.name()) else {
                continue;
            };
            match calibrate(robot.as_ref(), &self.config.calibration).await {
                Ok(outcome) => {
                    self.calibrations.record(actor.name(), outcome.factor);
                    self.metrics
                        .calibration_factor
                        .with_label_values(&[actor.name()])
                        .set(outcome.factor);
                }
                Err(e) => {
                    // The engine reset the factor to 1 before measuring.
                    tracing::warn!(robot = actor.name(), error = %e, "Calibration failed; using raw command units");
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use fleet_planner::actor::{ActorDetection, ActorTable, BoundingBox};
    use fleet_planner::allocation::{AllocationProblem, GreedyOracle, OracleError, PackedSolution};
    use fleet_planner::arena::PixelPoint;
    use fleet_planner::graph::GraphBuilder;
    use sim_arena::impairment::LinkProfile;
    use sim_arena::robot::SimulatedRobot;
    use sim_arena::world::{ArenaWorld, Pose};

    /// A 91 × 60.5 cm arena drawn at 10 px/cm from the origin.
    pub(crate) fn arena_graph(config: &PlannerConfig) -> Arc<GridGraph> {
        let (w, h) = (config.arena_length_cm * 10.0, config.arena_height_cm * 10.0);
        let corners = [
            ("top_left".to_string(), PixelPoint::new(0.0, 0.0)),
            ("top_right".to_string(), PixelPoint::new(w, 0.0)),
            ("bottom_left".to_string(), PixelPoint::new(0.0, h)),
            ("bottom_right".to_string(), PixelPoint::new(w, h)),
        ];
        GraphBuilder::new(config.clone()).refresh(Some(corners.as_slice()), &[]).unwrap()
    }

    pub(crate) fn actors(entries: &[(&str, f64, f64)]) -> Vec<TrackedActor> {
        let mut table = ActorTable::new();
        let detections: Vec<_> = entries
            .iter()
            .map(|(name, x, y)| ActorDetection {
                name: name.to_string(),
                bbox: BoundingBox::around(PixelPoint::new(*x, *y), 20.0),
                orientation: Some(-90.0),
            })
            .collect();
        table.observe(&detections, 1);
        table.snapshot()
    }

    fn session(oracle: Arc<dyn AllocationOracle>, robots: &[(&str, f64)]) -> (PlanningSession, Arc<ArenaWorld>) {
        let world = Arc::new(ArenaWorld::new(91.0, 60.5));
        let mut map: HashMap<String, Arc<dyn PhysicalInterface>> = HashMap::new();
        for (name, gain) in robots {
            world.place_robot(*name, Pose::new(20.0, 20.0, 0.0));
            let robot = SimulatedRobot::new(*name, world.clone(), *gain, LinkProfile::ideal());
            map.insert(name.to_string(), Arc::new(robot));
        }
        let session = PlanningSession {
            config: PlannerConfig::default(),
            oracle,
            robots: map,
            calibrations: Arc::new(CalibrationTable::default()),
            skip_calibration: false,
            metrics: Arc::new(Metrics::new()),
        };
        (session, world)
    }

    #[tokio::test]
    async fn calibrates_then_plans_registered_robots_only() {
        let config = PlannerConfig::default();
        let (session, _) = session(Arc::new(GreedyOracle::new(config.unreachable_cost)), &[("robot1", 2.0)]);
        for robot in session.robots.values() {
            robot.connect().await.unwrap();
        }

        let actors = actors(&[
            ("robot1", 100.0, 500.0),
            ("robot9", 800.0, 500.0),
            ("action1", 100.0, 100.0),
            ("action2", 800.0, 100.0),
        ]);
        let plan = session.run(arena_graph(&config), actors).await.unwrap();

        assert_eq!(plan.programs.len(), 1);
        assert_eq!(plan.programs[0].robot, "robot1");
        assert!(!plan.programs[0].instructions.is_empty());
        let factor = session.calibrations.get("robot1").unwrap();
        assert!((factor - 0.5).abs() < 1e-2);
        assert_eq!(session.metrics.allocation_runs_total.get(), 1);
    }

    struct NoSolution;

    impl AllocationOracle for NoSolution {
        fn solve(&self, _problem: &AllocationProblem) -> Result<Option<PackedSolution>, OracleError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn infeasibility_fails_the_session() {
        let config = PlannerConfig::default();
        let (mut session, _) = session(Arc::new(NoSolution), &[("robot1", 1.0)]);
        session.skip_calibration = true;
        let actors = actors(&[("robot1", 100.0, 500.0), ("action1", 100.0, 100.0), ("action2", 800.0, 100.0)]);

        let err = session.run(arena_graph(&config), actors).await.unwrap_err();
        assert_eq!(err.downcast_ref::<AllocationError>(), Some(&AllocationError::Infeasible));
        assert_eq!(session.metrics.allocation_infeasible_total.get(), 1);
    }
}
