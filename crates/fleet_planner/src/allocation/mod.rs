//! Task allocation bridge.
//!
//! Builds the agent/task model from perceived robots and action points,
//! hands it to an [`AllocationOracle`] and decodes the packed answer into
//! per-robot [`RobotSchedule`]s.
//!
//! All agent and task locations handed to the oracle are indices into the
//! deduplicated [`ActionPointSet`], not graph node ids.

mod decode;
mod oracle;

pub use decode::{decode_action, decode_solution, DecodedAction};
pub use oracle::{AllocationOracle, GreedyOracle, OracleError};

use std::collections::BTreeMap;
use std::fmt;

use crate::actor::TrackedActor;
use crate::config::PlannerConfig;
use crate::graph::{GridGraph, NodeId};
use crate::path::{cost_matrix, CostMatrix, CostModel, Direction};

/// Capacity of every robot: one item carried at a time.
pub const ROBOT_CAPACITY: u32 = 1;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AllocationError {
    #[error("no robots are being tracked")]
    NoRobots,
    #[error("need at least two action points to build tasks, found {found}")]
    NotEnoughActionPoints { found: usize },
    #[error("grid graph has no nodes to anchor '{actor}'")]
    UnknownNode { actor: String },
    #[error("allocation oracle found no feasible schedule")]
    Infeasible,
    #[error(transparent)]
    Oracle(#[from] OracleError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Agent {
    pub id: usize,
    /// Index into the action-point set.
    pub start: usize,
    pub capacity: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Task {
    pub id: usize,
    /// Index into the action-point set.
    pub start: usize,
    /// Index into the action-point set.
    pub end: usize,
    pub deadline: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskBatch {
    pub tasks: Vec<Task>,
    pub release_time: u64,
}

/// Everything the oracle is given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationProblem {
    pub agents: Vec<Agent>,
    pub task_stream: Vec<TaskBatch>,
    pub cost_matrix: CostMatrix,
    pub capacity: u32,
    pub num_action_points: usize,
}

impl AllocationProblem {
    /// Tasks of every batch in stream order; positions are the task indices
    /// used by packed action ids.
    pub fn tasks(&self) -> impl Iterator<Item = (&Task, u64)> {
        self.task_stream
            .iter()
            .flat_map(|b| b.tasks.iter().map(move |t| (t, b.release_time)))
    }
}

/// One agent's part of the oracle answer: parallel `times` / `action_ids`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentTrace {
    pub times: Vec<u64>,
    pub action_ids: Vec<usize>,
}

impl AgentTrace {
    pub fn push(&mut self, time: u64, action_id: usize) {
        self.times.push(time);
        self.action_ids.push(action_id);
    }
}

/// The oracle's packed output, keyed by agent id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackedSolution {
    pub agents: BTreeMap<usize, AgentTrace>,
}

/// Ordered, deduplicated graph nodes referenced by any agent or task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionPointSet {
    nodes: Vec<NodeId>,
}

impl ActionPointSet {
    /// Adds `node` if unseen; returns its index either way.
    pub fn insert(&mut self, node: NodeId) -> usize {
        match self.index_of(node) {
            Some(i) => i,
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    pub fn index_of(&self, node: NodeId) -> Option<usize> {
        self.nodes.iter().position(|n| *n == node)
    }

    pub fn node(&self, index: usize) -> Option<NodeId> {
        self.nodes.get(index).copied()
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// A fully built allocation cycle: the oracle input plus what is needed to
/// map its answer back onto robots and graph nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationPlan {
    pub action_points: ActionPointSet,
    pub problem: AllocationProblem,
    /// Robot name per agent id.
    pub robots: Vec<String>,
    /// Heading per agent id, from the tracked orientation.
    pub headings: Vec<Option<Direction>>,
}

impl AllocationPlan {
    pub fn agent(&self, id: usize) -> Option<&Agent> {
        self.problem.agents.get(id)
    }

    pub fn task(&self, index: usize) -> Option<&Task> {
        self.problem.tasks().nth(index).map(|(t, _)| t)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScheduleAction {
    Wait,
    Pickup,
    Dropoff,
}

impl fmt::Display for ScheduleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScheduleAction::Wait => "WAIT",
            ScheduleAction::Pickup => "PICKUP",
            ScheduleAction::Dropoff => "DROPOFF",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub time: u64,
    /// Graph node.
    pub location: NodeId,
    pub action: ScheduleAction,
    pub task_id: Option<usize>,
}

/// One robot's timed plan, ascending by time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RobotSchedule {
    pub robot: String,
    pub agent_id: usize,
    pub initial_heading: Option<Direction>,
    pub entries: Vec<ScheduleEntry>,
}

/// Builds agents, the closed task loop, the action-point index space and
/// the cost matrix for one allocation cycle.
pub fn build_plan(
    graph: &GridGraph,
    robots: &[TrackedActor],
    action_points: &[TrackedActor],
    config: &PlannerConfig,
) -> Result<AllocationPlan, AllocationError> {
    if robots.is_empty() {
        return Err(AllocationError::NoRobots);
    }
    if action_points.len() < 2 {
        return Err(AllocationError::NotEnoughActionPoints {
            found: action_points.len(),
        });
    }

    let anchor = |actor: &TrackedActor| {
        graph
            .nearest_node(actor.location())
            .ok_or_else(|| AllocationError::UnknownNode {
                actor: actor.name().to_string(),
            })
    };

    let agent_nodes = robots.iter().map(anchor).collect::<Result<Vec<_>, _>>()?;
    let point_nodes = action_points.iter().map(anchor).collect::<Result<Vec<_>, _>>()?;

    // Consecutive pairs, then the closing leg back to the first point.
    let n = point_nodes.len();
    let task_nodes: Vec<(NodeId, NodeId)> = (1..n)
        .map(|i| (point_nodes[i - 1], point_nodes[i]))
        .chain(std::iter::once((point_nodes[n - 1], point_nodes[0])))
        .collect();

    let mut aps = ActionPointSet::default();
    for node in &agent_nodes {
        aps.insert(*node);
    }
    for (start, end) in &task_nodes {
        aps.insert(*start);
        aps.insert(*end);
    }

    let agents: Vec<Agent> = agent_nodes
        .iter()
        .enumerate()
        .map(|(id, node)| Agent {
            id,
            start: aps.insert(*node),
            capacity: ROBOT_CAPACITY,
        })
        .collect();
    let tasks: Vec<Task> = task_nodes
        .iter()
        .enumerate()
        .map(|(id, (start, end))| Task {
            id,
            start: aps.insert(*start),
            end: aps.insert(*end),
            deadline: config.deadline_sentinel,
        })
        .collect();

    let matrix = cost_matrix(graph, aps.nodes(), &CostModel::from_config(config));
    tracing::info!(
        agents = agents.len(),
        tasks = tasks.len(),
        action_points = aps.len(),
        "Allocation problem built"
    );

    Ok(AllocationPlan {
        problem: AllocationProblem {
            agents,
            task_stream: vec![TaskBatch {
                tasks,
                release_time: 0,
            }],
            cost_matrix: matrix,
            capacity: ROBOT_CAPACITY,
            num_action_points: aps.len(),
        },
        action_points: aps,
        robots: robots.iter().map(|r| r.name().to_string()).collect(),
        headings: robots.iter().map(TrackedActor::heading).collect(),
    })
}

/// Runs the oracle on a built plan. Blocking: the oracle may take long.
pub fn solve(
    plan: &AllocationPlan,
    oracle: &dyn AllocationOracle,
) -> Result<Vec<RobotSchedule>, AllocationError> {
    let solution = oracle.solve(&plan.problem)?.ok_or_else(|| {
        tracing::error!("Allocation oracle reported no solution");
        AllocationError::Infeasible
    })?;
    let schedules = decode_solution(plan, &solution);
    for schedule in &schedules {
        tracing::info!(
            robot = %schedule.robot,
            entries = schedule.entries.len(),
            "Robot schedule decoded"
        );
        for entry in &schedule.entries {
            tracing::debug!(
                robot = %schedule.robot,
                time = entry.time,
                location = entry.location,
                action = %entry.action,
                task = ?entry.task_id,
                "Schedule entry"
            );
        }
    }
    Ok(schedules)
}

/// Convenience: [`build_plan`] followed by [`solve`].
pub fn allocate(
    graph: &GridGraph,
    robots: &[TrackedActor],
    action_points: &[TrackedActor],
    oracle: &dyn AllocationOracle,
    config: &PlannerConfig,
) -> Result<(AllocationPlan, Vec<RobotSchedule>), AllocationError> {
    let plan = build_plan(graph, robots, action_points, config)?;
    let schedules = solve(&plan, oracle)?;
    Ok((plan, schedules))
}
