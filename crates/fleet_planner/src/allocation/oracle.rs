use super::{AgentTrace, AllocationProblem, PackedSolution};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OracleError {
    #[error("malformed allocation problem: {0}")]
    Malformed(String),
    #[error("allocation oracle failed: {0}")]
    Failed(String),
}

/// External solver for multi-agent pickup-and-delivery.
///
/// Returns `Ok(None)` when no schedule satisfies the deadlines. Packed
/// action ids follow the usual encoding: ids below the agent count are a
/// WAIT at that agent's home, and `agents + 2k` / `agents + 2k + 1` are the
/// pickup and dropoff of the k-th task in stream order.
///
/// Calls block and may take a long time; run them off the async executor.
pub trait AllocationOracle: Send + Sync {
    fn solve(&self, problem: &AllocationProblem) -> Result<Option<PackedSolution>, OracleError>;
}

/// Earliest-completion greedy assignment.
///
/// Each task, in stream order, goes to the agent that can finish it first.
/// Pairs costed at or above `unreachable_cost` are never travelled. Every
/// agent that did any work returns home at the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GreedyOracle {
    pub unreachable_cost: u64,
}

impl GreedyOracle {
    pub fn new(unreachable_cost: u64) -> Self {
        Self { unreachable_cost }
    }

    fn reachable(&self, cost: u64) -> Option<u64> {
        (cost < self.unreachable_cost).then_some(cost)
    }
}

struct AgentState {
    home: usize,
    at: usize,
    free_at: u64,
    trace: AgentTrace,
}

impl AllocationOracle for GreedyOracle {
    fn solve(&self, problem: &AllocationProblem) -> Result<Option<PackedSolution>, OracleError> {
        let size = problem.cost_matrix.size();
        if size != problem.num_action_points {
            return Err(OracleError::Malformed(format!(
                "cost matrix is {size}x{size} for {} action points",
                problem.num_action_points
            )));
        }
        let in_range = |i: usize| i < size;
        if let Some(a) = problem.agents.iter().find(|a| !in_range(a.start)) {
            return Err(OracleError::Malformed(format!("agent {} starts outside the action points", a.id)));
        }
        if let Some((t, _)) = problem.tasks().find(|(t, _)| !in_range(t.start) || !in_range(t.end)) {
            return Err(OracleError::Malformed(format!("task {} references an unknown action point", t.id)));
        }

        let n = problem.agents.len();
        let mut states: Vec<AgentState> = problem
            .agents
            .iter()
            .map(|a| {
                let mut trace = AgentTrace::default();
                trace.push(0, a.id);
                AgentState {
                    home: a.start,
                    at: a.start,
                    free_at: 0,
                    trace,
                }
            })
            .collect();

        let cost = |from: usize, to: usize| self.reachable(problem.cost_matrix.get(from, to));

        for (k, (task, release)) in problem.tasks().enumerate() {
            if problem.capacity == 0 {
                return Ok(None);
            }
            let Some(carry) = cost(task.start, task.end) else {
                tracing::debug!(task = task.id, "Task legs are unreachable");
                return Ok(None);
            };

            // (agent index, pickup time, dropoff time), earliest dropoff wins.
            let mut best: Option<(usize, u64, u64)> = None;
            for (i, state) in states.iter().enumerate() {
                if problem.agents[i].capacity == 0 {
                    continue;
                }
                let Some(approach) = cost(state.at, task.start) else {
                    continue;
                };
                let pickup = (state.free_at + approach).max(release);
                let dropoff = pickup + carry;
                if dropoff > task.deadline {
                    continue;
                }
                if best.map_or(true, |(_, _, d)| dropoff < d) {
                    best = Some((i, pickup, dropoff));
                }
            }

            let Some((i, pickup, dropoff)) = best else {
                tracing::debug!(task = task.id, "No agent meets the task deadline");
                return Ok(None);
            };
            let state = &mut states[i];
            state.trace.push(pickup, n + 2 * k);
            state.trace.push(dropoff, n + 2 * k + 1);
            state.at = task.end;
            state.free_at = dropoff;
        }

        for (state, agent) in states.iter_mut().zip(&problem.agents) {
            if state.trace.times.len() > 1 && state.at != state.home {
                match cost(state.at, state.home) {
                    Some(back) => state.trace.push(state.free_at + back, agent.id),
                    None => tracing::warn!(agent = agent.id, "Agent cannot return home"),
                }
            }
        }

        Ok(Some(PackedSolution {
            agents: problem
                .agents
                .iter()
                .zip(states)
                .map(|(a, s)| (a.id, s.trace))
                .collect(),
        }))
    }
}
