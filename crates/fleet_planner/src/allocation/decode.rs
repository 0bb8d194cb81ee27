use super::{AllocationPlan, PackedSolution, RobotSchedule, ScheduleAction, ScheduleEntry};

/// Meaning of one packed action id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodedAction {
    /// Wait at the home of this agent.
    Wait { agent: usize },
    Pickup { task: usize },
    Dropoff { task: usize },
}

pub fn decode_action(action_id: usize, agent_count: usize) -> DecodedAction {
    if action_id < agent_count {
        return DecodedAction::Wait { agent: action_id };
    }
    let offset = action_id - agent_count;
    let task = offset / 2;
    if offset % 2 == 0 {
        DecodedAction::Pickup { task }
    } else {
        DecodedAction::Dropoff { task }
    }
}

/// Maps a packed solution back onto robots and graph nodes.
///
/// One schedule per agent, in agent order, even if the oracle left the
/// agent out. Ids that resolve to no agent, task or action point are
/// dropped. Entries are sorted by time.
pub fn decode_solution(plan: &AllocationPlan, solution: &PackedSolution) -> Vec<RobotSchedule> {
    let agent_count = plan.problem.agents.len();
    let tasks: Vec<_> = plan.problem.tasks().map(|(t, _)| *t).collect();

    for id in solution.agents.keys().filter(|id| **id >= agent_count) {
        tracing::warn!(agent = id, "Solution names an unknown agent");
    }

    plan.problem
        .agents
        .iter()
        .map(|agent| {
            let mut entries = Vec::new();
            if let Some(trace) = solution.agents.get(&agent.id) {
                if trace.times.len() != trace.action_ids.len() {
                    tracing::warn!(
                        agent = agent.id,
                        times = trace.times.len(),
                        actions = trace.action_ids.len(),
                        "Packed trace lengths differ"
                    );
                }
                for (&time, &action_id) in trace.times.iter().zip(&trace.action_ids) {
                    let decoded = decode_action(action_id, agent_count);
                    let resolved = match decoded {
                        DecodedAction::Wait { agent } => plan
                            .problem
                            .agents
                            .get(agent)
                            .map(|a| (a.start, ScheduleAction::Wait, None)),
                        DecodedAction::Pickup { task } => tasks
                            .get(task)
                            .map(|t| (t.start, ScheduleAction::Pickup, Some(t.id))),
                        DecodedAction::Dropoff { task } => tasks
                            .get(task)
                            .map(|t| (t.end, ScheduleAction::Dropoff, Some(t.id))),
                    };
                    let entry = resolved.and_then(|(ap, action, task_id)| {
                        plan.action_points.node(ap).map(|location| ScheduleEntry {
                            time,
                            location,
                            action,
                            task_id,
                        })
                    });
                    match entry {
                        Some(entry) => entries.push(entry),
                        None => tracing::warn!(agent = agent.id, action_id, "Dropping unresolved action id"),
                    }
                }
            }
            entries.sort_by_key(|e| e.time);

            RobotSchedule {
                robot: plan.robots.get(agent.id).cloned().unwrap_or_default(),
                agent_id: agent.id,
                initial_heading: plan.headings.get(agent.id).copied().flatten(),
                entries,
            }
        })
        .collect()
}
