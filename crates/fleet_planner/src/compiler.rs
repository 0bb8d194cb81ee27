//! Lowers robot schedules into movement primitives.

use std::fmt;

use crate::allocation::{RobotSchedule, ScheduleAction};
use crate::graph::{GridGraph, NodeId};
use crate::path::{find_path, CostModel, Direction, Path};

/// Turn applied in place to signal a pickup or dropoff.
pub const SPIN_DEGREES: f64 = 360.0;

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// Advance `cells` grid steps in the current heading.
    Forward {
        cells: u32,
        /// Physical length of the run, ignoring obstacle penalties.
        distance_cm: f64,
    },
    TurnLeft(u32),
    TurnRight(u32),
    Wait(u64),
    Pickup,
    Dropoff,
}

impl Instruction {
    /// Signed turn, positive clockwise. `None` for a zero angle.
    pub fn turn(angle: i32) -> Option<Instruction> {
        match angle {
            0 => None,
            a if a > 0 => Some(Instruction::TurnRight(a as u32)),
            a => Some(Instruction::TurnLeft(a.unsigned_abs())),
        }
    }

    pub fn is_turn(&self) -> bool {
        matches!(self, Instruction::TurnLeft(_) | Instruction::TurnRight(_))
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Forward { cells, .. } => write!(f, "FORWARD:{cells}"),
            Instruction::TurnLeft(deg) => write!(f, "TURN_LEFT:{deg}"),
            Instruction::TurnRight(deg) => write!(f, "TURN_RIGHT:{deg}"),
            Instruction::Wait(ms) => write!(f, "WAIT:{ms}"),
            Instruction::Pickup => f.write_str("PICKUP"),
            Instruction::Dropoff => f.write_str("DROPOFF"),
        }
    }
}

/// Instructions for one robot, in dispatch order.
#[derive(Debug, Clone, PartialEq)]
pub struct RobotProgram {
    pub robot: String,
    pub instructions: Vec<Instruction>,
}

/// Compiles one schedule.
///
/// Until the robot has started real work, a transition that takes less
/// time than its schedule gap is preceded by a `WAIT` for the difference.
/// Runs of cells in one heading become a single `FORWARD`, with a turn
/// emitted on every heading change. Arriving at a pickup or dropoff appends
/// the matching spin. Transitions with no path are skipped.
pub fn compile(schedule: &RobotSchedule, graph: &GridGraph, model: &CostModel) -> Vec<Instruction> {
    let mut instructions = Vec::new();
    let mut heading = schedule.initial_heading;
    let mut movement_started = false;

    for (i, pair) in schedule.entries.windows(2).enumerate() {
        let (src, dst) = (&pair[0], &pair[1]);
        if i > 0 && dst.action != ScheduleAction::Wait {
            movement_started = true;
        }

        let Some(path) = find_path(graph, src.location, dst.location) else {
            tracing::warn!(
                robot = %schedule.robot,
                from = src.location,
                to = dst.location,
                "No path between schedule entries, skipping transition"
            );
            continue;
        };

        if !movement_started {
            let travel_ms = model.path_cost_ms(graph, &path);
            let gap_ms = dst.time.saturating_sub(src.time) as f64;
            if travel_ms < gap_ms {
                instructions.push(Instruction::Wait((gap_ms - travel_ms).floor() as u64));
            }
        }

        lower_path(graph, &path, &mut heading, &mut instructions);

        match dst.action {
            ScheduleAction::Pickup => instructions.push(Instruction::Pickup),
            ScheduleAction::Dropoff => instructions.push(Instruction::Dropoff),
            ScheduleAction::Wait => {}
        }
    }

    tracing::debug!(
        robot = %schedule.robot,
        instructions = %instructions.iter().map(ToString::to_string).collect::<Vec<_>>().join(" "),
        "Compiled schedule"
    );
    instructions
}

/// Compiles every schedule, keeping schedule order.
pub fn compile_all(schedules: &[RobotSchedule], graph: &GridGraph, model: &CostModel) -> Vec<RobotProgram> {
    schedules
        .iter()
        .map(|s| RobotProgram {
            robot: s.robot.clone(),
            instructions: compile(s, graph, model),
        })
        .collect()
}

fn lower_path(graph: &GridGraph, path: &Path, heading: &mut Option<Direction>, out: &mut Vec<Instruction>) {
    let cells = path.cells(graph);
    let mut step = 0;
    while step + 1 < cells.len() {
        let Some(direction) = Direction::between(cells[step], cells[step + 1]) else {
            step += 1;
            continue;
        };
        if let Some(previous) = *heading {
            if previous != direction {
                out.extend(Instruction::turn(previous.turn_to(direction)));
            }
        }

        let mut run = 1;
        while step + run + 1 < cells.len()
            && Direction::between(cells[step + run], cells[step + run + 1]) == Some(direction)
        {
            run += 1;
        }

        out.push(Instruction::Forward {
            cells: run as u32,
            distance_cm: run_distance(graph, &path.nodes[step..=step + run]),
        });
        step += run;
        *heading = Some(direction);
    }
}

fn run_distance(graph: &GridGraph, nodes: &[NodeId]) -> f64 {
    nodes
        .windows(2)
        .filter_map(|w| graph.edge(w[0], w[1]))
        .map(|e| e.distance_cm)
        .sum()
}
