//! Shortest-path search and the action-point cost matrix.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::config::PlannerConfig;
use crate::graph::{Cell, GridGraph, NodeId};

/// One of the eight compass headings between adjacent cells.
///
/// North is towards row 0 (image up), East towards growing column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    N,
    NE,
    E,
    SE,
    S,
    SW,
    W,
    NW,
}

impl Direction {
    pub const ALL: [Direction; 8] = [
        Direction::N,
        Direction::NE,
        Direction::E,
        Direction::SE,
        Direction::S,
        Direction::SW,
        Direction::W,
        Direction::NW,
    ];

    /// 45°-step index, clockwise from North.
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Direction {
        Self::ALL[(code % 8) as usize]
    }

    pub fn degrees(self) -> i32 {
        self.code() as i32 * 45
    }

    pub fn label(self) -> &'static str {
        match self {
            Direction::N => "N",
            Direction::NE => "NE",
            Direction::E => "E",
            Direction::SE => "SE",
            Direction::S => "S",
            Direction::SW => "SW",
            Direction::W => "W",
            Direction::NW => "NW",
        }
    }

    pub fn opposite(self) -> Direction {
        Self::from_code(self.code() + 4)
    }

    /// Heading from `from` to `to`, using only the signs of the deltas.
    /// `None` when both cells coincide.
    pub fn between(from: Cell, to: Cell) -> Option<Direction> {
        let dc = (to.col as i64 - from.col as i64).signum();
        let dr = (to.row as i64 - from.row as i64).signum();
        Some(match (dc, dr) {
            (0, -1) => Direction::N,
            (1, -1) => Direction::NE,
            (1, 0) => Direction::E,
            (1, 1) => Direction::SE,
            (0, 1) => Direction::S,
            (-1, 1) => Direction::SW,
            (-1, 0) => Direction::W,
            (-1, -1) => Direction::NW,
            _ => return None,
        })
    }

    /// Signed turn from `self` to `next` in (−180°, 180°]; positive is clockwise.
    pub fn turn_to(self, next: Direction) -> i32 {
        let delta = (next.degrees() - self.degrees()).rem_euclid(360);
        if delta > 180 {
            delta - 360
        } else {
            delta
        }
    }

    /// Nearest compass direction to an image-frame heading in degrees
    /// (0° along +x, growing towards +y).
    pub fn from_image_heading(degrees: f64) -> Direction {
        let compass = (degrees + 90.0).rem_euclid(360.0);
        Self::from_code(((compass / 45.0).round() as i64).rem_euclid(8) as u8)
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A route through the graph, endpoints included.
#[derive(Debug, Clone, PartialEq)]
pub struct Path {
    pub nodes: Vec<NodeId>,
    /// Sum of routing weights along the route.
    pub weight: f64,
}

impl Path {
    pub fn cells(&self, graph: &GridGraph) -> Vec<Cell> {
        self.nodes.iter().filter_map(|id| graph.cell(*id)).collect()
    }

    /// Headings of consecutive segments.
    pub fn directions(&self, graph: &GridGraph) -> Vec<Direction> {
        self.cells(graph)
            .windows(2)
            .filter_map(|w| Direction::between(w[0], w[1]))
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
struct Frontier {
    estimate: f64,
    node: NodeId,
}

impl PartialEq for Frontier {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Frontier {}

impl Ord for Frontier {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the max-heap pops the smallest estimate; ties go to the lower id.
        other
            .estimate
            .total_cmp(&self.estimate)
            .then_with(|| other.node.cmp(&self.node))
    }
}

impl PartialOrd for Frontier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A* between two nodes. Returns `None` for unknown nodes or when `dst`
/// cannot be reached; callers skip such pairs.
///
/// The heuristic is the Euclidean grid distance scaled by the cheapest
/// weight per grid unit, so it never overestimates.
pub fn find_path(graph: &GridGraph, src: NodeId, dst: NodeId) -> Option<Path> {
    let goal = graph.cell(dst)?;
    graph.cell(src)?;
    if src == dst {
        return Some(Path {
            nodes: vec![src],
            weight: 0.0,
        });
    }

    let scale = graph.heuristic_scale();
    let heuristic = |id: NodeId| -> f64 {
        graph.cell(id).map_or(0.0, |c| {
            let dx = c.col as f64 - goal.col as f64;
            let dy = c.row as f64 - goal.row as f64;
            dx.hypot(dy) * scale
        })
    };

    let n = graph.len();
    let mut best = vec![f64::INFINITY; n];
    let mut prev: Vec<Option<NodeId>> = vec![None; n];
    let mut closed = vec![false; n];
    let mut open = BinaryHeap::new();

    best[src] = 0.0;
    open.push(Frontier {
        estimate: heuristic(src),
        node: src,
    });

    while let Some(Frontier { node, .. }) = open.pop() {
        if node == dst {
            return Some(Path {
                nodes: unwind(&prev, src, dst),
                weight: best[dst],
            });
        }
        if closed[node] {
            continue;
        }
        closed[node] = true;

        for edge in graph.neighbors(node) {
            if closed[edge.to] {
                continue;
            }
            let candidate = best[node] + edge.weight;
            if candidate < best[edge.to] {
                best[edge.to] = candidate;
                prev[edge.to] = Some(node);
                open.push(Frontier {
                    estimate: candidate + heuristic(edge.to),
                    node: edge.to,
                });
            }
        }
    }
    None
}

fn unwind(prev: &[Option<NodeId>], src: NodeId, dst: NodeId) -> Vec<NodeId> {
    let mut nodes = vec![dst];
    let mut current = dst;
    while current != src {
        match prev[current] {
            Some(p) => {
                nodes.push(p);
                current = p;
            }
            None => break,
        }
    }
    nodes.reverse();
    nodes
}

/// Converts routes into the time units the allocation oracle reasons in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostModel {
    pub move_ms_per_cm: f64,
    pub turn_ms_per_45deg: f64,
    pub unreachable_cost: u64,
}

impl CostModel {
    /// Heading assumed before the first segment of every costed path.
    pub const REFERENCE_HEADING: Direction = Direction::N;

    pub fn from_config(config: &PlannerConfig) -> Self {
        Self {
            move_ms_per_cm: config.move_ms_per_cm,
            turn_ms_per_45deg: config.turn_ms_per_45deg,
            unreachable_cost: config.unreachable_cost,
        }
    }

    pub fn movement_ms(&self, path: &Path) -> f64 {
        path.weight * self.move_ms_per_cm
    }

    /// Turning time accumulated along the path, in 45° steps.
    pub fn turning_ms(&self, graph: &GridGraph, path: &Path) -> f64 {
        let mut heading = Self::REFERENCE_HEADING;
        let mut steps = 0u32;
        for next in path.directions(graph) {
            steps += heading.turn_to(next).unsigned_abs() / 45;
            heading = next;
        }
        steps as f64 * self.turn_ms_per_45deg
    }

    pub fn path_cost_ms(&self, graph: &GridGraph, path: &Path) -> f64 {
        self.movement_ms(path) + self.turning_ms(graph, path)
    }
}

/// Square matrix of travel costs between action points, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CostMatrix {
    size: usize,
    costs: Vec<u64>,
}

impl CostMatrix {
    pub fn from_rows(rows: Vec<Vec<u64>>) -> Self {
        let size = rows.len();
        let costs = rows.into_iter().flat_map(|r| r.into_iter().take(size)).collect();
        Self { size, costs }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn get(&self, from: usize, to: usize) -> u64 {
        self.costs[from * self.size + to]
    }

    pub fn rows(&self) -> Vec<Vec<u64>> {
        self.costs.chunks(self.size.max(1)).map(<[u64]>::to_vec).collect()
    }
}

/// All ordered pairs over `action_points`. Unreachable pairs get the
/// model's sentinel so the oracle treats them as disallowed.
pub fn cost_matrix(graph: &GridGraph, action_points: &[NodeId], model: &CostModel) -> CostMatrix {
    let size = action_points.len();
    let mut costs = vec![model.unreachable_cost; size * size];
    for (i, &from) in action_points.iter().enumerate() {
        for (j, &to) in action_points.iter().enumerate() {
            if i == j {
                costs[i * size + j] = 0;
                continue;
            }
            match find_path(graph, from, to) {
                Some(path) => {
                    let cost = model.path_cost_ms(graph, &path).floor() as u64;
                    costs[i * size + j] = cost.min(model.unreachable_cost);
                }
                None => {
                    tracing::debug!(from, to, "No path between action points");
                }
            }
        }
    }
    CostMatrix { size, costs }
}
