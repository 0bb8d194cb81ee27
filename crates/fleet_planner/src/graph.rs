//! Grid graph construction and dynamic re-weighting.
//!
//! Nodes are the cells of a `cols × rows` grid laid over the arena; edges
//! connect each cell to its (up to) eight neighbours. Edge weights are
//! physical distances in centimetres, raised near detected obstacles.

use std::sync::Arc;

use nalgebra::Point2;
use serde::Deserialize;

use crate::arena::{ArenaCorners, ArenaError, PixelPoint};
use crate::config::PlannerConfig;

pub type NodeId = usize;

/// Grid coordinate of a node. `col` grows with image x, `row` with image y.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cell {
    pub col: usize,
    pub row: usize,
}

impl Cell {
    pub fn new(col: usize, row: usize) -> Self {
        Self { col, row }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub cell: Cell,
    pub pixel: PixelPoint,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Edge {
    pub to: NodeId,
    /// Unpenalised physical length of the edge.
    pub distance_cm: f64,
    /// Routing weight: `distance_cm`, multiplied when an endpoint is near an obstacle.
    pub weight: f64,
}

/// Centimetres per pixel along x, along y and along the arena diagonal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelConversion {
    pub cm_per_px_x: f64,
    pub cm_per_px_y: f64,
    pub cm_per_px_diagonal: f64,
}

impl PixelConversion {
    fn compute(config: &PlannerConfig, corners: &ArenaCorners) -> Self {
        let (len_px, height_px) = (corners.pixel_length(), corners.pixel_height());
        let (len_cm, height_cm) = (config.arena_length_cm, config.arena_height_cm);
        Self {
            cm_per_px_x: len_cm / len_px,
            cm_per_px_y: height_cm / height_px,
            cm_per_px_diagonal: len_cm.hypot(height_cm) / len_px.hypot(height_px),
        }
    }

    pub fn as_array(&self) -> [f64; 3] {
        [self.cm_per_px_x, self.cm_per_px_y, self.cm_per_px_diagonal]
    }
}

/// A transient obstacle outline in pixel space.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Obstacle {
    pub outline: Vec<PixelPoint>,
}

impl Obstacle {
    pub fn new(outline: Vec<PixelPoint>) -> Self {
        Self { outline }
    }

    /// Polygon area (shoelace).
    pub fn area(&self) -> f64 {
        let n = self.outline.len();
        if n < 3 {
            return 0.0;
        }
        let twice: f64 = (0..n)
            .map(|i| {
                let (a, b) = (self.outline[i], self.outline[(i + 1) % n]);
                a.x * b.y - b.x * a.y
            })
            .sum();
        twice.abs() / 2.0
    }

    /// Distance from `p` to the outline; zero when `p` is inside.
    pub fn distance_to(&self, p: PixelPoint) -> f64 {
        if self.outline.is_empty() {
            return f64::INFINITY;
        }
        if self.contains(p) {
            return 0.0;
        }
        let n = self.outline.len();
        (0..n)
            .map(|i| segment_distance(p, self.outline[i], self.outline[(i + 1) % n]))
            .fold(f64::INFINITY, f64::min)
    }

    fn contains(&self, p: PixelPoint) -> bool {
        let n = self.outline.len();
        if n < 3 {
            return false;
        }
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let (a, b) = (self.outline[i], self.outline[j]);
            if (a.y > p.y) != (b.y > p.y) && p.x < (b.x - a.x) * (p.y - a.y) / (b.y - a.y) + a.x {
                inside = !inside;
            }
            j = i;
        }
        inside
    }
}

fn segment_distance(p: PixelPoint, a: PixelPoint, b: PixelPoint) -> f64 {
    let ab = b - a;
    let len_sq = ab.norm_squared();
    if len_sq == 0.0 {
        return (p - a).norm();
    }
    let t = ((p - a).dot(&ab) / len_sq).clamp(0.0, 1.0);
    (p - (a + ab * t)).norm()
}

/// The navigable arena graph.
#[derive(Debug, Clone)]
pub struct GridGraph {
    cols: usize,
    rows: usize,
    nodes: Vec<Node>,
    adjacency: Vec<Vec<Edge>>,
    penalized: Vec<bool>,
    conversion: PixelConversion,
    heuristic_scale: f64,
}

impl GridGraph {
    /// Builds an unpenalised graph over the arena described by `corners`.
    pub fn build(corners: &ArenaCorners, config: &PlannerConfig) -> Result<Self, ArenaError> {
        for (name, value) in [
            ("block_size_cm", config.block_size_cm),
            ("arena_length_cm", config.arena_length_cm),
            ("arena_height_cm", config.arena_height_cm),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(ArenaError::InvalidDimension { name, value });
            }
        }

        let len_px = corners.pixel_length();
        let height_px = corners.pixel_height();
        let block_len_px = (config.block_size_cm / config.arena_length_cm) * len_px;
        let block_height_px = (config.block_size_cm / config.arena_height_cm) * height_px;
        let cols = cell_count(len_px, block_len_px);
        let rows = cell_count(height_px, block_height_px);

        let transform = corners.grid_transform(cols, rows)?;
        let mut nodes = Vec::with_capacity(cols * rows);
        for row in 0..rows {
            for col in 0..cols {
                nodes.push(Node {
                    cell: Cell::new(col, row),
                    pixel: transform.project(Point2::new(col as f64, row as f64)),
                });
            }
        }

        let conversion = PixelConversion::compute(config, corners);
        let mut graph = Self {
            cols,
            rows,
            penalized: vec![false; nodes.len()],
            adjacency: vec![Vec::with_capacity(8); nodes.len()],
            nodes,
            conversion,
            heuristic_scale: 0.0,
        };
        graph.connect()?;
        Ok(graph)
    }

    /// Wires 8-neighbour edges and derives their physical lengths.
    fn connect(&mut self) -> Result<(), ArenaError> {
        let mut scale = f64::INFINITY;
        for id in 0..self.nodes.len() {
            let Cell { col, row } = self.nodes[id].cell;
            for dr in -1i64..=1 {
                for dc in -1i64..=1 {
                    if dr == 0 && dc == 0 {
                        continue;
                    }
                    let (c, r) = (col as i64 + dc, row as i64 + dr);
                    if c < 0 || r < 0 || c >= self.cols as i64 || r >= self.rows as i64 {
                        continue;
                    }
                    let to = self.index(Cell::new(c as usize, r as usize));
                    let px = (self.nodes[to].pixel - self.nodes[id].pixel).norm();
                    let factor = match (dc, dr) {
                        (_, 0) => self.conversion.cm_per_px_x,
                        (0, _) => self.conversion.cm_per_px_y,
                        _ => self.conversion.cm_per_px_diagonal,
                    };
                    let distance_cm = px * factor;
                    if !(distance_cm.is_finite() && distance_cm >= 0.0) {
                        return Err(ArenaError::Degenerate {
                            reason: format!("edge {id}->{to} has weight {distance_cm}"),
                        });
                    }
                    let grid_len = if dc != 0 && dr != 0 { std::f64::consts::SQRT_2 } else { 1.0 };
                    scale = scale.min(distance_cm / grid_len);
                    self.adjacency[id].push(Edge {
                        to,
                        distance_cm,
                        weight: distance_cm,
                    });
                }
            }
        }
        self.heuristic_scale = if scale.is_finite() { scale } else { 0.0 };
        Ok(())
    }

    /// Clears every previous penalty, then raises the weight of all edges
    /// touching a node within the proximity threshold of a significant
    /// obstacle. Edges are never removed so the graph stays routable.
    ///
    /// Returns the number of penalised nodes.
    pub fn apply_obstacles(&mut self, obstacles: &[Obstacle], config: &PlannerConfig) -> usize {
        self.penalized.iter_mut().for_each(|p| *p = false);

        let significant: Vec<&Obstacle> = obstacles
            .iter()
            .filter(|o| o.area() > config.obstacle_min_area_px)
            .collect();
        for (id, node) in self.nodes.iter().enumerate() {
            if significant
                .iter()
                .any(|o| o.distance_to(node.pixel) <= config.obstacle_proximity_px)
            {
                self.penalized[id] = true;
            }
        }

        for id in 0..self.adjacency.len() {
            for k in 0..self.adjacency[id].len() {
                let edge = self.adjacency[id][k];
                let touched = self.penalized[id] || self.penalized[edge.to];
                self.adjacency[id][k].weight = if touched {
                    edge.distance_cm * config.obstacle_penalty
                } else {
                    edge.distance_cm
                };
            }
        }
        self.penalized.iter().filter(|p| **p).count()
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn cell(&self, id: NodeId) -> Option<Cell> {
        self.nodes.get(id).map(|n| n.cell)
    }

    pub fn node_at(&self, cell: Cell) -> Option<NodeId> {
        (cell.col < self.cols && cell.row < self.rows).then(|| self.index(cell))
    }

    fn index(&self, cell: Cell) -> NodeId {
        cell.row * self.cols + cell.col
    }

    pub fn neighbors(&self, id: NodeId) -> &[Edge] {
        self.adjacency.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn edge(&self, from: NodeId, to: NodeId) -> Option<&Edge> {
        self.neighbors(from).iter().find(|e| e.to == to)
    }

    pub fn is_penalized(&self, id: NodeId) -> bool {
        self.penalized.get(id).copied().unwrap_or(false)
    }

    pub fn pixel_conversion(&self) -> PixelConversion {
        self.conversion
    }

    /// Lower bound on weight per unit of grid distance; scales the A* heuristic.
    pub fn heuristic_scale(&self) -> f64 {
        self.heuristic_scale
    }

    /// Node whose pixel position is closest to `pixel` (lowest id on ties).
    pub fn nearest_node(&self, pixel: PixelPoint) -> Option<NodeId> {
        let mut best: Option<(NodeId, f64)> = None;
        for (id, node) in self.nodes.iter().enumerate() {
            let d = (node.pixel - pixel).norm_squared();
            if best.map_or(true, |(_, bd)| d < bd) {
                best = Some((id, d));
            }
        }
        best.map(|(id, _)| id)
    }
}

fn cell_count(extent_px: f64, block_px: f64) -> usize {
    let ratio = extent_px / block_px;
    if ratio.is_finite() && ratio > 0.0 {
        (ratio + 1e-9).floor() as usize
    } else {
        0
    }
}

/// Keeps the latest good graph across refresh cycles.
///
/// Corners are re-derived only when a new detection arrives; a malformed
/// detection is logged and leaves both the corners and the graph untouched.
#[derive(Debug)]
pub struct GraphBuilder {
    config: PlannerConfig,
    corners: Option<ArenaCorners>,
    current: Option<Arc<GridGraph>>,
}

impl GraphBuilder {
    pub fn new(config: PlannerConfig) -> Self {
        Self {
            config,
            corners: None,
            current: None,
        }
    }

    pub fn current(&self) -> Option<Arc<GridGraph>> {
        self.current.clone()
    }

    pub fn corners(&self) -> Option<&ArenaCorners> {
        self.corners.as_ref()
    }

    /// Rebuilds the graph. `detected_corners` is `None` when this frame
    /// carried no new corner detection, in which case the previous corners
    /// are reused.
    pub fn refresh(
        &mut self,
        detected_corners: Option<&[(String, PixelPoint)]>,
        obstacles: &[Obstacle],
    ) -> Result<Arc<GridGraph>, ArenaError> {
        let corners = match detected_corners {
            Some(named) => {
                ArenaCorners::from_named(named.iter().map(|(n, p)| (n.as_str(), *p))).map_err(|e| {
                    tracing::warn!(error = %e, "Malformed arena corners; keeping previous graph");
                    e
                })?
            }
            None => self
                .corners
                .clone()
                .ok_or(ArenaError::MissingCorner("top_left"))?,
        };

        let mut graph = GridGraph::build(&corners, &self.config).map_err(|e| {
            tracing::warn!(error = %e, "Graph rebuild failed; keeping previous graph");
            e
        })?;
        let penalized = graph.apply_obstacles(obstacles, &self.config);
        tracing::debug!(
            cols = graph.cols(),
            rows = graph.rows(),
            obstacles = obstacles.len(),
            penalized,
            "Grid graph rebuilt"
        );

        let graph = Arc::new(graph);
        self.corners = Some(corners);
        self.current = Some(graph.clone());
        Ok(graph)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A `cols × rows` arena drawn 1 cm per pixel with square 10 cm cells.
    pub(crate) fn fixture(cols: usize, rows: usize) -> (ArenaCorners, PlannerConfig) {
        let (w, h) = (cols as f64 * 10.0, rows as f64 * 10.0);
        let corners = ArenaCorners::new(
            PixelPoint::new(0.0, 0.0),
            PixelPoint::new(w, 0.0),
            PixelPoint::new(0.0, h),
            PixelPoint::new(w, h),
        )
        .unwrap();
        let config = PlannerConfig {
            block_size_cm: 10.0,
            arena_length_cm: w,
            arena_height_cm: h,
            obstacle_proximity_px: 1.0,
            obstacle_min_area_px: 10.0,
            ..PlannerConfig::default()
        };
        (corners, config)
    }

    pub(crate) fn grid(cols: usize, rows: usize) -> GridGraph {
        let (corners, config) = fixture(cols, rows);
        GridGraph::build(&corners, &config).unwrap()
    }

    fn named(corners: &ArenaCorners) -> Vec<(String, PixelPoint)> {
        crate::arena::Corner::ALL
            .iter()
            .map(|c| (c.name().to_string(), corners.get(*c)))
            .collect()
    }

    #[test]
    fn dimensions_follow_block_size() {
        let g = grid(6, 4);
        assert_eq!((g.cols(), g.rows()), (6, 4));
        assert_eq!(g.len(), 24);
        // corner, edge and interior degree
        assert_eq!(g.neighbors(0).len(), 3);
        assert_eq!(g.neighbors(1).len(), 5);
        assert_eq!(g.neighbors(7).len(), 8);
    }

    #[test]
    fn weights_are_finite_symmetric_and_physical() {
        let g = grid(5, 5);
        for id in 0..g.len() {
            for e in g.neighbors(id) {
                assert!(e.weight.is_finite() && e.weight >= 0.0);
                let back = g.edge(e.to, id).unwrap();
                assert!((back.weight - e.weight).abs() < 1e-9);
            }
        }
        // 5 nodes span 50 px, so neighbouring centres sit 12.5 px apart.
        let right = g.edge(0, 1).unwrap();
        assert!((right.distance_cm - 12.5).abs() < 1e-9);
        let diag = g.edge(0, 6).unwrap();
        assert!((diag.distance_cm - 12.5 * std::f64::consts::SQRT_2).abs() < 1e-9);
    }

    #[test]
    fn obstacle_penalises_nearby_nodes_only() {
        let (corners, config) = fixture(5, 5);
        let mut g = GridGraph::build(&corners, &config).unwrap();
        // 6x6 px square around the centre node at (25, 25).
        let obstacle = Obstacle::new(vec![
            PixelPoint::new(22.0, 22.0),
            PixelPoint::new(28.0, 22.0),
            PixelPoint::new(28.0, 28.0),
            PixelPoint::new(22.0, 28.0),
        ]);
        assert_eq!(g.apply_obstacles(&[obstacle], &config), 1);
        let centre = g.node_at(Cell::new(2, 2)).unwrap();
        assert!(g.is_penalized(centre));
        let into = g.edge(centre - 1, centre).unwrap();
        assert!((into.weight - into.distance_cm * config.obstacle_penalty).abs() < 1e-9);
        assert_eq!(g.edge(0, 1).unwrap().weight, g.edge(0, 1).unwrap().distance_cm);

        // Re-applying with no obstacles clears the previous penalties.
        assert_eq!(g.apply_obstacles(&[], &config), 0);
        assert!(!g.is_penalized(centre));
        let into = g.edge(centre - 1, centre).unwrap();
        assert_eq!(into.weight, into.distance_cm);
    }

    #[test]
    fn small_obstacles_are_ignored() {
        let (corners, config) = fixture(5, 5);
        let mut g = GridGraph::build(&corners, &config).unwrap();
        let speck = Obstacle::new(vec![
            PixelPoint::new(24.0, 24.0),
            PixelPoint::new(26.0, 24.0),
            PixelPoint::new(26.0, 26.0),
        ]);
        assert!(speck.area() <= config.obstacle_min_area_px);
        assert_eq!(g.apply_obstacles(&[speck], &config), 0);
    }

    #[test]
    fn nearest_node_snaps_to_closest_centre() {
        let g = grid(5, 5);
        let id = g.nearest_node(PixelPoint::new(26.0, 36.0)).unwrap();
        assert_eq!(g.cell(id), Some(Cell::new(2, 3)));
    }

    #[test]
    fn malformed_corners_keep_previous_graph() {
        let (corners, config) = fixture(5, 5);
        let mut builder = GraphBuilder::new(config);
        let first = builder.refresh(Some(named(&corners).as_slice()), &[]).unwrap();

        let broken = vec![("top_left".to_string(), PixelPoint::new(0.0, 0.0))];
        assert!(builder.refresh(Some(broken.as_slice()), &[]).is_err());
        let kept = builder.current().unwrap();
        assert!(Arc::ptr_eq(&first, &kept));

        // A frame without new corners reuses the previous ones.
        let again = builder.refresh(None, &[]).unwrap();
        assert_eq!(again.len(), first.len());
    }

    #[test]
    fn refresh_without_any_corners_fails() {
        let (_, config) = fixture(5, 5);
        let mut builder = GraphBuilder::new(config);
        assert!(builder.refresh(None, &[]).is_err());
        assert!(builder.current().is_none());
    }
}
