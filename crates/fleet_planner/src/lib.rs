//! Planning-and-control core for a small robot fleet in a camera-observed arena.
//!
//! The pipeline runs leaf-first:
//!
//! 1. [`graph`] turns calibrated arena corners and obstacle detections into a
//!    weighted 8-connected grid graph.
//! 2. [`path`] searches that graph (A*) and builds the all-pairs cost matrix
//!    (travel time plus turning time) over the action-point set.
//! 3. [`allocation`] builds the agent/task model, calls an
//!    [`allocation::AllocationOracle`] and decodes its packed answer into
//!    per-robot timed schedules.
//! 4. [`compiler`] lowers schedules into primitive [`compiler::Instruction`]s.
//! 5. [`calibration`] finds the command-unit to centimetre factor per robot.
//!
//! Perception and the physical robot link are collaborators, reached through
//! [`actor::PerceptionSource`] and [`interface::PhysicalInterface`].

pub mod actor;
pub mod allocation;
pub mod arena;
pub mod calibration;
pub mod compiler;
pub mod config;
pub mod graph;
pub mod interface;
pub mod path;

pub use config::PlannerConfig;
