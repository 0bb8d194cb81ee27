//! Simulated collaborators for the fleet planner.
//!
//! An [`world::ArenaWorld`] holds the ground truth. [`robot::SimulatedRobot`]
//! implements the physical interface over an impaired link and moves robots
//! in that world; [`camera::SimulatedCamera`] renders it back as perception
//! observations.

pub mod camera;
pub mod impairment;
pub mod robot;
pub mod scenario;
pub mod world;

pub use scenario::{Scenario, SimArena};
