//! Visual-inertial bootstrap: gyroscope bias, velocities, gravity and scale.

pub mod alignment;
mod mono_init;

pub use alignment::{AlignmentSolution, linear_alignment, refine_gravity, solve_gyroscope_bias};
