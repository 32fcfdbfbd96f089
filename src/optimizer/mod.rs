//! Optimization boundary: parameter blocks, factors, marginalization and the solver contract.
//!
//! - [`params`]: flat parameter vectors exchanged with the optimizer
//! - [`prior`]: linearized prior left by marginalization
//! - [`imu_factors`]: inertial residual between consecutive frames
//! - [`marginalizer`]: Schur-complement elimination of evicted frames
//! - [`solver`]: optimizer trait and a dense Gauss-Newton default

pub mod imu_factors;
pub mod marginalizer;
pub mod params;
pub mod prior;
pub mod solver;

pub use imu_factors::ImuFactor;
pub use marginalizer::{
    EvictedBlock, ImuLink, LinearizedFactor, MarginalizationOutcome, MarginalizationRequest,
    Marginalizer, SchurMarginalizer,
};
pub use params::{ParamBlocks, ParamKey};
pub use prior::PriorFactor;
pub use solver::{DenseGaussNewton, OptimizationProblem, Optimizer, SolveReport, VisualFactor};
