pub mod config;
pub mod error;
pub mod estimator;
pub mod geometry;
pub mod imu;
pub mod initialization;
pub mod landmark;
pub mod optimizer;
pub mod sim;
pub mod system;
pub mod types;

pub use config::EstimatorConfig;
pub use error::{AlignmentError, MarginalizeError, SolveError, StateError};
pub use estimator::EstimatorState;
