//! Type aliases for IMU covariance and factor matrices.
//!
//! Preintegration covariance lives in the 9-dimensional space [δθ, δv, δp];
//! the full inertial factor adds the two bias random-walk terms.

use nalgebra::{SMatrix, SVector};

/// 9×9 covariance matrix for preintegrated state [δθ, δv, δp].
pub type Matrix9 = SMatrix<f64, 9, 9>;

/// 9×6 Jacobian matrix (state w.r.t. noise).
pub type Matrix9x6 = SMatrix<f64, 9, 6>;

/// 6×6 measurement noise covariance matrix.
pub type Matrix6 = SMatrix<f64, 6, 6>;

/// 15×15 inertial factor matrix [δθ, δv, δp, δba, δbg].
pub type Matrix15 = SMatrix<f64, 15, 15>;

/// 15-dimensional inertial residual.
pub type Vector15 = SVector<f64, 15>;
