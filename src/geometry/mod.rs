//! Geometry utilities: rigid poses, SO(3) helpers.

pub mod pose;
pub mod so3;

pub use pose::{Odometry, Pose};
pub use so3::{gravity_to_rotation, right_jacobian_so3, rotation_between_vectors, skew, tangent_basis};
