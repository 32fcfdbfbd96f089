//! Rigid-body pose and odometry types.
//!
//! A [`Pose`] maps points from a local frame into its parent frame:
//! `p_parent = pose.transform_point(p_local)`. Keyframe poses are body-to-world
//! (`T_wb`), camera extrinsics are camera-to-body (`T_bc`).

use nalgebra::{Quaternion, UnitQuaternion, Vector3};

/// Rigid transform: rotation + translation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl Pose {
    /// Number of elements of the flat parameter block: `[tx, ty, tz, qx, qy, qz, qw]`.
    pub const VECTOR_SIZE: usize = 7;

    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn from_translation(translation: Vector3<f64>) -> Self {
        Self::new(UnitQuaternion::identity(), translation)
    }

    pub fn inverse(&self) -> Self {
        let rotation = self.rotation.inverse();
        Self {
            rotation,
            translation: -(rotation * self.translation),
        }
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Yaw angle (rotation about +z) in radians.
    pub fn yaw(&self) -> f64 {
        self.rotation.euler_angles().2
    }

    /// Write `[tx, ty, tz, qx, qy, qz, qw]` into `out`.
    ///
    /// `out` must hold at least [`Pose::VECTOR_SIZE`] elements.
    pub fn to_vector(&self, out: &mut [f64]) {
        out[0] = self.translation.x;
        out[1] = self.translation.y;
        out[2] = self.translation.z;
        let q = self.rotation.quaternion();
        out[3] = q.i;
        out[4] = q.j;
        out[5] = q.k;
        out[6] = q.w;
    }

    /// Read a pose from `[tx, ty, tz, qx, qy, qz, qw]`.
    ///
    /// The quaternion is renormalized; returns `None` when the slice is too
    /// short, contains non-finite values or holds a zero quaternion.
    pub fn from_vector(v: &[f64]) -> Option<Self> {
        if v.len() < Self::VECTOR_SIZE || v.iter().take(Self::VECTOR_SIZE).any(|x| !x.is_finite()) {
            return None;
        }
        let q = Quaternion::new(v[6], v[3], v[4], v[5]);
        if q.norm() < 1e-12 {
            return None;
        }
        Some(Self {
            rotation: UnitQuaternion::from_quaternion(q),
            translation: Vector3::new(v[0], v[1], v[2]),
        })
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

impl std::ops::Mul for Pose {
    type Output = Pose;

    fn mul(self, rhs: Pose) -> Pose {
        Pose {
            rotation: self.rotation * rhs.rotation,
            translation: self.rotation * rhs.translation + self.translation,
        }
    }
}

impl std::ops::Mul<&Pose> for &Pose {
    type Output = Pose;

    fn mul(self, rhs: &Pose) -> Pose {
        *self * *rhs
    }
}

impl std::fmt::Display for Pose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (roll, pitch, yaw) = self.rotation.euler_angles();
        write!(
            f,
            "t [{:+.3}, {:+.3}, {:+.3}] ypr [{:+.1}, {:+.1}, {:+.1}]deg",
            self.translation.x,
            self.translation.y,
            self.translation.z,
            yaw.to_degrees(),
            pitch.to_degrees(),
            roll.to_degrees()
        )
    }
}

/// Pose plus linear velocity (world frame).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Odometry {
    pub pose: Pose,
    pub velocity: Vector3<f64>,
}

impl Odometry {
    pub fn new(pose: Pose, velocity: Vector3<f64>) -> Self {
        Self { pose, velocity }
    }
}

impl std::fmt::Display for Odometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} v [{:+.3}, {:+.3}, {:+.3}]",
            self.pose, self.velocity.x, self.velocity.y, self.velocity.z
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_pose() -> Pose {
        Pose::new(
            UnitQuaternion::from_euler_angles(0.1, -0.2, 0.7),
            Vector3::new(1.0, -2.0, 0.5),
        )
    }

    #[test]
    fn test_vector_layout_round_trip() {
        let pose = sample_pose();
        let mut v = [0.0; Pose::VECTOR_SIZE];
        pose.to_vector(&mut v);

        assert_relative_eq!(v[0], 1.0);
        assert_relative_eq!(v[6], pose.rotation.quaternion().w);

        let back = Pose::from_vector(&v).unwrap();
        assert_relative_eq!(back.translation, pose.translation, epsilon = 1e-12);
        assert!(back.rotation.angle_to(&pose.rotation) < 1e-12);
    }

    #[test]
    fn test_from_vector_renormalizes() {
        let v = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 2.0];
        let pose = Pose::from_vector(&v).unwrap();
        assert_relative_eq!(pose.rotation.quaternion().norm(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_from_vector_rejects_zero_quaternion() {
        let v = [1.0, 2.0, 3.0, 0.0, 0.0, 0.0, 0.0];
        assert!(Pose::from_vector(&v).is_none());
        assert!(Pose::from_vector(&v[..5]).is_none());
    }

    #[test]
    fn test_compose_with_inverse_is_identity() {
        let pose = sample_pose();
        let id = pose * pose.inverse();
        assert_relative_eq!(id.translation, Vector3::zeros(), epsilon = 1e-12);
        assert!(id.rotation.angle() < 1e-12);
    }
}
