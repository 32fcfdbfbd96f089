//! IMU preintegration between consecutive keyframes.
//!
//! Deltas are expressed in the body frame of the first keyframe and exclude
//! gravity, so a summary only depends on the raw samples and the bias it was
//! linearized at. The [`PreintegrationEngine`] trait is the seam the
//! estimator depends on; [`MidpointPreintegrator`] is the default engine.

use nalgebra::{Matrix3, UnitQuaternion, Vector3};

use super::sample::{ImuBias, ImuNoise, ImuSample};
use super::types::{Matrix6, Matrix9, Matrix9x6};
use crate::geometry::so3::{right_jacobian_so3, skew};

/// Preintegrated motion between two frames.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreintegratedState {
    pub delta_rot: UnitQuaternion<f64>,
    pub delta_vel: Vector3<f64>,
    pub delta_pos: Vector3<f64>,
    pub dt: f64,
    pub sample_count: usize,

    // ─────────────────────────────────────────────────────────────────────
    // Linearization
    // ─────────────────────────────────────────────────────────────────────
    /// Bias the deltas were integrated with.
    pub linearized_bias: ImuBias,
    pub jac_rot_bg: Matrix3<f64>,
    pub jac_vel_ba: Matrix3<f64>,
    pub jac_vel_bg: Matrix3<f64>,
    pub jac_pos_ba: Matrix3<f64>,
    pub jac_pos_bg: Matrix3<f64>,
    /// Covariance of [δθ, δv, δp].
    pub covariance: Matrix9,
}

impl PreintegratedState {
    pub fn identity(bias: ImuBias) -> Self {
        Self {
            delta_rot: UnitQuaternion::identity(),
            delta_vel: Vector3::zeros(),
            delta_pos: Vector3::zeros(),
            dt: 0.0,
            sample_count: 0,
            linearized_bias: bias,
            jac_rot_bg: Matrix3::zeros(),
            jac_vel_ba: Matrix3::zeros(),
            jac_vel_bg: Matrix3::zeros(),
            jac_pos_ba: Matrix3::zeros(),
            jac_pos_bg: Matrix3::zeros(),
            covariance: Matrix9::zeros(),
        }
    }

    /// First-order bias correction of the deltas.
    ///
    /// Returns `(δR, δv, δp)` as they would be integrated with `bias`.
    pub fn correct(
        &self,
        bias: &ImuBias,
    ) -> (UnitQuaternion<f64>, Vector3<f64>, Vector3<f64>) {
        let dba = bias.accel - self.linearized_bias.accel;
        let dbg = bias.gyro - self.linearized_bias.gyro;

        let rot = self.delta_rot * UnitQuaternion::from_scaled_axis(self.jac_rot_bg * dbg);
        let vel = self.delta_vel + self.jac_vel_ba * dba + self.jac_vel_bg * dbg;
        let pos = self.delta_pos + self.jac_pos_ba * dba + self.jac_pos_bg * dbg;
        (rot, vel, pos)
    }

    /// Predict rotation, position and velocity at the end of the interval.
    pub fn predict(
        &self,
        rot_i: &UnitQuaternion<f64>,
        pos_i: &Vector3<f64>,
        vel_i: &Vector3<f64>,
        gravity: &Vector3<f64>,
        bias: &ImuBias,
    ) -> (UnitQuaternion<f64>, Vector3<f64>, Vector3<f64>) {
        let (d_rot, d_vel, d_pos) = self.correct(bias);
        let dt = self.dt;
        let rot = rot_i * d_rot;
        let pos = pos_i + vel_i * dt + 0.5 * gravity * dt * dt + rot_i * d_pos;
        let vel = vel_i + gravity * dt + rot_i * d_vel;
        (rot, pos, vel)
    }
}

impl std::fmt::Display for PreintegratedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (roll, pitch, yaw) = self.delta_rot.euler_angles();
        write!(
            f,
            "dt {:.3}s n {} dP [{:+.3}, {:+.3}, {:+.3}] dV [{:+.3}, {:+.3}, {:+.3}] dR ypr [{:+.2}, {:+.2}, {:+.2}]deg",
            self.dt,
            self.sample_count,
            self.delta_pos.x,
            self.delta_pos.y,
            self.delta_pos.z,
            self.delta_vel.x,
            self.delta_vel.y,
            self.delta_vel.z,
            yaw.to_degrees(),
            pitch.to_degrees(),
            roll.to_degrees()
        )
    }
}

/// Integrates IMU samples into a relative-motion summary.
///
/// Implementations must be deterministic: identical samples and bias give
/// identical summaries.
pub trait PreintegrationEngine: Send + Sync {
    /// Returns `None` when fewer than two samples are supplied.
    fn integrate(&self, samples: &[ImuSample], bias: &ImuBias) -> Option<PreintegratedState>;
}

/// Midpoint integration with bias Jacobians and covariance propagation.
#[derive(Debug, Clone, Copy, Default)]
pub struct MidpointPreintegrator {
    pub noise: ImuNoise,
}

impl MidpointPreintegrator {
    pub fn new(noise: ImuNoise) -> Self {
        Self { noise }
    }
}

impl PreintegrationEngine for MidpointPreintegrator {
    fn integrate(&self, samples: &[ImuSample], bias: &ImuBias) -> Option<PreintegratedState> {
        if samples.len() < 2 {
            return None;
        }
        let mut preint = Preintegrator::new(*bias, self.noise);
        for pair in samples.windows(2) {
            preint.integrate(pair[0], pair[1]);
        }
        Some(preint.state)
    }
}

/// Incremental preintegrator: integrates high-rate IMU into a relative motion prior.
pub struct Preintegrator {
    pub bias: ImuBias,
    pub noise: ImuNoise,
    pub state: PreintegratedState,
}

impl Preintegrator {
    pub fn new(bias: ImuBias, noise: ImuNoise) -> Self {
        Self {
            bias,
            noise,
            state: PreintegratedState::identity(bias),
        }
    }

    pub fn reset(&mut self) {
        self.state = PreintegratedState::identity(self.bias);
    }

    /// Integrate a single time step using midpoint integration.
    pub fn integrate(&mut self, prev: ImuSample, curr: ImuSample) {
        let dt = curr.timestamp_s - prev.timestamp_s;
        if dt <= 0.0 {
            return;
        }

        let rot_prev = self.state.delta_rot;
        let rot_prev_mat = rot_prev.to_rotation_matrix().into_inner();

        let omega = 0.5 * (prev.gyro + curr.gyro) - self.bias.gyro;
        let step_rot = UnitQuaternion::from_scaled_axis(omega * dt);
        let rot_curr = rot_prev * step_rot;

        let accel_prev = prev.accel - self.bias.accel;
        let accel_curr = curr.accel - self.bias.accel;
        let accel = 0.5 * (rot_prev * accel_prev + rot_curr * accel_curr);
        let accel_body = 0.5 * (accel_prev + accel_curr);

        // Bias Jacobians and covariance use the state before this step.
        let dt2 = dt * dt;
        let acc_skew = skew(&accel_body);
        let step_rot_t = step_rot.to_rotation_matrix().into_inner().transpose();
        let jr = right_jacobian_so3(&(omega * dt));

        let s = &mut self.state;
        s.jac_pos_ba += s.jac_vel_ba * dt - 0.5 * rot_prev_mat * dt2;
        s.jac_pos_bg += s.jac_vel_bg * dt - 0.5 * rot_prev_mat * acc_skew * s.jac_rot_bg * dt2;
        s.jac_vel_ba -= rot_prev_mat * dt;
        s.jac_vel_bg -= rot_prev_mat * acc_skew * s.jac_rot_bg * dt;
        s.jac_rot_bg = step_rot_t * s.jac_rot_bg - jr * dt;

        let mut a = Matrix9::identity();
        a.fixed_view_mut::<3, 3>(0, 0).copy_from(&step_rot_t);
        a.fixed_view_mut::<3, 3>(3, 0)
            .copy_from(&(-rot_prev_mat * acc_skew * dt));
        a.fixed_view_mut::<3, 3>(6, 0)
            .copy_from(&(-0.5 * rot_prev_mat * acc_skew * dt2));
        a.fixed_view_mut::<3, 3>(6, 3)
            .copy_from(&(Matrix3::identity() * dt));

        let mut b = Matrix9x6::zeros();
        b.fixed_view_mut::<3, 3>(0, 0).copy_from(&(jr * dt));
        b.fixed_view_mut::<3, 3>(3, 3).copy_from(&(rot_prev_mat * dt));
        b.fixed_view_mut::<3, 3>(6, 3)
            .copy_from(&(0.5 * rot_prev_mat * dt2));

        let mut q = Matrix6::zeros();
        let gyro_var = self.noise.sigma_gyro * self.noise.sigma_gyro / dt;
        let accel_var = self.noise.sigma_accel * self.noise.sigma_accel / dt;
        for i in 0..3 {
            q[(i, i)] = gyro_var;
            q[(i + 3, i + 3)] = accel_var;
        }
        s.covariance = a * s.covariance * a.transpose() + b * q * b.transpose();

        s.delta_pos += s.delta_vel * dt + 0.5 * accel * dt2;
        s.delta_vel += accel * dt;
        s.delta_rot = rot_curr;
        s.dt += dt;
        s.sample_count = if s.sample_count == 0 { 2 } else { s.sample_count + 1 };
    }

    /// Convenience: build rotation matrix of current delta.
    pub fn delta_rotation_matrix(&self) -> Matrix3<f64> {
        self.state.delta_rot.to_rotation_matrix().into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imu::sample::GRAVITY;
    use approx::assert_relative_eq;

    fn constant_samples(accel: Vector3<f64>, gyro: Vector3<f64>, n: usize, dt: f64) -> Vec<ImuSample> {
        (0..n)
            .map(|i| ImuSample::new(i as f64 * dt, accel, gyro))
            .collect()
    }

    #[test]
    fn test_requires_two_samples() {
        let engine = MidpointPreintegrator::default();
        let samples = constant_samples(Vector3::zeros(), Vector3::zeros(), 1, 0.005);
        assert!(engine.integrate(&samples, &ImuBias::zero()).is_none());
        assert!(engine.integrate(&[], &ImuBias::zero()).is_none());
    }

    #[test]
    fn test_stationary_predicts_rest() {
        // Stationary IMU measures the reaction to gravity.
        let samples = constant_samples(-GRAVITY, Vector3::zeros(), 201, 0.005);
        let engine = MidpointPreintegrator::default();
        let pre = engine.integrate(&samples, &ImuBias::zero()).unwrap();

        assert_relative_eq!(pre.dt, 1.0, epsilon = 1e-9);
        assert_eq!(pre.sample_count, 201);

        let (rot, pos, vel) = pre.predict(
            &UnitQuaternion::identity(),
            &Vector3::zeros(),
            &Vector3::zeros(),
            &GRAVITY,
            &ImuBias::zero(),
        );
        assert!(rot.angle() < 1e-12);
        assert_relative_eq!(pos, Vector3::zeros(), epsilon = 1e-9);
        assert_relative_eq!(vel, Vector3::zeros(), epsilon = 1e-9);
    }

    #[test]
    fn test_constant_rotation_rate() {
        let gyro = Vector3::new(0.0, 0.0, 0.5);
        let samples = constant_samples(Vector3::zeros(), gyro, 101, 0.01);
        let pre = MidpointPreintegrator::default()
            .integrate(&samples, &ImuBias::zero())
            .unwrap();
        assert_relative_eq!(pre.delta_rot.angle(), 0.5, epsilon = 1e-9);
    }

    #[test]
    fn test_deterministic() {
        let samples = constant_samples(Vector3::new(0.1, 0.2, 9.7), Vector3::new(0.01, -0.02, 0.3), 50, 0.005);
        let engine = MidpointPreintegrator::default();
        let bias = ImuBias::new(Vector3::new(0.01, 0.0, 0.0), Vector3::new(0.0, 0.001, 0.0));
        assert_eq!(engine.integrate(&samples, &bias), engine.integrate(&samples, &bias));
    }

    #[test]
    fn test_bias_correction_matches_reintegration() {
        let samples: Vec<ImuSample> = (0..201)
            .map(|i| {
                let t = i as f64 * 0.005;
                ImuSample::new(
                    t,
                    Vector3::new(0.3 * t.sin(), 0.2, 9.81 + 0.1 * t),
                    Vector3::new(0.1, -0.2 * t, 0.3),
                )
            })
            .collect();
        let engine = MidpointPreintegrator::default();
        let bias0 = ImuBias::zero();
        let bias1 = ImuBias::new(
            Vector3::new(0.005, -0.01, 0.005),
            Vector3::new(0.001, 0.0005, -0.001),
        );

        let pre0 = engine.integrate(&samples, &bias0).unwrap();
        let pre1 = engine.integrate(&samples, &bias1).unwrap();
        let (rot, vel, pos) = pre0.correct(&bias1);

        assert!(rot.angle_to(&pre1.delta_rot) < 1e-5);
        assert_relative_eq!(vel, pre1.delta_vel, epsilon = 1e-4);
        assert_relative_eq!(pos, pre1.delta_pos, epsilon = 1e-4);
    }

    #[test]
    fn test_covariance_grows_and_is_symmetric() {
        let samples = constant_samples(-GRAVITY, Vector3::new(0.0, 0.1, 0.0), 101, 0.005);
        let pre = MidpointPreintegrator::default()
            .integrate(&samples, &ImuBias::zero())
            .unwrap();
        for i in 0..9 {
            assert!(pre.covariance[(i, i)] > 0.0);
        }
        assert_relative_eq!(pre.covariance, pre.covariance.transpose(), epsilon = 1e-15);
    }
}
