//! Deterministic synthetic data: trajectories, IMU samples and landmark observations.
//!
//! The trajectory has analytic position, velocity and acceleration, so IMU
//! samples are exact up to the chosen bias. Used by the tests and the demo
//! binary.

use nalgebra::{UnitQuaternion, Vector2, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::estimator::frame::{ImuSlice, VisualFrameDesc};
use crate::geometry::{Odometry, Pose};
use crate::imu::{GRAVITY, ImuBias, ImuSample};
use crate::landmark::LandmarkObservation;
use crate::types::{AgentId, CamId, FrameId, LandmarkId};

/// Sinusoidal translation with a constant body angular rate.
///
/// `p(t) = origin + A ⊙ sin(w ⊙ t)`, `R(t) = R0 · Exp(ω t)`.
#[derive(Debug, Clone)]
pub struct SyntheticTrajectory {
    pub origin: Vector3<f64>,
    pub amplitude: Vector3<f64>,
    /// Angular frequency of each axis (rad/s).
    pub frequency: Vector3<f64>,
    /// Constant world velocity added to the oscillation.
    pub drift: Vector3<f64>,
    pub initial_rotation: UnitQuaternion<f64>,
    /// Body-frame angular rate (rad/s).
    pub body_rate: Vector3<f64>,
    /// Bias added to every IMU sample.
    pub bias: ImuBias,
    /// IMU sampling rate (Hz)
    pub imu_rate: f64,
}

impl Default for SyntheticTrajectory {
    fn default() -> Self {
        Self {
            origin: Vector3::zeros(),
            amplitude: Vector3::new(1.0, 0.8, 0.3),
            frequency: Vector3::new(1.2, 1.5, 2.0),
            drift: Vector3::zeros(),
            initial_rotation: UnitQuaternion::identity(),
            body_rate: Vector3::new(0.05, -0.04, 0.3),
            bias: ImuBias::zero(),
            imu_rate: 200.0,
        }
    }
}

impl SyntheticTrajectory {
    pub fn rotation_at(&self, t: f64) -> UnitQuaternion<f64> {
        self.initial_rotation * UnitQuaternion::from_scaled_axis(self.body_rate * t)
    }

    pub fn position_at(&self, t: f64) -> Vector3<f64> {
        self.origin + self.drift * t + self.amplitude.component_mul(&(self.frequency * t).map(f64::sin))
    }

    /// World-frame velocity.
    pub fn velocity_at(&self, t: f64) -> Vector3<f64> {
        self.drift
            + self
                .amplitude
                .component_mul(&self.frequency)
                .component_mul(&(self.frequency * t).map(f64::cos))
    }

    /// World-frame acceleration.
    pub fn acceleration_at(&self, t: f64) -> Vector3<f64> {
        -self
            .amplitude
            .component_mul(&self.frequency.component_mul(&self.frequency))
            .component_mul(&(self.frequency * t).map(f64::sin))
    }

    pub fn odometry_at(&self, t: f64) -> Odometry {
        Odometry::new(
            Pose::new(self.rotation_at(t), self.position_at(t)),
            self.velocity_at(t),
        )
    }

    /// Specific force and angular rate as an IMU at time `t` reports them.
    pub fn imu_sample(&self, t: f64) -> ImuSample {
        let rot = self.rotation_at(t);
        let specific_force = rot.inverse() * (self.acceleration_at(t) - GRAVITY);
        ImuSample::new(
            t,
            specific_force + self.bias.accel,
            self.body_rate + self.bias.gyro,
        )
    }

    /// Samples at the IMU rate covering `[t0, t1]`, both ends included.
    pub fn imu_between(&self, t0: f64, t1: f64) -> Vec<ImuSample> {
        let n = ((t1 - t0) * self.imu_rate).round().max(1.0) as usize;
        let step = (t1 - t0) / n as f64;
        (0..=n).map(|i| self.imu_sample(t0 + i as f64 * step)).collect()
    }
}

/// Static 3D points.
#[derive(Debug, Clone, Default)]
pub struct SyntheticScene {
    pub points: Vec<Vector3<f64>>,
}

impl SyntheticScene {
    /// Square grid of `n × n` points with spacing `step` at height `z`.
    pub fn ceiling(n: usize, step: f64, z: f64) -> Self {
        let half = (n as f64 - 1.0) * step / 2.0;
        let mut points = Vec::with_capacity(n * n);
        for i in 0..n {
            for j in 0..n {
                let jitter = 0.4 * (((i * 7 + j * 3) % 5) as f64 / 5.0 - 0.5);
                points.push(Vector3::new(
                    i as f64 * step - half,
                    j as f64 * step - half,
                    z + jitter,
                ));
            }
        }
        Self { points }
    }

    /// Observations of every point in front of `camera_pose` (camera-to-world)
    /// within the normalized field of view.
    pub fn observe(
        &self,
        frame: FrameId,
        camera: CamId,
        camera_pose: &Pose,
        stamp: f64,
        noise: Option<(&mut StdRng, f64)>,
    ) -> Vec<LandmarkObservation> {
        let world_to_cam = camera_pose.inverse();
        let mut noise = noise;
        let mut out = Vec::new();
        for (i, p) in self.points.iter().enumerate() {
            let pc = world_to_cam.transform_point(p);
            if pc.z < 0.2 {
                continue;
            }
            let mut uv = Vector2::new(pc.x / pc.z, pc.y / pc.z);
            if uv.x.abs() > 1.2 || uv.y.abs() > 1.2 {
                continue;
            }
            if let Some((rng, sigma)) = noise.as_mut() {
                uv.x += rng.gen_range(-*sigma..=*sigma);
                uv.y += rng.gen_range(-*sigma..=*sigma);
            }
            out.push(LandmarkObservation::new(LandmarkId(i as u64), frame, camera, uv, stamp));
        }
        out
    }
}

/// One agent flying a [`SyntheticTrajectory`] through a [`SyntheticScene`].
#[derive(Debug, Clone)]
pub struct SyntheticRun {
    pub trajectory: SyntheticTrajectory,
    pub scene: SyntheticScene,
    pub agent: AgentId,
    pub camera: CamId,
    /// Camera-to-body transform.
    pub extrinsic: Pose,
    pub frame_period: f64,
    pub first_frame_id: u64,
    pub start_time: f64,
    /// Uniform pixel noise half-width on the normalized plane.
    pub pixel_noise: f64,
    pub seed: u64,
}

impl SyntheticRun {
    pub fn new(agent: AgentId, camera: CamId, first_frame_id: u64) -> Self {
        Self {
            trajectory: SyntheticTrajectory::default(),
            scene: SyntheticScene::ceiling(11, 1.0, 6.0),
            agent,
            camera,
            extrinsic: Pose::identity(),
            frame_period: 0.1,
            first_frame_id,
            start_time: 0.0,
            pixel_noise: 0.0,
            seed: 7,
        }
    }

    pub fn stamp(&self, k: usize) -> f64 {
        self.start_time + k as f64 * self.frame_period
    }

    pub fn frame_id(&self, k: usize) -> FrameId {
        FrameId(self.first_frame_id + k as u64)
    }

    pub fn true_odometry(&self, k: usize) -> Odometry {
        self.trajectory.odometry_at(self.stamp(k))
    }

    pub fn camera_pose(&self, k: usize) -> Pose {
        self.true_odometry(k).pose * self.extrinsic
    }

    /// Front-end output for frame `k` and the IMU samples since frame `k - 1`.
    ///
    /// With `with_pose` the true body pose is attached as the front-end guess.
    pub fn frame(&self, k: usize, with_pose: bool) -> (VisualFrameDesc, ImuSlice) {
        let id = self.frame_id(k);
        let stamp = self.stamp(k);
        let mut rng = StdRng::seed_from_u64(self.seed ^ (k as u64).wrapping_mul(0x9e37_79b9));
        let noise = (self.pixel_noise > 0.0).then_some((&mut rng, self.pixel_noise));
        let observations = self
            .scene
            .observe(id, self.camera, &self.camera_pose(k), stamp, noise);

        let desc = VisualFrameDesc {
            frame_id: id,
            agent: self.agent,
            stamp,
            reference_frame_id: self.frame_id(0),
            is_keyframe: true,
            pose: with_pose.then(|| self.true_odometry(k).pose),
            observations,
        };
        let imu = if k == 0 {
            ImuSlice::default()
        } else {
            ImuSlice::new(self.trajectory.imu_between(self.stamp(k - 1), stamp))
        };
        (desc, imu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imu::{MidpointPreintegrator, PreintegrationEngine};
    use approx::assert_relative_eq;

    #[test]
    fn test_velocity_is_derivative_of_position() {
        let traj = SyntheticTrajectory::default();
        let h = 1e-6;
        let numeric = (traj.position_at(0.7 + h) - traj.position_at(0.7 - h)) / (2.0 * h);
        assert_relative_eq!(numeric, traj.velocity_at(0.7), epsilon = 1e-6);
        let numeric = (traj.velocity_at(0.7 + h) - traj.velocity_at(0.7 - h)) / (2.0 * h);
        assert_relative_eq!(numeric, traj.acceleration_at(0.7), epsilon = 1e-5);
    }

    #[test]
    fn test_preintegrated_imu_predicts_trajectory() {
        let traj = SyntheticTrajectory::default();
        let samples = traj.imu_between(0.3, 0.4);
        let preint = MidpointPreintegrator::default()
            .integrate(&samples, &ImuBias::zero())
            .unwrap();
        let start = traj.odometry_at(0.3);
        let (rot, pos, vel) = preint.predict(
            &start.pose.rotation,
            &start.pose.translation,
            &start.velocity,
            &GRAVITY,
            &ImuBias::zero(),
        );
        let end = traj.odometry_at(0.4);
        assert_relative_eq!(pos, end.pose.translation, epsilon = 1e-4);
        assert_relative_eq!(vel, end.velocity, epsilon = 1e-3);
        assert!(rot.angle_to(&end.pose.rotation) < 1e-6);
    }

    #[test]
    fn test_frames_observe_the_scene() {
        let run = SyntheticRun::new(AgentId(0), CamId(0), 1);
        let (desc, imu) = run.frame(0, false);
        assert!(imu.is_empty());
        assert!(desc.observations.len() > 30);
        let (desc, imu) = run.frame(3, true);
        assert_eq!(desc.frame_id, FrameId(4));
        assert_eq!(imu.samples.len(), 21);
        assert!(desc.pose.is_some());
    }

    #[test]
    fn test_noise_is_deterministic() {
        let mut run = SyntheticRun::new(AgentId(0), CamId(0), 1);
        run.pixel_noise = 1e-3;
        let (a, _) = run.frame(2, false);
        let (b, _) = run.frame(2, false);
        assert_eq!(a.observations, b.observations);
    }
}
