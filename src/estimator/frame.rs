//! VinsFrame - one node of an agent's sliding window.
//!
//! A frame carries its odometry (pose + world velocity), the IMU bias estimate
//! and the motion summary from its predecessor. The predecessor is only
//! referenced by id; the bias is copied by value when the frame is built.

use std::fmt::Write as _;

use nalgebra::Vector3;
use tracing::warn;

use crate::error::StateError;
use crate::geometry::{Odometry, Pose};
use crate::imu::{GRAVITY, ImuBias, ImuBuffer, ImuSample, PreintegratedState, PreintegrationEngine};
use crate::landmark::LandmarkObservation;
use crate::optimizer::params::ParamKey;
use crate::types::{AgentId, FrameId};

/// Size of the speed-bias block: `[v, Ba, Bg]`.
pub const SPEED_BIAS_SIZE: usize = 9;

/// What the front end reports for one image.
#[derive(Debug, Clone)]
pub struct VisualFrameDesc {
    pub frame_id: FrameId,
    pub agent: AgentId,
    pub stamp: f64,
    /// Frame that anchors this agent's reference frame.
    pub reference_frame_id: FrameId,
    pub is_keyframe: bool,
    /// Body-to-world pose guess from the front end, if it has one.
    pub pose: Option<Pose>,
    pub observations: Vec<LandmarkObservation>,
}

/// Raw IMU samples between the previous frame and this one.
#[derive(Debug, Clone, Default)]
pub struct ImuSlice {
    pub samples: Vec<ImuSample>,
    /// Index of the first sample in the agent's buffer.
    pub buf_index: Option<usize>,
}

impl ImuSlice {
    pub fn new(samples: Vec<ImuSample>) -> Self {
        Self {
            samples,
            buf_index: None,
        }
    }

    /// Samples of `buffer` in `[t0, t1]`.
    pub fn from_buffer(buffer: &ImuBuffer, t0: f64, t1: f64) -> Self {
        let (samples, buf_index) = buffer.period(t0, t1);
        Self { samples, buf_index }
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VinsFrame {
    pub id: FrameId,
    pub agent: AgentId,
    /// Timestamp in seconds.
    pub stamp: f64,
    pub reference_frame_id: FrameId,
    pub is_keyframe: bool,

    /// Body-to-world pose and world-frame velocity.
    pub odom: Odometry,
    pub bias: ImuBias,

    // ─────────────────────────────────────────────────────────────────────────
    // IMU
    // ─────────────────────────────────────────────────────────────────────────
    /// Motion summary from the predecessor. `None` for a window root or when
    /// no IMU samples were available.
    pub preintegration: Option<PreintegratedState>,
    /// Raw samples the summary was integrated from, kept for re-propagation.
    pub imu_samples: Vec<ImuSample>,
    pub imu_buf_index: Option<usize>,

    /// Previous frame of the same agent.
    pub prev_frame_id: Option<FrameId>,
}

impl VinsFrame {
    /// Build a root frame with no motion summary.
    pub fn new(desc: &VisualFrameDesc, bias: ImuBias) -> Self {
        Self {
            id: desc.frame_id,
            agent: desc.agent,
            stamp: desc.stamp,
            reference_frame_id: desc.reference_frame_id,
            is_keyframe: desc.is_keyframe,
            odom: Odometry::new(desc.pose.unwrap_or_default(), Vector3::zeros()),
            bias,
            preintegration: None,
            imu_samples: Vec::new(),
            imu_buf_index: None,
            prev_frame_id: None,
        }
    }

    /// Root frame of a window with externally supplied biases.
    pub fn from_alignment(desc: &VisualFrameDesc, accel_bias: Vector3<f64>, gyro_bias: Vector3<f64>) -> Self {
        Self::new(desc, ImuBias::new(accel_bias, gyro_bias))
    }

    /// Build a frame following `prev`, integrating `imu` at the bias of `prev`.
    ///
    /// An empty (or single-sample) slice leaves the frame without a motion
    /// summary; the pose then falls back to the front-end guess or `prev`.
    pub fn from_previous(
        desc: &VisualFrameDesc,
        imu: ImuSlice,
        prev: &VinsFrame,
        engine: &dyn PreintegrationEngine,
    ) -> Self {
        let preintegration = engine.integrate(&imu.samples, &prev.bias);
        if preintegration.is_none() {
            warn!(
                "frame {}: {} IMU samples since {}, no motion summary",
                desc.frame_id,
                imu.samples.len(),
                prev.id
            );
        }

        let odom = match (desc.pose, preintegration.as_ref()) {
            (Some(pose), Some(p)) => {
                let (_, _, vel) = p.predict(
                    &prev.odom.pose.rotation,
                    &prev.odom.pose.translation,
                    &prev.odom.velocity,
                    &GRAVITY,
                    &prev.bias,
                );
                Odometry::new(pose, vel)
            }
            (Some(pose), None) => Odometry::new(pose, prev.odom.velocity),
            (None, Some(p)) => {
                let (rot, pos, vel) = p.predict(
                    &prev.odom.pose.rotation,
                    &prev.odom.pose.translation,
                    &prev.odom.velocity,
                    &GRAVITY,
                    &prev.bias,
                );
                Odometry::new(Pose::new(rot, pos), vel)
            }
            (None, None) => prev.odom,
        };

        Self {
            id: desc.frame_id,
            agent: desc.agent,
            stamp: desc.stamp,
            reference_frame_id: desc.reference_frame_id,
            is_keyframe: desc.is_keyframe,
            odom,
            bias: prev.bias,
            preintegration,
            imu_samples: imu.samples,
            imu_buf_index: imu.buf_index,
            prev_frame_id: Some(prev.id),
        }
    }

    pub fn pose(&self) -> &Pose {
        &self.odom.pose
    }

    pub fn has_motion_summary(&self) -> bool {
        self.preintegration.is_some()
    }

    /// Pose block `[t, q]` and speed-bias block `[v, Ba, Bg]`.
    pub fn export_blocks(&self) -> ([f64; Pose::VECTOR_SIZE], [f64; SPEED_BIAS_SIZE]) {
        let mut pose = [0.0; Pose::VECTOR_SIZE];
        self.odom.pose.to_vector(&mut pose);

        let v = &self.odom.velocity;
        let ba = &self.bias.accel;
        let bg = &self.bias.gyro;
        let speed_bias = [v.x, v.y, v.z, ba.x, ba.y, ba.z, bg.x, bg.y, bg.z];
        (pose, speed_bias)
    }

    /// Inverse of [`VinsFrame::export_blocks`]. The frame is untouched on error.
    pub fn import_blocks(&mut self, pose: &[f64], speed_bias: &[f64]) -> Result<(), StateError> {
        let pose_key = ParamKey::Pose(self.id);
        let sb_key = ParamKey::SpeedBias(self.id);
        if pose.len() != Pose::VECTOR_SIZE {
            return Err(StateError::BlockLength {
                key: pose_key,
                expected: Pose::VECTOR_SIZE,
                got: pose.len(),
            });
        }
        if speed_bias.len() != SPEED_BIAS_SIZE {
            return Err(StateError::BlockLength {
                key: sb_key,
                expected: SPEED_BIAS_SIZE,
                got: speed_bias.len(),
            });
        }
        let new_pose = Pose::from_vector(pose).ok_or(StateError::InvalidBlock(pose_key))?;
        if speed_bias.iter().any(|v| !v.is_finite()) {
            return Err(StateError::InvalidBlock(sb_key));
        }

        self.odom.pose = new_pose;
        self.odom.velocity = Vector3::new(speed_bias[0], speed_bias[1], speed_bias[2]);
        self.bias = ImuBias::new(
            Vector3::new(speed_bias[3], speed_bias[4], speed_bias[5]),
            Vector3::new(speed_bias[6], speed_bias[7], speed_bias[8]),
        );
        Ok(())
    }

    /// Re-integrate the stored IMU slice at `bias`.
    ///
    /// Returns `false` when the frame has no usable slice.
    pub fn repropagate(&mut self, engine: &dyn PreintegrationEngine, bias: &ImuBias) -> bool {
        match engine.integrate(&self.imu_samples, bias) {
            Some(p) => {
                self.preintegration = Some(p);
                true
            }
            None => false,
        }
    }

    /// One-line summary with the stamp relative to `epoch`.
    pub fn describe(&self, epoch: f64) -> String {
        let mut out = format!(
            "{} {} t {:.3}s{} {} V [{:+.3}, {:+.3}, {:+.3}] {}",
            self.id,
            self.agent,
            self.stamp - epoch,
            if self.is_keyframe { " KF" } else { "" },
            self.odom.pose,
            self.odom.velocity.x,
            self.odom.velocity.y,
            self.odom.velocity.z,
            self.bias
        );
        match &self.preintegration {
            Some(p) => {
                let _ = write!(out, " | {}", p);
            }
            None => out.push_str(" | no preintegration"),
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imu::MidpointPreintegrator;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn desc(id: u64, stamp: f64, pose: Option<Pose>) -> VisualFrameDesc {
        VisualFrameDesc {
            frame_id: FrameId(id),
            agent: AgentId(0),
            stamp,
            reference_frame_id: FrameId(0),
            is_keyframe: true,
            pose,
            observations: Vec::new(),
        }
    }

    fn hover_samples(t0: f64, t1: f64) -> Vec<ImuSample> {
        let n = ((t1 - t0) / 0.005).round() as usize;
        (0..=n)
            .map(|i| ImuSample::new(t0 + i as f64 * 0.005, -GRAVITY, Vector3::zeros()))
            .collect()
    }

    #[test]
    fn test_export_import_round_trip() {
        let mut frame = VinsFrame::new(&desc(1, 0.0, None), ImuBias::zero());
        frame.odom = Odometry::new(
            Pose::new(
                UnitQuaternion::from_euler_angles(0.3, -0.2, 1.1),
                Vector3::new(1.0, 2.0, 3.0),
            ),
            Vector3::new(0.1, 0.2, 0.3),
        );
        frame.bias = ImuBias::new(Vector3::new(0.01, 0.02, 0.03), Vector3::new(1e-3, 2e-3, 3e-3));
        let original = frame.clone();

        let (pose, sb) = frame.export_blocks();
        frame.import_blocks(&pose, &sb).unwrap();

        assert_relative_eq!(frame.odom.pose.translation, original.odom.pose.translation, epsilon = 1e-12);
        assert_relative_eq!(frame.odom.velocity, original.odom.velocity, epsilon = 1e-12);
        assert_relative_eq!(frame.bias.gyro, original.bias.gyro, epsilon = 1e-12);
        assert_relative_eq!(frame.bias.accel, original.bias.accel, epsilon = 1e-12);
        assert!(frame.odom.pose.rotation.angle_to(&original.odom.pose.rotation) < 1e-12);
        assert_relative_eq!(frame.odom.pose.rotation.quaternion().norm(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_import_renormalizes_rotation() {
        let mut frame = VinsFrame::new(&desc(1, 0.0, None), ImuBias::zero());
        frame
            .import_blocks(&[0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 2.0], &[0.0; 9])
            .unwrap();
        assert_relative_eq!(frame.odom.pose.rotation.quaternion().norm(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_import_rejects_bad_blocks() {
        let mut frame = VinsFrame::new(&desc(4, 0.0, None), ImuBias::zero());
        let before = frame.clone();
        assert_eq!(
            frame.import_blocks(&[0.0; 6], &[0.0; 9]),
            Err(StateError::BlockLength {
                key: ParamKey::Pose(FrameId(4)),
                expected: 7,
                got: 6
            })
        );
        assert_eq!(
            frame.import_blocks(&[0.0; 7], &[0.0; 9]),
            Err(StateError::InvalidBlock(ParamKey::Pose(FrameId(4))))
        );
        let mut sb = [0.0; 9];
        sb[4] = f64::NAN;
        assert!(frame
            .import_blocks(&[0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0], &sb)
            .is_err());
        assert_eq!(frame, before);
    }

    #[test]
    fn test_from_previous_inherits_bias_and_integrates() {
        let engine = MidpointPreintegrator::default();
        let mut root = VinsFrame::new(&desc(1, 0.0, None), ImuBias::zero());
        root.bias = ImuBias::new(Vector3::new(0.01, 0.0, 0.0), Vector3::zeros());

        let slice = ImuSlice::new(hover_samples(0.0, 0.1));
        let frame = VinsFrame::from_previous(&desc(2, 0.1, None), slice, &root, &engine);

        assert_eq!(frame.bias, root.bias);
        assert_eq!(frame.prev_frame_id, Some(FrameId(1)));
        let preint = frame.preintegration.unwrap();
        assert_relative_eq!(preint.dt, 0.1, epsilon = 1e-9);
        assert_eq!(preint.linearized_bias, root.bias);
    }

    #[test]
    fn test_from_previous_empty_slice_degrades() {
        let engine = MidpointPreintegrator::default();
        let root = VinsFrame::new(&desc(1, 0.0, None), ImuBias::zero());
        let guess = Pose::from_translation(Vector3::new(0.5, 0.0, 0.0));
        let frame = VinsFrame::from_previous(&desc(2, 0.1, Some(guess)), ImuSlice::default(), &root, &engine);
        assert!(frame.preintegration.is_none());
        assert_eq!(frame.odom.pose, guess);
    }

    #[test]
    fn test_repropagate_uses_new_bias() {
        let engine = MidpointPreintegrator::default();
        let root = VinsFrame::new(&desc(1, 0.0, None), ImuBias::zero());
        let mut frame = VinsFrame::from_previous(
            &desc(2, 0.1, None),
            ImuSlice::new(hover_samples(0.0, 0.1)),
            &root,
            &engine,
        );
        let bias = ImuBias::new(Vector3::zeros(), Vector3::new(0.0, 0.0, 0.01));
        assert!(frame.repropagate(&engine, &bias));
        assert_eq!(frame.preintegration.unwrap().linearized_bias, bias);
    }

    #[test]
    fn test_describe_mentions_id() {
        let frame = VinsFrame::new(&desc(9, 12.5, None), ImuBias::zero());
        let text = frame.describe(10.0);
        assert!(text.starts_with("F9 D0 t 2.500s KF"));
        assert!(text.ends_with("no preintegration"));
    }
}
