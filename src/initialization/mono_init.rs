//! Bootstrap of the local window from its visual-only trajectory.

use nalgebra::Vector3;
use tracing::{debug, info, warn};

use super::alignment::{AlignmentSolution, linear_alignment, solve_gyroscope_bias};
use crate::error::AlignmentError;
use crate::estimator::{EstimatorState, VinsFrame};
use crate::geometry::so3::yaw_rotation;
use crate::geometry::{Pose, gravity_to_rotation};
use crate::imu::{ImuBias, ImuInitState};
use crate::optimizer::ParamBlocks;
use crate::types::FrameId;

/// Window contents after a successful alignment, ready to be committed.
struct AlignedWindow {
    frame_ids: Vec<FrameId>,
    frames: Vec<VinsFrame>,
    scale: f64,
    offset: Vector3<f64>,
    world: Pose,
}

impl EstimatorState {
    /// Align the local window using its current poses as the visual trajectory.
    ///
    /// Camera poses are the frame poses composed with the main local
    /// camera's extrinsic.
    pub fn mono_initialization(&self) -> Result<AlignmentSolution, AlignmentError> {
        let agent = self.local_agent();
        let (_, extrinsic) = self
            .local_camera_extrinsics()
            .into_iter()
            .next()
            .ok_or(AlignmentError::NoLocalCamera)?;
        let win = self.window_or_err(agent)?;
        let camera_poses: Vec<Pose> = win.read().frames().iter().map(|f| f.odom.pose * extrinsic).collect();
        self.mono_initialization_with(&camera_poses)
    }

    /// Align the local window against `camera_poses`, one per frame.
    ///
    /// Gyroscope bias, velocities, gravity and scale are solved on a copy of
    /// the window. Only when every step succeeds are poses, velocities,
    /// biases, summaries and landmarks replaced, and the prior re-seeded on
    /// the first frame. A failure leaves the state as it was.
    pub fn mono_initialization_with(&self, camera_poses: &[Pose]) -> Result<AlignmentSolution, AlignmentError> {
        drop(self.ensure_idle()?);
        let agent = self.local_agent();
        let min_frames = self.config.alignment.min_init_frames;
        if self.size(agent) < min_frames {
            return Err(AlignmentError::InsufficientFrames {
                required: min_frames,
                got: self.size(agent),
            });
        }

        *self.init_state.lock() = ImuInitState::Initializing;
        let result = self
            .align_local_window(camera_poses)
            .and_then(|(aligned, solution)| self.commit_alignment(aligned).map(|_| solution));
        match result {
            Ok(solution) => {
                *self.init_state.lock() = ImuInitState::Initialized;
                info!(
                    "initialization succeeded: scale {:.4}, gravity [{:+.3}, {:+.3}, {:+.3}]",
                    solution.scale, solution.gravity.x, solution.gravity.y, solution.gravity.z
                );
                Ok(solution)
            }
            Err(e) => {
                *self.init_state.lock() = ImuInitState::NotInitialized;
                warn!("initialization failed: {}", e);
                Err(e)
            }
        }
    }

    fn align_local_window(&self, camera_poses: &[Pose]) -> Result<(AlignedWindow, AlignmentSolution), AlignmentError> {
        let agent = self.local_agent();
        let (_, extrinsic) = self
            .local_camera_extrinsics()
            .into_iter()
            .next()
            .ok_or(AlignmentError::NoLocalCamera)?;
        let mut frames: Vec<VinsFrame> = self.window_or_err(agent)?.read().frames().to_vec();
        let frame_ids = frames.iter().map(|f| f.id).collect();

        let bg = solve_gyroscope_bias(&frames, camera_poses, &extrinsic)?;
        let engine = self.engine();
        for k in 0..frames.len() {
            frames[k].bias = ImuBias::new(frames[k].bias.accel, bg);
            if k == 0 {
                continue;
            }
            let bias = frames[k - 1].bias;
            if !frames[k].repropagate(engine, &bias) {
                return Err(AlignmentError::MissingPreintegration(frames[k].id));
            }
        }

        let solution = linear_alignment(&frames, camera_poses, &extrinsic, &self.config.alignment)?;
        let s = solution.scale;
        let tic = extrinsic.translation;
        let ric_t = extrinsic.rotation.inverse();

        let body_rot: Vec<_> = camera_poses.iter().map(|c| c.rotation * ric_t).collect();
        let offset = s * camera_poses[0].translation - body_rot[0] * tic;

        let rot = gravity_to_rotation(&solution.gravity);
        let yaw = (rot * body_rot[0]).euler_angles().2;
        let world = Pose::new(yaw_rotation(-yaw) * rot, Vector3::zeros());

        for (k, frame) in frames.iter_mut().enumerate() {
            let pos = s * camera_poses[k].translation - body_rot[k] * tic - offset;
            frame.odom.pose = Pose::new(world.rotation * body_rot[k], world.rotation * pos);
            frame.odom.velocity = world.rotation * (body_rot[k] * solution.velocities[k]);
        }
        debug!("aligned window of {} frames, first at {}", frames.len(), frames[0].odom.pose);

        Ok((
            AlignedWindow {
                frame_ids,
                frames,
                scale: s,
                offset,
                world,
            },
            solution,
        ))
    }

    fn commit_alignment(&self, aligned: AlignedWindow) -> Result<(), AlignmentError> {
        let _idle = self.ensure_idle()?;
        let win = self.window_or_err(self.local_agent())?;
        {
            let mut win = win.write();
            if win.frame_ids() != aligned.frame_ids {
                return Err(AlignmentError::StaleWindow);
            }
            for (frame, aligned) in win.frames_mut().iter_mut().zip(aligned.frames) {
                *frame = aligned;
            }
            self.landmarks
                .write()
                .scale_and_transform_all(aligned.scale, &aligned.offset, &aligned.world);
        }
        *self.params.lock() = ParamBlocks::new();
        self.create_prior_for_first_frame()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EstimatorConfig;
    use crate::error::StateError;
    use crate::optimizer::ParamKey;
    use crate::sim::SyntheticRun;
    use crate::types::{AgentId, CamId};
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    const SCALE: f64 = 3.0;

    /// Window whose poses and landmarks live in a visual frame that is the
    /// world yawed and tilted, then shrunk by `SCALE`.
    fn visual_only_state(frames: usize) -> (EstimatorState, SyntheticRun, Vec<Pose>) {
        let state = EstimatorState::new(EstimatorConfig::default());
        let mut run = SyntheticRun::new(AgentId(0), CamId(0), 1);
        run.trajectory.bias = ImuBias::new(Vector3::zeros(), Vector3::new(0.004, -0.003, 0.002));
        run.extrinsic = Pose::new(
            UnitQuaternion::from_euler_angles(0.0, 0.05, 0.0),
            Vector3::new(0.03, 0.0, -0.01),
        );
        state.add_camera(run.extrinsic, 0, AgentId(0), Some(CamId(0)));

        let visual = UnitQuaternion::from_euler_angles(0.1, -0.15, 1.1);
        let mut camera_poses = Vec::new();
        for k in 0..frames {
            let (mut desc, imu) = run.frame(k, false);
            let cam = run.camera_pose(k);
            let cam = Pose::new(visual * cam.rotation, visual * cam.translation / SCALE);
            desc.pose = Some(cam * run.extrinsic.inverse());
            state.push_frame(&desc, imu).unwrap();
            camera_poses.push(cam);
        }
        (state, run, camera_poses)
    }

    #[test]
    fn test_rejects_short_window() {
        let (state, _, poses) = visual_only_state(3);
        assert_eq!(
            state.mono_initialization_with(&poses),
            Err(AlignmentError::InsufficientFrames { required: 6, got: 3 })
        );
        assert_eq!(state.init_state(), ImuInitState::NotInitialized);
    }

    #[test]
    fn test_initialization_recovers_metric_gravity_aligned_window() {
        let (state, run, _) = visual_only_state(10);
        let solution = state.mono_initialization().unwrap();
        assert_relative_eq!(solution.scale, SCALE, epsilon = 3e-2);
        assert_eq!(state.init_state(), ImuInitState::Initialized);

        // Distances are metric after the commit.
        let p0 = state.estimated_pose(run.frame_id(0)).unwrap();
        let p9 = state.estimated_pose(run.frame_id(9)).unwrap();
        let t0 = run.true_odometry(0).pose;
        let t9 = run.true_odometry(9).pose;
        assert_relative_eq!(p0.translation.norm(), 0.0, epsilon = 1e-9);
        assert_relative_eq!(
            (p9.translation - p0.translation).norm(),
            (t9.translation - t0.translation).norm(),
            epsilon = 2e-2
        );

        // Gravity is along -z: the vertical rise matches the truth.
        assert_relative_eq!(
            p9.translation.z - p0.translation.z,
            t9.translation.z - t0.translation.z,
            epsilon = 2e-2
        );
        assert_relative_eq!(p0.yaw(), 0.0, epsilon = 1e-6);

        let frame = state.frame_by_id(run.frame_id(5)).unwrap();
        assert_relative_eq!(frame.bias.gyro, run.trajectory.bias.gyro, epsilon = 1e-4);
        let speed = run.true_odometry(5).velocity.norm();
        assert_relative_eq!(frame.odom.velocity.norm(), speed, epsilon = 3e-2);
        assert!(state.prior().is_some_and(|p| p.contains(&ParamKey::Pose(run.frame_id(0)))));
    }

    #[test]
    fn test_failure_leaves_state_untouched() {
        let (state, run, mut poses) = visual_only_state(8);
        let before = state.frame_by_id(run.frame_id(4)).unwrap();
        // Mirror the trajectory: no positive scale explains it.
        for p in poses.iter_mut() {
            p.translation = -p.translation * 50.0;
        }
        assert!(state.mono_initialization_with(&poses).is_err());
        assert_eq!(state.frame_by_id(run.frame_id(4)).unwrap(), before);
        assert_eq!(state.init_state(), ImuInitState::NotInitialized);
    }

    #[test]
    fn test_rejected_while_solving() {
        let (state, _, poses) = visual_only_state(8);
        let _problem = state.pre_solve(&Default::default()).unwrap();
        assert_eq!(
            state.mono_initialization_with(&poses),
            Err(AlignmentError::State(StateError::SolveInFlight))
        );
        state.abort_solve();
    }
}
