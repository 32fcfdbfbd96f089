//! Solve round-trip: export, re-propagation, import and outlier rejection.
//!
//! `pre_solve` marks a solve in flight and exports an [`OptimizationProblem`];
//! `sync_from_state` (or `abort_solve`) ends it. Structural mutations are
//! rejected in between.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::Ordering;

use rayon::prelude::*;
use tracing::{debug, info, warn};

use super::state::EstimatorState;
use crate::error::StateError;
use crate::geometry::Pose;
use crate::imu::{GRAVITY, ImuBias, ImuBuffer};
use crate::landmark::{LandmarkFlag, LandmarkStore};
use crate::optimizer::{
    ImuFactor, OptimizationProblem, Optimizer, ParamBlocks, ParamKey, SolveReport, VisualFactor,
};
use crate::types::{AgentId, CamId, FrameId, LandmarkId};

/// Normalized-plane residuals are weighted as if pixel noise were 1.5 px.
const PIXEL_SIGMA: f64 = 1.5;

impl EstimatorState {
    /// Square-root information of a normalized-plane reprojection residual.
    pub(crate) fn visual_weight(&self) -> f64 {
        self.config.focal_length / PIXEL_SIGMA
    }

    /// Prepare the next optimizer pass.
    ///
    /// Re-integrates remote IMU and stale summaries, initializes new
    /// landmarks, and exports frames, extrinsics, time offsets and the
    /// selected landmarks as parameter blocks.
    pub fn pre_solve(
        &self,
        remote_imu: &HashMap<AgentId, ImuBuffer>,
    ) -> Result<OptimizationProblem, StateError> {
        self.begin_solve()?;

        self.update_sld_wins_imu(remote_imu);
        self.repropagate_imu();
        self.initialize_landmarks();

        let problem = self.export_problem();
        *self.params.lock() = problem.params.clone();
        debug!(
            "pre_solve: {} blocks, {} imu factors, {} visual factors, {} landmarks",
            problem.params.len(),
            problem.imu_factors.len(),
            problem.visual_factors.len(),
            problem.landmarks.len()
        );
        Ok(problem)
    }

    /// Import solved parameter blocks and end the solve.
    ///
    /// All frame blocks are validated before anything is written, so a bad
    /// solution leaves the state untouched. The solve ends either way.
    pub fn sync_from_state(
        &self,
        solution: &ParamBlocks,
        used: &BTreeSet<LandmarkId>,
    ) -> Result<(), StateError> {
        let result = self.import_solution(solution, used);
        self.solving.store(false, Ordering::SeqCst);
        result
    }

    /// End a solve without importing anything.
    pub fn abort_solve(&self) {
        if self.solving.swap(false, Ordering::SeqCst) {
            debug!("solve aborted");
        }
    }

    /// Full round-trip through `optimizer`, followed by outlier rejection.
    pub fn solve_with(
        &self,
        optimizer: &dyn Optimizer,
        remote_imu: &HashMap<AgentId, ImuBuffer>,
    ) -> Result<SolveReport, StateError> {
        let mut problem = self.pre_solve(remote_imu)?;
        let report = match optimizer.solve(&mut problem) {
            Ok(report) => report,
            Err(e) => {
                self.abort_solve();
                return Err(e.into());
            }
        };
        self.sync_from_state(&problem.params, &problem.landmarks)?;
        self.outlier_rejection(&problem.landmarks);
        Ok(report)
    }

    /// Re-integrate summaries whose linearization bias moved materially.
    ///
    /// Each summary is recomputed from its own raw samples at the bias of its
    /// predecessor. Returns the number of re-integrated frames.
    pub fn repropagate_imu(&self) -> usize {
        let accel_th = self.config.repropagate_accel_threshold;
        let gyro_th = self.config.repropagate_gyro_threshold;
        let engine = self.engine.as_ref();
        let mut count = 0;

        for (_, win) in self.all_windows() {
            let mut win = win.write();
            let mut prev_bias: Vec<Option<ImuBias>> = vec![None];
            prev_bias.extend(win.frames().iter().map(|f| Some(f.bias)));
            prev_bias.pop();

            count += win
                .frames_mut()
                .par_iter_mut()
                .zip(prev_bias.par_iter())
                .filter_map(|(frame, bias)| {
                    let bias = (*bias)?;
                    let stale = frame
                        .preintegration
                        .as_ref()
                        .is_some_and(|p| bias.differs_from(&p.linearized_bias, accel_th, gyro_th));
                    (stale && frame.repropagate(engine, &bias)).then_some(())
                })
                .count();
        }
        if count > 0 {
            debug!("re-propagated {} motion summaries", count);
        }
        count
    }

    /// Rebuild remote frames' summaries from their agent's IMU buffer.
    ///
    /// Sample windows are shifted by the agent's time offset. Returns the
    /// number of updated frames.
    pub fn update_sld_wins_imu(&self, remote_imu: &HashMap<AgentId, ImuBuffer>) -> usize {
        let engine = self.engine.as_ref();
        let mut count = 0;
        for (agent, win) in self.all_windows() {
            if agent == self.config.local_agent {
                continue;
            }
            let Some(buffer) = remote_imu.get(&agent) else {
                continue;
            };
            let td = self.td(agent);
            let mut win = win.write();
            for i in 1..win.len() {
                let (t0, bias) = match win.get(i - 1) {
                    Some(prev) => (prev.stamp, prev.bias),
                    None => continue,
                };
                let Some(frame) = win.get_mut(i) else {
                    continue;
                };
                let (samples, start) = buffer.period(t0 + td, frame.stamp + td);
                let Some(preint) = engine.integrate(&samples, &bias) else {
                    warn!("no remote IMU for {} between {:.3} and {:.3}", frame.id, t0, frame.stamp);
                    continue;
                };
                frame.imu_samples = samples;
                frame.imu_buf_index = start;
                frame.preintegration = Some(preint);
                count += 1;
            }
        }
        count
    }

    /// Flag landmarks whose mean reprojection error exceeds the threshold.
    ///
    /// Evaluates `used` plus the current outliers, so a landmark can recover
    /// once its residual falls back under the threshold. Only positions and
    /// poses are read, so calling it twice gives the same result. Returns the
    /// outlier set after the update.
    pub fn outlier_rejection(&self, used: &BTreeSet<LandmarkId>) -> BTreeSet<LandmarkId> {
        let body = self.body_poses();
        let extrinsics = self.extrinsics();
        let camera_pose = |frame: FrameId, cam: CamId| -> Option<Pose> {
            Some(*body.get(&frame)? * *extrinsics.get(&cam)?)
        };
        let threshold = self.config.outlier_reproj_threshold_px;
        let focal = self.config.focal_length;

        let mut landmarks = self.landmarks.write();
        let mut candidates = used.clone();
        candidates.extend(landmarks.outliers());

        let mut flagged = 0;
        for id in candidates {
            let Some(lm) = landmarks.get_mut(id) else {
                continue;
            };
            if lm.flag == LandmarkFlag::Uninitialized {
                continue;
            }
            let mut sum = 0.0;
            let mut n = 0usize;
            for obs in &lm.track {
                if obs.frame_id == lm.base_frame && obs.camera_id == lm.base_camera {
                    continue;
                }
                let Some(pose) = camera_pose(obs.frame_id, obs.camera_id) else {
                    continue;
                };
                let pc = pose.inverse().transform_point(&lm.position);
                let err = if pc.z <= 1e-6 {
                    f64::INFINITY
                } else {
                    ((pc.x / pc.z - obs.normalized.x).powi(2) + (pc.y / pc.z - obs.normalized.y).powi(2))
                        .sqrt()
                };
                sum += err;
                n += 1;
            }
            if n == 0 {
                continue;
            }
            let average_px = sum / n as f64 * focal;
            if average_px > threshold {
                if lm.flag != LandmarkFlag::Outlier {
                    flagged += 1;
                }
                lm.flag = LandmarkFlag::Outlier;
            } else if lm.flag == LandmarkFlag::Outlier {
                lm.flag = LandmarkFlag::Estimated;
            }
        }

        let outliers = landmarks.outliers();
        if flagged > 0 {
            warn!("{} new outlier landmarks ({} total)", flagged, outliers.len());
        }
        outliers
    }

    /// Initialize landmarks from depth or two-view triangulation.
    pub fn initialize_landmarks(&self) -> usize {
        let body = self.body_poses();
        let extrinsics = self.extrinsics();
        let camera_pose = |frame: FrameId, cam: CamId| -> Option<Pose> {
            Some(*body.get(&frame)? * *extrinsics.get(&cam)?)
        };
        self.landmarks.write().initial_landmarks(
            camera_pose,
            self.config.min_landmark_depth,
            self.config.max_landmark_depth,
        )
    }

    fn export_problem(&self) -> OptimizationProblem {
        let local = self.config.local_agent;
        let mut problem = OptimizationProblem::default();
        let mut body = HashMap::new();

        for (agent, win) in self.all_windows() {
            let win = win.read();
            for (i, frame) in win.frames().iter().enumerate() {
                let (pose, speed_bias) = frame.export_blocks();
                problem.params.insert(ParamKey::Pose(frame.id), &pose);
                problem.params.insert(ParamKey::SpeedBias(frame.id), &speed_bias);
                body.insert(frame.id, frame.odom.pose);
                if agent != local {
                    problem.fixed.insert(ParamKey::Pose(frame.id));
                    problem.fixed.insert(ParamKey::SpeedBias(frame.id));
                }

                let (Some(preint), Some(prev)) = (frame.preintegration, i.checked_sub(1).and_then(|p| win.get(p)))
                else {
                    continue;
                };
                if frame.prev_frame_id != Some(prev.id) {
                    continue;
                }
                match ImuFactor::new(prev.id, frame.id, preint, &self.config.imu, GRAVITY) {
                    Some(f) => problem.imu_factors.push(f),
                    None => warn!("skipping degenerate IMU factor {} -> {}", prev.id, frame.id),
                }
            }
            problem.params.insert(ParamKey::TimeOffset(agent), &[self.td(agent)]);
            if !self.config.estimate_td {
                problem.fixed.insert(ParamKey::TimeOffset(agent));
            }
        }

        let prior = self.prior.lock().clone();
        if prior.is_none() {
            if let Some(first) = self.first_frame(local) {
                problem.fixed.insert(ParamKey::Pose(first.id));
            }
        }
        problem.prior = prior;

        let extrinsics = {
            let cameras = self.cameras.read();
            cameras
                .iter()
                .map(|(id, c)| (*id, c.pose, c.is_local))
                .collect::<Vec<_>>()
        };
        let mut ext_map = HashMap::new();
        for (id, pose, is_local) in extrinsics {
            let mut v = [0.0; Pose::VECTOR_SIZE];
            pose.to_vector(&mut v);
            problem.params.insert(ParamKey::Extrinsic(id), &v);
            ext_map.insert(id, pose);
            if !(is_local && self.config.estimate_extrinsic) {
                problem.fixed.insert(ParamKey::Extrinsic(id));
            }
        }

        let selected = self.landmarks.read().available_landmark_measurements(
            self.config.max_solve_landmarks,
            self.config.max_solve_measurements,
        );
        let weight = self.visual_weight();
        for lm in selected {
            let Some(base) = lm.base_observation().copied() else {
                continue;
            };
            let (Some(b), Some(e)) = (body.get(&base.frame_id), ext_map.get(&base.camera_id)) else {
                continue;
            };
            let Some(inv_depth) = lm.inverse_depth(&(*b * *e)) else {
                continue;
            };
            let factors: Vec<VisualFactor> = lm
                .track
                .iter()
                .filter(|o| !(o.frame_id == base.frame_id && o.camera_id == base.camera_id))
                .filter(|o| body.contains_key(&o.frame_id) && ext_map.contains_key(&o.camera_id))
                .map(|o| VisualFactor {
                    landmark: lm.id,
                    base,
                    target: *o,
                    weight,
                })
                .collect();
            if factors.is_empty() {
                continue;
            }
            problem.params.insert(ParamKey::Landmark(lm.id), &[inv_depth]);
            problem.landmarks.insert(lm.id);
            problem.visual_factors.extend(factors);
        }
        problem
    }

    fn import_solution(&self, solution: &ParamBlocks, used: &BTreeSet<LandmarkId>) -> Result<(), StateError> {
        // Validate every frame before writing any.
        let windows = self.all_windows();
        for (_, win) in &windows {
            for frame in win.read().frames() {
                let (Some(pose), Some(sb)) = (
                    solution.get(&ParamKey::Pose(frame.id)),
                    solution.get(&ParamKey::SpeedBias(frame.id)),
                ) else {
                    continue;
                };
                let mut trial = frame.clone();
                trial.import_blocks(pose.as_slice(), sb.as_slice())?;
            }
        }

        let local = self.config.local_agent;
        for (agent, win) in &windows {
            if *agent != local {
                continue;
            }
            let mut win = win.write();
            for frame in win.frames_mut() {
                if let (Some(pose), Some(sb)) = (
                    solution.get(&ParamKey::Pose(frame.id)),
                    solution.get(&ParamKey::SpeedBias(frame.id)),
                ) {
                    frame.import_blocks(pose.as_slice(), sb.as_slice())?;
                }
            }
        }

        {
            let mut cameras = self.cameras.write();
            for id in cameras.available_camera_ids() {
                let is_local = cameras.get(id).is_some_and(|c| c.is_local);
                if !is_local {
                    continue;
                }
                if let Some(pose) = solution
                    .get(&ParamKey::Extrinsic(id))
                    .and_then(|v| Pose::from_vector(v.as_slice()))
                {
                    cameras.set_extrinsic(id, pose)?;
                }
            }
        }

        {
            let mut td = self.td.write();
            for (agent, _) in &windows {
                if let Some(v) = solution.get(&ParamKey::TimeOffset(*agent)) {
                    if let Some(x) = v.iter().next().filter(|x| x.is_finite()) {
                        td.insert(*agent, *x);
                    }
                }
            }
        }

        let body = self.body_poses();
        let extrinsics = self.extrinsics();
        let mut landmarks = self.landmarks.write();
        let mut updated = 0;
        for id in used {
            let Some(inv) = solution.get(&ParamKey::Landmark(*id)).and_then(|v| v.iter().next().copied())
            else {
                continue;
            };
            let Some(lm) = landmarks.get_mut(*id) else {
                continue;
            };
            let (Some(b), Some(e)) = (body.get(&lm.base_frame), extrinsics.get(&lm.base_camera)) else {
                continue;
            };
            if lm.set_inverse_depth(&(*b * *e), inv) {
                if lm.flag == LandmarkFlag::Initialized {
                    lm.flag = LandmarkFlag::Estimated;
                }
                updated += 1;
            }
        }
        drop(landmarks);

        *self.params.lock() = solution.clone();
        info!("synced solution: {} landmarks updated", updated);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EstimatorConfig;
    use crate::optimizer::DenseGaussNewton;
    use crate::sim::SyntheticRun;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn filled_state(frames: usize) -> (EstimatorState, SyntheticRun) {
        let state = EstimatorState::new(EstimatorConfig::default());
        let run = SyntheticRun::new(AgentId(0), CamId(0), 1);
        state.add_camera(run.extrinsic, 0, AgentId(0), Some(CamId(0)));
        for k in 0..frames {
            let (desc, imu) = run.frame(k, true);
            state.push_frame(&desc, imu).unwrap();
        }
        for k in 0..frames {
            state
                .set_velocity(run.frame_id(k), run.true_odometry(k).velocity)
                .unwrap();
        }
        (state, run)
    }

    #[test]
    fn test_pre_solve_exports_blocks_and_blocks_mutation() {
        let (state, run) = filled_state(4);
        let problem = state.pre_solve(&HashMap::new()).unwrap();
        assert!(state.is_solving());
        assert!(problem.params.contains(&ParamKey::Pose(FrameId(1))));
        assert!(problem.params.contains(&ParamKey::Extrinsic(CamId(0))));
        assert_eq!(problem.imu_factors.len(), 3);
        assert!(!problem.landmarks.is_empty());
        assert!(problem.fixed.contains(&ParamKey::Pose(FrameId(1))));

        let (desc, imu) = run.frame(4, true);
        assert_eq!(state.push_frame(&desc, imu), Err(StateError::SolveInFlight));
        assert_eq!(state.pre_solve(&HashMap::new()).err(), Some(StateError::SolveInFlight));

        state.sync_from_state(&problem.params, &problem.landmarks).unwrap();
        assert!(!state.is_solving());
        let (desc, imu) = run.frame(4, true);
        state.push_frame(&desc, imu).unwrap();
    }

    #[test]
    fn test_sync_rejects_invalid_solution_atomically() {
        let (state, _) = filled_state(3);
        let mut problem = state.pre_solve(&HashMap::new()).unwrap();
        let before = state.frame_by_id(FrameId(1)).unwrap();

        problem.params.insert(ParamKey::Pose(FrameId(1)), &[9.0, 9.0, 9.0, 0.0, 0.0, 0.0, 1.0]);
        problem.params.insert(ParamKey::SpeedBias(FrameId(3)), &[f64::NAN; 9]);
        assert!(state.sync_from_state(&problem.params, &problem.landmarks).is_err());
        assert!(!state.is_solving());
        assert_eq!(state.frame_by_id(FrameId(1)).unwrap(), before);
    }

    #[test]
    fn test_sync_imports_blocks() {
        let (state, _) = filled_state(3);
        let mut problem = state.pre_solve(&HashMap::new()).unwrap();
        problem.params.insert(
            ParamKey::SpeedBias(FrameId(2)),
            &[1.0, 2.0, 3.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.01],
        );
        state.sync_from_state(&problem.params, &problem.landmarks).unwrap();
        let frame = state.frame_by_id(FrameId(2)).unwrap();
        assert_relative_eq!(frame.odom.velocity, Vector3::new(1.0, 2.0, 3.0));
        assert_relative_eq!(frame.bias.gyro.z, 0.01);
    }

    #[test]
    fn test_repropagate_only_stale_frames() {
        let (state, _) = filled_state(4);
        assert_eq!(state.repropagate_imu(), 0);
        let bias = ImuBias::new(Vector3::zeros(), Vector3::new(0.0, 0.0, 0.05));
        state.set_bias(FrameId(2), bias).unwrap();
        // Only frame 3 integrates from frame 2.
        assert_eq!(state.repropagate_imu(), 1);
        let f3 = state.frame_by_id(FrameId(3)).unwrap();
        assert_eq!(f3.preintegration.unwrap().linearized_bias, bias);
        assert_eq!(state.repropagate_imu(), 0);
    }

    #[test]
    fn test_outlier_rejection_is_idempotent() {
        let (state, _) = filled_state(4);
        state.initialize_landmarks();
        let used: BTreeSet<LandmarkId> = state.initialized_landmarks().into_iter().collect();
        assert!(used.len() > 10);

        let bad = *used.iter().next().unwrap();
        state
            .landmarks
            .write()
            .get_mut(bad)
            .unwrap()
            .position += Vector3::new(0.5, -0.5, 0.0);

        let first = state.outlier_rejection(&used);
        let second = state.outlier_rejection(&used);
        assert_eq!(first, second);
        assert!(first.contains(&bad));
        assert_eq!(first.len(), 1);

        // The landmark re-qualifies once its position is repaired.
        state
            .landmarks
            .write()
            .get_mut(bad)
            .unwrap()
            .position -= Vector3::new(0.5, -0.5, 0.0);
        assert!(state.outlier_rejection(&BTreeSet::new()).is_empty());
        assert_eq!(state.landmark(bad).unwrap().flag, LandmarkFlag::Estimated);
    }

    #[test]
    fn test_remote_imu_reintegration() {
        let state = EstimatorState::new(EstimatorConfig::default());
        let run = SyntheticRun::new(AgentId(1), CamId(1), 100);
        state.add_camera(run.extrinsic, 0, AgentId(1), Some(CamId(1)));
        for k in 0..3 {
            let (desc, _) = run.frame(k, true);
            state.push_frame(&desc, Default::default()).unwrap();
        }
        assert!(state.frame_by_id(FrameId(101)).unwrap().preintegration.is_none());

        let buffer = ImuBuffer::from_samples(run.trajectory.imu_between(run.stamp(0), run.stamp(2)));
        let bufs: HashMap<AgentId, ImuBuffer> = [(AgentId(1), buffer)].into_iter().collect();
        assert_eq!(state.update_sld_wins_imu(&bufs), 2);
        let preint = state.frame_by_id(FrameId(102)).unwrap().preintegration.unwrap();
        assert_relative_eq!(preint.dt, run.frame_period, epsilon = 1e-9);
    }

    #[test]
    fn test_solve_with_reduces_cost() {
        let (state, _) = filled_state(4);
        for id in 2..=4 {
            let mut pose = state.estimated_pose(FrameId(id)).unwrap();
            pose.translation += Vector3::new(0.02, -0.01, 0.01);
            state.set_pose(FrameId(id), pose).unwrap();
        }
        state.create_prior_for_first_frame().unwrap();
        let optimizer = DenseGaussNewton {
            max_iterations: 5,
            ..Default::default()
        };
        let report = state.solve_with(&optimizer, &HashMap::new()).unwrap();
        assert!(report.final_cost < report.initial_cost);
        assert!(!state.is_solving());
    }
}
