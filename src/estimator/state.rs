//! EstimatorState - owner of every agent's sliding window.
//!
//! The state is shared between the front end, the solver loop and the
//! remote-sync worker, so every method takes `&self`. Each agent's window
//! sits behind its own lock; the outer map is only locked to look up or
//! create a window.
//!
//! # Lock order
//!
//! ```text
//! solve gate → windows map → agent window → frame_owner → landmarks → cameras → params → prior → td → stats
//! ```
//!
//! A method may skip levels but never takes them in reverse.
//!
//! Structural mutations hold the solve gate shared for their whole run and
//! check the solving flag under it. `pre_solve` raises the flag under the
//! exclusive gate, so it waits for mutations that already passed the check.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use nalgebra::Vector3;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};

use super::camera::CameraRegistry;
use super::frame::{ImuSlice, VinsFrame, VisualFrameDesc};
use super::sliding_window::SlidingWindow;
use crate::config::EstimatorConfig;
use crate::error::StateError;
use crate::geometry::{Odometry, Pose};
use crate::imu::{GRAVITY, ImuBias, ImuInitState, MidpointPreintegrator, PreintegrationEngine};
use crate::landmark::{Landmark, LandmarkManager, LandmarkStore};
use crate::optimizer::marginalizer::{Marginalizer, SchurMarginalizer};
use crate::optimizer::params::{ParamBlocks, ParamKey};
use crate::optimizer::prior::PriorFactor;
use crate::types::{AgentId, CamId, FrameId, LandmarkId};

/// Counters of the prior bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarginalizationStats {
    /// Evictions folded into the prior.
    pub marginalized: usize,
    /// Evictions whose elimination failed; the prior lost those blocks.
    pub degraded: usize,
    /// Frames removed without touching the prior's information.
    pub discarded: usize,
    /// Uninformative dimensions dropped during elimination.
    pub dropped_dims: usize,
}

pub struct EstimatorState {
    pub(crate) config: EstimatorConfig,

    pub(crate) windows: RwLock<BTreeMap<AgentId, Arc<RwLock<SlidingWindow>>>>,
    pub(crate) frame_owner: RwLock<HashMap<FrameId, AgentId>>,
    pub(crate) landmarks: RwLock<LandmarkManager>,
    pub(crate) cameras: RwLock<CameraRegistry>,

    // ─────────────────────────────────────────────────────────────────────────
    // Optimization
    // ─────────────────────────────────────────────────────────────────────────
    /// Parameter snapshot of the last export or sync.
    pub(crate) params: Mutex<ParamBlocks>,
    pub(crate) prior: Mutex<Option<PriorFactor>>,
    /// Camera-IMU time offset per agent.
    pub(crate) td: RwLock<BTreeMap<AgentId, f64>>,
    pub(crate) stats: Mutex<MarginalizationStats>,
    /// Set between `pre_solve` and `sync_from_state` / `abort_solve`.
    pub(crate) solving: AtomicBool,
    /// Shared by structural mutations, exclusive while the solving flag is raised.
    pub(crate) solve_gate: RwLock<()>,

    /// Stamp of the first frame ever added; origin of relative log times.
    pub(crate) epoch: Mutex<Option<f64>>,
    pub(crate) init_state: Mutex<ImuInitState>,

    pub(crate) engine: Arc<dyn PreintegrationEngine>,
    pub(crate) marginalizer: Arc<dyn Marginalizer>,
}

impl EstimatorState {
    /// State with the default preintegration engine and marginalizer.
    pub fn new(config: EstimatorConfig) -> Self {
        let engine = Arc::new(MidpointPreintegrator::new(config.imu));
        let marginalizer = Arc::new(SchurMarginalizer::new(
            config.imu,
            GRAVITY,
            config.marginalize_eigen_threshold,
        ));
        Self::with_collaborators(config, engine, marginalizer)
    }

    pub fn with_collaborators(
        config: EstimatorConfig,
        engine: Arc<dyn PreintegrationEngine>,
        marginalizer: Arc<dyn Marginalizer>,
    ) -> Self {
        let mut cameras = CameraRegistry::new(config.local_agent);
        for cam in &config.cameras {
            cameras.add_camera(cam.extrinsic(), 0, cam.agent, Some(cam.id));
        }
        Self {
            windows: RwLock::new(BTreeMap::new()),
            frame_owner: RwLock::new(HashMap::new()),
            landmarks: RwLock::new(LandmarkManager::new(config.landmark_min_tracks)),
            cameras: RwLock::new(cameras),
            params: Mutex::new(ParamBlocks::new()),
            prior: Mutex::new(None),
            td: RwLock::new(BTreeMap::new()),
            stats: Mutex::new(MarginalizationStats::default()),
            solving: AtomicBool::new(false),
            solve_gate: RwLock::new(()),
            epoch: Mutex::new(None),
            init_state: Mutex::new(ImuInitState::default()),
            engine,
            marginalizer,
            config,
        }
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    pub fn local_agent(&self) -> AgentId {
        self.config.local_agent
    }

    pub fn engine(&self) -> &dyn PreintegrationEngine {
        self.engine.as_ref()
    }

    pub fn is_solving(&self) -> bool {
        self.solving.load(Ordering::SeqCst)
    }

    /// Guard held for the duration of a structural mutation.
    ///
    /// Fails while a solve is in flight. No solve can start until the guard
    /// is dropped.
    pub(crate) fn ensure_idle(&self) -> Result<RwLockReadGuard<'_, ()>, StateError> {
        let gate = self.solve_gate.read_recursive();
        if self.is_solving() {
            return Err(StateError::SolveInFlight);
        }
        Ok(gate)
    }

    /// Raise the solving flag once no mutation is running.
    pub(crate) fn begin_solve(&self) -> Result<(), StateError> {
        let _gate = self.solve_gate.write();
        self.solving
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| StateError::SolveInFlight)
    }

    pub(crate) fn window(&self, agent: AgentId) -> Option<Arc<RwLock<SlidingWindow>>> {
        self.windows.read().get(&agent).cloned()
    }

    pub(crate) fn window_or_err(&self, agent: AgentId) -> Result<Arc<RwLock<SlidingWindow>>, StateError> {
        self.window(agent).ok_or(StateError::UnknownAgent(agent))
    }

    fn window_or_create(&self, agent: AgentId) -> Arc<RwLock<SlidingWindow>> {
        if let Some(win) = self.window(agent) {
            return win;
        }
        let mut windows = self.windows.write();
        windows
            .entry(agent)
            .or_insert_with(|| {
                info!("new sliding window for agent {}", agent);
                Arc::new(RwLock::new(SlidingWindow::new(agent)))
            })
            .clone()
    }

    /// Windows of all agents, in agent order.
    pub(crate) fn all_windows(&self) -> Vec<(AgentId, Arc<RwLock<SlidingWindow>>)> {
        self.windows
            .read()
            .iter()
            .map(|(a, w)| (*a, w.clone()))
            .collect()
    }

    pub fn agents(&self) -> Vec<AgentId> {
        self.windows.read().keys().copied().collect()
    }

    pub fn owner_of(&self, frame: FrameId) -> Result<AgentId, StateError> {
        self.frame_owner
            .read()
            .get(&frame)
            .copied()
            .ok_or(StateError::UnknownFrame(frame))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Frame insertion
    // ─────────────────────────────────────────────────────────────────────────

    /// Build the next frame of `desc.agent` from its newest frame and `imu`.
    pub fn make_frame(&self, desc: &VisualFrameDesc, imu: ImuSlice) -> VinsFrame {
        let prev = self
            .window(desc.agent)
            .and_then(|w| w.read().last().cloned());
        match prev {
            Some(prev) => VinsFrame::from_previous(desc, imu, &prev, self.engine.as_ref()),
            None => VinsFrame::new(desc, ImuBias::zero()),
        }
    }

    /// Append `frame` to its agent's window and record the observations of `desc`.
    pub fn add_frame(&self, desc: &VisualFrameDesc, frame: VinsFrame) -> Result<(), StateError> {
        let _idle = self.ensure_idle()?;
        if frame.id != desc.frame_id || frame.agent != desc.agent {
            return Err(StateError::AgentMismatch {
                frame: frame.id,
                expected: desc.agent,
                got: frame.agent,
            });
        }
        let (id, agent, stamp) = (frame.id, frame.agent, frame.stamp);
        if self.frame_owner.read().contains_key(&id) {
            return Err(StateError::OutOfOrderFrame {
                agent,
                frame: id,
                last: id,
            });
        }

        let win = self.window_or_create(agent);
        let mut win = win.write();
        win.push(frame)?;
        self.frame_owner.write().insert(id, agent);
        {
            let mut landmarks = self.landmarks.write();
            for obs in &desc.observations {
                if obs.frame_id == id {
                    landmarks.add_observation(*obs);
                }
            }
        }
        self.epoch.lock().get_or_insert(stamp);
        debug!(
            "added {} to {} ({} frames, {} observations)",
            id,
            agent,
            win.len(),
            desc.observations.len()
        );
        Ok(())
    }

    /// [`Self::make_frame`] followed by [`Self::add_frame`].
    pub fn push_frame(&self, desc: &VisualFrameDesc, imu: ImuSlice) -> Result<(), StateError> {
        let frame = self.make_frame(desc, imu);
        self.add_frame(desc, frame)
    }

    /// Record the window ordering a remote agent reported.
    ///
    /// Frames are only dropped later by `clear_useless_frames`. Orderings for
    /// the local agent are ignored.
    pub fn update_sldwin(&self, agent: AgentId, frame_ids: Vec<FrameId>) {
        if agent == self.config.local_agent {
            warn!("ignoring remote window ordering for local agent {}", agent);
            return;
        }
        let win = self.window_or_create(agent);
        debug!("remote window of {}: {} frames", agent, frame_ids.len());
        win.write().set_remote_ids(frame_ids);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Setters
    // ─────────────────────────────────────────────────────────────────────────

    fn with_frame_mut<T>(
        &self,
        id: FrameId,
        f: impl FnOnce(&mut VinsFrame) -> T,
    ) -> Result<T, StateError> {
        let _idle = self.ensure_idle()?;
        let agent = self.owner_of(id)?;
        let win = self.window_or_err(agent)?;
        let mut win = win.write();
        let frame = win.frame_mut(id).ok_or(StateError::UnknownFrame(id))?;
        Ok(f(frame))
    }

    pub fn set_pose(&self, id: FrameId, pose: Pose) -> Result<(), StateError> {
        self.with_frame_mut(id, |f| f.odom.pose = pose)
    }

    pub fn set_velocity(&self, id: FrameId, velocity: Vector3<f64>) -> Result<(), StateError> {
        self.with_frame_mut(id, |f| f.odom.velocity = velocity)
    }

    pub fn set_bias(&self, id: FrameId, bias: ImuBias) -> Result<(), StateError> {
        self.with_frame_mut(id, |f| f.bias = bias)
    }

    /// Apply `delta` to every frame and landmark and re-anchor the reference frame.
    pub fn move_all_poses(&self, new_ref_frame_id: FrameId, delta: &Pose) -> Result<(), StateError> {
        let _idle = self.ensure_idle()?;
        for (_, win) in self.all_windows() {
            let mut win = win.write();
            for frame in win.frames_mut() {
                frame.odom.pose = delta * &frame.odom.pose;
                frame.odom.velocity = delta.rotation * frame.odom.velocity;
                frame.reference_frame_id = new_ref_frame_id;
            }
        }
        self.landmarks.write().transform_all(delta);
        debug!("moved all poses to reference {}", new_ref_frame_id);
        Ok(())
    }

    /// Seed the prior on the first frame of the local window.
    pub fn create_prior_for_first_frame(&self) -> Result<(), StateError> {
        let agent = self.config.local_agent;
        let win = self.window_or_err(agent)?;
        let win = win.read();
        let first = win.first().ok_or(StateError::UnknownAgent(agent))?;
        let (pose, speed_bias) = first.export_blocks();
        let prior = PriorFactor::for_first_frame(first.id, &pose, &speed_bias, &self.config.first_frame_prior)
            .map_err(|_| StateError::InvalidBlock(ParamKey::Pose(first.id)))?;
        debug!("seeded prior on first frame {}", first.id);
        *self.prior.lock() = Some(prior);
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Cameras
    // ─────────────────────────────────────────────────────────────────────────

    pub fn add_camera(&self, pose: Pose, camera_index: usize, agent: AgentId, id: Option<CamId>) -> CamId {
        self.cameras.write().add_camera(pose, camera_index, agent, id)
    }

    pub fn camera_belonging(&self, id: CamId) -> Option<AgentId> {
        self.cameras.read().camera_belonging(id)
    }

    pub fn has_camera(&self, id: CamId) -> bool {
        self.cameras.read().has_camera(id)
    }

    pub fn local_camera_extrinsics(&self) -> Vec<(CamId, Pose)> {
        self.cameras.read().local_camera_extrinsics()
    }

    pub fn available_camera_ids(&self) -> Vec<CamId> {
        self.cameras.read().available_camera_ids()
    }

    pub fn extrinsic(&self, id: CamId) -> Result<Pose, StateError> {
        self.cameras.read().extrinsic(id)
    }

    /// Body poses of every frame in every window.
    pub(crate) fn body_poses(&self) -> HashMap<FrameId, Pose> {
        let mut poses = HashMap::new();
        for (_, win) in self.all_windows() {
            for f in win.read().frames() {
                poses.insert(f.id, f.odom.pose);
            }
        }
        poses
    }

    pub(crate) fn extrinsics(&self) -> HashMap<CamId, Pose> {
        self.cameras
            .read()
            .iter()
            .map(|(id, c)| (*id, c.pose))
            .collect()
    }

    /// Camera-to-world pose of `camera` at `frame`.
    pub fn camera_pose(&self, frame: FrameId, camera: CamId) -> Result<Pose, StateError> {
        let agent = self.owner_of(frame)?;
        let body = {
            let win = self.window_or_err(agent)?;
            let win = win.read();
            win.frame(frame).ok_or(StateError::UnknownFrame(frame))?.odom.pose
        };
        Ok(body * self.extrinsic(camera)?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn frame_by_id(&self, id: FrameId) -> Result<VinsFrame, StateError> {
        let agent = self.owner_of(id)?;
        let win = self.window_or_err(agent)?;
        let win = win.read();
        win.frame(id).cloned().ok_or(StateError::UnknownFrame(id))
    }

    pub fn frame(&self, agent: AgentId, index: usize) -> Result<VinsFrame, StateError> {
        let win = self.window_or_err(agent)?;
        let win = win.read();
        win.get(index).cloned().ok_or(StateError::IndexOutOfRange {
            agent,
            index,
            size: win.len(),
        })
    }

    pub fn first_frame(&self, agent: AgentId) -> Option<VinsFrame> {
        self.window(agent).and_then(|w| w.read().first().cloned())
    }

    pub fn last_frame(&self, agent: AgentId) -> Option<VinsFrame> {
        self.window(agent).and_then(|w| w.read().last().cloned())
    }

    pub fn size(&self, agent: AgentId) -> usize {
        self.window(agent).map_or(0, |w| w.read().len())
    }

    pub fn frame_ids(&self, agent: AgentId) -> Vec<FrameId> {
        self.window(agent).map_or_else(Vec::new, |w| w.read().frame_ids())
    }

    pub fn num_keyframes(&self, agent: AgentId) -> usize {
        self.window(agent).map_or(0, |w| w.read().num_keyframes())
    }

    pub fn has_frame(&self, id: FrameId) -> bool {
        self.frame_owner.read().contains_key(&id)
    }

    pub fn estimated_pose(&self, id: FrameId) -> Result<Pose, StateError> {
        Ok(self.frame_by_id(id)?.odom.pose)
    }

    pub fn estimated_odom(&self, id: FrameId) -> Result<Odometry, StateError> {
        Ok(self.frame_by_id(id)?.odom)
    }

    /// Bias of the newest frame of `agent`.
    pub fn latest_bias(&self, agent: AgentId) -> Option<ImuBias> {
        self.last_frame(agent).map(|f| f.bias)
    }

    pub fn td(&self, agent: AgentId) -> f64 {
        self.td
            .read()
            .get(&agent)
            .copied()
            .unwrap_or(self.config.td_initial)
    }

    pub fn prior(&self) -> Option<PriorFactor> {
        self.prior.lock().clone()
    }

    pub fn marginalization_stats(&self) -> MarginalizationStats {
        *self.stats.lock()
    }

    pub fn epoch(&self) -> Option<f64> {
        *self.epoch.lock()
    }

    pub fn init_state(&self) -> ImuInitState {
        *self.init_state.lock()
    }

    pub fn landmark(&self, id: LandmarkId) -> Option<Landmark> {
        self.landmarks.read().get(id).cloned()
    }

    pub fn landmarks_by_ids(&self, ids: &[LandmarkId]) -> Vec<Landmark> {
        self.landmarks.read().landmarks_by_ids(ids)
    }

    pub fn has_landmark(&self, id: LandmarkId) -> bool {
        self.landmarks.read().contains(id)
    }

    pub fn landmark_base_frame(&self, id: LandmarkId) -> Option<FrameId> {
        self.landmarks.read().get(id).map(|lm| lm.base_frame)
    }

    pub fn initialized_landmarks(&self) -> Vec<LandmarkId> {
        self.landmarks.read().initialized_landmarks()
    }

    pub fn num_landmarks(&self) -> usize {
        self.landmarks.read().len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Diagnostics
    // ─────────────────────────────────────────────────────────────────────────

    /// Per-agent window listing with per-frame landmark counts.
    pub fn print_sld_win(&self) -> String {
        let epoch = self.epoch().unwrap_or(0.0);
        let mut out = String::new();
        for (agent, win) in self.all_windows() {
            let win = win.read();
            let landmarks = self.landmarks.read();
            let _ = writeln!(
                out,
                "{}: {} frames ({} KF)",
                agent,
                win.len(),
                win.num_keyframes()
            );
            for (i, frame) in win.frames().iter().enumerate() {
                let _ = writeln!(
                    out,
                    "  [{}] {} lms {} based {}",
                    i,
                    frame.describe(epoch),
                    landmarks.num_observed_in(frame.id),
                    landmarks.landmarks_based_at(frame.id).len()
                );
            }
        }
        out
    }

    /// Landmarks observed in `frame` with their status.
    pub fn landmark_report(&self, frame: FrameId) -> Result<String, StateError> {
        self.owner_of(frame)?;
        let landmarks = self.landmarks.read();
        let mut out = format!("{}: {} landmarks\n", frame, landmarks.num_observed_in(frame));
        for id in landmarks.observed_in(frame) {
            if let Some(lm) = landmarks.get(id) {
                let _ = writeln!(
                    out,
                    "  {} {:?} base {} track {} pos [{:+.2}, {:+.2}, {:+.2}]",
                    lm.id,
                    lm.flag,
                    lm.base_frame,
                    lm.track_len(),
                    lm.position.x,
                    lm.position.y,
                    lm.position.z
                );
            }
        }
        Ok(out)
    }
}
