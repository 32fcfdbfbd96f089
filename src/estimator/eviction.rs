//! Frame eviction and the marginalization bridge.
//!
//! Removing a frame always follows the same sequence: fold it into the prior
//! (or strip it from the prior), re-base or drop the landmarks it anchors,
//! drop its observations, then take it out of the window.

use tracing::{debug, warn};

use super::sliding_window::SlidingWindow;
use super::state::EstimatorState;
use crate::error::StateError;
use crate::landmark::{Landmark, LandmarkStore};
use crate::optimizer::marginalizer::{ImuLink, MarginalizationRequest};
use crate::geometry::Pose;
use crate::optimizer::params::{ParamBlocks, ParamKey};
use crate::optimizer::solver::VisualFactor;
use crate::types::{AgentId, FrameId};

impl EstimatorState {
    /// Evict frames until every window is within capacity.
    ///
    /// Remote windows first lose the frames their agent no longer reports.
    /// With `marginalize`, local evictions are folded into the prior;
    /// remote frames are never marginalized locally. Returns the landmarks
    /// removed because no observer was left to anchor them.
    pub fn clear_useless_frames(&self, marginalize: bool) -> Result<Vec<Landmark>, StateError> {
        let _idle = self.ensure_idle()?;
        let capacity = self.config.max_sliding_window;
        let local = self.config.local_agent;
        let mut orphaned = Vec::new();

        for (agent, win) in self.all_windows() {
            let mut win = win.write();
            if agent != local {
                for id in win.stale_remote_frames() {
                    if let Some(index) = win.position(id) {
                        orphaned.extend(self.remove_frame_locked(&mut win, index, false, false)?);
                    }
                }
                while win.len() > capacity {
                    orphaned.extend(self.remove_frame_locked(&mut win, 0, false, false)?);
                }
                continue;
            }

            while win.len() > capacity {
                let Some(index) = win.select_victim(self.config.eviction_policy) else {
                    break;
                };
                orphaned.extend(self.remove_frame_locked(&mut win, index, marginalize, false)?);
            }
        }
        Ok(orphaned)
    }

    /// Remove the frame at `index` of `agent` without marginalization.
    ///
    /// Returns the landmarks that lost their base and had no other observer.
    pub fn pop_frame(&self, agent: AgentId, index: usize) -> Result<Vec<Landmark>, StateError> {
        let _idle = self.ensure_idle()?;
        let win = self.window_or_err(agent)?;
        let mut win = win.write();
        self.remove_frame_locked(&mut win, index, false, false)
    }

    /// Targeted removal without marginalization.
    ///
    /// With `remove_base`, landmarks anchored at the frame are removed instead
    /// of re-based.
    pub fn remove_frame_by_id(&self, id: FrameId, remove_base: bool) -> Result<Vec<Landmark>, StateError> {
        let _idle = self.ensure_idle()?;
        let agent = self.owner_of(id)?;
        let win = self.window_or_err(agent)?;
        let mut win = win.write();
        let index = win.position(id).ok_or(StateError::UnknownFrame(id))?;
        self.remove_frame_locked(&mut win, index, false, remove_base)
    }

    fn remove_frame_locked(
        &self,
        win: &mut SlidingWindow,
        index: usize,
        marginalize: bool,
        remove_base: bool,
    ) -> Result<Vec<Landmark>, StateError> {
        let id = win
            .get(index)
            .map(|f| f.id)
            .ok_or(StateError::IndexOutOfRange {
                agent: win.agent(),
                index,
                size: win.len(),
            })?;

        if marginalize {
            self.marginalize_frame(win, index);
        } else {
            let mut prior = self.prior.lock();
            if let Some(p) = prior.as_ref() {
                if p.contains(&ParamKey::Pose(id)) || p.contains(&ParamKey::SpeedBias(id)) {
                    *prior = p.remove_blocks(&[ParamKey::Pose(id), ParamKey::SpeedBias(id)]);
                }
            }
            self.stats.lock().discarded += 1;
        }

        self.frame_owner.write().remove(&id);

        let mut orphaned = Vec::new();
        {
            let mut landmarks = self.landmarks.write();
            for lm_id in landmarks.landmarks_based_at(id) {
                let next = if remove_base {
                    None
                } else {
                    landmarks.next_observer(lm_id, id)
                };
                match next {
                    Some((frame, _)) => landmarks.rebase(lm_id, frame)?,
                    None => orphaned.extend(landmarks.remove(lm_id)),
                }
            }
            orphaned.extend(landmarks.remove_frame_observations(id));
        }

        win.remove_at(index, self.engine.as_ref())?;
        self.params.lock().remove_frame(id);
        debug!(
            "removed {} from {} (marginalize {}, {} orphaned landmarks)",
            id,
            win.agent(),
            marginalize,
            orphaned.len()
        );
        Ok(orphaned)
    }

    /// Fold the frame at `index` into the prior.
    ///
    /// The oldest frame hands over its inertial link to the successor; any
    /// frame hands over the reprojections of the landmarks it anchors, whose
    /// depths are eliminated with it. A frame with neither is counted as
    /// discarded. On failure the frame's blocks are dropped from the prior
    /// and the event is counted as degraded.
    fn marginalize_frame(&self, win: &SlidingWindow, index: usize) {
        let Some(frame) = win.get(index) else {
            return;
        };
        let id = frame.id;
        let evicted_keys = vec![ParamKey::Pose(id), ParamKey::SpeedBias(id)];

        // Only the oldest frame hands its inertial link to the prior; a middle
        // frame's link is merged into its successor.
        let mut links = Vec::new();
        if index == 0 {
            if let Some(next) = win.get(1) {
                if let Some(preint) = next.preintegration {
                    links.push(ImuLink {
                        from: id,
                        to: next.id,
                        preint,
                    });
                }
            }
        }

        let mut params = window_params(win);
        let extrinsics = self.extrinsics();
        for (cam, pose) in &extrinsics {
            let mut v = [0.0; Pose::VECTOR_SIZE];
            pose.to_vector(&mut v);
            params.insert(ParamKey::Extrinsic(*cam), &v);
        }

        // Reprojections of the landmarks anchored here, into frames that stay.
        let weight = self.visual_weight();
        let mut visual = Vec::new();
        let mut anchored_keys = Vec::new();
        {
            let landmarks = self.landmarks.read();
            for lm_id in landmarks.landmarks_based_at(id) {
                let Some(lm) = landmarks.get(lm_id) else {
                    continue;
                };
                let Some(base) = lm.base_observation().copied() else {
                    continue;
                };
                let Some(ext) = extrinsics.get(&base.camera_id) else {
                    continue;
                };
                if !lm.is_initialized() {
                    continue;
                }
                let Some(inv_depth) = lm.inverse_depth(&(frame.odom.pose * *ext)) else {
                    continue;
                };
                let factors: Vec<VisualFactor> = lm
                    .track
                    .iter()
                    .filter(|o| o.frame_id != id)
                    .filter(|o| win.position(o.frame_id).is_some() && extrinsics.contains_key(&o.camera_id))
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
                params.insert(ParamKey::Landmark(lm.id), &[inv_depth]);
                anchored_keys.push(ParamKey::Landmark(lm.id));
                visual.extend(factors);
            }
        }

        let request = MarginalizationRequest {
            evicted: id,
            evicted_keys: evicted_keys.iter().copied().chain(anchored_keys).collect(),
            links,
            visual,
        };

        let mut prior = self.prior.lock();
        if request.is_empty() {
            // Nothing ties the frame to the rest of the window.
            *prior = prior.as_ref().and_then(|p| p.remove_blocks(&evicted_keys));
            self.stats.lock().discarded += 1;
            debug!("{} carries no factors, discarded", id);
            return;
        }

        let result = self
            .marginalizer
            .linearize(&request, &params)
            .and_then(|block| self.marginalizer.marginalize(prior.as_ref(), block, &params));

        let mut stats = self.stats.lock();
        match result {
            Ok(outcome) => {
                if outcome.dropped_dims > 0 {
                    warn!(
                        "marginalizing {}: dropped {} uninformative dimensions",
                        id, outcome.dropped_dims
                    );
                }
                *prior = outcome.prior;
                stats.marginalized += 1;
                stats.dropped_dims += outcome.dropped_dims;
            }
            Err(e) => {
                warn!("marginalizing {} failed ({}), prior degraded", id, e);
                *prior = prior.as_ref().and_then(|p| p.remove_blocks(&evicted_keys));
                stats.degraded += 1;
            }
        }
    }
}

/// Pose and speed-bias blocks of every frame in `win`.
fn window_params(win: &SlidingWindow) -> ParamBlocks {
    let mut params = ParamBlocks::new();
    for f in win.frames() {
        let (pose, speed_bias) = f.export_blocks();
        params.insert(ParamKey::Pose(f.id), &pose);
        params.insert(ParamKey::SpeedBias(f.id), &speed_bias);
    }
    params
}
