//! Per-agent ordered window of frames.
//!
//! Insertion order is temporal order: frame ids strictly increase from the
//! oldest to the newest entry. A frame-id index gives O(1) lookup of a
//! frame's position.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use super::frame::VinsFrame;
use crate::config::EvictionPolicy;
use crate::error::StateError;
use crate::imu::PreintegrationEngine;
use crate::types::{AgentId, FrameId};

#[derive(Debug, Clone)]
pub struct SlidingWindow {
    agent: AgentId,
    frames: Vec<VinsFrame>,
    index: HashMap<FrameId, usize>,
    /// Latest window ordering reported by a remote agent.
    remote_ids: Option<Vec<FrameId>>,
}

impl SlidingWindow {
    pub fn new(agent: AgentId) -> Self {
        Self {
            agent,
            frames: Vec::new(),
            index: HashMap::new(),
            remote_ids: None,
        }
    }

    pub fn agent(&self) -> AgentId {
        self.agent
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frames(&self) -> &[VinsFrame] {
        &self.frames
    }

    pub fn frames_mut(&mut self) -> &mut [VinsFrame] {
        &mut self.frames
    }

    pub fn get(&self, index: usize) -> Option<&VinsFrame> {
        self.frames.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut VinsFrame> {
        self.frames.get_mut(index)
    }

    pub fn first(&self) -> Option<&VinsFrame> {
        self.frames.first()
    }

    pub fn last(&self) -> Option<&VinsFrame> {
        self.frames.last()
    }

    pub fn position(&self, id: FrameId) -> Option<usize> {
        self.index.get(&id).copied()
    }

    pub fn contains(&self, id: FrameId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn frame(&self, id: FrameId) -> Option<&VinsFrame> {
        self.position(id).and_then(|i| self.frames.get(i))
    }

    pub fn frame_mut(&mut self, id: FrameId) -> Option<&mut VinsFrame> {
        let i = self.position(id)?;
        self.frames.get_mut(i)
    }

    pub fn frame_ids(&self) -> Vec<FrameId> {
        self.frames.iter().map(|f| f.id).collect()
    }

    pub fn num_keyframes(&self) -> usize {
        self.frames.iter().filter(|f| f.is_keyframe).count()
    }

    /// Append `frame` as the newest entry.
    pub fn push(&mut self, frame: VinsFrame) -> Result<(), StateError> {
        if frame.agent != self.agent {
            return Err(StateError::AgentMismatch {
                frame: frame.id,
                expected: self.agent,
                got: frame.agent,
            });
        }
        if let Some(last) = self.frames.last() {
            if frame.id <= last.id {
                return Err(StateError::OutOfOrderFrame {
                    agent: self.agent,
                    frame: frame.id,
                    last: last.id,
                });
            }
        }
        self.index.insert(frame.id, self.frames.len());
        self.frames.push(frame);
        Ok(())
    }

    /// Remove the frame at `index` and repair the IMU chain of its successor.
    ///
    /// Removing the oldest frame turns the successor into the window root.
    /// Removing a middle frame merges its samples into the successor, which is
    /// re-integrated from the removed frame's predecessor.
    pub fn remove_at(
        &mut self,
        index: usize,
        engine: &dyn PreintegrationEngine,
    ) -> Result<VinsFrame, StateError> {
        if index >= self.frames.len() {
            return Err(StateError::IndexOutOfRange {
                agent: self.agent,
                index,
                size: self.frames.len(),
            });
        }

        if index + 1 < self.frames.len() {
            if index == 0 {
                let next = &mut self.frames[1];
                next.preintegration = None;
                next.imu_samples.clear();
                next.imu_buf_index = None;
                next.prev_frame_id = None;
            } else {
                let bias = self.frames[index - 1].bias;
                let (removed, next) = {
                    let (head, tail) = self.frames.split_at_mut(index + 1);
                    (&head[index], &mut tail[0])
                };
                let mut merged = removed.imu_samples.clone();
                let boundary = merged.last().map(|s| s.timestamp_s);
                merged.extend(
                    next.imu_samples
                        .iter()
                        .filter(|s| boundary.map_or(true, |t| s.timestamp_s > t + 1e-9))
                        .copied(),
                );
                next.imu_samples = merged;
                next.imu_buf_index = removed.imu_buf_index.or(next.imu_buf_index);
                next.prev_frame_id = removed.prev_frame_id;
                next.preintegration = engine.integrate(&next.imu_samples, &bias);
                debug!(
                    "merged IMU of {} into {} ({} samples)",
                    removed.id,
                    next.id,
                    next.imu_samples.len()
                );
            }
        }

        let removed = self.frames.remove(index);
        self.reindex();
        Ok(removed)
    }

    /// Window index of the frame to evict, never the newest one.
    pub fn select_victim(&self, policy: EvictionPolicy) -> Option<usize> {
        if self.frames.len() < 2 {
            return None;
        }
        let candidates = &self.frames[..self.frames.len() - 1];
        match policy {
            EvictionPolicy::OldestFirst => Some(0),
            EvictionPolicy::OldestNonKeyframeFirst => {
                Some(candidates.iter().position(|f| !f.is_keyframe).unwrap_or(0))
            }
        }
    }

    pub fn set_remote_ids(&mut self, ids: Vec<FrameId>) {
        self.remote_ids = Some(ids);
    }

    pub fn remote_ids(&self) -> Option<&[FrameId]> {
        self.remote_ids.as_deref()
    }

    /// Frames absent from the last reported remote ordering.
    ///
    /// Frames newer than the newest reported id are kept: the report has not
    /// caught up with them yet.
    pub fn stale_remote_frames(&self) -> Vec<FrameId> {
        let Some(ids) = &self.remote_ids else {
            return Vec::new();
        };
        let Some(newest) = ids.iter().max().copied() else {
            return Vec::new();
        };
        let reported: HashSet<FrameId> = ids.iter().copied().collect();
        self.frames
            .iter()
            .map(|f| f.id)
            .filter(|id| *id <= newest && !reported.contains(id))
            .collect()
    }

    fn reindex(&mut self) {
        self.index.clear();
        for (i, f) in self.frames.iter().enumerate() {
            self.index.insert(f.id, i);
        }
    }
}
