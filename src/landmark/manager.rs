//! Landmark store: observation bookkeeping, solve selection, re-basing.
//!
//! Landmarks reference frames by id only. A reverse index (frame → observed
//! landmarks) keeps frame removal proportional to what that frame saw.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use nalgebra::{Matrix4, Vector3};
use tracing::debug;

use super::landmark::{Landmark, LandmarkFlag, LandmarkObservation};
use crate::error::StateError;
use crate::geometry::Pose;
use crate::types::{CamId, FrameId, LandmarkId};

/// Landmark storage seen by the window manager.
pub trait LandmarkStore {
    fn add_observation(&mut self, obs: LandmarkObservation);

    /// Clones of the requested landmarks; unknown ids are skipped.
    fn landmarks_by_ids(&self, ids: &[LandmarkId]) -> Vec<Landmark>;

    /// Deterministic, bounded selection of landmarks eligible for a solve.
    fn available_landmark_measurements(
        &self,
        max_points: usize,
        max_measurements: usize,
    ) -> Vec<Landmark>;

    /// Move the anchor to another frame that observes the landmark.
    fn rebase(&mut self, id: LandmarkId, new_base: FrameId) -> Result<(), StateError>;

    fn remove(&mut self, id: LandmarkId) -> Option<Landmark>;
}

#[derive(Debug, Clone, Default)]
pub struct LandmarkManager {
    landmarks: BTreeMap<LandmarkId, Landmark>,
    by_frame: HashMap<FrameId, BTreeSet<LandmarkId>>,
    /// Observations required before a landmark is selected for a solve.
    min_tracks: usize,
}

impl LandmarkManager {
    pub fn new(min_tracks: usize) -> Self {
        Self {
            landmarks: BTreeMap::new(),
            by_frame: HashMap::new(),
            min_tracks,
        }
    }

    pub fn get(&self, id: LandmarkId) -> Option<&Landmark> {
        self.landmarks.get(&id)
    }

    pub fn get_mut(&mut self, id: LandmarkId) -> Option<&mut Landmark> {
        self.landmarks.get_mut(&id)
    }

    pub fn contains(&self, id: LandmarkId) -> bool {
        self.landmarks.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.landmarks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.landmarks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Landmark> {
        self.landmarks.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Landmark> {
        self.landmarks.values_mut()
    }

    /// Landmarks anchored at `frame`.
    pub fn landmarks_based_at(&self, frame: FrameId) -> Vec<LandmarkId> {
        self.observed_in(frame)
            .into_iter()
            .filter(|id| {
                self.landmarks
                    .get(id)
                    .is_some_and(|lm| lm.base_frame == frame)
            })
            .collect()
    }

    /// Landmarks with at least one observation in `frame`.
    pub fn observed_in(&self, frame: FrameId) -> Vec<LandmarkId> {
        self.by_frame
            .get(&frame)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn num_observed_in(&self, frame: FrameId) -> usize {
        self.by_frame.get(&frame).map_or(0, |ids| ids.len())
    }

    /// Oldest observing frame other than `exclude`.
    pub fn next_observer(&self, id: LandmarkId, exclude: FrameId) -> Option<(FrameId, CamId)> {
        self.landmarks.get(&id).and_then(|lm| {
            lm.track
                .iter()
                .filter(|o| o.frame_id != exclude)
                .min_by_key(|o| (o.frame_id, o.camera_id))
                .map(|o| (o.frame_id, o.camera_id))
        })
    }

    /// Drop every observation made in `frame`.
    ///
    /// Landmarks left without observations are removed and returned. Callers
    /// re-base landmarks anchored at `frame` before calling this.
    pub fn remove_frame_observations(&mut self, frame: FrameId) -> Vec<Landmark> {
        let Some(ids) = self.by_frame.remove(&frame) else {
            return Vec::new();
        };
        let mut emptied = Vec::new();
        for id in ids {
            let now_empty = match self.landmarks.get_mut(&id) {
                Some(lm) => {
                    lm.track.retain(|o| o.frame_id != frame);
                    lm.track.is_empty()
                }
                None => false,
            };
            if now_empty {
                if let Some(lm) = self.landmarks.remove(&id) {
                    emptied.push(lm);
                }
            }
        }
        emptied
    }

    pub fn set_flag(&mut self, id: LandmarkId, flag: LandmarkFlag) -> Result<(), StateError> {
        let lm = self
            .landmarks
            .get_mut(&id)
            .ok_or(StateError::UnknownLandmark(id))?;
        lm.flag = flag;
        Ok(())
    }

    pub fn outliers(&self) -> BTreeSet<LandmarkId> {
        self.landmarks
            .values()
            .filter(|lm| lm.flag == LandmarkFlag::Outlier)
            .map(|lm| lm.id)
            .collect()
    }

    pub fn initialized_landmarks(&self) -> Vec<LandmarkId> {
        self.landmarks
            .values()
            .filter(|lm| lm.is_initialized())
            .map(|lm| lm.id)
            .collect()
    }

    /// Initialize landmarks that have no position yet.
    ///
    /// Uses the base depth measurement when present, otherwise two-view
    /// triangulation between the base and the latest observation. Points whose
    /// base depth falls outside `[min_depth, max_depth]` stay uninitialized.
    /// `camera_pose` resolves camera-to-world poses.
    pub fn initial_landmarks<F>(&mut self, camera_pose: F, min_depth: f64, max_depth: f64) -> usize
    where
        F: Fn(FrameId, CamId) -> Option<Pose>,
    {
        let mut count = 0;
        for lm in self.landmarks.values_mut() {
            if lm.flag != LandmarkFlag::Uninitialized {
                continue;
            }
            let Some(base) = lm.base_observation().copied() else {
                continue;
            };
            let Some(base_pose) = camera_pose(base.frame_id, base.camera_id) else {
                continue;
            };

            let depth = match base.depth {
                Some(d) => Some(d),
                None => lm
                    .track
                    .iter()
                    .rev()
                    .find(|o| o.frame_id != base.frame_id)
                    .and_then(|other| {
                        let other_pose = camera_pose(other.frame_id, other.camera_id)?;
                        let p_world =
                            triangulate_two_view(&base.normalized, &other.normalized, &base_pose, &other_pose)?;
                        Some(base_pose.inverse().transform_point(&p_world).z)
                    }),
            };

            let Some(depth) = depth else {
                continue;
            };
            if !(min_depth..=max_depth).contains(&depth) {
                continue;
            }
            lm.position = base_pose.transform_point(&(base.normalized * depth));
            lm.flag = LandmarkFlag::Initialized;
            count += 1;
        }
        if count > 0 {
            debug!("initialized {} landmarks", count);
        }
        count
    }

    /// Apply a rigid correction to every landmark position.
    pub fn transform_all(&mut self, delta: &Pose) {
        for lm in self.landmarks.values_mut() {
            lm.transform(delta);
        }
    }

    /// Apply `p ← R (s p − o)` to every landmark position.
    pub fn scale_and_transform_all(&mut self, scale: f64, offset: &Vector3<f64>, delta: &Pose) {
        for lm in self.landmarks.values_mut() {
            lm.position = delta.rotation * (scale * lm.position - offset) + delta.translation;
        }
    }
}

impl LandmarkStore for LandmarkManager {
    fn add_observation(&mut self, obs: LandmarkObservation) {
        let lm = self
            .landmarks
            .entry(obs.landmark_id)
            .or_insert_with(|| Landmark::new(obs));
        if !lm.track.iter().any(|o| o.frame_id == obs.frame_id && o.camera_id == obs.camera_id) {
            lm.track.push(obs);
        }
        self.by_frame
            .entry(obs.frame_id)
            .or_default()
            .insert(obs.landmark_id);
    }

    fn landmarks_by_ids(&self, ids: &[LandmarkId]) -> Vec<Landmark> {
        ids.iter()
            .filter_map(|id| self.landmarks.get(id).cloned())
            .collect()
    }

    fn available_landmark_measurements(
        &self,
        max_points: usize,
        max_measurements: usize,
    ) -> Vec<Landmark> {
        let mut candidates: Vec<&Landmark> = self
            .landmarks
            .values()
            .filter(|lm| lm.is_initialized() && lm.track_len() >= self.min_tracks)
            .collect();

        // Longer tracks first; refined points before fresh ones; id breaks ties.
        candidates.sort_by(|a, b| {
            b.track_len()
                .cmp(&a.track_len())
                .then_with(|| {
                    let rank = |lm: &Landmark| u8::from(lm.flag != LandmarkFlag::Estimated);
                    rank(a).cmp(&rank(b))
                })
                .then_with(|| a.id.cmp(&b.id))
        });

        let mut selected = Vec::new();
        let mut measurements = 0;
        for lm in candidates {
            if selected.len() >= max_points {
                break;
            }
            if measurements + lm.track_len() > max_measurements {
                continue;
            }
            measurements += lm.track_len();
            selected.push(lm.clone());
        }
        selected
    }

    fn rebase(&mut self, id: LandmarkId, new_base: FrameId) -> Result<(), StateError> {
        let lm = self
            .landmarks
            .get_mut(&id)
            .ok_or(StateError::UnknownLandmark(id))?;
        let camera = lm
            .track
            .iter()
            .filter(|o| o.frame_id == new_base)
            .map(|o| o.camera_id)
            .min()
            .ok_or(StateError::UnknownFrame(new_base))?;
        lm.base_frame = new_base;
        lm.base_camera = camera;
        Ok(())
    }

    fn remove(&mut self, id: LandmarkId) -> Option<Landmark> {
        let lm = self.landmarks.remove(&id)?;
        for obs in &lm.track {
            if let Some(ids) = self.by_frame.get_mut(&obs.frame_id) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.by_frame.remove(&obs.frame_id);
                }
            }
        }
        Some(lm)
    }
}

/// Linear (DLT) triangulation from two camera-to-world poses.
pub fn triangulate_two_view(
    xn1: &Vector3<f64>,
    xn2: &Vector3<f64>,
    pose1: &Pose,
    pose2: &Pose,
) -> Option<Vector3<f64>> {
    let p1 = projection_matrix(&pose1.inverse());
    let p2 = projection_matrix(&pose2.inverse());

    let mut a = Matrix4::<f64>::zeros();
    for j in 0..4 {
        a[(0, j)] = xn1.x * p1[(2, j)] - p1[(0, j)];
        a[(1, j)] = xn1.y * p1[(2, j)] - p1[(1, j)];
        a[(2, j)] = xn2.x * p2[(2, j)] - p2[(0, j)];
        a[(3, j)] = xn2.y * p2[(2, j)] - p2[(1, j)];
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let (min_idx, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|x, y| x.1.total_cmp(y.1))?;
    let x3d_h = v_t.row(min_idx);

    if x3d_h[3].abs() < 1e-10 {
        return None;
    }
    let p = Vector3::new(x3d_h[0] / x3d_h[3], x3d_h[1] / x3d_h[3], x3d_h[2] / x3d_h[3]);
    p.iter().all(|v| v.is_finite()).then_some(p)
}

/// 3x4 projection matrix of a world-to-camera pose.
fn projection_matrix(pose_cw: &Pose) -> nalgebra::SMatrix<f64, 3, 4> {
    let r = pose_cw.rotation.to_rotation_matrix();
    let t = &pose_cw.translation;

    nalgebra::SMatrix::<f64, 3, 4>::from_columns(&[
        r.matrix().column(0).into(),
        r.matrix().column(1).into(),
        r.matrix().column(2).into(),
        *t,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{UnitQuaternion, Vector2};

    fn obs(lm: u64, frame: u64) -> LandmarkObservation {
        LandmarkObservation::new(LandmarkId(lm), FrameId(frame), CamId(0), Vector2::new(0.0, 0.0), 0.0)
    }

    fn store_with_tracks(tracks: &[(u64, Vec<u64>)]) -> LandmarkManager {
        let mut store = LandmarkManager::new(2);
        for (lm, frames) in tracks {
            for f in frames.iter() {
                store.add_observation(obs(*lm, *f));
            }
            store.set_flag(LandmarkId(*lm), LandmarkFlag::Initialized).unwrap();
        }
        store
    }

    #[test]
    fn test_selection_prefers_long_tracks_and_respects_caps() {
        let store = store_with_tracks(&[
            (1, vec![1, 2]),
            (2, vec![1, 2, 3, 4]),
            (3, vec![2, 3, 4]),
            (4, vec![4]),
        ]);

        let all = store.available_landmark_measurements(10, 100);
        let ids: Vec<_> = all.iter().map(|l| l.id.0).collect();
        assert_eq!(ids, vec![2, 3, 1]);

        let capped = store.available_landmark_measurements(2, 100);
        assert_eq!(capped.len(), 2);

        // 4 + 3 > 6, so landmark 3 is skipped and landmark 1 still fits.
        let by_measurements = store.available_landmark_measurements(10, 6);
        let ids: Vec<_> = by_measurements.iter().map(|l| l.id.0).collect();
        assert_eq!(ids, vec![2, 1]);
    }

    #[test]
    fn test_selection_skips_outliers_and_uninitialized() {
        let mut store = store_with_tracks(&[(1, vec![1, 2]), (2, vec![1, 2])]);
        store.set_flag(LandmarkId(1), LandmarkFlag::Outlier).unwrap();
        store.add_observation(obs(3, 1));
        store.add_observation(obs(3, 2));

        let ids: Vec<_> = store
            .available_landmark_measurements(10, 100)
            .iter()
            .map(|l| l.id.0)
            .collect();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn test_rebase_requires_observer() {
        let mut store = store_with_tracks(&[(1, vec![1, 2, 3])]);
        store.rebase(LandmarkId(1), FrameId(2)).unwrap();
        assert_eq!(store.get(LandmarkId(1)).unwrap().base_frame, FrameId(2));
        assert_eq!(
            store.rebase(LandmarkId(1), FrameId(9)),
            Err(StateError::UnknownFrame(FrameId(9)))
        );
        assert!(store.rebase(LandmarkId(5), FrameId(1)).is_err());
    }

    #[test]
    fn test_remove_frame_observations_drops_empty_tracks() {
        let mut store = store_with_tracks(&[(1, vec![1]), (2, vec![1, 2])]);
        let emptied = store.remove_frame_observations(FrameId(1));
        assert_eq!(emptied.len(), 1);
        assert_eq!(emptied[0].id, LandmarkId(1));
        assert!(store.contains(LandmarkId(2)));
        assert_eq!(store.get(LandmarkId(2)).unwrap().track_len(), 1);
        assert_eq!(store.num_observed_in(FrameId(1)), 0);
    }

    #[test]
    fn test_next_observer_is_oldest_remaining() {
        let store = store_with_tracks(&[(1, vec![5, 3, 8])]);
        assert_eq!(store.next_observer(LandmarkId(1), FrameId(3)), Some((FrameId(5), CamId(0))));
    }

    #[test]
    fn test_triangulate_two_view() {
        let point = Vector3::new(0.5, -0.3, 4.0);
        let pose1 = Pose::identity();
        let pose2 = Pose::new(
            UnitQuaternion::from_euler_angles(0.0, 0.05, 0.0),
            Vector3::new(0.5, 0.0, 0.0),
        );
        let project = |pose: &Pose| {
            let pc = pose.inverse().transform_point(&point);
            pc / pc.z
        };
        let p = triangulate_two_view(&project(&pose1), &project(&pose2), &pose1, &pose2).unwrap();
        assert_relative_eq!(p, point, epsilon = 1e-6);
    }

    #[test]
    fn test_initial_landmarks_from_depth_and_range() {
        let mut store = LandmarkManager::new(1);
        store.add_observation(obs(1, 1).with_depth(2.0));
        store.add_observation(obs(2, 1).with_depth(500.0));

        let n = store.initial_landmarks(|_, _| Some(Pose::identity()), 0.1, 100.0);
        assert_eq!(n, 1);
        assert_relative_eq!(store.get(LandmarkId(1)).unwrap().position, Vector3::new(0.0, 0.0, 2.0));
        assert_eq!(store.get(LandmarkId(2)).unwrap().flag, LandmarkFlag::Uninitialized);
    }
}
