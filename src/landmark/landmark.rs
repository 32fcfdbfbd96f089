//! Landmark - a 3D point anchored at the camera of its base frame.
//!
//! The world position is the canonical estimate. The inverse depth handed to
//! the optimizer is derived from it through the base camera pose, so
//! re-basing a landmark never moves the point.

use nalgebra::{Vector2, Vector3};

use crate::geometry::Pose;
use crate::types::{CamId, FrameId, LandmarkId};

/// One observation of a landmark in one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LandmarkObservation {
    pub landmark_id: LandmarkId,
    pub frame_id: FrameId,
    pub camera_id: CamId,
    /// Pixel coordinate as reported by the front end.
    pub pixel: Vector2<f64>,
    /// Point on the normalized image plane (z = 1).
    pub normalized: Vector3<f64>,
    /// Depth measurement (stereo / RGB-D), if any.
    pub depth: Option<f64>,
    pub stamp: f64,
}

impl LandmarkObservation {
    pub fn new(
        landmark_id: LandmarkId,
        frame_id: FrameId,
        camera_id: CamId,
        normalized: Vector2<f64>,
        stamp: f64,
    ) -> Self {
        Self {
            landmark_id,
            frame_id,
            camera_id,
            pixel: normalized,
            normalized: Vector3::new(normalized.x, normalized.y, 1.0),
            depth: None,
            stamp,
        }
    }

    pub fn with_depth(mut self, depth: f64) -> Self {
        self.depth = Some(depth);
        self
    }

    pub fn with_pixel(mut self, pixel: Vector2<f64>) -> Self {
        self.pixel = pixel;
        self
    }
}

/// Estimation status of a landmark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LandmarkFlag {
    /// No position yet.
    #[default]
    Uninitialized,
    /// Position from depth or triangulation, not yet optimized.
    Initialized,
    /// Position refined by at least one solve.
    Estimated,
    /// Excluded from solves until its residuals recover.
    Outlier,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Landmark {
    pub id: LandmarkId,
    /// Frame whose camera anchors the inverse depth.
    pub base_frame: FrameId,
    pub base_camera: CamId,
    /// Observations in insertion order.
    pub track: Vec<LandmarkObservation>,
    pub flag: LandmarkFlag,
    /// World position. Meaningless while `flag` is `Uninitialized`.
    pub position: Vector3<f64>,
}

impl Landmark {
    /// Create a landmark anchored at its first observation.
    pub fn new(first: LandmarkObservation) -> Self {
        Self {
            id: first.landmark_id,
            base_frame: first.frame_id,
            base_camera: first.camera_id,
            track: vec![first],
            flag: LandmarkFlag::Uninitialized,
            position: Vector3::zeros(),
        }
    }

    pub fn track_len(&self) -> usize {
        self.track.len()
    }

    pub fn base_observation(&self) -> Option<&LandmarkObservation> {
        self.observation(self.base_frame, self.base_camera)
    }

    pub fn observation(&self, frame: FrameId, camera: CamId) -> Option<&LandmarkObservation> {
        self.track
            .iter()
            .find(|o| o.frame_id == frame && o.camera_id == camera)
    }

    pub fn is_observed_by(&self, frame: FrameId) -> bool {
        self.track.iter().any(|o| o.frame_id == frame)
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.flag, LandmarkFlag::Initialized | LandmarkFlag::Estimated)
    }

    /// Inverse depth relative to the base camera.
    ///
    /// `base_camera_pose` is camera-to-world. Returns `None` when the landmark
    /// is uninitialized or behind the camera.
    pub fn inverse_depth(&self, base_camera_pose: &Pose) -> Option<f64> {
        if self.flag == LandmarkFlag::Uninitialized {
            return None;
        }
        let p_cam = base_camera_pose.inverse().transform_point(&self.position);
        if p_cam.z <= 1e-9 {
            return None;
        }
        Some(1.0 / p_cam.z)
    }

    /// Move the point along the base bearing to the given inverse depth.
    ///
    /// Returns `false` (and leaves the position untouched) when the inverse
    /// depth is not positive or the base observation is missing.
    pub fn set_inverse_depth(&mut self, base_camera_pose: &Pose, inv_depth: f64) -> bool {
        if !(inv_depth.is_finite() && inv_depth > 0.0) {
            return false;
        }
        let Some(base) = self.base_observation() else {
            return false;
        };
        let p_cam = base.normalized / inv_depth;
        self.position = base_camera_pose.transform_point(&p_cam);
        true
    }

    /// Apply a rigid correction to the world position.
    pub fn transform(&mut self, delta: &Pose) {
        self.position = delta.transform_point(&self.position);
    }
}
