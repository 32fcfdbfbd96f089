//! Estimator configuration.
//!
//! Every field has a default, so a YAML file only needs to list the values it
//! overrides.

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result, bail};
use nalgebra::{Quaternion, UnitQuaternion, Vector3};
use serde::Deserialize;

use crate::geometry::Pose;
use crate::imu::ImuNoise;
use crate::types::{AgentId, CamId};

/// Which frame [`crate::estimator::SlidingWindow::select_victim`] evicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Oldest non-keyframe, else the oldest keyframe.
    #[default]
    OldestNonKeyframeFirst,
    /// Always the oldest frame.
    OldestFirst,
}

/// Thresholds for the visual-inertial bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct AlignmentConfig {
    /// Minimum window length for the linear alignment.
    pub min_frames: usize,
    /// Frames the local window must hold before bootstrap is attempted.
    pub min_init_frames: usize,
    /// Known gravity magnitude (m/s^2).
    pub gravity_norm: f64,
    /// Accepted deviation of the solved gravity magnitude.
    pub gravity_tolerance: f64,
    /// Fixed iteration count of the tangent-space gravity refinement.
    pub refine_iterations: usize,
    /// Early exit once the gravity direction moves less than this (rad).
    pub refine_tolerance: f64,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            min_frames: 4,
            min_init_frames: 6,
            gravity_norm: 9.81,
            gravity_tolerance: 0.5,
            refine_iterations: 4,
            refine_tolerance: 1e-6,
        }
    }
}

/// Diagonal square-root weights of the prior seeded on the first frame.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct FirstFramePriorConfig {
    pub position: f64,
    pub yaw: f64,
    pub tilt: f64,
    pub velocity: f64,
    pub accel_bias: f64,
    pub gyro_bias: f64,
}

impl Default for FirstFramePriorConfig {
    fn default() -> Self {
        Self {
            position: 1e3,
            yaw: 1e3,
            tilt: 1e2,
            velocity: 1.0,
            accel_bias: 10.0,
            gyro_bias: 100.0,
        }
    }
}

/// Camera mounted on an agent, as read from the configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CameraConfig {
    pub id: CamId,
    pub agent: AgentId,
    /// Camera-to-body translation.
    pub translation: [f64; 3],
    /// Camera-to-body rotation as `[qx, qy, qz, qw]`.
    pub rotation_xyzw: [f64; 4],
}

impl CameraConfig {
    pub fn extrinsic(&self) -> Pose {
        let [x, y, z, w] = self.rotation_xyzw;
        Pose::new(
            UnitQuaternion::from_quaternion(Quaternion::new(w, x, y, z)),
            Vector3::from(self.translation),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Agent whose frames are estimated (and marginalized) locally.
    pub local_agent: AgentId,

    // ─────────────────────────────────────────────────────────────────────
    // Window
    // ─────────────────────────────────────────────────────────────────────
    pub max_sliding_window: usize,
    pub eviction_policy: EvictionPolicy,

    // ─────────────────────────────────────────────────────────────────────
    // Landmarks
    // ─────────────────────────────────────────────────────────────────────
    pub max_solve_landmarks: usize,
    pub max_solve_measurements: usize,
    /// Observations a landmark needs before it is handed to the optimizer.
    pub landmark_min_tracks: usize,
    pub outlier_reproj_threshold_px: f64,
    /// Pixel scale of normalized-plane residuals.
    pub focal_length: f64,
    pub min_landmark_depth: f64,
    pub max_landmark_depth: f64,

    // ─────────────────────────────────────────────────────────────────────
    // Inertial
    // ─────────────────────────────────────────────────────────────────────
    pub imu: ImuNoise,
    pub repropagate_accel_threshold: f64,
    pub repropagate_gyro_threshold: f64,

    // ─────────────────────────────────────────────────────────────────────
    // Calibration
    // ─────────────────────────────────────────────────────────────────────
    pub estimate_td: bool,
    pub td_initial: f64,
    pub estimate_extrinsic: bool,
    pub cameras: Vec<CameraConfig>,

    // ─────────────────────────────────────────────────────────────────────
    // Marginalization / bootstrap
    // ─────────────────────────────────────────────────────────────────────
    /// Eigenvalues at or below this are treated as uninformative.
    pub marginalize_eigen_threshold: f64,
    pub alignment: AlignmentConfig,
    pub first_frame_prior: FirstFramePriorConfig,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            local_agent: AgentId(0),
            max_sliding_window: 10,
            eviction_policy: EvictionPolicy::default(),
            max_solve_landmarks: 200,
            max_solve_measurements: 1000,
            landmark_min_tracks: 2,
            outlier_reproj_threshold_px: 2.0,
            focal_length: 460.0,
            min_landmark_depth: 0.1,
            max_landmark_depth: 100.0,
            imu: ImuNoise::default(),
            repropagate_accel_threshold: 0.1,
            repropagate_gyro_threshold: 0.01,
            estimate_td: false,
            td_initial: 0.0,
            estimate_extrinsic: false,
            cameras: Vec::new(),
            marginalize_eigen_threshold: 1e-8,
            alignment: AlignmentConfig::default(),
            first_frame_prior: FirstFramePriorConfig::default(),
        }
    }
}

impl EstimatorConfig {
    /// Load a configuration from a YAML file.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
        let config: EstimatorConfig = serde_yaml::from_reader(file)
            .with_context(|| format!("Failed to parse {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: EstimatorConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_sliding_window < 2 {
            bail!(
                "max_sliding_window must be at least 2, got {}",
                self.max_sliding_window
            );
        }
        if self.alignment.min_frames < 2 {
            bail!("alignment.min_frames must be at least 2");
        }
        if self.min_landmark_depth <= 0.0 || self.max_landmark_depth <= self.min_landmark_depth {
            bail!(
                "invalid landmark depth range [{}, {}]",
                self.min_landmark_depth,
                self.max_landmark_depth
            );
        }
        if self.focal_length <= 0.0 {
            bail!("focal_length must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_defaults() {
        let config = EstimatorConfig::default();
        assert_eq!(config.max_sliding_window, 10);
        assert_eq!(config.eviction_policy, EvictionPolicy::OldestNonKeyframeFirst);
        assert_eq!(config.alignment.min_frames, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = EstimatorConfig::from_yaml_str(
            "max_sliding_window: 7\neviction_policy: oldest_first\nalignment:\n  gravity_norm: 9.8\n",
        )
        .unwrap();
        assert_eq!(config.max_sliding_window, 7);
        assert_eq!(config.eviction_policy, EvictionPolicy::OldestFirst);
        assert_relative_eq!(config.alignment.gravity_norm, 9.8);
        assert_eq!(config.alignment.refine_iterations, 4);
    }

    #[test]
    fn test_camera_entry() {
        let config = EstimatorConfig::from_yaml_str(
            "cameras:\n  - id: 3\n    agent: 1\n    translation: [0.1, 0.0, 0.0]\n    rotation_xyzw: [0.0, 0.0, 0.0, 1.0]\n",
        )
        .unwrap();
        assert_eq!(config.cameras.len(), 1);
        assert_eq!(config.cameras[0].id, CamId(3));
        let pose = config.cameras[0].extrinsic();
        assert_relative_eq!(pose.translation.x, 0.1);
    }

    #[test]
    fn test_rejects_tiny_window() {
        assert!(EstimatorConfig::from_yaml_str("max_sliding_window: 1\n").is_err());
    }
}
