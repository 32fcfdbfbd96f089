//! Visual-inertial alignment.
//!
//! Recovers the gyroscope bias, per-frame velocities, the gravity vector and
//! the metric scale of an up-to-scale visual trajectory from the motion
//! summaries between consecutive frames.
//!
//! # Unknowns
//!
//! Velocities are expressed in each frame's body axes. Gravity is the
//! up-pointing reaction `g` in the visual frame, so a body at rest measures
//! `Rᵀ g`. Scale is carried as `100 · s` to balance the columns.
//!
//! ```text
//! x = [v_0, …, v_{n-1}, g, 100·s]       (3n + 4)
//! ```
//!
//! For a pair `(i, j)` with body rotations `R_i, R_j`, camera positions
//! `T_i, T_j`, camera-to-body translation `t` and summary `(δp, δv, dt)`:
//!
//! ```text
//! δp + R_iᵀR_j t − t = −dt v_i + ½dt² R_iᵀ g + R_iᵀ(T_j − T_i) s
//! δv                 = −v_i + R_iᵀR_j v_j + dt R_iᵀ g
//! ```

use std::ops::AddAssign;

use nalgebra::{DMatrix, DVector, Matrix3, SMatrix, SVector, UnitQuaternion, Vector2, Vector3};
use tracing::{debug, warn};

use crate::config::AlignmentConfig;
use crate::error::AlignmentError;
use crate::estimator::VinsFrame;
use crate::geometry::{Pose, tangent_basis};
use crate::imu::PreintegratedState;

/// Conditioning factor applied to the normal equations.
const SYSTEM_SCALE: f64 = 1000.0;
const SCALE_COLUMN: f64 = 100.0;
/// Smallest accepted Cholesky pivot, relative to the largest diagonal entry.
const MIN_RELATIVE_PIVOT: f64 = 1e-13;

/// Result of [`linear_alignment`].
#[derive(Debug, Clone, PartialEq)]
pub struct AlignmentSolution {
    /// Up-pointing gravity in the visual frame, with the known magnitude.
    pub gravity: Vector3<f64>,
    /// Metric scale of the visual trajectory.
    pub scale: f64,
    /// Per-frame velocity in body axes.
    pub velocities: Vec<Vector3<f64>>,
}

/// Body rotation and camera position of one frame in the visual frame.
#[derive(Debug, Clone, Copy)]
struct VisualFrame {
    rot: Matrix3<f64>,
    cam_pos: Vector3<f64>,
}

fn visual_frames(camera_poses: &[Pose], extrinsic: &Pose) -> Vec<VisualFrame> {
    let ric_t = extrinsic.rotation.inverse();
    camera_poses
        .iter()
        .map(|c| VisualFrame {
            rot: (c.rotation * ric_t).to_rotation_matrix().into_inner(),
            cam_pos: c.translation,
        })
        .collect()
}

/// Summaries of frames `1..n`; each spans from its predecessor.
fn summaries(frames: &[VinsFrame]) -> Result<Vec<PreintegratedState>, AlignmentError> {
    frames
        .iter()
        .skip(1)
        .map(|f| f.preintegration.ok_or(AlignmentError::MissingPreintegration(f.id)))
        .collect()
}

fn check_lengths(frames: &[VinsFrame], camera_poses: &[Pose], required: usize) -> Result<(), AlignmentError> {
    if frames.len() < required {
        return Err(AlignmentError::InsufficientFrames {
            required,
            got: frames.len(),
        });
    }
    if camera_poses.len() != frames.len() {
        return Err(AlignmentError::InsufficientFrames {
            required: frames.len(),
            got: camera_poses.len(),
        });
    }
    Ok(())
}

/// Single gyroscope bias explaining the rotation discrepancy between the
/// visual trajectory and the motion summaries.
///
/// Each summary is corrected from its own linearization point, so the
/// returned value is absolute. Needs at least two frame pairs.
pub fn solve_gyroscope_bias(
    frames: &[VinsFrame],
    camera_poses: &[Pose],
    extrinsic: &Pose,
) -> Result<Vector3<f64>, AlignmentError> {
    check_lengths(frames, camera_poses, 3)?;
    let summaries = summaries(frames)?;
    let visual = visual_frames(camera_poses, extrinsic);

    let mut a = Matrix3::zeros();
    let mut b = Vector3::zeros();
    for (k, preint) in summaries.iter().enumerate() {
        let (vi, vj) = (&visual[k], &visual[k + 1]);
        let q_ij = UnitQuaternion::from_matrix(&(vi.rot.transpose() * vj.rot));
        // δR · Exp(J (bg − bg_lin)) = q_ij
        let jac = preint.jac_rot_bg;
        let rhs = (preint.delta_rot.inverse() * q_ij).scaled_axis() + jac * preint.linearized_bias.gyro;
        a += jac.transpose() * jac;
        b += jac.transpose() * rhs;
    }

    let bg = a.cholesky().ok_or(AlignmentError::Degenerate)?.solve(&b);
    if !bg.iter().all(|v| v.is_finite()) {
        return Err(AlignmentError::Degenerate);
    }
    debug!("gyroscope bias [{:+.5}, {:+.5}, {:+.5}]", bg.x, bg.y, bg.z);
    Ok(bg)
}

/// Velocities, gravity and scale from the visual trajectory and the summaries.
///
/// The summaries must already be integrated at the gyroscope bias returned
/// by [`solve_gyroscope_bias`]. Gravity is refined onto the known magnitude
/// before returning.
pub fn linear_alignment(
    frames: &[VinsFrame],
    camera_poses: &[Pose],
    extrinsic: &Pose,
    config: &AlignmentConfig,
) -> Result<AlignmentSolution, AlignmentError> {
    check_lengths(frames, camera_poses, config.min_frames.max(4))?;
    let summaries = summaries(frames)?;
    let visual = visual_frames(camera_poses, extrinsic);
    let tic = extrinsic.translation;
    let n = frames.len();
    let dim = 3 * n + 4;

    let mut lhs = DMatrix::<f64>::zeros(dim, dim);
    let mut rhs = DVector::<f64>::zeros(dim);
    for (k, preint) in summaries.iter().enumerate() {
        let (vi, vj) = (&visual[k], &visual[k + 1]);
        let dt = preint.dt;
        let ri_t = vi.rot.transpose();

        let mut a = SMatrix::<f64, 6, 10>::zeros();
        let mut b = SVector::<f64, 6>::zeros();
        a.fixed_view_mut::<3, 3>(0, 0).copy_from(&(-dt * Matrix3::identity()));
        a.fixed_view_mut::<3, 3>(0, 6).copy_from(&(ri_t * dt * dt / 2.0));
        a.fixed_view_mut::<3, 1>(0, 9)
            .copy_from(&(ri_t * (vj.cam_pos - vi.cam_pos) / SCALE_COLUMN));
        b.fixed_rows_mut::<3>(0)
            .copy_from(&(preint.delta_pos + ri_t * vj.rot * tic - tic));

        a.fixed_view_mut::<3, 3>(3, 0).copy_from(&(-Matrix3::identity()));
        a.fixed_view_mut::<3, 3>(3, 3).copy_from(&(ri_t * vj.rot));
        a.fixed_view_mut::<3, 3>(3, 6).copy_from(&(ri_t * dt));
        b.fixed_rows_mut::<3>(3).copy_from(&preint.delta_vel);

        accumulate_pair(&mut lhs, &mut rhs, k, n, &a, &b);
    }

    let x = solve_normal(lhs, rhs)?;
    let scale = x[dim - 1] / SCALE_COLUMN;
    let gravity = Vector3::new(x[3 * n], x[3 * n + 1], x[3 * n + 2]);
    debug!("linear alignment: scale {:.4}, |g| {:.4}", scale, gravity.norm());

    if (gravity.norm() - config.gravity_norm).abs() > config.gravity_tolerance {
        warn!(
            "alignment rejected: gravity magnitude {:.3} (expected {:.3})",
            gravity.norm(),
            config.gravity_norm
        );
        return Err(AlignmentError::GravityMagnitude {
            got: gravity.norm(),
            expected: config.gravity_norm,
        });
    }

    let solution = refine_gravity(frames, camera_poses, extrinsic, &gravity, config)?;
    if solution.scale <= 0.0 {
        return Err(AlignmentError::NegativeScale(solution.scale));
    }
    Ok(solution)
}

/// Re-solve the alignment with gravity constrained to the known magnitude.
///
/// Gravity is perturbed in the two-dimensional tangent plane of the current
/// estimate; the iteration count is fixed by `config.refine_iterations`.
pub fn refine_gravity(
    frames: &[VinsFrame],
    camera_poses: &[Pose],
    extrinsic: &Pose,
    initial: &Vector3<f64>,
    config: &AlignmentConfig,
) -> Result<AlignmentSolution, AlignmentError> {
    check_lengths(frames, camera_poses, config.min_frames.max(4))?;
    if initial.norm() < 1e-9 {
        return Err(AlignmentError::Degenerate);
    }
    let summaries = summaries(frames)?;
    let visual = visual_frames(camera_poses, extrinsic);
    let tic = extrinsic.translation;
    let n = frames.len();
    let dim = 3 * n + 3;

    let mut g0 = initial.normalize() * config.gravity_norm;
    let mut x = DVector::<f64>::zeros(dim);
    for iteration in 0..config.refine_iterations.max(1) {
        let lxly = tangent_basis(&g0);
        let mut lhs = DMatrix::<f64>::zeros(dim, dim);
        let mut rhs = DVector::<f64>::zeros(dim);

        for (k, preint) in summaries.iter().enumerate() {
            let (vi, vj) = (&visual[k], &visual[k + 1]);
            let dt = preint.dt;
            let ri_t = vi.rot.transpose();

            let mut a = SMatrix::<f64, 6, 9>::zeros();
            let mut b = SVector::<f64, 6>::zeros();
            a.fixed_view_mut::<3, 3>(0, 0).copy_from(&(-dt * Matrix3::identity()));
            a.fixed_view_mut::<3, 2>(0, 6).copy_from(&(ri_t * dt * dt / 2.0 * lxly));
            a.fixed_view_mut::<3, 1>(0, 8)
                .copy_from(&(ri_t * (vj.cam_pos - vi.cam_pos) / SCALE_COLUMN));
            b.fixed_rows_mut::<3>(0).copy_from(
                &(preint.delta_pos + ri_t * vj.rot * tic - tic - ri_t * dt * dt / 2.0 * g0),
            );

            a.fixed_view_mut::<3, 3>(3, 0).copy_from(&(-Matrix3::identity()));
            a.fixed_view_mut::<3, 3>(3, 3).copy_from(&(ri_t * vj.rot));
            a.fixed_view_mut::<3, 2>(3, 6).copy_from(&(ri_t * dt * lxly));
            b.fixed_rows_mut::<3>(3)
                .copy_from(&(preint.delta_vel - ri_t * dt * g0));

            accumulate_pair(&mut lhs, &mut rhs, k, n, &a, &b);
        }

        x = solve_normal(lhs, rhs)?;
        let dg = Vector2::new(x[3 * n], x[3 * n + 1]);
        let next = (g0 + lxly * dg).normalize() * config.gravity_norm;
        let moved = next.normalize().angle(&g0.normalize());
        g0 = next;
        if moved < config.refine_tolerance {
            debug!("gravity refinement converged after {} iterations", iteration + 1);
            break;
        }
    }

    let velocities = (0..n)
        .map(|k| Vector3::new(x[3 * k], x[3 * k + 1], x[3 * k + 2]))
        .collect();
    Ok(AlignmentSolution {
        gravity: g0,
        scale: x[dim - 1] / SCALE_COLUMN,
        velocities,
    })
}

/// Add `aᵀa`, `aᵀb` of pair `k` to the normal system. The first six columns
/// of `a` belong to velocities `k` and `k + 1`, the rest to the shared tail.
fn accumulate_pair<const C: usize>(
    lhs: &mut DMatrix<f64>,
    rhs: &mut DVector<f64>,
    k: usize,
    n: usize,
    a: &SMatrix<f64, 6, C>,
    b: &SVector<f64, 6>,
) {
    let ata = a.transpose() * a;
    let atb = a.transpose() * b;
    let tail = C - 6;
    let shared = 3 * n;

    lhs.view_mut((3 * k, 3 * k), (6, 6))
        .add_assign(&ata.fixed_view::<6, 6>(0, 0));
    rhs.rows_mut(3 * k, 6).add_assign(&atb.fixed_rows::<6>(0));

    lhs.view_mut((shared, shared), (tail, tail))
        .add_assign(&ata.view((6, 6), (tail, tail)));
    rhs.rows_mut(shared, tail).add_assign(&atb.rows(6, tail));

    lhs.view_mut((3 * k, shared), (6, tail))
        .add_assign(&ata.view((0, 6), (6, tail)));
    lhs.view_mut((shared, 3 * k), (tail, 6))
        .add_assign(&ata.view((6, 0), (tail, 6)));
}

fn solve_normal(lhs: DMatrix<f64>, rhs: DVector<f64>) -> Result<DVector<f64>, AlignmentError> {
    let lhs = lhs * SYSTEM_SCALE;
    let rhs = rhs * SYSTEM_SCALE;
    let max_diag = lhs.diagonal().iter().fold(0.0_f64, |m, d| m.max(d.abs()));
    let chol = lhs.cholesky().ok_or_else(|| {
        warn!("alignment system is not positive definite");
        AlignmentError::Degenerate
    })?;
    let min_pivot = chol
        .l_dirty()
        .diagonal()
        .iter()
        .fold(f64::INFINITY, |m, d| m.min(d * d));
    if !(min_pivot > MIN_RELATIVE_PIVOT * max_diag) {
        warn!("alignment system is rank deficient (pivot {:.3e})", min_pivot);
        return Err(AlignmentError::Degenerate);
    }
    let x = chol.solve(&rhs);
    if x.iter().all(|v| v.is_finite()) {
        Ok(x)
    } else {
        Err(AlignmentError::Degenerate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimator::{ImuSlice, VisualFrameDesc};
    use crate::imu::{ImuBias, MidpointPreintegrator};
    use crate::sim::SyntheticRun;
    use crate::types::{AgentId, CamId};
    use approx::assert_relative_eq;

    /// Frames integrated at zero bias plus camera poses of a visual frame that
    /// is the world rotated by `rot` and shrunk by `1 / scale`.
    fn scenario(
        run: &SyntheticRun,
        count: usize,
        rot: UnitQuaternion<f64>,
        scale: f64,
    ) -> (Vec<VinsFrame>, Vec<Pose>) {
        let engine = MidpointPreintegrator::default();
        let mut frames: Vec<VinsFrame> = Vec::new();
        let mut poses = Vec::new();
        for k in 0..count {
            let (desc, imu): (VisualFrameDesc, ImuSlice) = run.frame(k, true);
            let frame = match frames.last() {
                Some(prev) => VinsFrame::from_previous(&desc, imu, prev, &engine),
                None => VinsFrame::new(&desc, ImuBias::zero()),
            };
            frames.push(frame);
            let cam = run.camera_pose(k);
            poses.push(Pose::new(rot * cam.rotation, rot * cam.translation / scale));
        }
        (frames, poses)
    }

    fn synthetic_run() -> SyntheticRun {
        let mut run = SyntheticRun::new(AgentId(0), CamId(0), 1);
        run.extrinsic = Pose::new(
            UnitQuaternion::from_euler_angles(-std::f64::consts::FRAC_PI_2, 0.0, 0.0),
            Vector3::new(0.05, -0.02, 0.01),
        );
        run
    }

    #[test]
    fn test_gyroscope_bias_needs_two_pairs() {
        let run = synthetic_run();
        let (frames, poses) = scenario(&run, 2, UnitQuaternion::identity(), 1.0);
        assert_eq!(
            solve_gyroscope_bias(&frames, &poses, &run.extrinsic),
            Err(AlignmentError::InsufficientFrames { required: 3, got: 2 })
        );
    }

    #[test]
    fn test_gyroscope_bias_recovered() {
        let mut run = synthetic_run();
        run.trajectory.bias = ImuBias::new(Vector3::zeros(), Vector3::new(0.01, -0.02, 0.015));
        let (frames, poses) = scenario(&run, 6, UnitQuaternion::identity(), 1.0);
        let bg = solve_gyroscope_bias(&frames, &poses, &run.extrinsic).unwrap();
        assert_relative_eq!(bg, run.trajectory.bias.gyro, epsilon = 1e-4);
    }

    #[test]
    fn test_linear_alignment_needs_four_frames() {
        let run = synthetic_run();
        let (frames, poses) = scenario(&run, 3, UnitQuaternion::identity(), 1.0);
        assert_eq!(
            linear_alignment(&frames, &poses, &run.extrinsic, &AlignmentConfig::default()),
            Err(AlignmentError::InsufficientFrames { required: 4, got: 3 })
        );
    }

    #[test]
    fn test_missing_summary_is_reported() {
        let run = synthetic_run();
        let (mut frames, poses) = scenario(&run, 5, UnitQuaternion::identity(), 1.0);
        frames[2].preintegration = None;
        assert_eq!(
            linear_alignment(&frames, &poses, &run.extrinsic, &AlignmentConfig::default()),
            Err(AlignmentError::MissingPreintegration(frames[2].id))
        );
    }

    #[test]
    fn test_linear_alignment_recovers_scale_and_gravity() {
        let run = synthetic_run();
        let rot = UnitQuaternion::from_euler_angles(0.2, -0.1, 0.7);
        let (frames, poses) = scenario(&run, 10, rot, 2.5);
        let config = AlignmentConfig::default();

        let solution = linear_alignment(&frames, &poses, &run.extrinsic, &config).unwrap();
        assert_relative_eq!(solution.scale, 2.5, epsilon = 1e-2);
        assert_relative_eq!(solution.gravity.norm(), config.gravity_norm, epsilon = 1e-9);
        assert!(solution.gravity.normalize().angle(&(rot * Vector3::z())) < 1e-2);

        for (k, v) in solution.velocities.iter().enumerate() {
            let truth = run.true_odometry(k);
            let body_vel = truth.pose.rotation.inverse() * truth.velocity;
            assert_relative_eq!(*v, body_vel, epsilon = 2e-2);
        }
    }

    #[test]
    fn test_five_keyframes_recover_scale_and_gravity() {
        let run = synthetic_run();
        let (frames, poses) = scenario(&run, 5, UnitQuaternion::identity(), 2.0);
        let config = AlignmentConfig::default();

        let solution = linear_alignment(&frames, &poses, &run.extrinsic, &config).unwrap();
        assert_relative_eq!(solution.scale, 2.0, epsilon = 1e-3);
        assert_relative_eq!(solution.gravity.norm(), 9.81, epsilon = 1e-9);
        assert!(solution.gravity.normalize().angle(&Vector3::z()) < 1e-2);
        assert_eq!(solution.velocities.len(), 5);
    }

    #[test]
    fn test_constant_velocity_is_degenerate() {
        let mut run = SyntheticRun::new(AgentId(0), CamId(0), 1);
        run.extrinsic = Pose::new(
            UnitQuaternion::from_euler_angles(-std::f64::consts::FRAC_PI_2, 0.0, 0.0),
            Vector3::zeros(),
        );
        run.trajectory.amplitude = Vector3::zeros();
        run.trajectory.body_rate = Vector3::zeros();
        run.trajectory.drift = Vector3::new(0.8, -0.3, 0.1);

        for count in [5, 10] {
            let (frames, poses) = scenario(&run, count, UnitQuaternion::identity(), 2.0);
            assert_eq!(
                linear_alignment(&frames, &poses, &run.extrinsic, &AlignmentConfig::default()),
                Err(AlignmentError::Degenerate)
            );
        }
    }

    #[test]
    fn test_refine_gravity_snaps_to_known_magnitude() {
        let run = synthetic_run();
        let (frames, poses) = scenario(&run, 8, UnitQuaternion::identity(), 1.0);
        let config = AlignmentConfig::default();
        let tilted = Vector3::new(0.3, -0.2, 9.0);
        let solution = refine_gravity(&frames, &poses, &run.extrinsic, &tilted, &config).unwrap();
        assert_relative_eq!(solution.gravity.norm(), 9.81, epsilon = 1e-9);
        assert!(solution.gravity.normalize().angle(&Vector3::z()) < 1e-2);
        assert_relative_eq!(solution.scale, 1.0, epsilon = 1e-2);
    }
}
