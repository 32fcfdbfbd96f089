//! Inertial factor between consecutive keyframes.
//!
//! Connects `[Pose_i, SpeedBias_i, Pose_j, SpeedBias_j]` through the
//! preintegrated summary of frame j, following the "On-Manifold
//! Preintegration" formulation by Forster et al.
//!
//! # IMU Residual
//!
//! ```text
//! r_imu = [ Log(ΔR_ij^T · R_i^T · R_j)                     ]  // rotation (3)
//!         [ R_i^T · (v_j - v_i - g·Δt) - Δv_ij               ]  // velocity (3)
//!         [ R_i^T · (p_j - p_i - v_i·Δt - 0.5·g·Δt²) - Δp_ij ]  // position (3)
//!         [ ba_j - ba_i                                      ]  // accel bias walk (3)
//!         [ bg_j - bg_i                                      ]  // gyro bias walk (3)
//! ```
//!
//! where ΔR_ij, Δv_ij, Δp_ij are bias-corrected to the bias of frame i.

use nalgebra::{DMatrix, DVector, Vector3};

use super::params::{ParamBlocks, ParamKey};
use crate::error::MarginalizeError;
use crate::geometry::Pose;
use crate::imu::types::{Matrix15, Vector15};
use crate::imu::{ImuBias, ImuNoise, PreintegratedState};
use crate::types::FrameId;

/// Step used for central-difference Jacobians.
const NUMERIC_STEP: f64 = 1e-6;

#[derive(Debug, Clone)]
pub struct ImuFactor {
    pub from: FrameId,
    pub to: FrameId,
    pub preint: PreintegratedState,
    /// Gravity acceleration in the world frame.
    pub gravity: Vector3<f64>,
    sqrt_info: Matrix15,
}

impl ImuFactor {
    /// Build the factor; `None` when the summary covariance is not positive definite.
    pub fn new(
        from: FrameId,
        to: FrameId,
        preint: PreintegratedState,
        noise: &ImuNoise,
        gravity: Vector3<f64>,
    ) -> Option<Self> {
        let mut cov = Matrix15::zeros();
        cov.fixed_view_mut::<9, 9>(0, 0).copy_from(&preint.covariance);
        let dt = preint.dt.max(1e-6);
        let accel_walk = noise.sigma_accel_walk * noise.sigma_accel_walk * dt;
        let gyro_walk = noise.sigma_gyro_walk * noise.sigma_gyro_walk * dt;
        for i in 0..3 {
            cov[(9 + i, 9 + i)] = accel_walk;
            cov[(12 + i, 12 + i)] = gyro_walk;
        }

        let chol = cov.cholesky()?;
        let sqrt_info = chol.l().try_inverse()?;
        if sqrt_info.iter().any(|v| !v.is_finite()) {
            return None;
        }
        Some(Self {
            from,
            to,
            preint,
            gravity,
            sqrt_info,
        })
    }

    pub fn keys(&self) -> [ParamKey; 4] {
        [
            ParamKey::Pose(self.from),
            ParamKey::SpeedBias(self.from),
            ParamKey::Pose(self.to),
            ParamKey::SpeedBias(self.to),
        ]
    }

    /// Unweighted residual from raw parameter blocks.
    pub fn residual(
        &self,
        pose_i: &[f64],
        sb_i: &[f64],
        pose_j: &[f64],
        sb_j: &[f64],
    ) -> Option<Vector15> {
        let pose_i = Pose::from_vector(pose_i)?;
        let pose_j = Pose::from_vector(pose_j)?;
        if sb_i.len() < 9 || sb_j.len() < 9 {
            return None;
        }
        let v_i = Vector3::new(sb_i[0], sb_i[1], sb_i[2]);
        let v_j = Vector3::new(sb_j[0], sb_j[1], sb_j[2]);
        let bias_i = ImuBias::new(
            Vector3::new(sb_i[3], sb_i[4], sb_i[5]),
            Vector3::new(sb_i[6], sb_i[7], sb_i[8]),
        );
        let bias_j = ImuBias::new(
            Vector3::new(sb_j[3], sb_j[4], sb_j[5]),
            Vector3::new(sb_j[6], sb_j[7], sb_j[8]),
        );

        let dt = self.preint.dt;
        let (d_rot, d_vel, d_pos) = self.preint.correct(&bias_i);
        let r_i_inv = pose_i.rotation.inverse();

        let rotation_error = (d_rot.inverse() * r_i_inv * pose_j.rotation).scaled_axis();
        let velocity_error = r_i_inv * (v_j - v_i - self.gravity * dt) - d_vel;
        let position_error = r_i_inv
            * (pose_j.translation - pose_i.translation - v_i * dt - 0.5 * self.gravity * dt * dt)
            - d_pos;

        let mut r = Vector15::zeros();
        r.fixed_rows_mut::<3>(0).copy_from(&rotation_error);
        r.fixed_rows_mut::<3>(3).copy_from(&velocity_error);
        r.fixed_rows_mut::<3>(6).copy_from(&position_error);
        r.fixed_rows_mut::<3>(9).copy_from(&(bias_j.accel - bias_i.accel));
        r.fixed_rows_mut::<3>(12).copy_from(&(bias_j.gyro - bias_i.gyro));
        Some(r)
    }

    /// Whitened residual read from `params`.
    pub fn weighted_residual(&self, params: &ParamBlocks) -> Result<Vector15, MarginalizeError> {
        let blocks = self.blocks(params)?;
        let r = self
            .residual(
                blocks[0].as_slice(),
                blocks[1].as_slice(),
                blocks[2].as_slice(),
                blocks[3].as_slice(),
            )
            .ok_or(MarginalizeError::NonFinite)?;
        Ok(self.sqrt_info * r)
    }

    /// Whitened residual and per-block Jacobians at `params`.
    pub fn linearize(
        &self,
        params: &ParamBlocks,
    ) -> Result<(DVector<f64>, Vec<DMatrix<f64>>), MarginalizeError> {
        let keys = self.keys();
        let blocks = self.blocks(params)?;
        let r0 = self.weighted_residual(params)?;

        let mut jacobians = Vec::with_capacity(keys.len());
        for (k, key) in keys.iter().enumerate() {
            let mut jac = DMatrix::zeros(15, key.local_size());
            for c in 0..key.local_size() {
                let mut delta = vec![0.0; key.local_size()];
                delta[c] = NUMERIC_STEP;
                let plus = key.plus(blocks[k].as_slice(), &delta);
                delta[c] = -NUMERIC_STEP;
                let minus = key.plus(blocks[k].as_slice(), &delta);

                let eval = |x: &DVector<f64>| {
                    let mut b = blocks.clone();
                    b[k] = x.clone();
                    self.residual(b[0].as_slice(), b[1].as_slice(), b[2].as_slice(), b[3].as_slice())
                };
                let (rp, rm) = match (eval(&plus), eval(&minus)) {
                    (Some(rp), Some(rm)) => (rp, rm),
                    _ => return Err(MarginalizeError::NonFinite),
                };
                let col = self.sqrt_info * (rp - rm) / (2.0 * NUMERIC_STEP);
                jac.column_mut(c).copy_from(&col);
            }
            jacobians.push(jac);
        }
        Ok((DVector::from_column_slice(r0.as_slice()), jacobians))
    }

    fn blocks(&self, params: &ParamBlocks) -> Result<Vec<DVector<f64>>, MarginalizeError> {
        self.keys()
            .iter()
            .map(|key| {
                params
                    .get(key)
                    .cloned()
                    .ok_or(MarginalizeError::MissingBlock(*key))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imu::{GRAVITY, ImuSample, MidpointPreintegrator, PreintegrationEngine};
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn stationary_factor() -> ImuFactor {
        let samples: Vec<ImuSample> = (0..21)
            .map(|i| ImuSample::new(i as f64 * 0.005, -GRAVITY, Vector3::zeros()))
            .collect();
        let preint = MidpointPreintegrator::default()
            .integrate(&samples, &ImuBias::zero())
            .unwrap();
        ImuFactor::new(FrameId(0), FrameId(1), preint, &ImuNoise::default(), GRAVITY).unwrap()
    }

    fn params_at_rest(pose_j: Pose) -> ParamBlocks {
        let mut params = ParamBlocks::new();
        let mut p = [0.0; 7];
        Pose::identity().to_vector(&mut p);
        params.insert(ParamKey::Pose(FrameId(0)), &p);
        pose_j.to_vector(&mut p);
        params.insert(ParamKey::Pose(FrameId(1)), &p);
        params.insert(ParamKey::SpeedBias(FrameId(0)), &[0.0; 9]);
        params.insert(ParamKey::SpeedBias(FrameId(1)), &[0.0; 9]);
        params
    }

    #[test]
    fn test_imu_residual_zero_at_rest() {
        let factor = stationary_factor();
        let r = factor
            .weighted_residual(&params_at_rest(Pose::identity()))
            .unwrap();
        assert!(r.norm() < 1e-6, "residual {}", r.norm());
    }

    #[test]
    fn test_imu_residual_detects_rotation() {
        let factor = stationary_factor();
        let rotated = Pose::new(
            UnitQuaternion::from_euler_angles(0.0, 0.0, 0.1),
            Vector3::zeros(),
        );
        let mut p_i = [0.0; 7];
        let mut p_j = [0.0; 7];
        Pose::identity().to_vector(&mut p_i);
        rotated.to_vector(&mut p_j);
        let r = factor.residual(&p_i, &[0.0; 9], &p_j, &[0.0; 9]).unwrap();
        assert_relative_eq!(r[2], 0.1, epsilon = 1e-9);
    }

    #[test]
    fn test_linearize_shapes_and_velocity_jacobian() {
        let factor = stationary_factor();
        let params = params_at_rest(Pose::identity());
        let (r, jacs) = factor.linearize(&params).unwrap();
        assert_eq!(r.len(), 15);
        assert_eq!(jacs.len(), 4);
        assert_eq!(jacs[0].ncols(), 6);
        assert_eq!(jacs[1].ncols(), 9);

        // Unwhitened d(r_v)/d(v_j) is the identity at R_i = I.
        let sqrt_info = factor.sqrt_info;
        let inv = sqrt_info.try_inverse().unwrap();
        let raw = DMatrix::from_column_slice(15, 15, inv.as_slice()) * &jacs[3];
        assert_relative_eq!(raw[(3, 0)], 1.0, epsilon = 1e-5);
        assert_relative_eq!(raw[(4, 1)], 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_missing_block() {
        let factor = stationary_factor();
        assert!(matches!(
            factor.weighted_residual(&ParamBlocks::new()),
            Err(MarginalizeError::MissingBlock(_))
        ));
    }
}
