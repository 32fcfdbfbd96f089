//! Prior factor left behind by marginalization.
//!
//! The factor is the linearized residual `r(x) = r₀ + J · (x ⊟ x₀)` over the
//! blocks that remain in the problem. `x₀` is the linearization point stored
//! per block; `J` has one column group per key, in key order.

use nalgebra::{DMatrix, DVector};

use super::params::{ParamBlocks, ParamKey};
use crate::config::FirstFramePriorConfig;
use crate::error::MarginalizeError;
use crate::types::FrameId;

#[derive(Debug, Clone, PartialEq)]
pub struct PriorFactor {
    keys: Vec<ParamKey>,
    linearization: Vec<DVector<f64>>,
    jacobian: DMatrix<f64>,
    residual: DVector<f64>,
}

impl PriorFactor {
    pub fn new(
        keys: Vec<ParamKey>,
        linearization: Vec<DVector<f64>>,
        jacobian: DMatrix<f64>,
        residual: DVector<f64>,
    ) -> Result<Self, MarginalizeError> {
        for (key, x0) in keys.iter().zip(&linearization) {
            if x0.len() != key.global_size() {
                return Err(MarginalizeError::DimensionMismatch {
                    key: *key,
                    expected: key.global_size(),
                    got: x0.len(),
                });
            }
        }
        let dim = ParamBlocks::local_dim(&keys);
        if keys.len() != linearization.len()
            || jacobian.ncols() != dim
            || jacobian.nrows() != residual.len()
        {
            return Err(MarginalizeError::DimensionMismatch {
                key: keys.first().copied().unwrap_or(ParamKey::Pose(FrameId(0))),
                expected: dim,
                got: jacobian.ncols(),
            });
        }
        let prior = Self {
            keys,
            linearization,
            jacobian,
            residual,
        };
        if !prior.is_finite() {
            return Err(MarginalizeError::NonFinite);
        }
        Ok(prior)
    }

    /// Weak prior anchoring the first frame of a window at its current state.
    pub fn for_first_frame(
        frame: FrameId,
        pose: &[f64],
        speed_bias: &[f64],
        weights: &FirstFramePriorConfig,
    ) -> Result<Self, MarginalizeError> {
        let diag = [
            weights.position,
            weights.position,
            weights.position,
            weights.tilt,
            weights.tilt,
            weights.yaw,
            weights.velocity,
            weights.velocity,
            weights.velocity,
            weights.accel_bias,
            weights.accel_bias,
            weights.accel_bias,
            weights.gyro_bias,
            weights.gyro_bias,
            weights.gyro_bias,
        ];
        Self::new(
            vec![ParamKey::Pose(frame), ParamKey::SpeedBias(frame)],
            vec![
                DVector::from_column_slice(pose),
                DVector::from_column_slice(speed_bias),
            ],
            DMatrix::from_diagonal(&DVector::from_column_slice(&diag)),
            DVector::zeros(diag.len()),
        )
    }

    pub fn keys(&self) -> &[ParamKey] {
        &self.keys
    }

    pub fn contains(&self, key: &ParamKey) -> bool {
        self.keys.contains(key)
    }

    /// Parameter dimension (sum of local block sizes).
    pub fn dim(&self) -> usize {
        self.jacobian.ncols()
    }

    pub fn jacobian(&self) -> &DMatrix<f64> {
        &self.jacobian
    }

    pub fn residual(&self) -> &DVector<f64> {
        &self.residual
    }

    pub fn linearization_of(&self, key: &ParamKey) -> Option<&DVector<f64>> {
        self.keys
            .iter()
            .position(|k| k == key)
            .map(|i| &self.linearization[i])
    }

    /// Column offset of `key` in the Jacobian.
    pub fn offset(&self, key: &ParamKey) -> Option<usize> {
        let mut offset = 0;
        for k in &self.keys {
            if k == key {
                return Some(offset);
            }
            offset += k.local_size();
        }
        None
    }

    /// Residual at the current parameter values.
    pub fn evaluate(&self, params: &ParamBlocks) -> Result<DVector<f64>, MarginalizeError> {
        let mut dx = DVector::zeros(self.dim());
        let mut offset = 0;
        for (key, x0) in self.keys.iter().zip(&self.linearization) {
            let x = params
                .get(key)
                .ok_or(MarginalizeError::MissingBlock(*key))?;
            let d = key.minus(x.as_slice(), x0.as_slice());
            dx.rows_mut(offset, key.local_size()).copy_from(&d);
            offset += key.local_size();
        }
        Ok(&self.residual + &self.jacobian * dx)
    }

    pub fn cost(&self, params: &ParamBlocks) -> Result<f64, MarginalizeError> {
        Ok(0.5 * self.evaluate(params)?.norm_squared())
    }

    /// `JᵀJ`.
    pub fn information(&self) -> DMatrix<f64> {
        self.jacobian.transpose() * &self.jacobian
    }

    pub fn is_finite(&self) -> bool {
        self.jacobian.iter().all(|v| v.is_finite())
            && self.residual.iter().all(|v| v.is_finite())
            && self
                .linearization
                .iter()
                .all(|x| x.iter().all(|v| v.is_finite()))
    }

    /// Drop the columns of `keys`, holding them at their linearization point.
    ///
    /// Returns `None` when no block remains.
    pub fn remove_blocks(&self, keys: &[ParamKey]) -> Option<PriorFactor> {
        if !self.keys.iter().any(|k| keys.contains(k)) {
            return Some(self.clone());
        }
        let mut kept_keys = Vec::new();
        let mut kept_lin = Vec::new();
        let mut columns = Vec::new();
        let mut offset = 0;
        for (key, x0) in self.keys.iter().zip(&self.linearization) {
            if !keys.contains(key) {
                kept_keys.push(*key);
                kept_lin.push(x0.clone());
                columns.extend(offset..offset + key.local_size());
            }
            offset += key.local_size();
        }
        if kept_keys.is_empty() {
            return None;
        }
        let jacobian = self.jacobian.select_columns(columns.iter());
        Some(Self {
            keys: kept_keys,
            linearization: kept_lin,
            jacobian,
            residual: self.residual.clone(),
        })
    }
}
