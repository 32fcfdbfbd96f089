//! Optimizer contract and a dense damped Gauss-Newton implementation.
//!
//! The estimator exports an [`OptimizationProblem`] (parameter blocks plus
//! factor definitions), hands it to an [`Optimizer`] and imports the solved
//! blocks back. Residuals are whitened; Jacobians are numeric.

use std::collections::{BTreeMap, BTreeSet};

use nalgebra::{DMatrix, DVector, Vector2};
use tracing::debug;

use super::imu_factors::ImuFactor;
use super::params::{ParamBlocks, ParamKey};
use super::prior::PriorFactor;
use crate::error::SolveError;
use crate::geometry::Pose;
use crate::landmark::LandmarkObservation;
use crate::types::LandmarkId;

/// Step used for central-difference Jacobians.
const NUMERIC_STEP: f64 = 1e-7;

/// Reprojection of a landmark from its base camera into another observation.
#[derive(Debug, Clone)]
pub struct VisualFactor {
    pub landmark: LandmarkId,
    pub base: LandmarkObservation,
    pub target: LandmarkObservation,
    /// Square-root information of the normalized-plane residual.
    pub weight: f64,
}

impl VisualFactor {
    pub fn keys(&self) -> Vec<ParamKey> {
        let mut keys = vec![
            ParamKey::Pose(self.base.frame_id),
            ParamKey::Extrinsic(self.base.camera_id),
            ParamKey::Landmark(self.landmark),
        ];
        for key in [
            ParamKey::Pose(self.target.frame_id),
            ParamKey::Extrinsic(self.target.camera_id),
        ] {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }

    /// Unweighted normalized-plane residual.
    pub fn residual(&self, params: &ParamBlocks) -> Option<Vector2<f64>> {
        let block = |key: ParamKey| params.get(&key).map(|v| v.as_slice());
        let pose_i = Pose::from_vector(block(ParamKey::Pose(self.base.frame_id))?)?;
        let ext_i = Pose::from_vector(block(ParamKey::Extrinsic(self.base.camera_id))?)?;
        let pose_j = Pose::from_vector(block(ParamKey::Pose(self.target.frame_id))?)?;
        let ext_j = Pose::from_vector(block(ParamKey::Extrinsic(self.target.camera_id))?)?;
        let inv_depth = *block(ParamKey::Landmark(self.landmark))?.first()?;
        if inv_depth <= 0.0 {
            return None;
        }

        let p_world = (pose_i * ext_i).transform_point(&(self.base.normalized / inv_depth));
        let p_cam = (pose_j * ext_j).inverse().transform_point(&p_world);
        if p_cam.z <= 1e-6 {
            return None;
        }
        Some(Vector2::new(
            p_cam.x / p_cam.z - self.target.normalized.x,
            p_cam.y / p_cam.z - self.target.normalized.y,
        ))
    }

    /// Weighted residual and one central-difference Jacobian per key of
    /// [`Self::keys`].
    pub fn linearize(&self, params: &ParamBlocks) -> Option<(DVector<f64>, Vec<DMatrix<f64>>)> {
        let r0 = self.residual(params)? * self.weight;
        let mut work = params.clone();
        let mut jacobians = Vec::new();
        for key in self.keys() {
            let x = params.get(&key)?.clone();
            let n = key.local_size();
            let mut jac = DMatrix::zeros(2, n);
            for c in 0..n {
                let mut delta = vec![0.0; n];
                delta[c] = NUMERIC_STEP;
                work.insert(key, key.plus(x.as_slice(), &delta).as_slice());
                let rp = self.residual(&work);
                delta[c] = -NUMERIC_STEP;
                work.insert(key, key.plus(x.as_slice(), &delta).as_slice());
                let rm = self.residual(&work);
                work.insert(key, x.as_slice());
                let col = (rp? - rm?) * (self.weight / (2.0 * NUMERIC_STEP));
                jac.column_mut(c).copy_from_slice(col.as_slice());
            }
            jacobians.push(jac);
        }
        Some((DVector::from_column_slice(r0.as_slice()), jacobians))
    }
}

/// Everything one optimizer pass needs.
#[derive(Debug, Clone, Default)]
pub struct OptimizationProblem {
    pub params: ParamBlocks,
    pub prior: Option<PriorFactor>,
    pub imu_factors: Vec<ImuFactor>,
    pub visual_factors: Vec<VisualFactor>,
    /// Landmarks whose blocks are part of this problem.
    pub landmarks: BTreeSet<LandmarkId>,
    /// Blocks held constant.
    pub fixed: BTreeSet<ParamKey>,
}

impl OptimizationProblem {
    fn residual_blocks(&self) -> Vec<ResidualBlock<'_>> {
        let mut blocks = Vec::new();
        if let Some(prior) = &self.prior {
            blocks.push(ResidualBlock::Prior(prior));
        }
        blocks.extend(self.imu_factors.iter().map(ResidualBlock::Imu));
        blocks.extend(self.visual_factors.iter().map(ResidualBlock::Visual));
        blocks
    }

    /// Half the squared norm of all whitened residuals.
    pub fn cost(&self, params: &ParamBlocks) -> Option<f64> {
        self.residual_blocks()
            .iter()
            .map(|b| b.evaluate(params).map(|r| 0.5 * r.norm_squared()))
            .sum()
    }

    /// Blocks that are touched by a factor and not fixed.
    pub fn free_keys(&self) -> Vec<ParamKey> {
        let keys: BTreeSet<ParamKey> = self
            .residual_blocks()
            .iter()
            .flat_map(|b| b.keys())
            .filter(|k| !self.fixed.contains(k) && self.params.contains(k))
            .collect();
        keys.into_iter().collect()
    }
}

enum ResidualBlock<'a> {
    Prior(&'a PriorFactor),
    Imu(&'a ImuFactor),
    Visual(&'a VisualFactor),
}

impl ResidualBlock<'_> {
    fn keys(&self) -> Vec<ParamKey> {
        match self {
            ResidualBlock::Prior(p) => p.keys().to_vec(),
            ResidualBlock::Imu(f) => f.keys().to_vec(),
            ResidualBlock::Visual(f) => f.keys(),
        }
    }

    fn evaluate(&self, params: &ParamBlocks) -> Option<DVector<f64>> {
        let r = match self {
            ResidualBlock::Prior(p) => p.evaluate(params).ok()?,
            ResidualBlock::Imu(f) => {
                let r = f.weighted_residual(params).ok()?;
                DVector::from_column_slice(r.as_slice())
            }
            ResidualBlock::Visual(f) => {
                let r = f.residual(params)? * f.weight;
                DVector::from_column_slice(r.as_slice())
            }
        };
        r.iter().all(|v| v.is_finite()).then_some(r)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolveReport {
    pub iterations: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
    pub converged: bool,
}

/// Solves an [`OptimizationProblem`] in place.
pub trait Optimizer: Send + Sync {
    fn solve(&self, problem: &mut OptimizationProblem) -> Result<SolveReport, SolveError>;
}

/// Levenberg-style damped Gauss-Newton over a dense normal system.
#[derive(Debug, Clone, Copy)]
pub struct DenseGaussNewton {
    pub max_iterations: usize,
    pub initial_lambda: f64,
    /// Relative cost decrease below which the solve is converged.
    pub tolerance: f64,
}

impl Default for DenseGaussNewton {
    fn default() -> Self {
        Self {
            max_iterations: 8,
            initial_lambda: 1e-4,
            tolerance: 1e-6,
        }
    }
}

impl DenseGaussNewton {
    fn normal_equations(
        problem: &OptimizationProblem,
        params: &ParamBlocks,
        columns: &BTreeMap<ParamKey, usize>,
        dim: usize,
    ) -> Result<(DMatrix<f64>, DVector<f64>), SolveError> {
        let mut h = DMatrix::<f64>::zeros(dim, dim);
        let mut g = DVector::<f64>::zeros(dim);
        // Perturbed copy; every block is restored after its columns are taken.
        let mut work = params.clone();

        for block in problem.residual_blocks() {
            let r0 = block
                .evaluate(params)
                .ok_or_else(|| SolveError::Failed("residual not evaluable".into()))?;
            let mut local: Vec<(usize, DMatrix<f64>)> = Vec::new();
            for key in block.keys() {
                let Some(&col) = columns.get(&key) else {
                    continue;
                };
                let Some(x) = params.get(&key) else {
                    continue;
                };
                let n = key.local_size();
                let mut jac = DMatrix::zeros(r0.len(), n);
                for c in 0..n {
                    let mut delta = vec![0.0; n];
                    delta[c] = NUMERIC_STEP;
                    work.insert(key, key.plus(x.as_slice(), &delta).as_slice());
                    let rp = block.evaluate(&work);
                    delta[c] = -NUMERIC_STEP;
                    work.insert(key, key.plus(x.as_slice(), &delta).as_slice());
                    let rm = block.evaluate(&work);
                    work.insert(key, x.as_slice());
                    let (Some(rp), Some(rm)) = (rp, rm) else {
                        return Err(SolveError::Failed(format!("residual undefined around {:?}", key)));
                    };
                    jac.column_mut(c).copy_from(&((rp - rm) / (2.0 * NUMERIC_STEP)));
                }
                local.push((col, jac));
            }
            for (ca, ja) in &local {
                let mut gs = g.rows_mut(*ca, ja.ncols());
                gs += ja.transpose() * &r0;
                for (cb, jb) in &local {
                    let mut hs = h.view_mut((*ca, *cb), (ja.ncols(), jb.ncols()));
                    hs += ja.transpose() * jb;
                }
            }
        }
        Ok((h, g))
    }

    fn apply_step(
        params: &ParamBlocks,
        columns: &BTreeMap<ParamKey, usize>,
        dx: &DVector<f64>,
    ) -> ParamBlocks {
        let mut out = params.clone();
        for (key, &col) in columns {
            if let Some(x) = params.get(key) {
                let delta = dx.rows(col, key.local_size());
                out.insert(*key, key.plus(x.as_slice(), delta.as_slice()).as_slice());
            }
        }
        out
    }
}

impl Optimizer for DenseGaussNewton {
    fn solve(&self, problem: &mut OptimizationProblem) -> Result<SolveReport, SolveError> {
        let free = problem.free_keys();
        let mut columns = BTreeMap::new();
        let mut dim = 0;
        for key in &free {
            columns.insert(*key, dim);
            dim += key.local_size();
        }

        let mut params = problem.params.clone();
        let initial_cost = problem
            .cost(&params)
            .ok_or_else(|| SolveError::Failed("initial cost not evaluable".into()))?;
        let mut cost = initial_cost;
        let mut lambda = self.initial_lambda;
        let mut converged = dim == 0 || cost == 0.0;
        let mut iterations = 0;
        let mut accepted = 0;

        while !converged && iterations < self.max_iterations {
            iterations += 1;
            let (h, g) = Self::normal_equations(problem, &params, &columns, dim)?;

            let mut damped = h.clone();
            for i in 0..dim {
                damped[(i, i)] += lambda * h[(i, i)].max(1e-9);
            }
            let Some(chol) = damped.cholesky() else {
                lambda *= 10.0;
                continue;
            };
            let dx = -chol.solve(&g);
            if dx.iter().any(|v| !v.is_finite()) {
                return Err(SolveError::Failed("non-finite step".into()));
            }

            let candidate = Self::apply_step(&params, &columns, &dx);
            match problem.cost(&candidate) {
                Some(new_cost) if new_cost < cost => {
                    let rel = (cost - new_cost) / cost.max(f64::EPSILON);
                    params = candidate;
                    cost = new_cost;
                    lambda = (lambda * 0.1).max(1e-12);
                    accepted += 1;
                    converged = rel < self.tolerance;
                }
                _ => {
                    lambda *= 10.0;
                }
            }
        }

        if accepted == 0 && !converged {
            return Err(SolveError::NotConverged { iterations, cost });
        }

        debug!(
            "solve: {} iterations, cost {:.4e} -> {:.4e}",
            iterations, initial_cost, cost
        );
        problem.params = params;
        Ok(SolveReport {
            iterations,
            initial_cost,
            final_cost: cost,
            converged,
        })
    }
}
