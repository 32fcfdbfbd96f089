//! Marginalization of evicted frames into a prior factor.
//!
//! The window manager only sees the [`Marginalizer`] trait. The default
//! [`SchurMarginalizer`] linearizes the inertial factors touching the evicted
//! frame and the reprojections of the landmarks it anchors, stacks them with
//! the current prior and eliminates the evicted blocks with a Schur
//! complement. Anchored landmark depths are eliminated with the frame, so the
//! prior only ever covers frame and extrinsic blocks.

use std::collections::BTreeSet;

use nalgebra::{DMatrix, DVector, SymmetricEigen, Vector3};
use tracing::{debug, warn};

use super::imu_factors::ImuFactor;
use super::params::{ParamBlocks, ParamKey};
use super::prior::PriorFactor;
use super::solver::VisualFactor;
use crate::error::MarginalizeError;
use crate::imu::{ImuNoise, PreintegratedState};
use crate::types::FrameId;

/// Inertial constraint from `from` to `to` (the summary stored on `to`).
#[derive(Debug, Clone)]
pub struct ImuLink {
    pub from: FrameId,
    pub to: FrameId,
    pub preint: PreintegratedState,
}

/// What the window hands over when a frame is evicted.
#[derive(Debug, Clone)]
pub struct MarginalizationRequest {
    pub evicted: FrameId,
    pub evicted_keys: Vec<ParamKey>,
    /// Inertial constraints touching the evicted frame.
    pub links: Vec<ImuLink>,
    /// Reprojections of the landmarks anchored at the evicted frame.
    pub visual: Vec<VisualFactor>,
}

impl MarginalizationRequest {
    pub fn is_empty(&self) -> bool {
        self.links.is_empty() && self.visual.is_empty()
    }
}

/// A whitened residual with one Jacobian block per key.
#[derive(Debug, Clone)]
pub struct LinearizedFactor {
    pub keys: Vec<ParamKey>,
    pub jacobians: Vec<DMatrix<f64>>,
    pub residual: DVector<f64>,
}

/// Linearization of everything the evicted frame takes with it.
#[derive(Debug, Clone)]
pub struct EvictedBlock {
    pub evicted: FrameId,
    pub evicted_keys: Vec<ParamKey>,
    pub factors: Vec<LinearizedFactor>,
}

#[derive(Debug, Clone)]
pub struct MarginalizationOutcome {
    /// `None` when no parameter remains constrained.
    pub prior: Option<PriorFactor>,
    /// Dimensions discarded as uninformative during elimination.
    pub dropped_dims: usize,
}

pub trait Marginalizer: Send + Sync {
    /// Linearize the factors of `request` at `params`.
    fn linearize(
        &self,
        request: &MarginalizationRequest,
        params: &ParamBlocks,
    ) -> Result<EvictedBlock, MarginalizeError>;

    /// Fold `block` and the current prior into a prior over the remaining blocks.
    fn marginalize(
        &self,
        prior: Option<&PriorFactor>,
        block: EvictedBlock,
        params: &ParamBlocks,
    ) -> Result<MarginalizationOutcome, MarginalizeError>;
}

/// Schur-complement marginalizer with eigenvalue thresholding.
#[derive(Debug, Clone)]
pub struct SchurMarginalizer {
    pub noise: ImuNoise,
    pub gravity: Vector3<f64>,
    /// Eigenvalues at or below this are treated as zero.
    pub eigen_threshold: f64,
}

impl SchurMarginalizer {
    pub fn new(noise: ImuNoise, gravity: Vector3<f64>, eigen_threshold: f64) -> Self {
        Self {
            noise,
            gravity,
            eigen_threshold,
        }
    }
}

impl Marginalizer for SchurMarginalizer {
    fn linearize(
        &self,
        request: &MarginalizationRequest,
        params: &ParamBlocks,
    ) -> Result<EvictedBlock, MarginalizeError> {
        let mut factors = Vec::with_capacity(request.links.len() + request.visual.len());
        for link in &request.links {
            let factor = ImuFactor::new(link.from, link.to, link.preint, &self.noise, self.gravity)
                .ok_or(MarginalizeError::Singular { rank: 0, dim: 15 })?;
            let (residual, jacobians) = factor.linearize(params)?;
            factors.push(LinearizedFactor {
                keys: factor.keys().to_vec(),
                jacobians,
                residual,
            });
        }
        for factor in &request.visual {
            match factor.linearize(params) {
                Some((residual, jacobians)) => factors.push(LinearizedFactor {
                    keys: factor.keys(),
                    jacobians,
                    residual,
                }),
                None => debug!(
                    "skipping reprojection of {} into {}",
                    factor.landmark, factor.target.frame_id
                ),
            }
        }
        Ok(EvictedBlock {
            evicted: request.evicted,
            evicted_keys: request.evicted_keys.clone(),
            factors,
        })
    }

    fn marginalize(
        &self,
        prior: Option<&PriorFactor>,
        block: EvictedBlock,
        params: &ParamBlocks,
    ) -> Result<MarginalizationOutcome, MarginalizeError> {
        let mut factors = block.factors;
        if let Some(prior) = prior {
            factors.push(split_prior(prior, params)?);
        }

        let involved: BTreeSet<ParamKey> = factors.iter().flat_map(|f| f.keys.iter().copied()).collect();
        let marg_keys: Vec<ParamKey> = block
            .evicted_keys
            .iter()
            .copied()
            .filter(|k| involved.contains(k))
            .collect();

        if marg_keys.is_empty() {
            debug!("frame {} carries no information, prior unchanged", block.evicted);
            return Ok(MarginalizationOutcome {
                prior: prior.cloned(),
                dropped_dims: 0,
            });
        }

        let keep_keys: Vec<ParamKey> = involved
            .iter()
            .copied()
            .filter(|k| !marg_keys.contains(k))
            .collect();

        // Column layout: [marginalized | kept]
        let mut offsets = Vec::new();
        let mut cursor = 0;
        for key in marg_keys.iter().chain(keep_keys.iter()) {
            offsets.push((*key, cursor));
            cursor += key.local_size();
        }
        let n_total = cursor;
        let n_marg = ParamBlocks::local_dim(&marg_keys);
        let n_keep = n_total - n_marg;
        let offset_of = |key: &ParamKey| {
            offsets
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, o)| *o)
        };

        let mut hessian = DMatrix::<f64>::zeros(n_total, n_total);
        let mut gradient = DVector::<f64>::zeros(n_total);
        for factor in &factors {
            for (a, (key_a, jac_a)) in factor.keys.iter().zip(&factor.jacobians).enumerate() {
                if jac_a.ncols() != key_a.local_size() || jac_a.nrows() != factor.residual.len() {
                    return Err(MarginalizeError::DimensionMismatch {
                        key: *key_a,
                        expected: key_a.local_size(),
                        got: jac_a.ncols(),
                    });
                }
                let oa = offset_of(key_a).ok_or(MarginalizeError::MissingBlock(*key_a))?;
                let ga = jac_a.transpose() * &factor.residual;
                let mut g = gradient.rows_mut(oa, key_a.local_size());
                g += ga;
                for (key_b, jac_b) in factor.keys.iter().zip(&factor.jacobians).skip(a) {
                    let ob = offset_of(key_b).ok_or(MarginalizeError::MissingBlock(*key_b))?;
                    let hab = jac_a.transpose() * jac_b;
                    let mut h = hessian.view_mut((oa, ob), (key_a.local_size(), key_b.local_size()));
                    h += &hab;
                    if oa != ob {
                        let mut h_t = hessian.view_mut((ob, oa), (key_b.local_size(), key_a.local_size()));
                        h_t += hab.transpose();
                    }
                }
            }
        }

        // Pseudo-inverse of the marginalized block.
        let h_mm = symmetrize(hessian.view((0, 0), (n_marg, n_marg)).into_owned());
        let eig = SymmetricEigen::new(h_mm);
        let mut inv_diag = DVector::<f64>::zeros(n_marg);
        let mut rank = 0;
        for (i, &l) in eig.eigenvalues.iter().enumerate() {
            if l > self.eigen_threshold {
                inv_diag[i] = 1.0 / l;
                rank += 1;
            }
        }
        if rank == 0 {
            return Err(MarginalizeError::Singular { rank, dim: n_marg });
        }
        let dropped_dims = n_marg - rank;
        if dropped_dims > 0 {
            warn!(
                "marginalizing frame {}: {} of {} dimensions uninformative",
                block.evicted, dropped_dims, n_marg
            );
        }
        let h_mm_inv = &eig.eigenvectors * DMatrix::from_diagonal(&inv_diag) * eig.eigenvectors.transpose();

        if n_keep == 0 {
            return Ok(MarginalizationOutcome {
                prior: None,
                dropped_dims,
            });
        }

        let h_rm = hessian.view((n_marg, 0), (n_keep, n_marg));
        let h_mr = hessian.view((0, n_marg), (n_marg, n_keep));
        let h_rr = hessian.view((n_marg, n_marg), (n_keep, n_keep));
        let g_m = gradient.rows(0, n_marg);
        let g_r = gradient.rows(n_marg, n_keep);

        let h_rm_inv = h_rm * &h_mm_inv;
        let schur = symmetrize(h_rr - &h_rm_inv * h_mr);
        let g_schur = g_r - &h_rm_inv * g_m;

        // Back to a residual: S = V Λ Vᵀ, J = √Λ Vᵀ, r = √Λ⁻¹ Vᵀ g.
        let eig = SymmetricEigen::new(schur);
        let mut sqrt_l = DVector::<f64>::zeros(n_keep);
        let mut sqrt_l_inv = DVector::<f64>::zeros(n_keep);
        for (i, &l) in eig.eigenvalues.iter().enumerate() {
            if l > self.eigen_threshold {
                sqrt_l[i] = l.sqrt();
                sqrt_l_inv[i] = 1.0 / l.sqrt();
            }
        }
        let v_t = eig.eigenvectors.transpose();
        let jacobian = DMatrix::from_diagonal(&sqrt_l) * &v_t;
        let residual = DMatrix::from_diagonal(&sqrt_l_inv) * &v_t * g_schur;

        let linearization = keep_keys
            .iter()
            .map(|key| {
                params
                    .get(key)
                    .cloned()
                    .ok_or(MarginalizeError::MissingBlock(*key))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let prior = PriorFactor::new(keep_keys, linearization, jacobian, residual)?;
        debug!(
            "marginalized frame {}: prior dim {} -> {}",
            block.evicted,
            n_total,
            prior.dim()
        );
        Ok(MarginalizationOutcome {
            prior: Some(prior),
            dropped_dims,
        })
    }
}

/// Express the prior as a factor evaluated at the current parameters.
fn split_prior(prior: &PriorFactor, params: &ParamBlocks) -> Result<LinearizedFactor, MarginalizeError> {
    let residual = prior.evaluate(params)?;
    let mut jacobians = Vec::with_capacity(prior.keys().len());
    let mut offset = 0;
    for key in prior.keys() {
        jacobians.push(
            prior
                .jacobian()
                .columns(offset, key.local_size())
                .into_owned(),
        );
        offset += key.local_size();
    }
    Ok(LinearizedFactor {
        keys: prior.keys().to_vec(),
        jacobians,
        residual,
    })
}

fn symmetrize(m: DMatrix<f64>) -> DMatrix<f64> {
    (&m + m.transpose()) * 0.5
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FirstFramePriorConfig;
    use crate::geometry::Pose;
    use crate::imu::{GRAVITY, ImuBias, ImuSample, MidpointPreintegrator, PreintegrationEngine};
    use crate::landmark::LandmarkObservation;
    use crate::types::{CamId, LandmarkId};
    use nalgebra::Vector2;

    fn preint() -> PreintegratedState {
        let samples: Vec<ImuSample> = (0..21)
            .map(|i| ImuSample::new(i as f64 * 0.005, -GRAVITY, Vector3::new(0.0, 0.0, 0.1)))
            .collect();
        MidpointPreintegrator::default()
            .integrate(&samples, &ImuBias::zero())
            .unwrap()
    }

    fn params(frames: &[u64]) -> ParamBlocks {
        let mut params = ParamBlocks::new();
        let mut p = [0.0; 7];
        for &f in frames {
            Pose::from_translation(Vector3::new(f as f64 * 0.1, 0.0, 0.0)).to_vector(&mut p);
            params.insert(ParamKey::Pose(FrameId(f)), &p);
            params.insert(ParamKey::SpeedBias(FrameId(f)), &[0.0; 9]);
        }
        params
    }

    fn first_prior(params: &ParamBlocks, frame: u64) -> PriorFactor {
        PriorFactor::for_first_frame(
            FrameId(frame),
            params.get(&ParamKey::Pose(FrameId(frame))).unwrap().as_slice(),
            params.get(&ParamKey::SpeedBias(FrameId(frame))).unwrap().as_slice(),
            &FirstFramePriorConfig::default(),
        )
        .unwrap()
    }

    fn request(evicted: u64, next: u64) -> MarginalizationRequest {
        MarginalizationRequest {
            evicted: FrameId(evicted),
            evicted_keys: vec![ParamKey::Pose(FrameId(evicted)), ParamKey::SpeedBias(FrameId(evicted))],
            links: vec![ImuLink {
                from: FrameId(evicted),
                to: FrameId(next),
                preint: preint(),
            }],
            visual: Vec::new(),
        }
    }

    #[test]
    fn test_marginalize_oldest_moves_prior_forward() {
        let params = params(&[1, 2, 3]);
        let prior = first_prior(&params, 1);
        let marginalizer = SchurMarginalizer::new(ImuNoise::default(), GRAVITY, 1e-8);

        let block = marginalizer.linearize(&request(1, 2), &params).unwrap();
        let outcome = marginalizer.marginalize(Some(&prior), block, &params).unwrap();
        let new_prior = outcome.prior.unwrap();

        assert_eq!(new_prior.dim(), 15);
        assert_eq!(
            new_prior.keys(),
            &[ParamKey::Pose(FrameId(2)), ParamKey::SpeedBias(FrameId(2))]
        );
        assert!(new_prior.is_finite());
        assert_eq!(outcome.dropped_dims, 0);
    }

    #[test]
    fn test_anchored_landmark_is_eliminated_with_its_base() {
        let mut params = params(&[1, 2, 3]);
        let mut e = [0.0; 7];
        Pose::identity().to_vector(&mut e);
        params.insert(ParamKey::Extrinsic(CamId(0)), &e);
        // Point (0.2, 0.1, 2.0) seen from bodies at x = 0.1, 0.2, 0.3.
        params.insert(ParamKey::Landmark(LandmarkId(5)), &[0.5]);
        let obs = |frame: u64, x: f64| {
            LandmarkObservation::new(LandmarkId(5), FrameId(frame), CamId(0), Vector2::new(x, 0.05), 0.0)
        };
        let visual: Vec<VisualFactor> = [(2, 0.0), (3, -0.05)]
            .iter()
            .map(|&(frame, x)| VisualFactor {
                landmark: LandmarkId(5),
                base: obs(1, 0.05),
                target: obs(frame, x),
                weight: 300.0,
            })
            .collect();
        assert!(visual.iter().all(|f| f.residual(&params).unwrap().norm() < 1e-12));

        let mut request = request(1, 2);
        request.evicted_keys.push(ParamKey::Landmark(LandmarkId(5)));
        request.visual = visual;
        let marginalizer = SchurMarginalizer::new(ImuNoise::default(), GRAVITY, 1e-8);
        let block = marginalizer.linearize(&request, &params).unwrap();
        assert_eq!(block.factors.len(), 3);
        let prior = first_prior(&params, 1);
        let new_prior = marginalizer
            .marginalize(Some(&prior), block, &params)
            .unwrap()
            .prior
            .unwrap();

        assert!(new_prior.contains(&ParamKey::Pose(FrameId(3))));
        assert!(new_prior.contains(&ParamKey::Extrinsic(CamId(0))));
        assert!(!new_prior.contains(&ParamKey::Landmark(LandmarkId(5))));
        assert!(!new_prior.contains(&ParamKey::Pose(FrameId(1))));
        assert_eq!(new_prior.dim(), 6 + 9 + 6 + 6);
        assert!(new_prior.is_finite());
    }

    #[test]
    fn test_repeated_marginalization_keeps_dimension() {
        let params = params(&[1, 2, 3, 4, 5]);
        let marginalizer = SchurMarginalizer::new(ImuNoise::default(), GRAVITY, 1e-8);
        let mut prior = first_prior(&params, 1);
        for f in 1..5 {
            let block = marginalizer.linearize(&request(f, f + 1), &params).unwrap();
            prior = marginalizer
                .marginalize(Some(&prior), block, &params)
                .unwrap()
                .prior
                .unwrap();
            assert_eq!(prior.dim(), 15);
        }
    }

    #[test]
    fn test_unconstrained_frame_leaves_prior_untouched() {
        let params = params(&[1, 2, 3]);
        let prior = first_prior(&params, 1);
        let marginalizer = SchurMarginalizer::new(ImuNoise::default(), GRAVITY, 1e-8);
        let block = EvictedBlock {
            evicted: FrameId(2),
            evicted_keys: vec![ParamKey::Pose(FrameId(2)), ParamKey::SpeedBias(FrameId(2))],
            factors: Vec::new(),
        };
        let outcome = marginalizer.marginalize(Some(&prior), block, &params).unwrap();
        assert_eq!(outcome.prior, Some(prior));
    }

    #[test]
    fn test_zero_information_is_singular() {
        let params = params(&[1]);
        let marginalizer = SchurMarginalizer::new(ImuNoise::default(), GRAVITY, 1e-8);
        let key = ParamKey::Pose(FrameId(1));
        let block = EvictedBlock {
            evicted: FrameId(1),
            evicted_keys: vec![key],
            factors: vec![LinearizedFactor {
                keys: vec![key],
                jacobians: vec![DMatrix::zeros(6, 6)],
                residual: DVector::zeros(6),
            }],
        };
        assert_eq!(
            marginalizer.marginalize(None, block, &params).err(),
            Some(MarginalizeError::Singular { rank: 0, dim: 6 })
        );
    }
}
