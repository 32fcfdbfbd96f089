//! Flat parameter blocks exchanged with the optimizer.
//!
//! Block layouts (global / local size):
//!
//! ```text
//! Pose        [tx, ty, tz, qx, qy, qz, qw]             7 / 6   δ = [δp, δθ]
//! SpeedBias   [vx, vy, vz, bax, bay, baz, bgx, bgy, bgz] 9 / 9
//! Extrinsic   [tx, ty, tz, qx, qy, qz, qw]             7 / 6
//! Landmark    [inverse depth in base camera]           1 / 1
//! TimeOffset  [td]                                     1 / 1
//! ```
//!
//! Rotations are perturbed on the right: `q ⊞ δθ = q · Exp(δθ)`.

use std::collections::BTreeMap;

use nalgebra::{DVector, UnitQuaternion, Vector3};

use crate::geometry::Pose;
use crate::types::{AgentId, CamId, FrameId, LandmarkId};

/// Identifies one parameter block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParamKey {
    Pose(FrameId),
    SpeedBias(FrameId),
    Extrinsic(CamId),
    Landmark(LandmarkId),
    TimeOffset(AgentId),
}

impl ParamKey {
    pub fn global_size(&self) -> usize {
        match self {
            ParamKey::Pose(_) | ParamKey::Extrinsic(_) => 7,
            ParamKey::SpeedBias(_) => 9,
            ParamKey::Landmark(_) | ParamKey::TimeOffset(_) => 1,
        }
    }

    pub fn local_size(&self) -> usize {
        match self {
            ParamKey::Pose(_) | ParamKey::Extrinsic(_) => 6,
            ParamKey::SpeedBias(_) => 9,
            ParamKey::Landmark(_) | ParamKey::TimeOffset(_) => 1,
        }
    }

    /// Frame this block belongs to, if any.
    pub fn frame(&self) -> Option<FrameId> {
        match self {
            ParamKey::Pose(f) | ParamKey::SpeedBias(f) => Some(*f),
            _ => None,
        }
    }

    fn is_rigid(&self) -> bool {
        matches!(self, ParamKey::Pose(_) | ParamKey::Extrinsic(_))
    }

    /// `x ⊞ δ`.
    pub fn plus(&self, x: &[f64], delta: &[f64]) -> DVector<f64> {
        if !self.is_rigid() {
            return DVector::from_iterator(x.len(), x.iter().zip(delta).map(|(a, b)| a + b));
        }
        let pose = Pose::from_vector(x).unwrap_or_default();
        let dp = Vector3::new(delta[0], delta[1], delta[2]);
        let dtheta = Vector3::new(delta[3], delta[4], delta[5]);
        let moved = Pose::new(
            pose.rotation * UnitQuaternion::from_scaled_axis(dtheta),
            pose.translation + dp,
        );
        let mut out = DVector::zeros(7);
        moved.to_vector(out.as_mut_slice());
        out
    }

    /// `x1 ⊟ x0` in the local parameterization.
    pub fn minus(&self, x1: &[f64], x0: &[f64]) -> DVector<f64> {
        if !self.is_rigid() {
            return DVector::from_iterator(x1.len(), x1.iter().zip(x0).map(|(a, b)| a - b));
        }
        let p1 = Pose::from_vector(x1).unwrap_or_default();
        let p0 = Pose::from_vector(x0).unwrap_or_default();
        let dp = p1.translation - p0.translation;
        let dtheta = (p0.rotation.inverse() * p1.rotation).scaled_axis();
        DVector::from_column_slice(&[dp.x, dp.y, dp.z, dtheta.x, dtheta.y, dtheta.z])
    }
}

/// Parameter vectors keyed by block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamBlocks {
    blocks: BTreeMap<ParamKey, DVector<f64>>,
}

impl ParamBlocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: ParamKey, values: &[f64]) {
        self.blocks.insert(key, DVector::from_column_slice(values));
    }

    pub fn get(&self, key: &ParamKey) -> Option<&DVector<f64>> {
        self.blocks.get(key)
    }

    pub fn get_mut(&mut self, key: &ParamKey) -> Option<&mut DVector<f64>> {
        self.blocks.get_mut(key)
    }

    pub fn remove(&mut self, key: &ParamKey) -> Option<DVector<f64>> {
        self.blocks.remove(key)
    }

    pub fn contains(&self, key: &ParamKey) -> bool {
        self.blocks.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ParamKey> {
        self.blocks.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ParamKey, &DVector<f64>)> {
        self.blocks.iter()
    }

    /// Drop every block belonging to `frame`.
    pub fn remove_frame(&mut self, frame: FrameId) {
        self.blocks.remove(&ParamKey::Pose(frame));
        self.blocks.remove(&ParamKey::SpeedBias(frame));
    }

    /// Sum of local sizes of `keys`.
    pub fn local_dim<'a, I: IntoIterator<Item = &'a ParamKey>>(keys: I) -> usize {
        keys.into_iter().map(|k| k.local_size()).sum()
    }
}
