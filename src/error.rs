//! Error types for the estimator core.
//!
//! Insufficient data and numerical degeneracy are recoverable and surface as
//! values; unknown-id errors signal a caller bug but never leave the window
//! in a broken state.

use thiserror::Error;

use crate::optimizer::params::ParamKey;
use crate::types::{AgentId, CamId, FrameId, LandmarkId};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateError {
    #[error("unknown frame {0}")]
    UnknownFrame(FrameId),

    #[error("unknown agent {0}")]
    UnknownAgent(AgentId),

    #[error("unknown landmark {0}")]
    UnknownLandmark(LandmarkId),

    #[error("unknown camera {0}")]
    UnknownCamera(CamId),

    #[error("a solve is in flight, structural changes are rejected until it is synced")]
    SolveInFlight,

    #[error("frame {frame} does not follow last frame {last} of agent {agent}")]
    OutOfOrderFrame {
        agent: AgentId,
        frame: FrameId,
        last: FrameId,
    },

    #[error("frame {frame} belongs to agent {expected}, not {got}")]
    AgentMismatch {
        frame: FrameId,
        expected: AgentId,
        got: AgentId,
    },

    #[error("parameter block {key:?} has {got} elements, expected {expected}")]
    BlockLength {
        key: ParamKey,
        expected: usize,
        got: usize,
    },

    #[error("parameter block {0:?} holds non-finite or degenerate values")]
    InvalidBlock(ParamKey),

    #[error("window index {index} out of range for agent {agent} (size {size})")]
    IndexOutOfRange {
        agent: AgentId,
        index: usize,
        size: usize,
    },

    #[error("operation requires the local agent, got {0}")]
    NotLocalAgent(AgentId),

    #[error(transparent)]
    Solve(#[from] SolveError),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AlignmentError {
    #[error("need at least {required} frames, got {got}")]
    InsufficientFrames { required: usize, got: usize },

    #[error("frame {0} has no motion summary")]
    MissingPreintegration(FrameId),

    #[error("linear system is rank deficient")]
    Degenerate,

    #[error("gravity magnitude {got:.3} deviates from {expected:.3}")]
    GravityMagnitude { got: f64, expected: f64 },

    #[error("negative scale {0:.4}")]
    NegativeScale(f64),

    #[error("no local camera registered")]
    NoLocalCamera,

    #[error("window changed while the alignment was running")]
    StaleWindow,

    #[error(transparent)]
    State(#[from] StateError),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MarginalizeError {
    #[error("marginalized block is singular ({rank}/{dim} informative dimensions)")]
    Singular { rank: usize, dim: usize },

    #[error("marginalization produced non-finite values")]
    NonFinite,

    #[error("factor dimension mismatch on {key:?}: expected {expected}, got {got}")]
    DimensionMismatch {
        key: ParamKey,
        expected: usize,
        got: usize,
    },

    #[error("parameter block {0:?} missing from linearization point")]
    MissingBlock(ParamKey),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SolveError {
    #[error("optimizer did not converge after {iterations} iterations (cost {cost:.4e})")]
    NotConverged { iterations: usize, cost: f64 },

    #[error("optimizer failed: {0}")]
    Failed(String),
}
