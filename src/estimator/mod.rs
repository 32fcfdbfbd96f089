//! Multi-agent sliding-window state.
//!
//! - [`frame`]: per-frame kinematic state and its parameter-block layout
//! - [`sliding_window`]: ordered frame container of one agent
//! - [`camera`]: extrinsic registry
//! - [`state`]: the shared [`EstimatorState`] and its accessors
//! - [`eviction`]: window trimming and marginalization
//! - [`solve`]: optimizer round-trip and outlier rejection

pub mod camera;
mod eviction;
pub mod frame;
pub mod sliding_window;
mod solve;
pub mod state;

pub use camera::{CameraExtrinsic, CameraRegistry};
pub use frame::{ImuSlice, SPEED_BIAS_SIZE, VinsFrame, VisualFrameDesc};
pub use sliding_window::SlidingWindow;
pub use state::{EstimatorState, MarginalizationStats};
