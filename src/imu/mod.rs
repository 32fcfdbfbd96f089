//! Inertial measurement handling: samples, buffers and preintegration.

pub mod preintegration;
pub mod sample;
pub mod state;
pub mod types;

pub use preintegration::{MidpointPreintegrator, PreintegratedState, PreintegrationEngine, Preintegrator};
pub use sample::{GRAVITY, ImuBias, ImuBuffer, ImuNoise, ImuSample};
pub use state::ImuInitState;
