//! IMU initialization state tracking.

/// State of the visual-inertial bootstrap for the local agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImuInitState {
    /// Waiting for enough keyframes with motion summaries.
    #[default]
    NotInitialized,
    /// Alignment in progress (gyro bias, velocities, gravity, scale).
    Initializing,
    /// Alignment committed; the window is metric and gravity-aligned.
    Initialized,
}

impl ImuInitState {
    pub fn is_initialized(&self) -> bool {
        matches!(self, Self::Initialized)
    }
}
