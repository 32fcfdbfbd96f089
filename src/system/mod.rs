//! Threading around the estimator state.
//!
//! The remote-sync worker applies updates from other agents while the
//! front end and the solver loop use the state directly.

pub mod messages;
pub mod remote_sync;

pub use messages::RemoteMsg;
pub use remote_sync::{ImuBuffers, RemoteSync};
