//! Messages delivered by remote agents.

use crate::imu::ImuSample;
use crate::types::{AgentId, FrameId};

/// Update received from another agent over the swarm link.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteMsg {
    /// The remote agent's current window, oldest first.
    Window { agent: AgentId, frame_ids: Vec<FrameId> },

    /// A batch of the remote agent's raw IMU samples.
    Imu { agent: AgentId, samples: Vec<ImuSample> },
}

impl RemoteMsg {
    pub fn agent(&self) -> AgentId {
        match self {
            RemoteMsg::Window { agent, .. } | RemoteMsg::Imu { agent, .. } => *agent,
        }
    }
}
