//! Core ID types shared by the window, landmark store and parameter blocks.
//!
//! All cross references (landmark → base frame, frame → predecessor, camera →
//! owning agent) are stored as these plain ids and resolved through lookup, so
//! removing an entity on one side is a map removal plus a cleanup pass on the
//! other side.

use serde::Deserialize;

/// Unique identifier for a frame.
///
/// Frame ids are assigned by the front end, are unique across agents and
/// strictly increase with insertion order within one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(pub u64);

impl FrameId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "F{}", self.0)
    }
}

/// Unique identifier for a landmark in the landmark store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LandmarkId(pub u64);

impl LandmarkId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for LandmarkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Identifier of a camera, unique across all agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
pub struct CamId(pub u32);

impl std::fmt::Display for CamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "C{}", self.0)
    }
}

/// Identifier of an agent (drone) contributing frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
pub struct AgentId(pub u32);

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "D{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_id_ordering_follows_value() {
        assert!(FrameId::new(3) < FrameId::new(4));
        assert_eq!(FrameId::new(7), FrameId(7));
    }

    #[test]
    fn test_id_display() {
        assert_eq!(format!("{}", FrameId::new(12)), "F12");
        assert_eq!(format!("{}", LandmarkId::new(5)), "L5");
        assert_eq!(format!("{}", CamId(2)), "C2");
        assert_eq!(format!("{}", AgentId(1)), "D1");
    }

    #[test]
    fn test_id_as_btree_key() {
        use std::collections::BTreeMap;

        let mut map: BTreeMap<LandmarkId, &str> = BTreeMap::new();
        map.insert(LandmarkId::new(9), "late");
        map.insert(LandmarkId::new(1), "early");

        let first = map.keys().next().copied();
        assert_eq!(first, Some(LandmarkId::new(1)));
    }
}
