//! Camera extrinsics shared by every frame of the owning agent.

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::StateError;
use crate::geometry::Pose;
use crate::types::{AgentId, CamId};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraExtrinsic {
    /// Camera-to-body transform.
    pub pose: Pose,
    pub agent: AgentId,
    /// Index of the camera on its agent (0 = left / mono).
    pub camera_index: usize,
    /// Estimated locally, as opposed to reported by a remote agent.
    pub is_local: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CameraRegistry {
    cameras: BTreeMap<CamId, CameraExtrinsic>,
    local_agent: AgentId,
}

impl CameraRegistry {
    pub fn new(local_agent: AgentId) -> Self {
        Self {
            cameras: BTreeMap::new(),
            local_agent,
        }
    }

    /// Register a camera, allocating the next free id when `id` is `None`.
    ///
    /// Re-registering an id replaces its extrinsic.
    pub fn add_camera(
        &mut self,
        pose: Pose,
        camera_index: usize,
        agent: AgentId,
        id: Option<CamId>,
    ) -> CamId {
        let id = id.unwrap_or_else(|| {
            self.cameras
                .keys()
                .next_back()
                .map_or(CamId(0), |last| CamId(last.0 + 1))
        });
        let is_local = agent == self.local_agent;
        self.cameras.insert(
            id,
            CameraExtrinsic {
                pose,
                agent,
                camera_index,
                is_local,
            },
        );
        debug!("camera {} on {} (index {}, local {})", id, agent, camera_index, is_local);
        id
    }

    pub fn get(&self, id: CamId) -> Option<&CameraExtrinsic> {
        self.cameras.get(&id)
    }

    pub fn extrinsic(&self, id: CamId) -> Result<Pose, StateError> {
        self.cameras
            .get(&id)
            .map(|c| c.pose)
            .ok_or(StateError::UnknownCamera(id))
    }

    pub fn set_extrinsic(&mut self, id: CamId, pose: Pose) -> Result<(), StateError> {
        let cam = self.cameras.get_mut(&id).ok_or(StateError::UnknownCamera(id))?;
        cam.pose = pose;
        Ok(())
    }

    pub fn camera_belonging(&self, id: CamId) -> Option<AgentId> {
        self.cameras.get(&id).map(|c| c.agent)
    }

    pub fn has_camera(&self, id: CamId) -> bool {
        self.cameras.contains_key(&id)
    }

    /// Extrinsics of the locally estimated cameras, ordered by camera index.
    pub fn local_camera_extrinsics(&self) -> Vec<(CamId, Pose)> {
        let mut local: Vec<(usize, CamId, Pose)> = self
            .cameras
            .iter()
            .filter(|(_, c)| c.is_local)
            .map(|(id, c)| (c.camera_index, *id, c.pose))
            .collect();
        local.sort_by_key(|(index, id, _)| (*index, *id));
        local.into_iter().map(|(_, id, pose)| (id, pose)).collect()
    }

    pub fn available_camera_ids(&self) -> Vec<CamId> {
        self.cameras.keys().copied().collect()
    }

    /// First camera of `agent`.
    pub fn main_camera_of(&self, agent: AgentId) -> Option<CamId> {
        self.cameras
            .iter()
            .filter(|(_, c)| c.agent == agent)
            .min_by_key(|(id, c)| (c.camera_index, **id))
            .map(|(id, _)| *id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CamId, &CameraExtrinsic)> {
        self.cameras.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    #[test]
    fn test_add_camera_allocates_ids() {
        let mut reg = CameraRegistry::new(AgentId(0));
        let a = reg.add_camera(Pose::identity(), 0, AgentId(0), None);
        let b = reg.add_camera(Pose::identity(), 1, AgentId(0), None);
        let remote = reg.add_camera(Pose::identity(), 0, AgentId(2), Some(CamId(10)));
        assert_eq!((a, b, remote), (CamId(0), CamId(1), CamId(10)));
        assert_eq!(reg.available_camera_ids(), vec![CamId(0), CamId(1), CamId(10)]);
        assert_eq!(reg.camera_belonging(CamId(10)), Some(AgentId(2)));
        assert!(!reg.get(CamId(10)).unwrap().is_local);
        assert_eq!(reg.main_camera_of(AgentId(2)), Some(CamId(10)));
    }

    #[test]
    fn test_default_registry_belongs_to_agent_zero() {
        let mut reg = CameraRegistry::default();
        assert!(reg.available_camera_ids().is_empty());
        let id = reg.add_camera(Pose::identity(), 0, AgentId(0), None);
        assert!(reg.get(id).unwrap().is_local);
        assert_eq!(reg.local_camera_extrinsics().len(), 1);
    }

    #[test]
    fn test_local_extrinsics_ordered_by_index() {
        let mut reg = CameraRegistry::new(AgentId(0));
        let right = Pose::from_translation(Vector3::new(0.1, 0.0, 0.0));
        reg.add_camera(right, 1, AgentId(0), Some(CamId(4)));
        reg.add_camera(Pose::identity(), 0, AgentId(0), Some(CamId(7)));
        reg.add_camera(Pose::identity(), 0, AgentId(1), Some(CamId(2)));

        let local = reg.local_camera_extrinsics();
        assert_eq!(local.len(), 2);
        assert_eq!(local[0].0, CamId(7));
        assert_eq!(local[1], (CamId(4), right));
    }

    #[test]
    fn test_unknown_camera() {
        let mut reg = CameraRegistry::new(AgentId(0));
        assert!(!reg.has_camera(CamId(3)));
        assert_eq!(reg.extrinsic(CamId(3)), Err(StateError::UnknownCamera(CamId(3))));
        assert_eq!(
            reg.set_extrinsic(CamId(3), Pose::identity()),
            Err(StateError::UnknownCamera(CamId(3)))
        );
    }
}
