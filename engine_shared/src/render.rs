//! Scene collaborator.
//!
//! The core never builds scene graph objects. It only tells the scene which
//! entity the camera should follow.

use crate::net::EntityId;

/// What the control layer needs from the renderer side.
pub trait SceneCollaborator: Send {
    fn attach_camera(&mut self, entity: EntityId);
}

/// A scene that does nothing, for headless clients and tests.
#[derive(Debug, Default)]
pub struct NullScene {
    camera: Option<EntityId>,
}

impl NullScene {
    /// Entity the camera was last attached to.
    pub fn camera(&self) -> Option<EntityId> {
        self.camera
    }
}

impl SceneCollaborator for NullScene {
    fn attach_camera(&mut self, entity: EntityId) {
        self.camera = Some(entity);
    }
}
