//! Game entities as seen by the control layer.
//!
//! An entity owns its `ActionState` and, optionally, a physics body and an
//! `InputSink`. Local changes to the action state are pushed to the sink
//! exactly once per observable change; server-authoritative updates are not.

use std::sync::{Arc, Mutex, MutexGuard};

use engine_shared::{
    actions::{ActionFrame, ActionState},
    bindings::{Device, WireId},
    net::{endpoints, EntityId, InputMessage},
    physics::{self, PhysicsBody, PhysicsSnapshot},
    resources::Model,
};
use tracing::{trace, warn};

use crate::session::NetworkSession;

/// Receives an entity's input whenever it changes.
pub trait InputSink: Send {
    fn input_changed(&mut self, entity: EntityId, actions: &ActionState, body: Option<&PhysicsBody>);
}

/// Shared handle; the dispatcher and the client both hold one.
pub type EntityHandle = Arc<Mutex<GameEntity>>;

/// Locks an entity handle, recovering from poisoning.
pub fn lock(handle: &EntityHandle) -> MutexGuard<'_, GameEntity> {
    handle.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct GameEntity {
    id: EntityId,
    kind: String,
    actions: Option<ActionState>,
    body: Option<PhysicsBody>,
    model: Option<Model>,
    sink: Option<Box<dyn InputSink>>,
}

impl GameEntity {
    /// A controllable entity with an empty action state.
    pub fn new(id: EntityId, kind: impl Into<String>) -> Self {
        Self {
            id,
            kind: kind.into(),
            actions: Some(ActionState::new()),
            body: None,
            model: None,
            sink: None,
        }
    }

    /// An entity that cannot receive input (scenery, projectiles).
    pub fn inert(id: EntityId, kind: impl Into<String>) -> Self {
        Self {
            actions: None,
            ..Self::new(id, kind)
        }
    }

    pub fn with_body(mut self, body: PhysicsBody) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_sink(mut self, sink: impl InputSink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    pub fn into_handle(self) -> EntityHandle {
        Arc::new(Mutex::new(self))
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn has_actions(&self) -> bool {
        self.actions.is_some()
    }

    pub fn actions(&self) -> Option<&ActionState> {
        self.actions.as_ref()
    }

    pub fn body(&self) -> Option<&PhysicsBody> {
        self.body.as_ref()
    }

    pub fn body_mut(&mut self) -> Option<&mut PhysicsBody> {
        self.body.as_mut()
    }

    pub fn model(&self) -> Option<&Model> {
        self.model.as_ref()
    }

    pub fn set_model(&mut self, model: Model) {
        self.model = Some(model);
    }

    pub fn set_device(&mut self, device: Device) {
        if let Some(actions) = self.actions.as_mut() {
            actions.set_device(device);
        }
    }

    /// Sets one action. Propagates to the sink only if the value changed.
    pub fn set_action(&mut self, action: WireId, value: f32) -> bool {
        let Some(actions) = self.actions.as_mut() else {
            return false;
        };
        if !actions.set_action(action, value) {
            return false;
        }
        trace!(entity = ?self.id, action, value, "Action changed");
        self.propagate();
        true
    }

    pub fn get_action_value(&self, action: WireId) -> f32 {
        self.actions
            .as_ref()
            .map_or(0.0, |a| a.get_action_value(action))
    }

    /// Accumulates pointer motion. Sent along with the next input change.
    pub fn add_mouse_movement(&mut self, dx: f32, dy: f32) {
        if let Some(actions) = self.actions.as_mut() {
            actions.add_mouse_movement(dx, dy);
        }
    }

    pub fn mouse_movement(&self) -> [f32; 2] {
        self.actions
            .as_ref()
            .map_or([0.0, 0.0], ActionState::mouse_movement)
    }

    /// Clears all actions and mouse movement, then propagates.
    pub fn clear_input(&mut self) {
        let Some(actions) = self.actions.as_mut() else {
            return;
        };
        actions.clear();
        self.propagate();
    }

    /// Overwrites the action state with a server-authoritative frame.
    pub fn apply_remote_input(&mut self, frame: &ActionFrame) -> bool {
        self.actions
            .as_mut()
            .is_some_and(|actions| actions.apply_frame(frame))
    }

    /// Writes an authoritative snapshot onto the body, creating it if needed.
    pub fn apply_snapshot(&mut self, snapshot: Option<&PhysicsSnapshot>) -> anyhow::Result<()> {
        let Some(snapshot) = snapshot else {
            return Ok(());
        };
        match self.body.as_mut() {
            Some(body) => physics::decode(Some(snapshot), body),
            None => {
                self.body = Some(PhysicsBody::from_snapshot(snapshot)?);
                Ok(())
            }
        }
    }

    fn propagate(&mut self) {
        let (Some(sink), Some(actions)) = (self.sink.as_mut(), self.actions.as_ref()) else {
            return;
        };
        sink.input_changed(self.id, actions, self.body.as_ref());
    }
}

/// Sends input to the server on the `input` endpoint.
#[derive(Clone)]
pub struct SessionInputSink {
    session: NetworkSession,
}

impl SessionInputSink {
    pub fn new(session: NetworkSession) -> Self {
        Self { session }
    }
}

impl InputSink for SessionInputSink {
    fn input_changed(&mut self, entity: EntityId, actions: &ActionState, body: Option<&PhysicsBody>) {
        let msg = InputMessage {
            entity,
            device: actions.device(),
            frame: actions.to_frame(),
            physics: physics::encode(body),
        };
        if let Err(e) = self.session.emit(endpoints::INPUT, &msg) {
            warn!(entity = ?entity, error = %e, "Dropping input update");
        }
    }
}
