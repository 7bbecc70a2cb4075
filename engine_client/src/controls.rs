//! Controls dispatcher.
//!
//! Sole owner of the raw-input -> action index. Raw keyboard, mouse and
//! controller input is resolved through the index and fanned out to every
//! registered entity synchronously, before the next input is handled.
//!
//! Lifecycle: constructed once by the application context, reconfigured by
//! `apply_settings` whenever settings change, torn down with `dispose`.

use std::{
    collections::{BTreeSet, HashMap},
    time::Duration,
};

use engine_shared::{
    bindings::{BindingRegistry, BindingSet, BoundActionIndex, Device, RawKey},
    net::EntityId,
    settings::Settings,
};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use crate::{
    entity::{lock, EntityHandle},
    gamepad::{spawn_poll_loop, GamepadSource, PadEvent, PollHandle},
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlsError {
    #[error("entity {0:?} has no action state")]
    MissingActionState(EntityId),
}

/// A running poll loop plus the receiving end of its own channel. Events
/// from a replaced poller die with it.
struct Poller {
    handle: PollHandle,
    events: mpsc::UnboundedReceiver<PadEvent>,
}

pub struct Controls {
    registry: BindingRegistry,
    index: BoundActionIndex,
    entities: HashMap<EntityId, EntityHandle>,
    enabled: bool,
    mouse_sensitivity: f32,
    deadzone: watch::Sender<f32>,
    poll_interval: Duration,
    forced_pointer_lock: Option<bool>,
    pointer_locked: bool,
    poller: Option<Poller>,
    /// Controller keys last applied with a non-zero value.
    pad_held: BTreeSet<RawKey>,
}

impl Controls {
    pub fn new(registry: BindingRegistry, settings: &Settings, poll_interval: Duration) -> Self {
        let (deadzone, _) = watch::channel(settings.movement_deadzone());
        let mut controls = Self {
            index: BoundActionIndex::default(),
            registry,
            entities: HashMap::new(),
            enabled: true,
            mouse_sensitivity: settings.mouse_sensitivity(),
            deadzone,
            poll_interval,
            forced_pointer_lock: None,
            pointer_locked: false,
            poller: None,
            pad_held: BTreeSet::new(),
        };
        controls.apply_settings(settings);
        controls
    }

    /// Re-derives the index, deadzone and sensitivity from `settings`.
    pub fn apply_settings(&mut self, settings: &Settings) {
        self.registry.load(settings.custom_controls());
        self.index = self.registry.build_index();
        self.mouse_sensitivity = settings.mouse_sensitivity();
        self.deadzone.send_replace(settings.movement_deadzone());
        debug!(
            keys = self.index.len(),
            deadzone = settings.movement_deadzone(),
            sensitivity = self.mouse_sensitivity,
            "Controls configured"
        );
    }

    /// Registers bindings for an entity kind and rebuilds the index.
    pub fn register_bindings(&mut self, kind: impl Into<String>, set: BindingSet) {
        self.registry.register_bindings(kind, set);
        self.index = self.registry.build_index();
    }

    pub fn registry(&self) -> &BindingRegistry {
        &self.registry
    }

    pub fn index(&self) -> &BoundActionIndex {
        &self.index
    }

    pub fn register_entity(&mut self, handle: EntityHandle) -> Result<(), ControlsError> {
        let id = {
            let entity = lock(&handle);
            if !entity.has_actions() {
                let err = ControlsError::MissingActionState(entity.id());
                error!(entity = ?entity.id(), kind = entity.kind(), "Cannot register entity without action state");
                return Err(err);
            }
            entity.id()
        };
        debug!(entity = ?id, "Entity registered for input");
        self.entities.insert(id, handle);
        Ok(())
    }

    /// Removes an entity and clears its input.
    pub fn unregister_entity(&mut self, id: EntityId) -> Option<EntityHandle> {
        let handle = self.entities.remove(&id)?;
        lock(&handle).clear_input();
        debug!(entity = ?id, "Entity unregistered from input");
        Some(handle)
    }

    pub fn is_registered(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    pub fn registered(&self) -> usize {
        self.entities.len()
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Toggles global input. Disabling releases everything currently held.
    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled == enabled {
            return;
        }
        if !enabled {
            self.reset();
        }
        self.enabled = enabled;
        info!(enabled, "Controls toggled");
    }

    /// Resolves `key` and sets every bound action to `value` on every
    /// registered entity. Returns the number of entity updates attempted.
    pub fn set_actions(&mut self, key: RawKey, value: f32, device: Device) -> usize {
        if !self.enabled {
            return 0;
        }
        let actions = self.index.actions_for(&key);
        if actions.is_empty() {
            return 0;
        }
        let mut updates = 0;
        for handle in self.entities.values() {
            let mut entity = lock(handle);
            entity.set_device(device);
            for &action in actions {
                entity.set_action(action, value);
                updates += 1;
            }
        }
        updates
    }

    pub fn key_down(&mut self, code: u32) -> usize {
        self.set_actions(RawKey::Key(code), 1.0, Device::Keyboard)
    }

    pub fn key_up(&mut self, code: u32) -> usize {
        self.set_actions(RawKey::Key(code), 0.0, Device::Keyboard)
    }

    pub fn mouse_down(&mut self, button: u8) -> usize {
        self.set_actions(RawKey::MouseButton(button), 1.0, Device::Mouse)
    }

    pub fn mouse_up(&mut self, button: u8) -> usize {
        self.set_actions(RawKey::MouseButton(button), 0.0, Device::Mouse)
    }

    /// Forwards scaled pointer motion to every registered entity.
    pub fn on_mouse_move(&mut self, dx: f32, dy: f32) {
        if !self.enabled {
            return;
        }
        let (dx, dy) = (dx * self.mouse_sensitivity, dy * self.mouse_sensitivity);
        for handle in self.entities.values() {
            lock(handle).add_mouse_movement(dx, dy);
        }
    }

    /// Forces the pointer lock state; `None` lifts the restriction.
    pub fn force_pointer_lock(&mut self, forced: Option<bool>) {
        self.forced_pointer_lock = forced;
        if let Some(locked) = forced {
            self.pointer_locked = locked;
        }
    }

    /// Returns whether the lock was granted.
    pub fn request_pointer_lock(&mut self) -> bool {
        if self.forced_pointer_lock == Some(false) {
            return false;
        }
        self.pointer_locked = true;
        true
    }

    /// Returns whether the pointer was released.
    pub fn exit_pointer_lock(&mut self) -> bool {
        if self.forced_pointer_lock == Some(true) {
            return false;
        }
        self.pointer_locked = false;
        true
    }

    pub fn pointer_locked(&self) -> bool {
        self.pointer_locked
    }

    /// Starts polling a newly connected controller, replacing any previous one.
    pub fn controller_connected<S: GamepadSource>(&mut self, source: S) {
        self.release_controller();
        let (tx, events) = mpsc::unbounded_channel();
        let handle = spawn_poll_loop(source, self.deadzone.subscribe(), self.poll_interval, tx);
        self.poller = Some(Poller { handle, events });
        info!("Controller connected");
    }

    /// Stops polling and releases every action the controller was holding.
    pub fn controller_disconnected(&mut self) {
        if self.release_controller() {
            info!("Controller disconnected");
        }
    }

    fn release_controller(&mut self) -> bool {
        let Some(poller) = self.poller.take() else {
            return false;
        };
        poller.handle.cancel();
        for key in std::mem::take(&mut self.pad_held) {
            self.set_actions(key, 0.0, Device::Controller);
        }
        true
    }

    pub fn controller_active(&self) -> bool {
        self.poller.as_ref().is_some_and(|p| !p.handle.is_finished())
    }

    /// Applies every polled controller frame in arrival order.
    pub fn drain_controller(&mut self) -> usize {
        let events: Vec<PadEvent> = match self.poller.as_mut() {
            Some(poller) => std::iter::from_fn(|| poller.events.try_recv().ok()).collect(),
            None => return 0,
        };
        let mut frames = 0;
        for event in events {
            match event {
                PadEvent::Frame(entries) => {
                    for (key, value) in entries {
                        if value == 0.0 {
                            self.pad_held.remove(&key);
                        } else {
                            self.pad_held.insert(key);
                        }
                        self.set_actions(key, value, Device::Controller);
                    }
                    frames += 1;
                }
                PadEvent::Disconnected => {
                    self.controller_disconnected();
                    break;
                }
            }
        }
        frames
    }

    /// Clears the input of every registered entity.
    pub fn reset(&mut self) {
        for handle in self.entities.values() {
            lock(handle).clear_input();
        }
    }

    /// Stops polling and releases every entity.
    pub fn dispose(&mut self) {
        self.controller_disconnected();
        let ids: Vec<EntityId> = self.entities.keys().copied().collect();
        for id in ids {
            self.unregister_entity(id);
        }
    }
}
