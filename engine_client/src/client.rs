//! Client application context.
//!
//! `GameClient` is built once at startup and owns every client component:
//! - Event bus and settings
//! - Controls dispatcher (keyboard/mouse/controller → entity actions)
//! - Network session and plain HTTP client
//! - Entity table, with the locally controlled entity
//! - Scene and model collaborators
//!
//! Pushed messages and bus events are queued and applied by `pump`, which
//! the host calls once per frame.

use std::sync::Arc;

use anyhow::{bail, Context};
use engine_shared::{
    bindings::BindingRegistry,
    config::EngineConfig,
    event::{EngineEvent, EventBus, EventKind, SubscriptionToken},
    net::{
        endpoints, EntityId, ErrorBody, InputMessage, JoinRequest, JoinResponse, StateMessage,
        PROTOCOL_VERSION,
    },
    physics::PhysicsBody,
    render::{NullScene, SceneCollaborator},
    resources::{ModelLoader, NoModels},
    settings::Settings,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    controls::Controls,
    entity::{EntityHandle, GameEntity, SessionInputSink},
    http::ApiClient,
    session::{NetworkSession, Subscription},
    sync::{self, EntityTable},
};

/// A refused join comes back on the same endpoint as an `ErrorBody`.
fn decode_join(reply: Value) -> anyhow::Result<JoinResponse> {
    if let Ok(ErrorBody { message }) = serde_json::from_value::<ErrorBody>(reply.clone()) {
        bail!("join rejected: {message}");
    }
    serde_json::from_value(reply).context("decode join response")
}

/// Work done by one `pump`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    pub states: usize,
    pub inputs: usize,
    pub controller_frames: usize,
    pub events: usize,
}

pub struct GameClient {
    config: EngineConfig,
    bus: EventBus,
    settings: Settings,
    controls: Controls,
    session: NetworkSession,
    api: ApiClient,
    entities: EntityTable,
    local: Option<EntityId>,
    last_tick: Option<u32>,
    scene: Box<dyn SceneCollaborator>,
    models: Arc<dyn ModelLoader>,
    state_rx: Subscription,
    input_rx: Subscription,
    reset_rx: Subscription,
    events: mpsc::UnboundedReceiver<EngineEvent>,
    bus_tokens: Vec<SubscriptionToken>,
    reload_requested: bool,
}

impl GameClient {
    /// Builds every component. Does not touch the network.
    pub fn new(config: EngineConfig, mut settings: Settings) -> anyhow::Result<Self> {
        let bus = EventBus::new();
        settings.attach_bus(bus.clone());

        let (events_tx, events) = mpsc::unbounded_channel();
        let bus_tokens = [
            EventKind::SettingsChanged,
            EventKind::EngineReset,
            EventKind::ReloadRequested,
            EventKind::SoftError,
        ]
        .into_iter()
        .map(|kind| {
            let tx = events_tx.clone();
            bus.subscribe(kind, move |event| {
                let _ = tx.send(event.clone());
            })
        })
        .collect();

        let controls = Controls::new(
            BindingRegistry::with_defaults(),
            &settings,
            config.poll_interval(),
        );
        let session = NetworkSession::new(config.clone(), bus.clone());
        let api = ApiClient::from_config(&config).context("build http client")?;

        info!(server = %config.server_addr(), dev = config.dev, "Client context created");

        Ok(Self {
            state_rx: session.subscribe(endpoints::STATE),
            input_rx: session.subscribe(endpoints::INPUT),
            reset_rx: session.subscribe(endpoints::RESET),
            config,
            bus,
            settings,
            controls,
            session,
            api,
            entities: EntityTable::new(),
            local: None,
            last_tick: None,
            scene: Box::new(NullScene::default()),
            models: Arc::new(NoModels),
            events,
            bus_tokens,
            reload_requested: false,
        })
    }

    pub fn with_scene(mut self, scene: impl SceneCollaborator + 'static) -> Self {
        self.scene = Box::new(scene);
        self
    }

    pub fn with_models(mut self, models: Arc<dyn ModelLoader>) -> Self {
        self.models = models;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn controls(&self) -> &Controls {
        &self.controls
    }

    pub fn controls_mut(&mut self) -> &mut Controls {
        &mut self.controls
    }

    pub fn session(&self) -> &NetworkSession {
        &self.session
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn local_id(&self) -> Option<EntityId> {
        self.local
    }

    pub fn local_entity(&self) -> Option<EntityHandle> {
        self.local.and_then(|id| self.entity(id))
    }

    pub fn entity(&self, id: EntityId) -> Option<EntityHandle> {
        self.entities.get(&id).cloned()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Opens the required connection. Losing it later requests a reload.
    pub async fn connect(&self) -> anyhow::Result<()> {
        self.session.connect(true).await.context("connect")?;
        Ok(())
    }

    /// Requests an entity of the configured kind and takes control of it.
    pub async fn join(&mut self) -> anyhow::Result<EntityId> {
        let request = JoinRequest {
            protocol: PROTOCOL_VERSION,
            kind: self.config.player_kind.clone(),
        };
        let reply: Value = self
            .session
            .request(endpoints::JOIN, &request, None)
            .await
            .context("join")?;
        let response = decode_join(reply)?;

        let mut entity = GameEntity::new(response.entity, response.kind.clone())
            .with_sink(SessionInputSink::new(self.session.clone()));
        if let Some(snapshot) = &response.physics {
            entity = entity.with_body(PhysicsBody::from_snapshot(snapshot).context("join snapshot")?);
        }
        let handle = self.spawn(entity);
        self.controls.register_entity(handle)?;
        self.local = Some(response.entity);
        self.scene.attach_camera(response.entity);

        info!(entity = ?response.entity, kind = %response.kind, "Joined");
        Ok(response.entity)
    }

    /// Adds an entity to the table, attaching its model if one is loaded.
    pub fn spawn(&mut self, mut entity: GameEntity) -> EntityHandle {
        match self.models.create_model(entity.kind()) {
            Some(model) => entity.set_model(model),
            None => warn!(kind = entity.kind(), "No model loaded for entity kind"),
        }
        let id = entity.id();
        let handle = entity.into_handle();
        self.entities.insert(id, handle.clone());
        debug!(entity = ?id, "Entity spawned");
        handle
    }

    pub fn remove(&mut self, id: EntityId) -> Option<EntityHandle> {
        self.controls.unregister_entity(id);
        if self.local == Some(id) {
            self.local = None;
        }
        let handle = self.entities.remove(&id)?;
        debug!(entity = ?id, "Entity removed");
        Some(handle)
    }

    /// Applies everything queued since the last call.
    pub fn pump(&mut self) -> PumpStats {
        let mut stats = PumpStats::default();

        while self.reset_rx.try_recv().is_some() {
            self.bus.publish(EngineEvent::EngineReset);
        }
        while let Some(value) = self.state_rx.try_recv() {
            match serde_json::from_value::<StateMessage>(value) {
                Ok(state) => {
                    self.on_state(&state);
                    stats.states += 1;
                }
                Err(e) => self.soft_error("state", e),
            }
        }
        while let Some(value) = self.input_rx.try_recv() {
            match serde_json::from_value::<InputMessage>(value) {
                Ok(msg) => {
                    if sync::apply_remote_input(&self.entities, self.local, &msg) {
                        stats.inputs += 1;
                    }
                }
                Err(e) => self.soft_error("input", e),
            }
        }
        stats.controller_frames = self.controls.drain_controller();
        stats.events = self.drain_events();
        stats
    }

    fn soft_error(&self, endpoint: &str, e: serde_json::Error) {
        self.bus
            .publish(EngineEvent::soft_error(format!("malformed `{endpoint}` payload: {e}")));
    }

    /// Reconciles the entity table with an authoritative state message.
    fn on_state(&mut self, state: &StateMessage) {
        if self.last_tick.is_some_and(|last| state.tick < last) {
            debug!(tick = state.tick, "Dropping stale state");
            return;
        }
        self.last_tick = Some(state.tick);

        let departed: Vec<EntityId> = self
            .entities
            .keys()
            .filter(|id| Some(**id) != self.local)
            .filter(|id| !state.entities.iter().any(|e| e.entity == **id))
            .copied()
            .collect();
        for id in departed {
            self.remove(id);
        }
        for update in &state.entities {
            if !self.entities.contains_key(&update.entity) {
                self.spawn(GameEntity::new(update.entity, update.kind.clone()));
            }
        }
        sync::apply_state(&self.entities, self.local, state);
    }

    fn drain_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events.try_recv() {
            match event {
                EngineEvent::SettingsChanged { key } => {
                    debug!(%key, "Re-applying settings");
                    self.controls.apply_settings(&self.settings);
                }
                EngineEvent::EngineReset => {
                    info!("Engine reset; clearing input");
                    self.controls.reset();
                }
                EngineEvent::ReloadRequested => self.reload_requested = true,
                EngineEvent::SoftError { message } => warn!(%message, "Soft error"),
                EngineEvent::ConnectionLost { .. } => {}
            }
            handled += 1;
        }
        handled
    }

    /// Stores a setting; dependent components pick it up immediately.
    pub fn set_setting(&mut self, key: &str, value: Value) {
        self.settings.set(key, value);
        self.drain_events();
    }

    pub fn reset_input(&mut self) {
        self.controls.reset();
    }

    /// True once after the required connection was lost.
    pub fn take_reload_request(&mut self) -> bool {
        self.drain_events();
        std::mem::take(&mut self.reload_requested)
    }

    /// Deliberate teardown: releases input, closes the socket quietly.
    pub fn shutdown(&mut self) {
        self.controls.dispose();
        self.session.disconnect();
        for token in self.bus_tokens.drain(..) {
            self.bus.unsubscribe(token);
        }
        info!("Client shut down");
    }
}
