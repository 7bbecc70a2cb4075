//! Development sync server.
//!
//! Authoritative tick loop plus an axum app serving:
//! - `GET /socket`: the multiplexed WebSocket (token required)
//! - `GET /api/status`
//! - `GET|POST|DELETE /api/loadouts[/{name}]`
//!
//! Socket endpoints: `ping` echoes, `join` assigns an entity, `input` stores
//! and relays peer input, `state` is broadcast every tick, `reset` is pushed
//! on demand.
//!
//! Determinism notes:
//! - Keep simulation in a fixed timestep.
//! - Use stable ordering when iterating collections.

use std::{
    collections::{BTreeMap, HashMap},
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Instant,
};

use anyhow::Context;
use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use engine_shared::{
    actions::ActionFrame,
    bindings::Device,
    config::EngineConfig,
    net::{
        endpoints, EntityId, EntityStateMessage, Envelope, ErrorBody, InputMessage, JoinRequest,
        JoinResponse, StateMessage, PROTOCOL_VERSION,
    },
    physics::{self, PhysicsBody},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::sim::ShipControls;

type PeerId = u64;

struct Peer {
    outbound: mpsc::UnboundedSender<String>,
    entity: Option<EntityId>,
    dev: bool,
}

struct EntityRecord {
    kind: String,
    owner: PeerId,
    body: PhysicsBody,
    input: ActionFrame,
    device: Option<Device>,
}

#[derive(Default)]
struct World {
    tick: u32,
    peers: HashMap<PeerId, Peer>,
    entities: BTreeMap<EntityId, EntityRecord>,
}

impl World {
    fn state_message(&self) -> StateMessage {
        StateMessage {
            tick: self.tick,
            entities: self
                .entities
                .iter()
                .map(|(id, e)| EntityStateMessage {
                    entity: *id,
                    kind: e.kind.clone(),
                    physics: physics::encode(Some(&e.body)),
                    input: e.input.clone(),
                })
                .collect(),
        }
    }

    fn send_to(&self, peer: PeerId, text: String) {
        if let Some(p) = self.peers.get(&peer) {
            let _ = p.outbound.send(text);
        }
    }

    fn broadcast(&self, text: &str, except: Option<PeerId>) {
        for (id, peer) in &self.peers {
            if Some(*id) != except {
                let _ = peer.outbound.send(text.to_string());
            }
        }
    }
}

/// Shared server state.
pub struct ServerState {
    cfg: EngineConfig,
    ship: ShipControls,
    world: Mutex<World>,
    loadouts: Mutex<BTreeMap<String, Value>>,
    next_peer: AtomicU64,
    next_entity: AtomicU64,
    started: Instant,
}

impl ServerState {
    pub fn new(cfg: EngineConfig) -> Self {
        Self {
            cfg,
            ship: ShipControls::default(),
            world: Mutex::new(World::default()),
            loadouts: Mutex::new(BTreeMap::new()),
            next_peer: AtomicU64::new(1),
            next_entity: AtomicU64::new(1),
            started: Instant::now(),
        }
    }

    fn world(&self) -> MutexGuard<'_, World> {
        self.world.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn loadouts(&self) -> MutexGuard<'_, BTreeMap<String, Value>> {
        self.loadouts.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A token is always required; when one is configured it must match.
    fn authorized(&self, token: Option<&str>) -> bool {
        match (token, &self.cfg.auth_token) {
            (None, _) => false,
            (Some(t), _) if t.is_empty() => false,
            (Some(t), Some(expected)) => t == expected,
            (Some(_), None) => true,
        }
    }

    fn register(&self, outbound: mpsc::UnboundedSender<String>, dev: bool) -> PeerId {
        let id = self.next_peer.fetch_add(1, Ordering::Relaxed);
        self.world().peers.insert(
            id,
            Peer {
                outbound,
                entity: None,
                dev,
            },
        );
        id
    }

    fn unregister(&self, peer: PeerId) {
        let mut world = self.world();
        if let Some(p) = world.peers.remove(&peer) {
            if let Some(entity) = p.entity {
                world.entities.remove(&entity);
            }
            info!(peer, entity = ?p.entity, "Peer left");
        }
    }

    /// Advances one fixed step and broadcasts the resulting state.
    pub fn step(&self, dt: f64) {
        let mut world = self.world();
        for record in world.entities.values_mut() {
            self.ship.step(&mut record.body, &record.input, dt);
        }
        world.tick = world.tick.wrapping_add(1);
        if world.peers.is_empty() {
            return;
        }
        match Envelope::new(endpoints::STATE, world.state_message()).and_then(|e| e.to_text()) {
            Ok(text) => world.broadcast(&text, None),
            Err(e) => error!(error = %e, "Failed to serialize state"),
        }
    }

    fn handle_text(&self, peer: PeerId, text: &str) {
        let envelope = match Envelope::from_text(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(peer, error = %e, "Malformed frame");
                return;
            }
        };
        match envelope.endpoint.as_str() {
            endpoints::PING => self.world().send_to(peer, text.to_string()),
            endpoints::JOIN => self.on_join(peer, &envelope),
            endpoints::INPUT => self.on_input(peer, &envelope, text),
            other => debug!(peer, endpoint = other, "Unhandled endpoint"),
        }
    }

    fn on_join(&self, peer: PeerId, envelope: &Envelope) {
        let reply = match envelope.payload::<JoinRequest>() {
            Ok(req) if req.protocol == PROTOCOL_VERSION => self.spawn_for(peer, req.kind),
            Ok(req) => {
                warn!(peer, protocol = req.protocol, "Protocol mismatch");
                Envelope::new(
                    endpoints::JOIN,
                    ErrorBody {
                        message: format!("protocol {} != {}", req.protocol, PROTOCOL_VERSION),
                    },
                )
            }
            Err(e) => Envelope::new(endpoints::JOIN, ErrorBody { message: e.to_string() }),
        };
        match reply.and_then(|e| e.to_text()) {
            Ok(text) => self.world().send_to(peer, text),
            Err(e) => error!(peer, error = %e, "Failed to build join reply"),
        }
    }

    fn spawn_for(&self, peer: PeerId, kind: String) -> anyhow::Result<Envelope> {
        let id = EntityId(self.next_entity.fetch_add(1, Ordering::Relaxed));
        let body = PhysicsBody::default();
        let mut world = self.world();
        let previous = world.peers.get_mut(&peer).and_then(|p| p.entity.replace(id));
        if let Some(old) = previous {
            world.entities.remove(&old);
        }
        world.entities.insert(
            id,
            EntityRecord {
                kind: kind.clone(),
                owner: peer,
                body,
                input: ActionFrame::default(),
                device: None,
            },
        );
        info!(peer, entity = ?id, %kind, "Entity spawned");
        Envelope::new(
            endpoints::JOIN,
            JoinResponse {
                entity: id,
                kind,
                physics: physics::encode(Some(&body)),
            },
        )
    }

    fn on_input(&self, peer: PeerId, envelope: &Envelope, text: &str) {
        let msg: InputMessage = match envelope.payload() {
            Ok(msg) => msg,
            Err(e) => {
                warn!(peer, error = %e, "Malformed input");
                return;
            }
        };
        let mut world = self.world();
        let Some(record) = world.entities.get_mut(&msg.entity) else {
            debug!(peer, entity = ?msg.entity, "Input for unknown entity");
            return;
        };
        if record.owner != peer {
            warn!(peer, entity = ?msg.entity, "Input for entity owned by another peer");
            return;
        }
        record.input = msg.frame;
        record.device = msg.device;
        if let Err(e) = physics::decode(msg.physics.as_ref(), &mut record.body) {
            warn!(peer, error = %e, "Rejected input snapshot");
        }
        world.broadcast(text, Some(peer));
    }

    /// Pushes `reset` to every peer and clears stored input.
    pub fn broadcast_reset(&self) {
        let mut world = self.world();
        for record in world.entities.values_mut() {
            record.input = ActionFrame::default();
        }
        match Envelope::new(endpoints::RESET, Value::Null).and_then(|e| e.to_text()) {
            Ok(text) => world.broadcast(&text, None),
            Err(e) => error!(error = %e, "Failed to serialize reset"),
        }
        info!(peers = world.peers.len(), "Reset broadcast");
    }

    /// Drops every peer; their sockets are closed by the writer tasks.
    pub fn kick_all(&self) -> usize {
        let mut world = self.world();
        let kicked = world.peers.len();
        world.peers.clear();
        world.entities.clear();
        info!(kicked, "Kicked all peers");
        kicked
    }

    pub fn tick(&self) -> u32 {
        self.world().tick
    }

    pub fn peer_count(&self) -> usize {
        self.world().peers.len()
    }

    pub fn entity_count(&self) -> usize {
        self.world().entities.len()
    }

    /// Stored input of one entity.
    pub fn entity_input(&self, id: EntityId) -> Option<ActionFrame> {
        self.world().entities.get(&id).map(|e| e.input.clone())
    }

    fn status(&self) -> Value {
        let world = self.world();
        let dev_peers = world.peers.values().filter(|p| p.dev).count();
        let devices: BTreeMap<&str, usize> = world
            .entities
            .values()
            .filter_map(|e| e.device)
            .fold(BTreeMap::new(), |mut acc, d| {
                *acc.entry(d.name()).or_default() += 1;
                acc
            });
        json!({
            "protocol": PROTOCOL_VERSION,
            "tick": world.tick,
            "tick_hz": self.cfg.tick_hz,
            "peers": world.peers.len(),
            "dev_peers": dev_peers,
            "entities": world.entities.len(),
            "devices": devices,
            "uptime_ms": self.started.elapsed().as_millis() as u64,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct SocketQuery {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    dev: Option<String>,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            message: message.into(),
        }),
    )
        .into_response()
}

async fn socket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
    Query(query): Query<SocketQuery>,
) -> Response {
    if !state.authorized(query.token.as_deref()) {
        warn!("Rejected socket without valid token");
        return error_response(StatusCode::UNAUTHORIZED, "missing or invalid token");
    }
    let dev = query.dev.as_deref() == Some("1");
    ws.on_upgrade(move |socket| handle_socket(socket, state, dev))
}

async fn handle_socket(socket: WebSocket, state: Arc<ServerState>, dev: bool) {
    let (mut sink, mut stream) = socket.split();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    let peer = state.register(outbound, dev);
    info!(peer, dev, "Peer connected");

    // The channel closes when the peer is removed; close the socket then.
    let writer = tokio::spawn(async move {
        while let Some(text) = outbound_rx.recv().await {
            if sink.send(Message::Text(text.into())).await.is_err() {
                return;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => state.handle_text(peer, text.as_str()),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(peer, error = %e, "Socket error");
                break;
            }
        }
    }

    state.unregister(peer);
    let _ = writer.await;
}

async fn status_handler(State(state): State<Arc<ServerState>>) -> Json<Value> {
    Json(state.status())
}

async fn list_loadouts(State(state): State<Arc<ServerState>>) -> Json<Value> {
    let names: Vec<String> = state.loadouts().keys().cloned().collect();
    Json(json!({ "loadouts": names }))
}

async fn get_loadout(State(state): State<Arc<ServerState>>, Path(name): Path<String>) -> Response {
    match state.loadouts().get(&name) {
        Some(value) => Json(value.clone()).into_response(),
        None => error_response(StatusCode::NOT_FOUND, format!("loadout `{name}` not found")),
    }
}

async fn save_loadout(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    let value = match body {
        Ok(Json(value)) => value,
        Err(rejection) => return error_response(rejection.status(), rejection.body_text()),
    };
    if !value.is_object() {
        return error_response(StatusCode::UNPROCESSABLE_ENTITY, "loadout must be an object");
    }
    state.loadouts().insert(name.clone(), value);
    info!(%name, "Loadout saved");
    Json(json!({ "saved": name })).into_response()
}

async fn delete_loadout(State(state): State<Arc<ServerState>>, Path(name): Path<String>) -> Response {
    match state.loadouts().remove(&name) {
        Some(_) => Json(json!({ "deleted": name })).into_response(),
        None => error_response(StatusCode::NOT_FOUND, format!("loadout `{name}` not found")),
    }
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/socket", get(socket_handler))
        .route("/api/status", get(status_handler))
        .route("/api/loadouts", get(list_loadouts))
        .route(
            "/api/loadouts/{name}",
            get(get_loadout).post(save_loadout).delete(delete_loadout),
        )
        .with_state(state)
}

/// Fixed-rate step loop.
async fn tick_loop(state: Arc<ServerState>) {
    let period = state.cfg.tick_interval();
    let dt = period.as_secs_f64();
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        state.step(dt);
    }
}

/// A running development server.
pub struct GameServer {
    state: Arc<ServerState>,
    addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl GameServer {
    /// Binds `server_host:server_port` from `cfg` and starts serving.
    pub async fn bind(cfg: EngineConfig) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(cfg.server_addr())
            .await
            .with_context(|| format!("bind {}", cfg.server_addr()))?;
        Self::start(listener, cfg)
    }

    /// Serves on an already bound listener.
    pub fn start(listener: TcpListener, cfg: EngineConfig) -> anyhow::Result<Self> {
        let addr = listener.local_addr().context("local_addr")?;
        let state = Arc::new(ServerState::new(cfg));
        let app = router(state.clone());

        let serve = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "Server error");
            }
        });
        let ticks = tokio::spawn(tick_loop(state.clone()));

        info!(%addr, tick_hz = state.cfg.tick_hz, "Server listening");
        Ok(Self {
            state,
            addr,
            tasks: vec![serve, ticks],
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    /// Executes a console command.
    pub fn exec_console(&self, line: &str) -> anyhow::Result<Vec<String>> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(&command) = tokens.first() else {
            return Ok(Vec::new());
        };
        let out = match command {
            "status" => {
                let status = self.state.status();
                vec![
                    format!("Address: {}", self.addr),
                    format!("Tick: {}", status["tick"]),
                    format!("Peers: {}", status["peers"]),
                    format!("Entities: {}", status["entities"]),
                ]
            }
            "reset" => {
                self.state.broadcast_reset();
                vec!["Reset sent".to_string()]
            }
            "kick" => {
                let kicked = self.state.kick_all();
                vec![format!("Kicked {kicked} peer(s)")]
            }
            other => vec![format!("Unknown command: {other}")],
        };
        Ok(out)
    }

    /// Drops every peer, then stops serving and ticking.
    pub fn shutdown(self) {
        let kicked = self.state.kick_all();
        for task in &self.tasks {
            task.abort();
        }
        info!(addr = %self.addr, kicked, "Server stopped");
    }
}

impl Drop for GameServer {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Helper for tests: bind to an ephemeral port. Returns the server and a
/// client config pointing at it.
pub async fn bind_ephemeral(tick_hz: u32) -> anyhow::Result<(GameServer, EngineConfig)> {
    let mut cfg = EngineConfig::local("127.0.0.1", 0);
    cfg.tick_hz = tick_hz;
    cfg.auth_token = Some("dev-token".to_string());

    let listener = TcpListener::bind(cfg.server_addr()).await.context("bind ephemeral")?;
    cfg.server_port = listener.local_addr()?.port();
    let server = GameServer::start(listener, cfg.clone())?;
    Ok((server, cfg))
}
