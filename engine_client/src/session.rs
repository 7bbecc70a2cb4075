//! Network session.
//!
//! Owns the single persistent socket. Every frame is an `Envelope`; the
//! endpoint name is the only routing key, so correlated calls are limited to
//! one in flight per endpoint pair. A second call on a busy endpoint fails
//! immediately instead of queuing.
//!
//! Task layout per connection:
//! - writer: drains an mpsc of outbound frames into the socket sink
//! - reader: routes inbound frames to one-shot listeners and subscriptions

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Duration,
};

use engine_shared::{
    config::EngineConfig,
    event::{EngineEvent, EventBus},
    net::{Envelope, PROTOCOL_VERSION},
};
use futures_util::{SinkExt, StreamExt};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task::AbortHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, trace, warn};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("listener already installed for `{0}`")]
    ListenerAlreadyInstalled(String),
    #[error("not connected")]
    NotConnected,
    #[error("connection closed while waiting for `{0}`")]
    Closed(String),
    #[error("no `{endpoint}` message within {timeout:?}")]
    Timeout { endpoint: String, timeout: Duration },
    #[error("invalid socket url: {0}")]
    Url(String),
    #[error("socket: {0}")]
    Socket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for SessionError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        SessionError::Socket(Box::new(e))
    }
}

struct Connection {
    generation: u64,
    required: bool,
    outbound: mpsc::UnboundedSender<Message>,
    reader: Option<AbortHandle>,
}

#[derive(Default)]
struct Registry {
    /// Endpoints with a correlated call or passive wait outstanding.
    pending: HashSet<String>,
    listeners: HashMap<String, oneshot::Sender<Value>>,
    subscriptions: HashMap<String, Vec<(u64, mpsc::UnboundedSender<Value>)>>,
    next_subscription: u64,
    connection: Option<Connection>,
    generation: u64,
}

struct Inner {
    config: EngineConfig,
    bus: EventBus,
    registry: Mutex<Registry>,
    connect_lock: tokio::sync::Mutex<()>,
    default_timeout: Option<Duration>,
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn dispatch(&self, envelope: Envelope) {
        let (listener, subscribers) = {
            let mut reg = self.registry();
            let listener = reg.listeners.remove(&envelope.endpoint);
            let subscribers: Vec<_> = reg
                .subscriptions
                .get(&envelope.endpoint)
                .map(|subs| subs.iter().map(|(_, tx)| tx.clone()).collect())
                .unwrap_or_default();
            (listener, subscribers)
        };
        if listener.is_none() && subscribers.is_empty() {
            trace!(endpoint = %envelope.endpoint, "No receiver for message");
            return;
        }
        for tx in subscribers {
            let _ = tx.send(envelope.data.clone());
        }
        if let Some(tx) = listener {
            let _ = tx.send(envelope.data);
        }
    }

    /// Handles the end of connection `generation`. A connection that was
    /// already removed was torn down deliberately and is ignored.
    fn on_disconnect(&self, generation: u64, reason: String) {
        let required = {
            let mut reg = self.registry();
            if reg.connection.as_ref().map(|c| c.generation) != Some(generation) {
                return;
            }
            let conn = reg.connection.take();
            // Dropping the senders fails every waiting call with `Closed`.
            reg.listeners.clear();
            conn.is_some_and(|c| c.required)
        };
        warn!(reason = %reason, required, "Connection lost");
        if required {
            self.bus.publish(EngineEvent::ConnectionLost { reason });
            self.bus.publish(EngineEvent::ReloadRequested);
        }
    }
}

/// Removes a call's pending entries and listener however the call ends.
struct PendingGuard<'a> {
    inner: &'a Inner,
    request: String,
    response: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut reg = self.inner.registry();
        reg.pending.remove(&self.request);
        reg.pending.remove(&self.response);
        reg.listeners.remove(&self.response);
    }
}

/// Handle to the persistent socket. Cloning yields another handle to the
/// same session.
#[derive(Clone)]
pub struct NetworkSession {
    inner: Arc<Inner>,
}

impl NetworkSession {
    pub fn new(config: EngineConfig, bus: EventBus) -> Self {
        let default_timeout = config.call_timeout();
        Self {
            inner: Arc::new(Inner {
                config,
                bus,
                registry: Mutex::new(Registry::default()),
                connect_lock: tokio::sync::Mutex::new(()),
                default_timeout,
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Socket URL including the query string.
    pub fn socket_url(&self) -> Result<reqwest::Url, SessionError> {
        let cfg = &self.inner.config;
        let mut params = vec![("v", PROTOCOL_VERSION.to_string())];
        if let Some(token) = &cfg.auth_token {
            params.push(("token", token.clone()));
        }
        if cfg.dev {
            params.push(("dev", "1".to_string()));
        }
        reqwest::Url::parse_with_params(&cfg.socket_url(), &params)
            .map_err(|e| SessionError::Url(e.to_string()))
    }

    pub fn is_connected(&self) -> bool {
        self.inner.registry().connection.is_some()
    }

    /// Opens the socket unless it is already open.
    ///
    /// When `required`, an unexpected disconnect publishes `ConnectionLost`
    /// followed by `ReloadRequested`.
    pub async fn connect(&self, required: bool) -> Result<(), SessionError> {
        let _connecting = self.inner.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        let url = self.socket_url()?;
        info!(host = %self.inner.config.server_host, port = self.inner.config.server_port, required, "Connecting");
        let (stream, _response) = connect_async(url.as_str()).await?;
        let (mut sink, mut source) = stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        let generation = {
            let mut reg = self.inner.registry();
            reg.generation += 1;
            let generation = reg.generation;
            reg.connection = Some(Connection {
                generation,
                required,
                outbound,
                reader: None,
            });
            generation
        };

        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if let Err(e) = sink.send(msg).await {
                    debug!(error = %e, "Socket writer stopped");
                    return;
                }
            }
            let _ = sink.close().await;
        });

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let reader = tokio::spawn(async move {
            let reason = loop {
                let Some(frame) = source.next().await else {
                    break "socket closed".to_string();
                };
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                match frame {
                    Ok(Message::Text(text)) => match Envelope::from_text(text.as_str()) {
                        Ok(envelope) => inner.dispatch(envelope),
                        Err(e) => {
                            warn!(error = %e, "Malformed frame");
                            inner
                                .bus
                                .publish(EngineEvent::soft_error(format!("malformed frame: {e:#}")));
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        break frame.map_or_else(
                            || "closed by server".to_string(),
                            |f| format!("closed by server: {}", f.reason.as_str()),
                        );
                    }
                    Ok(Message::Binary(_)) => warn!("Ignoring binary frame"),
                    Ok(_) => {}
                    Err(e) => {
                        inner
                            .bus
                            .publish(EngineEvent::soft_error(format!("socket error: {e}")));
                        break e.to_string();
                    }
                }
            };
            if let Some(inner) = weak.upgrade() {
                inner.on_disconnect(generation, reason);
            }
        });

        let mut reg = self.inner.registry();
        if let Some(conn) = reg.connection.as_mut().filter(|c| c.generation == generation) {
            conn.reader = Some(reader.abort_handle());
        }
        drop(reg);
        info!(generation, "Connected");
        Ok(())
    }

    /// Deliberate teardown; never triggers a reload.
    pub fn disconnect(&self) {
        let conn = {
            let mut reg = self.inner.registry();
            reg.listeners.clear();
            reg.connection.take()
        };
        if let Some(conn) = conn {
            if let Some(reader) = conn.reader {
                reader.abort();
            }
            info!(generation = conn.generation, "Disconnected");
        }
    }

    fn send_text(&self, text: String) -> Result<(), SessionError> {
        let reg = self.inner.registry();
        let conn = reg.connection.as_ref().ok_or(SessionError::NotConnected)?;
        conn.outbound
            .send(Message::text(text))
            .map_err(|_| SessionError::NotConnected)
    }

    fn encode(endpoint: &str, payload: &impl Serialize) -> Result<String, SessionError> {
        let envelope = Envelope {
            endpoint: endpoint.to_string(),
            data: serde_json::to_value(payload)?,
        };
        Ok(serde_json::to_string(&envelope)?)
    }

    /// Fire-and-forget.
    pub fn emit(&self, endpoint: &str, payload: &impl Serialize) -> Result<(), SessionError> {
        let text = Self::encode(endpoint, payload)?;
        trace!(endpoint, "Emit");
        self.send_text(text)
    }

    /// Emits `endpoint` and resolves with the next payload seen on
    /// `response_endpoint` (defaults to `endpoint`), within the session's
    /// default timeout.
    pub async fn emit_and_await_response(
        &self,
        endpoint: &str,
        payload: &impl Serialize,
        response_endpoint: Option<&str>,
    ) -> Result<Value, SessionError> {
        self.emit_and_await_response_timeout(
            endpoint,
            payload,
            response_endpoint,
            self.inner.default_timeout,
        )
        .await
    }

    /// Like `emit_and_await_response` with an explicit deadline. `None`
    /// waits until the response arrives or the connection drops.
    pub async fn emit_and_await_response_timeout(
        &self,
        endpoint: &str,
        payload: &impl Serialize,
        response_endpoint: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Value, SessionError> {
        let text = Self::encode(endpoint, payload)?;
        let response = response_endpoint.unwrap_or(endpoint);
        let (guard, rx) = self.install(endpoint, response)?;
        self.send_text(text)?;
        trace!(endpoint, response, "Awaiting response");
        let value = Self::await_value(rx, response, timeout).await;
        drop(guard);
        value
    }

    /// Typed correlated call.
    pub async fn request<Req, Resp>(
        &self,
        endpoint: &str,
        payload: &Req,
        response_endpoint: Option<&str>,
    ) -> anyhow::Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let value = self
            .emit_and_await_response(endpoint, payload, response_endpoint)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Resolves on the next `endpoint` message without sending anything.
    pub async fn wait_for_message(&self, endpoint: &str) -> Result<Value, SessionError> {
        self.wait_for_message_timeout(endpoint, self.inner.default_timeout)
            .await
    }

    pub async fn wait_for_message_timeout(
        &self,
        endpoint: &str,
        timeout: Option<Duration>,
    ) -> Result<Value, SessionError> {
        let (guard, rx) = self.install(endpoint, endpoint)?;
        let value = Self::await_value(rx, endpoint, timeout).await;
        drop(guard);
        value
    }

    fn install(
        &self,
        request: &str,
        response: &str,
    ) -> Result<(PendingGuard<'_>, oneshot::Receiver<Value>), SessionError> {
        let mut reg = self.inner.registry();
        if reg.connection.is_none() {
            return Err(SessionError::NotConnected);
        }
        if reg.pending.contains(request) || reg.pending.contains(response) {
            return Err(SessionError::ListenerAlreadyInstalled(request.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        // A stale listener must never resolve the new call.
        reg.listeners.remove(response);
        reg.listeners.insert(response.to_string(), tx);
        reg.pending.insert(request.to_string());
        reg.pending.insert(response.to_string());
        let guard = PendingGuard {
            inner: &self.inner,
            request: request.to_string(),
            response: response.to_string(),
        };
        Ok((guard, rx))
    }

    async fn await_value(
        rx: oneshot::Receiver<Value>,
        endpoint: &str,
        timeout: Option<Duration>,
    ) -> Result<Value, SessionError> {
        let closed = || SessionError::Closed(endpoint.to_string());
        match timeout {
            None => rx.await.map_err(|_| closed()),
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(result) => result.map_err(|_| closed()),
                Err(_) => Err(SessionError::Timeout {
                    endpoint: endpoint.to_string(),
                    timeout: limit,
                }),
            },
        }
    }

    /// Long-lived stream of every payload on `endpoint`.
    pub fn subscribe(&self, endpoint: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut reg = self.inner.registry();
        let id = reg.next_subscription;
        reg.next_subscription += 1;
        reg.subscriptions
            .entry(endpoint.to_string())
            .or_default()
            .push((id, tx));
        Subscription {
            endpoint: endpoint.to_string(),
            id,
            rx,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Endpoints with a call or wait outstanding.
    pub fn pending_calls(&self) -> Vec<String> {
        let mut pending: Vec<String> = self.inner.registry().pending.iter().cloned().collect();
        pending.sort();
        pending
    }
}

impl std::fmt::Debug for NetworkSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkSession")
            .field("server", &self.inner.config.server_addr())
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Push messages for one endpoint. Dropping it unsubscribes.
pub struct Subscription {
    endpoint: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<Value>,
    inner: Weak<Inner>,
}

impl Subscription {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Value> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut reg = inner.registry();
        if let Some(subs) = reg.subscriptions.get_mut(&self.endpoint) {
            subs.retain(|(id, _)| *id != self.id);
            if subs.is_empty() {
                reg.subscriptions.remove(&self.endpoint);
            }
        }
    }
}

/// Doubling delay between reconnect attempts, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial,
        }
    }

    /// Delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    /// Call after a successful attempt.
    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_shared::event::EventKind;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    /// One-connection echo server: every text frame is sent back unchanged
    /// unless its endpoint is `silent`.
    async fn echo_server() -> (EngineConfig, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let task = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    let env = Envelope::from_text(text.as_str()).unwrap();
                    if env.endpoint == "silent" {
                        continue;
                    }
                    if env.endpoint == "bye" {
                        let _ = ws.close(None).await;
                        return;
                    }
                    ws.send(Message::Text(text)).await.unwrap();
                }
            }
        });
        (EngineConfig::local("127.0.0.1", port), task)
    }

    #[test]
    fn socket_url_carries_token_and_dev_flag() {
        let mut cfg = EngineConfig::local("127.0.0.1", 9000);
        cfg.auth_token = Some("abc".into());
        let url = NetworkSession::new(cfg, EventBus::new()).socket_url().unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:9000/socket?v=2&token=abc&dev=1");
    }

    #[test]
    fn emit_without_connection_fails() {
        let session = NetworkSession::new(EngineConfig::local("127.0.0.1", 1), EventBus::new());
        assert!(matches!(
            session.emit("ping", &1),
            Err(SessionError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn correlated_call_resolves_and_clears_pending() {
        let (cfg, _server) = echo_server().await;
        let session = NetworkSession::new(cfg, EventBus::new());
        session.connect(false).await.unwrap();
        session.connect(false).await.unwrap();

        let value = session
            .emit_and_await_response("ping", &serde_json::json!({"n": 1}), None)
            .await
            .unwrap();
        assert_eq!(value, serde_json::json!({"n": 1}));
        assert!(session.pending_calls().is_empty());
    }

    #[tokio::test]
    async fn second_call_on_busy_endpoint_fails_fast() {
        let (cfg, _server) = echo_server().await;
        let session = NetworkSession::new(cfg, EventBus::new());
        session.connect(false).await.unwrap();

        let waiting = session.clone();
        let first = tokio::spawn(async move {
            waiting
                .emit_and_await_response_timeout("silent", &1, None, Some(Duration::from_millis(200)))
                .await
        });
        while session.pending_calls().is_empty() {
            tokio::task::yield_now().await;
        }

        let second = session.emit_and_await_response("silent", &2, None).await;
        assert!(matches!(second, Err(SessionError::ListenerAlreadyInstalled(e)) if e == "silent"));

        let first = first.await.unwrap();
        assert!(matches!(first, Err(SessionError::Timeout { .. })));
        assert!(session.pending_calls().is_empty());
    }

    #[tokio::test]
    async fn subscription_sees_every_push() {
        let (cfg, _server) = echo_server().await;
        let session = NetworkSession::new(cfg, EventBus::new());
        session.connect(false).await.unwrap();

        let mut sub = session.subscribe("state");
        session.emit("state", &1).unwrap();
        session.emit("state", &2).unwrap();
        assert_eq!(sub.recv().await, Some(serde_json::json!(1)));
        assert_eq!(sub.recv().await, Some(serde_json::json!(2)));
    }

    #[tokio::test]
    async fn required_connection_loss_requests_reload() {
        let (cfg, _server) = echo_server().await;
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        for kind in [EventKind::ConnectionLost, EventKind::ReloadRequested] {
            let tx = tx.clone();
            bus.subscribe(kind, move |e| {
                let _ = tx.send(e.kind());
            });
        }
        let session = NetworkSession::new(cfg, bus);
        session.connect(true).await.unwrap();
        session.emit("bye", &()).unwrap();

        assert_eq!(rx.recv().await, Some(EventKind::ConnectionLost));
        assert_eq!(rx.recv().await, Some(EventKind::ReloadRequested));
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn deliberate_disconnect_is_silent() {
        let (cfg, _server) = echo_server().await;
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        bus.subscribe(EventKind::ReloadRequested, move |_| {
            let _ = tx.send(());
        });
        let session = NetworkSession::new(cfg, bus);
        session.connect(true).await.unwrap();
        session.disconnect();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn response_endpoint_is_reserved_alongside_request() {
        let (cfg, _server) = echo_server().await;
        let session = NetworkSession::new(cfg, EventBus::new());
        session.connect(false).await.unwrap();

        let caller = session.clone();
        let first = tokio::spawn(async move {
            caller
                .emit_and_await_response_timeout("a", &1, Some("b"), Some(Duration::from_secs(2)))
                .await
        });
        while session.pending_calls().len() < 2 {
            tokio::task::yield_now().await;
        }
        assert_eq!(session.pending_calls(), vec!["a".to_string(), "b".to_string()]);

        let on_response = session.emit_and_await_response("b", &2, None).await;
        assert!(matches!(on_response, Err(SessionError::ListenerAlreadyInstalled(e)) if e == "b"));
        let sharing_response = session.emit_and_await_response("c", &3, Some("b")).await;
        assert!(matches!(sharing_response, Err(SessionError::ListenerAlreadyInstalled(e)) if e == "c"));
        assert!(matches!(
            session.wait_for_message("a").await,
            Err(SessionError::ListenerAlreadyInstalled(_))
        ));

        // The echoed `b` settles the first call and nothing else.
        session.emit("b", &serde_json::json!("done")).unwrap();
        assert_eq!(first.await.unwrap().unwrap(), serde_json::json!("done"));
        assert!(session.pending_calls().is_empty());

        let late = session
            .emit_and_await_response_timeout("c", &4, Some("b"), Some(Duration::from_millis(50)))
            .await;
        assert!(matches!(late, Err(SessionError::Timeout { .. })));
        assert!(session.pending_calls().is_empty());
    }

    #[test]
    fn backoff_doubles_up_to_cap_and_resets() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        let delays: Vec<u64> = (0..4).map(|_| b.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 350, 350]);
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_millis(100));
    }
}
