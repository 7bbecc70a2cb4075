//! Full socket-based integration tests for client ↔ server communication.

use std::time::Duration;

use engine_client::{entity::lock, Backoff, GameClient, SessionError};
use engine_server::{bind_ephemeral, GameServer};
use engine_shared::{
    bindings::Device,
    net::{endpoints, EntityId, ErrorBody, JoinRequest},
    settings::Settings,
};
use engine_tests::{eventually, init_tracing, joined_client};
use serde_json::json;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ping_round_trip() -> anyhow::Result<()> {
    init_tracing();
    let (_server, cfg) = bind_ephemeral(20).await?;
    let client = GameClient::new(cfg, Settings::new())?;
    client.connect().await?;

    let echoed = client
        .session()
        .emit_and_await_response(endpoints::PING, &json!({ "seq": 7 }), None)
        .await?;
    assert_eq!(echoed, json!({ "seq": 7 }));
    assert!(client.session().pending_calls().is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_wait_on_same_endpoint_fails_fast() -> anyhow::Result<()> {
    init_tracing();
    let (server, cfg) = bind_ephemeral(20).await?;
    let client = GameClient::new(cfg, Settings::new())?;
    client.connect().await?;

    let session = client.session().clone();
    let first = tokio::spawn(async move { session.wait_for_message(endpoints::RESET).await });
    let session = client.session();
    assert!(eventually(|| !session.pending_calls().is_empty()).await);

    let second = session.wait_for_message(endpoints::RESET).await;
    assert!(matches!(second, Err(SessionError::ListenerAlreadyInstalled(_))));

    // The first wait is undisturbed and still resolves.
    server.state().broadcast_reset();
    first.await??;
    assert!(session.pending_calls().is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_token_is_rejected() -> anyhow::Result<()> {
    init_tracing();
    let (_server, mut cfg) = bind_ephemeral(20).await?;
    cfg.auth_token = None;
    let client = GameClient::new(cfg, Settings::new())?;
    assert!(client.connect().await.is_err());
    assert!(!client.session().is_connected());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn key_press_reaches_server_and_state_comes_back() -> anyhow::Result<()> {
    init_tracing();
    let (server, cfg) = bind_ephemeral(50).await?;
    let mut client = joined_client(&cfg).await?;
    let id = client.local_id().expect("joined");
    assert!(client.controls().is_registered(id));

    // FORWARD is bound to keyboard 87 with wire id 5.
    client.controls_mut().key_down(87);
    let state = server.state().clone();
    assert!(eventually(|| state.entity_input(id).is_some_and(|f| f.actions == vec![(5, 1.0)])).await);

    let handle = client.local_entity().expect("local entity");
    let moved = eventually(|| {
        client.pump();
        lock(&handle).body().is_some_and(|b| b.position[0] > 0.0)
    })
    .await;
    assert!(moved, "authoritative state never moved the ship");

    client.controls_mut().key_up(87);
    assert!(eventually(|| state.entity_input(id).is_some_and(|f| f.actions.is_empty())).await);
    client.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn peers_see_each_other() -> anyhow::Result<()> {
    init_tracing();
    let (_server, cfg) = bind_ephemeral(50).await?;
    let mut a = joined_client(&cfg).await?;
    let mut b = joined_client(&cfg).await?;
    let a_id: EntityId = a.local_id().expect("a joined");

    assert!(eventually(|| {
        b.pump();
        b.entity(a_id).is_some()
    })
    .await);

    a.controls_mut().mouse_down(0);
    let remote = b.entity(a_id).expect("remote entity");
    let fired = eventually(|| {
        b.pump();
        lock(&remote).get_action_value(1) == 1.0
    })
    .await;
    assert!(fired);
    assert_eq!(lock(&remote).actions().and_then(|s| s.device()), Some(Device::Mouse));

    a.shutdown();
    assert!(eventually(|| {
        b.pump();
        b.entity(a_id).is_none()
    })
    .await);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_reset_clears_local_input() -> anyhow::Result<()> {
    init_tracing();
    let (server, cfg) = bind_ephemeral(20).await?;
    let mut client = joined_client(&cfg).await?;
    client.controls_mut().key_down(87);
    let handle = client.local_entity().expect("local entity");
    assert_eq!(lock(&handle).get_action_value(5), 1.0);

    server.state().broadcast_reset();
    assert!(eventually(|| {
        client.pump();
        lock(&handle).get_action_value(5) == 0.0
    })
    .await);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn losing_required_connection_requests_reload() -> anyhow::Result<()> {
    init_tracing();
    let (server, cfg) = bind_ephemeral(20).await?;
    let mut client = joined_client(&cfg).await?;

    server.state().kick_all();
    assert!(eventually(|| client.take_reload_request()).await);
    assert!(!client.session().is_connected());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deliberate_shutdown_does_not_reload() -> anyhow::Result<()> {
    init_tracing();
    let (_server, cfg) = bind_ephemeral(20).await?;
    let mut client = joined_client(&cfg).await?;
    client.shutdown();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!client.take_reload_request());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_shutdown_requests_reload() -> anyhow::Result<()> {
    init_tracing();
    let (server, cfg) = bind_ephemeral(20).await?;
    let mut client = joined_client(&cfg).await?;

    server.shutdown();
    assert!(eventually(|| client.take_reload_request()).await);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rebuilt_client_rejoins_after_server_restart() -> anyhow::Result<()> {
    init_tracing();
    let (server, cfg) = bind_ephemeral(20).await?;
    server.shutdown();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut down = GameClient::new(cfg.clone(), Settings::new())?;
    assert!(down.connect().await.is_err());
    down.shutdown();

    let _restarted = GameServer::bind(cfg.clone()).await?;
    let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(100));
    let mut joined = None;
    for _ in 0..20 {
        let mut client = GameClient::new(cfg.clone(), Settings::new())?;
        if client.connect().await.is_ok() {
            joined = Some(client.join().await?);
            client.shutdown();
            break;
        }
        client.shutdown();
        tokio::time::sleep(backoff.next_delay()).await;
    }
    assert!(joined.is_some());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn join_with_wrong_protocol_returns_error_body() -> anyhow::Result<()> {
    init_tracing();
    let (server, cfg) = bind_ephemeral(20).await?;
    let client = GameClient::new(cfg, Settings::new())?;
    client.connect().await?;

    let request = JoinRequest {
        protocol: 1,
        kind: "ship".to_string(),
    };
    let reply: ErrorBody = client.session().request(endpoints::JOIN, &request, None).await?;
    assert_eq!(reply.message, "protocol 1 != 2");
    assert_eq!(server.state().entity_count(), 0);
    Ok(())
}
