use engine_client::{ApiClient, ApiError};
use engine_server::bind_ephemeral;
use engine_tests::{eventually, init_tracing};
use serde_json::json;

/// Smoke test: server ticks on its own and reports status.
#[tokio::test]
async fn server_reports_status() -> anyhow::Result<()> {
    init_tracing();
    let (server, cfg) = bind_ephemeral(64).await?;
    let state = server.state().clone();
    assert!(eventually(|| state.tick() >= 3).await);

    let api = ApiClient::from_config(&cfg)?;
    let status = api.get("/api/status").await?;
    assert_eq!(status["protocol"], json!(2));
    assert_eq!(status["peers"], json!(0));
    Ok(())
}

#[tokio::test]
async fn loadout_crud_and_error_messages() -> anyhow::Result<()> {
    init_tracing();
    let (_server, cfg) = bind_ephemeral(20).await?;
    let api = ApiClient::from_config(&cfg)?;

    let saved = api
        .post("/api/loadouts/striker", &json!({ "hull": "light", "guns": 2 }))
        .await?;
    assert_eq!(saved, json!({ "saved": "striker" }));
    assert_eq!(
        api.get("/api/loadouts/striker").await?,
        json!({ "hull": "light", "guns": 2 })
    );
    assert_eq!(api.get("/api/loadouts").await?, json!({ "loadouts": ["striker"] }));

    api.delete("/api/loadouts/striker").await?;
    match api.get("/api/loadouts/striker").await {
        Err(ApiError::Status { status, message }) => {
            assert_eq!(status, 404);
            assert_eq!(message, "loadout `striker` not found");
        }
        other => panic!("expected 404, got {other:?}"),
    }

    let err = api.post("/api/loadouts/bad", &json!([1, 2])).await.unwrap_err();
    assert_eq!(err.status(), Some(422));
    assert_eq!(api.delete("/api/loadouts/bad").await.unwrap_err().status(), Some(404));
    Ok(())
}

#[tokio::test]
async fn unknown_route_falls_back_to_raw_body() -> anyhow::Result<()> {
    init_tracing();
    let (_server, cfg) = bind_ephemeral(20).await?;
    let api = ApiClient::from_config(&cfg)?;
    match api.get("/api/nope").await {
        Err(ApiError::Status { status, message }) => {
            assert_eq!(status, 404);
            assert!(message.is_empty());
        }
        other => panic!("expected 404, got {other:?}"),
    }
    Ok(())
}
