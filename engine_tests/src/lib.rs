//! Shared helpers for the cross-crate integration tests.

use std::time::Duration;

use engine_client::GameClient;
use engine_shared::{config::EngineConfig, settings::Settings};

/// Installs a test-writer subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

/// Polls `check` every 10 ms for up to two seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// A client connected to `cfg` that has joined with its configured kind.
pub async fn joined_client(cfg: &EngineConfig) -> anyhow::Result<GameClient> {
    let mut client = GameClient::new(cfg.clone(), Settings::new())?;
    client.connect().await?;
    client.join().await?;
    Ok(client)
}
