//! Standalone development server binary.
//!
//! Usage:
//!   cargo run -p engine_server -- [--host 127.0.0.1] [--port 40000] [--tick-hz 20]
//!       [--token T] [--config server.json]
//!
//! Console commands:
//!   status  - Show server status
//!   reset   - Push `reset` to every peer
//!   kick    - Drop every peer
//!   quit    - Shutdown server

use std::env;
use std::io::{BufRead, Write};

use anyhow::Context;
use engine_server::GameServer;
use engine_shared::config::EngineConfig;
use tokio::sync::mpsc;
use tracing::info;

fn parse_args() -> anyhow::Result<EngineConfig> {
    let args: Vec<String> = env::args().collect();
    let mut cfg = EngineConfig::local("127.0.0.1", 40000);
    if let Some(pos) = args.iter().position(|a| a == "--config") {
        let path = args.get(pos + 1).context("--config needs a path")?;
        let text = std::fs::read_to_string(path).with_context(|| format!("read {path}"))?;
        cfg = EngineConfig::from_json_str(&text).with_context(|| format!("parse {path}"))?;
    }

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--host" if i + 1 < args.len() => {
                cfg.server_host = args[i + 1].clone();
                i += 2;
            }
            "--port" if i + 1 < args.len() => {
                cfg.server_port = args[i + 1].parse().context("parse --port")?;
                i += 2;
            }
            "--tick-hz" if i + 1 < args.len() => {
                cfg.tick_hz = args[i + 1].parse().unwrap_or(20);
                i += 2;
            }
            "--token" if i + 1 < args.len() => {
                cfg.auth_token = Some(args[i + 1].clone());
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(addr = %cfg.server_addr(), tick_hz = cfg.tick_hz, "Starting server");

    let server = GameServer::bind(cfg).await.context("create server")?;

    // Set up console input channel.
    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);

    // Spawn stdin reader thread.
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            if stdin.lock().read_line(&mut line).is_err() {
                break;
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    println!("Server ready on {}. Type 'status' for info, 'quit' to exit.", server.local_addr());
    println!();

    while let Some(line) = console_rx.recv().await {
        if matches!(line.as_str(), "quit" | "exit") {
            break;
        }
        match server.exec_console(&line) {
            Ok(output) => {
                for line in output {
                    println!("{line}");
                }
            }
            Err(e) => println!("Error: {e}"),
        }
    }

    info!("Server shutting down");
    server.shutdown();
    Ok(())
}
