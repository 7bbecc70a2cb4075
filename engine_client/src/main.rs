//! Standalone headless client binary.
//!
//! Usage:
//!   cargo run -p engine_client -- [--host 127.0.0.1] [--port 40000] [--token T]
//!       [--dev] [--config client.json] [--storage local.json] [--settings settings.json]
//!
//! Connects, joins with the configured entity kind and drives it from
//! console commands. Losing the connection rebuilds the client from scratch,
//! retrying with backoff until the server is reachable again.
//!
//! Built with `--features gilrs`, a native controller feeds the same pad
//! slot the `pad` command writes to.
//!
//! Console commands:
//!   status                    - Show client status
//!   server                    - Query the server's HTTP status endpoint
//!   press <keycode>           - Key down
//!   release <keycode>         - Key up
//!   click <button>            - Mouse button down
//!   unclick <button>          - Mouse button up
//!   move <dx> <dy>            - Mouse movement
//!   pad <a0> <a1> [b0 ...]    - Set virtual controller axes and buttons
//!   pad off                   - Disconnect the virtual controller
//!   ping                      - Measure round-trip time
//!   set <key> <json>          - Change a setting
//!   reset                     - Release all input
//!   quit                      - Exit client

use std::env;
use std::io::{BufRead, Write};
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use engine_client::{
    entity::lock,
    gamepad::{GamepadSlot, GamepadSource, GamepadState},
    Backoff, GameClient,
};
use engine_shared::{
    config::{EngineConfig, LocalStorage},
    net::{endpoints, EntityId},
    settings::Settings,
};
use tokio::sync::mpsc;
use tracing::{info, warn};

struct Options {
    config: EngineConfig,
    settings: Settings,
}

fn parse_args() -> anyhow::Result<Options> {
    let args: Vec<String> = env::args().collect();
    let value = |i: usize| args.get(i + 1).cloned();

    // Config sources first, flags override them.
    let mut config = EngineConfig::default();
    let mut settings = Settings::new();
    let mut i = 1;
    while i < args.len() {
        match (args[i].as_str(), value(i)) {
            ("--config", Some(path)) => {
                let text = std::fs::read_to_string(&path).with_context(|| format!("read {path}"))?;
                config = EngineConfig::from_json_str(&text).with_context(|| format!("parse {path}"))?;
            }
            ("--storage", Some(path)) => {
                config = EngineConfig::from_storage(&LocalStorage::open(&path)?);
            }
            ("--settings", Some(path)) => {
                let text = std::fs::read_to_string(&path).with_context(|| format!("read {path}"))?;
                settings = Settings::from_json_str(&text).with_context(|| format!("parse {path}"))?;
            }
            _ => {}
        }
        i += 1;
    }

    let mut i = 1;
    while i < args.len() {
        match (args[i].as_str(), value(i)) {
            ("--host", Some(host)) => {
                config.server_host = host;
                i += 2;
            }
            ("--port", Some(port)) => {
                config.server_port = port.parse().context("parse --port")?;
                i += 2;
            }
            ("--token", Some(token)) => {
                config.auth_token = Some(token);
                i += 2;
            }
            ("--dev", _) => {
                config.dev = true;
                config.secure = false;
                i += 1;
            }
            _ => i += 1,
        }
    }
    Ok(Options { config, settings })
}

enum Exit {
    Quit,
    Reload,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let Options { config, settings } = parse_args()?;
    info!(server = %config.server_addr(), dev = config.dev, "Starting client");

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

    let pad = GamepadSlot::new();
    #[cfg(feature = "gilrs")]
    let _native_pad = engine_client::gilrs_backend::GilrsBackend::spawn(pad.clone(), config.poll_interval())
        .context("start gilrs thread")?;
    let mut backoff = Backoff::default();
    loop {
        let mut client = GameClient::new(config.clone(), settings.clone())?;
        match start(&mut client).await {
            Ok(entity) => {
                backoff.reset();
                println!("Joined as {entity:?}. Type 'status' for info, 'quit' to exit.");
            }
            Err(e) => {
                client.shutdown();
                let delay = backoff.next_delay();
                warn!(error = %format!("{e:#}"), retry_ms = delay.as_millis() as u64, "Server unreachable; retrying");
                if wait_or_quit(&mut console_rx, delay).await {
                    break;
                }
                continue;
            }
        }

        match run(&mut client, &mut console_rx, &pad).await? {
            Exit::Quit => {
                client.shutdown();
                break;
            }
            Exit::Reload => {
                warn!("Connection lost; rebuilding client");
                client.shutdown();
                if wait_or_quit(&mut console_rx, backoff.next_delay()).await {
                    break;
                }
            }
        }
    }
    Ok(())
}

async fn start(client: &mut GameClient) -> anyhow::Result<EntityId> {
    client.connect().await?;
    client.join().await
}

/// Sleeps for `delay` while still honouring `quit`. Returns true on quit.
async fn wait_or_quit(console_rx: &mut mpsc::Receiver<String>, delay: Duration) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return false,
            line = console_rx.recv() => match line.as_deref() {
                Some("quit" | "exit") => return true,
                Some(_) => println!("Not connected"),
                None => {
                    (&mut sleep).await;
                    return false;
                }
            },
        }
    }
}

async fn run(
    client: &mut GameClient,
    console_rx: &mut mpsc::Receiver<String>,
    pad: &GamepadSlot,
) -> anyhow::Result<Exit> {
    let mut ticker = tokio::time::interval(client.config().tick_interval());
    let mut frames: u64 = 0;
    loop {
        ticker.tick().await;

        while let Ok(line) = console_rx.try_recv() {
            match exec_console(client, pad, &line).await {
                Ok(Some(output)) => {
                    for line in output {
                        println!("{line}");
                    }
                }
                Ok(None) => return Ok(Exit::Quit),
                Err(e) => println!("Error: {e:#}"),
            }
        }

        if pad.connected() && !client.controls().controller_active() {
            client.controls_mut().controller_connected(pad.clone());
        }
        let stats = client.pump();
        frames += 1;
        if frames % 200 == 0 {
            info!(entities = client.entity_count(), states = stats.states, "Client tick");
        }
        if client.take_reload_request() {
            return Ok(Exit::Reload);
        }
    }
}

fn arg<T: std::str::FromStr>(tokens: &[&str], i: usize, usage: &str) -> anyhow::Result<T> {
    match tokens.get(i).map(|t| t.parse::<T>()) {
        Some(Ok(v)) => Ok(v),
        _ => bail!("Usage: {usage}"),
    }
}

/// Runs one console line. `None` means quit.
async fn exec_console(
    client: &mut GameClient,
    pad: &GamepadSlot,
    line: &str,
) -> anyhow::Result<Option<Vec<String>>> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let Some(&command) = tokens.first() else {
        return Ok(Some(Vec::new()));
    };

    let out = match command {
        "status" => {
            let mut out = vec![
                format!("Server: {}", client.config().server_addr()),
                format!("Connected: {}", client.session().is_connected()),
                format!("Entities: {}", client.entity_count()),
                format!("Controller: {}", client.controls().controller_active()),
            ];
            if let Some(handle) = client.local_entity() {
                let entity = lock(&handle);
                out.push(format!("Local: {:?} ({})", entity.id(), entity.kind()));
                if let Some(actions) = entity.actions() {
                    out.push(format!("Actions: {:?}", actions.iter().collect::<Vec<_>>()));
                }
                if let Some(body) = entity.body() {
                    out.push(format!("Position: {:?}", body.position));
                }
            }
            out
        }
        "server" => {
            let status = client.api().get("/api/status").await?;
            vec![status.to_string()]
        }
        "press" => {
            let n = client.controls_mut().key_down(arg(&tokens, 1, "press <keycode>")?);
            vec![format!("{n} action update(s)")]
        }
        "release" => {
            let n = client.controls_mut().key_up(arg(&tokens, 1, "release <keycode>")?);
            vec![format!("{n} action update(s)")]
        }
        "click" => {
            let n = client.controls_mut().mouse_down(arg(&tokens, 1, "click <button>")?);
            vec![format!("{n} action update(s)")]
        }
        "unclick" => {
            let n = client.controls_mut().mouse_up(arg(&tokens, 1, "unclick <button>")?);
            vec![format!("{n} action update(s)")]
        }
        "move" => {
            let dx = arg(&tokens, 1, "move <dx> <dy>")?;
            let dy = arg(&tokens, 2, "move <dx> <dy>")?;
            client.controls_mut().on_mouse_move(dx, dy);
            vec![]
        }
        "pad" if tokens.get(1) == Some(&"off") => {
            pad.disconnect();
            vec!["Controller disconnected".to_string()]
        }
        "pad" => {
            let values = tokens[1..]
                .iter()
                .map(|t| t.parse::<f32>())
                .collect::<Result<Vec<_>, _>>()
                .context("Usage: pad <a0> <a1> [b0 ...]")?;
            if values.len() < 2 {
                bail!("Usage: pad <a0> <a1> [b0 ...]");
            }
            pad.update(GamepadState {
                axes: values[..2].to_vec(),
                buttons: values[2..].to_vec(),
            });
            vec![]
        }
        "ping" => {
            let start = Instant::now();
            client
                .session()
                .emit_and_await_response(endpoints::PING, &serde_json::json!({ "ping": true }), None)
                .await?;
            vec![format!("RTT: {:.1} ms", start.elapsed().as_secs_f64() * 1000.0)]
        }
        "set" => {
            if tokens.len() < 3 {
                bail!("Usage: set <key> <json>");
            }
            let value = serde_json::from_str(&tokens[2..].join(" ")).context("parse value")?;
            client.set_setting(tokens[1], value);
            vec![format!("{} updated", tokens[1])]
        }
        "reset" => {
            client.reset_input();
            vec!["Input released".to_string()]
        }
        "quit" | "exit" => return Ok(None),
        other => vec![format!("Unknown command: {other}")],
    };
    Ok(Some(out))
}
