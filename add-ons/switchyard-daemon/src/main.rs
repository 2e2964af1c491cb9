//! Line-oriented support daemon. Reads `session_id<TAB>message` from stdin and writes one
//! JSON reply per line. `/cancel <id>` and `/end <id>` control sessions.

use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use switchyard_core::{
    BroadcastSink, CoreConfig, FanoutSink, KvStore, SharedSink, SledStore, TracingSink,
};
use switchyard_skills::SupportDesk;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn open(config: &CoreConfig) -> Result<(Arc<SledStore>, SupportDesk, BroadcastSink), String> {
    let path = Path::new(&config.storage_path).join("switchyard_db");
    let store = Arc::new(
        SledStore::open_path(&path).map_err(|e| format!("open {}: {e}", path.display()))?,
    );
    let broadcast = BroadcastSink::new(1024);
    let events: SharedSink = Arc::new(
        FanoutSink::new()
            .with(Arc::new(TracingSink))
            .with(Arc::new(broadcast.clone())),
    );
    let kv: Arc<dyn KvStore> = store.clone();
    let desk = SupportDesk::build(config, kv, events).map_err(|e| format!("build desk: {e}"))?;
    Ok((store, desk, broadcast))
}

/// Pre-flight check: config parses, storage opens, every blueprint capability resolves.
fn run_verify() -> Result<(), String> {
    let config = CoreConfig::load().map_err(|e| format!("config load failed: {e}"))?;
    let (_store, desk, _) = open(&config)?;
    println!(
        "{} ok: storage {}, capabilities {:?}",
        config.app_name,
        config.storage_path,
        desk.providers.capabilities()
    );
    Ok(())
}

/// Logs circuit transitions and guardrail violations seen on the event bus.
async fn watch_events(mut rx: broadcast::Receiver<switchyard_core::CoreEvent>) {
    use switchyard_core::CoreEvent;
    loop {
        match rx.recv().await {
            Ok(CoreEvent::CircuitTransition { target, from, to }) => {
                tracing::warn!(target: "switchyard::daemon", %target, ?from, ?to, "breaker moved");
            }
            Ok(CoreEvent::GuardrailViolation(v)) => {
                tracing::warn!(target: "switchyard::daemon", provider = %v.provider, kind = ?v.kind, "guardrail violation");
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::debug!(target: "switchyard::daemon", skipped = n, "event watcher lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[switchyard-daemon] .env not loaded: {e} (using system environment)");
    }

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--verify") {
        match run_verify() {
            Ok(()) => std::process::exit(0),
            Err(e) => {
                eprintln!("pre-flight failed: {e}");
                std::process::exit(1);
            }
        }
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match CoreConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("config load failed: {e}");
            std::process::exit(1);
        }
    };
    let (store, desk, events) = match open(&config) {
        Ok(parts) => parts,
        Err(e) => {
            eprintln!("startup failed: {e}");
            std::process::exit(1);
        }
    };
    tokio::spawn(watch_events(events.subscribe()));

    let orchestrator = desk.orchestrator.clone();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err()
                || stdout.write_all(b"\n").await.is_err()
            {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    tracing::info!(target: "switchyard::daemon", app = %config.app_name, "reading stdin");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(target: "switchyard::daemon", error = %e, "stdin read failed");
                    break;
                }
            },
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(id) = line.strip_prefix("/cancel ") {
            let cancelled = orchestrator.cancel(id.trim());
            let _ = out_tx
                .send(json!({ "session_id": id.trim(), "cancelled": cancelled }).to_string())
                .await;
            continue;
        }
        if let Some(id) = line.strip_prefix("/end ") {
            let id = id.trim().to_string();
            let orchestrator = orchestrator.clone();
            let out_tx = out_tx.clone();
            tokio::spawn(async move {
                let ended = orchestrator.end_session(&id).await.is_ok();
                let _ = out_tx
                    .send(json!({ "session_id": id, "ended": ended }).to_string())
                    .await;
            });
            continue;
        }

        let Some((session_id, message)) = line.split_once('\t') else {
            tracing::warn!(target: "switchyard::daemon", "expected session_id<TAB>message");
            continue;
        };
        let session_id = session_id.to_string();
        let message = message.to_string();
        let orchestrator = orchestrator.clone();
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            let line = match orchestrator.handle(&session_id, &message).await {
                Ok(reply) => json!({ "session_id": session_id, "reply": reply }).to_string(),
                Err(e) => {
                    tracing::error!(target: "switchyard::daemon", %session_id, error = %e, "turn failed");
                    json!({
                        "session_id": session_id,
                        "reply": {
                            "text": "I'm experiencing technical difficulties. Please try again in a moment.",
                            "kind": "answer",
                        }
                    })
                    .to_string()
                }
            };
            let _ = out_tx.send(line).await;
        });
    }

    drop(out_tx);
    let _ = writer.await;
    if let Err(e) = store.flush() {
        tracing::error!(target: "switchyard::daemon", error = %e, "flush failed");
    }
    tracing::info!(target: "switchyard::daemon", "shutdown");
}
