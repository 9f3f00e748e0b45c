//! Freeman Relay - the network layer as a JSON-lines process
//!
//! Each stdin line is one call, `{"seq": 1, "call": "connect", ...}`.
//! Stdout carries replies (`{"type":"reply","seq":1,"result":{...}}`) and
//! events (`{"type":"event","channel":"message:ws-1","payload":{...}}`).
//! EOF, Ctrl-C or a `shutdown` call closes every connection before exit.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;

use freeman_relay::constants::{APP_NAME, APP_VERSION};
use freeman_relay::{
    Call, Config, ErrorKind, ErrorPayload, EventForwarder, EventPayload, NetworkActor,
    NetworkCommand, Reply,
};

/// How long buffered events get to reach stdout after shutdown
const EVENT_DRAIN: Duration = Duration::from_millis(500);

#[derive(Deserialize)]
struct Inbound {
    seq: u64,
    #[serde(flatten)]
    call: Call,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Outbound {
    Reply { seq: u64, result: Reply },
    Event { channel: String, payload: EventPayload },
    /// A line that could not be read as a call
    Error { seq: Option<u64>, error: ErrorPayload },
}

fn init_logging(config: &Config) -> tracing_appender::non_blocking::WorkerGuard {
    let dir = config
        .log_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let name = config
        .log_file
        .file_name()
        .unwrap_or(OsStr::new("freeman-relay.log"));

    // Initialize logging to file; stdout belongs to the protocol
    let file_appender = tracing_appender::rolling::never(dir, name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_max_level(config.log_level())
        .init();
    guard
}

fn parse_line(line: &str) -> Result<Inbound, Outbound> {
    serde_json::from_str::<Inbound>(line).map_err(|e| {
        let seq = serde_json::from_str::<serde_json::Value>(line)
            .ok()
            .and_then(|v| v.get("seq").and_then(|s| s.as_u64()));
        Outbound::Error {
            seq,
            error: ErrorPayload::new(ErrorKind::InvalidOptions, e.to_string()),
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("loading configuration")?;
    let _guard = init_logging(&config);
    tracing::info!(version = APP_VERSION, "{} starting", APP_NAME);

    // Subscribe before anything can emit
    let forwarder = EventForwarder::new(config.topic_capacity);
    let mut all_events = forwarder.subscribe_all();
    let sink = forwarder.start();

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<NetworkCommand>();
    let actor = tokio::spawn(NetworkActor::new(&config, sink).run(cmd_rx));

    // Single stdout writer
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(out) = out_rx.recv().await {
            let mut line = match serde_json::to_string(&out) {
                Ok(line) => line,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to encode output line");
                    continue;
                }
            };
            line.push('\n');
            if stdout.write_all(line.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
                tracing::warn!("Stdout closed");
                break;
            }
        }
    });

    let event_tx = out_tx.clone();
    let events = tokio::spawn(async move {
        loop {
            match all_events.recv().await {
                Ok(event) => {
                    let out = Outbound::Event {
                        channel: event.channel(),
                        payload: event.payload,
                    };
                    if event_tx.send(out).is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Event output lagged, dropped events");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut calls = JoinSet::new();
    let mut shutdown_seq = None;

    loop {
        tokio::select! {
            biased;

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }

            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match parse_line(&line) {
                    Ok(Inbound { seq, call: Call::Shutdown }) => {
                        shutdown_seq = Some(seq);
                        break;
                    }
                    Ok(Inbound { seq, call }) => {
                        let (reply_tx, reply_rx) = oneshot::channel();
                        if cmd_tx.send(NetworkCommand { call, reply_tx }).is_err() {
                            break;
                        }
                        let out_tx = out_tx.clone();
                        calls.spawn(async move {
                            if let Ok(result) = reply_rx.await {
                                let _ = out_tx.send(Outbound::Reply { seq, result });
                            }
                        });
                    }
                    Err(out) => {
                        tracing::warn!(line = %line, "Rejected input line");
                        let _ = out_tx.send(out);
                    }
                },
                Ok(None) => {
                    tracing::info!("Stdin closed");
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to read stdin");
                    break;
                }
            },

            // Clean up completed tasks
            Some(_) = calls.join_next() => {}
        }
    }

    // Full cleanup: the actor closes every connection before replying
    let (reply_tx, reply_rx) = oneshot::channel();
    let result = match cmd_tx.send(NetworkCommand {
        call: Call::Shutdown,
        reply_tx,
    }) {
        Ok(()) => reply_rx.await.unwrap_or_else(|_| Reply::ack(Ok(()))),
        Err(_) => Reply::ack(Ok(())),
    };
    if let Err(e) = actor.await {
        tracing::error!(error = %e, "Network actor ended abnormally");
    }
    if let Some(seq) = shutdown_seq {
        let _ = out_tx.send(Outbound::Reply { seq, result });
    }

    while calls.join_next().await.is_some() {}
    drop(forwarder);
    if tokio::time::timeout(EVENT_DRAIN, events).await.is_err() {
        tracing::warn!("Event output did not drain in time");
    }
    drop(out_tx);
    let _ = writer.await;

    tracing::info!("{} stopped", APP_NAME);
    Ok(())
}
