//! Channels: long-running connectors that translate external chat events
//! into turns and relay replies back.
//!
//! A channel task connects with exponential backoff (base 1s, cap 60s,
//! ±20% jitter), then loops `recv → submit turn → send`. Receive errors
//! re-enter the backoff loop; the cancellation token stops the task.

pub mod telegram;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::PithError;
use crate::runtime::{Runtime, RuntimeCommand};

/// A message arriving from the outside world.
#[derive(Debug, Clone)]
pub struct Incoming {
    /// Where the reply should go (e.g. a chat id).
    pub conversation: String,
    pub sender: String,
    pub text: String,
}

/// A reply leaving through the channel.
#[derive(Debug, Clone)]
pub struct Outgoing {
    pub conversation: String,
    pub text: String,
}

/// A connector to one external chat surface.
#[async_trait]
pub trait Channel: Send {
    fn name(&self) -> &str;

    /// Establish (or re-establish) the connection.
    async fn connect(&mut self) -> Result<(), PithError>;

    /// Block until the next external input arrives.
    async fn recv(&mut self) -> Result<Incoming, PithError>;

    /// Deliver a reply.
    async fn send(&mut self, out: Outgoing) -> Result<(), PithError>;
}

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Apply ±20% jitter to a backoff delay.
fn jittered(d: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8..1.2);
    d.mul_f64(factor)
}

/// Supervise a channel for the life of the process.
pub fn spawn_channel(
    mut channel: Box<dyn Channel>,
    runtime: Arc<Runtime>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let name = channel.name().to_string();
        let mut backoff = BACKOFF_BASE;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = channel.connect() => {
                    if let Err(e) = result {
                        warn!(channel = %name, error = %e, delay = ?backoff, "channel connect failed, backing off");
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(jittered(backoff)) => {}
                        }
                        backoff = (backoff * 2).min(BACKOFF_CAP);
                        continue;
                    }
                }
            }
            info!(channel = %name, "channel connected");
            backoff = BACKOFF_BASE;

            loop {
                let incoming = tokio::select! {
                    _ = cancel.cancelled() => return,
                    r = channel.recv() => match r {
                        Ok(msg) => msg,
                        Err(e) => {
                            warn!(channel = %name, error = %e, "channel receive failed, reconnecting");
                            break;
                        }
                    }
                };

                let reply = handle_incoming(&runtime, &incoming).await;
                if let Err(e) = channel
                    .send(Outgoing {
                        conversation: incoming.conversation.clone(),
                        text: reply,
                    })
                    .await
                {
                    warn!(channel = %name, error = %e, "channel send failed");
                }
            }
        }
        debug!(channel = %name, "channel task stopped");
    })
}

/// Turn one external message into a reply via the runtime.
async fn handle_incoming(runtime: &Arc<Runtime>, incoming: &Incoming) -> String {
    let text = incoming.text.trim();

    // Slash commands map straight onto runtime commands.
    if let Some(cmd) = text.strip_prefix('/').and_then(RuntimeCommand::parse) {
        let session_id = match runtime.store().ensure_active_session() {
            Ok(id) => id,
            Err(e) => return format!("error: {e}"),
        };
        return match runtime.run_command(&session_id, cmd).await {
            Ok(value) => match cmd {
                RuntimeCommand::New => format!(
                    "new session {}",
                    value["session_id"].as_str().unwrap_or("?")
                ),
                RuntimeCommand::Compact => {
                    value["result"].as_str().unwrap_or("compacted").to_string()
                }
                RuntimeCommand::Info => {
                    serde_json::to_string_pretty(&value).unwrap_or_default()
                }
            },
            Err(e) => format!("error: {e}"),
        };
    }

    let session_id = match runtime.store().ensure_active_session() {
        Ok(id) => id,
        Err(e) => return format!("error: {e}"),
    };
    match runtime.submit_turn(&session_id, text, None).await {
        Ok(outcome) => outcome.reply,
        Err(PithError::Busy) => "still working on the previous message — one moment".to_string(),
        Err(e) => format!("error: {e}"),
    }
}
