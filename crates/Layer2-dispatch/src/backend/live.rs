//! Live input channels - JSON lines written to each sandbox's stdin

use crate::backend::SpawnContext;
use crate::key::{DispatchKey, Lane};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Pending lines per process before deliveries are refused
const LIVE_INPUT_CAPACITY: usize = 64;

/// One line on the sandbox's stdin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InputLine {
    /// First line: what to work on
    Input {
        prompt: String,
        #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        key: String,
        lane: Lane,
    },
    /// Follow-up message handed to a running process
    Message { text: String },
}

impl InputLine {
    fn to_line(&self) -> String {
        // Serializing plain strings cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

pub fn encode_initial_input(ctx: &SpawnContext) -> String {
    InputLine::Input {
        prompt: ctx.prompt.clone(),
        session_id: ctx.session_id.clone(),
        key: ctx.key.to_string(),
        lane: ctx.lane,
    }
    .to_line()
}

pub fn encode_message(text: &str) -> String {
    InputLine::Message {
        text: text.to_string(),
    }
    .to_line()
}

struct LiveChannel {
    name: String,
    tx: mpsc::Sender<String>,
}

/// Open stdin channels keyed by (key, lane)
///
/// Each channel is drained by its own writer task, so deliveries keep call
/// order and never wait on the process reading them. A process that stops
/// reading gets its backlog capped; further deliveries are refused. Dropping the sender
/// closes the process's stdin.
#[derive(Default)]
pub struct LiveInputs {
    channels: Mutex<HashMap<(DispatchKey, Lane), LiveChannel>>,
}

impl LiveInputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `stdin` and queue `first_line`
    pub fn open<W>(
        &self,
        key: &DispatchKey,
        lane: Lane,
        name: &str,
        mut stdin: W,
        first_line: String,
    ) where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<String>(LIVE_INPUT_CAPACITY);
        if tx.try_send(first_line).is_err() {
            warn!("[{}] could not queue initial input", name);
        }

        let writer_name = name.to_string();
        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                let written = async {
                    stdin.write_all(line.as_bytes()).await?;
                    stdin.write_all(b"\n").await?;
                    stdin.flush().await
                }
                .await;

                if let Err(e) = written {
                    debug!("[{}] stdin closed: {}", writer_name, e);
                    break;
                }
            }
            debug!("[{}] stdin writer finished", writer_name);
        });

        let previous = self.channels.lock().insert(
            (key.clone(), lane),
            LiveChannel {
                name: name.to_string(),
                tx,
            },
        );
        if let Some(previous) = previous {
            debug!("Replaced live input {} for {}/{}", previous.name, key, lane);
        }
    }

    /// Queue a line for the live process without waiting
    ///
    /// False if none is listening or its backlog is full.
    pub fn deliver(&self, key: &DispatchKey, lane: Lane, line: String) -> bool {
        let channels = self.channels.lock();
        let Some(channel) = channels.get(&(key.clone(), lane)) else {
            return false;
        };
        match channel.tx.try_send(line) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    "[{}] not reading stdin, {} lines pending; refusing input",
                    channel.name, LIVE_INPUT_CAPACITY
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Close stdin for `key`/`lane`; returns whether a channel was open
    pub fn close(&self, key: &DispatchKey, lane: Lane) -> bool {
        self.channels.lock().remove(&(key.clone(), lane)).is_some()
    }

    /// Forget the channel if it still belongs to process `name`
    pub fn release(&self, key: &DispatchKey, lane: Lane, name: &str) {
        let mut channels = self.channels.lock();
        let slot = (key.clone(), lane);
        if channels.get(&slot).is_some_and(|c| c.name == name) {
            channels.remove(&slot);
        }
    }

    pub fn is_open(&self, key: &DispatchKey, lane: Lane) -> bool {
        self.channels.lock().contains_key(&(key.clone(), lane))
    }
}
