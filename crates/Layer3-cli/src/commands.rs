//! Subcommand implementations

use anyhow::{bail, Context};
use async_trait::async_trait;
use corral_dispatch::{
    ContainerBackend, DispatchKey, DispatchQueue, Lane, LocalBackend, MessageHandler,
    OutputRecord, RunOutcome, RunRequest, SandboxBackend, SandboxRunner,
};
use corral_foundation::{CorralConfig, Error, Result};
use parking_lot::Mutex;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

/// Records buffered between the parser and the printer
const RECORD_BUFFER: usize = 32;

pub struct RunArgs {
    pub key: String,
    pub lane: Lane,
    pub local: Option<String>,
    pub prompt: String,
    pub session: Option<String>,
}

pub fn load_config(path: Option<&Path>) -> anyhow::Result<CorralConfig> {
    let config = match path {
        Some(path) => {
            let config = CorralConfig::load_file(path)
                .with_context(|| format!("failed to load {}", path.display()))?;
            config.validate()?;
            config
        }
        None => CorralConfig::load()?,
    };
    Ok(config)
}

pub fn print_config(config: &CorralConfig) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

pub fn read_prompt() -> anyhow::Result<String> {
    let mut prompt = String::new();
    std::io::stdin().read_to_string(&mut prompt)?;
    let prompt = prompt.trim().to_string();
    if prompt.is_empty() {
        bail!("no prompt given (use --prompt or pipe it on stdin)");
    }
    Ok(prompt)
}

fn container_backend(config: &CorralConfig) -> ContainerBackend {
    ContainerBackend::new(config.container.clone(), config.runner.grace_period())
}

/// Message handler that performs exactly one queued run
struct OneShotHandler {
    runner: SandboxRunner,
    request: Mutex<Option<RunRequest>>,
    done: Mutex<Option<oneshot::Sender<Result<RunOutcome>>>>,
}

#[async_trait]
impl MessageHandler for OneShotHandler {
    async fn process_messages(&self, _key: &DispatchKey) -> Result<bool> {
        let Some(request) = self.request.lock().take() else {
            return Ok(true);
        };

        let result = self.runner.run(request).await;
        let success = result.is_ok();
        if let Some(done) = self.done.lock().take() {
            let _ = done.send(result);
        }
        Ok(success)
    }
}

pub async fn run(config: &CorralConfig, args: RunArgs) -> anyhow::Result<()> {
    let queue = DispatchQueue::from_config(config);
    let backend: Arc<dyn SandboxBackend> = match &args.local {
        Some(command) => Arc::new(LocalBackend::new(command.clone())),
        None => Arc::new(container_backend(config)),
    };
    let runner = SandboxRunner::from_config(queue.clone(), backend, config);
    let key = queue.resolve(&args.key);
    let lane = args.lane;

    let (tx, rx) = mpsc::channel(RECORD_BUFFER);
    let printer = tokio::spawn(print_records(rx, queue.clone(), key.clone(), lane));

    let mut request = RunRequest::new(key.clone(), lane, args.prompt.clone()).with_stream(tx);
    request.session_id = args.session;

    let (done_tx, done_rx) = oneshot::channel();
    match lane {
        Lane::Message => {
            queue.set_message_handler(Arc::new(OneShotHandler {
                runner,
                request: Mutex::new(Some(request)),
                done: Mutex::new(Some(done_tx)),
            }));
            queue.enqueue_check(key.as_str());
        }
        Lane::Task => {
            let preview: String = args.prompt.chars().take(60).collect();
            let task_id = format!("cli-{}", uuid::Uuid::new_v4());
            let submission = queue.enqueue_task(key.as_str(), task_id, preview, move || async move {
                match runner.run(request).await {
                    Ok(outcome) => {
                        let _ = done_tx.send(Ok(outcome));
                        Ok(())
                    }
                    Err(e) => {
                        let _ = done_tx.send(Err(Error::Internal(e.to_string())));
                        Err(e)
                    }
                }
            })?;
            if submission.is_duplicate() {
                bail!("task already running for {}", key);
            }
        }
    }

    let outcome = tokio::select! {
        result = done_rx => result.map_err(|_| Error::Cancelled)?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, shutting down");
            queue.shutdown(config.queue.shutdown_deadline()).await;
            bail!("interrupted");
        }
    };

    let _ = printer.await;
    queue.shutdown(config.queue.shutdown_deadline()).await;

    let outcome = outcome?;
    info!(
        "Run finished: {:?} ({} records, exit {:?})",
        outcome.status, outcome.records, outcome.exit_code
    );
    if let Some(session) = &outcome.new_session_id {
        info!("Session: {}", session);
    }
    if let Some(error) = &outcome.error {
        bail!("agent reported an error: {}", error);
    }
    Ok(())
}

/// Print each record; close the process once it delivered a final result
async fn print_records(
    mut rx: mpsc::Receiver<OutputRecord>,
    queue: DispatchQueue,
    key: DispatchKey,
    lane: Lane,
) {
    while let Some(record) = rx.recv().await {
        match (&record.result, &record.error) {
            (Some(result), _) => println!("{}", result),
            (None, Some(error)) => eprintln!("error: {}", error),
            (None, None) => {}
        }
        if !record.intermediate {
            queue.close_stdin(key.as_str(), lane).await;
        }
    }
}

pub async fn cleanup(config: &CorralConfig) -> anyhow::Result<()> {
    let backend = container_backend(config);
    if !backend.is_available().await {
        bail!(
            "{} is not available",
            config.container.runtime.command()
        );
    }

    let stopped = backend.cleanup_orphans().await?;
    if stopped.is_empty() {
        println!("No orphaned containers");
    } else {
        for name in &stopped {
            println!("Stopped {}", name);
        }
    }
    Ok(())
}
