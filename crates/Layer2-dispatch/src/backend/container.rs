//! Container backend - Docker/Podman via the runtime CLI
//!
//! Each process is `<runtime> run -i --rm` of the configured image. Live
//! input is JSON lines on the CLI's stdin, which the runtime forwards into
//! the container; closing it ends the session.

use super::{attach_child, LiveInputs, SandboxBackend, SpawnContext, SpawnedChild, TerminateSignal};
use crate::handle::ProcessHandle;
use crate::key::{DispatchKey, Lane};
use async_trait::async_trait;
use corral_foundation::{ContainerSettings, Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Label marking containers owned by corral
pub const MANAGED_LABEL: &str = "corral.managed";

/// Container backend
pub struct ContainerBackend {
    settings: ContainerSettings,
    grace_period: Duration,
    live: Arc<LiveInputs>,
}

impl ContainerBackend {
    pub fn new(settings: ContainerSettings, grace_period: Duration) -> Self {
        Self {
            settings,
            grace_period,
            live: Arc::new(LiveInputs::new()),
        }
    }

    fn command(&self) -> &'static str {
        self.settings.runtime.command()
    }

    /// Unique container name for one spawn
    pub fn container_name(&self, key: &DispatchKey, lane: Lane) -> String {
        let safe_key: String = key
            .as_str()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        let suffix = Uuid::new_v4().simple().to_string();
        format!(
            "{}-{}-{}-{}",
            self.settings.name_prefix,
            safe_key,
            lane,
            &suffix[..8]
        )
    }

    /// Arguments after `run`
    pub fn build_run_args(&self, name: &str, ctx: &SpawnContext) -> Vec<String> {
        let settings = &self.settings;
        let mut args = vec!["-i".to_string(), "--rm".to_string()];

        args.push("--name".to_string());
        args.push(name.to_string());

        // Labels
        args.push("--label".to_string());
        args.push(format!("{}=true", MANAGED_LABEL));
        args.push("--label".to_string());
        args.push(format!("corral.key={}", ctx.key));
        args.push("--label".to_string());
        args.push(format!("corral.lane={}", ctx.lane));
        let mut labels: Vec<_> = settings.labels.iter().collect();
        labels.sort();
        for (key, value) in labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }

        // Environment
        let mut env: Vec<_> = settings.env.iter().collect();
        env.sort();
        for (key, value) in env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        // Volumes
        for vol in &settings.volumes {
            args.push("-v".to_string());
            let ro = if vol.read_only { ":ro" } else { "" };
            args.push(format!(
                "{}:{}{}",
                vol.host_path.to_string_lossy(),
                vol.container_path.to_string_lossy(),
                ro
            ));
        }

        // Resource limits
        if let Some(cpus) = settings.cpus {
            args.push("--cpus".to_string());
            args.push(cpus.to_string());
        }
        if let Some(mem) = &settings.memory {
            args.push("-m".to_string());
            args.push(mem.clone());
        }
        if let Some(pids) = settings.pids_limit {
            args.push("--pids-limit".to_string());
            args.push(pids.to_string());
        }

        // Network
        if let Some(network) = &settings.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }

        args.push(settings.image.clone());
        args
    }

    async fn runtime_command(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(self.command())
            .args(args)
            .output()
            .await
            .map_err(|e| Error::Backend(format!("{} {}: {}", self.command(), args[0], e)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(Error::Backend(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    /// Check that the runtime CLI responds
    pub async fn is_available(&self) -> bool {
        self.runtime_command(&["--version"]).await.is_ok()
    }

    /// Stop containers left behind by a previous host process
    pub async fn cleanup_orphans(&self) -> Result<Vec<String>> {
        let filter = format!("label={}=true", MANAGED_LABEL);
        let listing = self
            .runtime_command(&["ps", "--filter", filter.as_str(), "--format", "{{.Names}}"])
            .await?;

        let mut stopped = Vec::new();
        for name in listing.lines().map(str::trim).filter(|n| !n.is_empty()) {
            match self.runtime_command(&["stop", name]).await {
                Ok(_) => {
                    info!("Stopped orphaned container {}", name);
                    stopped.push(name.to_string());
                }
                Err(e) => warn!("Failed to stop orphaned container {}: {}", name, e),
            }
        }
        Ok(stopped)
    }
}

#[async_trait]
impl SandboxBackend for ContainerBackend {
    async fn spawn(&self, ctx: &SpawnContext) -> Result<SpawnedChild> {
        let name = self.container_name(&ctx.key, ctx.lane);
        let args = self.build_run_args(&name, ctx);

        info!(
            "Starting container {} with {} ({})",
            name,
            self.command(),
            self.settings.image
        );

        let mut command = Command::new(self.command());
        command.arg("run").args(&args);
        attach_child(command, name, ctx, Arc::clone(&self.live), None)
    }

    async fn deliver_live_input(&self, key: &DispatchKey, lane: Lane, payload: &str) -> bool {
        self.live
            .deliver(key, lane, super::encode_message(payload))
    }

    async fn request_close(&self, key: &DispatchKey, lane: Lane) {
        if self.live.close(key, lane) {
            debug!("Closed stdin for {}/{}", key, lane);
        }
    }

    async fn terminate(&self, handle: &ProcessHandle, signal: TerminateSignal) -> Result<()> {
        match signal {
            TerminateSignal::Graceful => {
                // `stop` blocks for up to the grace period; don't hold the caller
                let command = self.command();
                let name = handle.name.clone();
                let grace = self.grace_period.as_secs().to_string();
                tokio::spawn(async move {
                    let result = Command::new(command)
                        .args(["stop", "-t", grace.as_str(), name.as_str()])
                        .output()
                        .await;
                    match result {
                        Ok(output) if output.status.success() => {
                            debug!("Container {} stopped", name)
                        }
                        Ok(output) => warn!(
                            "Failed to stop container {}: {}",
                            name,
                            String::from_utf8_lossy(&output.stderr).trim()
                        ),
                        Err(e) => warn!("Failed to stop container {}: {}", name, e),
                    }
                });
                Ok(())
            }
            TerminateSignal::Kill => {
                info!("Killing container {}", handle.name);
                self.runtime_command(&["kill", handle.name.as_str()]).await.map(|_| ())
            }
        }
    }

    fn name(&self) -> &'static str {
        "container"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_foundation::{ContainerRuntime, VolumeSetting};
    use std::path::PathBuf;

    fn backend() -> ContainerBackend {
        let mut settings = ContainerSettings::default();
        settings.runtime = ContainerRuntime::Podman;
        settings.image = "agent:1".to_string();
        settings.memory = Some("512m".to_string());
        settings.network = Some("none".to_string());
        settings.volumes.push(VolumeSetting {
            host_path: PathBuf::from("/srv/groups/a"),
            container_path: PathBuf::from("/workspace"),
            read_only: true,
        });
        ContainerBackend::new(settings, Duration::from_secs(15))
    }

    #[test]
    fn test_container_name_is_sanitized() {
        let backend = backend();
        let name = backend.container_name(&DispatchKey::new("tg:42/main"), Lane::Task);

        assert!(name.starts_with("corral-tg-42-main-task-"));
        assert!(name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_build_run_args() {
        let backend = backend();
        let ctx = SpawnContext::new(DispatchKey::new("k1"), Lane::Message, "hi");
        let args = backend.build_run_args("corral-k1", &ctx);

        assert_eq!(&args[..4], &["-i", "--rm", "--name", "corral-k1"]);
        assert!(args.contains(&"corral.managed=true".to_string()));
        assert!(args.contains(&"corral.lane=message".to_string()));
        assert!(args.contains(&"/srv/groups/a:/workspace:ro".to_string()));
        assert!(args.windows(2).any(|w| w[0] == "-m" && w[1] == "512m"));
        assert!(args.windows(2).any(|w| w[0] == "--network" && w[1] == "none"));
        assert_eq!(args.last().map(String::as_str), Some("agent:1"));
        assert_eq!(backend.command(), "podman");
    }
}
