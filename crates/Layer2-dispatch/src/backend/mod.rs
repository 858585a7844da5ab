//! Sandbox backends - how processes are actually started and stopped
//!
//! - [`ContainerBackend`]: Docker / Podman CLI
//! - [`LocalBackend`]: plain host subprocess (development, tests)

mod container;
mod live;
mod local;
mod r#trait;

pub use container::ContainerBackend;
pub use live::{encode_initial_input, encode_message, InputLine, LiveInputs};
pub use local::LocalBackend;
pub use r#trait::{
    spawn_process, ExitFuture, OutputReader, SandboxBackend, SpawnContext, SpawnedChild,
    SpawnedProcess, TerminateSignal,
};

use corral_foundation::{Error, Result};
use futures::FutureExt;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;

use crate::key::{DispatchKey, Lane};

/// Spawn `command` with piped stdio and wire it into `live`
///
/// The initial input line is queued before this returns. The exit future
/// releases the live channel once the child is gone. Sending on `kill_rx`
/// force-kills the child.
pub(crate) fn attach_child(
    mut command: Command,
    name: String,
    ctx: &SpawnContext,
    live: Arc<LiveInputs>,
    kill_rx: Option<oneshot::Receiver<()>>,
) -> Result<SpawnedChild> {
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child: Child = command
        .spawn()
        .map_err(|e| Error::Spawn(format!("{}: {}", name, e)))?;

    let pid = child.id();
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::Spawn(format!("{}: stdin not captured", name)))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Spawn(format!("{}: stdout not captured", name)))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Spawn(format!("{}: stderr not captured", name)))?;

    live.open(&ctx.key, ctx.lane, &name, stdin, encode_initial_input(ctx));

    let key: DispatchKey = ctx.key.clone();
    let lane: Lane = ctx.lane;
    let exit_name = name.clone();
    let exit = async move {
        let status = match kill_rx {
            Some(rx) => {
                let finished = tokio::select! {
                    status = child.wait() => Some(status),
                    Ok(()) = rx => None,
                };
                match finished {
                    Some(status) => status,
                    None => {
                        let _ = child.start_kill();
                        child.wait().await
                    }
                }
            }
            None => child.wait().await,
        };
        live.release(&key, lane, &exit_name);
        status.map(|s| s.code()).map_err(Error::from)
    }
    .boxed();

    Ok(SpawnedChild {
        name,
        pid,
        stdout: Box::new(stdout),
        stderr: Box::new(stderr),
        exit,
    })
}
