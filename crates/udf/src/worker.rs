//! Worker transports: a spawned subprocess speaking frames over stdio,
//! or an already-running worker behind a Unix socket.

use std::process::Stdio;

use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch};
use tracing::{info, warn};

use crate::error::UdfError;

/// Control handle for a spawned worker process.
pub struct WorkerHandle {
    kill_tx: Option<oneshot::Sender<()>>,
    terminated: watch::Receiver<bool>,
}

impl WorkerHandle {
    /// Hard-kill the process. Idempotent.
    pub fn kill(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Signal that flips to true when the process has exited.
    pub fn terminated(&self) -> watch::Receiver<bool> {
        self.terminated.clone()
    }
}

/// A UDF worker subprocess exchanging frames over its stdio pipes.
pub struct ProcessWorker {
    pub stdout: ChildStdout,
    pub stdin: ChildStdin,
    pub handle: WorkerHandle,
}

impl ProcessWorker {
    pub fn spawn(command: &[String]) -> Result<Self, UdfError> {
        let (prog, args) = command
            .split_first()
            .ok_or_else(|| UdfError::Protocol("worker command is empty".into()))?;

        let mut child = Command::new(prog)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|source| UdfError::Spawn {
                command: prog.clone(),
                source,
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| UdfError::Protocol("worker stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| UdfError::Protocol("worker stdout not captured".into()))?;

        info!(command = %prog, "spawned UDF worker");

        let (kill_tx, kill_rx) = oneshot::channel();
        let (term_tx, term_rx) = watch::channel(false);
        let prog = prog.clone();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    match status {
                        Ok(s) => info!(command = %prog, status = %s, "UDF worker exited"),
                        Err(e) => warn!(command = %prog, error = %e, "waiting on UDF worker failed"),
                    }
                }
                _ = kill_rx => {
                    warn!(command = %prog, "killing UDF worker");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
            let _ = term_tx.send(true);
        });

        Ok(Self {
            stdout,
            stdin,
            handle: WorkerHandle {
                kill_tx: Some(kill_tx),
                terminated: term_rx,
            },
        })
    }
}

/// Connect to a worker listening on a Unix socket.
///
/// The host has no process control over socket workers: the kill hook is
/// a no-op and there is no termination signal.
#[cfg(unix)]
pub async fn connect_socket(
    path: &str,
) -> Result<
    (
        tokio::net::unix::OwnedReadHalf,
        tokio::net::unix::OwnedWriteHalf,
    ),
    UdfError,
> {
    let stream = tokio::net::UnixStream::connect(path).await?;
    Ok(stream.into_split())
}
