//! Server subprocess lifecycle.
//!
//! Spawns each server command with piped stdio, forwards its stderr to ours
//! under the server's current display name, reports subprocess exits to the
//! router, and runs the staged teardown: wait for a voluntary exit after
//! stdin closes, then SIGTERM the process group, then SIGKILL, always
//! reaping so nothing is left as a zombie.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, timeout};

use crate::error::ProxyError;
use crate::router::Event;

/// Grace periods for the staged teardown.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownGrace {
    /// How long to wait for a voluntary exit after stdin closes.
    pub wait: Duration,
    /// How long to wait after SIGTERM before SIGKILL.
    pub term: Duration,
}

impl Default for ShutdownGrace {
    fn default() -> ShutdownGrace {
        ShutdownGrace {
            wait: Duration::from_millis(2000),
            term: Duration::from_millis(1000),
        }
    }
}

/// A freshly spawned server, io handles not yet wired to an endpoint.
pub struct Spawned {
    pub name: String,
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// Spawn every server command. Any spawn failure is fatal.
pub fn spawn_servers(
    commands: &[Vec<String>],
    names: &[String],
) -> Result<Vec<Spawned>, ProxyError> {
    let mut spawned = Vec::with_capacity(commands.len());
    for (index, argv) in commands.iter().enumerate() {
        let name = names[index].clone();
        tracing::info!(server = %name, command = %argv.join(" "), "launching server");

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| ProxyError::Spawn {
            name: name.clone(),
            reason: e.to_string(),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| ProxyError::Spawn {
            name: name.clone(),
            reason: "failed to capture server stdin".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| ProxyError::Spawn {
            name: name.clone(),
            reason: "failed to capture server stdout".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| ProxyError::Spawn {
            name: name.clone(),
            reason: "failed to capture server stderr".to_string(),
        })?;

        spawned.push(Spawned {
            name,
            child,
            stdin,
            stdout,
            stderr,
        });
    }
    Ok(spawned)
}

/// Watches the spawned children for the rest of the session.
pub struct Supervisor {
    watchers: Vec<(watch::Sender<bool>, JoinHandle<()>)>,
}

impl Supervisor {
    /// Take over the children: one watcher task per process reporting exits
    /// to the router, plus a stderr forwarder per process unless `quiet`.
    /// The name receiver tracks renames from `serverInfo.name`.
    pub fn start(
        children: Vec<(Child, ChildStderr, watch::Receiver<String>)>,
        events: mpsc::Sender<Event>,
        quiet: bool,
        grace: ShutdownGrace,
    ) -> Supervisor {
        let mut watchers = Vec::with_capacity(children.len());
        for (index, (child, stderr, name)) in children.into_iter().enumerate() {
            if !quiet {
                tokio::spawn(forward_stderr(stderr, name));
            }
            let (kill_tx, kill_rx) = watch::channel(false);
            let handle = tokio::spawn(watch_server(index, child, events.clone(), kill_rx, grace));
            watchers.push((kill_tx, handle));
        }
        Supervisor { watchers }
    }

    /// Tear everything down: signal every watcher to run its staged kill
    /// sequence and wait for all children to be reaped.
    pub async fn shutdown(self) {
        for (kill, _) in &self.watchers {
            let _ = kill.send(true);
        }
        for (_, handle) in self.watchers {
            let _ = handle.await;
        }
    }
}

/// Pipe one server's stderr to ours, line by line, under its current name.
async fn forward_stderr(stderr: ChildStderr, name: watch::Receiver<String>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let name = name.borrow().clone();
                tracing::info!(server = %name, "{line}");
            }
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, "error reading server stderr");
                return;
            }
        }
    }
}

/// Wait for a child to exit on its own (reporting it to the router), or run
/// the staged kill sequence once the kill signal fires.
async fn watch_server(
    index: usize,
    mut child: Child,
    events: mpsc::Sender<Event>,
    mut kill: watch::Receiver<bool>,
    grace: ShutdownGrace,
) {
    tokio::select! {
        status = child.wait() => {
            match status {
                Ok(status) => tracing::debug!(server = index, ?status, "server process exited"),
                Err(e) => tracing::warn!(server = index, error = %e, "wait failed"),
            }
            let _ = events.send(Event::ServerExited(index)).await;
            return;
        }
        _ = kill.changed() => {}
    }

    // Stdin is already closed (the router dropped the endpoint); a polite
    // server exits on its own.
    if let Ok(Ok(status)) = timeout(grace.wait, child.wait()).await {
        tracing::debug!(server = index, ?status, "server exited after stdin close");
        return;
    }

    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;
        if let Some(pid) = child.id() {
            tracing::info!(server = index, pid, "sending SIGTERM to process group");
            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::warn!(server = index, pid, error = ?e, "killpg SIGTERM failed");
            }
        }
    }

    if let Ok(Ok(status)) = timeout(grace.term, child.wait()).await {
        tracing::debug!(server = index, ?status, "server exited after SIGTERM");
        return;
    }

    tracing::warn!(server = index, "sending SIGKILL");
    if let Err(e) = child.kill().await {
        tracing::warn!(server = index, error = %e, "SIGKILL failed");
    }
    let _ = child.wait().await;
}
