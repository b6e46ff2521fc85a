//! Child bundler process lifecycle: spawn, readiness poll, graceful/forceful
//! termination, output forwarding.
//!
//! Spawn → poll-readiness → base-url runs a `tokio::process::Command` child
//! instead of starting a container. Graceful-then-forceful termination uses
//! `nix::sys::signal` for the SIGTERM-then-SIGKILL race.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::{interval, timeout};
use tracing::{debug, warn};

use crate::supervisor::events::{EventBus, LogStream, SupervisorEvent};

pub const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(200);
pub const READINESS_TIMEOUT: Duration = Duration::from_secs(60);
pub const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Spawns the bundler bound to `port` with `--strictPort` so it never
/// silently drifts to a different port when the requested one is busy.
/// Invoked exactly as the child-process protocol (§6) contracts it:
/// `<binary> run vite --host 0.0.0.0 --port <p> --strictPort`.
pub fn spawn_bundler(bun_binary: &str, dir: &Path, port: u16) -> std::io::Result<Child> {
    Command::new(bun_binary)
        .args([
            "run",
            "vite",
            "--host",
            "0.0.0.0",
            "--port",
            &port.to_string(),
            "--strictPort",
        ])
        .current_dir(dir)
        .env("NODE_ENV", "development")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
}

/// Forwards the child's stdout/stderr lines as `debug`-level log events and
/// publishes them on the event bus, until both streams close (the child
/// exited or closed its pipes).
pub fn forward_output(child: &mut Child, project_id: String, events: EventBus) {
    if let Some(stdout) = child.stdout.take() {
        let project_id = project_id.clone();
        let events = events.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(project_id = %project_id, stream = "stdout", "{}", line);
                events.publish(SupervisorEvent::Log {
                    project_id: project_id.clone(),
                    stream: LogStream::Stdout,
                    message: line,
                });
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(project_id = %project_id, stream = "stderr", "{}", line);
                events.publish(SupervisorEvent::Log {
                    project_id: project_id.clone(),
                    stream: LogStream::Stderr,
                    message: line,
                });
            }
        });
    }
}

/// Polls `HEAD http://localhost:<port>/` every [`READINESS_POLL_INTERVAL`],
/// accepting `{200, 404}` as readiness, until [`READINESS_TIMEOUT`] elapses.
pub async fn wait_until_ready(client: &reqwest::Client, port: u16) -> bool {
    let url = format!("http://localhost:{port}/");
    let deadline = timeout(READINESS_TIMEOUT, async {
        let mut ticker = interval(READINESS_POLL_INTERVAL);
        loop {
            ticker.tick().await;
            if let Ok(resp) = client.head(&url).send().await {
                let status = resp.status().as_u16();
                if status == 200 || status == 404 {
                    return;
                }
            }
        }
    })
    .await;
    deadline.is_ok()
}

/// Sends SIGTERM, races the child's exit against
/// [`GRACEFUL_SHUTDOWN_TIMEOUT`], then SIGKILLs if it's still alive.
pub async fn terminate(child: &mut Child, project_id: &str) {
    if let Some(pid) = child.id() {
        if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!(project_id, pid, error = %e, "failed to send SIGTERM, falling back to kill()");
            let _ = child.kill().await;
            let _ = child.wait().await;
            return;
        }
    } else {
        // Already reaped.
        return;
    }

    match timeout(GRACEFUL_SHUTDOWN_TIMEOUT, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!(project_id, "child did not exit within grace period, sending SIGKILL");
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_bundler_missing_binary_is_value_not_panic() {
        let tmp = tempfile::tempdir().unwrap();
        let result = spawn_bundler("definitely-not-a-real-binary-xyz", tmp.path(), 5200);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn wait_until_ready_false_when_nothing_listening() {
        let client = reqwest::Client::new();
        // Port 1 is privileged/unused; connection will fail immediately and
        // repeatedly until the (shortened, for the test) timeout elapses.
        // We rely on the default constants being too long for a unit test,
        // so exercise the inner polling logic directly via a tiny timeout.
        let result = timeout(Duration::from_millis(50), wait_until_ready(&client, 1)).await;
        assert!(result.is_err(), "expected the outer test timeout to win");
    }
}
