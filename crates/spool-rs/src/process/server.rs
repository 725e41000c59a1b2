//! Owned handle for one inference server process.
//!
//! The handle is a singleton guarded by a mutex: at most one live child per
//! [`ServerProcess`], and concurrent `start`/`stop` callers serialize on the
//! lock instead of racing the OS process table. Lifecycle methods report
//! status strings rather than errors — a stop on an already-stopped handle
//! is a fact to report, not a failure.

use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Bound on one TCP connect probe.
pub const CONNECT_PROBE_TIMEOUT: Duration = Duration::from_millis(300);

/// How long a stopping process gets before it is force-killed.
pub const STOP_GRACE: Duration = Duration::from_secs(2);

/// Interval between listen probes while waiting for a starting server.
pub const LISTEN_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Observable lifecycle state of a server process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessState {
    /// No live child.
    Stopped,
    /// Child spawned but not yet accepting connections.
    Starting,
    /// Child accepting TCP connections on its port.
    Listening,
}

/// Everything needed to launch one server process.
#[derive(Clone, Debug)]
pub struct LaunchSpec {
    pub executable: PathBuf,
    pub model_path: PathBuf,
    pub port: u16,
    pub gpu_layers: u32,
    pub context_size: u32,
}

impl LaunchSpec {
    /// Argument vector in the form KoboldCpp expects.
    pub fn args(&self) -> Vec<String> {
        vec![
            "--model".to_string(),
            self.model_path.display().to_string(),
            "--port".to_string(),
            self.port.to_string(),
            "--gpulayers".to_string(),
            self.gpu_layers.to_string(),
            "--contextsize".to_string(),
            self.context_size.to_string(),
        ]
    }

    /// The full command line, for status strings and logs.
    pub fn command_line(&self) -> String {
        format!("{} {}", self.executable.display(), self.args().join(" "))
    }
}

struct Running {
    child: Child,
    port: u16,
}

/// Mutex-guarded owner of zero-or-one server child process.
#[derive(Default)]
pub struct ServerProcess {
    inner: Mutex<Option<Running>>,
}

impl ServerProcess {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current lifecycle state. A child that exited on its own is reaped
    /// here and reads as stopped.
    pub async fn state(&self) -> ProcessState {
        let mut guard = self.inner.lock().await;
        let Some(running) = guard.as_mut() else {
            return ProcessState::Stopped;
        };
        if let Ok(Some(status)) = running.child.try_wait() {
            debug!("server process exited on its own: {status}");
            *guard = None;
            return ProcessState::Stopped;
        }
        if is_listening(running.port).await {
            ProcessState::Listening
        } else {
            ProcessState::Starting
        }
    }

    /// Spawn the server. Starting while already running is a no-op
    /// reporting "already running", not an error.
    pub async fn start(&self, spec: &LaunchSpec) -> String {
        let mut guard = self.inner.lock().await;
        if let Some(running) = guard.as_mut() {
            if running.child.try_wait().ok().flatten().is_none() {
                return "already running".to_string();
            }
            *guard = None;
        }

        match Command::new(&spec.executable)
            .args(spec.args())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => {
                debug!("spawned: {}", spec.command_line());
                *guard = Some(Running {
                    child,
                    port: spec.port,
                });
                format!("launched: {}", spec.command_line())
            }
            Err(e) => {
                warn!("failed to launch {}: {e}", spec.executable.display());
                format!("failed to launch {}: {e}", spec.executable.display())
            }
        }
    }

    /// Block until the child accepts connections, it dies, or `timeout`
    /// elapses. Returns whether it is listening.
    pub async fn wait_listening(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.state().await {
                ProcessState::Listening => return true,
                ProcessState::Stopped => return false,
                ProcessState::Starting => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(LISTEN_POLL_INTERVAL).await;
        }
    }

    /// Stop the child: termination request, bounded wait, force kill on
    /// timeout. Always clears the handle; idempotent.
    pub async fn stop(&self) -> String {
        let mut guard = self.inner.lock().await;
        let Some(mut running) = guard.take() else {
            return "not running".to_string();
        };

        if running.child.start_kill().is_err() {
            // Already exited; nothing left to wait for.
            return "stopped".to_string();
        }
        match tokio::time::timeout(STOP_GRACE, running.child.wait()).await {
            Ok(_) => "stopped".to_string(),
            Err(_) => {
                let _ = running.child.kill().await;
                "stopped (forced)".to_string()
            }
        }
    }
}

/// TCP connect probe against the local port.
pub async fn is_listening(port: u16) -> bool {
    matches!(
        tokio::time::timeout(CONNECT_PROBE_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_for(executable: &str) -> LaunchSpec {
        LaunchSpec {
            executable: PathBuf::from(executable),
            model_path: PathBuf::from("/models/tiny.gguf"),
            port: 5099,
            gpu_layers: 0,
            context_size: 2048,
        }
    }

    #[test]
    fn args_follow_kobold_flag_names() {
        let args = spec_for("/usr/bin/koboldcpp").args();
        assert_eq!(
            args,
            vec![
                "--model",
                "/models/tiny.gguf",
                "--port",
                "5099",
                "--gpulayers",
                "0",
                "--contextsize",
                "2048",
            ]
        );
    }

    #[tokio::test]
    async fn fresh_handle_is_stopped() {
        let server = ServerProcess::new();
        assert_eq!(server.state().await, ProcessState::Stopped);
    }

    #[tokio::test]
    async fn stop_is_idempotent_on_a_stopped_handle() {
        let server = ServerProcess::new();
        assert_eq!(server.stop().await, "not running");
        assert_eq!(server.stop().await, "not running");
    }

    #[tokio::test]
    async fn failed_launch_reports_status_not_error() {
        let server = ServerProcess::new();
        let status = server.start(&spec_for("/no/such/binary")).await;
        assert!(status.starts_with("failed to launch"));
        assert_eq!(server.state().await, ProcessState::Stopped);
    }

    #[tokio::test]
    async fn launch_and_stop_round_trip() {
        // `sleep` rejects the server flags and exits fast; spawn still
        // succeeds, and stop must clear the handle either way.
        let server = ServerProcess::new();
        let status = server.start(&spec_for("sleep")).await;
        assert!(status.starts_with("launched:"));
        let stopped = server.stop().await;
        assert!(stopped.starts_with("stopped") || stopped == "not running");
        assert_eq!(server.state().await, ProcessState::Stopped);
    }

    #[tokio::test]
    async fn wait_listening_returns_false_for_dead_process() {
        let server = ServerProcess::new();
        assert!(!server.wait_listening(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn connect_probe_sees_a_bound_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(is_listening(port).await);
        drop(listener);
        assert!(!is_listening(port).await);
    }
}
