/// Corrective actions run once a monitor exhausts its strike budget.
///
/// - `GracefulShutdownHandler`: asks the host runtime to stop taking work and
///   exit once in-flight work is done (request-serving workers).
/// - `TermProcessHandler`: sends SIGTERM to the process (job workers).
/// - `NullHandler`: logs only; the default when nothing is configured.
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::sync::watch;

/// Errors a handler can hit while acting.
#[derive(Debug)]
pub enum HandlerError {
    /// Delivering the termination signal failed.
    Signal { pid: i32, source: nix::errno::Errno },
    /// Nobody is listening for the shutdown request anymore.
    NoListener,
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerError::Signal { pid, source } => {
                write!(f, "failed to send SIGTERM to pid {}: {}", pid, source)
            }
            HandlerError::NoListener => {
                write!(f, "shutdown requested but the host runtime is no longer listening")
            }
        }
    }
}

impl std::error::Error for HandlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HandlerError::Signal { source, .. } => Some(source),
            HandlerError::NoListener => None,
        }
    }
}

/// Corrective action. Invoked at most once per watchdog lifetime.
pub trait Handler: Send + Sync {
    /// Identifier used in reports (e.g. "graceful_shutdown").
    fn name(&self) -> &str;

    fn call(&self) -> Result<(), HandlerError>;
}

/// Does nothing beyond logging that it was asked to act.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHandler;

impl Handler for NullHandler {
    fn name(&self) -> &str {
        "null"
    }

    fn call(&self) -> Result<(), HandlerError> {
        tracing::warn!("memory watchdog handler invoked, but no corrective action is configured");
        Ok(())
    }
}

/// Requests a cooperative shutdown of the host worker.
#[derive(Debug)]
pub struct GracefulShutdownHandler {
    tx: watch::Sender<bool>,
}

/// Receiving side of a graceful shutdown request, held by the host runtime.
#[derive(Debug, Clone)]
pub struct ShutdownRequest {
    rx: watch::Receiver<bool>,
}

impl GracefulShutdownHandler {
    /// Create a handler and the request the host should wait on.
    pub fn new() -> (Self, ShutdownRequest) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, ShutdownRequest { rx })
    }
}

impl Handler for GracefulShutdownHandler {
    fn name(&self) -> &str {
        "graceful_shutdown"
    }

    fn call(&self) -> Result<(), HandlerError> {
        tracing::warn!("requesting graceful worker shutdown");
        self.tx.send(true).map_err(|_| HandlerError::NoListener)
    }
}

impl ShutdownRequest {
    /// Whether a shutdown has been requested.
    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until a shutdown is requested.
    ///
    /// Returns immediately if one already was. If the handler is dropped
    /// without requesting, this never resolves.
    pub async fn requested(&mut self) {
        if self.rx.wait_for(|requested| *requested).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Sends SIGTERM to a process, by default the current one.
#[derive(Debug, Clone, Copy)]
pub struct TermProcessHandler {
    pid: i32,
}

impl TermProcessHandler {
    /// Handler that terminates the calling process.
    pub fn new() -> Self {
        Self::for_pid(std::process::id() as i32)
    }

    pub fn for_pid(pid: i32) -> Self {
        Self { pid }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }
}

impl Default for TermProcessHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl Handler for TermProcessHandler {
    fn name(&self) -> &str {
        "term_process"
    }

    fn call(&self) -> Result<(), HandlerError> {
        tracing::warn!(pid = self.pid, "sending SIGTERM");
        kill(Pid::from_raw(self.pid), Signal::SIGTERM).map_err(|e| HandlerError::Signal {
            pid: self.pid,
            source: e,
        })
    }
}
