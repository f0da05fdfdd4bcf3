use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use tokio::sync::mpsc;

/// Unique identifier for a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(pub u32);

impl From<u32> for ProcessId {
    fn from(pid: u32) -> Self {
        ProcessId(pid)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a launched process
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessStatus {
    /// Process is currently running
    Running,
    /// Process exited; `code` is absent when it was killed by a signal
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
    },
    /// Process failed to start
    Failed(String),
}

impl ProcessStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessStatus::Running)
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ProcessStatus::Exited { code, .. } => *code,
            _ => None,
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessStatus::Running => write!(f, "running"),
            ProcessStatus::Exited {
                code: Some(code), ..
            } => write!(f, "code {code}"),
            ProcessStatus::Exited {
                code: None,
                signal: Some(signal),
            } => write!(f, "signal {signal}"),
            ProcessStatus::Exited {
                code: None,
                signal: None,
            } => write!(f, "code null"),
            ProcessStatus::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Result of a process termination operation
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationResult {
    /// Termination signal was delivered
    Success,
    /// Process was not alive (never started, exited, or already signalled)
    ProcessNotFound,
    /// Permission denied (insufficient privileges)
    AccessDenied,
    /// Operation failed with specific error message
    Failed(String),
}

/// Observable output of a launched process
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    /// One line of standard output
    Stdout(String),
    /// One line of standard error
    Stderr(String),
    /// The process could not be started or its streams failed
    Error(String),
    /// The process terminated
    Exited(ProcessStatus),
}

/// Receiving side of a process's event stream
pub type ProcessEvents = mpsc::UnboundedReceiver<ProcessEvent>;

/// A freshly launched process together with its event stream
pub struct Launched<H> {
    pub handle: H,
    pub events: ProcessEvents,
}

/// Trait representing a handle to a launched process
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// Get the process ID (None if the process never started)
    fn get_pid(&self) -> Option<ProcessId>;

    /// Get the command that started this process
    fn get_command(&self) -> &str;

    /// Get the arguments passed to this process
    fn get_args(&self) -> &[String];

    /// Last observed status
    fn status(&self) -> ProcessStatus;

    /// Check if the process is still running and has not been signalled
    fn is_running(&self) -> bool;

    /// Exit code, present only after the process exited normally
    fn exit_code(&self) -> Option<i32> {
        self.status().exit_code()
    }

    /// Send the termination signal once
    async fn terminate(&mut self) -> TerminationResult;

    /// Wait for the process to leave the running state
    async fn wait_for_exit(&mut self) -> ProcessStatus;
}

/// Starts the external server process
///
/// `launch` never fails: spawn errors surface as a [`ProcessEvent::Error`]
/// on the returned event stream and a [`ProcessStatus::Failed`] handle.
pub trait ProcessLauncher: Send + Sync {
    /// The type of process handle this launcher produces
    type Handle: ProcessHandle + 'static;

    fn launch(
        &self,
        command: &Path,
        args: &[String],
        working_dir: Option<&Path>,
        env: &HashMap<String, String>,
    ) -> Launched<Self::Handle>;
}

/// Factory trait for creating platform-specific launchers
pub trait ProcessLauncherFactory {
    /// The type of launcher this factory creates
    type Launcher: ProcessLauncher;

    /// Create a launcher for the current platform
    fn create_launcher() -> Self::Launcher;

    /// Get the platform name for logging and debugging
    fn platform_name() -> &'static str;
}
