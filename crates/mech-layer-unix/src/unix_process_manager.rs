use crate::line_codec::LossyLinesCodec;
use async_trait::async_trait;
use mech_layer_core::{
    Launched, ProcessEvent, ProcessHandle, ProcessId, ProcessLauncher, ProcessStatus,
    TerminationResult,
};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid as NixPid;
use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

/// How long the exit watcher waits for output readers to drain after exit
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

type EventSender = mpsc::UnboundedSender<ProcessEvent>;

/// Unix-specific process handle implementation
///
/// The child itself is owned by the exit watcher task; the handle observes
/// its status through a watch channel and signals it by PID.
pub struct UnixProcessHandle {
    pid: Option<ProcessId>,
    command: String,
    args: Vec<String>,
    status: watch::Receiver<ProcessStatus>,
    signalled: bool,
}

impl UnixProcessHandle {
    fn new(
        pid: Option<ProcessId>,
        command: String,
        args: Vec<String>,
        status: watch::Receiver<ProcessStatus>,
    ) -> Self {
        Self {
            pid,
            command,
            args,
            status,
            signalled: false,
        }
    }

    /// Whether a termination signal has already been delivered
    pub fn is_signalled(&self) -> bool {
        self.signalled
    }
}

#[async_trait]
impl ProcessHandle for UnixProcessHandle {
    fn get_pid(&self) -> Option<ProcessId> {
        self.pid
    }

    fn get_command(&self) -> &str {
        &self.command
    }

    fn get_args(&self) -> &[String] {
        &self.args
    }

    fn status(&self) -> ProcessStatus {
        self.status.borrow().clone()
    }

    fn is_running(&self) -> bool {
        !self.signalled && self.status.borrow().is_running()
    }

    async fn terminate(&mut self) -> TerminationResult {
        if !self.is_running() {
            return TerminationResult::ProcessNotFound;
        }
        let Some(pid) = self.pid else {
            return TerminationResult::ProcessNotFound;
        };
        let nix_pid = NixPid::from_raw(pid.0 as i32);

        match signal::kill(nix_pid, Signal::SIGTERM) {
            Ok(()) => {
                info!("Sent SIGTERM to process {}", pid);
                self.signalled = true;
                TerminationResult::Success
            }
            Err(nix::errno::Errno::ESRCH) => {
                info!("Process {} not found (already terminated)", pid);
                TerminationResult::ProcessNotFound
            }
            Err(nix::errno::Errno::EPERM) => {
                warn!("Permission denied to terminate process {}", pid);
                TerminationResult::AccessDenied
            }
            Err(e) => {
                warn!("Failed to send SIGTERM to process {}: {}", pid, e);
                TerminationResult::Failed(format!("SIGTERM failed: {e}"))
            }
        }
    }

    async fn wait_for_exit(&mut self) -> ProcessStatus {
        let exited = self
            .status
            .wait_for(|status| !status.is_running())
            .await
            .map(|status| status.clone());
        exited.unwrap_or_else(|_| self.status.borrow().clone())
    }
}

/// Launches the server with tokio's process support
///
/// Must be called from within a tokio runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixProcessLauncher;

impl UnixProcessLauncher {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessLauncher for UnixProcessLauncher {
    type Handle = UnixProcessHandle;

    fn launch(
        &self,
        command: &Path,
        args: &[String],
        working_dir: Option<&Path>,
        env: &HashMap<String, String>,
    ) -> Launched<UnixProcessHandle> {
        let (events_tx, events) = mpsc::unbounded_channel();
        let command_name = command.display().to_string();

        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Set working directory
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        // Set environment variables
        for (key, value) in env {
            cmd.env(key, value);
        }

        // Own process group so terminal signals aimed at the client skip the server
        cmd.process_group(0);

        let handle = match cmd.spawn() {
            Ok(child) => spawn_watchers(child, command_name, args.to_vec(), events_tx),
            Err(e) => {
                warn!("Failed to spawn {}: {}", command_name, e);
                let reason = format!("Failed to spawn {command_name}: {e}");
                let _ = events_tx.send(ProcessEvent::Error(reason.clone()));
                let (_, status) = watch::channel(ProcessStatus::Failed(reason));
                UnixProcessHandle::new(None, command_name, args.to_vec(), status)
            }
        };

        Launched { handle, events }
    }
}

fn spawn_watchers(
    mut child: Child,
    command: String,
    args: Vec<String>,
    events: EventSender,
) -> UnixProcessHandle {
    let pid = child.id().map(ProcessId::from);
    if let Some(pid) = pid {
        info!(
            "Spawned Unix process: {} (PID: {}) with args: {:?}",
            command, pid, args
        );
    }

    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(forward_lines(
            stdout,
            events.clone(),
            ProcessEvent::Stdout,
        )));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(forward_lines(
            stderr,
            events.clone(),
            ProcessEvent::Stderr,
        )));
    }

    let (status_tx, status) = watch::channel(ProcessStatus::Running);
    tokio::spawn(watch_exit(child, readers, status_tx, events));

    UnixProcessHandle::new(pid, command, args, status)
}

async fn forward_lines<R>(io: R, events: EventSender, wrap: fn(String) -> ProcessEvent)
where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::with_capacity(io, LossyLinesCodec, 1024);
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(line) => {
                if events.send(wrap(line)).is_err() {
                    return;
                }
            }
            Err(e) => {
                let _ = events.send(ProcessEvent::Error(format!("Output stream failed: {e}")));
                return;
            }
        }
    }
}

async fn watch_exit(
    mut child: Child,
    readers: Vec<JoinHandle<()>>,
    status_tx: watch::Sender<ProcessStatus>,
    events: EventSender,
) {
    let status = match child.wait().await {
        Ok(exit) => ProcessStatus::Exited {
            code: exit.code(),
            signal: exit.signal(),
        },
        Err(e) => {
            let _ = events.send(ProcessEvent::Error(format!(
                "Failed to wait for server process: {e}"
            )));
            ProcessStatus::Exited {
                code: None,
                signal: None,
            }
        }
    };
    debug!("Server process finished with {}", status);
    status_tx.send_replace(status.clone());

    // Let buffered output reach the event stream before the exit notice
    let drain = async {
        for reader in readers {
            let _ = reader.await;
        }
    };
    if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, drain).await.is_err() {
        debug!("Output readers still open after exit, not waiting further");
    }

    let _ = events.send(ProcessEvent::Exited(status));
}

#[cfg(test)]
mod tests {
    use super::*;
    use mech_layer_core::ProcessEvents;

    fn launch(command: &str, args: &[&str]) -> Launched<UnixProcessHandle> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        UnixProcessLauncher::new().launch(Path::new(command), &args, None, &HashMap::new())
    }

    async fn collect(mut events: ProcessEvents) -> Vec<ProcessEvent> {
        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            let done = matches!(event, ProcessEvent::Exited(_) | ProcessEvent::Error(_));
            seen.push(event);
            if done {
                break;
            }
        }
        seen
    }

    #[tokio::test]
    async fn test_forwards_output_and_exit_code() {
        let Launched { mut handle, events } =
            launch("sh", &["-c", "echo ready; echo warn >&2; exit 3"]);
        assert!(handle.get_pid().is_some());
        assert_eq!(handle.get_command(), "sh");

        let seen = collect(events).await;

        assert!(seen.contains(&ProcessEvent::Stdout("ready".to_string())));
        assert!(seen.contains(&ProcessEvent::Stderr("warn".to_string())));
        assert_eq!(
            seen.last(),
            Some(&ProcessEvent::Exited(ProcessStatus::Exited {
                code: Some(3),
                signal: None
            }))
        );

        handle.wait_for_exit().await;
        assert!(!handle.is_running());
        assert_eq!(handle.exit_code(), Some(3));
    }

    #[tokio::test]
    async fn test_missing_executable_reports_error_event() {
        let Launched { mut handle, events } = launch("/nonexistent/server/target/debug/mech", &["serve"]);

        assert!(handle.get_pid().is_none());
        assert!(matches!(handle.status(), ProcessStatus::Failed(_)));
        assert!(!handle.is_running());
        assert_eq!(handle.terminate().await, TerminationResult::ProcessNotFound);

        let seen = collect(events).await;
        assert!(matches!(&seen[..], [ProcessEvent::Error(msg)] if msg.contains("Failed to spawn")));
    }

    #[tokio::test]
    async fn test_terminate_sends_sigterm_once() {
        let Launched { mut handle, events } = launch("sleep", &["30"]);
        assert!(handle.is_running());

        assert_eq!(handle.terminate().await, TerminationResult::Success);
        assert!(handle.is_signalled());
        assert!(!handle.is_running());
        // Second call is a no-op
        assert_eq!(handle.terminate().await, TerminationResult::ProcessNotFound);

        let status = handle.wait_for_exit().await;
        assert_eq!(
            status,
            ProcessStatus::Exited {
                code: None,
                signal: Some(Signal::SIGTERM as i32)
            }
        );
        let seen = collect(events).await;
        assert_eq!(seen, vec![ProcessEvent::Exited(status)]);
    }

    #[tokio::test]
    async fn test_terminate_after_exit_is_not_found() {
        let Launched { mut handle, events } = launch("true", &[]);
        collect(events).await;
        handle.wait_for_exit().await;

        assert_eq!(handle.terminate().await, TerminationResult::ProcessNotFound);
        assert!(!handle.is_signalled());
    }

    #[tokio::test]
    async fn test_env_and_working_directory_are_applied() {
        let dir = std::env::temp_dir();
        let env = HashMap::from([("MECH_TEST_VALUE".to_string(), "42".to_string())]);
        let args = vec!["-c".to_string(), "echo $MECH_TEST_VALUE; pwd".to_string()];
        let Launched { events, .. } =
            UnixProcessLauncher::new().launch(Path::new("sh"), &args, Some(&dir), &env);

        let seen = collect(events).await;
        assert!(seen.contains(&ProcessEvent::Stdout("42".to_string())));
        let canonical = dir.canonicalize().unwrap();
        assert!(seen.iter().any(|event| matches!(
            event,
            ProcessEvent::Stdout(line) if Path::new(line).canonicalize().ok() == Some(canonical.clone())
        )));
    }
}
