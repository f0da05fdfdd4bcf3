use mech_layer_core::{
    BootstrapState, Channel, ChannelCloser, ConnectionBootstrapper, Connector, Launched,
    LauncherConfig, LogSink, LogTag, MechError, ProcessEvent, ProcessEvents, ProcessHandle,
    ProcessId, ProcessLauncher, ProcessStatus, TcpConnector, TerminationResult,
};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

type Shared<T> = Arc<Mutex<T>>;

fn lock<T>(shared: &Mutex<T>) -> MutexGuard<'_, T> {
    shared.lock().unwrap_or_else(|e| e.into_inner())
}

/// What `stop` found to tear down
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ShutdownReport {
    /// Result of signalling the server; None if no live process was referenced
    pub process: Option<TerminationResult>,
    /// An in-flight bootstrap was cancelled
    pub bootstrap_cancelled: bool,
    /// An open channel was closed
    pub channel_closed: bool,
}

/// A channel that is still being bootstrapped
///
/// Dropping it does not cancel the bootstrap; use
/// [`LifecycleCoordinator::stop`] for that.
pub struct PendingChannel<S> {
    task: JoinHandle<Result<Channel<S>, MechError>>,
    state: watch::Receiver<BootstrapState>,
}

impl<S> PendingChannel<S> {
    pub fn state(&self) -> BootstrapState {
        self.state.borrow().clone()
    }

    /// Wait for the bootstrap to resolve or reject
    pub async fn wait(self) -> Result<Channel<S>, MechError> {
        self.task
            .await
            .map_err(|e| MechError::BootstrapAborted(e.to_string()))?
    }
}

struct BootstrapTask {
    stop: CancellationToken,
    state: watch::Receiver<BootstrapState>,
}

/// Owns the server process and the channel to it for one lifecycle
pub struct LifecycleCoordinator<L: ProcessLauncher, C: Connector = TcpConnector> {
    launcher: L,
    connector: C,
    sink: LogSink,
    process: Option<L::Handle>,
    bootstrap: Option<BootstrapTask>,
    channel: Shared<Option<ChannelCloser>>,
}

impl<L, C> LifecycleCoordinator<L, C>
where
    L: ProcessLauncher,
    C: Connector + Clone + 'static,
{
    pub fn new(launcher: L, connector: C, sink: LogSink) -> Self {
        Self {
            launcher,
            connector,
            sink,
            process: None,
            bootstrap: None,
            channel: Arc::new(Mutex::new(None)),
        }
    }

    /// Launch the server and start bootstrapping the channel
    ///
    /// The process is spawned and the first connection attempt is scheduled
    /// in the same call; nothing waits for the server to be ready. The
    /// returned [`PendingChannel`] resolves once a connection is accepted.
    pub fn start(&mut self, config: LauncherConfig) -> Result<PendingChannel<C::Stream>, MechError> {
        config
            .validate()
            .map_err(|e| MechError::Configuration(e.to_string()))?;
        if self.is_active() {
            return Err(MechError::AlreadyStarted);
        }

        info!(
            "Starting {} server: {} {:?}",
            config.name,
            config.command.display(),
            config.args
        );

        let Launched { handle, events } = self.launcher.launch(
            &config.command,
            &config.args,
            config.working_directory.as_deref(),
            &config.env,
        );

        let stop = CancellationToken::new();
        let bootstrap_token = stop.child_token();
        let exit_status: Shared<Option<ProcessStatus>> = Arc::new(Mutex::new(None));
        if let status @ ProcessStatus::Failed(_) = handle.status() {
            *lock(&exit_status) = Some(status);
        }

        let abort_on_exit = config
            .retry_config
            .abort_on_process_exit
            .then(|| bootstrap_token.clone());
        tokio::spawn(forward_events(
            events,
            self.sink.clone(),
            exit_status.clone(),
            abort_on_exit,
        ));

        let bootstrapper =
            ConnectionBootstrapper::new(self.connector.clone(), config.endpoint, config.retry_config)
                .with_log_sink(self.sink.clone())
                .with_cancellation(bootstrap_token);
        let state = bootstrapper.subscribe();
        let task = tokio::spawn(run_bootstrap(
            bootstrapper,
            stop.clone(),
            self.channel.clone(),
            exit_status,
        ));

        self.process = Some(handle);
        self.bootstrap = Some(BootstrapTask {
            stop,
            state: state.clone(),
        });

        Ok(PendingChannel { task, state })
    }

    /// Tear down the lifecycle
    ///
    /// Signals the server if it is still alive, cancels a bootstrap that is
    /// still retrying, then closes the channel if one is open. Missing pieces
    /// are skipped. Returns once the signal is sent, without waiting for the
    /// process to exit. Safe to call any number of times.
    pub async fn stop(&mut self) -> ShutdownReport {
        let mut report = ShutdownReport::default();

        if let Some(mut handle) = self.process.take() {
            if handle.is_running() {
                let result = handle.terminate().await;
                if !matches!(
                    result,
                    TerminationResult::Success | TerminationResult::ProcessNotFound
                ) {
                    warn!("Failed to terminate server process: {:?}", result);
                }
                report.process = Some(result);
            }
        }

        if let Some(bootstrap) = self.bootstrap.take() {
            report.bootstrap_cancelled = !bootstrap.state.borrow().is_finished();
            bootstrap.stop.cancel();
        }

        if let Some(closer) = lock(&self.channel).take() {
            report.channel_closed = closer.close();
        }

        info!(
            process = ?report.process,
            bootstrap_cancelled = report.bootstrap_cancelled,
            channel_closed = report.channel_closed,
            "Lifecycle stopped"
        );
        report
    }

    /// Whether `start` has been called without a matching `stop`
    pub fn is_active(&self) -> bool {
        self.process.is_some() || self.bootstrap.is_some()
    }

    pub fn process_status(&self) -> Option<ProcessStatus> {
        self.process.as_ref().map(|handle| handle.status())
    }

    pub fn process_id(&self) -> Option<ProcessId> {
        self.process.as_ref().and_then(|handle| handle.get_pid())
    }

    pub fn bootstrap_state(&self) -> Option<BootstrapState> {
        self.bootstrap
            .as_ref()
            .map(|bootstrap| bootstrap.state.borrow().clone())
    }

    pub fn channel_open(&self) -> bool {
        lock(&self.channel)
            .as_ref()
            .is_some_and(|closer| !closer.is_closed())
    }

    pub fn sink(&self) -> &LogSink {
        &self.sink
    }
}

impl<L: ProcessLauncher, C: Connector> Drop for LifecycleCoordinator<L, C> {
    fn drop(&mut self) {
        if self.process.as_ref().is_some_and(|handle| handle.is_running()) {
            warn!("Lifecycle dropped without stop; server process left running");
        }
    }
}

async fn run_bootstrap<C: Connector>(
    bootstrapper: ConnectionBootstrapper<C>,
    stop: CancellationToken,
    channel_slot: Shared<Option<ChannelCloser>>,
    exit_status: Shared<Option<ProcessStatus>>,
) -> Result<Channel<C::Stream>, MechError> {
    match bootstrapper.connect().await {
        Ok(channel) => {
            let mut slot = lock(&channel_slot);
            // stop() cancels before it takes the slot, so this check cannot miss it
            if stop.is_cancelled() {
                channel.close();
                return Err(MechError::Cancelled);
            }
            *slot = Some(channel.closer());
            Ok(channel)
        }
        Err(MechError::Cancelled) if !stop.is_cancelled() => {
            let status = lock(&exit_status).clone().unwrap_or(ProcessStatus::Exited {
                code: None,
                signal: None,
            });
            Err(MechError::ServerExited { status })
        }
        Err(e) => Err(e),
    }
}

/// Copy process output into the log sink with provenance tags
async fn forward_events(
    mut events: ProcessEvents,
    sink: LogSink,
    exit_status: Shared<Option<ProcessStatus>>,
    abort_on_exit: Option<CancellationToken>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ProcessEvent::Stdout(line) => {
                if !line.trim().is_empty() {
                    sink.append_line(LogTag::Output, &line).await;
                }
            }
            ProcessEvent::Stderr(line) => {
                if !line.trim().is_empty() {
                    sink.append_line(LogTag::Error, &line).await;
                }
            }
            ProcessEvent::Error(message) => {
                error!("Server process error: {}", message);
                sink.append_line(LogTag::Error, &message).await;
            }
            ProcessEvent::Exited(status) => {
                info!("Server process exited with {}", status);
                sink.append_line(LogTag::Exit, &status.to_string()).await;
                *lock(&exit_status) = Some(status);
                if let Some(token) = &abort_on_exit {
                    token.cancel();
                }
            }
        }
    }

    // Stream ends without an exit event when the process never started
    if let Some(token) = abort_on_exit {
        token.cancel();
    }
}
