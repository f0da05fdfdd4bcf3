//! Connection bootstrap: open a stream to the server, retrying while it refuses.
//!
//! The server is started without a readiness signal, so the first attempts
//! usually race its startup and get `ConnectionRefused`. Refusals are retried
//! with a fixed delay up to `max_retries` times; any other error, or a refusal
//! once the budget is spent, rejects the bootstrap.

use crate::channel::Channel;
use crate::config::{Endpoint, RetryConfig};
use crate::error::{MechError, is_connection_refused};
use crate::log_sink::{LogSink, LogTag};
use async_trait::async_trait;
use backon::{BackoffBuilder, ConstantBackoff, ConstantBuilder};
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Opens one transport-level connection
#[async_trait]
pub trait Connector: Send + Sync {
    type Stream: Send + 'static;

    async fn connect(&self, endpoint: &Endpoint) -> io::Result<Self::Stream>;
}

/// Plain TCP, no TLS and no handshake
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, endpoint: &Endpoint) -> io::Result<TcpStream> {
        TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await
    }
}

/// Observable phase of a bootstrap call
#[derive(Debug, Clone, PartialEq)]
pub enum BootstrapState {
    Idle,
    Attempting { attempt: u32 },
    Waiting { attempt: u32, delay: Duration },
    Resolved { attempts: u32 },
    Rejected { attempts: u32 },
}

impl BootstrapState {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            BootstrapState::Resolved { .. } | BootstrapState::Rejected { .. }
        )
    }
}

/// Outcome of a single connection attempt
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Pending,
    Connected,
    Refused,
    Failed(io::ErrorKind),
}

/// One try at opening the channel; lives only as long as the attempt
#[derive(Debug, Clone)]
pub struct ConnectionAttempt {
    pub host: String,
    pub port: u16,
    pub index: u32,
    pub outcome: AttemptOutcome,
}

impl ConnectionAttempt {
    fn new(endpoint: &Endpoint, index: u32) -> Self {
        Self {
            host: endpoint.host.clone(),
            port: endpoint.port,
            index,
            outcome: AttemptOutcome::Pending,
        }
    }

    fn resolve<T>(mut self, result: &io::Result<T>) -> Self {
        self.outcome = match result {
            Ok(_) => AttemptOutcome::Connected,
            Err(e) if is_connection_refused(e) => AttemptOutcome::Refused,
            Err(e) => AttemptOutcome::Failed(e.kind()),
        };
        self
    }
}

/// Attempt counter and delay schedule for one `connect` call
struct RetryState {
    attempts: u32,
    delays: ConstantBackoff,
}

impl RetryState {
    fn new(config: &RetryConfig) -> Self {
        let delays = ConstantBuilder::default()
            .with_delay(config.retry_delay())
            .with_max_times(config.max_retries as usize)
            .build();
        Self { attempts: 0, delays }
    }

    fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    /// Delay before the next retry, or None once the budget is spent
    fn next_delay(&mut self) -> Option<Duration> {
        self.delays.next()
    }
}

/// Establishes a [`Channel`] to the server endpoint
pub struct ConnectionBootstrapper<C: Connector> {
    connector: C,
    endpoint: Endpoint,
    retry: RetryConfig,
    sink: LogSink,
    cancel: CancellationToken,
    state: watch::Sender<BootstrapState>,
}

impl<C: Connector> ConnectionBootstrapper<C> {
    pub fn new(connector: C, endpoint: Endpoint, retry: RetryConfig) -> Self {
        let (state, _) = watch::channel(BootstrapState::Idle);
        Self {
            connector,
            endpoint,
            retry,
            sink: LogSink::discard(),
            cancel: CancellationToken::new(),
            state,
        }
    }

    pub fn with_log_sink(mut self, sink: LogSink) -> Self {
        self.sink = sink;
        self
    }

    /// Abort the bootstrap when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> BootstrapState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<BootstrapState> {
        self.state.subscribe()
    }

    /// Connect, retrying refusals with a fixed delay
    ///
    /// Resolves on the first successful connect. Rejects with
    /// [`MechError::ConnectionRefused`] when every allowed attempt was refused,
    /// with [`MechError::Connection`] on the first non-refusal error and with
    /// [`MechError::Cancelled`] if the cancellation token fires.
    pub async fn connect(&self) -> Result<Channel<C::Stream>, MechError> {
        let mut retry = RetryState::new(&self.retry);
        info!(
            endpoint = %self.endpoint,
            max_retries = self.retry.max_retries,
            "Bootstrapping connection to server"
        );

        loop {
            let attempt = retry.begin_attempt();
            self.enter(BootstrapState::Attempting { attempt });

            let error = match self.attempt(attempt).await {
                Some(Ok(stream)) => {
                    if self.cancel.is_cancelled() {
                        drop(stream);
                        return self.reject(attempt, MechError::Cancelled).await;
                    }
                    self.enter(BootstrapState::Resolved { attempts: attempt });
                    info!(endpoint = %self.endpoint, attempt, "Connected to server");
                    self.sink
                        .append_line(
                            LogTag::Client,
                            &format!("Client connected to mech-serve at {}", self.endpoint),
                        )
                        .await;
                    return Ok(Channel::new(stream, self.endpoint.to_string()));
                }
                Some(Err(error)) => error,
                None => return self.reject(attempt, MechError::Cancelled).await,
            };

            if !is_connection_refused(&error) {
                let error = MechError::Connection {
                    attempts: attempt,
                    source: error,
                };
                return self.reject(attempt, error).await;
            }

            let Some(delay) = retry.next_delay() else {
                let error = MechError::ConnectionRefused {
                    attempts: attempt,
                    source: error,
                };
                return self.reject(attempt, error).await;
            };

            self.enter(BootstrapState::Waiting { attempt, delay });
            info!(attempt, ?delay, "Connection refused, waiting for server");
            self.sink
                .append_line(
                    LogTag::Client,
                    &format!("Retry {attempt}: waiting for server..."),
                )
                .await;

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return self.reject(attempt, MechError::Cancelled).await;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Run one attempt; None means the bootstrap was cancelled
    async fn attempt(&self, index: u32) -> Option<io::Result<C::Stream>> {
        if self.cancel.is_cancelled() {
            return None;
        }

        let attempt = ConnectionAttempt::new(&self.endpoint, index);
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return None,
            result = self.connector.connect(&self.endpoint) => result,
        };

        let attempt = attempt.resolve(&result);
        debug!(
            host = %attempt.host,
            port = attempt.port,
            attempt = attempt.index,
            outcome = ?attempt.outcome,
            "Connection attempt finished"
        );
        Some(result)
    }

    async fn reject<T>(&self, attempts: u32, error: MechError) -> Result<T, MechError> {
        self.enter(BootstrapState::Rejected { attempts });
        warn!(endpoint = %self.endpoint, attempts, "Bootstrap failed: {}", error);
        self.sink
            .append_line(
                LogTag::Client,
                &format!("Connection to {} failed: {}", self.endpoint, error),
            )
            .await;
        Err(error)
    }

    fn enter(&self, next: BootstrapState) {
        let previous = self.state.send_replace(next.clone());
        debug!(from = ?previous, to = ?next, "Bootstrap state transition");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::io::DuplexStream;
    use tokio::time::Instant;

    /// Plays back a scripted list of outcomes; refuses once the script runs out
    #[derive(Clone, Default)]
    struct ScriptedConnector {
        script: Arc<Mutex<VecDeque<io::ErrorKind>>>,
        succeed_after_script: bool,
        attempts: Arc<AtomicU32>,
    }

    impl ScriptedConnector {
        fn refusing() -> Self {
            Self::default()
        }

        fn script(outcomes: &[io::ErrorKind]) -> Self {
            Self {
                script: Arc::new(Mutex::new(outcomes.iter().copied().collect())),
                succeed_after_script: true,
                attempts: Arc::default(),
            }
        }

        fn attempts(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        type Stream = DuplexStream;

        async fn connect(&self, _endpoint: &Endpoint) -> io::Result<DuplexStream> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(kind) => Err(io::Error::from(kind)),
                None if self.succeed_after_script => Ok(tokio::io::duplex(64).0),
                None => Err(io::Error::from(io::ErrorKind::ConnectionRefused)),
            }
        }
    }

    fn bootstrapper(
        connector: ScriptedConnector,
        max_retries: u32,
    ) -> ConnectionBootstrapper<ScriptedConnector> {
        let retry = RetryConfig::default()
            .with_max_retries(max_retries)
            .with_retry_delay(Duration::from_millis(1000));
        ConnectionBootstrapper::new(connector, Endpoint::default(), retry)
    }

    const REFUSED: io::ErrorKind = io::ErrorKind::ConnectionRefused;

    #[tokio::test(start_paused = true)]
    async fn test_all_refused_makes_n_plus_one_attempts() {
        for max_retries in [0, 1, 5] {
            let connector = ScriptedConnector::refusing();
            let bootstrap = bootstrapper(connector.clone(), max_retries);

            let error = bootstrap.connect().await.unwrap_err();

            assert_eq!(connector.attempts(), max_retries + 1);
            assert!(error.is_refused_exhausted());
            assert_eq!(error.attempts(), Some(max_retries + 1));
            assert_eq!(
                bootstrap.state(),
                BootstrapState::Rejected {
                    attempts: max_retries + 1
                }
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_kth_attempt_success_stops_retrying() {
        // attempts 1-3 refused, 4th succeeds
        let connector = ScriptedConnector::script(&[REFUSED, REFUSED, REFUSED]);
        let bootstrap = bootstrapper(connector.clone(), 5);
        let started = Instant::now();

        let channel = bootstrap.connect().await.unwrap();

        assert_eq!(connector.attempts(), 4);
        assert_eq!(started.elapsed(), Duration::from_millis(3000));
        assert_eq!(channel.peer(), "127.0.0.1:8081");
        assert!(!channel.is_closed());
        assert_eq!(bootstrap.state(), BootstrapState::Resolved { attempts: 4 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_delay_is_respected() {
        let connector = ScriptedConnector::script(&[REFUSED, REFUSED]);
        let bootstrap = bootstrapper(connector.clone(), 5);
        let started = Instant::now();

        bootstrap.connect().await.unwrap();

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(2000));
        assert!(elapsed < Duration::from_millis(2100));
        assert_eq!(connector.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_refusal_error_rejects_immediately() {
        let connector = ScriptedConnector::script(&[io::ErrorKind::PermissionDenied]);
        let bootstrap = bootstrapper(connector.clone(), 5);
        let started = Instant::now();

        let error = bootstrap.connect().await.unwrap_err();

        assert_eq!(connector.attempts(), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
        match error {
            MechError::Connection { attempts, source } => {
                assert_eq!(attempts, 1);
                assert_eq!(source.kind(), io::ErrorKind::PermissionDenied);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_refusal_after_refusals_is_not_retried() {
        let connector =
            ScriptedConnector::script(&[REFUSED, io::ErrorKind::ConnectionReset, REFUSED]);
        let bootstrap = bootstrapper(connector.clone(), 5);

        let error = bootstrap.connect().await.unwrap_err();

        assert_eq!(connector.attempts(), 2);
        assert!(matches!(error, MechError::Connection { attempts: 2, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_are_logged_to_sink() {
        let (sink, log) = LogSink::memory();
        let connector = ScriptedConnector::script(&[REFUSED, REFUSED]);
        let bootstrap = bootstrapper(connector, 5).with_log_sink(sink);

        bootstrap.connect().await.unwrap();

        assert_eq!(
            log.lines(),
            vec![
                "[mech client] Retry 1: waiting for server...",
                "[mech client] Retry 2: waiting for server...",
                "[mech client] Client connected to mech-serve at 127.0.0.1:8081",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_delay() {
        let connector = ScriptedConnector::refusing();
        let token = CancellationToken::new();
        let bootstrap = bootstrapper(connector.clone(), 5).with_cancellation(token.clone());
        let mut states = bootstrap.subscribe();

        let cancel = async {
            states
                .wait_for(|s| matches!(s, BootstrapState::Waiting { attempt: 2, .. }))
                .await
                .unwrap();
            token.cancel();
        };
        let (result, _) = tokio::join!(bootstrap.connect(), cancel);

        assert!(matches!(result, Err(MechError::Cancelled)));
        assert_eq!(connector.attempts(), 2);
        assert_eq!(bootstrap.state(), BootstrapState::Rejected { attempts: 2 });
    }

    /// Fires the token while the connect is in flight, then hands back a stream anyway
    struct CancelMidConnect {
        token: CancellationToken,
        peer: Mutex<Option<DuplexStream>>,
    }

    #[async_trait]
    impl Connector for CancelMidConnect {
        type Stream = DuplexStream;

        async fn connect(&self, _endpoint: &Endpoint) -> io::Result<DuplexStream> {
            self.token.cancel();
            let (client, server) = tokio::io::duplex(64);
            *self.peer.lock().unwrap() = Some(server);
            Ok(client)
        }
    }

    #[tokio::test]
    async fn test_cancellation_racing_successful_connect_drops_stream() {
        use tokio::io::AsyncReadExt;

        let token = CancellationToken::new();
        let connector = CancelMidConnect {
            token: token.clone(),
            peer: Mutex::new(None),
        };
        let bootstrap = ConnectionBootstrapper::new(connector, Endpoint::default(), RetryConfig::new())
            .with_cancellation(token);

        let result = bootstrap.connect().await;

        assert!(matches!(result, Err(MechError::Cancelled)));
        assert_eq!(bootstrap.state(), BootstrapState::Rejected { attempts: 1 });
        let mut server = bootstrap.connector.peer.lock().unwrap().take().unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_makes_no_attempt() {
        let connector = ScriptedConnector::refusing();
        let token = CancellationToken::new();
        token.cancel();
        let bootstrap = bootstrapper(connector.clone(), 5).with_cancellation(token);

        let result = bootstrap.connect().await;

        assert!(matches!(result, Err(MechError::Cancelled)));
        assert_eq!(connector.attempts(), 0);
    }

    #[tokio::test]
    async fn test_tcp_connector_reaches_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let bootstrap = ConnectionBootstrapper::new(
            TcpConnector,
            Endpoint::loopback(port),
            RetryConfig::no_retry(),
        );

        let (channel, accepted) = tokio::join!(bootstrap.connect(), listener.accept());

        let channel = channel.unwrap();
        let (_, client_addr) = accepted.unwrap();
        assert_eq!(channel.get_ref().local_addr().unwrap(), client_addr);
    }

    #[tokio::test]
    async fn test_tcp_connector_refused_without_listener() {
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let bootstrap = ConnectionBootstrapper::new(
            TcpConnector,
            Endpoint::loopback(port),
            RetryConfig::no_retry(),
        );

        let error = bootstrap.connect().await.unwrap_err();
        assert!(error.is_refused_exhausted());
        assert_eq!(error.attempts(), Some(1));
    }
}
