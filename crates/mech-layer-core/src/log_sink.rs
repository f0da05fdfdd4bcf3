use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// Provenance prefix of a log line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTag {
    /// Server standard output
    Output,
    /// Server standard error and spawn failures
    Error,
    /// Server exit notification
    Exit,
    /// Bootstrap retries and connection outcome
    Client,
}

impl LogTag {
    pub fn prefix(self) -> &'static str {
        match self {
            LogTag::Output => "[mech]",
            LogTag::Error => "[mech error]",
            LogTag::Exit => "[mech exited]",
            LogTag::Client => "[mech client]",
        }
    }
}

impl fmt::Display for LogTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Unpin + Sync + Send>>>;

/// Append-only, line-oriented log shared by the launcher and the bootstrapper
#[derive(Clone)]
pub struct LogSink(SharedWriter);

impl LogSink {
    pub fn new(t: Box<dyn AsyncWrite + Unpin + Sync + Send>) -> LogSink {
        LogSink(Arc::new(Mutex::new(t)))
    }

    pub fn stderr() -> LogSink {
        Self::new(Box::new(tokio::io::stderr()))
    }

    pub fn discard() -> LogSink {
        Self::new(Box::new(tokio::io::sink()))
    }

    /// In-memory sink and a reader for its contents
    pub fn memory() -> (LogSink, MemoryLog) {
        let log = MemoryLog::default();
        (Self::new(Box::new(log.clone())), log)
    }

    /// Append one tagged line; write failures are traced and otherwise ignored
    pub async fn append_line(&self, tag: LogTag, text: &str) {
        let line = format!("{} {}\n", tag.prefix(), text.trim());
        let mut writer = self.0.lock().await;
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            tracing::debug!("Failed to append to log sink: {}", e);
            return;
        }
        if let Err(e) = writer.flush().await {
            tracing::debug!("Failed to flush log sink: {}", e);
        }
    }
}

/// Cloneable in-memory log target
#[derive(Clone, Default)]
pub struct MemoryLog(Arc<StdMutex<Vec<u8>>>);

impl MemoryLog {
    pub fn contents(&self) -> String {
        let buf = self.0.lock().unwrap_or_else(|e| e.into_inner());
        String::from_utf8_lossy(&buf).into_owned()
    }

    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_owned).collect()
    }
}

impl AsyncWrite for MemoryLog {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
