use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::{CancellationToken, DropGuard};

/// Shared close capability for a [`Channel`]
///
/// The coordinator keeps one to close the channel on shutdown; whoever owns
/// the stream watches [`ChannelCloser::closed`] and drops it.
#[derive(Clone, Debug, Default)]
pub struct ChannelCloser {
    token: CancellationToken,
}

impl ChannelCloser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the channel closed. Returns false if it was already closed.
    pub fn close(&self) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        self.token.cancel();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once either side has closed the channel
    pub async fn closed(&self) {
        self.token.cancelled().await
    }
}

/// Bidirectional byte stream to the server plus its close signal
///
/// Dropping the channel closes it. After [`Channel::into_split`] or
/// [`Channel::into_inner`] the caller owns the stream and must call
/// [`ChannelCloser::close`] when done with it.
pub struct Channel<S = TcpStream> {
    // Declared before the stream so the close signal fires first on drop
    guard: DropGuard,
    stream: S,
    peer: String,
    closer: ChannelCloser,
}

impl<S> Channel<S> {
    pub fn new(stream: S, peer: impl Into<String>) -> Self {
        let closer = ChannelCloser::new();
        Self {
            guard: closer.token.clone().drop_guard(),
            stream,
            peer: peer.into(),
            closer,
        }
    }

    /// Address of the endpoint this channel is connected to
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn closer(&self) -> ChannelCloser {
        self.closer.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_closed()
    }

    pub fn close(&self) -> bool {
        self.closer.close()
    }

    pub async fn closed(&self) {
        self.closer.closed().await
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> (S, ChannelCloser) {
        let Channel {
            guard,
            stream,
            closer,
            ..
        } = self;
        let _ = guard.disarm();
        (stream, closer)
    }
}

impl<S> fmt::Debug for Channel<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl<S: AsyncRead + AsyncWrite> Channel<S> {
    /// Split into the readable side, the writable side and the close handle
    pub fn into_split(self) -> (ReadHalf<S>, WriteHalf<S>, ChannelCloser) {
        let (stream, closer) = self.into_inner();
        let (reader, writer) = tokio::io::split(stream);
        (reader, writer, closer)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Channel<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Channel<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_close_is_shared_and_idempotent() {
        let (client, _server) = tokio::io::duplex(64);
        let channel = Channel::new(client, "127.0.0.1:8081");
        let closer = channel.closer();

        assert!(!channel.is_closed());
        assert!(closer.close());
        assert!(!closer.close());
        assert!(channel.is_closed());

        // Already closed, resolves immediately
        channel.closed().await;
    }

    #[tokio::test]
    async fn test_channel_carries_bytes_both_ways() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut channel = Channel::new(client, "127.0.0.1:8081");

        channel.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").await.unwrap();
        let (mut reader, _writer, closer) = channel.into_split();
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
        assert!(!closer.is_closed());
    }

    #[tokio::test]
    async fn test_dropping_channel_closes_it() {
        let (client, mut server) = tokio::io::duplex(64);
        let channel = Channel::new(client, "127.0.0.1:8081");
        let closer = channel.closer();

        drop(channel);

        assert!(closer.is_closed());
        let mut buf = [0u8; 1];
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_split_halves_keep_channel_open() {
        let (client, _server) = tokio::io::duplex(64);
        let channel = Channel::new(client, "127.0.0.1:8081");
        assert!(format!("{channel:?}").contains("127.0.0.1:8081"));

        let (reader, writer, closer) = channel.into_split();
        assert!(!closer.is_closed());

        drop((reader, writer));
        assert!(!closer.is_closed());
        assert!(closer.close());
    }
}
