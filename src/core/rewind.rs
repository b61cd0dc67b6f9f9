//! Replay of bytes consumed while peeking at a connection
//!
//! The listener reads the first line of every connection to look for a
//! credential. When the line is not one, the connection is handed to the
//! fallback server wrapped in [`RewindConn`], which serves the consumed line
//! again before anything else, so the fallback sees the original stream.

use bytes::Bytes;
use pin_project_lite::pin_project;
use std::io::{self, IoSlice};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, BufReader, ReadBuf};

pin_project! {
    /// Connection that replays previously consumed bytes.
    ///
    /// Reads drain the replay buffer first, then the buffered reader that did
    /// the peeking (which may still hold bytes read past the line), then the
    /// socket. Writes and shutdown go straight to the underlying connection.
    pub struct RewindConn<S> {
        replay: Option<Bytes>,
        #[pin]
        inner: BufReader<S>,
    }
}

impl<S> RewindConn<S> {
    /// Wrap `inner`, replaying `consumed` exactly as it was read
    pub fn new(inner: BufReader<S>, consumed: impl Into<Bytes>) -> Self {
        let consumed = consumed.into();
        Self {
            replay: (!consumed.is_empty()).then_some(consumed),
            inner,
        }
    }

    /// Whether replayed bytes are still pending
    pub fn is_rewinding(&self) -> bool {
        self.replay.is_some()
    }
}

impl<S: AsyncRead> AsyncRead for RewindConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        if let Some(replay) = this.replay.as_mut() {
            let n = replay.len().min(buf.remaining());
            buf.put_slice(&replay.split_to(n));
            if replay.is_empty() {
                // drained: from here on this is a plain pass-through
                *this.replay = None;
            }
            return Poll::Ready(Ok(()));
        }
        this.inner.poll_read(cx, buf)
    }
}

impl<S: AsyncRead + AsyncWrite> AsyncWrite for RewindConn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    /// Half-close: shuts down the write side of the underlying connection
    /// while reads keep working.
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}
