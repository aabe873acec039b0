//! A manually controllable prebuffer for Tokio `AsyncRead`.
//!
//! [`Prebuffered`] accumulates input up to a limit so a header section can be
//! parsed in place, then hands out the unconsumed remainder (pipelined body
//! bytes, early tunnel data) before falling through to the inner reader.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Buf, BytesMut};
use tokio::io::{self, AsyncRead, AsyncReadExt, ReadBuf};

pub struct Prebuffered<R> {
    inner: R,
    pending: BytesMut,
    limit: usize,
}

impl<R: AsyncRead + Unpin> Prebuffered<R> {
    /// Wraps `inner`, never holding more than `limit` unconsumed bytes.
    pub(crate) fn new(inner: R, limit: usize) -> Self {
        Self {
            inner,
            pending: BytesMut::new(),
            limit,
        }
    }

    /// Returns the bytes buffered but not yet consumed.
    pub(crate) fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// Whether the buffer has reached its limit without being consumed.
    pub(crate) fn is_at_limit(&self) -> bool {
        self.pending.len() >= self.limit
    }

    /// Removes `n` bytes from the front of the buffer.
    pub(crate) fn consume(&mut self, n: usize) {
        self.pending.advance(n);
    }

    /// Reads more data from the inner reader into the buffer.
    ///
    /// Returns the number of bytes added; 0 means the limit was reached or
    /// the inner reader hit end of stream.
    pub(crate) async fn fill(&mut self) -> io::Result<usize> {
        let room = self.limit.saturating_sub(self.pending.len());
        if room == 0 {
            return Ok(0);
        }
        (&mut self.inner)
            .take(room as u64)
            .read_buf(&mut self.pending)
            .await
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for Prebuffered<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pending.is_empty() {
            return Pin::new(&mut self.inner).poll_read(cx, out);
        }
        let n = self.pending.len().min(out.remaining());
        if n > 0 {
            out.put_slice(&self.pending.split_to(n));
        }
        Poll::Ready(Ok(()))
    }
}
