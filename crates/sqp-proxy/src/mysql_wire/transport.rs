//! Transport boundary
//!
//! The proxy core only needs blocking read, non-blocking read, write and
//! close on a reliable byte stream. Any tokio stream qualifies, which lets
//! tests drive sessions over in-memory duplex pipes.

use async_trait::async_trait;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

#[async_trait]
pub trait Transport: Send {
    /// Wait for at least one byte. `Ok(0)` means the peer closed.
    async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Non-blocking read. `Ok(None)` when nothing is buffered yet.
    fn try_read_chunk(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>>;

    /// Write and flush the whole buffer
    async fn write_chunk(&mut self, buf: &[u8]) -> io::Result<()>;

    async fn close(&mut self) -> io::Result<()>;
}

#[async_trait]
impl<S> Transport for S
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        AsyncReadExt::read(self, buf).await
    }

    fn try_read_chunk(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        // Poll once with a no-op waker: readiness is re-checked by the caller
        let mut cx = Context::from_waker(futures::task::noop_waker_ref());
        let mut read_buf = ReadBuf::new(buf);
        match AsyncRead::poll_read(Pin::new(&mut *self), &mut cx, &mut read_buf) {
            Poll::Ready(Ok(())) => Ok(Some(read_buf.filled().len())),
            Poll::Ready(Err(e)) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Poll::Ready(Err(e)) => Err(e),
            Poll::Pending => Ok(None),
        }
    }

    async fn write_chunk(&mut self, buf: &[u8]) -> io::Result<()> {
        AsyncWriteExt::write_all(self, buf).await?;
        AsyncWriteExt::flush(self).await
    }

    async fn close(&mut self) -> io::Result<()> {
        AsyncWriteExt::shutdown(self).await
    }
}
