//! Framed connection
//!
//! Frame layout: 3-byte little-endian payload length, 1-byte sequence
//! number, payload. Each connection keeps its own sequence counter, so the
//! same payload relayed to several peers is re-sequenced per peer.

use super::protocol::constants::{HEADER_LEN, MAX_PAYLOAD_LEN};
use super::transport::Transport;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use sqp_common::{Result, SqpError};
use tracing::trace;

/// Read granularity when topping up the inbound buffer
const READ_CHUNK: usize = 16 * 1024;

/// One protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub sequence: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn command(&self) -> Option<u8> {
        self.payload.first().copied()
    }
}

/// Append the wire form of a frame to `dst`
pub fn encode_frame(sequence: u8, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(SqpError::Protocol(format!(
            "payload of {} bytes exceeds the frame limit",
            payload.len()
        )));
    }
    dst.reserve(HEADER_LEN + payload.len());
    dst.put_uint_le(payload.len() as u64, 3);
    dst.put_u8(sequence);
    dst.put_slice(payload);
    Ok(())
}

/// Split one complete frame off the front of `src`, if there is one
pub fn decode_frame(src: &mut BytesMut) -> Option<Frame> {
    if src.len() < HEADER_LEN {
        return None;
    }
    let len = u32::from_le_bytes([src[0], src[1], src[2], 0]) as usize;
    if src.len() < HEADER_LEN + len {
        return None;
    }
    let sequence = src[3];
    src.advance(HEADER_LEN);
    let payload = src.split_to(len).freeze();
    Some(Frame { sequence, payload })
}

/// A transport plus its frame buffer and sequence counter.
///
/// Owned by exactly one session task; never shared.
pub struct FramedConnection<T> {
    transport: T,
    inbound: BytesMut,
    outbound: BytesMut,
    sequence: u8,
}

impl<T: Transport> FramedConnection<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            inbound: BytesMut::with_capacity(READ_CHUNK),
            outbound: BytesMut::with_capacity(READ_CHUNK),
            sequence: 0,
        }
    }

    /// Sequence number the next outbound frame will carry
    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    /// Start a new command exchange (client commands always begin at 0)
    pub fn reset_sequence(&mut self) {
        self.sequence = 0;
    }

    /// Wait for a complete frame
    pub async fn receive(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = self.take_frame() {
                return Ok(frame);
            }
            self.fill().await?;
        }
    }

    /// Return a complete frame if one is already available, without waiting
    pub fn try_receive(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.take_frame() {
                return Ok(Some(frame));
            }
            if !self.try_fill()? {
                return Ok(None);
            }
        }
    }

    /// Send one frame with the current sequence number.
    ///
    /// The counter only advances when the write succeeded.
    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.outbound.clear();
        encode_frame(self.sequence, payload, &mut self.outbound)?;
        self.transport.write_chunk(&self.outbound).await?;
        trace!(sequence = self.sequence, len = payload.len(), "frame sent");
        self.sequence = self.sequence.wrapping_add(1);
        Ok(())
    }

    /// Send several frames back to back (a relayed reply)
    pub async fn send_all<'a, I>(&mut self, payloads: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a Bytes>,
    {
        for payload in payloads {
            self.send(payload).await?;
        }
        Ok(())
    }

    pub async fn close(&mut self) -> Result<()> {
        self.transport.close().await?;
        Ok(())
    }

    fn take_frame(&mut self) -> Option<Frame> {
        let frame = decode_frame(&mut self.inbound)?;
        self.sequence = frame.sequence.wrapping_add(1);
        trace!(sequence = frame.sequence, len = frame.payload.len(), "frame received");
        Some(frame)
    }

    async fn fill(&mut self) -> Result<()> {
        let start = self.inbound.len();
        self.inbound.resize(start + READ_CHUNK, 0);
        let read = self.transport.read_chunk(&mut self.inbound[start..]).await;
        self.commit_read(start, read.map(Some))
    }

    fn try_fill(&mut self) -> Result<bool> {
        let start = self.inbound.len();
        self.inbound.resize(start + READ_CHUNK, 0);
        let read = self.transport.try_read_chunk(&mut self.inbound[start..]);
        let progressed = matches!(read, Ok(Some(_)));
        self.commit_read(start, read)?;
        Ok(progressed)
    }

    fn commit_read(&mut self, start: usize, read: std::io::Result<Option<usize>>) -> Result<()> {
        match read {
            Ok(Some(0)) => {
                self.inbound.truncate(start);
                Err(SqpError::PeerClosed)
            }
            Ok(Some(n)) => {
                self.inbound.truncate(start + n);
                Ok(())
            }
            Ok(None) => {
                self.inbound.truncate(start);
                Ok(())
            }
            Err(e) => {
                self.inbound.truncate(start);
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

    /// Write side fails once, then records everything
    struct FlakyWriter {
        fail_next: bool,
        written: Vec<u8>,
    }

    impl AsyncRead for FlakyWriter {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncWrite for FlakyWriter {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if self.fail_next {
                self.fail_next = false;
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "down")));
            }
            self.written.extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[test]
    fn test_frame_round_trip() {
        for (sequence, payload) in [(0u8, &b""[..]), (7, &b"\x03SELECT 1"[..]), (255, &[0xab; 300][..])] {
            let mut buf = BytesMut::new();
            encode_frame(sequence, payload, &mut buf).unwrap();
            assert_eq!(buf.len(), HEADER_LEN + payload.len());
            let frame = decode_frame(&mut buf).unwrap();
            assert_eq!(frame.sequence, sequence);
            assert_eq!(&frame.payload[..], payload);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_partial_frame_is_not_decoded() {
        let mut buf = BytesMut::new();
        encode_frame(1, b"hello", &mut buf).unwrap();
        let mut partial = BytesMut::from(&buf[..6]);
        assert!(decode_frame(&mut partial).is_none());
        assert_eq!(partial.len(), 6);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let mut buf = BytesMut::new();
        let payload = vec![0u8; MAX_PAYLOAD_LEN + 1];
        assert!(encode_frame(0, &payload, &mut buf).is_err());
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_failed_send_keeps_sequence() {
        let mut conn = FramedConnection::new(FlakyWriter {
            fail_next: true,
            written: Vec::new(),
        });
        assert!(conn.send(b"\x0e").await.is_err());
        assert_eq!(conn.sequence(), 0);

        conn.send(b"\x0e").await.unwrap();
        conn.send(b"\x0e").await.unwrap();
        assert_eq!(conn.sequence(), 2);
        assert_eq!(conn.transport.written, vec![1, 0, 0, 0, 0x0e, 1, 0, 0, 1, 0x0e]);
    }

    #[tokio::test]
    async fn test_receive_tracks_peer_sequence() {
        let (a, b) = tokio::io::duplex(1024);
        let mut client = FramedConnection::new(a);
        let mut server = FramedConnection::new(b);

        client.send(b"\x03SELECT 1").await.unwrap();
        let frame = server.receive().await.unwrap();
        assert_eq!(frame.sequence, 0);
        assert_eq!(frame.command(), Some(0x03));
        // the reply continues the exchange
        assert_eq!(server.sequence(), 1);
    }

    #[tokio::test]
    async fn test_try_receive_would_block_and_reassembles() {
        let (a, mut b) = tokio::io::duplex(1024);
        let mut conn = FramedConnection::new(a);
        assert_eq!(conn.try_receive().unwrap(), None);

        let mut wire = BytesMut::new();
        encode_frame(3, b"abc", &mut wire).unwrap();
        encode_frame(4, b"de", &mut wire).unwrap();
        b.write_chunk(&wire[..5]).await.unwrap();
        assert_eq!(conn.try_receive().unwrap(), None);

        b.write_chunk(&wire[5..]).await.unwrap();
        let first = conn.try_receive().unwrap().unwrap();
        assert_eq!(&first.payload[..], b"abc");
        let second = conn.try_receive().unwrap().unwrap();
        assert_eq!((second.sequence, &second.payload[..]), (4, &b"de"[..]));
        assert_eq!(conn.sequence(), 5);
    }

    #[tokio::test]
    async fn test_peer_close_is_reported() {
        let (a, mut b) = tokio::io::duplex(64);
        let mut conn = FramedConnection::new(a);
        b.close().await.unwrap();
        assert!(matches!(conn.receive().await, Err(SqpError::PeerClosed)));
    }
}
