//! Scripted MySQL peers for tests
//!
//! A fake backend runs on one end of an in-memory duplex pipe, logs every
//! query it receives and answers with whatever the responder returns.

use super::framed::FramedConnection;
use super::protocol::constants::*;
use super::protocol::messages::{build_ok, put_lenenc_bytes, put_lenenc_int};
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;

pub type QueryLog = Arc<Mutex<Vec<String>>>;

pub fn ok() -> Bytes {
    build_ok(0, 0, SERVER_STATUS_AUTOCOMMIT, 0)
}

pub fn ok_rows(affected: u64) -> Bytes {
    build_ok(affected, 0, SERVER_STATUS_AUTOCOMMIT, 0)
}

pub fn eof(status: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(EOF_HEADER);
    buf.put_u16_le(0);
    buf.put_u16_le(status);
    buf.freeze()
}

pub fn column_definition(name: &str, column_type: u8) -> Bytes {
    let mut buf = BytesMut::new();
    for part in ["def", "test", "t", "t", name, name] {
        put_lenenc_bytes(&mut buf, part.as_bytes());
    }
    buf.put_u8(0x0c);
    buf.put_u16_le(DEFAULT_CHARSET as u16);
    buf.put_u32_le(255);
    buf.put_u8(column_type);
    buf.put_u16_le(0);
    buf.put_u8(0);
    buf.put_u16_le(0);
    buf.freeze()
}

/// Complete text-protocol result set: count, definitions, EOF, rows, EOF
pub fn text_result(columns: &[(&str, u8)], rows: &[Vec<Option<&str>>]) -> Vec<Bytes> {
    let mut frames = Vec::new();
    let mut count = BytesMut::new();
    put_lenenc_int(&mut count, columns.len() as u64);
    frames.push(count.freeze());
    for (name, column_type) in columns {
        frames.push(column_definition(name, *column_type));
    }
    frames.push(eof(SERVER_STATUS_AUTOCOMMIT));
    for row in rows {
        let mut buf = BytesMut::new();
        for value in row {
            match value {
                Some(v) => put_lenenc_bytes(&mut buf, v.as_bytes()),
                None => buf.put_u8(0xfb),
            }
        }
        frames.push(buf.freeze());
    }
    frames.push(eof(SERVER_STATUS_AUTOCOMMIT));
    frames
}

/// Responder echoing each SELECT's text back as a one-cell result set
pub fn echo_selects(query: &str) -> Vec<Bytes> {
    if query.to_ascii_uppercase().starts_with("SELECT") {
        text_result(&[("q", 0xfd)], &[vec![Some(query)]])
    } else {
        vec![ok_rows(1)]
    }
}

/// Spawn a fake backend; returns the proxy-side end of the pipe and the log.
///
/// A query answered with no frames makes the backend hang up.
pub fn spawn_backend<F>(responder: F) -> (DuplexStream, QueryLog)
where
    F: Fn(&str) -> Vec<Bytes> + Send + 'static,
{
    spawn_delayed_backend(responder, |_| None)
}

/// `spawn_backend` whose replies to some queries arrive late
pub fn spawn_delayed_backend<F, D>(responder: F, delay: D) -> (DuplexStream, QueryLog)
where
    F: Fn(&str) -> Vec<Bytes> + Send + 'static,
    D: Fn(&str) -> Option<Duration> + Send + 'static,
{
    let (proxy_side, backend_side) = tokio::io::duplex(64 * 1024);
    let log: QueryLog = Arc::new(Mutex::new(Vec::new()));
    let backend_log = log.clone();
    tokio::spawn(async move {
        let mut conn = FramedConnection::new(backend_side);
        while let Ok(frame) = conn.receive().await {
            let replies = match frame.command() {
                Some(COM_QUERY) => {
                    let query = String::from_utf8_lossy(&frame.payload[1..]).into_owned();
                    backend_log.lock().push(query.clone());
                    if let Some(pause) = delay(&query) {
                        tokio::time::sleep(pause).await;
                    }
                    responder(&query)
                }
                Some(COM_QUIT) => break,
                _ => vec![ok()],
            };
            if replies.is_empty() || conn.send_all(replies.iter()).await.is_err() {
                break;
            }
        }
    });
    (proxy_side, log)
}
