//! Server reply assembly
//!
//! A backend reply to one command spans one or more frames. The assembler
//! consumes frames as they arrive (possibly through non-blocking polls) and
//! reports when the reply is complete, so a replica's outstanding flag can be
//! cleared without ever blocking on it.

use super::constants::*;
use super::messages::{
    eof_status_flags, is_eof_packet, is_err_packet, is_ok_packet, ok_affected_rows,
    ok_status_flags, parse_err_packet, read_lenenc_bytes, read_lenenc_int, ErrPacket,
};
use bytes::Bytes;
use sqp_common::{Result, SqpError};

/// Shape of the reply a command produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// OK, ERR or a (possibly multi-) result set
    Query,
    /// Exactly one packet (ping, init db, statistics, ...)
    Single,
    /// Column definitions up to EOF
    FieldList,
    /// Prepared statement OK followed by parameter and column definitions
    Prepare,
    /// The server sends nothing back
    NoReply,
}

impl ResponseKind {
    pub fn for_command(command: u8) -> Self {
        match command {
            COM_QUERY | COM_STMT_EXECUTE => ResponseKind::Query,
            COM_FIELD_LIST => ResponseKind::FieldList,
            COM_STMT_PREPARE => ResponseKind::Prepare,
            COM_QUIT | COM_STMT_CLOSE | COM_STMT_SEND_LONG_DATA => ResponseKind::NoReply,
            _ => ResponseKind::Single,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    Columns { remaining: u64 },
    ColumnsEof,
    Rows,
    Trailing { remaining: u64 },
    UntilEof,
    Done,
}

/// Incremental reply assembler
#[derive(Debug)]
pub struct ResponseAssembler {
    kind: ResponseKind,
    state: State,
    frames: Vec<Bytes>,
}

impl ResponseAssembler {
    pub fn new(kind: ResponseKind) -> Self {
        let state = match kind {
            ResponseKind::NoReply => State::Done,
            ResponseKind::FieldList => State::UntilEof,
            _ => State::Start,
        };
        Self {
            kind,
            state,
            frames: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == State::Done
    }

    /// Feed one frame payload; returns true once the reply is complete
    pub fn push(&mut self, payload: Bytes) -> Result<bool> {
        if self.state == State::Done {
            return Err(SqpError::protocol("frame received after reply completed"));
        }
        self.state = self.next_state(&payload)?;
        self.frames.push(payload);
        Ok(self.is_complete())
    }

    fn next_state(&self, payload: &[u8]) -> Result<State> {
        if payload.is_empty() {
            return Err(SqpError::protocol("empty reply packet"));
        }
        let state = match (self.kind, self.state) {
            (ResponseKind::Single, State::Start) => State::Done,
            (ResponseKind::Prepare, State::Start) => {
                if is_ok_packet(payload) && payload.len() >= 9 {
                    let columns = u16::from_le_bytes([payload[5], payload[6]]) as u64;
                    let params = u16::from_le_bytes([payload[7], payload[8]]) as u64;
                    let section = |n: u64| if n > 0 { n + 1 } else { 0 };
                    match section(params) + section(columns) {
                        0 => State::Done,
                        remaining => State::Trailing { remaining },
                    }
                } else {
                    State::Done
                }
            }
            (_, State::Start) => {
                if is_ok_packet(payload) {
                    more_results(ok_status_flags(payload))
                } else if is_err_packet(payload) || payload[0] == LOCAL_INFILE_HEADER {
                    State::Done
                } else {
                    let mut buf = payload;
                    match read_lenenc_int(&mut buf)? {
                        Some(n) if n > 0 => State::Columns { remaining: n },
                        _ => return Err(SqpError::protocol("invalid result set column count")),
                    }
                }
            }
            (_, State::Columns { remaining }) => match remaining - 1 {
                0 => State::ColumnsEof,
                remaining => State::Columns { remaining },
            },
            (_, State::ColumnsEof) => {
                if is_eof_packet(payload) {
                    State::Rows
                } else if is_err_packet(payload) {
                    State::Done
                } else {
                    return Err(SqpError::protocol("expected EOF after column definitions"));
                }
            }
            (_, State::Rows) => {
                if is_eof_packet(payload) {
                    more_results(eof_status_flags(payload))
                } else if is_err_packet(payload) {
                    State::Done
                } else {
                    State::Rows
                }
            }
            (_, State::Trailing { remaining }) => match remaining - 1 {
                0 => State::Done,
                remaining => State::Trailing { remaining },
            },
            (_, State::UntilEof) => {
                if is_eof_packet(payload) || is_err_packet(payload) {
                    State::Done
                } else {
                    State::UntilEof
                }
            }
            (_, State::Done) => State::Done,
        };
        Ok(state)
    }

    pub fn finish(self) -> Response {
        Response {
            frames: self.frames,
        }
    }
}

fn more_results(status: Option<u16>) -> State {
    match status {
        Some(flags) if flags & SERVER_MORE_RESULTS_EXISTS != 0 => State::Start,
        _ => State::Done,
    }
}

/// Column type codes that render as bare numeric literals
const NUMERIC_COLUMN_TYPES: &[u8] = &[
    0x00, // DECIMAL
    0x01, // TINY
    0x02, // SHORT
    0x03, // LONG
    0x04, // FLOAT
    0x05, // DOUBLE
    0x08, // LONGLONG
    0x09, // INT24
    0x0d, // YEAR
    0xf6, // NEWDECIMAL
];

/// Column metadata needed to re-emit values as SQL literals
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub column_type: u8,
}

impl ColumnInfo {
    pub fn is_numeric(&self) -> bool {
        NUMERIC_COLUMN_TYPES.contains(&self.column_type)
    }
}

/// A decoded text-protocol result set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextResultSet {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Vec<Option<String>>>,
}

/// A complete backend reply: the ordered frame payloads
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    frames: Vec<Bytes>,
}

impl Response {
    pub fn from_frames(frames: Vec<Bytes>) -> Self {
        Self { frames }
    }

    pub fn frames(&self) -> &[Bytes] {
        &self.frames
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn is_ok(&self) -> bool {
        self.frames.first().is_some_and(|f| is_ok_packet(f))
    }

    pub fn is_err(&self) -> bool {
        self.frames.first().is_some_and(|f| is_err_packet(f))
    }

    pub fn error(&self) -> Option<ErrPacket> {
        self.frames
            .first()
            .filter(|f| is_err_packet(f))
            .and_then(|f| parse_err_packet(f).ok())
    }

    pub fn affected_rows(&self) -> Option<u64> {
        self.frames.first().and_then(|f| ok_affected_rows(f))
    }

    /// Decode the first result set of a text-protocol reply.
    ///
    /// Returns `None` for OK / ERR replies.
    pub fn text_result_set(&self) -> Result<Option<TextResultSet>> {
        let Some(header) = self.frames.first() else {
            return Ok(None);
        };
        if is_ok_packet(header) || is_err_packet(header) {
            return Ok(None);
        }
        let mut buf = &header[..];
        let count = read_lenenc_int(&mut buf)?
            .ok_or_else(|| SqpError::protocol("NULL column count"))? as usize;
        if self.frames.len() < count + 2 {
            return Err(SqpError::protocol("result set shorter than its column count"));
        }

        let columns = self.frames[1..=count]
            .iter()
            .map(|def| parse_column_definition(def))
            .collect::<Result<Vec<_>>>()?;

        let mut rows = Vec::new();
        for frame in &self.frames[count + 2..] {
            if is_eof_packet(frame) || is_err_packet(frame) {
                break;
            }
            let mut buf = &frame[..];
            let mut row = Vec::with_capacity(count);
            for _ in 0..count {
                let value = read_lenenc_bytes(&mut buf)?
                    .map(|v| String::from_utf8_lossy(v).into_owned());
                row.push(value);
            }
            rows.push(row);
        }
        Ok(Some(TextResultSet { columns, rows }))
    }
}

/// ColumnDefinition41: six length-encoded strings, then fixed fields
fn parse_column_definition(payload: &[u8]) -> Result<ColumnInfo> {
    let mut buf = payload;
    let mut strings = Vec::with_capacity(6);
    for _ in 0..6 {
        strings.push(read_lenenc_bytes(&mut buf)?.unwrap_or_default());
    }
    // fixed-length block: 0x0c, charset(2), length(4), type(1), ...
    if buf.len() < 8 {
        return Err(SqpError::protocol("truncated column definition"));
    }
    Ok(ColumnInfo {
        name: String::from_utf8_lossy(strings[4]).into_owned(),
        column_type: buf[7],
    })
}
