//! MySQL protocol packet builders and parsers
//!
//! Everything here works on frame payloads (header already stripped).

use super::constants::*;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};
use sqp_common::{Result, SqpError};

// ---------------------------------------------------------------------------
// Length-encoded integers and strings
// ---------------------------------------------------------------------------

pub fn put_lenenc_int(buf: &mut BytesMut, value: u64) {
    if value < 0xfb {
        buf.put_u8(value as u8);
    } else if value <= 0xffff {
        buf.put_u8(0xfc);
        buf.put_u16_le(value as u16);
    } else if value <= 0x00ff_ffff {
        buf.put_u8(0xfd);
        buf.put_uint_le(value, 3);
    } else {
        buf.put_u8(0xfe);
        buf.put_u64_le(value);
    }
}

pub fn put_lenenc_bytes(buf: &mut BytesMut, data: &[u8]) {
    put_lenenc_int(buf, data.len() as u64);
    buf.put_slice(data);
}

fn truncated(what: &str) -> SqpError {
    SqpError::Protocol(format!("truncated packet while reading {}", what))
}

/// Read a length-encoded integer. `None` is the NULL marker (0xfb).
pub fn read_lenenc_int(buf: &mut &[u8]) -> Result<Option<u64>> {
    if !buf.has_remaining() {
        return Err(truncated("length-encoded integer"));
    }
    let first = buf.get_u8();
    let width = match first {
        0xfb => return Ok(None),
        0xfc => 2,
        0xfd => 3,
        0xfe => 8,
        0xff => return Err(SqpError::protocol("0xff is not a length-encoded integer")),
        n => return Ok(Some(n as u64)),
    };
    if buf.remaining() < width {
        return Err(truncated("length-encoded integer"));
    }
    Ok(Some(buf.get_uint_le(width)))
}

/// Read a length-encoded string. `None` is SQL NULL.
pub fn read_lenenc_bytes<'a>(buf: &mut &'a [u8]) -> Result<Option<&'a [u8]>> {
    let Some(len) = read_lenenc_int(buf)? else {
        return Ok(None);
    };
    let len = len as usize;
    let data: &'a [u8] = *buf;
    if data.len() < len {
        return Err(truncated("length-encoded string"));
    }
    let (value, rest) = data.split_at(len);
    *buf = rest;
    Ok(Some(value))
}

fn read_null_terminated<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8]> {
    let data: &'a [u8] = *buf;
    let end = data
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| truncated("null-terminated string"))?;
    *buf = &data[end + 1..];
    Ok(&data[..end])
}

/// Null-terminated string that may also run to the end of the packet
fn read_optional_string<'a>(buf: &mut &'a [u8]) -> Option<String> {
    let data: &'a [u8] = *buf;
    if data.is_empty() {
        return None;
    }
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    let value = String::from_utf8_lossy(&data[..end]).into_owned();
    *buf = if end < data.len() { &data[end + 1..] } else { &data[end..] };
    Some(value)
}

// ---------------------------------------------------------------------------
// Reply classification
// ---------------------------------------------------------------------------

pub fn is_ok_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&OK_HEADER)
}

pub fn is_err_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&ERR_HEADER)
}

pub fn is_eof_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&EOF_HEADER) && payload.len() < EOF_MAX_LEN
}

/// Status flags carried by an OK packet
pub fn ok_status_flags(payload: &[u8]) -> Option<u16> {
    let mut buf = payload.get(1..)?;
    read_lenenc_int(&mut buf).ok()?;
    read_lenenc_int(&mut buf).ok()?;
    (buf.len() >= 2).then(|| buf.get_u16_le())
}

/// Affected row count carried by an OK packet
pub fn ok_affected_rows(payload: &[u8]) -> Option<u64> {
    if !is_ok_packet(payload) {
        return None;
    }
    let mut buf = &payload[1..];
    read_lenenc_int(&mut buf).ok().flatten()
}

/// Status flags carried by a (pre-4.1-deprecation) EOF packet
pub fn eof_status_flags(payload: &[u8]) -> Option<u16> {
    if !is_eof_packet(payload) || payload.len() < 5 {
        return None;
    }
    Some(u16::from_le_bytes([payload[3], payload[4]]))
}

/// Decoded ERR packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacket {
    pub code: u16,
    pub sql_state: String,
    pub message: String,
}

pub fn parse_err_packet(payload: &[u8]) -> Result<ErrPacket> {
    if !is_err_packet(payload) || payload.len() < 3 {
        return Err(SqpError::protocol("not an ERR packet"));
    }
    let mut buf = &payload[1..];
    let code = buf.get_u16_le();
    let sql_state = if buf.first() == Some(&b'#') && buf.len() >= 6 {
        let state = String::from_utf8_lossy(&buf[1..6]).into_owned();
        buf.advance(6);
        state
    } else {
        "HY000".to_string()
    };
    Ok(ErrPacket {
        code,
        sql_state,
        message: String::from_utf8_lossy(buf).into_owned(),
    })
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// COM_QUERY command payload
pub fn build_query(text: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + text.len());
    buf.put_u8(COM_QUERY);
    buf.put_slice(text.as_bytes());
    buf.freeze()
}

pub fn build_ok(affected_rows: u64, last_insert_id: u64, status: u16, warnings: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(16);
    buf.put_u8(OK_HEADER);
    put_lenenc_int(&mut buf, affected_rows);
    put_lenenc_int(&mut buf, last_insert_id);
    buf.put_u16_le(status);
    buf.put_u16_le(warnings);
    buf.freeze()
}

pub fn build_err(code: u16, sql_state: &str, message: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(9 + message.len());
    buf.put_u8(ERR_HEADER);
    buf.put_u16_le(code);
    buf.put_u8(b'#');
    let mut state = [b'0'; 5];
    for (dst, src) in state.iter_mut().zip(sql_state.bytes()) {
        *dst = src;
    }
    buf.put_slice(&state);
    buf.put_slice(message.as_bytes());
    buf.freeze()
}

/// Protocol v10 greeting sent by the proxy to a client
pub fn build_greeting(connection_id: u32, scramble: &[u8; SCRAMBLE_LEN]) -> Bytes {
    let mut buf = BytesMut::with_capacity(128);
    buf.put_u8(10);
    buf.put_slice(SERVER_VERSION.as_bytes());
    buf.put_u8(0);
    buf.put_u32_le(connection_id);
    buf.put_slice(&scramble[..8]);
    buf.put_u8(0);
    buf.put_u16_le((PROXY_CAPABILITIES & 0xffff) as u16);
    buf.put_u8(DEFAULT_CHARSET);
    buf.put_u16_le(SERVER_STATUS_AUTOCOMMIT);
    buf.put_u16_le((PROXY_CAPABILITIES >> 16) as u16);
    buf.put_u8((SCRAMBLE_LEN + 1) as u8);
    buf.put_slice(&[0u8; 10]);
    buf.put_slice(&scramble[8..]);
    buf.put_u8(0);
    buf.put_slice(NATIVE_PASSWORD_PLUGIN.as_bytes());
    buf.put_u8(0);
    buf.freeze()
}

/// Greeting received from a backend
#[derive(Debug, Clone)]
pub struct ServerGreeting {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub scramble: Vec<u8>,
    pub capabilities: u32,
    pub charset: u8,
    pub status: u16,
    pub auth_plugin: Option<String>,
}

pub fn parse_greeting(payload: &[u8]) -> Result<ServerGreeting> {
    let mut buf = payload;
    if !buf.has_remaining() {
        return Err(truncated("greeting"));
    }
    let protocol_version = buf.get_u8();
    if protocol_version != 10 {
        return Err(SqpError::Protocol(format!(
            "unsupported handshake protocol version {}",
            protocol_version
        )));
    }
    let server_version = String::from_utf8_lossy(read_null_terminated(&mut buf)?).into_owned();
    if buf.remaining() < 4 + 8 + 1 + 2 {
        return Err(truncated("greeting"));
    }
    let connection_id = buf.get_u32_le();
    let mut scramble = buf[..8].to_vec();
    buf.advance(8);
    buf.advance(1);
    let mut capabilities = buf.get_u16_le() as u32;

    let mut charset = DEFAULT_CHARSET;
    let mut status = 0;
    let mut auth_plugin = None;
    if buf.remaining() >= 1 + 2 + 2 + 1 + 10 {
        charset = buf.get_u8();
        status = buf.get_u16_le();
        capabilities |= (buf.get_u16_le() as u32) << 16;
        let auth_len = buf.get_u8() as usize;
        buf.advance(10);
        if capabilities & CLIENT_SECURE_CONNECTION != 0 {
            let part2_len = auth_len.saturating_sub(8).max(13).min(buf.len());
            let part2 = &buf[..part2_len];
            let part2 = part2.strip_suffix(&[0]).unwrap_or(part2);
            scramble.extend_from_slice(part2);
            buf.advance(part2_len);
        }
        if capabilities & CLIENT_PLUGIN_AUTH != 0 {
            auth_plugin = read_optional_string(&mut buf);
        }
    }

    Ok(ServerGreeting {
        protocol_version,
        server_version,
        connection_id,
        scramble,
        capabilities,
        charset,
        status,
        auth_plugin,
    })
}

/// HandshakeResponse41, both as read from a client and as sent to a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub capabilities: u32,
    pub max_packet_size: u32,
    pub charset: u8,
    pub username: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
    pub auth_plugin: Option<String>,
}

pub fn parse_handshake_response(payload: &[u8]) -> Result<HandshakeResponse> {
    let mut buf = payload;
    if buf.remaining() < 4 + 4 + 1 + 23 {
        return Err(truncated("handshake response"));
    }
    let capabilities = buf.get_u32_le();
    if capabilities & CLIENT_PROTOCOL_41 == 0 {
        return Err(SqpError::AuthenticationFailed(
            "client does not speak protocol 4.1".into(),
        ));
    }
    let max_packet_size = buf.get_u32_le();
    let charset = buf.get_u8();
    buf.advance(23);

    // An SSLRequest stops right after the filler
    if !buf.has_remaining() && capabilities & CLIENT_SSL != 0 {
        return Err(SqpError::AuthenticationFailed(
            "TLS is not supported by the proxy".into(),
        ));
    }

    let username = String::from_utf8_lossy(read_null_terminated(&mut buf)?).into_owned();
    let auth_response = if capabilities & CLIENT_PLUGIN_AUTH_LENENC_DATA != 0 {
        read_lenenc_bytes(&mut buf)?.unwrap_or_default().to_vec()
    } else if capabilities & CLIENT_SECURE_CONNECTION != 0 {
        if !buf.has_remaining() {
            return Err(truncated("auth response"));
        }
        let len = buf.get_u8() as usize;
        if buf.len() < len {
            return Err(truncated("auth response"));
        }
        let auth = buf[..len].to_vec();
        buf.advance(len);
        auth
    } else {
        read_null_terminated(&mut buf)?.to_vec()
    };

    let database = if capabilities & CLIENT_CONNECT_WITH_DB != 0 {
        read_optional_string(&mut buf).filter(|db| !db.is_empty())
    } else {
        None
    };
    let auth_plugin = if capabilities & CLIENT_PLUGIN_AUTH != 0 {
        read_optional_string(&mut buf)
    } else {
        None
    };

    Ok(HandshakeResponse {
        capabilities,
        max_packet_size,
        charset,
        username,
        auth_response,
        database,
        auth_plugin,
    })
}

pub fn build_handshake_response(resp: &HandshakeResponse) -> Bytes {
    let mut buf = BytesMut::with_capacity(128);
    buf.put_u32_le(resp.capabilities);
    buf.put_u32_le(resp.max_packet_size);
    buf.put_u8(resp.charset);
    buf.put_slice(&[0u8; 23]);
    buf.put_slice(resp.username.as_bytes());
    buf.put_u8(0);
    if resp.capabilities & CLIENT_PLUGIN_AUTH_LENENC_DATA != 0 {
        put_lenenc_bytes(&mut buf, &resp.auth_response);
    } else {
        buf.put_u8(resp.auth_response.len() as u8);
        buf.put_slice(&resp.auth_response);
    }
    if resp.capabilities & CLIENT_CONNECT_WITH_DB != 0 {
        if let Some(db) = &resp.database {
            buf.put_slice(db.as_bytes());
        }
        buf.put_u8(0);
    }
    if resp.capabilities & CLIENT_PLUGIN_AUTH != 0 {
        buf.put_slice(
            resp.auth_plugin
                .as_deref()
                .unwrap_or(NATIVE_PASSWORD_PLUGIN)
                .as_bytes(),
        );
        buf.put_u8(0);
    }
    buf.freeze()
}

/// AuthSwitchRequest (0xfe + plugin name + plugin data)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSwitchRequest {
    pub plugin: String,
    pub data: Vec<u8>,
}

pub fn parse_auth_switch(payload: &[u8]) -> Result<AuthSwitchRequest> {
    if payload.first() != Some(&EOF_HEADER) {
        return Err(SqpError::protocol("not an auth switch request"));
    }
    let mut buf = &payload[1..];
    let plugin = String::from_utf8_lossy(read_null_terminated(&mut buf)?).into_owned();
    let data = buf.strip_suffix(&[0]).unwrap_or(buf).to_vec();
    Ok(AuthSwitchRequest { plugin, data })
}

/// mysql_native_password: SHA1(pw) XOR SHA1(seed + SHA1(SHA1(pw)))
pub fn scramble_native_password(password: &[u8], seed: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let stage1 = Sha1::digest(password);
    let stage2 = Sha1::digest(&stage1[..]);
    let mut hasher = Sha1::new();
    hasher.update(seed);
    hasher.update(&stage2[..]);
    let mix = hasher.finalize();
    stage1.iter().zip(mix.iter()).map(|(a, b)| a ^ b).collect()
}
