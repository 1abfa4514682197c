//! Handshakes
//!
//! The proxy terminates the client handshake itself (it never checks the
//! client's password) and logs into every backend with the configured
//! credentials. The derived client session decides the capabilities
//! requested from each backend.

use super::framed::FramedConnection;
use super::protocol::constants::*;
use super::protocol::messages::{
    build_greeting, build_handshake_response, parse_auth_switch, parse_err_packet,
    parse_greeting, parse_handshake_response, scramble_native_password, HandshakeResponse,
};
use super::transport::Transport;
use bytes::Bytes;
use rand::Rng;
use sqp_common::{Result, SqpError};
use tracing::{debug, info};

/// Auth round trips tolerated before giving up on a backend
const MAX_AUTH_ROUNDS: usize = 4;

/// Credentials presented to every replica
#[derive(Debug, Clone, Default)]
pub struct BackendCredentials {
    /// Empty means "reuse the client's user name"
    pub user: String,
    pub password: String,
}

/// What the client told us during its handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSession {
    pub capabilities: u32,
    pub max_packet_size: u32,
    pub charset: u8,
    pub user: String,
    pub database: Option<String>,
}

impl ClientSession {
    /// Capabilities requested from a backend advertising `server_caps`
    pub fn backend_capabilities(&self, server_caps: u32) -> u32 {
        let mut caps = (self.capabilities
            | CLIENT_PROTOCOL_41
            | CLIENT_SECURE_CONNECTION
            | CLIENT_PLUGIN_AUTH)
            & server_caps
            & !STRIPPED_CAPABILITIES;
        if self.database.is_none() {
            caps &= !CLIENT_CONNECT_WITH_DB;
        }
        caps
    }
}

fn random_scramble() -> [u8; SCRAMBLE_LEN] {
    let mut rng = rand::thread_rng();
    let mut scramble = [0u8; SCRAMBLE_LEN];
    for byte in scramble.iter_mut() {
        // printable, never NUL
        *byte = rng.gen_range(0x21..0x7f);
    }
    scramble
}

/// Greet a client and read its HandshakeResponse41
pub async fn accept_client<C: Transport>(
    client: &mut FramedConnection<C>,
    connection_id: u32,
) -> Result<ClientSession> {
    let scramble = random_scramble();
    client.reset_sequence();
    client.send(&build_greeting(connection_id, &scramble)).await?;

    let frame = client.receive().await?;
    let response = parse_handshake_response(&frame.payload)?;
    debug!(
        connection_id,
        user = %response.username,
        database = ?response.database,
        capabilities = format_args!("{:#x}", response.capabilities),
        "Client handshake received"
    );

    Ok(ClientSession {
        capabilities: response.capabilities & PROXY_CAPABILITIES,
        max_packet_size: response.max_packet_size,
        charset: response.charset,
        user: response.username,
        database: response.database,
    })
}

/// Log into one backend. Returns the backend's final OK payload.
pub async fn authenticate_backend<T: Transport>(
    conn: &mut FramedConnection<T>,
    session: &ClientSession,
    credentials: &BackendCredentials,
) -> Result<Bytes> {
    let frame = conn.receive().await?;
    if let Ok(err) = parse_err_packet(&frame.payload) {
        return Err(SqpError::AuthenticationFailed(err.message));
    }
    let greeting = parse_greeting(&frame.payload)?;
    let password = credentials.password.as_bytes();
    let user = if credentials.user.is_empty() {
        session.user.clone()
    } else {
        credentials.user.clone()
    };

    let response = HandshakeResponse {
        capabilities: session.backend_capabilities(greeting.capabilities),
        max_packet_size: session.max_packet_size,
        charset: session.charset,
        username: user,
        auth_response: scramble_native_password(password, &greeting.scramble),
        database: session.database.clone(),
        auth_plugin: Some(NATIVE_PASSWORD_PLUGIN.to_string()),
    };
    conn.send(&build_handshake_response(&response)).await?;

    for _ in 0..MAX_AUTH_ROUNDS {
        let reply = conn.receive().await?;
        match reply.command() {
            Some(OK_HEADER) => {
                info!(
                    server_version = %greeting.server_version,
                    backend_connection = greeting.connection_id,
                    "Backend authenticated"
                );
                return Ok(reply.payload);
            }
            Some(ERR_HEADER) => {
                let err = parse_err_packet(&reply.payload)?;
                return Err(SqpError::AuthenticationFailed(format!(
                    "{} ({})",
                    err.message, err.code
                )));
            }
            Some(EOF_HEADER) => {
                let switch = parse_auth_switch(&reply.payload)?;
                if switch.plugin != NATIVE_PASSWORD_PLUGIN {
                    return Err(SqpError::AuthenticationFailed(format!(
                        "unsupported auth plugin '{}'",
                        switch.plugin
                    )));
                }
                debug!("Backend requested auth switch to {}", switch.plugin);
                conn.send(&scramble_native_password(password, &switch.data)).await?;
            }
            Some(AUTH_MORE_DATA_HEADER)
                if reply.payload.get(1) == Some(&FAST_AUTH_SUCCESS) =>
            {
                // caching_sha2 fast path: an OK packet follows
                continue;
            }
            _ => {
                return Err(SqpError::AuthenticationFailed(
                    "backend requires an authentication method the proxy cannot perform".into(),
                ))
            }
        }
    }
    Err(SqpError::AuthenticationFailed(
        "too many authentication round trips".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mysql_wire::protocol::messages::{build_err, build_ok};

    fn client_session() -> ClientSession {
        ClientSession {
            capabilities: CLIENT_PROTOCOL_41
                | CLIENT_SECURE_CONNECTION
                | CLIENT_PLUGIN_AUTH
                | CLIENT_DEPRECATE_EOF
                | CLIENT_TRANSACTIONS,
            max_packet_size: 1 << 24,
            charset: DEFAULT_CHARSET,
            user: "app".into(),
            database: None,
        }
    }

    #[test]
    fn test_backend_capabilities_strip_eof_deprecation() {
        let caps = client_session().backend_capabilities(0xffff_ffff);
        assert_eq!(caps & CLIENT_DEPRECATE_EOF, 0);
        assert_eq!(caps & CLIENT_CONNECT_WITH_DB, 0);
        assert_ne!(caps & CLIENT_TRANSACTIONS, 0);
    }

    #[test]
    fn test_random_scramble_has_no_nul() {
        assert!(random_scramble().iter().all(|&b| b != 0));
    }

    #[tokio::test]
    async fn test_backend_login_with_auth_switch() {
        let (proxy_side, backend_side) = tokio::io::duplex(4096);
        let backend = tokio::spawn(async move {
            let mut conn = FramedConnection::new(backend_side);
            conn.send(&build_greeting(9, b"abcdefghijklmnopqrst")).await.unwrap();
            let login = conn.receive().await.unwrap();
            let login = parse_handshake_response(&login.payload).unwrap();

            let mut switch = vec![EOF_HEADER];
            switch.extend_from_slice(b"mysql_native_password\0");
            switch.extend_from_slice(b"ABCDEFGHIJKLMNOPQRST\0");
            conn.send(&switch).await.unwrap();
            let token = conn.receive().await.unwrap();
            conn.send(&build_ok(0, 0, 0, 0)).await.unwrap();
            (login, token.payload)
        });

        let mut conn = FramedConnection::new(proxy_side);
        let credentials = BackendCredentials {
            user: "proxy".into(),
            password: "pw".into(),
        };
        let reply = authenticate_backend(&mut conn, &client_session(), &credentials)
            .await
            .unwrap();
        assert_eq!(reply[0], OK_HEADER);

        let (login, token) = backend.await.unwrap();
        assert_eq!(login.username, "proxy");
        assert_eq!(
            login.auth_response,
            scramble_native_password(b"pw", b"abcdefghijklmnopqrst")
        );
        assert_eq!(
            token.to_vec(),
            scramble_native_password(b"pw", b"ABCDEFGHIJKLMNOPQRST")
        );
    }

    #[tokio::test]
    async fn test_backend_login_rejected() {
        let (proxy_side, backend_side) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut conn = FramedConnection::new(backend_side);
            conn.send(&build_greeting(1, b"abcdefghijklmnopqrst")).await.unwrap();
            let _ = conn.receive().await.unwrap();
            conn.send(&build_err(1045, "28000", "Access denied for user 'app'"))
                .await
                .unwrap();
        });

        let mut conn = FramedConnection::new(proxy_side);
        let err = authenticate_backend(&mut conn, &client_session(), &BackendCredentials::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SqpError::AuthenticationFailed(msg) if msg.contains("Access denied")));
    }
}
