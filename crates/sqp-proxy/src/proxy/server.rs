//! MySQL listener
//!
//! Accepts clients, applies admission control (connection limit and
//! blocked hosts), opens the replica connections for each session and hands
//! everything to a `Session` task.

use super::session::{Session, SessionContext};
use crate::metrics;
use crate::mysql_wire::auth::{self, BackendCredentials};
use crate::mysql_wire::protocol::constants::{
    ER_CON_COUNT_ERROR, ER_HANDSHAKE_ERROR, ER_HOST_IS_BLOCKED,
};
use crate::mysql_wire::protocol::messages::build_err;
use crate::mysql_wire::FramedConnection;
use crate::server_group::ServerGroup;
use parking_lot::Mutex;
use socket2::SockRef;
use sqp_common::{ProxyConfig, Result, SqpError};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Configure TCP keepalive on a socket to detect dead connections
pub fn configure_tcp_keepalive(stream: &TcpStream, keepalive_secs: u64) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }

    let socket = SockRef::from(stream);
    if let Err(e) = socket.set_keepalive(true) {
        warn!("Failed to enable TCP keepalive: {}", e);
        return;
    }

    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(keepalive_secs))
        .with_interval(Duration::from_secs(keepalive_secs / 2 + 1));

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    let keepalive = keepalive.with_retries(3);

    if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
        warn!("Failed to configure TCP keepalive timing: {}", e);
    } else {
        debug!("TCP keepalive configured: {}s", keepalive_secs);
    }
}

/// Outcome of admission control for one client
pub enum Admission {
    Admitted(ConnectionPermit),
    TooManyConnections,
    HostBlocked,
}

/// Process-wide connection limit and per-host handshake error counters
pub struct ConnectionGuard {
    max_connections: usize,
    max_connect_errors: u64,
    active: AtomicUsize,
    errors: Mutex<HashMap<IpAddr, u64>>,
}

/// Holds one connection slot until dropped
pub struct ConnectionPermit {
    guard: Arc<ConnectionGuard>,
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        self.guard.active.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ConnectionGuard {
    pub fn new(max_connections: usize, max_connect_errors: u64) -> Self {
        Self {
            max_connections,
            max_connect_errors,
            active: AtomicUsize::new(0),
            errors: Mutex::new(HashMap::new()),
        }
    }

    pub fn admit(self: &Arc<Self>, host: IpAddr) -> Admission {
        if self.is_blocked(host) {
            return Admission::HostBlocked;
        }
        let previous = self.active.fetch_add(1, Ordering::AcqRel);
        if previous >= self.max_connections {
            self.active.fetch_sub(1, Ordering::AcqRel);
            return Admission::TooManyConnections;
        }
        Admission::Admitted(ConnectionPermit {
            guard: Arc::clone(self),
        })
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_blocked(&self, host: IpAddr) -> bool {
        self.errors
            .lock()
            .get(&host)
            .is_some_and(|&count| count >= self.max_connect_errors)
    }

    pub fn record_failure(&self, host: IpAddr) {
        let mut errors = self.errors.lock();
        let count = errors.entry(host).or_insert(0);
        *count += 1;
        if *count == self.max_connect_errors {
            warn!(%host, errors = *count, "Host blocked after repeated connection errors");
        }
    }

    /// A completed handshake forgives earlier failures
    pub fn record_success(&self, host: IpAddr) {
        self.errors.lock().remove(&host);
    }
}

/// MySQL-protocol front end of the proxy
pub struct ProxyServer {
    config: Arc<ProxyConfig>,
    context: Arc<SessionContext>,
    guard: Arc<ConnectionGuard>,
    next_connection_id: Arc<AtomicU32>,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig) -> Result<Self> {
        let context = SessionContext::from_config(&config)?;
        Ok(Self::with_context(config, context))
    }

    pub fn with_context(config: ProxyConfig, context: SessionContext) -> Self {
        let guard = ConnectionGuard::new(config.max_connections, config.max_connect_errors);
        Self {
            config: Arc::new(config),
            context: Arc::new(context),
            guard: Arc::new(guard),
            next_connection_id: Arc::new(AtomicU32::new(1)),
        }
    }

    pub fn guard(&self) -> &Arc<ConnectionGuard> {
        &self.guard
    }

    /// Bind the configured address and serve forever
    pub async fn start(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        info!(
            addr = %self.config.listen_addr,
            replicas = self.config.backends.len(),
            "MySQL proxy listening"
        );
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            let (socket, peer_addr) = listener.accept().await?;
            info!("New MySQL connection from {}", peer_addr);

            configure_tcp_keepalive(&socket, self.config.tcp_keepalive_secs);

            let config = self.config.clone();
            let context = self.context.clone();
            let guard = self.guard.clone();
            let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);

            tokio::spawn(async move {
                if let Err(e) =
                    handle_connection(socket, peer_addr, config, context, guard, connection_id)
                        .await
                {
                    if e.is_disconnect() {
                        debug!("Client disconnected: {}", e);
                    } else {
                        error!("Error handling MySQL connection from {}: {}", peer_addr, e);
                    }
                }
            });
        }
    }
}

async fn handle_connection(
    socket: TcpStream,
    peer_addr: SocketAddr,
    config: Arc<ProxyConfig>,
    context: Arc<SessionContext>,
    guard: Arc<ConnectionGuard>,
    connection_id: u32,
) -> Result<()> {
    let host = peer_addr.ip();
    let mut client = FramedConnection::new(socket);

    let _permit = match guard.admit(host) {
        Admission::Admitted(permit) => permit,
        Admission::TooManyConnections => {
            warn!(%peer_addr, active = guard.active(), "Rejecting client: too many connections");
            metrics::record_rejected_connection("too_many");
            client
                .send(&build_err(ER_CON_COUNT_ERROR, "08004", "Too many connections"))
                .await?;
            client.close().await?;
            return Ok(());
        }
        Admission::HostBlocked => {
            warn!(%peer_addr, "Rejecting client: host is blocked");
            metrics::record_rejected_connection("blocked");
            let message = format!(
                "Host '{}' is blocked because of many connection errors",
                host
            );
            client
                .send(&build_err(ER_HOST_IS_BLOCKED, "HY000", &message))
                .await?;
            client.close().await?;
            return Ok(());
        }
    };

    let backends = match connect_backends(&config).await {
        Ok(backends) => backends,
        Err(e) => {
            let message = format!("Cannot reach backend replicas: {}", e);
            if let Err(send_err) = client
                .send(&build_err(ER_HANDSHAKE_ERROR, "08S01", &message))
                .await
            {
                debug!("Could not report backend failure to client: {}", send_err);
            }
            return Err(e);
        }
    };

    let mut group = ServerGroup::new(backends);

    // only the client's own handshake counts against its host
    let session = match auth::accept_client(&mut client, connection_id).await {
        Ok(session) => {
            guard.record_success(host);
            session
        }
        Err(e) => {
            guard.record_failure(host);
            metrics::record_rejected_connection("handshake");
            group.close().await;
            return Err(e);
        }
    };

    let credentials = BackendCredentials {
        user: config.backend_user.clone(),
        password: config.backend_password.clone(),
    };
    if let Err(e) = group.authenticate(&mut client, &session, &credentials).await {
        metrics::record_rejected_connection("backend_auth");
        return Err(e);
    }
    info!(
        connection_id,
        user = %session.user,
        database = session.database.as_deref().unwrap_or(""),
        "Client authenticated"
    );

    Session::new(client, group, context).run().await
}

/// Open one connection per replica, in replica order
async fn connect_backends(config: &ProxyConfig) -> Result<Vec<TcpStream>> {
    let timeout = Duration::from_secs(config.connect_timeout_secs);
    let mut streams = Vec::with_capacity(config.backends.len());
    for (index, addr) in config.backends.iter().enumerate() {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                SqpError::Transport(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connecting to replica {} ({}) timed out", index, addr),
                ))
            })??;
        if let Err(e) = stream.set_nodelay(true) {
            warn!(replica = index, "Failed to set TCP_NODELAY: {}", e);
        }
        debug!(replica = index, %addr, "Connected to replica");
        streams.push(stream);
    }
    Ok(streams)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mysql_wire::protocol::constants::{
        CLIENT_PLUGIN_AUTH, CLIENT_PROTOCOL_41, CLIENT_SECURE_CONNECTION, DEFAULT_CHARSET,
    };
    use crate::mysql_wire::protocol::messages::{
        build_greeting, build_handshake_response, parse_err_packet, parse_greeting,
        scramble_native_password, ErrPacket, HandshakeResponse,
    };
    use bytes::Bytes;
    use sqp_common::SpeculatorKind;
    use std::net::Ipv4Addr;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[test]
    fn test_connection_limit_and_permit_release() {
        let guard = Arc::new(ConnectionGuard::new(1, 10));
        let first = guard.admit(LOCALHOST);
        assert!(matches!(first, Admission::Admitted(_)));
        assert!(matches!(guard.admit(LOCALHOST), Admission::TooManyConnections));
        assert_eq!(guard.active(), 1);
        drop(first);
        assert_eq!(guard.active(), 0);
        assert!(matches!(guard.admit(LOCALHOST), Admission::Admitted(_)));
    }

    #[test]
    fn test_host_blocked_after_errors_and_cleared_by_success() {
        let guard = Arc::new(ConnectionGuard::new(10, 2));
        guard.record_failure(LOCALHOST);
        assert!(!guard.is_blocked(LOCALHOST));
        guard.record_failure(LOCALHOST);
        assert!(matches!(guard.admit(LOCALHOST), Admission::HostBlocked));
        assert_eq!(guard.active(), 0);
        guard.record_success(LOCALHOST);
        assert!(!guard.is_blocked(LOCALHOST));
    }

    fn test_config(max_connections: usize) -> ProxyConfig {
        let mut config = ProxyConfig {
            backends: vec!["127.0.0.1:9".into()],
            max_connections,
            ..Default::default()
        };
        config.speculation.kind = SpeculatorKind::Disabled;
        config
    }

    async fn first_error(server: ProxyServer) -> ErrPacket {
        first_error_at(spawn_proxy(server).await).await
    }

    async fn first_error_at(addr: SocketAddr) -> ErrPacket {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut conn = FramedConnection::new(stream);
        let frame = conn.receive().await.unwrap();
        assert_eq!(frame.sequence, 0);
        parse_err_packet(&frame.payload).unwrap()
    }

    #[tokio::test]
    async fn test_over_limit_client_gets_1040() {
        let server = ProxyServer::new(test_config(0)).unwrap();
        let err = first_error(server).await;
        assert_eq!(err.code, 1040);
        assert_eq!(err.sql_state, "08004");
        assert_eq!(err.message, "Too many connections");
    }

    #[tokio::test]
    async fn test_blocked_host_gets_1129() {
        let mut config = test_config(10);
        config.max_connect_errors = 1;
        let server = ProxyServer::new(config).unwrap();
        server.guard().record_failure(LOCALHOST);
        let err = first_error(server).await;
        assert_eq!(err.code, 1129);
        assert_eq!(err.message, "Host '127.0.0.1' is blocked because of many connection errors");
    }

    /// Backend that greets every connection and refuses the proxy's login
    async fn rejecting_backend() -> SocketAddr {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = backend.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = backend.accept().await {
                let mut conn = FramedConnection::new(stream);
                let _ = conn.send(&build_greeting(1, b"abcdefghijklmnopqrst")).await;
                let _ = conn.receive().await;
                let _ = conn
                    .send(&build_err(1045, "28000", "Access denied for user 'proxy'"))
                    .await;
            }
        });
        addr
    }

    async fn spawn_proxy(server: ProxyServer) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { server.serve(listener).await });
        addr
    }

    /// Complete the client handshake; returns the proxy's final reply
    async fn login(proxy: SocketAddr, handshake: impl FnOnce(&[u8]) -> Bytes) -> Bytes {
        let mut conn = FramedConnection::new(TcpStream::connect(proxy).await.unwrap());
        let greeting = conn.receive().await.unwrap();
        let greeting = parse_greeting(&greeting.payload).unwrap();
        conn.send(&handshake(&greeting.scramble)).await.unwrap();
        conn.receive().await.unwrap().payload
    }

    fn app_login(scramble: &[u8]) -> Bytes {
        build_handshake_response(&HandshakeResponse {
            capabilities: CLIENT_PROTOCOL_41 | CLIENT_SECURE_CONNECTION | CLIENT_PLUGIN_AUTH,
            max_packet_size: 1 << 24,
            charset: DEFAULT_CHARSET,
            username: "app".into(),
            auth_response: scramble_native_password(b"secret", scramble),
            database: None,
            auth_plugin: None,
        })
    }

    #[tokio::test]
    async fn test_replica_rejection_does_not_block_client_host() {
        let mut config = test_config(10);
        config.backends = vec![rejecting_backend().await.to_string()];
        config.max_connect_errors = 1;
        let server = ProxyServer::new(config).unwrap();
        let guard = server.guard().clone();
        let proxy = spawn_proxy(server).await;

        // a blocked host would get 1129 instead of a greeting the second time
        for _ in 0..2 {
            let reply = login(proxy, app_login).await;
            let err = parse_err_packet(&reply).unwrap();
            assert_eq!(err.code, ER_HANDSHAKE_ERROR);
            assert!(err.message.contains("Access denied"));
        }
        assert!(!guard.is_blocked(LOCALHOST));
    }

    #[tokio::test]
    async fn test_malformed_client_handshake_counts_against_host() {
        let mut config = test_config(10);
        config.backends = vec![rejecting_backend().await.to_string()];
        config.max_connect_errors = 1;
        let server = ProxyServer::new(config).unwrap();
        let guard = server.guard().clone();
        let proxy = spawn_proxy(server).await;

        let mut conn = FramedConnection::new(TcpStream::connect(proxy).await.unwrap());
        conn.receive().await.unwrap();
        conn.send(&[0x00, 0x01]).await.unwrap();
        // the proxy drops the connection without replying
        assert!(conn.receive().await.is_err());

        assert!(guard.is_blocked(LOCALHOST));
        let err = first_error_at(proxy).await;
        assert_eq!(err.code, 1129);
    }
}
