//! Server Group - the replica set behind one client session
//!
//! Every replica receives every real write; replica 0 is the designated
//! read replica whose replies are authoritative for the client. All
//! replicas are driven from the session task by non-blocking polls: a
//! replica is "outstanding" from the moment a command is sent until its
//! complete reply has been assembled by `is_ready` or `wait_for`.
//!
//! Failure model:
//! - any error during authentication tears the whole group down
//! - afterwards, a failing non-designated replica is dropped from the group
//!   (calls on it report `ReplicaUnavailable`)
//! - a failing designated replica is fatal (`DesignatedReplicaLost`)

use crate::metrics;
use crate::mysql_wire::auth::{self, BackendCredentials, ClientSession};
use crate::mysql_wire::protocol::constants::{COM_QUERY, ER_HANDSHAKE_ERROR};
use crate::mysql_wire::protocol::messages::build_err;
use crate::mysql_wire::{Frame, FramedConnection, Response, ResponseAssembler, ResponseKind, Transport};
use bytes::{BufMut, BytesMut};
use sqp_common::{Result, SqpError};
use tracing::{debug, warn};

/// Replica whose replies are returned to the client by default
pub const DESIGNATED_REPLICA: usize = 0;

struct Replica<T> {
    conn: FramedConnection<T>,
    outstanding: bool,
    assembler: Option<ResponseAssembler>,
    last_result: Option<Response>,
    failed: bool,
}

impl<T: Transport> Replica<T> {
    fn new(transport: T) -> Self {
        Self {
            conn: FramedConnection::new(transport),
            outstanding: false,
            assembler: None,
            last_result: None,
            failed: false,
        }
    }
}

/// Ordered set of replica connections for one session
pub struct ServerGroup<T> {
    replicas: Vec<Replica<T>>,
    session: Option<ClientSession>,
}

impl<T: Transport> ServerGroup<T> {
    /// Wrap already-connected transports; index order is replica order
    pub fn new(transports: Vec<T>) -> Self {
        Self {
            replicas: transports.into_iter().map(Replica::new).collect(),
            session: None,
        }
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    pub fn session(&self) -> Option<&ClientSession> {
        self.session.as_ref()
    }

    /// Replica still participates in the group
    pub fn is_live(&self, replica: usize) -> bool {
        self.replicas.get(replica).is_some_and(|r| !r.failed)
    }

    pub fn live_count(&self) -> usize {
        self.replicas.iter().filter(|r| !r.failed).count()
    }

    /// Log into every replica with the client's derived session.
    ///
    /// The designated replica's final reply is forwarded to the client. If
    /// any replica fails, the client gets an error, the whole group is
    /// closed and `AuthenticationFailed` is returned.
    pub async fn authenticate<C: Transport>(
        &mut self,
        client: &mut FramedConnection<C>,
        session: &ClientSession,
        credentials: &BackendCredentials,
    ) -> Result<()> {
        if self.replicas.is_empty() {
            return Err(SqpError::NoReplicaAvailable);
        }

        let mut designated_reply = None;
        for index in 0..self.replicas.len() {
            let conn = &mut self.replicas[index].conn;
            match auth::authenticate_backend(conn, session, credentials).await {
                Ok(reply) => {
                    if index == DESIGNATED_REPLICA {
                        designated_reply = Some(reply);
                    }
                }
                Err(e) => {
                    warn!(replica = index, error = %e, "Replica handshake failed, closing group");
                    let message = format!("Backend replica {} rejected the session: {}", index, e);
                    if let Err(send_err) = client
                        .send(&build_err(ER_HANDSHAKE_ERROR, "08S01", &message))
                        .await
                    {
                        debug!("Could not report handshake failure to client: {}", send_err);
                    }
                    self.close().await;
                    return Err(SqpError::AuthenticationFailed(format!(
                        "replica {}: {}",
                        index, e
                    )));
                }
            }
        }

        let reply = designated_reply
            .ok_or_else(|| SqpError::internal("designated replica produced no handshake reply"))?;
        client.send(&reply).await?;
        self.session = Some(session.clone());
        Ok(())
    }

    /// Send `text` as a COM_QUERY on one replica and mark it outstanding.
    ///
    /// A replica still busy with an earlier command is waited for first, so
    /// commands reach each replica in issue order.
    pub async fn send_query(&mut self, replica: usize, text: &str) -> Result<()> {
        let mut payload = BytesMut::with_capacity(1 + text.len());
        payload.put_u8(COM_QUERY);
        payload.put_slice(text.as_bytes());
        self.send_command(replica, &payload).await
    }

    /// Send an arbitrary command payload on one replica
    pub async fn send_command(&mut self, replica: usize, payload: &[u8]) -> Result<()> {
        self.check_live(replica)?;
        if self.replicas[replica].outstanding {
            self.wait_for(replica).await?;
            self.check_live(replica)?;
        }
        let kind = ResponseKind::for_command(payload.first().copied().unwrap_or(COM_QUERY));

        let r = &mut self.replicas[replica];
        r.conn.reset_sequence();
        r.last_result = None;
        if let Err(e) = r.conn.send(payload).await {
            return Err(self.fail_replica(replica, e));
        }
        let r = &mut self.replicas[replica];
        if kind == ResponseKind::NoReply {
            r.outstanding = false;
            r.assembler = None;
        } else {
            r.outstanding = true;
            r.assembler = Some(ResponseAssembler::new(kind));
        }
        Ok(())
    }

    /// Issue the same statement on every live replica except `excluding`.
    ///
    /// Losing a non-designated replica here is tolerated.
    pub async fn forward_to_all(&mut self, text: &str, excluding: Option<usize>) -> Result<()> {
        for replica in 0..self.replicas.len() {
            if Some(replica) == excluding || !self.is_live(replica) {
                continue;
            }
            match self.send_query(replica, text).await {
                Ok(()) => {}
                Err(SqpError::ReplicaUnavailable(index)) => {
                    debug!(replica = index, "Skipping failed replica while forwarding");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Non-blocking completion check.
    ///
    /// True when nothing is outstanding on the replica; otherwise drains any
    /// frames that already arrived and reports whether the reply completed.
    /// A non-designated replica that fails here is dropped and reported ready
    /// (with no result).
    pub fn is_ready(&mut self, replica: usize) -> Result<bool> {
        let Some(r) = self.replicas.get_mut(replica) else {
            return Err(SqpError::internal(format!("no replica {}", replica)));
        };
        if !r.outstanding {
            return Ok(true);
        }
        loop {
            match self.replicas[replica].conn.try_receive() {
                Ok(Some(frame)) => {
                    if self.absorb(replica, frame)? {
                        return Ok(true);
                    }
                }
                Ok(None) => return Ok(false),
                Err(e) => return self.absorb_failure(replica, e),
            }
        }
    }

    /// Block until the replica has no outstanding command
    pub async fn wait_for(&mut self, replica: usize) -> Result<()> {
        loop {
            if self.is_ready(replica)? {
                return Ok(());
            }
            match self.replicas[replica].conn.receive().await {
                Ok(frame) => {
                    if self.absorb(replica, frame)? {
                        return Ok(());
                    }
                }
                Err(e) => {
                    self.absorb_failure(replica, e)?;
                    return Ok(());
                }
            }
        }
    }

    /// First live replica without an outstanding command.
    ///
    /// If all are busy, spins over them (ascending index, restarting each
    /// round, yielding to the runtime between rounds) until one completes.
    pub async fn get_available_replica(&mut self) -> Result<usize> {
        self.get_available_replica_where(|_| true).await
    }

    /// `get_available_replica` restricted to replicas accepted by `accept`.
    ///
    /// Fails with `NoReplicaAvailable` when no live replica is acceptable.
    pub async fn get_available_replica_where<F>(&mut self, accept: F) -> Result<usize>
    where
        F: Fn(usize) -> bool,
    {
        loop {
            let candidates: Vec<usize> = (0..self.replicas.len())
                .filter(|&i| !self.replicas[i].failed && accept(i))
                .collect();
            if candidates.is_empty() {
                return Err(SqpError::NoReplicaAvailable);
            }
            if let Some(&idle) = candidates.iter().find(|&&i| !self.replicas[i].outstanding) {
                return Ok(idle);
            }
            for &replica in &candidates {
                if self.is_ready(replica)? && self.is_live(replica) {
                    return Ok(replica);
                }
            }
            tokio::task::yield_now().await;
        }
    }

    /// Last completed reply; `None` while outstanding or after a failure
    pub fn get_result(&self, replica: usize) -> Option<&Response> {
        let r = self.replicas.get(replica)?;
        if r.outstanding || r.failed {
            return None;
        }
        r.last_result.as_ref()
    }

    /// Broadcast a non-query command frame to every live replica
    pub async fn write(&mut self, payload: &[u8]) -> Result<()> {
        for replica in 0..self.replicas.len() {
            if self.is_live(replica) {
                self.send_command(replica, payload).await?;
            }
        }
        Ok(())
    }

    /// Collect the broadcast reply; the designated replica's is returned
    pub async fn read(&mut self) -> Result<Response> {
        for replica in 0..self.replicas.len() {
            if !self.is_live(replica) {
                continue;
            }
            self.wait_for(replica).await?;
            if !self.is_live(replica) {
                return Err(SqpError::ReplicaUnavailable(replica));
            }
        }
        self.get_result(DESIGNATED_REPLICA)
            .cloned()
            .ok_or_else(|| SqpError::DesignatedReplicaLost("no reply to broadcast command".into()))
    }

    /// Close every replica connection
    pub async fn close(&mut self) {
        for (index, replica) in self.replicas.iter_mut().enumerate() {
            if let Err(e) = replica.conn.close().await {
                debug!(replica = index, "Error closing replica connection: {}", e);
            }
            replica.outstanding = false;
            replica.assembler = None;
        }
    }

    fn check_live(&self, replica: usize) -> Result<()> {
        match self.replicas.get(replica) {
            None => Err(SqpError::internal(format!("no replica {}", replica))),
            Some(r) if r.failed && replica == DESIGNATED_REPLICA => Err(
                SqpError::DesignatedReplicaLost("designated replica already failed".into()),
            ),
            Some(r) if r.failed => Err(SqpError::ReplicaUnavailable(replica)),
            Some(_) => Ok(()),
        }
    }

    /// Feed one frame into the replica's reply; true once complete
    fn absorb(&mut self, replica: usize, frame: Frame) -> Result<bool> {
        let r = &mut self.replicas[replica];
        let Some(assembler) = r.assembler.as_mut() else {
            let err = SqpError::protocol("unsolicited frame from replica");
            return self.absorb_failure(replica, err).map(|_| false);
        };
        match assembler.push(frame.payload) {
            Ok(false) => Ok(false),
            Ok(true) => {
                if let Some(assembler) = r.assembler.take() {
                    r.last_result = Some(assembler.finish());
                }
                r.outstanding = false;
                Ok(true)
            }
            Err(e) => self.absorb_failure(replica, e),
        }
    }

    /// Turn a replica error into the group's failure policy
    fn absorb_failure(&mut self, replica: usize, err: SqpError) -> Result<bool> {
        match self.fail_replica(replica, err) {
            SqpError::ReplicaUnavailable(_) => Ok(true),
            fatal => Err(fatal),
        }
    }

    fn fail_replica(&mut self, replica: usize, err: SqpError) -> SqpError {
        let r = &mut self.replicas[replica];
        r.failed = true;
        r.outstanding = false;
        r.assembler = None;
        r.last_result = None;
        metrics::record_replica_failure(replica);
        if replica == DESIGNATED_REPLICA {
            warn!(replica, error = %err, "Designated replica failed");
            SqpError::DesignatedReplicaLost(err.to_string())
        } else {
            warn!(replica, error = %err, "Replica dropped from group");
            SqpError::ReplicaUnavailable(replica)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mysql_wire::protocol::constants::{
        CLIENT_PLUGIN_AUTH, CLIENT_PROTOCOL_41, CLIENT_SECURE_CONNECTION, COM_PING,
        DEFAULT_CHARSET, SERVER_STATUS_AUTOCOMMIT,
    };
    use crate::mysql_wire::protocol::messages::{build_greeting, build_ok, parse_err_packet};
    use crate::mysql_wire::testing::{echo_selects, spawn_backend, QueryLog};
    use bytes::Bytes;
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;

    fn group_of(n: usize) -> (ServerGroup<DuplexStream>, Vec<QueryLog>) {
        let (transports, logs): (Vec<_>, Vec<_>) = (0..n).map(|_| spawn_backend(echo_selects)).unzip();
        (ServerGroup::new(transports), logs)
    }

    fn single_value(response: &Response) -> Option<String> {
        let resultset = response.text_result_set().unwrap()?;
        resultset.rows.first()?.first()?.clone()
    }

    #[tokio::test]
    async fn test_idle_replica_is_ready() {
        let (mut group, _logs) = group_of(2);
        assert!(group.is_ready(0).unwrap());
        assert!(group.is_ready(1).unwrap());
        assert!(group.get_result(0).is_none());
    }

    #[tokio::test]
    async fn test_send_query_and_wait() {
        let (mut group, logs) = group_of(1);
        group.send_query(0, "SELECT 42").await.unwrap();
        assert!(group.get_result(0).is_none());

        group.wait_for(0).await.unwrap();
        assert!(group.is_ready(0).unwrap());
        let response = group.get_result(0).unwrap();
        assert_eq!(single_value(response).as_deref(), Some("SELECT 42"));
        assert_eq!(*logs[0].lock(), vec!["SELECT 42".to_string()]);
    }

    #[tokio::test]
    async fn test_is_ready_eventually_true_without_blocking() {
        let (mut group, _logs) = group_of(1);
        group.send_query(0, "SELECT 1").await.unwrap();
        let mut polls = 0;
        while !group.is_ready(0).unwrap() {
            polls += 1;
            tokio::task::yield_now().await;
            assert!(polls < 10_000, "reply never arrived");
        }
        assert!(group.get_result(0).is_some());
    }

    #[tokio::test]
    async fn test_get_available_prefers_lowest_idle() {
        let (mut group, _logs) = group_of(3);
        group.send_query(0, "SELECT 1").await.unwrap();
        assert_eq!(group.get_available_replica().await.unwrap(), 1);
        assert_eq!(
            group.get_available_replica_where(|i| i != 1).await.unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_get_available_spins_until_completion() {
        let (mut group, _logs) = group_of(2);
        group.send_query(0, "SELECT 1").await.unwrap();
        group.send_query(1, "SELECT 2").await.unwrap();
        let replica = group.get_available_replica().await.unwrap();
        assert!(replica < 2);
        assert!(group.get_result(replica).is_some());
    }

    #[tokio::test]
    async fn test_no_acceptable_replica() {
        let (mut group, _logs) = group_of(2);
        let err = group.get_available_replica_where(|_| false).await.unwrap_err();
        assert!(matches!(err, SqpError::NoReplicaAvailable));
    }

    #[tokio::test]
    async fn test_forward_to_all_with_exclusion() {
        let (mut group, logs) = group_of(3);
        group
            .forward_to_all("UPDATE t SET a=1 WHERE id=1", Some(1))
            .await
            .unwrap();
        for replica in 0..3 {
            group.wait_for(replica).await.unwrap();
        }
        assert_eq!(logs[0].lock().len(), 1);
        assert!(logs[1].lock().is_empty());
        assert_eq!(logs[2].lock().len(), 1);
    }

    #[tokio::test]
    async fn test_writes_reach_replica_in_order() {
        let (mut group, logs) = group_of(1);
        group.send_query(0, "INSERT INTO t VALUES (1)").await.unwrap();
        // the second write waits for the first reply before being sent
        group.send_query(0, "INSERT INTO t VALUES (2)").await.unwrap();
        group.wait_for(0).await.unwrap();
        assert_eq!(
            *logs[0].lock(),
            vec![
                "INSERT INTO t VALUES (1)".to_string(),
                "INSERT INTO t VALUES (2)".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_broadcast_ping() {
        let (mut group, _logs) = group_of(2);
        group.write(&[COM_PING]).await.unwrap();
        let response = group.read().await.unwrap();
        assert!(response.is_ok());
    }

    #[tokio::test]
    async fn test_non_designated_failure_is_tolerated() {
        let (healthy, _log) = spawn_backend(echo_selects);
        let (dead, peer) = tokio::io::duplex(1024);
        drop(peer);
        let mut group = ServerGroup::new(vec![healthy, dead]);

        group.forward_to_all("DELETE FROM t WHERE id=1", None).await.unwrap();
        group.wait_for(1).await.unwrap();
        assert!(!group.is_live(1));
        assert!(group.get_result(1).is_none());
        assert!(matches!(
            group.send_query(1, "SELECT 1").await,
            Err(SqpError::ReplicaUnavailable(1))
        ));

        group.wait_for(0).await.unwrap();
        assert!(group.get_result(0).unwrap().is_ok());
        assert_eq!(group.live_count(), 1);
    }

    #[tokio::test]
    async fn test_designated_failure_is_fatal() {
        let (dead, peer) = tokio::io::duplex(1024);
        drop(peer);
        let mut group = ServerGroup::new(vec![dead]);
        let result = match group.send_query(0, "SELECT 1").await {
            Ok(()) => group.wait_for(0).await,
            Err(e) => Err(e),
        };
        assert!(matches!(result, Err(SqpError::DesignatedReplicaLost(_))));
    }

    fn app_session() -> ClientSession {
        ClientSession {
            capabilities: CLIENT_PROTOCOL_41 | CLIENT_SECURE_CONNECTION | CLIENT_PLUGIN_AUTH,
            max_packet_size: 1 << 24,
            charset: DEFAULT_CHARSET,
            user: "app".into(),
            database: None,
        }
    }

    /// Greets, answers the login with `reply`, then reports whether the
    /// proxy closed the connection
    fn login_backend(reply: Bytes) -> (DuplexStream, JoinHandle<bool>) {
        let (proxy_side, backend_side) = tokio::io::duplex(4096);
        let handle = tokio::spawn(async move {
            let mut conn = FramedConnection::new(backend_side);
            conn.send(&build_greeting(7, b"abcdefghijklmnopqrst")).await.unwrap();
            conn.receive().await.unwrap();
            conn.send(&reply).await.unwrap();
            conn.receive().await.is_err()
        });
        (proxy_side, handle)
    }

    #[tokio::test]
    async fn test_authenticate_forwards_designated_reply() {
        let designated = build_ok(0, 0, SERVER_STATUS_AUTOCOMMIT, 3);
        let (first, first_done) = login_backend(designated.clone());
        let (second, _second_done) = login_backend(build_ok(0, 0, SERVER_STATUS_AUTOCOMMIT, 0));
        let mut group = ServerGroup::new(vec![first, second]);
        let (client_side, proxy_side) = tokio::io::duplex(4096);
        let mut client = FramedConnection::new(client_side);
        let mut proxy_client = FramedConnection::new(proxy_side);

        group
            .authenticate(&mut proxy_client, &app_session(), &BackendCredentials::default())
            .await
            .unwrap();
        assert_eq!(group.session(), Some(&app_session()));
        assert_eq!(client.receive().await.unwrap().payload, designated);

        group.close().await;
        assert!(first_done.await.unwrap());
    }

    #[tokio::test]
    async fn test_authenticate_is_all_or_nothing() {
        let (first, first_done) = login_backend(build_ok(0, 0, SERVER_STATUS_AUTOCOMMIT, 0));
        let (second, second_done) =
            login_backend(build_err(1045, "28000", "Access denied for user 'app'"));
        let mut group = ServerGroup::new(vec![first, second]);
        let (client_side, proxy_side) = tokio::io::duplex(4096);
        let mut client = FramedConnection::new(client_side);
        let mut proxy_client = FramedConnection::new(proxy_side);

        let err = group
            .authenticate(&mut proxy_client, &app_session(), &BackendCredentials::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SqpError::AuthenticationFailed(msg) if msg.starts_with("replica 1")));
        assert!(group.session().is_none());

        let reply = client.receive().await.unwrap();
        let reported = parse_err_packet(&reply.payload).unwrap();
        assert_eq!(reported.code, ER_HANDSHAKE_ERROR);
        assert!(reported.message.contains("Access denied"));

        // both replicas are hung up on, including the one that accepted
        assert!(first_done.await.unwrap());
        assert!(second_done.await.unwrap());
    }
}
