//! Proxy session: the per-client query loop
//!
//! Each real query goes through dispatch, hit/miss resolution and response:
//!
//! - reads hit when a speculative copy was pre-issued on some replica; the
//!   finished (or still running) copy answers the client
//! - writes hit when the speculative copy of the same write ran on a
//!   non-designated replica; it is confirmed there and the real write is
//!   forwarded to the others
//! - any other write first rolls back unconfirmed speculative writes, then
//!   goes to every replica; the designated replica answers
//!
//! After every real query the speculator proposes the next statements,
//! which are dispatched on idle replicas. A speculative write runs only
//! behind a savepoint taken since the replica's last confirmed write, and
//! leaves a rollback obligation in the ledger.

use super::ledger::{SavepointLedger, UndoRecord};
use super::prefetch::PrefetchTable;
use super::stats::{elapsed_micros, Category, SessionStats};
use crate::metrics;
use crate::mysql_wire::protocol::constants::{COM_QUERY, COM_QUIT};
use crate::mysql_wire::{FramedConnection, Response, ResponseKind, Transport};
use crate::query::{split_index_tag, StatementKind};
use crate::server_group::{ServerGroup, DESIGNATED_REPLICA};
use crate::speculator::{Speculation, Speculator, SpeculatorFactory};
use crate::undo::{is_upsert, PrimaryKeyCatalog, UndoGenerator, UndoTrace};
use sqp_common::config::StatsSettings;
use sqp_common::{ProxyConfig, Result, SqpError};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Inputs shared by every session of one proxy
pub struct SessionContext {
    pub speculators: SpeculatorFactory,
    pub undo: UndoGenerator,
    pub undo_trace: Option<Arc<UndoTrace>>,
    /// Candidates requested from the speculator per real query
    pub width: usize,
    pub speculate_writes: bool,
    pub savepoint_name: String,
    pub stats: StatsSettings,
}

impl SessionContext {
    pub fn from_config(config: &ProxyConfig) -> Result<Self> {
        let speculators = SpeculatorFactory::from_settings(&config.speculation)?;
        let catalog = PrimaryKeyCatalog::new(config.undo.primary_keys.clone());
        let undo_trace = config
            .undo
            .undo_trace_path
            .as_deref()
            .map(UndoTrace::load)
            .transpose()?
            .map(Arc::new);
        Ok(Self {
            speculators,
            undo: UndoGenerator::new(Arc::new(catalog)),
            undo_trace,
            width: config.speculation.width,
            speculate_writes: config.speculation.speculate_writes,
            savepoint_name: config.undo.savepoint_name.clone(),
            stats: config.stats.clone(),
        })
    }
}

pub struct Session<C, T> {
    client: FramedConnection<C>,
    group: ServerGroup<T>,
    speculator: Speculator,
    prefetch: PrefetchTable,
    ledger: SavepointLedger,
    stats: SessionStats,
    context: Arc<SessionContext>,
    in_transaction: bool,
}

impl<C: Transport, T: Transport> Session<C, T> {
    /// `group` must already be authenticated against the client
    pub fn new(
        client: FramedConnection<C>,
        group: ServerGroup<T>,
        context: Arc<SessionContext>,
    ) -> Self {
        let replicas = group.len();
        Self {
            client,
            speculator: context.speculators.for_session(),
            prefetch: PrefetchTable::new(),
            ledger: SavepointLedger::new(replicas),
            stats: SessionStats::new(context.stats.report_interval),
            group,
            context,
            in_transaction: false,
        }
    }

    /// Serve the client until it quits or the session fails, then tear down
    pub async fn run(mut self) -> Result<()> {
        metrics::session_started();
        debug!(
            session = %self.stats.id(),
            user = self.group.session().map_or("", |s| s.user.as_str()),
            replicas = self.group.len(),
            speculator = self.speculator.name(),
            "Session started"
        );

        let result = self.serve().await;

        self.group.close().await;
        if let Err(e) = self.client.close().await {
            debug!("Error closing client connection: {}", e);
        }
        if self.context.stats.enabled {
            if let Err(e) = self.stats.write_files(&self.context.stats.output_dir) {
                warn!(session = %self.stats.id(), "Failed to write session statistics: {}", e);
            }
        }
        metrics::session_ended();
        info!(
            session = %self.stats.id(),
            hits = self.stats.hits(),
            misses = self.stats.misses(),
            waits = self.stats.waits(),
            "Session ended"
        );
        result
    }

    async fn serve(&mut self) -> Result<()> {
        loop {
            let frame = match self.client.receive().await {
                Ok(frame) => frame,
                Err(e) if e.is_disconnect() => return Ok(()),
                Err(e) => return Err(e),
            };
            self.stats.query_received();
            let start = Instant::now();

            match frame.command() {
                Some(COM_QUERY) => {
                    let text = String::from_utf8_lossy(&frame.payload[1..]).into_owned();
                    let response = self.handle_query(&text).await?;
                    self.respond(&response).await?;
                }
                Some(COM_QUIT) => {
                    self.rollback_pending(None).await?;
                    self.group.write(&frame.payload).await?;
                    return Ok(());
                }
                Some(_) => {
                    if let Some(response) = self.pass_through(&frame.payload).await? {
                        self.respond(&response).await?;
                    }
                }
                None => return Err(SqpError::protocol("empty command frame")),
            }
            self.stats.record_since(Category::QueryProcess, start);
        }
    }

    async fn respond(&mut self, response: &Response) -> Result<()> {
        self.client.send_all(response.frames().iter()).await?;
        self.stats.response_sent();
        Ok(())
    }

    /// Non-query commands are broadcast unchanged; the designated
    /// replica's reply is returned
    async fn pass_through(&mut self, payload: &[u8]) -> Result<Option<Response>> {
        self.rollback_pending(None).await?;
        self.prefetch.clear();
        self.group.write(payload).await?;
        let kind = ResponseKind::for_command(payload[0]);
        if kind == ResponseKind::NoReply {
            return Ok(None);
        }
        self.group.read().await.map(Some)
    }

    async fn handle_query(&mut self, text: &str) -> Result<Response> {
        let (tag, query) = split_index_tag(text);
        if let Some(index) = tag {
            self.speculator.set_query_index(index);
        }
        let query = query.to_string();
        self.speculator.check_begin(&query);

        let kind = StatementKind::classify(&query);
        let start = Instant::now();
        let response = if kind.is_read() {
            let response = self.handle_read(&query).await?;
            self.stats.record_since(Category::Read, start);
            response
        } else {
            let boundary = kind.is_boundary();
            if boundary {
                self.in_transaction = kind == StatementKind::Begin;
            }
            let response = self.handle_write(&query, boundary).await?;
            self.stats.record_since(Category::Write, start);
            response
        };
        Ok(response)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // READS
    // ═══════════════════════════════════════════════════════════════════════

    async fn handle_read(&mut self, query: &str) -> Result<Response> {
        self.stats.count_read();
        let start = Instant::now();
        if let Some(replica) = self.prefetch.get(query) {
            if let Some(response) = self.read_hit(query, replica).await? {
                self.stats.record_since(Category::Hit, start);
                return Ok(response);
            }
            // entry points at a replica that dropped out
            self.prefetch.remove_replica(replica);
        }
        let response = self.read_miss(query).await?;
        self.stats.record_since(Category::Miss, start);
        Ok(response)
    }

    /// `None` when the prefetched copy is unusable before anything else was
    /// done for this query
    async fn read_hit(&mut self, query: &str, replica: usize) -> Result<Option<Response>> {
        if !self.group.is_live(replica) {
            return Ok(None);
        }
        if self.group.is_ready(replica)? {
            let Some(response) = self.group.get_result(replica).cloned() else {
                return Ok(None);
            };
            debug!(replica, "Read hit, result ready");
            metrics::record_prediction("hit_ready");
            self.stats.count_hit(true);
            self.speculate(query, None).await?;
            return Ok(Some(response));
        }

        debug!(replica, "Read hit, result pending");
        metrics::record_prediction("hit_pending");
        self.stats.count_hit(false);
        self.speculate(query, Some(replica)).await?;

        let wait_start = Instant::now();
        self.group.wait_for(replica).await?;
        let index = self.speculator.query_index();
        self.stats.count_wait(index, elapsed_micros(wait_start));
        match self.group.get_result(replica).cloned() {
            Some(response) => Ok(Some(response)),
            None => self.execute_designated(query).await.map(Some),
        }
    }

    async fn read_miss(&mut self, query: &str) -> Result<Response> {
        self.count_miss();
        let ledger = &self.ledger;
        let replica = self
            .group
            .get_available_replica_where(|i| !ledger.need_rollback(i))
            .await?;
        self.prefetch.remove_replica(replica);
        match self.group.send_query(replica, query).await {
            Ok(()) => {}
            Err(SqpError::ReplicaUnavailable(_)) => {
                self.speculate(query, Some(DESIGNATED_REPLICA)).await?;
                return self.execute_designated(query).await;
            }
            Err(e) => return Err(e),
        }
        self.speculate(query, Some(replica)).await?;
        self.group.wait_for(replica).await?;
        match self.group.get_result(replica).cloned() {
            Some(response) => Ok(response),
            None => self.execute_designated(query).await,
        }
    }

    /// Run `query` on the designated replica and wait for it
    async fn execute_designated(&mut self, query: &str) -> Result<Response> {
        self.prefetch.remove_replica(DESIGNATED_REPLICA);
        self.group.send_query(DESIGNATED_REPLICA, query).await?;
        self.group.wait_for(DESIGNATED_REPLICA).await?;
        self.group
            .get_result(DESIGNATED_REPLICA)
            .cloned()
            .ok_or_else(|| SqpError::DesignatedReplicaLost("no reply to query".into()))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // WRITES
    // ═══════════════════════════════════════════════════════════════════════

    async fn handle_write(&mut self, query: &str, boundary: bool) -> Result<Response> {
        let start = Instant::now();
        let hit = self
            .prefetch
            .get(query)
            .filter(|&r| self.ledger.pending(r).is_some_and(|p| p.statement == query));
        if let Some(replica) = hit {
            if let Some(response) = self.write_hit(query, replica).await? {
                self.stats.record_since(Category::Hit, start);
                return Ok(response);
            }
        }
        let response = self.write_miss(query, boundary).await?;
        self.stats.record_since(Category::Miss, start);
        Ok(response)
    }

    /// Confirm the speculative copy on `replica` and apply the write
    /// everywhere else
    async fn write_hit(&mut self, query: &str, replica: usize) -> Result<Option<Response>> {
        let wait_start = Instant::now();
        self.group.wait_for(replica).await?;
        self.ledger.resolve(replica);
        self.prefetch.remove_replica(replica);
        let Some(response) = self.group.get_result(replica).cloned() else {
            return Ok(None);
        };
        debug!(replica, "Write hit");
        metrics::record_prediction("hit_pending");
        self.stats.count_hit(false);
        let index = self.speculator.query_index();
        self.stats.count_wait(index, elapsed_micros(wait_start));

        self.rollback_pending(None).await?;
        self.ledger.invalidate_savepoints();
        self.group.forward_to_all(query, Some(replica)).await?;
        self.speculate(query, None).await?;
        Ok(Some(response))
    }

    async fn write_miss(&mut self, query: &str, boundary: bool) -> Result<Response> {
        self.count_miss();
        self.rollback_pending(None).await?;
        // must happen before speculating past the boundary, whose writes
        // belong to the next transaction's ledger
        if boundary {
            self.ledger.reset();
        } else {
            self.ledger.invalidate_savepoints();
        }
        self.prefetch.clear();
        self.group.forward_to_all(query, None).await?;
        self.speculate(query, Some(DESIGNATED_REPLICA)).await?;
        self.group.wait_for(DESIGNATED_REPLICA).await?;
        self.group
            .get_result(DESIGNATED_REPLICA)
            .cloned()
            .ok_or_else(|| SqpError::DesignatedReplicaLost("no reply to write".into()))
    }

    fn count_miss(&mut self) {
        if self.speculator.is_started() {
            metrics::record_prediction("miss");
            self.stats.count_miss();
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // ROLLBACK
    // ═══════════════════════════════════════════════════════════════════════

    /// Undo every unconfirmed speculative write, except on `except`
    async fn rollback_pending(&mut self, except: Option<usize>) -> Result<()> {
        for replica in self.ledger.pending_replicas() {
            if Some(replica) == except {
                continue;
            }
            let Some(record) = self.ledger.resolve(replica) else {
                continue;
            };
            self.prefetch.remove_replica(replica);
            if !self.group.is_live(replica) {
                continue;
            }
            match self.roll_back(replica, &record).await {
                Ok(()) => {}
                Err(SqpError::ReplicaUnavailable(index)) => {
                    debug!(replica = index, "Replica lost during rollback");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn roll_back(&mut self, replica: usize, record: &UndoRecord) -> Result<()> {
        self.group.wait_for(replica).await?;
        let outcome = self
            .group
            .get_result(replica)
            .map(|response| (response.is_err(), response.affected_rows()));
        let affected = match outcome {
            None => return Ok(()),
            Some((true, _)) => {
                debug!(replica, statement = %record.statement, "Speculative write failed, nothing to undo");
                metrics::record_rollback("failed_write");
                return Ok(());
            }
            Some((false, affected)) => affected,
        };

        // an upsert that inserted a fresh row cannot be reversed by its
        // adjustment update
        let undo_applies = !record.undo.is_empty() && !(record.upsert && affected == Some(1));
        if undo_applies {
            self.group.send_query(replica, &record.undo).await?;
            self.group.wait_for(replica).await?;
            if self.group.get_result(replica).is_some_and(|r| !r.is_err()) {
                debug!(replica, undo = %record.undo, "Rolled back speculative write");
                metrics::record_rollback("undo");
                return Ok(());
            }
            warn!(replica, undo = %record.undo, "Undo statement failed, rolling back to savepoint");
        }
        self.rollback_to_savepoint(replica).await
    }

    async fn rollback_to_savepoint(&mut self, replica: usize) -> Result<()> {
        let name = self.context.savepoint_name.clone();
        self.group
            .send_query(replica, &format!("ROLLBACK TO SAVEPOINT {}", name))
            .await?;
        self.group.wait_for(replica).await?;
        if let Some(err) = self.group.get_result(replica).and_then(Response::error) {
            warn!(replica, code = err.code, "Rollback to savepoint failed: {}", err.message);
        }
        self.take_savepoint(replica).await?;
        debug!(replica, "Rolled back speculative write to savepoint");
        metrics::record_rollback("savepoint");
        Ok(())
    }

    /// Establish (or move) the speculation savepoint to the replica's
    /// current state; false if refused
    async fn take_savepoint(&mut self, replica: usize) -> Result<bool> {
        let statement = format!("SAVEPOINT {}", self.context.savepoint_name);
        self.group.send_query(replica, &statement).await?;
        self.group.wait_for(replica).await?;
        let accepted = self.group.get_result(replica).is_some_and(Response::is_ok);
        if accepted {
            self.ledger.set_savepoint(replica);
        }
        Ok(accepted)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // SPECULATION
    // ═══════════════════════════════════════════════════════════════════════

    /// Consume `query` in the speculator and pre-issue its predictions on
    /// idle replicas other than `reserved`
    async fn speculate(&mut self, query: &str, reserved: Option<usize>) -> Result<()> {
        self.prefetch.clear();
        if self.group.live_count() <= usize::from(reserved.is_some()) {
            // no replica could take a prediction
            self.speculator.skip_query();
            return Ok(());
        }
        let start = Instant::now();
        let predictions = self.speculator.speculate(query, self.context.width);
        if predictions.is_empty() {
            return Ok(());
        }

        let mut in_use: Vec<usize> = reserved.into_iter().collect();
        for prediction in predictions {
            let kind = StatementKind::classify(&prediction.query);
            if kind.is_boundary() {
                continue;
            }
            let is_write = kind.is_write();
            if is_write
                && !(self.context.speculate_writes
                    && self.in_transaction
                    && kind == StatementKind::Dml)
            {
                continue;
            }

            let ledger = &self.ledger;
            let replica = match self
                .group
                .get_available_replica_where(|i| {
                    !in_use.contains(&i)
                        && !ledger.need_rollback(i)
                        && (!is_write || i != DESIGNATED_REPLICA)
                })
                .await
            {
                Ok(replica) => replica,
                Err(SqpError::NoReplicaAvailable) => break,
                Err(e) => return Err(e),
            };

            let dispatched = if is_write {
                self.dispatch_write(replica, &prediction).await
            } else {
                self.group
                    .send_query(replica, &prediction.query)
                    .await
                    .map(|()| true)
            };
            match dispatched {
                Ok(true) => {
                    in_use.push(replica);
                    self.prefetch.insert(&prediction.query, replica);
                    metrics::record_speculation(if is_write { "write" } else { "read" });
                    debug!(replica, query = %prediction.query, "Speculative dispatch");
                }
                Ok(false) => {}
                Err(SqpError::ReplicaUnavailable(index)) => {
                    debug!(replica = index, "Replica lost during speculation");
                }
                Err(e) => return Err(e),
            }
        }
        self.stats.record_since(Category::Speculation, start);
        Ok(())
    }

    /// Undo preparation, savepoint unless a valid one exists, then the
    /// speculative write itself
    async fn dispatch_write(&mut self, replica: usize, prediction: &Speculation) -> Result<bool> {
        let precomputed = prediction
            .trace_index
            .and_then(|index| self.context.undo_trace.as_ref()?.get(index))
            .map(str::to_string);
        let undo = match precomputed {
            Some(undo) => undo,
            None => {
                self.context
                    .undo
                    .undo_for(&mut self.group, &prediction.query, replica)
                    .await?
            }
        };
        if !self.ledger.have_savepoint(replica) && !self.take_savepoint(replica).await? {
            debug!(replica, "Savepoint refused, not speculating write");
            return Ok(false);
        }
        self.group.send_query(replica, &prediction.query).await?;
        self.ledger.mark_pending(
            replica,
            UndoRecord {
                statement: prediction.query.clone(),
                undo,
                upsert: is_upsert(&prediction.query),
            },
        );
        Ok(true)
    }
}
