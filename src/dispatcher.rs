//! The per-entry scheduler: match pending transactions to connections,
//! create new ones, or build pipelines (spec §4.3 "Dispatcher").
//!
//! This module also hosts the dispatcher's event loop (spec §4.2
//! "EventQueue") and the [`crate::ticker`] timers it drives, since all three
//! only ever run on the single task that owns every [`ConnectionEntry`]
//! (spec §5: "the control thread never mutates entry containers").

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace, warn};

use crate::connection::{Connection, ConnectionHandle};
use crate::entry::ConnectionEntry;
use crate::events::Msg;
use crate::half_open::{Connector, HalfOpenOutcome, HalfOpenSocket, RaceContext};
use crate::info::ConnectionInfo;
use crate::manager::{Diagnostics, Param, SharedCounters};
use crate::pipeline::{FeedbackInfo, PipeliningState};
use crate::spdy::{ClaimResult, SpdyCoalescer};
use crate::ticker::{Ticker, DEFAULT_PRUNE_INTERVAL};
use crate::transaction::{Caps, Classification, Priority, StopReason, Transaction, TransactionId};

/// How long an idle connection may sit before a prune sweep reaps it.
const IDLE_CONNECTION_LIFETIME: Duration = Duration::from_secs(115);

#[derive(Debug, Clone)]
pub(crate) struct Config {
    pub max_conns: u16,
    pub max_conns_per_host: u16,
    pub max_conns_per_proxy: u16,
    pub max_persist_per_host: u16,
    pub max_persist_per_proxy: u16,
    pub max_request_delay: Duration,
    pub max_pipelined: u16,
    pub max_optimistic_pipelined: u16,
    pub backup_syn_delay: Duration,
    pub aggressive_pipelining: bool,
    pub pipelining_enabled: bool,
}

impl Config {
    fn per_host_cap(&self, info: &ConnectionInfo) -> u16 {
        if info.proxies.is_empty() {
            self.max_conns_per_host
        } else {
            self.max_conns_per_proxy
        }
    }

    fn per_host_persist_cap(&self, info: &ConnectionInfo) -> u16 {
        if info.proxies.is_empty() {
            self.max_persist_per_host
        } else {
            self.max_persist_per_proxy
        }
    }
}

/// All state mutated exclusively from the dispatcher task (spec §5).
struct State {
    entries: HashMap<ConnectionInfo, ConnectionEntry>,
    coalescer: SpdyCoalescer,
    shared: Arc<Mutex<SharedCounters>>,
    config: Config,
    connector: Arc<dyn Connector>,
    self_tx: UnboundedSender<Msg>,
    ticker: Ticker,
}

pub(crate) async fn run_dispatcher(
    mut rx: UnboundedReceiver<Msg>,
    self_tx: UnboundedSender<Msg>,
    shared: Arc<Mutex<SharedCounters>>,
    config: Config,
    connector: Arc<dyn Connector>,
) {
    let mut state = State {
        entries: HashMap::new(),
        coalescer: SpdyCoalescer::new(),
        shared,
        config,
        connector,
        self_tx,
        ticker: Ticker::new(),
    };

    loop {
        tokio::select! {
            biased;
            msg = rx.recv() => {
                match msg {
                    Some(Msg::Shutdown) => {
                        state.on_shutdown();
                        break;
                    }
                    Some(msg) => state.handle(msg),
                    None => break,
                }
            }
            _ = crate::ticker::tick(&mut state.ticker.prune), if state.ticker.prune_armed() => {
                state.prune_dead_connections();
            }
            _ = crate::ticker::tick(&mut state.ticker.read_timeout), if state.ticker.read_timeout_armed() => {
                state.on_read_timeout_tick();
            }
        }
    }
}

impl State {
    fn handle(&mut self, msg: Msg) {
        trace!(?msg, "dispatcher event");
        match msg {
            Msg::Shutdown => unreachable!("handled by caller"),
            Msg::NewTransaction(t) => self.process_new_transaction(t),
            Msg::ReschedTransaction(id, prio) => self.reschedule_transaction(id, prio),
            Msg::CancelTransaction(id, reason) => self.cancel_transaction(id, reason),
            Msg::PruneDeadConnections => self.prune_dead_connections(),
            Msg::PruneDeadConnectionsAfter(delay) => self.ticker.arm_prune_after(delay),
            Msg::SpeculativeConnect(info) => self.speculative_connect(info),
            Msg::ReclaimConnection { info, conn_key } => self.reclaim_connection(&info, conn_key),
            Msg::CompleteUpgrade { info, conn_key, listener } => {
                self.complete_upgrade(&info, conn_key, listener)
            }
            Msg::UpdateParam(name, value) => self.update_param(name, value),
            Msg::ClosePersistentConnections => self.close_persistent_connections(),
            Msg::ProcessFeedback { info, kind, conn_key, depth, classification } => {
                self.process_feedback(&info, kind, conn_key, depth, classification)
            }
            Msg::PrintDiagnostics(reply) => {
                let _ = reply.send(self.diagnostics());
            }
            Msg::HalfOpenResolved { info, key, outcome } => self.on_half_open_resolved(info, key, outcome),
            Msg::BackupSynStarted { info, key } => self.on_backup_syn_started(&info, key),
            Msg::SpdyNegotiated { info, dotted_ip } => self.on_spdy_negotiated(&info, dotted_ip),
            Msg::HostResolved { info, dotted_ip } => self.on_host_resolved(&info, dotted_ip),
        }
    }

    fn get_or_create_entry(&mut self, info: &ConnectionInfo) -> &mut ConnectionEntry {
        self.entries
            .entry(info.clone())
            .or_insert_with(|| ConnectionEntry::new(info.clone(), Instant::now(), self.config.aggressive_pipelining))
    }

    // ---- admission ------------------------------------------------------

    fn process_new_transaction(&mut self, txn: Transaction) {
        let info = txn.info.clone();
        let now = Instant::now();
        self.get_or_create_entry(&info).insert_pending(txn, now);
        self.process_pending_q_for_entry(&info);
    }

    fn reschedule_transaction(&mut self, id: TransactionId, priority: Priority) {
        for entry in self.entries.values_mut() {
            if let Some(pos) = entry.pending.iter().position(|p| p.txn.id() == id) {
                let mut pending = entry.pending.remove(pos).unwrap();
                pending.txn.priority = priority;
                let enqueued_at = pending.enqueued_at;
                entry.insert_pending(pending.txn, enqueued_at);
                let info = entry.info.clone();
                self.process_pending_q_for_entry(&info);
                return;
            }
        }
    }

    /// `CancelTransaction` (spec §5: idempotent). Only a transaction still
    /// sitting in a pending queue, or bound to an un-won half-open, can
    /// actually be reached from here; once dispatched, responsibility for it
    /// has passed to the wire layer (spec §1 Non-goals), so cancellation of
    /// an already-dispatched transaction is a no-op other than the log line
    /// below.
    fn cancel_transaction(&mut self, id: TransactionId, reason: String) {
        for entry in self.entries.values_mut() {
            if let Some(pos) = entry.pending.iter().position(|p| p.txn.id() == id) {
                let mut pending = entry.pending.remove(pos).unwrap();
                pending.txn.sink.on_stop(StopReason::Canceled(reason));
                return;
            }
            let half_open_key = entry
                .half_opens
                .iter()
                .find(|(_, h)| !h.speculative && h.transaction.as_ref().map(|t| t.id()) == Some(id))
                .map(|(k, _)| k);
            if let Some(key) = half_open_key {
                let mut half_open = entry.half_opens.remove(key);
                if let Some(mut txn) = half_open.transaction.take() {
                    txn.sink.on_stop(StopReason::Canceled(reason));
                }
                half_open.abandon();
                return;
            }
        }
        debug!(?id, "CancelTransaction: transaction already dispatched or unknown");
    }

    // ---- dispatch ---------------------------------------------------------

    /// `ProcessPendingQForEntry` (spec §4.3).
    fn process_pending_q_for_entry(&mut self, info: &ConnectionInfo) {
        let now = Instant::now();
        if let Some(entry) = self.entries.get_mut(info) {
            entry.governor.credit_penalty(now);
        }

        loop {
            let Some(entry) = self.entries.get(info) else { return };
            if entry.pending.is_empty() {
                return;
            }
            let head_caps = entry.pending[0].txn.caps;
            let head_classification = entry.pending[0].txn.classification;
            let aged_past_delay =
                now.saturating_duration_since(entry.pending[0].enqueued_at) >= self.config.max_request_delay;
            let pressure = entry.is_under_pressure(self.config.per_host_persist_cap(info));
            let only_reused = head_caps.contains(Caps::ONLY_REUSED_CONNECTION) || (pressure && !aged_past_delay);

            // An idle connection (or an existing SPDY connection) is always
            // the cheapest dispatch; prefer it regardless of pressure.
            if self.try_reuse_spdy_or_idle(info) {
                continue;
            }

            let at_limit = self.at_active_connection_limit(info);
            if !only_reused && !at_limit {
                self.create_transport_for_head(info);
                // Creating a transport is asynchronous; nothing more to
                // dispatch until it resolves.
                return;
            }
            // Only reach for a busy active connection (pipelining) when
            // forced to reuse or when caps forbid opening a new one (spec
            // §4.3 step 3: "Try reused connection first when
            // onlyReusedConnection or when caps forbid opening new ones").
            // This is the same "shortest-loaded pipeline-eligible active
            // connection" operation step 5 names, so one routine (with
            // yellow-exclusivity and per-class penalty baked in) serves both.
            if self.try_build_pipeline(info, head_classification) {
                continue;
            }
            // Nothing could be done for the head transaction; leave it
            // queued (spec §4.3 step 6).
            return;
        }
    }

    /// Part of step 3 of spec §4.3 that's always worth doing regardless of
    /// pressure: dispatch onto the entry's SPDY connection, or promote an
    /// idle connection to active.
    fn try_reuse_spdy_or_idle(&mut self, info: &ConnectionInfo) -> bool {
        if let Some((spdy_info, conn_key)) = self.spdy_connection_for(info) {
            // `spdy_info` may be a different (coalesced-onto) entry than
            // `info`: the head transaction comes off *this* entry's queue,
            // but binds to a connection owned by the preferred entry.
            return self.dispatch_pending_onto(info, &spdy_info, conn_key);
        }

        if self.entries.get(info).map(|e| !e.idle.is_empty()).unwrap_or(false) {
            let entry = self.entries.get_mut(info).unwrap();
            let conn = entry.pop_idle().unwrap();
            let key = entry.active.insert(conn);
            {
                let mut shared = self.shared.lock();
                shared.num_idle_conns = shared.num_idle_conns.saturating_sub(1);
                shared.num_active_conns += 1;
            }
            self.update_ticker_arming();
            return self.dispatch_head_onto(info, key);
        }

        false
    }

    fn spdy_connection_for(&self, info: &ConnectionInfo) -> Option<(ConnectionInfo, usize)> {
        let entry = self.entries.get(info)?;
        if let Some(key) = entry.coalescing_key.clone() {
            if let Some(preferred_info) = self.coalescer.preferred_for(&key) {
                let preferred = self.entries.get(preferred_info)?;
                let conn_key = preferred.active.iter().find(|(_, c)| c.using_spdy()).map(|(k, _)| k)?;
                return Some((preferred_info.clone(), conn_key));
            }
        }
        let conn_key = entry.active.iter().find(|(_, c)| c.using_spdy()).map(|(k, _)| k)?;
        Some((info.clone(), conn_key))
    }

    fn at_active_connection_limit(&self, info: &ConnectionInfo) -> bool {
        let total_occupied: usize = self
            .entries
            .values()
            .map(|e| e.active_count() + e.half_open_count())
            .sum();
        if total_occupied >= self.config.max_conns as usize {
            return true;
        }
        let per_host_cap = self.config.per_host_cap(info) as usize;
        self.entries
            .get(info)
            .map(|e| e.active_count() + e.half_open_count() >= per_host_cap)
            .unwrap_or(false)
    }

    fn create_transport_for_head(&mut self, info: &ConnectionInfo) {
        let txn = {
            let entry = self.entries.get_mut(info).unwrap();
            entry.pending.pop_front().unwrap().txn
        };
        self.spawn_half_open(info.clone(), Some(txn), None);
    }

    fn spawn_half_open(&mut self, info: ConnectionInfo, txn: Option<Transaction>, speculative_caps: Option<Caps>) {
        let caps = txn.as_ref().map(|t| t.caps).or(speculative_caps).unwrap_or(Caps::NONE);
        let speculative = txn.is_none();
        let ctx = RaceContext {
            connector: self.connector.clone(),
            backup_delay: self.config.backup_syn_delay,
            result_tx: self.self_tx.clone(),
        };
        let entry = self.get_or_create_entry(&info);
        let key = entry.half_opens.vacant_key();
        let half_open = HalfOpenSocket::spawn(info.clone(), txn, caps, speculative, ctx, key);
        let inserted = entry.half_opens.insert(half_open);
        debug_assert_eq!(inserted, key);
    }

    /// Step 5 of spec §4.3: build (or extend) a pipeline if the entry is
    /// GREEN or YELLOW and the class supports pipelining.
    fn try_build_pipeline(&mut self, info: &ConnectionInfo, classification: Classification) -> bool {
        if !self.config.pipelining_enabled {
            return false;
        }
        let entry = match self.entries.get(info) {
            Some(e) => e,
            None => return false,
        };
        if !entry.governor.supports_pipelining() || !classification.supports_pipelining() {
            return false;
        }
        let depth_limit = entry.governor.max_pipeline_depth(classification);

        let target = match entry.governor.state() {
            PipeliningState::Yellow => entry
                .governor
                .yellow_connection()
                .or_else(|| entry.active.iter().min_by_key(|(_, c)| c.depth()).map(|(k, _)| k)),
            PipeliningState::Green => entry
                .active
                .iter()
                .filter(|(_, c)| c.depth() < depth_limit)
                .min_by_key(|(_, c)| c.depth())
                .map(|(k, _)| k),
            PipeliningState::Red => None,
        };

        let target = match target {
            Some(k) => k,
            None => return false,
        };

        if entry.governor.yellow_connection().is_none() && entry.governor.state() == PipeliningState::Yellow {
            self.entries.get_mut(info).unwrap().governor.set_yellow_connection(target);
        }

        let entry = self.entries.get(info).unwrap();
        if entry.active.get(target).map(|c| c.depth()).unwrap_or(u32::MAX) >= depth_limit {
            return false;
        }

        self.dispatch_head_onto(info, target)
    }

    /// Hands the head pending transaction off to `conn_key` (spec §4.3; spec
    /// invariant: a handed-out connection stays counted in the active slab —
    /// dispatch never moves it out, it only bumps `depth`).
    fn dispatch_head_onto(&mut self, info: &ConnectionInfo, conn_key: usize) -> bool {
        self.dispatch_pending_onto(info, info, conn_key)
    }

    /// Pops the head transaction off `pending_info`'s entry and binds it to
    /// `conn_owner`'s connection `conn_key`. The two differ when the
    /// transaction's own entry has coalesced onto another entry's SPDY
    /// connection (spec §4.5).
    fn dispatch_pending_onto(&mut self, pending_info: &ConnectionInfo, conn_owner: &ConnectionInfo, conn_key: usize) -> bool {
        let Some(mut pending) = self.entries.get_mut(pending_info).and_then(|e| e.pending.pop_front()) else {
            return false;
        };
        let Some(entry) = self.entries.get_mut(conn_owner) else {
            self.entries.get_mut(pending_info).unwrap().pending.push_front(pending);
            return false;
        };
        let Some(conn) = entry.active.get_mut(conn_key) else {
            self.entries.get_mut(pending_info).unwrap().pending.push_front(pending);
            return false;
        };
        conn.depth += 1;
        entry.governor.debit_class(pending.txn.classification, 1);

        let handle = ConnectionHandle::new(conn_owner.clone(), conn_key, self.self_tx.clone());
        let depth = conn.depth();
        pending.txn.sink.on_start(handle);
        debug!(conn_key, depth, "dispatched transaction onto connection");
        true
    }

    // ---- half-open resolution ---------------------------------------------

    /// The race task's backup branch fired; record when, since the task
    /// itself owns the timing and the half-open record otherwise never
    /// learns it (spec §3: "primary and backup SYN-start timestamps").
    fn on_backup_syn_started(&mut self, info: &ConnectionInfo, key: usize) {
        let Some(entry) = self.entries.get_mut(info) else { return };
        if let Some(half_open) = entry.half_opens.get_mut(key) {
            half_open.backup_syn_started = Some(Instant::now());
        }
    }

    fn on_half_open_resolved(&mut self, info: ConnectionInfo, key: usize, outcome: HalfOpenOutcome) {
        let Some(entry) = self.entries.get_mut(&info) else { return };
        if !entry.half_opens.contains(key) {
            return;
        }
        // Invariant: remove from half_opens before binding to a Connection.
        let mut half_open = entry.half_opens.remove(key);
        half_open.has_connected = matches!(outcome, HalfOpenOutcome::Connected { .. });
        let elapsed = Instant::now().saturating_duration_since(half_open.primary_syn_started);
        trace!(
            ?elapsed,
            backup_started = half_open.backup_syn_started.is_some(),
            caps = ?half_open.caps,
            "half-open resolved"
        );

        match outcome {
            HalfOpenOutcome::Failed(err) => {
                warn!(?err, "half-open connect failed");
                if let Some(mut txn) = half_open.transaction {
                    txn.sink.on_stop(StopReason::Transport(err));
                }
            }
            HalfOpenOutcome::Connected { transport, which } => {
                debug!(?which, "half-open connected");
                let conn = Connection::new(transport, false);
                let entry = self.entries.get_mut(&info).unwrap();
                let conn_key = entry.active.insert(conn);
                self.shared.lock().num_active_conns += 1;

                match half_open.transaction {
                    Some(mut txn) => {
                        let entry = self.entries.get_mut(&info).unwrap();
                        if let Some(conn) = entry.active.get_mut(conn_key) {
                            conn.depth += 1;
                        }
                        entry.governor.debit_class(txn.classification, 1);
                        let handle = ConnectionHandle::new(info.clone(), conn_key, self.self_tx.clone());
                        txn.sink.on_start(handle);
                    }
                    None => {
                        // Speculative half-open with no claimant: straight
                        // to idle (spec §4.6, testable property 8).
                        let entry = self.entries.get_mut(&info).unwrap();
                        let conn = entry.active.remove(conn_key);
                        entry.push_idle(conn);
                        let mut shared = self.shared.lock();
                        shared.num_active_conns -= 1;
                        shared.num_idle_conns += 1;
                    }
                }
            }
        }
        self.update_ticker_arming();
        self.process_pending_q_for_entry(&info);
    }

    // ---- reclaim / idle -----------------------------------------------------

    /// One `ConnectionHandle` reclaimed is one fewer in-flight transaction on
    /// `conn_key`, not necessarily the last: a SPDY-coalesced connection can
    /// carry several transactions (and several outstanding handles) at once
    /// (S6), so only the handle that drains `depth` to 0 actually idles or
    /// drops the connection.
    fn reclaim_connection(&mut self, info: &ConnectionInfo, conn_key: usize) {
        let Some(entry) = self.entries.get_mut(info) else { return };
        let Some(conn) = entry.active.get_mut(conn_key) else {
            return;
        };
        conn.depth = conn.depth.saturating_sub(1);
        if conn.depth > 0 {
            return;
        }
        let conn = entry.active.remove(conn_key);
        self.shared.lock().num_active_conns -= 1;
        if conn.is_idle_eligible() {
            entry.push_idle(conn);
            self.shared.lock().num_idle_conns += 1;
        }
        self.update_ticker_arming();
        self.process_pending_q_for_entry(info);
    }

    fn speculative_connect(&mut self, info: ConnectionInfo) {
        if self.at_active_connection_limit(&info) {
            return;
        }
        self.spawn_half_open(info, None, Some(Caps::NONE));
    }

    // ---- SPDY / upgrade -----------------------------------------------------

    /// `ReportSpdyNegotiated` (spec §4.5): a connection's TLS/ALPN handshake
    /// completed and the peer agreed to speak SPDY. TLS/ALPN itself is an
    /// external collaborator's job (§1 Non-goals) — this is its notification
    /// hook back into the coalescer.
    fn on_spdy_negotiated(&mut self, info: &ConnectionInfo, dotted_ip: String) {
        let Some(entry) = self.entries.get_mut(info) else { return };
        entry.tested_spdy = true;
        entry.using_spdy = true;
        for (_, conn) in entry.active.iter_mut() {
            conn.mark_using_spdy();
        }
        let key = (dotted_ip, info.anonymous);
        entry.coalescing_key = Some(key.clone());
        match self.coalescer.claim_or_lookup(key, info) {
            ClaimResult::Claimed | ClaimResult::AlreadyOwned => {
                self.entries.get_mut(info).unwrap().spdy_preferred = true;
            }
            ClaimResult::Deferred(preferred) => {
                debug!(?preferred, "deferring SPDY coalescing to existing preferred entry");
                self.entries.get_mut(info).unwrap().spdy_preferred = false;
            }
        }
        self.process_pending_q_for_entry(info);
    }

    /// `HostResolved` (spec §4.5): DNS is an external collaborator's job (§1
    /// Non-goals), but the coalescing key needs an entry's resolved IP before
    /// that entry's own transport has connected — the same way Firefox
    /// consults its DNS cache for a brand-new host before opening a socket.
    /// This is the resolver's hook to report that in; it doesn't itself mark
    /// the entry `usingSpdy` or claim the coalescing key, only makes it
    /// eligible to find an existing preferred entry.
    fn on_host_resolved(&mut self, info: &ConnectionInfo, dotted_ip: String) {
        let key = (dotted_ip, info.anonymous);
        self.get_or_create_entry(info).coalescing_key = Some(key);
        self.process_pending_q_for_entry(info);
    }

    fn complete_upgrade(
        &mut self,
        info: &ConnectionInfo,
        conn_key: usize,
        listener: Box<dyn crate::upgrade::UpgradeListener>,
    ) {
        let Some(entry) = self.entries.get_mut(info) else { return };
        if !entry.active.contains(conn_key) {
            return;
        }
        let conn = entry.active.remove(conn_key);
        self.shared.lock().num_active_conns -= 1;
        listener.on_upgrade(conn.transport);
    }

    // ---- feedback / params / maintenance -----------------------------------

    fn process_feedback(
        &mut self,
        info: &ConnectionInfo,
        kind: FeedbackInfo,
        conn_key: Option<usize>,
        depth: u32,
        classification: Option<Classification>,
    ) {
        let now = Instant::now();
        if let Some(entry) = self.entries.get_mut(info) {
            entry.governor.on_feedback(kind, conn_key, depth, classification, now);
        }
        self.process_pending_q_for_entry(info);
    }

    fn update_param(&mut self, name: Param, value: u16) {
        match name {
            Param::MaxConnections => self.config.max_conns = value,
            Param::MaxConnectionsPerHost => self.config.max_conns_per_host = value,
            Param::MaxConnectionsPerProxy => self.config.max_conns_per_proxy = value,
            Param::MaxPersistentConnectionsPerHost => self.config.max_persist_per_host = value,
            Param::MaxPersistentConnectionsPerProxy => self.config.max_persist_per_proxy = value,
            Param::MaxRequestDelay => self.config.max_request_delay = Duration::from_secs(value as u64),
            Param::MaxPipelinedRequests => {
                self.config.max_pipelined = value;
                for entry in self.entries.values_mut() {
                    entry.governor.set_green_cap(value as u32);
                }
            }
            Param::MaxOptimisticPipelinedRequests => self.config.max_optimistic_pipelined = value,
        }
        let infos: Vec<_> = self.entries.keys().cloned().collect();
        for info in infos {
            self.process_pending_q_for_entry(&info);
        }
    }

    fn prune_dead_connections(&mut self) {
        let now = Instant::now();
        let mut removed_idle = 0u32;
        let mut freed_coalescing_keys = Vec::new();
        self.entries.retain(|_, entry| {
            let before = entry.idle.len();
            entry.idle.retain(|c| {
                c.idle_since
                    .map(|t| now.saturating_duration_since(t) < IDLE_CONNECTION_LIFETIME)
                    .unwrap_or(true)
            });
            removed_idle += (before - entry.idle.len()) as u32;
            let dead = entry.is_dead();
            if dead {
                if let Some(key) = entry.coalescing_key.clone() {
                    freed_coalescing_keys.push(key);
                }
            }
            !dead
        });
        // An entry that died might have been the preferred SPDY coalescing
        // target; drop its claim so a future connection can take it over.
        for key in freed_coalescing_keys {
            self.coalescer.remove(&key);
        }
        if removed_idle > 0 {
            let mut shared = self.shared.lock();
            shared.num_idle_conns = shared.num_idle_conns.saturating_sub(removed_idle);
        }
        self.update_ticker_arming();
    }

    fn close_persistent_connections(&mut self) {
        let mut removed_idle = 0u32;
        for entry in self.entries.values_mut() {
            removed_idle += entry.idle.len() as u32;
            entry.idle.clear();
            for (_, conn) in entry.active.iter_mut() {
                conn.keep_alive = false;
            }
        }
        if removed_idle > 0 {
            let mut shared = self.shared.lock();
            shared.num_idle_conns = shared.num_idle_conns.saturating_sub(removed_idle);
        }
        self.update_ticker_arming();
    }

    /// Arm or disarm the two background timers based on current occupancy
    /// (spec §4.7: "the prune timer runs only while idle connections or a
    /// SPDY-using entry exist; the read-timeout tick only while some
    /// connection is active").
    fn update_ticker_arming(&mut self) {
        let idle = self.entries.values().map(|e| e.idle_count()).sum::<usize>();
        let spdy_active = self.entries.values().any(|e| e.using_spdy);
        if idle == 0 && !spdy_active {
            self.ticker.stop_prune();
        } else if !self.ticker.prune_armed() {
            self.ticker.arm_prune_after(DEFAULT_PRUNE_INTERVAL);
        }

        let active = self.entries.values().map(|e| e.active_count()).sum::<usize>();
        if active == 0 {
            self.ticker.stop_read_timeout();
        } else {
            self.ticker.activate_read_timeout();
        }
    }

    fn on_read_timeout_tick(&mut self) {
        // Read-timeout callbacks are delivered by the transaction/connection
        // component (spec §1 Non-goals); HCM's part is only to drive the 1s
        // cadence and disarm it once idle (spec §4.7).
        self.update_ticker_arming();
    }

    fn diagnostics(&self) -> Diagnostics {
        let mut d = Diagnostics {
            entries: self.entries.len(),
            ..Default::default()
        };
        for entry in self.entries.values() {
            d.num_active_conns += entry.active_count() as u32;
            d.num_idle_conns += entry.idle_count() as u32;
            d.num_half_opens += entry.half_open_count();
        }
        d
    }

    fn on_shutdown(&mut self) {
        self.shared.lock().shutting_down = true;
        for (_, entry) in self.entries.drain() {
            for mut pending in entry.pending {
                pending.txn.sink.on_stop(StopReason::Shutdown);
            }
            for (_, half_open) in entry.half_opens {
                let mut half_open = half_open;
                if let Some(mut txn) = half_open.transaction.take() {
                    txn.sink.on_stop(StopReason::Shutdown);
                }
                half_open.abandon();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::half_open::HalfOpenSocket;
    use crate::manager::SharedCounters;

    struct NullConnector;

    #[async_trait::async_trait]
    impl Connector for NullConnector {
        async fn connect(&self, _info: &ConnectionInfo) -> Result<Box<dyn crate::connection::Transport>, crate::error::TransportError> {
            unreachable!("not exercised by these unit tests")
        }
    }

    fn state() -> State {
        let (self_tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        State {
            entries: HashMap::new(),
            coalescer: SpdyCoalescer::new(),
            shared: Arc::new(Mutex::new(SharedCounters::default())),
            config: Config {
                max_conns: 256,
                max_conns_per_host: 6,
                max_conns_per_proxy: 32,
                max_persist_per_host: 6,
                max_persist_per_proxy: 32,
                max_request_delay: Duration::from_secs(10),
                max_pipelined: 32,
                max_optimistic_pipelined: 4,
                backup_syn_delay: Duration::from_millis(250),
                aggressive_pipelining: false,
                pipelining_enabled: false,
            },
            connector: Arc::new(NullConnector),
            self_tx,
            ticker: Ticker::new(),
        }
    }

    fn duplex_transport() -> Box<dyn crate::connection::Transport> {
        let (a, _b) = tokio::io::duplex(4096);
        Box::new(a)
    }

    /// Review regression: a connection serving two in-flight transactions
    /// (SPDY coalescing) must survive the first handle's drop and only idle
    /// once the second is reclaimed too.
    #[tokio::test]
    async fn reclaim_only_idles_once_depth_drains() {
        let mut s = state();
        let info = ConnectionInfo::new("a", 80, false);
        let entry = s.get_or_create_entry(&info);
        let mut conn = Connection::new(duplex_transport(), false);
        conn.depth = 2;
        let key = entry.active.insert(conn);
        s.shared.lock().num_active_conns = 1;

        s.reclaim_connection(&info, key);
        let entry = s.entries.get(&info).unwrap();
        assert!(entry.active.contains(key), "connection must stay active while depth > 0");
        assert_eq!(entry.active.get(key).unwrap().depth(), 1);
        assert_eq!(entry.idle.len(), 0);

        s.reclaim_connection(&info, key);
        let entry = s.entries.get(&info).unwrap();
        assert!(!entry.active.contains(key));
        assert_eq!(entry.idle.len(), 1, "last reclaim should idle the connection");
    }

    /// Review regression: the backup race task's start time is recorded on
    /// the half-open record, not left permanently `None`.
    #[tokio::test]
    async fn backup_syn_started_is_recorded() {
        let mut s = state();
        let info = ConnectionInfo::new("a", 80, false);
        let result_tx = s.self_tx.clone();
        let entry = s.get_or_create_entry(&info);
        let key = entry.half_opens.vacant_key();
        let ctx = RaceContext {
            connector: Arc::new(NullConnector),
            backup_delay: Duration::from_secs(3600),
            result_tx,
        };
        let half_open = HalfOpenSocket::spawn(info.clone(), None, Caps::NONE, true, ctx, key);
        let inserted = entry.half_opens.insert(half_open);
        assert_eq!(inserted, key);

        s.on_backup_syn_started(&info, key);

        let entry = s.entries.get(&info).unwrap();
        assert!(entry.half_opens.get(key).unwrap().backup_syn_started.is_some());
    }
}
