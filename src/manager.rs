//! Public façade: the only API external callers touch directly (spec §4.1).

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::oneshot;
use tracing::trace;

use crate::dispatcher::{run_dispatcher, Config};
use crate::error::HcmError;
use crate::events::Msg;
use crate::half_open::{Connector, DEFAULT_BACKUP_SYN_DELAY};
use crate::info::ConnectionInfo;
use crate::pipeline::FeedbackInfo;
use crate::transaction::{Classification, Priority, Transaction, TransactionId};
use crate::upgrade::UpgradeListener;

/// The eight live-updatable parameters (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Param {
    MaxConnections,
    MaxConnectionsPerHost,
    MaxConnectionsPerProxy,
    MaxPersistentConnectionsPerHost,
    MaxPersistentConnectionsPerProxy,
    MaxRequestDelay,
    MaxPipelinedRequests,
    MaxOptimisticPipelinedRequests,
}

/// A zero cap on any of these would make `at_active_connection_limit` always
/// true for every host, permanently blocking dispatch — reject it the same
/// way the original rejects a zero `MaxConnections` pref.
fn validate_param(param: Param, value: u16) -> Result<(), HcmError> {
    let must_be_nonzero = matches!(
        param,
        Param::MaxConnections | Param::MaxConnectionsPerHost | Param::MaxConnectionsPerProxy
    );
    if must_be_nonzero && value == 0 {
        return Err(HcmError::InvalidParam {
            param,
            reason: "must be at least 1; a zero cap would permanently block dispatch",
        });
    }
    Ok(())
}

/// Counters and sets touched from any thread, guarded by a single mutex
/// (spec §5: "a single reentrant monitor guards (a) the connection-count
/// counters... (b) the alternate-protocol set, (c) the shutdown flag").
#[derive(Debug, Default)]
pub(crate) struct SharedCounters {
    pub num_active_conns: u32,
    pub num_idle_conns: u32,
    pub alternate_protocol: std::collections::HashSet<(Arc<str>, u16)>,
    pub shutting_down: bool,
}

/// A snapshot returned by [`Manager::print_diagnostics`] (spec §4.1
/// "PrintDiagnostics"; rendered as data instead of written to a console,
/// since a library has no console of its own — see SPEC_FULL.md §4.1).
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    pub entries: usize,
    pub num_active_conns: u32,
    pub num_idle_conns: u32,
    pub num_half_opens: usize,
}

/// Builder for [`Manager::init`] (spec §4.1 `Init`'s eight arguments, plus
/// the backup-SYN-delay open question resolved in SPEC_FULL.md §9).
pub struct ManagerBuilder {
    max_conns: u16,
    max_conns_per_host: u16,
    max_conns_per_proxy: u16,
    max_persist_per_host: u16,
    max_persist_per_proxy: u16,
    max_request_delay_s: u16,
    max_pipelined: u16,
    max_optimistic_pipelined: u16,
    backup_syn_delay: Duration,
    aggressive_pipelining: bool,
    pipelining_enabled: bool,
}

impl Default for ManagerBuilder {
    fn default() -> Self {
        ManagerBuilder {
            max_conns: 256,
            max_conns_per_host: 6,
            max_conns_per_proxy: 32,
            max_persist_per_host: 6,
            max_persist_per_proxy: 32,
            max_request_delay_s: 10,
            max_pipelined: 32,
            max_optimistic_pipelined: 4,
            backup_syn_delay: DEFAULT_BACKUP_SYN_DELAY,
            aggressive_pipelining: false,
            // Matches the original `network.http.pipelining` pref: off until
            // a caller opts in, even though the PipeliningState machine
            // itself always starts an entry in YELLOW.
            pipelining_enabled: false,
        }
    }
}

impl ManagerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_connections(mut self, v: u16) -> Self {
        self.max_conns = v;
        self
    }

    pub fn max_connections_per_host(mut self, v: u16) -> Self {
        self.max_conns_per_host = v;
        self
    }

    pub fn max_connections_per_proxy(mut self, v: u16) -> Self {
        self.max_conns_per_proxy = v;
        self
    }

    pub fn max_persistent_connections_per_host(mut self, v: u16) -> Self {
        self.max_persist_per_host = v;
        self
    }

    pub fn max_persistent_connections_per_proxy(mut self, v: u16) -> Self {
        self.max_persist_per_proxy = v;
        self
    }

    pub fn max_request_delay_secs(mut self, v: u16) -> Self {
        self.max_request_delay_s = v;
        self
    }

    pub fn max_pipelined_requests(mut self, v: u16) -> Self {
        self.max_pipelined = v;
        self
    }

    pub fn max_optimistic_pipelined_requests(mut self, v: u16) -> Self {
        self.max_optimistic_pipelined = v;
        self
    }

    pub fn backup_syn_delay(mut self, v: Duration) -> Self {
        self.backup_syn_delay = v;
        self
    }

    pub fn aggressive_pipelining(mut self, v: bool) -> Self {
        self.aggressive_pipelining = v;
        self
    }

    /// Whether the dispatcher may ever pipeline a second request onto a
    /// connection already serving one (spec §4.3 step 5). Off by default,
    /// matching the original `network.http.pipelining` pref — the
    /// PipeliningState machine still tracks GREEN/YELLOW/RED regardless, so
    /// feedback reporting and `Param` updates behave identically either way.
    pub fn pipelining_enabled(mut self, v: bool) -> Self {
        self.pipelining_enabled = v;
        self
    }

    /// `Init` (spec §4.1): spawns the dispatcher task and returns the façade.
    /// Main-thread-only in the original design; here that constraint relaxes
    /// to "call once, before any other operation", since there is no main
    /// thread to pin it to.
    pub fn init(self, connector: Arc<dyn Connector>) -> Manager {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Mutex::new(SharedCounters::default()));
        let config = Config {
            max_conns: self.max_conns,
            max_conns_per_host: self.max_conns_per_host,
            max_conns_per_proxy: self.max_conns_per_proxy,
            max_persist_per_host: self.max_persist_per_host,
            max_persist_per_proxy: self.max_persist_per_proxy,
            max_request_delay: Duration::from_secs(self.max_request_delay_s as u64),
            max_pipelined: self.max_pipelined,
            max_optimistic_pipelined: self.max_optimistic_pipelined,
            backup_syn_delay: self.backup_syn_delay,
            aggressive_pipelining: self.aggressive_pipelining,
            pipelining_enabled: self.pipelining_enabled,
        };

        let handle = tokio::spawn(run_dispatcher(rx, tx.clone(), shared.clone(), config, connector));

        Manager {
            tx,
            shared,
            next_txn_id: Arc::new(Mutex::new(1)),
            dispatcher: Arc::new(Mutex::new(Some(handle))),
        }
    }
}

/// Public façade (spec §4.1). Cheaply `Clone`: every operation is a message
/// send, so handing out more handles costs nothing but an `mpsc::Sender`
/// clone.
#[derive(Clone)]
pub struct Manager {
    tx: UnboundedSender<Msg>,
    shared: Arc<Mutex<SharedCounters>>,
    next_txn_id: Arc<Mutex<u64>>,
    dispatcher: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl Manager {
    pub fn builder() -> ManagerBuilder {
        ManagerBuilder::new()
    }

    fn send(&self, msg: Msg) -> Result<(), HcmError> {
        if self.shared.lock().shutting_down {
            return Err(HcmError::AlreadyShuttingDown);
        }
        self.tx.send(msg).map_err(|_| HcmError::DispatcherGone)
    }

    /// `AddTransaction` (spec §4.1): posts `NewTransaction` and returns
    /// immediately.
    pub fn add_transaction(
        &self,
        mut transaction: Transaction,
    ) -> Result<TransactionId, HcmError> {
        let id = {
            let mut next = self.next_txn_id.lock();
            let id = TransactionId(*next);
            *next += 1;
            id
        };
        transaction.id = id;
        trace!(?id, "AddTransaction");
        self.send(Msg::NewTransaction(transaction))?;
        Ok(id)
    }

    /// `RescheduleTransaction` (spec §4.1).
    pub fn reschedule_transaction(&self, id: TransactionId, priority: Priority) -> Result<(), HcmError> {
        self.send(Msg::ReschedTransaction(id, priority))
    }

    /// `CancelTransaction` (spec §4.1, §5: idempotent).
    pub fn cancel_transaction(&self, id: TransactionId, reason: impl Into<String>) -> Result<(), HcmError> {
        self.send(Msg::CancelTransaction(id, reason.into()))
    }

    /// `ReclaimConnection` (spec §4.1). Normally called implicitly by
    /// [`crate::connection::ConnectionHandle::drop`]; exposed for
    /// collaborators that reclaim on a caller's behalf.
    pub fn reclaim_connection(&self, info: ConnectionInfo, conn_key: usize) -> Result<(), HcmError> {
        self.send(Msg::ReclaimConnection { info, conn_key })
    }

    /// `SpeculativeConnect` (spec §4.1, §4.6 GLOSSARY "Speculative"): no
    /// obligation is incurred by either side.
    pub fn speculative_connect(&self, info: ConnectionInfo) -> Result<(), HcmError> {
        self.send(Msg::SpeculativeConnect(info))
    }

    /// `CompleteUpgrade` (spec §4.1, §1 "101-Switching-Protocols upgrade
    /// hand-off").
    pub fn complete_upgrade(
        &self,
        info: ConnectionInfo,
        conn_key: usize,
        listener: Box<dyn UpgradeListener>,
    ) -> Result<(), HcmError> {
        self.send(Msg::CompleteUpgrade { info, conn_key, listener })
    }

    /// `ReportSpdyNegotiated` (spec §4.5): the caller's TLS/ALPN layer
    /// completed a handshake and the peer negotiated SPDY on `conn`'s
    /// connection. `dotted_ip` is the resolved IP the transport connected to,
    /// forming half of the coalescing key (spec GLOSSARY "Coalescing key").
    pub fn report_spdy_negotiated(&self, info: ConnectionInfo, dotted_ip: impl Into<String>) -> Result<(), HcmError> {
        self.send(Msg::SpdyNegotiated { info, dotted_ip: dotted_ip.into() })
    }

    /// `HostResolved` (spec §4.5): DNS is an external collaborator (§1
    /// Non-goals), but a brand-new entry's coalescing key has to be known
    /// before it opens a transport for `GetSpdyPreferredEnt` to find an
    /// existing preferred entry — the resolver reports the looked-up IP back
    /// in here, the same way `report_spdy_negotiated` reports TLS/ALPN's
    /// outcome.
    pub fn report_host_resolved(&self, info: ConnectionInfo, dotted_ip: impl Into<String>) -> Result<(), HcmError> {
        self.send(Msg::HostResolved { info, dotted_ip: dotted_ip.into() })
    }

    /// `UpdateParam` (spec §4.1, §6). Rejects a value synchronously (spec
    /// §7: "configuration errors (rejected synchronously): invalid parameter
    /// value") before it ever reaches the dispatcher.
    pub fn update_param(&self, name: Param, value: u16) -> Result<(), HcmError> {
        validate_param(name, value)?;
        self.send(Msg::UpdateParam(name, value))
    }

    pub fn prune_dead_connections(&self) -> Result<(), HcmError> {
        self.send(Msg::PruneDeadConnections)
    }

    pub fn prune_dead_connections_after(&self, delay: Duration) -> Result<(), HcmError> {
        self.send(Msg::PruneDeadConnectionsAfter(delay))
    }

    pub fn close_persistent_connections(&self) -> Result<(), HcmError> {
        self.send(Msg::ClosePersistentConnections)
    }

    /// `PipelineFeedbackInfo` (spec §4.1, §4.4): "may be called from any
    /// thread".
    pub fn pipeline_feedback_info(
        &self,
        info: ConnectionInfo,
        kind: FeedbackInfo,
        conn_key: Option<usize>,
        depth: u32,
        classification: Option<Classification>,
    ) -> Result<(), HcmError> {
        self.send(Msg::ProcessFeedback {
            info,
            kind,
            conn_key,
            depth,
            classification,
        })
    }

    /// Reports a classified protocol-level error (spec §7) on a connection,
    /// translating it into the [`FeedbackInfo`] the [`crate::pipeline::PipelineGovernor`]
    /// reacts to. The sink/transport layer classifies the error; HCM only
    /// ever receives the outcome, the same way `pipeline_feedback_info`
    /// receives already-classified feedback.
    pub fn report_protocol_error(
        &self,
        info: ConnectionInfo,
        error: crate::error::ProtocolError,
        conn_key: Option<usize>,
        depth: u32,
        classification: Option<Classification>,
    ) -> Result<(), HcmError> {
        self.pipeline_feedback_info(info, error.into(), conn_key, depth, classification)
    }

    /// `GetSpdyAlternateProtocol` (spec §4.1, §4.5): protected by the shared
    /// monitor, so this may be called synchronously from any thread without
    /// going through the dispatcher.
    pub fn get_spdy_alternate_protocol(&self, host: &str, port: u16) -> bool {
        let key = (Arc::from(host), port);
        self.shared.lock().alternate_protocol.contains(&key)
    }

    pub fn report_spdy_alternate_protocol(&self, host: impl Into<Arc<str>>, port: u16) {
        self.shared.lock().alternate_protocol.insert((host.into(), port));
    }

    pub fn remove_spdy_alternate_protocol(&self, host: &str, port: u16) {
        let key = (Arc::from(host), port);
        self.shared.lock().alternate_protocol.remove(&key);
    }

    pub fn num_active_conns(&self) -> u32 {
        self.shared.lock().num_active_conns
    }

    pub fn num_idle_conns(&self) -> u32 {
        self.shared.lock().num_idle_conns
    }

    /// `PrintDiagnostics` (spec §4.1).
    pub async fn print_diagnostics(&self) -> Result<Diagnostics, HcmError> {
        let (tx, rx) = oneshot::channel();
        self.send(Msg::PrintDiagnostics(tx))?;
        rx.await.map_err(|_| HcmError::DispatcherGone)
    }

    /// `Shutdown` (spec §4.1): blocks until the dispatcher has torn down
    /// every entry. Idempotent: a second call observes
    /// `AlreadyShuttingDown` rather than hanging.
    pub async fn shutdown(&self) -> Result<(), HcmError> {
        {
            let mut guard = self.shared.lock();
            if guard.shutting_down {
                return Err(HcmError::AlreadyShuttingDown);
            }
            guard.shutting_down = true;
        }
        let _ = self.tx.send(Msg::Shutdown);
        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// spec §7 — a zero connection cap is rejected synchronously instead of
    /// silently deadlocking every future dispatch on that host.
    #[test]
    fn zero_connection_caps_are_rejected() {
        assert!(matches!(
            validate_param(Param::MaxConnections, 0),
            Err(HcmError::InvalidParam { param: Param::MaxConnections, .. })
        ));
        assert!(matches!(
            validate_param(Param::MaxConnectionsPerHost, 0),
            Err(HcmError::InvalidParam { param: Param::MaxConnectionsPerHost, .. })
        ));
        assert!(matches!(
            validate_param(Param::MaxConnectionsPerProxy, 0),
            Err(HcmError::InvalidParam { param: Param::MaxConnectionsPerProxy, .. })
        ));
    }

    #[test]
    fn other_params_accept_zero() {
        assert!(validate_param(Param::MaxRequestDelay, 0).is_ok());
        assert!(validate_param(Param::MaxPipelinedRequests, 0).is_ok());
        assert!(validate_param(Param::MaxOptimisticPipelinedRequests, 0).is_ok());
        assert!(validate_param(Param::MaxPersistentConnectionsPerHost, 0).is_ok());
        assert!(validate_param(Param::MaxPersistentConnectionsPerProxy, 0).is_ok());
    }
}
