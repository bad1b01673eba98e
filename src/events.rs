//! Cross-thread message passing (spec §4.2 "EventQueue").
//!
//! Every state-mutating façade operation lowers to a `Msg` variant posted on
//! an `mpsc` channel; the dispatcher task is the sole consumer and the sole
//! mutator of entry containers (spec §5). Events from a single sender are
//! observed in submission order because `mpsc::UnboundedSender` preserves
//! FIFO order per channel; no cross-channel ordering is promised, matching
//! spec §4.2's guarantee exactly.

use crate::half_open::HalfOpenOutcome;
use crate::info::ConnectionInfo;
use crate::manager::Param;
use crate::pipeline::FeedbackInfo;
use crate::transaction::{Classification, Priority, Transaction, TransactionId};
use crate::upgrade::UpgradeListener;

pub enum Msg {
    Shutdown,
    NewTransaction(Transaction),
    ReschedTransaction(TransactionId, Priority),
    CancelTransaction(TransactionId, String),
    PruneDeadConnections,
    PruneDeadConnectionsAfter(std::time::Duration),
    SpeculativeConnect(ConnectionInfo),
    ReclaimConnection { info: ConnectionInfo, conn_key: usize },
    CompleteUpgrade { info: ConnectionInfo, conn_key: usize, listener: Box<dyn UpgradeListener> },
    UpdateParam(Param, u16),
    ClosePersistentConnections,
    ProcessFeedback {
        info: ConnectionInfo,
        kind: FeedbackInfo,
        conn_key: Option<usize>,
        depth: u32,
        classification: Option<Classification>,
    },
    PrintDiagnostics(tokio::sync::oneshot::Sender<crate::manager::Diagnostics>),
    HalfOpenResolved { info: ConnectionInfo, key: usize, outcome: HalfOpenOutcome },
    BackupSynStarted { info: ConnectionInfo, key: usize },
    SpdyNegotiated { info: ConnectionInfo, dotted_ip: String },
    HostResolved { info: ConnectionInfo, dotted_ip: String },
}

impl std::fmt::Debug for Msg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Msg::Shutdown => "Shutdown",
            Msg::NewTransaction(_) => "NewTransaction",
            Msg::ReschedTransaction(..) => "ReschedTransaction",
            Msg::CancelTransaction(..) => "CancelTransaction",
            Msg::PruneDeadConnections => "PruneDeadConnections",
            Msg::PruneDeadConnectionsAfter(_) => "PruneDeadConnectionsAfter",
            Msg::SpeculativeConnect(_) => "SpeculativeConnect",
            Msg::ReclaimConnection { .. } => "ReclaimConnection",
            Msg::CompleteUpgrade { .. } => "CompleteUpgrade",
            Msg::UpdateParam(..) => "UpdateParam",
            Msg::ClosePersistentConnections => "ClosePersistentConnections",
            Msg::ProcessFeedback { .. } => "ProcessFeedback",
            Msg::PrintDiagnostics(_) => "PrintDiagnostics",
            Msg::HalfOpenResolved { .. } => "HalfOpenResolved",
            Msg::BackupSynStarted { .. } => "BackupSynStarted",
            Msg::SpdyNegotiated { .. } => "SpdyNegotiated",
            Msg::HostResolved { .. } => "HostResolved",
        };
        f.write_str(name)
    }
}
