//! Outgoing requests as seen by the connection manager.

use crate::connection::ConnectionHandle;
use crate::error::TransportError;
use crate::info::ConnectionInfo;

/// Priority is a signed integer; lower numbers dispatch earlier (spec §4.3:
/// "lower numeric priority means earlier dispatch").
pub type Priority = i32;

/// Identifies a transaction across `AddTransaction`/`RescheduleTransaction`/
/// `CancelTransaction` calls. The original design passes around a refcounted
/// `nsHttpTransaction*`; since a [`Transaction`] is moved into the dispatcher
/// on admission, callers instead hold this handle, assigned by
/// [`crate::manager::Manager::add_transaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(pub(crate) u64);

/// Transaction classification, used by the [`crate::pipeline::PipelineGovernor`]
/// to track per-class penalties and by [`crate::dispatcher::run_dispatcher`]
/// to decide pipeline eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Classification {
    Revalidation = 0,
    ImmediateDict = 1,
    MaybeSpeculative = 2,
    BulkContent = 3,
}

impl Classification {
    /// Number of distinct classes; used to size the per-class penalty array
    /// (spec §3: "`mPipeliningClassPenalty[nsAHttpTransaction::CLASS_MAX]`").
    pub const CLASS_MAX: usize = 4;

    pub fn index(self) -> usize {
        self as u8 as usize
    }

    /// Whether this class ever participates in pipelining. Bulk content
    /// transactions risk head-of-line blocking (spec §4.4:
    /// `BadUnexpectedLarge`) but are not categorically excluded — only
    /// penalized more.
    pub fn supports_pipelining(self) -> bool {
        true
    }
}

/// Capability bits carried by a transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Caps(u8);

impl Caps {
    pub const NONE: Caps = Caps(0);
    pub const NO_KEEPALIVE: Caps = Caps(1 << 0);
    pub const ANONYMOUS: Caps = Caps(1 << 1);
    pub const ONLY_REUSED_CONNECTION: Caps = Caps(1 << 2);

    pub fn contains(self, flag: Caps) -> bool {
        self.0 & flag.0 == flag.0
    }

    pub fn with(self, flag: Caps) -> Caps {
        Caps(self.0 | flag.0)
    }
}

/// Why a transaction's sink was stopped without ever producing a response.
#[derive(Debug, Clone)]
pub enum StopReason {
    /// `CancelTransaction` was called with this reason.
    Canceled(String),
    /// A transport-level failure (spec §7: surfaced, not retried, except
    /// `RedCanceledPipeline`, which is handled at the dispatcher level).
    Transport(TransportError),
    /// The manager is shutting down (spec §7: "fatal to all in-flight
    /// operations; cancellation reason is a fixed shutdown code").
    Shutdown,
}

/// The external collaborator that receives connection lifecycle callbacks
/// for a transaction (spec §6: "Transaction sink").
pub trait TransactionSink: Send {
    /// Called once a connection has been bound to this transaction.
    fn on_start(&mut self, handle: ConnectionHandle);
    /// Called when the transaction will never be dispatched (or its
    /// dispatched connection failed) without ever starting a response.
    fn on_stop(&mut self, reason: StopReason);
}

/// An outgoing request, as admitted into the manager.
pub struct Transaction {
    pub(crate) id: TransactionId,
    pub info: ConnectionInfo,
    pub priority: Priority,
    pub classification: Classification,
    pub caps: Caps,
    pub sink: Box<dyn TransactionSink>,
}

impl Transaction {
    pub fn new(
        info: ConnectionInfo,
        priority: Priority,
        classification: Classification,
        caps: Caps,
        sink: Box<dyn TransactionSink>,
    ) -> Self {
        Transaction {
            id: TransactionId(0),
            info,
            priority,
            classification,
            caps,
            sink,
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("info", &self.info)
            .field("priority", &self.priority)
            .field("classification", &self.classification)
            .field("caps", &self.caps)
            .finish()
    }
}
