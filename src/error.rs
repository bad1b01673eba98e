//! Error taxonomy for the connection manager.
//!
//! Configuration errors are rejected synchronously by the façade. Transport
//! and protocol errors never propagate out of the dispatcher; they are
//! surfaced to a transaction's [`crate::transaction::TransactionSink`] or fed
//! to the [`crate::pipeline::PipelineGovernor`] instead.

use std::fmt;

use crate::manager::Param;

/// Errors returned synchronously by the [`crate::manager::Manager`] façade.
#[derive(Debug, thiserror::Error)]
pub enum HcmError {
    /// A parameter value was rejected before it reached the dispatcher.
    #[error("invalid value for parameter {param:?}: {reason}")]
    InvalidParam { param: Param, reason: &'static str },

    /// Any operation attempted after [`crate::manager::Manager::shutdown`]
    /// has been called.
    #[error("connection manager is shutting down or already shut down")]
    AlreadyShuttingDown,

    /// The dispatcher task died; the manager can no longer be driven.
    #[error("dispatcher event loop is gone")]
    DispatcherGone,
}

/// The reason a transaction's sink is notified when its connection fails
/// before any HTTP response is available.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Opening the underlying socket failed (DNS, connect-refused, etc).
    #[error("connect failed: {0}")]
    Connect(String),
    /// The TLS handshake (or ALPN negotiation) failed.
    #[error("tls handshake failed: {0}")]
    Tls(String),
    /// An established connection was closed while idle.
    #[error("idle connection closed by peer")]
    IdleClosed,
    /// The manager was shut down while the transaction was in flight.
    #[error("connection manager shut down")]
    Shutdown,
}

/// A classified protocol-level error, converted to a [`crate::pipeline::FeedbackInfo`]
/// (via its `From` impl) and fed to the [`crate::pipeline::PipelineGovernor`]
/// through [`crate::manager::Manager::report_protocol_error`].
/// Never causes a panic or an early return from the dispatcher: see spec §7.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("server speaks HTTP < 1.1")]
    VersionTooLow,
    #[error("server is on the pipelining blocklist")]
    BannedServer,
    #[error("response framing or integrity check failed")]
    CorruptedContent,
    #[error("server closed the connection mid-pipeline")]
    CanceledPipeline,
    #[error("keep-alive was promised but the connection was closed explicitly")]
    ExplicitClose,
    #[error("response is missing chunked encoding or Content-Length")]
    InsufficientFraming,
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
