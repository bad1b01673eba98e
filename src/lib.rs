//! `hcm` multiplexes outgoing HTTP transactions onto a bounded pool of
//! TCP/TLS/SPDY connections.
//!
//! A [`Manager`] is the single entry point: it owns a dispatcher task that
//! tracks one [`entry::ConnectionEntry`] per distinct [`ConnectionInfo`],
//! decides when to reuse a connection, build a pipeline, or open a new one,
//! and applies the pipelining feedback state machine that backs off from
//! misbehaving servers. Socket I/O, TLS handshakes, and HTTP wire framing
//! are supplied by the caller through the [`Connector`], [`Transport`] and
//! [`TransactionSink`] traits — this crate only ever schedules.

mod connection;
mod dispatcher;
mod entry;
mod error;
mod events;
mod half_open;
mod info;
mod manager;
mod pipeline;
mod spdy;
mod ticker;
#[cfg(feature = "tls")]
mod tls_connector;
mod transaction;
mod upgrade;

pub use connection::{Connection, ConnectionHandle, Transport};
#[cfg(feature = "tls")]
pub use tls_connector::TcpConnector;
pub use error::{HcmError, ProtocolError, TransportError};
pub use half_open::{Connector, DEFAULT_BACKUP_SYN_DELAY};
pub use info::{ConnectionInfo, ProxyHop};
pub use manager::{Diagnostics, Manager, ManagerBuilder, Param};
pub use pipeline::{
    FeedbackInfo, PipeliningState, PENALTY_LARGE, PENALTY_MEDIUM, PENALTY_SMALL, PIPELINE_OPEN,
    PIPELINE_RESTRICTED, PIPELINE_UNLIMITED,
};
pub use spdy::ClaimResult;
pub use transaction::{Caps, Classification, Priority, StopReason, Transaction, TransactionId, TransactionSink};
pub use upgrade::UpgradeListener;
