//! Bound transports and the capability handle transactions hold on them.

use std::time::Instant;

use tokio::sync::mpsc::UnboundedSender;

use crate::events::Msg;

/// The socket-transport provider's product type (spec §6, Non-goals: TLS
/// handshake and socket I/O primitives are an external collaborator's job —
/// this crate only ever holds one behind this trait object).
pub trait Transport: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send {}

impl<T> Transport for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send {}

/// A bound transport plus the bookkeeping the dispatcher needs to schedule
/// pipelines and reuse onto it (spec §3: "Connection").
pub struct Connection {
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) using_spdy: bool,
    /// Number of in-flight unacknowledged requests ("pipelining depth",
    /// GLOSSARY).
    pub(crate) depth: u32,
    /// Set when the connection is pushed onto an entry's idle list; cleared
    /// on reuse.
    pub(crate) idle_since: Option<Instant>,
    pub(crate) keep_alive: bool,
}

impl Connection {
    pub(crate) fn new(transport: Box<dyn Transport>, using_spdy: bool) -> Self {
        Connection {
            transport,
            using_spdy,
            depth: 0,
            idle_since: None,
            keep_alive: true,
        }
    }

    pub fn using_spdy(&self) -> bool {
        self.using_spdy
    }

    pub(crate) fn mark_using_spdy(&mut self) {
        self.using_spdy = true;
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn is_idle_eligible(&self) -> bool {
        self.keep_alive
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("using_spdy", &self.using_spdy)
            .field("depth", &self.depth)
            .field("idle_since", &self.idle_since)
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}

/// Indirection held by a transaction; returns the connection to the manager
/// on drop (spec §3/§9: "thin wrapper... this extra layer of indirection
/// greatly simplifies consumer code" — `nsConnectionHandle` in the original).
///
/// A [`ConnectionEntry`](crate::entry::ConnectionEntry) is addressed by its
/// [`crate::info::ConnectionInfo`]; within it, a `Connection` is addressed by
/// a stable `slab` index, since `Connection` itself never moves once
/// dispatched (spec §9: "Connection holds the index, not the pointer").
pub struct ConnectionHandle {
    info_key: crate::info::ConnectionInfo,
    conn_key: usize,
    reclaim_tx: Option<UnboundedSender<Msg>>,
}

impl ConnectionHandle {
    pub(crate) fn new(
        info_key: crate::info::ConnectionInfo,
        conn_key: usize,
        reclaim_tx: UnboundedSender<Msg>,
    ) -> Self {
        ConnectionHandle {
            info_key,
            conn_key,
            reclaim_tx: Some(reclaim_tx),
        }
    }

    pub fn conn_key(&self) -> usize {
        self.conn_key
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.reclaim_tx.take() {
            // The dispatcher task may already be gone (manager shut down);
            // that's not an error, there's nothing left to reclaim into.
            let _ = tx.send(Msg::ReclaimConnection {
                info: self.info_key.clone(),
                conn_key: self.conn_key,
            });
        }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("info", &self.info_key)
            .field("conn_key", &self.conn_key)
            .finish()
    }
}
