//! In-flight TCP(+TLS) connection attempts, with a primary/backup SYN race
//! (spec §4.6 "HalfOpenSocket").

use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use crate::error::TransportError;
use crate::events::Msg;
use crate::info::ConnectionInfo;
use crate::transaction::{Caps, Transaction};

/// Default delay before a backup connection attempt is raced against the
/// primary (spec §4.6: "arm a backup timer at a configured delay (default
/// 250 ms)"; spec §9 open question: this value is a manager-level builder
/// setting, not a `Param`).
pub const DEFAULT_BACKUP_SYN_DELAY: Duration = Duration::from_millis(250);

/// The socket-transport provider's asynchronous connect operation (spec §6).
/// A production caller plugs in real TCP + TLS; tests plug in an in-memory
/// double (see `tests/support`).
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, info: &ConnectionInfo) -> Result<Box<dyn crate::connection::Transport>, TransportError>;
}

/// Outcome of a half-open's primary/backup race, delivered back to the
/// dispatcher as a [`Msg::HalfOpenResolved`].
pub enum HalfOpenOutcome {
    Connected {
        transport: Box<dyn crate::connection::Transport>,
        which: Winner,
    },
    Failed(TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    Primary,
    Backup,
}

/// An in-flight connection attempt, recorded in
/// [`crate::entry::ConnectionEntry::half_opens`] until it binds to a
/// [`crate::connection::Connection`] or is abandoned (spec invariant 3).
pub struct HalfOpenSocket {
    pub transaction: Option<Transaction>,
    pub caps: Caps,
    /// Set at construction if created via `SpeculativeConnect` with no
    /// transaction in hand (spec §4.6, GLOSSARY "Speculative").
    pub speculative: bool,
    pub has_connected: bool,
    pub primary_syn_started: Instant,
    pub backup_syn_started: Option<Instant>,
    task: JoinHandle<()>,
}

/// What the spawned race task needs besides the target and the half-open's
/// own slab key; bundled so [`HalfOpenSocket::spawn`] doesn't grow an
/// unwieldy parameter list.
pub(crate) struct RaceContext {
    pub connector: std::sync::Arc<dyn Connector>,
    pub backup_delay: Duration,
    pub result_tx: UnboundedSender<Msg>,
}

impl HalfOpenSocket {
    /// Spawns the race task and returns a record to keep in the entry's
    /// `half_opens` slab. `key` is filled in by the caller once the slab slot
    /// is known, since the spawned task needs it to address its result back.
    pub fn spawn(
        info: ConnectionInfo,
        transaction: Option<Transaction>,
        caps: Caps,
        speculative: bool,
        ctx: RaceContext,
        key: usize,
    ) -> Self {
        let now = Instant::now();
        let task = tokio::spawn(race(info, ctx.connector, ctx.backup_delay, ctx.result_tx, key));
        HalfOpenSocket {
            transaction,
            caps,
            speculative,
            has_connected: false,
            primary_syn_started: now,
            backup_syn_started: None,
            task,
        }
    }

    /// Closes both transports (by dropping them; the task owns them) and
    /// detaches from the entry (spec §4.6 "`Abandon` closes both transports,
    /// cancels the timer, and detaches from the entry").
    pub fn abandon(self) {
        self.task.abort();
    }
}

async fn race(
    info: ConnectionInfo,
    connector: std::sync::Arc<dyn Connector>,
    backup_delay: Duration,
    result_tx: UnboundedSender<Msg>,
    key: usize,
) {
    let connect_info = info.clone();
    let primary = connector.connect(&connect_info);
    tokio::pin!(primary);

    let outcome = tokio::select! {
        res = &mut primary => {
            match res {
                Ok(transport) => HalfOpenOutcome::Connected { transport, which: Winner::Primary },
                Err(e) => {
                    // Primary failed before the backup timer fired; still
                    // try the backup once, since a transient refusal on the
                    // first SYN shouldn't doom a speculative/real attempt
                    // that the backup might still win.
                    match connector.connect(&connect_info).await {
                        Ok(transport) => HalfOpenOutcome::Connected { transport, which: Winner::Backup },
                        Err(_) => HalfOpenOutcome::Failed(e),
                    }
                }
            }
        }
        _ = tokio::time::sleep(backup_delay) => {
            let _ = result_tx.send(Msg::BackupSynStarted { info: info.clone(), key });
            let backup = connector.connect(&connect_info);
            tokio::pin!(backup);
            tokio::select! {
                res = &mut primary => {
                    match res {
                        Ok(transport) => HalfOpenOutcome::Connected { transport, which: Winner::Primary },
                        Err(_) => {
                            match backup.await {
                                Ok(transport) => HalfOpenOutcome::Connected { transport, which: Winner::Backup },
                                Err(e) => HalfOpenOutcome::Failed(e),
                            }
                        }
                    }
                }
                res = &mut backup => {
                    match res {
                        Ok(transport) => HalfOpenOutcome::Connected { transport, which: Winner::Backup },
                        Err(_) => {
                            match primary.await {
                                Ok(transport) => HalfOpenOutcome::Connected { transport, which: Winner::Primary },
                                Err(e) => HalfOpenOutcome::Failed(e),
                            }
                        }
                    }
                }
            }
        }
    };

    let _ = result_tx.send(Msg::HalfOpenResolved { info, key, outcome });
}
