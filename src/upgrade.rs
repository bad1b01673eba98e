//! 101-Switching-Protocols upgrade hand-off (spec §1, §4.1 `CompleteUpgrade`).

use crate::connection::Transport;

/// Receives a live transport once a connection has been detached from its
/// entry after a 101 response (spec §6: "Upgrade listener").
pub trait UpgradeListener: Send {
    fn on_upgrade(self: Box<Self>, transport: Box<dyn Transport>);
}
