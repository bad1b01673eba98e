//! The dispatcher's two background timers (spec §4.7): a prune sweep that
//! reaps idle connections past their lifetime, and a 1s tick that drives
//! read-timeout checks on active connections. Both disarm themselves once
//! there is nothing left to watch.

use std::time::Duration;

use tokio::time::{interval, Interval, MissedTickBehavior};

pub(crate) const DEFAULT_PRUNE_INTERVAL: Duration = Duration::from_secs(15);

/// Fields are `pub(crate)` (rather than hidden behind methods that take
/// `&mut self`) so the dispatcher's `tokio::select!` can borrow `prune` and
/// `read_timeout` independently — both can be mutably borrowed at once
/// since they're disjoint fields, which a `&mut self` method can't express.
pub(crate) struct Ticker {
    pub prune: Option<Interval>,
    pub read_timeout: Option<Interval>,
}

impl Ticker {
    pub fn new() -> Self {
        Ticker {
            prune: None,
            read_timeout: None,
        }
    }

    pub fn prune_armed(&self) -> bool {
        self.prune.is_some()
    }

    pub fn read_timeout_armed(&self) -> bool {
        self.read_timeout.is_some()
    }

    pub fn arm_prune_after(&mut self, delay: Duration) {
        let mut iv = interval(delay.max(Duration::from_millis(1)));
        iv.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.prune = Some(iv);
    }

    pub fn stop_prune(&mut self) {
        self.prune = None;
    }

    pub fn activate_read_timeout(&mut self) {
        if self.read_timeout.is_none() {
            let mut iv = interval(Duration::from_secs(1));
            iv.set_missed_tick_behavior(MissedTickBehavior::Delay);
            self.read_timeout = Some(iv);
        }
    }

    pub fn stop_read_timeout(&mut self) {
        self.read_timeout = None;
    }
}

/// Awaits the next tick of an armed slot, or never resolves if unarmed.
/// A free function (not a method) so two slots of the same [`Ticker`] can be
/// awaited concurrently in one `tokio::select!` without a double-borrow.
pub(crate) async fn tick(slot: &mut Option<Interval>) {
    match slot {
        Some(iv) => {
            iv.tick().await;
        }
        None => std::future::pending().await,
    }
}
