//! GREEN/YELLOW/RED pipelining feedback state machine (spec §4.4).

#[cfg(test)]
use std::time::Duration;
use std::time::Instant;

use crate::error::ProtocolError;
use crate::transaction::Classification;

/// Pipeline depth caps (spec §4.4).
pub const PIPELINE_UNLIMITED: u32 = 1024;
pub const PIPELINE_OPEN: u32 = 6;
pub const PIPELINE_RESTRICTED: u32 = 2;

/// How fast accumulated penalty decays, in points per second. Chosen so that
/// a `Bad*` medium penalty (see [`PENALTY_MEDIUM`]) repays itself in about a
/// minute of elapsed wall time, matching the original design's intent that
/// "time and other positive experiences will eventually allow it to try
/// again" (original `nsHttpConnectionMgr.h` comment on `PS_RED`).
const PENALTY_DECAY_PER_SEC: i32 = 1;

pub const PENALTY_SMALL: i16 = 4;
pub const PENALTY_MEDIUM: i16 = 25;
pub const PENALTY_LARGE: i16 = 100;
/// A class is excluded from pipelining once its own penalty crosses this.
const CLASS_PENALTY_THRESHOLD: i16 = 25;

/// `PipeliningState` (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeliningState {
    Green,
    Yellow,
    Red,
}

/// Classified feedback events (spec §4.4 table; original source's
/// `PipelineFeedbackInfoType`, which OR's a type bit into the variant — we
/// keep the same four semantic buckets as an explicit enum-of-enums instead
/// of bit-packed flags, since Rust's exhaustive match is the idiomatic
/// replacement for "mask off the high bits to get the category").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackInfo {
    RedVersionTooLow,
    RedBannedServer,
    RedCorruptedContent,
    RedCanceledPipeline,
    BadExplicitClose,
    BadSlowReadMinor,
    BadSlowReadMajor,
    BadInsufficientFraming,
    BadUnexpectedLarge,
    NeutralExpectedOk,
    GoodCompletedOk,
}

/// Classifies a protocol-level error into the feedback bucket the governor
/// reacts to (spec §7: "protocol errors ... fed to PipelineGovernor").
impl From<ProtocolError> for FeedbackInfo {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::VersionTooLow => FeedbackInfo::RedVersionTooLow,
            ProtocolError::BannedServer => FeedbackInfo::RedBannedServer,
            ProtocolError::CorruptedContent => FeedbackInfo::RedCorruptedContent,
            ProtocolError::CanceledPipeline => FeedbackInfo::RedCanceledPipeline,
            ProtocolError::ExplicitClose => FeedbackInfo::BadExplicitClose,
            ProtocolError::InsufficientFraming => FeedbackInfo::BadInsufficientFraming,
        }
    }
}

impl FeedbackInfo {
    fn is_red(self) -> bool {
        matches!(
            self,
            FeedbackInfo::RedVersionTooLow
                | FeedbackInfo::RedBannedServer
                | FeedbackInfo::RedCorruptedContent
                | FeedbackInfo::RedCanceledPipeline
        )
    }
}

/// Per-entry pipelining governor (spec §3 "PipeliningState", §4.4).
#[derive(Debug)]
pub struct PipelineGovernor {
    state: PipeliningState,
    initial_green_depth: u32,
    green_depth: u32,
    /// Connection key of the single probe connection while YELLOW (spec
    /// invariant 4: "`yellowConnection` is non-null iff `PipelineState ==
    /// YELLOW`").
    yellow_connection: Option<usize>,
    yellow_good_events: u32,
    yellow_bad_events: u32,
    penalty: i16,
    class_penalty: [i16; Classification::CLASS_MAX],
    last_credit_time: Instant,
    banned: bool,
}

impl PipelineGovernor {
    pub fn new(now: Instant, aggressive: bool) -> Self {
        let initial_green_depth = if aggressive {
            PIPELINE_UNLIMITED
        } else {
            PIPELINE_OPEN
        };
        PipelineGovernor {
            state: PipeliningState::Yellow,
            initial_green_depth,
            green_depth: initial_green_depth,
            yellow_connection: None,
            yellow_good_events: 0,
            yellow_bad_events: 0,
            penalty: 0,
            class_penalty: [0; Classification::CLASS_MAX],
            last_credit_time: now,
            banned: false,
        }
    }

    pub fn state(&self) -> PipeliningState {
        self.state
    }

    pub fn yellow_connection(&self) -> Option<usize> {
        self.yellow_connection
    }

    /// Decay accumulated penalty against elapsed wall time (spec §4.4
    /// "CreditPenalty"; §9 open question: decay accrues even with an empty
    /// pending queue, resolved as continuous wall-clock decay applied lazily
    /// the next time the entry is touched).
    pub fn credit_penalty(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_credit_time);
        self.last_credit_time = now;
        if self.penalty == 0 {
            return;
        }
        let credit = (elapsed.as_secs() as i64 * PENALTY_DECAY_PER_SEC as i64).min(i16::MAX as i64) as i16;
        self.penalty = self.penalty.saturating_sub(credit);
        if self.penalty < 0 {
            self.penalty = 0;
        }
        if self.penalty == 0 && self.state == PipeliningState::Red && !self.banned {
            self.state = PipeliningState::Yellow;
            self.yellow_good_events = 0;
            self.yellow_bad_events = 0;
        }
    }

    /// Whether this entry currently allows pipelining at all (spec §4.3
    /// step 5: "the entry is GREEN or YELLOW").
    pub fn supports_pipelining(&self) -> bool {
        matches!(self.state, PipeliningState::Green | PipeliningState::Yellow)
    }

    /// Maximum pipeline depth for a transaction of the given class (spec
    /// §4.4 depth caps + per-class exclusion).
    pub fn max_pipeline_depth(&self, classification: Classification) -> u32 {
        if self.class_penalty[classification.index()] > CLASS_PENALTY_THRESHOLD {
            return 1;
        }
        match self.state {
            PipeliningState::Red => 1,
            PipeliningState::Yellow => PIPELINE_RESTRICTED,
            PipeliningState::Green => self.green_depth,
        }
    }

    /// Elect a single active connection to probe pipelining depth
    /// (spec §4.4 "Transitions": "YELLOW begins by electing one active
    /// connection").
    pub fn set_yellow_connection(&mut self, conn_key: usize) {
        debug_assert_eq!(self.state, PipeliningState::Yellow);
        self.yellow_connection = Some(conn_key);
    }

    fn clear_yellow(&mut self) {
        self.yellow_connection = None;
        self.yellow_good_events = 0;
        self.yellow_bad_events = 0;
    }

    /// Apply a classified feedback event (spec §4.4 table + Transitions).
    /// `conn_key` is the connection the event concerns, used to confirm a
    /// `GoodCompletedOk` arrived on the elected `yellowConnection` and not
    /// some other connection racing against it.
    pub fn on_feedback(
        &mut self,
        info: FeedbackInfo,
        conn_key: Option<usize>,
        depth: u32,
        classification: Option<Classification>,
        now: Instant,
    ) {
        self.credit_penalty(now);

        if info.is_red() {
            self.state = PipeliningState::Red;
            self.clear_yellow();
            match info {
                FeedbackInfo::RedVersionTooLow | FeedbackInfo::RedCorruptedContent => {
                    self.penalty = self.penalty.saturating_add(PENALTY_LARGE);
                }
                FeedbackInfo::RedBannedServer => {
                    self.banned = true;
                    self.penalty = i16::MAX;
                }
                FeedbackInfo::RedCanceledPipeline => {
                    // No batch to requeue here: the dispatcher hands each
                    // transaction to its sink as soon as it's dispatched
                    // (`dispatch_pending_onto`), one at a time, rather than
                    // packaging several into a single wire-level pipeline
                    // object first. There is never a set of "unsent trailing
                    // transactions" sitting in HCM's pending queue for a
                    // canceled pipeline to return — see SPEC_FULL.md §6.
                    // The governor's only job on this event is the state
                    // transition below.
                }
                _ => unreachable!(),
            }
            return;
        }

        match info {
            FeedbackInfo::BadExplicitClose => {
                self.penalty = self.penalty.saturating_add(PENALTY_MEDIUM);
            }
            FeedbackInfo::BadSlowReadMinor => {
                self.penalty = self.penalty.saturating_add(PENALTY_SMALL);
            }
            FeedbackInfo::BadSlowReadMajor | FeedbackInfo::BadInsufficientFraming => {
                self.penalty = self.penalty.saturating_add(PENALTY_MEDIUM);
            }
            FeedbackInfo::BadUnexpectedLarge => {
                self.penalty = self.penalty.saturating_add(PENALTY_MEDIUM);
                if let Some(c) = classification {
                    self.class_penalty[c.index()] =
                        self.class_penalty[c.index()].saturating_add(PENALTY_MEDIUM);
                }
            }
            FeedbackInfo::NeutralExpectedOk => {}
            FeedbackInfo::GoodCompletedOk => {
                if self.state == PipeliningState::Yellow
                    && conn_key.is_some()
                    && conn_key == self.yellow_connection
                {
                    self.yellow_good_events += 1;
                    if depth >= 3 {
                        self.state = PipeliningState::Green;
                        self.green_depth = self.initial_green_depth;
                        self.clear_yellow();
                    }
                } else if self.state == PipeliningState::Green
                    && depth >= 3
                    && self.green_depth < PIPELINE_UNLIMITED
                {
                    self.green_depth = PIPELINE_UNLIMITED;
                }
            }
            _ => unreachable!(),
        }
    }

    /// Subtract a per-class penalty for dispatching a transaction of this
    /// class onto a pipeline (spec §4.4: "Per-class penalties are subtracted
    /// additionally when dispatching").
    pub fn debit_class(&mut self, classification: Classification, amount: i16) {
        let slot = &mut self.class_penalty[classification.index()];
        *slot = slot.saturating_sub(amount).max(0);
    }

    /// Re-cap GREEN depth in response to a live `MaxPipelinedRequests` update
    /// (spec §6 "Param"). Takes effect immediately if already GREEN.
    pub fn set_green_cap(&mut self, cap: u32) {
        self.initial_green_depth = cap.clamp(1, PIPELINE_UNLIMITED);
        if self.state == PipeliningState::Green {
            self.green_depth = self.green_depth.min(self.initial_green_depth);
        }
    }

    /// The depth cap a single connection can reach in the current state,
    /// used by [`crate::entry::ConnectionEntry::is_under_pressure`] to decide
    /// whether every active connection is already saturated.
    pub(crate) fn max_pipeline_depth_for_conn(&self) -> u32 {
        match self.state {
            PipeliningState::Red => 1,
            PipeliningState::Yellow => PIPELINE_RESTRICTED,
            PipeliningState::Green => PIPELINE_UNLIMITED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `ProtocolError` classifies into the matching red/bad `FeedbackInfo`
    /// bucket (spec §7).
    #[test]
    fn protocol_error_maps_to_feedback_bucket() {
        assert_eq!(FeedbackInfo::from(ProtocolError::VersionTooLow), FeedbackInfo::RedVersionTooLow);
        assert_eq!(FeedbackInfo::from(ProtocolError::BannedServer), FeedbackInfo::RedBannedServer);
        assert_eq!(FeedbackInfo::from(ProtocolError::CorruptedContent), FeedbackInfo::RedCorruptedContent);
        assert_eq!(FeedbackInfo::from(ProtocolError::CanceledPipeline), FeedbackInfo::RedCanceledPipeline);
        assert_eq!(FeedbackInfo::from(ProtocolError::ExplicitClose), FeedbackInfo::BadExplicitClose);
        assert_eq!(FeedbackInfo::from(ProtocolError::InsufficientFraming), FeedbackInfo::BadInsufficientFraming);
    }

    /// S4 — Pipeline promotion: a depth-3 `GoodCompletedOk` on the elected
    /// `yellowConnection` promotes YELLOW→GREEN with `greenDepth=6`; a second
    /// one raises it to 1024.
    #[test]
    fn s4_pipeline_promotion() {
        let now = Instant::now();
        let mut gov = PipelineGovernor::new(now, false);
        assert_eq!(gov.state(), PipeliningState::Yellow);
        gov.set_yellow_connection(7);

        gov.on_feedback(FeedbackInfo::GoodCompletedOk, Some(7), 3, None, now);
        assert_eq!(gov.state(), PipeliningState::Green);
        assert_eq!(gov.max_pipeline_depth(Classification::MaybeSpeculative), PIPELINE_OPEN);
        assert!(gov.yellow_connection().is_none());

        gov.on_feedback(FeedbackInfo::GoodCompletedOk, Some(7), 3, None, now);
        assert_eq!(gov.max_pipeline_depth(Classification::MaybeSpeculative), PIPELINE_UNLIMITED);
    }

    /// A `GoodCompletedOk` that doesn't reach depth 3 does not promote.
    #[test]
    fn shallow_pipeline_does_not_promote() {
        let now = Instant::now();
        let mut gov = PipelineGovernor::new(now, false);
        gov.set_yellow_connection(1);
        gov.on_feedback(FeedbackInfo::GoodCompletedOk, Some(1), 2, None, now);
        assert_eq!(gov.state(), PipeliningState::Yellow);
    }

    /// S5 — Pipeline collapse: a GREEN entry receiving `RedCorruptedContent`
    /// drops straight to RED, clears `yellowConnection`, and caps depth at 1.
    #[test]
    fn s5_pipeline_collapse() {
        let now = Instant::now();
        let mut gov = PipelineGovernor::new(now, false);
        gov.set_yellow_connection(3);
        gov.on_feedback(FeedbackInfo::GoodCompletedOk, Some(3), 3, None, now);
        assert_eq!(gov.state(), PipeliningState::Green);

        gov.on_feedback(FeedbackInfo::RedCorruptedContent, None, 0, None, now);
        assert_eq!(gov.state(), PipeliningState::Red);
        assert!(gov.yellow_connection().is_none());
        assert_eq!(gov.max_pipeline_depth(Classification::MaybeSpeculative), 1);
    }

    /// Invariant 6 — pipeline monotonicity: RED never transitions straight
    /// to GREEN; it needs decay back to YELLOW first, and only then can a
    /// fresh depth-3 success promote it.
    #[test]
    fn red_requires_decay_before_reentering_yellow() {
        let t0 = Instant::now();
        let mut gov = PipelineGovernor::new(t0, false);
        gov.on_feedback(FeedbackInfo::RedCorruptedContent, None, 0, None, t0);
        assert_eq!(gov.state(), PipeliningState::Red);

        // Immediately after, with no elapsed time, credit_penalty can't have
        // decayed anything yet.
        gov.credit_penalty(t0);
        assert_eq!(gov.state(), PipeliningState::Red);

        // Let enough wall time pass for the penalty to fully decay.
        let later = t0 + Duration::from_secs(PENALTY_LARGE as u64 + 1);
        gov.credit_penalty(later);
        assert_eq!(gov.state(), PipeliningState::Yellow);
    }

    /// Invariant 7 — yellow exclusivity: only one connection is ever the
    /// elected probe while YELLOW.
    #[test]
    fn yellow_exclusivity() {
        let now = Instant::now();
        let mut gov = PipelineGovernor::new(now, false);
        gov.set_yellow_connection(1);
        assert_eq!(gov.yellow_connection(), Some(1));
        // Electing a second candidate must replace, not add to, the single slot.
        gov.set_yellow_connection(2);
        assert_eq!(gov.yellow_connection(), Some(2));
    }

    #[test]
    fn banned_server_never_decays() {
        let t0 = Instant::now();
        let mut gov = PipelineGovernor::new(t0, false);
        gov.on_feedback(FeedbackInfo::RedBannedServer, None, 0, None, t0);
        let later = t0 + Duration::from_secs(10_000);
        gov.credit_penalty(later);
        assert_eq!(gov.state(), PipeliningState::Red);
    }
}
