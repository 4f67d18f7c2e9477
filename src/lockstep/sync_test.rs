//! Drift detection ("sync test")
//!
//! The host periodically checks that every live participant has acknowledged
//! at least as many turns as the group has held consensus for. A participant
//! that falls behind breaks consensus: the shared clock is frozen and the
//! participant's kick countdown starts. Once every live participant catches
//! up the clock is unfrozen.
//!
//! [`SyncTest`] only reads participant records. It hands back a
//! [`SyncReport`] describing what should change and leaves applying it to the
//! coordinator.

use super::{ParticipantId, ParticipantRecord};

/// Turn counts below this are too early to judge: clients are still joining.
pub const MIN_TRIGGER_TURN: u64 = 2;

/// Clock change requested by an evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockDirective {
    Freeze,
    Unfreeze,
}

impl ClockDirective {
    pub fn frozen(self) -> bool {
        self == Self::Freeze
    }
}

/// Outcome of one drift evaluation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub all_synced: bool,
    /// Lagging participants whose kick countdown must start
    pub start_timeouts: Vec<ParticipantId>,
    /// Participants that caught up while timing out
    pub cancel_timeouts: Vec<ParticipantId>,
    /// Set only when the synced state flipped relative to the clock
    pub clock: Option<ClockDirective>,
}

#[derive(Debug, Clone)]
pub struct SyncTest {
    trigger_turn: u64,
    reload_interval: f32,
    timer: f32,
    enabled: bool,
    all_synced: bool,
    synced_turns: u64,
}

impl SyncTest {
    pub fn new(trigger_turn: u64, reload_interval: f32) -> Self {
        Self {
            trigger_turn: trigger_turn.max(MIN_TRIGGER_TURN),
            reload_interval,
            timer: reload_interval,
            enabled: false,
            all_synced: false,
            synced_turns: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn all_synced(&self) -> bool {
        self.all_synced
    }

    /// Number of evaluations during which consensus held
    pub fn synced_turn_count(&self) -> u64 {
        self.synced_turns
    }

    pub fn trigger_turn(&self) -> u64 {
        self.trigger_turn
    }

    /// Everyone starts in consensus once the loading phase is over.
    pub fn on_all_participants_ready(&mut self) {
        self.all_synced = true;
    }

    /// Enable the test once the server reached the trigger turn.
    ///
    /// Returns true on the call that enables it.
    pub fn try_enable(&mut self, server_turn: u64) -> bool {
        if self.enabled || server_turn < self.trigger_turn {
            return false;
        }
        self.enabled = true;
        self.timer = self.reload_interval;
        true
    }

    /// Advance the sample timer. Returns true when an evaluation is due.
    pub fn advance(&mut self, delta: f32) -> bool {
        if !self.enabled {
            return false;
        }
        self.timer -= delta;
        self.timer <= 0.0
    }

    /// Evaluate consensus over `participants`.
    ///
    /// `clock_frozen` is the clock's current state; a freeze or unfreeze is
    /// requested only when it disagrees with the outcome. Returns `None` while
    /// the test is not enabled.
    pub fn evaluate<'a, I>(&mut self, participants: I, clock_frozen: bool) -> Option<SyncReport>
    where
        I: IntoIterator<Item = &'a ParticipantRecord>,
    {
        if !self.enabled {
            return None;
        }

        let mut report = SyncReport {
            all_synced: true,
            ..SyncReport::default()
        };

        for record in participants {
            if record.is_disconnected() {
                continue;
            }

            if record.last_acknowledged_turn() < self.synced_turns {
                report.all_synced = false;
                if !record.is_timing_out() {
                    report.start_timeouts.push(record.participant_id());
                }
            } else if record.is_timing_out() {
                report.cancel_timeouts.push(record.participant_id());
            }
        }

        self.all_synced = report.all_synced;

        if report.all_synced == clock_frozen {
            report.clock = Some(if report.all_synced {
                ClockDirective::Unfreeze
            } else {
                ClockDirective::Freeze
            });
        }

        if report.all_synced {
            self.synced_turns += 1;
        }

        self.timer = self.reload_interval;
        Some(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: ParticipantId, acked: u64) -> ParticipantRecord {
        let mut record = ParticipantRecord::new(id);
        for _ in 0..acked {
            record.acknowledge_turn(u64::MAX);
        }
        record
    }

    fn enabled_test(synced_turns: u64) -> SyncTest {
        let mut test = SyncTest::new(2, 0.6);
        test.on_all_participants_ready();
        assert!(test.try_enable(2));
        test.synced_turns = synced_turns;
        test
    }

    #[test]
    fn trigger_turn_has_a_floor() {
        let test = SyncTest::new(0, 0.6);
        assert_eq!(test.trigger_turn(), MIN_TRIGGER_TURN);
    }

    #[test]
    fn disabled_until_trigger_turn() {
        let mut test = SyncTest::new(3, 0.6);
        assert!(!test.try_enable(2));
        assert!(!test.advance(10.0));
        assert!(test.evaluate(std::iter::empty::<&ParticipantRecord>(), false).is_none());

        assert!(test.try_enable(3));
        assert!(!test.try_enable(4));
        assert!(test.is_enabled());
    }

    #[test]
    fn timer_fires_after_reload_interval() {
        let mut test = enabled_test(0);
        assert!(!test.advance(0.5));
        assert!(test.advance(0.2));
        test.evaluate(std::iter::empty::<&ParticipantRecord>(), false);
        assert!(!test.advance(0.5));
    }

    #[test]
    fn consensus_increments_synced_turns() {
        let mut test = enabled_test(0);
        let participants = vec![record(0, 1), record(1, 1)];

        let report = test.evaluate(&participants, false).unwrap();
        assert!(report.all_synced);
        assert_eq!(report.clock, None);
        assert_eq!(test.synced_turn_count(), 1);
    }

    #[test]
    fn lagging_participant_freezes_and_starts_timeout() {
        let mut test = enabled_test(4);
        let participants = vec![record(0, 6), record(1, 3), record(2, 6)];

        let report = test.evaluate(&participants, false).unwrap();
        assert!(!report.all_synced);
        assert_eq!(report.start_timeouts, vec![1]);
        assert_eq!(report.clock, Some(ClockDirective::Freeze));
        assert_eq!(test.synced_turn_count(), 4);
    }

    #[test]
    fn repeated_evaluation_is_idempotent() {
        let mut test = enabled_test(4);
        let mut participants = vec![record(0, 6), record(1, 3)];

        let first = test.evaluate(&participants, false).unwrap();
        assert_eq!(first.clock, Some(ClockDirective::Freeze));
        participants[1].start_timeout(5.0);

        let second = test.evaluate(&participants, true).unwrap();
        assert_eq!(second.all_synced, first.all_synced);
        assert_eq!(second.clock, None);
        assert!(second.start_timeouts.is_empty());
    }

    #[test]
    fn caught_up_participant_cancels_timeout_and_unfreezes() {
        let mut test = enabled_test(4);
        let mut laggard = record(1, 4);
        laggard.start_timeout(5.0);
        let participants = vec![record(0, 6), laggard];

        let report = test.evaluate(&participants, true).unwrap();
        assert!(report.all_synced);
        assert_eq!(report.cancel_timeouts, vec![1]);
        assert_eq!(report.clock, Some(ClockDirective::Unfreeze));
        assert_eq!(test.synced_turn_count(), 5);
    }

    #[test]
    fn disconnected_participants_are_ignored() {
        let mut test = enabled_test(4);
        let mut gone = record(1, 0);
        gone.mark_disconnected();
        let participants = vec![record(0, 6), gone];

        let report = test.evaluate(&participants, false).unwrap();
        assert!(report.all_synced);
        assert!(report.start_timeouts.is_empty());
        assert!(report.cancel_timeouts.is_empty());
    }
}
