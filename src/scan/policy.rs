//! Motion-based termination policy.
//!
//! Pure decision logic over the position sequence of a running scan. The
//! orchestrator owns the cross-tick state (a [`MotionTracker`]); the rules
//! themselves live here so they can be exercised without any hardware or
//! tasks.

/// Why the tick loop should stop, or that it should not.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Keep scanning
    Continue,
    /// Carriage reached the end of the usable track
    EndOfTrack,
    /// Carriage has not moved for the configured number of ticks
    Stationary,
    /// An external cancel request was observed
    Cancelled,
}

/// Per-scan position history carried across ticks by the orchestrator.
#[derive(Clone, Debug, Default)]
pub struct MotionTracker {
    last_position: Option<f64>,
    stationary_ticks: u32,
}

impl MotionTracker {
    /// Consecutive ticks the carriage has been within epsilon of its
    /// previous position.
    pub fn stationary_ticks(&self) -> u32 {
        self.stationary_ticks
    }
}

/// Stop-condition configuration for one scan.
#[derive(Clone, Copy, Debug)]
pub struct StopPolicy {
    /// Upper travel limit of the axis, in the working length unit
    pub axis_max: f64,
    /// Fraction of `axis_max` at which the scan ends
    pub end_fraction: f64,
    /// Position change below which a tick counts as stationary
    pub stationary_epsilon: f64,
    /// Consecutive stationary ticks before stopping
    pub stationary_threshold: u32,
}

impl StopPolicy {
    /// Evaluate the stop conditions for one tick.
    ///
    /// Precedence: external cancellation first, then end-of-track on the
    /// newest position only, then the stationary counter. A tick without a
    /// position (encoder had nothing cached yet) neither stops the scan nor
    /// touches the tracker.
    ///
    /// The first observed position opens a stationary run, so a carriage
    /// that never moves trips the threshold after exactly
    /// `stationary_threshold` positions. Any step of at least epsilon
    /// resets the counter to zero.
    pub fn evaluate(
        &self,
        cancelled: bool,
        position: Option<f64>,
        tracker: &mut MotionTracker,
    ) -> Verdict {
        if cancelled {
            return Verdict::Cancelled;
        }

        let Some(position) = position else {
            return Verdict::Continue;
        };

        if position >= self.end_fraction * self.axis_max {
            return Verdict::EndOfTrack;
        }

        let stationary = match tracker.last_position {
            None => true,
            Some(previous) => (position - previous).abs() < self.stationary_epsilon,
        };
        if stationary {
            tracker.stationary_ticks += 1;
        } else {
            tracker.stationary_ticks = 0;
        }
        tracker.last_position = Some(position);

        if tracker.stationary_ticks >= self.stationary_threshold {
            Verdict::Stationary
        } else {
            Verdict::Continue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> StopPolicy {
        StopPolicy {
            axis_max: 50.0,
            end_fraction: 0.98,
            stationary_epsilon: 0.001,
            stationary_threshold: 5,
        }
    }

    #[test]
    fn end_of_track_at_98_percent() {
        let policy = policy();
        let mut tracker = MotionTracker::default();
        assert_eq!(
            policy.evaluate(false, Some(49.0), &mut tracker),
            Verdict::EndOfTrack
        );

        let mut tracker = MotionTracker::default();
        assert_eq!(
            policy.evaluate(false, Some(48.9), &mut tracker),
            Verdict::Continue
        );
    }

    #[test]
    fn stationary_after_five_still_positions() {
        let policy = policy();
        let mut tracker = MotionTracker::default();
        let positions = [10.0, 10.0005, 10.0003, 10.0008, 10.0002];

        for (i, &p) in positions.iter().enumerate() {
            let verdict = policy.evaluate(false, Some(p), &mut tracker);
            if i < positions.len() - 1 {
                assert_eq!(verdict, Verdict::Continue, "tick {i}");
            } else {
                assert_eq!(verdict, Verdict::Stationary, "tick {i}");
            }
        }
    }

    #[test]
    fn movement_resets_the_counter() {
        let policy = policy();
        let mut tracker = MotionTracker::default();

        for &p in &[10.0, 10.0005, 10.0003, 10.0008] {
            assert_eq!(policy.evaluate(false, Some(p), &mut tracker), Verdict::Continue);
        }
        assert_eq!(tracker.stationary_ticks(), 4);

        // A step of one epsilon or more clears the run
        assert_eq!(
            policy.evaluate(false, Some(10.01), &mut tracker),
            Verdict::Continue
        );
        assert_eq!(tracker.stationary_ticks(), 0);

        // And five more still positions are needed to stop again
        for &p in &[10.0101, 10.0102, 10.0103, 10.0104] {
            assert_eq!(policy.evaluate(false, Some(p), &mut tracker), Verdict::Continue);
        }
        assert_eq!(
            policy.evaluate(false, Some(10.0105), &mut tracker),
            Verdict::Stationary
        );
    }

    #[test]
    fn cancellation_wins_over_everything() {
        let policy = policy();
        let mut tracker = MotionTracker::default();
        assert_eq!(
            policy.evaluate(true, Some(49.5), &mut tracker),
            Verdict::Cancelled
        );
        assert_eq!(policy.evaluate(true, None, &mut tracker), Verdict::Cancelled);
    }

    #[test]
    fn missing_position_does_not_touch_the_tracker() {
        let policy = policy();
        let mut tracker = MotionTracker::default();
        assert_eq!(policy.evaluate(false, Some(10.0), &mut tracker), Verdict::Continue);
        assert_eq!(policy.evaluate(false, None, &mut tracker), Verdict::Continue);
        assert_eq!(tracker.stationary_ticks(), 1);
    }
}
