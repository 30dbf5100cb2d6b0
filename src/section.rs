use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of one independently operated countdown section.
///
/// The valid set of identifiers is fixed and handed to the registry at
/// construction; the engine never invents new ones.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SectionId(pub u32);

impl fmt::Display for SectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of advancing a running section by one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Countdown still in progress; carries the refreshed remaining time.
    Continue(u64),
    /// Countdown reached zero on this tick.
    Finished,
}

/// Per-section countdown state.
///
/// This is a pure state machine over an externally supplied wall clock:
/// no I/O, no tasks. The registry drives it and handles persistence and
/// notification around each transition.
///
/// While running, `remaining_ms` is a cache refreshed on each tick; the
/// absolute `end_timestamp_ms` is the authoritative finish instant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SectionState {
    remaining_ms: u64,
    running: bool,
    end_timestamp_ms: Option<u64>,
    alarm_playing: bool,
}

impl SectionState {
    pub fn remaining_ms(&self) -> u64 {
        self.remaining_ms
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_alarm_playing(&self) -> bool {
        self.alarm_playing
    }

    pub fn end_timestamp_ms(&self) -> Option<u64> {
        self.end_timestamp_ms
    }

    /// Replace the remaining time outright (used when a start command
    /// carries a duration seed, and when restoring a paused section).
    pub fn set_remaining(&mut self, remaining_ms: u64) {
        self.remaining_ms = remaining_ms;
    }

    /// Begin counting down from the current remaining time.
    ///
    /// Returns the absolute end timestamp on success, `None` when the
    /// section is already running or has nothing left to count.
    pub fn begin(&mut self, now_ms: u64) -> Option<u64> {
        if self.running || self.remaining_ms == 0 {
            return None;
        }
        let end = now_ms.saturating_add(self.remaining_ms);
        self.running = true;
        self.end_timestamp_ms = Some(end);
        self.alarm_playing = false;
        Some(end)
    }

    /// Resume a countdown anchored to a previously persisted end timestamp.
    ///
    /// Used by recovery: the original finish instant is preserved rather
    /// than restarting the duration from now. The caller must have checked
    /// that `end_timestamp_ms > now_ms`.
    pub fn resume_anchored(&mut self, end_timestamp_ms: u64, now_ms: u64) -> u64 {
        self.remaining_ms = end_timestamp_ms.saturating_sub(now_ms);
        self.running = true;
        self.end_timestamp_ms = Some(end_timestamp_ms);
        self.alarm_playing = false;
        self.remaining_ms
    }

    /// Stop the countdown, keeping the remaining time. Returns `false`
    /// when the section was not running (a no-op, not an error).
    pub fn pause(&mut self) -> bool {
        if !self.running {
            return false;
        }
        self.running = false;
        self.end_timestamp_ms = None;
        true
    }

    /// Collapse back to the implicit zero state.
    pub fn reset(&mut self) {
        self.remaining_ms = 0;
        self.running = false;
        self.end_timestamp_ms = None;
        self.alarm_playing = false;
    }

    /// Credit extra time. Returns `false` for a zero delta; the command
    /// surface rejects negative deltas before they get here.
    pub fn add_time(&mut self, delta_ms: u64) -> bool {
        if delta_ms == 0 {
            return false;
        }
        self.remaining_ms = self.remaining_ms.saturating_add(delta_ms);
        self.alarm_playing = false;
        true
    }

    /// Advance a running countdown: recompute the remaining time from the
    /// absolute end timestamp and finish if it has been reached.
    pub fn tick(&mut self, now_ms: u64) -> TickOutcome {
        let end = match self.end_timestamp_ms {
            Some(end) => end,
            None => return TickOutcome::Finished,
        };
        let remaining = end.saturating_sub(now_ms);
        if remaining == 0 {
            self.finish();
            TickOutcome::Finished
        } else {
            self.remaining_ms = remaining;
            TickOutcome::Continue(remaining)
        }
    }

    /// Mark the countdown as having reached zero and raise the alarm flag.
    ///
    /// Also used by recovery to finalize a section whose end timestamp
    /// passed while the process was down.
    pub fn finish(&mut self) {
        self.running = false;
        self.remaining_ms = 0;
        self.end_timestamp_ms = None;
        self.alarm_playing = true;
    }

    /// Lower this section's alarm flag. Returns `false` when it was
    /// already down.
    pub fn stop_alarm(&mut self) -> bool {
        let was_playing = self.alarm_playing;
        self.alarm_playing = false;
        was_playing
    }
}
