//! Append-only experiment event log with timestamp queries.
//!
//! Every external happening that must be alignable with pupil records goes
//! through here: trial increments and resets, free-form messages, camera
//! temperature checks. Reads run concurrently; writers are serialized. The
//! log can be serialized to an XML snapshot and replayed against recorded
//! image archives.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

pub type Result<M> = std::result::Result<M, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("xml error: {source}")]
    Xml {
        #[from]
        source: serde_xml_rs::Error,
    },
    #[error("malformed event log entry: {0}")]
    MalformedEntry(String),
}

mod offline_log;

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    TrialIncrement,
    TrialReset,
    Message(String),
    /// one temperature per physical camera, degrees C
    TemperatureCheck(Vec<f64>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub timestamp_ms: i64,
    pub kind: EventKind,
}

/// Outcome of [EventTracker::reset_trial_counter].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    Accepted,
    /// A data writer or streamer was active; the reset was ignored so
    /// already-open sinks keep a consistent trial axis.
    Refused,
}

struct Record {
    event: Event,
    /// trial number in force after this event
    trial_after: u64,
}

#[derive(Default)]
pub struct EventTracker {
    log: RwLock<Vec<Record>>,
    active_writers: AtomicUsize,
}

impl EventTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn append(&self, timestamp_ms: i64, kind: EventKind) {
        let mut log = self.log.write();
        // clamp under the write lock so the log stays non-decreasing
        // despite clock jitter between committing threads
        let timestamp_ms = match log.last() {
            Some(last) if timestamp_ms < last.event.timestamp_ms => last.event.timestamp_ms,
            _ => timestamp_ms,
        };
        let prev_trial = log.last().map(|r| r.trial_after).unwrap_or(0);
        let trial_after = match &kind {
            EventKind::TrialIncrement => prev_trial + 1,
            EventKind::TrialReset => 0,
            _ => prev_trial,
        };
        log.push(Record {
            event: Event { timestamp_ms, kind },
            trial_after,
        });
    }

    pub fn add_trial_increment(&self, t: i64) {
        self.append(t, EventKind::TrialIncrement);
        debug!("trial incremented to {}", self.current_trial());
    }

    /// Reset the trial counter to 0, refused while any writer or streamer
    /// holds a [WriterGuard].
    pub fn reset_trial_counter(&self, t: i64) -> ResetOutcome {
        if self.active_writers.load(Ordering::SeqCst) > 0 {
            warn!("trial reset refused: writer or streamer active");
            return ResetOutcome::Refused;
        }
        self.append(t, EventKind::TrialReset);
        ResetOutcome::Accepted
    }

    pub fn add_message(&self, t: i64, text: &str) {
        self.append(t, EventKind::Message(text.to_string()));
    }

    pub fn add_temperature_check(&self, t: i64, temps: &[f64]) {
        self.append(t, EventKind::TemperatureCheck(temps.to_vec()));
    }

    /// Trial number in force at time `t`: the effect of the last trial
    /// event committed at or before `t`.
    pub fn trial_number_at(&self, t: i64) -> u64 {
        let log = self.log.read();
        let idx = log.partition_point(|r| r.event.timestamp_ms <= t);
        if idx == 0 {
            0
        } else {
            log[idx - 1].trial_after
        }
    }

    pub fn current_trial(&self) -> u64 {
        self.log.read().last().map(|r| r.trial_after).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.log.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.read().is_empty()
    }

    /// Snapshot of the events committed in `[t_start, t_end]`.
    pub fn events_between(&self, t_start: i64, t_end: i64) -> Vec<Event> {
        self.log
            .read()
            .iter()
            .filter(|r| r.event.timestamp_ms >= t_start && r.event.timestamp_ms <= t_end)
            .map(|r| r.event.clone())
            .collect()
    }

    /// Serialize the `[t_start, t_end]` window to an XML snapshot.
    pub fn save_offline_log(
        &self,
        t_start: i64,
        t_end: i64,
        path: &std::path::Path,
    ) -> Result<()> {
        offline_log::save(&self.events_between(t_start, t_end), path)
    }

    /// Replace the in-memory log from a prior XML snapshot.
    ///
    /// Used by file playback to replay the trial alignment of the original
    /// recording. Trial numbers are recomputed from the loaded events.
    pub fn load_offline_log(&self, path: &std::path::Path) -> Result<()> {
        let events = offline_log::load(path)?;
        let mut log = self.log.write();
        log.clear();
        let mut trial = 0u64;
        for event in events {
            trial = match &event.kind {
                EventKind::TrialIncrement => trial + 1,
                EventKind::TrialReset => 0,
                _ => trial,
            };
            log.push(Record {
                event,
                trial_after: trial,
            });
        }
        Ok(())
    }

    /// Register an active writer/streamer; trial resets are refused while
    /// any guard is alive.
    pub fn writer_guard(self: &Arc<Self>) -> WriterGuard {
        self.active_writers.fetch_add(1, Ordering::SeqCst);
        WriterGuard {
            tracker: self.clone(),
        }
    }
}

pub struct WriterGuard {
    tracker: Arc<EventTracker>,
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        self.tracker.active_writers.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trial_query_honors_increments_and_resets() {
        let tracker = EventTracker::new();
        tracker.add_trial_increment(100);
        tracker.add_trial_increment(200);
        tracker.add_message(250, "stimulus on");
        tracker.add_trial_increment(300);

        assert_eq!(tracker.trial_number_at(50), 0);
        assert_eq!(tracker.trial_number_at(100), 1);
        assert_eq!(tracker.trial_number_at(150), 1);
        assert_eq!(tracker.trial_number_at(250), 2);
        assert_eq!(tracker.trial_number_at(300), 3);
        assert_eq!(tracker.trial_number_at(i64::MAX), 3);

        assert_eq!(tracker.reset_trial_counter(400), ResetOutcome::Accepted);
        assert_eq!(tracker.trial_number_at(400), 0);
        assert_eq!(tracker.trial_number_at(350), 3);
        tracker.add_trial_increment(500);
        assert_eq!(tracker.current_trial(), 1);
    }

    #[test]
    fn query_between_increments_matches_earlier_increment() {
        let tracker = EventTracker::new();
        tracker.add_trial_increment(1000);
        tracker.add_trial_increment(2000);
        for t in [1000, 1250, 1500, 1999] {
            assert_eq!(tracker.trial_number_at(t), tracker.trial_number_at(1000));
        }
    }

    #[test]
    fn reset_refused_while_writer_active() {
        let tracker = EventTracker::shared();
        let guard = tracker.writer_guard();
        assert_eq!(tracker.reset_trial_counter(10), ResetOutcome::Refused);
        assert_eq!(tracker.len(), 0);
        drop(guard);
        assert_eq!(tracker.reset_trial_counter(10), ResetOutcome::Accepted);
    }

    #[test]
    fn jittered_timestamps_are_clamped_monotonic() {
        let tracker = EventTracker::new();
        tracker.add_trial_increment(1000);
        tracker.add_message(997, "slightly in the past");
        let events = tracker.events_between(0, i64::MAX);
        assert_eq!(events[1].timestamp_ms, 1000);
    }

    #[test]
    fn temperature_checks_carry_per_camera_values() {
        let tracker = EventTracker::new();
        tracker.add_temperature_check(5, &[41.5, 39.75]);
        let events = tracker.events_between(0, 10);
        assert_eq!(
            events[0].kind,
            EventKind::TemperatureCheck(vec![41.5, 39.75])
        );
    }
}
