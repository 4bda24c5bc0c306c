use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::attendance::domain::presence_event::EventType;
use crate::recognition::domain::gallery::IdentityKey;

/// Last emitted event of one identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceState {
    pub last_event: EventType,
    pub at: DateTime<Utc>,
}

/// Per-identity debounce with enter/exit alternation.
///
/// An identity seen continuously produces at most one event per interval,
/// and consecutive events alternate starting with `Enter`.
pub struct AttendanceDebouncer {
    interval: TimeDelta,
    states: Mutex<HashMap<IdentityKey, AttendanceState>>,
}

impl AttendanceDebouncer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: TimeDelta::from_std(interval).unwrap_or(TimeDelta::MAX),
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn interval(&self) -> TimeDelta {
        self.interval
    }

    /// Returns the event to emit for a sighting at `now`, recording it, or
    /// `None` if the identity's previous event is less than one interval
    /// old (or later than `now`).
    pub fn evaluate(&self, identity: &IdentityKey, now: DateTime<Utc>) -> Option<EventType> {
        let mut states = self.states();
        let next = match states.get(identity) {
            None => EventType::Enter,
            Some(state) => {
                if now < state.at || now - state.at < self.interval {
                    return None;
                }
                state.last_event.flipped()
            }
        };
        states.insert(
            identity.clone(),
            AttendanceState {
                last_event: next,
                at: now,
            },
        );
        Some(next)
    }

    /// Seeds state from persisted history. A state already held that is
    /// newer than `state` wins.
    pub fn restore(&self, identity: IdentityKey, state: AttendanceState) {
        let mut states = self.states();
        match states.get(&identity) {
            Some(current) if current.at >= state.at => {}
            _ => {
                states.insert(identity, state);
            }
        }
    }

    pub fn state(&self, identity: &IdentityKey) -> Option<AttendanceState> {
        self.states().get(identity).copied()
    }

    fn states(&self) -> MutexGuard<'_, HashMap<IdentityKey, AttendanceState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    const FIVE_MIN: Duration = Duration::from_secs(300);

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    fn at_min(minutes: i64) -> DateTime<Utc> {
        t0() + TimeDelta::minutes(minutes)
    }

    fn alice() -> IdentityKey {
        IdentityKey::new("1", "alice")
    }

    #[test]
    fn test_enter_then_suppressed_then_exit() {
        let debouncer = AttendanceDebouncer::new(FIVE_MIN);
        assert_eq!(debouncer.evaluate(&alice(), at_min(0)), Some(EventType::Enter));
        assert_eq!(debouncer.evaluate(&alice(), at_min(2)), None);
        assert_eq!(debouncer.evaluate(&alice(), at_min(6)), Some(EventType::Exit));
    }

    #[test]
    fn test_events_alternate_starting_with_enter() {
        let debouncer = AttendanceDebouncer::new(FIVE_MIN);
        let emitted: Vec<EventType> = (0..5)
            .filter_map(|i| debouncer.evaluate(&alice(), at_min(i * 5)))
            .collect();
        assert_eq!(
            emitted,
            vec![
                EventType::Enter,
                EventType::Exit,
                EventType::Enter,
                EventType::Exit,
                EventType::Enter
            ]
        );
    }

    #[test]
    fn test_exactly_one_interval_later_emits() {
        let debouncer = AttendanceDebouncer::new(FIVE_MIN);
        debouncer.evaluate(&alice(), at_min(0));
        let almost = at_min(5) - TimeDelta::milliseconds(1);
        assert_eq!(debouncer.evaluate(&alice(), almost), None);
        assert_eq!(debouncer.evaluate(&alice(), at_min(5)), Some(EventType::Exit));
    }

    #[test]
    fn test_dense_sightings_respect_interval_bound() {
        let debouncer = AttendanceDebouncer::new(FIVE_MIN);
        let duration_secs = 3600i64;
        let mut emitted_at = Vec::new();
        for s in (0..duration_secs).step_by(7) {
            let now = t0() + TimeDelta::seconds(s);
            if debouncer.evaluate(&alice(), now).is_some() {
                emitted_at.push(now);
            }
        }

        let bound = (duration_secs as f64 / 300.0).ceil() as usize;
        assert!(emitted_at.len() <= bound);
        assert!(emitted_at
            .windows(2)
            .all(|w| w[1] - w[0] >= TimeDelta::minutes(5)));
    }

    #[test]
    fn test_identities_are_independent() {
        let debouncer = AttendanceDebouncer::new(FIVE_MIN);
        let bob = IdentityKey::new("2", "bob");
        assert_eq!(debouncer.evaluate(&alice(), at_min(0)), Some(EventType::Enter));
        assert_eq!(debouncer.evaluate(&bob, at_min(1)), Some(EventType::Enter));
        assert_eq!(debouncer.state(&bob).unwrap().at, at_min(1));
    }

    #[test]
    fn test_clock_going_backwards_is_suppressed() {
        let debouncer = AttendanceDebouncer::new(FIVE_MIN);
        debouncer.evaluate(&alice(), at_min(30));
        assert_eq!(debouncer.evaluate(&alice(), at_min(0)), None);
        assert_eq!(debouncer.state(&alice()).unwrap().at, at_min(30));
    }

    #[test]
    fn test_restored_state_continues_alternation() {
        let debouncer = AttendanceDebouncer::new(FIVE_MIN);
        debouncer.restore(
            alice(),
            AttendanceState {
                last_event: EventType::Enter,
                at: at_min(0),
            },
        );
        assert_eq!(debouncer.evaluate(&alice(), at_min(3)), None);
        assert_eq!(debouncer.evaluate(&alice(), at_min(6)), Some(EventType::Exit));
    }

    #[test]
    fn test_restore_keeps_newer_state() {
        let debouncer = AttendanceDebouncer::new(FIVE_MIN);
        debouncer.evaluate(&alice(), at_min(10));
        debouncer.restore(
            alice(),
            AttendanceState {
                last_event: EventType::Exit,
                at: at_min(0),
            },
        );
        assert_eq!(debouncer.state(&alice()).unwrap().last_event, EventType::Enter);
    }

    #[test]
    fn test_concurrent_sightings_emit_once() {
        let debouncer = Arc::new(AttendanceDebouncer::new(FIVE_MIN));
        let now = at_min(0);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let debouncer = Arc::clone(&debouncer);
                std::thread::spawn(move || debouncer.evaluate(&alice(), now))
            })
            .collect();

        let emitted = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .count();
        assert_eq!(emitted, 1);
    }
}
