//! Buffering of inputs and results between manager turns, and the decision
//! of when to fire the next turn.

use std::time::{Duration, Instant};

use crate::runtime::{InputEntry, QueueCursors};
use crate::tasks::TaskResult;

/// What the manager loop should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnDecision {
    Fire,
    /// Nothing is ready yet; re-check after this long (or when woken).
    Wait(Duration),
}

/// Inputs and results read from the logs but not yet committed by a turn.
#[derive(Debug, Default)]
pub struct TurnBuffer {
    pub inputs: Vec<InputEntry>,
    pub results: Vec<TaskResult>,
    /// Log offsets just past the buffered entries.
    pub offsets: QueueCursors,
    last_input_at: Option<Instant>,
    oldest_result_at: Option<Instant>,
}

impl TurnBuffer {
    pub fn new(offsets: QueueCursors) -> Self {
        Self {
            offsets,
            ..Default::default()
        }
    }

    pub fn push_inputs(&mut self, entries: Vec<InputEntry>, next_offset: u64, now: Instant) {
        if !entries.is_empty() {
            self.last_input_at = Some(now);
            self.inputs.extend(entries);
        }
        self.offsets.inputs = self.offsets.inputs.max(next_offset);
    }

    pub fn push_results(&mut self, entries: Vec<TaskResult>, next_offset: u64, now: Instant) {
        if !entries.is_empty() {
            self.oldest_result_at.get_or_insert(now);
            self.results.extend(entries);
        }
        self.offsets.results = self.offsets.results.max(next_offset);
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty() && self.results.is_empty()
    }

    /// Forget the buffered entries once a turn has committed them.
    pub fn clear(&mut self) {
        self.inputs.clear();
        self.results.clear();
        self.last_input_at = None;
        self.oldest_result_at = None;
    }

    pub fn decide(&self, now: Instant, debounce: Duration, max_result_wait: Duration) -> TurnDecision {
        decide(
            self.last_input_at.filter(|_| !self.inputs.is_empty()),
            self.oldest_result_at.filter(|_| !self.results.is_empty()),
            now,
            debounce,
            max_result_wait,
        )
    }
}

/// Fire once inputs have been quiet for `debounce`. With only results
/// pending, fire once the oldest has waited `max_result_wait`. With nothing
/// pending, wait indefinitely (the manager signal wakes the loop).
pub fn decide(
    last_input_at: Option<Instant>,
    oldest_result_at: Option<Instant>,
    now: Instant,
    debounce: Duration,
    max_result_wait: Duration,
) -> TurnDecision {
    if let Some(last) = last_input_at {
        let quiet = now.saturating_duration_since(last);
        return if quiet >= debounce {
            TurnDecision::Fire
        } else {
            TurnDecision::Wait(debounce - quiet)
        };
    }
    if let Some(oldest) = oldest_result_at {
        let waited = now.saturating_duration_since(oldest);
        return if waited >= max_result_wait {
            TurnDecision::Fire
        } else {
            TurnDecision::Wait(max_result_wait - waited)
        };
    }
    TurnDecision::Wait(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::InputRole;

    const DEBOUNCE: Duration = Duration::from_millis(1500);
    const RESULT_WAIT: Duration = Duration::from_secs(10);

    #[test]
    fn idle_waits_forever() {
        assert_eq!(
            decide(None, None, Instant::now(), DEBOUNCE, RESULT_WAIT),
            TurnDecision::Wait(Duration::MAX)
        );
    }

    #[test]
    fn inputs_fire_after_quiet_period() {
        let start = Instant::now();
        assert_eq!(
            decide(Some(start), None, start + Duration::from_millis(500), DEBOUNCE, RESULT_WAIT),
            TurnDecision::Wait(Duration::from_millis(1000))
        );
        assert_eq!(
            decide(Some(start), None, start + DEBOUNCE, DEBOUNCE, RESULT_WAIT),
            TurnDecision::Fire
        );
    }

    #[test]
    fn pending_inputs_hold_back_results() {
        let start = Instant::now();
        let now = start + Duration::from_secs(60);
        assert_eq!(
            decide(Some(now), Some(start), now, DEBOUNCE, RESULT_WAIT),
            TurnDecision::Wait(DEBOUNCE)
        );
    }

    #[test]
    fn results_fire_after_max_wait() {
        let start = Instant::now();
        assert_eq!(
            decide(None, Some(start), start + Duration::from_secs(4), DEBOUNCE, RESULT_WAIT),
            TurnDecision::Wait(Duration::from_secs(6))
        );
        assert_eq!(
            decide(None, Some(start), start + RESULT_WAIT, DEBOUNCE, RESULT_WAIT),
            TurnDecision::Fire
        );
    }

    #[test]
    fn new_input_resets_the_quiet_period() {
        let start = Instant::now();
        let mut buffer = TurnBuffer::new(QueueCursors::default());
        buffer.push_inputs(vec![InputEntry::new("a", InputRole::User)], 10, start);
        let later = start + Duration::from_millis(1000);
        buffer.push_inputs(vec![InputEntry::new("b", InputRole::User)], 20, later);

        assert_eq!(
            buffer.decide(start + DEBOUNCE, DEBOUNCE, RESULT_WAIT),
            TurnDecision::Wait(Duration::from_millis(1000))
        );
        assert_eq!(buffer.offsets.inputs, 20);

        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.offsets.inputs, 20);
        assert_eq!(
            buffer.decide(later, DEBOUNCE, RESULT_WAIT),
            TurnDecision::Wait(Duration::MAX)
        );
    }
}
