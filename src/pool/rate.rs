//! The 1-second sliding rate window.
//!
//! Dispatches are charged against a counter anchored at `checkpoint`, the
//! first charge of the current window. Re-admissions past the limit park
//! in FIFO order until the window clears: immediately when the checkpoint
//! is already a full second old, otherwise when the window timer fires.
//! This is deliberately the reset-at-first-call heuristic, not a token
//! bucket; bursts up to the limit are admitted back-to-back.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use super::resource::ResourceId;

/// Length of the rate window.
pub(crate) const WINDOW: Duration = Duration::from_secs(1);

/// Outcome of a re-admission check.
#[derive(Debug)]
pub(crate) enum Admission {
    /// Under the limit; the resource proceeds now.
    Admit,
    /// Parked until the window clears. When `arm_timer` is set, no timer
    /// was running and the caller must arm one for the given delay.
    Parked { arm_timer: Option<Duration> },
    /// The window had already lapsed; every parked resource (including
    /// the one just checked) resumes now, in parking order.
    Cleared(Vec<ResourceId>),
}

#[derive(Debug)]
pub(crate) struct RateWindow {
    limit: Option<u32>,
    counter: u32,
    checkpoint: Option<Instant>,
    parked: VecDeque<ResourceId>,
    timer_armed: bool,
}

impl RateWindow {
    pub(crate) fn new(limit: Option<u32>) -> Self {
        Self {
            limit,
            counter: 0,
            checkpoint: None,
            parked: VecDeque::new(),
            timer_armed: false,
        }
    }

    pub(crate) fn enabled(&self) -> bool {
        self.limit.is_some()
    }

    /// Records one dispatch. The first charge of a window anchors its
    /// checkpoint.
    pub(crate) fn charge(&mut self, now: Instant) {
        if self.limit.is_none() {
            return;
        }
        self.counter += 1;
        self.checkpoint.get_or_insert(now);
    }

    /// Checks whether a resource may be re-admitted.
    pub(crate) fn admit(&mut self, id: ResourceId, now: Instant) -> Admission {
        let limit = match self.limit {
            Some(limit) => limit,
            None => return Admission::Admit,
        };

        if self.counter < limit {
            return Admission::Admit;
        }

        self.parked.push_back(id);

        let checkpoint = match self.checkpoint {
            Some(checkpoint) => checkpoint,
            None => now,
        };
        let elapsed = now.saturating_duration_since(checkpoint);
        if elapsed >= WINDOW {
            return Admission::Cleared(self.clear());
        }

        let arm_timer = if self.timer_armed {
            None
        } else {
            self.timer_armed = true;
            Some(WINDOW - elapsed)
        };
        Admission::Parked { arm_timer }
    }

    /// Resets the window and returns the parked resources in FIFO order.
    pub(crate) fn clear(&mut self) -> Vec<ResourceId> {
        self.counter = 0;
        self.checkpoint = None;
        self.timer_armed = false;
        self.parked.drain(..).collect()
    }

    /// Forgets a resource that left the pool while parked.
    pub(crate) fn forget(&mut self, id: ResourceId) {
        self.parked.retain(|parked| *parked != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_window_admits_everything() {
        let mut window = RateWindow::new(None);
        let now = Instant::now();
        window.charge(now);
        assert!(matches!(window.admit(1, now), Admission::Admit));
        assert!(!window.enabled());
    }

    #[test]
    fn admits_until_counter_reaches_limit() {
        let mut window = RateWindow::new(Some(2));
        let now = Instant::now();

        window.charge(now);
        assert!(matches!(window.admit(1, now), Admission::Admit));

        window.charge(now);
        match window.admit(2, now) {
            Admission::Parked { arm_timer: Some(delay) } => {
                assert!(delay <= WINDOW);
            }
            other => panic!("expected first parking to arm the timer: {:?}", other),
        }

        // A second parking while the timer runs must not re-arm it.
        match window.admit(3, now) {
            Admission::Parked { arm_timer: None } => {}
            other => panic!("expected parked without timer: {:?}", other),
        }
    }

    #[test]
    fn lapsed_window_clears_immediately_in_fifo_order() {
        let mut window = RateWindow::new(Some(1));
        let start = Instant::now();

        window.charge(start);
        assert!(matches!(
            window.admit(1, start),
            Admission::Parked { arm_timer: Some(_) }
        ));
        window.charge(start);

        let later = start + WINDOW;
        match window.admit(2, later) {
            Admission::Cleared(ids) => assert_eq!(ids, vec![1, 2]),
            other => panic!("expected cleared window: {:?}", other),
        }

        // Cleared state starts a fresh window with a reset counter.
        assert!(matches!(window.admit(3, later), Admission::Admit));
    }

    #[test]
    fn timer_delay_is_the_window_remainder() {
        let mut window = RateWindow::new(Some(1));
        let start = Instant::now();
        window.charge(start);

        let later = start + Duration::from_millis(400);
        match window.admit(1, later) {
            Admission::Parked { arm_timer: Some(delay) } => {
                assert_eq!(delay, Duration::from_millis(600));
            }
            other => panic!("expected timer for the remainder: {:?}", other),
        }
    }

    #[test]
    fn forget_removes_parked_resource() {
        let mut window = RateWindow::new(Some(1));
        let now = Instant::now();
        window.charge(now);
        window.admit(7, now);
        window.admit(8, now);
        window.forget(7);
        assert_eq!(window.clear(), vec![8]);
    }
}
