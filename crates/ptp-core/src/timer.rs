//! Named countdown timers for the protocol engine.
//!
//! Deadlines live on `Instant` (monotonic), so a step of the disciplined
//! clock never disturbs protocol timing. An expired timer re-arms itself for
//! the next period when polled, like a free-running interval timer.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerId {
    SyncInterval = 0,
    SyncReceipt = 1,
    DelayReqInterval = 2,
    /// Reserved by the v2 peer-delay mechanism; never armed in v1.
    PdelayInterval = 3,
}

const TIMER_COUNT: usize = 4;

#[derive(Debug, Default, Clone, Copy)]
struct IntervalTimer {
    interval: Duration,
    deadline: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct Timers {
    timers: [IntervalTimer; TIMER_COUNT],
}

impl Timers {
    pub fn new() -> Self {
        Timers::default()
    }

    pub fn start(&mut self, id: TimerId, interval: Duration) {
        self.timers[id as usize] = IntervalTimer {
            interval,
            deadline: Some(Instant::now() + interval),
        };
    }

    pub fn stop(&mut self, id: TimerId) {
        self.timers[id as usize].deadline = None;
    }

    pub fn expired(&mut self, id: TimerId) -> bool {
        self.expired_at(id, Instant::now())
    }

    fn expired_at(&mut self, id: TimerId, now: Instant) -> bool {
        let t = &mut self.timers[id as usize];
        match t.deadline {
            Some(deadline) if deadline <= now => {
                t.deadline = Some(now + t.interval);
                true
            }
            _ => false,
        }
    }

    /// Time until the nearest armed deadline; the event loop's select
    /// timeout. `None` when no timer is armed.
    pub fn time_to_next(&self) -> Option<Duration> {
        let now = Instant::now();
        self.timers
            .iter()
            .filter_map(|t| t.deadline)
            .map(|d| d.saturating_duration_since(now))
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expired_rearms() {
        let mut timers = Timers::new();
        let now = Instant::now();
        timers.start(TimerId::SyncInterval, Duration::from_secs(2));

        assert!(!timers.expired_at(TimerId::SyncInterval, now));
        let later = now + Duration::from_secs(3);
        assert!(timers.expired_at(TimerId::SyncInterval, later));
        // re-armed relative to the poll instant
        assert!(!timers.expired_at(TimerId::SyncInterval, later + Duration::from_secs(1)));
        assert!(timers.expired_at(TimerId::SyncInterval, later + Duration::from_secs(2)));
    }

    #[test]
    fn test_stopped_never_expires() {
        let mut timers = Timers::new();
        timers.start(TimerId::SyncReceipt, Duration::from_millis(1));
        timers.stop(TimerId::SyncReceipt);
        let later = Instant::now() + Duration::from_secs(10);
        assert!(!timers.expired_at(TimerId::SyncReceipt, later));
    }

    #[test]
    fn test_time_to_next_picks_minimum() {
        let mut timers = Timers::new();
        assert!(timers.time_to_next().is_none());
        timers.start(TimerId::SyncInterval, Duration::from_secs(8));
        timers.start(TimerId::SyncReceipt, Duration::from_secs(2));
        let next = timers.time_to_next().unwrap();
        assert!(next <= Duration::from_secs(2));
        assert!(next > Duration::from_secs(1));
    }
}
