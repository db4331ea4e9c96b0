// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded polling against a monotonic clock.
//!
//! Every wait in the lifecycle code is a cooperative poll loop: check a
//! condition, sleep a fixed interval, repeat. A [`Deadline`] bounds the loop;
//! reaching it is an ordinary [`WaitOutcome`], not an error.

use std::time::{Duration, Instant};

/// Source of time for poll loops.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// The real, monotonic clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration)
    }
}

/// A point in time after which a wait gives up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// A deadline `timeout` from now. A zero timeout never expires.
    pub fn after(clock: &dyn Clock, timeout: Duration) -> Self {
        if timeout.is_zero() {
            Self::never()
        } else {
            Self(Some(clock.now() + timeout))
        }
    }

    pub fn never() -> Self {
        Self(None)
    }

    pub fn is_bounded(&self) -> bool {
        self.0.is_some()
    }

    pub fn expired(&self, clock: &dyn Clock) -> bool {
        self.0.is_some_and(|at| clock.now() >= at)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    Reached,
    TimedOut,
}

impl WaitOutcome {
    pub fn reached(self) -> bool {
        self == WaitOutcome::Reached
    }
}

/// Polls `check` every `interval` until it reports true or `deadline`
/// passes.
///
/// `check` receives the number of sleeps taken so far, which lets a caller
/// act periodically between checks.
pub fn poll_until(
    clock: &dyn Clock,
    deadline: Deadline,
    interval: Duration,
    mut check: impl FnMut(u64) -> bool,
) -> WaitOutcome {
    let mut polls = 0;
    loop {
        if check(polls) {
            return WaitOutcome::Reached;
        }
        if deadline.expired(clock) {
            return WaitOutcome::TimedOut;
        }
        clock.sleep(interval);
        polls += 1;
    }
}

#[cfg(test)]
pub(crate) mod test_clock {
    use super::*;
    use std::sync::Mutex;

    /// A clock which only moves when slept on.
    pub(crate) struct FakeClock {
        origin: Instant,
        elapsed: Mutex<Duration>,
    }

    impl FakeClock {
        pub(crate) fn new() -> Self {
            Self { origin: Instant::now(), elapsed: Mutex::new(Duration::ZERO) }
        }

        pub(crate) fn elapsed(&self) -> Duration {
            *self.elapsed.lock().unwrap()
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> Instant {
            self.origin + self.elapsed()
        }

        fn sleep(&self, duration: Duration) {
            *self.elapsed.lock().unwrap() += duration;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_clock::FakeClock;
    use super::*;

    const SEC: Duration = Duration::from_secs(1);

    #[test]
    fn reached_before_deadline() {
        let clock = FakeClock::new();
        let deadline = Deadline::after(&clock, Duration::from_secs(45));
        let res = poll_until(&clock, deadline, SEC, |n| n == 3);
        assert_eq!(res, WaitOutcome::Reached);
        assert_eq!(clock.elapsed(), Duration::from_secs(3));
    }

    #[test]
    fn times_out_at_deadline() {
        let clock = FakeClock::new();
        let deadline = Deadline::after(&clock, Duration::from_secs(10));
        let mut checks = 0;
        let res = poll_until(&clock, deadline, SEC, |_| {
            checks += 1;
            false
        });
        assert_eq!(res, WaitOutcome::TimedOut);
        assert_eq!(clock.elapsed(), Duration::from_secs(10));
        assert_eq!(checks, 11);
    }

    #[test]
    fn zero_timeout_never_expires() {
        let clock = FakeClock::new();
        let deadline = Deadline::after(&clock, Duration::ZERO);
        assert!(!deadline.is_bounded());

        let res = poll_until(&clock, deadline, SEC, |n| n == 10_000);
        assert_eq!(res, WaitOutcome::Reached);
        assert_eq!(clock.elapsed(), Duration::from_secs(10_000));
    }

    #[test]
    fn immediate_success_does_not_sleep() {
        let clock = FakeClock::new();
        let res = poll_until(&clock, Deadline::never(), SEC, |_| true);
        assert!(res.reached());
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }
}
