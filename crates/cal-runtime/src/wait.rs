//! Waiting on completion tokens
//!
//! The vendor runtime only offers a non-blocking "is this event done?" query. [`Waiter`]
//! turns that into a blocking wait with an optional deadline. Between polls it behaves
//! according to the configured [`PollStrategy`], and once a wait has been pending longer
//! than the slow-wait threshold it logs a warning, repeated at most every 30 seconds.
//!
//! Completion is only ever reported after the runtime itself reports `Done`.

use std::time::{Duration, Instant};

use crate::config::{PollStrategy, RuntimeConfig};
use crate::driver::{ContextId, Driver, DriverError, DriverResult, EventId, EventStatus};

const SLOW_WAIT_REPEAT: Duration = Duration::from_secs(30);

/// Something whose completion can be polled
pub trait CompletionChecker {
    /// Runtime operation that produced the pending work
    fn operation(&self) -> &'static str;

    /// `Ok(true)` once complete, `Ok(false)` while pending
    fn is_complete(&self) -> DriverResult<bool>;
}

/// Completion token of a copy or program run in one context
pub struct EventChecker<'a> {
    driver: &'a dyn Driver,
    context: ContextId,
    event: EventId,
    operation: &'static str,
}

impl<'a> EventChecker<'a> {
    pub fn new(driver: &'a dyn Driver, context: ContextId, event: EventId, operation: &'static str) -> Self {
        Self {
            driver,
            context,
            event,
            operation,
        }
    }
}

impl CompletionChecker for EventChecker<'_> {
    fn operation(&self) -> &'static str {
        self.operation
    }

    fn is_complete(&self) -> DriverResult<bool> {
        match self.driver.event_status(self.context, self.event)? {
            EventStatus::Pending => Ok(false),
            EventStatus::Done => Ok(true),
            EventStatus::Error(message) => Err(DriverError::new(self.operation, message)),
        }
    }
}

/// Polls and time spent in one wait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WaitStats {
    /// Status queries issued, including the one that observed completion
    pub polls: u64,
    pub elapsed: Duration,
}

/// Result of a wait that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Completed(WaitStats),
    /// The deadline passed while the work was still pending
    TimedOut(WaitStats),
}

/// Blocking wait over a [`CompletionChecker`]
#[derive(Debug, Clone, Copy)]
pub struct Waiter {
    poll: PollStrategy,
    slow_after: Duration,
}

impl Waiter {
    pub fn new(poll: PollStrategy, slow_after: Duration) -> Self {
        Self { poll, slow_after }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(config.poll, config.slow_wait_warning)
    }

    /// Poll until complete
    pub fn wait(&self, checker: &dyn CompletionChecker) -> DriverResult<WaitStats> {
        match self.wait_until(checker, None)? {
            WaitOutcome::Completed(stats) | WaitOutcome::TimedOut(stats) => Ok(stats),
        }
    }

    /// Poll until complete or until `timeout` has elapsed
    ///
    /// A zero timeout still polls once.
    pub fn wait_until(&self, checker: &dyn CompletionChecker, timeout: Option<Duration>) -> DriverResult<WaitOutcome> {
        let started = Instant::now();
        let mut polls = 0u64;
        let mut last_warned: Option<Instant> = None;

        loop {
            polls += 1;
            if checker.is_complete()? {
                let stats = WaitStats {
                    polls,
                    elapsed: started.elapsed(),
                };
                cal_tracing::performance::record_wait(checker.operation(), polls, stats.elapsed.as_micros() as u64);
                return Ok(WaitOutcome::Completed(stats));
            }

            let elapsed = started.elapsed();
            if timeout.is_some_and(|limit| elapsed >= limit) {
                return Ok(WaitOutcome::TimedOut(WaitStats { polls, elapsed }));
            }

            if elapsed > self.slow_after && last_warned.is_none_or(|at| at.elapsed() > SLOW_WAIT_REPEAT) {
                tracing::warn!(
                    operation = checker.operation(),
                    elapsed_secs = elapsed.as_secs(),
                    polls,
                    "completion still pending"
                );
                last_warned = Some(Instant::now());
            }

            self.poll.pause();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct Countdown {
        remaining: Cell<u32>,
        fail: bool,
    }

    impl CompletionChecker for Countdown {
        fn operation(&self) -> &'static str {
            "calCtxRunProgram"
        }

        fn is_complete(&self) -> DriverResult<bool> {
            if self.fail {
                return Err(DriverError::new("calCtxRunProgram", "device lost"));
            }
            let left = self.remaining.get();
            if left == 0 {
                return Ok(true);
            }
            self.remaining.set(left - 1);
            Ok(false)
        }
    }

    fn waiter() -> Waiter {
        Waiter::new(PollStrategy::Spin, Duration::from_secs(60))
    }

    #[test]
    fn counts_polls_until_done() {
        let checker = Countdown {
            remaining: Cell::new(3),
            fail: false,
        };
        let stats = waiter().wait(&checker).unwrap();
        assert_eq!(stats.polls, 4);
    }

    #[test]
    fn deadline_reports_timeout_without_completion() {
        let checker = Countdown {
            remaining: Cell::new(u32::MAX),
            fail: false,
        };
        let outcome = waiter().wait_until(&checker, Some(Duration::ZERO)).unwrap();
        assert!(matches!(outcome, WaitOutcome::TimedOut(WaitStats { polls: 1, .. })));
    }

    #[test]
    fn status_errors_propagate() {
        let checker = Countdown {
            remaining: Cell::new(0),
            fail: true,
        };
        let err = waiter().wait(&checker).unwrap_err();
        assert_eq!(err.operation, "calCtxRunProgram");
    }
}
