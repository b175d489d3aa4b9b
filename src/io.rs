//! Aggregate IO reference counting and device start/stop arbitration.
//!
//! Two counters are tracked: every client running IO, and every such client
//! except the distinguished app client. They always satisfy
//! `excluding_app == total || excluding_app == total - 1`.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{EngineError, EngineResult};

/// Edges produced by one start or stop.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IoTransition {
    /// The device went idle -> running (start) or running -> idle (stop).
    pub device_changed: bool,
    /// The excluding-app counter crossed between zero and non-zero.
    pub running_elsewhere_changed: bool,
}

/// Process-wide IO counters.
///
/// Mutated only under the engine's administrative lock; stored as atomics so
/// the IO cycle can read them without locking.
#[derive(Debug, Default)]
pub struct IoCounters {
    total: AtomicU32,
    excluding_app: AtomicU32,
}

impl IoCounters {
    /// Both counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn with_counts(total: u32, excluding_app: u32) -> Self {
        Self {
            total: AtomicU32::new(total),
            excluding_app: AtomicU32::new(excluding_app),
        }
    }

    /// Clients running IO.
    pub fn total(&self) -> u32 {
        self.total.load(Ordering::Acquire)
    }

    /// Clients other than the app client running IO.
    pub fn excluding_app(&self) -> u32 {
        self.excluding_app.load(Ordering::Acquire)
    }

    /// Account for one client starting IO.
    ///
    /// Both counters are checked before either is written, so a failed start
    /// leaves them untouched.
    pub fn start(&self, is_app_client: bool) -> EngineResult<IoTransition> {
        let total = self.total();
        let excluding = self.excluding_app();
        let next_total = total.checked_add(1).ok_or(EngineError::CounterOverflow)?;
        let next_excluding = if is_app_client {
            excluding
        } else {
            excluding.checked_add(1).ok_or(EngineError::CounterOverflow)?
        };

        self.total.store(next_total, Ordering::Release);
        self.excluding_app.store(next_excluding, Ordering::Release);
        self.assert_consistent();

        Ok(IoTransition {
            device_changed: total == 0,
            running_elsewhere_changed: !is_app_client && excluding == 0,
        })
    }

    /// Account for one client stopping IO.
    pub fn stop(&self, is_app_client: bool) -> EngineResult<IoTransition> {
        let total = self.total();
        let excluding = self.excluding_app();
        let next_total = total.checked_sub(1).ok_or(EngineError::CounterUnderflow)?;
        let next_excluding = if is_app_client {
            excluding
        } else {
            excluding.checked_sub(1).ok_or(EngineError::CounterUnderflow)?
        };

        self.total.store(next_total, Ordering::Release);
        self.excluding_app.store(next_excluding, Ordering::Release);
        self.assert_consistent();

        Ok(IoTransition {
            device_changed: next_total == 0,
            running_elsewhere_changed: !is_app_client && next_excluding == 0,
        })
    }

    fn assert_consistent(&self) {
        let total = self.total();
        let excluding = self.excluding_app();
        assert!(
            excluding == total || excluding.checked_add(1) == Some(total),
            "IO counters diverged: total={total} excluding_app={excluding}"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_start_and_last_stop_flip_the_device() {
        let counters = IoCounters::new();
        let first = counters.start(false).unwrap();
        assert!(first.device_changed);
        assert!(first.running_elsewhere_changed);

        let second = counters.start(false).unwrap();
        assert_eq!(second, IoTransition::default());

        assert_eq!(counters.stop(false).unwrap(), IoTransition::default());
        let last = counters.stop(false).unwrap();
        assert!(last.device_changed);
        assert!(last.running_elsewhere_changed);
        assert_eq!(counters.total(), 0);
    }

    #[test]
    fn app_client_does_not_count_as_elsewhere() {
        let counters = IoCounters::new();
        let app = counters.start(true).unwrap();
        assert!(app.device_changed);
        assert!(!app.running_elsewhere_changed);
        assert_eq!((counters.total(), counters.excluding_app()), (1, 0));

        let other = counters.start(false).unwrap();
        assert!(!other.device_changed);
        assert!(other.running_elsewhere_changed);
        assert_eq!((counters.total(), counters.excluding_app()), (2, 1));
    }

    #[test]
    fn overflow_leaves_counters_untouched() {
        let counters = IoCounters::with_counts(u32::MAX, u32::MAX);
        assert_eq!(counters.start(false), Err(EngineError::CounterOverflow));
        assert_eq!(counters.total(), u32::MAX);
    }

    #[test]
    fn underflow_is_reported() {
        let counters = IoCounters::new();
        assert_eq!(counters.stop(false), Err(EngineError::CounterUnderflow));
        assert_eq!(counters.stop(true), Err(EngineError::CounterUnderflow));
    }

    #[test]
    #[should_panic(expected = "IO counters diverged")]
    fn divergent_counters_are_fatal() {
        // Two app clients running would break the relation.
        let counters = IoCounters::with_counts(1, 0);
        let _ = counters.start(true);
    }
}
