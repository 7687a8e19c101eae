//! Blocking wait primitives.
//!
//! Both primitives suspend the calling thread. There is no cancellable
//! variant: callers that need to stop early fold their own stop condition
//! into the predicate (or set the [`Event`] they are waiting on).

use crate::error::{HarnessError, Result};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Default interval between two predicate evaluations.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Poll `predicate` until it returns `true`.
///
/// `timeout = None` waits forever. The last sleep is shortened so that it
/// ends exactly at the deadline; the predicate is evaluated once more there
/// before the wait gives up, so the timeout never fires early.
///
/// Returns the time spent waiting.
///
/// # Errors
///
/// Returns [`HarnessError::Timeout`] naming `description` if the predicate
/// is still false at the deadline.
pub fn wait_for<F>(
    description: &str,
    mut predicate: F,
    timeout: Option<Duration>,
    poll_interval: Duration,
) -> Result<Duration>
where
    F: FnMut() -> bool,
{
    tracing::debug!(description, ?timeout, ?poll_interval, "Waiting");
    let start = Instant::now();
    loop {
        if predicate() {
            let elapsed = start.elapsed();
            tracing::debug!(
                description,
                elapsed_ms = elapsed.as_millis() as u64,
                "Condition satisfied"
            );
            return Ok(elapsed);
        }

        let elapsed = start.elapsed();
        let sleep = match timeout {
            Some(timeout) if elapsed >= timeout => {
                tracing::warn!(description, ?timeout, "Wait timed out");
                return Err(HarnessError::Timeout {
                    description: description.to_string(),
                    timeout,
                });
            }
            Some(timeout) => poll_interval.min(timeout - elapsed),
            None => poll_interval,
        };
        std::thread::sleep(sleep);
    }
}

/// A named flag threads can wait on, set once and optionally cleared.
#[derive(Debug)]
pub struct Event {
    name: String,
    flag: Mutex<bool>,
    signal: Condvar,
}

impl Event {
    /// Create an unset event.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            flag: Mutex::new(false),
            signal: Condvar::new(),
        }
    }

    /// Name used in timeout messages.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set the flag and wake every waiter.
    pub fn set(&self) {
        *self.flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.signal.notify_all();
        tracing::trace!(event = %self.name, "Event set");
    }

    /// Reset the flag.
    pub fn clear(&self) {
        *self.flag.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }

    /// Whether the flag is set.
    pub fn is_set(&self) -> bool {
        *self.flag.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the flag is set or `timeout` passes. Returns the flag.
    pub fn wait(&self, timeout: Duration) -> bool {
        let guard = self.flag.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .signal
            .wait_timeout_while(guard, timeout, |set| !*set)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// Block until `event` is set or the absolute `deadline` passes.
///
/// The remaining budget is computed once, as `deadline - now`, when the
/// call starts.
///
/// # Errors
///
/// Returns [`HarnessError::Timeout`] naming the event.
pub fn wait_for_event(event: &Event, deadline: Instant) -> Result<()> {
    let timeout = deadline.saturating_duration_since(Instant::now());
    tracing::debug!(event = %event.name(), ?timeout, "Waiting for event");
    if event.wait(timeout) {
        return Ok(());
    }
    tracing::warn!(event = %event.name(), ?timeout, "Event wait timed out");
    Err(HarnessError::Timeout {
        description: format!("event '{}'", event.name()),
        timeout,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_immediate_success() {
        let elapsed = wait_for("true", || true, None, DEFAULT_POLL_INTERVAL).unwrap();
        assert!(elapsed < Duration::from_millis(50));
    }

    #[test]
    fn test_timeout_is_never_early() {
        let start = Instant::now();
        let err = wait_for(
            "never",
            || false,
            Some(Duration::from_millis(200)),
            Duration::from_millis(50),
        )
        .unwrap_err();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(200 + 50 + 100));
        assert!(matches!(err, HarnessError::Timeout { ref description, .. } if description == "never"));
    }

    #[test]
    fn test_last_sleep_is_clamped() {
        let start = Instant::now();
        let result = wait_for(
            "never",
            || false,
            Some(Duration::from_millis(100)),
            Duration::from_secs(5),
        );
        assert!(result.is_err());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_predicate_polled_until_true() {
        let mut calls = 0;
        let elapsed = wait_for(
            "third call",
            || {
                calls += 1;
                calls == 3
            },
            Some(Duration::from_secs(5)),
            Duration::from_millis(10),
        )
        .unwrap();
        assert_eq!(calls, 3);
        assert!(elapsed >= Duration::from_millis(20));
    }

    #[test]
    fn test_event_set_from_other_thread() {
        let event = Arc::new(Event::new("ready"));
        let setter = Arc::clone(&event);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            setter.set();
        });
        wait_for_event(&event, Instant::now() + Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
        assert!(event.is_set());
    }

    #[test]
    fn test_event_deadline_in_past() {
        let event = Event::new("never");
        let err = wait_for_event(&event, Instant::now()).unwrap_err();
        assert!(err.to_string().contains("event 'never'"));
    }

    #[test]
    fn test_event_clear() {
        let event = Event::new("flag");
        event.set();
        assert!(event.wait(Duration::ZERO));
        event.clear();
        assert!(!event.is_set());
    }
}
