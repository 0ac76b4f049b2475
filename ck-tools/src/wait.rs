//! The reusable cooperative-wait primitive behind the clone system's
//! `wait()` helper and its `wait_default` instantiation.
//!
//! Every blocking point in the engine (state transitions, DDL pin/wait
//! gates, GTID flush acknowledgement, the task manager's state-change spin)
//! is built on top of this: it releases the caller's mutex while asleep,
//! re-acquires it to re-evaluate the predicate, fires an "alert" callback on
//! a fixed cadence regardless of whether the predicate changed, and reports
//! back whether it left because the predicate was satisfied or because the
//! overall timeout elapsed.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::Error;

/// What the predicate wants the wait loop to do next.
pub enum WaitOutcome {
    /// Condition not yet satisfied, keep sleeping.
    Continue,
    /// Condition satisfied, stop waiting successfully.
    Done,
    /// A fatal condition was observed; stop waiting and propagate.
    Fail(Error),
}

/// Default poll granularity: sleep in 100ms increments.
pub const DEFAULT_SLEEP: Duration = Duration::from_millis(100);
/// Default overall timeout: 30 minutes.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);
/// Default alert cadence: every 5 seconds.
pub const DEFAULT_ALERT_INTERVAL: Duration = Duration::from_secs(5);

/// Result of a [`wait`] call: `Ok(())` if the predicate was satisfied,
/// `Err` carrying a [`ck_api_types::CloneError::Timeout`] if the overall
/// timeout elapsed, or whatever fatal error the predicate raised.
pub fn wait<'a, T, F>(
    guard: MutexGuard<'a, T>,
    mutex: &'a Mutex<T>,
    condvar: &Condvar,
    sleep: Duration,
    timeout: Duration,
    alert_interval: Duration,
    mut cond: F,
) -> Result<MutexGuard<'a, T>, Error>
where
    F: FnMut(&mut T, bool) -> WaitOutcome,
{
    let mut guard = guard;
    let start = Instant::now();
    let mut last_alert = start;

    loop {
        let alert = last_alert.elapsed() >= alert_interval;
        if alert {
            last_alert = Instant::now();
        }

        match cond(&mut guard, alert) {
            WaitOutcome::Done => return Ok(guard),
            WaitOutcome::Fail(err) => return Err(err),
            WaitOutcome::Continue => {}
        }

        if start.elapsed() >= timeout {
            return Err(ck_api_types::CloneError::Timeout(format!(
                "wait exceeded {:?}",
                timeout
            ))
            .into());
        }

        let (g, _timed_out) = condvar
            .wait_timeout(guard, sleep)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard = g;
    }
}

/// `wait_default`: the same primitive with the engine-wide default
/// granularity, timeout, and alert cadence.
pub fn wait_default<'a, T, F>(
    guard: MutexGuard<'a, T>,
    mutex: &'a Mutex<T>,
    condvar: &Condvar,
    cond: F,
) -> Result<MutexGuard<'a, T>, Error>
where
    F: FnMut(&mut T, bool) -> WaitOutcome,
{
    wait(
        guard,
        mutex,
        condvar,
        DEFAULT_SLEEP,
        DEFAULT_TIMEOUT,
        DEFAULT_ALERT_INTERVAL,
        cond,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wait_wakes_on_notify() {
        let pair = Arc::new((Mutex::new(false), Condvar::new()));
        let pair2 = pair.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let (lock, cvar) = &*pair2;
            let mut ready = lock.lock().unwrap();
            *ready = true;
            cvar.notify_all();
        });

        let (lock, cvar) = &*pair;
        let guard = lock.lock().unwrap();
        let result = wait(
            guard,
            lock,
            cvar,
            Duration::from_millis(10),
            Duration::from_secs(5),
            Duration::from_secs(5),
            |ready: &mut bool, _alert| {
                if *ready {
                    WaitOutcome::Done
                } else {
                    WaitOutcome::Continue
                }
            },
        );
        assert!(result.is_ok());
        handle.join().unwrap();
    }

    #[test]
    fn wait_times_out() {
        let mutex = Mutex::new(());
        let cvar = Condvar::new();
        let guard = mutex.lock().unwrap();
        let result = wait(
            guard,
            &mutex,
            &cvar,
            Duration::from_millis(5),
            Duration::from_millis(30),
            Duration::from_secs(5),
            |_: &mut (), _alert| WaitOutcome::Continue,
        );
        assert!(result.is_err());
    }

    #[test]
    fn alert_fires_on_cadence() {
        let mutex = Mutex::new(0u32);
        let cvar = Condvar::new();
        let guard = mutex.lock().unwrap();
        let mut alerts = 0u32;
        let _ = wait(
            guard,
            &mutex,
            &cvar,
            Duration::from_millis(5),
            Duration::from_millis(40),
            Duration::from_millis(10),
            |_count: &mut u32, alert| {
                if alert {
                    alerts += 1;
                }
                WaitOutcome::Continue
            },
        );
        assert!(alerts >= 1);
    }
}
