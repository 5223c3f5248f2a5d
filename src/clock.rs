//! Time source (C6): abstracts "current wall-clock minute" so the
//! scheduling invariant in `worker` can be driven by a deterministic
//! virtual clock in tests, per spec.md §4.6 / §8.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

pub trait TimeSource: Send + Sync {
    /// Current time, in whole seconds since the Unix epoch.
    fn now_seconds(&self) -> u64;

    /// Blocks the calling thread until `now_seconds() >= target_seconds`,
    /// or until `stop` is flipped — whichever happens first. Returns
    /// `true` if it woke because time advanced, `false` if it woke
    /// because of a stop signal.
    fn sleep_until(&self, target_seconds: u64, stop: &StopSignal) -> bool;
}

/// A cooperative stop flag workers wait on alongside the clock; see
/// `worker::Worker::stop`.
#[derive(Clone)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    pub fn signal(&self) {
        let (lock, cvar) = &*self.inner;
        let mut stopped = lock.lock().unwrap();
        *stopped = true;
        cvar.notify_all();
    }

    pub fn is_signaled(&self) -> bool {
        *self.inner.0.lock().unwrap()
    }

    /// Waits up to `timeout` for a stop signal; returns `true` if one
    /// arrived.
    fn wait_timeout(&self, timeout: std::time::Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let guard = lock.lock().unwrap();
        if *guard {
            return true;
        }
        let (guard, _) = cvar.wait_timeout(guard, timeout).unwrap();
        *guard
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Binds to the system clock and a monotonic-ish sleep (re-checked in
/// a loop so spurious wakeups and clock jumps are harmless, per
/// spec.md §4.4's "resilient to spurious wakeups and clock jumps").
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn now_seconds(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before epoch")
            .as_secs()
    }

    fn sleep_until(&self, target_seconds: u64, stop: &StopSignal) -> bool {
        loop {
            let now = self.now_seconds();
            if now >= target_seconds {
                return true;
            }
            if stop.is_signaled() {
                return false;
            }
            let remaining = target_seconds - now;
            // Re-check at least once a second so a clock jump backward
            // (or forward) is noticed promptly rather than oversleeping.
            let slice = std::cmp::min(remaining, 1);
            if stop.wait_timeout(std::time::Duration::from_secs(slice)) {
                return false;
            }
        }
    }
}

/// A manually-advanced clock for deterministic scheduling tests
/// (spec.md §8's "virtual clock stepping one minute at a time").
pub struct VirtualClock {
    state: Mutex<u64>,
    cvar: Condvar,
}

impl VirtualClock {
    pub fn new(start_seconds: u64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(start_seconds),
            cvar: Condvar::new(),
        })
    }

    /// Advances the clock by `seconds` and wakes any worker sleeping
    /// on it.
    pub fn advance(&self, seconds: u64) {
        let mut now = self.state.lock().unwrap();
        *now += seconds;
        self.cvar.notify_all();
    }
}

impl TimeSource for VirtualClock {
    fn now_seconds(&self) -> u64 {
        *self.state.lock().unwrap()
    }

    fn sleep_until(&self, target_seconds: u64, stop: &StopSignal) -> bool {
        let mut guard = self.state.lock().unwrap();
        loop {
            if *guard >= target_seconds {
                return true;
            }
            if stop.is_signaled() {
                return false;
            }
            let (next_guard, timeout) = self
                .cvar
                .wait_timeout(guard, std::time::Duration::from_millis(50))
                .unwrap();
            guard = next_guard;
            if timeout.timed_out() && stop.is_signaled() {
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_clock_advances_and_wakes() {
        let clock = VirtualClock::new(0);
        let stop = StopSignal::new();
        let clock2 = clock.clone();
        let handle = std::thread::spawn(move || clock2.sleep_until(60, &StopSignal::new()));
        std::thread::sleep(std::time::Duration::from_millis(100));
        clock.advance(60);
        assert!(handle.join().unwrap());
    }

    #[test]
    fn stop_signal_wakes_sleepers() {
        let clock = VirtualClock::new(0);
        let stop = StopSignal::new();
        let clock2 = clock.clone();
        let stop2 = stop.clone();
        let handle = std::thread::spawn(move || clock2.sleep_until(60, &stop2));
        std::thread::sleep(std::time::Duration::from_millis(100));
        stop.signal();
        assert!(!handle.join().unwrap());
    }
}
