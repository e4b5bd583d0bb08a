#[cfg(target_has_atomic = "64")]
use std::sync::atomic::{AtomicI64, Ordering};
#[cfg(not(target_has_atomic = "64"))]
use std::sync::{Mutex, PoisonError};

/// A 64-bit value written by one side and polled by many. Readers always see a whole
/// value that was published at some point, and the value never goes down.
#[derive(Debug)]
pub struct PublishedCounter {
    #[cfg(target_has_atomic = "64")]
    value: AtomicI64,
    #[cfg(not(target_has_atomic = "64"))]
    value: Mutex<i64>,
}

impl PublishedCounter {
    /// Reported when the quantity cannot be measured.
    pub const UNAVAILABLE: i64 = -1;

    pub fn new(initial: i64) -> Self {
        PublishedCounter {
            #[cfg(target_has_atomic = "64")]
            value: AtomicI64::new(initial),
            #[cfg(not(target_has_atomic = "64"))]
            value: Mutex::new(initial),
        }
    }

    pub fn unavailable() -> Self {
        Self::new(Self::UNAVAILABLE)
    }

    /// Raises the counter to `value` unless it is already higher. Returns the value that
    /// is visible afterwards.
    #[cfg(target_has_atomic = "64")]
    pub fn publish(&self, value: i64) -> i64 {
        let prev = self.value.fetch_max(value, Ordering::Release);
        prev.max(value)
    }

    #[cfg(not(target_has_atomic = "64"))]
    pub fn publish(&self, value: i64) -> i64 {
        let mut v = self.value.lock().unwrap_or_else(PoisonError::into_inner);
        *v = (*v).max(value);
        *v
    }

    #[cfg(target_has_atomic = "64")]
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    #[cfg(not(target_has_atomic = "64"))]
    pub fn get(&self) -> i64 {
        *self.value.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for PublishedCounter {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_goes_down() {
        let c = PublishedCounter::unavailable();
        assert_eq!(c.get(), -1);
        assert_eq!(c.publish(10), 10);
        assert_eq!(c.publish(3), 10);
        assert_eq!(c.get(), 10);
    }

    // Every published value has equal halves, so a torn read would show different ones.
    #[test]
    fn thousand_readers_see_whole_monotonic_values() {
        const STEP: i64 = (1 << 32) | 1;
        const WRITES: i64 = 20_000;
        let c = PublishedCounter::unavailable();
        std::thread::scope(|s| {
            for _ in 0..1000 {
                s.spawn(|| {
                    let mut last = i64::MIN;
                    for _ in 0..200 {
                        let v = c.get();
                        assert!(v >= -1, "{v}");
                        assert!(v >= last, "went back from {last} to {v}");
                        if v >= 0 {
                            assert_eq!(v >> 32, v & 0xffff_ffff, "torn read {v:#x}");
                        }
                        last = v;
                        std::thread::yield_now();
                    }
                });
            }
            s.spawn(|| {
                for k in 0..WRITES {
                    c.publish(k * STEP);
                }
            });
        });
        assert_eq!(c.get(), (WRITES - 1) * STEP);
    }
}
