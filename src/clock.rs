//! Local clock access.
//!
//! All PLL timing is done in microseconds of the controller's monotonic
//! clock. The calibration and offset loops take the clock as a parameter so
//! tests can drive them with a simulated time source.

/// A monotonic microsecond clock in the controller's own time domain.
pub trait LocalClock {
    /// Current time in microseconds.
    fn now_micros(&self) -> u64;

    /// Clock resolution in nanoseconds.
    fn resolution_nanos(&self) -> u64 {
        1_000
    }

    /// Busy-wait for `micros` microseconds.
    ///
    /// Spinning (rather than sleeping) keeps the caller on-CPU, which is what
    /// the hardware activation latency model assumes.
    fn spin_micros(&self, micros: u64) {
        let start = self.now_micros();
        while self.now_micros().saturating_sub(start) < micros {
            std::hint::spin_loop();
        }
    }
}

impl<C: LocalClock + ?Sized> LocalClock for &C {
    fn now_micros(&self) -> u64 {
        (**self).now_micros()
    }

    fn resolution_nanos(&self) -> u64 {
        (**self).resolution_nanos()
    }

    fn spin_micros(&self, micros: u64) {
        (**self).spin_micros(micros)
    }
}

/// `CLOCK_MONOTONIC` via `clock_gettime`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl MonotonicClock {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(target_family = "unix")]
impl LocalClock for MonotonicClock {
    fn now_micros(&self) -> u64 {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // CLOCK_MONOTONIC is always available on Linux; a failure leaves ts zeroed.
        unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
        }
        (ts.tv_sec as u64) * 1_000_000 + (ts.tv_nsec as u64) / 1_000
    }

    fn resolution_nanos(&self) -> u64 {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe {
            libc::clock_getres(libc::CLOCK_MONOTONIC, &mut ts);
        }
        (ts.tv_sec as u64) * 1_000_000_000 + ts.tv_nsec as u64
    }
}

/// Fallback for non-Unix platforms (development builds only).
#[cfg(not(target_family = "unix"))]
impl LocalClock for MonotonicClock {
    fn now_micros(&self) -> u64 {
        use std::sync::OnceLock;
        use std::time::Instant;

        static EPOCH: OnceLock<Instant> = OnceLock::new();
        let epoch = EPOCH.get_or_init(Instant::now);
        epoch.elapsed().as_micros() as u64
    }
}

/// Check whether the process may drive the pulse hardware directly.
#[cfg(target_family = "unix")]
pub fn has_hardware_access() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Stub: direct register access is only supported on Unix.
#[cfg(not(target_family = "unix"))]
pub fn has_hardware_access() -> bool {
    false
}
