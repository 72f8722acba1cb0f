/*! Time structures.

The `time` module contains the structures used for throughput accounting.

 - [Instant] is used to represent absolute, monotonic time.
 - [Duration] is used to represent relative time.
 - [Clock] is the source of `Instant`s, either the system clock or one advanced by hand.

[Instant]: struct.Instant.html
[Duration]: struct.Duration.html
[Clock]: trait.Clock.html
*/
use core::cell::Cell;
use core::{fmt, ops};
pub use core::time::Duration;

/// A representation of an absolute time value.
///
/// The `Instant` type is a wrapper around a `u64` value that represents a number of
/// microseconds, monotonically increasing since an arbitrary moment in time, such as the creation
/// of the clock that produced it.
///
/// Microseconds are plenty: a rate sample is taken roughly once a second.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Instant {
    micros: u64,
}

/// A source of monotonic time.
pub trait Clock {
    /// The current time.
    fn now(&self) -> Instant;
}

/// The monotonic system clock, counting from its own creation.
#[derive(Clone, Copy, Debug)]
pub struct SystemClock {
    origin: std::time::Instant,
}

/// A clock that only moves when told to.
///
/// Used to replay completion streams at a synthetic rate.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Cell<Instant>,
}

impl Instant {
    /// The beginning of time.
    pub const ZERO: Instant = Instant { micros: 0 };

    /// Create a new `Instant` from a number of microseconds.
    pub const fn from_micros(micros: u64) -> Instant {
        Instant { micros }
    }

    /// Create a new `Instant` from a number of milliseconds.
    pub const fn from_millis(millis: u64) -> Instant {
        Instant { micros: millis * 1000 }
    }

    /// Create a new `Instant` from a number of seconds.
    pub const fn from_secs(secs: u64) -> Instant {
        Instant { micros: secs * 1_000_000 }
    }

    /// The total number of microseconds that have passed since the beginning of time.
    pub fn total_micros(&self) -> u64 {
        self.micros
    }

    /// The time passed since an `earlier` instant, zero if it is in fact later.
    pub fn saturating_duration_since(&self, earlier: Instant) -> Duration {
        Duration::from_micros(self.micros.saturating_sub(earlier.micros))
    }
}

impl SystemClock {
    /// A clock starting at `Instant::ZERO` now.
    pub fn new() -> Self {
        SystemClock {
            origin: std::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        SystemClock::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        let elapsed = self.origin.elapsed().as_micros();
        Instant::from_micros(elapsed as u64)
    }
}

impl ManualClock {
    /// A clock standing still at `start`.
    pub fn new(start: Instant) -> Self {
        ManualClock {
            now: Cell::new(start),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.now.get()
    }
}

impl<C: Clock + ?Sized> Clock for &'_ C {
    fn now(&self) -> Instant {
        (**self).now()
    }
}

impl ops::Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Instant {
        Instant::from_micros(self.micros + rhs.as_micros() as u64)
    }
}

impl ops::AddAssign<Duration> for Instant {
    fn add_assign(&mut self, rhs: Duration) {
        self.micros += rhs.as_micros() as u64;
    }
}

impl ops::Sub<Instant> for Instant {
    type Output = Duration;

    fn sub(self, rhs: Instant) -> Duration {
        self.saturating_duration_since(rhs)
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{:06}s", self.micros / 1_000_000, self.micros % 1_000_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instant_ops() {
        // add
        assert_eq!(Instant::from_millis(4) + Duration::from_millis(6), Instant::from_millis(10));
        // sub
        assert_eq!(Instant::from_secs(7) - Instant::from_millis(5500), Duration::from_millis(1500));
        // earlier minus later saturates
        assert_eq!(Instant::from_secs(1) - Instant::from_secs(2), Duration::from_secs(0));
    }

    #[test]
    fn instant_display() {
        assert_eq!(format!("{}", Instant::from_micros(5_000_042)), "5.000042s");
        assert_eq!(format!("{}", Instant::from_millis(1)), "0.001000s");
    }

    #[test]
    fn manual_clock() {
        let clock = ManualClock::new(Instant::from_secs(1));
        clock.advance(Duration::from_micros(250));
        assert_eq!(clock.now(), Instant::from_micros(1_000_250));
        assert_eq!((&clock).now(), clock.now());
    }

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(a <= b);
    }
}
