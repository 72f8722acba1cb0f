//! Throughput accounting.
//!
//! A [`Meter`] accumulates completed packets and emits a rate [`Sample`] whenever the count
//! crosses a threshold. The clock is only read when that happens, never per completion.
//!
//! In the adaptive mode the threshold is reset to the rate just observed, in packets per second.
//! Whatever the absolute speed, the next sample then follows roughly one second later: fast links
//! do not flood the output and slow ones are not starved of it. The first sample is taken right
//! away, the threshold starts at one packet.
//!
//! [`Meter`]: struct.Meter.html
//! [`Sample`]: struct.Sample.html
use core::fmt;
use core::str::FromStr;

use crate::time::{Clock, Duration, Instant};

/// The packet count between samples in the fixed mode, tuned for about twenty million packets
/// per second.
pub const FIXED_THRESHOLD: u64 = 64 << 20;

/// When to take samples.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReportMode {
    /// Adapt the threshold to about one sample per second.
    Adaptive,
    /// Take a sample every so many packets.
    Fixed(u64),
}

/// One throughput measurement.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sample {
    /// Packets counted since the previous sample.
    pub packets: u64,
    /// Time passed since the previous sample.
    pub elapsed: Duration,
    /// Packets per second.
    pub rate: f64,
}

/// A consumer of samples.
pub trait Report {
    /// Handle one sample.
    fn report(&mut self, sample: &Sample);
}

/// Counts packets against a clock.
#[derive(Debug)]
pub struct Meter<C> {
    clock: C,
    mode: ReportMode,
    threshold: u64,
    count: u64,
    last: Instant,
}

impl ReportMode {
    /// The fixed mode with the default threshold.
    pub const FIXED: ReportMode = ReportMode::Fixed(FIXED_THRESHOLD);
}

impl Default for ReportMode {
    fn default() -> Self {
        ReportMode::Adaptive
    }
}

impl FromStr for ReportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "adaptive" => Ok(ReportMode::Adaptive),
            "fixed" => Ok(ReportMode::FIXED),
            other => Err(format!("unknown report mode `{}`, expected adaptive or fixed", other)),
        }
    }
}

impl<F: FnMut(&Sample)> Report for F {
    fn report(&mut self, sample: &Sample) {
        self(sample)
    }
}

impl<C: Clock> Meter<C> {
    /// Start counting now.
    pub fn new(clock: C, mode: ReportMode) -> Self {
        let threshold = match mode {
            ReportMode::Adaptive => 1,
            ReportMode::Fixed(n) => n.max(1),
        };

        Meter {
            last: clock.now(),
            clock,
            mode,
            threshold,
            count: 0,
        }
    }

    /// Count `packets` more, returning a sample if the threshold was crossed.
    ///
    /// No sample is taken while no time has passed; the packets keep accumulating.
    pub fn record(&mut self, packets: u64) -> Option<Sample> {
        self.count += packets;
        if self.count < self.threshold {
            return None;
        }

        let now = self.clock.now();
        let elapsed = now - self.last;
        if elapsed == Duration::from_secs(0) {
            return None;
        }

        let rate = self.count as f64 / elapsed.as_secs_f64();
        let sample = Sample {
            packets: self.count,
            elapsed,
            rate,
        };

        if let ReportMode::Adaptive = self.mode {
            self.threshold = (rate as u64).max(1);
        }
        self.count = 0;
        self.last = now;
        Some(sample)
    }

    /// Packets needed before the next sample.
    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Packets counted since the last sample.
    pub fn pending(&self) -> u64 {
        self.count
    }

    /// The clock.
    pub fn clock(&self) -> &C {
        &self.clock
    }
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, " === {:.0} PPS", self.rate)
    }
}
