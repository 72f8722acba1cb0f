//! The batch submission and completion engines.
//!
//! Both directions work the same way. There are `D` slots, each holding one chain of `B` work
//! requests that is prepared once and then posted over and over. Every request of a chain
//! carries the index of its slot as work request id, so a completion names the slot it belongs
//! to. A slot alternates strictly between idle and in flight: it is posted only while idle and
//! becomes idle again only when its completion is observed. Hence never more than `D·B` requests
//! are outstanding on the hardware.
//!
//! The engines are driven by a single thread polling the completion queue. In the default
//! [`PollMode::Spin`] an empty poll is simply retried, which pins a core but never misses a
//! completion. [`PollMode::Block`] instead waits on the completion channel, saving the core at
//! the cost of wake-up latency and peak rate.
//!
//! [`PollMode::Spin`]: enum.PollMode.html#variant.Spin
//! [`PollMode::Block`]: enum.PollMode.html#variant.Block
use core::fmt;
use core::str::FromStr;

use crate::error::{ConfigError, Error, Op, Result, SlotError};
use crate::nic::{Completion, Device, DEFAULT_PORT};

pub mod rx;
pub mod tx;

/// The default number of slots.
pub const DEFAULT_DEPTH: usize = 2;

/// The default number of requests per slot.
pub const DEFAULT_BATCH: usize = 1024;

/// The most requests the transport can have outstanding on one queue.
pub const MAX_REQUESTS: usize = i32::MAX as usize;

/// How to wait for completions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PollMode {
    /// Poll in a tight loop.
    Spin,
    /// Sleep on the completion channel when nothing is ready.
    Block,
}

/// Validated parameters shared by both directions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PipelineConfig {
    depth: usize,
    batch: usize,
    poll: PollMode,
    port: u8,
}

/// The idle or in-flight state of every slot.
#[derive(Clone, Debug)]
pub(crate) struct Slots {
    in_flight: Vec<bool>,
    count: usize,
}

impl PipelineConfig {
    /// A pipeline of `depth` slots with `batch` requests each.
    ///
    /// Spins on the completion queue and uses port 1.
    pub fn new(depth: usize, batch: usize) -> core::result::Result<Self, ConfigError> {
        if depth == 0 {
            return Err(ConfigError::ZeroDepth);
        }

        if batch == 0 {
            return Err(ConfigError::ZeroBatch);
        }

        match depth.checked_mul(batch) {
            Some(total) if total <= MAX_REQUESTS => {},
            _ => return Err(ConfigError::TooManyRequests { depth, batch }),
        }

        Ok(PipelineConfig {
            depth,
            batch,
            poll: PollMode::Spin,
            port: DEFAULT_PORT,
        })
    }

    /// Set how to wait for completions.
    pub fn with_poll(self, poll: PollMode) -> Self {
        PipelineConfig { poll, ..self }
    }

    /// Set the port of the queue pair.
    pub fn with_port(self, port: u8) -> Self {
        PipelineConfig { port, ..self }
    }

    /// The number of slots, `D`.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// The number of requests per slot, `B`.
    pub fn batch(&self) -> usize {
        self.batch
    }

    /// How completions are waited for.
    pub fn poll(&self) -> PollMode {
        self.poll
    }

    /// The port of the queue pair.
    pub fn port(&self) -> u8 {
        self.port
    }

    /// The bound on outstanding requests, `D·B`.
    pub fn outstanding_limit(&self) -> usize {
        self.depth * self.batch
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            depth: DEFAULT_DEPTH,
            batch: DEFAULT_BATCH,
            poll: PollMode::Spin,
            port: DEFAULT_PORT,
        }
    }
}

impl Default for PollMode {
    fn default() -> Self {
        PollMode::Spin
    }
}

impl FromStr for PollMode {
    type Err = String;

    fn from_str(s: &str) -> core::result::Result<Self, String> {
        match s {
            "spin" => Ok(PollMode::Spin),
            "block" => Ok(PollMode::Block),
            other => Err(format!("unknown poll mode `{}`, expected spin or block", other)),
        }
    }
}

impl fmt::Display for PollMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PollMode::Spin => f.write_str("spin"),
            PollMode::Block => f.write_str("block"),
        }
    }
}

impl Slots {
    pub(crate) fn new(depth: usize) -> Self {
        Slots {
            in_flight: vec![false; depth],
            count: 0,
        }
    }

    /// The slot named by a work request id.
    pub(crate) fn slot_of(&self, id: u64) -> core::result::Result<usize, SlotError> {
        match usize::try_from(id) {
            Ok(slot) if slot < self.in_flight.len() => Ok(slot),
            _ => Err(SlotError::Unknown { slot: id, depth: self.in_flight.len() }),
        }
    }

    pub(crate) fn submit(&mut self, slot: usize) -> core::result::Result<(), SlotError> {
        if self.in_flight[slot] {
            return Err(SlotError::InFlight(slot));
        }
        self.in_flight[slot] = true;
        self.count += 1;
        Ok(())
    }

    pub(crate) fn retire(&mut self, slot: usize) -> core::result::Result<(), SlotError> {
        if !self.in_flight[slot] {
            return Err(SlotError::Idle(slot));
        }
        self.in_flight[slot] = false;
        self.count -= 1;
        Ok(())
    }

    pub(crate) fn is_in_flight(&self, slot: usize) -> bool {
        self.in_flight[slot]
    }

    /// The number of slots in flight.
    pub(crate) fn in_flight(&self) -> usize {
        self.count
    }

    pub(crate) fn depth(&self) -> usize {
        self.in_flight.len()
    }
}

/// Poll for completions in the given mode.
///
/// With `retry`, an empty result is never returned in the spin mode.
pub(crate) fn poll<D: Device>(
    device: &mut D,
    cq: &mut D::Cq,
    out: &mut [Completion],
    mode: PollMode,
    retry: bool,
) -> Result<usize> {
    loop {
        let n = device.poll(cq, out).map_err(Error::transport(Op::PollCq))?;
        if n > 0 {
            return Ok(n);
        }

        match mode {
            PollMode::Spin if retry => continue,
            PollMode::Spin => return Ok(0),
            PollMode::Block => {
                device.arm(cq).map_err(Error::transport(Op::WaitCq))?;
                // A completion may have arrived before the notification was armed.
                let n = device.poll(cq, out).map_err(Error::transport(Op::PollCq))?;
                if n > 0 {
                    return Ok(n);
                }
                device.wait(cq).map_err(Error::transport(Op::WaitCq))?;
            },
        }
    }
}

/// The slot of a completion, failing on an error status.
pub(crate) fn completed_slot(slots: &Slots, completion: &Completion) -> Result<usize> {
    if !completion.status.is_success() {
        return Err(Error::Completion {
            slot: completion.id,
            status: completion.status.0,
        });
    }
    Ok(slots.slot_of(completion.id)?)
}
