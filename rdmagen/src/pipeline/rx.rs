//! The receive pipeline.
//!
//! Each request of slot `k` points at its own frame buffer, request `i` at buffer `k·B + i` of
//! the [`Pool`]. After all slots are posted a capture-all filter is installed, which mirrors all
//! traffic of the port to the queue pair without taking it away from anyone else.
//!
//! Reposting is done per slot, never per frame. Two strategies decide when a slot is complete:
//!
//! * [`Replenish::Boundary`] looks only at the slot id of the last completion of each poll.
//!   When it differs from the one seen at the end of the previous poll, every slot from the
//!   previous one up to the new one is complete and reposted. This relies on the hardware
//!   filling receive requests in the order they were posted.
//! * [`Replenish::Counted`] counts the completions of each slot and reposts it on the `B`-th.
//!
//! [`Pool`]: ../../pool/struct.Pool.html
//! [`Replenish::Boundary`]: enum.Replenish.html#variant.Boundary
//! [`Replenish::Counted`]: enum.Replenish.html#variant.Counted
use core::convert::Infallible;
use core::fmt;
use core::str::FromStr;

use crate::error::{ConfigError, Error, Op, Result, SlotError};
use crate::meter::{Meter, Report, ReportMode};
use crate::nic::{Access, Completion, Device, QpState, RecvRequest};
use crate::pool::Pool;
use crate::setup::Endpoint;
use crate::time::{Clock, SystemClock};

use super::{completed_slot, poll, PipelineConfig, Slots};

/// The default size of a receive buffer, enough for a jumbo frame.
pub const DEFAULT_FRAME_SIZE: usize = 9216;

/// When to repost a receive slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Replenish {
    /// When the slot id of the last completion of a poll changes.
    Boundary,
    /// When all requests of the slot have completed.
    Counted,
}

/// Validated parameters of a receive pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RxConfig {
    pipeline: PipelineConfig,
    frame_size: usize,
    replenish: Replenish,
}

/// Keeps `D` batches of receive buffers posted.
pub struct RxPipeline<D: Device, C = SystemClock> {
    endpoint: Endpoint<D>,
    config: RxConfig,
    pool: Pool,
    chains: Vec<D::RecvChain>,
    slots: Slots,
    /// Completions still expected per slot, for `Replenish::Counted`.
    pending: Vec<usize>,
    /// The slot of the last completion seen, for `Replenish::Boundary`.
    last: usize,
    completions: Vec<Completion>,
    meter: Meter<C>,
    flow: Option<D::Flow>,
    posted: u64,
}

impl RxConfig {
    /// Receive into buffers of `frame_size` bytes.
    pub fn new(pipeline: PipelineConfig, frame_size: usize) -> core::result::Result<Self, ConfigError> {
        if frame_size == 0 {
            return Err(ConfigError::ZeroFrameSize);
        }

        if u32::try_from(frame_size).is_err() {
            return Err(ConfigError::FrameTooLarge(frame_size));
        }

        let frames = pipeline.outstanding_limit();
        match frames.checked_mul(frame_size) {
            Some(total) if total <= isize::MAX as usize => {},
            _ => return Err(ConfigError::PoolTooLarge { frames, frame_size }),
        }

        Ok(RxConfig {
            pipeline,
            frame_size,
            replenish: Replenish::Boundary,
        })
    }

    /// Set when slots are reposted.
    pub fn with_replenish(self, replenish: Replenish) -> Self {
        RxConfig { replenish, ..self }
    }

    /// Allocate the frame buffers for this configuration.
    pub fn pool(&self) -> core::result::Result<Pool, ConfigError> {
        Pool::with_size_and_count(self.frame_size, self.pipeline.outstanding_limit())
    }

    /// The shared pipeline parameters.
    pub fn pipeline(&self) -> &PipelineConfig {
        &self.pipeline
    }

    /// The size of each receive buffer.
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// When slots are reposted.
    pub fn replenish(&self) -> Replenish {
        self.replenish
    }
}

impl Default for RxConfig {
    fn default() -> Self {
        RxConfig {
            pipeline: PipelineConfig::default(),
            frame_size: DEFAULT_FRAME_SIZE,
            replenish: Replenish::Boundary,
        }
    }
}

impl<D: Device> RxPipeline<D> {
    /// Prepare the batches of a pipeline receiving into `pool`.
    ///
    /// The endpoint's memory region must contain the pool and grant local write access. Reposting
    /// on slot boundaries needs at least two slots.
    pub fn new(endpoint: Endpoint<D>, pool: Pool, config: RxConfig) -> Result<Self> {
        RxPipeline::with_clock(endpoint, pool, config, SystemClock::new())
    }
}

impl<D: Device, C: Clock> RxPipeline<D, C> {
    /// Prepare the batches, measuring throughput with `clock`.
    pub fn with_clock(mut endpoint: Endpoint<D>, pool: Pool, config: RxConfig, clock: C)
        -> Result<Self>
    {
        endpoint.require(QpState::ReadyToReceive)?;
        endpoint.region().require(Access::LOCAL_WRITE)?;

        let pipeline = config.pipeline;
        let (depth, batch) = (pipeline.depth(), pipeline.batch());
        if config.replenish == Replenish::Boundary && depth < 2 {
            return Err(ConfigError::BoundaryDepth.into());
        }

        let needed = pipeline.outstanding_limit();
        if pool.len() < needed || pool.frame_size() < config.frame_size {
            return Err(ConfigError::PoolTooSmall {
                frames: pool.len(),
                frame_size: pool.frame_size(),
                needed,
                needed_size: config.frame_size,
            }.into());
        }

        let mut chains = Vec::with_capacity(depth);
        let mut requests = Vec::with_capacity(batch);
        for slot in 0..depth {
            requests.clear();
            for i in 0..batch {
                let addr = pool.frame_addr(slot * batch + i);
                requests.push(RecvRequest {
                    id: slot as u64,
                    sge: endpoint.region().sge(addr, config.frame_size as u32)?,
                });
            }
            chains.push(endpoint.device.recv_chain(&requests));
        }

        tracing::debug!(
            depth,
            batch,
            frame_size = config.frame_size,
            replenish = ?config.replenish,
            "prepared receive batches");

        Ok(RxPipeline {
            endpoint,
            config,
            pool,
            chains,
            slots: Slots::new(depth),
            pending: vec![0; depth],
            last: 0,
            completions: vec![Completion::default(); needed],
            meter: Meter::new(clock, ReportMode::Adaptive),
            flow: None,
            posted: 0,
        })
    }

    /// Post every slot once, then install the capture-all filter.
    pub fn prime(&mut self) -> Result<()> {
        for slot in 0..self.slots.depth() {
            self.post(slot)?;
        }
        self.flow = Some(self.endpoint.capture_all()?);
        Ok(())
    }

    /// Wait for completions and repost the slots they finish.
    ///
    /// Returns the number of frames received, at least one.
    pub fn step(&mut self, report: &mut impl Report) -> Result<usize> {
        let n = poll(
            &mut self.endpoint.device,
            &mut self.endpoint.cq,
            &mut self.completions[..],
            self.config.pipeline.poll(),
            true)?;

        match self.config.replenish {
            Replenish::Boundary => self.replenish_boundary(n)?,
            Replenish::Counted => self.replenish_counted(n)?,
        }

        if let Some(sample) = self.meter.record(n as u64) {
            report.report(&sample);
        }

        Ok(n)
    }

    /// Prime and step forever.
    ///
    /// Only returns on an error.
    pub fn run(&mut self, report: &mut impl Report) -> Result<Infallible> {
        self.prime()?;
        loop {
            self.step(report)?;
        }
    }

    fn replenish_boundary(&mut self, n: usize) -> Result<()> {
        let mut tail = self.last;
        for idx in 0..n {
            tail = completed_slot(&self.slots, &self.completions[idx])?;
        }

        // Every slot before the new tail, starting from the old one, has completed.
        let depth = self.slots.depth();
        while self.last != tail {
            let slot = self.last;
            self.slots.retire(slot)?;
            self.post(slot)?;
            self.last = (slot + 1) % depth;
        }
        Ok(())
    }

    fn replenish_counted(&mut self, n: usize) -> Result<()> {
        for idx in 0..n {
            let slot = completed_slot(&self.slots, &self.completions[idx])?;
            match self.pending[slot] {
                0 => return Err(SlotError::Overcompleted(slot).into()),
                1 => {
                    self.slots.retire(slot)?;
                    self.post(slot)?;
                },
                _ => self.pending[slot] -= 1,
            }
        }
        Ok(())
    }

    fn post(&mut self, slot: usize) -> Result<()> {
        self.slots.submit(slot)?;
        let endpoint = &mut self.endpoint;
        endpoint.device.post_recv(&mut endpoint.qp, &mut self.chains[slot])
            .map_err(Error::transport(Op::PostRecv))?;
        self.pending[slot] = self.config.pipeline.batch();
        self.posted += 1;
        Ok(())
    }

    /// The receive buffers.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Requests posted and not yet known to be completed.
    pub fn outstanding(&self) -> usize {
        self.slots.in_flight() * self.config.pipeline.batch()
    }

    /// Whether the batch of a slot is posted.
    pub fn is_in_flight(&self, slot: usize) -> bool {
        self.slots.is_in_flight(slot)
    }

    /// Whether the capture-all filter is installed.
    pub fn is_capturing(&self) -> bool {
        self.flow.is_some()
    }

    /// The number of batches posted so far.
    pub fn batches_posted(&self) -> u64 {
        self.posted
    }

    /// The configuration.
    pub fn config(&self) -> &RxConfig {
        &self.config
    }

    /// The throughput meter.
    pub fn meter(&self) -> &Meter<C> {
        &self.meter
    }

    /// The endpoint.
    pub fn endpoint(&self) -> &Endpoint<D> {
        &self.endpoint
    }

    /// The endpoint, mutably.
    pub fn endpoint_mut(&mut self) -> &mut Endpoint<D> {
        &mut self.endpoint
    }
}

impl FromStr for Replenish {
    type Err = String;

    fn from_str(s: &str) -> core::result::Result<Self, String> {
        match s {
            "boundary" => Ok(Replenish::Boundary),
            "counted" => Ok(Replenish::Counted),
            other => Err(format!("unknown replenish mode `{}`, expected boundary or counted", other)),
        }
    }
}

impl fmt::Display for Replenish {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Replenish::Boundary => f.write_str("boundary"),
            Replenish::Counted => f.write_str("counted"),
        }
    }
}
