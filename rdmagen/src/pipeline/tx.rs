//! The transmit pipeline.
//!
//! Request `i` of slot `k` sends corpus frame `(k·B + i) mod C`, so one full round over all
//! slots walks the corpus in order and wraps around when it is shorter than `D·B`. Only the last
//! request of a chain is signaled: the hardware produces one completion per batch, and that
//! completion covers the unsignaled requests before it.
use core::convert::Infallible;
use core::marker::PhantomData;

use crate::corpus::Corpus;
use crate::error::{Error, Op, Result};
use crate::meter::{Meter, Report, ReportMode};
use crate::nic::{Completion, Device, QpState, SendRequest};
use crate::setup::Endpoint;
use crate::time::{Clock, SystemClock};

use super::{completed_slot, poll, PipelineConfig, Slots};

/// Keeps `D` batches of sends in flight.
///
/// Borrows the corpus for as long as the hardware may read from it.
pub struct TxPipeline<'c, D: Device, C = SystemClock> {
    endpoint: Endpoint<D>,
    config: PipelineConfig,
    chains: Vec<D::SendChain>,
    slots: Slots,
    completions: Vec<Completion>,
    meter: Meter<C>,
    posted: u64,
    corpus: PhantomData<&'c Corpus>,
}

impl<'c, D: Device> TxPipeline<'c, D> {
    /// Prepare the batches of a pipeline over `corpus`.
    ///
    /// The endpoint must be ready to send and its memory region must contain the corpus.
    pub fn new(endpoint: Endpoint<D>, corpus: &'c Corpus, config: PipelineConfig, mode: ReportMode)
        -> Result<Self>
    {
        TxPipeline::with_clock(endpoint, corpus, config, mode, SystemClock::new())
    }
}

impl<'c, D: Device, C: Clock> TxPipeline<'c, D, C> {
    /// Prepare the batches, measuring throughput with `clock`.
    pub fn with_clock(
        mut endpoint: Endpoint<D>,
        corpus: &'c Corpus,
        config: PipelineConfig,
        mode: ReportMode,
        clock: C,
    ) -> Result<Self> {
        endpoint.require(QpState::ReadyToSend)?;

        let batch = config.batch();
        let mut chains = Vec::with_capacity(config.depth());
        let mut requests = Vec::with_capacity(batch);
        for slot in 0..config.depth() {
            requests.clear();
            for i in 0..batch {
                let frame = corpus.cycle(slot * batch + i);
                requests.push(SendRequest {
                    id: slot as u64,
                    sge: endpoint.region().sge(frame.addr, frame.len)?,
                    signaled: i + 1 == batch,
                });
            }
            chains.push(endpoint.device.send_chain(&requests));
        }

        tracing::debug!(
            depth = config.depth(),
            batch,
            frames = corpus.len(),
            "prepared send batches");

        Ok(TxPipeline {
            endpoint,
            config,
            chains,
            slots: Slots::new(config.depth()),
            completions: vec![Completion::default(); config.depth()],
            meter: Meter::new(clock, mode),
            posted: 0,
            corpus: PhantomData,
        })
    }

    /// Post every slot once.
    pub fn prime(&mut self) -> Result<()> {
        for slot in 0..self.config.depth() {
            self.post(slot)?;
        }
        Ok(())
    }

    /// Poll once and repost every slot whose completion arrived.
    ///
    /// Returns the number of completed batches, possibly zero in the spin mode.
    pub fn step(&mut self, report: &mut impl Report) -> Result<usize> {
        let depth = self.config.depth();
        let n = poll(
            &mut self.endpoint.device,
            &mut self.endpoint.cq,
            &mut self.completions[..depth],
            self.config.poll(),
            false)?;

        for idx in 0..n {
            let completion = self.completions[idx];
            let slot = completed_slot(&self.slots, &completion)?;
            self.slots.retire(slot)?;
            self.post(slot)?;
        }

        if n > 0 {
            let packets = (n * self.config.batch()) as u64;
            if let Some(sample) = self.meter.record(packets) {
                report.report(&sample);
            }
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

    fn post(&mut self, slot: usize) -> Result<()> {
        self.slots.submit(slot)?;
        let endpoint = &mut self.endpoint;
        endpoint.device.post_send(&mut endpoint.qp, &mut self.chains[slot])
            .map_err(Error::transport(Op::PostSend))?;
        self.posted += 1;
        Ok(())
    }

    /// Requests posted and not yet known to be completed.
    pub fn outstanding(&self) -> usize {
        self.slots.in_flight() * self.config.batch()
    }

    /// Whether the batch of a slot is in flight.
    pub fn is_in_flight(&self, slot: usize) -> bool {
        self.slots.is_in_flight(slot)
    }

    /// The number of batches posted so far.
    pub fn batches_posted(&self) -> u64 {
        self.posted
    }

    /// The configuration.
    pub fn config(&self) -> &PipelineConfig {
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
