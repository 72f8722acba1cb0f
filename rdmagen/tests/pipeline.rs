use proptest::prelude::*;

use rdmagen::{Corpus, PipelineConfig, PollMode, Replenish, RxConfig, RxPipeline, Setup, TxPipeline};
use rdmagen::meter::{ReportMode, Sample};
use rdmagen::nic::Access;
use rdmagen::nic::loopback::{Devices, Event, Loopback};
use rdmagen::wire::pcap::Header;

mod common;

fn ignore(_: &Sample) {}

fn tx<'c>(corpus: &'c Corpus, config: PipelineConfig) -> TxPipeline<'c, Loopback> {
    let mut devices = Devices::new(["mlx5_0", "lo"]);
    let endpoint = Setup::for_tx("lo", &config)
        .bring_up(&mut devices, corpus.span(), Access::NONE)
        .unwrap();
    TxPipeline::new(endpoint, corpus, config, ReportMode::Adaptive).unwrap()
}

fn rx(config: RxConfig) -> RxPipeline<Loopback> {
    let pool = config.pool().unwrap();
    let mut devices = Devices::new(["lo"]);
    let endpoint = Setup::for_rx("lo", config.pipeline())
        .bring_up(&mut devices, pool.span(), Access::LOCAL_WRITE)
        .unwrap();
    RxPipeline::new(endpoint, pool, config).unwrap()
}

/// The slot ids of all posted chains, in order.
fn posted_slots(events: &[Event]) -> Vec<u64> {
    events.iter().filter_map(|event| match event {
        Event::PostSend { requests, .. } => Some(requests[0].id),
        Event::PostRecv { requests, .. } => Some(requests[0].id),
        Event::Polled { .. } => None,
    }).collect()
}

#[test]
fn tx_builtin_round_robin() {
    let corpus = Corpus::open(None).unwrap();
    assert_eq!(corpus.len(), 1);
    let frame = corpus.descriptors()[0];

    let config = PipelineConfig::new(2, 16).unwrap();
    let mut tx = tx(&corpus, config);
    tx.prime().unwrap();

    let log = tx.endpoint_mut().device_mut().take_log();
    assert_eq!(posted_slots(&log), [0, 1]);
    for event in &log {
        if let Event::PostSend { requests, .. } = event {
            assert_eq!(requests.len(), 16);
            assert!(requests.iter().all(|req| req.sge.addr == frame.addr));
            assert!(requests.iter().all(|req| req.sge.length == frame.len));
        }
    }

    // The hardware retires all 32 requests, one completion per slot.
    assert_eq!(tx.step(&mut ignore).unwrap(), 2);
    let log = tx.endpoint_mut().device_mut().take_log();
    assert_eq!(posted_slots(&log), [0, 1]);
    assert_eq!(tx.batches_posted(), 4);
    assert_eq!(tx.outstanding(), 32);
}

#[test]
fn tx_block_mode_waits() {
    let corpus = Corpus::builtin();
    let config = PipelineConfig::new(2, 4).unwrap().with_poll(PollMode::Block);
    let mut tx = tx(&corpus, config);
    tx.prime().unwrap();

    // Nothing is retired by polling alone, only by waiting.
    tx.endpoint_mut().device_mut().set_progress(Some(0));
    assert_eq!(tx.step(&mut ignore).unwrap(), 2);
    assert_eq!(tx.batches_posted(), 4);
}

#[test]
fn rx_boundary_scenario() {
    let config = RxConfig::new(PipelineConfig::new(2, 4).unwrap(), 256).unwrap();
    let mut rx = rx(config);
    rx.prime().unwrap();
    assert!(rx.is_capturing());
    let port = rx.endpoint().port();

    let log = rx.endpoint_mut().device_mut().take_log();
    assert_eq!(posted_slots(&log), [0, 1]);

    // A whole batch of slot 0, then completions of slot 1.
    rx.endpoint_mut().device_mut().deliver(port, 4, 64).unwrap();
    rx.step(&mut ignore).unwrap();
    rx.endpoint_mut().device_mut().deliver(port, 2, 64).unwrap();
    rx.step(&mut ignore).unwrap();
    let log = rx.endpoint_mut().device_mut().take_log();
    assert_eq!(posted_slots(&log), [0]);

    // Slot 1 is reposted once frames land in slot 0 again.
    rx.endpoint_mut().device_mut().deliver(port, 3, 64).unwrap();
    rx.step(&mut ignore).unwrap();
    let log = rx.endpoint_mut().device_mut().take_log();
    assert_eq!(posted_slots(&log), [1]);
    assert_eq!(rx.endpoint().device().drops(), 0);
}

/// Mirrors the slot bookkeeping from the device log.
///
/// Tracks the requests of each slot not yet seen completed, and fails when a chain is posted
/// while any of them is still outstanding.
struct Shadow {
    batch: usize,
    remaining: Vec<usize>,
}

impl Shadow {
    fn new(depth: usize, batch: usize) -> Self {
        Shadow { batch, remaining: vec![0; depth] }
    }

    fn replay(&mut self, events: &[Event], per_request: bool) -> Result<(), TestCaseError> {
        for event in events {
            match event {
                Event::PostSend { requests, .. } => self.post(requests[0].id)?,
                Event::PostRecv { requests, .. } => self.post(requests[0].id)?,
                Event::Polled { completions, .. } => {
                    for completion in completions {
                        let slot = completion.id as usize;
                        prop_assert!(self.remaining[slot] > 0, "completion of idle slot {}", slot);
                        // A send completion stands for the whole chain.
                        if per_request {
                            self.remaining[slot] -= 1;
                        } else {
                            self.remaining[slot] = 0;
                        }
                    }
                },
            }
        }
        Ok(())
    }

    fn post(&mut self, slot: u64) -> Result<(), TestCaseError> {
        let slot = slot as usize;
        prop_assert_eq!(self.remaining[slot], 0, "slot {} reposted early", slot);
        self.remaining[slot] = self.batch;
        Ok(())
    }

    fn outstanding(&self) -> usize {
        self.remaining.iter().sum()
    }
}

proptest! {
    #[test]
    fn tx_interleavings(
        frames in 1usize..7,
        depth in 1usize..4,
        batch in 1usize..6,
        progress in proptest::collection::vec(0usize..12, 1..40),
    ) {
        let frames = common::frames(frames);
        let refs: Vec<&[u8]> = frames.iter().map(Vec::as_slice).collect();
        let corpus = Corpus::from_bytes(common::capture(Header::default(), &refs)).unwrap();
        let limit = depth * batch;

        let mut tx = tx(&corpus, PipelineConfig::new(depth, batch).unwrap());
        tx.prime().unwrap();

        // One full round walks the corpus in order, wrapping around.
        let log = tx.endpoint_mut().device_mut().take_log();
        let addrs: Vec<u64> = log.iter().flat_map(|event| match event {
            Event::PostSend { requests, .. } => requests.iter().map(|req| req.sge.addr).collect(),
            _ => Vec::new(),
        }).collect();
        let expected: Vec<u64> = (0..limit)
            .map(|idx| corpus.descriptors()[idx % corpus.len()].addr)
            .collect();
        prop_assert_eq!(addrs, expected);

        let mut shadow = Shadow::new(depth, batch);
        shadow.replay(&log, false)?;

        for budget in progress {
            tx.endpoint_mut().device_mut().set_progress(Some(budget));
            tx.step(&mut ignore).unwrap();

            let log = tx.endpoint_mut().device_mut().take_log();
            shadow.replay(&log, false)?;
            prop_assert!(tx.outstanding() <= limit);
            prop_assert_eq!(tx.outstanding(), shadow.outstanding());
            let endpoint = tx.endpoint();
            prop_assert!(endpoint.device().sends_queued(endpoint.qp()) <= limit);
        }
    }

    #[test]
    fn rx_interleavings(
        depth in 2usize..5,
        batch in 1usize..6,
        counted in any::<bool>(),
        arrivals in proptest::collection::vec(0usize..16, 1..40),
    ) {
        let replenish = if counted { Replenish::Counted } else { Replenish::Boundary };
        let config = RxConfig::new(PipelineConfig::new(depth, batch).unwrap(), 128)
            .unwrap()
            .with_replenish(replenish);
        let limit = depth * batch;

        let mut rx = rx(config);
        rx.prime().unwrap();
        let port = rx.endpoint().port();

        let mut shadow = Shadow::new(depth, batch);
        let log = rx.endpoint_mut().device_mut().take_log();
        shadow.replay(&log, true)?;

        for frames in arrivals {
            let received = rx.endpoint_mut().device_mut().deliver(port, frames, 64).unwrap();
            // Receiving spins until something arrives.
            if received > 0 {
                prop_assert_eq!(rx.step(&mut ignore).unwrap(), received);
            }

            let log = rx.endpoint_mut().device_mut().take_log();
            shadow.replay(&log, true)?;
            prop_assert!(rx.outstanding() <= limit);
            let endpoint = rx.endpoint();
            prop_assert!(endpoint.device().recvs_queued(endpoint.qp()) <= limit);
        }
    }
}
