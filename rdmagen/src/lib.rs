//! Raw packet generation and capture at line rate on top of RDMA queue pairs.
//!
//! ## Table of contents
//!
//! 1. [Design](#design)
//! 2. [The transport](nic/index.html)
//!    1. [The capability surface](nic/trait.Device.html)
//!    1. [A software device](nic/loopback/index.html)
//! 3. [Bringing up a queue pair](setup/index.html)
//! 4. [The packet corpus](corpus/index.html)
//!    1. [Capture files](wire/pcap/index.html)
//! 5. [The pipelines](pipeline/index.html)
//!    1. [Transmit](pipeline/tx/index.html)
//!    1. [Receive](pipeline/rx/index.html)
//! 6. [Throughput accounting](meter/index.html)
//!
//! ## Design
//!
//! A raw packet queue pair lets the NIC read frames directly out of registered memory and write
//! received frames directly into it. Nothing is copied on the data path: the transmit side points
//! work requests at a corpus of frames that was mapped once at start-up, the receive side points
//! them at a pool of frame buffers that was allocated once at start-up.
//!
//! Both sides keep `D` batches of `B` chained work requests in flight. A batch occupies a *slot*
//! and carries the slot index as its work request id. A slot is only ever posted again after its
//! completion was observed, which bounds the work outstanding on the hardware by `D·B` no matter
//! how polls and posts interleave. All of this happens on a single thread that polls the
//! completion queue; there are no locks and no callbacks from the driver.
//!
//! The transport itself is abstracted as a small [capability surface](nic/trait.Device.html). It is
//! implemented by libibverbs (feature `verbs`) and by an in-memory [`Loopback`] device that checks
//! the hardware side of every invariant and is what the test-suite drives.
//!
//! [`Loopback`]: nic/loopback/struct.Loopback.html
#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod corpus;
pub mod error;
pub mod meter;
pub mod nic;
pub mod pipeline;
pub mod pool;
pub mod setup;
pub mod sys;
pub mod time;
pub mod wire;

pub use self::corpus::Corpus;
pub use self::error::{Error, Kind, Result};
pub use self::pipeline::{PipelineConfig, PollMode};
pub use self::pipeline::rx::{Replenish, RxConfig, RxPipeline};
pub use self::pipeline::tx::TxPipeline;
pub use self::setup::{Endpoint, Setup};
