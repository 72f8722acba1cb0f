//! The error types of the crate.
//!
//! Every failure is fatal to the pipeline that observes it: configuration errors leave no
//! half-configured queue pair to recover, and transport errors after a successful bring-up mean
//! the hardware contract was violated. The errors are still typed values so that the caller
//! decides how to report them and with which exit status.
use core::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::nic::{Access, QpState};
use crate::wire::pcap;

/// The result type of the crate.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Any error of the crate.
#[derive(Debug, Error)]
pub enum Error {
    /// The runtime parameters were rejected before touching any hardware.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The capture file could not be turned into a corpus.
    #[error("capture file `{}`: {source}", .path.display())]
    Capture {
        /// The file that was loaded.
        path: PathBuf,
        /// What was wrong with it.
        #[source]
        source: CaptureError,
    },

    /// No device carries the requested name.
    #[error("device `{0}` not found")]
    DeviceNotFound(String),

    /// A bring-up step was rejected by the transport.
    #[error("{step} failed: {source}")]
    Setup {
        /// The step that failed.
        step: Step,
        /// The error reported by the transport.
        #[source]
        source: io::Error,
    },

    /// A queue pair was used in a state that does not permit the operation.
    #[error("queue pair is {actual:?} but must be at least {required:?}")]
    NotReady {
        /// The least state that would have permitted the operation.
        required: QpState,
        /// The state the queue pair is in.
        actual: QpState,
    },

    /// A buffer would have been referenced outside of its registered memory.
    #[error("memory region: {0}")]
    Region(#[from] RegionError),

    /// Posting or polling failed in the steady state.
    #[error("{op} failed: {source}")]
    Transport {
        /// The operation that failed.
        op: Op,
        /// The error reported by the transport.
        #[source]
        source: io::Error,
    },

    /// The transport completed a work request with an error status.
    #[error("work request of slot {slot} completed with status {status}")]
    Completion {
        /// The slot the failed request belongs to.
        slot: u64,
        /// The raw completion status.
        status: u32,
    },

    /// The pipeline bookkeeping was violated.
    #[error("pipeline invariant violated: {0}")]
    Slot(#[from] SlotError),
}

/// The coarse classes of errors.
///
/// Follows the point in the life of the process at which the error can occur.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    /// Device lookup, bring-up and registration. Nothing is running yet.
    Configuration,
    /// Malformed input, detected before any hardware is configured.
    Input,
    /// A failure of the transport while the pipeline runs.
    Transport,
}

/// Invalid runtime parameters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A pipeline needs at least one slot.
    #[error("pipeline depth must be positive")]
    ZeroDepth,
    /// A batch needs at least one request.
    #[error("batch size must be positive")]
    ZeroBatch,
    /// More requests than the transport can count would be in flight.
    #[error("{depth} batches of {batch} requests exceed the work request limit")]
    TooManyRequests {
        /// The requested pipeline depth.
        depth: usize,
        /// The requested batch size.
        batch: usize,
    },
    /// Receive buffers must be able to hold something.
    #[error("frame size must be positive")]
    ZeroFrameSize,
    /// A single receive buffer is larger than a scatter entry can describe.
    #[error("frame size {0} exceeds the scatter entry limit")]
    FrameTooLarge(usize),
    /// The receive buffers do not fit the address space.
    #[error("{frames} frames of {frame_size} bytes do not fit into memory")]
    PoolTooLarge {
        /// The number of frames requested.
        frames: usize,
        /// The size of each frame.
        frame_size: usize,
    },
    /// The receive buffers handed to a pipeline cannot back all of its requests.
    #[error("pool of {frames} frames of {frame_size} bytes is too small for {needed} requests of {needed_size} bytes")]
    PoolTooSmall {
        /// The number of frames in the pool.
        frames: usize,
        /// The size of each frame in the pool.
        frame_size: usize,
        /// The number of requests of the pipeline.
        needed: usize,
        /// The configured frame size.
        needed_size: usize,
    },
    /// Reposting on slot changes cannot work when there is only one slot.
    #[error("boundary replenishment needs at least two slots")]
    BoundaryDepth,
}

/// Failure to turn a capture file into a corpus.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The file could not be opened or inspected.
    #[error("cannot open: {0}")]
    Open(#[source] io::Error),
    /// The file could not be mapped.
    #[error("cannot map: {0}")]
    Map(#[source] io::Error),
    /// The contents are not an acceptable capture.
    #[error(transparent)]
    Format(#[from] pcap::Error),
}

/// A buffer outside of or incompatible with its memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegionError {
    /// The buffer is not contained in the registered range.
    #[error("buffer {addr:#x}+{len} outside of {base:#x}+{region_len}")]
    OutOfBounds {
        /// Start of the buffer.
        addr: u64,
        /// Length of the buffer.
        len: usize,
        /// Start of the region.
        base: u64,
        /// Length of the region.
        region_len: usize,
    },
    /// The region was registered without rights the requests need.
    #[error("requires access {required:?} but was registered with {granted:?}")]
    Access {
        /// The rights needed.
        required: Access,
        /// The rights the region has.
        granted: Access,
    },
}

/// A violation of the strict submit/complete alternation of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SlotError {
    /// A completion carried an id that names no slot.
    #[error("completion names slot {slot} of a pipeline with {depth} slots")]
    Unknown {
        /// The id of the completion.
        slot: u64,
        /// The number of slots.
        depth: usize,
    },
    /// A slot was submitted while its previous batch was in flight.
    #[error("slot {0} submitted while in flight")]
    InFlight(usize),
    /// A slot was retired that was not in flight.
    #[error("slot {0} retired while idle")]
    Idle(usize),
    /// A slot received more completions than it has requests.
    #[error("slot {0} completed more requests than were posted")]
    Overcompleted(usize),
}

/// A step of the queue pair bring-up.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Step {
    /// Enumerating devices.
    DeviceList,
    /// Opening the device context.
    OpenDevice,
    /// Allocating the protection domain.
    AllocDomain,
    /// Creating the completion queue.
    CreateCq,
    /// Creating the queue pair.
    CreateQp,
    /// Transitioning the queue pair into a state.
    ModifyQp(QpState),
    /// Registering the memory region.
    RegisterMemory,
    /// Installing the capture-all filter.
    CaptureAll,
}

/// An operation of the steady state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    /// Posting a send batch.
    PostSend,
    /// Posting a receive batch.
    PostRecv,
    /// Polling the completion queue.
    PollCq,
    /// Arming or waiting on completion notification.
    WaitCq,
}

impl Error {
    /// Classify the error.
    pub fn kind(&self) -> Kind {
        match self {
            Error::Capture { .. } => Kind::Input,
            Error::Config(_)
            | Error::DeviceNotFound(_)
            | Error::Setup { .. }
            | Error::NotReady { .. }
            | Error::Region(_) => Kind::Configuration,
            Error::Transport { .. }
            | Error::Completion { .. }
            | Error::Slot(_) => Kind::Transport,
        }
    }

    pub(crate) fn setup(step: Step) -> impl FnOnce(io::Error) -> Error {
        move |source| Error::Setup { step, source }
    }

    pub(crate) fn transport(op: Op) -> impl FnOnce(io::Error) -> Error {
        move |source| Error::Transport { op, source }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Step::DeviceList => write!(f, "listing devices"),
            Step::OpenDevice => write!(f, "opening device"),
            Step::AllocDomain => write!(f, "allocating protection domain"),
            Step::CreateCq => write!(f, "creating completion queue"),
            Step::CreateQp => write!(f, "creating queue pair"),
            Step::ModifyQp(state) => write!(f, "transition to {:?}", state),
            Step::RegisterMemory => write!(f, "registering memory"),
            Step::CaptureAll => write!(f, "installing capture-all filter"),
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Op::PostSend => write!(f, "post send"),
            Op::PostRecv => write!(f, "post receive"),
            Op::PollCq => write!(f, "poll completion queue"),
            Op::WaitCq => write!(f, "wait for completions"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy() {
        let input = Error::Capture {
            path: "x.pcap".into(),
            source: CaptureError::Format(pcap::Error::Empty),
        };
        assert_eq!(input.kind(), Kind::Input);
        assert_eq!(Error::DeviceNotFound("mlx5_0".into()).kind(), Kind::Configuration);
        assert_eq!(Error::from(ConfigError::ZeroBatch).kind(), Kind::Configuration);
        assert_eq!(Error::Completion { slot: 0, status: 5 }.kind(), Kind::Transport);
        assert_eq!(Error::from(SlotError::Idle(1)).kind(), Kind::Transport);
    }

    #[test]
    fn messages_name_the_step() {
        let err = Error::setup(Step::ModifyQp(QpState::ReadyToSend))(
            io::Error::from_raw_os_error(libc::EINVAL));
        let message = err.to_string();
        assert!(message.starts_with("transition to ReadyToSend failed"), "{}", message);

        let err = Error::transport(Op::PostSend)(io::Error::from_raw_os_error(libc::ENOMEM));
        assert!(err.to_string().starts_with("post send failed"));
    }
}
