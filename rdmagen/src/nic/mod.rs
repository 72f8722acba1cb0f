//! Encapsulates the transport: an RDMA capable network interface card.
//!
//! The pipelines only need a small set of primitives from the card: enumerate and open devices,
//! allocate the usual verbs objects, register memory, post chains of work requests and poll for
//! their completions. These form the [`Provider`] and [`Device`] traits. The types passed through
//! them are plain values; a device translates them into whatever its hardware interface wants
//! once, when a chain is prepared, and not on every post.
//!
//! Also permits a software emulation of such a card, see [`loopback`].
//!
//! [`Provider`]: trait.Provider.html
//! [`Device`]: trait.Device.html
//! [`loopback`]: loopback/index.html
use core::ops;
use std::io;

pub mod loopback;

#[cfg(feature = "verbs")]
pub use crate::sys::verbs::{Verbs, VerbsDevice};

/// The port every queue pair and filter is bound to, unless configured otherwise.
pub const DEFAULT_PORT: u8 = 1;

/// The opaque key of a registered memory region.
///
/// Scatter entries name the memory they refer to by this key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct LocalKey(pub u32);

/// Access rights of a memory region.
///
/// The values match the ones of the verbs interface.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Access(u32);

/// The configuration state of a queue pair.
///
/// States are ordered, a queue pair moves through them strictly one after another during the
/// bring-up. Being ready to send implies being ready to receive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QpState {
    /// Freshly created, neither sends nor receives.
    Reset,
    /// Bound to a port. Receive requests may be posted but nothing arrives.
    Init,
    /// Ready to receive.
    ReadyToReceive,
    /// Ready to send (and to receive).
    ReadyToSend,
}

/// Work request capacities of a queue pair.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QpCaps {
    /// Maximum number of outstanding send requests.
    pub max_send: u32,
    /// Maximum number of outstanding receive requests.
    pub max_recv: u32,
}

/// A scatter/gather entry: a buffer inside a registered memory region.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Sge {
    /// Address of the first byte.
    pub addr: u64,
    /// Number of bytes.
    pub length: u32,
    /// Key of the region containing the buffer.
    pub lkey: LocalKey,
}

/// A request to send one frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SendRequest {
    /// Opaque identifier, returned in the completion.
    pub id: u64,
    /// The frame.
    pub sge: Sge,
    /// Whether to generate a completion.
    ///
    /// Unsignaled requests complete silently together with the next signaled one.
    pub signaled: bool,
}

/// A request to receive one frame into a buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecvRequest {
    /// Opaque identifier, returned in the completion.
    pub id: u64,
    /// The buffer.
    pub sge: Sge,
}

/// The status of a completed work request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Status(pub u32);

/// A completion queue entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Completion {
    /// The identifier of the completed request.
    pub id: u64,
    /// Whether the request succeeded.
    pub status: Status,
    /// Number of bytes received, for receive requests.
    pub byte_len: u32,
}

/// Enumerates and opens devices.
pub trait Provider {
    /// The opened device.
    type Device: Device;

    /// The names of all devices present.
    fn device_names(&mut self) -> io::Result<Vec<String>>;

    /// Open the device with the given name.
    fn open(&mut self, name: &str) -> io::Result<Self::Device>;
}

/// An opened device, the capability surface consumed by the pipelines.
///
/// Objects created through a device live as long as the device. Nothing is torn down
/// explicitly; the process owns them until it exits.
pub trait Device {
    /// A protection domain.
    type Domain;
    /// A completion queue.
    type Cq;
    /// A queue pair.
    type Qp;
    /// An installed flow steering rule.
    type Flow;
    /// A chain of send requests, prepared for repeated posting.
    type SendChain;
    /// A chain of receive requests, prepared for repeated posting.
    type RecvChain;

    /// Allocate a protection domain.
    fn alloc_domain(&mut self) -> io::Result<Self::Domain>;

    /// Create a completion queue holding at least `depth` entries.
    ///
    /// With `notify` the queue also supports blocking until a completion arrives.
    fn create_cq(&mut self, depth: u32, notify: bool) -> io::Result<Self::Cq>;

    /// Create a raw packet queue pair reporting all completions to `cq`.
    fn create_qp(&mut self, domain: &Self::Domain, cq: &Self::Cq, caps: QpCaps)
        -> io::Result<Self::Qp>;

    /// Move a queue pair to the next state.
    ///
    /// The port is bound when entering `QpState::Init` and ignored otherwise.
    fn modify_qp(&mut self, qp: &mut Self::Qp, state: QpState, port: u8) -> io::Result<()>;

    /// Register `len` bytes at `addr` for use by the hardware.
    fn register(&mut self, domain: &Self::Domain, addr: u64, len: usize, access: Access)
        -> io::Result<LocalKey>;

    /// Prepare a chain of send requests, linked in order.
    fn send_chain(&mut self, requests: &[SendRequest]) -> Self::SendChain;

    /// Prepare a chain of receive requests, linked in order.
    fn recv_chain(&mut self, requests: &[RecvRequest]) -> Self::RecvChain;

    /// Post a whole send chain.
    fn post_send(&mut self, qp: &mut Self::Qp, chain: &mut Self::SendChain) -> io::Result<()>;

    /// Post a whole receive chain.
    fn post_recv(&mut self, qp: &mut Self::Qp, chain: &mut Self::RecvChain) -> io::Result<()>;

    /// Dequeue up to `out.len()` completions without blocking.
    ///
    /// Returns the number of entries written to the front of `out`.
    fn poll(&mut self, cq: &mut Self::Cq, out: &mut [Completion]) -> io::Result<usize>;

    /// Request a notification for the next completion arriving at `cq`.
    fn arm(&mut self, cq: &mut Self::Cq) -> io::Result<()>;

    /// Block until the notification requested by `arm` fires.
    fn wait(&mut self, cq: &mut Self::Cq) -> io::Result<()>;

    /// Mirror all traffic of `port` to `qp`, without diverting it from other consumers.
    fn capture_all(&mut self, qp: &mut Self::Qp, port: u8) -> io::Result<Self::Flow>;
}

impl Access {
    /// No rights, the hardware may only read.
    pub const NONE: Access = Access(0);
    /// The hardware may write to the region.
    pub const LOCAL_WRITE: Access = Access(1);

    /// Rights from raw bits.
    pub const fn from_bits(bits: u32) -> Self {
        Access(bits)
    }

    /// The raw bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Check if all rights of `other` are granted.
    pub const fn contains(self, other: Access) -> bool {
        self.0 & other.0 == other.0
    }
}

impl ops::BitOr for Access {
    type Output = Access;

    fn bitor(self, rhs: Access) -> Access {
        Access(self.0 | rhs.0)
    }
}

impl QpState {
    /// The state a bring-up transitions to next.
    pub fn next(self) -> Option<QpState> {
        match self {
            QpState::Reset => Some(QpState::Init),
            QpState::Init => Some(QpState::ReadyToReceive),
            QpState::ReadyToReceive => Some(QpState::ReadyToSend),
            QpState::ReadyToSend => None,
        }
    }

    /// Whether sends may be posted.
    pub fn can_send(self) -> bool {
        self >= QpState::ReadyToSend
    }

    /// Whether frames are delivered to posted receive requests.
    pub fn can_receive(self) -> bool {
        self >= QpState::ReadyToReceive
    }
}

impl Status {
    /// The request completed successfully.
    pub const SUCCESS: Status = Status(0);

    /// Check for success.
    pub fn is_success(self) -> bool {
        self == Status::SUCCESS
    }
}
