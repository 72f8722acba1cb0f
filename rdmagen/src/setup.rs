//! Bringing up a queue pair.
//!
//! All objects of a pipeline are created in one go and in a fixed order: find and open the
//! device, create the completion queue, allocate the protection domain, create the queue pair,
//! move it through `Init`, `ReadyToReceive` and `ReadyToSend`, and finally register the memory the
//! requests will point into. Any step failing ends the bring-up; there is no partially configured
//! endpoint to fall back to. Nothing is torn down explicitly either, the objects live as long as
//! the [`Endpoint`] holding them.
//!
//! [`Endpoint`]: struct.Endpoint.html
use crate::error::{Error, RegionError, Result, Step};
use crate::nic::{Access, Device, LocalKey, Provider, QpCaps, QpState, Sge, DEFAULT_PORT};
use crate::pipeline::{PipelineConfig, PollMode};

/// A range of process memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Span {
    /// Address of the first byte.
    pub addr: u64,
    /// Number of bytes.
    pub len: usize,
}

/// Parameters of a bring-up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Setup {
    device: String,
    cq_depth: u32,
    caps: QpCaps,
    port: u8,
    notify: bool,
}

/// A registered memory range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRegion {
    base: u64,
    len: usize,
    access: Access,
    lkey: LocalKey,
}

/// A queue pair ready to send and receive, with everything it needs.
pub struct Endpoint<D: Device> {
    pub(crate) device: D,
    pub(crate) cq: D::Cq,
    pub(crate) qp: D::Qp,
    domain: D::Domain,
    state: QpState,
    region: MemoryRegion,
    port: u8,
    name: String,
}

impl Setup {
    /// Bring up a queue pair on the named device.
    ///
    /// Without further configuration, the completion queue has a single entry and the queue
    /// pair no capacity, bound to port 1.
    pub fn new(device: impl Into<String>) -> Self {
        Setup {
            device: device.into(),
            cq_depth: 1,
            caps: QpCaps::default(),
            port: DEFAULT_PORT,
            notify: false,
        }
    }

    /// The sizing of a transmit pipeline.
    ///
    /// Only the last request of each batch is signaled, so the completion queue needs one entry
    /// per slot while the send queue holds every request of every slot.
    pub fn for_tx(device: impl Into<String>, config: &PipelineConfig) -> Self {
        Setup::new(device)
            .cq_depth(config.depth() as u32)
            .caps(QpCaps { max_send: config.outstanding_limit() as u32, max_recv: 0 })
            .port(config.port())
            .notify(config.poll() == PollMode::Block)
    }

    /// The sizing of a receive pipeline.
    ///
    /// Every receive request completes, so the completion queue holds as many entries as
    /// requests can be outstanding.
    pub fn for_rx(device: impl Into<String>, config: &PipelineConfig) -> Self {
        let outstanding = config.outstanding_limit() as u32;
        Setup::new(device)
            .cq_depth(outstanding)
            .caps(QpCaps { max_send: 0, max_recv: outstanding })
            .port(config.port())
            .notify(config.poll() == PollMode::Block)
    }

    /// Set the minimum number of completion queue entries.
    pub fn cq_depth(mut self, depth: u32) -> Self {
        self.cq_depth = depth;
        self
    }

    /// Set the work request capacities.
    pub fn caps(mut self, caps: QpCaps) -> Self {
        self.caps = caps;
        self
    }

    /// Set the port to bind to.
    pub fn port(mut self, port: u8) -> Self {
        self.port = port;
        self
    }

    /// Whether the completion queue supports blocking for completions.
    pub fn notify(mut self, notify: bool) -> Self {
        self.notify = notify;
        self
    }

    /// The name of the device.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Perform the bring-up and register `span` with `access`.
    pub fn bring_up<P: Provider>(&self, provider: &mut P, span: Span, access: Access)
        -> Result<Endpoint<P::Device>>
    {
        let names = provider.device_names().map_err(Error::setup(Step::DeviceList))?;
        if !names.iter().any(|name| *name == self.device) {
            return Err(Error::DeviceNotFound(self.device.clone()));
        }

        let mut device = provider.open(&self.device).map_err(Error::setup(Step::OpenDevice))?;
        tracing::info!(device = %self.device, "opened device");

        let cq = device.create_cq(self.cq_depth, self.notify)
            .map_err(Error::setup(Step::CreateCq))?;
        let domain = device.alloc_domain().map_err(Error::setup(Step::AllocDomain))?;
        let mut qp = device.create_qp(&domain, &cq, self.caps)
            .map_err(Error::setup(Step::CreateQp))?;
        tracing::debug!(
            cq_depth = self.cq_depth,
            max_send = self.caps.max_send,
            max_recv = self.caps.max_recv,
            "created queue pair");

        let mut state = QpState::Reset;
        while let Some(next) = state.next() {
            device.modify_qp(&mut qp, next, self.port)
                .map_err(Error::setup(Step::ModifyQp(next)))?;
            tracing::debug!(state = ?next, port = self.port, "queue pair transitioned");
            state = next;
        }

        let lkey = device.register(&domain, span.addr, span.len, access)
            .map_err(Error::setup(Step::RegisterMemory))?;
        tracing::info!(addr = span.addr, len = span.len, lkey = lkey.0, "registered memory");

        Ok(Endpoint {
            device,
            cq,
            qp,
            domain,
            state,
            region: MemoryRegion {
                base: span.addr,
                len: span.len,
                access,
                lkey,
            },
            port: self.port,
            name: self.device.clone(),
        })
    }
}

impl MemoryRegion {
    /// The scatter entry for `len` bytes at `addr`.
    ///
    /// Fails unless the buffer lies completely within the region.
    pub fn sge(&self, addr: u64, len: u32) -> core::result::Result<Sge, RegionError> {
        let out_of_bounds = RegionError::OutOfBounds {
            addr,
            len: len as usize,
            base: self.base,
            region_len: self.len,
        };

        let end = addr.checked_add(u64::from(len)).ok_or(out_of_bounds)?;
        if addr < self.base || end > self.base + self.len as u64 {
            return Err(out_of_bounds);
        }

        Ok(Sge { addr, length: len, lkey: self.lkey })
    }

    /// Check that the region grants the rights `access`.
    pub fn require(&self, access: Access) -> core::result::Result<(), RegionError> {
        if self.access.contains(access) {
            Ok(())
        } else {
            Err(RegionError::Access { required: access, granted: self.access })
        }
    }

    /// The first registered address.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// The number of registered bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region has no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The rights granted to the hardware.
    pub fn access(&self) -> Access {
        self.access
    }

    /// The key to name the region with.
    pub fn lkey(&self) -> LocalKey {
        self.lkey
    }
}

impl<D: Device> Endpoint<D> {
    /// The device.
    pub fn device(&self) -> &D {
        &self.device
    }

    /// The device, mutably.
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// The queue pair.
    pub fn qp(&self) -> &D::Qp {
        &self.qp
    }

    /// The completion queue.
    pub fn cq(&self) -> &D::Cq {
        &self.cq
    }

    /// The protection domain.
    pub fn domain(&self) -> &D::Domain {
        &self.domain
    }

    /// The state the queue pair was brought into.
    pub fn state(&self) -> QpState {
        self.state
    }

    /// The registered memory.
    pub fn region(&self) -> &MemoryRegion {
        &self.region
    }

    /// The port the queue pair is bound to.
    pub fn port(&self) -> u8 {
        self.port
    }

    /// The name of the device.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check that the queue pair is at least in state `required`.
    pub fn require(&self, required: QpState) -> Result<()> {
        if self.state >= required {
            Ok(())
        } else {
            Err(Error::NotReady { required, actual: self.state })
        }
    }

    /// Mirror all traffic of the port to the queue pair.
    pub fn capture_all(&mut self) -> Result<D::Flow> {
        let flow = self.device.capture_all(&mut self.qp, self.port)
            .map_err(Error::setup(Step::CaptureAll))?;
        tracing::info!(port = self.port, "installed capture-all filter");
        Ok(flow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nic::loopback::{Devices, Fault};

    const SPAN: Span = Span { addr: 0x10_000, len: 4096 };

    #[test]
    fn ready_to_send() {
        let config = PipelineConfig::new(2, 1024).unwrap();
        let setup = Setup::for_tx("mlx5_0", &config);
        let mut devices = Devices::new(["mlx5_0"]);
        let endpoint = setup.bring_up(&mut devices, SPAN, Access::NONE).unwrap();

        assert_eq!(endpoint.state(), QpState::ReadyToSend);
        assert_eq!(endpoint.name(), "mlx5_0");
        let device = endpoint.device();
        assert_eq!(device.qp_state(endpoint.qp()), QpState::ReadyToSend);
        assert_eq!(device.qp_port(endpoint.qp()), 1);
        assert_eq!(device.qp_caps(endpoint.qp()), QpCaps { max_send: 2048, max_recv: 0 });
        assert_eq!(device.cq_depth(endpoint.cq()), 2);
        assert_eq!(endpoint.region().base(), SPAN.addr);
        assert!(endpoint.region().require(Access::LOCAL_WRITE).is_err());
    }

    #[test]
    fn rx_sizing() {
        let config = PipelineConfig::new(2, 1024).unwrap();
        let setup = Setup::for_rx("mlx5_0", &config);
        let mut devices = Devices::new(["mlx5_0"]);
        let endpoint = setup.bring_up(&mut devices, SPAN, Access::LOCAL_WRITE).unwrap();
        let device = endpoint.device();
        assert_eq!(device.qp_caps(endpoint.qp()), QpCaps { max_send: 0, max_recv: 2048 });
        assert_eq!(device.cq_depth(endpoint.cq()), 2048);
    }

    #[test]
    fn unknown_device() {
        let mut devices = Devices::new(["mlx5_0"]);
        let err = Setup::new("mlx5_9").bring_up(&mut devices, SPAN, Access::NONE).err().unwrap();
        assert!(matches!(err, Error::DeviceNotFound(ref name) if name == "mlx5_9"));
    }

    #[test]
    fn failed_transition_names_state() {
        let mut devices = Devices::new(["mlx5_0"])
            .with_fault(Fault::Modify(QpState::ReadyToReceive));
        let err = Setup::new("mlx5_0").bring_up(&mut devices, SPAN, Access::NONE).err().unwrap();
        match err {
            Error::Setup { step: Step::ModifyQp(QpState::ReadyToReceive), .. } => {},
            other => panic!("unexpected {}", other),
        }
    }

    #[test]
    fn unbound_port() {
        let mut devices = Devices::new(["mlx5_0"]);
        let err = Setup::new("mlx5_0").port(2)
            .bring_up(&mut devices, SPAN, Access::NONE).err().unwrap();
        assert!(matches!(err, Error::Setup { step: Step::ModifyQp(QpState::Init), .. }));

        let mut devices = Devices::new(["mlx5_0"]).with_ports(2);
        let endpoint = Setup::new("mlx5_0").port(2)
            .bring_up(&mut devices, SPAN, Access::NONE).unwrap();
        assert_eq!(endpoint.port(), 2);
    }

    #[test]
    fn failed_registration() {
        let mut devices = Devices::new(["mlx5_0"]).with_fault(Fault::Register);
        let err = Setup::new("mlx5_0").bring_up(&mut devices, SPAN, Access::NONE).err().unwrap();
        assert!(matches!(err, Error::Setup { step: Step::RegisterMemory, .. }));
    }

    #[test]
    fn region_containment() {
        let region = MemoryRegion {
            base: 0x1000,
            len: 0x100,
            access: Access::LOCAL_WRITE,
            lkey: LocalKey(9),
        };

        let sge = region.sge(0x1000, 0x100).unwrap();
        assert_eq!(sge.lkey, LocalKey(9));
        assert!(region.sge(0x10ff, 1).is_ok());
        assert!(region.sge(0x10ff, 2).is_err());
        assert!(region.sge(0xfff, 1).is_err());
        assert!(region.sge(u64::MAX, 2).is_err());
        assert!(region.require(Access::LOCAL_WRITE).is_ok());
    }
}
