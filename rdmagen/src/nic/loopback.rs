//! Implementation of a software loop-back device.
//!
//! The device keeps every verbs object as plain bookkeeping in memory and checks each call
//! against the rules real hardware enforces: queue pairs move through their states one at a time,
//! scatter entries lie in a region registered in the same protection domain with the rights the
//! request needs, work queues never hold more than their capacity and completion queues are never
//! overrun. Completions are delivered in submission order per queue pair.
//!
//! Frames are not copied. A send request is retired by the simulated hardware when a completion
//! queue is polled, and is then mirrored to every other queue pair carrying a capture-all filter
//! on the same port. Frames arriving from the outside are injected with [`Loopback::deliver`].
//!
//! Every post and every non-empty poll is recorded in an event log so that tests can check the
//! order in which the pipelines touched the device.
//!
//! [`Loopback::deliver`]: struct.Loopback.html#method.deliver
use std::collections::VecDeque;
use std::io;

use super::{Access, Completion, LocalKey, QpCaps, QpState, RecvRequest, SendRequest, Sge, Status};

/// Enumerates a fixed set of loop-back devices.
#[derive(Clone, Debug)]
pub struct Devices {
    names: Vec<String>,
    ports: u8,
    faults: Vec<Fault>,
}

/// A software loop-back device.
#[derive(Debug)]
pub struct Loopback {
    name: String,
    ports: u8,
    domains: usize,
    regions: Vec<Region>,
    cqs: Vec<CqState>,
    qps: Vec<QpEntry>,
    faults: Vec<Fault>,
    /// Send requests retired per poll, unlimited if `None`.
    progress: Option<usize>,
    drops: u64,
    log: Vec<Event>,
}

/// An operation that can be made to fail once.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Fault {
    /// Enumerating devices.
    DeviceList,
    /// Opening a device.
    Open,
    /// Allocating a protection domain.
    AllocDomain,
    /// Creating a completion queue.
    CreateCq,
    /// Creating a queue pair.
    CreateQp,
    /// Transitioning into the given state.
    Modify(QpState),
    /// Registering memory.
    Register,
    /// Installing a capture-all filter.
    CaptureAll,
    /// Posting send requests.
    PostSend,
    /// Posting receive requests.
    PostRecv,
    /// Polling a completion queue.
    Poll,
    /// Completing the next request with an error status instead of success.
    Status(u32),
}

/// An interaction of a pipeline with the device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// A chain of send requests was accepted.
    PostSend {
        /// Index of the queue pair.
        qp: usize,
        /// The requests, in chain order.
        requests: Vec<SendRequest>,
    },
    /// A chain of receive requests was accepted.
    PostRecv {
        /// Index of the queue pair.
        qp: usize,
        /// The requests, in chain order.
        requests: Vec<RecvRequest>,
    },
    /// A poll returned completions.
    Polled {
        /// Index of the completion queue.
        cq: usize,
        /// The completions returned, in order.
        completions: Vec<Completion>,
    },
}

/// A protection domain of the loop-back device.
#[derive(Debug)]
pub struct Domain(usize);

/// A completion queue of the loop-back device.
#[derive(Debug)]
pub struct Cq(usize);

/// A queue pair of the loop-back device.
#[derive(Debug)]
pub struct Qp(usize);

/// A capture-all filter of the loop-back device.
#[derive(Debug)]
pub struct Flow {
    _qp: usize,
}

#[derive(Debug)]
struct Region {
    domain: usize,
    base: u64,
    len: usize,
    access: Access,
    lkey: LocalKey,
}

#[derive(Debug)]
struct CqState {
    depth: usize,
    notify: bool,
    armed: bool,
    overrun: bool,
    entries: VecDeque<Completion>,
}

#[derive(Debug)]
struct QpEntry {
    domain: usize,
    cq: usize,
    caps: QpCaps,
    state: QpState,
    port: u8,
    capture: Option<u8>,
    sends: VecDeque<SendRequest>,
    recvs: VecDeque<RecvRequest>,
}

/// Offset of the lkeys handed out, so that an all-zero scatter entry never validates.
const LKEY_BASE: u32 = 0x100;

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

impl Devices {
    /// Devices with the given names, each with a single port.
    pub fn new<I, S>(names: I) -> Self
        where I: IntoIterator<Item = S>, S: Into<String>,
    {
        Devices {
            names: names.into_iter().map(Into::into).collect(),
            ports: 1,
            faults: Vec::new(),
        }
    }

    /// Set the number of ports of each device.
    pub fn with_ports(mut self, ports: u8) -> Self {
        self.ports = ports;
        self
    }

    /// Fail an operation once, on the enumeration or any device opened later.
    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.faults.push(fault);
        self
    }

    fn fault(&mut self, fault: Fault, code: i32) -> io::Result<()> {
        take_fault(&mut self.faults, fault, code)
    }
}

fn take_fault(faults: &mut Vec<Fault>, fault: Fault, code: i32) -> io::Result<()> {
    match faults.iter().position(|&f| f == fault) {
        Some(idx) => {
            faults.remove(idx);
            Err(errno(code))
        },
        None => Ok(()),
    }
}

impl super::Provider for Devices {
    type Device = Loopback;

    fn device_names(&mut self) -> io::Result<Vec<String>> {
        self.fault(Fault::DeviceList, libc::ENOSYS)?;
        Ok(self.names.clone())
    }

    fn open(&mut self, name: &str) -> io::Result<Loopback> {
        self.fault(Fault::Open, libc::EACCES)?;
        if !self.names.iter().any(|candidate| candidate == name) {
            return Err(errno(libc::ENODEV));
        }

        let mut device = Loopback::new(name);
        device.ports = self.ports;
        device.faults = self.faults.drain(..).collect();
        Ok(device)
    }
}

impl Loopback {
    /// A device with a single port.
    pub fn new(name: &str) -> Self {
        Loopback {
            name: name.to_owned(),
            ports: 1,
            domains: 0,
            regions: Vec::new(),
            cqs: Vec::new(),
            qps: Vec::new(),
            faults: Vec::new(),
            progress: None,
            drops: 0,
            log: Vec::new(),
        }
    }

    /// The name the device was opened with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fail an operation once.
    pub fn inject(&mut self, fault: Fault) {
        self.faults.push(fault);
    }

    /// Limit the number of send requests the hardware retires on each poll.
    ///
    /// With `None` all posted sends are retired on the next poll.
    pub fn set_progress(&mut self, progress: Option<usize>) {
        self.progress = progress;
    }

    /// Frames from outside arriving on `port`, each of `len` bytes.
    ///
    /// Every queue pair capturing the port and ready to receive consumes one posted receive
    /// request per frame. A frame finding no posted request is dropped. Returns the number of
    /// frames received by at least one queue pair.
    pub fn deliver(&mut self, port: u8, frames: usize, len: u32) -> io::Result<usize> {
        let mut received = 0;
        for _ in 0..frames {
            if self.mirror(None, port, len)? {
                received += 1;
            }
        }
        Ok(received)
    }

    /// The number of frames dropped for lack of a posted receive request.
    pub fn drops(&self) -> u64 {
        self.drops
    }

    /// The state of a queue pair.
    pub fn qp_state(&self, qp: &Qp) -> QpState {
        self.qps[qp.0].state
    }

    /// The port a queue pair is bound to, zero before `Init`.
    pub fn qp_port(&self, qp: &Qp) -> u8 {
        self.qps[qp.0].port
    }

    /// The capacities a queue pair was created with.
    pub fn qp_caps(&self, qp: &Qp) -> QpCaps {
        self.qps[qp.0].caps
    }

    /// Whether a capture-all filter is installed on the queue pair.
    pub fn is_capturing(&self, qp: &Qp) -> bool {
        self.qps[qp.0].capture.is_some()
    }

    /// Send requests posted but not yet retired by the hardware.
    pub fn sends_queued(&self, qp: &Qp) -> usize {
        self.qps[qp.0].sends.len()
    }

    /// Receive requests posted and not yet consumed by a frame.
    pub fn recvs_queued(&self, qp: &Qp) -> usize {
        self.qps[qp.0].recvs.len()
    }

    /// The depth a completion queue was created with.
    pub fn cq_depth(&self, cq: &Cq) -> usize {
        self.cqs[cq.0].depth
    }

    /// Completions waiting to be polled.
    pub fn cq_pending(&self, cq: &Cq) -> usize {
        self.cqs[cq.0].entries.len()
    }

    /// The recorded interactions, oldest first.
    pub fn log(&self) -> &[Event] {
        &self.log
    }

    /// Remove and return the recorded interactions.
    pub fn take_log(&mut self) -> Vec<Event> {
        core::mem::take(&mut self.log)
    }

    fn fault(&mut self, fault: Fault, code: i32) -> io::Result<()> {
        take_fault(&mut self.faults, fault, code)
    }

    fn status(&mut self) -> Status {
        let idx = self.faults.iter().position(|f| matches!(f, Fault::Status(_)));
        match idx.map(|idx| self.faults.remove(idx)) {
            Some(Fault::Status(code)) => Status(code),
            _ => Status::SUCCESS,
        }
    }

    fn check_sge(&self, domain: usize, sge: &Sge, required: Access) -> io::Result<()> {
        let region = self.regions.iter()
            .find(|region| region.lkey == sge.lkey && region.domain == domain)
            .ok_or_else(|| errno(libc::EINVAL))?;

        let end = sge.addr.checked_add(u64::from(sge.length))
            .ok_or_else(|| errno(libc::EINVAL))?;
        let region_end = region.base + region.len as u64;
        if sge.addr < region.base || end > region_end {
            return Err(errno(libc::EFAULT));
        }

        if !region.access.contains(required) {
            return Err(errno(libc::EACCES));
        }

        Ok(())
    }

    fn complete(&mut self, cq: usize, completion: Completion) {
        let cq = &mut self.cqs[cq];
        if cq.entries.len() >= cq.depth {
            cq.overrun = true;
        } else {
            cq.entries.push_back(completion);
        }
    }

    /// Offer one frame to every capturing queue pair except `from`.
    fn mirror(&mut self, from: Option<usize>, port: u8, len: u32) -> io::Result<bool> {
        let mut received = false;
        for idx in 0..self.qps.len() {
            if Some(idx) == from {
                continue;
            }

            let qp = &mut self.qps[idx];
            if qp.capture != Some(port) || !qp.state.can_receive() {
                continue;
            }

            let request = match qp.recvs.pop_front() {
                Some(request) => request,
                None => {
                    self.drops += 1;
                    tracing::trace!(qp = idx, "frame dropped, no receive posted");
                    continue;
                },
            };

            let cq = qp.cq;
            let status = self.status();
            self.complete(cq, Completion {
                id: request.id,
                status,
                byte_len: len.min(request.sge.length),
            });
            received = true;
        }
        Ok(received)
    }

    /// Let the hardware retire posted sends.
    fn transmit(&mut self, mut budget: usize) -> io::Result<()> {
        for idx in 0..self.qps.len() {
            while budget > 0 {
                let request = match self.qps[idx].sends.pop_front() {
                    Some(request) => request,
                    None => break,
                };
                budget -= 1;

                let status = if request.signaled { self.status() } else { Status::SUCCESS };
                if request.signaled || !status.is_success() {
                    let cq = self.qps[idx].cq;
                    self.complete(cq, Completion {
                        id: request.id,
                        status,
                        byte_len: 0,
                    });
                }

                let port = self.qps[idx].port;
                self.mirror(Some(idx), port, request.sge.length)?;
            }
        }
        Ok(())
    }
}

impl super::Device for Loopback {
    type Domain = Domain;
    type Cq = Cq;
    type Qp = Qp;
    type Flow = Flow;
    type SendChain = Box<[SendRequest]>;
    type RecvChain = Box<[RecvRequest]>;

    fn alloc_domain(&mut self) -> io::Result<Domain> {
        self.fault(Fault::AllocDomain, libc::ENOMEM)?;
        self.domains += 1;
        Ok(Domain(self.domains - 1))
    }

    fn create_cq(&mut self, depth: u32, notify: bool) -> io::Result<Cq> {
        self.fault(Fault::CreateCq, libc::ENOMEM)?;
        if depth == 0 {
            return Err(errno(libc::EINVAL));
        }

        self.cqs.push(CqState {
            depth: depth as usize,
            notify,
            armed: false,
            overrun: false,
            entries: VecDeque::new(),
        });
        Ok(Cq(self.cqs.len() - 1))
    }

    fn create_qp(&mut self, domain: &Domain, cq: &Cq, caps: QpCaps) -> io::Result<Qp> {
        self.fault(Fault::CreateQp, libc::ENOMEM)?;
        if domain.0 >= self.domains || cq.0 >= self.cqs.len() {
            return Err(errno(libc::EINVAL));
        }

        self.qps.push(QpEntry {
            domain: domain.0,
            cq: cq.0,
            caps,
            state: QpState::Reset,
            port: 0,
            capture: None,
            sends: VecDeque::new(),
            recvs: VecDeque::new(),
        });
        Ok(Qp(self.qps.len() - 1))
    }

    fn modify_qp(&mut self, qp: &mut Qp, state: QpState, port: u8) -> io::Result<()> {
        self.fault(Fault::Modify(state), libc::EINVAL)?;
        let ports = self.ports;
        let entry = &mut self.qps[qp.0];
        if entry.state.next() != Some(state) {
            return Err(errno(libc::EINVAL));
        }

        if state == QpState::Init {
            if port == 0 || port > ports {
                return Err(errno(libc::EINVAL));
            }
            entry.port = port;
        }

        entry.state = state;
        Ok(())
    }

    fn register(&mut self, domain: &Domain, addr: u64, len: usize, access: Access)
        -> io::Result<LocalKey>
    {
        self.fault(Fault::Register, libc::EFAULT)?;
        if domain.0 >= self.domains || addr == 0 || len == 0 {
            return Err(errno(libc::EINVAL));
        }

        let lkey = LocalKey(LKEY_BASE + self.regions.len() as u32);
        self.regions.push(Region {
            domain: domain.0,
            base: addr,
            len,
            access,
            lkey,
        });
        Ok(lkey)
    }

    fn send_chain(&mut self, requests: &[SendRequest]) -> Box<[SendRequest]> {
        requests.into()
    }

    fn recv_chain(&mut self, requests: &[RecvRequest]) -> Box<[RecvRequest]> {
        requests.into()
    }

    fn post_send(&mut self, qp: &mut Qp, chain: &mut Box<[SendRequest]>) -> io::Result<()> {
        self.fault(Fault::PostSend, libc::ENOMEM)?;
        let entry = &self.qps[qp.0];
        if !entry.state.can_send() {
            return Err(errno(libc::EINVAL));
        }

        if entry.sends.len() + chain.len() > entry.caps.max_send as usize {
            return Err(errno(libc::ENOMEM));
        }

        let domain = entry.domain;
        for request in chain.iter() {
            self.check_sge(domain, &request.sge, Access::NONE)?;
        }

        self.qps[qp.0].sends.extend(chain.iter().copied());
        self.log.push(Event::PostSend { qp: qp.0, requests: chain.to_vec() });
        Ok(())
    }

    fn post_recv(&mut self, qp: &mut Qp, chain: &mut Box<[RecvRequest]>) -> io::Result<()> {
        self.fault(Fault::PostRecv, libc::ENOMEM)?;
        let entry = &self.qps[qp.0];
        if entry.state < QpState::Init {
            return Err(errno(libc::EINVAL));
        }

        if entry.recvs.len() + chain.len() > entry.caps.max_recv as usize {
            return Err(errno(libc::ENOMEM));
        }

        let domain = entry.domain;
        for request in chain.iter() {
            self.check_sge(domain, &request.sge, Access::LOCAL_WRITE)?;
        }

        self.qps[qp.0].recvs.extend(chain.iter().copied());
        self.log.push(Event::PostRecv { qp: qp.0, requests: chain.to_vec() });
        Ok(())
    }

    fn poll(&mut self, cq: &mut Cq, out: &mut [Completion]) -> io::Result<usize> {
        self.fault(Fault::Poll, libc::EIO)?;
        let budget = self.progress.unwrap_or(usize::MAX);
        self.transmit(budget)?;

        let state = &mut self.cqs[cq.0];
        if state.overrun {
            return Err(errno(libc::EOVERFLOW));
        }

        let n = out.len().min(state.entries.len());
        for (slot, entry) in out.iter_mut().zip(state.entries.drain(..n)) {
            *slot = entry;
        }

        if n > 0 {
            self.log.push(Event::Polled { cq: cq.0, completions: out[..n].to_vec() });
        }
        Ok(n)
    }

    fn arm(&mut self, cq: &mut Cq) -> io::Result<()> {
        let state = &mut self.cqs[cq.0];
        if !state.notify {
            return Err(errno(libc::EOPNOTSUPP));
        }
        state.armed = true;
        Ok(())
    }

    fn wait(&mut self, cq: &mut Cq) -> io::Result<()> {
        if !self.cqs[cq.0].armed {
            return Err(errno(libc::EINVAL));
        }

        // Waiting gives the hardware all the time it needs.
        self.transmit(usize::MAX)?;
        let state = &mut self.cqs[cq.0];
        if state.entries.is_empty() {
            // Nothing in flight could ever complete.
            return Err(io::ErrorKind::TimedOut.into());
        }

        state.armed = false;
        Ok(())
    }

    fn capture_all(&mut self, qp: &mut Qp, port: u8) -> io::Result<Flow> {
        self.fault(Fault::CaptureAll, libc::EOPNOTSUPP)?;
        let entry = &mut self.qps[qp.0];
        if entry.state < QpState::Init || entry.port != port {
            return Err(errno(libc::EINVAL));
        }

        entry.capture = Some(port);
        Ok(Flow { _qp: qp.0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nic::{Device, Provider};

    fn ready(device: &mut Loopback, caps: QpCaps, depth: u32) -> (Domain, Cq, Qp) {
        let domain = device.alloc_domain().unwrap();
        let cq = device.create_cq(depth, true).unwrap();
        let mut qp = device.create_qp(&domain, &cq, caps).unwrap();
        for state in [QpState::Init, QpState::ReadyToReceive, QpState::ReadyToSend] {
            device.modify_qp(&mut qp, state, 1).unwrap();
        }
        (domain, cq, qp)
    }

    #[test]
    fn open_by_name() {
        let mut devices = Devices::new(["mlx5_0", "mlx5_1"]);
        assert_eq!(devices.device_names().unwrap(), ["mlx5_0", "mlx5_1"]);
        assert_eq!(devices.open("mlx5_1").unwrap().name(), "mlx5_1");
        let err = devices.open("eth0").unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENODEV));
    }

    #[test]
    fn states_one_at_a_time() {
        let mut device = Loopback::new("lo");
        let domain = device.alloc_domain().unwrap();
        let cq = device.create_cq(1, false).unwrap();
        let mut qp = device.create_qp(&domain, &cq, QpCaps::default()).unwrap();

        assert!(device.modify_qp(&mut qp, QpState::ReadyToReceive, 1).is_err());
        assert!(device.modify_qp(&mut qp, QpState::Init, 2).is_err());
        device.modify_qp(&mut qp, QpState::Init, 1).unwrap();
        assert_eq!(device.qp_port(&qp), 1);
        assert!(device.modify_qp(&mut qp, QpState::Init, 1).is_err());
        assert_eq!(device.qp_state(&qp), QpState::Init);
    }

    #[test]
    fn send_checks() {
        let mut device = Loopback::new("lo");
        let caps = QpCaps { max_send: 2, max_recv: 0 };
        let (domain, mut cq, mut qp) = ready(&mut device, caps, 2);
        let lkey = device.register(&domain, 0x1000, 64, Access::NONE).unwrap();

        let good = SendRequest { id: 7, sge: Sge { addr: 0x1000, length: 64, lkey }, signaled: true };
        let outside = SendRequest { sge: Sge { addr: 0x1001, ..good.sge }, ..good };
        let unknown = SendRequest { sge: Sge { lkey: LocalKey(0), ..good.sge }, ..good };

        let mut chain = device.send_chain(&[outside]);
        assert_eq!(device.post_send(&mut qp, &mut chain).unwrap_err().raw_os_error(), Some(libc::EFAULT));
        let mut chain = device.send_chain(&[unknown]);
        assert!(device.post_send(&mut qp, &mut chain).is_err());

        let mut chain = device.send_chain(&[good, good, good]);
        assert_eq!(device.post_send(&mut qp, &mut chain).unwrap_err().raw_os_error(), Some(libc::ENOMEM));

        let mut chain = device.send_chain(&[SendRequest { signaled: false, ..good }, good]);
        device.post_send(&mut qp, &mut chain).unwrap();
        assert_eq!(device.sends_queued(&qp), 2);

        let mut out = [Completion::default(); 4];
        assert_eq!(device.poll(&mut cq, &mut out).unwrap(), 1);
        assert_eq!(out[0].id, 7);
        assert_eq!(device.sends_queued(&qp), 0);
    }

    #[test]
    fn receive_requires_write_access() {
        let mut device = Loopback::new("lo");
        let caps = QpCaps { max_send: 0, max_recv: 4 };
        let (domain, _, mut qp) = ready(&mut device, caps, 4);
        let lkey = device.register(&domain, 0x1000, 64, Access::NONE).unwrap();
        let request = RecvRequest { id: 0, sge: Sge { addr: 0x1000, length: 64, lkey } };
        let mut chain = device.recv_chain(&[request]);
        let err = device.post_recv(&mut qp, &mut chain).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EACCES));
    }

    #[test]
    fn capture_and_drop() {
        let mut device = Loopback::new("lo");
        let caps = QpCaps { max_send: 0, max_recv: 2 };
        let (domain, mut cq, mut qp) = ready(&mut device, caps, 2);
        let lkey = device.register(&domain, 0x1000, 128, Access::LOCAL_WRITE).unwrap();

        let requests = [
            RecvRequest { id: 0, sge: Sge { addr: 0x1000, length: 64, lkey } },
            RecvRequest { id: 1, sge: Sge { addr: 0x1040, length: 64, lkey } },
        ];
        let mut chain = device.recv_chain(&requests);
        device.post_recv(&mut qp, &mut chain).unwrap();

        // Nothing arrives without a filter.
        assert_eq!(device.deliver(1, 1, 60).unwrap(), 0);
        device.capture_all(&mut qp, 1).unwrap();
        assert_eq!(device.deliver(1, 3, 100).unwrap(), 2);
        assert_eq!(device.drops(), 1);

        let mut out = [Completion::default(); 4];
        assert_eq!(device.poll(&mut cq, &mut out).unwrap(), 2);
        assert_eq!((out[0].id, out[0].byte_len), (0, 64));
        assert_eq!(out[1].id, 1);
    }

    #[test]
    fn overrun_is_sticky() {
        let mut device = Loopback::new("lo");
        let caps = QpCaps { max_send: 4, max_recv: 0 };
        let (domain, mut cq, mut qp) = ready(&mut device, caps, 1);
        let lkey = device.register(&domain, 0x1000, 64, Access::NONE).unwrap();
        let request = SendRequest { id: 0, sge: Sge { addr: 0x1000, length: 64, lkey }, signaled: true };
        let mut chain = device.send_chain(&[request, request]);
        device.post_send(&mut qp, &mut chain).unwrap();

        let mut out = [Completion::default(); 1];
        let err = device.poll(&mut cq, &mut out).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EOVERFLOW));
    }

    #[test]
    fn wait_without_work_times_out() {
        let mut device = Loopback::new("lo");
        let caps = QpCaps { max_send: 1, max_recv: 0 };
        let (_, mut cq, _) = ready(&mut device, caps, 1);
        assert!(device.wait(&mut cq).is_err());
        device.arm(&mut cq).unwrap();
        assert_eq!(device.wait(&mut cq).unwrap_err().kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn faults_fire_once() {
        let mut device = Loopback::new("lo");
        device.inject(Fault::AllocDomain);
        assert!(device.alloc_domain().is_err());
        assert!(device.alloc_domain().is_ok());
    }
}
