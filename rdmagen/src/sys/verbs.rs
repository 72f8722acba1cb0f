//! The libibverbs transport.
//!
//! Raw packet queue pairs on an RDMA capable card, e.g. mlx5. Objects are created once during
//! bring-up and never destroyed; the process exits with them alive.
use core::{mem, ptr};
use std::ffi::CStr;
use std::io;
use std::os::raw::c_void;

use ibverbs_sys as ffi;

use crate::nic::{self, Access, Completion, LocalKey, QpCaps, QpState, RecvRequest, SendRequest};

/// Enumerates the devices of libibverbs.
#[derive(Debug, Default)]
pub struct Verbs {
    _private: (),
}

/// An opened device context.
pub struct VerbsDevice {
    ctx: *mut ffi::ibv_context,
    /// Scratch entries for `poll`, grown to the largest request seen.
    wc: Vec<ffi::ibv_wc>,
}

/// A protection domain.
pub struct Domain(*mut ffi::ibv_pd);

/// A completion queue, optionally with its notification channel.
pub struct Cq {
    cq: *mut ffi::ibv_cq,
    channel: *mut ffi::ibv_comp_channel,
}

/// A raw packet queue pair.
pub struct Qp(*mut ffi::ibv_qp);

/// A flow steering rule.
pub struct Flow {
    _flow: *mut ffi::ibv_flow,
}

/// Linked send work requests with their scatter entries.
///
/// Both are boxed so that the links stay valid when the chain is moved.
pub struct SendChain {
    sges: Box<[ffi::ibv_sge]>,
    wrs: Box<[ffi::ibv_send_wr]>,
}

/// Linked receive work requests with their scatter entries.
pub struct RecvChain {
    sges: Box<[ffi::ibv_sge]>,
    wrs: Box<[ffi::ibv_recv_wr]>,
}

/// Owns the array returned by `ibv_get_device_list`.
struct DeviceList {
    list: *mut *mut ffi::ibv_device,
    len: usize,
}

/// The filter attributes followed by no specification, matching everything.
#[repr(C)]
struct SnifferAttr {
    attr: ffi::ibv_flow_attr,
}

impl DeviceList {
    fn get() -> io::Result<Self> {
        let mut n = 0i32;
        let list = unsafe { ffi::ibv_get_device_list(&mut n as *mut _) };
        if list.is_null() {
            return Err(io::Error::last_os_error());
        }

        Ok(DeviceList { list, len: n as usize })
    }

    fn iter(&self) -> impl Iterator<Item = (*mut ffi::ibv_device, String)> + '_ {
        (0..self.len).map(move |i| {
            let dev = unsafe { *self.list.add(i) };
            let name = unsafe { CStr::from_ptr(ffi::ibv_get_device_name(dev)) };
            (dev, name.to_string_lossy().into_owned())
        })
    }
}

impl Drop for DeviceList {
    fn drop(&mut self) {
        unsafe { ffi::ibv_free_device_list(self.list) };
    }
}

impl nic::Provider for Verbs {
    type Device = VerbsDevice;

    fn device_names(&mut self) -> io::Result<Vec<String>> {
        let list = DeviceList::get()?;
        let names = list.iter().map(|(_, name)| name).collect();
        Ok(names)
    }

    fn open(&mut self, name: &str) -> io::Result<VerbsDevice> {
        let list = DeviceList::get()?;
        let dev = list.iter()
            .find(|(_, candidate)| candidate == name)
            .map(|(dev, _)| dev)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENODEV))?;

        let ctx = unsafe { ffi::ibv_open_device(dev) };
        if ctx.is_null() {
            return Err(io::Error::last_os_error());
        }

        Ok(VerbsDevice { ctx, wc: Vec::new() })
    }
}

impl VerbsDevice {
    fn ops(&mut self) -> &mut ffi::ibv_context_ops {
        unsafe { &mut (*self.ctx).ops }
    }

    /// The extended context, if the provider library supports it.
    fn extended(&mut self) -> Option<&mut ffi::verbs_context> {
        let ctx = unsafe { &mut *self.ctx };
        if ctx.abi_compat != usize::MAX as *mut c_void {
            return None;
        }

        let offset = mem::offset_of!(ffi::verbs_context, context);
        let vctx = unsafe {
            &mut *((self.ctx as *mut u8).sub(offset) as *mut ffi::verbs_context)
        };
        Some(vctx)
    }
}

fn unsupported() -> io::Error {
    io::Error::from_raw_os_error(libc::EOPNOTSUPP)
}

fn check(errno: i32) -> io::Result<()> {
    if errno != 0 {
        Err(io::Error::from_raw_os_error(errno))
    } else {
        Ok(())
    }
}

fn sge(sge: &nic::Sge) -> ffi::ibv_sge {
    ffi::ibv_sge {
        addr: sge.addr,
        length: sge.length,
        lkey: sge.lkey.0,
    }
}

impl nic::Device for VerbsDevice {
    type Domain = Domain;
    type Cq = Cq;
    type Qp = Qp;
    type Flow = Flow;
    type SendChain = SendChain;
    type RecvChain = RecvChain;

    fn alloc_domain(&mut self) -> io::Result<Domain> {
        let pd = unsafe { ffi::ibv_alloc_pd(self.ctx) };
        if pd.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(Domain(pd))
    }

    fn create_cq(&mut self, depth: u32, notify: bool) -> io::Result<Cq> {
        let channel = if notify {
            let channel = unsafe { ffi::ibv_create_comp_channel(self.ctx) };
            if channel.is_null() {
                return Err(io::Error::last_os_error());
            }
            channel
        } else {
            ptr::null_mut()
        };

        let cq = unsafe {
            ffi::ibv_create_cq(self.ctx, depth as i32, ptr::null_mut(), channel, 0)
        };
        if cq.is_null() {
            return Err(io::Error::last_os_error());
        }

        Ok(Cq { cq, channel })
    }

    fn create_qp(&mut self, domain: &Domain, cq: &Cq, caps: QpCaps) -> io::Result<Qp> {
        let mut attr = ffi::ibv_qp_init_attr {
            qp_context: ptr::null_mut(),
            send_cq: cq.cq,
            recv_cq: cq.cq,
            srq: ptr::null_mut(),
            cap: ffi::ibv_qp_cap {
                max_send_wr: caps.max_send,
                max_recv_wr: caps.max_recv,
                max_send_sge: 1,
                max_recv_sge: 1,
                max_inline_data: 0,
            },
            qp_type: ffi::ibv_qp_type::IBV_QPT_RAW_PACKET,
            sq_sig_all: 0,
        };

        let qp = unsafe { ffi::ibv_create_qp(domain.0, &mut attr as *mut _) };
        if qp.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(Qp(qp))
    }

    fn modify_qp(&mut self, qp: &mut Qp, state: QpState, port: u8) -> io::Result<()> {
        let mut attr = ffi::ibv_qp_attr::default();
        let mut mask = ffi::ibv_qp_attr_mask::IBV_QP_STATE;
        attr.qp_state = match state {
            QpState::Reset => ffi::ibv_qp_state::IBV_QPS_RESET,
            QpState::Init => ffi::ibv_qp_state::IBV_QPS_INIT,
            QpState::ReadyToReceive => ffi::ibv_qp_state::IBV_QPS_RTR,
            QpState::ReadyToSend => ffi::ibv_qp_state::IBV_QPS_RTS,
        };
        if state == QpState::Init {
            attr.port_num = port;
            mask = mask | ffi::ibv_qp_attr_mask::IBV_QP_PORT;
        }

        let errno = unsafe { ffi::ibv_modify_qp(qp.0, &mut attr as *mut _, mask.0 as i32) };
        check(errno)
    }

    fn register(&mut self, domain: &Domain, addr: u64, len: usize, access: Access)
        -> io::Result<LocalKey>
    {
        let mr = unsafe {
            ffi::ibv_reg_mr(domain.0, addr as *mut c_void, len, access.bits() as i32)
        };
        if mr.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(LocalKey(unsafe { (*mr).lkey }))
    }

    fn send_chain(&mut self, requests: &[SendRequest]) -> SendChain {
        let sges: Box<[_]> = requests.iter().map(|req| sge(&req.sge)).collect();
        let wrs: Box<[_]> = requests.iter().map(|req| ffi::ibv_send_wr {
            wr_id: req.id,
            next: ptr::null_mut(),
            sg_list: ptr::null_mut(),
            num_sge: 1,
            opcode: ffi::ibv_wr_opcode::IBV_WR_SEND,
            send_flags: if req.signaled { ffi::ibv_send_flags::IBV_SEND_SIGNALED.0 } else { 0 },
            wr: Default::default(),
            qp_type: Default::default(),
            __bindgen_anon_1: Default::default(),
            __bindgen_anon_2: Default::default(),
        }).collect();

        let mut chain = SendChain { sges, wrs };
        let (wrs, sges) = (chain.wrs.as_mut_ptr(), chain.sges.as_mut_ptr());
        for i in 0..chain.wrs.len() {
            unsafe {
                (*wrs.add(i)).sg_list = sges.add(i);
                if i + 1 < chain.wrs.len() {
                    (*wrs.add(i)).next = wrs.add(i + 1);
                }
            }
        }
        chain
    }

    fn recv_chain(&mut self, requests: &[RecvRequest]) -> RecvChain {
        let sges: Box<[_]> = requests.iter().map(|req| sge(&req.sge)).collect();
        let wrs: Box<[_]> = requests.iter().map(|req| ffi::ibv_recv_wr {
            wr_id: req.id,
            next: ptr::null_mut(),
            sg_list: ptr::null_mut(),
            num_sge: 1,
        }).collect();

        let mut chain = RecvChain { sges, wrs };
        let (wrs, sges) = (chain.wrs.as_mut_ptr(), chain.sges.as_mut_ptr());
        for i in 0..chain.wrs.len() {
            unsafe {
                (*wrs.add(i)).sg_list = sges.add(i);
                if i + 1 < chain.wrs.len() {
                    (*wrs.add(i)).next = wrs.add(i + 1);
                }
            }
        }
        chain
    }

    fn post_send(&mut self, qp: &mut Qp, chain: &mut SendChain) -> io::Result<()> {
        let first = chain.wrs.as_mut_ptr();
        let mut bad_wr: *mut ffi::ibv_send_wr = ptr::null_mut();
        let post = self.ops().post_send.as_mut().ok_or_else(unsupported)?;
        let errno = unsafe { post(qp.0, first, &mut bad_wr as *mut _) };
        check(errno)
    }

    fn post_recv(&mut self, qp: &mut Qp, chain: &mut RecvChain) -> io::Result<()> {
        let first = chain.wrs.as_mut_ptr();
        let mut bad_wr: *mut ffi::ibv_recv_wr = ptr::null_mut();
        let post = self.ops().post_recv.as_mut().ok_or_else(unsupported)?;
        let errno = unsafe { post(qp.0, first, &mut bad_wr as *mut _) };
        check(errno)
    }

    fn poll(&mut self, cq: &mut Cq, out: &mut [Completion]) -> io::Result<usize> {
        if self.wc.len() < out.len() {
            let missing = out.len() - self.wc.len();
            self.wc.extend(core::iter::repeat_with(ffi::ibv_wc::default).take(missing));
        }

        let poll = unsafe { (*self.ctx).ops.poll_cq.as_mut() }.ok_or_else(unsupported)?;
        let n = unsafe { poll(cq.cq, out.len() as i32, self.wc.as_mut_ptr()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        let n = n as usize;
        for (wc, entry) in self.wc[..n].iter().zip(out.iter_mut()) {
            *entry = Completion {
                id: wc.wr_id,
                status: nic::Status(wc.status as u32),
                byte_len: wc.byte_len,
            };
        }
        Ok(n)
    }

    fn arm(&mut self, cq: &mut Cq) -> io::Result<()> {
        if cq.channel.is_null() {
            return Err(unsupported());
        }
        let notify = self.ops().req_notify_cq.as_mut().ok_or_else(unsupported)?;
        let errno = unsafe { notify(cq.cq, 0) };
        check(errno)
    }

    fn wait(&mut self, cq: &mut Cq) -> io::Result<()> {
        if cq.channel.is_null() {
            return Err(unsupported());
        }

        let mut ev_cq: *mut ffi::ibv_cq = ptr::null_mut();
        let mut ev_ctx: *mut c_void = ptr::null_mut();
        let res = unsafe { ffi::ibv_get_cq_event(cq.channel, &mut ev_cq, &mut ev_ctx) };
        if res != 0 {
            return Err(io::Error::last_os_error());
        }

        unsafe { ffi::ibv_ack_cq_events(ev_cq, 1) };
        Ok(())
    }

    fn capture_all(&mut self, qp: &mut Qp, port: u8) -> io::Result<Flow> {
        let vctx = self.extended().ok_or_else(unsupported)?;
        let needed = mem::size_of::<ffi::verbs_context>()
            - mem::offset_of!(ffi::verbs_context, ibv_create_flow);
        if vctx.sz < needed {
            return Err(unsupported());
        }
        let create = vctx.ibv_create_flow.as_mut().ok_or_else(unsupported)?;

        let mut sniffer = SnifferAttr {
            attr: ffi::ibv_flow_attr {
                comp_mask: 0,
                type_: ffi::ibv_flow_attr_type::IBV_FLOW_ATTR_SNIFFER,
                size: mem::size_of::<SnifferAttr>() as u16,
                priority: 0,
                num_of_specs: 0,
                port,
                flags: 0,
            },
        };

        let flow = unsafe { create(qp.0, &mut sniffer.attr as *mut _) };
        if flow.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(Flow { _flow: flow })
    }
}
