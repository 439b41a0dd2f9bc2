//! Resource lifecycle of one device binding.
//!
//! Resources are allocated in a fixed order: protection domain, memory
//! region, send CQ, receive CQ, send buffer, receive buffer, queue pair.
//! The address handle is added later, once the path to the peer is known.
//! [`ResourceSet::teardown`] releases whatever exists in exactly the reverse
//! order and leaves the set empty, so it can run from any partial state and
//! any number of times.

use std::sync::Arc;

use udrv_verbs::{
    AccessFlags, AhHandle, CqHandle, DmaAddr, DmaBuf, DmaDirection, EventSink, MemoryRegion,
    PdHandle, QpCaps, QpInitAttr, QpType, QueuePair, SignalType, VerbsDevice,
};

use crate::config::EngineConfig;
use crate::error::{ResourceKind, SetupError};

/// Sizing for [`ResourceSet::allocate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceParams {
    pub cq_size: u32,
    pub buffer_len: usize,
}

impl From<&EngineConfig> for ResourceParams {
    fn from(config: &EngineConfig) -> Self {
        Self {
            cq_size: config.cq_size,
            buffer_len: config.buffer_len(),
        }
    }
}

/// A host buffer together with its device mapping.
#[derive(Debug, Clone)]
pub struct MappedBuf {
    pub buf: DmaBuf,
    pub addr: DmaAddr,
    pub direction: DmaDirection,
}

impl MappedBuf {
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

pub struct ResourceSet {
    device: Arc<dyn VerbsDevice>,
    pd: Option<PdHandle>,
    mr: Option<MemoryRegion>,
    send_cq: Option<CqHandle>,
    recv_cq: Option<CqHandle>,
    /// Completion notification requested on `recv_cq`.
    recv_cq_armed: bool,
    send_buf: Option<MappedBuf>,
    recv_buf: Option<MappedBuf>,
    qp: Option<QueuePair>,
    ah: Option<AhHandle>,
}

impl ResourceSet {
    /// An empty set bound to `device`.
    pub fn new(device: Arc<dyn VerbsDevice>) -> Self {
        Self {
            device,
            pd: None,
            mr: None,
            send_cq: None,
            recv_cq: None,
            recv_cq_armed: false,
            send_buf: None,
            recv_buf: None,
            qp: None,
            ah: None,
        }
    }

    /// Allocate every resource, tearing down the partial set on failure.
    pub fn setup(
        device: Arc<dyn VerbsDevice>,
        params: ResourceParams,
        events: &EventSink,
    ) -> Result<Self, SetupError> {
        let mut set = Self::new(device);
        if let Err(e) = set.allocate(params, events) {
            set.teardown();
            return Err(e);
        }
        Ok(set)
    }

    /// Allocate the resources that do not exist yet, stopping at the first
    /// failure. On error the set holds what was allocated before it.
    pub fn allocate(&mut self, params: ResourceParams, events: &EventSink) -> Result<(), SetupError> {
        let dev = Arc::clone(&self.device);

        let pd = match self.pd {
            Some(pd) => pd,
            None => {
                let pd = dev
                    .alloc_pd()
                    .map_err(SetupError::allocation(ResourceKind::ProtectionDomain))?;
                tracing::info!(device = dev.name(), pd = pd.0, "PD allocated");
                *self.pd.insert(pd)
            }
        };

        let lkey = match self.mr {
            Some(mr) => mr.lkey,
            None => {
                let mr = dev
                    .reg_dma_mr(pd, AccessFlags::LOCAL_WRITE)
                    .map_err(SetupError::allocation(ResourceKind::MemoryRegion))?;
                tracing::debug!(lkey = format_args!("{:#x}", mr.lkey), "DMA MR registered");
                self.mr.insert(mr).lkey
            }
        };

        let send_cq = match self.send_cq {
            Some(cq) => cq,
            None => *self.send_cq.insert(
                dev.create_cq(params.cq_size, None)
                    .map_err(SetupError::allocation(ResourceKind::SendCq))?,
            ),
        };

        let recv_cq = match self.recv_cq {
            Some(cq) => cq,
            None => *self.recv_cq.insert(
                dev.create_cq(params.cq_size, Some(events.clone()))
                    .map_err(SetupError::allocation(ResourceKind::RecvCq))?,
            ),
        };
        if !self.recv_cq_armed {
            dev.req_notify_cq(recv_cq)
                .map_err(SetupError::allocation(ResourceKind::RecvCq))?;
            self.recv_cq_armed = true;
            tracing::info!(cq_size = params.cq_size, "CQs allocated");
        }

        // The device reads what we send and writes what we receive.
        if self.send_buf.is_none() {
            self.send_buf = Some(map_zeroed(
                dev.as_ref(),
                params.buffer_len,
                DmaDirection::ToDevice,
                ResourceKind::SendBuffer,
            )?);
        }
        if self.recv_buf.is_none() {
            self.recv_buf = Some(map_zeroed(
                dev.as_ref(),
                params.buffer_len,
                DmaDirection::FromDevice,
                ResourceKind::RecvBuffer,
            )?);
        }

        if self.qp.is_none() {
            let init = QpInitAttr {
                qp_type: QpType::UnreliableDatagram,
                sq_sig_type: SignalType::AllWr,
                caps: QpCaps {
                    max_send_wr: params.cq_size,
                    max_recv_wr: params.cq_size,
                    max_send_sge: 1,
                    max_recv_sge: 1,
                },
                send_cq,
                recv_cq,
            };
            let qp = dev
                .create_qp(pd, &init, Some(events.clone()))
                .map_err(SetupError::allocation(ResourceKind::QueuePair))?;
            tracing::info!(qpn = format_args!("{:#x}", qp.qp_num), lkey, "QP created");
            self.qp = Some(qp);
        }

        Ok(())
    }

    /// Release everything in reverse creation order. Failures are logged
    /// and otherwise ignored. Returns the number of failed releases.
    pub fn teardown(&mut self) -> usize {
        let dev = Arc::clone(&self.device);
        let mut failures = 0;
        let mut check = |what: ResourceKind, result: Result<(), udrv_verbs::VerbsError>| {
            if let Err(e) = result {
                failures += 1;
                tracing::warn!(device = dev.name(), resource = %what, error = %e, "release failed");
            }
        };

        if let Some(ah) = self.ah.take() {
            check(ResourceKind::AddressHandle, dev.destroy_ah(ah));
        }
        if let Some(qp) = self.qp.take() {
            check(ResourceKind::QueuePair, dev.destroy_qp(qp.handle));
        }
        if let Some(b) = self.recv_buf.take() {
            check(
                ResourceKind::RecvBuffer,
                dev.unmap_buffer(b.addr, b.len(), b.direction),
            );
        }
        if let Some(b) = self.send_buf.take() {
            check(
                ResourceKind::SendBuffer,
                dev.unmap_buffer(b.addr, b.len(), b.direction),
            );
        }
        self.recv_cq_armed = false;
        if let Some(cq) = self.recv_cq.take() {
            check(ResourceKind::RecvCq, dev.destroy_cq(cq));
        }
        if let Some(cq) = self.send_cq.take() {
            check(ResourceKind::SendCq, dev.destroy_cq(cq));
        }
        if let Some(mr) = self.mr.take() {
            check(ResourceKind::MemoryRegion, dev.dereg_mr(mr));
        }
        if let Some(pd) = self.pd.take() {
            check(ResourceKind::ProtectionDomain, dev.dealloc_pd(pd));
        }

        failures
    }

    pub fn device(&self) -> &Arc<dyn VerbsDevice> {
        &self.device
    }

    pub fn pd(&self) -> Option<PdHandle> {
        self.pd
    }

    pub fn mr(&self) -> Option<MemoryRegion> {
        self.mr
    }

    pub fn send_cq(&self) -> Option<CqHandle> {
        self.send_cq
    }

    pub fn recv_cq(&self) -> Option<CqHandle> {
        self.recv_cq
    }

    pub fn send_buf(&self) -> Option<&MappedBuf> {
        self.send_buf.as_ref()
    }

    pub fn recv_buf(&self) -> Option<&MappedBuf> {
        self.recv_buf.as_ref()
    }

    pub fn qp(&self) -> Option<QueuePair> {
        self.qp
    }

    pub fn ah(&self) -> Option<AhHandle> {
        self.ah
    }

    /// Record the address handle so teardown releases it first.
    pub fn set_ah(&mut self, ah: AhHandle) {
        if let Some(old) = self.ah.replace(ah) {
            if let Err(e) = self.device.destroy_ah(old) {
                tracing::warn!(error = %e, "releasing replaced address handle failed");
            }
        }
    }

    /// Whether nothing is allocated.
    pub fn is_empty(&self) -> bool {
        self.pd.is_none()
            && self.mr.is_none()
            && self.send_cq.is_none()
            && self.recv_cq.is_none()
            && self.send_buf.is_none()
            && self.recv_buf.is_none()
            && self.qp.is_none()
            && self.ah.is_none()
    }
}

impl std::fmt::Debug for ResourceSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceSet")
            .field("device", &self.device.name())
            .field("pd", &self.pd)
            .field("mr", &self.mr)
            .field("send_cq", &self.send_cq)
            .field("recv_cq", &self.recv_cq)
            .field("recv_cq_armed", &self.recv_cq_armed)
            .field("send_buf", &self.send_buf)
            .field("recv_buf", &self.recv_buf)
            .field("qp", &self.qp)
            .field("ah", &self.ah)
            .finish()
    }
}

fn map_zeroed(
    dev: &dyn VerbsDevice,
    len: usize,
    direction: DmaDirection,
    kind: ResourceKind,
) -> Result<MappedBuf, SetupError> {
    let buf = DmaBuf::zeroed(len);
    let addr = dev
        .map_buffer(&buf, direction)
        .map_err(SetupError::allocation(kind))?;
    tracing::debug!(buffer = %kind, %addr, len, "buffer mapped");
    Ok(MappedBuf {
        buf,
        addr,
        direction,
    })
}
