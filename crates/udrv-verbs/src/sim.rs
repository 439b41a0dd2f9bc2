//! In-process simulated verbs fabric.
//!
//! A [`SimFabric`] is one subnet. Devices added to it get a LID and a GID and
//! can exchange unreliable datagrams: a send on one device lands in the first
//! posted receive of the queue pair named by the address handle's LID and the
//! work request's remote QPN, provided that queue pair is at least ready to
//! receive and its Q_Key matches. As on real hardware, the receive buffer gets
//! a 40-byte global route header area ahead of the payload, and a datagram
//! with no posted receive is silently dropped.
//!
//! The simulator also enforces the rules the engine must respect (legal UD
//! transitions and attribute masks, queue depths, DMA directions, destroy
//! ordering) and records enough to let tests assert on them: a bounded log
//! of recent calls and posted work requests, per-operation call counts, live
//! objects and releases of unknown handles.
//! Failures can be injected per device and operation.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::buf::DmaBuf;
use crate::device::{DeviceAttr, LinkLayer, PortAttr, PortState, VerbsDevice};
use crate::error::libc_errno::{EBUSY, EINTR, EINVAL, ENOMEM, EOPNOTSUPP, ETIMEDOUT};
use crate::error::VerbsError;
use crate::event::{EventSink, QpEventKind, VerbsEvent};
use crate::types::{
    AccessFlags, AhAttr, AhHandle, CqHandle, DmaAddr, DmaDirection, Gid, GlobalRoute,
    MemoryRegion, MrHandle, PathQuery, PathRecord, PdHandle, QpAttr, QpAttrMask, QpHandle,
    QpInitAttr, QpState, QpType, QueryId, QueuePair, RecvWr, SendWr, WcOpcode, WcStatus,
    WorkCompletion,
};

/// Size of the global route header area written ahead of every datagram.
pub const GRH_LEN: usize = 40;

/// Largest datagram payload a simulated port accepts.
pub const SIM_MAX_MSG: u32 = 2048;

const SIM_MAX_CQE: u32 = 4096;
const SIM_MAX_QP_WR: u32 = 4096;
const SIM_MAX_SGE: u32 = 16;
const SIM_SM_LID: u16 = 1;
const SIM_DEFAULT_PKEY: u16 = 0xffff;
const SIM_PORT: u8 = 1;
const SUBNET_PREFIX: u64 = 0xfe80_0000_0000_0000;
const GUID_BASE: u64 = 0x0002_c903_0000_0000;
const DMA_BASE: u64 = 0x1_0000_0000;

/// Entries kept in each recorded history; older ones are dropped.
pub const HISTORY_LEN: usize = 4096;

/// Operations recorded in the call log and targetable by failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    QueryDevice,
    QueryPort,
    QueryPkey,
    QueryGid,
    AllocPd,
    DeallocPd,
    RegMr,
    DeregMr,
    CreateCq,
    DestroyCq,
    ReqNotifyCq,
    PollCq,
    MapBuffer,
    UnmapBuffer,
    CreateQp,
    DestroyQp,
    ModifyQp,
    QueryQp,
    PostSend,
    PostRecv,
    QueryPath,
    CancelPathQuery,
    InitAhFromPath,
    CreateAh,
    DestroyAh,
}

impl SimOp {
    pub fn name(self) -> &'static str {
        match self {
            SimOp::QueryDevice => "query_device",
            SimOp::QueryPort => "query_port",
            SimOp::QueryPkey => "query_pkey",
            SimOp::QueryGid => "query_gid",
            SimOp::AllocPd => "alloc_pd",
            SimOp::DeallocPd => "dealloc_pd",
            SimOp::RegMr => "reg_dma_mr",
            SimOp::DeregMr => "dereg_mr",
            SimOp::CreateCq => "create_cq",
            SimOp::DestroyCq => "destroy_cq",
            SimOp::ReqNotifyCq => "req_notify_cq",
            SimOp::PollCq => "poll_cq",
            SimOp::MapBuffer => "map_buffer",
            SimOp::UnmapBuffer => "unmap_buffer",
            SimOp::CreateQp => "create_qp",
            SimOp::DestroyQp => "destroy_qp",
            SimOp::ModifyQp => "modify_qp",
            SimOp::QueryQp => "query_qp",
            SimOp::PostSend => "post_send",
            SimOp::PostRecv => "post_recv",
            SimOp::QueryPath => "query_path",
            SimOp::CancelPathQuery => "cancel_path_query",
            SimOp::InitAhFromPath => "init_ah_from_path",
            SimOp::CreateAh => "create_ah",
            SimOp::DestroyAh => "destroy_ah",
        }
    }
}

/// How the fabric answers path-record queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PathMode {
    /// Complete every query as soon as it is issued.
    #[default]
    Auto,
    /// Hold queries until [`SimFabric::complete_pending_paths`] or
    /// [`SimFabric::fail_pending_paths`] is called.
    Manual,
    /// Complete every query with `-ETIMEDOUT`.
    Timeout,
}

/// Objects currently allocated on one device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveObjects {
    pub pds: usize,
    pub mrs: usize,
    pub cqs: usize,
    pub qps: usize,
    pub ahs: usize,
    pub mappings: usize,
}

impl LiveObjects {
    pub fn is_empty(&self) -> bool {
        *self == LiveObjects::default()
    }
}

struct DeviceEntry {
    lid: u16,
    gid: Gid,
}

struct MrEntry {
    device: usize,
    pd: u32,
    lkey: u32,
}

struct CqEntry {
    device: usize,
    capacity: u32,
    entries: VecDeque<WorkCompletion>,
    armed: bool,
    notify: Option<EventSink>,
    overflows: usize,
}

struct Mapping {
    device: usize,
    buf: DmaBuf,
    direction: DmaDirection,
}

struct QpEntry {
    device: usize,
    pd: u32,
    qp_num: u32,
    init: QpInitAttr,
    attr: QpAttr,
    recv_queue: VecDeque<RecvWr>,
    outstanding_sends: u32,
    events: Option<EventSink>,
}

struct AhEntry {
    device: usize,
    pd: u32,
    dlid: u16,
}

struct PendingQuery {
    device: usize,
    query: PathQuery,
    sink: EventSink,
}

/// The most recent `HISTORY_LEN` entries of an append-only log.
struct History<T> {
    entries: VecDeque<T>,
}

impl<T> Default for History<T> {
    fn default() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }
}

impl<T> History<T> {
    fn push(&mut self, entry: T) {
        if self.entries.len() == HISTORY_LEN {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }
}

struct Fabric {
    next_handle: u32,
    next_qpn: u32,
    next_query: u64,
    next_dma: u64,
    devices: Vec<DeviceEntry>,
    pds: HashMap<u32, usize>,
    mrs: HashMap<u32, MrEntry>,
    cqs: HashMap<u32, CqEntry>,
    mappings: HashMap<u64, Mapping>,
    qps: HashMap<u32, QpEntry>,
    ahs: HashMap<u32, AhEntry>,
    queries: HashMap<u64, PendingQuery>,
    path_mode: PathMode,
    failures: Vec<(usize, SimOp, i32)>,
    calls: History<(usize, SimOp)>,
    call_counts: HashMap<(usize, SimOp), usize>,
    modifications: History<(usize, QpState, QpAttrMask)>,
    sends: History<(usize, SendWr)>,
    recvs: History<(usize, RecvWr)>,
    unknown_releases: Vec<usize>,
}

impl Default for Fabric {
    fn default() -> Self {
        Self {
            next_handle: 0,
            next_qpn: 0x48,
            next_query: 0,
            next_dma: DMA_BASE,
            devices: Vec::new(),
            pds: HashMap::new(),
            mrs: HashMap::new(),
            cqs: HashMap::new(),
            mappings: HashMap::new(),
            qps: HashMap::new(),
            ahs: HashMap::new(),
            queries: HashMap::new(),
            path_mode: PathMode::Auto,
            failures: Vec::new(),
            calls: History::default(),
            call_counts: HashMap::new(),
            modifications: History::default(),
            sends: History::default(),
            recvs: History::default(),
            unknown_releases: Vec::new(),
        }
    }
}

fn rejected(op: SimOp, errno: i32) -> VerbsError {
    VerbsError::Rejected {
        op: op.name(),
        errno,
    }
}

impl Fabric {
    fn record(&mut self, device: usize, op: SimOp) {
        self.calls.push((device, op));
        *self.call_counts.entry((device, op)).or_insert(0) += 1;
    }

    /// Log the call and consume a matching injected failure.
    fn enter(&mut self, device: usize, op: SimOp) -> Result<(), VerbsError> {
        self.record(device, op);
        match self
            .failures
            .iter()
            .position(|(d, o, _)| *d == device && *o == op)
        {
            Some(pos) => {
                let (_, _, errno) = self.failures.remove(pos);
                Err(rejected(op, errno))
            }
            None => Ok(()),
        }
    }

    fn alloc_handle(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }

    fn unknown_release(&mut self, device: usize, kind: &'static str, id: u64) -> VerbsError {
        self.unknown_releases.push(device);
        VerbsError::UnknownHandle { kind, id }
    }

    fn has_pd(&self, device: usize, pd: u32) -> bool {
        self.pds.get(&pd) == Some(&device)
    }

    fn has_cq(&self, device: usize, cq: CqHandle) -> bool {
        self.cqs.get(&cq.0).map(|c| c.device) == Some(device)
    }

    fn qp_mut(&mut self, device: usize, qp: QpHandle) -> Result<&mut QpEntry, VerbsError> {
        self.qps
            .get_mut(&qp.0)
            .filter(|e| e.device == device)
            .ok_or(VerbsError::UnknownHandle {
                kind: "qp",
                id: qp.0 as u64,
            })
    }

    fn check_lkey(&self, device: usize, pd: u32, lkey: u32, op: SimOp) -> Result<(), VerbsError> {
        let known = self
            .mrs
            .values()
            .any(|mr| mr.device == device && mr.pd == pd && mr.lkey == lkey);
        if known {
            Ok(())
        } else {
            Err(rejected(op, EINVAL))
        }
    }

    fn resolve(&self, device: usize, query: &PathQuery) -> (i32, Option<PathRecord>) {
        let Some(target) = self.devices.iter().find(|d| d.lid == query.dlid) else {
            return (-ETIMEDOUT, None);
        };
        let source = &self.devices[device];
        if query.slid != source.lid || query.num_paths == 0 {
            return (-EINVAL, None);
        }
        let record = PathRecord {
            dgid: target.gid,
            sgid: source.gid,
            dlid: query.dlid,
            slid: query.slid,
            pkey: query.pkey,
            sl: 0,
            hop_limit: 0,
            mtu: SIM_MAX_MSG as u16,
        };
        (0, Some(record))
    }

    fn push_completion(&mut self, cq: CqHandle, wc: WorkCompletion) {
        let Some(entry) = self.cqs.get_mut(&cq.0) else {
            return;
        };
        if entry.entries.len() >= entry.capacity as usize {
            entry.overflows += 1;
            tracing::warn!(cq = cq.0, "simulated CQ overflow, completion dropped");
            return;
        }
        entry.entries.push_back(wc);
        if entry.armed {
            entry.armed = false;
            if let Some(sink) = &entry.notify {
                let _ = sink.send(VerbsEvent::CompletionNotify { cq });
            }
        }
    }

    /// Route one datagram to its destination queue pair.
    fn deliver(&mut self, source: usize, src_qpn: u32, dlid: u16, send: &SendWr, payload: &[u8]) {
        let Some(target_dev) = self.devices.iter().position(|d| d.lid == dlid) else {
            tracing::trace!(dlid, "no port with destination LID, datagram dropped");
            return;
        };
        let src_lid = self.devices[source].lid;
        let src_gid = self.devices[source].gid;
        let dst_gid = self.devices[target_dev].gid;

        let Some(target) = self
            .qps
            .values_mut()
            .find(|q| q.device == target_dev && q.qp_num == send.ud.remote_qpn)
        else {
            tracing::trace!(qpn = send.ud.remote_qpn, "no such QP, datagram dropped");
            return;
        };
        let receiving = matches!(
            target.attr.qp_state,
            QpState::ReadyToReceive | QpState::ReadyToSend
        );
        if !receiving || target.attr.qkey != send.ud.remote_qkey {
            tracing::trace!(qpn = target.qp_num, "QP not receiving or Q_Key mismatch");
            return;
        }
        let Some(recv) = target.recv_queue.pop_front() else {
            tracing::trace!(qpn = target.qp_num, "no receive posted, datagram dropped");
            return;
        };
        let recv_cq = target.init.recv_cq;
        let target_qpn = target.qp_num;

        let needed = GRH_LEN + payload.len();
        let status = match self.mappings.get(&recv.sge.addr.0) {
            Some(m)
                if m.device == target_dev
                    && m.direction.device_writes()
                    && recv.sge.length as usize >= needed
                    && m.buf.len() >= needed =>
            {
                m.buf.with_mut(|b| {
                    b[..GRH_LEN].fill(0);
                    b[8..24].copy_from_slice(src_gid.raw());
                    b[24..40].copy_from_slice(dst_gid.raw());
                    b[GRH_LEN..needed].copy_from_slice(payload);
                });
                WcStatus::Success
            }
            Some(_) => WcStatus::LocalLengthError,
            None => WcStatus::LocalProtectionError,
        };
        let byte_len = if status.is_success() { needed as u32 } else { 0 };
        self.push_completion(
            recv_cq,
            WorkCompletion {
                wr_id: recv.wr_id,
                status,
                opcode: WcOpcode::Recv,
                byte_len,
                qp_num: target_qpn,
                src_qp: src_qpn,
                slid: src_lid,
            },
        );
    }

    fn live(&self, device: usize) -> LiveObjects {
        LiveObjects {
            pds: self.pds.values().filter(|&&d| d == device).count(),
            mrs: self.mrs.values().filter(|e| e.device == device).count(),
            cqs: self.cqs.values().filter(|e| e.device == device).count(),
            qps: self.qps.values().filter(|e| e.device == device).count(),
            ahs: self.ahs.values().filter(|e| e.device == device).count(),
            mappings: self.mappings.values().filter(|e| e.device == device).count(),
        }
    }
}

/// A simulated subnet shared by any number of [`SimDevice`]s.
#[derive(Clone, Default)]
pub struct SimFabric {
    inner: Arc<Mutex<Fabric>>,
}

impl SimFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a device with a single active port using `lid`.
    pub fn add_device(&self, name: impl Into<String>, lid: u16) -> Arc<SimDevice> {
        let mut fabric = self.inner.lock();
        let index = fabric.devices.len();
        fabric.devices.push(DeviceEntry {
            lid,
            gid: Gid::from_parts(SUBNET_PREFIX, GUID_BASE | lid as u64),
        });
        Arc::new(SimDevice {
            fabric: self.clone(),
            index,
            name: name.into(),
        })
    }

    pub fn set_path_mode(&self, mode: PathMode) {
        self.inner.lock().path_mode = mode;
    }

    pub fn pending_path_queries(&self) -> usize {
        self.inner.lock().queries.len()
    }

    /// Answer every held query with its computed result. Returns the count.
    pub fn complete_pending_paths(&self) -> usize {
        let mut fabric = self.inner.lock();
        let pending: Vec<(u64, PendingQuery)> = fabric.queries.drain().collect();
        for (id, q) in &pending {
            let (status, record) = fabric.resolve(q.device, &q.query);
            let _ = q.sink.send(VerbsEvent::PathRecordComplete {
                query: QueryId(*id),
                status,
                record,
            });
        }
        pending.len()
    }

    /// Fail every held query with `status`. Returns the count.
    pub fn fail_pending_paths(&self, status: i32) -> usize {
        let mut fabric = self.inner.lock();
        let pending: Vec<(u64, PendingQuery)> = fabric.queries.drain().collect();
        for (id, q) in &pending {
            let _ = q.sink.send(VerbsEvent::PathRecordComplete {
                query: QueryId(*id),
                status,
                record: None,
            });
        }
        pending.len()
    }
}

/// One simulated HCA with a single port (port 1).
pub struct SimDevice {
    fabric: SimFabric,
    index: usize,
    name: String,
}

impl SimDevice {
    pub fn fabric(&self) -> &SimFabric {
        &self.fabric
    }

    pub fn lid(&self) -> u16 {
        self.fabric.inner.lock().devices[self.index].lid
    }

    pub fn gid(&self) -> Gid {
        self.fabric.inner.lock().devices[self.index].gid
    }

    /// Make the next call of `op` on this device fail with `errno`.
    pub fn fail_next(&self, op: SimOp, errno: i32) {
        self.fabric.inner.lock().failures.push((self.index, op, errno));
    }

    /// Recent operations invoked on this device, in order.
    pub fn calls(&self) -> Vec<SimOp> {
        let fabric = self.fabric.inner.lock();
        fabric
            .calls
            .iter()
            .filter(|(d, _)| *d == self.index)
            .map(|(_, op)| *op)
            .collect()
    }

    /// Number of times `op` was invoked on this device.
    pub fn count(&self, op: SimOp) -> usize {
        let fabric = self.fabric.inner.lock();
        fabric
            .call_counts
            .get(&(self.index, op))
            .copied()
            .unwrap_or(0)
    }

    /// Successful queue-pair modifications: target state and mask.
    pub fn qp_modifications(&self) -> Vec<(QpState, QpAttrMask)> {
        let fabric = self.fabric.inner.lock();
        fabric
            .modifications
            .iter()
            .filter(|(d, _, _)| *d == self.index)
            .map(|(_, s, m)| (*s, *m))
            .collect()
    }

    /// Recent send work requests accepted by this device.
    pub fn posted_sends(&self) -> Vec<SendWr> {
        let fabric = self.fabric.inner.lock();
        fabric
            .sends
            .iter()
            .filter(|(d, _)| *d == self.index)
            .map(|(_, wr)| *wr)
            .collect()
    }

    /// Recent receive work requests accepted by this device.
    pub fn posted_recvs(&self) -> Vec<RecvWr> {
        let fabric = self.fabric.inner.lock();
        fabric
            .recvs
            .iter()
            .filter(|(d, _)| *d == self.index)
            .map(|(_, wr)| *wr)
            .collect()
    }

    pub fn live_objects(&self) -> LiveObjects {
        self.fabric.inner.lock().live(self.index)
    }

    /// Destroy calls that named a handle which was not live.
    pub fn unknown_releases(&self) -> usize {
        let fabric = self.fabric.inner.lock();
        fabric
            .unknown_releases
            .iter()
            .filter(|&&d| d == self.index)
            .count()
    }

    /// Completions dropped because a completion queue was full.
    pub fn cq_overflows(&self) -> usize {
        let fabric = self.fabric.inner.lock();
        fabric
            .cqs
            .values()
            .filter(|c| c.device == self.index)
            .map(|c| c.overflows)
            .sum()
    }

    /// Deliver an asynchronous event to the queue pair's event sink.
    pub fn raise_qp_event(&self, qp_num: u32, event: QpEventKind) -> bool {
        let fabric = self.fabric.inner.lock();
        let sink = fabric
            .qps
            .values()
            .find(|q| q.device == self.index && q.qp_num == qp_num)
            .and_then(|q| q.events.clone());
        match sink {
            Some(sink) => sink.send(VerbsEvent::QpAsync { qp_num, event }).is_ok(),
            None => false,
        }
    }
}

impl VerbsDevice for SimDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn query_device(&self) -> Result<DeviceAttr, VerbsError> {
        self.fabric.inner.lock().enter(self.index, SimOp::QueryDevice)?;
        Ok(DeviceAttr {
            max_qp: 1 << 16,
            max_qp_wr: SIM_MAX_QP_WR,
            max_cqe: SIM_MAX_CQE,
            max_mcast_grp: 8,
            max_pkeys: 1,
        })
    }

    fn query_port(&self, port_num: u8) -> Result<PortAttr, VerbsError> {
        let mut fabric = self.fabric.inner.lock();
        fabric.enter(self.index, SimOp::QueryPort)?;
        if port_num != SIM_PORT {
            return Err(rejected(SimOp::QueryPort, EINVAL));
        }
        Ok(PortAttr {
            lid: fabric.devices[self.index].lid,
            sm_lid: SIM_SM_LID,
            max_msg_sz: SIM_MAX_MSG,
            state: PortState::Active,
            link_layer: LinkLayer::Infiniband,
        })
    }

    fn query_pkey(&self, port_num: u8, index: u16) -> Result<u16, VerbsError> {
        self.fabric.inner.lock().enter(self.index, SimOp::QueryPkey)?;
        if port_num != SIM_PORT || index != 0 {
            return Err(rejected(SimOp::QueryPkey, EINVAL));
        }
        Ok(SIM_DEFAULT_PKEY)
    }

    fn query_gid(&self, port_num: u8, index: u32) -> Result<Gid, VerbsError> {
        let mut fabric = self.fabric.inner.lock();
        fabric.enter(self.index, SimOp::QueryGid)?;
        if port_num != SIM_PORT || index != 0 {
            return Err(rejected(SimOp::QueryGid, EINVAL));
        }
        Ok(fabric.devices[self.index].gid)
    }

    fn alloc_pd(&self) -> Result<PdHandle, VerbsError> {
        let mut fabric = self.fabric.inner.lock();
        fabric.enter(self.index, SimOp::AllocPd)?;
        let id = fabric.alloc_handle();
        fabric.pds.insert(id, self.index);
        Ok(PdHandle(id))
    }

    fn dealloc_pd(&self, pd: PdHandle) -> Result<(), VerbsError> {
        let mut fabric = self.fabric.inner.lock();
        fabric.enter(self.index, SimOp::DeallocPd)?;
        if !fabric.has_pd(self.index, pd.0) {
            return Err(fabric.unknown_release(self.index, "pd", pd.0 as u64));
        }
        let in_use = fabric.mrs.values().any(|m| m.pd == pd.0)
            || fabric.qps.values().any(|q| q.pd == pd.0)
            || fabric.ahs.values().any(|a| a.pd == pd.0);
        if in_use {
            return Err(rejected(SimOp::DeallocPd, EBUSY));
        }
        fabric.pds.remove(&pd.0);
        Ok(())
    }

    fn reg_dma_mr(&self, pd: PdHandle, _access: AccessFlags) -> Result<MemoryRegion, VerbsError> {
        let mut fabric = self.fabric.inner.lock();
        fabric.enter(self.index, SimOp::RegMr)?;
        if !fabric.has_pd(self.index, pd.0) {
            return Err(rejected(SimOp::RegMr, EINVAL));
        }
        let id = fabric.alloc_handle();
        let lkey = 0x0100_0000 | id;
        fabric.mrs.insert(
            id,
            MrEntry {
                device: self.index,
                pd: pd.0,
                lkey,
            },
        );
        Ok(MemoryRegion {
            handle: MrHandle(id),
            lkey,
        })
    }

    fn dereg_mr(&self, mr: MemoryRegion) -> Result<(), VerbsError> {
        let mut fabric = self.fabric.inner.lock();
        fabric.enter(self.index, SimOp::DeregMr)?;
        let owned = fabric
            .mrs
            .get(&mr.handle.0)
            .is_some_and(|e| e.device == self.index);
        if !owned {
            return Err(fabric.unknown_release(self.index, "mr", mr.handle.0 as u64));
        }
        fabric.mrs.remove(&mr.handle.0);
        Ok(())
    }

    fn create_cq(&self, capacity: u32, notify: Option<EventSink>) -> Result<CqHandle, VerbsError> {
        let mut fabric = self.fabric.inner.lock();
        fabric.enter(self.index, SimOp::CreateCq)?;
        if capacity == 0 || capacity > SIM_MAX_CQE {
            return Err(rejected(SimOp::CreateCq, EINVAL));
        }
        let id = fabric.alloc_handle();
        fabric.cqs.insert(
            id,
            CqEntry {
                device: self.index,
                capacity,
                entries: VecDeque::new(),
                armed: false,
                notify,
                overflows: 0,
            },
        );
        Ok(CqHandle(id))
    }

    fn destroy_cq(&self, cq: CqHandle) -> Result<(), VerbsError> {
        let mut fabric = self.fabric.inner.lock();
        fabric.enter(self.index, SimOp::DestroyCq)?;
        if !fabric.has_cq(self.index, cq) {
            return Err(fabric.unknown_release(self.index, "cq", cq.0 as u64));
        }
        let in_use = fabric
            .qps
            .values()
            .any(|q| q.init.send_cq == cq || q.init.recv_cq == cq);
        if in_use {
            return Err(rejected(SimOp::DestroyCq, EBUSY));
        }
        fabric.cqs.remove(&cq.0);
        Ok(())
    }

    fn req_notify_cq(&self, cq: CqHandle) -> Result<(), VerbsError> {
        let mut fabric = self.fabric.inner.lock();
        fabric.enter(self.index, SimOp::ReqNotifyCq)?;
        match fabric.cqs.get_mut(&cq.0) {
            Some(entry) if entry.device == self.index => {
                entry.armed = true;
                Ok(())
            }
            _ => Err(VerbsError::UnknownHandle {
                kind: "cq",
                id: cq.0 as u64,
            }),
        }
    }

    fn poll_cq(&self, cq: CqHandle, max_entries: usize) -> Result<Vec<WorkCompletion>, VerbsError> {
        let mut fabric = self.fabric.inner.lock();
        fabric.enter(self.index, SimOp::PollCq)?;
        let polled: Vec<WorkCompletion> = match fabric.cqs.get_mut(&cq.0) {
            Some(entry) if entry.device == self.index => {
                let n = max_entries.min(entry.entries.len());
                entry.entries.drain(..n).collect()
            }
            _ => {
                return Err(VerbsError::UnknownHandle {
                    kind: "cq",
                    id: cq.0 as u64,
                })
            }
        };
        for wc in polled.iter().filter(|wc| wc.opcode == WcOpcode::Send) {
            if let Some(qp) = fabric
                .qps
                .values_mut()
                .find(|q| q.device == self.index && q.qp_num == wc.qp_num)
            {
                qp.outstanding_sends = qp.outstanding_sends.saturating_sub(1);
            }
        }
        Ok(polled)
    }

    fn map_buffer(&self, buf: &DmaBuf, direction: DmaDirection) -> Result<DmaAddr, VerbsError> {
        let mut fabric = self.fabric.inner.lock();
        if fabric.enter(self.index, SimOp::MapBuffer).is_err() {
            return Err(VerbsError::MappingFailed { len: buf.len() });
        }
        let addr = fabric.next_dma;
        // Keep mappings page aligned and never overlapping.
        fabric.next_dma += (buf.len() as u64).max(1).div_ceil(4096) * 4096;
        fabric.mappings.insert(
            addr,
            Mapping {
                device: self.index,
                buf: buf.clone(),
                direction,
            },
        );
        Ok(DmaAddr(addr))
    }

    fn unmap_buffer(
        &self,
        addr: DmaAddr,
        len: usize,
        direction: DmaDirection,
    ) -> Result<(), VerbsError> {
        let mut fabric = self.fabric.inner.lock();
        fabric.enter(self.index, SimOp::UnmapBuffer)?;
        let matches = fabric.mappings.get(&addr.0).is_some_and(|m| {
            m.device == self.index && m.direction == direction && m.buf.len() == len
        });
        if !matches {
            return Err(fabric.unknown_release(self.index, "dma mapping", addr.0));
        }
        fabric.mappings.remove(&addr.0);
        Ok(())
    }

    fn create_qp(
        &self,
        pd: PdHandle,
        init: &QpInitAttr,
        events: Option<EventSink>,
    ) -> Result<QueuePair, VerbsError> {
        let mut fabric = self.fabric.inner.lock();
        fabric.enter(self.index, SimOp::CreateQp)?;
        if init.qp_type != QpType::UnreliableDatagram {
            return Err(rejected(SimOp::CreateQp, EOPNOTSUPP));
        }
        if !fabric.has_pd(self.index, pd.0)
            || !fabric.has_cq(self.index, init.send_cq)
            || !fabric.has_cq(self.index, init.recv_cq)
        {
            return Err(rejected(SimOp::CreateQp, EINVAL));
        }
        let caps = init.caps;
        if caps.max_send_wr > SIM_MAX_QP_WR
            || caps.max_recv_wr > SIM_MAX_QP_WR
            || caps.max_send_sge > SIM_MAX_SGE
            || caps.max_recv_sge > SIM_MAX_SGE
        {
            return Err(rejected(SimOp::CreateQp, EINVAL));
        }
        let id = fabric.alloc_handle();
        let qp_num = fabric.next_qpn;
        fabric.next_qpn += 1;
        fabric.qps.insert(
            id,
            QpEntry {
                device: self.index,
                pd: pd.0,
                qp_num,
                init: *init,
                attr: QpAttr::default(),
                recv_queue: VecDeque::new(),
                outstanding_sends: 0,
                events,
            },
        );
        Ok(QueuePair {
            handle: QpHandle(id),
            qp_num,
        })
    }

    fn destroy_qp(&self, qp: QpHandle) -> Result<(), VerbsError> {
        let mut fabric = self.fabric.inner.lock();
        fabric.enter(self.index, SimOp::DestroyQp)?;
        if fabric.qp_mut(self.index, qp).is_err() {
            return Err(fabric.unknown_release(self.index, "qp", qp.0 as u64));
        }
        fabric.qps.remove(&qp.0);
        Ok(())
    }

    fn modify_qp(&self, qp: QpHandle, attr: &QpAttr, mask: QpAttrMask) -> Result<(), VerbsError> {
        let mut fabric = self.fabric.inner.lock();
        fabric.enter(self.index, SimOp::ModifyQp)?;
        let entry = fabric.qp_mut(self.index, qp)?;
        let from = entry.attr.qp_state;
        let to = if mask.contains(QpAttrMask::STATE) {
            attr.qp_state
        } else {
            from
        };
        let (required, allowed) =
            QpState::ud_transition_masks(from, to).ok_or(rejected(SimOp::ModifyQp, EINVAL))?;
        if !mask.contains(required) || !allowed.contains(mask) {
            return Err(rejected(SimOp::ModifyQp, EINVAL));
        }
        if mask.contains(QpAttrMask::PORT) && attr.port_num != SIM_PORT {
            return Err(rejected(SimOp::ModifyQp, EINVAL));
        }
        if mask.contains(QpAttrMask::PKEY_INDEX) && attr.pkey_index != 0 {
            return Err(rejected(SimOp::ModifyQp, EINVAL));
        }
        if mask.contains(QpAttrMask::PORT) {
            entry.attr.port_num = attr.port_num;
        }
        if mask.contains(QpAttrMask::PKEY_INDEX) {
            entry.attr.pkey_index = attr.pkey_index;
        }
        if mask.contains(QpAttrMask::QKEY) {
            entry.attr.qkey = attr.qkey;
        }
        if mask.contains(QpAttrMask::SQ_PSN) {
            entry.attr.sq_psn = attr.sq_psn;
        }
        entry.attr.qp_state = to;
        if to == QpState::Reset {
            entry.recv_queue.clear();
            entry.outstanding_sends = 0;
        }
        fabric.modifications.push((self.index, to, mask));
        Ok(())
    }

    fn query_qp(&self, qp: QpHandle, _mask: QpAttrMask) -> Result<QpAttr, VerbsError> {
        let mut fabric = self.fabric.inner.lock();
        fabric.enter(self.index, SimOp::QueryQp)?;
        Ok(fabric.qp_mut(self.index, qp)?.attr)
    }

    fn post_send(&self, qp: QpHandle, wr: &SendWr) -> Result<(), VerbsError> {
        let mut fabric = self.fabric.inner.lock();
        fabric.enter(self.index, SimOp::PostSend)?;
        let (pd, state, max_send, outstanding, send_cq, qp_num) = {
            let e = fabric.qp_mut(self.index, qp)?;
            (
                e.pd,
                e.attr.qp_state,
                e.init.caps.max_send_wr,
                e.outstanding_sends,
                e.init.send_cq,
                e.qp_num,
            )
        };
        if state != QpState::ReadyToSend {
            return Err(rejected(SimOp::PostSend, EINVAL));
        }
        if outstanding >= max_send {
            return Err(rejected(SimOp::PostSend, ENOMEM));
        }
        fabric.check_lkey(self.index, pd, wr.sge.lkey, SimOp::PostSend)?;
        if wr.sge.length > SIM_MAX_MSG {
            return Err(rejected(SimOp::PostSend, EINVAL));
        }
        let len = wr.sge.length as usize;
        let payload = match fabric.mappings.get(&wr.sge.addr.0) {
            Some(m)
                if m.device == self.index && m.direction.device_reads() && m.buf.len() >= len =>
            {
                m.buf.with(|b| b[..len].to_vec())
            }
            _ => return Err(rejected(SimOp::PostSend, EINVAL)),
        };
        let dlid = match fabric.ahs.get(&wr.ud.ah.0) {
            Some(ah) if ah.device == self.index && ah.pd == pd => ah.dlid,
            _ => return Err(rejected(SimOp::PostSend, EINVAL)),
        };
        if wr.ud.port_num != SIM_PORT {
            return Err(rejected(SimOp::PostSend, EINVAL));
        }

        fabric.sends.push((self.index, *wr));
        fabric.qp_mut(self.index, qp)?.outstanding_sends += 1;
        fabric.deliver(self.index, qp_num, dlid, wr, &payload);
        fabric.push_completion(
            send_cq,
            WorkCompletion {
                wr_id: wr.wr_id,
                status: WcStatus::Success,
                opcode: WcOpcode::Send,
                byte_len: wr.sge.length,
                qp_num,
                src_qp: 0,
                slid: 0,
            },
        );
        Ok(())
    }

    fn post_recv(&self, qp: QpHandle, wr: &RecvWr) -> Result<(), VerbsError> {
        let mut fabric = self.fabric.inner.lock();
        fabric.enter(self.index, SimOp::PostRecv)?;
        let (pd, state, max_recv, queued) = {
            let e = fabric.qp_mut(self.index, qp)?;
            (
                e.pd,
                e.attr.qp_state,
                e.init.caps.max_recv_wr,
                e.recv_queue.len(),
            )
        };
        if matches!(state, QpState::Reset | QpState::Error) {
            return Err(rejected(SimOp::PostRecv, EINVAL));
        }
        if queued >= max_recv as usize {
            return Err(rejected(SimOp::PostRecv, ENOMEM));
        }
        fabric.check_lkey(self.index, pd, wr.sge.lkey, SimOp::PostRecv)?;
        let writable = fabric.mappings.get(&wr.sge.addr.0).is_some_and(|m| {
            m.device == self.index
                && m.direction.device_writes()
                && m.buf.len() >= wr.sge.length as usize
        });
        if !writable {
            return Err(rejected(SimOp::PostRecv, EINVAL));
        }
        fabric.recvs.push((self.index, *wr));
        fabric.qp_mut(self.index, qp)?.recv_queue.push_back(*wr);
        Ok(())
    }

    fn query_path(
        &self,
        port_num: u8,
        query: &PathQuery,
        _timeout: Duration,
        sink: EventSink,
    ) -> Result<QueryId, VerbsError> {
        let mut fabric = self.fabric.inner.lock();
        fabric.enter(self.index, SimOp::QueryPath)?;
        if port_num != SIM_PORT {
            return Err(rejected(SimOp::QueryPath, EINVAL));
        }
        fabric.next_query += 1;
        let id = QueryId(fabric.next_query);
        match fabric.path_mode {
            PathMode::Auto => {
                let (status, record) = fabric.resolve(self.index, query);
                let _ = sink.send(VerbsEvent::PathRecordComplete {
                    query: id,
                    status,
                    record,
                });
            }
            PathMode::Timeout => {
                let _ = sink.send(VerbsEvent::PathRecordComplete {
                    query: id,
                    status: -ETIMEDOUT,
                    record: None,
                });
            }
            PathMode::Manual => {
                fabric.queries.insert(
                    id.0,
                    PendingQuery {
                        device: self.index,
                        query: *query,
                        sink,
                    },
                );
            }
        }
        Ok(id)
    }

    fn cancel_path_query(&self, query: QueryId) {
        let mut fabric = self.fabric.inner.lock();
        fabric.record(self.index, SimOp::CancelPathQuery);
        let owned = fabric
            .queries
            .get(&query.0)
            .is_some_and(|q| q.device == self.index);
        if owned {
            if let Some(q) = fabric.queries.remove(&query.0) {
                let _ = q.sink.send(VerbsEvent::PathRecordComplete {
                    query,
                    status: -EINTR,
                    record: None,
                });
            }
        }
    }

    fn init_ah_from_path(&self, port_num: u8, record: &PathRecord) -> Result<AhAttr, VerbsError> {
        self.fabric
            .inner
            .lock()
            .enter(self.index, SimOp::InitAhFromPath)?;
        if port_num != SIM_PORT {
            return Err(rejected(SimOp::InitAhFromPath, EINVAL));
        }
        let grh = (record.hop_limit > 1).then_some(GlobalRoute {
            dgid: record.dgid,
            sgid_index: 0,
            hop_limit: record.hop_limit,
            flow_label: 0,
            traffic_class: 0,
        });
        Ok(AhAttr {
            dlid: record.dlid,
            sl: record.sl,
            src_path_bits: 0,
            port_num,
            static_rate: 0,
            grh,
        })
    }

    fn create_ah(&self, pd: PdHandle, attr: &AhAttr) -> Result<AhHandle, VerbsError> {
        let mut fabric = self.fabric.inner.lock();
        fabric.enter(self.index, SimOp::CreateAh)?;
        if !fabric.has_pd(self.index, pd.0) || attr.dlid == 0 {
            return Err(rejected(SimOp::CreateAh, EINVAL));
        }
        let id = fabric.alloc_handle();
        fabric.ahs.insert(
            id,
            AhEntry {
                device: self.index,
                pd: pd.0,
                dlid: attr.dlid,
            },
        );
        Ok(AhHandle(id))
    }

    fn destroy_ah(&self, ah: AhHandle) -> Result<(), VerbsError> {
        let mut fabric = self.fabric.inner.lock();
        fabric.enter(self.index, SimOp::DestroyAh)?;
        let owned = fabric
            .ahs
            .get(&ah.0)
            .is_some_and(|e| e.device == self.index);
        if !owned {
            return Err(fabric.unknown_release(self.index, "ah", ah.0 as u64));
        }
        fabric.ahs.remove(&ah.0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{QpCaps, SignalType, Sge, UdDest};
    use tokio::sync::mpsc;

    struct Endpoint {
        dev: Arc<SimDevice>,
        pd: PdHandle,
        mr: MemoryRegion,
        send_cq: CqHandle,
        recv_cq: CqHandle,
        qp: QueuePair,
    }

    fn endpoint(fabric: &SimFabric, name: &str, lid: u16) -> Endpoint {
        let dev = fabric.add_device(name, lid);
        let pd = dev.alloc_pd().unwrap();
        let mr = dev.reg_dma_mr(pd, AccessFlags::LOCAL_WRITE).unwrap();
        let send_cq = dev.create_cq(255, None).unwrap();
        let recv_cq = dev.create_cq(255, None).unwrap();
        let init = QpInitAttr {
            qp_type: QpType::UnreliableDatagram,
            sq_sig_type: SignalType::AllWr,
            caps: QpCaps {
                max_send_wr: 2,
                max_recv_wr: 2,
                max_send_sge: 1,
                max_recv_sge: 1,
            },
            send_cq,
            recv_cq,
        };
        let qp = dev.create_qp(pd, &init, None).unwrap();
        Endpoint {
            dev,
            pd,
            mr,
            send_cq,
            recv_cq,
            qp,
        }
    }

    fn bring_up(ep: &Endpoint, qkey: u32) {
        let mut attr = QpAttr {
            qp_state: QpState::Init,
            pkey_index: 0,
            port_num: 1,
            qkey,
            sq_psn: 0,
        };
        let init_mask =
            QpAttrMask::STATE | QpAttrMask::PKEY_INDEX | QpAttrMask::PORT | QpAttrMask::QKEY;
        ep.dev.modify_qp(ep.qp.handle, &attr, init_mask).unwrap();
        attr.qp_state = QpState::ReadyToReceive;
        let rtr_mask = QpAttrMask::STATE | QpAttrMask::PKEY_INDEX | QpAttrMask::QKEY;
        ep.dev.modify_qp(ep.qp.handle, &attr, rtr_mask).unwrap();
        attr.qp_state = QpState::ReadyToSend;
        let rts_mask = QpAttrMask::STATE | QpAttrMask::QKEY | QpAttrMask::SQ_PSN;
        ep.dev.modify_qp(ep.qp.handle, &attr, rts_mask).unwrap();
    }

    #[test]
    fn test_query_defaults() {
        let fabric = SimFabric::new();
        let dev = fabric.add_device("sim0", 3);
        assert_eq!(dev.name(), "sim0");
        let port = dev.query_port(1).unwrap();
        assert_eq!(port.lid, 3);
        assert!(port.is_active());
        assert_eq!(dev.query_pkey(1, 0).unwrap(), 0xffff);
        let gid = dev.query_gid(1, 0).unwrap();
        assert_eq!(gid, dev.gid());
        assert_eq!(&gid.raw()[..2], &[0xfe, 0x80]);
        assert!(dev.query_port(2).is_err());
    }

    #[test]
    fn test_history_is_bounded_and_counts_exact() {
        let fabric = SimFabric::new();
        let dev = fabric.add_device("sim0", 1);
        let cq = dev.create_cq(16, None).unwrap();
        let polls = HISTORY_LEN * 2 + 10;
        for _ in 0..polls {
            assert!(dev.poll_cq(cq, 1).unwrap().is_empty());
        }
        assert_eq!(dev.count(SimOp::PollCq), polls);
        assert_eq!(dev.count(SimOp::CreateCq), 1);
        let calls = dev.calls();
        assert_eq!(calls.len(), HISTORY_LEN);
        assert!(calls.iter().all(|op| *op == SimOp::PollCq));
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let fabric = SimFabric::new();
        let ep = endpoint(&fabric, "sim0", 1);
        let attr = QpAttr {
            qp_state: QpState::ReadyToSend,
            ..QpAttr::default()
        };
        let err = ep
            .dev
            .modify_qp(ep.qp.handle, &attr, QpAttrMask::STATE | QpAttrMask::SQ_PSN)
            .unwrap_err();
        assert_eq!(err.errno(), EINVAL);

        // Reset->Init without the port attribute is incomplete.
        let attr = QpAttr {
            qp_state: QpState::Init,
            port_num: 1,
            ..QpAttr::default()
        };
        assert!(ep
            .dev
            .modify_qp(ep.qp.handle, &attr, QpAttrMask::STATE | QpAttrMask::QKEY)
            .is_err());
        assert!(ep.dev.qp_modifications().is_empty());
    }

    #[test]
    fn test_datagram_delivery() {
        let fabric = SimFabric::new();
        let a = endpoint(&fabric, "sim0", 1);
        let b = endpoint(&fabric, "sim1", 2);
        bring_up(&a, 0);
        bring_up(&b, 0);
        assert_eq!(b.dev.query_qp(b.qp.handle, QpAttrMask::QKEY).unwrap().qkey, 0);

        let recv_buf = DmaBuf::zeroed(64 + GRH_LEN);
        let recv_addr = b
            .dev
            .map_buffer(&recv_buf, DmaDirection::FromDevice)
            .unwrap();
        let recv = RecvWr {
            wr_id: 1,
            sge: Sge {
                addr: recv_addr,
                length: (64 + GRH_LEN) as u32,
                lkey: b.mr.lkey,
            },
        };
        b.dev.post_recv(b.qp.handle, &recv).unwrap();

        let send_buf = DmaBuf::zeroed(64);
        send_buf.with_mut(|buf| buf[..5].copy_from_slice(b"hello"));
        let send_addr = a.dev.map_buffer(&send_buf, DmaDirection::ToDevice).unwrap();
        let ah_attr = AhAttr {
            dlid: 2,
            sl: 0,
            src_path_bits: 0,
            port_num: 1,
            static_rate: 0,
            grh: None,
        };
        let ah = a.dev.create_ah(a.pd, &ah_attr).unwrap();
        let send = SendWr {
            wr_id: 1,
            sge: Sge {
                addr: send_addr,
                length: 64,
                lkey: a.mr.lkey,
            },
            ud: UdDest {
                ah,
                remote_qpn: b.qp.qp_num,
                remote_qkey: 0,
                port_num: 1,
            },
        };
        a.dev.post_send(a.qp.handle, &send).unwrap();

        let wcs = b.dev.poll_cq(b.recv_cq, 1).unwrap();
        assert_eq!(wcs.len(), 1);
        assert!(wcs[0].status.is_success());
        assert_eq!(wcs[0].byte_len, 64 + GRH_LEN as u32);
        assert_eq!(wcs[0].src_qp, a.qp.qp_num);
        assert_eq!(&recv_buf.to_vec()[GRH_LEN..GRH_LEN + 5], b"hello");

        let sent = a.dev.poll_cq(a.send_cq, 1).unwrap();
        assert_eq!(sent[0].wr_id, 1);
        assert_eq!(sent[0].opcode, WcOpcode::Send);
        assert_eq!(a.dev.posted_sends().len(), 1);
    }

    #[test]
    fn test_send_requires_device_readable_mapping() {
        let fabric = SimFabric::new();
        let a = endpoint(&fabric, "sim0", 1);
        bring_up(&a, 0);
        let buf = DmaBuf::zeroed(32);
        let addr = a.dev.map_buffer(&buf, DmaDirection::FromDevice).unwrap();
        let ah = a
            .dev
            .create_ah(
                a.pd,
                &AhAttr {
                    dlid: 1,
                    sl: 0,
                    src_path_bits: 0,
                    port_num: 1,
                    static_rate: 0,
                    grh: None,
                },
            )
            .unwrap();
        let send = SendWr {
            wr_id: 1,
            sge: Sge {
                addr,
                length: 32,
                lkey: a.mr.lkey,
            },
            ud: UdDest {
                ah,
                remote_qpn: 0x99,
                remote_qkey: 0,
                port_num: 1,
            },
        };
        assert!(a.dev.post_send(a.qp.handle, &send).is_err());
    }

    #[test]
    fn test_destroy_order_enforced() {
        let fabric = SimFabric::new();
        let ep = endpoint(&fabric, "sim0", 1);
        assert_eq!(ep.dev.dealloc_pd(ep.pd).unwrap_err().errno(), EBUSY);
        assert_eq!(ep.dev.destroy_cq(ep.send_cq).unwrap_err().errno(), EBUSY);

        ep.dev.destroy_qp(ep.qp.handle).unwrap();
        ep.dev.destroy_cq(ep.recv_cq).unwrap();
        ep.dev.destroy_cq(ep.send_cq).unwrap();
        ep.dev.dereg_mr(ep.mr).unwrap();
        ep.dev.dealloc_pd(ep.pd).unwrap();
        assert!(ep.dev.live_objects().is_empty());
        assert_eq!(ep.dev.unknown_releases(), 0);

        assert!(ep.dev.destroy_qp(ep.qp.handle).is_err());
        assert_eq!(ep.dev.unknown_releases(), 1);
    }

    #[test]
    fn test_fail_next() {
        let fabric = SimFabric::new();
        let dev = fabric.add_device("sim0", 1);
        dev.fail_next(SimOp::AllocPd, ENOMEM);
        assert_eq!(dev.alloc_pd().unwrap_err().errno(), ENOMEM);
        assert!(dev.alloc_pd().is_ok());
        assert_eq!(dev.count(SimOp::AllocPd), 2);

        dev.fail_next(SimOp::MapBuffer, ENOMEM);
        let buf = DmaBuf::zeroed(16);
        assert_eq!(
            dev.map_buffer(&buf, DmaDirection::ToDevice).unwrap_err(),
            VerbsError::MappingFailed { len: 16 }
        );
    }

    #[test]
    fn test_path_modes() {
        let fabric = SimFabric::new();
        let a = fabric.add_device("sim0", 1);
        fabric.add_device("sim1", 2);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let query = PathQuery {
            dlid: 2,
            slid: 1,
            pkey: 0xffff,
            num_paths: 1,
        };
        let timeout = Duration::from_millis(10_000);

        let id = a.query_path(1, &query, timeout, tx.clone()).unwrap();
        match rx.try_recv().unwrap() {
            VerbsEvent::PathRecordComplete {
                query: q,
                status,
                record,
            } => {
                assert_eq!(q, id);
                assert_eq!(status, 0);
                let record = record.unwrap();
                assert_eq!(record.dlid, 2);
                assert_eq!(record.sgid, a.gid());
            }
            other => panic!("unexpected event {other:?}"),
        }

        fabric.set_path_mode(PathMode::Manual);
        let id = a.query_path(1, &query, timeout, tx.clone()).unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(fabric.pending_path_queries(), 1);
        a.cancel_path_query(id);
        assert!(matches!(
            rx.try_recv().unwrap(),
            VerbsEvent::PathRecordComplete { status, .. } if status == -EINTR
        ));

        fabric.set_path_mode(PathMode::Timeout);
        a.query_path(1, &query, timeout, tx).unwrap();
        assert!(matches!(
            rx.try_recv().unwrap(),
            VerbsEvent::PathRecordComplete { status, record: None, .. } if status == -ETIMEDOUT
        ));
    }

    #[test]
    fn test_armed_cq_notifies_once() {
        let fabric = SimFabric::new();
        let dev = fabric.add_device("sim0", 1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cq = dev.create_cq(4, Some(tx)).unwrap();
        dev.req_notify_cq(cq).unwrap();
        let wc = WorkCompletion {
            wr_id: 1,
            status: WcStatus::Success,
            opcode: WcOpcode::Recv,
            byte_len: 0,
            qp_num: 0,
            src_qp: 0,
            slid: 0,
        };
        {
            let mut f = fabric.inner.lock();
            f.push_completion(cq, wc);
            f.push_completion(cq, wc);
        }
        assert_eq!(rx.try_recv().unwrap(), VerbsEvent::CompletionNotify { cq });
        assert!(rx.try_recv().is_err());
        assert_eq!(dev.poll_cq(cq, 8).unwrap().len(), 2);
    }
}
