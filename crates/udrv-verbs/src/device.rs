//! Verbs device abstraction.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::buf::DmaBuf;
use crate::error::VerbsError;
use crate::event::EventSink;
use crate::types::{
    AccessFlags, AhAttr, AhHandle, CqHandle, DmaAddr, DmaDirection, Gid, MemoryRegion, PathQuery,
    PathRecord, PdHandle, QpAttr, QpAttrMask, QpHandle, QpInitAttr, QueryId, QueuePair, RecvWr,
    SendWr, WorkCompletion,
};

/// Link layer type for a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkLayer {
    /// InfiniBand.
    Infiniband,
    /// RoCE (RDMA over Converged Ethernet).
    Ethernet,
    /// Unknown or unspecified.
    Unspecified,
}

impl std::fmt::Display for LinkLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkLayer::Infiniband => write!(f, "INFINIBAND"),
            LinkLayer::Ethernet => write!(f, "ETHERNET"),
            LinkLayer::Unspecified => write!(f, "UNSPECIFIED"),
        }
    }
}

/// Logical port state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortState {
    Nop,
    Down,
    Init,
    Armed,
    Active,
    ActiveDefer,
}

impl std::fmt::Display for PortState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortState::Nop => write!(f, "NOP"),
            PortState::Down => write!(f, "DOWN"),
            PortState::Init => write!(f, "INIT"),
            PortState::Armed => write!(f, "ARMED"),
            PortState::Active => write!(f, "ACTIVE"),
            PortState::ActiveDefer => write!(f, "ACTIVE_DEFER"),
        }
    }
}

/// Device capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAttr {
    pub max_qp: u32,
    pub max_qp_wr: u32,
    pub max_cqe: u32,
    pub max_mcast_grp: u32,
    pub max_pkeys: u16,
}

/// Attributes of one port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAttr {
    pub lid: u16,
    pub sm_lid: u16,
    pub max_msg_sz: u32,
    pub state: PortState,
    pub link_layer: LinkLayer,
}

impl PortAttr {
    /// Whether this port is in the active state.
    pub fn is_active(&self) -> bool {
        self.state == PortState::Active || self.state == PortState::ActiveDefer
    }
}

/// The operations the rendezvous engine needs from an RDMA device.
///
/// Every call is synchronous except [`VerbsDevice::query_path`], whose
/// outcome arrives later as a [`crate::VerbsEvent::PathRecordComplete`] on the
/// supplied sink. Destroy operations report failures but callers treat them
/// as best effort.
pub trait VerbsDevice: Send + Sync + 'static {
    /// Provider name of the device (e.g. `mlx4_0`).
    fn name(&self) -> &str;

    fn query_device(&self) -> Result<DeviceAttr, VerbsError>;

    fn query_port(&self, port_num: u8) -> Result<PortAttr, VerbsError>;

    fn query_pkey(&self, port_num: u8, index: u16) -> Result<u16, VerbsError>;

    fn query_gid(&self, port_num: u8, index: u32) -> Result<Gid, VerbsError>;

    fn alloc_pd(&self) -> Result<PdHandle, VerbsError>;

    fn dealloc_pd(&self, pd: PdHandle) -> Result<(), VerbsError>;

    /// Register the whole DMA-addressable domain as one memory region.
    fn reg_dma_mr(&self, pd: PdHandle, access: AccessFlags) -> Result<MemoryRegion, VerbsError>;

    fn dereg_mr(&self, mr: MemoryRegion) -> Result<(), VerbsError>;

    /// Create a completion queue. When `notify` is given, an armed queue
    /// reports its next completion as a `CompletionNotify` event.
    fn create_cq(&self, capacity: u32, notify: Option<EventSink>) -> Result<CqHandle, VerbsError>;

    fn destroy_cq(&self, cq: CqHandle) -> Result<(), VerbsError>;

    /// Arm the completion notification for the next completion.
    fn req_notify_cq(&self, cq: CqHandle) -> Result<(), VerbsError>;

    /// Remove up to `max_entries` completions.
    fn poll_cq(&self, cq: CqHandle, max_entries: usize) -> Result<Vec<WorkCompletion>, VerbsError>;

    /// Map `buf` for device access in the given direction.
    fn map_buffer(&self, buf: &DmaBuf, direction: DmaDirection) -> Result<DmaAddr, VerbsError>;

    fn unmap_buffer(
        &self,
        addr: DmaAddr,
        len: usize,
        direction: DmaDirection,
    ) -> Result<(), VerbsError>;

    /// Create a queue pair. Asynchronous QP events go to `events` if given.
    fn create_qp(
        &self,
        pd: PdHandle,
        init: &QpInitAttr,
        events: Option<EventSink>,
    ) -> Result<QueuePair, VerbsError>;

    fn destroy_qp(&self, qp: QpHandle) -> Result<(), VerbsError>;

    /// Apply the attributes selected by `mask`.
    fn modify_qp(&self, qp: QpHandle, attr: &QpAttr, mask: QpAttrMask) -> Result<(), VerbsError>;

    fn query_qp(&self, qp: QpHandle, mask: QpAttrMask) -> Result<QpAttr, VerbsError>;

    fn post_send(&self, qp: QpHandle, wr: &SendWr) -> Result<(), VerbsError>;

    fn post_recv(&self, qp: QpHandle, wr: &RecvWr) -> Result<(), VerbsError>;

    /// Start an asynchronous path-record query.
    fn query_path(
        &self,
        port_num: u8,
        query: &PathQuery,
        timeout: Duration,
        sink: EventSink,
    ) -> Result<QueryId, VerbsError>;

    /// Abandon an outstanding query. Unknown ids are ignored.
    fn cancel_path_query(&self, query: QueryId);

    fn init_ah_from_path(&self, port_num: u8, record: &PathRecord) -> Result<AhAttr, VerbsError>;

    fn create_ah(&self, pd: PdHandle, attr: &AhAttr) -> Result<AhHandle, VerbsError>;

    fn destroy_ah(&self, ah: AhHandle) -> Result<(), VerbsError>;
}
