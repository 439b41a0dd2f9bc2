//! Plain data types exchanged with a verbs device.

use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// 128-bit global identifier of a port.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Gid(pub [u8; 16]);

impl Gid {
    /// Build a GID from a 64-bit subnet prefix and a 64-bit interface id.
    pub fn from_parts(subnet_prefix: u64, interface_id: u64) -> Self {
        let mut raw = [0u8; 16];
        raw[..8].copy_from_slice(&subnet_prefix.to_be_bytes());
        raw[8..].copy_from_slice(&interface_id.to_be_bytes());
        Gid(raw)
    }

    pub fn raw(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gid({})", self)
    }
}

/// Error returned when parsing a [`Gid`] from text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid GID: {0}")]
pub struct GidParseError(String);

impl FromStr for Gid {
    type Err = GidParseError;

    /// Parse the colon-separated form produced by `Display`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut raw = [0u8; 16];
        let mut parts = s.split(':');
        for slot in raw.iter_mut() {
            let part = parts.next().ok_or_else(|| GidParseError(s.to_string()))?;
            *slot = u8::from_str_radix(part, 16).map_err(|_| GidParseError(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(GidParseError(s.to_string()));
        }
        Ok(Gid(raw))
    }
}

impl Serialize for Gid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Gid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Protection domain handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PdHandle(pub u32);

/// Memory region handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MrHandle(pub u32);

/// Completion queue handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CqHandle(pub u32);

/// Queue pair handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QpHandle(pub u32);

/// Address handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AhHandle(pub u32);

/// Identifier of an outstanding path-record query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryId(pub u64);

/// Device-visible address of a mapped host buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DmaAddr(pub u64);

impl fmt::Display for DmaAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A registered memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub handle: MrHandle,
    pub lkey: u32,
}

/// A created queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuePair {
    pub handle: QpHandle,
    pub qp_num: u32,
}

bitflags! {
    /// Memory region access rights.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u32 {
        const LOCAL_WRITE = 1 << 0;
        const REMOTE_WRITE = 1 << 1;
        const REMOTE_READ = 1 << 2;
    }
}

bitflags! {
    /// Attributes supplied to a queue-pair modification.
    ///
    /// Bit positions follow the verbs `IB_QP_*` mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct QpAttrMask: u32 {
        const STATE = 1 << 0;
        const CUR_STATE = 1 << 1;
        const ACCESS_FLAGS = 1 << 3;
        const PKEY_INDEX = 1 << 4;
        const PORT = 1 << 5;
        const QKEY = 1 << 6;
        const SQ_PSN = 1 << 16;
    }
}

/// Queue pair state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum QpState {
    #[default]
    Reset,
    Init,
    ReadyToReceive,
    ReadyToSend,
    Error,
}

impl fmt::Display for QpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QpState::Reset => write!(f, "RESET"),
            QpState::Init => write!(f, "INIT"),
            QpState::ReadyToReceive => write!(f, "RTR"),
            QpState::ReadyToSend => write!(f, "RTS"),
            QpState::Error => write!(f, "ERROR"),
        }
    }
}

impl QpState {
    /// Required and allowed attribute masks for an unreliable-datagram queue
    /// pair moving from `from` to `to`, or `None` if the transition is illegal.
    pub fn ud_transition_masks(from: QpState, to: QpState) -> Option<(QpAttrMask, QpAttrMask)> {
        use QpAttrMask as M;
        let state_only = (M::STATE, M::STATE);
        match (from, to) {
            (_, QpState::Reset) | (_, QpState::Error) => Some(state_only),
            (QpState::Reset, QpState::Init) => {
                let m = M::STATE | M::PKEY_INDEX | M::PORT | M::QKEY;
                Some((m, m))
            }
            (QpState::Init, QpState::Init) => {
                Some((M::STATE, M::STATE | M::PKEY_INDEX | M::PORT | M::QKEY))
            }
            (QpState::Init, QpState::ReadyToReceive) => {
                Some((M::STATE, M::STATE | M::PKEY_INDEX | M::QKEY))
            }
            (QpState::ReadyToReceive, QpState::ReadyToSend) => Some((
                M::STATE | M::SQ_PSN,
                M::STATE | M::SQ_PSN | M::CUR_STATE | M::QKEY,
            )),
            (QpState::ReadyToSend, QpState::ReadyToSend) => {
                Some((M::STATE, M::STATE | M::CUR_STATE | M::QKEY))
            }
            _ => None,
        }
    }
}

/// Queue pair attributes. Only the fields named by the accompanying
/// [`QpAttrMask`] are meaningful.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QpAttr {
    pub qp_state: QpState,
    pub pkey_index: u16,
    pub port_num: u8,
    pub qkey: u32,
    pub sq_psn: u32,
}

/// Transport service type of a queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpType {
    ReliableConnected,
    UnreliableConnected,
    UnreliableDatagram,
}

/// Completion signalling policy for the send queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalType {
    AllWr,
    RequestedWr,
}

/// Queue depths and scatter-gather limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpCaps {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
}

/// Queue pair creation attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpInitAttr {
    pub qp_type: QpType,
    pub sq_sig_type: SignalType,
    pub caps: QpCaps,
    pub send_cq: CqHandle,
    pub recv_cq: CqHandle,
}

/// DMA transfer direction of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    /// The device reads from host memory.
    ToDevice,
    /// The device writes to host memory.
    FromDevice,
    Bidirectional,
}

impl DmaDirection {
    pub fn device_reads(self) -> bool {
        matches!(self, DmaDirection::ToDevice | DmaDirection::Bidirectional)
    }

    pub fn device_writes(self) -> bool {
        matches!(self, DmaDirection::FromDevice | DmaDirection::Bidirectional)
    }
}

/// Scatter-gather element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    pub addr: DmaAddr,
    pub length: u32,
    pub lkey: u32,
}

/// Datagram destination of a send work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdDest {
    pub ah: AhHandle,
    pub remote_qpn: u32,
    pub remote_qkey: u32,
    pub port_num: u8,
}

/// A `SEND` work request on an unreliable-datagram queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendWr {
    pub wr_id: u64,
    pub sge: Sge,
    pub ud: UdDest,
}

/// A receive work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvWr {
    pub wr_id: u64,
    pub sge: Sge,
}

/// Completion status of a work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WcStatus {
    Success,
    LocalLengthError,
    LocalQpOperationError,
    LocalProtectionError,
    WrFlushError,
    GeneralError,
}

impl WcStatus {
    pub fn is_success(self) -> bool {
        self == WcStatus::Success
    }
}

/// Work completion opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WcOpcode {
    Send,
    Recv,
}

/// A completion record polled from a completion queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: WcStatus,
    pub opcode: WcOpcode,
    pub byte_len: u32,
    pub qp_num: u32,
    /// Source queue pair of a received datagram.
    pub src_qp: u32,
    /// Source LID of a received datagram.
    pub slid: u16,
}

/// Subnet-administration path query keyed by source and destination LID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathQuery {
    pub dlid: u16,
    pub slid: u16,
    pub pkey: u16,
    pub num_paths: u8,
}

/// A resolved path record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRecord {
    pub dgid: Gid,
    pub sgid: Gid,
    pub dlid: u16,
    pub slid: u16,
    pub pkey: u16,
    pub sl: u8,
    pub hop_limit: u8,
    pub mtu: u16,
}

/// Global routing header attributes of an address handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalRoute {
    pub dgid: Gid,
    pub sgid_index: u8,
    pub hop_limit: u8,
    pub flow_label: u32,
    pub traffic_class: u8,
}

/// Address handle attributes derived from a path record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AhAttr {
    pub dlid: u16,
    pub sl: u8,
    pub src_path_bits: u8,
    pub port_num: u8,
    pub static_rate: u8,
    pub grh: Option<GlobalRoute>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gid_display_and_parse() {
        let gid = Gid::from_parts(0xfe80_0000_0000_0000, 0x0002_c903_0001_0a0b);
        let text = gid.to_string();
        assert_eq!(text, "fe:80:00:00:00:00:00:00:00:02:c9:03:00:01:0a:0b");
        assert_eq!(text.parse::<Gid>().unwrap(), gid);
        assert!("fe:80".parse::<Gid>().is_err());
        assert!(format!("{}:00", text).parse::<Gid>().is_err());
    }

    #[test]
    fn test_gid_serde_as_string() {
        let gid = Gid::from_parts(0xfe80_0000_0000_0000, 1);
        let json = serde_json::to_string(&gid).unwrap();
        assert_eq!(json, format!("\"{}\"", gid));
        let back: Gid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, gid);
    }

    #[test]
    fn test_ud_transition_masks() {
        use QpAttrMask as M;
        let (req, allowed) = QpState::ud_transition_masks(QpState::Reset, QpState::Init).unwrap();
        assert!(req.contains(M::PORT));
        assert_eq!(req, allowed);

        // The port may only be set on the way out of RESET.
        let (_, allowed) =
            QpState::ud_transition_masks(QpState::Init, QpState::ReadyToReceive).unwrap();
        assert!(!allowed.contains(M::PORT));

        let (req, allowed) =
            QpState::ud_transition_masks(QpState::ReadyToReceive, QpState::ReadyToSend).unwrap();
        assert!(req.contains(M::SQ_PSN));
        assert!(!allowed.contains(M::PKEY_INDEX));

        assert!(QpState::ud_transition_masks(QpState::Reset, QpState::ReadyToSend).is_none());
        assert!(QpState::ud_transition_masks(QpState::ReadyToSend, QpState::Init).is_none());
        assert!(QpState::ud_transition_masks(QpState::ReadyToSend, QpState::Error).is_some());
    }

    #[test]
    fn test_qp_state_display() {
        assert_eq!(QpState::ReadyToReceive.to_string(), "RTR");
        assert_eq!(QpState::ReadyToSend.to_string(), "RTS");
        assert_eq!(QpState::default(), QpState::Reset);
    }

    #[test]
    fn test_dma_direction() {
        assert!(DmaDirection::ToDevice.device_reads());
        assert!(!DmaDirection::ToDevice.device_writes());
        assert!(DmaDirection::FromDevice.device_writes());
        assert!(DmaDirection::Bidirectional.device_reads());
    }
}
