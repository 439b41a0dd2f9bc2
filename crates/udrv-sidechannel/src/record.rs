//! The fixed-size addressing-info record exchanged over the side channel.
//!
//! Layout (28 bytes): GID (16), QP number (4), LID (2), two bytes of padding,
//! Q_Key (4). Integers are written in host byte order and the padding is
//! zero, matching the in-memory layout of the C struct both peers have always
//! exchanged. Peers of different endianness therefore cannot interoperate.

use std::fmt;

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use udrv_verbs::Gid;

/// Size of an encoded [`AddressingInfo`].
pub const RECORD_LEN: usize = 28;

/// What one endpoint needs to address datagrams to the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AddressingInfo {
    pub gid: Gid,
    pub qp_num: u32,
    pub lid: u16,
    pub qkey: u32,
}

impl AddressingInfo {
    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut out = [0u8; RECORD_LEN];
        let mut buf = &mut out[..];
        buf.put_slice(self.gid.raw());
        buf.put_u32_ne(self.qp_num);
        buf.put_u16_ne(self.lid);
        buf.put_bytes(0, 2);
        buf.put_u32_ne(self.qkey);
        out
    }

    pub fn decode(raw: &[u8; RECORD_LEN]) -> Self {
        let mut buf = &raw[..];
        let mut gid = [0u8; 16];
        buf.copy_to_slice(&mut gid);
        let qp_num = buf.get_u32_ne();
        let lid = buf.get_u16_ne();
        buf.advance(2);
        let qkey = buf.get_u32_ne();
        Self {
            gid: Gid(gid),
            qp_num,
            lid,
            qkey,
        }
    }
}

impl fmt::Display for AddressingInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "gid {} qpn {:#x} lid {} qkey {:#x}",
            self.gid, self.qp_num, self.lid, self.qkey
        )
    }
}
