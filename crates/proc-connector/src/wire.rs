//! Layouts of the records exchanged with the process events connector.
//!
//! Every datagram is a sequence of netlink frames. A frame starts with a
//! `nlmsghdr`; for connector traffic its payload is a `cn_msg` header followed
//! by `cn_msg.len` bytes of data. Process events carry a `proc_event` header
//! in that data, followed by the event specific record:
//!
//! ```ignore
//! nlmsghdr  | len u32 | type u16 | flags u16 | seq u32 | pid u32 |           16 bytes
//! cn_msg    | idx u32 | val u32 | seq u32 | ack u32 | len u16 | flags u16 |  20 bytes
//! proc_event| what u32 | cpu u32 | timestamp_ns u64 |                        16 bytes
//! id event  | pid i32 | tgid i32 | real u32 | effective u32 |               16 bytes
//! ```
//!
//! All integers use the host byte order. Parsing never trusts a declared
//! length without checking it against the bytes actually available.

use crate::error::WireError;

pub const NETLINK_CONNECTOR: i32 = 11;

pub const NLMSG_ALIGNTO: usize = 4;
pub const NLMSG_HDRLEN: usize = 16;

pub const NLMSG_NOOP: u16 = 0x1;
pub const NLMSG_ERROR: u16 = 0x2;
pub const NLMSG_DONE: u16 = 0x3;
pub const NLMSG_OVERRUN: u16 = 0x4;
/// First frame type not reserved for netlink control messages.
pub const NLMSG_MIN_TYPE: u16 = 0x10;

pub const CN_IDX_PROC: u32 = 0x1;
pub const CN_VAL_PROC: u32 = 0x1;
pub const CN_MSG_LEN: usize = 20;

pub const PROC_EVENT_HEADER_LEN: usize = 16;
pub const ID_EVENT_LEN: usize = 16;

pub const PROC_EVENT_NONE: u32 = 0x0;
pub const PROC_EVENT_UID: u32 = 0x4;
pub const PROC_EVENT_GID: u32 = 0x40;

/// Rounds `len` up to the netlink frame alignment.
pub const fn nlmsg_align(len: usize) -> usize {
    (len + NLMSG_ALIGNTO - 1) & !(NLMSG_ALIGNTO - 1)
}

/// `proc_cn_mcast_op` values accepted by the connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum McastOp {
    Listen = 1,
    Ignore = 2,
}

/// Bounds-checked little cursor over a record.
struct Reader<'a> {
    record: &'static str,
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(record: &'static str, buf: &'a [u8], len: usize) -> Result<Self, WireError> {
        if buf.len() < len {
            return Err(WireError::Truncated {
                record,
                needed: len,
                available: buf.len(),
            });
        }
        Ok(Self { record, buf, pos: 0 })
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let bytes = self
            .buf
            .get(self.pos..self.pos + N)
            .ok_or(WireError::Truncated {
                record: self.record,
                needed: self.pos + N,
                available: self.buf.len(),
            })?;
        self.pos += N;
        let mut out = [0; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        self.take().map(u16::from_ne_bytes)
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        self.take().map(u32::from_ne_bytes)
    }

    fn i32(&mut self) -> Result<i32, WireError> {
        self.take().map(i32::from_ne_bytes)
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        self.take().map(u64::from_ne_bytes)
    }
}

/// Generic netlink frame header (`struct nlmsghdr`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NlMsgHeader {
    pub len: u32,
    pub kind: u16,
    pub flags: u16,
    pub seq: u32,
    pub port_id: u32,
}

impl NlMsgHeader {
    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new("nlmsghdr", buf, NLMSG_HDRLEN)?;
        Ok(Self {
            len: r.u32()?,
            kind: r.u16()?,
            flags: r.u16()?,
            seq: r.u32()?,
            port_id: r.u32()?,
        })
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.len.to_ne_bytes());
        out.extend_from_slice(&self.kind.to_ne_bytes());
        out.extend_from_slice(&self.flags.to_ne_bytes());
        out.extend_from_slice(&self.seq.to_ne_bytes());
        out.extend_from_slice(&self.port_id.to_ne_bytes());
    }
}

/// Connector header (`struct cn_msg` without its flexible data member).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CnMsgHeader {
    pub idx: u32,
    pub val: u32,
    pub seq: u32,
    pub ack: u32,
    pub len: u16,
    pub flags: u16,
}

impl CnMsgHeader {
    pub fn proc(len: u16) -> Self {
        Self {
            idx: CN_IDX_PROC,
            val: CN_VAL_PROC,
            seq: 0,
            ack: 0,
            len,
            flags: 0,
        }
    }

    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new("cn_msg", buf, CN_MSG_LEN)?;
        Ok(Self {
            idx: r.u32()?,
            val: r.u32()?,
            seq: r.u32()?,
            ack: r.u32()?,
            len: r.u16()?,
            flags: r.u16()?,
        })
    }

    pub fn is_proc(&self) -> bool {
        self.idx == CN_IDX_PROC && self.val == CN_VAL_PROC
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.idx.to_ne_bytes());
        out.extend_from_slice(&self.val.to_ne_bytes());
        out.extend_from_slice(&self.seq.to_ne_bytes());
        out.extend_from_slice(&self.ack.to_ne_bytes());
        out.extend_from_slice(&self.len.to_ne_bytes());
        out.extend_from_slice(&self.flags.to_ne_bytes());
    }
}

/// Common head of every `struct proc_event`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcEventHeader {
    pub what: u32,
    pub cpu: u32,
    pub timestamp_ns: u64,
}

impl ProcEventHeader {
    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new("proc_event", buf, PROC_EVENT_HEADER_LEN)?;
        Ok(Self {
            what: r.u32()?,
            cpu: r.u32()?,
            timestamp_ns: r.u64()?,
        })
    }
}

/// Payload of `PROC_EVENT_UID` and `PROC_EVENT_GID` (`struct id_proc_event`).
///
/// `real` and `effective` are uids or gids depending on the event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdEventRecord {
    pub pid: i32,
    pub tgid: i32,
    pub real: u32,
    pub effective: u32,
}

impl IdEventRecord {
    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new("id_proc_event", buf, ID_EVENT_LEN)?;
        Ok(Self {
            pid: r.i32()?,
            tgid: r.i32()?,
            real: r.u32()?,
            effective: r.u32()?,
        })
    }
}

/// Builds one connector frame carrying `data`, padded to the frame alignment.
pub fn connector_frame(nl_type: u16, port_id: u32, data: &[u8]) -> Vec<u8> {
    let cn_len = u16::try_from(data.len()).unwrap_or(u16::MAX);
    let len = NLMSG_HDRLEN + CN_MSG_LEN + data.len();

    let mut out = Vec::with_capacity(nlmsg_align(len));
    NlMsgHeader {
        len: len as u32,
        kind: nl_type,
        flags: 0,
        seq: 0,
        port_id,
    }
    .write(&mut out);
    CnMsgHeader::proc(cn_len).write(&mut out);
    out.extend_from_slice(data);
    out.resize(nlmsg_align(len), 0);
    out
}

/// The control message asking the kernel to start or stop multicasting
/// process events to the socket bound at `port_id`.
pub fn mcast_message(op: McastOp, port_id: u32) -> Vec<u8> {
    connector_frame(NLMSG_DONE, port_id, &(op as u32).to_ne_bytes())
}

/// Frame builders for exercising the decoder without a kernel.
#[cfg(any(test, feature = "test-utils"))]
pub mod testing {
    use super::*;

    /// A frame of type `nl_type` carrying a uid/gid change event.
    pub fn id_event_frame(
        nl_type: u16,
        what: u32,
        pid: i32,
        tgid: i32,
        real: u32,
        effective: u32,
    ) -> Vec<u8> {
        let mut data = Vec::with_capacity(PROC_EVENT_HEADER_LEN + ID_EVENT_LEN);
        data.extend_from_slice(&what.to_ne_bytes());
        data.extend_from_slice(&0u32.to_ne_bytes());
        data.extend_from_slice(&0u64.to_ne_bytes());
        data.extend_from_slice(&pid.to_ne_bytes());
        data.extend_from_slice(&tgid.to_ne_bytes());
        data.extend_from_slice(&real.to_ne_bytes());
        data.extend_from_slice(&effective.to_ne_bytes());
        connector_frame(nl_type, 0, &data)
    }

    /// A uid change frame as the kernel sends it.
    pub fn uid_frame(pid: i32, ruid: u32, euid: u32) -> Vec<u8> {
        id_event_frame(NLMSG_DONE, PROC_EVENT_UID, pid, pid, ruid, euid)
    }

    /// A gid change frame as the kernel sends it.
    pub fn gid_frame(pid: i32, rgid: u32, egid: u32) -> Vec<u8> {
        id_event_frame(NLMSG_DONE, PROC_EVENT_GID, pid, pid, rgid, egid)
    }

    /// A bare netlink header with no payload, such as a noop or error marker.
    pub fn control_frame(nl_type: u16) -> Vec<u8> {
        let mut out = Vec::with_capacity(NLMSG_HDRLEN);
        NlMsgHeader {
            len: NLMSG_HDRLEN as u32,
            kind: nl_type,
            flags: 0,
            seq: 0,
            port_id: 0,
        }
        .write(&mut out);
        out
    }
}
