//! Request and reply types exchanged with the blocker ports, plus the typed
//! payloads they carry. Layouts follow the xseg protocol structures: every
//! variable-length field is a little-endian u32 length followed by the bytes.

use bitflags::bitflags;
use mapperd_serialization::{NumBytes, Read, ReadError, Write, WriteError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Op {
    Read = 1,
    Write = 2,
    Copy = 3,
    Delete = 4,
    Acquire = 5,
    Release = 6,
    Snapshot = 7,
    Clone = 8,
    MapRead = 9,
    MapWrite = 10,
    Info = 11,
    Open = 12,
    Close = 13,
}

impl Op {
    fn from_u32(v: u32) -> Option<Op> {
        Some(match v {
            1 => Op::Read,
            2 => Op::Write,
            3 => Op::Copy,
            4 => Op::Delete,
            5 => Op::Acquire,
            6 => Op::Release,
            7 => Op::Snapshot,
            8 => Op::Clone,
            9 => Op::MapRead,
            10 => Op::MapWrite,
            11 => Op::Info,
            12 => Op::Open,
            13 => Op::Close,
            _ => return None,
        })
    }
}

impl NumBytes for Op {
    fn num_bytes(&self) -> usize {
        4
    }
}

impl Write for Op {
    fn write(&self, bytes: &mut [u8], pos: &mut usize) -> Result<(), WriteError> {
        (*self as u32).write(bytes, pos)
    }
}

impl Read for Op {
    fn read(bytes: &[u8], pos: &mut usize) -> Result<Self, ReadError> {
        let raw = u32::read(bytes, pos)?;
        Op::from_u32(raw).ok_or(ReadError::ParseError)
    }
}

bitflags! {
    /// Flags carried on a request.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct ReqFlags: u32 {
        /// The lease may be granted without syncing it to stable storage.
        const NOSYNC = 1 << 0;
    }
}

/// Completion state of a served request. A reply is either served or
/// failed; nothing else can come back from a blocker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ReqState {
    Served = 1,
    Failed = 2,
}

impl NumBytes for ReqState {
    fn num_bytes(&self) -> usize {
        4
    }
}

impl Write for ReqState {
    fn write(&self, bytes: &mut [u8], pos: &mut usize) -> Result<(), WriteError> {
        (*self as u32).write(bytes, pos)
    }
}

impl Read for ReqState {
    fn read(bytes: &[u8], pos: &mut usize) -> Result<Self, ReadError> {
        match u32::read(bytes, pos)? {
            1 => Ok(ReqState::Served),
            2 => Ok(ReqState::Failed),
            _ => Err(ReadError::ParseError),
        }
    }
}

/// One request as submitted to a port. The same shape serves both the
/// mapper's incoming operations and the requests it sends to the blockers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub op: Op,
    pub flags: ReqFlags,
    pub target: String,
    pub offset: u64,
    pub size: u64,
    pub data: Vec<u8>,
}

impl Request {
    pub fn new(op: Op, target: impl Into<String>) -> Request {
        Request {
            op,
            flags: ReqFlags::empty(),
            target: target.into(),
            offset: 0,
            size: 0,
            data: Vec::new(),
        }
    }
}

impl NumBytes for Request {
    fn num_bytes(&self) -> usize {
        self.op.num_bytes()
            + 4
            + self.target.num_bytes()
            + self.offset.num_bytes()
            + self.size.num_bytes()
            + self.data.num_bytes()
    }
}

impl Write for Request {
    fn write(&self, bytes: &mut [u8], pos: &mut usize) -> Result<(), WriteError> {
        self.op.write(bytes, pos)?;
        self.flags.bits().write(bytes, pos)?;
        self.target.write(bytes, pos)?;
        self.offset.write(bytes, pos)?;
        self.size.write(bytes, pos)?;
        self.data.write(bytes, pos)
    }
}

impl Read for Request {
    fn read(bytes: &[u8], pos: &mut usize) -> Result<Self, ReadError> {
        Ok(Request {
            op: Op::read(bytes, pos)?,
            flags: ReqFlags::from_bits_truncate(u32::read(bytes, pos)?),
            target: String::read(bytes, pos)?,
            offset: u64::read(bytes, pos)?,
            size: u64::read(bytes, pos)?,
            data: Vec::<u8>::read(bytes, pos)?,
        })
    }
}

/// Completion of a request: the final state plus whatever payload the
/// server put in the request's data area.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub state: ReqState,
    pub data: Vec<u8>,
}

impl Reply {
    pub fn served(data: Vec<u8>) -> Reply {
        Reply {
            state: ReqState::Served,
            data,
        }
    }

    pub fn failed() -> Reply {
        Reply {
            state: ReqState::Failed,
            data: Vec::new(),
        }
    }

    pub fn is_served(&self) -> bool {
        self.state == ReqState::Served
    }
}

impl NumBytes for Reply {
    fn num_bytes(&self) -> usize {
        self.state.num_bytes() + self.data.num_bytes()
    }
}

impl Write for Reply {
    fn write(&self, bytes: &mut [u8], pos: &mut usize) -> Result<(), WriteError> {
        self.state.write(bytes, pos)?;
        self.data.write(bytes, pos)
    }
}

impl Read for Reply {
    fn read(bytes: &[u8], pos: &mut usize) -> Result<Self, ReadError> {
        Ok(Reply {
            state: ReqState::read(bytes, pos)?,
            data: Vec::<u8>::read(bytes, pos)?,
        })
    }
}

/// Payload of a `COPY` request: the object to copy from. The request's own
/// target names the object to create.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CopyPayload {
    pub target: String,
}

/// Payload of a `SNAPSHOT` reply: the name minted for the snapshot object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotReply {
    pub target: String,
}

/// Payload of a `CLONE` request: the parent to clone from (empty for a
/// fresh volume) and the requested size (`u64::MAX` inherits the parent's).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClonePayload {
    pub target: String,
    pub size: u64,
}

/// One segment of a resolved byte range.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapSegment {
    pub target: String,
    pub offset: u64,
    pub size: u64,
}

/// Reply to `MAPR`/`MAPW`: the object segments covering the request.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct MapReply {
    pub segs: Vec<MapSegment>,
}

/// Reply to `INFO`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InfoReply {
    pub size: u64,
}

macro_rules! impl_target_payload {
    ($t:ty) => {
        impl NumBytes for $t {
            fn num_bytes(&self) -> usize {
                self.target.num_bytes()
            }
        }

        impl Write for $t {
            fn write(&self, bytes: &mut [u8], pos: &mut usize) -> Result<(), WriteError> {
                self.target.write(bytes, pos)
            }
        }

        impl Read for $t {
            fn read(bytes: &[u8], pos: &mut usize) -> Result<Self, ReadError> {
                Ok(Self {
                    target: String::read(bytes, pos)?,
                })
            }
        }
    };
}

impl_target_payload!(CopyPayload);
impl_target_payload!(SnapshotReply);

impl NumBytes for ClonePayload {
    fn num_bytes(&self) -> usize {
        self.target.num_bytes() + self.size.num_bytes()
    }
}

impl Write for ClonePayload {
    fn write(&self, bytes: &mut [u8], pos: &mut usize) -> Result<(), WriteError> {
        self.target.write(bytes, pos)?;
        self.size.write(bytes, pos)
    }
}

impl Read for ClonePayload {
    fn read(bytes: &[u8], pos: &mut usize) -> Result<Self, ReadError> {
        Ok(ClonePayload {
            target: String::read(bytes, pos)?,
            size: u64::read(bytes, pos)?,
        })
    }
}

impl NumBytes for MapSegment {
    fn num_bytes(&self) -> usize {
        self.target.num_bytes() + self.offset.num_bytes() + self.size.num_bytes()
    }
}

impl Write for MapSegment {
    fn write(&self, bytes: &mut [u8], pos: &mut usize) -> Result<(), WriteError> {
        self.target.write(bytes, pos)?;
        self.offset.write(bytes, pos)?;
        self.size.write(bytes, pos)
    }
}

impl Read for MapSegment {
    fn read(bytes: &[u8], pos: &mut usize) -> Result<Self, ReadError> {
        Ok(MapSegment {
            target: String::read(bytes, pos)?,
            offset: u64::read(bytes, pos)?,
            size: u64::read(bytes, pos)?,
        })
    }
}

impl NumBytes for MapReply {
    fn num_bytes(&self) -> usize {
        4 + self.segs.iter().map(|s| s.num_bytes()).sum::<usize>()
    }
}

impl Write for MapReply {
    fn write(&self, bytes: &mut [u8], pos: &mut usize) -> Result<(), WriteError> {
        let cnt = u32::try_from(self.segs.len()).map_err(|_| WriteError::TryFromIntError)?;
        cnt.write(bytes, pos)?;
        for seg in &self.segs {
            seg.write(bytes, pos)?;
        }
        Ok(())
    }
}

impl Read for MapReply {
    fn read(bytes: &[u8], pos: &mut usize) -> Result<Self, ReadError> {
        let cnt = u32::read(bytes, pos)?;
        let mut segs = Vec::with_capacity(cnt as usize);
        for _ in 0..cnt {
            segs.push(MapSegment::read(bytes, pos)?);
        }
        Ok(MapReply { segs })
    }
}

impl NumBytes for InfoReply {
    fn num_bytes(&self) -> usize {
        8
    }
}

impl Write for InfoReply {
    fn write(&self, bytes: &mut [u8], pos: &mut usize) -> Result<(), WriteError> {
        self.size.write(bytes, pos)
    }
}

impl Read for InfoReply {
    fn read(bytes: &[u8], pos: &mut usize) -> Result<Self, ReadError> {
        Ok(InfoReply {
            size: u64::read(bytes, pos)?,
        })
    }
}
