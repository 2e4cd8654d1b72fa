//! The typed RPC catalog and its envelope encoding.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use galena_hashspace::HsSeed;
use galena_types::{ClockTime, ConfigKind, NodeId, ReplicateFlags, StatusKind, StoreFlags};

use crate::frame::Frame;
use crate::{WireError, WireResult};

/// Numeric method tags.
pub mod tag {
    pub const KEEP_ALIVE: u8 = 0;
    pub const HASH_SPACE_SYNC: u8 = 2;
    pub const REPLACE_COPY_START: u8 = 8;
    pub const REPLACE_DELETE_START: u8 = 9;
    pub const REPLACE_COPY_END: u8 = 10;
    pub const REPLACE_DELETE_END: u8 = 11;
    pub const REPLACE_OFFER: u8 = 16;
    pub const REPLICATE_SET: u8 = 32;
    pub const REPLICATE_DELETE: u8 = 33;
    pub const GET: u8 = 34;
    pub const SET: u8 = 35;
    pub const DELETE: u8 = 36;
    pub const GET_IF_MODIFIED: u8 = 37;
    pub const CREATE_BACKUP: u8 = 96;
    pub const GET_STATUS: u8 = 97;
    pub const SET_CONFIG: u8 = 98;
}

/// Whether an envelope carries a request or a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
}

/// A stored value together with its write stamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub value: Bytes,
    pub clocktime: ClockTime,
}

/// Outcome of `GetIfModified`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IfModified {
    /// The stored stamp is strictly newer than `if_time`.
    Modified(Record),
    /// The stored stamp is `if_time` or older; the caller's copy is current.
    NotModified,
    /// No such key.
    NotFound,
}

/// One `GetStatus` result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusValue {
    U64(u64),
    Text(String),
    Stamp(ClockTime),
    Seed(HsSeed),
}

/// A cluster RPC request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    KeepAlive {
        adjust_clock: u32,
    },
    HashSpaceSync {
        wseed: HsSeed,
        rseed: HsSeed,
        adjust_clock: u32,
    },
    ReplaceCopyStart {
        hsseed: HsSeed,
        adjust_clock: u32,
        full: bool,
    },
    ReplaceDeleteStart {
        hsseed: HsSeed,
        adjust_clock: u32,
    },
    /// Server -> manager: the copy phase for `clocktime` is complete.
    ReplaceCopyEnd {
        clocktime: ClockTime,
        adjust_clock: u32,
    },
    /// Server -> manager: the delete phase for `clocktime` is complete.
    ReplaceDeleteEnd {
        clocktime: ClockTime,
        adjust_clock: u32,
    },
    /// One-way notice that `addr` is about to stream offers; no response.
    ReplaceOffer {
        addr: NodeId,
    },
    ReplicateSet {
        adjust_clock: u32,
        flags: ReplicateFlags,
        clocktime: ClockTime,
        key: Bytes,
        value: Bytes,
    },
    ReplicateDelete {
        adjust_clock: u32,
        flags: ReplicateFlags,
        clocktime: ClockTime,
        key: Bytes,
    },
    Get {
        key: Bytes,
    },
    Set {
        flags: StoreFlags,
        key: Bytes,
        value: Bytes,
    },
    Delete {
        flags: StoreFlags,
        key: Bytes,
    },
    GetIfModified {
        key: Bytes,
        if_time: ClockTime,
    },
    CreateBackup {
        suffix: String,
    },
    GetStatus {
        command: StatusKind,
    },
    SetConfig {
        command: ConfigKind,
        arg: bool,
    },
}

/// A cluster RPC response, paired with its request by envelope `msgid`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    KeepAlive,
    /// `accepted == false` means the pushed seeds were obsolete.
    HashSpaceSync {
        accepted: bool,
    },
    ReplaceCopyStart {
        accepted: bool,
    },
    ReplaceDeleteStart {
        accepted: bool,
    },
    ReplaceCopyEnd {
        accepted: bool,
    },
    ReplaceDeleteEnd {
        accepted: bool,
    },
    /// `applied == false` means the replica refused or ignored the write.
    ReplicateSet {
        applied: bool,
    },
    ReplicateDelete {
        applied: bool,
    },
    Get(Option<Record>),
    /// `None` means the write failed.
    Set(Option<ClockTime>),
    /// `Some(true)` deleted, `Some(false)` not found, `None` failed.
    Delete(Option<bool>),
    GetIfModified(IfModified),
    CreateBackup {
        ok: bool,
    },
    GetStatus(StatusValue),
    SetConfig,
}

// Per-method body payloads. Requests and responses share the envelope;
// the tag selects which of these the body bytes decode into.

#[derive(Serialize, Deserialize)]
struct KeepAliveBody {
    adjust_clock: u32,
}

#[derive(Serialize, Deserialize)]
struct HashSpaceSyncBody {
    wseed: HsSeed,
    rseed: HsSeed,
    adjust_clock: u32,
}

#[derive(Serialize, Deserialize)]
struct ReplaceCopyStartBody {
    hsseed: HsSeed,
    adjust_clock: u32,
    full: bool,
}

#[derive(Serialize, Deserialize)]
struct ReplaceDeleteStartBody {
    hsseed: HsSeed,
    adjust_clock: u32,
}

#[derive(Serialize, Deserialize)]
struct ReplaceEndBody {
    clocktime: ClockTime,
    adjust_clock: u32,
}

#[derive(Serialize, Deserialize)]
struct ReplaceOfferBody {
    addr: NodeId,
}

#[derive(Serialize, Deserialize)]
struct ReplicateSetBody {
    adjust_clock: u32,
    flags: ReplicateFlags,
    clocktime: ClockTime,
    key: ByteBuf,
    value: ByteBuf,
}

#[derive(Serialize, Deserialize)]
struct ReplicateDeleteBody {
    adjust_clock: u32,
    flags: ReplicateFlags,
    clocktime: ClockTime,
    key: ByteBuf,
}

#[derive(Serialize, Deserialize)]
struct GetBody {
    key: ByteBuf,
}

#[derive(Serialize, Deserialize)]
struct SetBody {
    flags: StoreFlags,
    key: ByteBuf,
    value: ByteBuf,
}

#[derive(Serialize, Deserialize)]
struct DeleteBody {
    flags: StoreFlags,
    key: ByteBuf,
}

#[derive(Serialize, Deserialize)]
struct GetIfModifiedBody {
    key: ByteBuf,
    if_time: ClockTime,
}

#[derive(Serialize, Deserialize)]
struct CreateBackupBody {
    suffix: String,
}

#[derive(Serialize, Deserialize)]
struct GetStatusBody {
    command: StatusKind,
}

#[derive(Serialize, Deserialize)]
struct SetConfigBody {
    command: ConfigKind,
    arg: bool,
}

fn to_body<T: Serialize>(value: &T) -> WireResult<Vec<u8>> {
    Ok(rmp_serde::to_vec(value)?)
}

fn from_body<'a, T: Deserialize<'a>>(body: &'a [u8]) -> WireResult<T> {
    Ok(rmp_serde::from_slice(body)?)
}

impl Request {
    /// The numeric method tag for this request.
    pub fn tag(&self) -> u8 {
        match self {
            Request::KeepAlive { .. } => tag::KEEP_ALIVE,
            Request::HashSpaceSync { .. } => tag::HASH_SPACE_SYNC,
            Request::ReplaceCopyStart { .. } => tag::REPLACE_COPY_START,
            Request::ReplaceDeleteStart { .. } => tag::REPLACE_DELETE_START,
            Request::ReplaceCopyEnd { .. } => tag::REPLACE_COPY_END,
            Request::ReplaceDeleteEnd { .. } => tag::REPLACE_DELETE_END,
            Request::ReplaceOffer { .. } => tag::REPLACE_OFFER,
            Request::ReplicateSet { .. } => tag::REPLICATE_SET,
            Request::ReplicateDelete { .. } => tag::REPLICATE_DELETE,
            Request::Get { .. } => tag::GET,
            Request::Set { .. } => tag::SET,
            Request::Delete { .. } => tag::DELETE,
            Request::GetIfModified { .. } => tag::GET_IF_MODIFIED,
            Request::CreateBackup { .. } => tag::CREATE_BACKUP,
            Request::GetStatus { .. } => tag::GET_STATUS,
            Request::SetConfig { .. } => tag::SET_CONFIG,
        }
    }

    fn encode_body(&self) -> WireResult<Vec<u8>> {
        match self {
            Request::KeepAlive { adjust_clock } => to_body(&KeepAliveBody {
                adjust_clock: *adjust_clock,
            }),
            Request::HashSpaceSync {
                wseed,
                rseed,
                adjust_clock,
            } => to_body(&HashSpaceSyncBody {
                wseed: wseed.clone(),
                rseed: rseed.clone(),
                adjust_clock: *adjust_clock,
            }),
            Request::ReplaceCopyStart {
                hsseed,
                adjust_clock,
                full,
            } => to_body(&ReplaceCopyStartBody {
                hsseed: hsseed.clone(),
                adjust_clock: *adjust_clock,
                full: *full,
            }),
            Request::ReplaceDeleteStart {
                hsseed,
                adjust_clock,
            } => to_body(&ReplaceDeleteStartBody {
                hsseed: hsseed.clone(),
                adjust_clock: *adjust_clock,
            }),
            Request::ReplaceCopyEnd {
                clocktime,
                adjust_clock,
            }
            | Request::ReplaceDeleteEnd {
                clocktime,
                adjust_clock,
            } => to_body(&ReplaceEndBody {
                clocktime: *clocktime,
                adjust_clock: *adjust_clock,
            }),
            Request::ReplaceOffer { addr } => to_body(&ReplaceOfferBody { addr: *addr }),
            Request::ReplicateSet {
                adjust_clock,
                flags,
                clocktime,
                key,
                value,
            } => to_body(&ReplicateSetBody {
                adjust_clock: *adjust_clock,
                flags: *flags,
                clocktime: *clocktime,
                key: ByteBuf::from(key.to_vec()),
                value: ByteBuf::from(value.to_vec()),
            }),
            Request::ReplicateDelete {
                adjust_clock,
                flags,
                clocktime,
                key,
            } => to_body(&ReplicateDeleteBody {
                adjust_clock: *adjust_clock,
                flags: *flags,
                clocktime: *clocktime,
                key: ByteBuf::from(key.to_vec()),
            }),
            Request::Get { key } => to_body(&GetBody {
                key: ByteBuf::from(key.to_vec()),
            }),
            Request::Set { flags, key, value } => to_body(&SetBody {
                flags: *flags,
                key: ByteBuf::from(key.to_vec()),
                value: ByteBuf::from(value.to_vec()),
            }),
            Request::Delete { flags, key } => to_body(&DeleteBody {
                flags: *flags,
                key: ByteBuf::from(key.to_vec()),
            }),
            Request::GetIfModified { key, if_time } => to_body(&GetIfModifiedBody {
                key: ByteBuf::from(key.to_vec()),
                if_time: *if_time,
            }),
            Request::CreateBackup { suffix } => to_body(&CreateBackupBody {
                suffix: suffix.clone(),
            }),
            Request::GetStatus { command } => to_body(&GetStatusBody { command: *command }),
            Request::SetConfig { command, arg } => to_body(&SetConfigBody {
                command: *command,
                arg: *arg,
            }),
        }
    }

    fn decode_body(method: u8, body: &[u8]) -> WireResult<Request> {
        match method {
            tag::KEEP_ALIVE => {
                let b: KeepAliveBody = from_body(body)?;
                Ok(Request::KeepAlive {
                    adjust_clock: b.adjust_clock,
                })
            }
            tag::HASH_SPACE_SYNC => {
                let b: HashSpaceSyncBody = from_body(body)?;
                Ok(Request::HashSpaceSync {
                    wseed: b.wseed,
                    rseed: b.rseed,
                    adjust_clock: b.adjust_clock,
                })
            }
            tag::REPLACE_COPY_START => {
                let b: ReplaceCopyStartBody = from_body(body)?;
                Ok(Request::ReplaceCopyStart {
                    hsseed: b.hsseed,
                    adjust_clock: b.adjust_clock,
                    full: b.full,
                })
            }
            tag::REPLACE_DELETE_START => {
                let b: ReplaceDeleteStartBody = from_body(body)?;
                Ok(Request::ReplaceDeleteStart {
                    hsseed: b.hsseed,
                    adjust_clock: b.adjust_clock,
                })
            }
            tag::REPLACE_COPY_END => {
                let b: ReplaceEndBody = from_body(body)?;
                Ok(Request::ReplaceCopyEnd {
                    clocktime: b.clocktime,
                    adjust_clock: b.adjust_clock,
                })
            }
            tag::REPLACE_DELETE_END => {
                let b: ReplaceEndBody = from_body(body)?;
                Ok(Request::ReplaceDeleteEnd {
                    clocktime: b.clocktime,
                    adjust_clock: b.adjust_clock,
                })
            }
            tag::REPLACE_OFFER => {
                let b: ReplaceOfferBody = from_body(body)?;
                Ok(Request::ReplaceOffer { addr: b.addr })
            }
            tag::REPLICATE_SET => {
                let b: ReplicateSetBody = from_body(body)?;
                Ok(Request::ReplicateSet {
                    adjust_clock: b.adjust_clock,
                    flags: b.flags,
                    clocktime: b.clocktime,
                    key: Bytes::from(b.key.into_vec()),
                    value: Bytes::from(b.value.into_vec()),
                })
            }
            tag::REPLICATE_DELETE => {
                let b: ReplicateDeleteBody = from_body(body)?;
                Ok(Request::ReplicateDelete {
                    adjust_clock: b.adjust_clock,
                    flags: b.flags,
                    clocktime: b.clocktime,
                    key: Bytes::from(b.key.into_vec()),
                })
            }
            tag::GET => {
                let b: GetBody = from_body(body)?;
                Ok(Request::Get {
                    key: Bytes::from(b.key.into_vec()),
                })
            }
            tag::SET => {
                let b: SetBody = from_body(body)?;
                Ok(Request::Set {
                    flags: b.flags,
                    key: Bytes::from(b.key.into_vec()),
                    value: Bytes::from(b.value.into_vec()),
                })
            }
            tag::DELETE => {
                let b: DeleteBody = from_body(body)?;
                Ok(Request::Delete {
                    flags: b.flags,
                    key: Bytes::from(b.key.into_vec()),
                })
            }
            tag::GET_IF_MODIFIED => {
                let b: GetIfModifiedBody = from_body(body)?;
                Ok(Request::GetIfModified {
                    key: Bytes::from(b.key.into_vec()),
                    if_time: b.if_time,
                })
            }
            tag::CREATE_BACKUP => {
                let b: CreateBackupBody = from_body(body)?;
                Ok(Request::CreateBackup { suffix: b.suffix })
            }
            tag::GET_STATUS => {
                let b: GetStatusBody = from_body(body)?;
                Ok(Request::GetStatus { command: b.command })
            }
            tag::SET_CONFIG => {
                let b: SetConfigBody = from_body(body)?;
                Ok(Request::SetConfig {
                    command: b.command,
                    arg: b.arg,
                })
            }
            other => Err(WireError::UnknownTag(other)),
        }
    }
}

impl Response {
    /// The numeric method tag this response answers.
    pub fn tag(&self) -> u8 {
        match self {
            Response::KeepAlive => tag::KEEP_ALIVE,
            Response::HashSpaceSync { .. } => tag::HASH_SPACE_SYNC,
            Response::ReplaceCopyStart { .. } => tag::REPLACE_COPY_START,
            Response::ReplaceDeleteStart { .. } => tag::REPLACE_DELETE_START,
            Response::ReplaceCopyEnd { .. } => tag::REPLACE_COPY_END,
            Response::ReplaceDeleteEnd { .. } => tag::REPLACE_DELETE_END,
            Response::ReplicateSet { .. } => tag::REPLICATE_SET,
            Response::ReplicateDelete { .. } => tag::REPLICATE_DELETE,
            Response::Get(_) => tag::GET,
            Response::Set(_) => tag::SET,
            Response::Delete(_) => tag::DELETE,
            Response::GetIfModified(_) => tag::GET_IF_MODIFIED,
            Response::CreateBackup { .. } => tag::CREATE_BACKUP,
            Response::GetStatus(_) => tag::GET_STATUS,
            Response::SetConfig => tag::SET_CONFIG,
        }
    }

    fn encode_body(&self) -> WireResult<Vec<u8>> {
        match self {
            Response::KeepAlive | Response::SetConfig => to_body(&()),
            Response::HashSpaceSync { accepted }
            | Response::ReplaceCopyStart { accepted }
            | Response::ReplaceDeleteStart { accepted }
            | Response::ReplaceCopyEnd { accepted }
            | Response::ReplaceDeleteEnd { accepted } => to_body(accepted),
            Response::ReplicateSet { applied } | Response::ReplicateDelete { applied } => {
                to_body(applied)
            }
            Response::Get(record) => to_body(record),
            Response::Set(clocktime) => to_body(clocktime),
            Response::Delete(deleted) => to_body(deleted),
            Response::GetIfModified(result) => to_body(result),
            Response::CreateBackup { ok } => to_body(ok),
            Response::GetStatus(value) => to_body(value),
        }
    }

    fn decode_body(method: u8, body: &[u8]) -> WireResult<Response> {
        match method {
            tag::KEEP_ALIVE => Ok(Response::KeepAlive),
            tag::HASH_SPACE_SYNC => Ok(Response::HashSpaceSync {
                accepted: from_body(body)?,
            }),
            tag::REPLACE_COPY_START => Ok(Response::ReplaceCopyStart {
                accepted: from_body(body)?,
            }),
            tag::REPLACE_DELETE_START => Ok(Response::ReplaceDeleteStart {
                accepted: from_body(body)?,
            }),
            tag::REPLACE_COPY_END => Ok(Response::ReplaceCopyEnd {
                accepted: from_body(body)?,
            }),
            tag::REPLACE_DELETE_END => Ok(Response::ReplaceDeleteEnd {
                accepted: from_body(body)?,
            }),
            tag::REPLICATE_SET => Ok(Response::ReplicateSet {
                applied: from_body(body)?,
            }),
            tag::REPLICATE_DELETE => Ok(Response::ReplicateDelete {
                applied: from_body(body)?,
            }),
            tag::GET => Ok(Response::Get(from_body(body)?)),
            tag::SET => Ok(Response::Set(from_body(body)?)),
            tag::DELETE => Ok(Response::Delete(from_body(body)?)),
            tag::GET_IF_MODIFIED => Ok(Response::GetIfModified(from_body(body)?)),
            tag::CREATE_BACKUP => Ok(Response::CreateBackup {
                ok: from_body(body)?,
            }),
            tag::GET_STATUS => Ok(Response::GetStatus(from_body(body)?)),
            tag::SET_CONFIG => Ok(Response::SetConfig),
            other => Err(WireError::UnknownTag(other)),
        }
    }
}

/// The envelope as it travels inside a frame.
#[derive(Serialize, Deserialize)]
struct Envelope {
    kind: u8,
    msgid: u32,
    tag: u8,
    body: ByteBuf,
}

const KIND_REQUEST: u8 = 0;
const KIND_RESPONSE: u8 = 1;

/// One correlated protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request { msgid: u32, request: Request },
    Response { msgid: u32, response: Response },
}

impl Message {
    pub fn request(msgid: u32, request: Request) -> Self {
        Message::Request { msgid, request }
    }

    pub fn response(msgid: u32, response: Response) -> Self {
        Message::Response { msgid, response }
    }

    pub fn msgid(&self) -> u32 {
        match self {
            Message::Request { msgid, .. } | Message::Response { msgid, .. } => *msgid,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Request { .. } => MessageKind::Request,
            Message::Response { .. } => MessageKind::Response,
        }
    }

    /// Encodes the message into a frame ready for a write buffer.
    pub fn to_frame(&self) -> WireResult<Frame> {
        let envelope = match self {
            Message::Request { msgid, request } => Envelope {
                kind: KIND_REQUEST,
                msgid: *msgid,
                tag: request.tag(),
                body: ByteBuf::from(request.encode_body()?),
            },
            Message::Response { msgid, response } => Envelope {
                kind: KIND_RESPONSE,
                msgid: *msgid,
                tag: response.tag(),
                body: ByteBuf::from(response.encode_body()?),
            },
        };
        Ok(Frame::new(Bytes::from(rmp_serde::to_vec(&envelope)?)))
    }

    /// Decodes a message from a frame payload.
    pub fn from_frame(frame: &Frame) -> WireResult<Message> {
        let envelope: Envelope = rmp_serde::from_slice(&frame.payload)?;
        match envelope.kind {
            KIND_REQUEST => Ok(Message::Request {
                msgid: envelope.msgid,
                request: Request::decode_body(envelope.tag, &envelope.body)?,
            }),
            KIND_RESPONSE => Ok(Message::Response {
                msgid: envelope.msgid,
                response: Response::decode_body(envelope.tag, &envelope.body)?,
            }),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}
