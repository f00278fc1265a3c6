// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Wire protocol: message tags, frames, and reply terms.
//!
//! Every frame on the source↔sink transport is a 4-byte big-endian
//! length prefix followed by a single-byte [`MsgTag`] and an optional
//! payload. The codec splits the tag off as a separate header token so
//! the state machine dispatches on it without touching the payload.
//!
//! # Tags
//!
//! | Tag | Direction | Payload | Reply |
//! |-----|-----------|---------|-------|
//! | `INIT` | src→sink | partition id | `ok` |
//! | `LOCK_TREE` | src→sink | none | `ok` or error |
//! | `UPDATE_TREE` | src→sink | IndexN | `ok` or `not_responsible` |
//! | `GET_AAE_BUCKET` | src→sink | (level, bucket, IndexN) | bucket hashes |
//! | `GET_AAE_SEGMENT` | src→sink | (segment, IndexN) | key hashes |
//! | `PUT_OBJ` | src→sink | encoded object | none (async) |
//! | `COMPLETE` | src→sink | none | none (async) |
//! | `REPLY` | sink→src | encoded [`SyncReply`] | n/a |
//!
//! Payloads are bincode-encoded serde terms; replies are a
//! [`SyncReply`] whose meaning is defined per request.

use crate::vnode::IndexN;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Single-byte message tags. A closed set; anything else is a protocol
/// violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgTag {
    Init = 1,
    LockTree = 2,
    UpdateTree = 3,
    GetAaeBucket = 4,
    GetAaeSegment = 5,
    PutObj = 6,
    Complete = 7,
    Reply = 8,
}

impl MsgTag {
    /// Decode a tag byte. `None` for anything outside the closed set.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(MsgTag::Init),
            2 => Some(MsgTag::LockTree),
            3 => Some(MsgTag::UpdateTree),
            4 => Some(MsgTag::GetAaeBucket),
            5 => Some(MsgTag::GetAaeSegment),
            6 => Some(MsgTag::PutObj),
            7 => Some(MsgTag::Complete),
            8 => Some(MsgTag::Reply),
            _ => None,
        }
    }
}

impl std::fmt::Display for MsgTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MsgTag::Init => "INIT",
            MsgTag::LockTree => "LOCK_TREE",
            MsgTag::UpdateTree => "UPDATE_TREE",
            MsgTag::GetAaeBucket => "GET_AAE_BUCKET",
            MsgTag::GetAaeSegment => "GET_AAE_SEGMENT",
            MsgTag::PutObj => "PUT_OBJ",
            MsgTag::Complete => "COMPLETE",
            MsgTag::Reply => "REPLY",
        };
        write!(f, "{name}")
    }
}

/// One wire frame: tag plus raw payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: MsgTag,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(tag: MsgTag, payload: Bytes) -> Self {
        Self { tag, payload }
    }

    /// A frame with no payload.
    pub fn bare(tag: MsgTag) -> Self {
        Self {
            tag,
            payload: Bytes::new(),
        }
    }

    /// A frame whose payload is a bincode-encoded term.
    pub fn encoded<T: Serialize>(tag: MsgTag, term: &T) -> io::Result<Self> {
        let payload = bincode::serialize(term)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Self {
            tag,
            payload: Bytes::from(payload),
        })
    }

    /// Decode the payload as a bincode term.
    pub fn decode_payload<T: for<'de> Deserialize<'de>>(&self) -> io::Result<T> {
        bincode::deserialize(&self.payload)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Wraps [`LengthDelimitedCodec`] with the single-byte tag split.
#[derive(Debug)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

/// Max frame length: 16 MB. Objects larger than this do not fullsync.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

impl FrameCodec {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LEN)
                .length_field_length(4)
                .new_codec(),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(mut body) = self.inner.decode(src)? else {
            return Ok(None);
        };
        if body.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "empty frame (missing tag byte)",
            ));
        }
        let tag_byte = body.get_u8();
        let tag = MsgTag::from_u8(tag_byte).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown message tag {tag_byte:#04x}"),
            )
        })?;
        Ok(Some(Frame {
            tag,
            payload: body.freeze(),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut body = BytesMut::with_capacity(1 + item.payload.len());
        body.put_u8(item.tag as u8);
        body.put_slice(&item.payload);
        self.inner.encode(body.freeze(), dst)
    }
}

/// Reply terms carried in a `REPLY` frame. Meaning is per-request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncReply {
    /// Request acknowledged.
    Ok,
    /// Request rejected with a reason.
    Error(String),
    /// The sink's tree does not own the requested IndexN.
    NotResponsible,
    /// Answer to `GET_AAE_BUCKET`: (bucket, hash) pairs at one level.
    BucketHashes(Vec<(u64, Vec<u8>)>),
    /// Answer to `GET_AAE_SEGMENT`: (packed bkey, hash) pairs.
    KeyHashes(Vec<(Vec<u8>, Vec<u8>)>),
}

/// Payload of `GET_AAE_BUCKET`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketQuery {
    pub level: u64,
    pub bucket: u64,
    pub index_n: IndexN,
}

/// Payload of `GET_AAE_SEGMENT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentQuery {
    pub segment: u64,
    pub index_n: IndexN,
}
