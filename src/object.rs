//! Replicated object encoding helpers.
//!
//! Three small pieces live here:
//!
//! - [`ReplObject`]: the unit of replication (bkey + vclock + value).
//! - The packed-bkey codec ([`binpack_bkey`] / [`binunpack_bkey`]):
//!   a self-delimiting binary form used as the sort key in Merkle
//!   keyfiles and segment hash lists.
//! - The versioned object message codec ([`encode_obj_msg`] /
//!   [`decode_obj_msg`]): frames one object for `PUT_OBJ`. Only wire
//!   version `w1` carries AAE diff objects; older versions are
//!   rejected.
//!
//! The replication helper hook ([`ReplHelper`]) lets the host veto an
//! object or attach supplementary objects that must travel with it.

use crate::config::WireVersion;
use crate::vnode::{BKey, VClock};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The unit of replication: one object replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplObject {
    pub bkey: BKey,
    pub vclock: VClock,
    pub value: Vec<u8>,
}

impl ReplObject {
    pub fn new(bkey: BKey, vclock: VClock, value: impl Into<Vec<u8>>) -> Self {
        Self {
            bkey,
            vclock,
            value: value.into(),
        }
    }
}

/// Content hash of an object's encoded form, as stored in hash trees
/// and Merkle keyfiles.
pub fn hash_object(bytes: &[u8]) -> Vec<u8> {
    Sha256::digest(bytes).to_vec()
}

/// Pack a bkey into its self-delimiting binary form.
///
/// Layout: 4-byte big-endian bucket length, bucket bytes, key bytes.
/// The inverse is [`binunpack_bkey`].
pub fn binpack_bkey(bkey: &BKey) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + bkey.bucket.len() + bkey.key.len());
    buf.put_u32(bkey.bucket.len() as u32);
    buf.put_slice(&bkey.bucket);
    buf.put_slice(&bkey.key);
    buf.freeze()
}

/// Unpack a bkey produced by [`binpack_bkey`].
///
/// Returns `None` if the buffer is truncated.
pub fn binunpack_bkey(packed: &[u8]) -> Option<BKey> {
    let mut buf = packed;
    if buf.remaining() < 4 {
        return None;
    }
    let bucket_len = buf.get_u32() as usize;
    if buf.remaining() < bucket_len {
        return None;
    }
    let bucket = buf[..bucket_len].to_vec();
    buf.advance(bucket_len);
    let key = buf.to_vec();
    Some(BKey { bucket, key })
}

/// Tag distinguishing the kinds of object message a sink can receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjTag {
    /// An object streamed because AAE found it divergent.
    FsDiffObj,
}

/// The framed object message carried in a `PUT_OBJ` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ObjMsg {
    version: u8,
    tag: ObjTag,
    object: ReplObject,
}

const OBJ_MSG_V1: u8 = 1;

/// Encode one object message at the given wire version.
///
/// Only `w1` supports AAE diff objects; any other version is an error.
pub fn encode_obj_msg(
    wire_version: WireVersion,
    tag: ObjTag,
    object: &ReplObject,
) -> Result<Bytes, String> {
    if !wire_version.supports_aae() {
        return Err(format!("wire version {wire_version} cannot carry AAE objects"));
    }
    let msg = ObjMsg {
        version: OBJ_MSG_V1,
        tag,
        object: object.clone(),
    };
    bincode::serialize(&msg)
        .map(Bytes::from)
        .map_err(|e| e.to_string())
}

/// Decode an object message produced by [`encode_obj_msg`].
pub fn decode_obj_msg(bytes: &[u8]) -> Result<(ObjTag, ReplObject), String> {
    let msg: ObjMsg = bincode::deserialize(bytes).map_err(|e| e.to_string())?;
    if msg.version != OBJ_MSG_V1 {
        return Err(format!("unknown object message version {}", msg.version));
    }
    Ok((msg.tag, msg.object))
}

/// Outcome of the replication helper hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelperOutcome {
    /// Do not replicate this object at all.
    Cancel,
    /// Replicate, preceded by these supplementary objects.
    Objects(Vec<ReplObject>),
}

/// Host hook invoked for every object about to be replicated.
///
/// The helper may cancel replication or return supplementary objects
/// that must be sent ahead of the primary one.
#[async_trait]
pub trait ReplHelper: Send + Sync {
    async fn send(&self, object: &ReplObject) -> HelperOutcome;
}

/// A helper that never cancels and never adds companions.
#[derive(Clone, Default)]
pub struct NoOpReplHelper;

#[async_trait]
impl ReplHelper for NoOpReplHelper {
    async fn send(&self, _object: &ReplObject) -> HelperOutcome {
        HelperOutcome::Objects(Vec::new())
    }
}
