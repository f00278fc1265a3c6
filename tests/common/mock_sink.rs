//! Scripted AAE sink speaking the wire protocol over an in-memory
//! duplex pipe.
//!
//! Records every frame the source sends for assertions and answers
//! synchronous requests from configured replies and tree data.

use fullsync_engine::transport::Transport;
use fullsync_engine::wire::{BucketQuery, Frame, FrameCodec, MsgTag, SegmentQuery, SyncReply};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio::sync::Mutex;
use tokio_util::codec::Framed;

/// One frame the sink saw, decoded enough for assertions.
#[derive(Debug, Clone)]
pub struct SeenFrame {
    pub tag: MsgTag,
    pub payload: Vec<u8>,
}

/// Behavior configuration for the scripted sink.
#[derive(Clone)]
pub struct SinkScript {
    /// Reply to `LOCK_TREE`.
    pub lock_reply: SyncReply,
    /// Reply to `UPDATE_TREE`.
    pub update_reply: SyncReply,
    /// Bucket hashes served for `GET_AAE_BUCKET`.
    pub buckets: Vec<(u64, Vec<u8>)>,
    /// Key hashes served for `GET_AAE_SEGMENT`, by segment.
    pub segments: HashMap<u64, Vec<(Vec<u8>, Vec<u8>)>>,
}

impl Default for SinkScript {
    fn default() -> Self {
        Self {
            lock_reply: SyncReply::Ok,
            update_reply: SyncReply::Ok,
            buckets: Vec::new(),
            segments: HashMap::new(),
        }
    }
}

/// A running scripted sink.
pub struct MockSink {
    seen: Arc<Mutex<Vec<SeenFrame>>>,
    task: tokio::task::JoinHandle<()>,
}

impl MockSink {
    /// Spawn the sink over one end of a duplex pipe; hand the source
    /// the [`Transport`] for the other end.
    pub fn spawn(script: SinkScript) -> (Transport, Self) {
        let (source_io, sink_io) = tokio::io::duplex(1 << 16);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let task = tokio::spawn(run_sink(sink_io, script, Arc::clone(&seen)));
        (
            Transport::from_io(source_io, "mock-sink"),
            Self { seen, task },
        )
    }

    /// Wait for the source to hang up, then return everything seen.
    pub async fn finish(self) -> Vec<SeenFrame> {
        let _ = self.task.await;
        Arc::try_unwrap(self.seen)
            .expect("sink task gone, no other holders")
            .into_inner()
    }

    /// Frames seen so far, without waiting for the connection to end.
    #[allow(dead_code)]
    pub async fn seen_so_far(&self) -> Vec<SeenFrame> {
        self.seen.lock().await.clone()
    }
}

async fn run_sink(io: DuplexStream, script: SinkScript, seen: Arc<Mutex<Vec<SeenFrame>>>) {
    let mut framed = Framed::new(io, FrameCodec::new());
    while let Some(frame) = framed.next().await {
        let Ok(frame) = frame else { break };
        seen.lock().await.push(SeenFrame {
            tag: frame.tag,
            payload: frame.payload.to_vec(),
        });

        let reply = match frame.tag {
            MsgTag::Init => Some(SyncReply::Ok),
            MsgTag::LockTree => Some(script.lock_reply.clone()),
            MsgTag::UpdateTree => Some(script.update_reply.clone()),
            MsgTag::GetAaeBucket => {
                let _query: BucketQuery = frame.decode_payload().expect("bucket query");
                Some(SyncReply::BucketHashes(script.buckets.clone()))
            }
            MsgTag::GetAaeSegment => {
                let query: SegmentQuery = frame.decode_payload().expect("segment query");
                Some(SyncReply::KeyHashes(
                    script.segments.get(&query.segment).cloned().unwrap_or_default(),
                ))
            }
            // Async frames: no reply.
            MsgTag::PutObj | MsgTag::Complete => None,
            MsgTag::Reply => None,
        };

        if let Some(reply) = reply {
            let frame = Frame::encoded(MsgTag::Reply, &reply).expect("encodable reply");
            if framed.send(frame).await.is_err() {
                break;
            }
        }
    }
}

/// Tags of all seen frames, for order assertions.
#[allow(dead_code)]
pub fn tags(seen: &[SeenFrame]) -> Vec<MsgTag> {
    seen.iter().map(|f| f.tag).collect()
}

/// How many frames carried a given tag.
#[allow(dead_code)]
pub fn count(seen: &[SeenFrame], tag: MsgTag) -> usize {
    seen.iter().filter(|f| f.tag == tag).count()
}
