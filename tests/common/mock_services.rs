//! Mock hash-tree and vnode services.
//!
//! The tree service drives a real bucket/segment comparison against
//! the remote callback, computing key diffs exactly the way the
//! external subsystem would: local data that the remote lacks is
//! `Missing`, remote-only data is `RemoteMissing`, and hash mismatches
//! are `Different`.

use async_trait::async_trait;
use fullsync_engine::object::{binpack_bkey, binunpack_bkey, HelperOutcome, ReplHelper, ReplObject};
use fullsync_engine::tree::{
    DiffSink, HashTreeService, KeyDiff, RemoteTree, TreeHandle, UpdateOutcome,
};
use fullsync_engine::vnode::{BKey, GetResult, IndexN, NodeId, Preflist, VClock, VnodeService};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// How the mock tree service answers update requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateBehavior {
    Ok,
    NotResponsible,
    /// Never answer; the engine has to be cancelled or killed.
    Hang,
}

/// Mock of the external hash-tree subsystem.
pub struct MockTreeService {
    handle: TreeHandle,
    up_tx: Mutex<Option<watch::Sender<bool>>>,
    lock_result: Mutex<Result<(), String>>,
    update_behavior: Mutex<UpdateBehavior>,
    /// Local bucket hashes at the single comparison level.
    buckets: Mutex<Vec<(u64, Vec<u8>)>>,
    /// Local (packed bkey, hash) pairs per segment.
    segments: Mutex<HashMap<u64, Vec<(Vec<u8>, Vec<u8>)>>>,
}

impl MockTreeService {
    pub fn new() -> Self {
        let (handle, up_tx) = TreeHandle::new(1);
        Self {
            handle,
            up_tx: Mutex::new(Some(up_tx)),
            lock_result: Mutex::new(Ok(())),
            update_behavior: Mutex::new(UpdateBehavior::Ok),
            buckets: Mutex::new(Vec::new()),
            segments: Mutex::new(HashMap::new()),
        }
    }

    /// Simulate the tree process dying.
    pub fn kill_tree(&self) {
        self.up_tx.lock().unwrap().take();
    }

    pub fn reject_lock(&self, reason: &str) {
        *self.lock_result.lock().unwrap() = Err(reason.to_string());
    }

    pub fn set_update_behavior(&self, behavior: UpdateBehavior) {
        *self.update_behavior.lock().unwrap() = behavior;
    }

    pub fn set_buckets(&self, buckets: Vec<(u64, Vec<u8>)>) {
        *self.buckets.lock().unwrap() = buckets;
    }

    pub fn set_segment(&self, segment: u64, keys: Vec<(Vec<u8>, Vec<u8>)>) {
        self.segments.lock().unwrap().insert(segment, keys);
    }

    /// Configure one local key in bucket/segment `segment`.
    pub fn put_local_key(&self, segment: u64, bkey: &BKey, hash: &[u8]) {
        self.segments
            .lock()
            .unwrap()
            .entry(segment)
            .or_default()
            .push((binpack_bkey(bkey).to_vec(), hash.to_vec()));
    }
}

impl Default for MockTreeService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HashTreeService for MockTreeService {
    async fn tree(&self, _partition: u64) -> Option<TreeHandle> {
        Some(self.handle.clone())
    }

    async fn get_lock(&self, _tree: &TreeHandle, _tag: &str) -> Result<(), String> {
        self.lock_result.lock().unwrap().clone()
    }

    async fn update(&self, _index_n: IndexN, _tree: &TreeHandle) -> UpdateOutcome {
        let behavior = *self.update_behavior.lock().unwrap();
        match behavior {
            UpdateBehavior::Ok => UpdateOutcome::Built,
            UpdateBehavior::NotResponsible => UpdateOutcome::NotResponsible,
            UpdateBehavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                UpdateOutcome::Built
            }
        }
    }

    async fn compare(
        &self,
        _index_n: IndexN,
        remote: &mut (dyn RemoteTree + Send),
        sink: &mut (dyn DiffSink + Send),
        _tree: &TreeHandle,
    ) -> std::io::Result<()> {
        remote.init().await?;

        let remote_buckets: HashMap<u64, Vec<u8>> =
            remote.get_bucket(0, 0).await?.into_iter().collect();
        let local_buckets = self.buckets.lock().unwrap().clone();

        // Walk every bucket either side knows about; matching hashes
        // prune the segment query.
        let mut all: Vec<u64> = local_buckets.iter().map(|(b, _)| *b).collect();
        all.extend(remote_buckets.keys().copied());
        all.sort_unstable();
        all.dedup();

        let local_map: HashMap<u64, Vec<u8>> = local_buckets.into_iter().collect();
        let mut diffs = Vec::new();
        for bucket in all {
            if local_map.get(&bucket) == remote_buckets.get(&bucket) {
                continue;
            }
            let remote_keys: BTreeMap<Vec<u8>, Vec<u8>> =
                remote.key_hashes(bucket).await?.into_iter().collect();
            let local_keys: BTreeMap<Vec<u8>, Vec<u8>> = self
                .segments
                .lock()
                .unwrap()
                .get(&bucket)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .collect();

            for (packed, local_hash) in &local_keys {
                let bkey = binunpack_bkey(packed).expect("well-formed packed bkey");
                match remote_keys.get(packed) {
                    None => diffs.push(KeyDiff::Missing(bkey)),
                    Some(remote_hash) if remote_hash != local_hash => {
                        diffs.push(KeyDiff::Different(bkey));
                    }
                    Some(_) => {}
                }
            }
            for packed in remote_keys.keys() {
                if !local_keys.contains_key(packed) {
                    let bkey = binunpack_bkey(packed).expect("well-formed packed bkey");
                    diffs.push(KeyDiff::RemoteMissing(bkey));
                }
            }
        }

        if !diffs.is_empty() {
            sink.key_diffs(diffs).await;
        }
        remote.finish().await?;
        Ok(())
    }
}

/// In-memory vnode store.
pub struct MockVnode {
    objects: Mutex<BTreeMap<BKey, ReplObject>>,
    preflists: Mutex<Vec<IndexN>>,
    owner_up: Mutex<bool>,
}

impl MockVnode {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            preflists: Mutex::new(vec![IndexN::new(0, 3)]),
            owner_up: Mutex::new(true),
        }
    }

    pub fn put(&self, object: ReplObject) {
        self.objects
            .lock()
            .unwrap()
            .insert(object.bkey.clone(), object);
    }

    pub fn set_preflists(&self, preflists: Vec<IndexN>) {
        *self.preflists.lock().unwrap() = preflists;
    }

    /// Make the partition's owner node unreachable.
    #[allow(dead_code)]
    pub fn set_owner_down(&self) {
        *self.owner_up.lock().unwrap() = false;
    }
}

impl Default for MockVnode {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VnodeService for MockVnode {
    async fn fold_objects(
        &self,
        _preflist: Preflist,
        tx: mpsc::Sender<(BKey, Vec<u8>)>,
    ) -> Result<(), String> {
        let objects: Vec<(BKey, Vec<u8>)> = self
            .objects
            .lock()
            .unwrap()
            .iter()
            .map(|(bkey, object)| (bkey.clone(), object.value.clone()))
            .collect();
        for (bkey, value) in objects {
            if tx.send((bkey, value)).await.is_err() {
                return Err("fold receiver went away".to_string());
            }
        }
        Ok(())
    }

    async fn get(&self, bkey: &BKey, _r: u32, _timeout: Duration) -> GetResult {
        match self.objects.lock().unwrap().get(bkey) {
            Some(object) => GetResult::Object(object.clone()),
            None => GetResult::NotFound,
        }
    }

    async fn get_vclocks(&self, _preflist: Preflist, bkeys: &[BKey]) -> Vec<(BKey, VClock)> {
        let objects = self.objects.lock().unwrap();
        bkeys
            .iter()
            .filter_map(|bkey| {
                objects
                    .get(bkey)
                    .map(|object| (bkey.clone(), object.vclock.clone()))
            })
            .collect()
    }

    async fn responsible_preflists(&self, _partition: u64) -> Vec<IndexN> {
        self.preflists.lock().unwrap().clone()
    }

    async fn index_owner(&self, _partition: u64) -> Option<NodeId> {
        Some("node-a".to_string())
    }

    async fn node_up(&self, _node: &NodeId) -> bool {
        *self.owner_up.lock().unwrap()
    }
}

/// Replication helper with configurable per-key outcomes.
pub struct ScriptedReplHelper {
    outcomes: Mutex<HashMap<BKey, HelperOutcome>>,
}

impl ScriptedReplHelper {
    #[allow(dead_code)]
    pub fn new() -> Self {
        Self {
            outcomes: Mutex::new(HashMap::new()),
        }
    }

    #[allow(dead_code)]
    pub fn set_outcome(&self, bkey: BKey, outcome: HelperOutcome) {
        self.outcomes.lock().unwrap().insert(bkey, outcome);
    }
}

impl Default for ScriptedReplHelper {
    fn default() -> Self {
        Self {
            outcomes: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ReplHelper for ScriptedReplHelper {
    async fn send(&self, object: &ReplObject) -> HelperOutcome {
        self.outcomes
            .lock()
            .unwrap()
            .get(&object.bkey)
            .cloned()
            .unwrap_or(HelperOutcome::Objects(Vec::new()))
    }
}
