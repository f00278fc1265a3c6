//! Key-ordered map files.
//!
//! The "Merkle btree" side of the helper: a map from packed bkey to
//! hash, built with batched inserts and persisted sorted. Inserts are
//! buffered by the caller and flushed in batches to amortize work; the
//! file itself is written once, in key order, on close. Reading
//! iterates records in key order.
//!
//! The on-disk record format is shared with
//! [`keyfile`](super::keyfile), so conversion to a keylist is a plain
//! ordered copy.

use super::keyfile::{KeyFileReader, KeyFileWriter, Record};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

/// A key-ordered map being built at a path.
pub struct MerkleStore {
    path: PathBuf,
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MerkleStore {
    /// Open a map for building. Any existing file at `path` is
    /// replaced on close.
    pub fn create(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            entries: BTreeMap::new(),
        }
    }

    /// Merge one flushed batch into the map. Later writes win.
    pub fn insert_batch(&mut self, batch: Vec<Record>) {
        for (packed, hash) in batch {
            self.entries.insert(packed, hash);
        }
    }

    /// Entries currently in the map.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Persist the map sorted and fsynced. Consumes the store; this is
    /// the close the helper monitors.
    pub fn close(self) -> io::Result<()> {
        let mut writer = KeyFileWriter::create(&self.path)?;
        for (packed, hash) in &self.entries {
            writer.write_record(&(packed.clone(), hash.clone()))?;
        }
        writer.sync()
    }
}

/// Iterate a persisted map's records in key order.
pub struct MerkleIter {
    reader: KeyFileReader,
}

impl MerkleIter {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            reader: KeyFileReader::open(path)?,
        })
    }

    pub fn next_entry(&mut self) -> io::Result<Option<Record>> {
        self.reader.next_record()
    }
}
