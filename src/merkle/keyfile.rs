//! Length-prefixed key/hash record streams.
//!
//! A keyfile is a sequence of records, each a 4-byte big-endian length
//! followed by a bincode-encoded `(packed_bkey, hash)` pair. Files are
//! produced in fold order and sorted by packed bkey before use; the
//! diff walk assumes sorted input.

use bytes::{Buf, BufMut};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

/// One `(packed bkey, hash)` record.
pub type Record = (Vec<u8>, Vec<u8>);

/// Writes length-prefixed records to a keyfile.
pub struct KeyFileWriter {
    out: BufWriter<File>,
    written: u64,
}

impl KeyFileWriter {
    /// Create (truncating) a keyfile at `path`.
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            out: BufWriter::new(file),
            written: 0,
        })
    }

    pub fn write_record(&mut self, record: &Record) -> io::Result<()> {
        let body = bincode::serialize(record)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut prefix = [0u8; 4];
        (&mut prefix[..]).put_u32(body.len() as u32);
        self.out.write_all(&prefix)?;
        self.out.write_all(&body)?;
        self.written += 1;
        Ok(())
    }

    /// Records written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flush and fsync the file.
    pub fn sync(mut self) -> io::Result<()> {
        self.out.flush()?;
        self.out.get_ref().sync_all()
    }
}

/// Reads length-prefixed records back from a keyfile.
pub struct KeyFileReader {
    input: BufReader<File>,
    read: u64,
}

impl KeyFileReader {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            input: BufReader::new(File::open(path)?),
            read: 0,
        })
    }

    /// Next record, `Ok(None)` at a clean end of file.
    pub fn next_record(&mut self) -> io::Result<Option<Record>> {
        let mut prefix = [0u8; 4];
        match self.input.read_exact(&mut prefix) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        let len = (&prefix[..]).get_u32() as usize;
        let mut body = vec![0u8; len];
        self.input.read_exact(&mut body)?;
        let record = bincode::deserialize(&body)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.read += 1;
        Ok(Some(record))
    }

    /// Records read so far.
    pub fn read_count(&self) -> u64 {
        self.read
    }
}

/// Sort a keyfile in place by packed bkey.
///
/// Reads every record, sorts, rewrites, fsyncs.
pub fn sort_keyfile(path: &Path) -> io::Result<()> {
    let mut reader = KeyFileReader::open(path)?;
    let mut records = Vec::new();
    while let Some(record) = reader.next_record()? {
        records.push(record);
    }
    records.sort_by(|a, b| a.0.cmp(&b.0));

    let mut writer = KeyFileWriter::create(path)?;
    for record in &records {
        writer.write_record(record)?;
    }
    writer.sync()
}

/// Verify a keyfile is sorted by packed bkey.
///
/// Returns the first out-of-order position as the error payload.
pub fn check_sorted(path: &Path) -> io::Result<std::result::Result<(), u64>> {
    let mut reader = KeyFileReader::open(path)?;
    let mut previous: Option<Vec<u8>> = None;
    while let Some((packed, _hash)) = reader.next_record()? {
        if let Some(prev) = &previous {
            if packed < *prev {
                return Ok(Err(reader.read_count()));
            }
        }
        previous = Some(packed);
    }
    Ok(Ok(()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(key: &str, hash: &str) -> Record {
        (key.as_bytes().to_vec(), hash.as_bytes().to_vec())
    }

    #[test]
    fn test_write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys");

        let mut writer = KeyFileWriter::create(&path).unwrap();
        writer.write_record(&record("k1", "h1")).unwrap();
        writer.write_record(&record("k2", "h2")).unwrap();
        assert_eq!(writer.written(), 2);
        writer.sync().unwrap();

        let mut reader = KeyFileReader::open(&path).unwrap();
        assert_eq!(reader.next_record().unwrap(), Some(record("k1", "h1")));
        assert_eq!(reader.next_record().unwrap(), Some(record("k2", "h2")));
        assert_eq!(reader.next_record().unwrap(), None);
        assert_eq!(reader.read_count(), 2);
    }

    #[test]
    fn test_empty_file_reads_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty");
        KeyFileWriter::create(&path).unwrap().sync().unwrap();

        let mut reader = KeyFileReader::open(&path).unwrap();
        assert_eq!(reader.next_record().unwrap(), None);
    }

    #[test]
    fn test_sort_then_check() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("unsorted");

        let mut writer = KeyFileWriter::create(&path).unwrap();
        writer.write_record(&record("zz", "h3")).unwrap();
        writer.write_record(&record("aa", "h1")).unwrap();
        writer.write_record(&record("mm", "h2")).unwrap();
        writer.sync().unwrap();

        assert!(check_sorted(&path).unwrap().is_err());
        sort_keyfile(&path).unwrap();
        assert!(check_sorted(&path).unwrap().is_ok());

        let mut reader = KeyFileReader::open(&path).unwrap();
        assert_eq!(reader.next_record().unwrap().unwrap().0, b"aa".to_vec());
        assert_eq!(reader.next_record().unwrap().unwrap().0, b"mm".to_vec());
        assert_eq!(reader.next_record().unwrap().unwrap().0, b"zz".to_vec());
    }

    #[test]
    fn test_truncated_record_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("truncated");

        let mut writer = KeyFileWriter::create(&path).unwrap();
        writer.write_record(&record("k1", "h1")).unwrap();
        writer.sync().unwrap();

        // Chop the last byte off the record body.
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 1]).unwrap();

        let mut reader = KeyFileReader::open(&path).unwrap();
        assert!(reader.next_record().is_err());
    }
}
