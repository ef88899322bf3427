use crate::storage::{KvStore, WriteOp};
use anyhow::{Context, Result};
use rocksdb::{ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options, WriteBatch};
use std::path::Path;
use std::sync::Arc;

const CF_KEYSHARE: &str = "keyshare";

/// A thread-safe wrapper around RocksDB.
#[derive(Clone)]
pub struct RocksDbStore {
    db: Arc<DB>,
}

impl RocksDbStore {
    /// Opens the database at the specified path, creating it if missing.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let families = vec![ColumnFamilyDescriptor::new(
            CF_KEYSHARE,
            Options::default(),
        )];

        let db = DB::open_cf_descriptors(&opts, path, families)
            .map_err(|e| anyhow::anyhow!("Failed to open RocksDB: {}", e))?;

        Ok(Self { db: Arc::new(db) })
    }
}

impl KvStore for RocksDbStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self
            .db
            .cf_handle(CF_KEYSHARE)
            .context("keyshare CF missing")?;

        Ok(self.db.get_cf(cf, key)?)
    }

    fn put(&mut self, key: &[u8], value: Vec<u8>) -> Result<()> {
        let cf = self
            .db
            .cf_handle(CF_KEYSHARE)
            .context("keyshare CF missing")?;

        self.db.put_cf(cf, key, value)?;
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        let cf = self
            .db
            .cf_handle(CF_KEYSHARE)
            .context("keyshare CF missing")?;

        self.db.delete_cf(cf, key)?;
        Ok(())
    }

    fn write_batch(&mut self, ops: Vec<WriteOp>) -> Result<()> {
        let cf = self
            .db
            .cf_handle(CF_KEYSHARE)
            .context("keyshare CF missing")?;

        let mut batch = WriteBatch::default();
        for op in ops {
            match op {
                WriteOp::Put(key, value) => batch.put_cf(cf, key, value),
                WriteOp::Delete(key) => batch.delete_cf(cf, key),
            }
        }
        self.db.write(batch)?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self
            .db
            .cf_handle(CF_KEYSHARE)
            .context("keyshare CF missing")?;

        let mut entries = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));

        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            entries.push((key.to_vec(), value.to_vec()));
        }

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Create a temporary DB for each test
    fn temp_db() -> (TempDir, RocksDbStore) {
        let dir = TempDir::new().unwrap();
        let db = RocksDbStore::open(dir.path()).unwrap();
        (dir, db)
    }

    #[test]
    fn put_get_delete() {
        let (_dir, mut db) = temp_db();

        db.put(b"active-epoch", vec![1, 2, 3]).unwrap();
        assert_eq!(db.get(b"active-epoch").unwrap(), Some(vec![1, 2, 3]));

        db.delete(b"active-epoch").unwrap();
        assert_eq!(db.get(b"active-epoch").unwrap(), None);
    }

    #[test]
    fn scan_prefix_stops_at_boundary() {
        let (_dir, mut db) = temp_db();

        db.put(b"encrypted-tx/\x00\x01", vec![1]).unwrap();
        db.put(b"encrypted-tx/\x00\x02", vec![2]).unwrap();
        db.put(b"keyshare-agg/h", vec![3]).unwrap();

        let found = db.scan_prefix(b"encrypted-tx/").unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].1, vec![1]);
        assert_eq!(found[1].1, vec![2]);
    }

    #[test]
    fn write_batch_applies_puts_and_deletes() {
        let (_dir, mut db) = temp_db();
        db.put(b"queued-epoch", vec![1]).unwrap();

        db.write_batch(vec![
            WriteOp::Put(b"active-epoch".to_vec(), vec![2]),
            WriteOp::Delete(b"queued-epoch".to_vec()),
        ])
        .unwrap();

        assert_eq!(db.get(b"active-epoch").unwrap(), Some(vec![2]));
        assert_eq!(db.get(b"queued-epoch").unwrap(), None);
    }

    #[test]
    fn reopen_keeps_data() {
        let dir = TempDir::new().unwrap();
        {
            let mut db = RocksDbStore::open(dir.path()).unwrap();
            db.put(b"bound-channel", b"channel-0".to_vec()).unwrap();
        }
        let db = RocksDbStore::open(dir.path()).unwrap();
        assert_eq!(db.get(b"bound-channel").unwrap(), Some(b"channel-0".to_vec()));
    }
}
