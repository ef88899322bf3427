use anyhow::Result;

use crate::storage::Record;

/// One mutation inside a [`KvStore::write_batch`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

impl WriteOp {
    /// Store the encoded record, or delete the key when there is none.
    pub fn upsert<R: Record>(key: &[u8], record: Option<&R>) -> Result<Self> {
        Ok(match record {
            Some(record) => WriteOp::Put(key.to_vec(), record.encode()?),
            None => WriteOp::Delete(key.to_vec()),
        })
    }
}

/// Decoupling the state machine from the database.
///
/// Keys are raw bytes; each component namespaces its keys with a prefix (see
/// [`crate::keys`]). Execution is single-threaded per block, so writes take
/// `&mut self` and no locking happens above this trait.
pub trait KvStore {
    /// Read a value. Missing keys are `Ok(None)`.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Insert or overwrite a value.
    fn put(&mut self, key: &[u8], value: Vec<u8>) -> Result<()>;

    /// Delete a key. Deleting a missing key is not an error.
    fn delete(&mut self, key: &[u8]) -> Result<()>;

    /// Apply every op or none of them.
    fn write_batch(&mut self, ops: Vec<WriteOp>) -> Result<()>;

    /// All entries whose key starts with `prefix`, in ascending key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
}
