//! Record encoding
//!
//! Persisted state is wincode-encoded. Each stored type opts in through
//! [`wincode_record!`], which keeps the concrete type visible to wincode.

use crate::storage::KvStore;
use anyhow::{Context, Result};

/// A value that can live in the store.
pub trait Record: Sized {
    fn encode(&self) -> Result<Vec<u8>>;
    fn decode(bytes: &[u8]) -> Result<Self>;
}

macro_rules! wincode_record {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl $crate::storage::Record for $ty {
                fn encode(&self) -> anyhow::Result<Vec<u8>> {
                    Ok(wincode::serialize(self)?)
                }

                fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
                    Ok(wincode::deserialize::<$ty>(bytes)?)
                }
            }
        )+
    };
}

pub(crate) use wincode_record;

/// Load and decode a record, `None` if the key is absent.
pub fn load<R: Record, S: KvStore + ?Sized>(store: &S, key: &[u8]) -> Result<Option<R>> {
    match store.get(key)? {
        Some(bytes) => R::decode(&bytes)
            .map(Some)
            .with_context(|| format!("corrupt record at {}", String::from_utf8_lossy(key))),
        None => Ok(None),
    }
}

/// Encode and store a record.
pub fn save<R: Record, S: KvStore + ?Sized>(store: &mut S, key: &[u8], record: &R) -> Result<()> {
    store.put(key, record.encode()?)
}
