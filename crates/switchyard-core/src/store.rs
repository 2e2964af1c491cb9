//! Key-value storage for session contexts and idempotency ledger entries.

use std::path::Path;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CoreResult;

const TREE_NAME: &str = "switchyard";

/// Storage collaborator. Values are opaque bytes (JSON in practice).
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> CoreResult<Option<Vec<u8>>>;

    fn put(&self, key: &str, value: &[u8]) -> CoreResult<()>;

    fn remove(&self, key: &str) -> CoreResult<()>;

    /// Atomically replaces `expected` with `new`. `None` means absent on either side.
    /// Returns `Ok(false)` when the current value did not match.
    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> CoreResult<bool>;
}

/// Sled-backed store; everything lives in one tree, namespaced by key prefix.
pub struct SledStore {
    db: sled::Db,
    tree: sled::Tree,
}

impl SledStore {
    pub fn open_path<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let db = sled::open(path)?;
        let tree = db.open_tree(TREE_NAME)?;
        Ok(Self { db, tree })
    }

    pub fn flush(&self) -> CoreResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl KvStore for SledStore {
    fn get(&self, key: &str) -> CoreResult<Option<Vec<u8>>> {
        Ok(self.tree.get(key.as_bytes())?.map(|v| v.to_vec()))
    }

    fn put(&self, key: &str, value: &[u8]) -> CoreResult<()> {
        self.tree.insert(key.as_bytes(), value)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> CoreResult<()> {
        self.tree.remove(key.as_bytes())?;
        Ok(())
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> CoreResult<bool> {
        Ok(self
            .tree
            .compare_and_swap(key.as_bytes(), expected, new)?
            .is_ok())
    }
}

/// In-process store for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryStore {
    map: DashMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> CoreResult<Option<Vec<u8>>> {
        Ok(self.map.get(key).map(|v| v.value().clone()))
    }

    fn put(&self, key: &str, value: &[u8]) -> CoreResult<()> {
        self.map.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> CoreResult<()> {
        self.map.remove(key);
        Ok(())
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> CoreResult<bool> {
        match self.map.entry(key.to_string()) {
            Entry::Occupied(mut current) => {
                if expected != Some(current.get().as_slice()) {
                    return Ok(false);
                }
                match new {
                    Some(v) => {
                        current.insert(v.to_vec());
                    }
                    None => {
                        current.remove();
                    }
                }
                Ok(true)
            }
            Entry::Vacant(slot) => {
                if expected.is_some() {
                    return Ok(false);
                }
                if let Some(v) = new {
                    slot.insert(v.to_vec());
                }
                Ok(true)
            }
        }
    }
}

pub(crate) fn get_json<T: DeserializeOwned>(
    store: &dyn KvStore,
    key: &str,
) -> CoreResult<Option<T>> {
    match store.get(key)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

pub(crate) fn put_json<T: Serialize>(store: &dyn KvStore, key: &str, value: &T) -> CoreResult<()> {
    let bytes = serde_json::to_vec(value)?;
    store.put(key, &bytes)
}
