//! Metadata persistence.
//!
//! A deliberately narrow key-value interface: the daemon persists job
//! records as JSON under `job/<jid>` so a restarted daemon can relearn
//! its jobs. The in-memory implementation backs tests and ephemeral
//! deployments.

use dashmap::DashMap;

use crate::error::CradleResult;

/// Narrow persistence seam. Implementations must tolerate concurrent use.
pub trait Store: Send + Sync {
    fn get(&self, key: &str) -> CradleResult<Option<Vec<u8>>>;
    fn put(&self, key: &str, value: Vec<u8>) -> CradleResult<()>;
    fn delete(&self, key: &str) -> CradleResult<()>;
    /// Keys beginning with `prefix`, in unspecified order.
    fn list(&self, prefix: &str) -> CradleResult<Vec<String>>;
}

/// Volatile store; contents die with the process.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &str) -> CradleResult<Option<Vec<u8>>> {
        Ok(self.entries.get(key).map(|v| v.clone()))
    }

    fn put(&self, key: &str, value: Vec<u8>) -> CradleResult<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> CradleResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> CradleResult<Vec<String>> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_delete() {
        let store = MemoryStore::new();
        store.put("job/a", b"one".to_vec()).unwrap();
        assert_eq!(store.get("job/a").unwrap(), Some(b"one".to_vec()));

        store.delete("job/a").unwrap();
        assert_eq!(store.get("job/a").unwrap(), None);
    }

    #[test]
    fn test_list_by_prefix() {
        let store = MemoryStore::new();
        store.put("job/a", Vec::new()).unwrap();
        store.put("job/b", Vec::new()).unwrap();
        store.put("other/c", Vec::new()).unwrap();

        let mut keys = store.list("job/").unwrap();
        keys.sort();
        assert_eq!(keys, vec!["job/a", "job/b"]);
    }

    #[test]
    fn test_overwrite_replaces() {
        let store = MemoryStore::new();
        store.put("k", b"v1".to_vec()).unwrap();
        store.put("k", b"v2".to_vec()).unwrap();
        assert_eq!(store.get("k").unwrap(), Some(b"v2".to_vec()));
    }
}
