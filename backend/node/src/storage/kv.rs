use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Persistent key-value backend the host provides. Writes are single-key and
/// atomic; values are terminal-state, so last-write-wins is acceptable.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
    fn iterate(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;
}

/// Heap-backed store for tests and embedding.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.lock().expect("store poisoned").get(key).cloned())
    }

    fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.inner.lock().expect("store poisoned").insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.inner.lock().expect("store poisoned").remove(key);
        Ok(())
    }

    fn iterate(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let inner = self.inner.lock().expect("store poisoned");
        Ok(
            inner
                .range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete_iterate() {
        let store = MemoryStore::new();
        store.put("sign_info/aa", vec![1]).unwrap();
        store.put("sign_info/bb", vec![2]).unwrap();
        store.put("pubkey_data/cc", vec![3]).unwrap();

        assert_eq!(store.get("sign_info/aa").unwrap(), Some(vec![1]));
        assert_eq!(store.get("missing").unwrap(), None);

        let signs = store.iterate("sign_info/").unwrap();
        assert_eq!(signs.len(), 2);

        store.delete("sign_info/aa").unwrap();
        assert_eq!(store.get("sign_info/aa").unwrap(), None);
    }

    #[test]
    fn overwrite_is_last_write_wins() {
        let store = MemoryStore::new();
        store.put("k", vec![1]).unwrap();
        store.put("k", vec![2]).unwrap();
        assert_eq!(store.get("k").unwrap(), Some(vec![2]));
    }
}
