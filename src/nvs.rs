//! Persistent key/value store interface (spec §6 "NVS") and an in-memory
//! implementation used by tests and hosts without real flash.
//!
//! The teacher has no persistence layer of its own (it is a pure network
//! relay); this is modeled directly from the spec's four-operation
//! interface rather than adapted from teacher code.

use parking_lot::Mutex;
use std::collections::HashMap;

/// Tiny persistent store the core consumes (spec §6). Namespaces in use:
/// `device_id`, `dial_slots`.
pub trait Nvs: Send + Sync {
    fn get(&self, namespace: &str, key: &str) -> Option<Vec<u8>>;
    fn put(&self, namespace: &str, key: &str, bytes: &[u8]);
    fn erase(&self, namespace: &str, key: &str);
    /// Flush pending writes. A no-op for an in-memory store; real flash
    /// backends use this to batch a page write.
    fn commit(&self);
}

/// `Nvs` backed by a plain in-process map. Used by hosts without flash and
/// by every test that exercises persistence.
#[derive(Default)]
pub struct InMemoryNvs {
    data: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl InMemoryNvs {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Nvs for InMemoryNvs {
    fn get(&self, namespace: &str, key: &str) -> Option<Vec<u8>> {
        self.data.lock().get(&(namespace.to_string(), key.to_string())).cloned()
    }

    fn put(&self, namespace: &str, key: &str, bytes: &[u8]) {
        self.data
            .lock()
            .insert((namespace.to_string(), key.to_string()), bytes.to_vec());
    }

    fn erase(&self, namespace: &str, key: &str) {
        self.data.lock().remove(&(namespace.to_string(), key.to_string()));
    }

    fn commit(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn put_then_get_round_trips() {
        let nvs = InMemoryNvs::new();
        nvs.put("device_id", "raw", b"hello");
        assert_eq!(nvs.get("device_id", "raw"), Some(b"hello".to_vec()));
    }

    #[test]
    fn missing_key_is_none() {
        let nvs = InMemoryNvs::new();
        assert_eq!(nvs.get("device_id", "raw"), None);
    }

    #[test]
    fn erase_removes_the_key() {
        let nvs = InMemoryNvs::new();
        nvs.put("dial_slots", "3", b"data");
        nvs.erase("dial_slots", "3");
        assert_eq!(nvs.get("dial_slots", "3"), None);
    }

    #[test]
    fn namespaces_do_not_collide() {
        let nvs = InMemoryNvs::new();
        nvs.put("device_id", "k", b"a");
        nvs.put("dial_slots", "k", b"b");
        assert_eq!(nvs.get("device_id", "k"), Some(b"a".to_vec()));
        assert_eq!(nvs.get("dial_slots", "k"), Some(b"b".to_vec()));
    }
}
