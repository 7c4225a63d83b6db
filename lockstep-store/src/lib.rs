use dashmap::DashMap;

use lockstep_base::Key;

mod context;

pub use context::StorageContext;


pub type Value = Vec<u8>;

// The record store underneath the scheduler. Reads and writes are
// straight key/value operations; prefetch/unfetch bracket access to cold
// records so a paging implementation can stage them in and out. Workers
// read concurrently and application logic writes concurrently, so
// implementations must be safe to share.
pub trait Storage: Send + Sync {
    fn read(&self, key: &Key) -> Option<Value>;
    fn write(&self, key: &Key, value: Value);
    fn prefetch(&self, _key: &Key) {}
    fn unfetch(&self, _key: &Key) {}
}

// Memory-resident store. Cold-record staging is a no-op here; the hooks
// exist so the context code paths stay honest.
#[derive(Default)]
pub struct MemStore {
    records: DashMap<Key, Value>,
}

impl MemStore {
    pub fn new() -> Self {
        MemStore::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Storage for MemStore {
    fn read(&self, key: &Key) -> Option<Value> {
        self.records.get(key).map(|v| v.clone())
    }

    fn write(&self, key: &Key, value: Value) {
        self.records.insert(key.clone(), value);
    }
}
