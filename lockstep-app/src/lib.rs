use std::collections::HashSet;

use rand::Rng;

use lockstep_base::{Config, NodeId, Result, TxnId};
use lockstep_net::Txn;
use lockstep_store::{Storage, StorageContext, Value};


// The transaction logic the workers invoke. Implementations are trusted:
// execution happens at every replica from identical inputs, so a failure
// here cannot be skipped or retried without diverging the replicas, and
// the worker aborts the process instead.
pub trait Application: Send + Sync {
    fn execute(&self, ctx: &StorageContext) -> Result<()>;

    // Populate this node's share of the key space before any batch runs.
    fn initialize_storage(&self, _storage: &dyn Storage, _config: &Config) {}
}

pub fn encode_value(v: i64) -> Value {
    v.to_le_bytes().to_vec()
}

pub fn decode_value(buf: &[u8]) -> i64 {
    let mut bytes = [0_u8; 8];
    let n = buf.len().min(8);
    bytes[..n].copy_from_slice(&buf[..n]);
    i64::from_le_bytes(bytes)
}

// A microbenchmark over an integer key space: each transaction bumps
// every record in its read-write set by one. Keys split into a small hot
// range and a large cold one, so the contention profile is tunable
// without changing the transaction shape.
pub struct Microbench {
    pub nodes: i64,
    pub hot_records: u64,
    pub db_size: u64,
    pub rw_set_size: usize,
}

impl Microbench {
    pub fn new(config: &Config, hot_records: u64, rw_set_size: usize) -> Self {
        Microbench {
            nodes: config.nodes,
            hot_records,
            db_size: config.db_size,
            rw_set_size,
        }
    }

    // Pick `count` distinct keys owned by `part` within [start, limit).
    fn random_keys(
        &self,
        rng: &mut impl Rng,
        keys: &mut Vec<String>,
        count: usize,
        start: u64,
        limit: u64,
        part: i64,
    ) {
        let nodes = self.nodes as u64;
        // First key at or after `start` that lands on `part`.
        let base = start + (nodes + part as u64 - start % nodes) % nodes;
        let span = (limit.saturating_sub(base) / nodes).max(1);
        let mut picked = HashSet::new();
        while picked.len() < count {
            let id = base + rng.gen_range(0..span) * nodes;
            if picked.insert(id) {
                keys.push(id.to_string());
            }
        }
    }

    // Single-partition transaction: one hot record and the rest cold,
    // all owned by `part`.
    pub fn txn_sp(&self, id: TxnId, part: i64, rng: &mut impl Rng) -> Txn {
        let mut txn = Txn::new(id);
        self.random_keys(rng, &mut txn.read_write_set, 1, 0, self.hot_records, part);
        self.random_keys(
            rng,
            &mut txn.read_write_set,
            self.rw_set_size.saturating_sub(1),
            self.hot_records,
            self.db_size,
            part,
        );
        txn.readers = vec![NodeId(part)];
        txn.writers = vec![NodeId(part)];
        txn
    }

    // Multipartition transaction: the footprint splits evenly between two
    // nodes, both of which read and write.
    pub fn txn_mp(&self, id: TxnId, part1: i64, part2: i64, rng: &mut impl Rng) -> Txn {
        let mut txn = Txn::new(id);
        let half = self.rw_set_size / 2;
        for part in [part1, part2] {
            self.random_keys(rng, &mut txn.read_write_set, 1, 0, self.hot_records, part);
            self.random_keys(
                rng,
                &mut txn.read_write_set,
                half.saturating_sub(1),
                self.hot_records,
                self.db_size,
                part,
            );
        }
        txn.readers = vec![NodeId(part1), NodeId(part2)];
        txn.writers = vec![NodeId(part1), NodeId(part2)];
        txn
    }
}

impl Application for Microbench {
    fn execute(&self, ctx: &StorageContext) -> Result<()> {
        // Bump every record in the read-write footprint. Each participant
        // sees the full footprint but only its local writes stick.
        for key in ctx.txn().read_write_set.iter() {
            let current = ctx.read(key).map(|v| decode_value(v)).unwrap_or(0);
            ctx.write(key, encode_value(current.wrapping_add(1)));
        }
        Ok(())
    }

    fn initialize_storage(&self, storage: &dyn Storage, config: &Config) {
        for id in 0..self.db_size {
            let key = id.to_string();
            if config.is_local(&key) {
                storage.write(&key, encode_value(0));
            }
        }
    }
}
