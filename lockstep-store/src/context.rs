use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::trace;

use crate::{Storage, Value};
use lockstep_base::{Config, Key, Result};
use lockstep_net::{Body, Connection, Msg, Txn};

// The storage-access context for one executing transaction. Built by the
// worker that picked the transaction up, owned by that worker alone, and
// dropped on completion.
//
// Construction performs the read phase of the execution protocol: every
// locally-owned key in the read footprint is fetched (cold records are
// prefetched first), and if the transaction spans nodes, each local value
// is immediately forwarded to every other writer, addressed to the
// transaction's channel. Writers then wait until one value has arrived
// for every key in the footprint before executing; nodes that only serve
// reads have nothing to wait for.
pub struct StorageContext {
    config: Arc<Config>,
    conn: Connection,
    storage: Arc<dyn Storage>,
    txn: Box<Txn>,
    objects: HashMap<Key, Value>,
    expected_keys: usize,
}

impl StorageContext {
    pub fn new(
        config: Arc<Config>,
        conn: Connection,
        storage: Arc<dyn Storage>,
        txn: Box<Txn>,
    ) -> Result<StorageContext> {
        let mut ctx = StorageContext {
            config,
            conn,
            storage,
            txn,
            objects: HashMap::new(),
            expected_keys: 0,
        };

        let node = ctx.conn.node();
        if ctx.txn.is_reader(node) {
            // Execute local reads.
            for i in 0..ctx.txn.read_set.len() {
                let key = ctx.txn.read_set[i].clone();
                ctx.fetch_local(&key);
            }
            for i in 0..ctx.txn.read_write_set.len() {
                let key = ctx.txn.read_write_set[i].clone();
                ctx.fetch_local(&key);
            }
            // Forward them to every other writer.
            if ctx.txn.multipartition() {
                ctx.forward_local_reads()?;
            }
        }

        // Only writers execute the transaction body, so only writers wait
        // for the full footprint to be populated.
        if ctx.txn.is_writer(node) {
            let mut distinct = HashSet::new();
            for key in ctx.txn.read_set.iter().chain(ctx.txn.read_write_set.iter()) {
                distinct.insert(key);
            }
            ctx.expected_keys = distinct.len();
        }

        Ok(ctx)
    }

    fn fetch_local(&mut self, key: &Key) {
        if !self.config.is_local(key) || self.objects.contains_key(key) {
            return;
        }
        if self.config.is_cold(key) {
            self.storage.prefetch(key);
        }
        if let Some(value) = self.storage.read(key) {
            self.objects.insert(key.clone(), value);
        } else {
            // Absent records still count as observed: the value is the
            // empty record, same as the peers will see.
            self.objects.insert(key.clone(), Value::new());
        }
    }

    fn forward_local_reads(&self) -> Result<()> {
        let node = self.conn.node();
        for writer in self.txn.writers.iter() {
            if *writer == node {
                continue;
            }
            for (key, value) in self.objects.iter() {
                self.conn.send(Msg {
                    from: node,
                    to: *writer,
                    channel: self.txn.channel(),
                    body: Body::ReadResult {
                        key: key.clone(),
                        value: value.clone(),
                    },
                })?;
            }
        }
        Ok(())
    }

    pub fn txn(&self) -> &Txn {
        &self.txn
    }

    // All expected reads, local and remote, are in hand.
    pub fn ready_to_execute(&self) -> bool {
        self.objects.len() >= self.expected_keys
    }

    // Install one remote read. Duplicate deliveries are idempotent.
    pub fn handle_read_result(&mut self, msg: Msg) {
        let Body::ReadResult { key, value } = msg.body else {
            trace!(target: "lockstep", "non-read message on txn channel");
            return;
        };
        self.objects.entry(key).or_insert(value);
    }

    pub fn read(&self, key: &Key) -> Option<&Value> {
        self.objects.get(key)
    }

    // Writes go straight to storage. Each participant applies only the
    // part of the write footprint it owns.
    pub fn write(&self, key: &Key, value: Value) {
        if self.config.is_local(key) {
            self.storage.write(key, value);
        }
    }

    // Tear down after execution: release cold records and hand the
    // transaction back for lock release.
    pub fn finish(self) -> Box<Txn> {
        for key in self
            .txn
            .read_set
            .iter()
            .chain(self.txn.read_write_set.iter())
            .chain(self.txn.write_set.iter())
        {
            if self.config.is_local(key) && self.config.is_cold(key) {
                self.storage.unfetch(key);
            }
        }
        self.txn
    }
}
