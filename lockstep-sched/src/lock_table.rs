// The deterministic lock table. Every transaction requests all the locks
// it will ever need when it is admitted, in its position in the global
// order, and each lock is granted in request order (modulo read sharing).
// Equivalence to the global order falls out of two facts: requests are
// appended by a single thread in admission order, and grants never
// overtake a conflicting earlier request.
//
// The table has exactly one writer, the lock-manager thread, so there is
// no locking anywhere inside it. Requests name transactions by id; the
// blocked transaction itself is parked in the waiting set, owned here
// until its last lock is granted and it moves to the ready queue.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use lockstep_base::{AtomicQueue, Config, Key, TxnId};
use lockstep_net::Txn;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LockMode {
    Read,
    Write,
}

#[derive(Clone, Debug)]
struct LockRequest {
    mode: LockMode,
    txn: TxnId,
}

// Per-key record: the FIFO of outstanding requests, plus a conflict
// counter driving the contended/uncontended classification. The counter
// dies with the record when the queue empties.
struct KeyQueue {
    key: Key,
    requests: VecDeque<LockRequest>,
    failed: u64,
}

struct Blocked {
    txn: Box<Txn>,
    remaining: usize,
}

pub struct LockTable {
    config: Arc<Config>,
    // Buckets hold their key records in insertion order and are scanned
    // linearly: the scan order must be stable for determinism, so this is
    // a conflict chain, not an unordered set.
    buckets: Vec<VecDeque<KeyQueue>>,
    waiting: HashMap<TxnId, Blocked>,
    ready: Arc<AtomicQueue<Box<Txn>>>,
}

impl LockTable {
    pub fn new(config: Arc<Config>, ready: Arc<AtomicQueue<Box<Txn>>>) -> Self {
        let mut buckets = Vec::with_capacity(config.lock_table_size);
        buckets.resize_with(config.lock_table_size, VecDeque::new);
        LockTable {
            config,
            buckets,
            waiting: HashMap::new(),
            ready,
        }
    }

    fn bucket(&self, key: &Key) -> usize {
        (rapidhash::rapidhash(key.as_bytes()) % self.buckets.len() as u64) as usize
    }

    // Request every lock the transaction will ever need. Write intents
    // first, then read intents, so a key appearing in both sets needs no
    // upgrade: the later read request is a duplicate of this transaction's
    // own write and is skipped. Returns the number of locks not granted
    // immediately; zero means the transaction went straight to ready,
    // anything else means it is parked in the waiting set.
    pub fn lock(&mut self, mut txn: Box<Txn>) -> usize {
        let mut not_acquired = 0;
        let mut contended: Vec<Key> = Vec::new();
        let mut uncontended: Vec<Key> = Vec::new();
        let early_release = self.config.early_release;
        let max_failed = self.config.max_failed_lock;

        for i in 0..txn.read_write_set.len() {
            let key = &txn.read_write_set[i];
            if !self.config.is_local(key) {
                continue;
            }
            let b = self.bucket(key);
            let queue = locate_or_create(&mut self.buckets[b], key);
            // Only request if this txn hasn't already requested this key.
            if queue.requests.back().map(|r| r.txn) == Some(txn.id) {
                continue;
            }
            queue.requests.push_back(LockRequest {
                mode: LockMode::Write,
                txn: txn.id,
            });
            // A write request fails if there is any previous request.
            if queue.requests.len() > 1 {
                not_acquired += 1;
                queue.failed += 1;
            }
            if early_release {
                if queue.failed > max_failed {
                    contended.push(key.clone());
                } else {
                    uncontended.push(key.clone());
                }
            }
        }

        for i in 0..txn.read_set.len() {
            let key = &txn.read_set[i];
            if !self.config.is_local(key) {
                continue;
            }
            let b = self.bucket(key);
            let queue = locate_or_create(&mut self.buckets[b], key);
            if queue.requests.back().map(|r| r.txn) == Some(txn.id) {
                continue;
            }
            queue.requests.push_back(LockRequest {
                mode: LockMode::Read,
                txn: txn.id,
            });
            // A read request fails if any write request precedes it.
            if queue
                .requests
                .iter()
                .take(queue.requests.len() - 1)
                .any(|r| r.mode == LockMode::Write)
            {
                not_acquired += 1;
                queue.failed += 1;
            }
            if early_release {
                if queue.failed > max_failed {
                    contended.push(key.clone());
                } else {
                    uncontended.push(key.clone());
                }
            }
        }

        if early_release {
            txn.contended = contended;
            txn.uncontended = uncontended;
        }

        if not_acquired > 0 {
            self.waiting.insert(
                txn.id,
                Blocked {
                    txn,
                    remaining: not_acquired,
                },
            );
        } else if self.ready.push(txn).is_err() {
            panic!("ready queue overflow");
        }
        not_acquired
    }

    // Release one key held (or requested) by `txn` and grant whatever its
    // departure unblocks:
    //  (a) the released request held a write lock at the head of the
    //      queue: the successor write, or the run of successor reads, now
    //      holds the lock;
    //  (b) the released request held a read lock alone at the head and a
    //      write follows: that write now holds the lock;
    //  (c) the released request was a write not yet at the head, preceded
    //      only by reads and followed by reads: the follower reads join
    //      the readers ahead of it.
    // Returns how many transactions this release made ready.
    pub fn release_one(&mut self, key: &Key, txn: TxnId) -> usize {
        let b = self.bucket(key);
        let Some(pos) = self.buckets[b].iter().position(|q| &q.key == key) else {
            panic!("release of key {:?} with no lock queue", key);
        };
        let queue = &mut self.buckets[b][pos];

        let mut write_precedes_target = false;
        let mut target = None;
        for (i, req) in queue.requests.iter().enumerate() {
            if req.txn == txn {
                target = Some(i);
                break;
            }
            if req.mode == LockMode::Write {
                write_precedes_target = true;
            }
        }
        let Some(t) = target else {
            panic!("release of key {:?} not requested by txn {}", key, txn);
        };
        let target_mode = queue.requests[t].mode;

        let mut new_owners: Vec<TxnId> = Vec::new();
        if t + 1 < queue.requests.len() {
            let succ_mode = queue.requests[t + 1].mode;
            if t == 0
                && (target_mode == LockMode::Write
                    || (target_mode == LockMode::Read && succ_mode == LockMode::Write))
            {
                // (a) or (b): grant the one write, or the run of reads.
                if succ_mode == LockMode::Write {
                    new_owners.push(queue.requests[t + 1].txn);
                } else {
                    for req in queue.requests.iter().skip(t + 1) {
                        if req.mode != LockMode::Read {
                            break;
                        }
                        new_owners.push(req.txn);
                    }
                }
            } else if !write_precedes_target
                && target_mode == LockMode::Write
                && succ_mode == LockMode::Read
            {
                // (c): the reader convoy behind this write joins the
                // readers ahead of it.
                for req in queue.requests.iter().skip(t + 1) {
                    if req.mode != LockMode::Read {
                        break;
                    }
                    new_owners.push(req.txn);
                }
            }
        }

        queue.requests.remove(t);
        if queue.requests.is_empty() {
            self.buckets[b].remove(pos);
        }

        let mut woke = 0;
        for owner in new_owners {
            let Some(blocked) = self.waiting.get_mut(&owner) else {
                panic!("granted txn {} is not waiting", owner);
            };
            blocked.remaining -= 1;
            if blocked.remaining == 0 {
                let blocked = self.waiting.remove(&owner).unwrap_or_else(|| {
                    panic!("waiting txn {} vanished", owner);
                });
                if self.ready.push(blocked.txn).is_err() {
                    panic!("ready queue overflow");
                }
                woke += 1;
            }
        }
        woke
    }

    // Release every local lock the transaction acquired. Acquisition
    // skipped duplicate requests, within a set or across the two sets, so
    // each distinct key is released exactly once.
    pub fn release_all(&mut self, txn: &Txn) -> usize {
        let mut woke = 0;
        let mut seen = HashSet::new();
        for key in txn.read_write_set.iter() {
            if self.config.is_local(key) && seen.insert(key) {
                woke += self.release_one(key, txn.id);
            }
        }
        for key in txn.read_set.iter() {
            if self.config.is_local(key) && seen.insert(key) {
                woke += self.release_one(key, txn.id);
            }
        }
        woke
    }

    // Early-release paths: the classification computed at admission names
    // each acquired key exactly once, split across the two lists.
    pub fn release_keys(&mut self, keys: &[Key], txn: TxnId) -> usize {
        let mut woke = 0;
        for key in keys {
            if self.config.is_local(key) {
                woke += self.release_one(key, txn);
            }
        }
        woke
    }

    pub fn release_contended(&mut self, txn: &Txn) -> usize {
        self.release_keys(&txn.contended, txn.id)
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    // True when no key queue survives anywhere. Quadratic in nothing:
    // empty buckets are dropped eagerly, so this only walks residue.
    pub fn is_drained(&self) -> bool {
        self.waiting.is_empty() && self.buckets.iter().all(|b| b.is_empty())
    }
}

#[cfg(test)]
impl LockTable {
    // The request queue for one key, oldest first.
    pub(crate) fn requests_on(&self, key: &Key) -> Vec<(LockMode, TxnId)> {
        let b = self.bucket(key);
        match self.buckets[b].iter().find(|q| &q.key == key) {
            Some(q) => q.requests.iter().map(|r| (r.mode, r.txn)).collect(),
            None => Vec::new(),
        }
    }
}

fn locate_or_create<'a>(bucket: &'a mut VecDeque<KeyQueue>, key: &Key) -> &'a mut KeyQueue {
    // Linear scan in insertion order; create at the tail on miss.
    match bucket.iter().position(|q| &q.key == key) {
        Some(i) => &mut bucket[i],
        None => {
            bucket.push_back(KeyQueue {
                key: key.clone(),
                requests: VecDeque::new(),
                failed: 0,
            });
            bucket.back_mut().unwrap_or_else(|| unreachable!())
        }
    }
}
