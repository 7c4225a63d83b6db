use std::sync::Arc;

use crate::scheduler::admission_open;
use crate::{LockMode, LockTable};
use lockstep_base::{AtomicQueue, Config, NodeId, TxnId};
use lockstep_net::Txn;
use test_log::test;


fn table_config() -> Arc<Config> {
    Arc::new(Config {
        node: NodeId(0),
        nodes: 1,
        // One bucket: every key shares a conflict chain, so the linear
        // scan and the per-key isolation both get exercised.
        lock_table_size: 1,
        ..Config::default()
    })
}

fn table() -> (LockTable, Arc<AtomicQueue<Box<Txn>>>) {
    let ready = Arc::new(AtomicQueue::new(64));
    (LockTable::new(table_config(), ready.clone()), ready)
}

fn rw(id: TxnId, keys: &[&str]) -> Box<Txn> {
    let mut txn = Txn::new(id);
    txn.read_write_set = keys.iter().map(|k| k.to_string()).collect();
    txn.readers = vec![NodeId(0)];
    txn.writers = vec![NodeId(0)];
    Box::new(txn)
}

fn r(id: TxnId, keys: &[&str]) -> Box<Txn> {
    let mut txn = Txn::new(id);
    txn.read_set = keys.iter().map(|k| k.to_string()).collect();
    txn.readers = vec![NodeId(0)];
    txn.writers = vec![NodeId(0)];
    Box::new(txn)
}

fn ready_ids(ready: &AtomicQueue<Box<Txn>>) -> Vec<TxnId> {
    let mut ids = Vec::new();
    while let Some(txn) = ready.pop() {
        ids.push(txn.id);
    }
    ids
}

#[test]
fn test_single_reader_passes_through() {
    let (mut table, ready) = table();
    assert_eq!(table.lock(r(1, &["5"])), 0);
    assert_eq!(ready_ids(&ready), vec![1]);
    let txn = r(1, &["5"]);
    table.release_all(&txn);
    assert!(table.is_drained());
}

#[test]
fn test_write_write_conflict() {
    let (mut table, ready) = table();
    assert_eq!(table.lock(rw(1, &["7"])), 0);
    assert_eq!(table.lock(rw(2, &["7"])), 1);
    assert_eq!(ready_ids(&ready), vec![1]);
    assert_eq!(table.waiting_len(), 1);

    let woke = table.release_all(&rw(1, &["7"]));
    assert_eq!(woke, 1);
    assert_eq!(ready_ids(&ready), vec![2]);
    assert_eq!(table.waiting_len(), 0);

    table.release_all(&rw(2, &["7"]));
    assert!(table.is_drained());
}

#[test]
fn test_reader_convoy_behind_writer() {
    let (mut table, ready) = table();
    assert_eq!(table.lock(rw(1, &["3"])), 0);
    assert_eq!(table.lock(r(2, &["3"])), 1);
    assert_eq!(table.lock(r(3, &["3"])), 1);
    assert_eq!(table.lock(rw(4, &["3"])), 1);
    assert_eq!(ready_ids(&ready), vec![1]);

    // Releasing the writer grants the whole run of readers at once, but
    // not the writer queued behind them.
    assert_eq!(table.release_all(&rw(1, &["3"])), 2);
    assert_eq!(ready_ids(&ready), vec![2, 3]);

    assert_eq!(table.release_all(&r(2, &["3"])), 0);
    assert_eq!(table.release_all(&r(3, &["3"])), 1);
    assert_eq!(ready_ids(&ready), vec![4]);

    table.release_all(&rw(4, &["3"]));
    assert!(table.is_drained());
}

// A key in both the read and read-write sets produces exactly one
// request, the write: write intents are queued first and the later read
// is a duplicate by the same transaction.
#[test]
fn test_read_write_overlap_is_single_write_request() {
    let (mut table, ready) = table();
    let mut txn = Txn::new(1);
    txn.read_set = vec!["9".to_string()];
    txn.read_write_set = vec!["9".to_string()];
    txn.readers = vec![NodeId(0)];
    txn.writers = vec![NodeId(0)];
    let released = txn.clone();

    assert_eq!(table.lock(Box::new(txn)), 0);
    assert_eq!(
        table.requests_on(&"9".to_string()),
        vec![(LockMode::Write, 1)]
    );
    assert_eq!(ready_ids(&ready), vec![1]);

    // And the overlapping key is released exactly once.
    table.release_all(&released);
    assert!(table.is_drained());
}

// A key repeated inside one set acquires a single request, and the
// completion path releases it exactly once.
#[test]
fn test_duplicate_key_within_set_released_once() {
    let (mut table, ready) = table();
    let mut txn = Txn::new(1);
    txn.read_write_set = vec!["7".to_string(), "7".to_string()];
    txn.read_set = vec!["8".to_string(), "8".to_string(), "7".to_string()];
    txn.readers = vec![NodeId(0)];
    txn.writers = vec![NodeId(0)];
    let released = txn.clone();

    assert_eq!(table.lock(Box::new(txn)), 0);
    assert_eq!(
        table.requests_on(&"7".to_string()),
        vec![(LockMode::Write, 1)]
    );
    assert_eq!(
        table.requests_on(&"8".to_string()),
        vec![(LockMode::Read, 1)]
    );
    assert_eq!(ready_ids(&ready), vec![1]);

    table.release_all(&released);
    assert!(table.is_drained());
}

// Removing a writer that never reached the head of the queue lets the
// readers queued behind it join the readers ahead of it. No path in the
// scheduler releases an ungranted request today, but the rule keeps the
// queue consistent for any caller that does.
#[test]
fn test_release_of_waiting_writer_grants_follower_reads() {
    let (mut table, ready) = table();
    assert_eq!(table.lock(r(1, &["4"])), 0);
    assert_eq!(table.lock(rw(2, &["4"])), 1);
    assert_eq!(table.lock(r(3, &["4"])), 1);
    assert_eq!(ready_ids(&ready), vec![1]);

    assert_eq!(table.release_one(&"4".to_string(), 2), 1);
    assert_eq!(ready_ids(&ready), vec![3]);
    // Txn 2 is gone from the queue; 1 and 3 share the read lock.
    assert_eq!(
        table.requests_on(&"4".to_string()),
        vec![(LockMode::Read, 1), (LockMode::Read, 3)]
    );
}

#[test]
fn test_distinct_keys_do_not_conflict_in_shared_bucket() {
    let (mut table, ready) = table();
    assert_eq!(table.lock(rw(1, &["10"])), 0);
    assert_eq!(table.lock(rw(2, &["11"])), 0);
    assert_eq!(table.lock(rw(3, &["12"])), 0);
    assert_eq!(ready_ids(&ready), vec![1, 2, 3]);
}

#[test]
fn test_contention_classification() {
    let max_failed = 3_u64;
    let ready = Arc::new(AtomicQueue::new(64));
    let config = Arc::new(Config {
        node: NodeId(0),
        nodes: 1,
        lock_table_size: 1,
        early_release: true,
        max_failed_lock: max_failed,
        ..Config::default()
    });
    let mut table = LockTable::new(config, ready.clone());

    // Conflict number k leaves the key's failure count at k, so the
    // first max_failed + 1 requesters still see an uncontended key and
    // every later one sees a contended one.
    let total = max_failed + 2;
    for id in 1..=total as i64 {
        table.lock(rw(id, &["42"]));
    }
    let first = ready.pop().expect("head of the queue runs");
    assert_eq!(first.uncontended, vec!["42".to_string()]);
    assert!(first.contended.is_empty());

    for id in 1..=total as i64 {
        let released = rw(id, &["42"]);
        table.release_one(&"42".to_string(), released.id);
        if let Some(next) = ready.pop() {
            if next.id <= (max_failed + 1) as i64 {
                assert_eq!(next.uncontended, vec!["42".to_string()], "txn {}", next.id);
            } else {
                assert_eq!(next.contended, vec!["42".to_string()], "txn {}", next.id);
            }
        }
    }
    assert!(table.is_drained());
}

// The classification covers each acquired key exactly once, even when
// the footprint repeats a key across sets.
#[test]
fn test_classification_covers_footprint_once() {
    let ready = Arc::new(AtomicQueue::new(64));
    let config = Arc::new(Config {
        node: NodeId(0),
        nodes: 1,
        lock_table_size: 1,
        early_release: true,
        ..Config::default()
    });
    let mut table = LockTable::new(config, ready.clone());

    let mut txn = Txn::new(1);
    txn.read_set = vec!["9".to_string(), "8".to_string()];
    txn.read_write_set = vec!["9".to_string(), "7".to_string()];
    txn.readers = vec![NodeId(0)];
    txn.writers = vec![NodeId(0)];
    table.lock(Box::new(txn));

    let granted = ready.pop().expect("no conflicts");
    let mut tagged: Vec<_> = granted
        .contended
        .iter()
        .chain(granted.uncontended.iter())
        .cloned()
        .collect();
    tagged.sort();
    let expected: Vec<String> = ["7", "8", "9"].iter().map(|k| k.to_string()).collect();
    assert_eq!(tagged, expected);
}

// Two identical request/release scripts produce identical grant orders.
#[test]
fn test_grant_order_is_deterministic() {
    let script = |seed: &mut Vec<TxnId>| {
        let (mut table, ready) = table();
        table.lock(rw(1, &["1", "2"]));
        table.lock(r(2, &["2", "3"]));
        table.lock(rw(3, &["3"]));
        table.lock(rw(4, &["1", "3"]));
        seed.extend(ready_ids(&ready));
        // Complete each transaction as it becomes ready.
        for txn in [rw(1, &["1", "2"]), r(2, &["2", "3"]), rw(3, &["3"]), rw(4, &["1", "3"])] {
            table.release_all(&txn);
            seed.extend(ready_ids(&ready));
        }
        assert!(table.is_drained());
    };
    let mut first = Vec::new();
    let mut second = Vec::new();
    script(&mut first);
    script(&mut second);
    assert_eq!(first, second);
    // Every admitted transaction became ready exactly once.
    let mut sorted = first.clone();
    sorted.sort();
    assert_eq!(sorted, vec![1, 2, 3, 4]);
}

#[test]
fn test_remote_keys_are_ignored() {
    let ready = Arc::new(AtomicQueue::new(64));
    let config = Arc::new(Config {
        node: NodeId(0),
        nodes: 2,
        lock_table_size: 1,
        ..Config::default()
    });
    let mut table = LockTable::new(config, ready.clone());

    // Key 5 is owned by node 1: no local request, no local conflict.
    let mut txn = Txn::new(1);
    txn.read_write_set = vec!["5".to_string(), "4".to_string()];
    txn.readers = vec![NodeId(0), NodeId(1)];
    txn.writers = vec![NodeId(0), NodeId(1)];
    let released = txn.clone();
    assert_eq!(table.lock(Box::new(txn)), 0);
    assert!(table.requests_on(&"5".to_string()).is_empty());
    assert_eq!(table.requests_on(&"4".to_string()).len(), 1);

    table.release_all(&released);
    assert!(table.is_drained());
}

#[test]
fn test_admission_window() {
    // Closed while anything admitted is blocked, or the pool is full.
    assert!(admission_open(0, 0, 2));
    assert!(admission_open(1, 1, 2));
    assert!(!admission_open(2, 2, 2));
    assert!(!admission_open(1, 2, 2));
    // Reopens when a completion retires ahead of a new admission.
    assert!(admission_open(1, 1, 2));
}
