use std::sync::Arc;

use crate::{post_batch, Node};
use lockstep_app::{decode_value, Microbench};
use lockstep_base::{Config, NodeId};
use lockstep_net::{Network, Txn};
use lockstep_store::Storage;
use test_log::test;

fn config(node: i64) -> Config {
    Config {
        node: NodeId(node),
        nodes: 2,
        workers: 2,
        lock_table_size: 16,
        db_size: 100,
        cold_cutoff: 90,
        ..Config::default()
    }
}

fn bench() -> Arc<Microbench> {
    Arc::new(Microbench {
        nodes: 2,
        hot_records: 10,
        db_size: 100,
        rw_set_size: 2,
    })
}

fn mp(id: i64, keys: &[&str]) -> Txn {
    let mut txn = Txn::new(id);
    txn.read_write_set = keys.iter().map(|k| k.to_string()).collect();
    txn.readers = vec![NodeId(0), NodeId(1)];
    txn.writers = vec![NodeId(0), NodeId(1)];
    txn
}

fn sp(id: i64, node: i64, keys: &[&str]) -> Txn {
    let mut txn = Txn::new(id);
    txn.read_write_set = keys.iter().map(|k| k.to_string()).collect();
    txn.readers = vec![NodeId(node)];
    txn.writers = vec![NodeId(node)];
    txn
}

fn stored(storage: &dyn Storage, key: &str) -> i64 {
    storage
        .read(&key.to_string())
        .map(|v| decode_value(&v))
        .unwrap_or(-1)
}

// A chain of transactions spanning both nodes: every one needs a remote
// read from its peer, and the writes conflict on both sides, so the whole
// exchange and release pipeline is on the critical path.
#[test]
fn test_two_node_remote_read_exchange() {
    let network = Network::new();
    let app = bench();
    let node0 = Node::start(config(0), app.clone(), &network).unwrap();
    let node1 = Node::start(config(1), app.clone(), &network).unwrap();

    // Key 2 lives on node 0, key 3 on node 1.
    let txns: Vec<Txn> = (1..=4).map(|id| mp(id, &["2", "3"])).collect();
    post_batch(&network, 2, 0, &txns).unwrap();

    let storage0 = node0.shutdown(1).unwrap();
    let storage1 = node1.shutdown(1).unwrap();
    assert_eq!(stored(storage0.as_ref(), "2"), 4);
    assert_eq!(stored(storage1.as_ref(), "3"), 4);
    // Each node only ever stores its own partition.
    assert_eq!(stored(storage0.as_ref(), "3"), -1);
    assert_eq!(stored(storage1.as_ref(), "2"), -1);
}

// Single-partition transactions pass through a node that is not a
// participant without touching its storage.
#[test]
fn test_non_participant_skips_transaction() {
    let network = Network::new();
    let app = bench();
    let node0 = Node::start(config(0), app.clone(), &network).unwrap();
    let node1 = Node::start(config(1), app.clone(), &network).unwrap();

    post_batch(
        &network,
        2,
        0,
        &[sp(1, 0, &["4"]), sp(2, 1, &["5"]), mp(3, &["4", "5"])],
    )
    .unwrap();

    let storage0 = node0.shutdown(1).unwrap();
    let storage1 = node1.shutdown(1).unwrap();
    // Node 0 owns key 4: bumped by txn 1 and txn 3.
    assert_eq!(stored(storage0.as_ref(), "4"), 2);
    assert_eq!(stored(storage1.as_ref(), "5"), 2);
    // The microbenchmark seeded both partitions disjointly.
    assert_eq!(stored(storage0.as_ref(), "5"), -1);
    assert_eq!(stored(storage1.as_ref(), "4"), -1);
}

#[test]
fn test_multi_batch_stream_across_nodes() {
    let network = Network::new();
    let app = bench();
    let node0 = Node::start(config(0), app.clone(), &network).unwrap();
    let node1 = Node::start(config(1), app.clone(), &network).unwrap();

    // Three batches, posted out of order, mixing local and spanning
    // transactions on the same hot keys.
    let b0 = vec![mp(1, &["2", "3"]), sp(2, 0, &["2"])];
    let b1 = vec![sp(3, 1, &["3"]), mp(4, &["2", "3"])];
    let b2 = vec![sp(5, 0, &["2"]), sp(6, 1, &["3"])];
    post_batch(&network, 2, 2, &b2).unwrap();
    post_batch(&network, 2, 0, &b0).unwrap();
    post_batch(&network, 2, 1, &b1).unwrap();

    let storage0 = node0.shutdown(3).unwrap();
    let storage1 = node1.shutdown(3).unwrap();
    assert_eq!(stored(storage0.as_ref(), "2"), 4);
    assert_eq!(stored(storage1.as_ref(), "3"), 4);
}
