use serde::{Deserialize, Serialize};
use tracing::warn;

// A database record is named by a string key. The benchmark keyspace uses
// decimal integer keys, which also drive partitioning and the cold-record
// cutoff; arbitrary keys are allowed and partition by hash instead.
pub type Key = String;

// Transaction ids are assigned by the sequencer: globally unique,
// monotonic within a batch.
pub type TxnId = i64;

// Each node of a realm has a unique NodeId.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct NodeId(pub i64);

// Everything the scheduler needs to know about its node and its knobs.
// The partition map is the trivial mod-N map over a dense node numbering;
// anything fancier belongs to a deployment layer we don't have.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    // This node and the total node count. Nodes are numbered 0..nodes.
    pub node: NodeId,
    pub nodes: i64,

    // Worker-thread count. Default leaves room for the lock-manager
    // thread, the router thread, the sequencer and the main thread.
    pub workers: usize,

    // Bucket count of the lock table.
    pub lock_table_size: usize,

    // Key-space upper bound, and the key id at or above which a record is
    // considered cold and must be prefetched before execution.
    pub db_size: u64,
    pub cold_cutoff: u64,

    // Early-release classification: a key whose queue has accumulated more
    // than this many conflicts is tagged contended. Only read when
    // `early_release` is on.
    pub early_release: bool,
    pub max_failed_lock: u64,

    // Sequencer batch cap per epoch.
    pub max_batch_size: usize,

    // CPU pinning. The lock-manager core must not be shared with workers.
    pub lock_manager_core: Option<usize>,
    pub worker_cores: Vec<usize>,
    pub router_core: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Config {
            node: NodeId(0),
            nodes: 1,
            workers: cores.saturating_sub(4).max(1),
            lock_table_size: 1_000_000,
            db_size: 1_000_000,
            cold_cutoff: 990_000,
            early_release: false,
            max_failed_lock: 100,
            max_batch_size: 2_000,
            lock_manager_core: None,
            worker_cores: Vec::new(),
            router_core: None,
        }
    }
}

impl Config {
    // The pure partition function. Integer keys (the benchmark keyspace)
    // partition by value so a workload generator can aim a key at a node;
    // everything else partitions by hash.
    pub fn owner(&self, key: &Key) -> NodeId {
        match key.parse::<u64>() {
            Ok(id) => NodeId((id % self.nodes as u64) as i64),
            Err(_) => NodeId((rapidhash::rapidhash(key.as_bytes()) % self.nodes as u64) as i64),
        }
    }

    pub fn is_local(&self, key: &Key) -> bool {
        self.owner(key) == self.node
    }

    // Cold records must be prefetched before execution touches them.
    pub fn is_cold(&self, key: &Key) -> bool {
        match key.parse::<u64>() {
            Ok(id) => id >= self.cold_cutoff,
            Err(_) => false,
        }
    }

    pub fn worker_core(&self, worker: usize) -> Option<usize> {
        self.worker_cores.get(worker).copied()
    }
}

// Pin the calling thread to the given CPU, if one was configured and the
// OS exposes it. Failure is survivable: the schedule is still correct,
// just slower, so we log and continue.
pub fn pin_to_core(core: Option<usize>) {
    let Some(core) = core else { return };
    let found = core_affinity::get_core_ids()
        .unwrap_or_default()
        .into_iter()
        .find(|c| c.id == core);
    match found {
        Some(id) => {
            if !core_affinity::set_for_current(id) {
                warn!(target: "lockstep", core, "failed to pin thread");
            }
        }
        None => warn!(target: "lockstep", core, "no such core to pin to"),
    }
}
