// Run one or more nodes in this process against a synthetic sequencer
// and the microbenchmark workload, then drain and report.

use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;
use tracing_subscriber::EnvFilter;

use lockstep::{post_batch, Node};
use lockstep_app::Microbench;
use lockstep_base::{err, Config, NodeId, Result};
use lockstep_net::{Network, Txn};

// One sequencer epoch per tick.
const EPOCH: Duration = Duration::from_millis(10);

#[derive(Parser)]
#[command(name = "lockstep", about = "Deterministic transaction scheduler benchmark")]
struct Args {
    /// How many nodes to run in this process.
    #[arg(long, default_value_t = 1)]
    nodes: i64,

    /// Worker threads per node; default leaves room for the background
    /// threads.
    #[arg(long)]
    workers: Option<usize>,

    /// How long to keep sequencing batches.
    #[arg(long, default_value_t = 10)]
    seconds: u64,

    #[arg(long, default_value_t = 1_000_000)]
    db_size: u64,

    /// Records below this id form the contended end of the key space.
    #[arg(long, default_value_t = 10)]
    hot_records: u64,

    /// Keys touched per transaction.
    #[arg(long, default_value_t = 10)]
    rw_set_size: usize,

    /// Percentage of transactions spanning two nodes.
    #[arg(long, default_value_t = 0)]
    multipartition_pct: u64,

    /// Release uncontended keys as soon as execution has observed them.
    #[arg(long)]
    early_release: bool,

    /// Transactions per sequencer epoch.
    #[arg(long, default_value_t = 2_000)]
    max_batch_size: usize,

    /// Workload seed, so runs are repeatable.
    #[arg(long, default_value_t = 1)]
    seed: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();
    if args.nodes < 1 {
        return Err(err("at least one node required"));
    }

    let network = Network::new();
    let bench = Arc::new(Microbench {
        nodes: args.nodes,
        hot_records: args.hot_records,
        db_size: args.db_size,
        rw_set_size: args.rw_set_size,
    });
    let mut nodes = Vec::new();
    for n in 0..args.nodes {
        let mut config = Config {
            node: NodeId(n),
            nodes: args.nodes,
            db_size: args.db_size,
            early_release: args.early_release,
            max_batch_size: args.max_batch_size,
            ..Config::default()
        };
        if let Some(workers) = args.workers {
            config.workers = workers;
        }
        nodes.push(Node::start(config, bench.clone(), &network)?);
    }
    let mut rng = StdRng::seed_from_u64(args.seed);
    let deadline = Instant::now() + Duration::from_secs(args.seconds);
    let mut batch_number: u64 = 0;
    let mut txn_id: i64 = 0;
    let mut sequenced: u64 = 0;

    while Instant::now() < deadline {
        let mut txns: Vec<Txn> = Vec::with_capacity(args.max_batch_size);
        for _ in 0..args.max_batch_size {
            let part = rng.gen_range(0..args.nodes);
            let multipartition =
                args.nodes > 1 && rng.gen_range(0..100) < args.multipartition_pct;
            let txn = if multipartition {
                let mut other = rng.gen_range(0..args.nodes);
                if other == part {
                    other = (other + 1) % args.nodes;
                }
                bench.txn_mp(txn_id, part, other, &mut rng)
            } else {
                bench.txn_sp(txn_id, part, &mut rng)
            };
            txn_id += 1;
            txns.push(txn);
        }
        post_batch(&network, args.nodes, batch_number, &txns)?;
        batch_number += 1;
        sequenced += txns.len() as u64;
        std::thread::sleep(EPOCH);
    }

    info!(target: "lockstep", sequenced, batches = batch_number, "sequencer finished, draining");
    for node in nodes {
        let id = node.id();
        node.shutdown(batch_number)?;
        info!(target: "lockstep", node = id.0, "node drained");
    }
    Ok(())
}
