// A node pairs one scheduler with its router, storage and application.
// Several nodes can share one in-process network, which is how the
// multipartition paths get exercised without a wire; a real deployment
// swaps the network hub for a socket transport and runs one node per
// process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use lockstep_app::Application;
use lockstep_base::{err, pin_to_core, Config, NodeId, Result};
use lockstep_net::{batch_msg, Connection, Network, Router, Txn};
use lockstep_sched::Scheduler;
use lockstep_store::MemStore;

#[cfg(test)]
mod test;

pub struct Node {
    config: Arc<Config>,
    storage: Arc<MemStore>,
    scheduler: Option<Scheduler>,
    stop_router: Arc<AtomicBool>,
    router_thread: Option<JoinHandle<()>>,
}

impl Node {
    pub fn start(
        config: Config,
        app: Arc<dyn Application>,
        network: &Arc<Network>,
    ) -> Result<Node> {
        let config = Arc::new(config);
        let router = Router::new(network, config.node);
        let batch_conn = router.connect("scheduler");
        let worker_conns: Vec<Connection> = (0..config.workers)
            .map(|i| router.connect(&format!("worker-{i}")))
            .collect();

        let storage = Arc::new(MemStore::new());
        app.initialize_storage(storage.as_ref(), &config);

        let stop_router = Arc::new(AtomicBool::new(false));
        let router_thread = {
            let router = router.clone();
            let stop = stop_router.clone();
            let core = config.router_core;
            std::thread::Builder::new()
                .name(format!("router-{}", config.node.0))
                .spawn(move || {
                    pin_to_core(core);
                    router.run(&stop)
                })?
        };

        let scheduler = Scheduler::start(
            config.clone(),
            storage.clone(),
            app,
            batch_conn,
            worker_conns,
        )?;
        Ok(Node {
            config,
            storage,
            scheduler: Some(scheduler),
            stop_router,
            router_thread: Some(router_thread),
        })
    }

    pub fn id(&self) -> NodeId {
        self.config.node
    }

    pub fn storage(&self) -> &Arc<MemStore> {
        &self.storage
    }

    // Drain through `batches` sequenced batches and stop. Returns the
    // storage so callers can inspect the final state.
    pub fn shutdown(mut self, batches: u64) -> Result<Arc<MemStore>> {
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.shutdown(batches)?;
        }
        self.stop_router.store(true, Ordering::Release);
        if let Some(router) = self.router_thread.take() {
            if router.join().is_err() {
                return Err(err("router thread panicked"));
            }
        }
        Ok(self.storage.clone())
    }
}

// Batches carry this as their source; the sequencer is not a node.
pub const SEQUENCER: NodeId = NodeId(-1);

// The sequencer side of the batch stream: ship one epoch's transactions
// to every node. Every replica sees every batch; each scheduler locks
// only the keys it owns.
pub fn post_batch(
    network: &Network,
    nodes: i64,
    batch_number: u64,
    txns: &[Txn],
) -> Result<()> {
    let mut data = Vec::with_capacity(txns.len());
    for txn in txns {
        data.push(txn.encode()?);
    }
    for node in 0..nodes {
        network.post(batch_msg(
            SEQUENCER,
            NodeId(node),
            "scheduler",
            batch_number,
            data.clone(),
        ))?;
    }
    Ok(())
}
