// The scheduler pairs one lock-manager thread with a pool of worker
// threads. The lock manager is the only thread that touches the lock
// table: it adopts batches in sequence order, admits transactions under a
// backpressure window, and retires completions coming back from the
// workers. Workers execute ready transactions, carry out the remote-read
// exchange with peer nodes, and report back through the done queue.
//
// Counter discipline, all owned by the lock-manager thread:
//   pending   = transactions admitted and not yet released
//   executing = transactions granted all their locks and not yet released
// so pending - executing is the number of blocked transactions, and the
// admission window `pending <= executing` stays shut while anything is
// blocked. At saturation each completion admits exactly one successor,
// which caps the working set and bounds latency tails.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use tracing::{error, info, trace};

use crate::LockTable;
use lockstep_app::Application;
use lockstep_base::{err, pin_to_core, AtomicQueue, Config, Key, Result, TxnId};
use lockstep_net::{BatchAssembler, Connection, Txn};
use lockstep_store::{Storage, StorageContext};

// What a worker hands back to the lock manager. A transaction produces
// one Done; with early release on, an EarlyRelease for its uncontended
// keys may precede it. Workers never touch the lock table themselves, so
// even the early releases travel through this queue.
pub enum Completion {
    EarlyRelease { txn: TxnId, keys: Vec<Key> },
    Done(Box<Txn>),
}

struct Core {
    config: Arc<Config>,
    storage: Arc<dyn Storage>,
    app: Arc<dyn Application>,
    ready: Arc<AtomicQueue<Box<Txn>>>,
    done: Arc<AtomicQueue<Completion>>,
    // Shutdown is an offset into the batch stream: the sequencer's side
    // knows how many batches it produced, and the lock manager drains
    // through exactly that many before stopping. It turns the request
    // into `drained` once every admitted transaction has been released;
    // `abandon` is the non-graceful path used when the scheduler is
    // dropped without a drain.
    stop_after: AtomicU64,
    drained: AtomicBool,
    abandon: AtomicBool,
}

pub struct Scheduler {
    core: Arc<Core>,
    lock_manager: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl Scheduler {
    // Spawn the lock-manager thread and one worker per connection. The
    // batch connection is the channel the sequencer talks on.
    pub fn start(
        config: Arc<Config>,
        storage: Arc<dyn Storage>,
        app: Arc<dyn Application>,
        batch_conn: Connection,
        worker_conns: Vec<Connection>,
    ) -> Result<Scheduler> {
        if worker_conns.len() != config.workers {
            return Err(err("one connection per worker required"));
        }
        let queue_cap = config.max_batch_size.max(config.workers * 4).max(64);
        let core = Arc::new(Core {
            config,
            storage,
            app,
            ready: Arc::new(AtomicQueue::new(queue_cap)),
            done: Arc::new(AtomicQueue::new(queue_cap * 2)),
            stop_after: AtomicU64::new(u64::MAX),
            drained: AtomicBool::new(false),
            abandon: AtomicBool::new(false),
        });

        let lm = {
            let core = core.clone();
            std::thread::Builder::new()
                .name("lock-manager".to_string())
                .spawn(move || run_lock_manager(&core, batch_conn))?
        };
        let mut workers = Vec::new();
        for (i, conn) in worker_conns.into_iter().enumerate() {
            let core = core.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("worker-{i}"))
                    .spawn(move || run_worker(&core, i, conn))?,
            );
        }
        Ok(Scheduler {
            core,
            lock_manager: Some(lm),
            workers,
        })
    }

    // Finish the stream and stop: the node drains through `batches`
    // sequenced batches, releases everything, and every thread exits.
    // The count comes from whoever ran the sequencer side, which is the
    // only place that knows where the stream ends.
    pub fn shutdown(mut self, batches: u64) -> Result<()> {
        self.core.stop_after.store(batches, Ordering::Release);
        if let Some(lm) = self.lock_manager.take() {
            if lm.join().is_err() {
                return Err(err("lock-manager thread panicked"));
            }
        }
        for w in self.workers.drain(..) {
            if w.join().is_err() {
                return Err(err("worker thread panicked"));
            }
        }
        Ok(())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.core.abandon.store(true, Ordering::Release);
        self.core.drained.store(true, Ordering::Release);
    }
}

// The backpressure window: admit only while a worker is free and nothing
// already admitted is blocked. Refusing to flood the lock table with
// transactions whose prerequisites are unlikely to be met quickly caps
// the working set and bounds the tail of transaction latency; when the
// pool is saturated, each completion admits exactly one successor.
pub(crate) fn admission_open(executing: usize, pending: usize, workers: usize) -> bool {
    executing < workers && pending <= executing
}

// Per-second activity counters, mirroring what the loop actually did.
#[derive(Default)]
struct Tasks {
    loaded: usize,
    advanced: usize,
    locked: usize,
    retired: usize,
}

fn run_lock_manager(core: &Core, batch_conn: Connection) {
    pin_to_core(core.config.lock_manager_core);
    let mut table = LockTable::new(core.config.clone(), core.ready.clone());
    let mut assembler = BatchAssembler::new(batch_conn);

    let mut batch: Option<Vec<Vec<u8>>> = None;
    let mut batch_number: u64 = 0;
    let mut batch_offset: usize = 0;
    let mut executing: usize = 0;
    let mut pending: usize = 0;

    let mut tasks = Tasks::default();
    let mut completed: u64 = 0;
    let mut last_report = Instant::now();

    loop {
        let elapsed = last_report.elapsed();
        if elapsed.as_secs() >= 1 {
            info!(target: "lockstep",
                  txns_per_sec = completed as f64 / elapsed.as_secs_f64(),
                  executing, pending,
                  loaded = tasks.loaded, advanced = tasks.advanced,
                  locked = tasks.locked, retired = tasks.retired,
                  "scheduler progress");
            completed = 0;
            tasks = Tasks::default();
            last_report = Instant::now();
        }

        // One scheduling action per iteration, in priority order.

        // Out of batches? Adopt the next one if it has arrived.
        if batch.is_none() {
            if let Some(data) = assembler.get_batch(batch_number) {
                tasks.loaded += 1;
                batch_offset = 0;
                batch = Some(data);
                continue;
            }
        } else if matches!(&batch, Some(data) if batch_offset >= data.len()) {
            // Done with the current batch, move to the next.
            tasks.advanced += 1;
            batch_number += 1;
            batch = None;
            continue;
        }

        // Admit one transaction if the window is open. Stopping after one
        // admission lets the loop reconsider completions, which is where
        // the window reopens.
        if let Some(data) = &batch {
            if batch_offset < data.len() && admission_open(executing, pending, core.config.workers)
            {
                let txn = match Txn::decode(&data[batch_offset]) {
                    Ok(txn) => txn,
                    Err(_) => {
                        // A corrupted transaction would desynchronize the
                        // replicas; there is nothing to skip to.
                        error!(target: "lockstep", batch_number, batch_offset,
                               "malformed transaction in batch");
                        std::process::exit(1);
                    }
                };
                batch_offset += 1;
                pending += 1;
                tasks.locked += 1;
                if table.lock(Box::new(txn)) == 0 {
                    executing += 1;
                }
                continue;
            }
        }

        // Retire one completion.
        if let Some(completion) = core.done.pop() {
            tasks.retired += 1;
            match completion {
                Completion::EarlyRelease { txn, keys } => {
                    executing += table.release_keys(&keys, txn);
                }
                Completion::Done(txn) => {
                    executing -= 1;
                    pending -= 1;
                    let woke = if core.config.early_release {
                        table.release_contended(&txn)
                    } else {
                        table.release_all(&txn)
                    };
                    executing += woke;
                    completed += 1;
                }
            }
            continue;
        }

        // Nothing to do. Leave once the whole sequenced stream has been
        // consumed and every admitted transaction has drained back.
        if core.abandon.load(Ordering::Acquire) {
            return;
        }
        if batch.is_none()
            && batch_number >= core.stop_after.load(Ordering::Acquire)
            && pending == 0
        {
            if !table.is_drained() {
                // Released transactions must leave nothing behind.
                panic!("lock table not empty at drain");
            }
            core.drained.store(true, Ordering::Release);
            return;
        }
        std::thread::yield_now();
    }
}

fn run_worker(core: &Core, worker: usize, conn: Connection) {
    pin_to_core(core.config.worker_core(worker));
    // Transactions parked here have remote reads outstanding; their
    // channel is linked to this worker's connection until they finish.
    let mut active: HashMap<String, StorageContext> = HashMap::new();

    loop {
        // Remote-read results first: they unblock work already started.
        if let Some(msg) = conn.try_recv() {
            let channel = msg.channel.clone();
            let now_ready = match active.get_mut(&channel) {
                Some(ctx) => {
                    ctx.handle_read_result(msg);
                    ctx.ready_to_execute()
                }
                // Data for a transaction this worker no longer (or never)
                // owns; replies carry data, not order, so dropping is safe.
                None => {
                    trace!(target: "lockstep", channel = %channel,
                           "read result for inactive transaction");
                    false
                }
            };
            if now_ready {
                if let Some(ctx) = active.remove(&channel) {
                    conn.unlink_channel(&channel);
                    execute_and_retire(core, ctx);
                }
            }
            continue;
        }

        // Otherwise start on the next ready transaction, if any.
        if let Some(txn) = core.ready.pop() {
            let ctx = match StorageContext::new(
                core.config.clone(),
                conn.clone(),
                core.storage.clone(),
                txn,
            ) {
                Ok(ctx) => ctx,
                Err(_) => {
                    error!(target: "lockstep", "remote read exchange failed");
                    std::process::exit(1);
                }
            };
            if ctx.ready_to_execute() {
                execute_and_retire(core, ctx);
            } else {
                let channel = ctx.txn().channel();
                conn.link_channel(&channel);
                active.insert(channel, ctx);
            }
            continue;
        }

        if core.drained.load(Ordering::Acquire)
            && (active.is_empty() || core.abandon.load(Ordering::Acquire))
        {
            return;
        }
        std::thread::yield_now();
    }
}

fn execute_and_retire(core: &Core, ctx: StorageContext) {
    // With early release on, the uncontended share of the footprint goes
    // back the moment every read is in hand; the classification promises
    // nothing conflicting is in flight behind them.
    if core.config.early_release && !ctx.txn().uncontended.is_empty() {
        core.done.push_blocking(Completion::EarlyRelease {
            txn: ctx.txn().id,
            keys: ctx.txn().uncontended.clone(),
        });
    }
    if core.app.execute(&ctx).is_err() {
        // Deterministic systems cannot skip a transaction without
        // diverging replicas.
        error!(target: "lockstep", txn = ctx.txn().id, "application execution failed");
        std::process::abort();
    }
    let txn = ctx.finish();
    core.done.push_blocking(Completion::Done(txn));
}
