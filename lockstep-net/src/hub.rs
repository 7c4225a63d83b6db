use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tracing::trace;

use crate::Msg;
use lockstep_base::{err, AtomicQueue, NodeId, Result};

// Capacity of every hub-side queue: a node's raw inbox and each named
// channel queue. Producers spin when full, so this is a backpressure
// bound, not a correctness one.
const QUEUE_CAPACITY: usize = 4096;

// An in-process message fabric standing in for the wire. A real
// deployment replaces this with a socket transport; nothing above the
// Connection type can tell the difference. Each joined node gets a raw
// inbox that its router thread drains and dispatches by channel name.
#[derive(Default)]
pub struct Network {
    inboxes: DashMap<i64, Arc<AtomicQueue<Msg>>>,
}

impl Network {
    pub fn new() -> Arc<Self> {
        Arc::new(Network::default())
    }

    // Deliver a message to its destination node's inbox. Spins when the
    // inbox is full; the sender is playing the role of the OS transport,
    // which is the one place threads are allowed to wait.
    pub fn post(&self, msg: Msg) -> Result<()> {
        let Some(inbox) = self.inboxes.get(&msg.to.0).map(|q| q.value().clone()) else {
            return Err(err(format!("no such node {:?}", msg.to)));
        };
        inbox.push_blocking(msg);
        Ok(())
    }

    fn join(&self, node: NodeId) -> Arc<AtomicQueue<Msg>> {
        let inbox = Arc::new(AtomicQueue::new(QUEUE_CAPACITY));
        self.inboxes.insert(node.0, inbox.clone());
        inbox
    }
}

// Channel table of one router. `linked` names the live channels; `parked`
// buffers messages that arrived for a channel before anyone linked it,
// which happens whenever a peer answers a remote read faster than the
// local worker gets the transaction's channel registered. The two maps
// change together under one lock so a message can never fall between
// the lookup and the link.
#[derive(Default)]
struct Channels {
    linked: HashMap<String, Arc<AtomicQueue<Msg>>>,
    parked: HashMap<String, Vec<Msg>>,
}

// One router per node. Owns the node's inbox and dispatches each inbound
// message to the queue linked under its channel name. Channels come and
// go: the scheduler channel lives for the life of the node, while workers
// link a transaction-id channel for exactly as long as that transaction
// has remote reads outstanding.
pub struct Router {
    node: NodeId,
    network: Arc<Network>,
    inbox: Arc<AtomicQueue<Msg>>,
    channels: Mutex<Channels>,
}

impl Router {
    pub fn new(network: &Arc<Network>, node: NodeId) -> Arc<Router> {
        let inbox = network.join(node);
        Arc::new(Router {
            node,
            network: network.clone(),
            inbox,
            channels: Mutex::new(Channels::default()),
        })
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    // Create a connection with its own freshly-linked channel.
    pub fn connect(self: &Arc<Self>, channel: &str) -> Connection {
        let queue = Arc::new(AtomicQueue::new(QUEUE_CAPACITY));
        let conn = Connection {
            router: self.clone(),
            channel: channel.to_string(),
            queue,
        };
        conn.link_channel(channel);
        conn
    }

    // Dispatch inbound messages until asked to stop and the inbox is dry.
    pub fn run(&self, stop: &AtomicBool) {
        loop {
            match self.inbox.pop() {
                Some(msg) => self.dispatch(msg),
                None => {
                    if stop.load(Ordering::Acquire) {
                        return;
                    }
                    std::thread::yield_now();
                }
            }
        }
    }

    fn dispatch(&self, msg: Msg) {
        // Resolve under the lock, deliver outside it: a full channel
        // queue must not stall link/unlink traffic.
        let queue = {
            let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
            match channels.linked.get(&msg.channel) {
                Some(queue) => queue.clone(),
                None => {
                    channels
                        .parked
                        .entry(msg.channel.clone())
                        .or_default()
                        .push(msg);
                    return;
                }
            }
        };
        queue.push_blocking(msg);
    }
}

// A thread's handle onto the fabric: send to any node, receive whatever
// the router dispatches to this connection's own channel or to any extra
// channel linked to it. Cloning shares the underlying queue.
#[derive(Clone)]
pub struct Connection {
    router: Arc<Router>,
    channel: String,
    queue: Arc<AtomicQueue<Msg>>,
}

impl Connection {
    pub fn node(&self) -> NodeId {
        self.router.node
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn send(&self, msg: Msg) -> Result<()> {
        self.router.network.post(msg)
    }

    pub fn try_recv(&self) -> Option<Msg> {
        self.queue.pop()
    }

    // Route messages addressed to `channel` into this connection's
    // queue, starting with any that arrived before the link existed.
    pub fn link_channel(&self, channel: &str) {
        let parked = {
            let mut channels = self
                .router
                .channels
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            channels
                .linked
                .insert(channel.to_string(), self.queue.clone());
            channels.parked.remove(channel)
        };
        for msg in parked.unwrap_or_default() {
            self.queue.push_blocking(msg);
        }
    }

    // Drop the link and anything that straggled in for it afterwards; a
    // reply for a completed transaction carries data, not order, so
    // discarding it cannot desynchronize the replicas.
    pub fn unlink_channel(&self, channel: &str) {
        let mut channels = self
            .router
            .channels
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        channels.linked.remove(channel);
        if let Some(stale) = channels.parked.remove(channel) {
            trace!(target: "lockstep", channel, count = stale.len(),
                   "discarding replies for closed channel");
        }
    }
}
