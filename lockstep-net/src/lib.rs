use serde::{Deserialize, Serialize};

use lockstep_base::{Key, NodeId, Result, TxnId};

mod batch;
mod hub;

pub use batch::{batch_msg, BatchAssembler};
pub use hub::{Connection, Network, Router};


// The transaction record, as shipped by the sequencer. Immutable once
// sequenced: the scheduler trusts the read/write footprint and the
// participant lists completely, since every replica must make identical
// decisions from them. The two trailing key lists are a side-channel the
// lock manager fills in when early release is enabled; they are always
// empty on the wire.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Txn {
    pub id: TxnId,
    pub read_set: Vec<Key>,
    pub write_set: Vec<Key>,
    pub read_write_set: Vec<Key>,
    pub readers: Vec<NodeId>,
    pub writers: Vec<NodeId>,
    pub contended: Vec<Key>,
    pub uncontended: Vec<Key>,
}

impl Txn {
    pub fn new(id: TxnId) -> Self {
        Txn {
            id,
            read_set: Vec::new(),
            write_set: Vec::new(),
            read_write_set: Vec::new(),
            readers: Vec::new(),
            writers: Vec::new(),
            contended: Vec::new(),
            uncontended: Vec::new(),
        }
    }

    // Remote-read replies for this transaction are addressed here.
    pub fn channel(&self) -> String {
        self.id.to_string()
    }

    pub fn is_reader(&self, node: NodeId) -> bool {
        self.readers.contains(&node)
    }

    pub fn is_writer(&self, node: NodeId) -> bool {
        self.writers.contains(&node)
    }

    // True when the participant set spans more than one node, which is
    // what forces a remote-read exchange during execution.
    pub fn multipartition(&self) -> bool {
        let mut first: Option<NodeId> = None;
        for n in self.readers.iter().chain(self.writers.iter()) {
            match first {
                None => first = Some(*n),
                Some(f) if f != *n => return true,
                Some(_) => {}
            }
        }
        false
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn decode(buf: &[u8]) -> Result<Txn> {
        Ok(rmp_serde::from_slice(buf)?)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Body {
    // A unit of the global transaction order. `data` holds one encoded
    // Txn per element; batch numbers are dense and monotonic from 0.
    TxnBatch {
        batch_number: u64,
        data: Vec<Vec<u8>>,
    },
    // One remote read, satisfied by a peer during execution. Addressed to
    // the owning transaction's channel.
    ReadResult {
        key: Key,
        value: Vec<u8>,
    },
}

// All inter-node communication takes the form of Messages: common
// addressing fields plus a variable body. The channel names the inbound
// queue on the destination node that the message is routed to.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Msg {
    pub from: NodeId,
    pub to: NodeId,
    pub channel: String,
    pub body: Body,
}

impl Msg {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn decode(buf: &[u8]) -> Result<Msg> {
        Ok(rmp_serde::from_slice(buf)?)
    }
}
