use std::collections::HashMap;

use crate::{Body, Connection, Msg};
use lockstep_base::NodeId;

// Batches can arrive out of order: the sequencer's epochs are totally
// ordered but the transport is not obliged to preserve that order. The
// assembler hands batches out in strictly increasing batch-number order,
// stashing early arrivals until their turn comes. Duplicate batch numbers
// are forbidden by the sequencer contract; the stash simply overwrites.
pub struct BatchAssembler {
    conn: Connection,
    stash: HashMap<u64, Vec<Vec<u8>>>,
}

impl BatchAssembler {
    pub fn new(conn: Connection) -> Self {
        BatchAssembler {
            conn,
            stash: HashMap::new(),
        }
    }

    // Return batch `n` if it is stashed or can be drained off the
    // connection right now; None means the caller should retry later.
    pub fn get_batch(&mut self, n: u64) -> Option<Vec<Vec<u8>>> {
        if let Some(data) = self.stash.remove(&n) {
            return Some(data);
        }
        while let Some(msg) = self.conn.try_recv() {
            match msg.body {
                Body::TxnBatch { batch_number, data } => {
                    if batch_number == n {
                        return Some(data);
                    }
                    self.stash.insert(batch_number, data);
                }
                other => {
                    // Only the sequencer talks on this channel.
                    panic!("non-batch message on sequencer channel: {:?}", other);
                }
            }
        }
        None
    }

    pub fn stashed(&self) -> usize {
        self.stash.len()
    }
}

// Build the batch message for one sequencer epoch.
pub fn batch_msg(
    from: NodeId,
    to: NodeId,
    channel: &str,
    batch_number: u64,
    data: Vec<Vec<u8>>,
) -> Msg {
    Msg {
        from,
        to,
        channel: channel.to_string(),
        body: Body::TxnBatch { batch_number, data },
    }
}
