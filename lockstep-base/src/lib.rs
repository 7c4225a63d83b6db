mod config;
mod error;
mod queue;

pub use config::{pin_to_core, Config, Key, NodeId, TxnId};
pub use error::{err, Error, Result};
pub use queue::AtomicQueue;
