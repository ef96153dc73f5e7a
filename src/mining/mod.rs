// Mining module
//
// Multithreaded nonce search against the current template, the sinks
// shares are submitted to (the local ledger or a remote server), and the
// switch the API uses to start and stop the node's own miner.

pub mod control;
pub mod engine;
pub mod sink;

pub use control::{MiningControl, MiningStatus};
pub use engine::{CancelToken, Miner, MinerConfig};
pub use sink::{LocalSink, RemoteSink};
