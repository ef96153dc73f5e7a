use std::sync::{Arc, Mutex, MutexGuard};

use log::{error, info};
use serde::Serialize;
use tokio::task::JoinHandle;
use utoipa::ToSchema;

use super::engine::{CancelToken, Miner, MinerConfig, MinerStatsSnapshot};
use super::sink::ShareSink;
use crate::blockchain::HashEngine;

/// The miner currently running on behalf of the node
struct Running {
    miner: Arc<Miner>,
    stop: CancelToken,
    task: JoinHandle<()>,
}

/// What `/mining/status` reports
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct MiningStatus {
    pub active: bool,

    pub threads: usize,

    /// Hex-encoded public key shares are paid to
    pub miner_pubkey: String,

    /// Counters of the current or last run
    #[schema(value_type = Object)]
    pub stats: Option<MinerStatsSnapshot>,
}

/// Starts and stops the node's own miner
///
/// At most one miner runs at a time. Stopping keeps the last miner around so
/// its counters stay visible until the next start.
pub struct MiningControl {
    engine: HashEngine,
    sink: Arc<dyn ShareSink>,
    config: MinerConfig,
    current: Mutex<Option<Running>>,
}

impl MiningControl {
    pub fn new(engine: HashEngine, sink: Arc<dyn ShareSink>, config: MinerConfig) -> Self {
        MiningControl {
            engine,
            sink,
            config,
            current: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Running>> {
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_active(running: &Option<Running>) -> bool {
        running
            .as_ref()
            .map(|r| !r.task.is_finished() && !r.stop.is_cancelled())
            .unwrap_or(false)
    }

    /// Starts mining; `false` when a miner is already running
    ///
    /// Must be called from within the tokio runtime.
    pub fn start(&self) -> bool {
        let mut current = self.lock();
        if Self::is_active(&current) {
            return false;
        }

        let miner = Arc::new(Miner::new(self.engine.clone(), self.sink.clone(), self.config.clone()));
        let stop = CancelToken::new();

        let task = {
            let miner = miner.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                if let Err(e) = miner.run(stop).await {
                    error!("Miner stopped: {}", e);
                }
            })
        };

        *current = Some(Running { miner, stop, task });
        info!("Mining started with {} threads", self.config.threads);
        true
    }

    /// Asks the running miner to stop; `false` when none was running
    pub fn stop(&self) -> bool {
        let current = self.lock();
        if !Self::is_active(&current) {
            return false;
        }
        if let Some(running) = current.as_ref() {
            running.stop.cancel();
        }
        info!("Mining stop requested");
        true
    }

    pub fn status(&self) -> MiningStatus {
        let current = self.lock();
        MiningStatus {
            active: Self::is_active(&current),
            threads: self.config.threads,
            miner_pubkey: self.config.miner.to_string(),
            stats: current.as_ref().map(|running| running.miner.stats()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::{Blockchain, ChainParams, CoinLedger, Wallet};
    use crate::mining::LocalSink;
    use std::time::Duration;

    fn control() -> MiningControl {
        let params = ChainParams::testing();
        let coins = Arc::new(CoinLedger::in_memory(params.max_supply));
        let chain = Arc::new(Blockchain::in_memory(params, coins).unwrap());
        let engine = chain.validator().engine().clone();
        let config = MinerConfig::new(Wallet::new().public_key().clone(), 1);
        MiningControl::new(engine, Arc::new(LocalSink::new(chain)), config)
    }

    async fn wait_until_idle(control: &MiningControl) {
        for _ in 0..100 {
            if !control.status().active {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("miner did not stop");
    }

    #[tokio::test]
    async fn test_start_stop_and_status() {
        let control = control();
        assert!(!control.status().active);
        assert!(control.status().stats.is_none());
        assert!(!control.stop());

        assert!(control.start());
        assert!(!control.start());
        assert!(control.status().active);

        assert!(control.stop());
        assert!(!control.status().active);
        wait_until_idle(&control).await;
        assert!(control.status().stats.is_some());

        // a stopped miner can be started again
        assert!(control.start());
        assert!(control.stop());
    }

}
