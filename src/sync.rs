use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use log::{debug, info, warn};
use thiserror::Error;

use crate::blockchain::consensus::Decision;
use crate::blockchain::{Blockchain, BlockchainError, ChainState};
use crate::mining::CancelToken;

/// Errors while syncing with a peer
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unexpected response from {peer}: {reason}")]
    UnexpectedResponse { peer: String, reason: String },

    #[error(transparent)]
    Chain(#[from] BlockchainError),
}

/// Periodically offers peers' chains to the local consensus selector
pub struct PeerSync {
    chain: Arc<Blockchain>,
    peers: Vec<String>,
    http: reqwest::Client,
}

impl PeerSync {
    pub fn new(chain: Arc<Blockchain>, peers: Vec<String>, timeout: Duration) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| SyncError::Transport(format!("failed to create HTTP client: {e}")))?;

        Ok(PeerSync { chain, peers, http })
    }

    /// Fetches one peer's chain and reconciles against it
    ///
    /// Only the closed blocks take part; the peer's open block is its own.
    pub async fn sync_once(&self, peer: &str) -> Result<Decision, SyncError> {
        let response = self
            .http
            .get(format!("{}/blockchain", peer))
            .send()
            .await
            .map_err(|e| SyncError::Transport(format!("{peer}: {e}")))?;

        if !response.status().is_success() {
            return Err(SyncError::UnexpectedResponse {
                peer: peer.to_string(),
                reason: format!("HTTP {}", response.status()),
            });
        }

        let state: ChainState = response.json().await.map_err(|e| SyncError::UnexpectedResponse {
            peer: peer.to_string(),
            reason: e.to_string(),
        })?;

        let chain = self.chain.clone();
        let decision = tokio::task::spawn_blocking(move || chain.reconcile(state.blocks))
            .await
            .map_err(|e| BlockchainError::SystemError(e.to_string()))??;

        Ok(decision)
    }

    /// Syncs with every peer once; failures are logged and skipped
    ///
    /// Peers are fetched concurrently, so one slow peer costs at most the
    /// request timeout.
    pub async fn sync_all(&self) -> usize {
        let results = join_all(self.peers.iter().map(|peer| self.sync_once(peer))).await;
        let mut adopted = 0;

        for (peer, result) in self.peers.iter().zip(results) {
            match result {
                Ok(decision) if decision.is_adopt() => {
                    info!("Adopted chain from {}", peer);
                    adopted += 1;
                }
                Ok(_) => debug!("Kept local chain over {}", peer),
                Err(SyncError::Chain(BlockchainError::InvalidChain(e))) => {
                    warn!("Discarded invalid chain from {}: {}", peer, e)
                }
                Err(e) => warn!("Sync with {} failed: {}", peer, e),
            }
        }

        adopted
    }

    /// Syncs every `interval` until `stop` is cancelled
    pub async fn run(self, interval: Duration, stop: CancelToken) {
        info!("Syncing with {} peers every {:?}", self.peers.len(), interval);
        let mut ticker = tokio::time::interval(interval);

        while !stop.is_cancelled() {
            ticker.tick().await;
            self.sync_all().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::{ChainParams, CoinLedger};

    fn chain() -> Arc<Blockchain> {
        let params = ChainParams::testing();
        let coins = Arc::new(CoinLedger::in_memory(params.max_supply));
        Arc::new(Blockchain::in_memory(params, coins).unwrap())
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_skipped() {
        let chain = chain();
        let sync = PeerSync::new(chain.clone(), vec!["http://127.0.0.1:1".to_string()], Duration::from_millis(300)).unwrap();

        let result = sync.sync_once("http://127.0.0.1:1").await;
        assert!(matches!(result, Err(SyncError::Transport(_))));

        assert_eq!(sync.sync_all().await, 0);
        assert_eq!(chain.height().unwrap(), 0);
    }
}
