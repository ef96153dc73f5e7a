use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use thiserror::Error;

use crate::api::schema::SubmitShareRequest;
use crate::blockchain::{Blockchain, Digest, PublicKey, ShareError, Template};

/// Errors reaching the place shares are submitted to
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Ledger error: {0}")]
    Ledger(String),
}

/// Why the ledger refused a share
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Stale,
    Duplicate,
    SharesExhausted,
    InvalidProof,
    InsufficientDifficulty,
    Other(String),
}

impl Rejection {
    /// Maps the ledger's machine-readable reason
    pub fn from_reason(reason: &str) -> Self {
        match reason {
            "stale_template" => Rejection::Stale,
            "duplicate_share" => Rejection::Duplicate,
            "shares_exhausted" => Rejection::SharesExhausted,
            "invalid_proof" => Rejection::InvalidProof,
            "insufficient_difficulty" => Rejection::InsufficientDifficulty,
            other => Rejection::Other(other.to_string()),
        }
    }

    /// Soft rejections are a normal part of racing other miners
    pub fn is_soft(&self) -> bool {
        matches!(self, Rejection::Stale | Rejection::Duplicate | Rejection::SharesExhausted)
    }
}

/// An accepted share, as reported back to the miner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acceptance {
    pub share_index: u32,
    pub is_block_find: bool,
    pub bonus_shares: u32,
    pub coin_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted(Acceptance),
    Rejected(Rejection),
}

/// Where templates come from and shares go to
#[async_trait]
pub trait ShareSink: Send + Sync {
    async fn template(&self) -> Result<Template, SinkError>;

    async fn submit(&self, share: &SubmitShareRequest) -> Result<SubmitOutcome, SinkError>;
}

/// Submits straight into a ledger in the same process
pub struct LocalSink {
    chain: Arc<Blockchain>,
}

impl LocalSink {
    pub fn new(chain: Arc<Blockchain>) -> Self {
        LocalSink { chain }
    }
}

#[async_trait]
impl ShareSink for LocalSink {
    async fn template(&self) -> Result<Template, SinkError> {
        let chain = self.chain.clone();
        tokio::task::spawn_blocking(move || chain.template())
            .await
            .map_err(|e| SinkError::Ledger(e.to_string()))?
            .map_err(|e| SinkError::Ledger(e.to_string()))
    }

    async fn submit(&self, share: &SubmitShareRequest) -> Result<SubmitOutcome, SinkError> {
        let miner: PublicKey = match share.miner_pubkey.parse() {
            Ok(key) => key,
            Err(e) => return Ok(SubmitOutcome::Rejected(Rejection::Other(format!("{}", e)))),
        };
        let hash: Digest = match share.hash.parse() {
            Ok(hash) => hash,
            Err(e) => return Ok(SubmitOutcome::Rejected(Rejection::Other(format!("{}", e)))),
        };

        let chain = self.chain.clone();
        let (block_index, nonce) = (share.block_index, share.nonce);
        let result = tokio::task::spawn_blocking(move || chain.submit_share(block_index, &miner, nonce, hash))
            .await
            .map_err(|e| SinkError::Ledger(e.to_string()))?;

        match result {
            Ok(receipt) => Ok(SubmitOutcome::Accepted(Acceptance {
                share_index: receipt.share.share_index,
                is_block_find: receipt.is_block_find,
                bonus_shares: receipt.bonus_shares,
                coin_id: receipt.coin.map(|coin| coin.coin_id),
            })),
            Err(ShareError::Internal(e)) => Err(SinkError::Ledger(e.to_string())),
            Err(e) => Ok(SubmitOutcome::Rejected(Rejection::from_reason(e.reason()))),
        }
    }
}

/// Reply of `POST /share/submit`, success or failure
#[derive(Debug, Deserialize)]
struct SubmitReply {
    success: bool,
    #[serde(default)]
    message: String,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    share_index: Option<u32>,
    #[serde(default)]
    is_block_find: bool,
    #[serde(default)]
    bonus_shares: u32,
    #[serde(default)]
    coin_data: Option<serde_json::Value>,
}

/// Submits to a server over HTTP
#[derive(Clone)]
pub struct RemoteSink {
    http: reqwest::Client,
    base_url: String,
}

impl RemoteSink {
    /// Creates a sink for the server at `base_url` (e.g. `http://127.0.0.1:8333`)
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SinkError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| SinkError::Transport(format!("failed to create HTTP client: {e}")))?;

        Ok(RemoteSink {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl ShareSink for RemoteSink {
    async fn template(&self) -> Result<Template, SinkError> {
        let response = self
            .http
            .get(format!("{}/block/current", self.base_url))
            .send()
            .await
            .map_err(|e| SinkError::Transport(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(SinkError::UnexpectedResponse(format!(
                "server returned HTTP {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| SinkError::UnexpectedResponse(format!("invalid template: {e}")))
    }

    async fn submit(&self, share: &SubmitShareRequest) -> Result<SubmitOutcome, SinkError> {
        let response = self
            .http
            .post(format!("{}/share/submit", self.base_url))
            .json(share)
            .send()
            .await
            .map_err(|e| SinkError::Transport(format!("request failed: {e}")))?;

        let status = response.status();
        let reply: SubmitReply = response
            .json()
            .await
            .map_err(|e| SinkError::UnexpectedResponse(format!("HTTP {}: {e}", status)))?;

        if reply.success {
            let coin_id = reply
                .coin_data
                .as_ref()
                .and_then(|coin| coin.get("coin_id"))
                .and_then(|id| id.as_str())
                .map(str::to_string);

            return Ok(SubmitOutcome::Accepted(Acceptance {
                share_index: reply.share_index.unwrap_or_default(),
                is_block_find: reply.is_block_find,
                bonus_shares: reply.bonus_shares,
                coin_id,
            }));
        }

        debug!("Share rejected by server: {}", reply.message);
        match reply.reason {
            Some(reason) if reason != "internal" => Ok(SubmitOutcome::Rejected(Rejection::from_reason(&reason))),
            _ if status.is_server_error() => Err(SinkError::Ledger(reply.message)),
            _ => Ok(SubmitOutcome::Rejected(Rejection::Other(reply.message))),
        }
    }
}
