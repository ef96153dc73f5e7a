use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Node status
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct StatusResponse {
    pub name: String,

    pub version: String,

    /// Index of the newest closed block
    pub blockchain_height: u64,

    pub share_difficulty: u32,

    pub block_difficulty: u32,

    pub shares_per_block: u32,

    /// Value of one share of the open block, in base units
    pub share_value: u64,

    /// `share_value` in whole coins
    pub share_value_coins: f64,

    /// Reward of the open block, in base units
    pub block_reward: u64,

    /// `block_reward` in whole coins
    pub block_reward_coins: f64,

    pub consensus: String,
}

/// A share found by a miner
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SubmitShareRequest {
    /// Hex-encoded Ed25519 public key the coin is paid to
    pub miner_pubkey: String,

    pub nonce: u64,

    /// Hex-encoded digest the miner computed
    pub hash: String,

    /// The block the template was taken from
    pub block_index: u64,
}

/// An accepted share
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SubmitShareResponse {
    pub success: bool,

    pub message: String,

    pub share_index: u32,

    pub is_block_find: bool,

    /// Unclaimed slots awarded to the block finder
    pub bonus_shares: u32,

    /// The coin minted for the share
    #[schema(value_type = Object)]
    pub coin_data: Option<serde_json::Value>,

    /// The bonus coin, when the share closed the block early
    #[schema(value_type = Object)]
    pub bonus_coin_data: Option<serde_json::Value>,
}

/// Body of every refused request
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct FailureResponse {
    pub success: bool,

    pub message: String,

    /// Machine-readable kind of the failure
    pub reason: String,
}

impl FailureResponse {
    pub fn new(reason: &str, message: impl Into<String>) -> Self {
        FailureResponse {
            success: false,
            message: message.into(),
            reason: reason.to_string(),
        }
    }
}

/// Plain acknowledgement
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct MessageResponse {
    pub success: bool,

    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HeightResponse {
    pub height: u64,
}

/// Liveness report
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// `ok` when the chain links are intact, `degraded` otherwise
    pub status: String,

    pub chain_valid: bool,

    pub height: u64,

    pub uptime_secs: u64,
}

/// Filters for the coin listing
#[derive(Debug, Deserialize, ToSchema)]
pub struct CoinListQuery {
    /// Hex-encoded public key of the owner
    pub owner: String,

    /// Include records that were already spent
    #[serde(default)]
    pub include_spent: bool,
}

/// Coin records of one owner
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CoinListResponse {
    pub owner: String,

    pub count: usize,

    /// Sum of the unspent records listed, in base units
    pub total_value: u64,

    #[schema(value_type = Vec<Object>)]
    pub coins: Vec<serde_json::Value>,
}

/// A coin exported by another node
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CoinImportRequest {
    #[schema(value_type = Object)]
    pub coin_data: serde_json::Value,
}

/// A coin record, as admitted, minted or reissued
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CoinResponse {
    pub success: bool,

    pub message: String,

    pub coin_id: String,

    #[schema(value_type = Object)]
    pub coin_data: serde_json::Value,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct TransferPayloadQuery {
    /// Hex-encoded public key of the recipient
    pub to: String,
}

/// The bytes the owner has to sign to transfer a coin
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TransferPayloadResponse {
    pub coin_id: String,

    pub to: String,

    /// Hex-encoded payload
    pub payload_hex: String,

    /// The payload as text (it is JSON)
    pub payload: String,
}

/// A signed transfer
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TransferRequest {
    /// Hex-encoded public key of the recipient
    pub to_pubkey: String,

    /// Base58 Ed25519 signature of the transfer payload by the current owner
    pub signature: String,
}

/// Bytes to sign for a split or a combine
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PayloadResponse {
    /// Hex-encoded payload
    pub payload_hex: String,

    /// The payload as text (it is JSON)
    pub payload: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SplitPayloadQuery {
    /// Comma-separated amounts in base units, e.g. `250,750`
    pub amounts: String,
}

/// A signed split
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SplitRequest {
    /// Value of each piece in base units; must add up to the coin's value
    pub amounts: Vec<u64>,

    /// Base58 Ed25519 signature of the split payload by the owner
    pub signature: String,
}

/// Pieces issued by a split
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SplitResponse {
    pub success: bool,

    pub message: String,

    pub coin_ids: Vec<String>,

    #[schema(value_type = Vec<Object>)]
    pub coins: Vec<serde_json::Value>,
}

/// Coins to merge into one
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CombinePayloadRequest {
    /// At least two unspent coins of the owner
    pub coin_ids: Vec<String>,

    /// Hex-encoded public key of the owner
    pub owner_pubkey: String,
}

/// A signed combine
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CombineRequest {
    pub coin_ids: Vec<String>,

    pub owner_pubkey: String,

    /// Base58 Ed25519 signature of the combine payload by the owner
    pub signature: String,
}

/// Balance of one owner
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct BalanceResponse {
    pub pubkey: String,

    /// Base58 checksummed address of the key
    pub address: String,

    /// In base units
    pub balance: u64,

    /// In whole coins
    pub balance_coins: f64,

    /// Number of unspent records
    pub coins: usize,
}
