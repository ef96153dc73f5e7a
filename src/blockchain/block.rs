use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::crypto::PublicKey;
use super::difficulty::Difficulties;
use super::hash::{work_for, Digest};
use super::params::{ChainParams, GENESIS_MESSAGE};

/// The solution that closed a block
///
/// The closing share is recorded like any other share. When it leaves slots
/// unclaimed, the finder's bonus follows it as one more record at
/// `share_index + 1` with `is_bonus` set, worth all the unclaimed slots.
/// `shares_claimed` is then set to `shares_per_block`: it counts slots, not
/// records, so a block closed early has fewer records than claimed slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosingProof {
    /// The block finder
    pub miner_pubkey: PublicKey,

    pub nonce: u64,

    /// Digest that met the block difficulty; becomes the block's hash
    pub hash: Digest,
}

/// A proof-of-work share recorded in a block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Share {
    pub block_index: u64,

    /// Position of the share within its block
    pub share_index: u32,

    pub miner_pubkey: PublicKey,

    pub nonce: u64,

    pub hash: Digest,

    /// True for the record carrying the block finder's bonus
    #[serde(default)]
    pub is_bonus: bool,

    /// Value minted for this share, in base units
    pub value: u64,

    /// Coin minted for this share
    pub coin_id: String,

    /// When the share was accepted
    pub timestamp: DateTime<Utc>,
}

/// Represents a block in the blockchain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    /// Version of the block structure
    #[serde(default = "default_version")]
    pub version: u32,

    /// Index of the block in the chain
    pub index: u64,

    /// Hash of the previous block
    pub previous_hash: Digest,

    /// When the block was opened for mining
    pub timestamp: DateTime<Utc>,

    pub share_difficulty: u32,

    pub block_difficulty: u32,

    /// Total reward released by this block, in base units
    pub reward: u64,

    /// Number of share slots claimed so far
    pub shares_claimed: u32,

    pub is_closed: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closing_proof: Option<ClosingProof>,

    /// Accepted shares, in share index order
    #[serde(default)]
    pub shares: Vec<Share>,
}

/// Default version for blocks
fn default_version() -> u32 {
    1
}

impl Block {
    /// Creates the genesis block of a network
    pub fn genesis(params: &ChainParams) -> Self {
        let timestamp = DateTime::<Utc>::from_timestamp(params.genesis_timestamp, 0).unwrap_or_default();

        Block {
            version: default_version(),
            index: 0,
            previous_hash: Digest::ZERO,
            timestamp,
            share_difficulty: params.initial_share_difficulty,
            block_difficulty: params.initial_block_difficulty(),
            reward: 0,
            shares_claimed: params.shares_per_block,
            is_closed: true,
            closing_proof: None,
            shares: Vec::new(),
        }
    }

    /// Creates a new open block
    pub fn open(
        index: u64,
        previous_hash: Digest,
        timestamp: DateTime<Utc>,
        difficulties: Difficulties,
        reward: u64,
    ) -> Self {
        Block {
            version: default_version(),
            index,
            previous_hash,
            timestamp,
            share_difficulty: difficulties.share,
            block_difficulty: difficulties.block,
            reward,
            shares_claimed: 0,
            is_closed: false,
            closing_proof: None,
            shares: Vec::new(),
        }
    }

    /// The committed header miners hash against
    ///
    /// Only fields fixed when the block opens are included, so the header
    /// does not change while shares accumulate. Keys are emitted in sorted
    /// order and the timestamp in unix seconds.
    pub fn header(&self) -> String {
        let mut header = serde_json::json!({
            "version": self.version,
            "index": self.index,
            "previous_hash": self.previous_hash.to_hex(),
            "timestamp": self.timestamp.timestamp(),
            "share_difficulty": self.share_difficulty,
            "block_difficulty": self.block_difficulty,
            "reward": self.reward,
        });

        if self.index == 0 {
            header["message"] = serde_json::Value::from(GENESIS_MESSAGE);
        }

        header.to_string()
    }

    /// Hash of the block
    ///
    /// Genesis hashes its header; any other block is identified by the digest
    /// of its closing proof. Open blocks have no hash yet.
    pub fn hash(&self) -> Option<Digest> {
        if self.index == 0 {
            return Some(Digest::sha256(self.header().as_bytes()));
        }

        self.closing_proof.as_ref().map(|proof| proof.hash)
    }

    /// Number of share slots still unclaimed
    pub fn shares_remaining(&self, shares_per_block: u32) -> u32 {
        shares_per_block.saturating_sub(self.shares_claimed)
    }

    /// Finds an ordinary share by its proof
    pub fn find_share(&self, nonce: u64, hash: &Digest) -> Option<&Share> {
        self.shares
            .iter()
            .find(|share| !share.is_bonus && share.nonce == nonce && share.hash == *hash)
    }

    /// When the closing share was accepted; `None` for genesis and open blocks
    pub fn closed_at(&self) -> Option<DateTime<Utc>> {
        let proof = self.closing_proof.as_ref()?;
        self.find_share(proof.nonce, &proof.hash).map(|share| share.timestamp)
    }

    /// Bonus record attached to the share at `share_index`, if any
    pub fn bonus_after(&self, share_index: u32) -> Option<&Share> {
        self.shares
            .iter()
            .find(|share| share.is_bonus && share.share_index == share_index + 1)
    }

    /// Work this block contributes to its chain
    pub fn work(&self) -> u128 {
        if self.index == 0 || !self.is_closed {
            0
        } else {
            work_for(self.block_difficulty)
        }
    }
}
