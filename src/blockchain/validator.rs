use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use rayon::prelude::*;
use thiserror::Error;

use super::block::Block;
use super::difficulty::{Difficulties, DifficultyController};
use super::hash::{meets, Digest, HashEngine, HashError};
use super::params::ChainParams;

/// Reasons a chain is rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("Chain is empty")]
    Empty,

    #[error("Genesis block does not match this network")]
    GenesisMismatch,

    #[error("Block {index}: expected index {expected}")]
    NonConsecutive { index: u64, expected: u64 },

    #[error("Block {index}: previous hash does not match its parent")]
    BrokenLink { index: u64 },

    #[error("Block {index}: {reason}")]
    InvalidState { index: u64, reason: String },

    #[error("Block {index}: invalid closing proof: {reason}")]
    InvalidProof { index: u64, reason: String },

    #[error("Block {index}: invalid shares: {reason}")]
    InvalidShares { index: u64, reason: String },

    #[error("Block {index}: difficulty {found:?}, expected {expected:?}")]
    DifficultyMismatch {
        index: u64,
        expected: Difficulties,
        found: Difficulties,
    },

    #[error("Block {index}: reward {found}, expected {expected}")]
    RewardMismatch { index: u64, expected: u64, found: u64 },

    #[error("Block {index}: {reason}")]
    InvalidTimestamp { index: u64, reason: String },

    #[error("Hash error: {0}")]
    Hash(String),
}

impl From<HashError> for ChainError {
    fn from(e: HashError) -> Self {
        ChainError::Hash(e.to_string())
    }
}

fn shares_error(block: &Block, reason: impl Into<String>) -> ChainError {
    ChainError::InvalidShares {
        index: block.index,
        reason: reason.into(),
    }
}

/// Checks blocks against the rules of one network
///
/// Structural checks run block by block; the expensive recomputation of
/// closing proofs runs in parallel once the structure is known to be sound.
#[derive(Debug)]
pub struct ChainValidator {
    params: ChainParams,
    engine: HashEngine,
    controller: DifficultyController,
    genesis: Block,
}

impl ChainValidator {
    pub fn new(params: ChainParams) -> Result<Self, HashError> {
        let engine = HashEngine::new(&params.pow)?;
        let controller = DifficultyController::new(params.difficulty.clone(), params.max_future_drift_secs);
        let genesis = Block::genesis(&params);

        Ok(ChainValidator {
            params,
            engine,
            controller,
            genesis,
        })
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn engine(&self) -> &HashEngine {
        &self.engine
    }

    pub fn controller(&self) -> &DifficultyController {
        &self.controller
    }

    /// The canonical genesis block
    pub fn genesis(&self) -> &Block {
        &self.genesis
    }

    /// Validates a sequence of closed blocks starting at genesis
    ///
    /// # Returns
    ///
    /// The cumulative work of the chain
    pub fn validate(&self, blocks: &[Block], now: DateTime<Utc>) -> Result<u128, ChainError> {
        let genesis = blocks.first().ok_or(ChainError::Empty)?;
        self.check_genesis(genesis)?;

        for i in 1..blocks.len() {
            let block = &blocks[i];
            if !block.is_closed {
                return Err(ChainError::InvalidState {
                    index: block.index,
                    reason: "block is not closed".to_string(),
                });
            }
            self.check_successor(&blocks[..i], block, now)?;
            self.check_shares(block)?;
        }

        blocks[1..]
            .par_iter()
            .try_for_each(|block| self.check_closing_proof(block))?;

        Ok(blocks.iter().map(Block::work).sum())
    }

    /// Validates closed blocks plus the open block built on them
    pub fn validate_state(&self, blocks: &[Block], open: &Block, now: DateTime<Utc>) -> Result<u128, ChainError> {
        let work = self.validate(blocks, now)?;

        if open.is_closed || open.closing_proof.is_some() {
            return Err(ChainError::InvalidState {
                index: open.index,
                reason: "open block is marked closed".to_string(),
            });
        }
        self.check_successor(blocks, open, now)?;
        self.check_shares(open)?;

        Ok(work)
    }

    fn check_genesis(&self, block: &Block) -> Result<(), ChainError> {
        let expected = &self.genesis;
        let same = block.index == 0
            && block.header() == expected.header()
            && block.is_closed
            && block.closing_proof.is_none()
            && block.shares.is_empty()
            && block.shares_claimed == expected.shares_claimed;

        if same {
            Ok(())
        } else {
            Err(ChainError::GenesisMismatch)
        }
    }

    /// Checks how `block` follows the closed blocks `before` it
    fn check_successor(&self, before: &[Block], block: &Block, now: DateTime<Utc>) -> Result<(), ChainError> {
        let parent = before.last().ok_or(ChainError::Empty)?;

        if block.index != parent.index + 1 {
            return Err(ChainError::NonConsecutive {
                index: block.index,
                expected: parent.index + 1,
            });
        }

        if parent.hash() != Some(block.previous_hash) {
            return Err(ChainError::BrokenLink { index: block.index });
        }

        if block.timestamp < parent.timestamp {
            return Err(ChainError::InvalidTimestamp {
                index: block.index,
                reason: "timestamp is earlier than its parent".to_string(),
            });
        }
        if block.timestamp > now + Duration::seconds(self.params.max_future_drift_secs) {
            return Err(ChainError::InvalidTimestamp {
                index: block.index,
                reason: "timestamp is too far in the future".to_string(),
            });
        }

        let expected = self.controller.next_difficulties(before, block.timestamp);
        let found = Difficulties {
            share: block.share_difficulty,
            block: block.block_difficulty,
        };
        if expected != found {
            return Err(ChainError::DifficultyMismatch {
                index: block.index,
                expected,
                found,
            });
        }

        let reward = self.params.block_reward(block.index);
        if block.reward != reward {
            return Err(ChainError::RewardMismatch {
                index: block.index,
                expected: reward,
                found: block.reward,
            });
        }

        Ok(())
    }

    /// Checks the recorded shares of a block
    ///
    /// Ordinary shares occupy indices `0..n` in order; none but the last may
    /// meet the block difficulty, and in a closed block the last one must. A
    /// closed block that still had free slots carries one bonus record right
    /// after the closing share.
    fn check_shares(&self, block: &Block) -> Result<(), ChainError> {
        let spb = self.params.shares_per_block;
        let share_value = self.params.share_value(block.index);
        let mut seen: HashSet<(u64, Digest)> = HashSet::new();

        for (position, share) in block.shares.iter().enumerate() {
            if share.share_index as usize != position {
                return Err(shares_error(block, format!("share at position {} has index {}", position, share.share_index)));
            }
            if share.block_index != block.index {
                return Err(shares_error(block, format!("share {} names block {}", share.share_index, share.block_index)));
            }
            if share.is_bonus {
                if position + 1 != block.shares.len() {
                    return Err(shares_error(block, "bonus record is not last"));
                }
                continue;
            }
            if !seen.insert((share.nonce, share.hash)) {
                return Err(shares_error(block, format!("share {} is a duplicate", share.share_index)));
            }
            if share.value != share_value {
                return Err(shares_error(block, format!("share {} has value {}", share.share_index, share.value)));
            }
            if !meets(block.share_difficulty, &share.hash) {
                return Err(shares_error(block, format!("share {} misses the share difficulty", share.share_index)));
            }
        }

        let ordinary: Vec<_> = block.shares.iter().filter(|s| !s.is_bonus).collect();
        let bonus = block.shares.iter().find(|s| s.is_bonus);
        let claimed = ordinary.len() as u32;

        let closing_position = ordinary.iter().position(|s| meets(block.block_difficulty, &s.hash));
        match closing_position {
            Some(position) if position + 1 != ordinary.len() => {
                return Err(shares_error(block, "a share after the closing share was recorded"));
            }
            _ => {}
        }

        if !block.is_closed {
            if closing_position.is_some() || bonus.is_some() {
                return Err(shares_error(block, "open block contains a closing share"));
            }
            if block.shares_claimed != claimed || claimed >= spb {
                return Err(shares_error(block, format!("open block claims {} of {} shares", block.shares_claimed, claimed)));
            }
            return Ok(());
        }

        let proof = block.closing_proof.as_ref().ok_or_else(|| ChainError::InvalidProof {
            index: block.index,
            reason: "closed block has no closing proof".to_string(),
        })?;
        let closing = match (closing_position, ordinary.last()) {
            (Some(_), Some(last)) => *last,
            _ => return Err(shares_error(block, "closed block has no closing share")),
        };
        if closing.nonce != proof.nonce || closing.hash != proof.hash || closing.miner_pubkey != proof.miner_pubkey {
            return Err(shares_error(block, "closing share does not match the closing proof"));
        }

        let bonus_shares = spb.saturating_sub(claimed);
        match bonus {
            Some(bonus) => {
                let valid = bonus_shares > 0
                    && bonus.value == u64::from(bonus_shares) * share_value
                    && bonus.nonce == proof.nonce
                    && bonus.hash == proof.hash
                    && bonus.miner_pubkey == proof.miner_pubkey;
                if !valid {
                    return Err(shares_error(block, "bonus record does not match the closing share"));
                }
            }
            None if bonus_shares > 0 => return Err(shares_error(block, "bonus record is missing")),
            None => {}
        }

        if block.shares_claimed != spb {
            return Err(shares_error(block, format!("closed block claims {} shares", block.shares_claimed)));
        }

        let total: u64 = block.shares.iter().map(|s| s.value).sum();
        if total != block.reward {
            return Err(shares_error(block, format!("shares add up to {}, reward is {}", total, block.reward)));
        }

        Ok(())
    }

    /// Recomputes the closing solution of a closed block
    fn check_closing_proof(&self, block: &Block) -> Result<(), ChainError> {
        let invalid = |reason: &str| ChainError::InvalidProof {
            index: block.index,
            reason: reason.to_string(),
        };

        let proof = block.closing_proof.as_ref().ok_or_else(|| invalid("missing"))?;
        let digest = self
            .engine
            .compute(block.header().as_bytes(), proof.nonce, &block.previous_hash)?;

        if digest != proof.hash {
            return Err(invalid("hash does not recompute"));
        }
        if !meets(block.block_difficulty, &digest) {
            return Err(invalid("hash misses the block difficulty"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::block::{ClosingProof, Share};
    use crate::blockchain::crypto::Wallet;

    fn validator() -> ChainValidator {
        ChainValidator::new(ChainParams::testing()).unwrap()
    }

    /// Mines a closed block on top of `blocks`, closing it after `ordinary` shares
    fn mine_block(v: &ChainValidator, blocks: &[Block], at: DateTime<Utc>, ordinary: u32) -> Block {
        let tip = blocks.last().unwrap();
        let params = v.params();
        let diffs = v.controller().next_difficulties(blocks, at);
        let mut block = Block::open(tip.index + 1, tip.hash().unwrap(), at, diffs, params.block_reward(tip.index + 1));
        let miner = Wallet::new().public_key().clone();
        let header = block.header();
        let share_value = params.share_value(block.index);

        let mut nonce = 0u64;
        while (block.shares.len() as u32) < ordinary {
            let hash = v.engine().compute(header.as_bytes(), nonce, &block.previous_hash).unwrap();
            let is_find = meets(block.block_difficulty, &hash);
            let want_find = block.shares.len() as u32 + 1 == ordinary;
            if meets(block.share_difficulty, &hash) && is_find == want_find {
                block.shares.push(Share {
                    block_index: block.index,
                    share_index: block.shares.len() as u32,
                    miner_pubkey: miner.clone(),
                    nonce,
                    hash,
                    is_bonus: false,
                    value: share_value,
                    coin_id: format!("COIN-{}", nonce),
                    timestamp: at,
                });
                if is_find {
                    block.closing_proof = Some(ClosingProof {
                        miner_pubkey: miner.clone(),
                        nonce,
                        hash,
                    });
                }
            }
            nonce += 1;
        }

        let bonus_shares = params.shares_per_block - ordinary;
        if bonus_shares > 0 {
            let closing = block.shares.last().unwrap().clone();
            block.shares.push(Share {
                share_index: ordinary,
                is_bonus: true,
                value: u64::from(bonus_shares) * share_value,
                ..closing
            });
        }
        block.shares_claimed = params.shares_per_block;
        block.is_closed = true;
        block
    }

    fn chain(v: &ChainValidator, len: usize) -> Vec<Block> {
        let mut blocks = vec![v.genesis().clone()];
        let start = v.genesis().timestamp;
        for i in 1..len {
            let at = start + Duration::seconds(60 * i as i64);
            let block = mine_block(v, &blocks, at, 3);
            blocks.push(block);
        }
        blocks
    }

    #[test]
    fn test_valid_chain_reports_work() {
        let v = validator();
        let blocks = chain(&v, 3);

        let work = v.validate(&blocks, Utc::now()).unwrap();
        assert_eq!(work, blocks[1].work() + blocks[2].work());
    }

    #[test]
    fn test_wrong_genesis_rejected() {
        let v = validator();
        let mut blocks = chain(&v, 2);
        blocks[0].reward = 1;

        assert_eq!(v.validate(&blocks, Utc::now()), Err(ChainError::GenesisMismatch));
    }

    #[test]
    fn test_broken_link_rejected() {
        let v = validator();
        let mut blocks = chain(&v, 3);
        blocks[2].previous_hash = Digest::sha256(b"elsewhere");

        assert_eq!(v.validate(&blocks, Utc::now()), Err(ChainError::BrokenLink { index: 2 }));
    }

    #[test]
    fn test_forged_closing_hash_rejected() {
        let v = validator();
        let mut blocks = chain(&v, 2);
        let forged = Digest::from_bytes([0u8; 32]);
        let proof = blocks[1].closing_proof.as_mut().unwrap();
        proof.hash = forged;
        let nonce = proof.nonce;
        for share in blocks[1].shares.iter_mut().filter(|s| s.nonce == nonce) {
            share.hash = forged;
        }

        assert!(matches!(v.validate(&blocks, Utc::now()), Err(ChainError::InvalidProof { index: 1, .. })));
    }

    #[test]
    fn test_share_values_must_sum_to_reward() {
        let v = validator();
        let mut blocks = chain(&v, 2);
        let last = blocks[1].shares.len() - 1;
        blocks[1].shares[last].value += 1;

        assert!(matches!(v.validate(&blocks, Utc::now()), Err(ChainError::InvalidShares { index: 1, .. })));
    }

    #[test]
    fn test_gapped_share_indices_rejected() {
        let v = validator();
        let mut blocks = chain(&v, 2);
        blocks[1].shares[0].share_index = 7;

        assert!(matches!(v.validate(&blocks, Utc::now()), Err(ChainError::InvalidShares { index: 1, .. })));
    }

    #[test]
    fn test_wrong_difficulty_rejected() {
        let v = validator();
        let mut blocks = chain(&v, 2);
        blocks[1].share_difficulty += 1;

        assert!(matches!(v.validate(&blocks, Utc::now()), Err(ChainError::DifficultyMismatch { index: 1, .. })));
    }

    #[test]
    fn test_future_timestamp_rejected() {
        let v = validator();
        let blocks = chain(&v, 2);
        let now = blocks[1].timestamp - Duration::seconds(v.params().max_future_drift_secs + 1);

        assert!(matches!(v.validate(&blocks, now), Err(ChainError::InvalidTimestamp { index: 1, .. })));
    }

    #[test]
    fn test_open_block_state() {
        let v = validator();
        let blocks = chain(&v, 2);
        let tip = blocks.last().unwrap();
        let at = tip.timestamp + Duration::seconds(5);
        let diffs = v.controller().next_difficulties(&blocks, at);
        let open = Block::open(2, tip.hash().unwrap(), at, diffs, v.params().block_reward(2));

        assert!(v.validate_state(&blocks, &open, Utc::now()).is_ok());

        let mut closed = open.clone();
        closed.is_closed = true;
        assert!(v.validate_state(&blocks, &closed, Utc::now()).is_err());
    }
}
