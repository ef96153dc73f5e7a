use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use super::block::{Block, ClosingProof, Share};
use super::clock::{Clock, SystemClock};
use super::coin::{Coin, MiningProof, MintOrigin};
use super::consensus::{AuthoritativeServer, ConsensusPolicy, ConsensusSelector, Decision};
use super::crypto::PublicKey;
use super::hash::{meets, Digest, HashError};
use super::ledger::{CoinError, CoinLedger, MintRequest};
use super::params::ChainParams;
use super::storage::{LedgerFile, StorageError};
use super::validator::{ChainError, ChainValidator};

/// Errors that can occur during blockchain operations
#[derive(Debug, Error)]
pub enum BlockchainError {
    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("Coin error: {0}")]
    CoinError(#[from] CoinError),

    #[error("Hash error: {0}")]
    HashError(#[from] HashError),

    #[error("Invalid chain: {0}")]
    InvalidChain(#[from] ChainError),

    #[error("Corrupt ledger: {0}")]
    CorruptLedger(String),

    #[error("System error: {0}")]
    SystemError(String),
}

/// Reasons a submitted share is not recorded
///
/// A rejection never leaves a partial effect behind: no slot is claimed and
/// no coin is minted.
#[derive(Debug, Error)]
pub enum ShareError {
    #[error("Stale template: block {submitted} is not open (open block is {current})")]
    StaleTemplate { submitted: u64, current: u64 },

    #[error("Invalid proof: hash does not match the block header and nonce")]
    InvalidProof,

    #[error("Insufficient difficulty: share needs {required} leading zero bits")]
    InsufficientDifficulty { required: u32 },

    #[error("Duplicate share: already recorded as share {} of block {}", .0.share.share_index, .0.share.block_index)]
    DuplicateShare(Box<ShareReceipt>),

    #[error("Block {block_index} has no share slots left; only a block solution is accepted")]
    SharesExhausted { block_index: u64 },

    #[error("Invalid miner public key: {0}")]
    InvalidPubkey(String),

    #[error(transparent)]
    Internal(#[from] BlockchainError),
}

impl ShareError {
    /// Stable machine-readable name of the rejection
    pub fn reason(&self) -> &'static str {
        match self {
            ShareError::StaleTemplate { .. } => "stale_template",
            ShareError::InvalidProof => "invalid_proof",
            ShareError::InsufficientDifficulty { .. } => "insufficient_difficulty",
            ShareError::DuplicateShare(_) => "duplicate_share",
            ShareError::SharesExhausted { .. } => "shares_exhausted",
            ShareError::InvalidPubkey(_) => "invalid_pubkey",
            ShareError::Internal(_) => "internal",
        }
    }
}

/// Result of an accepted share
#[derive(Debug, Clone, Serialize)]
pub struct ShareReceipt {
    /// The recorded share
    pub share: Share,

    pub is_block_find: bool,

    /// Unclaimed slots awarded to the block finder
    pub bonus_shares: u32,

    /// The bonus record, when the share closed the block early
    pub bonus: Option<Share>,

    /// Coin minted for the share
    pub coin: Option<Coin>,

    pub bonus_coin: Option<Coin>,
}

/// What miners hash against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Template {
    pub block_index: u64,

    #[schema(value_type = String)]
    pub previous_hash: Digest,

    pub share_difficulty: u32,

    pub block_difficulty: u32,

    pub shares_claimed: u32,

    pub shares_remaining: u32,

    pub is_closed: bool,

    /// Committed header bytes, hashed together with the decimal nonce
    pub header: String,
}

/// Summary of the local chain
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChainInfo {
    /// Index of the newest closed block
    pub height: u64,

    /// Number of closed blocks, genesis included
    pub blocks: usize,

    pub open_block_index: u64,

    /// Cumulative work, as a decimal string
    pub total_work: String,

    /// Shares recorded across all blocks, bonus records excluded
    pub total_shares: u64,

    pub share_difficulty: u32,

    pub block_difficulty: u32,

    pub shares_per_block: u32,

    /// Reward of the open block, in base units
    pub block_reward: u64,

    /// Value of one share of the open block, in base units
    pub share_value: u64,

    pub genesis_hash: String,

    pub tip_hash: String,

    pub consensus: String,
}

/// Closed blocks (genesis first) and the block open for shares
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainState {
    pub blocks: Vec<Block>,
    pub open: Block,
}

impl ChainState {
    /// Cumulative work of the closed blocks
    pub fn work(&self) -> u128 {
        self.blocks.iter().map(Block::work).sum()
    }

    /// Index of the newest closed block
    pub fn height(&self) -> u64 {
        self.open.index.saturating_sub(1)
    }

    fn block(&self, index: u64) -> Option<&Block> {
        if index == self.open.index {
            Some(&self.open)
        } else {
            self.blocks.get(index as usize).filter(|block| block.index == index)
        }
    }
}

/// Borrowed form of `ChainState` for persisting without cloning
#[derive(Serialize)]
struct LedgerView<'a> {
    blocks: &'a [Block],
    open: &'a Block,
}

/// Builds the open block that follows `blocks`
fn open_next(validator: &ChainValidator, blocks: &[Block], now: DateTime<Utc>) -> Result<Block, BlockchainError> {
    let tip = blocks.last().ok_or(ChainError::Empty)?;
    let previous_hash = tip
        .hash()
        .ok_or_else(|| BlockchainError::CorruptLedger(format!("block {} has no hash", tip.index)))?;

    let timestamp = now.max(tip.timestamp);
    let difficulties = validator.controller().next_difficulties(blocks, timestamp);
    let index = tip.index + 1;

    Ok(Block::open(
        index,
        previous_hash,
        timestamp,
        difficulties,
        validator.params().block_reward(index),
    ))
}

/// The share/block ledger
///
/// All chain state sits behind one mutex. Submissions recompute their proof
/// against a snapshot outside the lock and re-check staleness when they come
/// back to commit.
#[derive(Debug)]
pub struct Blockchain {
    validator: Arc<ChainValidator>,
    selector: ConsensusSelector,
    state: Mutex<ChainState>,
    coins: Arc<CoinLedger>,
    store: Option<LedgerFile>,
    clock: Arc<dyn Clock>,
}

impl Blockchain {
    /// Creates a blockchain, loading the persisted ledger if there is one
    ///
    /// # Arguments
    ///
    /// * `params` - Consensus parameters of the network
    /// * `coins` - The coin ledger share rewards are minted into
    /// * `store` - Where the ledger is persisted; `None` keeps it in memory
    /// * `policy` - How candidate chains from peers are treated
    /// * `clock` - Source of block timestamps
    ///
    /// # Returns
    ///
    /// The blockchain, or `CorruptLedger` if a stored ledger does not parse or
    /// does not validate
    pub fn new(
        params: ChainParams,
        coins: Arc<CoinLedger>,
        store: Option<LedgerFile>,
        policy: Arc<dyn ConsensusPolicy>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, BlockchainError> {
        let validator = Arc::new(ChainValidator::new(params)?);
        let selector = ConsensusSelector::new(validator.clone(), policy);
        let now = clock.now();

        let loaded = match &store {
            Some(file) => match file.load::<ChainState>() {
                Ok(state) => state,
                Err(StorageError::Corrupt { path, reason }) => {
                    return Err(BlockchainError::CorruptLedger(format!("{}: {}", path, reason)));
                }
                Err(e) => return Err(e.into()),
            },
            None => None,
        };

        let state = match loaded {
            Some(state) => {
                validator
                    .validate_state(&state.blocks, &state.open, now)
                    .map_err(|e| BlockchainError::CorruptLedger(e.to_string()))?;
                info!(
                    "Loaded ledger: height {}, open block {} with {} shares",
                    state.height(),
                    state.open.index,
                    state.open.shares_claimed
                );
                state
            }
            None => {
                let blocks = vec![validator.genesis().clone()];
                let open = open_next(&validator, &blocks, now)?;
                if let Some(file) = &store {
                    file.save(&LedgerView { blocks: &blocks, open: &open })?;
                }
                info!("Created new ledger from genesis");
                ChainState { blocks, open }
            }
        };

        Ok(Blockchain {
            validator,
            selector,
            state: Mutex::new(state),
            coins,
            store,
            clock,
        })
    }

    /// An in-memory, single-authority blockchain on the wall clock
    pub fn in_memory(params: ChainParams, coins: Arc<CoinLedger>) -> Result<Self, BlockchainError> {
        Self::new(params, coins, None, Arc::new(AuthoritativeServer), Arc::new(SystemClock))
    }

    fn lock(&self) -> Result<MutexGuard<'_, ChainState>, BlockchainError> {
        self.state
            .lock()
            .map_err(|_| BlockchainError::SystemError("chain state lock poisoned".to_string()))
    }

    fn persist(&self, blocks: &[Block], open: &Block) -> Result<(), BlockchainError> {
        if let Some(file) = &self.store {
            file.save(&LedgerView { blocks, open })?;
        }
        Ok(())
    }

    pub fn params(&self) -> &ChainParams {
        self.validator.params()
    }

    pub fn validator(&self) -> &Arc<ChainValidator> {
        &self.validator
    }

    pub fn coins(&self) -> &Arc<CoinLedger> {
        &self.coins
    }

    pub fn consensus(&self) -> &'static str {
        self.selector.policy_name()
    }

    /// The template of the open block
    pub fn template(&self) -> Result<Template, BlockchainError> {
        let state = self.lock()?;
        let open = &state.open;

        Ok(Template {
            block_index: open.index,
            previous_hash: open.previous_hash,
            share_difficulty: open.share_difficulty,
            block_difficulty: open.block_difficulty,
            shares_claimed: open.shares_claimed,
            shares_remaining: open.shares_remaining(self.params().shares_per_block),
            is_closed: open.is_closed,
            header: open.header(),
        })
    }

    pub fn height(&self) -> Result<u64, BlockchainError> {
        Ok(self.lock()?.height())
    }

    pub fn work(&self) -> Result<u128, BlockchainError> {
        Ok(self.lock()?.work())
    }

    /// A copy of the whole chain state
    pub fn snapshot(&self) -> Result<ChainState, BlockchainError> {
        Ok(self.lock()?.clone())
    }

    /// A block by index, closed or open
    pub fn block(&self, index: u64) -> Result<Option<Block>, BlockchainError> {
        Ok(self.lock()?.block(index).cloned())
    }

    /// Admits a coin exported by another node
    ///
    /// Every mint the coin traces back to has to be a share recorded on this
    /// chain with the same coin id, owner, value and proof, and the proof has
    /// to meet the share difficulty of its block.
    pub fn import_coin(&self, serialized: &str) -> Result<Coin, CoinError> {
        self.coins.import(serialized, |origin| self.check_origin(origin))
    }

    fn check_origin(&self, origin: &MintOrigin) -> Result<(), String> {
        let state = self.lock().map_err(|e| e.to_string())?;
        let block = state
            .block(origin.block_height)
            .ok_or_else(|| format!("block {} is not on this chain", origin.block_height))?;
        let share = block
            .shares
            .iter()
            .find(|share| share.share_index == origin.share_index && share.is_bonus == origin.is_bonus)
            .ok_or_else(|| format!("block {} has no share {}", block.index, origin.share_index))?;

        if share.coin_id != origin.coin_id || share.miner_pubkey != origin.owner || share.value != origin.value {
            return Err(format!(
                "mint {} does not match share {} of block {}",
                origin.coin_id, share.share_index, block.index
            ));
        }
        if share.nonce != origin.proof.nonce
            || share.hash != origin.proof.hash
            || !meets(block.share_difficulty, &origin.proof.hash)
        {
            return Err(format!(
                "mining proof of {} does not match share {} of block {}",
                origin.coin_id, share.share_index, block.index
            ));
        }

        Ok(())
    }

    pub fn info(&self) -> Result<ChainInfo, BlockchainError> {
        let state = self.lock()?;
        let params = self.params();
        let hex = |block: Option<&Block>| block.and_then(Block::hash).map(|h| h.to_hex()).unwrap_or_default();

        Ok(ChainInfo {
            height: state.height(),
            blocks: state.blocks.len(),
            open_block_index: state.open.index,
            total_work: state.work().to_string(),
            total_shares: state
                .blocks
                .iter()
                .chain(std::iter::once(&state.open))
                .map(|block| block.shares.iter().filter(|s| !s.is_bonus).count() as u64)
                .sum(),
            share_difficulty: state.open.share_difficulty,
            block_difficulty: state.open.block_difficulty,
            shares_per_block: params.shares_per_block,
            block_reward: state.open.reward,
            share_value: params.share_value(state.open.index),
            genesis_hash: hex(state.blocks.first()),
            tip_hash: hex(state.blocks.last()),
            consensus: self.consensus().to_string(),
        })
    }

    /// Checks that every block links to its parent
    ///
    /// A cheap liveness check; full validation recomputes proofs.
    pub fn verify_links(&self) -> Result<bool, BlockchainError> {
        let links = |parent: &Block, child: &Block| {
            parent.hash() == Some(child.previous_hash) && child.index == parent.index + 1
        };

        let state = self.lock()?;
        let closed = state.blocks.windows(2).all(|pair| links(&pair[0], &pair[1]));
        let open = state.blocks.last().map(|tip| links(tip, &state.open)).unwrap_or(false);
        Ok(closed && open)
    }

    /// Receipt of a share that is already recorded
    fn receipt_for(&self, block: &Block, share: &Share) -> ShareReceipt {
        let is_block_find = block
            .closing_proof
            .as_ref()
            .map(|proof| proof.nonce == share.nonce && proof.hash == share.hash)
            .unwrap_or(false);
        let bonus = if is_block_find {
            block.bonus_after(share.share_index).cloned()
        } else {
            None
        };
        let bonus_shares = if is_block_find {
            self.params().shares_per_block.saturating_sub(share.share_index + 1)
        } else {
            0
        };

        ShareReceipt {
            share: share.clone(),
            is_block_find,
            bonus_shares,
            bonus_coin: bonus.as_ref().and_then(|b| self.coins.get(&b.coin_id)),
            bonus,
            coin: self.coins.get(&share.coin_id),
        }
    }

    fn check_duplicate(&self, state: &ChainState, block_index: u64, nonce: u64, hash: &Digest) -> Result<(), ShareError> {
        let recorded = state
            .block(block_index)
            .and_then(|block| block.find_share(nonce, hash).map(|share| (block, share)));

        match recorded {
            Some((block, share)) => Err(ShareError::DuplicateShare(Box::new(self.receipt_for(block, share)))),
            None => Ok(()),
        }
    }

    /// Validates and records a share
    ///
    /// # Arguments
    ///
    /// * `block_index` - The block the miner was working on
    /// * `miner` - Who gets the coin
    /// * `nonce` - The nonce that was hashed
    /// * `hash` - The digest the miner claims
    ///
    /// # Returns
    ///
    /// The receipt for the recorded share, including the coins minted for it.
    /// A share meeting the block difficulty also closes the block, mints the
    /// bonus for the remaining slots and opens the next block.
    pub fn submit_share(
        &self,
        block_index: u64,
        miner: &PublicKey,
        nonce: u64,
        hash: Digest,
    ) -> Result<ShareReceipt, ShareError> {
        miner
            .to_verifying_key()
            .map_err(|e| ShareError::InvalidPubkey(e.to_string()))?;

        let (header, previous_hash, share_difficulty, block_difficulty) = {
            let state = self.lock()?;
            self.check_duplicate(&state, block_index, nonce, &hash)?;

            let open = &state.open;
            if open.index != block_index || open.is_closed {
                return Err(ShareError::StaleTemplate {
                    submitted: block_index,
                    current: open.index,
                });
            }
            (open.header(), open.previous_hash, open.share_difficulty, open.block_difficulty)
        };

        let digest = self
            .validator
            .engine()
            .compute(header.as_bytes(), nonce, &previous_hash)
            .map_err(BlockchainError::from)?;
        if digest != hash {
            return Err(ShareError::InvalidProof);
        }
        if !meets(share_difficulty, &hash) {
            return Err(ShareError::InsufficientDifficulty {
                required: share_difficulty,
            });
        }
        let is_block_find = meets(block_difficulty, &hash);

        let mut state = self.lock()?;
        self.check_duplicate(&state, block_index, nonce, &hash)?;

        if state.open.index != block_index || state.open.is_closed || state.open.header() != header {
            return Err(ShareError::StaleTemplate {
                submitted: block_index,
                current: state.open.index,
            });
        }
        if !is_block_find && state.open.shares_claimed + 1 >= self.params().shares_per_block {
            return Err(ShareError::SharesExhausted { block_index });
        }

        self.commit(&mut state, miner, nonce, hash, is_block_find)
    }

    /// Claims the next slot, mints and persists; runs under the state lock
    fn commit(
        &self,
        state: &mut ChainState,
        miner: &PublicKey,
        nonce: u64,
        hash: Digest,
        is_block_find: bool,
    ) -> Result<ShareReceipt, ShareError> {
        let params = self.params();
        let spb = params.shares_per_block;
        let mut open = state.open.clone();

        let share_index = open.shares_claimed;
        let share_value = params.share_value(open.index);
        let bonus_shares = if is_block_find { spb - (share_index + 1) } else { 0 };
        let proof = MiningProof {
            nonce,
            hash,
            share_difficulty: open.share_difficulty,
            block_difficulty: open.block_difficulty,
        };

        let mut requests = vec![MintRequest {
            owner: miner.clone(),
            value: share_value,
            proof: proof.clone(),
            block_height: open.index,
            share_index,
            is_bonus: false,
        }];
        if bonus_shares > 0 {
            requests.push(MintRequest {
                owner: miner.clone(),
                value: u64::from(bonus_shares) * share_value,
                proof,
                block_height: open.index,
                share_index: share_index + 1,
                is_bonus: true,
            });
        }

        let minted = self.coins.mint_batch(requests).map_err(BlockchainError::from)?;
        let minted_ids: Vec<String> = minted.iter().map(|coin| coin.coin_id.clone()).collect();
        let mut minted = minted.into_iter();
        let coin = minted.next();
        let bonus_coin = minted.next();

        let now = self.clock.now();
        let share = Share {
            block_index: open.index,
            share_index,
            miner_pubkey: miner.clone(),
            nonce,
            hash,
            is_bonus: false,
            value: share_value,
            coin_id: coin.as_ref().map(|c| c.coin_id.clone()).unwrap_or_default(),
            timestamp: now,
        };
        open.shares.push(share.clone());
        open.shares_claimed += 1;

        let mut bonus = None;
        if is_block_find {
            if let Some(bonus_coin) = &bonus_coin {
                let record = Share {
                    share_index: share_index + 1,
                    is_bonus: true,
                    value: bonus_coin.value,
                    coin_id: bonus_coin.coin_id.clone(),
                    ..share.clone()
                };
                open.shares.push(record.clone());
                bonus = Some(record);
            }
            open.shares_claimed = spb;
            open.is_closed = true;
            open.closing_proof = Some(ClosingProof {
                miner_pubkey: miner.clone(),
                nonce,
                hash,
            });
        }

        let committed = if is_block_find {
            state.blocks.push(open);
            let next = open_next(&self.validator, &state.blocks, now)
                .and_then(|next| self.persist(&state.blocks, &next).map(|_| next));
            match next {
                Ok(next) => {
                    state.open = next;
                    Ok(())
                }
                Err(e) => {
                    state.blocks.pop();
                    Err(e)
                }
            }
        } else {
            self.persist(&state.blocks, &open).map(|_| state.open = open)
        };

        if let Err(e) = committed {
            warn!("Failed to commit share {} of block {}: {}", share_index, share.block_index, e);
            self.coins.rollback(&minted_ids);
            return Err(e.into());
        }

        if is_block_find {
            info!(
                "Block {} found by {} with share {} (hash {}, {} bonus shares); block {} open at share difficulty {}",
                share.block_index,
                miner.short(),
                share_index,
                hash.short(),
                bonus_shares,
                state.open.index,
                state.open.share_difficulty
            );
        } else {
            debug!(
                "Accepted share {} of block {} from {}",
                share_index,
                share.block_index,
                miner.short()
            );
        }

        Ok(ShareReceipt {
            share,
            is_block_find,
            bonus_shares,
            bonus,
            coin,
            bonus_coin,
        })
    }

    /// Offers a peer's closed blocks to the consensus selector
    ///
    /// The candidate is validated outside the lock, and only when its claimed
    /// work could win under the policy. On adoption the local closed blocks
    /// are replaced wholesale and a fresh block is opened on the new tip.
    ///
    /// Coins minted for the abandoned blocks stay in the coin ledger and can
    /// still be transferred locally. They are no longer backed by a share on
    /// the chain, so `import_coin` refuses them here and on every node that
    /// follows this chain.
    pub fn reconcile(&self, candidate: Vec<Block>) -> Result<Decision, BlockchainError> {
        let local_work = self.lock()?.work();
        let now = self.clock.now();

        let decision = self.selector.evaluate(local_work, &candidate, now)?;
        let candidate_work = match decision {
            Decision::Adopt { candidate_work, .. } => candidate_work,
            Decision::KeepLocal { .. } => return Ok(decision),
        };

        let mut state = self.lock()?;
        let decision = self.selector.decide(state.work(), candidate_work);
        if !decision.is_adopt() {
            return Ok(decision);
        }

        let open = open_next(&self.validator, &candidate, now)?;
        self.persist(&candidate, &open)?;

        let fork = state
            .blocks
            .iter()
            .zip(&candidate)
            .take_while(|(local, theirs)| local.hash() == theirs.hash())
            .count();
        let orphaned: usize = state.blocks[fork..]
            .iter()
            .chain(std::iter::once(&state.open))
            .map(|block| block.shares.len())
            .sum();
        if orphaned > 0 {
            warn!(
                "Abandoning blocks {}..={} with {} coins minted on them; those coins stay in the ledger",
                state.blocks.get(fork).map(|block| block.index).unwrap_or(state.open.index),
                state.open.index,
                orphaned
            );
        }
        info!(
            "Adopted chain with height {} (work {} -> {})",
            candidate.len().saturating_sub(1),
            state.work(),
            candidate_work
        );

        state.blocks = candidate;
        state.open = open;
        Ok(decision)
    }

    /// Discards every block and coin and starts again from genesis
    pub fn reset(&self) -> Result<(), BlockchainError> {
        let mut state = self.lock()?;
        let blocks = vec![self.validator.genesis().clone()];
        let open = open_next(&self.validator, &blocks, self.clock.now())?;

        self.coins.reset()?;
        self.persist(&blocks, &open)?;
        *state = ChainState { blocks, open };

        warn!("Blockchain reset to genesis");
        Ok(())
    }
}
