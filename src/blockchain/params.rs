use super::difficulty::DifficultyParams;
use super::hash::PowParams;

/// Number of base units in one whole coin
pub const COIN: u64 = 100_000_000;

/// Message committed into the genesis header
pub const GENESIS_MESSAGE: &str = "Block Shares Genesis - every CPU gets a slice";

/// Consensus parameters of a network
///
/// Every node on a network must run with identical values; two nodes with
/// different parameters will disagree about which proofs are valid.
#[derive(Debug, Clone)]
pub struct ChainParams {
    /// Number of share slots a block's reward is divided into
    pub shares_per_block: u32,

    /// Reward of the first era, in base units
    pub initial_block_reward: u64,

    /// Number of blocks between reward halvings
    pub halving_interval: u64,

    /// Hard cap on the total number of base units ever minted
    pub max_supply: u64,

    /// Share difficulty of the genesis era (leading zero bits)
    pub initial_share_difficulty: u32,

    /// Retargeting rules
    pub difficulty: DifficultyParams,

    /// Memory-hard hash parameters
    pub pow: PowParams,

    /// How far past the local clock a block timestamp may lie
    pub max_future_drift_secs: i64,

    /// Fixed genesis timestamp (unix seconds)
    pub genesis_timestamp: i64,
}

impl Default for ChainParams {
    fn default() -> Self {
        ChainParams {
            shares_per_block: 100,
            initial_block_reward: 50 * COIN,
            halving_interval: 210_000,
            max_supply: 21_000_000 * COIN,
            initial_share_difficulty: 4,
            difficulty: DifficultyParams::default(),
            pow: PowParams::default(),
            max_future_drift_secs: 2 * 60 * 60,
            genesis_timestamp: 1_703_548_800,
        }
    }
}

impl ChainParams {
    /// Total reward released by the block at `height`, in base units
    ///
    /// The halved reward is rounded down to a multiple of `shares_per_block`
    /// so that shares plus bonus always add up to the block reward exactly.
    pub fn block_reward(&self, height: u64) -> u64 {
        let halvings = height / self.halving_interval.max(1);
        if halvings >= 64 {
            return 0;
        }

        let shares = u64::from(self.shares_per_block.max(1));
        let raw = self.initial_block_reward >> halvings;
        (raw / shares) * shares
    }

    /// Value of a single share at `height`, in base units
    pub fn share_value(&self, height: u64) -> u64 {
        self.block_reward(height) / u64::from(self.shares_per_block.max(1))
    }

    /// Block difficulty of the genesis era
    pub fn initial_block_difficulty(&self) -> u32 {
        self.initial_share_difficulty + self.difficulty.block_offset
    }

    /// Light parameters for tests: cheap Argon2 and tiny difficulties
    #[cfg(test)]
    pub fn testing() -> Self {
        ChainParams {
            initial_share_difficulty: 1,
            difficulty: DifficultyParams {
                retarget_interval: 2,
                target_block_time_secs: 60,
                block_offset: 4,
                min_difficulty: 1,
                max_difficulty: 16,
                max_step_percent: 25,
            },
            pow: PowParams {
                memory_kib: 8,
                time_cost: 1,
                lanes: 1,
            },
            ..ChainParams::default()
        }
    }
}

/// Converts base units to whole coins for display
pub fn units_to_coins(units: u64) -> f64 {
    units as f64 / COIN as f64
}
