use chrono::{DateTime, Utc};
use log::info;

use super::block::Block;

/// Retargeting rules
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DifficultyParams {
    /// Number of closed blocks between retargets
    pub retarget_interval: u64,

    /// Desired time between block closings, in seconds
    pub target_block_time_secs: i64,

    /// Block difficulty = share difficulty + offset
    pub block_offset: u32,

    /// Lower bound for the share difficulty
    pub min_difficulty: u32,

    /// Upper bound for the share difficulty
    pub max_difficulty: u32,

    /// Largest step per retarget, as a percentage of the old value (at least one bit)
    pub max_step_percent: u32,
}

impl Default for DifficultyParams {
    fn default() -> Self {
        DifficultyParams {
            retarget_interval: 10,
            target_block_time_secs: 900,
            block_offset: 8,
            min_difficulty: 1,
            max_difficulty: 48,
            max_step_percent: 25,
        }
    }
}

/// The pair of difficulties active for one block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Difficulties {
    pub share: u32,
    pub block: u32,
}

/// Derives the difficulties of the next block from observed closing times
#[derive(Debug, Clone)]
pub struct DifficultyController {
    params: DifficultyParams,
    max_future_drift_secs: i64,
}

impl DifficultyController {
    pub fn new(params: DifficultyParams, max_future_drift_secs: i64) -> Self {
        DifficultyController {
            params,
            max_future_drift_secs,
        }
    }

    pub fn params(&self) -> &DifficultyParams {
        &self.params
    }

    /// Couples a share difficulty with its block difficulty
    pub fn paired(&self, share: u32) -> Difficulties {
        Difficulties {
            share,
            block: share + self.params.block_offset,
        }
    }

    /// Largest allowed change, in bits, away from `old`
    pub fn max_step(&self, old: u32) -> u32 {
        (old * self.params.max_step_percent / 100).max(1)
    }

    /// One retarget step
    ///
    /// `error = observed_mean / target`; every halving of the error adds one
    /// bit of difficulty. The step is bounded by `max_step` and the result by
    /// `[min_difficulty, max_difficulty]`.
    pub fn adjust(&self, old: u32, observed_mean_secs: f64) -> u32 {
        let target = self.params.target_block_time_secs.max(1) as f64;
        let error = observed_mean_secs.max(1.0) / target;

        let raw = (-error.log2()).round();
        let bound = i64::from(self.max_step(old));
        let step = (raw as i64).clamp(-bound, bound);

        let next = i64::from(old) + step;
        next.clamp(
            i64::from(self.params.min_difficulty),
            i64::from(self.params.max_difficulty),
        ) as u32
    }

    /// Difficulties for the block that follows the last block of `chain`
    ///
    /// `chain` is the sequence of closed blocks starting at genesis. The
    /// window is the last `retarget_interval` blocks after genesis; it spans
    /// from the opening of its first block to the closing share of the tip.
    pub fn next_difficulties(&self, chain: &[Block], now: DateTime<Utc>) -> Difficulties {
        let tip = match chain.last() {
            Some(tip) => tip,
            None => return self.paired(self.params.min_difficulty),
        };

        let current = Difficulties {
            share: tip.share_difficulty,
            block: tip.block_difficulty,
        };

        let interval = self.params.retarget_interval.max(1);
        if tip.index == 0 || tip.index % interval != 0 || (chain.len() as u64) < interval + 1 {
            return current;
        }

        let window = &chain[chain.len() - interval as usize..];
        let timestamps = self.sanitized_timestamps(window_times(window), now);
        let elapsed = match (timestamps.first(), timestamps.last()) {
            (Some(first), Some(last)) => last - first,
            _ => return current,
        };
        let mean = elapsed as f64 / interval as f64;

        let share = self.adjust(current.share, mean);
        if share != current.share {
            info!(
                "Retarget at block {}: mean {:.1}s over {} blocks, share difficulty {} -> {}",
                tip.index, mean, interval, current.share, share
            );
        }

        self.paired(share)
    }

    /// Unix seconds of `times`, never earlier than their predecessor and
    /// never beyond `now + max_future_drift`
    pub fn sanitized_timestamps<I>(&self, times: I, now: DateTime<Utc>) -> Vec<i64>
    where
        I: IntoIterator<Item = DateTime<Utc>>,
    {
        let ceiling = now.timestamp() + self.max_future_drift_secs;
        let mut out: Vec<i64> = Vec::new();

        for time in times {
            let mut t = time.timestamp().min(ceiling);
            if let Some(previous) = out.last() {
                t = t.max(*previous);
            }
            out.push(t);
        }

        out
    }
}

/// Opening time of the first block, then the closing time of each block
///
/// A block without a closing share counts as closed when it opened.
fn window_times(window: &[Block]) -> Vec<DateTime<Utc>> {
    window
        .first()
        .map(|first| first.timestamp)
        .into_iter()
        .chain(window.iter().map(|block| block.closed_at().unwrap_or(block.timestamp)))
        .collect()
}
