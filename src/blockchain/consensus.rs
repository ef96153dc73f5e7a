use std::fmt::Debug;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info};

use super::block::Block;
use super::validator::{ChainError, ChainValidator};

/// Rule deciding whether a valid candidate chain replaces the local one
pub trait ConsensusPolicy: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    fn should_adopt(&self, local_work: u128, candidate_work: u128) -> bool;
}

/// Single-authority deployment: the local ledger is final
#[derive(Debug, Clone, Copy, Default)]
pub struct AuthoritativeServer;

impl ConsensusPolicy for AuthoritativeServer {
    fn name(&self) -> &'static str {
        "authoritative"
    }

    fn should_adopt(&self, _local_work: u128, _candidate_work: u128) -> bool {
        false
    }
}

/// Peer deployment: the chain with strictly more cumulative work wins
#[derive(Debug, Clone, Copy, Default)]
pub struct WeightedChainSelection;

impl ConsensusPolicy for WeightedChainSelection {
    fn name(&self) -> &'static str {
        "weighted"
    }

    fn should_adopt(&self, local_work: u128, candidate_work: u128) -> bool {
        candidate_work > local_work
    }
}

/// Outcome of evaluating a candidate chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    KeepLocal { local_work: u128, candidate_work: u128 },
    Adopt { local_work: u128, candidate_work: u128 },
}

impl Decision {
    pub fn is_adopt(&self) -> bool {
        matches!(self, Decision::Adopt { .. })
    }
}

/// Work a chain claims, without checking any proof
pub fn claimed_work(blocks: &[Block]) -> u128 {
    blocks.iter().fold(0u128, |acc, block| acc.saturating_add(block.work()))
}

/// Validates candidates and applies the policy to valid ones
///
/// A candidate is taken whole or not at all; nothing is spliced.
#[derive(Debug, Clone)]
pub struct ConsensusSelector {
    validator: Arc<ChainValidator>,
    policy: Arc<dyn ConsensusPolicy>,
}

impl ConsensusSelector {
    pub fn new(validator: Arc<ChainValidator>, policy: Arc<dyn ConsensusPolicy>) -> Self {
        ConsensusSelector { validator, policy }
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Validates `candidate` and compares it with `local_work`
    ///
    /// The work the candidate claims is summed first; a candidate the policy
    /// would turn down even at that figure is kept out without being
    /// validated.
    pub fn evaluate(&self, local_work: u128, candidate: &[Block], now: DateTime<Utc>) -> Result<Decision, ChainError> {
        let claimed = claimed_work(candidate);
        if !self.policy.should_adopt(local_work, claimed) {
            debug!(
                "Skipping validation of candidate claiming work {} (local work {}, {} policy)",
                claimed,
                local_work,
                self.policy.name()
            );
            return Ok(Decision::KeepLocal {
                local_work,
                candidate_work: claimed,
            });
        }

        let candidate_work = self.validator.validate(candidate, now)?;
        Ok(self.decide(local_work, candidate_work))
    }

    /// Applies the policy to an already validated candidate
    pub fn decide(&self, local_work: u128, candidate_work: u128) -> Decision {
        if self.policy.should_adopt(local_work, candidate_work) {
            info!(
                "Candidate chain has more work ({} > {}), adopting under {} policy",
                candidate_work,
                local_work,
                self.policy.name()
            );
            Decision::Adopt {
                local_work,
                candidate_work,
            }
        } else {
            debug!(
                "Keeping local chain (local work {}, candidate work {})",
                local_work, candidate_work
            );
            Decision::KeepLocal {
                local_work,
                candidate_work,
            }
        }
    }
}
