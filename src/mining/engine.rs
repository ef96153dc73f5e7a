use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde::Serialize;
use thiserror::Error;

use super::sink::{Rejection, ShareSink, SinkError, SubmitOutcome};
use crate::api::schema::SubmitShareRequest;
use crate::blockchain::hash::{meets, Digest, HashEngine, HashError};
use crate::blockchain::{PublicKey, Template};

/// Errors that stop the miner
#[derive(Debug, Error)]
pub enum MinerError {
    #[error("Hash error: {0}")]
    Hash(#[from] HashError),

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("Giving up after {attempts} failed attempts to reach the ledger: {last}")]
    SinkUnavailable { attempts: u32, last: SinkError },

    #[error("Share rejected {count} times in a row ({rejection:?}); miner and ledger disagree")]
    RepeatedRejection { count: u32, rejection: Rejection },

    #[error("Search task failed: {0}")]
    Task(String),
}

/// Cooperative stop signal shared by workers
///
/// Workers check it between hashes, so a cancelled search ends after each
/// worker's in-flight hash.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Running counters of a miner
#[derive(Debug, Default)]
pub struct MinerStats {
    hashes: AtomicU64,
    accepted: AtomicU64,
    blocks_found: AtomicU64,
    rejected: AtomicU64,
}

/// Point-in-time view of `MinerStats`
#[derive(Debug, Clone, Serialize)]
pub struct MinerStatsSnapshot {
    pub hashes: u64,
    pub shares_accepted: u64,
    pub blocks_found: u64,
    pub rejected: u64,
    /// Hashes per second since the miner started
    pub hash_rate: f64,
}

impl MinerStats {
    pub fn snapshot(&self, elapsed: Duration) -> MinerStatsSnapshot {
        let hashes = self.hashes.load(Ordering::Relaxed);
        let secs = elapsed.as_secs_f64();

        MinerStatsSnapshot {
            hashes,
            shares_accepted: self.accepted.load(Ordering::Relaxed),
            blocks_found: self.blocks_found.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            hash_rate: if secs > 0.0 { hashes as f64 / secs } else { 0.0 },
        }
    }
}

/// Searches nonces for a digest meeting `target`
///
/// Worker `w` of `threads` tries `base + w`, `base + w + threads`, ... The
/// first worker to hit cancels `cancel`, which stops its siblings. Returns
/// `None` when the search was cancelled from outside before any hit.
pub fn search(
    engine: &HashEngine,
    header: &[u8],
    previous_hash: &Digest,
    target: u32,
    threads: usize,
    base: u64,
    cancel: &CancelToken,
    stats: &MinerStats,
) -> Result<Option<(u64, Digest)>, HashError> {
    let threads = threads.max(1);
    let step = threads as u64;
    let found: Mutex<Option<Result<(u64, Digest), HashError>>> = Mutex::new(None);

    thread::scope(|scope| {
        for worker in 0..threads {
            let found = &found;
            scope.spawn(move || {
                let mut nonce = base.wrapping_add(worker as u64);

                while !cancel.is_cancelled() {
                    let result = engine.compute(header, nonce, previous_hash);
                    stats.hashes.fetch_add(1, Ordering::Relaxed);

                    let outcome = match result {
                        Ok(hash) if meets(target, &hash) => Ok((nonce, hash)),
                        Ok(_) => {
                            nonce = nonce.wrapping_add(step);
                            continue;
                        }
                        Err(e) => Err(e),
                    };

                    if let Ok(mut slot) = found.lock() {
                        if slot.is_none() {
                            *slot = Some(outcome);
                        }
                    }
                    cancel.cancel();
                    break;
                }
            });
        }
    });

    found.into_inner().ok().flatten().transpose()
}

/// Miner settings
#[derive(Debug, Clone)]
pub struct MinerConfig {
    /// Worker threads per search
    pub threads: usize,

    /// Key the mined coins are paid to
    pub miner: PublicKey,

    /// How often the template watcher polls for a newer template
    pub poll_interval: Duration,

    /// Consecutive hard rejections tolerated before giving up
    pub max_rejections: u32,

    /// Consecutive transport failures tolerated before giving up
    pub max_transport_failures: u32,

    /// Pause after a transport failure
    pub retry_backoff: Duration,
}

impl MinerConfig {
    pub fn new(miner: PublicKey, threads: usize) -> Self {
        MinerConfig {
            threads,
            miner,
            poll_interval: Duration::from_millis(500),
            max_rejections: 5,
            max_transport_failures: 10,
            retry_backoff: Duration::from_secs(2),
        }
    }
}

/// Result of one mining round
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    /// A share was found and submitted
    Submitted(SubmitOutcome),

    /// The template moved on, or the miner was stopped, before a hit
    Interrupted,

    /// No open block to mine
    Idle,
}

/// Difficulty worth searching for under `template`
///
/// With a single slot left only a block solution can be recorded.
pub fn round_target(template: &Template) -> u32 {
    if template.shares_remaining <= 1 {
        template.block_difficulty
    } else {
        template.share_difficulty
    }
}

/// Whether `current` makes a search against `old` pointless
fn moved_on(old: &Template, current: &Template, target: u32) -> bool {
    current.block_index != old.block_index
        || current.is_closed
        || current.header != old.header
        || round_target(current) != target
}

/// Polls the sink and cancels `round` once the template moves on or `stop` fires
async fn watch_template(
    sink: Arc<dyn ShareSink>,
    template: Template,
    target: u32,
    stop: CancelToken,
    round: CancelToken,
    poll: Duration,
) {
    loop {
        tokio::time::sleep(poll).await;

        if round.is_cancelled() {
            return;
        }
        if stop.is_cancelled() {
            round.cancel();
            return;
        }

        match sink.template().await {
            Ok(current) if moved_on(&template, &current, target) => {
                debug!(
                    "Template moved from block {} to {}, restarting search",
                    template.block_index, current.block_index
                );
                round.cancel();
                return;
            }
            Ok(_) => {}
            Err(e) => debug!("Template poll failed: {}", e),
        }
    }
}

/// Multithreaded miner feeding a share sink
pub struct Miner {
    engine: Arc<HashEngine>,
    sink: Arc<dyn ShareSink>,
    config: MinerConfig,
    stats: Arc<MinerStats>,
    started: Instant,
}

impl Miner {
    pub fn new(engine: HashEngine, sink: Arc<dyn ShareSink>, config: MinerConfig) -> Self {
        Miner {
            engine: Arc::new(engine),
            sink,
            config,
            stats: Arc::new(MinerStats::default()),
            started: Instant::now(),
        }
    }

    pub fn stats(&self) -> MinerStatsSnapshot {
        self.stats.snapshot(self.started.elapsed())
    }

    /// Fetches a template, searches it and submits the hit
    pub async fn round(&self, stop: &CancelToken) -> Result<RoundOutcome, MinerError> {
        let template = self.sink.template().await?;
        if template.is_closed {
            tokio::time::sleep(self.config.poll_interval).await;
            return Ok(RoundOutcome::Idle);
        }

        let target = round_target(&template);
        let round = CancelToken::new();
        let watcher = tokio::spawn(watch_template(
            self.sink.clone(),
            template.clone(),
            target,
            stop.clone(),
            round.clone(),
            self.config.poll_interval,
        ));

        let engine = self.engine.clone();
        let stats = self.stats.clone();
        let threads = self.config.threads;
        let header = template.header.clone();
        let previous_hash = template.previous_hash;
        let base: u64 = rand::random();
        let token = round.clone();

        debug!(
            "Searching block {} at difficulty {} with {} threads",
            template.block_index, target, threads
        );
        let hit = tokio::task::spawn_blocking(move || {
            search(&engine, header.as_bytes(), &previous_hash, target, threads, base, &token, &stats)
        })
        .await;
        round.cancel();
        watcher.abort();

        let (nonce, hash) = match hit.map_err(|e| MinerError::Task(e.to_string()))?? {
            Some(hit) => hit,
            None => return Ok(RoundOutcome::Interrupted),
        };

        let submission = SubmitShareRequest {
            miner_pubkey: self.config.miner.to_string(),
            nonce,
            hash: hash.to_hex(),
            block_index: template.block_index,
        };
        let outcome = self.sink.submit(&submission).await?;

        match &outcome {
            SubmitOutcome::Accepted(accepted) => {
                self.stats.accepted.fetch_add(1, Ordering::Relaxed);
                if accepted.is_block_find {
                    self.stats.blocks_found.fetch_add(1, Ordering::Relaxed);
                    info!(
                        "Found block {} with share {} ({} bonus shares)",
                        template.block_index, accepted.share_index, accepted.bonus_shares
                    );
                } else {
                    debug!("Share {} accepted in block {}", accepted.share_index, template.block_index);
                }
            }
            SubmitOutcome::Rejected(rejection) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                debug!("Share for block {} rejected: {:?}", template.block_index, rejection);
            }
        }

        Ok(RoundOutcome::Submitted(outcome))
    }

    /// Mines until `stop` is cancelled
    ///
    /// Stale, duplicate and exhausted rejections are expected and only lead
    /// to a fresh template. A proof the ledger considers invalid means the
    /// miner and ledger disagree about the hash function; after a few in a
    /// row the miner gives up, as it does after repeated transport failures.
    pub async fn run(&self, stop: CancelToken) -> Result<(), MinerError> {
        let mut hard_rejections = 0u32;
        let mut transport_failures = 0u32;

        info!(
            "Miner started with {} threads, paying {}",
            self.config.threads,
            self.config.miner.short()
        );

        while !stop.is_cancelled() {
            match self.round(&stop).await {
                Ok(RoundOutcome::Submitted(SubmitOutcome::Rejected(rejection))) if !rejection.is_soft() => {
                    transport_failures = 0;
                    hard_rejections += 1;
                    error!("Share rejected as {:?} ({} in a row)", rejection, hard_rejections);
                    if hard_rejections >= self.config.max_rejections {
                        return Err(MinerError::RepeatedRejection {
                            count: hard_rejections,
                            rejection,
                        });
                    }
                }
                Ok(RoundOutcome::Submitted(SubmitOutcome::Accepted(_))) => {
                    transport_failures = 0;
                    hard_rejections = 0;
                }
                Ok(_) => {
                    transport_failures = 0;
                }
                Err(MinerError::Sink(e)) => {
                    transport_failures += 1;
                    warn!("Ledger unreachable ({} in a row): {}", transport_failures, e);
                    if transport_failures >= self.config.max_transport_failures {
                        return Err(MinerError::SinkUnavailable {
                            attempts: transport_failures,
                            last: e,
                        });
                    }
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
                Err(e) => return Err(e),
            }
        }

        let stats = self.stats();
        info!(
            "Miner stopped: {} hashes, {} shares, {} blocks, {:.1} H/s",
            stats.hashes, stats.shares_accepted, stats.blocks_found, stats.hash_rate
        );
        Ok(())
    }
}
