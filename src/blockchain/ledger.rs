use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::coin::{check_split, Coin, CoinEvent, MiningProof, MintOrigin, ProvenanceError};
use super::crypto::{verify_signature, CryptoError, DigitalSignature, PublicKey};
use super::storage::{CoinStore, StorageError};

/// Errors that can occur during coin operations
#[derive(Debug, Error)]
pub enum CoinError {
    #[error("Unknown coin: {0}")]
    UnknownCoin(String),

    #[error("Coin already spent: {0}")]
    AlreadySpent(String),

    #[error("Invalid signature for coin {0}")]
    InvalidSignature(String),

    #[error("Invalid provenance: {0}")]
    InvalidProvenance(#[from] ProvenanceError),

    #[error("Malformed coin record: {0}")]
    Malformed(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Supply cap exceeded: requested {requested}, remaining {remaining}")]
    SupplyCapExceeded { requested: u64, remaining: u64 },

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// A coin to be minted
#[derive(Debug, Clone)]
pub struct MintRequest {
    pub owner: PublicKey,
    pub value: u64,
    pub proof: MiningProof,
    pub block_height: u64,
    pub share_index: u32,
    pub is_bonus: bool,
}

/// Aggregate figures about the coin store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinStats {
    /// Number of coin records, spent and unspent
    pub total_records: usize,
    pub unspent_records: usize,
    pub spent_records: usize,
    /// Value of all unspent records, in base units
    pub circulating: u64,
    /// Value ever minted, in base units
    pub minted_supply: u64,
    /// Distinct owners of unspent records
    pub owners: usize,
}

/// Holds every coin record and enforces single spending
///
/// Records are keyed by coin id. A transfer or split takes the entry lock of
/// the source record for the whole check-verify-flip sequence, so two
/// concurrent spends of one coin cannot both succeed.
///
/// Minted supply is the value of every distinct mint any record traces back
/// to, so a mint reached through several records is counted once.
#[derive(Debug)]
pub struct CoinLedger {
    coins: DashMap<String, Coin>,
    /// Mint id to minted value
    origins: DashMap<String, u64>,
    store: Option<CoinStore>,
    minted: AtomicU64,
    max_supply: u64,
}

impl CoinLedger {
    /// Creates an empty ledger kept only in memory
    pub fn in_memory(max_supply: u64) -> Self {
        CoinLedger {
            coins: DashMap::new(),
            origins: DashMap::new(),
            store: None,
            minted: AtomicU64::new(0),
            max_supply,
        }
    }

    /// Opens the ledger persisted under `data_dir`
    ///
    /// # Arguments
    ///
    /// * `data_dir` - The node's data directory
    /// * `max_supply` - Hard cap on minted base units
    ///
    /// # Returns
    ///
    /// The ledger with every stored record loaded, or a storage error if any
    /// record is unreadable
    pub fn open<P: AsRef<Path>>(data_dir: P, max_supply: u64) -> Result<Self, CoinError> {
        let store = CoinStore::open(data_dir)?;
        let ledger = CoinLedger::in_memory(max_supply);

        for coin in store.load_all()? {
            for origin in coin.origins() {
                ledger.origins.insert(origin.coin_id, origin.value);
            }
            ledger.coins.insert(coin.coin_id.clone(), coin);
        }
        let minted = ledger
            .origins
            .iter()
            .fold(0u64, |acc, entry| acc.saturating_add(*entry.value()));
        ledger.minted.store(minted, Ordering::SeqCst);

        info!(
            "Loaded {} coin records ({} base units minted)",
            ledger.coins.len(),
            ledger.minted_supply()
        );

        Ok(CoinLedger {
            store: Some(store),
            ..ledger
        })
    }

    pub fn minted_supply(&self) -> u64 {
        self.minted.load(Ordering::SeqCst)
    }

    pub fn max_supply(&self) -> u64 {
        self.max_supply
    }

    /// Reserves `amount` of the remaining supply
    fn reserve_supply(&self, amount: u64) -> Result<(), CoinError> {
        let max = self.max_supply;
        self.minted
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |minted| {
                minted.checked_add(amount).filter(|total| *total <= max)
            })
            .map(|_| ())
            .map_err(|minted| CoinError::SupplyCapExceeded {
                requested: amount,
                remaining: max.saturating_sub(minted),
            })
    }

    fn release_supply(&self, amount: u64) {
        let _ = self
            .minted
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |minted| Some(minted.saturating_sub(amount)));
    }

    /// Registers the mints of `origins` not seen before and reserves their value
    ///
    /// Returns the ids that were new, for `release_origins`.
    fn claim_origins(&self, origins: &[MintOrigin]) -> Result<Vec<String>, CoinError> {
        let mut claimed = Vec::new();
        let mut amount = 0u64;

        for origin in origins {
            if let Entry::Vacant(slot) = self.origins.entry(origin.coin_id.clone()) {
                slot.insert(origin.value);
                claimed.push(origin.coin_id.clone());
                amount = amount.saturating_add(origin.value);
            }
        }

        if let Err(e) = self.reserve_supply(amount) {
            for id in &claimed {
                self.origins.remove(id);
            }
            return Err(e);
        }
        Ok(claimed)
    }

    fn release_origins(&self, ids: &[String]) {
        for id in ids {
            if let Some((_, value)) = self.origins.remove(id) {
                self.release_supply(value);
            }
        }
    }

    fn persist(&self, coin: &Coin) -> Result<(), StorageError> {
        match &self.store {
            Some(store) => store.save(coin),
            None => Ok(()),
        }
    }

    fn unpersist(&self, coin_id: &str) {
        if let Some(store) = &self.store {
            if let Err(e) = store.remove(coin_id) {
                warn!("Failed to remove coin file {}: {}", coin_id, e);
            }
        }
    }

    /// Mints a single coin
    pub fn mint(
        &self,
        owner: PublicKey,
        value: u64,
        proof: MiningProof,
        block_height: u64,
        share_index: u32,
    ) -> Result<Coin, CoinError> {
        let mut coins = self.mint_batch(vec![MintRequest {
            owner,
            value,
            proof,
            block_height,
            share_index,
            is_bonus: false,
        }])?;

        coins.pop().ok_or_else(|| CoinError::Malformed("mint produced no coin".to_string()))
    }

    /// Mints several coins as one unit
    ///
    /// Either every coin is minted and stored, or none is and the reserved
    /// supply is released.
    pub fn mint_batch(&self, requests: Vec<MintRequest>) -> Result<Vec<Coin>, CoinError> {
        let total = requests
            .iter()
            .try_fold(0u64, |acc, r| acc.checked_add(r.value))
            .ok_or(CoinError::SupplyCapExceeded {
                requested: u64::MAX,
                remaining: self.max_supply.saturating_sub(self.minted_supply()),
            })?;
        self.reserve_supply(total)?;

        let mut minted: Vec<Coin> = Vec::with_capacity(requests.len());
        for request in requests {
            let coin = Coin::mint(
                request.owner,
                request.value,
                request.proof,
                request.block_height,
                request.share_index,
                request.is_bonus,
            );

            if let Err(e) = self.persist(&coin) {
                for coin in &minted {
                    self.unpersist(&coin.coin_id);
                }
                self.release_supply(total);
                return Err(e.into());
            }
            minted.push(coin);
        }

        for coin in &minted {
            self.origins.insert(coin.coin_id.clone(), coin.value);
            self.coins.insert(coin.coin_id.clone(), coin.clone());
        }

        Ok(minted)
    }

    /// Removes freshly minted coins whose share could not be committed
    pub fn rollback(&self, coin_ids: &[String]) {
        for coin_id in coin_ids {
            if self.coins.remove(coin_id).is_some() {
                self.release_origins(std::slice::from_ref(coin_id));
                self.unpersist(coin_id);
                warn!("Rolled back coin {}", coin_id);
            }
        }
    }

    /// Transfers a coin to `to`
    ///
    /// # Arguments
    ///
    /// * `coin_id` - The record being spent
    /// * `to` - The recipient's public key
    /// * `signature` - The current owner's signature over the transfer payload
    ///
    /// # Returns
    ///
    /// The successor record owned by `to`. The source record is kept, marked
    /// spent, with the transfer event appended.
    pub fn transfer(&self, coin_id: &str, to: &PublicKey, signature: DigitalSignature) -> Result<Coin, CoinError> {
        to.to_verifying_key()?;

        let mut entry = self
            .coins
            .get_mut(coin_id)
            .ok_or_else(|| CoinError::UnknownCoin(coin_id.to_string()))?;

        if entry.is_spent() {
            return Err(CoinError::AlreadySpent(coin_id.to_string()));
        }
        if !entry.verify_transfer(to, &signature) {
            return Err(CoinError::InvalidSignature(coin_id.to_string()));
        }

        let (spent, successor) = entry.reissue(to, signature);

        self.persist(&successor)?;
        if let Err(e) = self.persist(&spent) {
            self.unpersist(&successor.coin_id);
            return Err(e.into());
        }

        *entry = spent;
        drop(entry);

        info!(
            "Coin {} transferred to {} as {}",
            coin_id,
            to.short(),
            successor.coin_id
        );
        self.coins.insert(successor.coin_id.clone(), successor.clone());

        Ok(successor)
    }

    pub fn get(&self, coin_id: &str) -> Option<Coin> {
        self.coins.get(coin_id).map(|entry| entry.clone())
    }

    /// Payload the owner of `coin_id` must sign to send it to `to`
    pub fn transfer_payload(&self, coin_id: &str, to: &PublicKey) -> Result<Vec<u8>, CoinError> {
        let coin = self.get(coin_id).ok_or_else(|| CoinError::UnknownCoin(coin_id.to_string()))?;
        if coin.is_spent() {
            return Err(CoinError::AlreadySpent(coin_id.to_string()));
        }
        Ok(coin.transfer_payload(to))
    }

    /// Payload the owner of `coin_id` must sign to cut it into `amounts`
    pub fn split_payload(&self, coin_id: &str, amounts: &[u64]) -> Result<Vec<u8>, CoinError> {
        let coin = self.get(coin_id).ok_or_else(|| CoinError::UnknownCoin(coin_id.to_string()))?;
        if coin.is_spent() {
            return Err(CoinError::AlreadySpent(coin_id.to_string()));
        }
        check_split(amounts, coin.value).map_err(CoinError::InvalidRequest)?;
        Ok(coin.split_payload(amounts))
    }

    /// Cuts a coin into pieces of `amounts`
    ///
    /// The source record is kept, marked spent, and one new record per amount
    /// is issued to the same owner. The amounts must add up to the coin's
    /// value exactly.
    pub fn split(&self, coin_id: &str, amounts: &[u64], signature: DigitalSignature) -> Result<Vec<Coin>, CoinError> {
        let mut entry = self
            .coins
            .get_mut(coin_id)
            .ok_or_else(|| CoinError::UnknownCoin(coin_id.to_string()))?;

        if entry.is_spent() {
            return Err(CoinError::AlreadySpent(coin_id.to_string()));
        }
        check_split(amounts, entry.value).map_err(CoinError::InvalidRequest)?;
        if !entry.verify_split(amounts, &signature) {
            return Err(CoinError::InvalidSignature(coin_id.to_string()));
        }

        let (spent, pieces) = entry.split(amounts, signature);

        for (stored, piece) in pieces.iter().enumerate() {
            if let Err(e) = self.persist(piece) {
                for piece in &pieces[..stored] {
                    self.unpersist(&piece.coin_id);
                }
                return Err(e.into());
            }
        }
        if let Err(e) = self.persist(&spent) {
            for piece in &pieces {
                self.unpersist(&piece.coin_id);
            }
            return Err(e.into());
        }

        *entry = spent;
        drop(entry);

        info!("Coin {} split into {} pieces", coin_id, pieces.len());
        for piece in &pieces {
            self.coins.insert(piece.coin_id.clone(), piece.clone());
        }

        Ok(pieces)
    }

    /// Unspent records `owner` may merge, in the order of `coin_ids`
    fn combine_sources(&self, coin_ids: &[String], owner: &PublicKey) -> Result<Vec<Coin>, CoinError> {
        if coin_ids.len() < 2 {
            return Err(CoinError::InvalidRequest("a combine needs at least two coins".to_string()));
        }

        let mut seen = HashSet::new();
        let mut sources = Vec::with_capacity(coin_ids.len());
        for coin_id in coin_ids {
            if !seen.insert(coin_id.as_str()) {
                return Err(CoinError::InvalidRequest(format!("coin {} listed twice", coin_id)));
            }
            let coin = self.get(coin_id).ok_or_else(|| CoinError::UnknownCoin(coin_id.clone()))?;
            if coin.is_spent() {
                return Err(CoinError::AlreadySpent(coin_id.clone()));
            }
            if coin.owner_pubkey != *owner {
                return Err(CoinError::InvalidRequest(format!("coin {} is not owned by {}", coin_id, owner.short())));
            }
            sources.push(coin);
        }

        Ok(sources)
    }

    /// Payload `owner` must sign to merge `coin_ids`
    pub fn combine_payload(&self, coin_ids: &[String], owner: &PublicKey) -> Result<Vec<u8>, CoinError> {
        let sources = self.combine_sources(coin_ids, owner)?;
        Ok(Coin::combine_payload(owner, &sources))
    }

    /// Merges several coins of one owner into a single coin
    ///
    /// Sources are claimed one at a time; if one of them was spent in the
    /// meantime the sources already claimed are put back and nothing changes.
    pub fn combine(&self, coin_ids: &[String], owner: &PublicKey, signature: DigitalSignature) -> Result<Coin, CoinError> {
        let sources = self.combine_sources(coin_ids, owner)?;
        if !verify_signature(&Coin::combine_payload(owner, &sources), &signature, owner).unwrap_or(false) {
            return Err(CoinError::InvalidSignature(coin_ids.join(",")));
        }
        let (spent, combined) = Coin::combine(owner, &sources, signature)
            .ok_or_else(|| CoinError::InvalidRequest("combined value overflows".to_string()))?;

        let mut claimed: Vec<&Coin> = Vec::with_capacity(sources.len());
        for (source, spent) in sources.iter().zip(&spent) {
            let outcome = match self.coins.get_mut(&source.coin_id) {
                Some(mut entry) if *entry == *source => {
                    *entry = spent.clone();
                    Ok(())
                }
                Some(_) => Err(CoinError::AlreadySpent(source.coin_id.clone())),
                None => Err(CoinError::UnknownCoin(source.coin_id.clone())),
            };
            if let Err(e) = outcome {
                self.restore(&claimed);
                return Err(e);
            }
            claimed.push(source);
        }

        let persisted = self
            .persist(&combined)
            .and_then(|_| spent.iter().try_for_each(|coin| self.persist(coin)));
        if let Err(e) = persisted {
            self.unpersist(&combined.coin_id);
            for source in &sources {
                if let Err(e) = self.persist(source) {
                    warn!("Failed to restore coin file {}: {}", source.coin_id, e);
                }
            }
            self.restore(&claimed);
            return Err(e.into());
        }

        info!(
            "Combined {} coins of {} into {}",
            sources.len(),
            owner.short(),
            combined.coin_id
        );
        self.coins.insert(combined.coin_id.clone(), combined.clone());

        Ok(combined)
    }

    fn restore(&self, records: &[&Coin]) {
        for coin in records {
            self.coins.insert(coin.coin_id.clone(), (*coin).clone());
        }
    }

    /// Serializes the full record of a coin
    pub fn export(&self, coin_id: &str) -> Result<String, CoinError> {
        let coin = self.get(coin_id).ok_or_else(|| CoinError::UnknownCoin(coin_id.to_string()))?;
        serde_json::to_string_pretty(&coin).map_err(|e| CoinError::Malformed(e.to_string()))
    }

    /// Admits a coin record produced elsewhere
    ///
    /// The history is replayed and every link verified, and `check_origin`
    /// must accept every mint the coin traces back to, before anything is
    /// stored. Local records the coin consumed that are still unspent are
    /// marked spent; a local record that was spent differently makes the
    /// import a double spend. Supply is reserved only for mints this ledger
    /// has not seen.
    pub fn import<F>(&self, serialized: &str, check_origin: F) -> Result<Coin, CoinError>
    where
        F: Fn(&MintOrigin) -> Result<(), String>,
    {
        let coin: Coin = serde_json::from_str(serialized).map_err(|e| CoinError::Malformed(e.to_string()))?;

        if coin.is_spent() {
            return Err(CoinError::AlreadySpent(coin.coin_id));
        }
        coin.verify_provenance()?;

        let origins = coin.origins();
        for origin in &origins {
            check_origin(origin).map_err(|reason| ProvenanceError::at(0, reason))?;
        }

        if let Some(existing) = self.get(&coin.coin_id) {
            if existing.is_spent() {
                return Err(CoinError::AlreadySpent(coin.coin_id));
            }
            return Ok(existing);
        }

        let ancestors = coin.ancestors();

        // check every ancestor before touching any of them
        for (ancestor_id, spending) in &ancestors {
            if let Some(local) = self.coins.get(ancestor_id) {
                let recorded = local.history().last().map(CoinEvent::as_spend);
                if local.is_spent() && recorded.as_ref() != Some(spending) {
                    return Err(CoinError::AlreadySpent(ancestor_id.clone()));
                }
            }
        }

        let claimed = self.claim_origins(&origins)?;
        if let Err(e) = self.persist(&coin) {
            self.release_origins(&claimed);
            return Err(e.into());
        }

        for (ancestor_id, spending) in &ancestors {
            if let Some(mut local) = self.coins.get_mut(ancestor_id) {
                if local.is_spent() {
                    continue;
                }

                let spent = local.spent_by(spending.clone());
                self.persist(&spent)?;
                *local = spent;
                info!("Coin {} marked spent by imported coin {}", ancestor_id, coin.coin_id);
            }
        }

        self.coins.insert(coin.coin_id.clone(), coin.clone());
        info!("Imported coin {} owned by {}", coin.coin_id, coin.owner_pubkey.short());

        Ok(coin)
    }

    /// Records owned by `owner`, oldest first
    pub fn coins_of(&self, owner: &PublicKey, include_spent: bool) -> Vec<Coin> {
        let mut coins: Vec<Coin> = self
            .coins
            .iter()
            .filter(|entry| entry.owner_pubkey == *owner && (include_spent || !entry.is_spent()))
            .map(|entry| entry.clone())
            .collect();

        coins.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.block_height.cmp(&b.block_height))
                .then(a.share_index.cmp(&b.share_index))
        });
        coins
    }

    /// Sum of unspent records owned by `owner`, in base units
    pub fn balance(&self, owner: &PublicKey) -> u64 {
        self.coins
            .iter()
            .filter(|entry| entry.owner_pubkey == *owner && !entry.is_spent())
            .map(|entry| entry.value)
            .sum()
    }

    pub fn stats(&self) -> CoinStats {
        let mut stats = CoinStats {
            minted_supply: self.minted_supply(),
            ..CoinStats::default()
        };
        let mut owners = HashSet::new();

        for entry in self.coins.iter() {
            stats.total_records += 1;
            if entry.is_spent() {
                stats.spent_records += 1;
            } else {
                stats.unspent_records += 1;
                stats.circulating += entry.value;
                owners.insert(entry.owner_pubkey.clone());
            }
        }

        stats.owners = owners.len();
        stats
    }

    /// Deletes every record (testing networks only)
    pub fn reset(&self) -> Result<(), CoinError> {
        if let Some(store) = &self.store {
            store.clear()?;
        }
        self.coins.clear();
        self.origins.clear();
        self.minted.store(0, Ordering::SeqCst);
        warn!("Coin ledger reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::crypto::Wallet;
    use crate::blockchain::hash::Digest;
    use crate::blockchain::params::COIN;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn proof(nonce: u64) -> MiningProof {
        MiningProof {
            nonce,
            hash: Digest::sha256(&nonce.to_le_bytes()),
            share_difficulty: 1,
            block_difficulty: 5,
        }
    }

    fn ledger() -> CoinLedger {
        CoinLedger::in_memory(21_000_000 * COIN)
    }

    fn any_origin(_: &MintOrigin) -> Result<(), String> {
        Ok(())
    }

    fn signed_transfer(ledger: &CoinLedger, coin_id: &str, owner: &Wallet, to: &Wallet) -> Result<Coin, CoinError> {
        let payload = ledger.transfer_payload(coin_id, to.public_key())?;
        ledger.transfer(coin_id, to.public_key(), owner.sign(&payload))
    }

    #[test]
    fn test_mint_and_balance() {
        let ledger = ledger();
        let miner = Wallet::new();

        ledger.mint(miner.public_key().clone(), COIN / 2, proof(1), 1, 0).unwrap();
        ledger.mint(miner.public_key().clone(), COIN / 2, proof(2), 1, 1).unwrap();

        assert_eq!(ledger.balance(miner.public_key()), COIN);
        assert_eq!(ledger.coins_of(miner.public_key(), false).len(), 2);
        assert_eq!(ledger.minted_supply(), COIN);
    }

    #[test]
    fn test_transfer_spends_and_reissues() {
        let ledger = ledger();
        let alice = Wallet::new();
        let bob = Wallet::new();
        let coin = ledger.mint(alice.public_key().clone(), 50, proof(1), 1, 0).unwrap();

        let successor = signed_transfer(&ledger, &coin.coin_id, &alice, &bob).unwrap();

        assert_eq!(successor.owner_pubkey, *bob.public_key());
        assert!(ledger.get(&coin.coin_id).unwrap().is_spent());
        assert_eq!(ledger.balance(alice.public_key()), 0);
        assert_eq!(ledger.balance(bob.public_key()), 50);
        assert_eq!(ledger.minted_supply(), 50);
    }

    #[test]
    fn test_spent_coin_cannot_move_again() {
        let ledger = ledger();
        let alice = Wallet::new();
        let bob = Wallet::new();
        let carol = Wallet::new();
        let coin = ledger.mint(alice.public_key().clone(), 50, proof(1), 1, 0).unwrap();
        let payload_to_carol = coin.transfer_payload(carol.public_key());

        signed_transfer(&ledger, &coin.coin_id, &alice, &bob).unwrap();

        let result = ledger.transfer(&coin.coin_id, carol.public_key(), alice.sign(&payload_to_carol));
        assert!(matches!(result, Err(CoinError::AlreadySpent(_))));
        assert_eq!(ledger.balance(carol.public_key()), 0);
    }

    #[test]
    fn test_forged_signature_leaves_coin_unchanged() {
        let ledger = ledger();
        let alice = Wallet::new();
        let mallory = Wallet::new();
        let coin = ledger.mint(alice.public_key().clone(), 50, proof(1), 1, 0).unwrap();

        let payload = coin.transfer_payload(mallory.public_key());
        let result = ledger.transfer(&coin.coin_id, mallory.public_key(), mallory.sign(&payload));

        assert!(matches!(result, Err(CoinError::InvalidSignature(_))));
        let after = ledger.get(&coin.coin_id).unwrap();
        assert_eq!(after, coin);
        assert_eq!(after.history().len(), 1);
    }

    #[test]
    fn test_unknown_coin() {
        let ledger = ledger();
        let alice = Wallet::new();

        let result = ledger.transfer("COIN-missing", alice.public_key(), alice.sign(b"x"));
        assert!(matches!(result, Err(CoinError::UnknownCoin(_))));
    }

    #[test]
    fn test_concurrent_transfers_spend_once() {
        let ledger = Arc::new(ledger());
        let alice = Wallet::new();
        let coin = ledger.mint(alice.public_key().clone(), 50, proof(1), 1, 0).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                let alice = alice.clone();
                let coin = coin.clone();
                std::thread::spawn(move || {
                    let to = Wallet::new();
                    let signature = alice.sign(&coin.transfer_payload(to.public_key()));
                    ledger.transfer(&coin.coin_id, to.public_key(), signature).is_ok()
                })
            })
            .collect();

        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(successes, 1);
        assert_eq!(ledger.stats().unspent_records, 1);
        assert_eq!(ledger.stats().spent_records, 1);
    }

    #[test]
    fn test_supply_cap_is_enforced() {
        let ledger = CoinLedger::in_memory(100);
        let miner = Wallet::new();

        ledger.mint(miner.public_key().clone(), 60, proof(1), 1, 0).unwrap();
        let result = ledger.mint(miner.public_key().clone(), 60, proof(2), 1, 1);

        assert!(matches!(result, Err(CoinError::SupplyCapExceeded { remaining: 40, .. })));
        assert_eq!(ledger.minted_supply(), 60);
    }

    #[test]
    fn test_rollback_releases_supply() {
        let ledger = ledger();
        let miner = Wallet::new();
        let coin = ledger.mint(miner.public_key().clone(), 50, proof(1), 1, 0).unwrap();

        ledger.rollback(&[coin.coin_id.clone()]);

        assert!(ledger.get(&coin.coin_id).is_none());
        assert_eq!(ledger.minted_supply(), 0);
    }

    #[test]
    fn test_export_import_between_ledgers() {
        let source = ledger();
        let alice = Wallet::new();
        let bob = Wallet::new();
        let coin = source.mint(alice.public_key().clone(), 50, proof(1), 1, 0).unwrap();
        let successor = signed_transfer(&source, &coin.coin_id, &alice, &bob).unwrap();

        let target = ledger();
        let imported = target.import(&source.export(&successor.coin_id).unwrap(), any_origin).unwrap();

        assert_eq!(imported, successor);
        assert_eq!(target.balance(bob.public_key()), 50);
        assert_eq!(target.minted_supply(), 50);

        // importing again is a no-op
        target.import(&source.export(&successor.coin_id).unwrap(), any_origin).unwrap();
        assert_eq!(target.stats().total_records, 1);
    }

    #[test]
    fn test_import_rejects_spent_record() {
        let source = ledger();
        let alice = Wallet::new();
        let bob = Wallet::new();
        let coin = source.mint(alice.public_key().clone(), 50, proof(1), 1, 0).unwrap();
        signed_transfer(&source, &coin.coin_id, &alice, &bob).unwrap();

        let target = ledger();
        let result = target.import(&source.export(&coin.coin_id).unwrap(), any_origin);
        assert!(matches!(result, Err(CoinError::AlreadySpent(_))));
    }

    #[test]
    fn test_import_with_tampered_middle_event() {
        let source = ledger();
        let alice = Wallet::new();
        let bob = Wallet::new();
        let carol = Wallet::new();
        let dave = Wallet::new();

        let coin = source.mint(alice.public_key().clone(), 50, proof(1), 1, 0).unwrap();
        let to_bob = signed_transfer(&source, &coin.coin_id, &alice, &bob).unwrap();
        let to_carol = signed_transfer(&source, &to_bob.coin_id, &bob, &carol).unwrap();
        let to_dave = signed_transfer(&source, &to_carol.coin_id, &carol, &dave).unwrap();

        let mut json: serde_json::Value = serde_json::from_str(&source.export(&to_dave.coin_id).unwrap()).unwrap();
        json["history"][2]["to"] = serde_json::json!(dave.public_key());

        let target = ledger();
        match target.import(&json.to_string(), any_origin) {
            Err(CoinError::InvalidProvenance(e)) => assert_eq!(e.index, 2),
            other => panic!("expected InvalidProvenance, got {:?}", other),
        }
        assert!(target.get(&to_dave.coin_id).is_none());
        assert_eq!(target.minted_supply(), 0);
    }

    #[test]
    fn test_import_marks_local_ancestor_spent() {
        let ledger = ledger();
        let alice = Wallet::new();
        let bob = Wallet::new();
        let coin = ledger.mint(alice.public_key().clone(), 50, proof(1), 1, 0).unwrap();

        // alice signs offline and the successor arrives through import
        let signature = alice.sign(&coin.transfer_payload(bob.public_key()));
        let (_, successor) = coin.reissue(bob.public_key(), signature);
        ledger.import(&serde_json::to_string(&successor).unwrap(), any_origin).unwrap();

        assert!(ledger.get(&coin.coin_id).unwrap().is_spent());
        assert_eq!(ledger.balance(alice.public_key()), 0);
        assert_eq!(ledger.balance(bob.public_key()), 50);
        assert_eq!(ledger.minted_supply(), 50);
    }

    #[test]
    fn test_import_conflicting_spend_is_rejected() {
        let ledger = ledger();
        let alice = Wallet::new();
        let bob = Wallet::new();
        let carol = Wallet::new();
        let coin = ledger.mint(alice.public_key().clone(), 50, proof(1), 1, 0).unwrap();

        let offline = alice.sign(&coin.transfer_payload(carol.public_key()));
        let (_, to_carol) = coin.reissue(carol.public_key(), offline);

        signed_transfer(&ledger, &coin.coin_id, &alice, &bob).unwrap();

        let result = ledger.import(&serde_json::to_string(&to_carol).unwrap(), any_origin);
        assert!(matches!(result, Err(CoinError::AlreadySpent(_))));
        assert_eq!(ledger.balance(carol.public_key()), 0);
    }

    #[test]
    fn test_reopen_restores_records() {
        let dir = tempdir().unwrap();
        let alice = Wallet::new();
        let bob = Wallet::new();

        let coin_id = {
            let ledger = CoinLedger::open(dir.path(), 21_000_000 * COIN).unwrap();
            let coin = ledger.mint(alice.public_key().clone(), 50, proof(1), 1, 0).unwrap();
            signed_transfer(&ledger, &coin.coin_id, &alice, &bob).unwrap();
            coin.coin_id
        };

        let reopened = CoinLedger::open(dir.path(), 21_000_000 * COIN).unwrap();
        assert!(reopened.get(&coin_id).unwrap().is_spent());
        assert_eq!(reopened.balance(bob.public_key()), 50);
        assert_eq!(reopened.minted_supply(), 50);
        assert_eq!(reopened.stats().total_records, 2);
    }

    #[test]
    fn test_import_needs_every_origin_accepted() {
        let source = ledger();
        let alice = Wallet::new();
        let bob = Wallet::new();
        let coin = source.mint(alice.public_key().clone(), 50, proof(1), 1, 0).unwrap();
        let successor = signed_transfer(&source, &coin.coin_id, &alice, &bob).unwrap();

        let target = ledger();
        let result = target.import(&source.export(&successor.coin_id).unwrap(), |origin| {
            Err(format!("no share behind {}", origin.coin_id))
        });

        match result {
            Err(CoinError::InvalidProvenance(e)) => assert_eq!(e.index, 0),
            other => panic!("expected InvalidProvenance, got {:?}", other),
        }
        assert_eq!(target.stats().total_records, 0);
        assert_eq!(target.minted_supply(), 0);
    }

    #[test]
    fn test_import_counts_each_mint_once() {
        let dir = tempdir().unwrap();
        let source = ledger();
        let alice = Wallet::new();
        let bob = Wallet::new();
        let carol = Wallet::new();

        let coin = source.mint(alice.public_key().clone(), 50, proof(1), 1, 0).unwrap();
        let to_bob = signed_transfer(&source, &coin.coin_id, &alice, &bob).unwrap();
        let to_bob_export = source.export(&to_bob.coin_id).unwrap();
        let to_carol = signed_transfer(&source, &to_bob.coin_id, &bob, &carol).unwrap();

        {
            // the intermediate record arrives first; the mint itself never does
            let target = CoinLedger::open(dir.path(), 21_000_000 * COIN).unwrap();
            target.import(&to_bob_export, any_origin).unwrap();
            target.import(&source.export(&to_carol.coin_id).unwrap(), any_origin).unwrap();

            assert!(target.get(&coin.coin_id).is_none());
            assert!(target.get(&to_bob.coin_id).unwrap().is_spent());
            assert_eq!(target.minted_supply(), 50);
        }

        let reopened = CoinLedger::open(dir.path(), 21_000_000 * COIN).unwrap();
        assert_eq!(reopened.minted_supply(), 50);
        assert_eq!(reopened.balance(carol.public_key()), 50);
    }

    #[test]
    fn test_split_spends_and_issues_pieces() {
        let ledger = ledger();
        let alice = Wallet::new();
        let coin = ledger.mint(alice.public_key().clone(), 50, proof(1), 1, 0).unwrap();

        let amounts = [10, 15, 25];
        let payload = ledger.split_payload(&coin.coin_id, &amounts).unwrap();
        let pieces = ledger.split(&coin.coin_id, &amounts, alice.sign(&payload)).unwrap();

        assert_eq!(pieces.len(), 3);
        assert!(ledger.get(&coin.coin_id).unwrap().is_spent());
        assert_eq!(ledger.balance(alice.public_key()), 50);
        assert_eq!(ledger.coins_of(alice.public_key(), false).len(), 3);
        assert_eq!(ledger.minted_supply(), 50);

        // the source is gone, so a second split fails
        let again = ledger.split(&coin.coin_id, &amounts, alice.sign(&payload));
        assert!(matches!(again, Err(CoinError::AlreadySpent(_))));
    }

    #[test]
    fn test_split_rejects_bad_amounts_and_signature() {
        let ledger = ledger();
        let alice = Wallet::new();
        let mallory = Wallet::new();
        let coin = ledger.mint(alice.public_key().clone(), 50, proof(1), 1, 0).unwrap();

        let inflated = [40, 40];
        assert!(matches!(
            ledger.split_payload(&coin.coin_id, &inflated),
            Err(CoinError::InvalidRequest(_))
        ));
        let forged = ledger.split(&coin.coin_id, &inflated, alice.sign(&coin.split_payload(&inflated)));
        assert!(matches!(forged, Err(CoinError::InvalidRequest(_))));

        let amounts = [20, 30];
        let result = ledger.split(&coin.coin_id, &amounts, mallory.sign(&coin.split_payload(&amounts)));
        assert!(matches!(result, Err(CoinError::InvalidSignature(_))));
        assert_eq!(ledger.get(&coin.coin_id).unwrap(), coin);
    }

    #[test]
    fn test_combine_merges_and_spends_sources() {
        let ledger = ledger();
        let alice = Wallet::new();
        let bob = Wallet::new();
        let a = ledger.mint(alice.public_key().clone(), 20, proof(1), 1, 0).unwrap();
        let b = ledger.mint(alice.public_key().clone(), 30, proof(2), 1, 1).unwrap();
        let ids = vec![a.coin_id.clone(), b.coin_id.clone()];

        let payload = ledger.combine_payload(&ids, alice.public_key()).unwrap();
        let combined = ledger.combine(&ids, alice.public_key(), alice.sign(&payload)).unwrap();

        assert_eq!(combined.value, 50);
        assert!(ledger.get(&a.coin_id).unwrap().is_spent());
        assert!(ledger.get(&b.coin_id).unwrap().is_spent());
        assert_eq!(ledger.coins_of(alice.public_key(), false), vec![combined.clone()]);
        assert_eq!(ledger.minted_supply(), 50);

        // the merged coin transfers like a minted one, and travels with its sources
        let to_bob = signed_transfer(&ledger, &combined.coin_id, &alice, &bob).unwrap();
        let target = self::ledger();
        target.import(&ledger.export(&to_bob.coin_id).unwrap(), any_origin).unwrap();
        assert_eq!(target.balance(bob.public_key()), 50);
        assert_eq!(target.minted_supply(), 50);
    }

    #[test]
    fn test_combine_rejects_spent_or_foreign_sources() {
        let ledger = ledger();
        let alice = Wallet::new();
        let bob = Wallet::new();
        let a = ledger.mint(alice.public_key().clone(), 20, proof(1), 1, 0).unwrap();
        let b = ledger.mint(alice.public_key().clone(), 30, proof(2), 1, 1).unwrap();
        let foreign = ledger.mint(bob.public_key().clone(), 30, proof(3), 1, 2).unwrap();

        let single = vec![a.coin_id.clone()];
        assert!(matches!(
            ledger.combine_payload(&single, alice.public_key()),
            Err(CoinError::InvalidRequest(_))
        ));
        let twice = vec![a.coin_id.clone(), a.coin_id.clone()];
        assert!(matches!(
            ledger.combine_payload(&twice, alice.public_key()),
            Err(CoinError::InvalidRequest(_))
        ));
        let mixed = vec![a.coin_id.clone(), foreign.coin_id.clone()];
        assert!(matches!(
            ledger.combine_payload(&mixed, alice.public_key()),
            Err(CoinError::InvalidRequest(_))
        ));

        let ids = vec![a.coin_id.clone(), b.coin_id.clone()];
        let payload = ledger.combine_payload(&ids, alice.public_key()).unwrap();
        signed_transfer(&ledger, &b.coin_id, &alice, &bob).unwrap();

        let result = ledger.combine(&ids, alice.public_key(), alice.sign(&payload));
        assert!(matches!(result, Err(CoinError::AlreadySpent(_))));
        assert!(!ledger.get(&a.coin_id).unwrap().is_spent());
        assert_eq!(ledger.balance(alice.public_key()), 20);
    }

    #[test]
    fn test_import_of_split_piece_marks_parent_spent() {
        let ledger = ledger();
        let alice = Wallet::new();
        let bob = Wallet::new();
        let coin = ledger.mint(alice.public_key().clone(), 50, proof(1), 1, 0).unwrap();

        // alice splits offline and hands one piece to bob
        let amounts = [20, 30];
        let (_, pieces) = coin.split(&amounts, alice.sign(&coin.split_payload(&amounts)));
        let to_bob = alice.sign(&pieces[1].transfer_payload(bob.public_key()));
        let (_, bobs_piece) = pieces[1].reissue(bob.public_key(), to_bob);

        ledger.import(&serde_json::to_string(&bobs_piece).unwrap(), any_origin).unwrap();
        ledger.import(&serde_json::to_string(&pieces[0]).unwrap(), any_origin).unwrap();

        assert!(ledger.get(&coin.coin_id).unwrap().is_spent());
        assert_eq!(ledger.balance(alice.public_key()), 20);
        assert_eq!(ledger.balance(bob.public_key()), 30);
        assert_eq!(ledger.minted_supply(), 50);
    }
}
