use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::crypto::{verify_signature, DigitalSignature, PublicKey};
use super::hash::Digest;

/// Prefix of every coin identifier
pub const COIN_ID_PREFIX: &str = "COIN-";

/// Why a coin's history failed verification
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Broken provenance at event {index}: {reason}")]
pub struct ProvenanceError {
    /// Position of the first broken event (the history length when the
    /// record itself disagrees with an otherwise valid history)
    pub index: usize,
    pub reason: String,
}

impl ProvenanceError {
    pub(crate) fn at(index: usize, reason: impl Into<String>) -> Self {
        ProvenanceError {
            index,
            reason: reason.into(),
        }
    }
}

/// Proof-of-work evidence a coin was minted from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MiningProof {
    pub nonce: u64,
    pub hash: Digest,
    pub share_difficulty: u32,
    pub block_difficulty: u32,
}

/// A mint some of a coin's value traces back to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MintOrigin {
    /// Id of the minted record
    pub coin_id: String,
    pub owner: PublicKey,
    pub value: u64,
    pub block_height: u64,
    pub share_index: u32,
    pub is_bonus: bool,
    pub proof: MiningProof,
}

/// One entry of a coin's ownership history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CoinEvent {
    Mint {
        actor: PublicKey,
        value: u64,
        block_height: u64,
        timestamp: DateTime<Utc>,
    },
    Transfer {
        actor: PublicKey,
        /// Record that was spent by this transfer
        coin_id: String,
        from: PublicKey,
        to: PublicKey,
        timestamp: DateTime<Utc>,
        signature: DigitalSignature,
    },
    /// The spent record was cut into pieces of `amounts`
    Split {
        actor: PublicKey,
        coin_id: String,
        amounts: Vec<u64>,
        /// Which piece this history continues as; absent on the spent record
        #[serde(default, skip_serializing_if = "Option::is_none")]
        piece: Option<u32>,
        timestamp: DateTime<Utc>,
        signature: DigitalSignature,
    },
    /// Starts a record merged from `sources`, as they stood before the merge
    Combine {
        actor: PublicKey,
        sources: Vec<Coin>,
        timestamp: DateTime<Utc>,
        signature: DigitalSignature,
    },
    /// Ends a record that went into the combined record `into`
    Merge {
        actor: PublicKey,
        coin_id: String,
        into: String,
        timestamp: DateTime<Utc>,
        signature: DigitalSignature,
    },
}

impl CoinEvent {
    pub fn actor(&self) -> &PublicKey {
        match self {
            CoinEvent::Mint { actor, .. }
            | CoinEvent::Transfer { actor, .. }
            | CoinEvent::Split { actor, .. }
            | CoinEvent::Combine { actor, .. }
            | CoinEvent::Merge { actor, .. } => actor,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            CoinEvent::Mint { timestamp, .. }
            | CoinEvent::Transfer { timestamp, .. }
            | CoinEvent::Split { timestamp, .. }
            | CoinEvent::Combine { timestamp, .. }
            | CoinEvent::Merge { timestamp, .. } => *timestamp,
        }
    }

    /// The event as appended to the record it spent
    ///
    /// Every piece of a split carries its own piece number; the spent record
    /// carries none.
    pub fn as_spend(&self) -> CoinEvent {
        match self {
            CoinEvent::Split { .. } => {
                let mut event = self.clone();
                if let CoinEvent::Split { piece, .. } = &mut event {
                    *piece = None;
                }
                event
            }
            _ => self.clone(),
        }
    }

    fn starts_history(&self) -> bool {
        matches!(self, CoinEvent::Mint { .. } | CoinEvent::Combine { .. })
    }

    fn ends_history(&self) -> bool {
        matches!(self, CoinEvent::Merge { .. } | CoinEvent::Split { piece: None, .. })
    }
}

/// Append-only ownership history
///
/// Always starts with exactly one mint or combine event. The only way to
/// grow it is `appended`, which returns a new, longer history; nothing can
/// remove or reorder events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<CoinEvent>", into = "Vec<CoinEvent>")]
pub struct CoinHistory(Vec<CoinEvent>);

impl CoinHistory {
    fn started(event: CoinEvent) -> Self {
        CoinHistory(vec![event])
    }

    /// This history followed by `event`
    fn appended(&self, event: CoinEvent) -> Self {
        let mut events = self.0.clone();
        events.push(event);
        CoinHistory(events)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CoinEvent> {
        self.0.iter()
    }

    pub fn first(&self) -> Option<&CoinEvent> {
        self.0.first()
    }

    pub fn last(&self) -> Option<&CoinEvent> {
        self.0.last()
    }

    /// Number of transfer events
    pub fn transfers(&self) -> usize {
        self.0
            .iter()
            .filter(|event| matches!(event, CoinEvent::Transfer { .. }))
            .count()
    }

    /// Digest of the first `len` events; signatures commit to it
    pub fn prefix_digest(&self, len: usize) -> Digest {
        let end = len.min(self.0.len());
        let bytes = serde_json::to_vec(&self.0[..end]).unwrap_or_default();
        Digest::sha256(&bytes)
    }
}

impl TryFrom<Vec<CoinEvent>> for CoinHistory {
    type Error = String;

    fn try_from(events: Vec<CoinEvent>) -> Result<Self, Self::Error> {
        match events.first() {
            Some(event) if event.starts_history() => {}
            Some(_) => return Err("coin history must start with a mint or a combine".to_string()),
            None => return Err("coin history is empty".to_string()),
        }

        if events.iter().skip(1).any(CoinEvent::starts_history) {
            return Err("coin history contains more than one origin".to_string());
        }
        if events.iter().rev().skip(1).any(CoinEvent::ends_history) {
            return Err("coin history continues after the record was consumed".to_string());
        }

        Ok(CoinHistory(events))
    }
}

impl From<CoinHistory> for Vec<CoinEvent> {
    fn from(history: CoinHistory) -> Self {
        history.0
    }
}

/// Bytes a current owner signs to hand a coin to `to`
#[derive(Serialize)]
struct TransferPayload<'a> {
    coin_id: &'a str,
    from: &'a PublicKey,
    to: &'a PublicKey,
    value: u64,
    history: String,
}

/// Bytes a current owner signs to cut a coin into pieces
#[derive(Serialize)]
struct SplitPayload<'a> {
    action: &'static str,
    coin_id: &'a str,
    owner: &'a PublicKey,
    amounts: &'a [u64],
    history: String,
}

/// Bytes an owner signs to merge several coins into one
#[derive(Serialize)]
struct CombinePayload<'a> {
    action: &'static str,
    owner: &'a PublicKey,
    coin_ids: Vec<&'a str>,
    value: u64,
}

/// A discrete, transferable unit of value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    /// Version of the coin structure
    #[serde(default = "default_version")]
    pub version: u32,

    /// Content-derived identifier
    pub coin_id: String,

    /// Value in base units
    pub value: u64,

    pub owner_pubkey: PublicKey,

    pub created_at: DateTime<Utc>,

    pub block_height: u64,

    pub share_index: u32,

    /// True for a block finder's bonus coin
    #[serde(default)]
    pub is_bonus: bool,

    pub mining_proof: MiningProof,

    /// Record this coin was reissued from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_coin: Option<String>,

    is_spent: bool,

    history: CoinHistory,
}

/// Default version for coins
fn default_version() -> u32 {
    1
}

/// Checks that `amounts` cut `value` into at least two non-empty pieces
pub fn check_split(amounts: &[u64], value: u64) -> Result<(), String> {
    if amounts.len() < 2 {
        return Err("a split needs at least two pieces".to_string());
    }
    if amounts.contains(&0) {
        return Err("split pieces must not be empty".to_string());
    }
    let total = amounts
        .iter()
        .try_fold(0u64, |acc, amount| acc.checked_add(*amount))
        .ok_or_else(|| "split amounts overflow".to_string())?;
    if total != value {
        return Err(format!("split amounts add up to {} but the coin holds {}", total, value));
    }
    Ok(())
}

impl Coin {
    /// Creates a freshly minted coin with a single mint event
    pub fn mint(
        owner_pubkey: PublicKey,
        value: u64,
        mining_proof: MiningProof,
        block_height: u64,
        share_index: u32,
        is_bonus: bool,
    ) -> Self {
        let created_at = Utc::now();
        let coin_id = mint_coin_id(&owner_pubkey, value, block_height, share_index, is_bonus, &mining_proof);

        let history = CoinHistory::started(CoinEvent::Mint {
            actor: owner_pubkey.clone(),
            value,
            block_height,
            timestamp: created_at,
        });

        Coin {
            version: default_version(),
            coin_id,
            value,
            owner_pubkey,
            created_at,
            block_height,
            share_index,
            is_bonus,
            mining_proof,
            parent_coin: None,
            is_spent: false,
            history,
        }
    }

    pub fn is_spent(&self) -> bool {
        self.is_spent
    }

    pub fn history(&self) -> &CoinHistory {
        &self.history
    }

    /// Bytes the current owner must sign to transfer this coin to `to`
    pub fn transfer_payload(&self, to: &PublicKey) -> Vec<u8> {
        transfer_payload(&self.coin_id, &self.owner_pubkey, to, self.value, &self.history, self.history.len())
    }

    /// Checks `signature` authorises handing this coin to `to`
    pub fn verify_transfer(&self, to: &PublicKey, signature: &DigitalSignature) -> bool {
        verify_signature(&self.transfer_payload(to), signature, &self.owner_pubkey).unwrap_or(false)
    }

    /// Bytes the current owner must sign to cut this coin into `amounts`
    pub fn split_payload(&self, amounts: &[u64]) -> Vec<u8> {
        split_payload(&self.coin_id, &self.owner_pubkey, amounts, &self.history, self.history.len())
    }

    pub fn verify_split(&self, amounts: &[u64], signature: &DigitalSignature) -> bool {
        verify_signature(&self.split_payload(amounts), signature, &self.owner_pubkey).unwrap_or(false)
    }

    /// Bytes `owner` must sign to merge `sources` into one coin
    pub fn combine_payload(owner: &PublicKey, sources: &[Coin]) -> Vec<u8> {
        let value = sources.iter().fold(0u64, |acc, coin| acc.saturating_add(coin.value));
        let payload = CombinePayload {
            action: "combine",
            owner,
            coin_ids: sources.iter().map(|coin| coin.coin_id.as_str()).collect(),
            value,
        };
        serde_json::to_vec(&payload).unwrap_or_default()
    }

    /// Spends this record, returning `(spent source, successor)`
    ///
    /// The caller is responsible for checking the signature and the spent
    /// flag; this only builds the two records.
    pub(crate) fn reissue(&self, to: &PublicKey, signature: DigitalSignature) -> (Coin, Coin) {
        let event = CoinEvent::Transfer {
            actor: self.owner_pubkey.clone(),
            coin_id: self.coin_id.clone(),
            from: self.owner_pubkey.clone(),
            to: to.clone(),
            timestamp: Utc::now(),
            signature: signature.clone(),
        };
        let history = self.history.appended(event);

        let mut spent = self.clone();
        spent.is_spent = true;
        spent.history = history.clone();

        let successor = Coin {
            coin_id: successor_coin_id(&self.coin_id, to, &signature),
            owner_pubkey: to.clone(),
            parent_coin: Some(self.coin_id.clone()),
            is_spent: false,
            history,
            ..self.clone()
        };

        (spent, successor)
    }

    /// Cuts this record into pieces of `amounts`, returning `(spent source, pieces)`
    ///
    /// As with `reissue`, the amounts and signature are the caller's to check.
    pub(crate) fn split(&self, amounts: &[u64], signature: DigitalSignature) -> (Coin, Vec<Coin>) {
        let event = CoinEvent::Split {
            actor: self.owner_pubkey.clone(),
            coin_id: self.coin_id.clone(),
            amounts: amounts.to_vec(),
            piece: None,
            timestamp: Utc::now(),
            signature: signature.clone(),
        };
        let spent = self.spent_by(event.clone());

        let pieces = amounts
            .iter()
            .enumerate()
            .map(|(piece, amount)| {
                let piece = piece as u32;
                let mut event = event.clone();
                if let CoinEvent::Split { piece: slot, .. } = &mut event {
                    *slot = Some(piece);
                }
                Coin {
                    coin_id: split_coin_id(&self.coin_id, piece, &signature),
                    value: *amount,
                    parent_coin: Some(self.coin_id.clone()),
                    is_spent: false,
                    history: self.history.appended(event),
                    ..self.clone()
                }
            })
            .collect();

        (spent, pieces)
    }

    /// Merges unspent `sources` owned by `owner` into one record
    ///
    /// Returns `(spent sources, combined)`. The combined record keeps the
    /// mining details of the first source.
    pub(crate) fn combine(owner: &PublicKey, sources: &[Coin], signature: DigitalSignature) -> Option<(Vec<Coin>, Coin)> {
        let first = sources.first()?;
        let value = sources.iter().try_fold(0u64, |acc, coin| acc.checked_add(coin.value))?;
        let timestamp = Utc::now();
        let coin_id = combined_coin_id(owner, sources, &signature);

        let spent = sources
            .iter()
            .map(|source| {
                source.spent_by(CoinEvent::Merge {
                    actor: owner.clone(),
                    coin_id: source.coin_id.clone(),
                    into: coin_id.clone(),
                    timestamp,
                    signature: signature.clone(),
                })
            })
            .collect();

        let combined = Coin {
            version: default_version(),
            coin_id,
            value,
            owner_pubkey: owner.clone(),
            created_at: timestamp,
            block_height: first.block_height,
            share_index: first.share_index,
            is_bonus: first.is_bonus,
            mining_proof: first.mining_proof.clone(),
            parent_coin: None,
            is_spent: false,
            history: CoinHistory::started(CoinEvent::Combine {
                actor: owner.clone(),
                sources: sources.to_vec(),
                timestamp,
                signature,
            }),
        };

        Some((spent, combined))
    }

    /// This record with `event` appended and the spent flag set
    ///
    /// Used when a transfer of this record happened elsewhere and arrives
    /// through the successor's history.
    pub(crate) fn spent_by(&self, event: CoinEvent) -> Coin {
        let mut spent = self.clone();
        spent.is_spent = true;
        spent.history = self.history.appended(event);
        spent
    }

    /// Identifiers of every record along the history, oldest first
    ///
    /// The first entry is the mint or combined record; the last is this
    /// record's id when the history is valid. Signatures are not checked here.
    pub fn lineage(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::with_capacity(self.history.len());

        for event in self.history.iter() {
            let next = match (event, ids.last()) {
                (CoinEvent::Mint { actor, value, block_height, .. }, None) => {
                    mint_coin_id(actor, *value, *block_height, self.share_index, self.is_bonus, &self.mining_proof)
                }
                (CoinEvent::Combine { actor, sources, signature, .. }, None) => {
                    combined_coin_id(actor, sources, signature)
                }
                (CoinEvent::Transfer { to, signature, .. }, Some(parent)) => {
                    successor_coin_id(parent.as_str(), to, signature)
                }
                (CoinEvent::Split { piece: Some(piece), signature, .. }, Some(parent)) => {
                    split_coin_id(parent.as_str(), *piece, signature)
                }
                _ => break,
            };
            ids.push(next);
        }

        ids
    }

    /// Every earlier record this one consumed, with the event that spent it
    ///
    /// Covers the records along the history and, for a combined record, the
    /// sources and their own ancestors.
    pub fn ancestors(&self) -> Vec<(String, CoinEvent)> {
        let lineage = self.lineage();
        let mut ancestors = Vec::new();

        if let (Some(CoinEvent::Combine { actor, sources, timestamp, signature }), Some(root)) =
            (self.history.first(), lineage.first())
        {
            for source in sources {
                ancestors.extend(source.ancestors());
                let merge = CoinEvent::Merge {
                    actor: actor.clone(),
                    coin_id: source.coin_id.clone(),
                    into: root.clone(),
                    timestamp: *timestamp,
                    signature: signature.clone(),
                };
                ancestors.push((source.coin_id.clone(), merge));
            }
        }

        for (id, event) in lineage.iter().zip(self.history.iter().skip(1)) {
            ancestors.push((id.clone(), event.as_spend()));
        }

        ancestors
    }

    /// The mints this record's value comes from
    pub fn origins(&self) -> Vec<MintOrigin> {
        match self.history.first() {
            Some(CoinEvent::Mint { actor, value, block_height, .. }) => vec![MintOrigin {
                coin_id: mint_coin_id(actor, *value, *block_height, self.share_index, self.is_bonus, &self.mining_proof),
                owner: actor.clone(),
                value: *value,
                block_height: *block_height,
                share_index: self.share_index,
                is_bonus: self.is_bonus,
                proof: self.mining_proof.clone(),
            }],
            Some(CoinEvent::Combine { sources, .. }) => sources.iter().flat_map(Coin::origins).collect(),
            _ => Vec::new(),
        }
    }

    /// Replays the history and checks every link
    ///
    /// The mint must match the record and its derived id; every later event
    /// must name the record it spent, come from the owner of that record, and
    /// carry a valid signature over its payload. The replayed final owner,
    /// value and id must match this record.
    pub fn verify_provenance(&self) -> Result<(), ProvenanceError> {
        let mut events = self.history.iter();

        let (mut owner, mut coin_id, mut value) = match events.next() {
            Some(CoinEvent::Mint { actor, value, block_height, .. }) => {
                if *block_height != self.block_height {
                    return Err(ProvenanceError::at(0, "mint event does not match the coin"));
                }
                let id = mint_coin_id(actor, *value, *block_height, self.share_index, self.is_bonus, &self.mining_proof);
                (actor.clone(), id, *value)
            }
            Some(CoinEvent::Combine { actor, sources, signature, .. }) => {
                let value = verify_sources(actor, sources, signature)?;
                (actor.clone(), combined_coin_id(actor, sources, signature), value)
            }
            _ => return Err(ProvenanceError::at(0, "history does not start with a mint or a combine")),
        };

        for (offset, event) in events.enumerate() {
            let index = offset + 1;
            match event {
                CoinEvent::Transfer { actor, coin_id: spent_id, from, to, signature, .. } => {
                    if *spent_id != coin_id {
                        return Err(ProvenanceError::at(index, format!("transfer spends {} but the coin was {}", spent_id, coin_id)));
                    }
                    if *from != owner || *actor != owner {
                        return Err(ProvenanceError::at(index, "transfer not made by the owner"));
                    }

                    let payload = transfer_payload(&coin_id, from, to, value, &self.history, index);
                    check_signature(index, &payload, signature, from)?;

                    coin_id = successor_coin_id(&coin_id, to, signature);
                    owner = to.clone();
                }
                CoinEvent::Split { actor, coin_id: spent_id, amounts, piece, signature, .. } => {
                    if *spent_id != coin_id {
                        return Err(ProvenanceError::at(index, format!("split spends {} but the coin was {}", spent_id, coin_id)));
                    }
                    if *actor != owner {
                        return Err(ProvenanceError::at(index, "split not made by the owner"));
                    }
                    let piece = piece.ok_or_else(|| ProvenanceError::at(index, "record was split"))?;
                    check_split(amounts, value).map_err(|reason| ProvenanceError::at(index, reason))?;

                    let payload = split_payload(&coin_id, actor, amounts, &self.history, index);
                    check_signature(index, &payload, signature, actor)?;

                    value = *amounts
                        .get(piece as usize)
                        .ok_or_else(|| ProvenanceError::at(index, format!("split has no piece {}", piece)))?;
                    coin_id = split_coin_id(&coin_id, piece, signature);
                }
                CoinEvent::Merge { .. } => return Err(ProvenanceError::at(index, "record was merged")),
                CoinEvent::Mint { .. } | CoinEvent::Combine { .. } => {
                    return Err(ProvenanceError::at(index, "unexpected origin event"))
                }
            }
        }

        let end = self.history.len();
        if self.is_spent {
            return Err(ProvenanceError::at(end, "record is spent"));
        }
        if coin_id != self.coin_id {
            return Err(ProvenanceError::at(end, "coin id does not match its history"));
        }
        if owner != self.owner_pubkey {
            return Err(ProvenanceError::at(end, "owner does not match its history"));
        }
        if value != self.value {
            return Err(ProvenanceError::at(end, "value does not match its history"));
        }

        Ok(())
    }
}

fn check_signature(index: usize, payload: &[u8], signature: &DigitalSignature, signer: &PublicKey) -> Result<(), ProvenanceError> {
    match verify_signature(payload, signature, signer) {
        Ok(true) => Ok(()),
        Ok(false) => Err(ProvenanceError::at(index, "signature does not verify")),
        Err(e) => Err(ProvenanceError::at(index, e.to_string())),
    }
}

/// Checks the sources of a combine and returns their total value
fn verify_sources(owner: &PublicKey, sources: &[Coin], signature: &DigitalSignature) -> Result<u64, ProvenanceError> {
    if sources.len() < 2 {
        return Err(ProvenanceError::at(0, "a combine needs at least two sources"));
    }

    let mut seen = HashSet::new();
    let mut total = 0u64;
    for source in sources {
        source
            .verify_provenance()
            .map_err(|e| ProvenanceError::at(0, format!("source {}: {}", source.coin_id, e)))?;
        if source.owner_pubkey != *owner {
            return Err(ProvenanceError::at(0, format!("source {} has another owner", source.coin_id)));
        }
        if !seen.insert(source.coin_id.as_str()) {
            return Err(ProvenanceError::at(0, format!("source {} listed twice", source.coin_id)));
        }
        total = total
            .checked_add(source.value)
            .ok_or_else(|| ProvenanceError::at(0, "combined value overflows"))?;
    }

    check_signature(0, &Coin::combine_payload(owner, sources), signature, owner)?;
    Ok(total)
}

fn transfer_payload(
    coin_id: &str,
    from: &PublicKey,
    to: &PublicKey,
    value: u64,
    history: &CoinHistory,
    prefix_len: usize,
) -> Vec<u8> {
    let payload = TransferPayload {
        coin_id,
        from,
        to,
        value,
        history: history.prefix_digest(prefix_len).to_hex(),
    };
    serde_json::to_vec(&payload).unwrap_or_default()
}

fn split_payload(coin_id: &str, owner: &PublicKey, amounts: &[u64], history: &CoinHistory, prefix_len: usize) -> Vec<u8> {
    let payload = SplitPayload {
        action: "split",
        coin_id,
        owner,
        amounts,
        history: history.prefix_digest(prefix_len).to_hex(),
    };
    serde_json::to_vec(&payload).unwrap_or_default()
}

fn short_id(digest: Digest) -> String {
    format!("{}{}", COIN_ID_PREFIX, &digest.to_hex()[..32])
}

/// Identifier of a freshly minted coin, derived from its mint contents
pub fn mint_coin_id(
    owner: &PublicKey,
    value: u64,
    block_height: u64,
    share_index: u32,
    is_bonus: bool,
    proof: &MiningProof,
) -> String {
    let data = serde_json::json!({
        "owner": owner,
        "value": value,
        "block_height": block_height,
        "share_index": share_index,
        "is_bonus": is_bonus,
        "nonce": proof.nonce,
        "hash": proof.hash,
    });
    short_id(Digest::sha256(data.to_string().as_bytes()))
}

/// Identifier of the record reissued to `to` when `parent` is spent
pub fn successor_coin_id(parent: &str, to: &PublicKey, signature: &DigitalSignature) -> String {
    let data = serde_json::json!({
        "parent": parent,
        "to": to,
        "signature": signature,
    });
    short_id(Digest::sha256(data.to_string().as_bytes()))
}

/// Identifier of piece `piece` of a split of `parent`
pub fn split_coin_id(parent: &str, piece: u32, signature: &DigitalSignature) -> String {
    let data = serde_json::json!({
        "parent": parent,
        "piece": piece,
        "signature": signature,
    });
    short_id(Digest::sha256(data.to_string().as_bytes()))
}

/// Identifier of the record merged from `sources`
pub fn combined_coin_id(owner: &PublicKey, sources: &[Coin], signature: &DigitalSignature) -> String {
    let ids: Vec<&str> = sources.iter().map(|coin| coin.coin_id.as_str()).collect();
    let data = serde_json::json!({
        "combine": ids,
        "owner": owner,
        "signature": signature,
    });
    short_id(Digest::sha256(data.to_string().as_bytes()))
}
