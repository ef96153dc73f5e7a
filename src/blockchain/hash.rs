use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use thiserror::Error;

use std::fmt;
use std::str::FromStr;

/// Errors that can occur while computing or parsing proof-of-work hashes
#[derive(Debug, Error)]
pub enum HashError {
    #[error("Invalid hash parameters: {0}")]
    InvalidParams(String),

    #[error("Hash derivation failed: {0}")]
    Derivation(String),

    #[error("Invalid digest: {0}")]
    InvalidDigest(String),
}

/// Argon2id cost parameters of the proof-of-work function
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowParams {
    /// Memory cost in KiB
    pub memory_kib: u32,

    /// Number of passes over memory
    pub time_cost: u32,

    /// Degree of parallelism
    pub lanes: u32,
}

impl Default for PowParams {
    fn default() -> Self {
        PowParams {
            memory_kib: 64 * 1024,
            time_cost: 1,
            lanes: 4,
        }
    }
}

/// A 256-bit digest, rendered as 64 lowercase hex characters
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Digest([u8; 32]);

impl Digest {
    /// All-zero digest, used as the genesis `previous_hash` sentinel
    pub const ZERO: Digest = Digest([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Digest(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// SHA-256 of arbitrary data
    pub fn sha256(data: &[u8]) -> Self {
        Digest(Sha256::digest(data).into())
    }

    /// Number of leading zero bits of the big-endian value
    pub fn leading_zero_bits(&self) -> u32 {
        let mut bits = 0;
        for byte in self.0.iter() {
            if *byte == 0 {
                bits += 8;
            } else {
                bits += byte.leading_zeros();
                break;
            }
        }
        bits
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First characters of the hex form, for log lines
    pub fn short(&self) -> String {
        self.to_hex()[..16].to_string()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl FromStr for Digest {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| HashError::InvalidDigest(e.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| HashError::InvalidDigest(format!("expected 32 bytes: {}", s)))?;
        Ok(Digest(bytes))
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The composite proof-of-work function
///
/// `compute` feeds `header ‖ decimal(nonce)` through Argon2id salted with the
/// previous block hash, then compresses the output with SHA-256. The engine
/// holds only immutable parameters and is safe to share between threads.
#[derive(Debug, Clone)]
pub struct HashEngine {
    params: Params,
}

impl HashEngine {
    /// Creates an engine, validating the cost parameters once
    pub fn new(pow: &PowParams) -> Result<Self, HashError> {
        let params = Params::new(pow.memory_kib, pow.time_cost, pow.lanes, Some(32))
            .map_err(|e| HashError::InvalidParams(e.to_string()))?;

        Ok(HashEngine { params })
    }

    /// Computes the proof-of-work digest of `header` at `nonce`
    pub fn compute(&self, header: &[u8], nonce: u64, previous_hash: &Digest) -> Result<Digest, HashError> {
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone());

        let mut input = Vec::with_capacity(header.len() + 20);
        input.extend_from_slice(header);
        input.extend_from_slice(nonce.to_string().as_bytes());

        let mut memory_hard = [0u8; 32];
        argon2
            .hash_password_into(&input, previous_hash.as_bytes(), &mut memory_hard)
            .map_err(|e| HashError::Derivation(e.to_string()))?;

        Ok(Digest::sha256(&memory_hard))
    }
}

/// Difficulty test
///
/// A digest meets difficulty `d` iff its big-endian value is at most
/// `(2^256 - 1) >> d`, i.e. it has at least `d` leading zero bits.
pub fn meets(difficulty: u32, digest: &Digest) -> bool {
    digest.leading_zero_bits() >= difficulty
}

/// Largest digest value accepted at `difficulty`
pub fn target_for(difficulty: u32) -> Digest {
    let mut target = [0xffu8; 32];
    let d = difficulty.min(256) as usize;
    for byte in target.iter_mut().take(d / 8) {
        *byte = 0;
    }
    if d < 256 && d % 8 != 0 {
        target[d / 8] = 0xff >> (d % 8);
    }
    Digest(target)
}

/// Expected number of hashes needed to meet `difficulty`
pub fn work_for(difficulty: u32) -> u128 {
    if difficulty >= 127 {
        1u128 << 127
    } else {
        1u128 << difficulty
    }
}
