use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod chain;
pub mod constants;
pub mod error;
pub mod mine;

pub use chain::Chain;
pub use error::{ChainError, Result};
pub use mine::CancelToken;

/// A batch of opaque transactions bound to its predecessor by hash.
///
/// `hash` stays `None` until the block is mined or restored from a snapshot.
/// It is never part of the hashed content: hashing goes through [`HashInput`],
/// which has no field for it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block<T> {
    pub index: u64,
    pub transactions: Vec<T>,
    pub timestamp: u64,
    pub previous_hash: String,
    pub nonce: u64,
    pub data: String,
    #[serde(default)]
    pub hash: Option<String>,
}

/// The storage form of a block. Identical to [`Block`], but on import the
/// `hash` must be present.
pub type BlockRecord<T> = Block<T>;

/// Every block field except `hash`.
#[derive(Serialize)]
struct HashInput<'a, T> {
    index: u64,
    transactions: &'a [T],
    timestamp: u64,
    previous_hash: &'a str,
    nonce: u64,
    data: &'a str,
}

impl<T> Block<T> {
    pub fn new(
        index: u64,
        transactions: Vec<T>,
        timestamp: u64,
        previous_hash: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        Self {
            index,
            transactions,
            timestamp,
            previous_hash: previous_hash.into(),
            nonce: 0,
            data: data.into(),
            hash: None,
        }
    }

    pub fn hash(&self) -> Option<&str> {
        self.hash.as_deref()
    }

    pub fn is_sealed(&self) -> bool {
        self.hash.is_some()
    }

    fn hash_input(&self) -> HashInput<'_, T> {
        HashInput {
            index: self.index,
            transactions: &self.transactions,
            timestamp: self.timestamp,
            previous_hash: &self.previous_hash,
            nonce: self.nonce,
            data: &self.data,
        }
    }
}

impl<T: Serialize> Block<T> {
    /// Deterministic JSON encoding of everything but `hash`, with object keys
    /// sorted at every depth.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let value = canonical_value(&self.hash_input())?;
        Ok(serde_json::to_vec(&value)?)
    }

    /// Hex SHA-256 of [`Block::canonical_bytes`].
    pub fn compute_hash(&self) -> Result<String> {
        Ok(sha256_hex(&self.canonical_bytes()?))
    }
}

fn canonical_value<S: Serialize>(input: &S) -> Result<Value> {
    Ok(sort_keys(serde_json::to_value(input)?))
}

/// Rebuilds objects in lexicographic key order. Holds whether or not
/// serde_json keeps insertion order.
fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, sort_keys(value)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Milliseconds since the UNIX epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Canonical form of a block prepared once, so a nonce search only rewrites
/// the `nonce` entry per attempt.
#[derive(Clone, Debug)]
pub(crate) struct NonceSearch {
    template: Map<String, Value>,
}

impl NonceSearch {
    pub(crate) fn new<T: Serialize>(block: &Block<T>) -> Result<Self> {
        match canonical_value(&block.hash_input())? {
            Value::Object(template) => Ok(Self { template }),
            other => Err(ChainError::Serialization(serde::ser::Error::custom(
                format!("block encoded as {other} instead of an object"),
            ))),
        }
    }

    pub(crate) fn hash_at(&mut self, nonce: u64) -> Result<String> {
        self.template.insert("nonce".to_string(), Value::from(nonce));
        Ok(sha256_hex(&serde_json::to_vec(&self.template)?))
    }
}

pub mod pow {
    use super::{Block, NonceSearch, Result};
    use crate::{constants::CANCEL_POLL_INTERVAL, ChainError, CancelToken};
    use serde::Serialize;
    use tracing::debug;

    /// True when the first `difficulty` hex characters of `hash` are all `'0'`.
    pub fn meets_difficulty(hash: &str, difficulty: u32) -> bool {
        let difficulty = difficulty as usize;
        hash.len() >= difficulty && hash.bytes().take(difficulty).all(|b| b == b'0')
    }

    /// A claimed hash is only valid if it has the leading zeros AND matches
    /// the block content.
    pub fn is_valid_proof<T: Serialize>(
        block: &Block<T>,
        claimed_hash: &str,
        difficulty: u32,
    ) -> Result<bool> {
        if !meets_difficulty(claimed_hash, difficulty) {
            return Ok(false);
        }
        Ok(block.compute_hash()? == claimed_hash)
    }

    /// Resets the nonce to 0 and increments it until the hash meets
    /// `difficulty`. The winning nonce is left on the block.
    pub fn proof_of_work<T: Serialize>(block: &mut Block<T>, difficulty: u32) -> Result<String> {
        proof_of_work_cancellable(block, difficulty, &CancelToken::new())
    }

    /// Same search as [`proof_of_work`], giving up once `cancel` fires.
    pub fn proof_of_work_cancellable<T: Serialize>(
        block: &mut Block<T>,
        difficulty: u32,
        cancel: &CancelToken,
    ) -> Result<String> {
        block.nonce = 0;
        let mut search = NonceSearch::new(block)?;
        let mut nonce = 0u64;
        loop {
            if nonce % CANCEL_POLL_INTERVAL == 0 && cancel.is_cancelled() {
                return Err(ChainError::Cancelled { nonce });
            }
            let hash = search.hash_at(nonce)?;
            if meets_difficulty(&hash, difficulty) {
                block.nonce = nonce;
                debug!(index = block.index, nonce, %hash, "proof of work found");
                return Ok(hash);
            }
            nonce = nonce.checked_add(1).ok_or(ChainError::NonceSpaceExhausted)?;
        }
    }
}
