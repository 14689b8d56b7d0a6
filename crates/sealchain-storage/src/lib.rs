pub mod sled_store;

use anyhow::Result;
use sealchain_core::{Chain, ChainError};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

/// Attempts `update_chain` makes before giving up on a contended entity.
pub const MAX_CAS_RETRIES: usize = 16;

/// Byte-level storage of one serialized chain per entity. The store, not the
/// chain, decides which writer wins when two act on the same entity.
pub trait SnapshotStore: Send + Sync {
    fn get_snapshot(&self, entity: &str) -> Result<Option<Vec<u8>>>;
    fn put_snapshot(&self, entity: &str, snapshot: &[u8]) -> Result<()>;
    /// Writes only if the entity has no snapshot yet.
    fn create_snapshot(&self, entity: &str, snapshot: &[u8]) -> Result<bool>;
    /// Writes only if the stored bytes still equal `current`.
    fn compare_and_swap_snapshot(
        &self,
        entity: &str,
        current: Option<&[u8]>,
        snapshot: &[u8],
    ) -> Result<bool>;
    fn remove_snapshot(&self, entity: &str) -> Result<bool>;
    fn entity_ids(&self) -> Result<Vec<String>>;
    fn close(&self) -> Result<()>;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("snapshot of entity {entity} kept changing after {attempts} attempts")]
    Contended { entity: String, attempts: usize },
}

/// How much a hydrated chain is trusted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Integrity {
    /// Stored hashes are taken as is.
    Trusted,
    /// Every block is rehashed and relinked before use.
    Verified { difficulty: u32 },
}

fn decode<T>(bytes: &[u8], integrity: Integrity) -> Result<Chain<T>>
where
    T: Serialize + DeserializeOwned + Clone,
{
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| ChainError::MalformedSnapshot(e.to_string()))?;
    let chain = match integrity {
        Integrity::Trusted => Chain::restore_trusted_json(value)?,
        Integrity::Verified { difficulty } => Chain::restore_and_verify_json(value, difficulty)?,
    };
    Ok(chain)
}

fn encode<T>(chain: &Chain<T>) -> Result<Vec<u8>>
where
    T: Serialize + Clone,
{
    Ok(serde_json::to_vec(chain.blocks())?)
}

/// Loads the chain of `entity`, or `None` if it has never been stored.
pub fn hydrate<T, S>(store: &S, entity: &str, integrity: Integrity) -> Result<Option<Chain<T>>>
where
    T: Serialize + DeserializeOwned + Clone,
    S: SnapshotStore + ?Sized,
{
    store
        .get_snapshot(entity)?
        .map(|bytes| decode(&bytes, integrity))
        .transpose()
}

/// Overwrites the stored chain of `entity` unconditionally.
pub fn dehydrate<T, S>(store: &S, entity: &str, chain: &Chain<T>) -> Result<()>
where
    T: Serialize + Clone,
    S: SnapshotStore + ?Sized,
{
    store.put_snapshot(entity, &encode(chain)?)
}

/// Stores a fresh genesis chain for `entity` unless one exists.
pub fn init_chain<T, S>(store: &S, entity: &str) -> Result<bool>
where
    T: Serialize + Clone,
    S: SnapshotStore + ?Sized,
{
    let chain: Chain<T> = Chain::new()?;
    let created = store.create_snapshot(entity, &encode(&chain)?)?;
    debug!(entity, created, "genesis chain initialised");
    Ok(created)
}

/// Hydrates the chain of `entity`, runs `f` on it and writes it back only if
/// nobody else wrote in between. On a conflict the whole cycle reruns on the
/// newer snapshot, so `f` may be called more than once. When `f` fails
/// nothing is written.
///
/// Returns `None` if the entity has no chain.
pub fn update_chain<T, S, R, F>(
    store: &S,
    entity: &str,
    integrity: Integrity,
    mut f: F,
) -> Result<Option<R>>
where
    T: Serialize + DeserializeOwned + Clone,
    S: SnapshotStore + ?Sized,
    F: FnMut(&mut Chain<T>) -> sealchain_core::Result<R>,
{
    for attempt in 1..=MAX_CAS_RETRIES {
        let Some(current) = store.get_snapshot(entity)? else {
            return Ok(None);
        };
        let mut chain = decode::<T>(&current, integrity)?;
        let out = f(&mut chain)?;
        let next = encode(&chain)?;
        if store.compare_and_swap_snapshot(entity, Some(&current), &next)? {
            return Ok(Some(out));
        }
        warn!(entity, attempt, "snapshot changed concurrently, retrying");
    }
    Err(StoreError::Contended {
        entity: entity.to_string(),
        attempts: MAX_CAS_RETRIES,
    }
    .into())
}
