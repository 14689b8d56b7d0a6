use crate::SnapshotStore;
use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use sled::{Db, IVec, Tree};
use std::path::Path;
use tracing::{debug, info};

const TREE_CHAINS: &str = "chains";
const TREE_ENTITIES: &str = "entities";

/// One JSON chain snapshot per entity, plus free-form entity metadata.
#[derive(Clone)]
pub struct SledStore {
  db: Db,
  chains: Tree,
  entities: Tree,
}

impl SledStore {
  pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
    let db = sled::open(path.as_ref())
      .with_context(|| format!("opening sled store at {}", path.as_ref().display()))?;
    let store = Self::from_db(db)?;
    info!("sled store opened");
    Ok(store)
  }

  /// In-memory store removed on drop.
  pub fn temporary() -> Result<Self> {
    let db = sled::Config::new().temporary(true).open()?;
    Self::from_db(db)
  }

  fn from_db(db: Db) -> Result<Self> {
    let chains = db.open_tree(TREE_CHAINS)?;
    let entities = db.open_tree(TREE_ENTITIES)?;
    Ok(Self { db, chains, entities })
  }

  /// Monotonic id, unique for the lifetime of the database.
  pub fn next_entity_id(&self) -> Result<String> {
    Ok(self.db.generate_id()?.to_string())
  }

  pub fn put_metadata<M: Serialize>(&self, entity: &str, metadata: &M) -> Result<()> {
    self
      .entities
      .insert(entity, serde_json::to_vec(metadata)?)?;
    Ok(())
  }

  pub fn get_metadata<M: DeserializeOwned>(&self, entity: &str) -> Result<Option<M>> {
    self
      .entities
      .get(entity)?
      .map(|v: IVec| serde_json::from_slice(&v))
      .transpose()
      .with_context(|| format!("decoding metadata of entity {entity}"))
  }

  /// Drops every chain and every entity.
  pub fn clear(&self) -> Result<()> {
    self.chains.clear()?;
    self.entities.clear()?;
    self.db.flush()?;
    Ok(())
  }
}

impl SnapshotStore for SledStore {
  fn get_snapshot(&self, entity: &str) -> Result<Option<Vec<u8>>> {
    Ok(self.chains.get(entity)?.map(|v| v.to_vec()))
  }

  fn put_snapshot(&self, entity: &str, snapshot: &[u8]) -> Result<()> {
    self.chains.insert(entity, snapshot)?;
    self.db.flush()?;
    debug!(entity, bytes = snapshot.len(), "snapshot written");
    Ok(())
  }

  fn create_snapshot(&self, entity: &str, snapshot: &[u8]) -> Result<bool> {
    self.compare_and_swap_snapshot(entity, None, snapshot)
  }

  fn compare_and_swap_snapshot(
    &self,
    entity: &str,
    current: Option<&[u8]>,
    snapshot: &[u8],
  ) -> Result<bool> {
    let swapped = self
      .chains
      .compare_and_swap(entity, current, Some(snapshot))?
      .is_ok();
    if swapped {
      self.db.flush()?;
      debug!(entity, bytes = snapshot.len(), "snapshot swapped");
    }
    Ok(swapped)
  }

  fn remove_snapshot(&self, entity: &str) -> Result<bool> {
    let removed = self.chains.remove(entity)?.is_some();
    self.entities.remove(entity)?;
    self.db.flush()?;
    debug!(entity, removed, "snapshot removed");
    Ok(removed)
  }

  fn entity_ids(&self) -> Result<Vec<String>> {
    self
      .chains
      .iter()
      .keys()
      .map(|key| -> Result<String> { Ok(String::from_utf8(key?.to_vec())?) })
      .collect()
  }

  fn close(&self) -> Result<()> {
    self.db.flush()?;
    Ok(())
  }
}
