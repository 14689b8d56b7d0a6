use crate::{
    constants::{GENESIS_DATA, GENESIS_PREVIOUS_HASH, HASH_HEX_SIZE},
    mine::proof_of_work_parallel,
    now_millis,
    pow::{self, meets_difficulty},
    Block, BlockRecord, CancelToken, ChainError, Result,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

/// Hash-linked blocks anchored at a genesis block, plus the pool of
/// transactions waiting to be mined.
///
/// A chain is built fresh or restored from a snapshot, mutated by one owner,
/// exported, and dropped. There is no internal locking.
#[derive(Clone, Debug)]
pub struct Chain<T> {
    // never empty; every block carries its hash
    blocks: Vec<Block<T>>,
    unconfirmed: Vec<T>,
}

impl<T: Serialize + Clone> Chain<T> {
    /// A chain holding only a genesis block stamped with the current time.
    pub fn new() -> Result<Self> {
        Self::with_genesis_timestamp(now_millis())
    }

    /// Genesis hash is computed, not mined: difficulty does not apply to it.
    pub fn with_genesis_timestamp(timestamp: u64) -> Result<Self> {
        let mut genesis = Block::new(0, Vec::new(), timestamp, GENESIS_PREVIOUS_HASH, GENESIS_DATA);
        genesis.hash = Some(genesis.compute_hash()?);
        Ok(Self {
            blocks: vec![genesis],
            unconfirmed: Vec::new(),
        })
    }

    /// Rebuilds a chain from stored records, taking every field as stored.
    /// Hashes are not recomputed and linkage is not checked; use
    /// [`Chain::restore_and_verify`] when the store is not trusted.
    pub fn restore_trusted(records: Vec<BlockRecord<T>>) -> Result<Self> {
        if records.is_empty() {
            return Err(ChainError::MalformedSnapshot(
                "snapshot contains no blocks".to_string(),
            ));
        }
        if let Some(pos) = records.iter().position(|r| r.hash.is_none()) {
            return Err(ChainError::MalformedSnapshot(format!(
                "record {pos} has no hash"
            )));
        }
        debug!(blocks = records.len(), "chain restored from snapshot");
        Ok(Self {
            blocks: records,
            unconfirmed: Vec::new(),
        })
    }

    /// Restores, then walks the whole chain with [`Chain::verify`].
    pub fn restore_and_verify(records: Vec<BlockRecord<T>>, difficulty: u32) -> Result<Self> {
        let chain = Self::restore_trusted(records)?;
        chain.verify(difficulty)?;
        Ok(chain)
    }

    /// Checks indices, stored hashes against content, difficulty of every
    /// mined block and linkage to the predecessor. Reports the first break.
    pub fn verify(&self, difficulty: u32) -> Result<()> {
        let broken = |index: u64, reason: String| ChainError::BrokenChain { index, reason };

        for (pos, block) in self.blocks.iter().enumerate() {
            let pos = pos as u64;
            if block.index != pos {
                return Err(broken(pos, format!("expected index {pos}, found {}", block.index)));
            }
            let stored = block
                .hash()
                .ok_or_else(|| broken(pos, "missing hash".to_string()))?;
            if stored.len() != HASH_HEX_SIZE {
                return Err(broken(
                    pos,
                    format!("stored hash has {} characters, expected {HASH_HEX_SIZE}", stored.len()),
                ));
            }
            if block.compute_hash()? != stored {
                return Err(broken(pos, "stored hash does not match block content".to_string()));
            }
            let expected_previous = match pos {
                0 => GENESIS_PREVIOUS_HASH,
                _ => self.blocks[pos as usize - 1].hash().unwrap_or_default(),
            };
            if block.previous_hash != expected_previous {
                return Err(broken(
                    pos,
                    format!(
                        "previous hash {} does not link to {}",
                        block.previous_hash, expected_previous
                    ),
                ));
            }
            if pos > 0 && !meets_difficulty(stored, difficulty) {
                return Err(broken(pos, format!("hash {stored} misses difficulty {difficulty}")));
            }
        }
        Ok(())
    }

    pub fn last_block(&self) -> &Block<T> {
        &self.blocks[self.blocks.len() - 1]
    }

    fn head_hash(&self) -> &str {
        self.last_block().hash().unwrap_or_default()
    }

    pub fn blocks(&self) -> &[Block<T>] {
        &self.blocks
    }

    pub fn into_blocks(self) -> Vec<Block<T>> {
        self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Always false: a chain holds at least its genesis block.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn add_new_transaction(&mut self, transaction: T) {
        self.unconfirmed.push(transaction);
    }

    pub fn pending(&self) -> &[T] {
        &self.unconfirmed
    }

    /// Appends `block` sealed with `claimed_hash` if it links to the head
    /// and the proof holds. Leaves the chain untouched otherwise.
    pub fn add_block(&mut self, mut block: Block<T>, claimed_hash: String, difficulty: u32) -> Result<()> {
        let head_hash = self.head_hash();
        if block.previous_hash != head_hash {
            warn!(index = block.index, "block does not link to the chain head");
            return Err(ChainError::LinkageMismatch {
                expected: head_hash.to_string(),
                found: block.previous_hash,
            });
        }
        if !pow::is_valid_proof(&block, &claimed_hash, difficulty)? {
            warn!(index = block.index, hash = %claimed_hash, "rejected invalid proof");
            return Err(ChainError::InvalidProof { index: block.index });
        }
        block.hash = Some(claimed_hash);
        self.blocks.push(block);
        Ok(())
    }

    /// Packs the pool into a new block, mines it and appends it. Returns the
    /// new block's index. The pool is cleared only when the block lands.
    pub fn mine(&mut self, data: impl Into<String>, difficulty: u32) -> Result<u64> {
        self.seal_pending(data.into(), difficulty, |block| {
            pow::proof_of_work(block, difficulty)
        })
    }

    /// [`Chain::mine`] with a search that stops when `cancel` fires.
    pub fn mine_cancellable(
        &mut self,
        data: impl Into<String>,
        difficulty: u32,
        cancel: &CancelToken,
    ) -> Result<u64> {
        self.seal_pending(data.into(), difficulty, |block| {
            pow::proof_of_work_cancellable(block, difficulty, cancel)
        })
    }

    /// [`Chain::mine`] with the nonce search spread over the rayon pool.
    pub fn mine_parallel(
        &mut self,
        data: impl Into<String>,
        difficulty: u32,
        cancel: &CancelToken,
    ) -> Result<u64> {
        self.seal_pending(data.into(), difficulty, |block| {
            proof_of_work_parallel(block, difficulty, cancel)
        })
    }

    fn seal_pending<F>(&mut self, data: String, difficulty: u32, search: F) -> Result<u64>
    where
        F: FnOnce(&mut Block<T>) -> Result<String>,
    {
        if self.unconfirmed.is_empty() {
            debug!("mine requested with an empty pool");
            return Err(ChainError::EmptyPool);
        }

        let head = self.last_block();
        let mut block = Block::new(
            head.index + 1,
            self.unconfirmed.clone(),
            now_millis(),
            self.head_hash(),
            data,
        );
        let hash = search(&mut block)?;
        let index = block.index;
        self.add_block(block, hash, difficulty)?;
        self.unconfirmed.clear();
        info!(index, difficulty, "block mined and appended");
        Ok(index)
    }

    /// Every block, hashes included, in chain order.
    pub fn export(&self) -> Vec<BlockRecord<T>> {
        self.blocks.clone()
    }

    /// [`Chain::export`] as a JSON array of field maps.
    pub fn export_json(&self) -> Result<Value> {
        Ok(serde_json::to_value(&self.blocks)?)
    }
}

impl<T: Serialize + DeserializeOwned + Clone> Chain<T> {
    /// [`Chain::restore_trusted`] from a JSON array. A record that does not
    /// decode is reported with its position.
    pub fn restore_trusted_json(snapshot: Value) -> Result<Self> {
        Self::restore_trusted(records_from_json(snapshot)?)
    }

    /// [`Chain::restore_and_verify`] from a JSON array.
    pub fn restore_and_verify_json(snapshot: Value, difficulty: u32) -> Result<Self> {
        Self::restore_and_verify(records_from_json(snapshot)?, difficulty)
    }
}

fn records_from_json<T: DeserializeOwned>(snapshot: Value) -> Result<Vec<BlockRecord<T>>> {
    let Value::Array(items) = snapshot else {
        return Err(ChainError::MalformedSnapshot(
            "snapshot is not a list of blocks".to_string(),
        ));
    };
    items
        .into_iter()
        .enumerate()
        .map(|(pos, item)| {
            serde_json::from_value(item)
                .map_err(|e| ChainError::MalformedSnapshot(format!("record {pos}: {e}")))
        })
        .collect()
}
