use std::path::PathBuf;
use std::sync::Arc;

use candle_core::Device;

use crate::batch::{Batch, BatchPolicy, OrderedBatchIterator};
use crate::error::DataError;
use crate::fields::FieldSet;
use crate::shard::{ShardCatalog, ShardDataset};

/// Where the iterator stands in its two-level walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterState {
    /// A batch iterator over the current shard is live (or about to be
    /// created on the next pull).
    Active,
    /// Terminal: no shards remain.
    Exhausted,
}

/// Chains batch iteration across every shard of a corpus role.
///
/// Explicit two-level state machine: `next_shard` is the outer cursor over
/// the discovered shard paths, `current` the inner batch iterator. A shard
/// is read from disk only when the cursor reaches it, gets the shared field
/// set bound, and is dropped once its batches are consumed. Batches never
/// span shards and shards are never reordered.
///
/// An empty catalog surfaces as `MissingData` on the first pull, not at
/// construction.
pub struct MultiShardIterator {
    role: String,
    paths: Vec<PathBuf>,
    fields: Arc<FieldSet>,
    policy: BatchPolicy,
    device: Device,
    next_shard: usize,
    current: Option<OrderedBatchIterator>,
    state: IterState,
}

impl MultiShardIterator {
    pub fn new(
        catalog: ShardCatalog,
        fields: Arc<FieldSet>,
        policy: BatchPolicy,
        device: Device,
    ) -> Self {
        Self {
            role: catalog.role().to_string(),
            paths: catalog.paths().to_vec(),
            fields,
            policy,
            device,
            next_shard: 0,
            current: None,
            state: IterState::Active,
        }
    }

    pub fn state(&self) -> IterState {
        self.state
    }

    /// Batch count of the currently active shard. The global total is
    /// unknowable without loading every shard, so it is never reported.
    pub fn current_len(&self) -> Option<usize> {
        self.current.as_ref().map(|iter| iter.len())
    }

    /// Zero-based index of the shard whose batches are being yielded.
    pub fn shard_index(&self) -> Option<usize> {
        if self.current.is_some() {
            Some(self.next_shard - 1)
        } else {
            None
        }
    }

    fn advance_shard(&mut self) -> Result<bool, DataError> {
        while self.next_shard < self.paths.len() {
            let path = &self.paths[self.next_shard];
            let mut shard = ShardDataset::load(path)?;
            shard.bind_fields(self.fields.clone());
            println!(
                "Loading {} dataset from {} ({} examples)",
                self.role,
                path.display(),
                shard.len()
            );
            let iter = OrderedBatchIterator::new(shard, self.policy, self.device.clone())?;
            self.next_shard += 1;
            if iter.is_empty() {
                continue;
            }
            self.current = Some(iter);
            return Ok(true);
        }
        Ok(false)
    }
}

impl Iterator for MultiShardIterator {
    type Item = Result<Batch, DataError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.state == IterState::Exhausted {
            return None;
        }

        loop {
            if let Some(iter) = self.current.as_mut() {
                match iter.next() {
                    Some(item) => return Some(item),
                    None => {
                        self.current = None;
                        continue;
                    }
                }
            }

            if self.paths.is_empty() {
                self.state = IterState::Exhausted;
                return Some(Err(DataError::missing(format!(
                    "no shard files found for role '{}'",
                    self.role
                ))));
            }

            match self.advance_shard() {
                Ok(true) => continue,
                Ok(false) => {
                    self.state = IterState::Exhausted;
                    return None;
                }
                Err(err) => {
                    self.state = IterState::Exhausted;
                    return Some(Err(err));
                }
            }
        }
    }
}
