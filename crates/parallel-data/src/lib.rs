//! Sharded parallel-text dataset handling: lazy shard loading, shared field
//! vocabularies, and deterministic batch iteration.

pub mod batch;
pub mod error;
pub mod fields;
pub mod iter;
pub mod shard;

pub use batch::{example_cost, Batch, BatchPolicy, OrderedBatchIterator};
pub use error::DataError;
pub use fields::{
    Field, FieldSet, Vocab, BOS_TOKEN, EOS_TOKEN, NLI_FIELD, PAD_TOKEN, SRC_FIELD, TGT_FIELD,
    UNK_TOKEN,
};
pub use iter::{IterState, MultiShardIterator};
pub use shard::{DataType, Example, ShardCatalog, ShardDataset};
