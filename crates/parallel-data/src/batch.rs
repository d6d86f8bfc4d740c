use std::collections::VecDeque;
use std::sync::Arc;

use candle_core::{Device, Tensor};

use crate::error::DataError;
use crate::fields::FieldSet;
use crate::shard::{Example, ShardDataset};

/// Batch sizing policy, fixed at iterator construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPolicy {
    /// At most this many examples per batch.
    FixedExamples(usize),
    /// Grow a batch while the summed example cost stays within the budget.
    /// An example whose cost alone exceeds the budget forms its own batch.
    TokenBudget(usize),
}

/// Cost of one example under the token-budget policy.
pub fn example_cost(example: &Example) -> usize {
    example.tgt.len().max(example.src.len()) + 1
}

/// A sorted group of examples materialized as padded id tensors on the
/// run's device. Consumed exactly once.
#[derive(Debug)]
pub struct Batch {
    pub src: Tensor,
    pub tgt: Tensor,
    pub labels: Tensor,
    pub src_lengths: Vec<usize>,
    pub tgt_lengths: Vec<usize>,
    pub sentences: usize,
    pub tokens: usize,
    pub device: Device,
}

impl Batch {
    fn from_examples(
        examples: Vec<Example>,
        fields: &FieldSet,
        device: &Device,
    ) -> Result<Self, DataError> {
        let sentences = examples.len();
        let src_vocab = &fields.src().vocab;
        let tgt_vocab = &fields.tgt().vocab;
        let nli_vocab = &fields.nli().vocab;

        let src_lengths: Vec<usize> = examples.iter().map(|ex| ex.src.len()).collect();
        let tgt_lengths: Vec<usize> = examples.iter().map(|ex| ex.tgt.len()).collect();
        let max_src = src_lengths.iter().copied().max().unwrap_or(0).max(1);
        let max_tgt = tgt_lengths.iter().copied().max().unwrap_or(0).max(1);
        let tokens = tgt_lengths.iter().sum();

        let mut src_ids = Vec::with_capacity(sentences * max_src);
        let mut tgt_ids = Vec::with_capacity(sentences * max_tgt);
        let mut label_ids = Vec::with_capacity(sentences);
        for example in &examples {
            pad_row(&mut src_ids, &example.src, max_src, src_vocab.pad_id(), |tok| {
                src_vocab.lookup(tok)
            });
            pad_row(&mut tgt_ids, &example.tgt, max_tgt, tgt_vocab.pad_id(), |tok| {
                tgt_vocab.lookup(tok)
            });
            label_ids.push(nli_vocab.lookup(&example.label) as i64);
        }

        let src =
            Tensor::from_vec(src_ids, (sentences, max_src), device).map_err(tensor_error)?;
        let tgt =
            Tensor::from_vec(tgt_ids, (sentences, max_tgt), device).map_err(tensor_error)?;
        let labels = Tensor::from_vec(label_ids, sentences, device).map_err(tensor_error)?;

        Ok(Self {
            src,
            tgt,
            labels,
            src_lengths,
            tgt_lengths,
            sentences,
            tokens,
            device: device.clone(),
        })
    }
}

fn pad_row<F: Fn(&str) -> u32>(
    out: &mut Vec<i64>,
    tokens: &[String],
    width: usize,
    pad_id: u32,
    lookup: F,
) {
    for token in tokens {
        out.push(lookup(token) as i64);
    }
    for _ in tokens.len()..width {
        out.push(pad_id as i64);
    }
}

fn tensor_error(err: candle_core::Error) -> DataError {
    DataError::runtime(format!("failed to materialize batch tensor: {}", err))
}

/// Batches over one loaded shard. Grouping happens up front so the batch
/// count is known; tensors are built lazily as batches are consumed.
///
/// Examples are sorted by descending length inside each group only. The sort
/// is stable, so ties keep shard order, and no example ever crosses a group
/// boundary.
pub struct OrderedBatchIterator {
    groups: VecDeque<Vec<Example>>,
    fields: Arc<FieldSet>,
    device: Device,
    total: usize,
}

impl OrderedBatchIterator {
    pub fn new(
        dataset: ShardDataset,
        policy: BatchPolicy,
        device: Device,
    ) -> Result<Self, DataError> {
        match policy {
            BatchPolicy::FixedExamples(0) => {
                return Err(DataError::runtime(
                    "fixed batch size must be greater than zero",
                ));
            }
            BatchPolicy::TokenBudget(0) => {
                return Err(DataError::runtime(
                    "token budget must be greater than zero",
                ));
            }
            _ => {}
        }

        let fields = dataset
            .fields()
            .cloned()
            .ok_or_else(|| DataError::runtime("dataset has no bound field set"))?;

        let mut groups = group_examples(dataset.examples, policy);
        for group in &mut groups {
            group.sort_by(|a, b| {
                (b.src.len(), b.tgt.len()).cmp(&(a.src.len(), a.tgt.len()))
            });
        }
        let total = groups.len();

        Ok(Self {
            groups,
            fields,
            device,
            total,
        })
    }

    /// Batch count of this shard, fixed at construction.
    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn remaining(&self) -> usize {
        self.groups.len()
    }
}

impl Iterator for OrderedBatchIterator {
    type Item = Result<Batch, DataError>;

    fn next(&mut self) -> Option<Self::Item> {
        let group = self.groups.pop_front()?;
        Some(Batch::from_examples(group, &self.fields, &self.device))
    }
}

fn group_examples(examples: Vec<Example>, policy: BatchPolicy) -> VecDeque<Vec<Example>> {
    let mut groups = VecDeque::new();
    let mut current: Vec<Example> = Vec::new();
    let mut cost_sofar = 0usize;

    for example in examples {
        match policy {
            BatchPolicy::FixedExamples(cap) => {
                current.push(example);
                if current.len() >= cap {
                    groups.push_back(std::mem::take(&mut current));
                }
            }
            BatchPolicy::TokenBudget(budget) => {
                let cost = example_cost(&example);
                if !current.is_empty() && cost_sofar + cost > budget {
                    groups.push_back(std::mem::take(&mut current));
                    cost_sofar = 0;
                }
                cost_sofar += cost;
                current.push(example);
                if current.len() == 1 && cost > budget {
                    groups.push_back(std::mem::take(&mut current));
                    cost_sofar = 0;
                }
            }
        }
    }

    if !current.is_empty() {
        groups.push_back(current);
    }

    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::{Field, FieldSet, Vocab};
    use crate::shard::DataType;
    use std::collections::BTreeMap;

    fn example(src_len: usize, tgt_len: usize, tag: &str) -> Example {
        Example {
            src: (0..src_len).map(|i| format!("s{}", i)).collect(),
            tgt: (0..tgt_len).map(|i| format!("t{}", i)).collect(),
            label: tag.to_string(),
            feats: BTreeMap::new(),
        }
    }

    fn field_set() -> Arc<FieldSet> {
        let mut fields = BTreeMap::new();
        let src_tokens: Vec<String> = (0..32).map(|i| format!("s{}", i)).collect();
        let tgt_tokens: Vec<String> = (0..32)
            .map(|i| format!("t{}", i))
            .chain(["yes".to_string(), "no".to_string()])
            .collect();
        fields.insert(
            "src".to_string(),
            Field {
                vocab: Vocab::from_tokens(src_tokens),
            },
        );
        fields.insert(
            "tgt".to_string(),
            Field {
                vocab: Vocab::from_tokens(tgt_tokens),
            },
        );
        Arc::new(FieldSet::new(fields).unwrap())
    }

    fn dataset(examples: Vec<Example>) -> ShardDataset {
        let mut dataset = ShardDataset::new(DataType::Text, examples);
        dataset.bind_fields(field_set());
        dataset
    }

    #[test]
    fn fixed_policy_groups_by_count() {
        let examples = (0..10).map(|_| example(2, 3, "yes")).collect();
        let iter = OrderedBatchIterator::new(
            dataset(examples),
            BatchPolicy::FixedExamples(4),
            Device::Cpu,
        )
        .unwrap();
        assert_eq!(iter.len(), 3);

        let sizes: Vec<usize> = iter.map(|batch| batch.unwrap().sentences).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[test]
    fn token_budget_never_exceeded_except_oversized_singleton() {
        let budget = 10;
        let examples = vec![
            example(3, 2, "yes"), // cost 4
            example(2, 4, "no"),  // cost 5
            example(4, 1, "yes"), // cost 5 -> new batch
            example(20, 3, "no"), // cost 21 -> own batch
            example(1, 1, "yes"), // cost 2
        ];
        let groups = group_examples(examples, BatchPolicy::TokenBudget(budget));
        let costs: Vec<usize> = groups
            .iter()
            .map(|group| group.iter().map(example_cost).sum())
            .collect();
        assert_eq!(costs, vec![9, 5, 21, 2]);
        for (group, cost) in groups.iter().zip(&costs) {
            assert!(*cost <= budget || group.len() == 1);
        }
    }

    #[test]
    fn sorts_within_batch_descending_and_stable() {
        let examples = vec![
            example(2, 2, "yes"),
            example(5, 1, "no"),
            example(2, 2, "no"),
            example(3, 4, "yes"),
        ];
        let mut iter = OrderedBatchIterator::new(
            dataset(examples),
            BatchPolicy::FixedExamples(4),
            Device::Cpu,
        )
        .unwrap();
        let batch = iter.next().unwrap().unwrap();
        assert_eq!(batch.src_lengths, vec![5, 3, 2, 2]);
        // the two length-2 examples keep their shard order
        let labels = batch.labels.to_vec1::<i64>().unwrap();
        let field_set = field_set();
        let vocab = &field_set.tgt().vocab;
        assert_eq!(labels[2], vocab.lookup("yes") as i64);
        assert_eq!(labels[3], vocab.lookup("no") as i64);
    }

    #[test]
    fn batch_tensors_are_padded_to_widest_row() {
        let examples = vec![example(4, 2, "yes"), example(2, 3, "no")];
        let mut iter = OrderedBatchIterator::new(
            dataset(examples),
            BatchPolicy::FixedExamples(2),
            Device::Cpu,
        )
        .unwrap();
        let batch = iter.next().unwrap().unwrap();
        assert_eq!(batch.src.dims(), &[2, 4]);
        assert_eq!(batch.tgt.dims(), &[2, 3]);
        assert_eq!(batch.tokens, 5);

        let src_rows = batch.src.to_vec2::<i64>().unwrap();
        let pad = field_set().src().vocab.pad_id() as i64;
        assert_eq!(src_rows[1][2], pad);
        assert_eq!(src_rows[1][3], pad);
    }

    #[test]
    fn zero_sized_policies_rejected() {
        let err = OrderedBatchIterator::new(
            dataset(vec![example(1, 1, "yes")]),
            BatchPolicy::FixedExamples(0),
            Device::Cpu,
        );
        assert!(err.is_err());
    }
}
