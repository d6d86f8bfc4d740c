use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::config::TrainingError;
use crate::statistics::Statistics;

/// Token-level negative log likelihood over decoder logits, with padding
/// excluded and optional sharding over the target length.
///
/// Sharding slices the time dimension into `shard_size` windows and computes
/// each window's loss separately, then sums the pieces into one graph node.
/// The returned loss is a sum over valid tokens, never an average;
/// normalization is applied later, at the gradient step.
#[derive(Debug, Clone)]
pub struct SequenceLoss {
    pad_id: u32,
    shard_size: usize,
}

impl SequenceLoss {
    pub fn new(pad_id: u32, shard_size: usize) -> Self {
        Self { pad_id, shard_size }
    }

    /// `logits` is `[batch, steps, vocab]`, `targets` is `[batch, steps]`.
    pub fn compute(&self, logits: &Tensor, targets: &Tensor) -> Result<LossOutput, TrainingError> {
        let dims = logits.dims();
        if dims.len() != 3 {
            return Err(TrainingError::runtime(
                "sequence loss expects logits shaped [batch, steps, vocab]",
            ));
        }
        let (batch, steps, vocab) = (dims[0], dims[1], dims[2]);
        if vocab == 0 {
            return Err(TrainingError::runtime(
                "logits vocabulary dimension must be greater than zero",
            ));
        }
        if targets.dims() != [batch, steps] {
            return Err(TrainingError::runtime(
                "target tensor must match logits batch/step dimensions",
            ));
        }

        let window = if self.shard_size == 0 || self.shard_size >= steps {
            steps
        } else {
            self.shard_size
        };

        let mut total_loss: Option<Tensor> = None;
        let mut n_words = 0usize;
        let mut n_correct = 0usize;

        let mut start = 0;
        while start < steps {
            let len = window.min(steps - start);
            let logit_slice = logits.narrow(1, start, len).map_err(to_runtime_error)?;
            let target_slice = targets.narrow(1, start, len).map_err(to_runtime_error)?;
            let piece = self.masked_nll(&logit_slice, &target_slice)?;

            total_loss = Some(match total_loss {
                Some(acc) => (acc + piece.loss).map_err(to_runtime_error)?,
                None => piece.loss,
            });
            n_words += piece.n_words;
            n_correct += piece.n_correct;
            start += len;
        }

        let loss = total_loss
            .ok_or_else(|| TrainingError::runtime("no tokens available for loss computation"))?;
        if n_words == 0 {
            return Err(TrainingError::runtime(
                "no valid tokens remain after masking padding",
            ));
        }

        let loss_value = loss.to_vec0::<f32>().map_err(to_runtime_error)? as f64;
        Ok(LossOutput {
            loss,
            stats: Statistics::with(loss_value, n_words, n_correct),
        })
    }

    fn masked_nll(&self, logits: &Tensor, targets: &Tensor) -> Result<LossPiece, TrainingError> {
        let dims = logits.dims();
        let (token_count, vocab) = (dims[0] * dims[1], dims[2]);
        let device = logits.device();

        let logits_flat = logits
            .reshape((token_count, vocab))
            .map_err(to_runtime_error)?;
        let log_probs = ops::log_softmax(&logits_flat, D::Minus1).map_err(to_runtime_error)?;

        let targets_flat = targets
            .to_device(device)
            .map_err(to_runtime_error)?
            .reshape((token_count,))
            .map_err(to_runtime_error)?
            .to_dtype(DType::U32)
            .map_err(to_runtime_error)?;

        let valid_mask = targets_flat
            .ne(self.pad_id)
            .map_err(to_runtime_error)?
            .to_dtype(DType::F32)
            .map_err(to_runtime_error)?;

        let target_indices = targets_flat.unsqueeze(1).map_err(to_runtime_error)?;
        let nll = log_probs
            .gather(&target_indices, 1)
            .map_err(to_runtime_error)?
            .neg()
            .map_err(to_runtime_error)?
            .squeeze(1)
            .map_err(to_runtime_error)?;

        let weighted = (&nll * &valid_mask).map_err(to_runtime_error)?;
        let loss = weighted.sum_all().map_err(to_runtime_error)?;

        let n_words = valid_mask
            .sum_all()
            .map_err(to_runtime_error)?
            .to_vec0::<f32>()
            .map_err(to_runtime_error)?
            .round() as usize;

        let predictions = logits_flat.argmax(D::Minus1).map_err(to_runtime_error)?;
        let correct = predictions
            .eq(&targets_flat)
            .map_err(to_runtime_error)?
            .to_dtype(DType::F32)
            .map_err(to_runtime_error)?;
        let n_correct = (&correct * &valid_mask)
            .map_err(to_runtime_error)?
            .sum_all()
            .map_err(to_runtime_error)?
            .to_vec0::<f32>()
            .map_err(to_runtime_error)?
            .round() as usize;

        Ok(LossPiece {
            loss,
            n_words,
            n_correct,
        })
    }
}

struct LossPiece {
    loss: Tensor,
    n_words: usize,
    n_correct: usize,
}

/// Cross entropy over classifier logits `[batch, classes]` against integer
/// labels `[batch]`. Every row counts; there is no padding at this level.
#[derive(Debug, Clone, Default)]
pub struct LabelLoss;

impl LabelLoss {
    pub fn compute(&self, logits: &Tensor, labels: &Tensor) -> Result<LossOutput, TrainingError> {
        let dims = logits.dims();
        if dims.len() != 2 {
            return Err(TrainingError::runtime(
                "label loss expects logits shaped [batch, classes]",
            ));
        }
        let (batch, classes) = (dims[0], dims[1]);
        if batch == 0 || classes == 0 {
            return Err(TrainingError::runtime(
                "label loss requires a non-empty batch and class dimension",
            ));
        }
        if labels.dims() != [batch] {
            return Err(TrainingError::runtime(
                "label tensor must have one entry per batch row",
            ));
        }

        let device = logits.device();
        let log_probs = ops::log_softmax(logits, D::Minus1).map_err(to_runtime_error)?;
        let labels_flat = labels
            .to_device(device)
            .map_err(to_runtime_error)?
            .to_dtype(DType::U32)
            .map_err(to_runtime_error)?;

        let label_indices = labels_flat.unsqueeze(1).map_err(to_runtime_error)?;
        let loss = log_probs
            .gather(&label_indices, 1)
            .map_err(to_runtime_error)?
            .neg()
            .map_err(to_runtime_error)?
            .sum_all()
            .map_err(to_runtime_error)?;

        let predictions = logits.argmax(D::Minus1).map_err(to_runtime_error)?;
        let n_correct = predictions
            .eq(&labels_flat)
            .map_err(to_runtime_error)?
            .to_dtype(DType::F32)
            .map_err(to_runtime_error)?
            .sum_all()
            .map_err(to_runtime_error)?
            .to_vec0::<f32>()
            .map_err(to_runtime_error)?
            .round() as usize;

        let loss_value = loss.to_vec0::<f32>().map_err(to_runtime_error)? as f64;
        Ok(LossOutput {
            loss,
            stats: Statistics::with(loss_value, batch, n_correct),
        })
    }
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    pub loss: Tensor,
    pub stats: Statistics,
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    const PAD: u32 = 1;

    fn uniform_logits(batch: usize, steps: usize, vocab: usize) -> Tensor {
        Tensor::zeros((batch, steps, vocab), DType::F32, &Device::Cpu).unwrap()
    }

    fn targets(rows: &[&[i64]]) -> Tensor {
        let flat: Vec<i64> = rows.iter().flat_map(|row| row.iter().copied()).collect();
        Tensor::from_vec(flat, (rows.len(), rows[0].len()), &Device::Cpu).unwrap()
    }

    #[test]
    fn uniform_logits_give_log_vocab_per_token() {
        let loss = SequenceLoss::new(PAD, 0);
        let logits = uniform_logits(2, 3, 8);
        let tgt = targets(&[&[2, 3, 4], &[5, 6, 7]]);

        let out = loss.compute(&logits, &tgt).unwrap();
        assert_eq!(out.stats.n_words, 6);
        let expected = 6.0 * (8f64).ln();
        assert!((out.stats.loss - expected).abs() < 1e-4);
    }

    #[test]
    fn padding_is_excluded_from_counts_and_loss() {
        let loss = SequenceLoss::new(PAD, 0);
        let logits = uniform_logits(2, 3, 8);
        let tgt = targets(&[&[2, 3, PAD as i64], &[5, PAD as i64, PAD as i64]]);

        let out = loss.compute(&logits, &tgt).unwrap();
        assert_eq!(out.stats.n_words, 3);
        let expected = 3.0 * (8f64).ln();
        assert!((out.stats.loss - expected).abs() < 1e-4);
    }

    #[test]
    fn sharded_loss_matches_unsharded() {
        let device = Device::Cpu;
        let values: Vec<f32> = (0..2 * 5 * 4).map(|i| (i as f32 * 0.37).sin()).collect();
        let logits = Tensor::from_vec(values, (2, 5, 4), &device).unwrap();
        let tgt = targets(&[&[2, 3, 0, 2, PAD as i64], &[3, 2, 1, 0, 3]]);

        let whole = SequenceLoss::new(PAD, 0).compute(&logits, &tgt).unwrap();
        let sharded = SequenceLoss::new(PAD, 2).compute(&logits, &tgt).unwrap();

        assert_eq!(whole.stats.n_words, sharded.stats.n_words);
        assert_eq!(whole.stats.n_correct, sharded.stats.n_correct);
        assert!((whole.stats.loss - sharded.stats.loss).abs() < 1e-4);
    }

    #[test]
    fn shard_size_larger_than_steps_is_one_window() {
        let loss = SequenceLoss::new(PAD, 100);
        let logits = uniform_logits(1, 4, 6);
        let tgt = targets(&[&[2, 3, 4, 5]]);

        let out = loss.compute(&logits, &tgt).unwrap();
        assert_eq!(out.stats.n_words, 4);
    }

    #[test]
    fn all_padding_is_an_error() {
        let loss = SequenceLoss::new(PAD, 0);
        let logits = uniform_logits(1, 2, 4);
        let tgt = targets(&[&[PAD as i64, PAD as i64]]);

        assert!(loss.compute(&logits, &tgt).is_err());
    }

    #[test]
    fn shape_mismatch_is_an_error() {
        let loss = SequenceLoss::new(PAD, 0);
        let logits = uniform_logits(2, 3, 4);
        let tgt = targets(&[&[2, 3], &[0, 1]]);

        assert!(loss.compute(&logits, &tgt).is_err());
    }

    #[test]
    fn label_loss_counts_correct_predictions() {
        let device = Device::Cpu;
        let logits = Tensor::from_vec(
            vec![5f32, 0.0, 0.0, 5.0, 5.0, 0.0],
            (3, 2),
            &device,
        )
        .unwrap();
        let labels = Tensor::from_vec(vec![0i64, 1, 1], (3,), &device).unwrap();

        let out = LabelLoss.compute(&logits, &labels).unwrap();
        assert_eq!(out.stats.n_words, 3);
        assert_eq!(out.stats.n_correct, 2);
        assert!(out.stats.loss > 0.0);
    }

    #[test]
    fn label_loss_rejects_mismatched_rows() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((3, 2), DType::F32, &device).unwrap();
        let labels = Tensor::from_vec(vec![0i64, 1], (2,), &device).unwrap();
        assert!(LabelLoss.compute(&logits, &labels).is_err());
    }
}
