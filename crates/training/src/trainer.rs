//! Joint training loop for the generator, discriminator, and entailment
//! classifier. Each epoch walks the fixed phase sequence training,
//! validating, rate update, checkpoint; within an epoch, gradients are
//! accumulated over a configurable batch window and the three optimizers
//! always step in the same order.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor, Var, D};
use rand::rngs::StdRng;
use rand::SeedableRng;

use parallel_data::{Batch, Field, FieldSet, MultiShardIterator, ShardCatalog, Vocab, BOS_TOKEN};

use crate::checkpoint::{
    apply_weights, drop_checkpoint, load_checkpoint, load_discriminator, OptimStates, SaveRequest,
};
use crate::config::{BatchUnit, TrainingConfig, TrainingError};
use crate::logging::Logger;
use crate::loss::{LabelLoss, SequenceLoss};
use crate::model::{Discriminator, Generator, Hidden, NliClassifier, SubModel};
use crate::optim::Optim;
use crate::statistics::{console_report, ReportEvent, ReportFunc, Statistics};

/// Where the trainer stands inside the current epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochPhase {
    Training,
    Validating,
    RateUpdate,
    Checkpoint,
}

pub struct Trainer {
    config: TrainingConfig,
    device: Device,
    fields: Arc<FieldSet>,
    generator: Generator,
    discriminator: Discriminator,
    nli: NliClassifier,
    gen_optim: Optim,
    disc_optim: Optim,
    nli_optim: Optim,
    seq_loss: SequenceLoss,
    label_loss: LabelLoss,
    logger: Logger,
    report: ReportFunc,
    start_epoch: usize,
    phase: EpochPhase,
    bos_id: u32,
}

impl Trainer {
    /// Builds every sub-model and optimizer from the configuration. When a
    /// resume checkpoint is configured its vocabulary, weights, and optimizer
    /// states replace the fresh ones; a discriminator warm start replaces
    /// only the discriminator afterwards.
    pub fn new(config: TrainingConfig) -> Result<Self, TrainingError> {
        config.validate()?;
        let device = config.runtime.device()?;

        let resume = match &config.runtime.train_from {
            Some(dir) => {
                println!("Loading checkpoint from {}", dir.display());
                Some(load_checkpoint(dir)?)
            }
            None => None,
        };

        let fields = match &resume {
            Some(outcome) => Arc::new(fields_from_vocab(&outcome.manifest.vocab)?),
            None => {
                let catalog = ShardCatalog::discover(&config.data.corpus_prefix, "train")?;
                let data_type = catalog.peek_data_type()?;
                let path = vocab_path(&config.data.corpus_prefix);
                Arc::new(FieldSet::from_vocab_file(&path, data_type)?)
            }
        };

        let src_vocab = fields.src().vocab.len();
        let tgt_vocab = fields.tgt().vocab.len();
        let label_count = fields.nli().vocab.len();

        let mut rng = StdRng::seed_from_u64(config.runtime.seed);
        let generator =
            Generator::new(&config.model, src_vocab, tgt_vocab, device.clone(), &mut rng)?;
        let discriminator = Discriminator::new(&config.model, tgt_vocab, device.clone(), &mut rng)?;
        let nli = NliClassifier::new(
            &config.model,
            src_vocab,
            tgt_vocab,
            label_count,
            device.clone(),
            &mut rng,
        )?;

        let (encoder, decoder) = generator.tally_parameters();
        println!("encoder: {} parameters", encoder);
        println!("decoder: {} parameters", decoder);
        println!(
            "discriminator: {} parameters",
            parameter_count(&discriminator.parameters())
        );
        println!("nli: {} parameters", parameter_count(&nli.parameters()));

        let mut gen_optim = Optim::new(
            generator.parameters(),
            &config.generator,
            config.model.hidden_size,
        )?;
        let mut disc_optim = Optim::new(
            discriminator.parameters(),
            &config.discriminator,
            config.model.hidden_size,
        )?;
        let mut nli_optim = Optim::new(nli.parameters(), &config.nli, config.model.hidden_size)?;

        let mut start_epoch = config.runtime.start_epoch;
        if let Some(outcome) = resume {
            apply_weights(&generator.parameters(), &outcome.generator_weights, &device)?;
            apply_weights(
                &discriminator.parameters(),
                &outcome.discriminator_weights,
                &device,
            )?;
            apply_weights(&nli.parameters(), &outcome.nli_weights, &device)?;
            gen_optim.load_state(outcome.optim.generator)?;
            disc_optim.load_state(outcome.optim.discriminator)?;
            nli_optim.load_state(outcome.optim.nli)?;
            start_epoch = outcome.manifest.epoch + 1;
            println!("Resuming training at epoch {}", start_epoch);
        }

        if let Some(dir) = &config.runtime.d_train_from {
            println!("Loading discriminator from {}", dir.display());
            let (weights, state) = load_discriminator(dir)?;
            apply_weights(&discriminator.parameters(), &weights, &device)?;
            disc_optim.load_state(state)?;
        }

        let logger = Logger::new(config.runtime.log_dir.as_deref())?;
        let pad_id = fields.tgt().vocab.pad_id();
        let bos_id = fields.tgt().vocab.lookup(BOS_TOKEN);
        let seq_loss = SequenceLoss::new(pad_id, config.data.shard_size);

        Ok(Self {
            config,
            device,
            fields,
            generator,
            discriminator,
            nli,
            gen_optim,
            disc_optim,
            nli_optim,
            seq_loss,
            label_loss: LabelLoss,
            logger,
            report: console_report(),
            start_epoch,
            phase: EpochPhase::Training,
            bos_id,
        })
    }

    pub fn phase(&self) -> EpochPhase {
        self.phase
    }

    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    pub fn fields(&self) -> &FieldSet {
        &self.fields
    }

    /// Step counters of the generator, discriminator, and classifier
    /// optimizers, in that order.
    pub fn optimizer_steps(&self) -> (usize, usize, usize) {
        (
            self.gen_optim.step_count(),
            self.disc_optim.step_count(),
            self.nli_optim.step_count(),
        )
    }

    /// Replaces the report hook. The default prints to the console.
    pub fn set_report_func(&mut self, report: ReportFunc) {
        self.report = report;
    }

    /// Runs epochs from the start epoch through the configured final one.
    /// When the stop flag is raised the in-progress epoch is discarded and
    /// the run ends cleanly with whatever checkpoints earlier epochs wrote.
    pub fn run(&mut self, should_stop: &AtomicBool) -> Result<(), TrainingError> {
        for epoch in self.start_epoch..=self.config.runtime.epochs {
            self.phase = EpochPhase::Training;
            let Some(totals) = self.train_epoch(epoch, should_stop)? else {
                println!("Interrupt received; discarding epoch {}", epoch);
                self.logger.flush();
                return Ok(());
            };
            println!("Train perplexity: {:.2}", totals.generator.ppl());
            println!("Train accuracy: {:.2}", totals.generator.accuracy());

            self.phase = EpochPhase::Validating;
            let valid = self.validate()?;
            println!("Validation perplexity: {:.2}", valid.ppl());
            println!("Validation accuracy: {:.2}", valid.accuracy());

            totals.generator.log_to(
                "train",
                &mut self.logger,
                epoch,
                self.gen_optim.learning_rate(),
            );
            totals.discriminator.log_to(
                "discriminator",
                &mut self.logger,
                epoch,
                self.disc_optim.learning_rate(),
            );
            totals
                .nli
                .log_to("nli", &mut self.logger, epoch, self.nli_optim.learning_rate());
            valid.log_to(
                "valid",
                &mut self.logger,
                epoch,
                self.gen_optim.learning_rate(),
            );

            self.phase = EpochPhase::RateUpdate;
            let valid_ppl = valid.ppl();
            self.gen_optim.epoch_step(valid_ppl, epoch);
            self.disc_optim.epoch_step(valid_ppl, epoch);
            self.nli_optim.epoch_step(valid_ppl, epoch);

            self.phase = EpochPhase::Checkpoint;
            self.save_checkpoint(epoch, &valid)?;
        }
        self.logger.flush();
        Ok(())
    }

    fn corpus_iter(&self, role: &str) -> Result<MultiShardIterator, TrainingError> {
        let catalog = ShardCatalog::discover(&self.config.data.corpus_prefix, role)?;
        Ok(MultiShardIterator::new(
            catalog,
            self.fields.clone(),
            self.config.data.batch_policy(),
            self.device.clone(),
        ))
    }

    /// One pass over the training shards. Returns `None` when the stop flag
    /// interrupted the epoch at a batch boundary.
    fn train_epoch(
        &mut self,
        epoch: usize,
        should_stop: &AtomicBool,
    ) -> Result<Option<EpochTotals>, TrainingError> {
        let mut iter = self.corpus_iter("train")?;
        let gen_params = self.generator.parameters();
        let disc_params = self.discriminator.parameters();
        let nli_params = self.nli.parameters();

        let mut totals = EpochTotals::new();
        let mut interval = Statistics::new();
        let epoch_start = Instant::now();

        let mut accum = GradWindow::new();
        let mut batch_index = 0usize;
        let mut last_reported = 0usize;

        while let Some(item) = iter.next() {
            if should_stop.load(Ordering::SeqCst) {
                return Ok(None);
            }
            let batch = item?;
            batch_index += 1;

            let gen_out = self.generator_batch(&batch, &gen_params)?;
            merge_grads(&mut accum.generator, gen_out.grads, &gen_params)?;
            let (disc_piece, disc_stats) = self.discriminator_batch(&batch, &gen_out.fake)?;
            merge_grads(&mut accum.discriminator, disc_piece, &disc_params)?;
            let (nli_piece, nli_stats) = self.nli_batch(&batch)?;
            merge_grads(&mut accum.nli, nli_piece, &nli_params)?;

            accum.denom += match self.config.data.normalization {
                BatchUnit::Sents => batch.sentences as f64,
                BatchUnit::Tokens => batch.tokens as f64,
            };
            accum.pending += 1;

            interval.update(&gen_out.stats);
            totals.generator.update(&gen_out.stats);
            totals.discriminator.update(&disc_stats);
            totals.nli.update(&nli_stats);

            if accum.pending >= self.config.data.accum_count {
                self.step_window(&mut accum, &gen_params, &disc_params, &nli_params)?;
            }

            let report_now = batch_index == 1
                || Statistics::should_report(batch_index, self.config.runtime.report_every);
            let event = ReportEvent {
                epoch,
                batch: batch_index,
                n_batches: iter.current_len().unwrap_or(0),
                start: epoch_start,
                learning_rate: self.gen_optim.learning_rate(),
                stats: &interval,
                report: report_now,
            };
            interval = (self.report)(event);
            if report_now {
                last_reported = batch_index;
            }
        }

        if accum.pending > 0 {
            self.step_window(&mut accum, &gen_params, &disc_params, &nli_params)?;
        }

        if batch_index > 0 && last_reported != batch_index {
            let event = ReportEvent {
                epoch,
                batch: batch_index,
                n_batches: iter.current_len().unwrap_or(0),
                start: epoch_start,
                learning_rate: self.gen_optim.learning_rate(),
                stats: &interval,
                report: true,
            };
            (self.report)(event);
        }

        Ok(Some(totals))
    }

    /// Decodes one batch, accumulating gradients over truncation windows.
    /// The recurrent state crosses window boundaries detached, so each
    /// backward pass stays inside its own window.
    fn generator_batch(
        &self,
        batch: &Batch,
        params: &[(String, Var)],
    ) -> Result<GeneratorOutcome, TrainingError> {
        let steps = match batch.tgt.dims() {
            [_, steps] => *steps,
            _ => {
                return Err(TrainingError::runtime(
                    "target tensor must be shaped [batch, steps]",
                ))
            }
        };
        let tgt_in = decoder_input(&batch.tgt, self.bos_id, &self.device)?;
        let trunc = self.config.data.trunc_size;
        let window = if trunc == 0 || trunc >= steps {
            steps
        } else {
            trunc
        };

        let mut grads: Option<GradStore> = None;
        let mut stats = Statistics::new();
        let mut fake_pieces = Vec::new();
        let mut state: Option<Hidden> = None;

        let mut start = 0;
        while start < steps {
            let len = window.min(steps - start);
            let in_w = tgt_in.narrow(1, start, len).map_err(to_runtime_error)?;
            let out_w = batch.tgt.narrow(1, start, len).map_err(to_runtime_error)?;

            let (logits, hidden) = self.generator.forward(&batch.src, &in_w, state.as_ref())?;
            let out = self.seq_loss.compute(&logits, &out_w)?;
            let piece = out.loss.backward().map_err(to_runtime_error)?;
            merge_grads(&mut grads, piece, params)?;
            stats.update(&out.stats);

            fake_pieces.push(logits.argmax(D::Minus1).map_err(to_runtime_error)?);
            state = Some(hidden.detach());
            start += len;
        }

        let grads =
            grads.ok_or_else(|| TrainingError::runtime("batch produced no decoding windows"))?;
        let fake = if fake_pieces.len() == 1 {
            fake_pieces.remove(0)
        } else {
            Tensor::cat(&fake_pieces, 1).map_err(to_runtime_error)?
        };
        stats.n_sentences = batch.sentences;
        Ok(GeneratorOutcome { grads, stats, fake })
    }

    /// Scores real target rows against the generator's greedy decodes. The
    /// decoded tokens come from an argmax, so no gradient reaches the
    /// generator from here.
    fn discriminator_batch(
        &self,
        batch: &Batch,
        fake: &Tensor,
    ) -> Result<(GradStore, Statistics), TrainingError> {
        let real_logits = self.discriminator.forward(&batch.tgt)?;
        let fake_logits = self.discriminator.forward(fake)?;
        let real_labels = constant_labels(batch.sentences, 1, &self.device)?;
        let fake_labels = constant_labels(batch.sentences, 0, &self.device)?;

        let real = self.label_loss.compute(&real_logits, &real_labels)?;
        let generated = self.label_loss.compute(&fake_logits, &fake_labels)?;
        let loss = (&real.loss + &generated.loss).map_err(to_runtime_error)?;
        let grads = loss.backward().map_err(to_runtime_error)?;

        let mut stats = real.stats;
        stats.update(&generated.stats);
        Ok((grads, stats))
    }

    fn nli_batch(&self, batch: &Batch) -> Result<(GradStore, Statistics), TrainingError> {
        let logits = self.nli.forward(&batch.src, &batch.tgt)?;
        let out = self.label_loss.compute(&logits, &batch.labels)?;
        let grads = out.loss.backward().map_err(to_runtime_error)?;
        Ok((grads, out.stats))
    }

    /// Closes an accumulation window: normalizes by the window denominator
    /// and steps the optimizers generator first, discriminator second,
    /// classifier last.
    fn step_window(
        &mut self,
        accum: &mut GradWindow,
        gen_params: &[(String, Var)],
        disc_params: &[(String, Var)],
        nli_params: &[(String, Var)],
    ) -> Result<(), TrainingError> {
        if accum.denom > 0.0 {
            let scale = 1.0 / accum.denom;
            if let Some(mut grads) = accum.generator.take() {
                scale_grads(&mut grads, gen_params, scale)?;
                self.gen_optim.step(&mut grads)?;
            }
            if let Some(mut grads) = accum.discriminator.take() {
                scale_grads(&mut grads, disc_params, scale)?;
                self.disc_optim.step(&mut grads)?;
            }
            if let Some(mut grads) = accum.nli.take() {
                scale_grads(&mut grads, nli_params, scale)?;
                self.nli_optim.step(&mut grads)?;
            }
        }
        accum.pending = 0;
        accum.denom = 0.0;
        Ok(())
    }

    /// Forward-only pass over the validation shards. No optimizer is
    /// touched, so a failed validation leaves training state intact.
    fn validate(&self) -> Result<Statistics, TrainingError> {
        let iter = self.corpus_iter("valid")?;
        let mut stats = Statistics::new();
        for item in iter {
            let batch = item?;
            let tgt_in = decoder_input(&batch.tgt, self.bos_id, &self.device)?;
            let (logits, _) = self.generator.forward(&batch.src, &tgt_in, None)?;
            let out = self.seq_loss.compute(&logits, &batch.tgt)?;
            stats.update(&out.stats);
            stats.n_sentences += batch.sentences;
        }
        Ok(stats)
    }

    fn save_checkpoint(&mut self, epoch: usize, valid: &Statistics) -> Result<(), TrainingError> {
        let mut vocab = BTreeMap::new();
        for name in self.fields.names() {
            if let Some(field) = self.fields.field(name) {
                vocab.insert(name.to_string(), field.vocab.tokens().to_vec());
            }
        }
        let optim = OptimStates {
            generator: self.gen_optim.state()?,
            discriminator: self.disc_optim.state()?,
            nli: self.nli_optim.state()?,
        };
        let gen_params = self.generator.parameters();
        let disc_params = self.discriminator.parameters();
        let nli_params = self.nli.parameters();
        let request = SaveRequest {
            config: &self.config,
            vocab,
            epoch,
            accuracy: valid.accuracy(),
            ppl: valid.ppl(),
            generator: &gen_params,
            discriminator: &disc_params,
            nli: &nli_params,
            optim,
        };
        if let Some(descriptor) = drop_checkpoint(request)? {
            println!("Saving checkpoint {}", descriptor.directory.display());
        }
        Ok(())
    }
}

struct GeneratorOutcome {
    grads: GradStore,
    stats: Statistics,
    fake: Tensor,
}

struct EpochTotals {
    generator: Statistics,
    discriminator: Statistics,
    nli: Statistics,
}

impl EpochTotals {
    fn new() -> Self {
        Self {
            generator: Statistics::new(),
            discriminator: Statistics::new(),
            nli: Statistics::new(),
        }
    }
}

/// Gradients accumulated since the last optimizer step, with the batch
/// count and normalization denominator of the open window.
struct GradWindow {
    generator: Option<GradStore>,
    discriminator: Option<GradStore>,
    nli: Option<GradStore>,
    pending: usize,
    denom: f64,
}

impl GradWindow {
    fn new() -> Self {
        Self {
            generator: None,
            discriminator: None,
            nli: None,
            pending: 0,
            denom: 0.0,
        }
    }
}

/// Decoder input for teacher forcing: a begin-of-sentence column followed by
/// the targets shifted one step right, dropping the final token.
fn decoder_input(tgt: &Tensor, bos_id: u32, device: &Device) -> Result<Tensor, TrainingError> {
    let (batch, steps) = match tgt.dims() {
        [batch, steps] => (*batch, *steps),
        _ => {
            return Err(TrainingError::runtime(
                "target tensor must be shaped [batch, steps]",
            ))
        }
    };
    let bos = Tensor::full(bos_id as i64, (batch, 1), device).map_err(to_runtime_error)?;
    if steps <= 1 {
        return Ok(bos);
    }
    let head = tgt.narrow(1, 0, steps - 1).map_err(to_runtime_error)?;
    Tensor::cat(&[&bos, &head], 1).map_err(to_runtime_error)
}

fn constant_labels(count: usize, value: i64, device: &Device) -> Result<Tensor, TrainingError> {
    Tensor::from_vec(vec![value; count], count, device).map_err(to_runtime_error)
}

/// Adds a fresh gradient store into the accumulator, summing per parameter.
fn merge_grads(
    accum: &mut Option<GradStore>,
    mut fresh: GradStore,
    params: &[(String, Var)],
) -> Result<(), TrainingError> {
    let Some(existing) = accum.as_mut() else {
        *accum = Some(fresh);
        return Ok(());
    };
    for (_, var) in params {
        let tensor = var.as_tensor();
        if let Some(new_grad) = fresh.remove(tensor) {
            let merged = match existing.remove(tensor) {
                Some(old) => (&old + &new_grad).map_err(to_runtime_error)?,
                None => new_grad,
            };
            existing.insert(tensor, merged);
        }
    }
    Ok(())
}

fn scale_grads(
    grads: &mut GradStore,
    params: &[(String, Var)],
    scale: f64,
) -> Result<(), TrainingError> {
    for (_, var) in params {
        let tensor = var.as_tensor();
        if let Some(grad) = grads.remove(tensor) {
            let scaled = grad.affine(scale, 0.0).map_err(to_runtime_error)?;
            grads.insert(tensor, scaled);
        }
    }
    Ok(())
}

fn parameter_count(params: &[(String, Var)]) -> usize {
    params
        .iter()
        .map(|(_, var)| var.as_tensor().elem_count())
        .sum()
}

fn fields_from_vocab(vocab: &BTreeMap<String, Vec<String>>) -> Result<FieldSet, TrainingError> {
    let fields = vocab
        .iter()
        .map(|(name, tokens)| {
            (
                name.clone(),
                Field {
                    vocab: Vocab::from_tokens(tokens.clone()),
                },
            )
        })
        .collect();
    Ok(FieldSet::new(fields)?)
}

fn vocab_path(prefix: &Path) -> PathBuf {
    let mut name = prefix.as_os_str().to_os_string();
    name.push(".vocab.pt");
    PathBuf::from(name)
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
