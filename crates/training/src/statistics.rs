use std::time::{Duration, Instant};

use crate::logging::Logger;

/// Running totals between two reports. One instance accumulates the whole
/// epoch, another the current report interval; both are fed per-batch via
/// `update` and the interval one is returned fresh by the report callback.
#[derive(Debug, Clone)]
pub struct Statistics {
    pub loss: f64,
    pub n_words: usize,
    pub n_correct: usize,
    pub n_sentences: usize,
    start: Instant,
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

impl Statistics {
    pub fn new() -> Self {
        Self {
            loss: 0.0,
            n_words: 0,
            n_correct: 0,
            n_sentences: 0,
            start: Instant::now(),
        }
    }

    pub fn with(loss: f64, n_words: usize, n_correct: usize) -> Self {
        Self {
            loss,
            n_words,
            n_correct,
            n_sentences: 0,
            start: Instant::now(),
        }
    }

    /// Merges another accumulator's counts into this one. The start instant
    /// is kept, so elapsed time spans the whole interval.
    pub fn update(&mut self, other: &Statistics) {
        self.loss += other.loss;
        self.n_words += other.n_words;
        self.n_correct += other.n_correct;
        self.n_sentences += other.n_sentences;
    }

    pub fn accuracy(&self) -> f64 {
        if self.n_words == 0 {
            return 0.0;
        }
        100.0 * self.n_correct as f64 / self.n_words as f64
    }

    /// Per-token perplexity, capped to keep early-epoch reports finite.
    pub fn ppl(&self) -> f64 {
        if self.n_words == 0 {
            return f64::INFINITY;
        }
        (self.loss / self.n_words as f64).min(100.0).exp()
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn words_per_sec(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.n_words as f64 / secs
    }

    pub fn should_report(batch: usize, interval: usize) -> bool {
        interval > 0 && batch % interval == 0
    }

    /// Console report line in the shape downstream tooling greps for.
    pub fn output(&self, epoch: usize, batch: usize, n_batches: usize, lr: f64) {
        println!(
            "Epoch {:2}, {:5}/{:5}; acc: {:6.2}; ppl: {:6.2}; lr: {:.5}; {:3.0} tok/s; {:4.0} s elapsed",
            epoch,
            batch,
            n_batches,
            self.accuracy(),
            self.ppl(),
            lr,
            self.words_per_sec(),
            self.elapsed().as_secs_f64()
        );
    }

    /// Forwards scalars to the experiment log. Transport failures warn on
    /// the console and never interrupt training.
    pub fn log_to(&self, tag: &str, logger: &mut Logger, step: usize, lr: f64) {
        let step = step as i64;
        logger.scalar(&format!("{}/ppl", tag), step, self.ppl());
        logger.scalar(&format!("{}/accuracy", tag), step, self.accuracy());
        logger.scalar(&format!("{}/tok_per_sec", tag), step, self.words_per_sec());
        logger.scalar(&format!("{}/learning_rate", tag), step, lr);
    }
}

/// Caller-supplied report hook. Invoked for every batch with the flag set
/// when the cadence (interval multiples, first and last batch) fires; the
/// hook returns the statistics to carry forward, typically a fresh instance
/// after it has reported.
pub type ReportFunc = Box<dyn FnMut(ReportEvent<'_>) -> Statistics>;

pub struct ReportEvent<'a> {
    pub epoch: usize,
    pub batch: usize,
    pub n_batches: usize,
    pub start: Instant,
    pub learning_rate: f64,
    pub stats: &'a Statistics,
    pub report: bool,
}

/// Default report hook: prints via `Statistics::output` when flagged.
pub fn console_report() -> ReportFunc {
    Box::new(|event: ReportEvent<'_>| {
        if event.report {
            event
                .stats
                .output(event.epoch, event.batch, event.n_batches, event.learning_rate);
            Statistics::new()
        } else {
            event.stats.clone()
        }
    })
}
