//! Reference sub-models for the adversarial trainer: a recurrent
//! encoder-decoder generator, a sequence discriminator, and a sentence-pair
//! classifier. All parameters are `Var`s registered under dotted scope names
//! so the optimizer and checkpoint code can address them uniformly.

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::ops;
use rand::rngs::StdRng;
use rand::Rng;

use crate::config::{ModelConfig, RecurrentUnit, TrainingError};

/// Common surface the trainer needs from every trainable component.
pub trait SubModel {
    fn name(&self) -> &'static str;
    fn parameters(&self) -> Vec<(String, Var)>;
}

/// Recurrent state threaded through decoding steps. `c` is present for cell
/// types that carry a second memory tensor.
#[derive(Debug, Clone)]
pub struct Hidden {
    pub h: Tensor,
    pub c: Option<Tensor>,
}

impl Hidden {
    /// Cuts the state out of the autograd graph. Used at truncation
    /// boundaries so gradients never flow across windows.
    pub fn detach(&self) -> Hidden {
        Hidden {
            h: self.h.detach(),
            c: self.c.as_ref().map(|c| c.detach()),
        }
    }
}

/// Samples parameter tensors uniformly from [-0.1, 0.1] off a caller-owned
/// rng, so two builds with the same seed produce identical weights.
pub struct ParamInit<'a> {
    rng: &'a mut StdRng,
    device: Device,
}

impl<'a> ParamInit<'a> {
    pub fn new(rng: &'a mut StdRng, device: Device) -> Self {
        Self { rng, device }
    }

    fn uniform(&mut self, shape: &[usize]) -> Result<Var, TrainingError> {
        let count: usize = shape.iter().product();
        let values: Vec<f32> = (0..count).map(|_| self.rng.gen_range(-0.1f32..0.1)).collect();
        let tensor = Tensor::from_vec(values, shape, &self.device).map_err(to_runtime_error)?;
        Var::from_tensor(&tensor).map_err(to_runtime_error)
    }

    fn zeros(&mut self, shape: &[usize]) -> Result<Var, TrainingError> {
        let tensor =
            Tensor::zeros(shape, DType::F32, &self.device).map_err(to_runtime_error)?;
        Var::from_tensor(&tensor).map_err(to_runtime_error)
    }
}

/// Token embedding table with index-select lookup.
#[derive(Debug, Clone)]
struct Embedding {
    weight: Var,
    dim: usize,
}

impl Embedding {
    fn new(init: &mut ParamInit<'_>, vocab_size: usize, dim: usize) -> Result<Self, TrainingError> {
        Ok(Self {
            weight: init.uniform(&[vocab_size, dim])?,
            dim,
        })
    }

    /// `ids` is `[batch, steps]` integer; output is `[batch, steps, dim]`.
    fn forward(&self, ids: &Tensor) -> candle_core::Result<Tensor> {
        let dims = ids.dims().to_vec();
        let flat = ids.to_dtype(DType::I64)?.flatten_all()?;
        let gathered = self.weight.as_tensor().index_select(&flat, 0)?;
        let mut out_dims = dims;
        out_dims.push(self.dim);
        gathered.reshape(out_dims)
    }

    fn named(&self, scope: &str) -> Vec<(String, Var)> {
        vec![(format!("{}.weight", scope), self.weight.clone())]
    }
}

#[derive(Debug, Clone)]
struct Projection {
    weight: Var,
    bias: Var,
}

impl Projection {
    fn new(
        init: &mut ParamInit<'_>,
        in_dim: usize,
        out_dim: usize,
    ) -> Result<Self, TrainingError> {
        Ok(Self {
            weight: init.uniform(&[out_dim, in_dim])?,
            bias: init.zeros(&[out_dim])?,
        })
    }

    /// Applies `x W^T + b` to the trailing feature dimension of a rank-2
    /// input.
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        x.matmul(&self.weight.as_tensor().t()?)?
            .broadcast_add(self.bias.as_tensor())
    }

    fn named(&self, scope: &str) -> Vec<(String, Var)> {
        vec![
            (format!("{}.weight", scope), self.weight.clone()),
            (format!("{}.bias", scope), self.bias.clone()),
        ]
    }
}

#[derive(Debug, Clone)]
struct LstmCell {
    w_ih: Var,
    w_hh: Var,
    bias: Var,
    hidden: usize,
}

impl LstmCell {
    fn new(
        init: &mut ParamInit<'_>,
        input: usize,
        hidden: usize,
    ) -> Result<Self, TrainingError> {
        Ok(Self {
            w_ih: init.uniform(&[4 * hidden, input])?,
            w_hh: init.uniform(&[4 * hidden, hidden])?,
            bias: init.zeros(&[4 * hidden])?,
            hidden,
        })
    }

    fn step(&self, x: &Tensor, state: &Hidden) -> candle_core::Result<Hidden> {
        let c = state
            .c
            .as_ref()
            .ok_or_else(|| candle_core::Error::Msg("lstm state is missing its cell tensor".into()))?;
        let gates = x
            .matmul(&self.w_ih.as_tensor().t()?)?
            .add(&state.h.matmul(&self.w_hh.as_tensor().t()?)?)?
            .broadcast_add(self.bias.as_tensor())?;
        let h = self.hidden;
        let i = ops::sigmoid(&gates.narrow(1, 0, h)?)?;
        let f = ops::sigmoid(&gates.narrow(1, h, h)?)?;
        let g = gates.narrow(1, 2 * h, h)?.tanh()?;
        let o = ops::sigmoid(&gates.narrow(1, 3 * h, h)?)?;

        let c_next = ((&f * c)? + (&i * &g)?)?;
        let h_next = (&o * &c_next.tanh()?)?;
        Ok(Hidden {
            h: h_next,
            c: Some(c_next),
        })
    }

    fn named(&self, scope: &str) -> Vec<(String, Var)> {
        vec![
            (format!("{}.w_ih", scope), self.w_ih.clone()),
            (format!("{}.w_hh", scope), self.w_hh.clone()),
            (format!("{}.bias", scope), self.bias.clone()),
        ]
    }
}

#[derive(Debug, Clone)]
struct GruCell {
    w_ih: Var,
    w_hh: Var,
    b_ih: Var,
    b_hh: Var,
    hidden: usize,
}

impl GruCell {
    fn new(
        init: &mut ParamInit<'_>,
        input: usize,
        hidden: usize,
    ) -> Result<Self, TrainingError> {
        Ok(Self {
            w_ih: init.uniform(&[3 * hidden, input])?,
            w_hh: init.uniform(&[3 * hidden, hidden])?,
            b_ih: init.zeros(&[3 * hidden])?,
            b_hh: init.zeros(&[3 * hidden])?,
            hidden,
        })
    }

    fn step(&self, x: &Tensor, state: &Hidden) -> candle_core::Result<Hidden> {
        let gi = x
            .matmul(&self.w_ih.as_tensor().t()?)?
            .broadcast_add(self.b_ih.as_tensor())?;
        let gh = state
            .h
            .matmul(&self.w_hh.as_tensor().t()?)?
            .broadcast_add(self.b_hh.as_tensor())?;
        let h = self.hidden;

        let r = ops::sigmoid(&(gi.narrow(1, 0, h)? + gh.narrow(1, 0, h)?)?)?;
        let z = ops::sigmoid(&(gi.narrow(1, h, h)? + gh.narrow(1, h, h)?)?)?;
        let n = (gi.narrow(1, 2 * h, h)? + (&r * &gh.narrow(1, 2 * h, h)?)?)?.tanh()?;

        let keep = z.affine(-1.0, 1.0)?;
        let h_next = ((&keep * &n)? + (&z * &state.h)?)?;
        Ok(Hidden { h: h_next, c: None })
    }

    fn named(&self, scope: &str) -> Vec<(String, Var)> {
        vec![
            (format!("{}.w_ih", scope), self.w_ih.clone()),
            (format!("{}.w_hh", scope), self.w_hh.clone()),
            (format!("{}.b_ih", scope), self.b_ih.clone()),
            (format!("{}.b_hh", scope), self.b_hh.clone()),
        ]
    }
}

/// Simple recurrent unit: the recurrence touches only the cell tensor, so
/// each gate is a function of the input alone.
#[derive(Debug, Clone)]
struct SruCell {
    w: Var,
    w_f: Var,
    w_r: Var,
    b_f: Var,
    b_r: Var,
}

impl SruCell {
    fn new(
        init: &mut ParamInit<'_>,
        input: usize,
        hidden: usize,
    ) -> Result<Self, TrainingError> {
        Ok(Self {
            w: init.uniform(&[hidden, input])?,
            w_f: init.uniform(&[hidden, input])?,
            w_r: init.uniform(&[hidden, input])?,
            b_f: init.zeros(&[hidden])?,
            b_r: init.zeros(&[hidden])?,
        })
    }

    fn step(&self, x: &Tensor, state: &Hidden) -> candle_core::Result<Hidden> {
        let c = state
            .c
            .as_ref()
            .ok_or_else(|| candle_core::Error::Msg("sru state is missing its cell tensor".into()))?;
        let x_t = x.matmul(&self.w.as_tensor().t()?)?;
        let f = ops::sigmoid(
            &x.matmul(&self.w_f.as_tensor().t()?)?
                .broadcast_add(self.b_f.as_tensor())?,
        )?;
        let r = ops::sigmoid(
            &x.matmul(&self.w_r.as_tensor().t()?)?
                .broadcast_add(self.b_r.as_tensor())?,
        )?;

        let forget_rest = f.affine(-1.0, 1.0)?;
        let c_next = ((&f * c)? + (&forget_rest * &x_t)?)?;
        let highway = r.affine(-1.0, 1.0)?;
        let h_next = ((&r * &c_next.tanh()?)? + (&highway * &x_t)?)?;
        Ok(Hidden {
            h: h_next,
            c: Some(c_next),
        })
    }

    fn named(&self, scope: &str) -> Vec<(String, Var)> {
        vec![
            (format!("{}.w", scope), self.w.clone()),
            (format!("{}.w_f", scope), self.w_f.clone()),
            (format!("{}.w_r", scope), self.w_r.clone()),
            (format!("{}.b_f", scope), self.b_f.clone()),
            (format!("{}.b_r", scope), self.b_r.clone()),
        ]
    }
}

#[derive(Debug, Clone)]
enum RecurrentCell {
    Lstm(LstmCell),
    Gru(GruCell),
    Sru(SruCell),
}

impl RecurrentCell {
    fn new(
        init: &mut ParamInit<'_>,
        unit: RecurrentUnit,
        input: usize,
        hidden: usize,
    ) -> Result<Self, TrainingError> {
        Ok(match unit {
            RecurrentUnit::Lstm => RecurrentCell::Lstm(LstmCell::new(init, input, hidden)?),
            RecurrentUnit::Gru => RecurrentCell::Gru(GruCell::new(init, input, hidden)?),
            RecurrentUnit::Sru => RecurrentCell::Sru(SruCell::new(init, input, hidden)?),
        })
    }

    fn step(&self, x: &Tensor, state: &Hidden) -> candle_core::Result<Hidden> {
        match self {
            RecurrentCell::Lstm(cell) => cell.step(x, state),
            RecurrentCell::Gru(cell) => cell.step(x, state),
            RecurrentCell::Sru(cell) => cell.step(x, state),
        }
    }

    fn zero_state(
        &self,
        batch: usize,
        hidden: usize,
        device: &Device,
    ) -> candle_core::Result<Hidden> {
        let h = Tensor::zeros((batch, hidden), DType::F32, device)?;
        let c = match self {
            RecurrentCell::Gru(_) => None,
            _ => Some(Tensor::zeros((batch, hidden), DType::F32, device)?),
        };
        Ok(Hidden { h, c })
    }

    fn named(&self, scope: &str) -> Vec<(String, Var)> {
        match self {
            RecurrentCell::Lstm(cell) => cell.named(scope),
            RecurrentCell::Gru(cell) => cell.named(scope),
            RecurrentCell::Sru(cell) => cell.named(scope),
        }
    }
}

/// Encoder-decoder generator. The encoder folds the source sentence into a
/// recurrent state; the decoder consumes shifted target tokens from that
/// state and projects each step onto the target vocabulary.
pub struct Generator {
    src_embed: Embedding,
    encoder: RecurrentCell,
    tgt_embed: Embedding,
    decoder: RecurrentCell,
    proj: Projection,
    hidden_size: usize,
    device: Device,
}

impl Generator {
    pub fn new(
        cfg: &ModelConfig,
        src_vocab: usize,
        tgt_vocab: usize,
        device: Device,
        rng: &mut StdRng,
    ) -> Result<Self, TrainingError> {
        let mut init = ParamInit::new(rng, device.clone());
        Ok(Self {
            src_embed: Embedding::new(&mut init, src_vocab, cfg.embed_size)?,
            encoder: RecurrentCell::new(&mut init, cfg.rnn_type, cfg.embed_size, cfg.hidden_size)?,
            tgt_embed: Embedding::new(&mut init, tgt_vocab, cfg.embed_size)?,
            decoder: RecurrentCell::new(&mut init, cfg.rnn_type, cfg.embed_size, cfg.hidden_size)?,
            proj: Projection::new(&mut init, cfg.hidden_size, tgt_vocab)?,
            hidden_size: cfg.hidden_size,
            device,
        })
    }

    /// Runs one decoding pass. When `state` is `None` the source is encoded
    /// first; a `Some` state continues decoding from a truncation boundary
    /// and the source is not re-read. Returns `[batch, steps, vocab]` logits
    /// and the final decoder state.
    pub fn forward(
        &self,
        src: &Tensor,
        tgt_in: &Tensor,
        state: Option<&Hidden>,
    ) -> Result<(Tensor, Hidden), TrainingError> {
        self.forward_inner(src, tgt_in, state).map_err(to_runtime_error)
    }

    fn forward_inner(
        &self,
        src: &Tensor,
        tgt_in: &Tensor,
        state: Option<&Hidden>,
    ) -> candle_core::Result<(Tensor, Hidden)> {
        let (batch, steps) = match tgt_in.dims() {
            [batch, steps] => (*batch, *steps),
            _ => {
                return Err(candle_core::Error::Msg(
                    "decoder input must be shaped [batch, steps]".into(),
                ))
            }
        };

        let mut hidden = match state {
            Some(hidden) => hidden.clone(),
            None => self.run_encoder(src)?,
        };

        let embedded = self.tgt_embed.forward(tgt_in)?;
        let mut outputs = Vec::with_capacity(steps);
        for t in 0..steps {
            let x = embedded.narrow(1, t, 1)?.squeeze(1)?;
            hidden = self.decoder.step(&x, &hidden)?;
            outputs.push(hidden.h.clone());
        }

        let stacked = Tensor::stack(&outputs, 1)?;
        let flat = stacked.reshape((batch * steps, self.hidden_size))?;
        let logits = self
            .proj
            .forward(&flat)?
            .reshape((batch, steps, ()))?;
        Ok((logits, hidden))
    }

    fn run_encoder(&self, src: &Tensor) -> candle_core::Result<Hidden> {
        let (batch, steps) = match src.dims() {
            [batch, steps] => (*batch, *steps),
            _ => {
                return Err(candle_core::Error::Msg(
                    "encoder input must be shaped [batch, steps]".into(),
                ))
            }
        };
        let embedded = self.src_embed.forward(src)?;
        let mut hidden = self
            .encoder
            .zero_state(batch, self.hidden_size, &self.device)?;
        for t in 0..steps {
            let x = embedded.narrow(1, t, 1)?.squeeze(1)?;
            hidden = self.encoder.step(&x, &hidden)?;
        }
        // The decoder starts from the encoder summary; cell memory resets so
        // a Gru encoder can feed an Lstm-shaped decoder state.
        let c = match self.decoder {
            RecurrentCell::Gru(_) => None,
            _ => Some(match hidden.c {
                Some(c) => c,
                None => Tensor::zeros((batch, self.hidden_size), DType::F32, &self.device)?,
            }),
        };
        Ok(Hidden { h: hidden.h, c })
    }

    /// Parameter counts split by component prefix. Names outside the two
    /// scopes are impossible by construction, so the split is exhaustive.
    pub fn tally_parameters(&self) -> (usize, usize) {
        let mut encoder = 0;
        let mut decoder = 0;
        for (name, var) in self.parameters() {
            if name.starts_with("encoder.") {
                encoder += var.as_tensor().elem_count();
            } else if name.starts_with("decoder.") {
                decoder += var.as_tensor().elem_count();
            }
        }
        (encoder, decoder)
    }
}

impl SubModel for Generator {
    fn name(&self) -> &'static str {
        "generator"
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        let mut params = self.src_embed.named("encoder.embed");
        params.extend(self.encoder.named("encoder.cell"));
        params.extend(self.tgt_embed.named("decoder.embed"));
        params.extend(self.decoder.named("decoder.cell"));
        params.extend(self.proj.named("decoder.proj"));
        params
    }
}

/// Binary real-vs-generated classifier over target token sequences: embed,
/// mean-pool over time, project to two logits.
pub struct Discriminator {
    embed: Embedding,
    proj: Projection,
}

impl Discriminator {
    pub fn new(
        cfg: &ModelConfig,
        tgt_vocab: usize,
        device: Device,
        rng: &mut StdRng,
    ) -> Result<Self, TrainingError> {
        let mut init = ParamInit::new(rng, device);
        Ok(Self {
            embed: Embedding::new(&mut init, tgt_vocab, cfg.embed_size)?,
            proj: Projection::new(&mut init, cfg.embed_size, 2)?,
        })
    }

    /// `tokens` is `[batch, steps]`; output is `[batch, 2]` logits.
    pub fn forward(&self, tokens: &Tensor) -> Result<Tensor, TrainingError> {
        self.forward_inner(tokens).map_err(to_runtime_error)
    }

    fn forward_inner(&self, tokens: &Tensor) -> candle_core::Result<Tensor> {
        let pooled = self.embed.forward(tokens)?.mean(1)?;
        self.proj.forward(&pooled)
    }
}

impl SubModel for Discriminator {
    fn name(&self) -> &'static str {
        "discriminator"
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        let mut params = self.embed.named("embed");
        params.extend(self.proj.named("proj"));
        params
    }
}

/// Sentence-pair label classifier: pooled source and target embeddings are
/// concatenated and projected onto the label inventory.
pub struct NliClassifier {
    src_embed: Embedding,
    tgt_embed: Embedding,
    proj: Projection,
}

impl NliClassifier {
    pub fn new(
        cfg: &ModelConfig,
        src_vocab: usize,
        tgt_vocab: usize,
        label_count: usize,
        device: Device,
        rng: &mut StdRng,
    ) -> Result<Self, TrainingError> {
        let mut init = ParamInit::new(rng, device);
        Ok(Self {
            src_embed: Embedding::new(&mut init, src_vocab, cfg.embed_size)?,
            tgt_embed: Embedding::new(&mut init, tgt_vocab, cfg.embed_size)?,
            proj: Projection::new(&mut init, 2 * cfg.embed_size, label_count)?,
        })
    }

    /// `src`/`tgt` are `[batch, steps]`; output is `[batch, labels]` logits.
    pub fn forward(&self, src: &Tensor, tgt: &Tensor) -> Result<Tensor, TrainingError> {
        self.forward_inner(src, tgt).map_err(to_runtime_error)
    }

    fn forward_inner(&self, src: &Tensor, tgt: &Tensor) -> candle_core::Result<Tensor> {
        let src_pooled = self.src_embed.forward(src)?.mean(1)?;
        let tgt_pooled = self.tgt_embed.forward(tgt)?.mean(1)?;
        let joined = Tensor::cat(&[&src_pooled, &tgt_pooled], 1)?;
        self.proj.forward(&joined)
    }
}

impl SubModel for NliClassifier {
    fn name(&self) -> &'static str {
        "nli"
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        let mut params = self.src_embed.named("src_embed");
        params.extend(self.tgt_embed.named("tgt_embed"));
        params.extend(self.proj.named("proj"));
        params
    }
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
