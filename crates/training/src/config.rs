use candle_core::Device;
use parallel_data::{BatchPolicy, DataError};
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

/// Run configuration for an adversarial seq2seq training run.
///
/// Parsing never validates; `validate()` is a separate pass that collects
/// every violation before anything touches the data on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub data: DataConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default = "OptimSettings::generator_default")]
    pub generator: OptimSettings,
    #[serde(default = "OptimSettings::discriminator_default")]
    pub discriminator: OptimSettings,
    #[serde(default = "OptimSettings::nli_default")]
    pub nli: OptimSettings,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path_with_overrides(path, &[])
    }

    /// Reads TOML or JSON selected by extension, applies dot-path overrides
    /// on the raw document, then deserializes. Validation is the caller's
    /// next step via `validate()`.
    pub fn from_path_with_overrides(
        path: impl AsRef<Path>,
        overrides: &[(String, String)],
    ) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut raw: serde_json::Value = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => {
                let value: toml::Value = toml::from_str(&contents)?;
                serde_json::to_value(value)?
            }
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        for (key, value) in overrides {
            apply_override(&mut raw, key, value)?;
        }

        let mut config: TrainingConfig = serde_json::from_value(raw)?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.data.corpus_prefix.as_os_str().is_empty() {
            errors.push("data.corpus_prefix must not be empty".to_string());
        }
        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }
        if self.data.accum_count == 0 {
            errors.push("data.accum_count must be greater than 0".to_string());
        }

        if self.model.hidden_size == 0 {
            errors.push("model.hidden_size must be greater than 0".to_string());
        }
        if self.model.embed_size == 0 {
            errors.push("model.embed_size must be greater than 0".to_string());
        }

        validate_optim("generator", &self.generator, &mut errors);
        validate_optim("discriminator", &self.discriminator, &mut errors);
        validate_optim("nli", &self.nli, &mut errors);

        if self.runtime.save_model.as_os_str().is_empty() {
            errors.push("runtime.save_model must not be empty".to_string());
        }
        if self.runtime.epochs == 0 {
            errors.push("runtime.epochs must be greater than 0".to_string());
        }
        if self.runtime.start_epoch == 0 {
            errors.push("runtime.start_epoch counts from 1".to_string());
        }
        if self.runtime.report_every == 0 {
            errors.push("runtime.report_every must be greater than 0".to_string());
        }
        if self.runtime.devices.len() > 1 {
            errors.push(format!(
                "runtime.devices lists {} accelerators; multi-device training is not supported",
                self.runtime.devices.len()
            ));
        }
        if self.model.rnn_type == RecurrentUnit::Sru && self.runtime.devices.is_empty() {
            errors.push("model.rnn_type = 'sru' requires an accelerator device".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::Validation(errors));
        }

        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.data.corpus_prefix, base);
        absolutize_in_place(&mut self.runtime.save_model, base);
        for path in [
            self.runtime.log_dir.as_mut(),
            self.runtime.train_from.as_mut(),
            self.runtime.d_train_from.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            absolutize_in_place(path, base);
        }
    }
}

fn validate_optim(section: &str, settings: &OptimSettings, errors: &mut Vec<String>) {
    if settings.learning_rate <= 0.0 {
        errors.push(format!("{}.learning_rate must be greater than 0", section));
    }
    if settings.max_grad_norm < 0.0 {
        errors.push(format!("{}.max_grad_norm must be >= 0", section));
    }
    if !(settings.learning_rate_decay > 0.0 && settings.learning_rate_decay <= 1.0) {
        errors.push(format!(
            "{}.learning_rate_decay must be in (0, 1]",
            section
        ));
    }
    if !(0.0 < settings.beta1 && settings.beta1 < 1.0) {
        errors.push(format!("{}.beta1 must be in (0, 1)", section));
    }
    if !(0.0 < settings.beta2 && settings.beta2 < 1.0) {
        errors.push(format!("{}.beta2 must be in (0, 1)", section));
    }
    if settings.adagrad_accum < 0.0 {
        errors.push(format!("{}.adagrad_accum must be >= 0", section));
    }
    if settings.epsilon <= 0.0 {
        errors.push(format!("{}.epsilon must be greater than 0", section));
    }
    if settings.decay_method == DecayMethod::WarmupInverseSqrt && settings.warmup_steps == 0 {
        errors.push(format!(
            "{}.warmup_steps must be greater than 0 for warmup-inverse-sqrt decay",
            section
        ));
    }
}

/// Sets a dot-path key (e.g. `generator.learning_rate`) in the raw config
/// document. Values parse as JSON first, falling back to a plain string.
fn apply_override(
    root: &mut serde_json::Value,
    key: &str,
    value: &str,
) -> Result<(), TrainingError> {
    let parsed = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));

    let mut cursor = root;
    let mut segments = key.split('.').peekable();
    while let Some(segment) = segments.next() {
        if segment.is_empty() {
            return Err(TrainingError::ConfigFormat(format!(
                "override key '{}' has an empty path segment",
                key
            )));
        }
        let map = cursor.as_object_mut().ok_or_else(|| {
            TrainingError::ConfigFormat(format!(
                "override key '{}' traverses a non-table value",
                key
            ))
        })?;
        if segments.peek().is_none() {
            map.insert(segment.to_string(), parsed);
            return Ok(());
        }
        cursor = map
            .entry(segment.to_string())
            .or_insert_with(|| serde_json::Value::Object(Default::default()));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Shard files live at `<corpus_prefix>.<role>[.<index>].pt` and the
    /// vocabulary at `<corpus_prefix>.vocab.pt`.
    pub corpus_prefix: PathBuf,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub batch_type: BatchUnit,
    #[serde(default)]
    pub normalization: BatchUnit,
    #[serde(default = "default_accum_count")]
    pub accum_count: usize,
    /// Truncated BPTT window over target sequences; 0 disables.
    #[serde(default)]
    pub trunc_size: usize,
    /// Loss computed over target-length slices of this many positions;
    /// 0 computes the whole sequence at once.
    #[serde(default)]
    pub shard_size: usize,
}

impl DataConfig {
    pub fn batch_policy(&self) -> BatchPolicy {
        match self.batch_type {
            BatchUnit::Sents => BatchPolicy::FixedExamples(self.batch_size),
            BatchUnit::Tokens => BatchPolicy::TokenBudget(self.batch_size),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchUnit {
    Sents,
    Tokens,
}

impl Default for BatchUnit {
    fn default() -> Self {
        BatchUnit::Sents
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "default_embed_size")]
    pub embed_size: usize,
    #[serde(default)]
    pub rnn_type: RecurrentUnit,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            hidden_size: default_hidden_size(),
            embed_size: default_embed_size(),
            rnn_type: RecurrentUnit::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecurrentUnit {
    Lstm,
    Gru,
    Sru,
}

impl Default for RecurrentUnit {
    fn default() -> Self {
        RecurrentUnit::Lstm
    }
}

/// Optimizer and learning-rate schedule knobs for one sub-model. Each of
/// the three sub-models carries its own copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimSettings {
    #[serde(default)]
    pub method: OptimMethod,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_max_grad_norm")]
    pub max_grad_norm: f64,
    #[serde(default)]
    pub decay_method: DecayMethod,
    #[serde(default = "default_learning_rate_decay")]
    pub learning_rate_decay: f64,
    #[serde(default = "default_start_decay_at")]
    pub start_decay_at: usize,
    #[serde(default = "default_warmup_steps")]
    pub warmup_steps: usize,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default)]
    pub adagrad_accum: f64,
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
}

impl OptimSettings {
    fn generator_default() -> Self {
        Self::default()
    }

    fn discriminator_default() -> Self {
        Self::default()
    }

    fn nli_default() -> Self {
        Self::default()
    }
}

impl Default for OptimSettings {
    fn default() -> Self {
        Self {
            method: OptimMethod::default(),
            learning_rate: default_learning_rate(),
            max_grad_norm: default_max_grad_norm(),
            decay_method: DecayMethod::default(),
            learning_rate_decay: default_learning_rate_decay(),
            start_decay_at: default_start_decay_at(),
            warmup_steps: default_warmup_steps(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            adagrad_accum: 0.0,
            epsilon: default_epsilon(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimMethod {
    Sgd,
    Adagrad,
    Adadelta,
    Adam,
}

impl Default for OptimMethod {
    fn default() -> Self {
        OptimMethod::Sgd
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecayMethod {
    None,
    Step,
    WarmupInverseSqrt,
}

impl Default for DecayMethod {
    fn default() -> Self {
        DecayMethod::Step
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_save_model")]
    pub save_model: PathBuf,
    /// Accelerator indices; empty means CPU, more than one is rejected.
    #[serde(default)]
    pub devices: Vec<usize>,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_start_epoch")]
    pub start_epoch: usize,
    #[serde(default)]
    pub start_checkpoint_at: usize,
    #[serde(default = "default_report_every")]
    pub report_every: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub train_from: Option<PathBuf>,
    #[serde(default)]
    pub d_train_from: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            save_model: default_save_model(),
            devices: Vec::new(),
            epochs: default_epochs(),
            start_epoch: default_start_epoch(),
            start_checkpoint_at: 0,
            report_every: default_report_every(),
            seed: default_seed(),
            log_dir: None,
            train_from: None,
            d_train_from: None,
        }
    }
}

impl RuntimeConfig {
    pub fn device(&self) -> Result<Device, TrainingError> {
        match self.devices.as_slice() {
            [] => Ok(Device::Cpu),
            [index] => Device::new_cuda(*index).map_err(|err| {
                TrainingError::Runtime(format!(
                    "failed to initialize accelerator {}: {}",
                    index, err
                ))
            }),
            more => Err(TrainingError::Validation(vec![format!(
                "runtime.devices lists {} accelerators; multi-device training is not supported",
                more.len()
            )])),
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_batch_size() -> usize {
    64
}

fn default_accum_count() -> usize {
    1
}

fn default_hidden_size() -> usize {
    256
}

fn default_embed_size() -> usize {
    128
}

fn default_learning_rate() -> f64 {
    1.0
}

fn default_max_grad_norm() -> f64 {
    5.0
}

fn default_learning_rate_decay() -> f64 {
    0.5
}

fn default_start_decay_at() -> usize {
    8
}

fn default_warmup_steps() -> usize {
    4000
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_epsilon() -> f64 {
    1e-8
}

fn default_save_model() -> PathBuf {
    PathBuf::from("model")
}

fn default_epochs() -> usize {
    13
}

fn default_start_epoch() -> usize {
    1
}

fn default_report_every() -> usize {
    50
}

fn default_seed() -> u64 {
    3435
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Data(DataError),
    Checkpoint(String),
    Runtime(String),
}

impl TrainingError {
    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::Checkpoint(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "failed to read config: {}", err),
            TrainingError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Data(err) => write!(f, "data error: {}", err),
            TrainingError::Checkpoint(msg) => write!(f, "checkpoint error: {}", msg),
            TrainingError::Runtime(msg) => write!(f, "training failed: {}", msg),
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            TrainingError::Data(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(value: std::io::Error) -> Self {
        TrainingError::Io(value)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<DataError> for TrainingError {
    fn from(value: DataError) -> Self {
        TrainingError::Data(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn toml_config_parses_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            "run.toml",
            r#"
[data]
corpus_prefix = "corpus/demo"
batch_size = 32
batch_type = "tokens"

[generator]
method = "adam"
learning_rate = 0.001
decay_method = "warmup-inverse-sqrt"
"#,
        );

        let config = TrainingConfig::from_path(&path).unwrap();
        assert_eq!(config.data.batch_size, 32);
        assert_eq!(config.data.batch_type, BatchUnit::Tokens);
        assert!(matches!(
            config.data.batch_policy(),
            BatchPolicy::TokenBudget(32)
        ));
        assert_eq!(config.generator.method, OptimMethod::Adam);
        assert_eq!(
            config.generator.decay_method,
            DecayMethod::WarmupInverseSqrt
        );
        // untouched sections keep their defaults
        assert_eq!(config.discriminator.method, OptimMethod::Sgd);
        assert_eq!(config.runtime.epochs, 13);
        // relative paths resolve against the config file
        assert!(config.data.corpus_prefix.is_absolute());
    }

    #[test]
    fn json_config_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            "run.json",
            r#"{
                "data": {"corpus_prefix": "demo"},
                "runtime": {"epochs": 2, "report_every": 10}
            }"#,
        );

        let config = TrainingConfig::from_path(&path).unwrap();
        assert_eq!(config.runtime.epochs, 2);
        assert_eq!(config.runtime.report_every, 10);
    }

    #[test]
    fn validation_collects_every_violation() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            "bad.toml",
            r#"
[data]
corpus_prefix = "demo"
batch_size = 0
accum_count = 0

[generator]
learning_rate = 0.0

[nli]
beta1 = 1.5

[runtime]
report_every = 0
devices = [0, 1]
"#,
        );

        let err = TrainingConfig::from_path(&path).unwrap_err();
        let TrainingError::Validation(messages) = err else {
            panic!("expected validation error");
        };
        let joined = messages.join("\n");
        assert!(joined.contains("data.batch_size"));
        assert!(joined.contains("data.accum_count"));
        assert!(joined.contains("generator.learning_rate"));
        assert!(joined.contains("nli.beta1"));
        assert!(joined.contains("runtime.report_every"));
        assert!(joined.contains("multi-device"));
        assert!(messages.len() >= 6);
    }

    #[test]
    fn sru_without_accelerator_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            "sru.toml",
            r#"
[data]
corpus_prefix = "demo"

[model]
rnn_type = "sru"
"#,
        );

        let err = TrainingConfig::from_path(&path).unwrap_err();
        let TrainingError::Validation(messages) = err else {
            panic!("expected validation error");
        };
        assert!(messages.iter().any(|m| m.contains("sru")));
    }

    #[test]
    fn overrides_reach_nested_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            "run.toml",
            r#"
[data]
corpus_prefix = "demo"
"#,
        );

        let overrides = vec![
            ("generator.learning_rate".to_string(), "0.25".to_string()),
            ("runtime.epochs".to_string(), "3".to_string()),
            ("model.rnn_type".to_string(), "gru".to_string()),
        ];
        let config = TrainingConfig::from_path_with_overrides(&path, &overrides).unwrap();
        assert_eq!(config.generator.learning_rate, 0.25);
        assert_eq!(config.runtime.epochs, 3);
        assert_eq!(config.model.rnn_type, RecurrentUnit::Gru);
    }
}
