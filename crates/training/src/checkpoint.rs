//! Checkpoint drops and resumes. Each drop is a directory named after the
//! validation scores of the epoch it closes, holding one safetensors file
//! per sub-model, the optimizer states, and a manifest with sha256 digests
//! for tamper detection.

use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::safetensors::load as load_safetensors;
use candle_core::{Device, Var};
use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::{TrainingConfig, TrainingError};
use crate::optim::OptimState;

pub const CHECKPOINT_VERSION: u32 = 1;
const GENERATOR_FILENAME: &str = "generator.safetensors";
const DISCRIMINATOR_FILENAME: &str = "discriminator.safetensors";
const NLI_FILENAME: &str = "nli.safetensors";
const OPTIM_FILENAME: &str = "optim.json";
const MANIFEST_FILENAME: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Optimizer snapshots for all three sub-models, serialized together so a
/// resumed run continues every schedule from where it stopped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimStates {
    pub generator: OptimState,
    pub discriminator: OptimState,
    pub nli: OptimState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub epoch: usize,
    pub config: TrainingConfig,
    /// Vocabulary tokens per field name, in index order.
    pub vocab: BTreeMap<String, Vec<String>>,
    pub generator: FileRecord,
    pub discriminator: FileRecord,
    pub nli: FileRecord,
    pub optim: FileRecord,
}

pub struct SaveRequest<'a> {
    pub config: &'a TrainingConfig,
    pub vocab: BTreeMap<String, Vec<String>>,
    pub epoch: usize,
    pub accuracy: f64,
    pub ppl: f64,
    pub generator: &'a [(String, Var)],
    pub discriminator: &'a [(String, Var)],
    pub nli: &'a [(String, Var)],
    pub optim: OptimStates,
}

#[derive(Debug, Clone)]
pub struct CheckpointDescriptor {
    pub directory: PathBuf,
    pub manifest: CheckpointManifest,
}

#[derive(Debug)]
pub struct LoadOutcome {
    pub manifest: CheckpointManifest,
    pub optim: OptimStates,
    pub generator_weights: PathBuf,
    pub discriminator_weights: PathBuf,
    pub nli_weights: PathBuf,
}

/// Directory a drop for the given scores lands in, next to the configured
/// model prefix.
pub fn checkpoint_dir(save_model: &Path, accuracy: f64, ppl: f64, epoch: usize) -> PathBuf {
    let stem = save_model
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "model".to_string());
    let parent = save_model.parent().unwrap_or_else(|| Path::new("."));
    parent.join(format!(
        "{}_acc_{:.2}_ppl_{:.2}_e{}",
        stem, accuracy, ppl, epoch
    ))
}

/// Writes a checkpoint for the finished epoch. Returns `None` without
/// touching the filesystem while the epoch is below the configured
/// checkpoint threshold.
pub fn drop_checkpoint(
    request: SaveRequest<'_>,
) -> Result<Option<CheckpointDescriptor>, TrainingError> {
    if request.epoch < request.config.runtime.start_checkpoint_at {
        return Ok(None);
    }

    let directory = checkpoint_dir(
        &request.config.runtime.save_model,
        request.accuracy,
        request.ppl,
        request.epoch,
    );
    if let Some(parent) = directory.parent() {
        fs::create_dir_all(parent).map_err(|err| {
            TrainingError::checkpoint(format!(
                "failed to create checkpoint parent {}: {err}",
                parent.display()
            ))
        })?;
    }
    if directory.exists() {
        fs::remove_dir_all(&directory).map_err(|err| {
            TrainingError::checkpoint(format!(
                "failed to replace existing checkpoint {}: {err}",
                directory.display()
            ))
        })?;
    }
    fs::create_dir(&directory).map_err(|err| {
        TrainingError::checkpoint(format!(
            "failed to create checkpoint directory {}: {err}",
            directory.display()
        ))
    })?;

    let generator_path = directory.join(GENERATOR_FILENAME);
    save_weights(request.generator, &generator_path)?;
    let discriminator_path = directory.join(DISCRIMINATOR_FILENAME);
    save_weights(request.discriminator, &discriminator_path)?;
    let nli_path = directory.join(NLI_FILENAME);
    save_weights(request.nli, &nli_path)?;

    let optim_path = directory.join(OPTIM_FILENAME);
    write_json(&optim_path, &request.optim)?;

    let manifest = CheckpointManifest {
        version: CHECKPOINT_VERSION,
        created_unix_timestamp: unix_timestamp(),
        epoch: request.epoch,
        config: request.config.clone(),
        vocab: request.vocab,
        generator: file_record(&generator_path)?,
        discriminator: file_record(&discriminator_path)?,
        nli: file_record(&nli_path)?,
        optim: file_record(&optim_path)?,
    };
    write_json(&directory.join(MANIFEST_FILENAME), &manifest)?;

    Ok(Some(CheckpointDescriptor {
        directory,
        manifest,
    }))
}

/// Reads a checkpoint back, verifying the manifest version and every file
/// digest before any state is returned.
pub fn load_checkpoint(directory: &Path) -> Result<LoadOutcome, TrainingError> {
    let manifest = load_manifest(directory)?;
    ensure_version_supported(manifest.version)?;

    let generator_weights = directory.join(&manifest.generator.filename);
    validate_file(&generator_weights, &manifest.generator.sha256)?;
    let discriminator_weights = directory.join(&manifest.discriminator.filename);
    validate_file(&discriminator_weights, &manifest.discriminator.sha256)?;
    let nli_weights = directory.join(&manifest.nli.filename);
    validate_file(&nli_weights, &manifest.nli.sha256)?;

    let optim_path = directory.join(&manifest.optim.filename);
    validate_file(&optim_path, &manifest.optim.sha256)?;
    let optim: OptimStates = read_json(&optim_path)?;

    Ok(LoadOutcome {
        manifest,
        optim,
        generator_weights,
        discriminator_weights,
        nli_weights,
    })
}

/// Pulls only the discriminator out of a checkpoint, for runs that warm
/// start the discriminator while training everything else from scratch.
pub fn load_discriminator(directory: &Path) -> Result<(PathBuf, OptimState), TrainingError> {
    let manifest = load_manifest(directory)?;
    ensure_version_supported(manifest.version)?;

    let weights = directory.join(&manifest.discriminator.filename);
    validate_file(&weights, &manifest.discriminator.sha256)?;
    let optim_path = directory.join(&manifest.optim.filename);
    validate_file(&optim_path, &manifest.optim.sha256)?;
    let optim: OptimStates = read_json(&optim_path)?;
    Ok((weights, optim.discriminator))
}

/// Copies saved tensors into live parameters by name. Both a missing and an
/// unused name are errors; silent partial loads are worse than failing.
pub fn apply_weights(
    params: &[(String, Var)],
    weights_path: &Path,
    device: &Device,
) -> Result<(), TrainingError> {
    let tensors = load_safetensors(weights_path, device)
        .map_err(|err| TrainingError::checkpoint(err.to_string()))?;
    let mut by_name: std::collections::HashMap<_, _> = tensors.into_iter().collect();

    for (name, var) in params {
        let tensor = by_name.remove(name).ok_or_else(|| {
            TrainingError::checkpoint(format!("checkpoint missing parameter {name}"))
        })?;
        var.set(&tensor)
            .map_err(|err| TrainingError::checkpoint(err.to_string()))?;
    }

    if !by_name.is_empty() {
        let extra = by_name.keys().cloned().collect::<Vec<_>>().join(", ");
        return Err(TrainingError::checkpoint(format!(
            "checkpoint contains unused parameters: {extra}"
        )));
    }
    Ok(())
}

fn save_weights(params: &[(String, Var)], path: &Path) -> Result<(), TrainingError> {
    if params.is_empty() {
        return Err(TrainingError::checkpoint(
            "sub-model contains no parameters to checkpoint",
        ));
    }
    let mut tensors = std::collections::HashMap::with_capacity(params.len());
    for (name, var) in params {
        tensors.insert(name.clone(), var.as_tensor().clone());
    }
    candle_core::safetensors::save(&tensors, path).map_err(|err| {
        TrainingError::checkpoint(format!(
            "failed to serialize weights to {}: {err}",
            path.display()
        ))
    })
}

fn load_manifest(directory: &Path) -> Result<CheckpointManifest, TrainingError> {
    let manifest_path = directory.join(MANIFEST_FILENAME);
    if !manifest_path.is_file() {
        return Err(TrainingError::checkpoint(format!(
            "checkpoint manifest not found at {}",
            manifest_path.display()
        )));
    }
    read_json(&manifest_path)
}

fn ensure_version_supported(version: u32) -> Result<(), TrainingError> {
    if version != CHECKPOINT_VERSION {
        return Err(TrainingError::checkpoint(format!(
            "unsupported checkpoint version {} (expected {})",
            version, CHECKPOINT_VERSION
        )));
    }
    Ok(())
}

fn validate_file(path: &Path, expected_sha: &str) -> Result<(), TrainingError> {
    let actual = sha256_file(path)?;
    if actual != expected_sha {
        return Err(TrainingError::checkpoint(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(())
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let sha256 = sha256_file(path)?;
    let bytes = path
        .metadata()
        .map_err(|err| {
            TrainingError::checkpoint(format!(
                "failed to stat checkpoint file {}: {err}",
                path.display()
            ))
        })?
        .len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainingError::checkpoint(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256,
        bytes,
    })
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| {
        TrainingError::checkpoint(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|err| {
            TrainingError::checkpoint(format!("failed to read {}: {err}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let mut file = File::create(path).map_err(|err| {
        TrainingError::checkpoint(format!("failed to create {}: {err}", path.display()))
    })?;
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::checkpoint(format!("failed to serialize JSON: {err}")))?;
    file.write_all(&data).and_then(|_| file.write_all(b"\n")).map_err(|err| {
        TrainingError::checkpoint(format!("failed to write {}: {err}", path.display()))
    })
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path).map_err(|err| {
        TrainingError::checkpoint(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(file).map_err(|err| {
        TrainingError::checkpoint(format!("failed to parse JSON {}: {err}", path.display()))
    })
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OptimSettings;
    use crate::optim::Optim;
    use candle_core::Tensor;

    fn named_vars(prefix: &str, count: usize) -> Vec<(String, Var)> {
        (0..count)
            .map(|i| {
                let tensor = Tensor::from_vec(
                    vec![i as f32, i as f32 + 0.5],
                    (2,),
                    &Device::Cpu,
                )
                .unwrap();
                (
                    format!("{}.p{}", prefix, i),
                    Var::from_tensor(&tensor).unwrap(),
                )
            })
            .collect()
    }

    fn optim_state(params: &[(String, Var)]) -> OptimState {
        Optim::new(params.to_vec(), &OptimSettings::default(), 8)
            .unwrap()
            .state()
            .unwrap()
    }

    fn config(dir: &Path) -> TrainingConfig {
        let mut config: TrainingConfig =
            toml::from_str("[data]\ncorpus_prefix = \"corpus/demo\"").unwrap();
        config.runtime.save_model = dir.join("demo");
        config.runtime.start_checkpoint_at = 0;
        config
    }

    fn vocab() -> BTreeMap<String, Vec<String>> {
        let mut map = BTreeMap::new();
        map.insert(
            "src".to_string(),
            vec!["<unk>".to_string(), "<blank>".to_string(), "a".to_string()],
        );
        map
    }

    fn drop_for(config: &TrainingConfig, epoch: usize) -> Option<CheckpointDescriptor> {
        let generator = named_vars("encoder", 2);
        let discriminator = named_vars("disc", 1);
        let nli = named_vars("nli", 1);
        let optim = OptimStates {
            generator: optim_state(&generator),
            discriminator: optim_state(&discriminator),
            nli: optim_state(&nli),
        };
        drop_checkpoint(SaveRequest {
            config,
            vocab: vocab(),
            epoch,
            accuracy: 12.345,
            ppl: 6.789,
            generator: &generator,
            discriminator: &discriminator,
            nli: &nli,
            optim,
        })
        .unwrap()
    }

    #[test]
    fn directory_name_encodes_scores_and_epoch() {
        let dir = checkpoint_dir(Path::new("/tmp/run/demo"), 12.345, 6.789, 3);
        assert_eq!(dir, Path::new("/tmp/run/demo_acc_12.35_ppl_6.79_e3"));
    }

    #[test]
    fn epochs_below_threshold_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.runtime.start_checkpoint_at = 5;
        assert!(drop_for(&config, 4).is_none());
        assert!(drop_for(&config, 5).is_some());
    }

    #[test]
    fn round_trip_restores_weights_and_optimizer_state() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let descriptor = drop_for(&config, 2).unwrap();

        let outcome = load_checkpoint(&descriptor.directory).unwrap();
        assert_eq!(outcome.manifest.epoch, 2);
        assert_eq!(outcome.manifest.vocab["src"].len(), 3);

        let fresh = {
            let mut params = named_vars("encoder", 2);
            for (_, var) in params.iter_mut() {
                let zeros = Tensor::zeros((2,), candle_core::DType::F32, &Device::Cpu).unwrap();
                var.set(&zeros).unwrap();
            }
            params
        };
        apply_weights(&fresh, &outcome.generator_weights, &Device::Cpu).unwrap();
        let restored: Vec<f32> = fresh[1].1.as_tensor().to_vec1().unwrap();
        assert_eq!(restored, vec![1.0, 1.5]);

        assert_eq!(outcome.optim.generator.parameters.len(), 2);
    }

    #[test]
    fn tampered_weights_fail_validation() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let descriptor = drop_for(&config, 1).unwrap();

        let victim = descriptor.directory.join(GENERATOR_FILENAME);
        let mut bytes = fs::read(&victim).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&victim, bytes).unwrap();

        let err = load_checkpoint(&descriptor.directory).unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let descriptor = drop_for(&config, 1).unwrap();

        let manifest_path = descriptor.directory.join(MANIFEST_FILENAME);
        let text = fs::read_to_string(&manifest_path).unwrap();
        fs::write(&manifest_path, text.replacen("\"version\": 1", "\"version\": 9", 1)).unwrap();

        let err = load_checkpoint(&descriptor.directory).unwrap_err();
        assert!(err.to_string().contains("version"));
    }

    #[test]
    fn discriminator_loads_standalone() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let descriptor = drop_for(&config, 1).unwrap();

        let (weights, state) = load_discriminator(&descriptor.directory).unwrap();
        assert!(weights.ends_with(DISCRIMINATOR_FILENAME));
        assert_eq!(state.parameters.len(), 1);

        let fresh = named_vars("disc", 1);
        apply_weights(&fresh, &weights, &Device::Cpu).unwrap();
    }

    #[test]
    fn apply_rejects_mismatched_parameter_sets() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let descriptor = drop_for(&config, 1).unwrap();
        let outcome = load_checkpoint(&descriptor.directory).unwrap();

        let wrong = named_vars("other", 2);
        let err = apply_weights(&wrong, &outcome.generator_weights, &Device::Cpu).unwrap_err();
        assert!(err.to_string().contains("missing parameter"));
    }
}
