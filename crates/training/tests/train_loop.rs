use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::AtomicBool,
        Arc, Mutex,
    },
};

use parallel_data::{DataType, Example, ShardDataset};
use tempfile::tempdir;
use training::{Statistics, Trainer, TrainingConfig};

const WORDS: &[&str] = &["the", "cat", "sat", "on", "mat", "dog", "ran", "fast"];

fn example(i: usize) -> Example {
    let pick = |offset: usize| WORDS[(i + offset) % WORDS.len()].to_string();
    Example {
        src: vec![pick(0), pick(1), pick(2)],
        tgt: vec![pick(1), pick(2), pick(3)],
        label: if i % 2 == 0 { "yes" } else { "no" }.to_string(),
        feats: BTreeMap::new(),
    }
}

fn write_corpus(base: &Path) {
    let tokens: Vec<String> = WORDS.iter().map(|word| word.to_string()).collect();
    let mut tgt_tokens = tokens.clone();
    tgt_tokens.push("yes".to_string());
    tgt_tokens.push("no".to_string());

    let mut vocab = BTreeMap::new();
    vocab.insert("src".to_string(), tokens);
    vocab.insert("tgt".to_string(), tgt_tokens);
    fs::write(
        base.join("demo.vocab.pt"),
        serde_json::to_string(&vocab).unwrap(),
    )
    .unwrap();

    let train: Vec<Example> = (0..8).map(example).collect();
    ShardDataset::new(DataType::Text, train)
        .save(&base.join("demo.train.0.pt"))
        .unwrap();
    let valid: Vec<Example> = (0..4).map(example).collect();
    ShardDataset::new(DataType::Text, valid)
        .save(&base.join("demo.valid.pt"))
        .unwrap();
}

fn write_config(base: &Path, name: &str, runtime_extra: &str) -> PathBuf {
    let contents = format!(
        r#"
[data]
corpus_prefix = "demo"
batch_size = 4

[model]
hidden_size = 16
embed_size = 8

[runtime]
save_model = "models/demo"
epochs = 1
report_every = 50
seed = 7
{runtime_extra}
"#
    );
    let path = base.join(name);
    fs::write(&path, contents).unwrap();
    path
}

fn find_checkpoint(models_dir: &Path) -> PathBuf {
    fs::read_dir(models_dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .find(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.starts_with("demo_acc_"))
                .unwrap_or(false)
        })
        .expect("checkpoint directory")
}

#[test]
fn epoch_drops_checkpoint_and_resume_restores_counters() {
    let tmp = tempdir().unwrap();
    let base = tmp.path();
    write_corpus(base);

    let config_path = write_config(base, "config.toml", "");
    let mut trainer = Trainer::new(TrainingConfig::from_path(&config_path).unwrap()).unwrap();
    assert_eq!(trainer.start_epoch(), 1);

    trainer.run(&AtomicBool::new(false)).unwrap();
    let steps_before = trainer.optimizer_steps();
    assert!(steps_before.0 > 0);
    assert!(steps_before.1 > 0);
    assert!(steps_before.2 > 0);

    let checkpoint = find_checkpoint(&base.join("models"));
    let dir_name = checkpoint.file_name().unwrap().to_str().unwrap();
    assert!(dir_name.ends_with("_e1"), "unexpected name {dir_name}");

    let resume_path = write_config(
        base,
        "resume.toml",
        &format!("train_from = \"{}\"", checkpoint.display()),
    );
    let resumed = Trainer::new(TrainingConfig::from_path(&resume_path).unwrap()).unwrap();
    assert_eq!(resumed.start_epoch(), 2);
    assert_eq!(resumed.optimizer_steps(), steps_before);
    assert_eq!(
        resumed.fields().nli().vocab.tokens(),
        resumed.fields().tgt().vocab.tokens()
    );
}

#[test]
fn discriminator_warm_start_leaves_other_models_fresh() {
    let tmp = tempdir().unwrap();
    let base = tmp.path();
    write_corpus(base);

    let config_path = write_config(base, "config.toml", "");
    let mut trainer = Trainer::new(TrainingConfig::from_path(&config_path).unwrap()).unwrap();
    trainer.run(&AtomicBool::new(false)).unwrap();
    let steps_before = trainer.optimizer_steps();
    let checkpoint = find_checkpoint(&base.join("models"));

    let warm_path = write_config(
        base,
        "warm.toml",
        &format!("d_train_from = \"{}\"", checkpoint.display()),
    );
    let warm = Trainer::new(TrainingConfig::from_path(&warm_path).unwrap()).unwrap();
    assert_eq!(warm.start_epoch(), 1);

    let steps = warm.optimizer_steps();
    assert_eq!(steps.0, 0);
    assert_eq!(steps.1, steps_before.1);
    assert_eq!(steps.2, 0);
}

#[test]
fn raised_stop_flag_discards_the_epoch() {
    let tmp = tempdir().unwrap();
    let base = tmp.path();
    write_corpus(base);

    let config_path = write_config(base, "config.toml", "");
    let mut trainer = Trainer::new(TrainingConfig::from_path(&config_path).unwrap()).unwrap();
    trainer.run(&AtomicBool::new(true)).unwrap();

    assert_eq!(trainer.optimizer_steps(), (0, 0, 0));
    assert!(!base.join("models").exists());
}

#[test]
fn report_hook_fires_on_first_and_last_batch() {
    let tmp = tempdir().unwrap();
    let base = tmp.path();
    write_corpus(base);

    let config_path = write_config(base, "config.toml", "");
    let mut trainer = Trainer::new(TrainingConfig::from_path(&config_path).unwrap()).unwrap();

    let events: Arc<Mutex<Vec<(usize, bool)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    trainer.set_report_func(Box::new(move |event| {
        sink.lock().unwrap().push((event.batch, event.report));
        Statistics::new()
    }));

    trainer.run(&AtomicBool::new(false)).unwrap();

    // Two training batches; the interval never divides, so only the first
    // batch reports in the loop and the final batch via the trailing report.
    let flagged: Vec<usize> = events
        .lock()
        .unwrap()
        .iter()
        .filter(|(_, report)| *report)
        .map(|(batch, _)| *batch)
        .collect();
    assert_eq!(flagged, vec![1, 2]);
}
