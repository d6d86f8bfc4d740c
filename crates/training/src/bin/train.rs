use std::{
    path::PathBuf,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use clap::Parser;
use training::{Trainer, TrainingConfig, TrainingError};

fn main() {
    if let Err(err) = run() {
        eprintln!("training failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Adversarial seq2seq training CLI", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "PATH", help = "Path to training config file")]
    config: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override a configuration value using a dot-separated path"
    )]
    overrides: Vec<OverrideArg>,

    #[arg(long, value_name = "DIR", help = "Resume training from a checkpoint")]
    resume: Option<PathBuf>,

    #[arg(
        long = "d-resume",
        value_name = "DIR",
        help = "Warm start only the discriminator from a checkpoint"
    )]
    d_resume: Option<PathBuf>,
}

#[derive(Debug, Clone)]
struct OverrideArg {
    key: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if key.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            key: key.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let overrides: Vec<(String, String)> = args
        .overrides
        .into_iter()
        .map(|arg| (arg.key, arg.value))
        .collect();
    let mut config = TrainingConfig::from_path_with_overrides(&args.config, &overrides)?;
    if let Some(dir) = args.resume {
        config.runtime.train_from = Some(dir);
    }
    if let Some(dir) = args.d_resume {
        config.runtime.d_train_from = Some(dir);
    }

    let mut trainer = Trainer::new(config)?;

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown_flag.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::SeqCst);
    })
    .map_err(|err| TrainingError::runtime(format!("failed to install signal handler: {err}")))?;

    trainer.run(&shutdown_flag)
}
