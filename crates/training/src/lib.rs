pub mod checkpoint;
pub mod config;
pub mod logging;
pub mod loss;
pub mod model;
pub mod optim;
pub mod statistics;
pub mod trainer;

pub use config::{TrainingConfig, TrainingError};
pub use logging::Logger;
pub use loss::{LabelLoss, LossOutput, SequenceLoss};
pub use model::{Discriminator, Generator, NliClassifier, SubModel};
pub use optim::{Optim, OptimState};
pub use statistics::{console_report, ReportEvent, ReportFunc, Statistics};
pub use trainer::{EpochPhase, Trainer};
