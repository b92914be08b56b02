//! Supervised LoRA fine-tuning.

pub mod config;
pub mod trainer;

pub use config::TrainingConfig;
pub use trainer::{SftTrainer, TrainingSummary};
