//! Training hyperparameters.
//!
//! Epochs, batch size, learning rate, and sequence length are exposed on the
//! CLI; the remaining knobs are process-wide constants carried explicitly so
//! they stay visible and overridable in tests.

pub use crate::model::lora::LoraHyperparams;

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub max_seq_length: usize,
    pub gradient_accumulation_steps: usize,
    /// Log the running loss every this many optimizer steps.
    pub logging_steps: usize,
    /// Write a checkpoint every this many optimizer steps.
    pub save_steps: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 3,
            batch_size: 1,
            learning_rate: 2e-4,
            max_seq_length: 512,
            gradient_accumulation_steps: 4,
            logging_steps: 5,
            save_steps: 50,
        }
    }
}

impl TrainingConfig {
    /// Examples consumed per optimizer step.
    pub fn examples_per_step(&self) -> usize {
        self.batch_size * self.gradient_accumulation_steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_pipeline_constants() {
        let config = TrainingConfig::default();
        assert_eq!(config.epochs, 3);
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.learning_rate, 2e-4);
        assert_eq!(config.max_seq_length, 512);
        assert_eq!(config.gradient_accumulation_steps, 4);
        assert_eq!(config.logging_steps, 5);
        assert_eq!(config.save_steps, 50);
        assert_eq!(config.examples_per_step(), 4);
    }
}
