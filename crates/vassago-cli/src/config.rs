//! Run configuration loading

use std::path::Path;

use serde::{Deserialize, Serialize};
use vassago_learning::{BackboneConfig, LearningError, TrainerConfig, WorkerConfig};

/// Synthetic class-incremental stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Total classes, split evenly over tasks
    pub num_classes: usize,
    /// Number of tasks
    pub n_tasks: usize,
    /// Training samples per class
    pub samples_per_class: usize,
    /// Held-out samples per class
    pub eval_per_class: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    /// Std of the class centers
    pub separation: f32,
    /// Std of samples around their center
    pub noise: f32,
    /// Seed of the data, independent of the trainer seed
    pub seed: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            num_classes: 10,
            n_tasks: 5,
            samples_per_class: 200,
            eval_per_class: 50,
            channels: 1,
            height: 8,
            width: 8,
            separation: 1.0,
            noise: 0.5,
            seed: 0,
        }
    }
}

/// Everything one `vassago` run needs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub trainer: TrainerConfig,
    pub backbone: BackboneConfig,
    pub stream: StreamConfig,
    pub workers: WorkerConfig,
}

impl RunConfig {
    /// Load from a `.toml` or `.json` file
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let text = std::fs::read_to_string(path).map_err(LearningError::from)?;
        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&text)?,
            Some("json") => serde_json::from_str(&text)?,
            other => {
                return Err(LearningError::ConfigError(format!(
                    "unsupported config extension {:?}; use .toml or .json",
                    other.unwrap_or("")
                ))
                .into())
            }
        };
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, Box<dyn std::error::Error>> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> vassago_learning::Result<()> {
        self.trainer.validate()?;
        self.workers.validate()?;
        let s = &self.stream;
        if s.n_tasks == 0 || s.num_classes < s.n_tasks {
            return Err(LearningError::precondition(
                "0 < n_tasks <= num_classes",
                format!("{} tasks over {} classes", s.n_tasks, s.num_classes),
            ));
        }
        if s.channels * s.height * s.width == 0 {
            return Err(LearningError::precondition(
                "non-empty input shape",
                format!("{}x{}x{}", s.channels, s.height, s.width),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let text = r#"
            [trainer]
            batch_size = 8
            stream_batch_size = 4

            [trainer.pool]
            pool_size = 6
            selection_size = 2

            [stream]
            n_tasks = 2
        "#;
        let config: RunConfig = toml::from_str(text).unwrap();
        assert_eq!(config.trainer.batch_size, 8);
        assert_eq!(config.trainer.pool.pool_size, 6);
        assert_eq!(config.trainer.pool.prompt_len, 5);
        assert_eq!(config.trainer.scheduler.name, "exp_reset");
        assert_eq!(config.stream.n_tasks, 2);
        assert_eq!(config.workers.world_size, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_dumped_config_reloads() {
        let config = RunConfig::default();
        let text = config.to_toml().unwrap();
        let back: RunConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.trainer.eval_period, config.trainer.eval_period);
        assert_eq!(back.backbone.name, config.backbone.name);
    }

    #[test]
    fn test_json_config() {
        let config: RunConfig =
            serde_json::from_str(r#"{"workers": {"rank": 0, "world_size": 2}}"#).unwrap();
        assert_eq!(config.workers.world_size, 2);
        assert_eq!(config.workers.rendezvous_addr, "inproc://vassago");
    }

    #[test]
    fn test_too_many_tasks_rejected() {
        let mut config = RunConfig::default();
        config.stream.n_tasks = 11;
        assert!(config.validate().is_err());
    }
}
