//! Learning rate scheduling

use crate::optimizer::Optimizer;
use crate::{LearningError, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Suffix marking a schedule that restarts when a class is exposed
const RESET_SUFFIX: &str = "_reset";

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Schedule name: "const", "exp", "cos", optionally with "_reset"
    pub name: String,
    /// Per-step decay factor for "exp"
    pub gamma: f32,
    /// Steps per cosine cycle
    pub period: usize,
    /// Cosine floor as a fraction of the base rate
    pub min_lr_ratio: f32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: "exp_reset".into(),
            gamma: 0.9999,
            period: 1000,
            min_lr_ratio: 0.01,
        }
    }
}

/// Scheduler type
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SchedulerType {
    /// Constant learning rate
    Constant,
    /// Multiply by `gamma` every step
    Exponential { gamma: f32 },
    /// Cosine annealing, restarting every `period` steps
    Cosine { period: usize, min_lr_ratio: f32 },
}

impl SchedulerType {
    /// Parse a schedule name; returns the type and the reset flag
    pub fn parse(config: &SchedulerConfig) -> Result<(Self, bool)> {
        let name = config.name.to_lowercase();
        let (base, reset) = match name.strip_suffix(RESET_SUFFIX) {
            Some(base) => (base, true),
            None => (name.as_str(), false),
        };
        let kind = match base {
            "const" | "constant" => SchedulerType::Constant,
            "exp" | "exponential" => SchedulerType::Exponential {
                gamma: config.gamma,
            },
            "cos" | "cosine" => SchedulerType::Cosine {
                period: config.period.max(1),
                min_lr_ratio: config.min_lr_ratio,
            },
            _ => {
                return Err(LearningError::ConfigError(format!(
                    "unknown scheduler '{}'",
                    config.name
                )))
            }
        };
        Ok((kind, reset))
    }
}

/// Learning rate scheduler
#[derive(Debug, Clone)]
pub struct LearningRateScheduler {
    /// Schedule shape
    kind: SchedulerType,
    /// Rate at step 0 and after every reset
    base_lr: f32,
    /// Restart when the head grows
    reset_on_class_growth: bool,
    /// Steps since the last reset
    current_step: usize,
    /// Current learning rate
    current_lr: f32,
}

impl LearningRateScheduler {
    /// Create new scheduler
    pub fn new(config: &SchedulerConfig, base_lr: f32) -> Result<Self> {
        let (kind, reset_on_class_growth) = SchedulerType::parse(config)?;
        Ok(Self {
            kind,
            base_lr,
            reset_on_class_growth,
            current_step: 0,
            current_lr: base_lr,
        })
    }

    /// Step the scheduler
    pub fn step(&mut self) -> f32 {
        self.current_step += 1;
        self.current_lr = self.compute_lr(self.current_step);
        self.current_lr
    }

    /// Compute learning rate for a given step
    fn compute_lr(&self, step: usize) -> f32 {
        match self.kind {
            SchedulerType::Constant => self.base_lr,
            SchedulerType::Exponential { gamma } => self.current_lr * gamma,
            SchedulerType::Cosine {
                period,
                min_lr_ratio,
            } => {
                let min_lr = self.base_lr * min_lr_ratio;
                let progress = (step % period) as f32 / period as f32;
                let cosine_decay = 0.5 * (1.0 + (std::f32::consts::PI * progress).cos());
                min_lr + (self.base_lr - min_lr) * cosine_decay
            }
        }
    }

    /// Get current learning rate
    pub fn get_lr(&self) -> f32 {
        self.current_lr
    }

    /// Get current step
    pub fn current_step(&self) -> usize {
        self.current_step
    }

    pub fn kind(&self) -> SchedulerType {
        self.kind
    }

    /// Whether `on_class_growth` restarts the schedule
    pub fn reset_on_class_growth(&self) -> bool {
        self.reset_on_class_growth
    }

    /// Reset scheduler to the base rate
    pub fn reset(&mut self) {
        self.current_step = 0;
        self.current_lr = self.base_lr;
    }

    /// React to head growth; returns true if the schedule restarted
    pub fn on_class_growth(&mut self) -> bool {
        if self.reset_on_class_growth {
            self.reset();
            debug!(lr = self.current_lr, "schedule reset on class growth");
        }
        self.reset_on_class_growth
    }

    /// Push the current rate into every optimizer group
    pub fn apply(&self, optimizer: &mut Optimizer) {
        optimizer.set_lr(self.current_lr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::OptimizerKind;

    fn config(name: &str) -> SchedulerConfig {
        SchedulerConfig {
            name: name.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_constant_scheduler() {
        let mut scheduler = LearningRateScheduler::new(&config("const"), 0.001).unwrap();

        for _ in 0..100 {
            let lr = scheduler.step();
            assert_eq!(lr, 0.001);
        }
    }

    #[test]
    fn test_exponential_decay() {
        let cfg = SchedulerConfig {
            name: "exp".into(),
            gamma: 0.5,
            ..Default::default()
        };
        let mut scheduler = LearningRateScheduler::new(&cfg, 1.0).unwrap();

        scheduler.step();
        scheduler.step();
        assert!((scheduler.get_lr() - 0.25).abs() < 1e-6);
        assert!(!scheduler.on_class_growth());
        assert!((scheduler.get_lr() - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_reset_suffix() {
        let cfg = SchedulerConfig {
            name: "exp_reset".into(),
            gamma: 0.5,
            ..Default::default()
        };
        let mut scheduler = LearningRateScheduler::new(&cfg, 1.0).unwrap();
        assert!(scheduler.reset_on_class_growth());

        scheduler.step();
        assert!(scheduler.on_class_growth());
        assert_eq!(scheduler.get_lr(), 1.0);
        assert_eq!(scheduler.current_step(), 0);
    }

    #[test]
    fn test_cosine_annealing() {
        let cfg = SchedulerConfig {
            name: "cos".into(),
            period: 100,
            min_lr_ratio: 0.0,
            ..Default::default()
        };
        let mut scheduler = LearningRateScheduler::new(&cfg, 1.0).unwrap();

        let lr_start = scheduler.get_lr();
        for _ in 0..99 {
            scheduler.step();
        }
        let lr_end = scheduler.get_lr();

        assert!(lr_start > lr_end);
        assert!(lr_end < 0.1);

        // Restarts at the cycle boundary
        assert_eq!(scheduler.step(), 1.0);
    }

    #[test]
    fn test_unknown_name() {
        let err = LearningRateScheduler::new(&config("onecycle"), 0.1).unwrap_err();
        assert_eq!(err.category(), "config_error");
    }

    #[test]
    fn test_apply_sets_group_rates() {
        let mut opt = Optimizer::new(
            OptimizerKind::Sgd {
                momentum: 0.0,
                weight_decay: 0.0,
            },
            1.0,
        );
        let g = opt.add_group("pool", 1.0);
        let cfg = SchedulerConfig {
            name: "exp".into(),
            gamma: 0.1,
            ..Default::default()
        };
        let mut scheduler = LearningRateScheduler::new(&cfg, 1.0).unwrap();
        scheduler.step();
        scheduler.apply(&mut opt);
        assert!((opt.group(g).unwrap().lr() - 0.1).abs() < 1e-6);
    }
}
