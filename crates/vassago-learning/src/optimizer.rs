//! First-order optimizers with explicitly identified parameter groups
//!
//! Per-parameter state (momentum, Adam moments) lives inside the group that
//! owns the parameter, keyed by parameter name. Removing a group drops its
//! state with it, so a resized parameter can never be updated with moments
//! recorded for its previous shape.

use crate::{LearningError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Identifier of a parameter group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(u64);

impl GroupId {
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "group#{}", self.0)
    }
}

/// Optimizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Registry name: "sgd", "adam" or "adamw"
    pub name: String,
    /// Base learning rate
    pub lr: f32,
    /// SGD momentum
    pub momentum: f32,
    /// Adam first moment decay
    pub beta1: f32,
    /// Adam second moment decay
    pub beta2: f32,
    /// Adam denominator epsilon
    pub eps: f32,
    /// L2 (SGD/Adam) or decoupled (AdamW) weight decay
    pub weight_decay: f32,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            name: "adam".into(),
            lr: 0.005,
            momentum: 0.9,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

/// Update rule
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OptimizerKind {
    Sgd {
        momentum: f32,
        weight_decay: f32,
    },
    Adam {
        beta1: f32,
        beta2: f32,
        eps: f32,
        weight_decay: f32,
    },
    AdamW {
        beta1: f32,
        beta2: f32,
        eps: f32,
        weight_decay: f32,
    },
}

type OptimizerFactory = fn(&OptimizerConfig) -> OptimizerKind;

fn build_sgd(c: &OptimizerConfig) -> OptimizerKind {
    OptimizerKind::Sgd {
        momentum: c.momentum,
        weight_decay: c.weight_decay,
    }
}

fn build_adam(c: &OptimizerConfig) -> OptimizerKind {
    OptimizerKind::Adam {
        beta1: c.beta1,
        beta2: c.beta2,
        eps: c.eps,
        weight_decay: c.weight_decay,
    }
}

fn build_adamw(c: &OptimizerConfig) -> OptimizerKind {
    OptimizerKind::AdamW {
        beta1: c.beta1,
        beta2: c.beta2,
        eps: c.eps,
        weight_decay: c.weight_decay,
    }
}

/// Optimizers selectable by name
const OPTIMIZERS: &[(&str, OptimizerFactory)] = &[
    ("sgd", build_sgd),
    ("adam", build_adam),
    ("adamw", build_adamw),
];

/// Names accepted by [`Optimizer::from_config`]
pub fn optimizer_names() -> impl Iterator<Item = &'static str> {
    OPTIMIZERS.iter().map(|(name, _)| *name)
}

/// Per-parameter optimizer state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamState {
    /// Updates applied so far
    pub step: u64,
    /// Momentum buffer / first moment
    pub m: Vec<f32>,
    /// Second moment
    pub v: Vec<f32>,
}

/// Named set of parameters sharing a learning rate
#[derive(Debug, Clone)]
pub struct ParamGroup {
    id: GroupId,
    name: String,
    lr: f32,
    state: HashMap<String, ParamState>,
}

impl ParamGroup {
    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lr(&self) -> f32 {
        self.lr
    }

    pub fn state(&self, param: &str) -> Option<&ParamState> {
        self.state.get(param)
    }

    /// Parameters with recorded state
    pub fn state_len(&self) -> usize {
        self.state.len()
    }
}

/// Optimizer over externally owned parameters
#[derive(Debug)]
pub struct Optimizer {
    kind: OptimizerKind,
    base_lr: f32,
    groups: BTreeMap<GroupId, ParamGroup>,
    pending: BTreeMap<(GroupId, String), Vec<f32>>,
    next_id: u64,
}

impl Optimizer {
    pub fn new(kind: OptimizerKind, base_lr: f32) -> Self {
        Self {
            kind,
            base_lr,
            groups: BTreeMap::new(),
            pending: BTreeMap::new(),
            next_id: 0,
        }
    }

    /// Build the optimizer named in the config
    pub fn from_config(config: &OptimizerConfig) -> Result<Self> {
        let name = config.name.to_lowercase();
        let factory = OPTIMIZERS
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, f)| f)
            .ok_or_else(|| {
                LearningError::ConfigError(format!("unknown optimizer '{}'", config.name))
            })?;
        Ok(Self::new(factory(config), config.lr))
    }

    pub fn kind(&self) -> OptimizerKind {
        self.kind
    }

    pub fn base_lr(&self) -> f32 {
        self.base_lr
    }

    /// Register a new group and return its id
    pub fn add_group(&mut self, name: impl Into<String>, lr: f32) -> GroupId {
        let id = GroupId(self.next_id);
        self.next_id += 1;
        self.groups.insert(
            id,
            ParamGroup {
                id,
                name: name.into(),
                lr,
                state: HashMap::new(),
            },
        );
        id
    }

    /// Remove a group together with its state and unapplied gradients
    pub fn remove_group(&mut self, id: GroupId) -> Result<ParamGroup> {
        self.pending.retain(|(g, _), _| *g != id);
        self.groups
            .remove(&id)
            .ok_or_else(|| LearningError::precondition("parameter group registered", id))
    }

    /// Drop per-parameter state of a group
    pub fn clear_state(&mut self, id: GroupId) -> Result<()> {
        self.group_mut(id)?.state.clear();
        Ok(())
    }

    pub fn group(&self, id: GroupId) -> Option<&ParamGroup> {
        self.groups.get(&id)
    }

    fn group_mut(&mut self, id: GroupId) -> Result<&mut ParamGroup> {
        self.groups
            .get_mut(&id)
            .ok_or_else(|| LearningError::precondition("parameter group registered", id))
    }

    pub fn groups(&self) -> impl Iterator<Item = &ParamGroup> {
        self.groups.values()
    }

    /// Set the learning rate of every group
    pub fn set_lr(&mut self, lr: f32) {
        for group in self.groups.values_mut() {
            group.lr = lr;
        }
    }

    /// Add a gradient for a parameter; applied on the next `step_param`
    pub fn accumulate(&mut self, id: GroupId, param: &str, grad: &[f32]) -> Result<()> {
        if !self.groups.contains_key(&id) {
            return Err(LearningError::precondition("parameter group registered", id));
        }
        let acc = self
            .pending
            .entry((id, param.to_string()))
            .or_insert_with(|| vec![0.0; grad.len()]);
        if acc.len() != grad.len() {
            return Err(LearningError::shape(&[acc.len()], &[grad.len()]));
        }
        for (a, g) in acc.iter_mut().zip(grad) {
            *a += g;
        }
        Ok(())
    }

    /// Whether gradients were accumulated but not applied yet
    pub fn has_pending_gradients(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Mutable view of every pending gradient, for collective averaging
    pub fn pending_mut(&mut self) -> impl Iterator<Item = (GroupId, &str, &mut Vec<f32>)> {
        self.pending
            .iter_mut()
            .map(|((g, name), grad)| (*g, name.as_str(), grad))
    }

    /// Scale every pending gradient so its joint L2 norm is at most `max_norm`
    pub fn clip_pending(&mut self, max_norm: f32) -> f32 {
        let total_norm = self
            .pending
            .values()
            .flat_map(|g| g.iter())
            .map(|g| g * g)
            .sum::<f32>()
            .sqrt();
        if total_norm > max_norm {
            let scale = max_norm / total_norm;
            for grad in self.pending.values_mut() {
                for g in grad.iter_mut() {
                    *g *= scale;
                }
            }
        }
        total_norm
    }

    /// Apply the pending gradient of one parameter; false if it had none
    pub fn step_param(&mut self, id: GroupId, param: &str, values: &mut [f32]) -> Result<bool> {
        let Some(grad) = self.pending.remove(&(id, param.to_string())) else {
            return Ok(false);
        };
        if grad.len() != values.len() {
            return Err(LearningError::shape(&[values.len()], &[grad.len()]));
        }

        let kind = self.kind;
        let group = self.group_mut(id)?;
        let lr = group.lr;
        let state = group.state.entry(param.to_string()).or_default();
        if state.m.len() != values.len() {
            state.m = vec![0.0; values.len()];
            state.v = vec![0.0; values.len()];
            state.step = 0;
        }
        state.step += 1;

        match kind {
            OptimizerKind::Sgd {
                momentum,
                weight_decay,
            } => {
                let first = state.step == 1;
                for ((w, g), m) in values.iter_mut().zip(&grad).zip(state.m.iter_mut()) {
                    let g = g + weight_decay * *w;
                    *m = if first { g } else { momentum * *m + g };
                    *w -= lr * *m;
                }
            }
            OptimizerKind::Adam {
                beta1,
                beta2,
                eps,
                weight_decay,
            }
            | OptimizerKind::AdamW {
                beta1,
                beta2,
                eps,
                weight_decay,
            } => {
                let decoupled = matches!(kind, OptimizerKind::AdamW { .. });
                let t = state.step as i32;
                let bias1 = 1.0 - beta1.powi(t);
                let bias2 = 1.0 - beta2.powi(t);
                for (((w, g), m), v) in values
                    .iter_mut()
                    .zip(&grad)
                    .zip(state.m.iter_mut())
                    .zip(state.v.iter_mut())
                {
                    let g = if decoupled { *g } else { g + weight_decay * *w };
                    if decoupled {
                        *w -= lr * weight_decay * *w;
                    }
                    *m = beta1 * *m + (1.0 - beta1) * g;
                    *v = beta2 * *v + (1.0 - beta2) * g * g;
                    let m_hat = *m / bias1;
                    let v_hat = *v / bias2;
                    *w -= lr * m_hat / (v_hat.sqrt() + eps);
                }
            }
        }
        Ok(true)
    }

    /// Close an optimizer step; every accumulated gradient must have been applied
    pub fn finish_step(&mut self) -> Result<()> {
        if let Some(((id, name), _)) = self.pending.iter().next() {
            let leftover = format!("{}:{} ({} pending)", id, name, self.pending.len());
            self.pending.clear();
            return Err(LearningError::precondition(
                "all accumulated gradients applied before the step closes",
                leftover,
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sgd(momentum: f32) -> Optimizer {
        Optimizer::new(
            OptimizerKind::Sgd {
                momentum,
                weight_decay: 0.0,
            },
            0.1,
        )
    }

    #[test]
    fn test_registry_names() {
        let names: Vec<_> = optimizer_names().collect();
        assert_eq!(names, vec!["sgd", "adam", "adamw"]);

        let config = OptimizerConfig {
            name: "SGD".into(),
            ..Default::default()
        };
        assert!(matches!(
            Optimizer::from_config(&config).unwrap().kind(),
            OptimizerKind::Sgd { .. }
        ));

        let bad = OptimizerConfig {
            name: "lion".into(),
            ..Default::default()
        };
        assert!(Optimizer::from_config(&bad).is_err());
    }

    #[test]
    fn test_sgd_step() {
        let mut opt = sgd(0.0);
        let g = opt.add_group("head", 0.1);
        let mut w = vec![1.0, 2.0];

        opt.accumulate(g, "weight", &[1.0, -1.0]).unwrap();
        assert!(opt.has_pending_gradients());
        assert!(opt.step_param(g, "weight", &mut w).unwrap());
        opt.finish_step().unwrap();

        assert!((w[0] - 0.9).abs() < 1e-6);
        assert!((w[1] - 2.1).abs() < 1e-6);
        assert!(!opt.has_pending_gradients());
    }

    #[test]
    fn test_accumulate_sums() {
        let mut opt = sgd(0.0);
        let g = opt.add_group("pool", 1.0);
        let mut w = vec![0.0];
        opt.accumulate(g, "key.0", &[1.0]).unwrap();
        opt.accumulate(g, "key.0", &[2.0]).unwrap();
        opt.step_param(g, "key.0", &mut w).unwrap();
        assert!((w[0] + 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_step_without_gradient_is_noop() {
        let mut opt = sgd(0.9);
        let g = opt.add_group("head", 0.1);
        let mut w = vec![1.0];
        assert!(!opt.step_param(g, "weight", &mut w).unwrap());
        assert_eq!(w, vec![1.0]);
    }

    #[test]
    fn test_remove_group_drops_state() {
        let mut opt = sgd(0.9);
        let g = opt.add_group("head", 0.1);
        let mut w = vec![1.0, 1.0];
        opt.accumulate(g, "weight", &[1.0, 1.0]).unwrap();
        opt.step_param(g, "weight", &mut w).unwrap();
        assert_eq!(opt.group(g).unwrap().state_len(), 1);

        let removed = opt.remove_group(g).unwrap();
        assert_eq!(removed.name(), "head");
        assert!(opt.group(g).is_none());
        assert!(opt.accumulate(g, "weight", &[1.0]).is_err());

        let g2 = opt.add_group("head", 0.1);
        assert_ne!(g, g2);
        assert_eq!(opt.group(g2).unwrap().state_len(), 0);
    }

    #[test]
    fn test_clear_state() {
        let mut opt = sgd(0.9);
        let g = opt.add_group("head", 0.1);
        let mut w = vec![1.0];
        opt.accumulate(g, "bias", &[1.0]).unwrap();
        opt.step_param(g, "bias", &mut w).unwrap();
        opt.clear_state(g).unwrap();
        assert!(opt.group(g).unwrap().state("bias").is_none());
    }

    #[test]
    fn test_finish_step_reports_leftovers() {
        let mut opt = sgd(0.0);
        let g = opt.add_group("head", 0.1);
        opt.accumulate(g, "weight", &[1.0]).unwrap();
        let err = opt.finish_step().unwrap_err();
        assert!(matches!(err, LearningError::PreconditionViolation { .. }));
        assert!(!opt.has_pending_gradients());
    }

    #[test]
    fn test_adam_moves_against_gradient() {
        let config = OptimizerConfig::default();
        let mut opt = Optimizer::from_config(&config).unwrap();
        let g = opt.add_group("pool", config.lr);
        let mut w = vec![0.5, -0.5];
        opt.accumulate(g, "key.0", &[2.0, -3.0]).unwrap();
        opt.step_param(g, "key.0", &mut w).unwrap();
        // First Adam step moves each weight by ~lr in the sign direction
        assert!((w[0] - (0.5 - config.lr)).abs() < 1e-4);
        assert!((w[1] - (-0.5 + config.lr)).abs() < 1e-4);
    }

    #[test]
    fn test_clip_pending() {
        let mut opt = sgd(0.0);
        let g = opt.add_group("head", 1.0);
        opt.accumulate(g, "weight", &[3.0, 4.0]).unwrap();
        let norm = opt.clip_pending(1.0);
        assert!((norm - 5.0).abs() < 1e-6);
        let mut w = vec![0.0, 0.0];
        opt.step_param(g, "weight", &mut w).unwrap();
        assert!((w[0] + 0.6).abs() < 1e-6);
        assert!((w[1] + 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_set_lr_applies_to_all_groups() {
        let mut opt = sgd(0.0);
        let a = opt.add_group("pool", 0.1);
        let b = opt.add_group("head", 0.1);
        opt.set_lr(0.01);
        assert_eq!(opt.group(a).unwrap().lr(), 0.01);
        assert_eq!(opt.group(b).unwrap().lr(), 0.01);
    }
}
