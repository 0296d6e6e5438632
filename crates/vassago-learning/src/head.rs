//! Growable classifier head bound to an append-only class registry

use crate::optimizer::{GroupId, Optimizer};
use crate::tensor::Matrix;
use crate::{LearningError, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Stream label
pub type ClassId = u32;

/// Name of the optimizer group holding head parameters
pub const HEAD_GROUP: &str = "head";

/// Exposed classes in first-seen order
///
/// A class keeps the index it was given when first registered; entries are
/// never removed or reordered.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassRegistry {
    classes: Vec<ClassId>,
    #[serde(skip)]
    index: HashMap<ClassId, usize>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a class; returns its index and whether it was new
    pub fn register(&mut self, class: ClassId) -> (usize, bool) {
        if let Some(&idx) = self.index.get(&class) {
            return (idx, false);
        }
        let idx = self.classes.len();
        self.classes.push(class);
        self.index.insert(class, idx);
        (idx, true)
    }

    pub fn index_of(&self, class: ClassId) -> Option<usize> {
        self.index.get(&class).copied()
    }

    pub fn class_at(&self, index: usize) -> Option<ClassId> {
        self.classes.get(index).copied()
    }

    pub fn contains(&self, class: ClassId) -> bool {
        self.index.contains_key(&class)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn classes(&self) -> &[ClassId] {
        &self.classes
    }
}

/// Head configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadConfig {
    /// Seed for new row initialization
    pub seed: Option<u64>,
}

/// Head weights: weight [classes, feature_dim], bias [classes]
#[derive(Debug, Clone, PartialEq)]
pub struct HeadParams {
    pub feature_dim: usize,
    pub weight: Vec<f32>,
    pub bias: Vec<f32>,
}

impl HeadParams {
    pub fn num_classes(&self) -> usize {
        self.bias.len()
    }

    pub fn row(&self, i: usize) -> &[f32] {
        &self.weight[i * self.feature_dim..(i + 1) * self.feature_dim]
    }
}

/// Result of `expose`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exposure {
    /// Class already had an output
    Known(usize),
    /// Class got a new output; the head now trains under `group`
    New { index: usize, group: GroupId },
}

impl Exposure {
    pub fn index(&self) -> usize {
        match self {
            Exposure::Known(index) | Exposure::New { index, .. } => *index,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Exposure::New { .. })
    }
}

/// Linear output layer that grows one row per exposed class
#[derive(Debug)]
pub struct IncrementalClassifierHead {
    registry: ClassRegistry,
    params: Arc<HeadParams>,
    group: GroupId,
    rng: StdRng,
}

impl IncrementalClassifierHead {
    /// Create an empty head and register its optimizer group
    pub fn new(feature_dim: usize, config: HeadConfig, optimizer: &mut Optimizer) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let group = optimizer.add_group(HEAD_GROUP, optimizer.base_lr());

        Self {
            registry: ClassRegistry::new(),
            params: Arc::new(HeadParams {
                feature_dim,
                weight: Vec::new(),
                bias: Vec::new(),
            }),
            group,
            rng,
        }
    }

    /// Give `class` an output row, preserving every existing row
    ///
    /// Must run between optimizer steps: the head's optimizer group is
    /// replaced, which discards its momentum state, and gradients accumulated
    /// against the old shape would be meaningless.
    pub fn expose(&mut self, class: ClassId, optimizer: &mut Optimizer) -> Result<Exposure> {
        if let Some(index) = self.registry.index_of(class) {
            return Ok(Exposure::Known(index));
        }
        if optimizer.has_pending_gradients() {
            return Err(LearningError::precondition(
                "expose only between optimizer steps",
                format!("class {} with unapplied gradients", class),
            ));
        }

        let (index, _) = self.registry.register(class);
        let old = &self.params;
        let dim = old.feature_dim;
        let bound = 1.0 / (dim.max(1) as f32).sqrt();

        let mut weight = Vec::with_capacity((index + 1) * dim);
        weight.extend_from_slice(&old.weight);
        weight.extend((0..dim).map(|_| self.rng.gen_range(-bound..bound)));
        let mut bias = Vec::with_capacity(index + 1);
        bias.extend_from_slice(&old.bias);
        bias.push(self.rng.gen_range(-bound..bound));

        self.params = Arc::new(HeadParams {
            feature_dim: dim,
            weight,
            bias,
        });

        let lr = optimizer
            .remove_group(self.group)
            .map(|g| g.lr())
            .unwrap_or_else(|_| optimizer.base_lr());
        self.group = optimizer.add_group(HEAD_GROUP, lr);

        info!(class, index, classes = self.registry.len(), "class exposed");
        Ok(Exposure::New {
            index,
            group: self.group,
        })
    }

    pub fn registry(&self) -> &ClassRegistry {
        &self.registry
    }

    pub fn num_classes(&self) -> usize {
        self.registry.len()
    }

    pub fn feature_dim(&self) -> usize {
        self.params.feature_dim
    }

    /// Optimizer group currently holding the head parameters
    pub fn group_id(&self) -> GroupId {
        self.group
    }

    /// Weight row of an output index
    pub fn row(&self, index: usize) -> Option<&[f32]> {
        (index < self.params.num_classes()).then(|| self.params.row(index))
    }

    pub fn bias(&self, index: usize) -> Option<f32> {
        self.params.bias.get(index).copied()
    }

    /// Shared handle to the current weights; survives later growth
    pub fn snapshot(&self) -> Arc<HeadParams> {
        Arc::clone(&self.params)
    }

    /// Logits over exposed classes, [B, classes]
    pub fn forward(&self, features: &Matrix) -> Result<Matrix> {
        let p = &self.params;
        if features.cols() != p.feature_dim {
            return Err(LearningError::precondition(
                "feature dim == head input dim",
                format!("{} != {}", features.cols(), p.feature_dim),
            ));
        }
        let classes = p.num_classes();
        let mut logits = Matrix::zeros(features.rows(), classes);
        for b in 0..features.rows() {
            let f = features.row(b);
            let out = logits.row_mut(b);
            for (c, o) in out.iter_mut().enumerate() {
                *o = crate::tensor::dot(p.row(c), f) + p.bias[c];
            }
        }
        Ok(logits)
    }

    /// Backpropagate logit gradients
    ///
    /// Returns (d weight, d bias, d features).
    pub fn gradients(
        &self,
        features: &Matrix,
        grad_logits: &Matrix,
    ) -> Result<(Vec<f32>, Vec<f32>, Matrix)> {
        let p = &self.params;
        let classes = p.num_classes();
        if grad_logits.shape() != [features.rows(), classes] {
            return Err(LearningError::shape(
                &[features.rows(), classes],
                &grad_logits.shape(),
            ));
        }

        let dim = p.feature_dim;
        let mut d_weight = vec![0.0; classes * dim];
        let mut d_bias = vec![0.0; classes];
        let mut d_features = Matrix::zeros(features.rows(), dim);
        for b in 0..features.rows() {
            let f = features.row(b);
            let g = grad_logits.row(b);
            for c in 0..classes {
                let gc = g[c];
                if gc == 0.0 {
                    continue;
                }
                d_bias[c] += gc;
                let w = p.row(c);
                let dw = &mut d_weight[c * dim..(c + 1) * dim];
                let df = d_features.row_mut(b);
                for i in 0..dim {
                    dw[i] += gc * f[i];
                    df[i] += gc * w[i];
                }
            }
        }
        Ok((d_weight, d_bias, d_features))
    }

    /// Queue head gradients on the head's optimizer group
    pub fn accumulate(&self, optimizer: &mut Optimizer, d_weight: &[f32], d_bias: &[f32]) -> Result<()> {
        optimizer.accumulate(self.group, "weight", d_weight)?;
        optimizer.accumulate(self.group, "bias", d_bias)
    }

    /// Apply queued head gradients
    ///
    /// Copies the weights first if an outstanding snapshot still shares them.
    pub fn apply(&mut self, optimizer: &mut Optimizer) -> Result<()> {
        let group = self.group;
        let params = Arc::make_mut(&mut self.params);
        optimizer.step_param(group, "weight", &mut params.weight)?;
        optimizer.step_param(group, "bias", &mut params.bias)?;
        Ok(())
    }
}
