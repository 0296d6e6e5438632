//! Prompt pool: learned (key, prompt) pairs selected by query similarity

use crate::tensor::{self, Matrix, PromptBatch};
use crate::{LearningError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Which selection the usage counters record when `batchwise` is active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UsageCounting {
    /// Per-sample candidate votes, before the batch-wide majority vote
    PreCollapse,
    /// The shared slots every sample ends up using
    PostCollapse,
}

/// Prompt pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Initial number of slots
    pub pool_size: usize,
    /// Slots selected per sample
    pub selection_size: usize,
    /// Rows per prompt tensor
    pub prompt_len: usize,
    /// Collapse selections to one shared set per batch
    pub batchwise: bool,
    /// Reweight distances by historical frequency while training
    pub diversified: bool,
    /// Counting policy under batchwise selection
    pub usage_counting: UsageCounting,
    /// Rows of the always-on general prompt (0 disables it)
    pub general_prompt_len: usize,
    /// Keys and prompts are initialized uniformly in [-init_range, init_range]
    pub init_range: f32,
    /// Scale logits by the selected slots' learned class mask
    pub use_mask: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 10,
            selection_size: 5,
            prompt_len: 5,
            batchwise: false,
            diversified: true,
            usage_counting: UsageCounting::PreCollapse,
            general_prompt_len: 0,
            init_range: 1.0,
            use_mask: false,
        }
    }
}

/// One learned key and the prompt it unlocks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptSlot {
    /// Key vector, length D
    pub key: Vec<f32>,
    /// Prompt tensor, prompt_len x D row-major
    pub prompt: Vec<f32>,
    /// Folded selection history, starts at 1
    pub frequency: f32,
    /// Selections since the last `update`
    pub usage_counter: f32,
    /// Class mask logits, one per exposed class
    #[serde(default)]
    pub mask: Vec<f32>,
}

impl PromptSlot {
    pub fn new(key: Vec<f32>, prompt: Vec<f32>) -> Self {
        Self {
            key,
            prompt,
            frequency: 1.0,
            usage_counter: 0.0,
            mask: Vec::new(),
        }
    }

    /// Usage mass: one plus every selection recorded so far
    pub fn mass(&self) -> f32 {
        self.frequency + self.usage_counter
    }

    /// Selections recorded so far
    pub fn selections(&self) -> f32 {
        self.mass() - 1.0
    }
}

/// Result of a pool lookup
#[derive(Debug, Clone)]
pub struct Selection {
    /// Chosen slot indices per sample, [B][k]
    pub indices: Vec<Vec<usize>>,
    /// Raw cosine distance of each chosen slot, [B, k]
    pub distance: Matrix,
    /// Gathered prompts, [B, k, prompt_len, D]
    pub prompts: PromptBatch,
}

impl Selection {
    /// Mean distance over every chosen (sample, slot) pair
    pub fn mean_distance(&self) -> f32 {
        let data = self.distance.data();
        if data.is_empty() {
            return 0.0;
        }
        data.iter().sum::<f32>() / data.len() as f32
    }
}

/// Growable pool of prompt slots
#[derive(Debug, Clone)]
pub struct PromptPool {
    config: PoolConfig,
    dim: usize,
    slots: Vec<PromptSlot>,
    general: Vec<f32>,
    num_classes: usize,
    training: bool,
}

impl PromptPool {
    /// Create a pool with randomly initialized keys and prompts
    pub fn new<R: Rng>(config: PoolConfig, dim: usize, rng: &mut R) -> Result<Self> {
        let range = config.init_range;
        let mut uniform = |n: usize| -> Vec<f32> {
            (0..n).map(|_| rng.gen_range(-range..=range)).collect()
        };

        let slots = (0..config.pool_size)
            .map(|_| PromptSlot::new(uniform(dim), uniform(config.prompt_len * dim)))
            .collect();
        let general = uniform(config.general_prompt_len * dim);

        Self::from_slots(config, dim, slots, general)
    }

    /// Create a pool from explicit slots
    pub fn from_slots(
        config: PoolConfig,
        dim: usize,
        slots: Vec<PromptSlot>,
        general: Vec<f32>,
    ) -> Result<Self> {
        if config.selection_size == 0 || config.selection_size > slots.len() {
            return Err(LearningError::precondition(
                "0 < selection_size <= pool_size",
                format!("{} of {}", config.selection_size, slots.len()),
            ));
        }
        if general.len() != config.general_prompt_len * dim {
            return Err(LearningError::shape(
                &[config.general_prompt_len, dim],
                &[general.len()],
            ));
        }
        let num_classes = slots.first().map_or(0, |s| s.mask.len());
        for slot in &slots {
            Self::check_slot(&config, dim, num_classes, slot)?;
        }

        Ok(Self {
            config,
            dim,
            slots,
            general,
            num_classes,
            training: true,
        })
    }

    fn check_slot(
        config: &PoolConfig,
        dim: usize,
        num_classes: usize,
        slot: &PromptSlot,
    ) -> Result<()> {
        if slot.mask.len() != num_classes {
            return Err(LearningError::shape(&[num_classes], &[slot.mask.len()]));
        }
        if slot.key.len() != dim {
            return Err(LearningError::shape(&[dim], &[slot.key.len()]));
        }
        if slot.prompt.len() != config.prompt_len * dim {
            return Err(LearningError::shape(
                &[config.prompt_len, dim],
                &[slot.prompt.len()],
            ));
        }
        Ok(())
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Key dimensionality D
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Current pool size
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot(&self, i: usize) -> Option<&PromptSlot> {
        self.slots.get(i)
    }

    pub fn slot_mut(&mut self, i: usize) -> Option<&mut PromptSlot> {
        self.slots.get_mut(i)
    }

    pub fn slots(&self) -> &[PromptSlot] {
        &self.slots
    }

    /// Key vectors in slot order
    pub fn keys(&self) -> impl Iterator<Item = &[f32]> {
        self.slots.iter().map(|s| s.key.as_slice())
    }

    /// Selections recorded per slot, including the unfolded counters
    pub fn selection_counts(&self) -> Vec<f32> {
        self.slots.iter().map(PromptSlot::selections).collect()
    }

    /// The shared general prompt, if enabled
    pub fn general_prompt(&self) -> Option<&[f32]> {
        (!self.general.is_empty()).then_some(self.general.as_slice())
    }

    pub fn general_prompt_mut(&mut self) -> Option<&mut Vec<f32>> {
        (!self.general.is_empty()).then_some(&mut self.general)
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Switch between training and evaluation mode
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    /// Append a slot; the pool never shrinks
    ///
    /// A slot without a mask gets a zero mask over the exposed classes.
    pub fn push_slot(&mut self, mut slot: PromptSlot) -> Result<usize> {
        if slot.mask.is_empty() {
            slot.mask = vec![0.0; self.num_classes];
        }
        Self::check_slot(&self.config, self.dim, self.num_classes, &slot)?;
        self.slots.push(slot);
        Ok(self.slots.len() - 1)
    }

    /// Classes covered by every slot's mask
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Extend every slot's mask by one class, starting at logit 0
    pub fn expose_class(&mut self) {
        for slot in &mut self.slots {
            slot.mask.push(0.0);
        }
        self.num_classes += 1;
    }

    /// Mean mask logits of each row's selected slots, [B, classes]
    ///
    /// `None` unless `use_mask` is set.
    pub fn class_mask(&self, indices: &[Vec<usize>]) -> Option<Matrix> {
        if !self.config.use_mask {
            return None;
        }
        let mut out = Matrix::zeros(indices.len(), self.num_classes);
        for (b, row) in indices.iter().enumerate() {
            let scale = 1.0 / row.len().max(1) as f32;
            let acc = out.row_mut(b);
            for &s in row {
                for (a, m) in acc.iter_mut().zip(&self.slots[s].mask) {
                    *a += m * scale;
                }
            }
        }
        Some(out)
    }

    /// Cosine distance from every query row to every key, [B, pool_size]
    pub fn distances(&self, query: &Matrix) -> Result<Matrix> {
        self.check_query(query)?;
        let mut out = Matrix::zeros(query.rows(), self.slots.len());
        for b in 0..query.rows() {
            let q = query.row(b);
            for (s, slot) in self.slots.iter().enumerate() {
                out.row_mut(b)[s] = tensor::cosine_distance(q, &slot.key);
            }
        }
        Ok(out)
    }

    /// Pairwise key distances, [pool_size, pool_size]
    pub fn key_distances(&self) -> Matrix {
        let n = self.slots.len();
        let mut out = Matrix::zeros(n, n);
        for i in 0..n {
            for j in 0..n {
                out.row_mut(i)[j] = tensor::cosine_distance(&self.slots[i].key, &self.slots[j].key);
            }
        }
        out
    }

    fn check_query(&self, query: &Matrix) -> Result<()> {
        if query.cols() != self.dim {
            return Err(LearningError::precondition(
                "query dim == key dim",
                format!("{} != {}", query.cols(), self.dim),
            ));
        }
        Ok(())
    }

    /// Select `k` slots per query row and gather their prompts
    pub fn select(
        &mut self,
        query: &Matrix,
        k: usize,
        batchwise: bool,
        diversified: bool,
    ) -> Result<Selection> {
        if k == 0 || k > self.slots.len() {
            return Err(LearningError::precondition(
                "0 < selection_size <= pool_size",
                format!("{} of {}", k, self.slots.len()),
            ));
        }
        let distance = self.distances(query)?;
        let batch = query.rows();
        let pool_size = self.slots.len();

        let weights = if diversified && self.training {
            let freq: Vec<f32> = self.slots.iter().map(|s| s.frequency).collect();
            Some(tensor::l1_normalize(&freq))
        } else {
            None
        };

        let mut candidates = Vec::with_capacity(batch);
        for b in 0..batch {
            let row = distance.row(b);
            let ranked = match &weights {
                Some(w) => {
                    let reweighted: Vec<f32> = row.iter().zip(w).map(|(d, w)| d * w).collect();
                    tensor::top_k_smallest(&reweighted, k)
                }
                None => tensor::top_k_smallest(row, k),
            };
            candidates.push(ranked);
        }

        let mut votes = vec![0.0f32; pool_size];
        for row in &candidates {
            for &s in row {
                votes[s] += 1.0;
            }
        }

        let indices = if batchwise {
            let shared = tensor::top_k_largest(&votes, k);
            vec![shared; batch]
        } else {
            candidates
        };

        match (batchwise, self.config.usage_counting) {
            (true, UsageCounting::PostCollapse) => {
                for row in &indices {
                    for &s in row {
                        self.slots[s].usage_counter += 1.0;
                    }
                }
            }
            _ => {
                for (slot, v) in self.slots.iter_mut().zip(&votes) {
                    slot.usage_counter += v;
                }
            }
        }

        let len = self.config.prompt_len;
        let mut prompts = PromptBatch::zeros(batch, k, len, self.dim);
        let mut chosen = Matrix::zeros(batch, k);
        for (b, row) in indices.iter().enumerate() {
            for (j, &s) in row.iter().enumerate() {
                prompts.prompt_mut(b, j).copy_from_slice(&self.slots[s].prompt);
                chosen.row_mut(b)[j] = distance.row(b)[s];
            }
        }

        Ok(Selection {
            indices,
            distance: chosen,
            prompts,
        })
    }

    /// Fold usage counters; returns per-slot history
    ///
    /// Training mode adds the counters into `frequency` and returns
    /// `frequency - 1`. Evaluation mode returns the raw counters and leaves
    /// `frequency` untouched. Counters are reset in both modes.
    pub fn update(&mut self) -> Vec<f32> {
        let training = self.training;
        self.slots
            .iter_mut()
            .map(|slot| {
                let counter = slot.usage_counter;
                slot.usage_counter = 0.0;
                if training {
                    slot.frequency += counter;
                    slot.frequency - 1.0
                } else {
                    counter
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn axis_pool(pool_size: usize, dim: usize, config: PoolConfig) -> PromptPool {
        let slots = (0..pool_size)
            .map(|i| {
                let mut key = vec![0.0; dim];
                key[i % dim] = 1.0 + (i / dim) as f32;
                PromptSlot::new(key, vec![i as f32; config.prompt_len * dim])
            })
            .collect();
        PromptPool::from_slots(config, dim, slots, Vec::new()).unwrap()
    }

    fn config(k: usize) -> PoolConfig {
        PoolConfig {
            pool_size: 4,
            selection_size: k,
            prompt_len: 2,
            diversified: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_pool_creation() {
        let mut rng = StdRng::seed_from_u64(7);
        let pool = PromptPool::new(PoolConfig::default(), 8, &mut rng).unwrap();
        assert_eq!(pool.len(), 10);
        assert!(pool.general_prompt().is_none());
        assert!(pool
            .slots()
            .iter()
            .all(|s| s.key.iter().all(|v| (-1.0..=1.0).contains(v))));
    }

    #[test]
    fn test_selection_size_larger_than_pool_rejected() {
        let cfg = PoolConfig {
            pool_size: 2,
            selection_size: 3,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(7);
        let err = PromptPool::new(cfg, 4, &mut rng).unwrap_err();
        assert!(matches!(err, LearningError::PreconditionViolation { .. }));
    }

    #[test]
    fn test_query_dim_mismatch_is_fatal() {
        let mut pool = axis_pool(4, 4, config(1));
        let query = Matrix::zeros(2, 3);
        let err = pool.select(&query, 1, false, false).unwrap_err();
        assert!(matches!(err, LearningError::PreconditionViolation { .. }));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_select_gathers_nearest_prompt() {
        let mut pool = axis_pool(4, 4, config(1));
        let query = Matrix::from_rows(&[vec![0.0, 0.0, 3.0, 0.0]]).unwrap();
        let sel = pool.select(&query, 1, false, false).unwrap();

        assert_eq!(sel.indices, vec![vec![2]]);
        assert!(sel.distance.row(0)[0].abs() < 1e-6);
        assert_eq!(sel.prompts.prompt(0, 0), &[2.0; 8][..]);
        assert_eq!(pool.slot(2).unwrap().usage_counter, 1.0);
    }

    #[test]
    fn test_batchwise_majority_vote() {
        let mut pool = axis_pool(4, 4, config(1));
        let query = Matrix::from_rows(&[
            vec![1.0, 0.0, 0.0, 0.0],
            vec![1.0, 0.1, 0.0, 0.0],
            vec![0.0, 0.0, 0.0, 1.0],
        ])
        .unwrap();
        let sel = pool.select(&query, 1, true, false).unwrap();

        assert_eq!(sel.indices, vec![vec![0]; 3]);
        // Pre-collapse votes: slot 0 twice, slot 3 once
        assert_eq!(pool.slot(0).unwrap().usage_counter, 2.0);
        assert_eq!(pool.slot(3).unwrap().usage_counter, 1.0);
    }

    #[test]
    fn test_post_collapse_counting() {
        let cfg = PoolConfig {
            usage_counting: UsageCounting::PostCollapse,
            ..config(1)
        };
        let mut pool = axis_pool(4, 4, cfg);
        let query = Matrix::from_rows(&[
            vec![1.0, 0.0, 0.0, 0.0],
            vec![1.0, 0.1, 0.0, 0.0],
            vec![0.0, 0.0, 0.0, 1.0],
        ])
        .unwrap();
        pool.select(&query, 1, true, false).unwrap();

        assert_eq!(pool.slot(0).unwrap().usage_counter, 3.0);
        assert_eq!(pool.slot(3).unwrap().usage_counter, 0.0);
    }

    #[test]
    fn test_diversified_selection_spreads_usage() {
        let mut pool = axis_pool(4, 4, config(1));
        // Slot 0 and 1 are equally close; heavy history on slot 0 pushes selection to 1
        pool.slot_mut(0).unwrap().frequency = 100.0;
        let query = Matrix::from_rows(&[vec![1.0, 1.0, 0.0, 0.0]]).unwrap();

        let sel = pool.select(&query, 1, false, true).unwrap();
        assert_eq!(sel.indices, vec![vec![1]]);

        pool.set_training(false);
        let sel = pool.select(&query, 1, false, true).unwrap();
        assert_eq!(sel.indices, vec![vec![0]]);
    }

    #[test]
    fn test_update_training_folds_frequency() {
        let mut pool = axis_pool(4, 4, config(1));
        let query = Matrix::from_rows(&[vec![1.0, 0.0, 0.0, 0.0]]).unwrap();
        pool.select(&query, 1, false, false).unwrap();
        pool.select(&query, 1, false, false).unwrap();

        assert_eq!(pool.selection_counts(), vec![2.0, 0.0, 0.0, 0.0]);
        let history = pool.update();
        assert_eq!(history, vec![2.0, 0.0, 0.0, 0.0]);
        assert_eq!(pool.selection_counts(), history);
        assert_eq!(pool.slot(0).unwrap().frequency, 3.0);
        assert_eq!(pool.slot(0).unwrap().usage_counter, 0.0);
    }

    #[test]
    fn test_update_eval_leaves_frequency() {
        let mut pool = axis_pool(4, 4, config(1));
        pool.set_training(false);
        let query = Matrix::from_rows(&[vec![0.0, 1.0, 0.0, 0.0]]).unwrap();
        pool.select(&query, 1, false, false).unwrap();

        let counts = pool.update();
        assert_eq!(counts, vec![0.0, 1.0, 0.0, 0.0]);
        assert!(pool.slots().iter().all(|s| s.frequency == 1.0));
        assert!(pool.slots().iter().all(|s| s.usage_counter == 0.0));
    }

    #[test]
    fn test_push_slot_validates_shape() {
        let mut pool = axis_pool(4, 4, config(1));
        assert!(pool.push_slot(PromptSlot::new(vec![0.0; 3], vec![0.0; 8])).is_err());
        let idx = pool.push_slot(PromptSlot::new(vec![0.0; 4], vec![0.0; 8])).unwrap();
        assert_eq!(idx, 4);
        assert_eq!(pool.len(), 5);
    }

    #[test]
    fn test_class_mask_follows_exposure() {
        let mut pool = axis_pool(4, 4, PoolConfig {
            use_mask: true,
            ..config(2)
        });
        pool.expose_class();
        pool.expose_class();
        assert_eq!(pool.num_classes(), 2);
        assert!(pool.slots().iter().all(|s| s.mask == vec![0.0, 0.0]));

        pool.slot_mut(0).unwrap().mask = vec![2.0, -2.0];
        let mask = pool.class_mask(&[vec![0, 1], vec![2, 3]]).unwrap();
        assert_eq!(mask.row(0), &[1.0, -1.0]);
        assert_eq!(mask.row(1), &[0.0, 0.0]);

        // Slots pushed later cover every exposed class
        let idx = pool.push_slot(PromptSlot::new(vec![0.0; 4], vec![0.0; 8])).unwrap();
        assert_eq!(pool.slot(idx).unwrap().mask, vec![0.0, 0.0]);
        let mut short = PromptSlot::new(vec![0.0; 4], vec![0.0; 8]);
        short.mask = vec![1.0];
        assert!(pool.push_slot(short).is_err());
    }

    #[test]
    fn test_class_mask_disabled() {
        let mut pool = axis_pool(4, 4, config(1));
        pool.expose_class();
        assert!(pool.class_mask(&[vec![0]]).is_none());
    }
}
