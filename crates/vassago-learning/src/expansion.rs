//! Dynamic growth of the prompt pool for queries no key covers

use crate::prompt::{PromptPool, PromptSlot};
use crate::tensor::{self, Matrix};
use crate::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Expansion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpansionConfig {
    /// Grow the pool while training
    pub enabled: bool,
    /// Coverage constant `C` in the threshold `C / (count + 1)`
    pub coverage_constant: f32,
}

impl Default for ExpansionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            coverage_constant: 500.0,
        }
    }
}

/// Slots added by one `maybe_expand` call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpansionOutcome {
    /// Batch rows that had no covering key
    pub uncovered: Vec<usize>,
    /// Index of the slot spawned for each uncovered row
    pub spawned: Vec<usize>,
}

impl ExpansionOutcome {
    pub fn grew(&self) -> bool {
        !self.spawned.is_empty()
    }
}

/// Decides and performs pool growth
#[derive(Debug, Clone)]
pub struct DynamicExpansionController {
    config: ExpansionConfig,
}

impl DynamicExpansionController {
    pub fn new(config: ExpansionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExpansionConfig {
        &self.config
    }

    /// Default coverage radius; shrinks as a slot is selected more often
    pub fn coverage_threshold(&self, slot: &PromptSlot) -> f32 {
        self.config.coverage_constant / (slot.selections() + 1.0)
    }

    /// Grow the pool with the default coverage threshold
    pub fn expand(&self, query: &Matrix, pool: &mut PromptPool) -> Result<ExpansionOutcome> {
        self.maybe_expand(query, pool, |slot| self.coverage_threshold(slot))
    }

    /// Spawn one slot per query row that no existing key covers
    ///
    /// A row is covered by a slot when its distance to the slot key is
    /// below `threshold_fn(slot)`. Each uncovered row gets its own slot keyed
    /// by that row, with the prompt copied from the nearest existing slot.
    /// Rows are judged against the pool as it was when the call started, so
    /// close uncovered rows each spawn a slot.
    pub fn maybe_expand<F>(
        &self,
        query: &Matrix,
        pool: &mut PromptPool,
        threshold_fn: F,
    ) -> Result<ExpansionOutcome>
    where
        F: Fn(&PromptSlot) -> f32,
    {
        let distance = pool.distances(query)?;
        let thresholds: Vec<f32> = pool.slots().iter().map(&threshold_fn).collect();

        let mut outcome = ExpansionOutcome::default();
        let mut births = Vec::new();
        for b in 0..query.rows() {
            let row = distance.row(b);
            let covered = row.iter().zip(&thresholds).any(|(d, t)| d < t);
            if covered {
                continue;
            }
            let nearest = tensor::top_k_smallest(row, 1)[0];
            debug!(sample = b, nearest, distance = row[nearest], "query not covered");
            outcome.uncovered.push(b);
            births.push((b, nearest));
        }

        for (b, nearest) in births {
            let prompt = pool.slots()[nearest].prompt.clone();
            let slot = PromptSlot::new(query.row(b).to_vec(), prompt);
            outcome.spawned.push(pool.push_slot(slot)?);
        }

        if outcome.grew() {
            info!(
                added = outcome.spawned.len(),
                pool_size = pool.len(),
                "prompt pool expanded"
            );
        }
        Ok(outcome)
    }
}
