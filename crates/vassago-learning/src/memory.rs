//! Bounded exemplar memory with uniform reservoir replacement

use crate::head::ClassId;
use crate::{LearningError, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Memory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Maximum exemplars kept
    pub memory_size: usize,
    /// Random seed
    pub seed: Option<u64>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            memory_size: 500,
            seed: None,
        }
    }
}

/// A stored stream sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exemplar<T> {
    /// Sample data
    pub payload: T,
    /// Class label
    pub label: ClassId,
    /// Memory slot holding this exemplar
    pub slot: usize,
}

/// What `offer` did with a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// Stored in a fresh slot
    Appended(usize),
    /// Overwrote the exemplar in this slot
    Replaced(usize),
    /// Not kept
    Discarded,
}

/// Fixed-capacity reservoir over the sample stream
#[derive(Debug)]
pub struct ReservoirMemory<T> {
    config: MemoryConfig,
    buffer: Vec<Exemplar<T>>,
    seen: u64,
    classes: Vec<ClassId>,
    rng: StdRng,
}

impl<T> ReservoirMemory<T> {
    /// Create new reservoir memory
    pub fn new(config: MemoryConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            buffer: Vec::with_capacity(config.memory_size),
            config,
            seen: 0,
            classes: Vec::new(),
            rng,
        }
    }

    /// Offer a stream sample
    ///
    /// After `n >= memory_size` offers every offered sample is present with
    /// probability `memory_size / n`, regardless of arrival order.
    pub fn offer(&mut self, payload: T, label: ClassId) -> Offer {
        self.seen += 1;
        let capacity = self.config.memory_size;

        if self.buffer.len() < capacity {
            let slot = self.buffer.len();
            self.buffer.push(Exemplar {
                payload,
                label,
                slot,
            });
            return Offer::Appended(slot);
        }

        let j = self.rng.gen_range(0..self.seen);
        if (j as usize) < capacity {
            let slot = j as usize;
            self.buffer[slot] = Exemplar {
                payload,
                label,
                slot,
            };
            Offer::Replaced(slot)
        } else {
            Offer::Discarded
        }
    }

    /// Record the exposed class list; replacement stays class-agnostic
    pub fn add_new_class(&mut self, classes: &[ClassId]) {
        self.classes = classes.to_vec();
        debug!(classes = self.classes.len(), "memory class list synced");
    }

    /// Draw `n` distinct exemplars uniformly
    pub fn get_batch(&mut self, n: usize) -> Result<Vec<&Exemplar<T>>> {
        let available = self.buffer.len();
        if n > available {
            return Err(LearningError::EmptyMemory {
                requested: n,
                available,
            });
        }

        let mut indices: Vec<usize> = (0..available).collect();
        // Partial Fisher-Yates over the first n positions
        for i in 0..n {
            let j = self.rng.gen_range(i..available);
            indices.swap(i, j);
        }

        Ok(indices[..n].iter().map(|&i| &self.buffer[i]).collect())
    }

    /// Current number of exemplars
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Samples offered so far
    pub fn seen(&self) -> u64 {
        self.seen
    }

    pub fn capacity(&self) -> usize {
        self.config.memory_size
    }

    /// Class list from the last `add_new_class`
    pub fn classes(&self) -> &[ClassId] {
        &self.classes
    }

    pub fn exemplars(&self) -> &[Exemplar<T>] {
        &self.buffer
    }
}
