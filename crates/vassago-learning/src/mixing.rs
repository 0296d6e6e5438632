//! CutMix input mixing

use crate::tensor::InputBatch;
use crate::{LearningError, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::{Beta, Distribution};
use serde::{Deserialize, Serialize};

/// Mixing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MixConfig {
    /// Apply CutMix at all
    pub enabled: bool,
    /// Chance of mixing a given training batch
    pub probability: f32,
    /// Beta(alpha, alpha) parameter of the mixing ratio
    pub alpha: f32,
}

impl Default for MixConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            probability: 0.5,
            alpha: 1.0,
        }
    }
}

/// Labels and weight of a mixed batch
///
/// The loss of a mixed batch is `lam * L(labels_a) + (1 - lam) * L(labels_b)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Mixed {
    pub labels_a: Vec<usize>,
    pub labels_b: Vec<usize>,
    /// Fraction of each sample's area left untouched
    pub lam: f32,
}

/// Pastes a random box from a partner sample into every sample
#[derive(Debug)]
pub struct CutMix {
    config: MixConfig,
    beta: Beta<f32>,
    rng: StdRng,
}

impl CutMix {
    pub fn new(config: MixConfig, seed: Option<u64>) -> Result<Self> {
        let beta = Beta::new(config.alpha, config.alpha).map_err(|e| {
            LearningError::ConfigError(format!("cutmix alpha {}: {}", config.alpha, e))
        })?;
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self { config, beta, rng })
    }

    pub fn config(&self) -> &MixConfig {
        &self.config
    }

    /// Mix the batch in place with the configured probability
    pub fn maybe_mix(&mut self, inputs: &mut InputBatch, labels: &[usize]) -> Option<Mixed> {
        if !self.config.enabled || inputs.len() < 2 {
            return None;
        }
        if self.rng.gen::<f32>() >= self.config.probability {
            return None;
        }
        Some(self.mix(inputs, labels))
    }

    /// Mix the batch in place
    pub fn mix(&mut self, inputs: &mut InputBatch, labels: &[usize]) -> Mixed {
        let mut partner: Vec<usize> = (0..inputs.len()).collect();
        partner.shuffle(&mut self.rng);

        let shape = inputs.shape();
        let (h, w) = (shape.height, shape.width);
        let lam: f32 = self.beta.sample(&mut self.rng);
        let cut_rat = (1.0 - lam).sqrt();
        let cut_h = (h as f32 * cut_rat) as usize;
        let cut_w = (w as f32 * cut_rat) as usize;
        let cy = self.rng.gen_range(0..h.max(1));
        let cx = self.rng.gen_range(0..w.max(1));

        let y1 = cy.saturating_sub(cut_h / 2);
        let y2 = (cy + cut_h / 2).min(h);
        let x1 = cx.saturating_sub(cut_w / 2);
        let x2 = (cx + cut_w / 2).min(w);

        let source = inputs.clone();
        for (b, &p) in partner.iter().enumerate() {
            let from = source.sample(p);
            let to = inputs.sample_mut(b);
            for c in 0..shape.channels {
                for y in y1..y2 {
                    let start = (c * h + y) * w;
                    to[start + x1..start + x2].copy_from_slice(&from[start + x1..start + x2]);
                }
            }
        }

        let area = ((y2 - y1) * (x2 - x1)) as f32;
        let lam = 1.0 - area / (h * w).max(1) as f32;

        Mixed {
            labels_a: labels.to_vec(),
            labels_b: partner.iter().map(|&p| labels[p]).collect(),
            lam,
        }
    }
}
