//! Frozen feature extractors conditioned by prompts
//!
//! A backbone turns raw inputs into token sequences, pools them into the
//! query used for prompt selection, and runs the prompted forward pass whose
//! pooled output feeds the classifier head. Backbone weights never train;
//! only the prompts receive gradients, through `backward_prompts`.
//!
//! Backbones are built by name from the static [`BACKBONES`] table.

use crate::tensor::{self, InputBatch, InputShape, Matrix, PromptBatch, TokenBatch};
use crate::{LearningError, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

/// Backbone configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackboneConfig {
    /// Registry name
    pub name: String,
    /// Token width D
    pub embed_dim: usize,
    /// Input values per token
    pub patch_size: usize,
    /// Seed of the frozen weights; identical on every worker
    pub seed: u64,
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self {
            name: "random-projection".into(),
            embed_dim: 32,
            patch_size: 16,
            seed: 0,
        }
    }
}

/// Output of the prompted forward pass
#[derive(Debug, Clone)]
pub struct PromptedOutput {
    /// Prompt rows followed by input tokens, [B, prompt_rows + N, D]
    pub sequence: TokenBatch,
    /// Leading rows that came from prompts
    pub prompt_rows: usize,
}

impl PromptedOutput {
    /// Mean over the prompt positions, or over every position without prompts
    pub fn pooled(&self) -> Matrix {
        let seq = &self.sequence;
        let rows = if self.prompt_rows > 0 {
            self.prompt_rows
        } else {
            seq.tokens
        };
        mean_rows(seq, 0..rows)
    }
}

/// Gradients of the pooled features with respect to the prompts
#[derive(Debug, Clone)]
pub struct PromptGradients {
    pub general: Option<PromptBatch>,
    pub expert: PromptBatch,
}

/// A frozen encoder that accepts prompts
pub trait PromptedBackbone: Send + Sync + std::fmt::Debug {
    /// Registry name
    fn name(&self) -> &str;

    /// Token width D
    fn embed_dim(&self) -> usize;

    /// Raw inputs to token sequences, [B, N, D]
    fn encode_tokens(&self, inputs: &InputBatch) -> Result<TokenBatch>;

    /// Selection query per sample, [B, D]
    fn encode_pooled(&self, tokens: &TokenBatch) -> Matrix {
        mean_rows(tokens, 0..tokens.tokens)
    }

    /// Run the frozen blocks over `[general, expert, tokens]`
    fn forward_with_prompts(
        &self,
        tokens: &TokenBatch,
        general: Option<&PromptBatch>,
        expert: &PromptBatch,
    ) -> Result<PromptedOutput>;

    /// Gradient of `PromptedOutput::pooled` for upstream `grad_features`
    ///
    /// Prompts only learn through this, so every encoder must supply it.
    fn backward_prompts(
        &self,
        tokens: &TokenBatch,
        general: Option<&PromptBatch>,
        expert: &PromptBatch,
        grad_features: &Matrix,
    ) -> Result<PromptGradients>;
}

type BackboneFactory = fn(&BackboneConfig, InputShape) -> Result<Box<dyn PromptedBackbone>>;

/// Backbones selectable by name
pub const BACKBONES: &[(&str, BackboneFactory)] = &[
    ("random-projection", build_random_projection),
    ("identity", build_identity),
];

/// Names accepted by [`build_backbone`]
pub fn backbone_names() -> impl Iterator<Item = &'static str> {
    BACKBONES.iter().map(|(name, _)| *name)
}

/// Build the backbone named in the config
pub fn build_backbone(config: &BackboneConfig, input: InputShape) -> Result<Box<dyn PromptedBackbone>> {
    let factory = BACKBONES
        .iter()
        .find(|(name, _)| *name == config.name)
        .map(|(_, f)| f)
        .ok_or_else(|| LearningError::UnknownBackbone(config.name.clone()))?;
    factory(config, input)
}

fn build_random_projection(
    config: &BackboneConfig,
    input: InputShape,
) -> Result<Box<dyn PromptedBackbone>> {
    Ok(Box::new(RandomProjection::new(config, input)?))
}

fn build_identity(_config: &BackboneConfig, input: InputShape) -> Result<Box<dyn PromptedBackbone>> {
    Ok(Box::new(Identity::new(input)))
}

fn mean_rows(seq: &TokenBatch, rows: std::ops::Range<usize>) -> Matrix {
    let mut out = Matrix::zeros(seq.batch, seq.dim);
    let n = rows.len().max(1) as f32;
    for b in 0..seq.batch {
        let acc = out.row_mut(b);
        for t in rows.clone() {
            for (a, v) in acc.iter_mut().zip(seq.token(b, t)) {
                *a += v / n;
            }
        }
    }
    out
}

fn check_prompts(
    tokens: &TokenBatch,
    general: Option<&PromptBatch>,
    expert: &PromptBatch,
) -> Result<usize> {
    let mut rows = expert.rows_per_sample();
    for p in general.into_iter().chain(std::iter::once(expert)) {
        if p.batch != tokens.batch || p.dim != tokens.dim {
            return Err(LearningError::shape(
                &[tokens.batch, tokens.dim],
                &[p.batch, p.dim],
            ));
        }
    }
    if let Some(g) = general {
        rows += g.rows_per_sample();
    }
    Ok(rows)
}

/// Concatenate prompts and tokens, then add `mixer * mean(sequence)` to every row
fn mix_sequence(
    tokens: &TokenBatch,
    general: Option<&PromptBatch>,
    expert: &PromptBatch,
    mixer: Option<&Matrix>,
) -> Result<PromptedOutput> {
    let prompt_rows = check_prompts(tokens, general, expert)?;
    let dim = tokens.dim;
    let len = prompt_rows + tokens.tokens;

    let mut data = Vec::with_capacity(tokens.batch * len * dim);
    for b in 0..tokens.batch {
        let start = data.len();
        if let Some(g) = general {
            for r in 0..g.rows_per_sample() {
                data.extend_from_slice(g.row(b, r));
            }
        }
        for r in 0..expert.rows_per_sample() {
            data.extend_from_slice(expert.row(b, r));
        }
        for t in 0..tokens.tokens {
            data.extend_from_slice(tokens.token(b, t));
        }

        if let Some(mixer) = mixer {
            let seq = &mut data[start..];
            let mut mean = vec![0.0; dim];
            for row in seq.chunks(dim) {
                for (m, v) in mean.iter_mut().zip(row) {
                    *m += v / len as f32;
                }
            }
            let shift: Vec<f32> = (0..dim).map(|i| tensor::dot(mixer.row(i), &mean)).collect();
            for row in seq.chunks_mut(dim) {
                for (v, s) in row.iter_mut().zip(&shift) {
                    *v += s;
                }
            }
        }
    }

    Ok(PromptedOutput {
        sequence: TokenBatch::new(tokens.batch, len, dim, data)?,
        prompt_rows,
    })
}

/// Every prompt row gets `g / R + mixer^T g / S`
fn mixed_prompt_gradients(
    tokens: &TokenBatch,
    general: Option<&PromptBatch>,
    expert: &PromptBatch,
    mixer: Option<&Matrix>,
    grad_features: &Matrix,
) -> Result<PromptGradients> {
    let prompt_rows = check_prompts(tokens, general, expert)?;
    let dim = tokens.dim;
    if grad_features.shape() != [tokens.batch, dim] {
        return Err(LearningError::shape(&[tokens.batch, dim], &grad_features.shape()));
    }

    let mut general_grad = general.map(|g| PromptBatch::zeros(g.batch, g.count, g.len, g.dim));
    let mut expert_grad = PromptBatch::zeros(expert.batch, expert.count, expert.len, expert.dim);
    if prompt_rows == 0 {
        return Ok(PromptGradients {
            general: general_grad,
            expert: expert_grad,
        });
    }

    let len = (prompt_rows + tokens.tokens) as f32;
    let per_sample = |b: usize| -> Vec<f32> {
        let g = grad_features.row(b);
        (0..dim)
            .map(|i| {
                let through_mixer = match mixer {
                    Some(m) => (0..dim).map(|j| m.row(j)[i] * g[j]).sum::<f32>() / len,
                    None => 0.0,
                };
                g[i] / prompt_rows as f32 + through_mixer
            })
            .collect()
    };

    for b in 0..tokens.batch {
        let row_grad = per_sample(b);
        if let Some(gg) = general_grad.as_mut() {
            for j in 0..gg.count {
                for chunk in gg.prompt_mut(b, j).chunks_mut(dim) {
                    chunk.copy_from_slice(&row_grad);
                }
            }
        }
        for j in 0..expert_grad.count {
            for chunk in expert_grad.prompt_mut(b, j).chunks_mut(dim) {
                chunk.copy_from_slice(&row_grad);
            }
        }
    }

    Ok(PromptGradients {
        general: general_grad,
        expert: expert_grad,
    })
}

/// Frozen random patch projection followed by one linear token-mixing block
#[derive(Debug, Clone)]
pub struct RandomProjection {
    input: InputShape,
    patch_size: usize,
    num_patches: usize,
    /// [patch_size, D]
    projection: Matrix,
    /// [D, D]
    mixer: Matrix,
}

impl RandomProjection {
    pub fn new(config: &BackboneConfig, input: InputShape) -> Result<Self> {
        if config.embed_dim == 0 || config.patch_size == 0 {
            return Err(LearningError::ConfigError(
                "backbone embed_dim and patch_size must be positive".into(),
            ));
        }
        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut gaussian = |rows: usize, cols: usize, std: f32| -> Result<Matrix> {
            let normal = Normal::new(0.0, std)
                .map_err(|e| LearningError::ConfigError(format!("backbone init: {}", e)))?;
            Matrix::from_vec(rows, cols, (0..rows * cols).map(|_| normal.sample(&mut rng)).collect())
        };

        let d = config.embed_dim;
        let projection = gaussian(config.patch_size, d, 1.0 / (config.patch_size as f32).sqrt())?;
        let mixer = gaussian(d, d, 0.5 / (d as f32).sqrt())?;

        Ok(Self {
            input,
            patch_size: config.patch_size,
            num_patches: input.numel().div_ceil(config.patch_size),
            projection,
            mixer,
        })
    }

    pub fn num_patches(&self) -> usize {
        self.num_patches
    }
}

impl PromptedBackbone for RandomProjection {
    fn name(&self) -> &str {
        "random-projection"
    }

    fn embed_dim(&self) -> usize {
        self.projection.cols()
    }

    fn encode_tokens(&self, inputs: &InputBatch) -> Result<TokenBatch> {
        if inputs.shape() != self.input {
            return Err(LearningError::precondition(
                "input shape matches backbone",
                format!("{:?}", inputs.shape()),
            ));
        }
        let d = self.embed_dim();
        let mut data = vec![0.0; inputs.len() * self.num_patches * d];
        for b in 0..inputs.len() {
            for (t, patch) in inputs.sample(b).chunks(self.patch_size).enumerate() {
                let out = &mut data[(b * self.num_patches + t) * d..][..d];
                for (p, &x) in patch.iter().enumerate() {
                    for (o, w) in out.iter_mut().zip(self.projection.row(p)) {
                        *o += x * w;
                    }
                }
            }
        }
        TokenBatch::new(inputs.len(), self.num_patches, d, data)
    }

    fn forward_with_prompts(
        &self,
        tokens: &TokenBatch,
        general: Option<&PromptBatch>,
        expert: &PromptBatch,
    ) -> Result<PromptedOutput> {
        mix_sequence(tokens, general, expert, Some(&self.mixer))
    }

    fn backward_prompts(
        &self,
        tokens: &TokenBatch,
        general: Option<&PromptBatch>,
        expert: &PromptBatch,
        grad_features: &Matrix,
    ) -> Result<PromptGradients> {
        mixed_prompt_gradients(tokens, general, expert, Some(&self.mixer), grad_features)
    }
}

/// Each sample is a single token equal to its flattened input
#[derive(Debug, Clone)]
pub struct Identity {
    input: InputShape,
}

impl Identity {
    pub fn new(input: InputShape) -> Self {
        Self { input }
    }
}

impl PromptedBackbone for Identity {
    fn name(&self) -> &str {
        "identity"
    }

    fn embed_dim(&self) -> usize {
        self.input.numel()
    }

    fn encode_tokens(&self, inputs: &InputBatch) -> Result<TokenBatch> {
        if inputs.shape() != self.input {
            return Err(LearningError::precondition(
                "input shape matches backbone",
                format!("{:?}", inputs.shape()),
            ));
        }
        TokenBatch::new(inputs.len(), 1, self.embed_dim(), inputs.data().to_vec())
    }

    fn forward_with_prompts(
        &self,
        tokens: &TokenBatch,
        general: Option<&PromptBatch>,
        expert: &PromptBatch,
    ) -> Result<PromptedOutput> {
        mix_sequence(tokens, general, expert, None)
    }

    fn backward_prompts(
        &self,
        tokens: &TokenBatch,
        general: Option<&PromptBatch>,
        expert: &PromptBatch,
        grad_features: &Matrix,
    ) -> Result<PromptGradients> {
        mixed_prompt_gradients(tokens, general, expert, None, grad_features)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> InputBatch {
        let shape = InputShape::flat(6);
        InputBatch::from_samples(shape, &[vec![1.0, 0.0, 2.0, 0.0, 1.0, 3.0], vec![0.5; 6]]).unwrap()
    }

    fn config() -> BackboneConfig {
        BackboneConfig {
            embed_dim: 4,
            patch_size: 4,
            ..Default::default()
        }
    }

    #[test]
    fn test_registry() {
        let names: Vec<_> = backbone_names().collect();
        assert_eq!(names, vec!["random-projection", "identity"]);

        let bad = BackboneConfig {
            name: "vit_base_patch16".into(),
            ..Default::default()
        };
        let err = build_backbone(&bad, InputShape::flat(4)).unwrap_err();
        assert!(matches!(err, LearningError::UnknownBackbone(_)));
    }

    #[test]
    fn test_random_projection_shapes() {
        let backbone = build_backbone(&config(), InputShape::flat(6)).unwrap();
        let tokens = backbone.encode_tokens(&inputs()).unwrap();
        // 6 values in patches of 4 -> 2 tokens
        assert_eq!((tokens.batch, tokens.tokens, tokens.dim), (2, 2, 4));
        assert_eq!(backbone.encode_pooled(&tokens).shape(), [2, 4]);

        let expert = PromptBatch::zeros(2, 3, 2, 4);
        let out = backbone.forward_with_prompts(&tokens, None, &expert).unwrap();
        assert_eq!(out.prompt_rows, 6);
        assert_eq!(out.sequence.tokens, 8);
        assert_eq!(out.pooled().shape(), [2, 4]);
    }

    #[test]
    fn test_frozen_weights_are_seeded() {
        let a = RandomProjection::new(&config(), InputShape::flat(6)).unwrap();
        let b = RandomProjection::new(&config(), InputShape::flat(6)).unwrap();
        assert_eq!(a.encode_tokens(&inputs()).unwrap(), b.encode_tokens(&inputs()).unwrap());
    }

    #[test]
    fn test_prompt_gradient_matches_finite_difference() {
        let backbone = RandomProjection::new(&config(), InputShape::flat(6)).unwrap();
        let tokens = backbone.encode_tokens(&inputs()).unwrap();
        let general = PromptBatch::repeated(&[0.1, -0.2, 0.3, 0.0], 2, 1, 4);
        let mut expert = PromptBatch::zeros(2, 2, 1, 4);
        for (i, v) in expert.data.iter_mut().enumerate() {
            *v = (i as f32 * 0.37).sin();
        }
        // Objective: sum of pooled features of sample 0, coordinate 1
        let mut upstream = Matrix::zeros(2, 4);
        upstream.row_mut(0)[1] = 1.0;

        let grads = backbone
            .backward_prompts(&tokens, Some(&general), &expert, &upstream)
            .unwrap();

        let objective = |e: &PromptBatch| {
            let out = backbone.forward_with_prompts(&tokens, Some(&general), e).unwrap();
            out.pooled().row(0)[1]
        };
        let h = 1e-2;
        for idx in [0usize, 3, 5] {
            let mut plus = expert.clone();
            plus.data[idx] += h;
            let mut minus = expert.clone();
            minus.data[idx] -= h;
            let numeric = (objective(&plus) - objective(&minus)) / (2.0 * h);
            assert!((numeric - grads.expert.data[idx]).abs() < 1e-3);
        }
        // Sample 1 had no upstream gradient
        assert!(grads.expert.prompt(1, 0).iter().all(|g| *g == 0.0));
        assert!(grads.general.is_some());
    }

    #[test]
    fn test_identity_pools_prompts() {
        let backbone = Identity::new(InputShape::flat(2));
        let inputs = InputBatch::from_samples(InputShape::flat(2), &[vec![4.0, 4.0]]).unwrap();
        let tokens = backbone.encode_tokens(&inputs).unwrap();
        let expert = PromptBatch::repeated(&[1.0, 3.0], 1, 1, 2);
        let out = backbone.forward_with_prompts(&tokens, None, &expert).unwrap();
        assert_eq!(out.pooled().row(0), &[1.0, 3.0]);

        let none = PromptBatch::zeros(1, 0, 1, 2);
        let out = backbone.forward_with_prompts(&tokens, None, &none).unwrap();
        assert_eq!(out.pooled().row(0), &[4.0, 4.0]);
    }

    #[test]
    fn test_input_shape_checked() {
        let backbone = build_backbone(&config(), InputShape::flat(6)).unwrap();
        let wrong = InputBatch::from_samples(InputShape::flat(5), &[vec![0.0; 5]]).unwrap();
        assert!(backbone.encode_tokens(&wrong).is_err());
    }
}
