//! Online trainer for class-incremental streams
//!
//! Each stream event runs: expose new classes, then a whole number of
//! optimizer steps set by the iteration accumulator, then one reservoir offer
//! per stream sample. Every optimizer step encodes the stream batch plus
//! replayed exemplars, selects (and possibly grows) prompts, runs the
//! prompted forward pass and applies one update. Only head gradients and
//! evaluation sums cross worker boundaries.

use crate::backbone::PromptedBackbone;
use crate::collective::{Collective, ReduceOp};
use crate::expansion::{DynamicExpansionController, ExpansionConfig};
use crate::head::{ClassId, HeadConfig, IncrementalClassifierHead};
use crate::loss::{self, KeyGradients};
use crate::memory::{MemoryConfig, ReservoirMemory};
use crate::metrics::{self, EvalAccumulator, EvalReport, RunSummary, StepReport, TaskRecord};
use crate::mixing::{CutMix, MixConfig};
use crate::optimizer::{GroupId, Optimizer, OptimizerConfig};
use crate::prompt::{PoolConfig, PromptPool};
use crate::scheduler::{LearningRateScheduler, SchedulerConfig};
use crate::stream::{EvalSet, LabeledBatch, StreamEvent};
use crate::tensor::{InputBatch, InputShape, Matrix, PromptBatch};
use crate::{LearningError, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Optimizer group holding keys, prompts and the general prompt
pub const POOL_GROUP: &str = "pool";

/// Trainer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub pool: PoolConfig,
    pub expansion: ExpansionConfig,
    pub memory: MemoryConfig,
    pub head: HeadConfig,
    pub optimizer: OptimizerConfig,
    pub scheduler: SchedulerConfig,
    pub mix: MixConfig,
    /// Samples per optimizer step, stream plus replay
    pub batch_size: usize,
    /// Nominal stream samples per event
    pub stream_batch_size: usize,
    /// Optimizer steps per `stream_batch_size` stream samples, scaled by `batch_size`
    pub online_iter: f32,
    /// Weight of the key regularizer
    pub lambda: f32,
    /// Use the contrastive key loss instead of the pull constraint
    pub contrastive: bool,
    /// Accuracy counts a hit within the `topk` highest logits
    pub topk: usize,
    /// Evaluate after every `eval_period` stream samples (0 disables)
    pub eval_period: u64,
    /// Batch size for evaluation passes
    pub eval_batch_size: usize,
    /// Gradient clipping (max norm)
    pub gradient_clip: Option<f32>,
    /// Random seed; required for multi-worker runs
    pub seed: Option<u64>,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            expansion: ExpansionConfig::default(),
            memory: MemoryConfig::default(),
            head: HeadConfig::default(),
            optimizer: OptimizerConfig::default(),
            scheduler: SchedulerConfig::default(),
            mix: MixConfig::default(),
            batch_size: 16,
            stream_batch_size: 8,
            online_iter: 1.0,
            lambda: 1.0,
            contrastive: false,
            topk: 1,
            eval_period: 1000,
            eval_batch_size: 32,
            gradient_clip: None,
            seed: None,
        }
    }
}

impl TrainerConfig {
    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        let check = |ok: bool, invariant: &'static str, value: String| {
            if ok {
                Ok(())
            } else {
                Err(LearningError::precondition(invariant, value))
            }
        };
        let pool = &self.pool;
        check(
            pool.selection_size > 0 && pool.selection_size <= pool.pool_size,
            "0 < selection_size <= pool_size",
            format!("{} of {}", pool.selection_size, pool.pool_size),
        )?;
        check(pool.prompt_len > 0, "prompt_len > 0", pool.prompt_len.to_string())?;
        check(
            self.batch_size > 0 && self.stream_batch_size > 0,
            "batch sizes > 0",
            format!("{} / {}", self.batch_size, self.stream_batch_size),
        )?;
        check(
            self.stream_batch_size <= self.batch_size,
            "stream_batch_size <= batch_size",
            format!("{} > {}", self.stream_batch_size, self.batch_size),
        )?;
        check(
            self.online_iter.is_finite() && self.online_iter > 0.0,
            "online_iter > 0",
            self.online_iter.to_string(),
        )?;
        check(
            (0.0..=1.0).contains(&self.mix.probability),
            "mix probability in [0, 1]",
            self.mix.probability.to_string(),
        )?;
        check(self.topk > 0, "topk > 0", self.topk.to_string())?;
        check(self.eval_batch_size > 0, "eval_batch_size > 0", self.eval_batch_size.to_string())?;
        check(
            self.lambda >= 0.0,
            "lambda >= 0",
            self.lambda.to_string(),
        )?;
        check(
            self.expansion.coverage_constant > 0.0,
            "coverage_constant > 0",
            self.expansion.coverage_constant.to_string(),
        )?;
        if let Some(max_norm) = self.gradient_clip {
            check(max_norm > 0.0, "gradient_clip > 0", max_norm.to_string())?;
        }
        Ok(())
    }

    /// Exemplars replayed per optimizer step
    pub fn replay_size(&self) -> usize {
        self.batch_size.saturating_sub(self.stream_batch_size)
    }
}

/// Turns a fractional steps-per-event rate into whole optimizer steps
///
/// The remainder carries over, so the long-run number of steps matches the
/// rate exactly even when it is not an integer.
#[derive(Debug, Clone)]
pub struct IterationAccumulator {
    rate: f64,
    carry: f64,
}

impl IterationAccumulator {
    /// Rate `online_iter * batch_size / stream_batch_size` steps per event
    pub fn new(online_iter: f32, batch_size: usize, stream_batch_size: usize) -> Self {
        let rate = online_iter as f64 * batch_size as f64 / stream_batch_size.max(1) as f64;
        Self { rate, carry: 0.0 }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Steps to take for the next stream event
    pub fn advance(&mut self) -> usize {
        self.carry += self.rate;
        let steps = self.carry.floor();
        self.carry -= steps;
        steps as usize
    }
}

/// Training statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingStats {
    /// Optimizer steps taken
    pub total_steps: usize,
    /// Stream samples seen by this worker
    pub total_samples: u64,
    /// Running loss
    pub running_loss: f32,
    /// Slots added by dynamic expansion
    pub slots_spawned: usize,
    /// Current learning rate
    pub current_lr: f32,
}

impl TrainingStats {
    /// Update with new loss
    pub fn update(&mut self, loss: f32, lr: f32) {
        self.total_steps += 1;
        self.current_lr = lr;

        // Exponential moving average of loss
        if self.total_steps == 1 {
            self.running_loss = loss;
        } else {
            self.running_loss = 0.99 * self.running_loss + 0.01 * loss;
        }
    }
}

/// Receives training, evaluation and task reports
pub trait Reporter: Send {
    fn training(&mut self, samples: u64, report: &StepReport);

    fn evaluation(&mut self, samples: u64, report: &EvalReport);

    fn task(&mut self, record: &TaskRecord);
}

/// Logs reports through `tracing`; non-leader ranks log at debug level
#[derive(Debug, Clone, Copy)]
pub struct TracingReporter {
    leader: bool,
}

impl TracingReporter {
    pub fn new(leader: bool) -> Self {
        Self { leader }
    }
}

impl Reporter for TracingReporter {
    fn training(&mut self, samples: u64, r: &StepReport) {
        if self.leader {
            info!(samples, loss = r.loss, acc = r.acc, lr = r.lr, iterations = r.iterations, "train");
        } else {
            debug!(samples, loss = r.loss, acc = r.acc, lr = r.lr, iterations = r.iterations, "train");
        }
    }

    fn evaluation(&mut self, samples: u64, r: &EvalReport) {
        if self.leader {
            info!(samples, loss = r.avg_loss, acc = r.avg_acc, "test");
        } else {
            debug!(samples, loss = r.avg_loss, acc = r.avg_acc, "test");
        }
    }

    fn task(&mut self, record: &TaskRecord) {
        if self.leader {
            info!(task = record.task(), acc = record.task_accuracy(), "task finished");
        } else {
            debug!(task = record.task(), acc = record.task_accuracy(), "task finished");
        }
    }
}

/// Outcome of one optimizer step
#[derive(Debug, Clone, Copy, Default)]
struct IterationResult {
    loss: f32,
    correct: usize,
    samples: usize,
}

/// Online trainer for continual learning
pub struct OnlineTrainer {
    /// Configuration
    config: TrainerConfig,
    backbone: Box<dyn PromptedBackbone>,
    input_shape: InputShape,
    pool: PromptPool,
    expansion: DynamicExpansionController,
    memory: ReservoirMemory<Vec<f32>>,
    head: IncrementalClassifierHead,
    optimizer: Optimizer,
    pool_group: GroupId,
    /// Learning rate scheduler
    scheduler: LearningRateScheduler,
    mixer: CutMix,
    iterations: IterationAccumulator,
    collective: Box<dyn Collective>,
    reporter: Box<dyn Reporter>,
    /// Training statistics
    stats: TrainingStats,
    /// Stream samples seen across all workers
    samples_seen: u64,
    next_eval: u64,
    periodic_acc: Vec<f32>,
    records: Vec<TaskRecord>,
    // Training start time
}

/// Per-worker seed for an independent random stream
fn worker_seed(seed: Option<u64>, rank: usize, stream: u64) -> Option<u64> {
    seed.map(|s| {
        s.wrapping_add(stream)
            .wrapping_add((rank as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
    })
}

impl OnlineTrainer {
    /// Create new online trainer
    pub fn new(
        config: TrainerConfig,
        backbone: Box<dyn PromptedBackbone>,
        input_shape: InputShape,
        collective: Box<dyn Collective>,
    ) -> Result<Self> {
        config.validate()?;
        let rank = collective.rank();
        if collective.world_size() > 1 && config.seed.is_none() {
            return Err(LearningError::ConfigError(
                "multi-worker runs need a seed so every worker starts from the same head".into(),
            ));
        }

        let dim = backbone.embed_dim();
        let mut rng = match worker_seed(config.seed, rank, 0) {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let pool = PromptPool::new(config.pool.clone(), dim, &mut rng)?;

        let mut optimizer = Optimizer::from_config(&config.optimizer)?;
        let pool_group = optimizer.add_group(POOL_GROUP, config.optimizer.lr);
        let head = IncrementalClassifierHead::new(
            dim,
            HeadConfig {
                seed: config.head.seed.or(config.seed),
            },
            &mut optimizer,
        );
        let memory = ReservoirMemory::new(MemoryConfig {
            seed: worker_seed(config.memory.seed.or(config.seed), rank, 1),
            ..config.memory.clone()
        });
        let scheduler = LearningRateScheduler::new(&config.scheduler, config.optimizer.lr)?;
        let mixer = CutMix::new(config.mix.clone(), worker_seed(config.seed, rank, 2))?;
        let iterations = IterationAccumulator::new(
            config.online_iter,
            config.batch_size,
            config.stream_batch_size,
        );

        info!(
            rank,
            world_size = collective.world_size(),
            backbone = backbone.name(),
            dim,
            pool_size = pool.len(),
            "trainer ready"
        );

        Ok(Self {
            expansion: DynamicExpansionController::new(config.expansion.clone()),
            next_eval: config.eval_period,
            reporter: Box::new(TracingReporter::new(collective.is_leader())),
            config,
            backbone,
            input_shape,
            pool,
            memory,
            head,
            optimizer,
            pool_group,
            scheduler,
            mixer,
            iterations,
            collective,
            stats: TrainingStats::default(),
            samples_seen: 0,
            periodic_acc: Vec::new(),
            records: Vec::new(),
        })
    }

    /// Replace the report sink
    pub fn with_reporter(mut self, reporter: Box<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn pool(&self) -> &PromptPool {
        &self.pool
    }

    pub fn head(&self) -> &IncrementalClassifierHead {
        &self.head
    }

    pub fn memory(&self) -> &ReservoirMemory<Vec<f32>> {
        &self.memory
    }

    pub fn optimizer(&self) -> &Optimizer {
        &self.optimizer
    }

    /// Get training statistics
    pub fn stats(&self) -> &TrainingStats {
        &self.stats
    }

    /// Get current learning rate
    pub fn get_lr(&self) -> f32 {
        self.scheduler.get_lr()
    }

    /// Stream samples seen across all workers
    pub fn samples_seen(&self) -> u64 {
        self.samples_seen
    }

    pub fn task_records(&self) -> &[TaskRecord] {
        &self.records
    }

    /// Accuracies of the periodic evaluations so far
    pub fn periodic_accuracies(&self) -> &[f32] {
        &self.periodic_acc
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary::from_records(&self.periodic_acc, &self.records)
    }

    /// Give every unseen label a head output
    ///
    /// Called with the full stream batch on every worker, so all workers grow
    /// their heads identically.
    fn expose_classes(&mut self, labels: &[ClassId]) -> Result<()> {
        let mut grew = false;
        for &label in labels {
            if self.head.expose(label, &mut self.optimizer)?.is_new() {
                self.pool.expose_class();
                grew = true;
            }
        }
        if grew {
            self.memory.add_new_class(self.head.registry().classes());
            if self.scheduler.on_class_growth() {
                self.scheduler.apply(&mut self.optimizer);
            }
        }
        Ok(())
    }

    /// Train on one stream batch
    ///
    /// `batch` is the whole stream batch; this worker trains on its shard.
    pub fn online_step(&mut self, batch: &LabeledBatch) -> Result<StepReport> {
        self.expose_classes(&batch.labels)?;

        let local = batch.shard(self.collective.rank(), self.collective.world_size())?;
        let local_labels = self.head_indices(&local.labels)?;

        let steps = self.iterations.advance();
        let mut loss_sum = 0.0;
        let mut correct = 0;
        let mut seen = 0;
        for _ in 0..steps {
            let result = self.train_iteration(&local.inputs, &local_labels)?;
            loss_sum += result.loss;
            correct += result.correct;
            seen += result.samples;
        }

        for (i, &label) in local.labels.iter().enumerate() {
            self.memory.offer(local.inputs.sample(i).to_vec(), label);
        }

        self.stats.total_samples += local.len() as u64;

        let report = StepReport {
            loss: if steps > 0 { loss_sum / steps as f32 } else { 0.0 },
            acc: if seen > 0 { correct as f32 / seen as f32 } else { 0.0 },
            iterations: steps,
            lr: self.scheduler.get_lr(),
        };
        self.reporter.training(self.samples_seen, &report);
        Ok(report)
    }

    fn head_indices(&self, labels: &[ClassId]) -> Result<Vec<usize>> {
        labels
            .iter()
            .map(|&label| {
                self.head
                    .registry()
                    .index_of(label)
                    .ok_or_else(|| LearningError::precondition("label exposed before training", label))
            })
            .collect()
    }

    /// Stream samples plus up to `replay_size` exemplars
    fn compose_batch(&mut self, stream: &InputBatch, labels: &[usize]) -> Result<(InputBatch, Vec<usize>)> {
        let want = self.config.replay_size();
        if want == 0 || self.memory.is_empty() {
            return Ok((stream.clone(), labels.to_vec()));
        }

        let available = self.memory.len();
        if available < want {
            debug!(want, available, "replaying fewer exemplars");
        }
        let replay = self.memory.get_batch(want.min(available))?;

        let mut samples: Vec<&[f32]> = (0..stream.len()).map(|i| stream.sample(i)).collect();
        let mut all_labels = labels.to_vec();
        for exemplar in &replay {
            samples.push(exemplar.payload.as_slice());
            let idx = self.head.registry().index_of(exemplar.label).ok_or_else(|| {
                LearningError::precondition("replayed class is exposed", exemplar.label)
            })?;
            all_labels.push(idx);
        }
        Ok((InputBatch::from_samples(self.input_shape, &samples)?, all_labels))
    }

    /// One forward, backward and optimizer step
    fn train_iteration(&mut self, stream: &InputBatch, stream_labels: &[usize]) -> Result<IterationResult> {
        let (mut inputs, labels) = self.compose_batch(stream, stream_labels)?;
        let mixed = self.mixer.maybe_mix(&mut inputs, &labels);

        let tokens = self.backbone.encode_tokens(&inputs)?;
        let query = self.backbone.encode_pooled(&tokens);

        if self.config.expansion.enabled && self.pool.is_training() {
            let outcome = self.expansion.expand(&query, &mut self.pool)?;
            self.stats.slots_spawned += outcome.spawned.len();
        }

        let pc = self.pool.config().clone();
        let selection = self
            .pool
            .select(&query, pc.selection_size, pc.batchwise, pc.diversified)?;
        let general = self
            .pool
            .general_prompt()
            .map(|g| PromptBatch::repeated(g, inputs.len(), pc.general_prompt_len, self.pool.dim()));

        let output = self
            .backbone
            .forward_with_prompts(&tokens, general.as_ref(), &selection.prompts)?;
        let features = output.pooled();
        let raw_logits = self.head.forward(&features)?;
        let mask = self.pool.class_mask(&selection.indices);
        let logits = match &mask {
            Some(mask) => loss::apply_class_mask(&raw_logits, mask)?,
            None => raw_logits.clone(),
        };

        let (task_loss, grad_logits) = match &mixed {
            Some(mixed) => loss::mixed_cross_entropy(&logits, mixed)?,
            None => loss::cross_entropy(&logits, &labels)?,
        };
        let (key_loss, key_grads) = if self.config.contrastive {
            loss::contrastive_key_loss(&query, &self.pool, &selection, self.config.lambda)
        } else {
            loss::pull_constraint(&query, &self.pool, &selection, self.config.lambda)
        };

        // Backward
        let grad_logits = match &mask {
            Some(mask) => {
                let (grad_raw, grad_mask) =
                    loss::class_mask_backward(&raw_logits, mask, &grad_logits)?;
                self.accumulate_mask_gradients(&selection.indices, &grad_mask)?;
                grad_raw
            }
            None => grad_logits,
        };
        let (d_weight, d_bias, d_features) = self.head.gradients(&features, &grad_logits)?;
        self.head.accumulate(&mut self.optimizer, &d_weight, &d_bias)?;
        let prompt_grads = self.backbone.backward_prompts(
            &tokens,
            general.as_ref(),
            &selection.prompts,
            &d_features,
        )?;
        self.accumulate_pool_gradients(&selection.indices, &prompt_grads.expert, prompt_grads.general.as_ref(), key_grads)?;

        // Clip before averaging so every worker applies the same head update
        if let Some(max_norm) = self.config.gradient_clip {
            let norm = self.optimizer.clip_pending(max_norm);
            if norm > max_norm {
                debug!(norm, max_norm, "gradients clipped");
            }
        }
        self.sync_head_gradients()?;
        self.apply_gradients()?;

        let lr = self.scheduler.step();
        self.scheduler.apply(&mut self.optimizer);
        self.pool.update();

        let loss = task_loss + key_loss;
        if !loss.is_finite() {
            warn!(task_loss, key_loss, "non-finite training loss");
        }
        self.stats.update(loss, lr);

        Ok(IterationResult {
            loss,
            correct: metrics::top_k_correct(&logits, &labels, self.config.topk),
            samples: labels.len(),
        })
    }

    fn accumulate_pool_gradients(
        &mut self,
        indices: &[Vec<usize>],
        expert: &PromptBatch,
        general: Option<&PromptBatch>,
        key_grads: KeyGradients,
    ) -> Result<()> {
        let group = self.pool_group;
        for (slot, grad) in key_grads {
            self.optimizer.accumulate(group, &format!("key.{}", slot), &grad)?;
        }
        for (b, row) in indices.iter().enumerate() {
            for (j, &slot) in row.iter().enumerate() {
                self.optimizer
                    .accumulate(group, &format!("prompt.{}", slot), expert.prompt(b, j))?;
            }
        }
        if let Some(general) = general {
            for b in 0..general.batch {
                self.optimizer.accumulate(group, "general", general.prompt(b, 0))?;
            }
        }
        Ok(())
    }

    /// Each selected slot gets its share of the row's mask gradient
    fn accumulate_mask_gradients(&mut self, indices: &[Vec<usize>], grad_mask: &Matrix) -> Result<()> {
        let group = self.pool_group;
        for (b, row) in indices.iter().enumerate() {
            let share: Vec<f32> = grad_mask
                .row(b)
                .iter()
                .map(|g| g / row.len() as f32)
                .collect();
            for &slot in row {
                self.optimizer.accumulate(group, &format!("mask.{}", slot), &share)?;
            }
        }
        Ok(())
    }

    /// Average head gradients over workers
    fn sync_head_gradients(&mut self) -> Result<()> {
        if self.collective.world_size() == 1 {
            return Ok(());
        }
        let head_group = self.head.group_id();
        let collective = &self.collective;
        for (group, _, grad) in self.optimizer.pending_mut() {
            if group == head_group {
                collective.all_reduce(grad, ReduceOp::Avg)?;
            }
        }
        Ok(())
    }

    /// Apply gradients
    fn apply_gradients(&mut self) -> Result<()> {
        self.head.apply(&mut self.optimizer)?;

        let group = self.pool_group;
        for s in 0..self.pool.len() {
            let Some(slot) = self.pool.slot_mut(s) else {
                continue;
            };
            self.optimizer.step_param(group, &format!("key.{}", s), &mut slot.key)?;
            self.optimizer.step_param(group, &format!("prompt.{}", s), &mut slot.prompt)?;
            self.optimizer.step_param(group, &format!("mask.{}", s), &mut slot.mask)?;
        }
        if let Some(general) = self.pool.general_prompt_mut() {
            self.optimizer.step_param(group, "general", general)?;
        }
        self.optimizer.finish_step()
    }

    /// Evaluate on the exposed classes of `eval`
    ///
    /// Selection runs in evaluation mode, so slot frequencies are untouched.
    pub fn evaluate(&mut self, eval: &EvalSet) -> Result<EvalReport> {
        self.pool.set_training(false);
        let result = self.evaluate_inner(eval);
        self.pool.update();
        self.pool.set_training(true);

        let report = result?;
        self.reporter.evaluation(self.samples_seen, &report);
        Ok(report)
    }

    fn evaluate_inner(&mut self, eval: &EvalSet) -> Result<EvalReport> {
        let mut acc = EvalAccumulator::new(self.head.num_classes(), self.config.topk);
        let batches = eval.batches(
            self.head.registry(),
            self.config.eval_batch_size,
            self.collective.rank(),
            self.collective.world_size(),
        )?;

        let pc = self.pool.config().clone();
        for (inputs, labels) in batches {
            let tokens = self.backbone.encode_tokens(&inputs)?;
            let query = self.backbone.encode_pooled(&tokens);
            let selection = self
                .pool
                .select(&query, pc.selection_size, pc.batchwise, pc.diversified)?;
            let general = self
                .pool
                .general_prompt()
                .map(|g| PromptBatch::repeated(g, inputs.len(), pc.general_prompt_len, self.pool.dim()));
            let output = self
                .backbone
                .forward_with_prompts(&tokens, general.as_ref(), &selection.prompts)?;
            let mut logits = self.head.forward(&output.pooled())?;
            if let Some(mask) = self.pool.class_mask(&selection.indices) {
                logits = loss::apply_class_mask(&logits, &mask)?;
            }
            let (loss, _) = loss::cross_entropy(&logits, &labels)?;
            acc.observe(&logits, &labels, loss)?;
        }

        let mut sums = acc.to_flat();
        self.collective.all_reduce(&mut sums, ReduceOp::Sum)?;
        acc.load_flat(&sums)?;
        Ok(acc.finish())
    }

    /// Drive the trainer through a whole stream
    pub fn run<I>(&mut self, stream: I, eval: &EvalSet) -> Result<RunSummary>
    where
        I: IntoIterator<Item = StreamEvent>,
    {
        for event in stream {
            match event {
                StreamEvent::Batch(batch) => {
                    self.samples_seen += batch.len() as u64;
                    if self.config.eval_period > 0 && self.samples_seen > self.next_eval {
                        let report = self.evaluate(eval)?;
                        self.periodic_acc.push(report.avg_acc);
                        self.next_eval += self.config.eval_period;
                    }
                    self.online_step(&batch)?;
                }
                StreamEvent::EndOfTask(task) => {
                    let report = self.evaluate(eval)?;
                    let record = TaskRecord::new(task, self.samples_seen, &report);
                    self.reporter.task(&record);
                    self.records.push(record);
                }
            }
        }

        let summary = self.summary();
        if self.collective.is_leader() {
            info!(
                a_auc = summary.a_auc,
                a_avg = summary.a_avg,
                a_last = summary.a_last,
                f_last = summary.f_last,
                "run finished"
            );
        }
        Ok(summary)
    }
}

impl std::fmt::Debug for OnlineTrainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnlineTrainer")
            .field("config", &self.config)
            .field("backbone", &self.backbone.name())
            .field("pool_size", &self.pool.len())
            .field("classes", &self.head.num_classes())
            .field("stats", &self.stats)
            .finish()
    }
}
