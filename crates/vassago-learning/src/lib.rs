//! Online class-incremental learning
//!
//! This crate provides continual learning over a non-stationary sample stream:
//! - A growable prompt pool selected by query-key cosine distance
//! - Dynamic pool expansion for queries no key covers
//! - Reservoir exemplar memory for replay
//! - A classifier head that grows one output per exposed class
//! - Learning rate schedules that restart on class growth
//! - Data-parallel training through a collective all-reduce
//! - Anytime, task-boundary and forgetting metrics
//!
//! [`OnlineTrainer`] ties these together: feed it [`StreamEvent`]s and a
//! held-out [`EvalSet`], and it returns a [`RunSummary`].

mod backbone;
mod collective;
mod error;
mod expansion;
mod head;
mod loss;
mod memory;
mod metrics;
mod mixing;
mod optimizer;
mod prompt;
mod scheduler;
mod stream;
mod tensor;
mod trainer;

pub use backbone::{
    backbone_names, build_backbone, BackboneConfig, Identity, PromptGradients, PromptedBackbone,
    PromptedOutput, RandomProjection, BACKBONES,
};
pub use collective::{Collective, LocalCollective, ReduceOp, ThreadCollective, WorkerConfig};
pub use error::{LearningError, Result};
pub use expansion::{DynamicExpansionController, ExpansionConfig, ExpansionOutcome};
pub use head::{
    ClassId, ClassRegistry, Exposure, HeadConfig, HeadParams, IncrementalClassifierHead, HEAD_GROUP,
};
pub use loss::{
    apply_class_mask, class_mask_backward, contrastive_key_loss, cross_entropy, mixed_cross_entropy,
    pull_constraint, KeyGradients,
};
pub use memory::{Exemplar, MemoryConfig, Offer, ReservoirMemory};
pub use metrics::{
    argmax, top_k_correct, EvalAccumulator, EvalReport, RunSummary, StepReport, TaskRecord,
};
pub use mixing::{CutMix, MixConfig, Mixed};
pub use optimizer::{
    optimizer_names, GroupId, Optimizer, OptimizerConfig, OptimizerKind, ParamGroup, ParamState,
};
pub use prompt::{PoolConfig, PromptPool, PromptSlot, Selection, UsageCounting};
pub use scheduler::{LearningRateScheduler, SchedulerConfig, SchedulerType};
pub use stream::{EvalSet, LabeledBatch, StreamEvent};
pub use tensor::{InputBatch, InputShape, Matrix, PromptBatch, TokenBatch};
pub use trainer::{
    IterationAccumulator, OnlineTrainer, Reporter, TrainerConfig, TrainingStats, TracingReporter,
    POOL_GROUP,
};
