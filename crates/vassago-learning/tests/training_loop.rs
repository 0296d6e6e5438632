//! End-to-end runs of the online trainer on a synthetic stream.

use std::thread;

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use vassago_learning::{
    build_backbone, BackboneConfig, ClassId, EvalReport, EvalSet, ExpansionConfig, Identity,
    InputBatch, InputShape, LabeledBatch, LocalCollective, Matrix, MemoryConfig, MixConfig,
    OnlineTrainer, OptimizerConfig, PoolConfig, PromptBatch, PromptGradients, PromptedBackbone,
    PromptedOutput, Result, StreamEvent, TaskRecord, ThreadCollective, TokenBatch, TrainerConfig,
};

const DIM: usize = 16;

fn shape() -> InputShape {
    InputShape::new(1, 4, 4)
}

/// Two classes per task, each a tight Gaussian cluster
fn stream(tasks: usize, per_class: usize, batch: usize) -> (Vec<StreamEvent>, EvalSet) {
    let mut rng = StdRng::seed_from_u64(11);
    let centers = Normal::new(0.0f32, 1.0).unwrap();
    let noise = Normal::new(0.0f32, 0.1).unwrap();
    let classes = tasks * 2;
    let center: Vec<Vec<f32>> = (0..classes)
        .map(|_| (0..DIM).map(|_| centers.sample(&mut rng)).collect())
        .collect();
    let mut draw = |c: usize| -> Vec<f32> {
        center[c].iter().map(|v| v + noise.sample(&mut rng)).collect()
    };

    let mut events = Vec::new();
    for task in 0..tasks {
        let mut samples = Vec::new();
        for i in 0..per_class * 2 {
            let class = task * 2 + i % 2;
            samples.push((draw(class), class as ClassId));
        }
        for chunk in samples.chunks(batch) {
            let rows: Vec<&[f32]> = chunk.iter().map(|(x, _)| x.as_slice()).collect();
            let inputs = InputBatch::from_samples(shape(), &rows).unwrap();
            let labels = chunk.iter().map(|&(_, y)| y).collect();
            events.push(StreamEvent::Batch(LabeledBatch::new(inputs, labels).unwrap()));
        }
        events.push(StreamEvent::EndOfTask(task));
    }

    let mut eval = EvalSet::new(shape());
    for class in 0..classes {
        for _ in 0..4 {
            eval.push(draw(class), class as ClassId).unwrap();
        }
    }
    (events, eval)
}

fn config() -> TrainerConfig {
    TrainerConfig {
        pool: PoolConfig {
            pool_size: 6,
            selection_size: 2,
            prompt_len: 2,
            general_prompt_len: 1,
            ..Default::default()
        },
        memory: MemoryConfig {
            memory_size: 12,
            seed: None,
        },
        optimizer: OptimizerConfig {
            lr: 0.01,
            ..Default::default()
        },
        batch_size: 6,
        stream_batch_size: 4,
        online_iter: 0.5,
        eval_period: 16,
        eval_batch_size: 8,
        seed: Some(5),
        ..Default::default()
    }
}

fn backbone_config() -> BackboneConfig {
    BackboneConfig {
        embed_dim: 8,
        patch_size: 4,
        ..Default::default()
    }
}

fn assert_valid_records(records: &[TaskRecord]) {
    for (task, record) in records.iter().enumerate() {
        assert_eq!(record.task(), task);
        assert_eq!(record.per_class_acc().len(), (task + 1) * 2);
        assert!((0.0..=1.0).contains(&record.task_accuracy()));
        for acc in record.per_class_acc() {
            let acc = acc.expect("every exposed class has eval samples");
            assert!((0.0..=1.0).contains(&acc));
        }
    }
}

#[test]
fn test_single_worker_run() {
    let (events, eval) = stream(3, 12, 4);
    let backbone = build_backbone(&backbone_config(), shape()).unwrap();
    let mut trainer =
        OnlineTrainer::new(config(), backbone, shape(), Box::new(LocalCollective)).unwrap();

    let summary = trainer.run(events, &eval).unwrap();

    assert_eq!(trainer.samples_seen(), 72);
    assert_eq!(trainer.head().num_classes(), 6);
    assert_eq!(trainer.head().registry().classes(), &[0, 1, 2, 3, 4, 5]);
    assert_eq!(trainer.memory().len(), 12);
    assert_eq!(trainer.memory().classes().len(), 6);
    assert_eq!(trainer.task_records().len(), 3);
    assert_valid_records(trainer.task_records());

    // 18 events at 0.75 steps each
    assert_eq!(trainer.stats().total_steps, 13);
    assert!(trainer.stats().running_loss.is_finite());
    assert_eq!(trainer.periodic_accuracies().len(), 4);

    assert!((0.0..=1.0).contains(&summary.a_auc));
    assert!((0.0..=1.0).contains(&summary.a_last));
    assert!(summary.f_last.is_finite());
    assert!(!trainer.optimizer().has_pending_gradients());
}

#[test]
fn test_expansion_mixing_and_contrastive_loss() {
    let (events, eval) = stream(2, 8, 4);
    let mut cfg = config();
    cfg.expansion = ExpansionConfig {
        enabled: true,
        coverage_constant: 0.05,
    };
    cfg.mix = MixConfig {
        enabled: true,
        probability: 1.0,
        alpha: 1.0,
    };
    cfg.contrastive = true;
    cfg.online_iter = 1.0;

    let backbone = build_backbone(&backbone_config(), shape()).unwrap();
    let mut trainer = OnlineTrainer::new(cfg, backbone, shape(), Box::new(LocalCollective)).unwrap();
    trainer.run(events, &eval).unwrap();

    assert!(trainer.pool().len() > 6);
    assert_eq!(trainer.stats().slots_spawned, trainer.pool().len() - 6);
    assert!(trainer.stats().running_loss.is_finite());
    assert_valid_records(trainer.task_records());
}

#[test]
fn test_workers_stay_in_sync() {
    let (events, eval) = stream(2, 8, 4);

    let handles: Vec<_> = ThreadCollective::group(2)
        .into_iter()
        .map(|collective| {
            let events = events.clone();
            let eval = eval.clone();
            thread::spawn(move || {
                let backbone = build_backbone(&backbone_config(), shape()).unwrap();
                let mut trainer =
                    OnlineTrainer::new(config(), backbone, shape(), Box::new(collective)).unwrap();
                trainer.run(events, &eval).unwrap();
                let report: EvalReport = trainer.evaluate(&eval).unwrap();
                (trainer.head().snapshot(), trainer.task_records().to_vec(), report)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let (head0, records0, report0) = &results[0];
    let (head1, records1, report1) = &results[1];

    // Averaged head gradients keep the replicas identical
    assert_eq!(head0.weight, head1.weight);
    assert_eq!(head0.bias, head1.bias);
    // Evaluation sums are reduced before any ratio is taken
    assert_eq!(records0, records1);
    assert_eq!(report0, report1);
    assert_eq!(head0.num_classes(), 4);
}

#[test]
fn test_workers_need_a_seed() {
    let mut group = ThreadCollective::group(2);
    let collective = group.remove(0);
    let cfg = TrainerConfig {
        seed: None,
        ..config()
    };
    let backbone = build_backbone(&backbone_config(), shape()).unwrap();
    let err = OnlineTrainer::new(cfg, backbone, shape(), Box::new(collective)).unwrap_err();
    assert_eq!(err.category(), "config_error");
}

#[test]
fn test_crashed_worker_fails_the_run() {
    let (events, eval) = stream(2, 8, 4);
    let mut group = ThreadCollective::group(2);
    let crashed = group.pop().unwrap();
    let leader = group.pop().unwrap();

    let crash = thread::spawn(move || {
        let _handle = crashed;
        panic!("worker failed before its first step");
    });
    assert!(crash.join().is_err());

    let backbone = build_backbone(&backbone_config(), shape()).unwrap();
    let mut trainer = OnlineTrainer::new(config(), backbone, shape(), Box::new(leader)).unwrap();
    let err = trainer.run(events, &eval).unwrap_err();
    assert_eq!(err.category(), "distributed_desync");
    assert!(!err.is_recoverable());
}

/// An encoder from outside the built-in registry
#[derive(Debug)]
struct ExternalEncoder(Identity);

impl PromptedBackbone for ExternalEncoder {
    fn name(&self) -> &str {
        "external"
    }

    fn embed_dim(&self) -> usize {
        self.0.embed_dim()
    }

    fn encode_tokens(&self, inputs: &InputBatch) -> Result<TokenBatch> {
        self.0.encode_tokens(inputs)
    }

    fn forward_with_prompts(
        &self,
        tokens: &TokenBatch,
        general: Option<&PromptBatch>,
        expert: &PromptBatch,
    ) -> Result<PromptedOutput> {
        self.0.forward_with_prompts(tokens, general, expert)
    }

    fn backward_prompts(
        &self,
        tokens: &TokenBatch,
        general: Option<&PromptBatch>,
        expert: &PromptBatch,
        grad_features: &Matrix,
    ) -> Result<PromptGradients> {
        self.0.backward_prompts(tokens, general, expert, grad_features)
    }
}

#[test]
fn test_external_backbone_trains_prompts() {
    let (events, _) = stream(1, 8, 4);
    let mut cfg = config();
    cfg.optimizer.lr = 0.5;
    cfg.online_iter = 1.0;
    let backbone = Box::new(ExternalEncoder(Identity::new(shape())));
    let mut trainer = OnlineTrainer::new(cfg, backbone, shape(), Box::new(LocalCollective)).unwrap();

    let before: Vec<Vec<f32>> = (0..6)
        .map(|i| trainer.pool().slot(i).unwrap().prompt.clone())
        .collect();
    let batch = match &events[0] {
        StreamEvent::Batch(batch) => batch.clone(),
        other => panic!("expected a batch, got {:?}", other),
    };
    for _ in 0..5 {
        trainer.online_step(&batch).unwrap();
    }

    let moved = (0..6).any(|i| trainer.pool().slot(i).unwrap().prompt != before[i]);
    assert!(moved, "prompts did not change after five steps");
}
