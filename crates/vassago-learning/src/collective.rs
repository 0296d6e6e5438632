//! Collective communication between data-parallel workers
//!
//! Every worker owns its own pool, memory and head. The only shared steps
//! are gradient averaging after backward and the reduction of evaluation
//! sums, both expressed as an all-reduce over a flat `f32` buffer. Workers
//! must issue collectives in the same order with buffers of the same length.

use crate::{LearningError, Result};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Default bound on one rendezvous
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Reduction operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReduceOp {
    /// Sum
    Sum,
    /// Average
    Avg,
    /// Maximum
    Max,
    /// Minimum
    Min,
}

impl ReduceOp {
    fn combine(&self, acc: f32, v: f32) -> f32 {
        match self {
            ReduceOp::Sum | ReduceOp::Avg => acc + v,
            ReduceOp::Max => acc.max(v),
            ReduceOp::Min => acc.min(v),
        }
    }
}

/// Identity of one worker in the job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub rank: usize,
    pub world_size: usize,
    /// Where workers meet; in-process groups only use it as a label
    pub rendezvous_addr: String,
    /// Seconds a worker waits for its peers before the job aborts
    pub timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            rendezvous_addr: "inproc://vassago".into(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 {
            return Err(LearningError::ConfigError(
                "workers.timeout_secs must be positive".into(),
            ));
        }
        if self.world_size == 0 || self.rank >= self.world_size {
            return Err(LearningError::precondition(
                "rank < world_size",
                format!("rank {} of {}", self.rank, self.world_size),
            ));
        }
        Ok(())
    }

    /// Rank 0 reports; the others stay quiet
    pub fn is_leader(&self) -> bool {
        self.rank == 0
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Blocking collective operations
pub trait Collective: Send + std::fmt::Debug {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Reduce `data` element-wise across every worker, in place
    fn all_reduce(&self, data: &mut [f32], op: ReduceOp) -> Result<()>;

    fn is_leader(&self) -> bool {
        self.rank() == 0
    }
}

/// Single-worker collective; every reduction is the identity
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalCollective;

impl Collective for LocalCollective {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce(&self, _data: &mut [f32], _op: ReduceOp) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct Round {
    generation: u64,
    arrived: usize,
    contributions: Vec<Vec<f32>>,
    /// Outcome of the last completed round, valid until every rank has read it
    reduced: std::result::Result<Vec<f32>, String>,
    /// Set once a rank leaves the group or a wait times out
    aborted: Option<String>,
}

#[derive(Debug)]
struct Shared {
    world_size: usize,
    timeout: Duration,
    round: Mutex<Round>,
    ready: Condvar,
}

/// One worker's handle into an in-process group of worker threads
///
/// Each all-reduce publishes this rank's buffer; the last rank to arrive
/// folds the buffers in rank order (so every rank computes bit-identical
/// results) and wakes the others. Dropping a handle, including during a
/// panic, aborts the group: peers blocked in or entering an all-reduce get
/// `DistributedDesync` instead of waiting forever. A wait that outlives the
/// group's timeout aborts the group the same way.
#[derive(Debug)]
pub struct ThreadCollective {
    rank: usize,
    shared: Arc<Shared>,
}

impl ThreadCollective {
    /// Handles for ranks `0..world_size`, one per worker thread
    pub fn group(world_size: usize) -> Vec<ThreadCollective> {
        Self::group_with_timeout(world_size, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    /// Like [`ThreadCollective::group`], with a bound on each rendezvous
    pub fn group_with_timeout(world_size: usize, timeout: Duration) -> Vec<ThreadCollective> {
        let shared = Arc::new(Shared {
            world_size,
            timeout,
            round: Mutex::new(Round {
                generation: 0,
                arrived: 0,
                contributions: vec![Vec::new(); world_size],
                reduced: Ok(Vec::new()),
                aborted: None,
            }),
            ready: Condvar::new(),
        });
        (0..world_size)
            .map(|rank| ThreadCollective {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    fn desync(&self, reason: impl Into<String>) -> LearningError {
        LearningError::DistributedDesync {
            rank: self.rank,
            reason: reason.into(),
        }
    }

    fn reduce(slots: &[Vec<f32>], op: ReduceOp) -> std::result::Result<Vec<f32>, String> {
        let len = slots[0].len();
        if let Some(peer) = slots.iter().position(|s| s.len() != len) {
            return Err(format!(
                "rank {} sent {} values, rank 0 sent {}",
                peer,
                slots[peer].len(),
                len
            ));
        }
        let mut out: Vec<f32> = (0..len)
            .map(|i| slots[1..].iter().fold(slots[0][i], |acc, s| op.combine(acc, s[i])))
            .collect();
        if op == ReduceOp::Avg {
            let n = slots.len() as f32;
            for v in out.iter_mut() {
                *v /= n;
            }
        }
        Ok(out)
    }
}

impl Collective for ThreadCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn all_reduce(&self, data: &mut [f32], op: ReduceOp) -> Result<()> {
        let mut round = self
            .shared
            .round
            .lock()
            .map_err(|_| self.desync("collective state poisoned"))?;
        if let Some(reason) = &round.aborted {
            return Err(self.desync(reason.clone()));
        }

        let generation = round.generation;
        round.contributions[self.rank].clear();
        round.contributions[self.rank].extend_from_slice(data);
        round.arrived += 1;

        if round.arrived == self.shared.world_size {
            round.reduced = Self::reduce(&round.contributions, op);
            round.arrived = 0;
            round.generation += 1;
            self.shared.ready.notify_all();
        } else {
            let (guard, wait) = self
                .shared
                .ready
                .wait_timeout_while(round, self.shared.timeout, |r| {
                    r.generation == generation && r.aborted.is_none()
                })
                .map_err(|_| self.desync("collective state poisoned"))?;
            round = guard;
            if round.generation == generation {
                if wait.timed_out() && round.aborted.is_none() {
                    let reason = format!(
                        "no rendezvous within {}ms",
                        self.shared.timeout.as_millis()
                    );
                    warn!(rank = self.rank, %reason, "aborting worker group");
                    round.aborted = Some(reason);
                    self.shared.ready.notify_all();
                }
                let reason = round.aborted.clone().unwrap_or_default();
                return Err(self.desync(reason));
            }
        }

        match &round.reduced {
            Ok(values) if values.len() == data.len() => {
                data.copy_from_slice(values);
                Ok(())
            }
            Ok(values) => Err(self.desync(format!(
                "reduced {} values, expected {}",
                values.len(),
                data.len()
            ))),
            Err(reason) => Err(self.desync(reason.clone())),
        }
    }
}

impl Drop for ThreadCollective {
    fn drop(&mut self) {
        let mut round = match self.shared.round.lock() {
            Ok(round) => round,
            Err(poisoned) => poisoned.into_inner(),
        };
        if round.aborted.is_none() {
            let reason = if std::thread::panicking() {
                format!("rank {} crashed", self.rank)
            } else {
                format!("rank {} left the group", self.rank)
            };
            debug!(rank = self.rank, %reason, "worker handle dropped");
            round.aborted = Some(reason);
        }
        self.shared.ready.notify_all();
    }
}
