//! Per-worker training loop.
//!
//! Each worker owns its model replica and optimizer and trains on its own
//! shard. After every epoch it meets the other replicas through a
//! [`ReportSink`]: parameters are averaged, evaluation is merged into
//! trial-level [`EpochMetrics`], and a [`WorkerReport`] is answered with a
//! [`Decision`].

use candle_core::Device;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use tagtune_core::{ConfusionMatrix, Shard, TrainingConfig};
use tracing::{debug, info, instrument, warn};

use crate::checkpoint::{CheckpointCoordinator, CheckpointMetrics, CheckpointRef, CheckpointStore};
use crate::error::{Result, TrainError};
use crate::loss::{masked_cross_entropy, predictions};
use crate::model::{ModelFactory, TokenClassifier};
use crate::replica::{head_parameters, load_head_parameters, HeadParameters};
use crate::scheduler::LinearSchedule;

/// Where a worker is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Initializing,
    Training(usize),
    Evaluating(usize),
    Reporting(usize),
    Terminated,
}

/// Answer to an epoch report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Continue,
    Stop,
}

/// Loss and confusion matrices of one epoch, for one worker or merged over
/// all of them.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub loss: f64,
    pub train_matrix: Option<ConfusionMatrix>,
    pub val_matrix: Option<ConfusionMatrix>,
}

impl EpochMetrics {
    pub fn train_accuracy(&self) -> Option<f64> {
        self.train_matrix.as_ref().map(ConfusionMatrix::accuracy)
    }

    pub fn val_accuracy(&self) -> Option<f64> {
        self.val_matrix.as_ref().map(ConfusionMatrix::accuracy)
    }

    /// Mean loss and summed matrices. Accuracy of the sum is the accuracy
    /// over every worker's tokens, not a mean of per-worker accuracies.
    pub fn merge<'a>(parts: impl IntoIterator<Item = &'a EpochMetrics>) -> EpochMetrics {
        let parts: Vec<&EpochMetrics> = parts.into_iter().collect();
        let sum = |pick: fn(&EpochMetrics) -> Option<&ConfusionMatrix>| {
            let matrices: Vec<ConfusionMatrix> =
                parts.iter().filter_map(|p| pick(p).copied()).collect();
            (!matrices.is_empty()).then(|| matrices.into_iter().sum::<ConfusionMatrix>())
        };
        EpochMetrics {
            epoch: parts.first().map_or(0, |p| p.epoch),
            loss: parts.iter().map(|p| p.loss).sum::<f64>() / parts.len().max(1) as f64,
            train_matrix: sum(|p| p.train_matrix.as_ref()),
            val_matrix: sum(|p| p.val_matrix.as_ref()),
        }
    }
}

/// What one worker observed during one epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerReport {
    pub worker: usize,
    pub epoch: usize,
    /// Mean batch loss of the epoch.
    pub loss: f64,
    /// Present on evaluation epochs.
    pub train_matrix: Option<ConfusionMatrix>,
    pub val_matrix: Option<ConfusionMatrix>,
    /// Present when this worker wrote a checkpoint for the epoch; its
    /// metrics are the merged ones.
    pub checkpoint: Option<CheckpointRef>,
}

impl WorkerReport {
    /// This worker's share of the epoch.
    pub fn metrics(&self) -> EpochMetrics {
        EpochMetrics {
            epoch: self.epoch,
            loss: self.loss,
            train_matrix: self.train_matrix,
            val_matrix: self.val_matrix,
        }
    }

    pub fn train_accuracy(&self) -> Option<f64> {
        self.train_matrix.as_ref().map(ConfusionMatrix::accuracy)
    }

    pub fn val_accuracy(&self) -> Option<f64> {
        self.val_matrix.as_ref().map(ConfusionMatrix::accuracy)
    }
}

/// The worker's view of the other replicas. Called from the worker thread,
/// every method may block until all replicas arrive.
///
/// The defaults describe a lone worker: its parameters and metrics are
/// already the trial's.
pub trait ReportSink {
    /// Exchange head parameters and return their average over replicas.
    fn synchronize(&mut self, _epoch: usize, params: HeadParameters) -> Result<HeadParameters> {
        Ok(params)
    }

    /// Merge this worker's epoch metrics with the other replicas'.
    fn gather(&mut self, local: EpochMetrics) -> Result<EpochMetrics> {
        Ok(local)
    }

    /// Publish the epoch and wait for the decision.
    fn report(&mut self, report: WorkerReport) -> Result<Decision>;
}

/// Collects reports and always continues.
impl ReportSink for Vec<WorkerReport> {
    fn report(&mut self, report: WorkerReport) -> Result<Decision> {
        self.push(report);
        Ok(Decision::Continue)
    }
}

/// Outcome of a finished worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSummary {
    pub worker: usize,
    pub epochs_completed: usize,
    pub last_loss: Option<f64>,
    pub stopped_early: bool,
}

/// Inputs handed to one worker.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub rank: usize,
    pub is_checkpoint_owner: bool,
    pub train: Option<Shard>,
    pub val: Option<Shard>,
}

impl WorkerContext {
    pub fn new(rank: usize, train: Shard, val: Shard) -> Self {
        Self {
            rank,
            is_checkpoint_owner: rank == 0,
            train: Some(train),
            val: Some(val),
        }
    }
}

/// Training state machine of one worker.
pub struct TrainingLoop<M> {
    config: TrainingConfig,
    rank: usize,
    train: Shard,
    val: Shard,
    model: M,
    optimizer: AdamW,
    schedule: LinearSchedule,
    checkpoints: CheckpointCoordinator,
    device: Device,
    state: LoopState,
    step: usize,
}

impl<M: TokenClassifier> TrainingLoop<M> {
    /// Validate the context and build model and optimizer. Checkpoints go
    /// to `store` when the context owns checkpointing.
    pub fn new<F>(
        config: TrainingConfig,
        context: WorkerContext,
        factory: &F,
        store: CheckpointStore,
        device: Device,
    ) -> Result<Self>
    where
        F: ModelFactory<Model = M>,
    {
        let rank = context.rank;
        let train = context.train.ok_or(TrainError::MissingShard {
            worker: rank,
            split: "train",
        })?;
        let val = context.val.ok_or(TrainError::MissingShard {
            worker: rank,
            split: "validation",
        })?;
        config.validate()?;
        let checkpoints = CheckpointCoordinator::new(
            store,
            context.is_checkpoint_owner,
            config.checkpoint_frequency,
        );

        let model = factory.build(&config, &device)?;
        let params = ParamsAdamW {
            lr: config.learning_rate,
            weight_decay: config.weight_decay,
            ..ParamsAdamW::default()
        };
        let optimizer = AdamW::new(model.trainable().all_vars(), params)?;

        let steps_per_epoch = train.batch_plan(config.batch_size)?.len();
        let schedule = LinearSchedule::from_ratio(
            config.learning_rate,
            config.warmup_ratio,
            steps_per_epoch * config.num_epochs,
        );

        debug!(
            worker = rank,
            train = train.len(),
            val = val.len(),
            steps_per_epoch,
            owner = checkpoints.is_owner(),
            "worker initialized"
        );
        Ok(Self {
            config,
            rank,
            train,
            val,
            model,
            optimizer,
            schedule,
            checkpoints,
            device,
            state: LoopState::Initializing,
            step: 0,
        })
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Train for `num_epochs` epochs or until the sink says stop.
    #[instrument(skip_all, fields(worker = self.rank))]
    pub fn run<S: ReportSink>(&mut self, sink: &mut S) -> Result<WorkerSummary> {
        let mut summary = WorkerSummary {
            worker: self.rank,
            epochs_completed: 0,
            last_loss: None,
            stopped_early: false,
        };

        for epoch in 0..self.config.num_epochs {
            self.state = LoopState::Training(epoch);
            let loss = self.train_epoch(epoch)?;
            summary.epochs_completed = epoch + 1;
            summary.last_loss = Some(loss);

            let local = head_parameters(self.model.trainable())?;
            let averaged = sink.synchronize(epoch, local)?;
            load_head_parameters(self.model.trainable(), &averaged)?;

            let (train_matrix, val_matrix) = if self.config.is_checkpoint_epoch(epoch) {
                self.state = LoopState::Evaluating(epoch);
                (
                    Some(self.evaluate(&self.train)?),
                    Some(self.evaluate(&self.val)?),
                )
            } else {
                (None, None)
            };

            self.state = LoopState::Reporting(epoch);
            let report = WorkerReport {
                worker: self.rank,
                epoch,
                loss,
                train_matrix,
                val_matrix,
                checkpoint: None,
            };
            let merged = sink.gather(report.metrics())?;
            let report = WorkerReport {
                checkpoint: self.checkpoint(&merged)?,
                ..report
            };
            info!(
                epoch,
                loss,
                trial_loss = merged.loss,
                train_accuracy = ?merged.train_accuracy(),
                val_accuracy = ?merged.val_accuracy(),
                "epoch finished"
            );

            if sink.report(report)? == Decision::Stop {
                info!(epoch, "stopped by controller");
                summary.stopped_early = epoch + 1 < self.config.num_epochs;
                break;
            }
        }

        self.state = LoopState::Terminated;
        Ok(summary)
    }

    fn train_epoch(&mut self, epoch: usize) -> Result<f64> {
        let plan = self.train.batch_plan(self.config.batch_size)?;
        let order = self.batch_order(epoch, plan.len());

        let mut total = 0.0;
        for (step, &index) in order.iter().enumerate() {
            let batch = self.train.batch(plan[index].clone());
            let tensors = batch.to_tensors(&self.device)?;
            let logits = self.model.logits(&tensors.input_ids, &tensors.attention_mask)?;
            let loss = masked_cross_entropy(&logits, &tensors.labels)?;

            let value = f64::from(loss.to_scalar::<f32>()?);
            if !value.is_finite() {
                return Err(TrainError::NonFiniteLoss {
                    worker: self.rank,
                    epoch,
                    step,
                });
            }

            self.schedule.apply(&mut self.optimizer, self.step);
            self.optimizer.backward_step(&loss)?;
            self.step += 1;
            total += value;
            debug!(epoch, step, loss = value, "batch");
        }

        Ok(total / order.len().max(1) as f64)
    }

    /// Batch visiting order for `epoch`, seeded by run seed, rank and epoch.
    fn batch_order(&self, epoch: usize, num_batches: usize) -> Vec<usize> {
        let seed = self
            .config
            .seed
            .wrapping_mul(0x9E37_79B9_7F4A_7C15)
            .wrapping_add(((self.rank as u64) << 32) | epoch as u64);
        let mut rng = oorandom::Rand32::new(seed);
        let mut order: Vec<usize> = (0..num_batches).collect();
        for i in (1..order.len()).rev() {
            let j = rng.rand_range(0..(i as u32 + 1)) as usize;
            order.swap(i, j);
        }
        order
    }

    fn evaluate(&self, shard: &Shard) -> Result<ConfusionMatrix> {
        let mut matrix = ConfusionMatrix::new();
        for batch in shard.batches(self.config.batch_size)? {
            let tensors = batch.to_tensors(&self.device)?;
            let logits = self.model.logits(&tensors.input_ids, &tensors.attention_mask)?;
            matrix.observe_batch(batch.label_ids(), predictions(&logits)?);
        }
        Ok(matrix)
    }

    /// Persist the synchronized head with the merged metrics of the epoch.
    fn checkpoint(&self, merged: &EpochMetrics) -> Result<Option<CheckpointRef>> {
        let metrics = CheckpointMetrics {
            epoch: merged.epoch,
            loss: merged.loss,
            train_accuracy: merged.train_accuracy(),
            val_accuracy: merged.val_accuracy(),
        };
        match self
            .checkpoints
            .persist(merged.epoch, self.model.trainable(), &metrics)
        {
            Ok(checkpoint) => Ok(checkpoint),
            Err(e @ TrainError::Checkpoint { .. }) => {
                warn!(epoch = merged.epoch, error = %e, "checkpoint failed, continuing without it");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
