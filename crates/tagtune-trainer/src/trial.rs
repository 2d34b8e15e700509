//! # Trial Runner
//!
//! Runs one training configuration on all workers. Each worker trains its
//! replica on a blocking thread and meets the others through the runner
//! three times per epoch:
//!
//! 1. **sync**: head parameters are averaged and sent back, so every
//!    replica evaluates the same weights;
//! 2. **gather**: evaluation is merged into trial-level metrics, which the
//!    checkpoint owner writes next to the weights;
//! 3. **commit**: the merged [`TrialReport`] goes to the [`TrialObserver`]
//!    and its [`Decision`] goes back to every worker.
//!
//! A step completes once every live worker has arrived at it.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::Device;
use serde::{Deserialize, Serialize};
use tagtune_core::{ShardedCorpus, TrainingConfig};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

use crate::checkpoint::{CheckpointRef, CheckpointStore};
use crate::error::{Result, TrainError};
use crate::model::ModelFactory;
use crate::replica::{average_parameters, HeadParameters};
use crate::trainer::{
    Decision, EpochMetrics, ReportSink, TrainingLoop, WorkerContext, WorkerReport, WorkerSummary,
};

/// Directory of trial `id` under `output_dir`.
pub fn trial_dir(output_dir: &Path, id: usize) -> PathBuf {
    output_dir.join(format!("trial-{id:04}"))
}

/// Epoch result of a whole trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialReport {
    pub trial_id: usize,
    pub epoch: usize,
    /// Mean of the workers' epoch losses.
    pub loss: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub train_accuracy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub val_accuracy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<CheckpointRef>,
}

/// Decides after every epoch whether a trial continues.
pub trait TrialObserver: Send {
    fn observe(&mut self, report: TrialReport) -> impl Future<Output = Result<Decision>> + Send;
}

/// Lets every trial run to the end.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl TrialObserver for NoopObserver {
    fn observe(&mut self, _report: TrialReport) -> impl Future<Output = Result<Decision>> + Send {
        async { Ok(Decision::Continue) }
    }
}

/// Result of a trial that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialOutcome {
    pub trial_id: usize,
    pub reports: Vec<TrialReport>,
    pub final_checkpoint: Option<CheckpointRef>,
    pub stopped_early: bool,
    pub workers: Vec<WorkerSummary>,
}

impl TrialOutcome {
    pub fn best_val_accuracy(&self) -> Option<f64> {
        self.reports
            .iter()
            .filter_map(|r| r.val_accuracy)
            .fold(None, |best, acc| Some(best.map_or(acc, |b: f64| b.max(acc))))
    }
}

enum WorkerEvent {
    Sync {
        rank: usize,
        epoch: usize,
        params: HeadParameters,
        reply: oneshot::Sender<HeadParameters>,
    },
    Gather {
        rank: usize,
        metrics: EpochMetrics,
        reply: oneshot::Sender<EpochMetrics>,
    },
    Commit {
        report: WorkerReport,
        reply: oneshot::Sender<Decision>,
    },
    Exited {
        rank: usize,
        outcome: Result<WorkerSummary>,
    },
}

/// Forwards a worker's side of each step to the trial runner and waits for
/// the answer.
struct ChannelSink {
    rank: usize,
    events: mpsc::Sender<WorkerEvent>,
}

impl ChannelSink {
    fn exchange<R>(&self, event: impl FnOnce(oneshot::Sender<R>) -> WorkerEvent) -> Result<R> {
        let (reply, answer) = oneshot::channel();
        self.events
            .blocking_send(event(reply))
            .map_err(|_| TrainError::Channel("trial runner stopped".into()))?;
        answer
            .blocking_recv()
            .map_err(|_| TrainError::Channel("trial runner dropped the reply".into()))
    }
}

impl ReportSink for ChannelSink {
    fn synchronize(&mut self, epoch: usize, params: HeadParameters) -> Result<HeadParameters> {
        let rank = self.rank;
        self.exchange(|reply| WorkerEvent::Sync {
            rank,
            epoch,
            params,
            reply,
        })
    }

    fn gather(&mut self, metrics: EpochMetrics) -> Result<EpochMetrics> {
        let rank = self.rank;
        self.exchange(|reply| WorkerEvent::Gather {
            rank,
            metrics,
            reply,
        })
    }

    fn report(&mut self, report: WorkerReport) -> Result<Decision> {
        self.exchange(|reply| WorkerEvent::Commit { report, reply })
    }
}

/// A worker waiting at a step, with the value it brought.
struct Arrival<T, R> {
    rank: usize,
    value: T,
    reply: oneshot::Sender<R>,
}

/// Workers waiting at one kind of step, by epoch.
struct Rendezvous<T, R> {
    waiting: BTreeMap<usize, Vec<Arrival<T, R>>>,
}

impl<T, R> Rendezvous<T, R> {
    fn new() -> Self {
        Self {
            waiting: BTreeMap::new(),
        }
    }

    fn arrive(&mut self, epoch: usize, rank: usize, value: T, reply: oneshot::Sender<R>) {
        self.waiting.entry(epoch).or_default().push(Arrival { rank, value, reply });
    }

    /// Remove the lowest epoch every live worker has reached, by rank.
    fn next_complete(&mut self, live: &BTreeSet<usize>) -> Option<(usize, Vec<Arrival<T, R>>)> {
        let (&epoch, waiting) = self.waiting.first_key_value()?;
        let complete = live.iter().all(|rank| waiting.iter().any(|a| a.rank == *rank));
        if !complete || waiting.is_empty() {
            return None;
        }
        let mut ready = self.waiting.remove(&epoch)?;
        ready.sort_by_key(|a| a.rank);
        Some((epoch, ready))
    }

    /// Remove every waiting worker.
    fn drain(&mut self) -> Vec<Arrival<T, R>> {
        std::mem::take(&mut self.waiting)
            .into_values()
            .flatten()
            .collect()
    }
}

/// Run one trial on `data.num_workers()` workers.
#[instrument(skip_all, fields(trial = trial_id))]
pub async fn run_trial<F, O>(
    trial_id: usize,
    config: TrainingConfig,
    data: &ShardedCorpus,
    factory: Arc<F>,
    trial_root: PathBuf,
    observer: &mut O,
) -> Result<TrialOutcome>
where
    F: ModelFactory,
    O: TrialObserver,
{
    config.validate()?;
    let num_workers = data.num_workers();
    info!(
        workers = num_workers,
        epochs = config.num_epochs,
        learning_rate = config.learning_rate,
        batch_size = config.batch_size,
        "starting trial"
    );

    let (events, mut inbox) = mpsc::channel(num_workers * 2);
    let handles: Vec<JoinHandle<()>> = (0..num_workers)
        .map(|rank| {
            let context = WorkerContext {
                rank,
                is_checkpoint_owner: rank == 0,
                train: data.train.shard(rank).ok(),
                val: data.validation.shard(rank).ok(),
            };
            spawn_worker(
                context,
                config.clone(),
                Arc::clone(&factory),
                CheckpointStore::new(&trial_root),
                events.clone(),
            )
        })
        .collect();
    drop(events);

    let mut live: BTreeSet<usize> = (0..num_workers).collect();
    let mut syncs = Rendezvous::<HeadParameters, HeadParameters>::new();
    let mut gathers = Rendezvous::<EpochMetrics, EpochMetrics>::new();
    let mut commits = Rendezvous::<WorkerReport, Decision>::new();
    let mut merged: BTreeMap<usize, EpochMetrics> = BTreeMap::new();
    let mut reports = Vec::new();
    let mut summaries = Vec::new();
    let mut final_checkpoint = None;
    let mut stopped = false;
    let mut failure: Option<TrainError> = None;

    while let Some(event) = inbox.recv().await {
        // Once the trial is over, sync and gather replies are dropped, which
        // ends the waiting worker with a channel error.
        let closed = stopped || failure.is_some();
        match event {
            WorkerEvent::Sync {
                rank,
                epoch,
                params,
                reply,
            } => {
                if !closed {
                    syncs.arrive(epoch, rank, params, reply);
                }
            }
            WorkerEvent::Gather {
                rank,
                metrics,
                reply,
            } => {
                if !closed {
                    gathers.arrive(metrics.epoch, rank, metrics, reply);
                }
            }
            WorkerEvent::Commit { report, reply } => {
                if closed {
                    let _ = reply.send(Decision::Stop);
                } else {
                    commits.arrive(report.epoch, report.worker, report, reply);
                }
            }
            WorkerEvent::Exited { rank, outcome } => {
                live.remove(&rank);
                match outcome {
                    Ok(summary) => summaries.push(summary),
                    Err(e) => {
                        error!(worker = rank, error = %e, "worker failed");
                        failure.get_or_insert(e);
                    }
                }
            }
        }

        if failure.is_some() {
            syncs.drain();
            gathers.drain();
            for waiting in commits.drain() {
                let _ = waiting.reply.send(Decision::Stop);
            }
            continue;
        }

        while let Some((epoch, ready)) = syncs.next_complete(&live) {
            let replicas: Vec<&HeadParameters> = ready.iter().map(|a| &a.value).collect();
            match average_parameters(&replicas) {
                Ok(averaged) => {
                    debug!(epoch, replicas = ready.len(), "parameters averaged");
                    for waiting in ready {
                        let _ = waiting.reply.send(averaged.clone());
                    }
                }
                Err(e) => {
                    error!(epoch, error = %e, "parameter averaging failed");
                    failure.get_or_insert(e);
                }
            }
        }

        while let Some((epoch, ready)) = gathers.next_complete(&live) {
            let metrics = EpochMetrics::merge(ready.iter().map(|a| &a.value));
            merged.insert(epoch, metrics.clone());
            for waiting in ready {
                let _ = waiting.reply.send(metrics.clone());
            }
        }

        while let Some((epoch, ready)) = commits.next_complete(&live) {
            let metrics = merged.remove(&epoch).unwrap_or_else(|| {
                let parts: Vec<EpochMetrics> = ready.iter().map(|a| a.value.metrics()).collect();
                EpochMetrics::merge(&parts)
            });
            let checkpoint = ready.iter().find_map(|a| a.value.checkpoint.clone());
            let report = trial_report(trial_id, &metrics, checkpoint);
            debug!(epoch, loss = report.loss, "epoch rendezvous");
            if report.checkpoint.is_some() {
                final_checkpoint = report.checkpoint.clone();
            }
            reports.push(report.clone());

            let decision = match observer.observe(report).await {
                Ok(decision) => decision,
                Err(e) => {
                    failure.get_or_insert(e);
                    Decision::Stop
                }
            };
            if decision == Decision::Stop {
                stopped = true;
            }
            for waiting in ready {
                let _ = waiting.reply.send(decision);
            }
        }
    }

    for (rank, handle) in handles.into_iter().enumerate() {
        if let Err(e) = handle.await {
            failure.get_or_insert(TrainError::WorkerAborted {
                worker: rank,
                reason: e.to_string(),
            });
        }
    }

    if let Some(e) = failure {
        error!(error = %e, "trial failed");
        return Err(e);
    }

    summaries.sort_by_key(|s| s.worker);
    info!(
        epochs = reports.len(),
        stopped_early = stopped,
        checkpoint = ?final_checkpoint.as_ref().map(|c| &c.path),
        "trial finished"
    );
    Ok(TrialOutcome {
        trial_id,
        reports,
        final_checkpoint,
        stopped_early: stopped,
        workers: summaries,
    })
}

/// Train one configuration to the end, without a controller.
pub async fn run_training<F: ModelFactory>(
    config: TrainingConfig,
    data: &ShardedCorpus,
    factory: Arc<F>,
    output_dir: &Path,
) -> Result<TrialOutcome> {
    run_trial(
        0,
        config,
        data,
        factory,
        trial_dir(output_dir, 0),
        &mut NoopObserver,
    )
    .await
}

fn spawn_worker<F: ModelFactory>(
    context: WorkerContext,
    config: TrainingConfig,
    factory: Arc<F>,
    store: CheckpointStore,
    events: mpsc::Sender<WorkerEvent>,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let rank = context.rank;
        let mut sink = ChannelSink {
            rank,
            events: events.clone(),
        };
        let outcome = TrainingLoop::new(config, context, factory.as_ref(), store, Device::Cpu)
            .and_then(|mut training| training.run(&mut sink));
        let _ = events.blocking_send(WorkerEvent::Exited { rank, outcome });
    })
}

/// Trial-level report of one epoch. The checkpoint comes from the owner.
fn trial_report(
    trial_id: usize,
    metrics: &EpochMetrics,
    checkpoint: Option<CheckpointRef>,
) -> TrialReport {
    TrialReport {
        trial_id,
        epoch: metrics.epoch,
        loss: metrics.loss,
        train_accuracy: metrics.train_accuracy(),
        val_accuracy: metrics.val_accuracy(),
        checkpoint,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EmbeddingFactory;
    use crate::trainer::tests::toy_examples;
    use tagtune_core::{ConfusionMatrix, ShardedDataset};

    fn corpus(train: usize, val: usize, workers: usize) -> ShardedCorpus {
        ShardedCorpus {
            train: ShardedDataset::new(toy_examples(train), workers).unwrap(),
            validation: ShardedDataset::new(toy_examples(val), workers).unwrap(),
        }
    }

    fn config(workers: usize) -> TrainingConfig {
        TrainingConfig::default()
            .with_epochs(3)
            .with_batch_size(2)
            .with_learning_rate(0.05)
            .with_max_length(6)
            .with_workers(workers)
    }

    fn metrics(loss: f64, val: [[u64; 3]; 3]) -> EpochMetrics {
        EpochMetrics {
            epoch: 0,
            loss,
            train_matrix: None,
            val_matrix: Some(ConfusionMatrix::from_counts(val)),
        }
    }

    #[test]
    fn test_merge_uses_summed_matrices() {
        let parts = [
            metrics(1.0, [[1, 0, 0], [0, 0, 0], [0, 0, 0]]),
            metrics(3.0, [[0, 1, 0], [0, 0, 1], [0, 0, 1]]),
        ];
        let checkpoint = CheckpointRef {
            epoch: 0,
            path: PathBuf::from("trial-0000/epoch-000000"),
        };
        let merged = trial_report(7, &EpochMetrics::merge(&parts), Some(checkpoint));
        assert_eq!(merged.trial_id, 7);
        assert_eq!(merged.loss, 2.0);
        // 2 correct out of 4, not the mean of 1.0 and 1/3.
        assert_eq!(merged.val_accuracy, Some(0.5));
        assert_eq!(merged.train_accuracy, None);
        assert!(merged.checkpoint.is_some());
    }

    #[test]
    fn test_rendezvous_waits_for_live_workers() {
        let mut steps = Rendezvous::<f64, f64>::new();
        let live: BTreeSet<usize> = [0, 1].into();
        let (a, _ra) = oneshot::channel();
        let (b, _rb) = oneshot::channel();
        let (c, _rc) = oneshot::channel();

        steps.arrive(0, 1, 1.0, a);
        assert!(steps.next_complete(&live).is_none());
        steps.arrive(1, 1, 2.0, b);
        steps.arrive(0, 0, 0.5, c);

        let (epoch, ready) = steps.next_complete(&live).unwrap();
        assert_eq!(epoch, 0);
        assert_eq!(ready.iter().map(|w| w.rank).collect::<Vec<_>>(), vec![0, 1]);
        assert!(steps.next_complete(&live).is_none());

        // Worker 0 left: epoch 1 only needs worker 1.
        let (epoch, _) = steps.next_complete(&[1].into()).unwrap();
        assert_eq!(epoch, 1);
        assert!(steps.drain().is_empty());
    }

    #[test]
    fn test_trial_report_json_skips_missing_fields() {
        let report = TrialReport {
            trial_id: 1,
            epoch: 2,
            loss: 0.25,
            train_accuracy: None,
            val_accuracy: Some(0.9),
            checkpoint: None,
        };
        let json = serde_json::to_string(&report).unwrap();
        assert_eq!(json, r#"{"trial_id":1,"epoch":2,"loss":0.25,"val_accuracy":0.9}"#);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_multi_worker_trial() {
        let dir = tempfile::tempdir().unwrap();
        let data = corpus(9, 6, 3);
        let outcome = run_training(
            config(3),
            &data,
            Arc::new(EmbeddingFactory::new(10, 8)),
            dir.path(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.reports.len(), 3);
        assert_eq!(outcome.workers.len(), 3);
        assert!(!outcome.stopped_early);
        assert!(outcome.best_val_accuracy().is_some());

        // Only the owner writes, once per epoch.
        let store = CheckpointStore::new(trial_dir(dir.path(), 0));
        let epochs: Vec<usize> = store.history().unwrap().iter().map(|c| c.epoch).collect();
        assert_eq!(epochs, vec![0, 1, 2]);
        assert_eq!(outcome.final_checkpoint.unwrap().epoch, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_checkpoint_records_trial_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let data = corpus(9, 6, 3);
        let outcome = run_training(
            config(3).with_epochs(2),
            &data,
            Arc::new(EmbeddingFactory::new(10, 8)),
            dir.path(),
        )
        .await
        .unwrap();

        // JSON may round the last bit.
        let close = |a: f64, b: f64| (a - b).abs() < 1e-12;
        let store = CheckpointStore::new(trial_dir(dir.path(), 0));
        assert_eq!(outcome.reports.len(), 2);
        for report in &outcome.reports {
            let saved = store.at_epoch(report.epoch).unwrap().metrics().unwrap();
            assert_eq!(saved.epoch, report.epoch);
            assert!(close(saved.loss, report.loss));
            assert!(close(saved.val_accuracy.unwrap(), report.val_accuracy.unwrap()));
            assert!(close(saved.train_accuracy.unwrap(), report.train_accuracy.unwrap()));
        }
    }

    struct StopAt(usize);

    impl TrialObserver for StopAt {
        fn observe(&mut self, report: TrialReport) -> impl Future<Output = Result<Decision>> + Send {
            let stop = report.epoch >= self.0;
            async move { Ok(if stop { Decision::Stop } else { Decision::Continue }) }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_observer_stops_all_workers() {
        let dir = tempfile::tempdir().unwrap();
        let data = corpus(8, 4, 2);
        let outcome = run_trial(
            3,
            config(2).with_epochs(5),
            &data,
            Arc::new(EmbeddingFactory::new(10, 8)),
            trial_dir(dir.path(), 3),
            &mut StopAt(1),
        )
        .await
        .unwrap();

        assert!(outcome.stopped_early);
        assert_eq!(outcome.reports.len(), 2);
        assert!(outcome.workers.iter().all(|w| w.epochs_completed == 2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_missing_shard_fails_trial() {
        let dir = tempfile::tempdir().unwrap();
        // Two workers but a single validation example.
        let data = corpus(4, 1, 2);
        let err = run_training(
            config(2),
            &data,
            Arc::new(EmbeddingFactory::new(10, 8)),
            dir.path(),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            TrainError::MissingShard {
                worker: 1,
                split: "validation"
            }
        ));
    }
}
