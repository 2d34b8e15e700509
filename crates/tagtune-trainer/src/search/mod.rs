//! # Hyperparameter Search
//!
//! The [`SearchController`] samples configurations with a [`TpeSampler`],
//! runs up to `max_concurrent_trials` trials at once and prunes weak ones
//! with an [`AshaScheduler`]. Trials report through a single channel owned
//! by the controller; decisions go back over one-shot replies.

mod asha;
mod tpe;

pub use asha::AshaScheduler;
pub use tpe::TpeSampler;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tagtune_core::{
    apply_sample, SampledConfig, SearchConfig, SearchSpace, ShardedCorpus, TrainingConfig,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{error, info, instrument, warn};

use crate::checkpoint::CheckpointRef;
use crate::error::{Result, TrainError};
use crate::model::ModelFactory;
use crate::trainer::Decision;
use crate::trial::{run_trial, trial_dir, TrialObserver, TrialOutcome, TrialReport};

/// File written into the output directory when a search finishes.
pub const RESULTS_FILE: &str = "search_results.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    Running,
    Completed,
    Pruned,
    Failed,
}

/// One sampled configuration and everything it reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub id: usize,
    pub sample: SampledConfig,
    pub config: TrainingConfig,
    pub status: TrialStatus,
    pub trajectory: Vec<TrialReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_checkpoint: Option<CheckpointRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl Trial {
    fn new(id: usize, sample: SampledConfig, config: TrainingConfig) -> Self {
        Self {
            id,
            sample,
            config,
            status: TrialStatus::Running,
            trajectory: Vec::new(),
            final_checkpoint: None,
            failure: None,
        }
    }

    pub fn best_val_accuracy(&self) -> Option<f64> {
        self.trajectory
            .iter()
            .filter_map(|r| r.val_accuracy)
            .fold(None, |best, acc| Some(best.map_or(acc, |b: f64| b.max(acc))))
    }

    pub fn last_loss(&self) -> Option<f64> {
        self.trajectory.last().map(|r| r.loss)
    }

    fn fail(&mut self, reason: String) {
        self.status = TrialStatus::Failed;
        self.failure = Some(reason);
    }
}

/// The selected trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    pub trial_id: usize,
    pub config: TrainingConfig,
    pub final_checkpoint: Option<CheckpointRef>,
    pub best_val_accuracy: f64,
}

/// Best trial plus the full record of the search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub best: TrialResult,
    pub trials: Vec<Trial>,
}

impl SearchOutcome {
    pub fn write_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Highest best validation accuracy among trials that did not fail; ties
/// go to the lower trial id.
pub fn select_best(trials: &[Trial]) -> Option<TrialResult> {
    let mut best: Option<(&Trial, f64)> = None;
    for trial in trials.iter().filter(|t| t.status != TrialStatus::Failed) {
        let Some(acc) = trial.best_val_accuracy() else {
            continue;
        };
        let better = match best {
            None => true,
            Some((current, current_acc)) => {
                acc > current_acc || (acc == current_acc && trial.id < current.id)
            }
        };
        if better {
            best = Some((trial, acc));
        }
    }
    best.map(|(trial, acc)| TrialResult {
        trial_id: trial.id,
        config: trial.config.clone(),
        final_checkpoint: trial.final_checkpoint.clone(),
        best_val_accuracy: acc,
    })
}

struct ReportMessage {
    report: TrialReport,
    reply: oneshot::Sender<Decision>,
}

/// Observer handed to each trial: forwards reports to the controller.
struct ControllerLink {
    reports: mpsc::Sender<ReportMessage>,
}

impl TrialObserver for ControllerLink {
    fn observe(&mut self, report: TrialReport) -> impl Future<Output = Result<Decision>> + Send {
        let reports = self.reports.clone();
        async move {
            let (reply, answer) = oneshot::channel();
            reports
                .send(ReportMessage { report, reply })
                .await
                .map_err(|_| TrainError::Channel("search controller stopped".into()))?;
            answer.await.map_err(|_| {
                TrainError::Channel("search controller dropped the decision".into())
            })
        }
    }
}

/// Runs a hyperparameter search over prepared data.
pub struct SearchController<F> {
    settings: SearchConfig,
    space: SearchSpace,
    base: TrainingConfig,
    data: Arc<ShardedCorpus>,
    factory: Arc<F>,
    output_dir: PathBuf,
}

impl<F: ModelFactory> SearchController<F> {
    pub fn new(
        settings: SearchConfig,
        space: SearchSpace,
        base: TrainingConfig,
        data: Arc<ShardedCorpus>,
        factory: Arc<F>,
        output_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        settings.validate()?;
        space.validate()?;
        base.validate()?;
        Ok(Self {
            settings,
            space,
            base,
            data,
            factory,
            output_dir: output_dir.into(),
        })
    }

    /// Run every trial, select the best one and write [`RESULTS_FILE`].
    #[instrument(skip_all, fields(samples = self.settings.num_samples))]
    pub async fn run(self) -> Result<SearchOutcome> {
        let mut sampler = TpeSampler::new(self.space.clone(), &self.settings);
        let mut asha =
            AshaScheduler::new(self.settings.grace_period, self.settings.reduction_factor);
        let (reports_tx, mut reports) =
            mpsc::channel::<ReportMessage>(self.settings.max_concurrent_trials * 2);
        let mut running: JoinSet<(usize, Result<TrialOutcome>)> = JoinSet::new();
        let mut trials: Vec<Trial> = Vec::with_capacity(self.settings.num_samples);

        info!(
            concurrency = self.settings.max_concurrent_trials,
            dimensions = self.space.len(),
            "starting search"
        );

        loop {
            while running.len() < self.settings.max_concurrent_trials
                && trials.len() < self.settings.num_samples
            {
                let id = trials.len();
                let sample = sampler.suggest();
                let config = apply_sample(&self.base, &sample);
                let mut trial = Trial::new(id, sample.clone(), config.clone());

                if let Err(e) = config.validate() {
                    warn!(trial = id, error = %e, "sampled configuration is invalid");
                    trial.fail(e.to_string());
                    sampler.record_failed(sample);
                    trials.push(trial);
                    continue;
                }

                info!(trial = id, ?sample, "launching trial");
                trials.push(trial);
                let data = Arc::clone(&self.data);
                let factory = Arc::clone(&self.factory);
                let root = trial_dir(&self.output_dir, id);
                let mut link = ControllerLink {
                    reports: reports_tx.clone(),
                };
                running.spawn(async move {
                    let outcome = run_trial(id, config, &data, factory, root, &mut link).await;
                    (id, outcome)
                });
            }

            if running.is_empty() {
                break;
            }

            tokio::select! {
                Some(message) = reports.recv() => {
                    let ReportMessage { report, reply } = message;
                    let trial = &mut trials[report.trial_id];
                    let decision = asha.on_report(
                        trial.id,
                        report.epoch,
                        report.loss,
                        trial.config.num_epochs,
                    );
                    trial.trajectory.push(report);
                    let _ = reply.send(decision);
                }
                Some(joined) = running.join_next() => match joined {
                    Ok((id, Ok(outcome))) => {
                        let trial = &mut trials[id];
                        trial.final_checkpoint = outcome.final_checkpoint;
                        trial.status = if outcome.stopped_early {
                            TrialStatus::Pruned
                        } else {
                            TrialStatus::Completed
                        };
                        match trial.last_loss() {
                            Some(loss) => sampler.record(trial.sample.clone(), loss),
                            None => sampler.record_failed(trial.sample.clone()),
                        }
                        info!(
                            trial = id,
                            status = ?trial.status,
                            best_val_accuracy = ?trial.best_val_accuracy(),
                            "trial finished"
                        );
                    }
                    Ok((id, Err(e))) => {
                        error!(trial = id, error = %e, "trial failed");
                        let trial = &mut trials[id];
                        trial.fail(e.to_string());
                        sampler.record_failed(trial.sample.clone());
                    }
                    Err(e) => error!(error = %e, "trial task aborted"),
                },
            }
        }

        for trial in trials.iter_mut().filter(|t| t.status == TrialStatus::Running) {
            trial.fail("trial task aborted".into());
        }

        let best = select_best(&trials).ok_or(TrainError::NoViableTrial)?;
        info!(
            trial = best.trial_id,
            best_val_accuracy = best.best_val_accuracy,
            "search finished"
        );

        let outcome = SearchOutcome { best, trials };
        std::fs::create_dir_all(&self.output_dir)?;
        outcome.write_json(self.output_dir.join(RESULTS_FILE))?;
        Ok(outcome)
    }
}
