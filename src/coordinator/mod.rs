//! Execution coordinator.
//!
//! Drives every task through
//!
//! ```text
//! Enqueued -> (cache hit | Running) -> Finished
//! ```
//!
//! on a fixed pool of worker threads. Per task a worker pins container
//! images, computes the cache key, and on a miss provisions a workspace,
//! runs the steps, diffs the result and writes it to the cache. The
//! workspace is released on every path before the worker moves on.
//!
//! By default the first failure cancels the remaining tasks. With
//! `skip_errors` every task runs and failures are collected in the
//! [`RunReport`].

mod inflight;
mod status;

pub use inflight::{Claim, InFlight, LeaderGuard, Outcome};
pub use status::{StatusDelta, StatusRegistry, TaskPhase, TaskStatus};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cache::{CachedResult, ExecutionCache};
use crate::diff::{DiffStat, DiffTool};
use crate::docker::{ImageError, ImageResolver};
use crate::error::{ErrorKind, RunError, TaskError, TaskErrorInfo, TaskFailure, TaskFailures};
use crate::log::TaskLog;
use crate::runner::{StepContext, StepRunner};
use crate::signal::CancelToken;
use crate::task::{CacheKey, Patch, Task, TaskId};
use crate::timeout::TaskTimeout;
use crate::workspace::{Provisioner, Workspace, WorkspaceMode, WorkspaceStrategy};

/// Coordinator settings.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub parallelism: usize,
    pub timeout: TaskTimeout,
    pub keep_logs: bool,
    pub skip_errors: bool,
    pub workspace_mode: WorkspaceMode,
    pub log_dir: PathBuf,
}

/// Number of live workspaces, with the high-water mark.
#[derive(Debug, Default)]
pub struct ActiveGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ActiveGauge {
    pub fn enter(&self) -> GaugeGuard<'_> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        GaugeGuard { gauge: self }
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

pub struct GaugeGuard<'a> {
    gauge: &'a ActiveGauge,
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.gauge.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A produced patch with its statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchReport {
    pub task_id: TaskId,
    pub patch: Patch,
    pub stat: DiffStat,
    pub cached: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, Value>,
}

/// Outcome of a whole run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    /// Patches in task order. Tasks without changes produce none.
    pub patches: Vec<PatchReport>,
    pub statuses: Vec<TaskStatus>,
    pub failures: TaskFailures,
    pub peak_active_workspaces: usize,
}

impl RunReport {
    /// The aggregate error for the failures collected in a skip-errors run.
    pub fn aggregate_error(&self) -> Option<RunError> {
        if self.failures.is_empty() {
            None
        } else {
            Some(RunError::Tasks(self.failures.clone()))
        }
    }
}

/// What a finished task produced.
struct TaskOutcome {
    result: CachedResult,
    cached: bool,
}

pub struct Coordinator {
    config: CoordinatorConfig,
    cache: ExecutionCache,
    provisioner: Provisioner,
    runner: StepRunner,
    images: ImageResolver,
    diff: DiffTool,
    status: Arc<StatusRegistry>,
    inflight: InFlight,
    gauge: ActiveGauge,
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        cache: ExecutionCache,
        provisioner: Provisioner,
        runner: StepRunner,
        images: ImageResolver,
        diff: DiffTool,
    ) -> Self {
        Self {
            config,
            cache,
            provisioner,
            runner,
            images,
            diff,
            status: Arc::new(StatusRegistry::new()),
            inflight: InFlight::new(),
            gauge: ActiveGauge::default(),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Status registry; subscribe before calling [`Coordinator::run`].
    pub fn status(&self) -> Arc<StatusRegistry> {
        Arc::clone(&self.status)
    }

    pub fn cache(&self) -> &ExecutionCache {
        &self.cache
    }

    /// Run all tasks.
    ///
    /// Returns `Err(RunError::Cancelled)` when `cancel` fires, and
    /// `Err(RunError::Tasks)` on failure unless `skip_errors` is set, in
    /// which case failures are reported in [`RunReport::failures`].
    pub fn run(&self, tasks: Vec<Task>, cancel: &CancelToken) -> Result<RunReport, RunError> {
        for task in &tasks {
            if self.config.workspace_mode.strategy_for(task).is_none() {
                self.status.close();
                return Err(RunError::VolumeWithHostSteps {
                    repository: task.repository.to_string(),
                });
            }
        }
        for task in &tasks {
            self.status.enqueue(task);
        }

        let run_id = uuid::Uuid::new_v4().to_string();
        let workers = self.config.parallelism.max(1).min(tasks.len().max(1));
        info!(%run_id, tasks = tasks.len(), workers, "starting run");

        let abort = cancel.child();
        let (tx, rx) = crossbeam_channel::unbounded::<Task>();
        for task in tasks {
            // the receiver outlives this loop
            let _ = tx.send(task);
        }
        drop(tx);

        let patches = Mutex::new(Vec::new());
        let failures = Mutex::new(Vec::new());

        let panicked = thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    let rx = rx.clone();
                    let abort = &abort;
                    let patches = &patches;
                    let failures = &failures;
                    scope.spawn(move || {
                        while let Ok(task) = rx.recv() {
                            if abort.is_cancelled() {
                                break;
                            }
                            match self.execute(&task, abort) {
                                Ok(outcome) => {
                                    if let Some(patch) = outcome.result.patch.clone() {
                                        if let Ok(mut patches) = patches.lock() {
                                            patches.push(PatchReport {
                                                task_id: task.id,
                                                stat: DiffStat::from_patch(&patch.diff),
                                                patch,
                                                cached: outcome.cached,
                                                outputs: outcome.result.outputs,
                                            });
                                        }
                                    }
                                }
                                Err(e) => {
                                    let induced = e.kind() == ErrorKind::Cancelled && abort.is_cancelled();
                                    if !induced {
                                        warn!(repository = %task.repository, error = %e, "task failed");
                                        let log_file = self
                                            .status
                                            .get(task.id)
                                            .and_then(|s| s.log_file)
                                            .map(|p| p.display().to_string());
                                        if let Ok(mut failures) = failures.lock() {
                                            failures.push((
                                                task.id,
                                                TaskFailure {
                                                    repository: task.repository.clone(),
                                                    error: TaskErrorInfo::from(&e),
                                                    log_file,
                                                },
                                            ));
                                        }
                                        if !self.config.skip_errors {
                                            abort.cancel();
                                        }
                                    }
                                }
                            }
                        }
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join())
                .filter(Result::is_err)
                .count()
                > 0
        });

        self.status.close();
        if panicked {
            return Err(RunError::WorkerPanicked);
        }
        if cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }

        let mut patches = patches.into_inner().unwrap_or_default();
        patches.sort_by_key(|p| p.task_id);
        let mut failures = failures.into_inner().unwrap_or_default();
        failures.sort_by_key(|(id, _)| *id);
        let failures = TaskFailures(failures.into_iter().map(|(_, f)| f).collect());

        info!(
            %run_id,
            patches = patches.len(),
            failures = failures.len(),
            peak_workspaces = self.gauge.peak(),
            "run finished"
        );

        if !failures.is_empty() && !self.config.skip_errors {
            return Err(RunError::Tasks(failures));
        }

        Ok(RunReport {
            run_id,
            patches,
            statuses: self.status.snapshot(),
            failures,
            peak_active_workspaces: self.gauge.peak(),
        })
    }

    /// Run one task and publish its final status.
    fn execute(&self, task: &Task, cancel: &CancelToken) -> Result<TaskOutcome, TaskError> {
        let result = self.execute_inner(task, cancel);

        let mut delta = StatusDelta {
            finished_at: Some(Utc::now()),
            ..StatusDelta::default()
        };
        match &result {
            Ok(outcome) => {
                delta.cached = outcome.cached;
                if let Some(patch) = &outcome.result.patch {
                    delta.diff_stat = Some(DiffStat::from_patch(&patch.diff));
                    delta.patch = Some(patch.clone());
                }
                info!(repository = %task.repository, cached = outcome.cached, "task finished");
            }
            Err(e) => delta.error = Some(TaskErrorInfo::from(e)),
        }
        self.status.update(task.id, delta);
        result
    }

    fn execute_inner(&self, task: &Task, cancel: &CancelToken) -> Result<TaskOutcome, TaskError> {
        let mut steps = task.steps.clone();
        self.images
            .pin(&mut steps, Some(cancel))
            .map_err(|(step, e)| match e {
                ImageError::Cancelled => TaskError::Cancelled,
                ImageError::Failed(message) => TaskError::Image { step, message },
            })?;

        let key = CacheKey::compute(&task.repository, &steps)?;
        self.status.update(
            task.id,
            StatusDelta {
                cache_key: Some(key.to_string()),
                ..StatusDelta::default()
            },
        );

        if let Some(result) = self.cache.get(&key)? {
            debug!(repository = %task.repository, key = %key, "using cached result");
            return Ok(TaskOutcome {
                result,
                cached: true,
            });
        }

        let guard = match self.inflight.claim(&key) {
            Claim::Leader(guard) => guard,
            Claim::Follower(outcome) => {
                debug!(repository = %task.repository, key = %key, "reusing result of identical task");
                return match outcome {
                    Ok(result) => Ok(TaskOutcome {
                        result,
                        cached: true,
                    }),
                    Err(info) if info.kind == ErrorKind::Cancelled => Err(TaskError::Cancelled),
                    Err(info) => Err(TaskError::DuplicateOf {
                        key: key.to_string(),
                        reason: info.message,
                    }),
                };
            }
        };

        let result = self.execute_miss(task, &steps, &key, cancel);
        guard.complete(match &result {
            Ok(result) => Ok(result.clone()),
            Err(e) => Err(TaskErrorInfo::from(e)),
        });
        result.map(|result| TaskOutcome {
            result,
            cached: false,
        })
    }

    fn execute_miss(
        &self,
        task: &Task,
        steps: &[step_spec::Step],
        key: &CacheKey,
        cancel: &CancelToken,
    ) -> Result<CachedResult, TaskError> {
        if cancel.is_cancelled() {
            return Err(TaskError::Cancelled);
        }
        self.status.update(
            task.id,
            StatusDelta {
                started_at: Some(Utc::now()),
                step_count: steps.len(),
                ..StatusDelta::default()
            },
        );
        info!(repository = %task.repository, "task started");

        let strategy = self
            .config
            .workspace_mode
            .strategy_for(task)
            .unwrap_or(WorkspaceStrategy::Bind);

        let _active = self.gauge.enter();
        let mut workspace = self
            .provisioner
            .provision(&task.repository, strategy, Some(cancel))?;

        let log = TaskLog::create(&self.config.log_dir, &task.repository.name, self.config.keep_logs)
            .map_err(TaskError::Log)?;
        let log = Arc::new(log);

        let result = self.run_and_diff(task, steps, &workspace, &log, cancel);
        workspace.cleanup();

        let log_file = match Arc::try_unwrap(log) {
            Ok(log) => log.close(),
            Err(shared) => shared.is_kept().then(|| shared.path().to_path_buf()),
        };
        if log_file.is_some() {
            self.status.update(
                task.id,
                StatusDelta {
                    log_file: log_file.clone(),
                    ..StatusDelta::default()
                },
            );
        }

        let result = result?;
        let materialized = workspace.repository();
        let write_key = if materialized.rev != task.repository.rev {
            warn!(
                repository = %task.repository.name,
                requested = %task.repository.rev,
                materialized = %materialized.rev,
                "revision moved while fetching; caching under the materialized revision"
            );
            CacheKey::compute(materialized, steps)?
        } else {
            key.clone()
        };
        self.cache.set(&write_key, &result)?;
        Ok(result)
    }

    fn run_and_diff(
        &self,
        task: &Task,
        steps: &[step_spec::Step],
        workspace: &Workspace,
        log: &Arc<TaskLog>,
        cancel: &CancelToken,
    ) -> Result<CachedResult, TaskError> {
        let deadline = self.config.timeout.start();
        let status = Arc::clone(&self.status);
        let id = task.id;
        let on_step: &(dyn Fn(usize) + Sync) = &move |index: usize| {
            status.update(
                id,
                StatusDelta {
                    current_step: index + 1,
                    ..StatusDelta::default()
                },
            );
        };
        let ctx = StepContext {
            workspace,
            log: Arc::clone(log),
            deadline: &deadline,
            cancel,
            on_step: Some(on_step),
        };

        let outputs = match self.runner.run_steps(steps, &ctx) {
            Ok(outputs) => outputs,
            Err(e) => {
                if self.config.keep_logs {
                    self.append_partial_diff(workspace, log, cancel);
                }
                return Err(e.into());
            }
        };

        let mutated = workspace.snapshot_dir(Some(cancel))?;
        let diff = self.diff.diff(workspace.pristine(), &mutated, Some(cancel))?;
        let patch = (!diff.is_empty()).then(|| Patch {
            repository: workspace.repository().clone(),
            base_revision: workspace.repository().rev.clone(),
            diff,
        });
        Ok(CachedResult { patch, outputs })
    }

    /// Best effort: record what the failed steps changed so far.
    fn append_partial_diff(&self, workspace: &Workspace, log: &TaskLog, cancel: &CancelToken) {
        let partial = workspace
            .snapshot_dir(Some(cancel))
            .map_err(|e| e.to_string())
            .and_then(|dir| {
                self.diff
                    .diff(workspace.pristine(), &dir, Some(cancel))
                    .map_err(|e| e.to_string())
            });
        match partial {
            Ok(diff) if diff.is_empty() => log.line("diff", "no changes before failure"),
            Ok(diff) => {
                log.line("diff", "changes before failure:");
                log.block(&diff);
            }
            Err(e) => warn!(error = %e, "could not compute partial diff"),
        }
    }
}
