//! Recomputation scheduling
//!
//! The [`JobRegistry`] keeps one slot per job id so the same job never runs
//! twice at once. A slot goes `idle -> busy -> finished`; the finished report
//! is handed to exactly one caller, after which the slot is idle again.
//!
//! The [`Scheduler`] runs a batch of columns on a bounded rayon pool. Derived
//! columns that read other columns of the batch run in a later level, so
//! they always see fresh operands. Each column also holds a registry slot
//! while it runs; a column another batch is computing is skipped and listed
//! as busy.

use std::collections::{HashMap, HashSet};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::Result;
use crate::generic::GenericColumn;

/// Outcome of a batch of column computations
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecomputeReport {
    pub time_seconds: f64,
    /// Whether the job ran to completion
    pub done: bool,
    /// Columns that were written
    pub computed: Vec<String>,
    /// Columns that failed
    pub failed: Vec<String>,
    /// Columns skipped because another batch was computing them
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub busy: Vec<String>,
    /// Every failure, `; `-separated
    pub error: Option<String>,
}

impl RecomputeReport {
    /// At least one column succeeded, or there was nothing to do
    pub fn is_success(&self) -> bool {
        !self.computed.is_empty() || self.failed.is_empty()
    }
}

/// What a caller gets back when asking for a job
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    /// No such job is known
    Idle,
    /// The job is running; poll again later
    Busy { job: String, elapsed_seconds: f64 },
    /// The job finished; this is its one and only report
    Finished { job: String, report: RecomputeReport },
}

enum Slot {
    Busy { started: Instant },
    Finished(RecomputeReport),
}

/// Result of trying to claim a job slot
pub enum Claim {
    /// The caller owns the slot and must call [`JobRegistry::finish`]
    Started,
    /// Someone else holds the slot, or left a report behind
    Existing(JobStatus),
}

/// In-flight job slots keyed by job id
#[derive(Default)]
pub struct JobRegistry {
    slots: Mutex<HashMap<String, Slot>>,
    changed: Condvar,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        // A panicking worker cannot leave the map half-updated.
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim `job`, or return its current status without starting anything
    pub fn claim(&self, job: &str) -> Claim {
        let mut slots = self.lock();
        match slots.remove(job) {
            None => {
                slots.insert(job.to_string(), Slot::Busy { started: Instant::now() });
                Claim::Started
            }
            Some(Slot::Busy { started }) => {
                slots.insert(job.to_string(), Slot::Busy { started });
                Claim::Existing(JobStatus::Busy {
                    job: job.to_string(),
                    elapsed_seconds: started.elapsed().as_secs_f64(),
                })
            }
            Some(Slot::Finished(report)) => Claim::Existing(JobStatus::Finished {
                job: job.to_string(),
                report,
            }),
        }
    }

    pub fn finish(&self, job: &str, report: RecomputeReport) {
        self.lock().insert(job.to_string(), Slot::Finished(report));
        self.changed.notify_all();
    }

    /// Status without consuming a finished report
    pub fn peek(&self, job: &str) -> JobStatus {
        match self.lock().get(job) {
            None => JobStatus::Idle,
            Some(Slot::Busy { started }) => JobStatus::Busy {
                job: job.to_string(),
                elapsed_seconds: started.elapsed().as_secs_f64(),
            },
            Some(Slot::Finished(report)) => JobStatus::Finished {
                job: job.to_string(),
                report: report.clone(),
            },
        }
    }

    /// Status of `job`, handing out and clearing a finished report
    pub fn poll(&self, job: &str) -> JobStatus {
        let mut slots = self.lock();
        match slots.get(job) {
            Some(Slot::Finished(_)) => match slots.remove(job) {
                Some(Slot::Finished(report)) => JobStatus::Finished {
                    job: job.to_string(),
                    report,
                },
                _ => JobStatus::Idle,
            },
            Some(Slot::Busy { started }) => JobStatus::Busy {
                job: job.to_string(),
                elapsed_seconds: started.elapsed().as_secs_f64(),
            },
            None => JobStatus::Idle,
        }
    }

    /// Drop a slot without leaving a report behind
    pub fn release(&self, job: &str) {
        self.lock().remove(job);
        self.changed.notify_all();
    }

    /// Block until `job` finishes or `timeout` passes, then poll it
    pub fn wait(&self, job: &str, timeout: Duration) -> JobStatus {
        let deadline = Instant::now() + timeout;
        let mut slots = self.lock();
        while matches!(slots.get(job), Some(Slot::Busy { .. })) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            slots = match self.changed.wait_timeout(slots, deadline - now) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }
        drop(slots);
        self.poll(job)
    }
}

/// The work done for one column of a batch
pub trait ColumnTask: Sync {
    /// Compute and store `column`, for one event when `only` is set.
    /// Returns the number of rows written.
    fn run_column(&self, column: &GenericColumn, only: Option<i64>) -> Result<usize>;
}

/// Registry slot held while one column is being computed
pub fn column_slot(column: &GenericColumn) -> String {
    format!("col:{}.{}", column.entity, column.name)
}

/// Releases a column slot when the computation ends, panics included
struct SlotGuard<'a> {
    registry: &'a JobRegistry,
    slot: String,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.registry.release(&self.slot);
    }
}

pub struct Scheduler {
    pool: rayon::ThreadPool,
    registry: JobRegistry,
}

impl Scheduler {
    pub fn new(workers: usize) -> std::result::Result<Self, rayon::ThreadPoolBuildError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("feid-worker-{}", i))
            .build()?;
        Ok(Self {
            pool,
            registry: JobRegistry::new(),
        })
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Compute `columns` level by level, each level in parallel.
    ///
    /// A failing column is logged and reported; its siblings still run and
    /// its stored values stay as they were.
    pub fn run_batch(&self, task: &dyn ColumnTask, columns: &[GenericColumn], only: Option<i64>) -> RecomputeReport {
        let start = Instant::now();
        let mut report = RecomputeReport::default();
        let mut errors = Vec::new();

        for level in dependency_levels(columns) {
            let mut claimed = Vec::with_capacity(level.len());
            for column in level {
                let slot = column_slot(column);
                match self.registry.claim(&slot) {
                    Claim::Started => claimed.push((column, SlotGuard { registry: &self.registry, slot })),
                    Claim::Existing(_) => {
                        info!(column = %column.name, "column is being computed by another batch; skipped");
                        report.busy.push(column.name.clone());
                    }
                }
            }

            let results: Vec<(String, Result<usize>)> = self.pool.install(|| {
                claimed
                    .into_par_iter()
                    .map(|(c, _slot)| (c.name.clone(), task.run_column(c, only)))
                    .collect()
            });
            for (name, result) in results {
                match result {
                    Ok(_) => report.computed.push(name),
                    Err(e) => {
                        warn!(column = %name, error = %e, "column computation failed");
                        errors.push(format!("{}: {}", name, e));
                        report.failed.push(name);
                    }
                }
            }
        }

        report.time_seconds = start.elapsed().as_secs_f64();
        report.done = true;
        report.error = if errors.is_empty() { None } else { Some(errors.join("; ")) };
        info!(
            computed = report.computed.len(),
            failed = report.failed.len(),
            busy = report.busy.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "batch finished"
        );
        report
    }
}

/// Split columns into levels where every derived column comes after the
/// columns of the batch it reads.
pub fn dependency_levels(columns: &[GenericColumn]) -> Vec<Vec<&GenericColumn>> {
    let in_batch: HashSet<(&str, &str)> = columns.iter().map(|c| (c.entity.as_str(), c.name.as_str())).collect();
    let mut placed: HashSet<(&str, &str)> = HashSet::new();
    let mut remaining: Vec<&GenericColumn> = columns.iter().collect();
    let mut levels = Vec::new();

    while !remaining.is_empty() {
        let (ready, blocked): (Vec<&GenericColumn>, Vec<&GenericColumn>) = remaining.into_iter().partition(|c| {
            c.params.operands().iter().all(|op| {
                let key = (op.entity.as_str(), op.name.as_str());
                !in_batch.contains(&key) || placed.contains(&key)
            })
        });
        if ready.is_empty() {
            // operands form a cycle; run what is left together
            levels.push(blocked);
            break;
        }
        placed.extend(ready.iter().map(|c| (c.entity.as_str(), c.name.as_str())));
        levels.push(ready);
        remaining = blocked;
    }
    levels
}
