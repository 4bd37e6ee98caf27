// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Printer manager: owns the printer and job tables and runs
// trigger -> reconcile -> dispatch on every refresh.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use cloudspool_bridge::{CloudService, EnrichmentSource, PushChannel, Spooler};
use cloudspool_core::config::ConnectorConfig;
use cloudspool_core::error::{CloudSpoolError, Result};

use crate::pipeline::{DiscoverReport, JobPipeline, PipelineSettings};
use crate::reconcile::{CycleReport, ReconcileSettings, ReconciliationEngine};
use crate::retry::RetryConfig;
use crate::table::{JobCounts, JobTable, PrinterTable};
use crate::trigger::{RefreshReason, TriggerCoordinator, TriggerStats};

/// External collaborators the manager drives.
#[derive(Clone)]
pub struct Collaborators {
    pub spooler: Arc<dyn Spooler>,
    pub cloud: Arc<dyn CloudService>,
    pub push: Option<Arc<dyn PushChannel>>,
    pub enrichment: Option<Arc<dyn EnrichmentSource>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    Idle,
    Running,
    Stopped,
}

/// What one refresh cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleOutcome {
    /// `None` when the rosters could not be read.
    pub reconcile: Option<CycleReport>,
    pub discover: DiscoverReport,
}

/// Result of [`PrinterManager::quit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuitReport {
    /// Every task reached a suspension point within the grace period.
    pub drained: bool,
    /// Jobs still tracked when the manager stopped waiting.
    pub abandoned_jobs: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PrinterSummary {
    pub name: String,
    pub cloud_id: Option<String>,
    pub display_name: String,
    #[serde(flatten)]
    pub jobs: JobCounts,
}

/// Point-in-time view of the manager, safe to take from any task.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerSnapshot {
    pub proxy_name: String,
    pub state: Lifecycle,
    pub printer_count: usize,
    pub printers: Vec<PrinterSummary>,
    pub jobs_in_flight: usize,
    pub jobs_waiting: usize,
    pub last_reconciliation: Option<DateTime<Utc>>,
    pub last_cycle: Option<CycleReport>,
    pub last_discover: Option<DiscoverReport>,
    pub triggers: TriggerStats,
    /// `None` without a push channel.
    pub push_alive: Option<bool>,
    /// Printers whose cloud sync is suspended after repeated failures.
    pub suspended_printers: Vec<String>,
}

#[derive(Default)]
struct CycleStatus {
    last_reconciliation: Option<DateTime<Utc>>,
    last_cycle: Option<CycleReport>,
    last_discover: Option<DiscoverReport>,
}

pub struct PrinterManager {
    proxy_name: String,
    poll_interval: Duration,
    grace_period: Duration,
    printers: Arc<PrinterTable>,
    jobs: Arc<JobTable>,
    trigger: Arc<TriggerCoordinator>,
    engine: ReconciliationEngine,
    pipeline: JobPipeline,
    push: Option<Arc<dyn PushChannel>>,
    push_alive: AtomicBool,
    /// Serializes cycles; never guards table data.
    cycle_gate: tokio::sync::Mutex<()>,
    lifecycle: Mutex<Lifecycle>,
    status: RwLock<CycleStatus>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl PrinterManager {
    /// Build a manager.  `shutdown` is the process-wide token; the manager
    /// stops when it, or [`quit`](Self::quit), fires.
    pub fn new(
        config: &ConnectorConfig,
        collaborators: Collaborators,
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let shutdown = shutdown.child_token();
        let tracker = TaskTracker::new();
        let printers = Arc::new(PrinterTable::new());
        let jobs = Arc::new(JobTable::new());

        let enrichment = if config.enrichment_enable {
            collaborators.enrichment
        } else {
            None
        };
        let engine = ReconciliationEngine::new(
            Arc::clone(&collaborators.spooler),
            Arc::clone(&collaborators.cloud),
            enrichment,
            Arc::clone(&printers),
            ReconcileSettings {
                ignore_raw_printers: config.ignore_raw_printers,
                share_scope: config.share_scope.clone(),
                copy_printer_info_to_display_name: config.copy_printer_info_to_display_name,
                spooler_timeout: config.spooler_timeout(),
            },
        );
        let pipeline = JobPipeline::new(
            collaborators.spooler,
            collaborators.cloud,
            Arc::clone(&printers),
            Arc::clone(&jobs),
            PipelineSettings {
                max_concurrent_downloads: config.max_concurrent_downloads,
                job_queue_size: config.job_queue_size,
                retry: RetryConfig {
                    max_attempts: config.max_job_attempts,
                    ..Default::default()
                },
                poll_interval: config.job_poll_interval(),
                spooler_timeout: config.spooler_timeout(),
                full_username: config.job_full_username,
                allow_concurrent_per_printer: config.allow_concurrent_jobs_per_printer,
            },
            tracker.clone(),
            shutdown.clone(),
        );

        Ok(Arc::new(Self {
            proxy_name: config.proxy_name.clone(),
            poll_interval: config.printer_poll_interval(),
            grace_period: config.shutdown_grace_period(),
            printers,
            jobs,
            trigger: Arc::new(TriggerCoordinator::new()),
            engine,
            pipeline,
            push: collaborators.push,
            push_alive: AtomicBool::new(true),
            cycle_gate: tokio::sync::Mutex::new(()),
            lifecycle: Mutex::new(Lifecycle::Idle),
            status: RwLock::new(CycleStatus::default()),
            tracker,
            shutdown,
        }))
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_not_stopped(&self) -> Result<()> {
        if *self.lifecycle() == Lifecycle::Stopped {
            return Err(CloudSpoolError::ShutDown);
        }
        Ok(())
    }

    /// Start the refresh loop, the timer and the push listener, and queue
    /// the first refresh.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle();
            match *lifecycle {
                Lifecycle::Stopped => return Err(CloudSpoolError::ShutDown),
                Lifecycle::Running => {
                    debug!("printer manager already running");
                    return Ok(());
                }
                Lifecycle::Idle => *lifecycle = Lifecycle::Running,
            }
        }

        let manager = Arc::clone(self);
        self.tracker.spawn(async move { manager.refresh_loop().await });
        self.trigger
            .spawn_timer(self.poll_interval, &self.tracker, self.shutdown.clone());
        if let Some(push) = &self.push {
            self.trigger
                .spawn_push_listener(Arc::clone(push), &self.tracker, self.shutdown.clone());
        }
        self.trigger.request_refresh(RefreshReason::Startup);

        info!(
            proxy = %self.proxy_name,
            poll_interval_secs = self.poll_interval.as_secs(),
            "printer manager started"
        );
        Ok(())
    }

    pub fn request_refresh(&self, reason: RefreshReason) -> Result<()> {
        self.ensure_not_stopped()?;
        self.trigger.request_refresh(reason);
        Ok(())
    }

    /// Run one cycle now, waiting for any cycle already in progress.
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        self.ensure_not_stopped()?;
        self.cycle().await
    }

    async fn refresh_loop(self: Arc<Self>) {
        while let Some(reasons) = self.trigger.next_refresh(&self.shutdown).await {
            debug!(?reasons, "refresh due");
            match self.cycle().await {
                Ok(_) => {}
                Err(CloudSpoolError::Cancelled) => break,
                Err(e) => warn!(error = %e, "refresh cycle failed"),
            }
        }
        debug!("refresh loop stopped");
    }

    #[instrument(skip_all)]
    async fn cycle(&self) -> Result<CycleOutcome> {
        let _gate = self.cycle_gate.lock().await;
        self.check_push_liveness();

        let reconcile = match self.engine.reconcile(&self.shutdown).await {
            Ok(report) => {
                let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
                status.last_reconciliation = report.finished_at;
                status.last_cycle = Some(report.clone());
                Some(report)
            }
            Err(CloudSpoolError::Cancelled) => return Err(CloudSpoolError::Cancelled),
            Err(e) => {
                // Known printers keep receiving jobs.
                warn!(error = %e, "reconciliation failed, keeping the current roster");
                None
            }
        };
        if self.shutdown.is_cancelled() {
            return Err(CloudSpoolError::Cancelled);
        }

        let discover = self.pipeline.discover().await;
        self.status
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .last_discover = Some(discover);
        Ok(CycleOutcome { reconcile, discover })
    }

    fn check_push_liveness(&self) {
        let Some(push) = &self.push else {
            return;
        };
        let alive = push.is_alive();
        if self.push_alive.swap(alive, Ordering::SeqCst) != alive {
            if alive {
                info!("push channel is alive again");
            } else {
                warn!("push channel has gone quiet, relying on the refresh timer");
            }
        }
    }

    /// Stop the manager and wait, up to the grace period, for the refresh
    /// loop and every job worker to reach a suspension point.
    pub async fn quit(&self) -> Result<QuitReport> {
        {
            let mut lifecycle = self.lifecycle();
            if *lifecycle == Lifecycle::Stopped {
                return Err(CloudSpoolError::ShutDown);
            }
            *lifecycle = Lifecycle::Stopped;
        }

        info!(in_flight = self.jobs.len(), "stopping printer manager");
        self.shutdown.cancel();
        self.tracker.close();
        let drained = tokio::time::timeout(self.grace_period, self.tracker.wait())
            .await
            .is_ok();

        let abandoned_jobs = self.jobs.len();
        if drained {
            info!("printer manager stopped");
        } else {
            warn!(
                abandoned_jobs,
                grace_secs = self.grace_period.as_secs(),
                "grace period expired with work still in flight"
            );
        }
        Ok(QuitReport {
            drained,
            abandoned_jobs,
        })
    }

    pub fn proxy_name(&self) -> &str {
        &self.proxy_name
    }

    pub fn state(&self) -> Lifecycle {
        *self.lifecycle()
    }

    pub fn snapshot(&self) -> ManagerSnapshot {
        let counts = self.jobs.counts_by_printer();
        let printers: Vec<PrinterSummary> = self
            .printers
            .printers()
            .into_iter()
            .map(|p| PrinterSummary {
                jobs: counts.get(&p.name).copied().unwrap_or_default(),
                name: p.name,
                cloud_id: p.cloud_id,
                display_name: p.display_name,
            })
            .collect();

        let status = self.status.read().unwrap_or_else(PoisonError::into_inner);
        ManagerSnapshot {
            proxy_name: self.proxy_name.clone(),
            state: self.state(),
            printer_count: printers.len(),
            printers,
            jobs_in_flight: self.jobs.len(),
            jobs_waiting: self.pipeline.waiting(),
            last_reconciliation: status.last_reconciliation,
            last_cycle: status.last_cycle.clone(),
            last_discover: status.last_discover,
            triggers: self.trigger.stats(),
            push_alive: self
                .push
                .as_ref()
                .map(|_| self.push_alive.load(Ordering::SeqCst)),
            suspended_printers: self.engine.suspended_printers(),
        }
    }
}
