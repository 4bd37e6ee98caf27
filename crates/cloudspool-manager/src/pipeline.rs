// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Job pipeline: cloud queue -> local spooler.
//
// `discover` lists pending jobs for every registered printer and admits new
// ones into a bounded waiting queue.  Each admitted job gets one worker task
// that drives it end to end:
//
//   Queued -> Fetching -> Submitting -> Printing -> Done
//                \            \            \
//                 +------------+------------+-> Failed -> Queued (retry)
//                                                      \-> FailedFinal
//
// A worker holds a download token from the start of Fetching until the
// spooler has accepted the job.  The terminal state is reported to the cloud
// exactly once; a report that does not go through is retried by the next
// `discover` and the job stays tracked until then.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use cloudspool_bridge::{CloudService, JobSubmission, Spooler};
use cloudspool_core::error::{CloudSpoolError, Result};
use cloudspool_core::types::{CloudJobStatus, JobState, SpoolerJobHandle, SpoolerJobState};

use crate::retry::{RetryConfig, RetryDecision, classify_error, should_retry};
use crate::table::{JobEntry, JobTable, PrinterTable};

/// Consecutive failed status queries before a printing job is given up on.
const MAX_POLL_ERRORS: u32 = 10;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Size of the download token pool.
    pub max_concurrent_downloads: usize,
    /// Jobs that may wait for a token at once.
    pub job_queue_size: usize,
    pub retry: RetryConfig,
    /// Pause between spooler status queries.
    pub poll_interval: Duration,
    /// Upper bound on each spooler call.
    pub spooler_timeout: Duration,
    /// Attribute jobs to `user@domain` rather than `user`.
    pub full_username: bool,
    /// When false, a printer runs one job at a time.
    pub allow_concurrent_per_printer: bool,
}

/// What one `discover` pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiscoverReport {
    /// New jobs handed to a worker.
    pub admitted: usize,
    /// Jobs left in the cloud queue because the waiting queue was full.
    pub deferred: usize,
    /// Listed jobs that already have a worker.
    pub already_tracked: usize,
    /// Printers whose pending jobs could not be listed.
    pub failed_listings: usize,
    /// Terminal reports delivered on a second try.
    pub report_retries: usize,
}

/// Name the spooler attributes a job to.
pub fn requesting_user(owner_id: &str, full_username: bool) -> &str {
    if full_username {
        return owner_id;
    }
    match owner_id.split_once('@') {
        Some((user, _)) if !user.is_empty() => user,
        _ => owner_id,
    }
}

/// A place in the waiting queue, given back on drop.
struct QueueSlot(Arc<AtomicUsize>);

impl QueueSlot {
    fn reserve(waiting: &Arc<AtomicUsize>, capacity: usize) -> Option<Self> {
        waiting
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |w| {
                (w < capacity).then_some(w + 1)
            })
            .ok()
            .map(|_| Self(Arc::clone(waiting)))
    }

    /// Retries re-enter the queue even when it is full; only new jobs are
    /// held back.
    fn requeue(waiting: &Arc<AtomicUsize>) -> Self {
        waiting.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(waiting))
    }
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Inner {
    spooler: Arc<dyn Spooler>,
    cloud: Arc<dyn CloudService>,
    printers: Arc<PrinterTable>,
    jobs: Arc<JobTable>,
    tokens: Semaphore,
    waiting: Arc<AtomicUsize>,
    settings: PipelineSettings,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

/// Bounded worker pool moving cloud jobs through the spooler.
pub struct JobPipeline {
    inner: Arc<Inner>,
}

impl JobPipeline {
    pub fn new(
        spooler: Arc<dyn Spooler>,
        cloud: Arc<dyn CloudService>,
        printers: Arc<PrinterTable>,
        jobs: Arc<JobTable>,
        settings: PipelineSettings,
        tracker: TaskTracker,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                spooler,
                cloud,
                printers,
                jobs,
                tokens: Semaphore::new(settings.max_concurrent_downloads),
                waiting: Arc::new(AtomicUsize::new(0)),
                settings,
                tracker,
                shutdown,
            }),
        }
    }

    /// Jobs admitted but not yet holding a token.
    pub fn waiting(&self) -> usize {
        self.inner.waiting.load(Ordering::SeqCst)
    }

    /// Download tokens currently free.
    pub fn available_tokens(&self) -> usize {
        self.inner.tokens.available_permits()
    }

    /// Pick up new jobs for every registered printer.
    #[instrument(skip_all)]
    pub async fn discover(&self) -> DiscoverReport {
        let inner = &self.inner;
        let mut report = DiscoverReport::default();

        for entry in inner.jobs.entries() {
            if entry.awaiting_report() && inner.report_terminal(&entry).await {
                report.report_retries += 1;
            }
        }

        for (printer, cloud_id) in inner.printers.registered() {
            if inner.shutdown.is_cancelled() {
                break;
            }
            let pending = match inner.cloud.list_pending_jobs(&cloud_id).await {
                Ok(pending) => pending,
                Err(e) => {
                    warn!(printer = %printer, error = %e, "failed to list pending jobs");
                    report.failed_listings += 1;
                    continue;
                }
            };

            for job_ref in pending {
                if inner.jobs.contains(&job_ref.id) {
                    report.already_tracked += 1;
                    continue;
                }
                let Some(slot) = QueueSlot::reserve(&inner.waiting, inner.settings.job_queue_size)
                else {
                    report.deferred += 1;
                    continue;
                };
                let Some(entry) = inner.jobs.admit(job_ref, &printer) else {
                    continue;
                };

                debug!(printer = %printer, job_id = %entry.job_ref().id, "admitted job");
                report.admitted += 1;
                let worker = Arc::clone(inner);
                inner.tracker.spawn(async move { worker.drive(entry, slot).await });
            }
        }

        if report.deferred > 0 {
            info!(
                deferred = report.deferred,
                "job queue full, remaining jobs left for a later cycle"
            );
        }
        report
    }
}

impl Inner {
    #[instrument(skip_all, fields(job_id = %entry.job_ref().id))]
    async fn drive(&self, entry: Arc<JobEntry>, slot: QueueSlot) {
        let printer_name = entry.job().printer;
        let mut slot = Some(slot);

        loop {
            let Some(printer) = self.printers.get(&printer_name) else {
                info!(printer = %printer_name, "printer no longer registered, dropping job");
                self.abandon(&entry);
                return;
            };

            let exclusive = if self.settings.allow_concurrent_per_printer {
                None
            } else {
                tokio::select! {
                    guard = printer.job_lock.lock() => Some(guard),
                    _ = self.shutdown.cancelled() => {
                        self.abandon(&entry);
                        return;
                    }
                }
            };

            let waiting = slot
                .take()
                .unwrap_or_else(|| QueueSlot::requeue(&self.waiting));
            let outcome = self.attempt(&entry, waiting).await;
            drop(exclusive);

            let err = match outcome {
                Ok(()) => {
                    entry.advance(JobState::Done);
                    info!(printer = %printer_name, attempts = entry.attempts(), "job printed");
                    self.report_terminal(&entry).await;
                    return;
                }
                Err(CloudSpoolError::Cancelled) => {
                    self.abandon(&entry);
                    return;
                }
                Err(e) => e,
            };

            let class = classify_error(&err);
            entry.advance(JobState::Failed);
            entry.record_error(&err, class);
            warn!(printer = %printer_name, attempt = entry.attempts(), error = %err, "job attempt failed");

            match should_retry(&err, entry.attempts(), &self.settings.retry) {
                RetryDecision::RetryAfter(delay) => {
                    entry.advance(JobState::Queued);
                    slot = Some(QueueSlot::requeue(&self.waiting));
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.cancelled() => {
                            self.abandon(&entry);
                            return;
                        }
                    }
                }
                RetryDecision::GiveUp | RetryDecision::Exhausted => {
                    entry.advance(JobState::FailedFinal);
                    self.report_terminal(&entry).await;
                    return;
                }
            }
        }
    }

    /// One pass through Fetching, Submitting and Printing.
    async fn attempt(&self, entry: &JobEntry, slot: QueueSlot) -> Result<()> {
        let token = tokio::select! {
            permit = self.tokens.acquire() => permit.map_err(|_| CloudSpoolError::ShutDown)?,
            _ = self.shutdown.cancelled() => return Err(CloudSpoolError::Cancelled),
        };
        drop(slot);

        let job_ref = entry.job_ref();
        entry.advance(JobState::Fetching);
        let payload = self.cancellable(self.cloud.fetch_job(job_ref)).await?;
        entry.record_payload(payload.data.len() as u64);

        entry.advance(JobState::Submitting);
        let user = requesting_user(&job_ref.owner_id, self.settings.full_username);
        let job = entry.job();
        let submission = JobSubmission {
            title: &job_ref.title,
            user,
            ticket: &payload.ticket,
            data: &payload.data,
        };
        let handle = self
            .cancellable(self.spooler_call(self.spooler.submit_job(&job.printer, submission)))
            .await?;
        entry.record_handle(handle);
        entry.advance(JobState::Printing);
        drop(token);
        debug!(handle = %handle, "spooler accepted job");

        // Keeps the job off the cloud's pending list; losing it only means
        // the job is listed again and skipped as already tracked.
        if let Err(e) = self
            .cloud
            .report_job_status(job_ref, &CloudJobStatus::InProgress)
            .await
        {
            debug!(error = %e, "could not mark job in progress");
        }

        self.wait_for_completion(handle).await
    }

    async fn wait_for_completion(&self, handle: SpoolerJobHandle) -> Result<()> {
        let mut errors = 0u32;
        loop {
            match self
                .cancellable(self.spooler_call(self.spooler.poll_job(handle)))
                .await
            {
                Ok(SpoolerJobState::Completed) => return Ok(()),
                Ok(SpoolerJobState::Aborted(reason)) => {
                    return Err(CloudSpoolError::JobAborted(reason));
                }
                Ok(SpoolerJobState::Cancelled) => {
                    return Err(CloudSpoolError::JobAborted("cancelled at the spooler".into()));
                }
                Ok(SpoolerJobState::Pending | SpoolerJobState::Processing) => errors = 0,
                Err(CloudSpoolError::Cancelled) => return Err(CloudSpoolError::Cancelled),
                Err(e) => {
                    errors += 1;
                    if errors >= MAX_POLL_ERRORS {
                        return Err(CloudSpoolError::JobAborted(format!(
                            "lost track of spooler job {handle}: {e}"
                        )));
                    }
                    debug!(handle = %handle, error = %e, "status query failed");
                }
            }

            self.cancellable(async {
                tokio::time::sleep(self.settings.poll_interval).await;
                Ok(())
            })
            .await?;
        }
    }

    /// Push the terminal state to the cloud unless somebody already did.
    ///
    /// Returns true if this call delivered the report.
    async fn report_terminal(&self, entry: &JobEntry) -> bool {
        let job = entry.job();
        let status = match job.state {
            JobState::Done => CloudJobStatus::Done,
            JobState::FailedFinal => CloudJobStatus::Error {
                message: job.last_error.unwrap_or_else(|| "job failed".into()),
            },
            _ => return false,
        };
        if !entry.claim_report() {
            return false;
        }

        let delivered = match self.cloud.report_job_status(entry.job_ref(), &status).await {
            Ok(()) => true,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "failed to report job state, will retry");
                false
            }
        };
        entry.finish_report(delivered);
        if delivered {
            self.jobs.remove(&job.id);
        }
        delivered
    }

    /// Stop tracking without reporting.  Anything already handed to the
    /// spooler keeps printing.
    fn abandon(&self, entry: &JobEntry) {
        debug!(job_id = %entry.job_ref().id, state = %entry.state(), "abandoning job");
        self.jobs.remove(&entry.job_ref().id);
    }

    async fn cancellable<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            result = call => result,
            _ = self.shutdown.cancelled() => Err(CloudSpoolError::Cancelled),
        }
    }

    async fn spooler_call<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        let limit = self.settings.spooler_timeout;
        tokio::time::timeout(limit, call)
            .await
            .map_err(|_| CloudSpoolError::SpoolerTimeout(limit))?
    }
}
