// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// In-process collaborators.
//
// These back the connector when it runs against a fixture file and drive the
// manager's tests.  They keep their state behind plain mutexes and expose
// knobs for injecting the failures the manager has to survive.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use cloudspool_core::config::PushSettings;
use cloudspool_core::error::{CloudSpoolError, Result};
use cloudspool_core::types::{
    Attributes, CloudJobStatus, CloudPrinter, JobId, JobPayload, JobRef, JobTicket, Printer,
    SpoolerJobHandle, SpoolerJobState,
};

use crate::traits::{
    CloudService, EnrichmentSource, JobSubmission, PushChannel, PushEvent, Spooler,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Spooler
// ---------------------------------------------------------------------------

/// How the next submit call should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitFault {
    /// Printer busy/offline.
    Rejected,
    /// Ticket cannot be translated.
    InvalidTicket,
}

/// A job the spooler accepted.
#[derive(Debug, Clone)]
pub struct SpooledJob {
    pub handle: SpoolerJobHandle,
    pub printer: String,
    pub title: String,
    pub user: String,
    pub size: usize,
    polls: u32,
}

#[derive(Default)]
struct SpoolerState {
    printers: BTreeMap<String, Printer>,
    jobs: Vec<SpooledJob>,
    next_handle: u32,
    submit_faults: VecDeque<SubmitFault>,
    list_fails: bool,
    polls_until_done: u32,
    abort_jobs: bool,
}

/// Spooler holding printers and jobs in memory.
///
/// Submitted jobs report `Processing` until they have been polled
/// `polls_until_done` times, then `Completed` (or `Aborted` when
/// [`abort_jobs`](Self::abort_jobs) is set).
pub struct MemorySpooler {
    state: Mutex<SpoolerState>,
}

impl Default for MemorySpooler {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySpooler {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SpoolerState {
                next_handle: 1,
                polls_until_done: 1,
                ..Default::default()
            }),
        }
    }

    pub fn add_printer(&self, printer: Printer) {
        lock(&self.state).printers.insert(printer.name.clone(), printer);
    }

    pub fn remove_printer(&self, name: &str) {
        lock(&self.state).printers.remove(name);
    }

    /// Queue faults consumed by subsequent submit calls, oldest first.
    pub fn fail_submits(&self, faults: impl IntoIterator<Item = SubmitFault>) {
        lock(&self.state).submit_faults.extend(faults);
    }

    pub fn fail_listing(&self, fail: bool) {
        lock(&self.state).list_fails = fail;
    }

    pub fn set_polls_until_done(&self, polls: u32) {
        lock(&self.state).polls_until_done = polls;
    }

    pub fn abort_jobs(&self, abort: bool) {
        lock(&self.state).abort_jobs = abort;
    }

    /// Jobs accepted so far, in submission order.
    pub fn submitted(&self) -> Vec<SpooledJob> {
        lock(&self.state).jobs.clone()
    }
}

#[async_trait]
impl Spooler for MemorySpooler {
    async fn list_printers(&self) -> Result<Vec<Printer>> {
        let state = lock(&self.state);
        if state.list_fails {
            return Err(CloudSpoolError::Spooler("printer listing unavailable".into()));
        }
        Ok(state.printers.values().cloned().collect())
    }

    async fn submit_job(&self, printer: &str, job: JobSubmission<'_>) -> Result<SpoolerJobHandle> {
        let mut state = lock(&self.state);
        if !state.printers.contains_key(printer) {
            return Err(CloudSpoolError::SpoolerRejected(format!("no such printer {printer}")));
        }
        match state.submit_faults.pop_front() {
            Some(SubmitFault::Rejected) => {
                return Err(CloudSpoolError::SpoolerRejected(format!("{printer} is busy")));
            }
            Some(SubmitFault::InvalidTicket) => {
                return Err(CloudSpoolError::InvalidTicket(format!(
                    "cannot translate ticket for {}",
                    job.title
                )));
            }
            None => {}
        }

        let handle = SpoolerJobHandle(state.next_handle);
        state.next_handle += 1;
        state.jobs.push(SpooledJob {
            handle,
            printer: printer.to_owned(),
            title: job.title.to_owned(),
            user: job.user.to_owned(),
            size: job.data.len(),
            polls: 0,
        });
        debug!(printer, handle = %handle, "memory spooler accepted job");
        Ok(handle)
    }

    async fn poll_job(&self, handle: SpoolerJobHandle) -> Result<SpoolerJobState> {
        let mut state = lock(&self.state);
        let polls_until_done = state.polls_until_done;
        let abort = state.abort_jobs;
        let job = state
            .jobs
            .iter_mut()
            .find(|j| j.handle == handle)
            .ok_or_else(|| CloudSpoolError::Spooler(format!("unknown job {handle}")))?;

        job.polls += 1;
        if job.polls < polls_until_done {
            Ok(SpoolerJobState::Processing)
        } else if abort {
            Ok(SpoolerJobState::Aborted("printer reported an error".into()))
        } else {
            Ok(SpoolerJobState::Completed)
        }
    }
}

// ---------------------------------------------------------------------------
// Cloud
// ---------------------------------------------------------------------------

struct CloudJob {
    printer_name: String,
    title: String,
    owner_id: String,
    payload: JobPayload,
    reports: Vec<CloudJobStatus>,
}

#[derive(Default)]
struct CloudState {
    /// cloud id -> (printer as last synced, fingerprint)
    printers: BTreeMap<String, CloudPrinter>,
    jobs: BTreeMap<JobId, CloudJob>,
    creates: usize,
    updates: usize,
    deletes: usize,
    failing_syncs: BTreeSet<String>,
    reassigning: BTreeSet<String>,
    fetch_faults: usize,
    list_fails: bool,
    auth_fails: bool,
    fetch_delay: Duration,
}

/// Cloud print service held in memory.
///
/// Jobs are queued against a printer *name*, so a fixture can submit jobs
/// before the connector has registered the printer.
pub struct MemoryCloud {
    state: Mutex<CloudState>,
    fetching: AtomicUsize,
    max_fetching: AtomicUsize,
}

impl Default for MemoryCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCloud {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CloudState::default()),
            fetching: AtomicUsize::new(0),
            max_fetching: AtomicUsize::new(0),
        }
    }

    /// Pre-register a printer record, as a previous connector run would have.
    pub fn register(&self, printer: &Printer) -> String {
        let cloud_id = Uuid::new_v4().to_string();
        lock(&self.state).printers.insert(
            cloud_id.clone(),
            CloudPrinter {
                cloud_id: cloud_id.clone(),
                name: printer.name.clone(),
                fingerprint: printer.fingerprint(),
            },
        );
        cloud_id
    }

    /// A user submits a job to `printer_name` through the cloud.
    pub fn submit(
        &self,
        printer_name: &str,
        title: &str,
        owner_id: &str,
        ticket: JobTicket,
        data: Vec<u8>,
    ) -> JobId {
        let id = JobId(Uuid::new_v4().to_string());
        lock(&self.state).jobs.insert(
            id.clone(),
            CloudJob {
                printer_name: printer_name.to_owned(),
                title: title.to_owned(),
                owner_id: owner_id.to_owned(),
                payload: JobPayload { ticket, data },
                reports: Vec::new(),
            },
        );
        id
    }

    pub fn fail_sync_for(&self, printer_name: &str, fail: bool) {
        let mut state = lock(&self.state);
        if fail {
            state.failing_syncs.insert(printer_name.to_owned());
        } else {
            state.failing_syncs.remove(printer_name);
        }
    }

    /// Answer updates of `printer_name` with a freshly created record, as a
    /// cloud that lost track of the old one would.
    pub fn reassign_on_update(&self, printer_name: &str, reassign: bool) {
        let mut state = lock(&self.state);
        if reassign {
            state.reassigning.insert(printer_name.to_owned());
        } else {
            state.reassigning.remove(printer_name);
        }
    }

    /// Fail the next `n` fetch calls.
    pub fn fail_fetches(&self, n: usize) {
        lock(&self.state).fetch_faults = n;
    }

    pub fn fail_listing(&self, fail: bool) {
        lock(&self.state).list_fails = fail;
    }

    pub fn fail_auth(&self, fail: bool) {
        lock(&self.state).auth_fails = fail;
    }

    /// Make every fetch take `delay`.
    pub fn set_fetch_delay(&self, delay: Duration) {
        lock(&self.state).fetch_delay = delay;
    }

    /// Printer names with a cloud record.
    pub fn printer_names(&self) -> BTreeSet<String> {
        lock(&self.state)
            .printers
            .values()
            .map(|p| p.name.clone())
            .collect()
    }

    pub fn cloud_id_of(&self, printer_name: &str) -> Option<String> {
        lock(&self.state)
            .printers
            .values()
            .find(|p| p.name == printer_name)
            .map(|p| p.cloud_id.clone())
    }

    /// (creates, updates, deletes) performed through `sync_printer`/`delete_printer`.
    pub fn operation_counts(&self) -> (usize, usize, usize) {
        let state = lock(&self.state);
        (state.creates, state.updates, state.deletes)
    }

    /// Every status reported for `job`, in order.
    pub fn reports(&self, job: &JobId) -> Vec<CloudJobStatus> {
        lock(&self.state)
            .jobs
            .get(job)
            .map(|j| j.reports.clone())
            .unwrap_or_default()
    }

    /// Highest number of fetches observed running at once.
    pub fn max_concurrent_fetches(&self) -> usize {
        self.max_fetching.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CloudService for MemoryCloud {
    async fn access_token(&self) -> Result<String> {
        if lock(&self.state).auth_fails {
            return Err(CloudSpoolError::Auth("refresh token rejected".into()));
        }
        Ok("memory-token".into())
    }

    async fn list_printers(&self) -> Result<Vec<CloudPrinter>> {
        let state = lock(&self.state);
        if state.list_fails {
            return Err(CloudSpoolError::Cloud("printer list unavailable".into()));
        }
        Ok(state.printers.values().cloned().collect())
    }

    async fn sync_printer(&self, printer: &Printer) -> Result<String> {
        let mut state = lock(&self.state);
        if state.failing_syncs.contains(&printer.name) {
            return Err(CloudSpoolError::Cloud(format!("sync of {} failed", printer.name)));
        }

        let cloud_id = match &printer.cloud_id {
            Some(_) if state.reassigning.contains(&printer.name) => {
                let id = Uuid::new_v4().to_string();
                state.printers.insert(
                    id.clone(),
                    CloudPrinter {
                        cloud_id: id.clone(),
                        name: printer.name.clone(),
                        fingerprint: printer.fingerprint(),
                    },
                );
                state.updates += 1;
                id
            }
            Some(id) => {
                let record = state
                    .printers
                    .get_mut(id)
                    .ok_or_else(|| CloudSpoolError::Cloud(format!("no printer record {id}")))?;
                record.fingerprint = printer.fingerprint();
                state.updates += 1;
                id.clone()
            }
            None => {
                let id = Uuid::new_v4().to_string();
                state.printers.insert(
                    id.clone(),
                    CloudPrinter {
                        cloud_id: id.clone(),
                        name: printer.name.clone(),
                        fingerprint: printer.fingerprint(),
                    },
                );
                state.creates += 1;
                id
            }
        };
        Ok(cloud_id)
    }

    async fn delete_printer(&self, cloud_id: &str) -> Result<()> {
        let mut state = lock(&self.state);
        if state.printers.remove(cloud_id).is_none() {
            return Err(CloudSpoolError::Cloud(format!("no printer record {cloud_id}")));
        }
        state.deletes += 1;
        Ok(())
    }

    async fn list_pending_jobs(&self, cloud_printer_id: &str) -> Result<Vec<JobRef>> {
        let state = lock(&self.state);
        let printer = state
            .printers
            .get(cloud_printer_id)
            .ok_or_else(|| CloudSpoolError::Cloud(format!("no printer record {cloud_printer_id}")))?;

        Ok(state
            .jobs
            .iter()
            .filter(|(_, job)| job.printer_name == printer.name && job.reports.is_empty())
            .map(|(id, job)| JobRef {
                id: id.clone(),
                cloud_printer_id: cloud_printer_id.to_owned(),
                title: job.title.clone(),
                owner_id: job.owner_id.clone(),
            })
            .collect())
    }

    async fn fetch_job(&self, job: &JobRef) -> Result<JobPayload> {
        let now = self.fetching.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_fetching.fetch_max(now, Ordering::SeqCst);

        let delay = lock(&self.state).fetch_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let result = {
            let mut state = lock(&self.state);
            if state.fetch_faults > 0 {
                state.fetch_faults -= 1;
                Err(CloudSpoolError::Cloud(format!("download of {} failed", job.id)))
            } else {
                state
                    .jobs
                    .get(&job.id)
                    .map(|j| j.payload.clone())
                    .ok_or_else(|| CloudSpoolError::Cloud(format!("no job {}", job.id)))
            }
        };

        self.fetching.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn report_job_status(&self, job: &JobRef, status: &CloudJobStatus) -> Result<()> {
        let mut state = lock(&self.state);
        let entry = state
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| CloudSpoolError::Cloud(format!("no job {}", job.id)))?;
        entry.reports.push(status.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Push channel
// ---------------------------------------------------------------------------

/// Producer side of a [`ChannelPush`].
#[derive(Clone)]
pub struct PushSender {
    tx: mpsc::UnboundedSender<PushEvent>,
}

impl PushSender {
    pub fn refresh(&self) {
        let _ = self.tx.send(PushEvent::Refresh);
    }

    pub fn ping(&self) {
        let _ = self.tx.send(PushEvent::Ping);
    }
}

/// Push channel fed from inside the process.
pub struct ChannelPush {
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<PushEvent>>,
    last_seen: Mutex<Instant>,
    settings: PushSettings,
}

impl ChannelPush {
    pub fn new(settings: PushSettings) -> (Self, PushSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Self {
            rx: tokio::sync::Mutex::new(rx),
            last_seen: Mutex::new(Instant::now()),
            settings,
        };
        (channel, PushSender { tx })
    }
}

#[async_trait]
impl PushChannel for ChannelPush {
    async fn next_event(&self) -> Option<PushEvent> {
        let event = self.rx.lock().await.recv().await?;
        *lock(&self.last_seen) = Instant::now();
        Some(event)
    }

    fn is_alive(&self) -> bool {
        let window = self.settings.ping_interval_default + self.settings.ping_timeout;
        lock(&self.last_seen).elapsed() <= window
    }
}

// ---------------------------------------------------------------------------
// Enrichment
// ---------------------------------------------------------------------------

/// Enrichment source answering from a fixed table.
#[derive(Default)]
pub struct MemoryEnrichment {
    table: Mutex<HashMap<String, Attributes>>,
    failing: Mutex<BTreeSet<String>>,
}

impl MemoryEnrichment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, printer_name: &str, attributes: Attributes) {
        lock(&self.table).insert(printer_name.to_owned(), attributes);
    }

    pub fn fail_for(&self, printer_name: &str) {
        lock(&self.failing).insert(printer_name.to_owned());
    }
}

#[async_trait]
impl EnrichmentSource for MemoryEnrichment {
    async fn describe(&self, printer: &Printer) -> Result<Option<Attributes>> {
        if lock(&self.failing).contains(&printer.name) {
            warn!(printer = %printer.name, "enrichment lookup timed out");
            return Err(CloudSpoolError::Enrichment(format!(
                "no answer from {}",
                printer.name
            )));
        }
        Ok(lock(&self.table).get(&printer.name).cloned())
    }
}

/// Seed a spooler/cloud pair from plain data.
///
/// Jobs are `(printer name, title, owner, document)` tuples.
pub fn seeded(
    printers: impl IntoIterator<Item = Printer>,
    jobs: impl IntoIterator<Item = (String, String, String, Vec<u8>)>,
) -> (MemorySpooler, MemoryCloud) {
    let spooler = MemorySpooler::new();
    let cloud = MemoryCloud::new();
    for printer in printers {
        spooler.add_printer(printer);
    }
    let mut count = 0usize;
    for (printer, title, owner, data) in jobs {
        cloud.submit(
            &printer,
            &title,
            &owner,
            JobTicket(serde_json::json!({ "version": "1.0" })),
            data,
        );
        count += 1;
    }
    info!(jobs = count, "seeded in-memory collaborators");
    (spooler, cloud)
}
