// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Printer and job tables.
//
// Each table is a map of `Arc`ed entries.  The map lock is only held to look
// up, insert, or remove an entry and never across an await; each entry has
// its own lock, so writes to one printer or job never wait on another.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;
use tracing::error;

use cloudspool_core::error::{CloudSpoolError, Result};
use cloudspool_core::types::{Job, JobId, JobRef, JobState, Printer, SpoolerJobHandle};

fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Printers
// ---------------------------------------------------------------------------

/// One registered printer.
pub struct PrinterEntry {
    printer: RwLock<Printer>,
    /// Held for a whole job when a printer may only run one job at a time.
    pub(crate) job_lock: tokio::sync::Mutex<()>,
}

impl PrinterEntry {
    fn new(printer: Printer) -> Self {
        Self {
            printer: RwLock::new(printer),
            job_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn printer(&self) -> Printer {
        read(&self.printer).clone()
    }

    pub fn cloud_id(&self) -> Option<String> {
        read(&self.printer).cloud_id.clone()
    }

    /// Replace the stored content.  The cloud identifier, once set, is kept.
    fn replace(&self, mut next: Printer) -> Result<()> {
        let mut current = write(&self.printer);
        match (&current.cloud_id, &next.cloud_id) {
            (Some(existing), Some(proposed)) if existing != proposed => {
                return Err(CloudSpoolError::CloudIdReassigned {
                    printer: current.name.clone(),
                    existing: existing.clone(),
                    proposed: proposed.clone(),
                });
            }
            (Some(existing), None) => next.cloud_id = Some(existing.clone()),
            _ => {}
        }
        *current = next;
        Ok(())
    }
}

/// Printers the connector has registered with the cloud, keyed by spooler name.
#[derive(Default)]
pub struct PrinterTable {
    entries: RwLock<HashMap<String, Arc<PrinterEntry>>>,
}

impl PrinterTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<PrinterEntry>> {
        read(&self.entries).get(name).cloned()
    }

    /// Insert a printer or update the existing entry in place.
    pub fn upsert(&self, printer: Printer) -> Result<Arc<PrinterEntry>> {
        if printer.name.is_empty() {
            return Err(CloudSpoolError::UnknownPrinter(String::new()));
        }
        if let Some(entry) = self.get(&printer.name) {
            entry.replace(printer)?;
            return Ok(entry);
        }

        let mut entries = write(&self.entries);
        let entry = entries
            .entry(printer.name.clone())
            .or_insert_with(|| Arc::new(PrinterEntry::new(printer.clone())))
            .clone();
        drop(entries);
        entry.replace(printer)?;
        Ok(entry)
    }

    pub fn remove(&self, name: &str) -> Option<Arc<PrinterEntry>> {
        write(&self.entries).remove(name)
    }

    /// `(name, cloud id)` of every printer that has a cloud record.
    pub fn registered(&self) -> Vec<(String, String)> {
        let entries: Vec<_> = read(&self.entries).values().cloned().collect();
        let mut out: Vec<_> = entries
            .iter()
            .filter_map(|e| {
                let p = read(&e.printer);
                p.cloud_id.clone().map(|id| (p.name.clone(), id))
            })
            .collect();
        out.sort();
        out
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = read(&self.entries).keys().cloned().collect();
        names.sort();
        names
    }

    pub fn printers(&self) -> Vec<Printer> {
        let entries: Vec<_> = read(&self.entries).values().cloned().collect();
        let mut out: Vec<_> = entries.iter().map(|e| e.printer()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn len(&self) -> usize {
        read(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// One tracked job.
pub struct JobEntry {
    job_ref: JobRef,
    job: Mutex<Job>,
    /// Set while somebody is pushing the terminal status to the cloud.
    reporting: AtomicBool,
    reported: AtomicBool,
}

impl JobEntry {
    pub fn job_ref(&self) -> &JobRef {
        &self.job_ref
    }

    pub fn job(&self) -> Job {
        lock(&self.job).clone()
    }

    pub fn state(&self) -> JobState {
        lock(&self.job).state
    }

    pub fn attempts(&self) -> u32 {
        lock(&self.job).attempts
    }

    /// Move the job along its state machine.
    ///
    /// An illegal edge is a bug in the pipeline, not in the job; it is logged
    /// and the job keeps its current state.
    pub fn advance(&self, next: JobState) -> bool {
        let mut job = lock(&self.job);
        match job.transition(next) {
            Ok(()) => true,
            Err(e) => {
                error!(job_id = %job.id, error = %e, "refusing job state change");
                false
            }
        }
    }

    pub(crate) fn record_payload(&self, size: u64) {
        lock(&self.job).payload_size = Some(size);
    }

    pub(crate) fn record_handle(&self, handle: SpoolerJobHandle) {
        lock(&self.job).spooler_handle = Some(handle);
    }

    pub(crate) fn record_error(&self, error: &CloudSpoolError, class: cloudspool_core::ErrorClass) {
        let mut job = lock(&self.job);
        job.last_error = Some(error.to_string());
        job.error_class = Some(class);
    }

    /// Claim the right to report.  Only one caller at a time gets `true`,
    /// and nobody does once a report went through.
    pub(crate) fn claim_report(&self) -> bool {
        !self.reported.load(Ordering::SeqCst)
            && self
                .reporting
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
    }

    pub(crate) fn finish_report(&self, delivered: bool) {
        if delivered {
            self.reported.store(true, Ordering::SeqCst);
        }
        self.reporting.store(false, Ordering::SeqCst);
    }

    /// Terminal, but the cloud has not heard about it yet.
    pub fn awaiting_report(&self) -> bool {
        self.state().is_terminal() && !self.reported.load(Ordering::SeqCst)
    }
}

/// Per-printer job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    /// Waiting for a token.
    pub queued: usize,
    /// Fetching, submitting, or printing.
    pub active: usize,
    /// Between attempts.
    pub failed: usize,
}

/// Jobs in flight, keyed by cloud job id.
#[derive(Default)]
pub struct JobTable {
    entries: RwLock<HashMap<JobId, Arc<JobEntry>>>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a job.  Returns `None` if it is already tracked.
    pub fn admit(&self, job_ref: JobRef, printer: &str) -> Option<Arc<JobEntry>> {
        let mut entries = write(&self.entries);
        if entries.contains_key(&job_ref.id) {
            return None;
        }
        let entry = Arc::new(JobEntry {
            job: Mutex::new(Job::new(job_ref.id.clone(), printer)),
            job_ref,
            reporting: AtomicBool::new(false),
            reported: AtomicBool::new(false),
        });
        entries.insert(entry.job_ref.id.clone(), Arc::clone(&entry));
        Some(entry)
    }

    pub fn contains(&self, id: &JobId) -> bool {
        read(&self.entries).contains_key(id)
    }

    pub fn remove(&self, id: &JobId) -> Option<Arc<JobEntry>> {
        write(&self.entries).remove(id)
    }

    pub fn entries(&self) -> Vec<Arc<JobEntry>> {
        read(&self.entries).values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        read(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn counts_by_printer(&self) -> HashMap<String, JobCounts> {
        let mut counts: HashMap<String, JobCounts> = HashMap::new();
        for entry in self.entries() {
            let job = entry.job();
            let slot = counts.entry(job.printer).or_default();
            match job.state {
                JobState::Queued => slot.queued += 1,
                JobState::Fetching | JobState::Submitting | JobState::Printing => slot.active += 1,
                JobState::Failed => slot.failed += 1,
                JobState::Done | JobState::FailedFinal => {}
            }
        }
        counts
    }
}
