// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Capability traits for the connector's external collaborators.
//
// The connector never speaks a wire protocol itself.  Everything it needs
// from the spooler, the cloud service, the push channel, and the enrichment
// source is expressed here; concrete clients implement these traits.

use async_trait::async_trait;

use cloudspool_core::error::Result;
use cloudspool_core::types::{
    Attributes, CloudJobStatus, CloudPrinter, JobPayload, JobRef, JobTicket, Printer,
    SpoolerJobHandle, SpoolerJobState,
};

/// Everything the spooler needs to print one job.
#[derive(Debug, Clone, Copy)]
pub struct JobSubmission<'a> {
    pub title: &'a str,
    /// Requester name the spooler attributes the job to.
    pub user: &'a str,
    pub ticket: &'a JobTicket,
    pub data: &'a [u8],
}

/// The local print spooler.
#[async_trait]
pub trait Spooler: Send + Sync {
    /// Enumerate printers with their capability attributes.
    async fn list_printers(&self) -> Result<Vec<Printer>>;

    /// Hand a job to the spooler.
    ///
    /// A busy or offline printer surfaces as `SpoolerRejected`; a ticket the
    /// spooler cannot translate as `InvalidTicket`.
    async fn submit_job(&self, printer: &str, job: JobSubmission<'_>) -> Result<SpoolerJobHandle>;

    /// Query the state of a previously submitted job.
    async fn poll_job(&self, handle: SpoolerJobHandle) -> Result<SpoolerJobState>;
}

/// The cloud print service.
#[async_trait]
pub trait CloudService: Send + Sync {
    /// Return a valid access token, refreshing it if needed.
    async fn access_token(&self) -> Result<String>;

    /// Printers registered by this connector.
    async fn list_printers(&self) -> Result<Vec<CloudPrinter>>;

    /// Create (no cloud id yet) or update a printer record.
    ///
    /// Returns the printer's cloud identifier.
    async fn sync_printer(&self, printer: &Printer) -> Result<String>;

    async fn delete_printer(&self, cloud_id: &str) -> Result<()>;

    /// Jobs still waiting to be picked up for one printer.
    async fn list_pending_jobs(&self, cloud_printer_id: &str) -> Result<Vec<JobRef>>;

    /// Download ticket and document.
    async fn fetch_job(&self, job: &JobRef) -> Result<JobPayload>;

    async fn report_job_status(&self, job: &JobRef, status: &CloudJobStatus) -> Result<()>;
}

/// Something arriving on the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushEvent {
    /// State changed on the cloud side; re-check.
    Refresh,
    /// Liveness only.
    Ping,
}

/// Asynchronous notification transport.
#[async_trait]
pub trait PushChannel: Send + Sync {
    /// Wait for the next event.  `None` means the channel is gone for good.
    async fn next_event(&self) -> Option<PushEvent>;

    /// Whether the channel has shown signs of life recently.
    fn is_alive(&self) -> bool;
}

/// Auxiliary device metadata lookup.
#[async_trait]
pub trait EnrichmentSource: Send + Sync {
    /// Extra attributes for `printer`, or `None` if the device did not answer.
    async fn describe(&self, printer: &Printer) -> Result<Option<Attributes>>;
}
