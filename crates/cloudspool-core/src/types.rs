// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types for the CloudSpool connector.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CloudSpoolError, Result};

/// Spooler attribute carrying the human-readable printer description.
pub const PRINTER_INFO_ATTRIBUTE: &str = "printer-info";

/// Key/value attribute map.  Ordered so fingerprints are stable.
pub type Attributes = BTreeMap<String, String>;

/// A printer known to the spooler, the cloud, or both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Printer {
    /// Spooler-side identifier (unique within the spooler).
    pub name: String,
    /// Cloud-side identifier; `None` until first registration.
    pub cloud_id: Option<String>,
    pub display_name: String,
    /// Capabilities and descriptive attributes reported by the spooler.
    pub attributes: Attributes,
    pub share_scope: String,
    /// The device exposes no structured capabilities.
    pub raw: bool,
    /// Extra attributes from the enrichment source, if it answered.
    pub tags: Option<Attributes>,
}

impl Printer {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            display_name: name.clone(),
            name,
            cloud_id: None,
            attributes: Attributes::new(),
            share_scope: String::new(),
            raw: false,
            tags: None,
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn is_registered(&self) -> bool {
        self.cloud_id.is_some()
    }

    /// SHA-256 over everything the cloud record mirrors.
    ///
    /// The cloud identifier is excluded: it is identity, not content.
    pub fn fingerprint(&self) -> String {
        #[derive(Serialize)]
        struct Content<'a> {
            name: &'a str,
            display_name: &'a str,
            attributes: &'a Attributes,
            share_scope: &'a str,
            raw: bool,
            tags: &'a Option<Attributes>,
        }

        let content = Content {
            name: &self.name,
            display_name: &self.display_name,
            attributes: &self.attributes,
            share_scope: &self.share_scope,
            raw: self.raw,
            tags: &self.tags,
        };
        // BTreeMap-backed content always serializes.
        let bytes = serde_json::to_vec(&content).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }
}

/// A printer record as the cloud service stores it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudPrinter {
    pub cloud_id: String,
    /// Spooler-side name the record was registered for.
    pub name: String,
    /// Fingerprint of the printer content last synced.
    pub fingerprint: String,
}

/// Globally unique cloud job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub String);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// A pending job as listed by the cloud queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRef {
    pub id: JobId,
    pub cloud_printer_id: String,
    pub title: String,
    /// Requester identity, usually `user@domain`.
    pub owner_id: String,
}

/// Opaque print ticket.  Translation into spooler options is the spooler
/// client's business.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTicket(pub serde_json::Value);

/// Ticket and document bytes for one job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobPayload {
    pub ticket: JobTicket,
    pub data: Vec<u8>,
}

/// Spooler-assigned job number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpoolerJobHandle(pub u32);

impl std::fmt::Display for SpoolerJobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job state as the spooler reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpoolerJobState {
    Pending,
    Processing,
    Completed,
    Aborted(String),
    Cancelled,
}

impl SpoolerJobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted(_) | Self::Cancelled)
    }
}

/// Job status pushed back to the cloud.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloudJobStatus {
    /// The spooler accepted the job.
    InProgress,
    Done,
    Error { message: String },
}

/// Classification of errors for retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Network blip, timeout, busy printer; retry on the next attempt.
    Transient,
    /// Retrying cannot help (malformed ticket, aborted print).
    Permanent,
}

/// Pipeline states of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    /// Admitted, waiting for a token.
    Queued,
    /// Downloading ticket and payload from the cloud.
    Fetching,
    /// Handing the payload to the spooler.
    Submitting,
    /// Accepted by the spooler, polling for completion.
    Printing,
    Done,
    /// Attempt failed; may go back to `Queued`.
    Failed,
    /// Out of attempts, or failed permanently.
    FailedFinal,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::FailedFinal)
    }

    /// Forward edges of the state machine plus the single retry edge.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Fetching)
                | (Fetching, Submitting)
                | (Fetching, Failed)
                | (Submitting, Printing)
                | (Submitting, Failed)
                | (Printing, Done)
                | (Printing, Failed)
                | (Failed, Queued)
                | (Failed, FailedFinal)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// A print request in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Spooler-side name of the target printer.
    pub printer: String,
    pub state: JobState,
    /// Number of times the job has entered `Fetching`.
    pub attempts: u32,
    pub payload_size: Option<u64>,
    pub spooler_handle: Option<SpoolerJobHandle>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub error_class: Option<ErrorClass>,
}

impl Job {
    pub fn new(id: JobId, printer: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            printer: printer.into(),
            state: JobState::Queued,
            attempts: 0,
            payload_size: None,
            spooler_handle: None,
            created_at: now,
            updated_at: now,
            last_error: None,
            error_class: None,
        }
    }

    /// Move to `next`, rejecting edges the state machine does not have.
    pub fn transition(&mut self, next: JobState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(CloudSpoolError::IllegalTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        if next == JobState::Fetching {
            self.attempts += 1;
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}
