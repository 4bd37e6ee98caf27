// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for CloudSpool.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type for all CloudSpool operations.
#[derive(Debug, Error)]
pub enum CloudSpoolError {
    // -- Bootstrap errors --
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(
        "a connector is already running, or the monitor socket {} wasn't cleaned up properly",
        .0.display()
    )]
    MonitorSocketInUse(PathBuf),

    // -- Spooler errors --
    #[error("spooler request failed: {0}")]
    Spooler(String),

    #[error("spooler rejected job: {0}")]
    SpoolerRejected(String),

    #[error("malformed job ticket: {0}")]
    InvalidTicket(String),

    #[error("spooler aborted job: {0}")]
    JobAborted(String),

    #[error("spooler call timed out after {0:?}")]
    SpoolerTimeout(std::time::Duration),

    // -- Cloud errors --
    #[error("cloud request failed: {0}")]
    Cloud(String),

    #[error("cloud authentication failed: {0}")]
    Auth(String),

    #[error("cloud identifier for printer {printer} cannot change from {existing} to {proposed}")]
    CloudIdReassigned {
        printer: String,
        existing: String,
        proposed: String,
    },

    // -- Enrichment --
    #[error("enrichment lookup failed: {0}")]
    Enrichment(String),

    // -- Engine state --
    #[error("printer {0} is not known to the connector")]
    UnknownPrinter(String),

    #[error("illegal job transition {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    #[error("printer manager has shut down")]
    ShutDown,

    #[error("operation cancelled by shutdown")]
    Cancelled,

    // -- Storage / persistence --
    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, CloudSpoolError>;
