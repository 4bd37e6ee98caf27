// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Connector configuration.
//
// Loaded once at startup from a JSON file.  Every field has a default so a
// partial file (or no file at all) is valid; `validate` is what turns bad
// values into a fatal startup error.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CloudSpoolError, Result};

/// Default share scope applied to newly registered printers.
pub const DEFAULT_SHARE_SCOPE: &str = "";

/// Connector settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// Name this connector registers under with the cloud service.
    pub proxy_name: String,
    /// Unix socket the introspection endpoint listens on.
    pub monitor_socket_path: PathBuf,
    /// Period of the reconciliation timer.
    pub printer_poll_interval_secs: u64,
    /// Size of the job token pool.
    pub max_concurrent_downloads: usize,
    /// How many discovered jobs may wait for a token at once.
    pub job_queue_size: usize,
    /// Attribute jobs to `user@domain` rather than `user`.
    pub job_full_username: bool,
    /// Skip printers that expose no structured capabilities.
    pub ignore_raw_printers: bool,
    /// Share scope applied when registering a printer that has none.
    pub share_scope: String,
    /// Upper bound on any single spooler call.
    pub spooler_connect_timeout_secs: u64,
    /// Push channel liveness: how long to wait for a ping reply.
    pub push_ping_timeout_secs: u64,
    /// Push channel liveness: ping period until the server suggests one.
    pub push_ping_interval_default_secs: u64,
    /// Attempts per job before it is reported as permanently failed.
    pub max_job_attempts: u32,
    /// Delay between spooler job status queries.
    pub job_poll_interval_ms: u64,
    /// How long `quit` waits for in-flight work.
    pub shutdown_grace_period_secs: u64,
    /// Whether one printer may run several jobs at the same time.
    pub allow_concurrent_jobs_per_printer: bool,
    /// Query the enrichment source for extra printer attributes.
    pub enrichment_enable: bool,
    /// Use the spooler's `printer-info` attribute as the display name.
    pub copy_printer_info_to_display_name: bool,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            proxy_name: "cloudspool".into(),
            monitor_socket_path: PathBuf::from("/tmp/cloudspool-monitor.sock"),
            printer_poll_interval_secs: 60,
            max_concurrent_downloads: 5,
            job_queue_size: 3,
            job_full_username: false,
            ignore_raw_printers: true,
            share_scope: DEFAULT_SHARE_SCOPE.into(),
            spooler_connect_timeout_secs: 5,
            push_ping_timeout_secs: 5,
            push_ping_interval_default_secs: 120,
            max_job_attempts: 5,
            job_poll_interval_ms: 1000,
            shutdown_grace_period_secs: 10,
            allow_concurrent_jobs_per_printer: true,
            enrichment_enable: false,
            copy_printer_info_to_display_name: true,
        }
    }
}

impl ConnectorConfig {
    /// Read and validate a config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| {
            CloudSpoolError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&data).map_err(|e| {
            CloudSpoolError::Config(format!("failed to parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the connector cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.proxy_name.trim().is_empty() {
            return Err(CloudSpoolError::Config("proxy_name must not be empty".into()));
        }
        if self.monitor_socket_path.as_os_str().is_empty() {
            return Err(CloudSpoolError::Config(
                "monitor_socket_path must not be empty".into(),
            ));
        }

        let positive = [
            ("printer_poll_interval_secs", self.printer_poll_interval_secs),
            ("max_concurrent_downloads", self.max_concurrent_downloads as u64),
            ("job_queue_size", self.job_queue_size as u64),
            ("spooler_connect_timeout_secs", self.spooler_connect_timeout_secs),
            ("push_ping_timeout_secs", self.push_ping_timeout_secs),
            (
                "push_ping_interval_default_secs",
                self.push_ping_interval_default_secs,
            ),
            ("max_job_attempts", self.max_job_attempts as u64),
            ("job_poll_interval_ms", self.job_poll_interval_ms),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(CloudSpoolError::Config(format!("{name} must be greater than zero")));
            }
        }

        if self.push_ping_timeout_secs >= self.push_ping_interval_default_secs {
            return Err(CloudSpoolError::Config(
                "push_ping_timeout_secs must be shorter than push_ping_interval_default_secs"
                    .into(),
            ));
        }
        Ok(())
    }

    pub fn printer_poll_interval(&self) -> Duration {
        Duration::from_secs(self.printer_poll_interval_secs)
    }

    pub fn spooler_timeout(&self) -> Duration {
        Duration::from_secs(self.spooler_connect_timeout_secs)
    }

    pub fn job_poll_interval(&self) -> Duration {
        Duration::from_millis(self.job_poll_interval_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    /// Liveness settings handed to the push channel untouched.
    pub fn push_settings(&self) -> PushSettings {
        PushSettings {
            ping_timeout: Duration::from_secs(self.push_ping_timeout_secs),
            ping_interval_default: Duration::from_secs(self.push_ping_interval_default_secs),
        }
    }
}

/// Push channel liveness parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushSettings {
    pub ping_timeout: Duration,
    pub ping_interval_default: Duration,
}
