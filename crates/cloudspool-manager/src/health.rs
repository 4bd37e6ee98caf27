// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Per-printer sync health with a circuit breaker.
//
// A printer whose cloud record keeps failing to sync is skipped for a
// cooldown instead of being retried every cycle.  Once the cooldown expires
// one probe sync is let through; success closes the circuit.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Consecutive sync failures that open the circuit.
const OPEN_AFTER: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Syncs pass through.
    Closed,
    /// Syncs are skipped until the cooldown expires.
    Open { since: Instant },
    /// One probe sync is out.
    Probing,
}

/// Sync record of one printer.
#[derive(Debug, Clone)]
pub struct SyncHealth {
    pub state: CircuitState,
    pub failures: u32,
    pub last_error: Option<String>,
}

impl SyncHealth {
    fn healthy() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            last_error: None,
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open {
            since: Instant::now(),
        };
    }
}

/// Sync health of every printer the reconciliation engine has touched.
#[derive(Default)]
pub struct SyncBreaker {
    printers: HashMap<String, SyncHealth>,
}

impl SyncBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a sync for `printer` should go out now.
    pub fn allow(&mut self, printer: &str) -> bool {
        let Some(health) = self.printers.get_mut(printer) else {
            return true;
        };
        match health.state {
            CircuitState::Closed => true,
            CircuitState::Probing => false,
            CircuitState::Open { since } => {
                let cooldown = cooldown_for(health.failures);
                let waited = since.elapsed();
                if waited >= cooldown {
                    info!(printer, failures = health.failures, "sync cooldown over, probing");
                    health.state = CircuitState::Probing;
                    true
                } else {
                    debug!(
                        printer,
                        remaining_ms = (cooldown - waited).as_millis(),
                        "sync suspended"
                    );
                    false
                }
            }
        }
    }

    pub fn succeeded(&mut self, printer: &str) {
        if let Some(previous) = self.printers.insert(printer.to_string(), SyncHealth::healthy()) {
            if previous.state != CircuitState::Closed {
                info!(printer, "printer sync recovered");
            }
        }
    }

    pub fn failed(&mut self, printer: &str, error: &str) {
        let health = self
            .printers
            .entry(printer.to_string())
            .or_insert_with(SyncHealth::healthy);
        health.failures += 1;
        health.last_error = Some(error.to_string());

        match health.state {
            CircuitState::Probing => {
                warn!(printer, "probe sync failed, suspending again");
                health.open();
            }
            CircuitState::Closed if health.failures >= OPEN_AFTER => {
                warn!(printer, failures = health.failures, "suspending printer sync");
                health.open();
            }
            _ => {}
        }
    }

    /// Drop a printer that left the roster.
    pub fn forget(&mut self, printer: &str) {
        self.printers.remove(printer);
    }

    #[cfg(test)]
    fn health(&self, printer: &str) -> Option<&SyncHealth> {
        self.printers.get(printer)
    }

    /// Printers whose syncs are currently held back, sorted.
    pub fn suspended(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .printers
            .iter()
            .filter(|(_, h)| h.state != CircuitState::Closed)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

/// 30 seconds, then 2 minutes from the fifth failure, 5 minutes from the tenth.
fn cooldown_for(failures: u32) -> Duration {
    match failures {
        0..=4 => Duration::from_secs(30),
        5..=9 => Duration::from_secs(120),
        _ => Duration::from_secs(300),
    }
}
