// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Two-step shutdown: the first stop signal drains, the second forces exit.

use std::sync::atomic::{AtomicU8, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    /// Still running.
    Running,
    /// Stop requested; in-flight work is winding down.
    Draining,
    /// Asked again while draining; exit immediately.
    Forced,
}

impl ShutdownPhase {
    /// Process exit code for a shutdown ending in this phase.
    pub fn exit_code(self, drained: bool) -> i32 {
        match self {
            ShutdownPhase::Draining | ShutdownPhase::Running if drained => 0,
            _ => 1,
        }
    }
}

/// Counts stop signals and cancels the root token on the first one.
#[derive(Debug, Default)]
pub struct ShutdownController {
    token: CancellationToken,
    signals: AtomicU8,
}

impl ShutdownController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Root token; everything the connector spawns watches a child of it.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn phase(&self) -> ShutdownPhase {
        match self.signals.load(Ordering::SeqCst) {
            0 => ShutdownPhase::Running,
            1 => ShutdownPhase::Draining,
            _ => ShutdownPhase::Forced,
        }
    }

    /// Record a stop signal and return the phase it moved us into.
    pub fn signal(&self) -> ShutdownPhase {
        let previous = self
            .signals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_add(1)))
            .unwrap_or_else(|n| n);
        if previous == 0 {
            info!("stop requested, draining in-flight work");
            self.token.cancel();
            ShutdownPhase::Draining
        } else {
            warn!("second stop signal while draining, forcing exit");
            ShutdownPhase::Forced
        }
    }
}
