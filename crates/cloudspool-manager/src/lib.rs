// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// CloudSpool Manager: keeps the cloud printer roster in line with the local
// spooler and moves cloud jobs through it.  The collaborators it drives are
// defined in `cloudspool-bridge`.

pub mod health;
pub mod manager;
pub mod pipeline;
pub mod reconcile;
pub mod retry;
pub mod shutdown;
pub mod table;
pub mod trigger;

pub use manager::{Collaborators, Lifecycle, ManagerSnapshot, PrinterManager, QuitReport};
pub use reconcile::{CycleReport, ReconciliationEngine, diff_rosters};
pub use shutdown::{ShutdownController, ShutdownPhase};
pub use trigger::{RefreshReason, TriggerCoordinator};
