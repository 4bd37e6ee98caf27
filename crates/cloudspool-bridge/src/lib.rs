// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// CloudSpool Bridge: the narrow interfaces the connector consumes from its
// external collaborators, plus in-memory implementations used for fixture
// runs and tests.

pub mod memory;
pub mod traits;

pub use traits::{CloudService, EnrichmentSource, JobSubmission, PushChannel, PushEvent, Spooler};
