// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Fixture files seeding the in-memory spooler and cloud.
//
// Example:
//
//   {
//     "printers": [
//       { "name": "laser", "attributes": { "printer-info": "Laser, 2nd floor" } },
//       { "name": "labels", "raw": true }
//     ],
//     "cloud_printers": ["retired"],
//     "jobs": [
//       { "printer": "laser", "title": "minutes.pdf", "owner": "ann@example.com",
//         "document": "%PDF-1.7 ..." }
//     ],
//     "enrichment": { "laser": { "serial": "X1-0042" } }
//   }

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tracing::info;

use cloudspool_bridge::memory::{self, MemoryEnrichment};
use cloudspool_core::error::{CloudSpoolError, Result};
use cloudspool_core::types::{Attributes, Printer};
use cloudspool_manager::Collaborators;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FixturePrinter {
    pub name: String,
    pub display_name: Option<String>,
    pub attributes: Attributes,
    pub share_scope: String,
    pub raw: bool,
}

impl From<FixturePrinter> for Printer {
    fn from(p: FixturePrinter) -> Self {
        let mut printer = Printer::new(p.name);
        if let Some(display_name) = p.display_name {
            printer.display_name = display_name;
        }
        printer.attributes = p.attributes;
        printer.share_scope = p.share_scope;
        printer.raw = p.raw;
        printer
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FixtureJob {
    pub printer: String,
    pub title: String,
    pub owner: String,
    /// Document body, stored as UTF-8 bytes.
    pub document: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Fixture {
    /// Printers the spooler reports.
    pub printers: Vec<FixturePrinter>,
    /// Names already registered in the cloud, as a previous run left them.
    pub cloud_printers: Vec<String>,
    pub jobs: Vec<FixtureJob>,
    /// Per-printer answers of the enrichment source.
    pub enrichment: BTreeMap<String, Attributes>,
}

impl Fixture {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            CloudSpoolError::Config(format!("failed to read fixture {}: {e}", path.display()))
        })?;
        serde_json::from_str(&text).map_err(|e| {
            CloudSpoolError::Config(format!("failed to parse fixture {}: {e}", path.display()))
        })
    }

    /// Build in-memory collaborators holding this fixture's state.
    pub fn into_collaborators(self) -> Collaborators {
        let printers: Vec<Printer> = self.printers.into_iter().map(Printer::from).collect();
        let jobs = self
            .jobs
            .into_iter()
            .map(|j| (j.printer, j.title, j.owner, j.document.into_bytes()));
        let (spooler, cloud) = memory::seeded(printers, jobs);

        for name in &self.cloud_printers {
            cloud.register(&Printer::new(name.as_str()));
        }

        let enrichment = MemoryEnrichment::new();
        for (name, attributes) in self.enrichment {
            enrichment.set(&name, attributes);
        }

        info!(
            cloud_printers = self.cloud_printers.len(),
            "in-memory backends ready"
        );
        Collaborators {
            spooler: Arc::new(spooler),
            cloud: Arc::new(cloud),
            push: None,
            enrichment: Some(Arc::new(enrichment)),
        }
    }
}
