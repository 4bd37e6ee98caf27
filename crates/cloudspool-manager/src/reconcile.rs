// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Printer roster reconciliation.
//
// One cycle lists the spooler's printers and the cloud's records, diffs them
// by spooler name, and applies the difference:
//
//   1. cloud records with no local printer are deleted,
//   2. local printers with no cloud record are registered,
//   3. printers whose fingerprint differs from the cloud's are updated.
//
// Deletions run first so a renamed printer (seen as delete + create) never
// has two live records.  Every per-printer operation is isolated: a failure is
// logged and left for the next cycle.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use cloudspool_bridge::{CloudService, EnrichmentSource, Spooler};
use cloudspool_core::error::{CloudSpoolError, Result};
use cloudspool_core::types::{CloudPrinter, PRINTER_INFO_ATTRIBUTE, Printer};

use crate::health::SyncBreaker;
use crate::table::PrinterTable;

/// Registration policy.
#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    pub ignore_raw_printers: bool,
    /// Applied to printers the spooler reports without a share scope.
    pub share_scope: String,
    pub copy_printer_info_to_display_name: bool,
    /// Upper bound on the spooler listing call.
    pub spooler_timeout: Duration,
}

/// Difference between the local and the cloud roster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RosterDiff {
    /// Local printers with no cloud record.
    pub added: Vec<Printer>,
    /// Cloud records with no local printer (or duplicate records).
    pub removed: Vec<CloudPrinter>,
    /// Printers whose content changed; `cloud_id` is set.
    pub changed: Vec<Printer>,
    /// Printers already in sync; `cloud_id` is set.
    pub unchanged: Vec<Printer>,
}

impl RosterDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Diff two rosters by spooler name.
///
/// If the cloud holds several records for one name, the first is kept and
/// the rest are scheduled for deletion.
pub fn diff_rosters(local: Vec<Printer>, cloud: Vec<CloudPrinter>) -> RosterDiff {
    let mut diff = RosterDiff::default();

    let mut records: BTreeMap<String, CloudPrinter> = BTreeMap::new();
    for record in cloud {
        if records.contains_key(&record.name) {
            diff.removed.push(record);
        } else {
            records.insert(record.name.clone(), record);
        }
    }

    let local: BTreeMap<String, Printer> =
        local.into_iter().map(|p| (p.name.clone(), p)).collect();

    for (name, mut printer) in local {
        match records.remove(&name) {
            None => {
                printer.cloud_id = None;
                diff.added.push(printer);
            }
            Some(record) => {
                let in_sync = record.fingerprint == printer.fingerprint();
                printer.cloud_id = Some(record.cloud_id);
                if in_sync {
                    diff.unchanged.push(printer);
                } else {
                    diff.changed.push(printer);
                }
            }
        }
    }

    diff.removed.extend(records.into_values());
    diff
}

/// Outcome of one reconciliation cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    /// Operations that failed and will be retried next cycle.
    pub failed: usize,
    /// Printers skipped by policy or by an open circuit.
    pub skipped: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl CycleReport {
    pub fn changes(&self) -> usize {
        self.created + self.updated + self.deleted
    }
}

/// Keeps the cloud roster in line with the spooler's.
pub struct ReconciliationEngine {
    spooler: Arc<dyn Spooler>,
    cloud: Arc<dyn CloudService>,
    enrichment: Option<Arc<dyn EnrichmentSource>>,
    printers: Arc<PrinterTable>,
    breaker: Mutex<SyncBreaker>,
    settings: ReconcileSettings,
}

impl ReconciliationEngine {
    pub fn new(
        spooler: Arc<dyn Spooler>,
        cloud: Arc<dyn CloudService>,
        enrichment: Option<Arc<dyn EnrichmentSource>>,
        printers: Arc<PrinterTable>,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            spooler,
            cloud,
            enrichment,
            printers,
            breaker: Mutex::new(SyncBreaker::new()),
            settings,
        }
    }

    /// Printers whose sync is currently suspended by the circuit breaker.
    pub fn suspended_printers(&self) -> Vec<String> {
        self.breaker().suspended()
    }

    fn breaker(&self) -> std::sync::MutexGuard<'_, SyncBreaker> {
        self.breaker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run one cycle.
    ///
    /// Fails only when a roster cannot be read at all (or on shutdown);
    /// per-printer failures are counted in the report.
    #[instrument(skip_all)]
    pub async fn reconcile(&self, shutdown: &CancellationToken) -> Result<CycleReport> {
        let mut report = CycleReport {
            started_at: Some(Utc::now()),
            ..Default::default()
        };

        self.cloud.access_token().await?;

        let local = tokio::time::timeout(self.settings.spooler_timeout, self.spooler.list_printers())
            .await
            .map_err(|_| CloudSpoolError::SpoolerTimeout(self.settings.spooler_timeout))??;
        let cloud = self.cloud.list_printers().await?;
        checkpoint(shutdown)?;

        let local = self.prepare(local, &mut report, shutdown).await?;
        self.prune(&local, &cloud);
        let diff = diff_rosters(local, cloud);
        debug!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            changed = diff.changed.len(),
            "roster diff computed"
        );

        for record in diff.removed {
            checkpoint(shutdown)?;
            self.delete(record, &mut report).await;
        }
        for printer in diff.added {
            checkpoint(shutdown)?;
            self.register(printer, &mut report).await;
        }
        for printer in diff.changed {
            checkpoint(shutdown)?;
            self.update(printer, &mut report).await;
        }
        for printer in diff.unchanged {
            let name = printer.name.clone();
            match self.printers.upsert(printer) {
                Ok(_) => report.unchanged += 1,
                Err(e) => {
                    warn!(printer = %name, error = %e, "printer table rejected cloud record");
                    report.failed += 1;
                }
            }
        }

        report.finished_at = Some(Utc::now());
        if report.changes() > 0 || report.failed > 0 {
            info!(
                created = report.created,
                updated = report.updated,
                deleted = report.deleted,
                failed = report.failed,
                "reconciliation cycle applied"
            );
        } else {
            debug!(unchanged = report.unchanged, "roster already in sync");
        }
        Ok(report)
    }

    /// Apply policy and enrichment to the spooler's printers.
    async fn prepare(
        &self,
        local: Vec<Printer>,
        report: &mut CycleReport,
        shutdown: &CancellationToken,
    ) -> Result<Vec<Printer>> {
        let mut out = Vec::with_capacity(local.len());
        for mut printer in local {
            if printer.name.is_empty() {
                warn!("spooler reported a printer without a name, ignoring");
                continue;
            }
            if self.settings.ignore_raw_printers && printer.raw {
                debug!(printer = %printer.name, "ignoring raw printer");
                report.skipped += 1;
                continue;
            }
            if printer.share_scope.is_empty() {
                printer.share_scope = self.settings.share_scope.clone();
            }
            if self.settings.copy_printer_info_to_display_name {
                if let Some(info) = printer.attributes.get(PRINTER_INFO_ATTRIBUTE) {
                    if !info.trim().is_empty() {
                        printer.display_name = info.clone();
                    }
                }
            }
            if let Some(source) = &self.enrichment {
                checkpoint(shutdown)?;
                printer.tags = match source.describe(&printer).await {
                    Ok(tags) => tags,
                    Err(e) => {
                        // Keep the last known tags so a flaky device does not
                        // flip the fingerprint back and forth.
                        debug!(printer = %printer.name, error = %e, "enrichment unavailable");
                        self.printers.get(&printer.name).and_then(|e| e.printer().tags)
                    }
                };
            }
            out.push(printer);
        }
        Ok(out)
    }

    /// Drop table entries that no longer stand for a live pair: the printer
    /// left the prepared roster, or the cloud no longer lists its record.
    /// A printer whose record vanished is registered afresh by the diff.
    fn prune(&self, local: &[Printer], cloud: &[CloudPrinter]) {
        let names: BTreeSet<&str> = local.iter().map(|p| p.name.as_str()).collect();
        let live: BTreeSet<&str> = cloud.iter().map(|r| r.cloud_id.as_str()).collect();

        for (name, cloud_id) in self.printers.registered() {
            if !names.contains(name.as_str()) {
                debug!(printer = %name, "printer left the spooler, dropping table entry");
                self.printers.remove(&name);
                self.breaker().forget(&name);
            } else if !live.contains(cloud_id.as_str()) {
                warn!(printer = %name, cloud_id = %cloud_id, "cloud record vanished, registering again");
                self.printers.remove(&name);
            }
        }
    }

    async fn delete(&self, record: CloudPrinter, report: &mut CycleReport) {
        // Whatever the cloud says, the printer is gone locally.
        if let Some(entry) = self.printers.get(&record.name) {
            if entry.cloud_id().as_deref() == Some(record.cloud_id.as_str()) {
                self.printers.remove(&record.name);
            }
        }

        match self.cloud.delete_printer(&record.cloud_id).await {
            Ok(()) => {
                info!(printer = %record.name, cloud_id = %record.cloud_id, "deleted cloud printer");
                self.breaker().forget(&record.name);
                report.deleted += 1;
            }
            Err(e) => {
                warn!(printer = %record.name, error = %e, "failed to delete cloud printer");
                report.failed += 1;
            }
        }
    }

    async fn register(&self, printer: Printer, report: &mut CycleReport) {
        if !self.breaker().allow(&printer.name) {
            report.skipped += 1;
            return;
        }

        match self.cloud.sync_printer(&printer).await {
            Ok(cloud_id) => {
                self.breaker().succeeded(&printer.name);
                let name = printer.name.clone();
                let registered = Printer {
                    cloud_id: Some(cloud_id.clone()),
                    ..printer
                };
                match self.printers.upsert(registered) {
                    Ok(_) => {
                        info!(printer = %name, cloud_id = %cloud_id, "registered printer");
                        report.created += 1;
                    }
                    Err(e) => {
                        warn!(printer = %name, error = %e, "registered printer conflicts with table");
                        report.failed += 1;
                    }
                }
            }
            Err(e) => {
                self.breaker().failed(&printer.name, &e.to_string());
                warn!(printer = %printer.name, error = %e, "failed to register printer");
                report.failed += 1;
            }
        }
    }

    async fn update(&self, printer: Printer, report: &mut CycleReport) {
        if !self.breaker().allow(&printer.name) {
            report.skipped += 1;
            return;
        }

        let expected = printer.cloud_id.clone();
        match self.cloud.sync_printer(&printer).await {
            Ok(cloud_id) if Some(&cloud_id) != expected.as_ref() => {
                let e = CloudSpoolError::CloudIdReassigned {
                    printer: printer.name.clone(),
                    existing: expected.unwrap_or_default(),
                    proposed: cloud_id.clone(),
                };
                warn!(printer = %printer.name, error = %e, "cloud answered update with a new id");
                self.breaker().failed(&printer.name, &e.to_string());
                report.failed += 1;

                // The stray record would otherwise live on as a duplicate.
                if let Err(e) = self.cloud.delete_printer(&cloud_id).await {
                    warn!(printer = %printer.name, cloud_id = %cloud_id, error = %e, "failed to delete stray cloud record");
                }
            }
            Ok(_) => {
                self.breaker().succeeded(&printer.name);
                let name = printer.name.clone();
                match self.printers.upsert(printer) {
                    Ok(_) => {
                        info!(printer = %name, "updated printer");
                        report.updated += 1;
                    }
                    Err(e) => {
                        warn!(printer = %name, error = %e, "updated printer conflicts with table");
                        report.failed += 1;
                    }
                }
            }
            Err(e) => {
                self.breaker().failed(&printer.name, &e.to_string());
                warn!(printer = %printer.name, error = %e, "failed to update printer");
                report.failed += 1;
            }
        }
    }
}

fn checkpoint(shutdown: &CancellationToken) -> Result<()> {
    if shutdown.is_cancelled() {
        return Err(CloudSpoolError::Cancelled);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudspool_bridge::memory::{MemoryCloud, MemoryEnrichment, MemorySpooler};
    use cloudspool_core::types::Attributes;

    fn settings() -> ReconcileSettings {
        ReconcileSettings {
            ignore_raw_printers: true,
            share_scope: "team@example.com".into(),
            copy_printer_info_to_display_name: true,
            spooler_timeout: Duration::from_secs(5),
        }
    }

    struct Rig {
        spooler: Arc<MemorySpooler>,
        cloud: Arc<MemoryCloud>,
        enrichment: Arc<MemoryEnrichment>,
        table: Arc<PrinterTable>,
        engine: ReconciliationEngine,
    }

    fn rig(with_enrichment: bool) -> Rig {
        let spooler = Arc::new(MemorySpooler::new());
        let cloud = Arc::new(MemoryCloud::new());
        let enrichment = Arc::new(MemoryEnrichment::new());
        let table = Arc::new(PrinterTable::new());
        let source: Option<Arc<dyn EnrichmentSource>> = if with_enrichment {
            Some(enrichment.clone())
        } else {
            None
        };
        let engine = ReconciliationEngine::new(
            spooler.clone(),
            cloud.clone(),
            source,
            Arc::clone(&table),
            settings(),
        );
        Rig {
            spooler,
            cloud,
            enrichment,
            table,
            engine,
        }
    }

    #[test]
    fn diff_splits_roster() {
        let a = Printer::new("a");
        let b = Printer::new("b");
        let c = Printer::new("c");
        let mut b_changed = b.clone();
        b_changed.display_name = "B!".into();

        let cloud = vec![
            CloudPrinter {
                cloud_id: "1".into(),
                name: "a".into(),
                fingerprint: a.fingerprint(),
            },
            CloudPrinter {
                cloud_id: "2".into(),
                name: "b".into(),
                fingerprint: b.fingerprint(),
            },
            CloudPrinter {
                cloud_id: "3".into(),
                name: "gone".into(),
                fingerprint: String::new(),
            },
        ];
        let diff = diff_rosters(vec![a, b_changed, c], cloud);

        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].name, "c");
        assert_eq!(diff.changed.len(), 1);
        assert_eq!(diff.changed[0].cloud_id.as_deref(), Some("2"));
        assert_eq!(diff.unchanged.len(), 1);
        assert_eq!(diff.removed.len(), 1);
        assert_eq!(diff.removed[0].name, "gone");
    }

    #[test]
    fn duplicate_cloud_records_are_removed() {
        let a = Printer::new("a");
        let record = |id: &str| CloudPrinter {
            cloud_id: id.into(),
            name: "a".into(),
            fingerprint: a.fingerprint(),
        };
        let diff = diff_rosters(vec![a.clone()], vec![record("1"), record("2")]);
        assert_eq!(diff.unchanged[0].cloud_id.as_deref(), Some("1"));
        assert_eq!(diff.removed, vec![record("2")]);
    }

    #[tokio::test]
    async fn raw_printers_are_not_registered() {
        let rig = rig(false);
        let mut raw = Printer::new("label");
        raw.raw = true;
        rig.spooler.add_printer(raw);
        rig.spooler.add_printer(Printer::new("laser"));

        let report = rig.engine.reconcile(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(rig.table.names(), vec!["laser".to_string()]);
    }

    #[tokio::test]
    async fn default_share_scope_and_display_name_applied() {
        let rig = rig(false);
        rig.spooler
            .add_printer(Printer::new("laser").with_attribute(PRINTER_INFO_ATTRIBUTE, "Laser 2F"));

        rig.engine.reconcile(&CancellationToken::new()).await.unwrap();
        let stored = rig.table.get("laser").unwrap().printer();
        assert_eq!(stored.share_scope, "team@example.com");
        assert_eq!(stored.display_name, "Laser 2F");
    }

    #[tokio::test]
    async fn one_failing_printer_does_not_stop_the_rest() {
        let rig = rig(false);
        for name in ["a", "b", "c"] {
            rig.spooler.add_printer(Printer::new(name));
        }
        rig.cloud.fail_sync_for("b", true);

        let report = rig.engine.reconcile(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.created, 2);
        assert_eq!(report.failed, 1);

        rig.cloud.fail_sync_for("b", false);
        let report = rig.engine.reconcile(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(rig.cloud.printer_names().len(), 3);
    }

    #[tokio::test]
    async fn enrichment_change_triggers_update() {
        let rig = rig(true);
        rig.spooler.add_printer(Printer::new("laser"));
        rig.engine.reconcile(&CancellationToken::new()).await.unwrap();

        rig.enrichment
            .set("laser", Attributes::from([("serial".into(), "X1".into())]));
        let report = rig.engine.reconcile(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.updated, 1);
    }

    #[tokio::test]
    async fn enrichment_failure_still_registers() {
        let rig = rig(true);
        rig.spooler.add_printer(Printer::new("laser"));
        rig.enrichment.fail_for("laser");

        let report = rig.engine.reconcile(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.created, 1);
        assert!(rig.table.get("laser").unwrap().printer().tags.is_none());
    }

    #[tokio::test]
    async fn unreadable_spooler_aborts_cycle_without_deleting() {
        let rig = rig(false);
        rig.cloud.register(&Printer::new("laser"));
        rig.spooler.fail_listing(true);

        assert!(rig.engine.reconcile(&CancellationToken::new()).await.is_err());
        assert_eq!(rig.cloud.operation_counts(), (0, 0, 0));
    }

    #[tokio::test]
    async fn cancelled_cycle_stops_at_checkpoint() {
        let rig = rig(false);
        rig.spooler.add_printer(Printer::new("laser"));
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        assert!(matches!(
            rig.engine.reconcile(&shutdown).await,
            Err(CloudSpoolError::Cancelled)
        ));
        assert!(rig.cloud.printer_names().is_empty());
    }

    #[tokio::test]
    async fn repeated_sync_failures_open_the_circuit() {
        let rig = rig(false);
        rig.spooler.add_printer(Printer::new("laser"));
        rig.cloud.fail_sync_for("laser", true);

        for _ in 0..3 {
            rig.engine.reconcile(&CancellationToken::new()).await.unwrap();
        }
        let report = rig.engine.reconcile(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(rig.engine.suspended_printers(), vec!["laser".to_string()]);
    }

    #[tokio::test]
    async fn vanished_cloud_record_is_registered_again() {
        let rig = rig(false);
        let shutdown = CancellationToken::new();
        rig.spooler.add_printer(Printer::new("laser"));
        rig.engine.reconcile(&shutdown).await.unwrap();
        let lost = rig.table.get("laser").unwrap().cloud_id().unwrap();
        rig.cloud.delete_printer(&lost).await.unwrap();

        let report = rig.engine.reconcile(&shutdown).await.unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(report.failed, 0);
        let fresh = rig.cloud.cloud_id_of("laser").unwrap();
        assert_ne!(fresh, lost);
        assert_eq!(rig.table.get("laser").unwrap().cloud_id(), Some(fresh));

        let report = rig.engine.reconcile(&shutdown).await.unwrap();
        assert_eq!((report.changes(), report.failed, report.unchanged), (0, 0, 1));
    }

    #[tokio::test]
    async fn printer_gone_from_both_sides_leaves_the_table() {
        let rig = rig(false);
        let shutdown = CancellationToken::new();
        rig.spooler.add_printer(Printer::new("laser"));
        rig.spooler.add_printer(Printer::new("inkjet"));
        rig.engine.reconcile(&shutdown).await.unwrap();

        let cloud_id = rig.table.get("laser").unwrap().cloud_id().unwrap();
        rig.cloud.delete_printer(&cloud_id).await.unwrap();
        rig.spooler.remove_printer("laser");

        let report = rig.engine.reconcile(&shutdown).await.unwrap();
        assert_eq!(report.failed, 0);
        assert_eq!(rig.table.names(), vec!["inkjet".to_string()]);
        assert_eq!(rig.table.registered().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reassigned_update_counts_as_a_sync_failure() {
        let rig = rig(false);
        let shutdown = CancellationToken::new();
        rig.spooler.add_printer(Printer::new("laser"));
        rig.engine.reconcile(&shutdown).await.unwrap();
        let original = rig.cloud.cloud_id_of("laser").unwrap();

        let mut moved = Printer::new("laser");
        moved.display_name = "Laser, 3rd floor".into();
        rig.spooler.add_printer(moved);
        rig.cloud.reassign_on_update("laser", true);

        for _ in 0..3 {
            let report = rig.engine.reconcile(&shutdown).await.unwrap();
            assert_eq!(report.failed, 1);
        }
        assert_eq!(rig.engine.suspended_printers(), vec!["laser".to_string()]);
        // Every stray record was deleted again.
        assert_eq!(rig.cloud.operation_counts().2, 3);
        assert_eq!(rig.cloud.cloud_id_of("laser"), Some(original.clone()));

        // A probe that gets another new id must not wedge the breaker.
        tokio::time::advance(Duration::from_secs(31)).await;
        let report = rig.engine.reconcile(&shutdown).await.unwrap();
        assert_eq!((report.failed, report.skipped), (1, 0));

        rig.cloud.reassign_on_update("laser", false);
        tokio::time::advance(Duration::from_secs(31)).await;
        let report = rig.engine.reconcile(&shutdown).await.unwrap();
        assert_eq!(report.updated, 1);
        assert!(rig.engine.suspended_printers().is_empty());
        assert_eq!(rig.table.get("laser").unwrap().cloud_id(), Some(original));
    }
}
