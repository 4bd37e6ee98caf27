// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// End-to-end scenarios for the printer manager against the in-memory
// spooler and cloud.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;

use cloudspool_bridge::CloudService;
use cloudspool_bridge::memory::{ChannelPush, MemoryCloud, MemorySpooler};
use cloudspool_core::config::ConnectorConfig;
use cloudspool_core::error::CloudSpoolError;
use cloudspool_core::types::{CloudJobStatus, JobId, JobTicket, Printer};
use cloudspool_manager::{Collaborators, PrinterManager, RefreshReason};

// =============================================================================
// Harness
// =============================================================================

struct Connector {
    manager: Arc<PrinterManager>,
    spooler: Arc<MemorySpooler>,
    cloud: Arc<MemoryCloud>,
}

fn config() -> ConnectorConfig {
    ConnectorConfig {
        job_poll_interval_ms: 100,
        ..Default::default()
    }
}

fn connector(config: ConnectorConfig) -> Connector {
    let spooler = Arc::new(MemorySpooler::new());
    let cloud = Arc::new(MemoryCloud::new());
    let manager = PrinterManager::new(
        &config,
        Collaborators {
            spooler: spooler.clone(),
            cloud: cloud.clone(),
            push: None,
            enrichment: None,
        },
        CancellationToken::new(),
    )
    .unwrap();
    Connector {
        manager,
        spooler,
        cloud,
    }
}

fn submit(cloud: &MemoryCloud, printer: &str, title: &str) -> JobId {
    cloud.submit(
        printer,
        title,
        "ann@example.com",
        JobTicket(serde_json::json!({ "version": "1.0" })),
        vec![0x25; 2048],
    )
}

/// Wait (on the paused clock) until no job is tracked.
async fn until_idle(manager: &PrinterManager) {
    for _ in 0..1200 {
        if manager.snapshot().jobs_in_flight == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    panic!("jobs still in flight: {:?}", manager.snapshot());
}

// =============================================================================
// Roster reconciliation
// =============================================================================

#[tokio::test]
async fn local_printer_missing_in_cloud_is_registered() {
    let c = connector(config());
    c.spooler.add_printer(Printer::new("A"));
    c.spooler.add_printer(Printer::new("B"));
    let a_id = c.cloud.register(&Printer::new("A"));

    let report = c.manager.run_cycle().await.unwrap().reconcile.unwrap();
    assert_eq!((report.created, report.updated, report.deleted), (1, 0, 0));
    assert_eq!(report.unchanged, 1);

    assert_eq!(c.cloud.operation_counts(), (1, 0, 0));
    assert_eq!(
        c.cloud.printer_names().into_iter().collect::<Vec<_>>(),
        vec!["A".to_string(), "B".to_string()]
    );
    assert_eq!(c.cloud.cloud_id_of("A"), Some(a_id));
}

#[tokio::test]
async fn cloud_printer_missing_locally_is_deleted() {
    let c = connector(config());
    c.spooler.add_printer(Printer::new("A"));
    c.cloud.register(&Printer::new("A"));
    c.cloud.register(&Printer::new("B"));

    let report = c.manager.run_cycle().await.unwrap().reconcile.unwrap();
    assert_eq!((report.created, report.updated, report.deleted), (0, 0, 1));
    assert_eq!(c.cloud.operation_counts(), (0, 0, 1));
    assert!(!c.cloud.printer_names().contains("B"));

    let snapshot = c.manager.snapshot();
    assert_eq!(snapshot.printer_count, 1);
    assert_eq!(snapshot.printers[0].name, "A");
}

#[tokio::test]
async fn reconciliation_is_idempotent() {
    let c = connector(config());
    for name in ["A", "B", "C"] {
        c.spooler.add_printer(Printer::new(name));
    }
    c.cloud.register(&Printer::new("stale"));

    let first = c.manager.run_cycle().await.unwrap().reconcile.unwrap();
    assert!(first.changes() > 0);
    let after_first = c.cloud.operation_counts();

    for _ in 0..3 {
        let again = c.manager.run_cycle().await.unwrap().reconcile.unwrap();
        assert_eq!(again.changes(), 0);
        assert_eq!(again.unchanged, 3);
    }
    assert_eq!(c.cloud.operation_counts(), after_first);
}

#[tokio::test]
async fn cloud_id_survives_attribute_changes() {
    let c = connector(config());
    c.spooler.add_printer(Printer::new("A"));
    c.manager.run_cycle().await.unwrap();
    let original = c.cloud.cloud_id_of("A").unwrap();

    c.spooler
        .add_printer(Printer::new("A").with_attribute("color-supported", "true"));
    let report = c.manager.run_cycle().await.unwrap().reconcile.unwrap();
    assert_eq!(report.updated, 1);

    assert_eq!(c.cloud.cloud_id_of("A"), Some(original.clone()));
    let snapshot = c.manager.snapshot();
    assert_eq!(snapshot.printers[0].cloud_id.as_deref(), Some(original.as_str()));
}

#[tokio::test]
async fn unreachable_cloud_leaves_roster_alone() {
    let c = connector(config());
    c.spooler.add_printer(Printer::new("A"));
    c.manager.run_cycle().await.unwrap();

    c.cloud.fail_auth(true);
    let outcome = c.manager.run_cycle().await.unwrap();
    assert!(outcome.reconcile.is_none());
    assert_eq!(c.manager.snapshot().printer_count, 1);

    c.cloud.fail_auth(false);
    c.spooler.remove_printer("A");
    let report = c.manager.run_cycle().await.unwrap().reconcile.unwrap();
    assert_eq!(report.deleted, 1);
}

#[tokio::test(start_paused = true)]
async fn lost_cloud_record_is_replaced_and_jobs_flow_again() {
    let c = connector(config());
    c.spooler.add_printer(Printer::new("A"));
    c.manager.run_cycle().await.unwrap();
    let lost = c.cloud.cloud_id_of("A").unwrap();
    c.cloud.delete_printer(&lost).await.unwrap();

    let outcome = c.manager.run_cycle().await.unwrap();
    let report = outcome.reconcile.unwrap();
    assert_eq!((report.created, report.failed), (1, 0));
    assert_eq!(outcome.discover.failed_listings, 0);

    let fresh = c.cloud.cloud_id_of("A").unwrap();
    assert_ne!(fresh, lost);
    let snapshot = c.manager.snapshot();
    assert_eq!(snapshot.printers[0].cloud_id.as_deref(), Some(fresh.as_str()));

    let id = submit(&c.cloud, "A", "after-outage.pdf");
    c.manager.run_cycle().await.unwrap();
    until_idle(&c.manager).await;
    assert_eq!(
        c.cloud.reports(&id),
        vec![CloudJobStatus::InProgress, CloudJobStatus::Done]
    );
    assert_eq!(c.spooler.submitted().len(), 1);
}

#[tokio::test]
async fn printer_gone_on_both_sides_is_forgotten() {
    let c = connector(config());
    c.spooler.add_printer(Printer::new("A"));
    c.spooler.add_printer(Printer::new("B"));
    c.manager.run_cycle().await.unwrap();

    let a_id = c.cloud.cloud_id_of("A").unwrap();
    c.cloud.delete_printer(&a_id).await.unwrap();
    c.spooler.remove_printer("A");

    let outcome = c.manager.run_cycle().await.unwrap();
    let report = outcome.reconcile.unwrap();
    assert_eq!((report.deleted, report.failed), (0, 0));
    assert_eq!(outcome.discover.failed_listings, 0);

    let snapshot = c.manager.snapshot();
    assert_eq!(snapshot.printer_count, 1);
    assert_eq!(snapshot.printers[0].name, "B");
}

// =============================================================================
// Job pipeline
// =============================================================================

#[tokio::test(start_paused = true)]
async fn job_retried_twice_then_printed() {
    let c = connector(ConnectorConfig {
        max_job_attempts: 3,
        ..config()
    });
    c.spooler.add_printer(Printer::new("A"));
    c.manager.run_cycle().await.unwrap();

    c.cloud.fail_fetches(2);
    let id = submit(&c.cloud, "A", "quarterly.pdf");
    c.manager.run_cycle().await.unwrap();
    until_idle(&c.manager).await;

    assert_eq!(
        c.cloud.reports(&id),
        vec![CloudJobStatus::InProgress, CloudJobStatus::Done]
    );
    assert_eq!(c.spooler.submitted().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_job_reported_failed_once() {
    let c = connector(ConnectorConfig {
        max_job_attempts: 3,
        ..config()
    });
    c.spooler.add_printer(Printer::new("A"));
    c.manager.run_cycle().await.unwrap();

    c.cloud.fail_fetches(100);
    let id = submit(&c.cloud, "A", "doomed.pdf");
    c.manager.run_cycle().await.unwrap();
    until_idle(&c.manager).await;

    // Later cycles must not pick it up again.
    for _ in 0..3 {
        c.manager.run_cycle().await.unwrap();
    }
    until_idle(&c.manager).await;

    let reports = c.cloud.reports(&id);
    assert_eq!(reports.len(), 1, "{reports:?}");
    assert!(matches!(reports[0], CloudJobStatus::Error { .. }));
    assert!(c.spooler.submitted().is_empty());
}

#[tokio::test(start_paused = true)]
async fn full_queue_defers_without_losing_jobs() {
    let c = connector(ConnectorConfig {
        max_concurrent_downloads: 1,
        job_queue_size: 2,
        ..config()
    });
    c.spooler.add_printer(Printer::new("A"));
    c.manager.run_cycle().await.unwrap();

    c.cloud.set_fetch_delay(Duration::from_millis(500));
    let ids: Vec<JobId> = (0..10)
        .map(|i| submit(&c.cloud, "A", &format!("page-{i}")))
        .collect();

    let first = c.manager.run_cycle().await.unwrap().discover;
    assert_eq!(first.admitted, 2);
    assert_eq!(first.deferred, 8);

    for _ in 0..40 {
        if c.spooler.submitted().len() == ids.len() {
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        c.manager.run_cycle().await.unwrap();
    }
    until_idle(&c.manager).await;

    for id in &ids {
        let reports = c.cloud.reports(id);
        assert_eq!(
            reports.iter().filter(|r| **r == CloudJobStatus::Done).count(),
            1,
            "job {id}: {reports:?}"
        );
    }
    let titles: HashSet<_> = c.spooler.submitted().into_iter().map(|j| j.title).collect();
    assert_eq!(titles.len(), ids.len());
}

#[tokio::test(start_paused = true)]
async fn downloads_never_exceed_token_pool() {
    let c = connector(ConnectorConfig {
        max_concurrent_downloads: 3,
        job_queue_size: 8,
        ..config()
    });
    let printers = ["A", "B", "C", "D"];
    for name in printers {
        c.spooler.add_printer(Printer::new(name));
    }
    c.manager.run_cycle().await.unwrap();
    c.cloud.set_fetch_delay(Duration::from_millis(300));

    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut ids = Vec::new();
    for round in 0..12 {
        for _ in 0..rng.random_range(0..6) {
            let printer = printers[rng.random_range(0..printers.len())];
            ids.push(submit(&c.cloud, printer, &format!("round-{round}")));
        }
        c.manager.run_cycle().await.unwrap();
        tokio::time::sleep(Duration::from_millis(rng.random_range(50..800))).await;
    }
    for _ in 0..60 {
        c.manager.run_cycle().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    until_idle(&c.manager).await;

    assert!(c.cloud.max_concurrent_fetches() <= 3);
    assert!(c.cloud.max_concurrent_fetches() > 0);
    for id in &ids {
        assert_eq!(c.cloud.reports(id).last(), Some(&CloudJobStatus::Done));
    }
    assert_eq!(c.spooler.submitted().len(), ids.len());
}

#[tokio::test(start_paused = true)]
async fn exclusive_printer_runs_one_job_at_a_time() {
    let c = connector(ConnectorConfig {
        max_concurrent_downloads: 4,
        allow_concurrent_jobs_per_printer: false,
        ..config()
    });
    c.spooler.add_printer(Printer::new("A"));
    c.spooler.set_polls_until_done(5);
    c.manager.run_cycle().await.unwrap();

    for i in 0..3 {
        submit(&c.cloud, "A", &format!("doc-{i}"));
    }
    c.manager.run_cycle().await.unwrap();

    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let counts = c.manager.snapshot().printers[0].jobs;
        assert!(counts.active <= 1, "{counts:?}");
    }
    until_idle(&c.manager).await;
    assert_eq!(c.spooler.submitted().len(), 3);
}

// =============================================================================
// Triggers and lifecycle
// =============================================================================

#[tokio::test(start_paused = true)]
async fn refresh_burst_runs_one_cycle() {
    let c = connector(config());
    c.manager.start().unwrap();
    for _ in 0..20 {
        c.manager.request_refresh(RefreshReason::Manual).unwrap();
    }

    tokio::time::sleep(Duration::from_secs(1)).await;
    let stats = c.manager.snapshot().triggers;
    assert_eq!(stats.requested, 21);
    assert_eq!(stats.coalesced, 20);
    assert_eq!(stats.delivered, 1);

    c.manager.quit().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn push_refresh_picks_up_new_printer() {
    let spooler = Arc::new(MemorySpooler::new());
    let cloud = Arc::new(MemoryCloud::new());
    let config = config();
    let (push, sender) = ChannelPush::new(config.push_settings());
    let manager = PrinterManager::new(
        &config,
        Collaborators {
            spooler: spooler.clone(),
            cloud: cloud.clone(),
            push: Some(Arc::new(push)),
            enrichment: None,
        },
        CancellationToken::new(),
    )
    .unwrap();

    manager.start().unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(cloud.printer_names().is_empty());

    spooler.add_printer(Printer::new("A"));
    sender.refresh();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(cloud.printer_names().contains("A"));
    assert_eq!(manager.snapshot().push_alive, Some(true));
    manager.quit().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn timer_picks_up_changes_without_push() {
    let c = connector(config());
    c.manager.start().unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    c.spooler.add_printer(Printer::new("A"));
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(c.cloud.printer_names().is_empty());

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(c.cloud.printer_names().contains("A"));
    c.manager.quit().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn quit_abandons_printing_jobs_without_reporting() {
    let c = connector(config());
    c.spooler.add_printer(Printer::new("A"));
    c.spooler.set_polls_until_done(u32::MAX);
    c.manager.run_cycle().await.unwrap();

    let id = submit(&c.cloud, "A", "endless.pdf");
    c.manager.run_cycle().await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(c.manager.snapshot().printers[0].jobs.active, 1);

    let report = c.manager.quit().await.unwrap();
    assert!(report.drained);
    assert_eq!(report.abandoned_jobs, 0);
    assert_eq!(c.cloud.reports(&id), vec![CloudJobStatus::InProgress]);

    assert!(matches!(
        c.manager.run_cycle().await,
        Err(CloudSpoolError::ShutDown)
    ));
    assert!(matches!(
        c.manager.request_refresh(RefreshReason::Manual),
        Err(CloudSpoolError::ShutDown)
    ));
}

#[tokio::test(start_paused = true)]
async fn process_token_stops_the_manager() {
    let root = CancellationToken::new();
    let spooler = Arc::new(MemorySpooler::new());
    let cloud = Arc::new(MemoryCloud::new());
    let manager = PrinterManager::new(
        &config(),
        Collaborators {
            spooler,
            cloud: cloud.clone(),
            push: None,
            enrichment: None,
        },
        root.clone(),
    )
    .unwrap();
    manager.start().unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    root.cancel();
    let report = manager.quit().await.unwrap();
    assert!(report.drained);
}
