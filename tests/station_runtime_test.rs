//! Station runtime tests: shift workers, the shared reservation gate and
//! configuration-driven wiring

mod fixtures;

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_test::assert_ok;

use packline::config::{LedgerBackend, PacklineConfig};
use packline::packer::{BoxPacker, PackagingPhase};
use packline::scanner::{subscribe, LineScanSource};
use packline::session::{ScanOutcome, SessionMode};
use packline::station::{ShiftOptions, Station, StationError, StationLock};
use packline::types::{ProductId, ShiftId};

use fixtures::{product, raw_unit, CountingCaseCodes, GatedPrinter, Harness, ScriptedPrinter, SlowScanStore};

fn options(shift: &str, capacity: u32) -> ShiftOptions {
    ShiftOptions {
        shift_id: ShiftId::new(shift),
        product_id: product().id,
        capacity: Some(capacity),
        mode: SessionMode::Packaging,
    }
}

fn station(harness: &Harness) -> Station {
    Station::new("station-test", 6, [product()], harness.collaborators())
}

#[tokio::test]
async fn test_concurrent_initialize_reserves_once() {
    let harness = Harness::new();
    let case_codes = Arc::new(CountingCaseCodes::new().with_reserve_delay(Duration::from_millis(50)));
    let printer = Arc::new(ScriptedPrinter::new());
    let shift = ShiftId::new("shift-a");

    let mut first = BoxPacker::new(shift.clone(), product(), 6, case_codes.clone(), printer.clone())
        .with_gate(harness.gate.clone());
    let mut second = BoxPacker::new(shift.clone(), product(), 6, case_codes.clone(), printer)
        .with_gate(harness.gate.clone());

    let product_id = product().id;
    let (a, b) = tokio::join!(
        first.initialize(&shift, &product_id, 6),
        second.initialize(&shift, &product_id, 6)
    );

    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(case_codes.reservation_count(), 1);
    assert_eq!(first.phase(), PackagingPhase::Accumulating);
    assert_eq!(second.phase(), PackagingPhase::Accumulating);
}

#[tokio::test]
async fn test_scans_rejected_while_label_prints() {
    let printer = Arc::new(GatedPrinter::new());
    let harness = Harness::with_printer(printer.clone());
    let station = station(&harness);
    let (handle, _) = station.open_shift(options("shift-a", 2)).await.unwrap();

    assert_ok!(handle.initialize().await);
    assert!(handle.scan(raw_unit(1)).await.unwrap().is_accepted());
    assert!(handle.scan(raw_unit(2)).await.unwrap().is_accepted());

    let printing = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.print().await })
    };
    printer.started.notified().await;

    // The worker keeps answering while the printer is busy
    match handle.scan(raw_unit(3)).await.unwrap() {
        ScanOutcome::Rejected { reason } => assert!(reason.contains("awaiting print"), "{reason}"),
        other => panic!("expected rejection, got {other:?}"),
    }
    // Readiness is checked before decoding and dedup
    assert!(matches!(
        handle.scan(raw_unit(1)).await.unwrap(),
        ScanOutcome::Rejected { .. }
    ));
    assert!(matches!(
        handle.scan("not a code".to_string()).await.unwrap(),
        ScanOutcome::Rejected { .. }
    ));
    let status = handle.status().await.unwrap();
    assert_eq!(status.box_status.phase, PackagingPhase::AwaitingPrint);
    assert_eq!(status.ledger_entries, 2);

    printer.release();
    assert_ok!(printing.await.unwrap());
    let status = handle.status().await.unwrap();
    assert_eq!(status.box_status.phase, PackagingPhase::AwaitingVerification);
}

#[tokio::test]
async fn test_worker_runs_full_cycle() {
    let harness = Harness::new();
    let station = station(&harness);
    let (handle, report) = station.open_shift(options("shift-a", 1)).await.unwrap();
    assert_eq!(report.reconcile.total, 0);

    let mut events = handle.subscribe().await.unwrap();
    let first_case = handle.initialize().await.unwrap();
    assert!(handle.scan(raw_unit(1)).await.unwrap().is_accepted());
    handle.print().await.unwrap();

    let committed = handle.confirm(None).await.unwrap();
    assert_eq!(committed.case_code, first_case);
    assert_ne!(committed.next.case_code, first_case);
    assert_eq!(harness.case_codes.committed().len(), 1);

    let status = handle.status().await.unwrap();
    assert_eq!(status.box_status.phase, PackagingPhase::Accumulating);
    assert_eq!(status.box_status.box_state.reserved_case_code, Some(committed.next.case_code));
    assert!(events.try_recv().is_ok());
}

#[tokio::test]
async fn test_cancel_and_clear_history_through_handle() {
    let harness = Harness::new();
    let station = station(&harness);

    let (packing, _) = station.open_shift(options("shift-a", 4)).await.unwrap();
    packing.initialize().await.unwrap();
    packing.scan(raw_unit(1)).await.unwrap();
    assert_eq!(packing.cancel().await.unwrap(), 1);
    assert!(matches!(packing.clear_history().await, Err(StationError::Session(_))));

    let scan_only = ShiftOptions {
        mode: SessionMode::ScanOnly,
        ..options("shift-b", 4)
    };
    let (recording, _) = station.open_shift(scan_only).await.unwrap();
    match recording.scan(raw_unit(1)).await.unwrap() {
        ScanOutcome::Accepted { report, .. } => assert!(report.is_none()),
        other => panic!("expected acceptance, got {other:?}"),
    }
    assert!(recording.initialize().await.is_err());
    assert_eq!(recording.clear_history().await.unwrap(), 1);
    assert!(recording.scan(raw_unit(1)).await.unwrap().is_accepted());
}

#[tokio::test]
async fn test_station_tracks_open_shifts() {
    let harness = Harness::new();
    let station = station(&harness);

    station.open_shift(options("shift-b", 3)).await.unwrap();
    station.open_shift(options("shift-a", 3)).await.unwrap();
    assert_eq!(station.open_shifts(), vec![ShiftId::new("shift-a"), ShiftId::new("shift-b")]);

    assert!(matches!(
        station.open_shift(options("shift-a", 3)).await,
        Err(StationError::ShiftAlreadyOpen { .. })
    ));

    let unknown = ShiftOptions {
        product_id: ProductId::new("nope"),
        ..options("shift-c", 3)
    };
    assert!(matches!(
        station.open_shift(unknown).await,
        Err(StationError::UnknownProduct { .. })
    ));

    station.close_shift(&ShiftId::new("shift-a")).await.unwrap();
    assert_eq!(station.open_shifts(), vec![ShiftId::new("shift-b")]);
    // Failed opens release the id
    assert!(station.open_shift(options("shift-c", 3)).await.is_ok());
    assert!(matches!(
        station.close_shift(&ShiftId::new("shift-a")).await,
        Err(StationError::ShiftNotOpen { .. })
    ));
}

#[tokio::test]
async fn test_concurrent_open_of_same_shift_starts_one_worker() {
    let harness = Harness::new().with_store(Arc::new(SlowScanStore::new(Duration::from_millis(50))));
    let station = station(&harness);

    let (first, second) = tokio::join!(
        station.open_shift(options("shift-a", 3)),
        station.open_shift(options("shift-a", 3))
    );

    let (opened, refused) = match (first, second) {
        (Ok(opened), Err(refused)) | (Err(refused), Ok(opened)) => (opened.0, refused),
        (first, second) => panic!("expected exactly one open: {first:?} / {second:?}"),
    };
    assert!(matches!(refused, StationError::ShiftAlreadyOpen { .. }));
    assert_eq!(station.open_shifts(), vec![ShiftId::new("shift-a")]);

    opened.initialize().await.unwrap();
    assert!(opened.scan(raw_unit(1)).await.unwrap().is_accepted());
    assert_eq!(harness.case_codes.reservation_count(), 1);
}

#[tokio::test]
async fn test_station_from_config_uses_data_dir() {
    let dir = TempDir::new().unwrap();
    let mut config = PacklineConfig::default();
    config.station.data_dir = dir.path().to_path_buf();
    config.ledger.backend = LedgerBackend::Jsonl;
    config.case_codes.company_prefix = "4912345".to_string();
    config.case_codes.extension_digit = 1;
    config.products.push(product());

    let _lock = StationLock::acquire(config.lock_path()).unwrap();
    assert!(matches!(
        StationLock::acquire(config.lock_path()),
        Err(StationError::Locked { .. })
    ));

    let station = Station::from_config(&config).await.unwrap();
    let (handle, _) = station.open_shift(options("shift-a", 2)).await.unwrap();
    let case_code = handle.initialize().await.unwrap();
    assert_eq!(case_code.as_str(), "149123450000000009");

    handle.scan(raw_unit(1)).await.unwrap();
    assert!(config.ledger_dir().join("shift-a.scans.jsonl").exists());
    assert!(config.snapshot_dir().join("shift-a.box.json").exists());
}

#[tokio::test]
async fn test_scan_subscription_feeds_worker() {
    let harness = Harness::new();
    let station = station(&harness);
    let (handle, _) = station.open_shift(options("shift-a", 6)).await.unwrap();
    handle.initialize().await.unwrap();

    let mut input = format!("{}\n{}\r\n\n", raw_unit(1), raw_unit(2)).into_bytes();
    // A wedge scanner emitting FNC1 as a raw byte
    input.extend_from_slice(b"\xE8garbled\n");
    input.extend_from_slice(format!("{}\n", raw_unit(1)).as_bytes());
    let (subscription, mut scans) = subscribe(LineScanSource::new(std::io::Cursor::new(input)));

    let mut outcomes = Vec::new();
    while let Some(raw) = scans.recv().await {
        outcomes.push(handle.scan(raw).await.unwrap());
    }
    subscription.unsubscribe().await;

    assert_eq!(outcomes.len(), 4);
    assert!(outcomes[0].is_accepted());
    assert!(outcomes[1].is_accepted());
    assert!(matches!(outcomes[2], ScanOutcome::Malformed { .. }));
    assert!(matches!(outcomes[3], ScanOutcome::Duplicate { .. }));
    assert_eq!(handle.status().await.unwrap().ledger_entries, 2);
}
