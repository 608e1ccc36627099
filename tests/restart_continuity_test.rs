//! Integration tests for resuming a shift after the station restarts
//!
//! Each test writes through the file-backed ledger and snapshot stores in a
//! temporary directory, then opens a fresh session on the same directory the
//! way a restarted process would.

mod fixtures;

use std::sync::Arc;
use tempfile::TempDir;

use packline::codec::{decode_unit, UnitCode};
use packline::ledger::{JsonlScanStore, ScanMetadata, ScanStore};
use packline::packer::{BoxState, PackagingPhase, ReservationGate};
use packline::session::{
    BoxSnapshot, CheckpointReason, FileSnapshotStore, ScanOutcome, ShiftPackagingSession, SnapshotStore,
};
use packline::types::{ReservationId, ShiftId};

use fixtures::{case_code, product, raw_unit, session_config, Harness};

const SHIFT: &str = "shift-night";

fn unit(n: u32) -> UnitCode {
    decode_unit(&raw_unit(n)).unwrap()
}

/// Harness over file stores rooted in `dir`, with a fresh reservation gate
fn restarted_harness(dir: &TempDir, case_codes: Option<&Harness>) -> Harness {
    let mut harness = Harness::new()
        .with_store(Arc::new(JsonlScanStore::new(dir.path().join("ledger"))))
        .with_snapshots(Arc::new(FileSnapshotStore::new(dir.path().join("snapshots"))));
    if let Some(previous) = case_codes {
        harness.case_codes = previous.case_codes.clone();
    }
    harness.gate = ReservationGate::new();
    harness
}

fn open_box(capacity: u32, members: &[UnitCode]) -> BoxState {
    let mut state = BoxState::new(ShiftId::new(SHIFT), capacity);
    state.reserved_case_code = Some(case_code(0));
    state.reserved_case_id = Some(ReservationId::new("res-0"));
    state.member_unit_codes = members.to_vec();
    state.item_count = members.len() as u32;
    state
}

#[tokio::test]
async fn test_open_box_survives_restart() {
    let dir = TempDir::new().unwrap();
    let first_run = restarted_harness(&dir, None);

    let reserved = {
        let (mut session, report) = ShiftPackagingSession::open(session_config(SHIFT, 4), first_run.collaborators())
            .await
            .unwrap();
        assert_eq!(report.restored_phase, None);
        let reserved = session.initialize_box().await.unwrap();
        assert!(session.accept_raw_scan(&raw_unit(1)).await.is_accepted());
        assert!(session.accept_raw_scan(&raw_unit(2)).await.is_accepted());
        reserved
    };

    let second_run = restarted_harness(&dir, Some(&first_run));
    let (mut session, report) = ShiftPackagingSession::open(session_config(SHIFT, 4), second_run.collaborators())
        .await
        .unwrap();

    assert_eq!(report.reconcile.total, 2);
    assert!(!report.reconcile.degraded);
    assert_eq!(report.restored_phase, Some(PackagingPhase::Accumulating));
    assert_eq!(report.adopted_units, 0);

    let status = session.get_box_status();
    assert_eq!(status.box_state.item_count, 2);
    assert_eq!(status.box_state.reserved_case_code, Some(reserved.clone()));

    // Still the same case: no second reservation on re-initialize
    assert_eq!(session.initialize_box().await.unwrap(), reserved);
    assert_eq!(second_run.case_codes.reservation_count(), 1);

    assert!(matches!(
        session.accept_raw_scan(&raw_unit(2)).await,
        ScanOutcome::Duplicate { .. }
    ));
    match session.accept_raw_scan(&raw_unit(3)).await {
        ScanOutcome::Accepted { report: Some(report), .. } => assert_eq!(report.item_count, 3),
        other => panic!("expected acceptance, got {other:?}"),
    }
}

#[tokio::test]
async fn test_units_recorded_after_last_snapshot_are_adopted() {
    let dir = TempDir::new().unwrap();
    let harness = restarted_harness(&dir, None);
    let shift = ShiftId::new(SHIFT);

    // Snapshot knows one unit; the ledger got a second before the crash
    let snapshots = FileSnapshotStore::new(dir.path().join("snapshots"));
    snapshots
        .save(&BoxSnapshot::new(
            product().id,
            PackagingPhase::Accumulating,
            open_box(3, &[unit(1)]),
            CheckpointReason::StateTransition,
        ))
        .await
        .unwrap();

    let ledger = JsonlScanStore::new(dir.path().join("ledger"));
    let stamped = ScanMetadata {
        product_id: Some(product().id),
        case_code: Some(case_code(0)),
        box_epoch: 0,
        station_id: None,
    };
    ledger.persist_scan(&shift, &unit(1), &stamped).await.unwrap();
    ledger.persist_scan(&shift, &unit(2), &stamped).await.unwrap();
    // Packed into an earlier box; must not be adopted
    let earlier = ScanMetadata {
        box_epoch: 7,
        ..stamped.clone()
    };
    ledger.persist_scan(&shift, &unit(9), &earlier).await.unwrap();

    let (session, report) = ShiftPackagingSession::open(session_config(SHIFT, 3), harness.collaborators())
        .await
        .unwrap();

    assert_eq!(report.reconcile.total, 3);
    assert_eq!(report.adopted_units, 1);
    let state = session.get_box_status().box_state;
    assert_eq!(state.item_count, 2);
    assert!(state.contains(&unit(2)));
    assert!(!state.contains(&unit(9)));

    // The adoption itself was checkpointed
    let saved = snapshots.load(&shift).await.unwrap().unwrap();
    assert_eq!(saved.box_state.item_count, 2);
    assert_eq!(saved.checkpoint.reason, CheckpointReason::AfterRestore);
}

#[tokio::test]
async fn test_interrupted_print_resumes_as_accumulating() {
    let dir = TempDir::new().unwrap();
    let harness = restarted_harness(&dir, None);
    let snapshots = FileSnapshotStore::new(dir.path().join("snapshots"));
    snapshots
        .save(&BoxSnapshot::new(
            product().id,
            PackagingPhase::AwaitingPrint,
            open_box(2, &[unit(1), unit(2)]),
            CheckpointReason::StateTransition,
        ))
        .await
        .unwrap();

    let (mut session, report) = ShiftPackagingSession::open(session_config(SHIFT, 2), harness.collaborators())
        .await
        .unwrap();
    assert_eq!(report.restored_phase, Some(PackagingPhase::Accumulating));

    // The reprint goes through and the box reaches verification
    session.print_current_box().await.unwrap();
    assert_eq!(session.get_box_status().phase, PackagingPhase::AwaitingVerification);
    assert_eq!(harness.case_codes.reservation_count(), 0);
}

#[tokio::test]
async fn test_interrupted_commit_resumes_awaiting_verification() {
    let dir = TempDir::new().unwrap();
    let harness = restarted_harness(&dir, None);
    let snapshots = FileSnapshotStore::new(dir.path().join("snapshots"));
    snapshots
        .save(&BoxSnapshot::new(
            product().id,
            PackagingPhase::Committing,
            open_box(1, &[unit(1)]),
            CheckpointReason::StateTransition,
        ))
        .await
        .unwrap();

    let (mut session, report) = ShiftPackagingSession::open(session_config(SHIFT, 1), harness.collaborators())
        .await
        .unwrap();
    assert_eq!(report.restored_phase, Some(PackagingPhase::AwaitingVerification));

    let committed = session.confirm_verification(&case_code(0), &[unit(1)]).await.unwrap();
    assert_eq!(committed.case_code, case_code(0));
    assert_eq!(harness.case_codes.committed().len(), 1);
    assert_eq!(harness.case_codes.committed()[0].reservation_id, ReservationId::new("res-0"));
}

#[tokio::test]
async fn test_snapshot_for_other_product_is_ignored() {
    let dir = TempDir::new().unwrap();
    let harness = restarted_harness(&dir, None);
    let snapshots = FileSnapshotStore::new(dir.path().join("snapshots"));
    snapshots
        .save(&BoxSnapshot::new(
            packline::types::ProductId::new("juice-05"),
            PackagingPhase::Accumulating,
            open_box(3, &[unit(1)]),
            CheckpointReason::StateTransition,
        ))
        .await
        .unwrap();

    let (session, report) = ShiftPackagingSession::open(session_config(SHIFT, 3), harness.collaborators())
        .await
        .unwrap();
    assert_eq!(report.restored_phase, None);
    assert_eq!(session.get_box_status().phase, PackagingPhase::Idle);
}

#[tokio::test]
async fn test_end_shift_drops_snapshot_and_keeps_ledger() {
    let dir = TempDir::new().unwrap();
    let harness = restarted_harness(&dir, None);
    let shift = ShiftId::new(SHIFT);

    let (mut session, _) = ShiftPackagingSession::open(session_config(SHIFT, 3), harness.collaborators())
        .await
        .unwrap();
    session.initialize_box().await.unwrap();
    session.accept_raw_scan(&raw_unit(1)).await;
    session.end_shift().await.unwrap();

    let snapshots = FileSnapshotStore::new(dir.path().join("snapshots"));
    assert!(snapshots.load(&shift).await.unwrap().is_none());

    let ledger = JsonlScanStore::new(dir.path().join("ledger"));
    assert_eq!(ledger.query_persisted_scans(&shift).await.unwrap().len(), 1);
    assert_eq!(session.get_box_status().phase, PackagingPhase::Idle);
}

#[tokio::test]
async fn test_suspend_marks_shutdown_checkpoint() {
    let dir = TempDir::new().unwrap();
    let harness = restarted_harness(&dir, None);
    let shift = ShiftId::new(SHIFT);

    let (mut session, _) = ShiftPackagingSession::open(session_config(SHIFT, 3), harness.collaborators())
        .await
        .unwrap();
    session.initialize_box().await.unwrap();
    session.accept_raw_scan(&raw_unit(1)).await;
    session.suspend().await;

    let saved = FileSnapshotStore::new(dir.path().join("snapshots"))
        .load(&shift)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(saved.checkpoint.reason, CheckpointReason::BeforeShutdown);
    assert_eq!(saved.box_state.item_count, 1);
}
