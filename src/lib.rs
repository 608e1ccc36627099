// Packline Library - control core of a case-packing station
// This exposes the core components for testing and integration

pub mod codec;
pub mod collaborators;
pub mod config;
pub mod ledger;
pub mod packer;
pub mod scanner;
pub mod session;
pub mod station;
pub mod telemetry;
pub mod types;

// Re-export key types for easy access
pub use codec::{
    decode_unit, matches_product, normalize_case, validate_case_check_digit, CaseCode, DecodeError, UnitCode,
};
pub use collaborators::{
    CaseCodeService, CommitError, CommitRequest, LabelPayload, LabelPrinter, LocalCaseCodeService, PrintError,
    ReservationError, SpoolLabelPrinter,
};
pub use config::{config, init_config, PacklineConfig};
pub use ledger::{
    merge_records, JsonlScanStore, LedgerIoError, MemoryScanStore, ScanLedger, ScanMetadata, ScanOrigin, ScanRecord,
    ScanStore,
};
pub use packer::{
    AcceptReport, BoxLifecycle, BoxPacker, BoxState, BoxStatus, CommittedBox, PackagingPhase, PackerError,
    ReservationGate,
};
pub use scanner::{subscribe, LineScanSource, ScanSource, ScanSubscription};
pub use session::{
    BoxSnapshot, FileSnapshotStore, PackagingEvent, ScanOutcome, SessionCollaborators, SessionConfig, SessionError,
    SessionMode, ShiftPackagingSession, SnapshotError, SnapshotStore,
};
pub use station::{ShiftHandle, ShiftOptions, ShiftStatus, Station, StationError, StationLock};
pub use telemetry::{create_shift_span, generate_correlation_id, init_telemetry};
pub use types::{ProductId, ProductInfo, Reservation, ReservationId, ShiftId};
