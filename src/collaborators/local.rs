use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use super::{
    CaseCodeService, CommitError, CommitRequest, LabelPayload, LabelPrinter, PrintError, ReservationError,
};
use crate::codec::{compute_case_check_digit, CaseCode, UnitCode};
use crate::types::{ProductId, Reservation, ReservationId, ShiftId};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SerialCounter {
    next_serial: u64,
    /// Next reservation handed out by a commit whose manifest is not yet
    /// written, keyed by the committed reservation
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pending_commits: BTreeMap<ReservationId, Reservation>,
}

/// Record written for every committed case
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseManifest {
    pub case_code: CaseCode,
    pub reservation_id: ReservationId,
    pub shift_id: ShiftId,
    pub product_id: ProductId,
    pub unit_codes: Vec<UnitCode>,
    pub committed_at: DateTime<Utc>,
    pub next: Reservation,
}

/// Standalone case-code backend.
///
/// SSCCs are built from the extension digit, the GS1 company prefix and a
/// serial reference taken from a persisted counter. The counter only moves
/// on reservation, so a reservation kept across failures leaves no gap.
/// Commits are idempotent per reservation: committing the same reservation
/// again returns the next reservation recorded the first time. The next
/// reservation is recorded with the counter bump, so a commit retried after a
/// failed manifest write gets the same one back.
pub struct LocalCaseCodeService {
    extension_digit: u8,
    company_prefix: String,
    counter_path: PathBuf,
    manifest_dir: PathBuf,
    lock: Mutex<()>,
}

impl LocalCaseCodeService {
    pub fn new(
        extension_digit: u8,
        company_prefix: impl Into<String>,
        counter_path: impl Into<PathBuf>,
        manifest_dir: impl Into<PathBuf>,
    ) -> Result<Self, ReservationError> {
        let company_prefix = company_prefix.into();
        if extension_digit > 9 {
            return Err(ReservationError::Rejected {
                reason: format!("extension digit must be 0-9, got {extension_digit}"),
            });
        }
        if !(6..=12).contains(&company_prefix.len()) || !company_prefix.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ReservationError::Rejected {
                reason: format!("company prefix must be 6-12 digits, got {company_prefix:?}"),
            });
        }

        Ok(Self {
            extension_digit,
            company_prefix,
            counter_path: counter_path.into(),
            manifest_dir: manifest_dir.into(),
            lock: Mutex::new(()),
        })
    }

    fn serial_width(&self) -> usize {
        16 - self.company_prefix.len()
    }

    fn build_case_code(&self, serial: u64) -> Result<CaseCode, ReservationError> {
        let width = self.serial_width();
        let serial_text = format!("{serial:0width$}");
        if serial_text.len() > width {
            return Err(ReservationError::Rejected {
                reason: format!("serial reference range exhausted for prefix {}", self.company_prefix),
            });
        }

        let body = format!("{}{}{}", self.extension_digit, self.company_prefix, serial_text);
        let check = compute_case_check_digit(&body).ok_or_else(|| ReservationError::Rejected {
            reason: format!("non-numeric case code body {body:?}"),
        })?;
        Ok(CaseCode::parse(&format!("{body}{check}"))?)
    }

    async fn read_counter(&self) -> Result<SerialCounter, std::io::Error> {
        match fs::read_to_string(&self.counter_path).await {
            Ok(contents) => serde_json::from_str(&contents).map_err(std::io::Error::other),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SerialCounter::default()),
            Err(e) => Err(e),
        }
    }

    async fn write_counter(&self, counter: &SerialCounter) -> Result<(), std::io::Error> {
        if let Some(parent) = self.counter_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let serialized = serde_json::to_string_pretty(counter).map_err(std::io::Error::other)?;
        let temp_path = self.counter_path.with_extension("tmp");
        fs::write(&temp_path, serialized).await?;
        fs::rename(&temp_path, &self.counter_path).await
    }

    fn allocate(&self, counter: &mut SerialCounter) -> Result<Reservation, ReservationError> {
        let case_code = self.build_case_code(counter.next_serial)?;
        counter.next_serial += 1;
        Ok(Reservation {
            case_code,
            reservation_id: ReservationId::new(Uuid::new_v4().to_string()),
        })
    }

    fn counter_unreachable(&self, e: std::io::Error) -> ReservationError {
        ReservationError::Unreachable {
            reason: format!("counter file {:?}: {e}", self.counter_path),
        }
    }

    async fn reserve_locked(&self, shift_id: &ShiftId, product_id: &ProductId) -> Result<Reservation, ReservationError> {
        let mut counter = self.read_counter().await.map_err(|e| self.counter_unreachable(e))?;
        let reservation = self.allocate(&mut counter)?;
        self.write_counter(&counter).await.map_err(|e| self.counter_unreachable(e))?;

        info!(
            shift_id = %shift_id,
            product_id = %product_id,
            case_code = %reservation.case_code,
            reservation_id = %reservation.reservation_id,
            "Reserved case code"
        );
        Ok(reservation)
    }

    /// Next reservation for a commit, reusing one recorded by an earlier
    /// attempt of the same commit
    async fn pending_next_locked(&self, request: &CommitRequest) -> Result<Reservation, ReservationError> {
        let mut counter = self.read_counter().await.map_err(|e| self.counter_unreachable(e))?;
        if let Some(pending) = counter.pending_commits.get(&request.reservation_id) {
            info!(
                case_code = %request.case_code,
                next_case_code = %pending.case_code,
                "Reusing next case code from interrupted commit"
            );
            return Ok(pending.clone());
        }

        let next = self.allocate(&mut counter)?;
        counter
            .pending_commits
            .insert(request.reservation_id.clone(), next.clone());
        self.write_counter(&counter).await.map_err(|e| self.counter_unreachable(e))?;

        info!(
            shift_id = %request.shift_id,
            product_id = %request.product_id,
            case_code = %next.case_code,
            reservation_id = %next.reservation_id,
            "Reserved case code"
        );
        Ok(next)
    }

    async fn settle_pending_locked(&self, reservation_id: &ReservationId) {
        let settled = async {
            let mut counter = self.read_counter().await?;
            if counter.pending_commits.remove(reservation_id).is_some() {
                self.write_counter(&counter).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        // Retries are answered from the manifest from here on
        if let Err(e) = settled.await {
            warn!(reservation_id = %reservation_id, error = %e, "Could not clear pending commit record");
        }
    }

    pub fn manifest_path(&self, case_code: &CaseCode) -> PathBuf {
        self.manifest_dir.join(format!("{case_code}.json"))
    }

    async fn read_manifest(&self, path: &Path) -> Option<CaseManifest> {
        let contents = fs::read_to_string(path).await.ok()?;
        match serde_json::from_str(&contents) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                warn!(file = ?path, error = %e, "Unreadable case manifest");
                None
            }
        }
    }
}

#[async_trait]
impl CaseCodeService for LocalCaseCodeService {
    async fn reserve_next_case_code(
        &self,
        shift_id: &ShiftId,
        product_id: &ProductId,
    ) -> Result<Reservation, ReservationError> {
        let _guard = self.lock.lock().await;
        self.reserve_locked(shift_id, product_id).await
    }

    async fn commit_packed_case(&self, request: &CommitRequest) -> Result<Reservation, CommitError> {
        if request.unit_codes.is_empty() {
            return Err(CommitError::Rejected {
                reason: "a case must contain at least one unit".to_string(),
            });
        }

        let _guard = self.lock.lock().await;
        let path = self.manifest_path(&request.case_code);
        if let Some(existing) = self.read_manifest(&path).await {
            if existing.reservation_id == request.reservation_id {
                info!(case_code = %request.case_code, "Case already committed, returning recorded reservation");
                return Ok(existing.next);
            }
            return Err(CommitError::Rejected {
                reason: format!("case {} was committed under another reservation", request.case_code),
            });
        }

        let next = self
            .pending_next_locked(request)
            .await
            .map_err(|e| CommitError::Unreachable { reason: e.to_string() })?;

        let manifest = CaseManifest {
            case_code: request.case_code.clone(),
            reservation_id: request.reservation_id.clone(),
            shift_id: request.shift_id.clone(),
            product_id: request.product_id.clone(),
            unit_codes: request.unit_codes.clone(),
            committed_at: Utc::now(),
            next: next.clone(),
        };
        let io_error = |e: std::io::Error| CommitError::Unreachable {
            reason: format!("manifest {path:?}: {e}"),
        };
        let serialized = serde_json::to_string_pretty(&manifest).map_err(|e| CommitError::Rejected {
            reason: e.to_string(),
        })?;
        fs::create_dir_all(&self.manifest_dir).await.map_err(io_error)?;
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, serialized).await.map_err(io_error)?;
        fs::rename(&temp_path, &path).await.map_err(io_error)?;
        self.settle_pending_locked(&request.reservation_id).await;

        info!(
            case_code = %request.case_code,
            units = request.unit_codes.len(),
            next_case_code = %next.case_code,
            "Committed packed case"
        );
        Ok(next)
    }
}

/// Printer that drops each label as a JSON file into a spool directory,
/// where the device transport picks it up
pub struct SpoolLabelPrinter {
    spool_dir: PathBuf,
}

impl SpoolLabelPrinter {
    pub fn new(spool_dir: impl Into<PathBuf>) -> Self {
        Self {
            spool_dir: spool_dir.into(),
        }
    }

    pub fn label_path(&self, case_code: &CaseCode) -> PathBuf {
        self.spool_dir.join(format!("{case_code}.label.json"))
    }
}

#[async_trait]
impl LabelPrinter for SpoolLabelPrinter {
    async fn print(&self, label: &LabelPayload) -> Result<(), PrintError> {
        let unavailable = |e: std::io::Error| PrintError::Unavailable {
            reason: format!("spool {:?}: {e}", self.spool_dir),
        };
        fs::create_dir_all(&self.spool_dir).await.map_err(unavailable)?;

        let serialized = serde_json::to_string_pretty(label).map_err(|e| PrintError::Failed {
            reason: e.to_string(),
        })?;
        let path = self.label_path(&label.case_code);
        fs::write(&path, serialized).await.map_err(unavailable)?;

        info!(
            case_code = %label.case_code,
            product = %label.product.name,
            expiration_date = %label.expiration_date,
            file = ?path,
            "Label spooled"
        );
        Ok(())
    }
}
