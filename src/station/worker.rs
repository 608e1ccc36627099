use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, Instrument};

use super::StationError;
use crate::codec::CaseCode;
use crate::collaborators::{CommitError, PrintError};
use crate::ledger::ReconcileReport;
use crate::packer::{BoxStatus, CommittedBox, PackerError};
use crate::session::{PackagingEvent, ScanOutcome, SessionError, SessionMode, ShiftPackagingSession};
use crate::telemetry::{create_shift_span, generate_correlation_id};
use crate::types::{Reservation, ShiftId};

const COMMAND_CHANNEL_CAPACITY: usize = 128;

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

/// Point-in-time view of one shift
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShiftStatus {
    pub shift_id: ShiftId,
    pub mode: SessionMode,
    pub box_status: BoxStatus,
    pub ledger_entries: usize,
    pub ledger_degraded: bool,
}

enum ShiftCommand {
    Scan { raw: String, reply: oneshot::Sender<ScanOutcome> },
    Initialize { reply: Reply<CaseCode> },
    Print { reply: Reply<()> },
    Confirm { case_code: Option<CaseCode>, reply: Reply<CommittedBox> },
    Cancel { reply: Reply<usize> },
    Reset { reply: Reply<usize> },
    ClearHistory { reply: Reply<usize> },
    Status { reply: oneshot::Sender<ShiftStatus> },
    Subscribe { reply: oneshot::Sender<broadcast::Receiver<PackagingEvent>> },
    EndShift { reply: Reply<()> },
}

/// Outcome of a collaborator call that ran outside the worker
enum Completion {
    Printed {
        result: Result<(), PrintError>,
        reply: Reply<()>,
    },
    Committed {
        result: Result<Reservation, CommitError>,
        reply: Reply<CommittedBox>,
    },
}

/// Cloneable handle to a running shift worker
#[derive(Debug, Clone)]
pub struct ShiftHandle {
    shift_id: ShiftId,
    commands: mpsc::Sender<ShiftCommand>,
}

impl ShiftHandle {
    pub fn shift_id(&self) -> &ShiftId {
        &self.shift_id
    }

    pub async fn scan(&self, raw: impl Into<String>) -> Result<ScanOutcome, StationError> {
        let raw = raw.into();
        self.request(|reply| ShiftCommand::Scan { raw, reply }).await
    }

    pub async fn initialize(&self) -> Result<CaseCode, StationError> {
        Ok(self.request(|reply| ShiftCommand::Initialize { reply }).await??)
    }

    /// Print the open box's label. Resolves when the printer answers; scans
    /// sent meanwhile are rejected.
    pub async fn print(&self) -> Result<(), StationError> {
        Ok(self.request(|reply| ShiftCommand::Print { reply }).await??)
    }

    /// Confirm the printed case. `None` confirms the reserved case code.
    pub async fn confirm(&self, case_code: Option<CaseCode>) -> Result<CommittedBox, StationError> {
        Ok(self
            .request(|reply| ShiftCommand::Confirm { case_code, reply })
            .await??)
    }

    /// Returns the number of discarded units
    pub async fn cancel(&self) -> Result<usize, StationError> {
        Ok(self.request(|reply| ShiftCommand::Cancel { reply }).await??)
    }

    /// Returns the number of units rolled back out of the ledger
    pub async fn reset(&self) -> Result<usize, StationError> {
        Ok(self.request(|reply| ShiftCommand::Reset { reply }).await??)
    }

    pub async fn clear_history(&self) -> Result<usize, StationError> {
        Ok(self.request(|reply| ShiftCommand::ClearHistory { reply }).await??)
    }

    pub async fn status(&self) -> Result<ShiftStatus, StationError> {
        self.request(|reply| ShiftCommand::Status { reply }).await
    }

    pub async fn subscribe(&self) -> Result<broadcast::Receiver<PackagingEvent>, StationError> {
        self.request(|reply| ShiftCommand::Subscribe { reply }).await
    }

    pub async fn end_shift(&self) -> Result<(), StationError> {
        Ok(self.request(|reply| ShiftCommand::EndShift { reply }).await??)
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> ShiftCommand) -> Result<T, StationError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| self.stopped())?;
        response.await.map_err(|_| self.stopped())
    }

    fn stopped(&self) -> StationError {
        StationError::WorkerStopped {
            shift_id: self.shift_id.clone(),
        }
    }
}

/// Spawn the worker that owns `session`. The worker runs until every handle
/// is dropped and its outstanding collaborator calls have answered.
pub fn spawn_shift_worker(session: ShiftPackagingSession, station_id: String, report: &ReconcileReport) -> ShiftHandle {
    let shift_id = session.shift_id().clone();
    let (commands, receiver) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let (completions, completed) = mpsc::unbounded_channel();

    info!(
        shift_id = %shift_id,
        ledger_entries = report.total,
        degraded = report.degraded,
        "Starting shift worker"
    );

    let worker = ShiftWorker {
        session,
        station_id,
        completions,
        in_flight: 0,
    };
    tokio::spawn(worker.run(receiver, completed));

    ShiftHandle { shift_id, commands }
}

struct ShiftWorker {
    session: ShiftPackagingSession,
    station_id: String,
    completions: mpsc::UnboundedSender<Completion>,
    in_flight: usize,
}

impl ShiftWorker {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<ShiftCommand>,
        mut completed: mpsc::UnboundedReceiver<Completion>,
    ) {
        loop {
            tokio::select! {
                biased;

                Some(completion) = completed.recv() => self.finish(completion).await,

                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
            }
        }

        while self.in_flight > 0 {
            match completed.recv().await {
                Some(completion) => self.finish(completion).await,
                None => break,
            }
        }
        self.session.suspend().await;
        debug!(shift_id = %self.session.shift_id(), "Shift worker stopped");
    }

    async fn handle(&mut self, command: ShiftCommand) {
        match command {
            ShiftCommand::Scan { raw, reply } => {
                let span = self.span("scan");
                let outcome = self.session.accept_raw_scan(&raw).instrument(span).await;
                let _ = reply.send(outcome);
            }
            ShiftCommand::Initialize { reply } => {
                let span = self.span("initialize");
                let _ = reply.send(self.session.initialize_box().instrument(span).await);
            }
            ShiftCommand::Print { reply } => {
                let span = self.span("print");
                let label = match self.session.begin_print_current().instrument(span.clone()).await {
                    Ok(label) => label,
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        return;
                    }
                };

                let printer = self.session.packer().printer();
                let completions = self.completions.clone();
                self.in_flight += 1;
                tokio::spawn(
                    async move {
                        let result = printer.print(&label).await;
                        let _ = completions.send(Completion::Printed { result, reply });
                    }
                    .instrument(span),
                );
            }
            ShiftCommand::Confirm { case_code, reply } => {
                let span = self.span("confirm");
                let case_code = match case_code.or_else(|| self.session.packer().box_state().reserved_case_code.clone()) {
                    Some(case_code) => case_code,
                    None => {
                        let _ = reply.send(Err(SessionError::Packer(PackerError::NotInitialized {
                            shift_id: self.session.shift_id().clone(),
                        })));
                        return;
                    }
                };
                let members = self.session.packer().box_state().member_unit_codes.clone();
                let request = match self
                    .session
                    .begin_commit(&case_code, &members)
                    .instrument(span.clone())
                    .await
                {
                    Ok(request) => request,
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        return;
                    }
                };

                let service = self.session.packer().case_codes();
                let completions = self.completions.clone();
                self.in_flight += 1;
                tokio::spawn(
                    async move {
                        let result = service.commit_packed_case(&request).await;
                        let _ = completions.send(Completion::Committed { result, reply });
                    }
                    .instrument(span),
                );
            }
            ShiftCommand::Cancel { reply } => {
                let result = self.session.cancel_current_box().await.map(|units| units.len());
                let _ = reply.send(result);
            }
            ShiftCommand::Reset { reply } => {
                let _ = reply.send(self.session.reset_current_box().await);
            }
            ShiftCommand::ClearHistory { reply } => {
                let _ = reply.send(self.session.clear_history().await);
            }
            ShiftCommand::Status { reply } => {
                let ledger = self.session.ledger();
                let _ = reply.send(ShiftStatus {
                    shift_id: self.session.shift_id().clone(),
                    mode: self.session.mode(),
                    box_status: self.session.get_box_status(),
                    ledger_entries: ledger.len(),
                    ledger_degraded: ledger.is_degraded(),
                });
            }
            ShiftCommand::Subscribe { reply } => {
                let _ = reply.send(self.session.subscribe());
            }
            ShiftCommand::EndShift { reply } => {
                let _ = reply.send(self.session.end_shift().await);
            }
        }
    }

    async fn finish(&mut self, completion: Completion) {
        self.in_flight = self.in_flight.saturating_sub(1);
        match completion {
            Completion::Printed { result, reply } => {
                let _ = reply.send(self.session.complete_print(result).await);
            }
            Completion::Committed { result, reply } => {
                let _ = reply.send(self.session.complete_commit(result).await);
            }
        }
    }

    fn span(&self, operation: &str) -> tracing::Span {
        let correlation_id = generate_correlation_id();
        create_shift_span(
            operation,
            self.session.shift_id().as_str(),
            Some(&self.station_id),
            Some(&correlation_id),
        )
    }
}
