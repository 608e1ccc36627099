use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::BufReader;
use tokio::task::JoinHandle;

use packline::codec::{decode_unit, normalize_case, CaseCode};
use packline::config::{self, PacklineConfig};
use packline::scanner::{subscribe, LineScanSource, ScanSubscription};
use packline::session::{FileSnapshotStore, PackagingEvent, ScanOutcome, SessionMode, SnapshotStore};
use packline::station::{
    parse_operator_line, scan_store_from_config, OperatorCommand, OperatorInput, ShiftHandle, ShiftOptions,
    Station, StationLock,
};
use packline::telemetry::init_telemetry;
use packline::types::{ProductId, ProductInfo, ShiftId};

#[derive(Parser)]
#[command(name = "packline")]
#[command(about = "Case-packing station control: scan units, print case labels, verify and commit boxes")]
#[command(long_about = "Packline drives one case-packing station. Unit scans are deduplicated per shift, \
                       packed into the open box until it reaches capacity, and each full box is labelled, \
                       verified and committed against its reserved case code (SSCC).")]
struct Cli {
    /// Extra configuration file layered over packline.toml and .packline-rc
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a shift and pack scans read from stdin or a scanner device
    Run {
        #[arg(long, help = "Production shift identifier")]
        shift: String,
        #[arg(long, help = "Product id from the configured catalog")]
        product: String,
        #[arg(long, help = "Units per box (defaults to station.default_capacity)")]
        capacity: Option<u32>,
        #[arg(long, help = "Record and dedupe scans without packing boxes")]
        scan_only: bool,
        #[arg(long, help = "Read scans from this device file instead of stdin")]
        device: Option<PathBuf>,
        #[arg(long, help = "GTIN for a product missing from the catalog")]
        gtin: Option<String>,
        #[arg(long, default_value = "0", help = "Shelf life in days for an ad-hoc --gtin product")]
        expiration_days: u32,
    },
    /// Decode a raw unit scan or case label and print it as JSON
    Decode { raw: String },
    /// Validate an SSCC check digit
    CheckSscc { code: String },
    /// Show the persisted state of a shift without opening it
    Status {
        #[arg(long)]
        shift: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    PacklineConfig::load_env_file()?;
    let config = match cli.config.as_deref() {
        Some(path) => PacklineConfig::load_from(Some(path))?,
        None => config::config()?.clone(),
    };
    init_telemetry(&config.observability)?;

    match cli.command {
        Commands::Run {
            shift,
            product,
            capacity,
            scan_only,
            device,
            gtin,
            expiration_days,
        } => {
            let mut config = config;
            let product_id = ProductId::new(product);
            if let Some(gtin) = gtin {
                if config.product(&product_id).is_none() {
                    config.products.push(ProductInfo {
                        id: product_id.clone(),
                        name: product_id.to_string(),
                        gtin,
                        expiration_in_days: expiration_days,
                    });
                }
            }
            let options = ShiftOptions {
                shift_id: ShiftId::new(shift),
                product_id,
                capacity,
                mode: if scan_only { SessionMode::ScanOnly } else { SessionMode::Packaging },
            };

            // Stdin reads park a blocking thread; don't wait on it at exit
            let runtime = tokio::runtime::Runtime::new()?;
            let result = runtime.block_on(async { run_command(&config, options, device).await });
            runtime.shutdown_timeout(Duration::from_millis(250));
            result
        }
        Commands::Decode { raw } => decode_command(&raw),
        Commands::CheckSscc { code } => check_sscc_command(&code),
        Commands::Status { shift } => {
            tokio::runtime::Runtime::new()?.block_on(async { status_command(&config, ShiftId::new(shift)).await })
        }
    }
}

async fn run_command(config: &PacklineConfig, options: ShiftOptions, device: Option<PathBuf>) -> Result<()> {
    let lock = StationLock::acquire(config.lock_path())?;
    let station = Station::from_config(config).await?;
    let scan_only = options.mode == SessionMode::ScanOnly;

    println!("📦 PACKLINE - station {}", station.station_id());
    println!("==========================================");

    let (handle, report) = station.open_shift(options).await?;
    println!("🗂️  Shift {} opened", handle.shift_id());
    println!("   📋 Ledger entries: {}", report.reconcile.total);
    if report.reconcile.degraded {
        println!("   ⚠️  Scan store unavailable: running from memory only");
    }
    if let Some(phase) = report.restored_phase {
        println!("   ♻️  Restored open box ({phase}), {} orphaned units adopted", report.adopted_units);
    }

    if !scan_only {
        match handle.initialize().await {
            Ok(case_code) => println!("   🏷️  Packing into case {case_code}"),
            Err(e) => {
                println!("   ❌ Could not reserve a case code: {e}");
                println!("   → Retry with :init once the case code service is reachable");
            }
        }
    }
    println!();
    println!("🔫 Ready for scans. Commands: :print :confirm [sscc] :cancel :reset :status :clear :end :quit");

    let events = handle.subscribe().await?;
    let event_printer = tokio::spawn(print_events(events));

    let (subscription, mut scans) = match device {
        Some(path) => open_device(&path).await?,
        None => subscribe(LineScanSource::new(BufReader::new(tokio::io::stdin()))),
    };

    let mut pending: Vec<JoinHandle<()>> = Vec::new();
    while let Some(line) = scans.recv().await {
        pending.retain(|task| !task.is_finished());

        let input = match parse_operator_line(&line) {
            Ok(input) => input,
            Err(e) => {
                println!("❓ {e}");
                continue;
            }
        };

        match input {
            OperatorInput::Scan(raw) => print_outcome(&handle.scan(raw).await?),
            OperatorInput::CaseLabel(case_code) => pending.push(spawn_confirm(&handle, Some(case_code))),
            OperatorInput::Command(OperatorCommand::Confirm(case_code)) => {
                pending.push(spawn_confirm(&handle, case_code))
            }
            OperatorInput::Command(OperatorCommand::Print) => pending.push(spawn_print(&handle)),
            OperatorInput::Command(OperatorCommand::Init) => match handle.initialize().await {
                Ok(case_code) => println!("🏷️  Packing into case {case_code}"),
                Err(e) => println!("❌ {e}"),
            },
            OperatorInput::Command(OperatorCommand::Cancel) => match handle.cancel().await {
                Ok(discarded) => println!("🗑️  Box cancelled, {discarded} units discarded"),
                Err(e) => println!("❌ {e}"),
            },
            OperatorInput::Command(OperatorCommand::Reset) => match handle.reset().await {
                Ok(removed) => println!("↩️  Box reset, {removed} scans rolled back"),
                Err(e) => println!("❌ {e}"),
            },
            OperatorInput::Command(OperatorCommand::Clear) => match handle.clear_history().await {
                Ok(removed) => println!("🧹 Scan history cleared ({removed} entries)"),
                Err(e) => println!("❌ {e}"),
            },
            OperatorInput::Command(OperatorCommand::Status) => print_status(&handle).await?,
            OperatorInput::Command(OperatorCommand::End) => {
                for task in pending.drain(..) {
                    let _ = task.await;
                }
                station.close_shift(handle.shift_id()).await?;
                println!("🏁 Shift {} ended", handle.shift_id());
                break;
            }
            OperatorInput::Command(OperatorCommand::Quit) => {
                println!("👋 Leaving shift {} open; run again to resume", handle.shift_id());
                break;
            }
        }
    }

    for task in pending {
        let _ = task.await;
    }
    subscription.unsubscribe().await;
    event_printer.abort();
    drop(lock);
    Ok(())
}

async fn open_device(path: &Path) -> Result<(ScanSubscription, tokio::sync::mpsc::Receiver<String>)> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open scanner device {}", path.display()))?;
    Ok(subscribe(LineScanSource::new(BufReader::new(file))))
}

fn spawn_print(handle: &ShiftHandle) -> JoinHandle<()> {
    let handle = handle.clone();
    tokio::spawn(async move {
        if let Err(e) = handle.print().await {
            println!("🖨️  ❌ {e}");
        }
    })
}

fn spawn_confirm(handle: &ShiftHandle, case_code: Option<CaseCode>) -> JoinHandle<()> {
    let handle = handle.clone();
    tokio::spawn(async move {
        if let Err(e) = handle.confirm(case_code).await {
            println!("🔍 ❌ {e}");
        }
    })
}

fn print_outcome(outcome: &ScanOutcome) {
    match outcome {
        ScanOutcome::Accepted { unit, report: Some(report) } => {
            println!("✅ {} [{}/{}]", unit, report.item_count, report.capacity);
        }
        ScanOutcome::Accepted { unit, report: None } => println!("✅ {unit}"),
        ScanOutcome::Duplicate { unit } => println!("🔁 Duplicate: {unit}"),
        ScanOutcome::WrongProduct { unit, expected_gtin } => {
            println!("🚫 Wrong product: {} (expected GTIN {})", unit.gtin, expected_gtin)
        }
        ScanOutcome::Malformed { error } => println!("⚠️  Unreadable scan: {error}"),
        ScanOutcome::Rejected { reason } => println!("⛔ {reason}"),
    }
}

async fn print_status(handle: &ShiftHandle) -> Result<()> {
    let status = handle.status().await?;
    let state = &status.box_status.box_state;
    println!("📊 Shift {} ({:?})", status.shift_id, status.mode);
    println!("   📋 Ledger entries: {}", status.ledger_entries);
    if status.ledger_degraded {
        println!("   ⚠️  Ledger is memory-only");
    }
    println!("   📦 Phase: {}", status.box_status.phase);
    match &state.reserved_case_code {
        Some(case_code) => println!("   🏷️  Case {case_code}: {}/{}", state.item_count, state.capacity),
        None => println!("   🏷️  No case reserved"),
    }
    Ok(())
}

async fn print_events(mut events: tokio::sync::broadcast::Receiver<PackagingEvent>) {
    use tokio::sync::broadcast::error::RecvError;

    loop {
        match events.recv().await {
            Ok(PackagingEvent::BoxReadyToPack { case_code, item_count, .. }) => {
                println!("📦 Box {case_code} is full ({item_count} units). Type :print");
            }
            Ok(PackagingEvent::LabelPrinted { case_code, .. }) => {
                println!("🖨️  Label printed for {case_code}. Scan it to confirm");
            }
            Ok(PackagingEvent::PrintFailed { case_code, reason, .. }) => {
                println!("🖨️  Print failed for {case_code}: {reason}. Type :print to retry");
            }
            Ok(PackagingEvent::VerificationSucceeded {
                case_code,
                next_case_code,
                unit_count,
                ..
            }) => {
                println!("🎉 Case {case_code} committed with {unit_count} units");
                println!("   → Next case: {next_case_code}");
            }
            Ok(PackagingEvent::VerificationFailed { case_code, reason, .. }) => {
                println!("🔍 Verification failed for {case_code}: {reason}");
            }
            Ok(PackagingEvent::BoxCancelled { .. } | PackagingEvent::BoxReset { .. }) => {}
            Err(RecvError::Lagged(skipped)) => println!("⚠️  {skipped} events skipped"),
            Err(RecvError::Closed) => break,
        }
    }
}

fn decode_command(raw: &str) -> Result<()> {
    match decode_unit(raw) {
        Ok(unit) => println!("{}", serde_json::to_string_pretty(&unit)?),
        Err(unit_error) => match normalize_case(raw) {
            Ok(case_code) => println!("{}", serde_json::to_string_pretty(&case_code)?),
            Err(_) => return Err(anyhow!("Not a unit code or case code: {unit_error}")),
        },
    }
    Ok(())
}

fn check_sscc_command(code: &str) -> Result<()> {
    let case_code = normalize_case(code).map_err(|e| anyhow!("Invalid SSCC: {e}"))?;
    println!("✅ {case_code} is a valid SSCC (extension digit {})", case_code.extension_digit());
    Ok(())
}

async fn status_command(config: &PacklineConfig, shift_id: ShiftId) -> Result<()> {
    let store = scan_store_from_config(config).await?;
    let scans = store.query_persisted_scans(&shift_id).await?;

    println!("📊 Shift {shift_id}");
    println!("   📋 Persisted scans: {}", scans.len());

    if !config.snapshots.enabled {
        println!("   📦 Box snapshots disabled");
        return Ok(());
    }
    match FileSnapshotStore::new(config.snapshot_dir()).load(&shift_id).await? {
        Some(snapshot) => {
            let state = &snapshot.box_state;
            println!("   📦 Product {}: {}", snapshot.product_id, snapshot.phase);
            if let Some(case_code) = &state.reserved_case_code {
                println!("   🏷️  Case {case_code}: {}/{}", state.item_count, state.capacity);
            }
            println!("   🕐 Saved at {}", snapshot.saved_at);
        }
        None => println!("   📦 No open box"),
    }
    Ok(())
}
