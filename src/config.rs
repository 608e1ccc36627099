use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::types::{ProductId, ProductInfo};

/// Main configuration structure for a packing station
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PacklineConfig {
    /// Station identity and working directory
    pub station: StationConfig,
    /// Durable scan ledger
    pub ledger: LedgerConfig,
    /// Open-box snapshots for restart continuity
    pub snapshots: SnapshotConfig,
    /// Local case-code reservation
    pub case_codes: CaseCodeConfig,
    /// Label output
    pub printer: PrinterConfig,
    /// Observability settings
    pub observability: ObservabilityConfig,
    /// Product catalog
    #[serde(default)]
    pub products: Vec<ProductInfo>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StationConfig {
    pub id: String,
    /// Root for every relative path below
    pub data_dir: PathBuf,
    /// Units per case unless the operator overrides it
    pub default_capacity: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    /// JSON lines, one file per shift
    Jsonl,
    /// Process memory only; nothing survives a restart
    Memory,
    /// SQLite, requires the `database` feature
    Sqlite,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LedgerConfig {
    pub backend: LedgerBackend,
    /// Directory of the JSON lines files (default `<data_dir>/ledger`)
    pub directory: Option<PathBuf>,
    /// SQLite URL (default `sqlite://<data_dir>/packline.db`)
    pub database_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SnapshotConfig {
    pub enabled: bool,
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CaseCodeConfig {
    /// SSCC extension digit (0-9)
    pub extension_digit: u8,
    /// GS1 company prefix, 6 to 12 digits
    pub company_prefix: String,
    pub counter_file: Option<PathBuf>,
    pub manifest_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PrinterConfig {
    pub spool_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level used when RUST_LOG is not set
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable ones
    pub json_logs: bool,
}

impl Default for PacklineConfig {
    fn default() -> Self {
        Self {
            station: StationConfig {
                id: "station-1".to_string(),
                data_dir: PathBuf::from(".packline"),
                default_capacity: 6,
            },
            ledger: LedgerConfig {
                backend: LedgerBackend::Jsonl,
                directory: None,
                database_url: None,
            },
            snapshots: SnapshotConfig {
                enabled: true,
                directory: None,
            },
            case_codes: CaseCodeConfig {
                extension_digit: 0,
                company_prefix: "4600000".to_string(),
                counter_file: None,
                manifest_dir: None,
            },
            printer: PrinterConfig { spool_dir: None },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                json_logs: false,
            },
            products: Vec::new(),
        }
    }
}

impl PacklineConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration files (packline.toml, .packline-rc)
    /// 3. Environment variables (PACKLINE_ prefix, `__` between sections,
    ///    e.g. PACKLINE_STATION__DATA_DIR)
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Same as `load`, with an explicit file layered over the default ones
    pub fn load_from(extra_file: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if Path::new("packline.toml").exists() {
            builder = builder.add_source(File::with_name("packline"));
        }

        if Path::new(".packline-rc").exists() {
            builder = builder.add_source(File::with_name(".packline-rc").format(config::FileFormat::Toml));
        }

        if let Some(path) = extra_file {
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(
            Environment::with_prefix("PACKLINE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: PacklineConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }

    pub fn product(&self, product_id: &ProductId) -> Option<&ProductInfo> {
        self.products.iter().find(|p| p.id == *product_id)
    }

    pub fn ledger_dir(&self) -> PathBuf {
        self.under_data_dir(self.ledger.directory.as_deref(), "ledger")
    }

    pub fn database_url(&self) -> String {
        self.ledger
            .database_url
            .clone()
            .unwrap_or_else(|| format!("sqlite://{}", self.station.data_dir.join("packline.db").display()))
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.under_data_dir(self.snapshots.directory.as_deref(), "snapshots")
    }

    pub fn counter_path(&self) -> PathBuf {
        self.under_data_dir(self.case_codes.counter_file.as_deref(), "sscc-counter.json")
    }

    pub fn manifest_dir(&self) -> PathBuf {
        self.under_data_dir(self.case_codes.manifest_dir.as_deref(), "cases")
    }

    pub fn spool_dir(&self) -> PathBuf {
        self.under_data_dir(self.printer.spool_dir.as_deref(), "labels")
    }

    /// Lock file that keeps a second process off this data directory
    pub fn lock_path(&self) -> PathBuf {
        self.station.data_dir.join("station.lock")
    }

    fn under_data_dir(&self, configured: Option<&Path>, default_name: &str) -> PathBuf {
        match configured {
            Some(path) if path.is_absolute() => path.to_path_buf(),
            Some(path) => self.station.data_dir.join(path),
            None => self.station.data_dir.join(default_name),
        }
    }
}

/// Global configuration instance
static CONFIG: std::sync::LazyLock<Result<PacklineConfig, anyhow::Error>> = std::sync::LazyLock::new(|| {
    // Load .env file first
    let _ = PacklineConfig::load_env_file();
    PacklineConfig::load()
});

/// Get the global configuration
pub fn config() -> Result<&'static PacklineConfig> {
    CONFIG
        .as_ref()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
}

/// Initialize configuration (called at startup)
pub fn init_config() -> Result<()> {
    let config = config()?;
    tracing::info!(
        station_id = %config.station.id,
        data_dir = %config.station.data_dir.display(),
        products = config.products.len(),
        "Configuration loaded successfully"
    );
    Ok(())
}
