//! Configuration types and loading
//!
//! The configuration is read once at startup and handed to each component by
//! value or reference.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveTime;
use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::audit::DEFAULT_AUDIT_TABLE;
use crate::error::ConfigError;
use crate::loader::TableLoadSpec;
use crate::warehouse::{is_valid_identifier, is_valid_table_name};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,

    /// Log file (appended to in addition to stderr)
    #[serde(rename = "log-file")]
    pub log_file: Option<PathBuf>,

    /// Print captured stage output to the terminal
    pub verbose: bool,

    /// Warehouse database
    pub warehouse: WarehouseConfig,

    /// Audit table location
    pub audit: AuditConfig,

    /// Pipeline stages
    pub stages: StagesConfig,

    /// Recurring schedule
    pub schedule: ScheduleConfig,

    /// File this configuration was loaded from
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

impl Config {
    /// Load configuration with fallback chain
    ///
    /// Explicit path > `./dwetl.yml` > `<config_dir>/dwetl/dwetl.yml` > defaults.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from("dwetl.yml");
        if local_config.exists() {
            return Self::load_from_file(&local_config)
                .context(format!("Failed to load config from {}", local_config.display()));
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("dwetl").join("dwetl.yml");
            if user_config.exists() {
                return Self::load_from_file(&user_config)
                    .context(format!("Failed to load config from {}", user_config.display()));
            }
        }

        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let mut config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        config.source = Some(path.as_ref().to_path_buf());
        Ok(config)
    }

    /// Validate configuration before use
    ///
    /// Collects every problem instead of stopping at the first. Missing source
    /// files and scripts are not checked here; they fail their stage at run time.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        debug!("Config::validate: called");
        let mut problems = Vec::new();

        if self.warehouse.path.as_os_str().is_empty() {
            problems.push("warehouse.path must be set".to_string());
        }
        for schema in self.warehouse.attach.keys() {
            if !is_valid_identifier(schema) {
                problems.push(format!("warehouse.attach: invalid schema name '{}'", schema));
            }
        }
        if !is_valid_table_name(&self.audit.table) {
            problems.push(format!("audit.table: invalid table name '{}'", self.audit.table));
        }

        if let Some(generate) = &self.stages.generate
            && generate.program.trim().is_empty()
        {
            problems.push("stages.generate.program must not be empty".to_string());
        }

        if self.stages.bronze.tables.is_empty() {
            problems.push("stages.bronze.tables must list at least one table".to_string());
        }
        let mut targets = HashSet::new();
        for table in &self.stages.bronze.tables {
            if !targets.insert(table.target.as_str()) {
                problems.push(format!("stages.bronze.tables: '{}' listed twice", table.target));
            }
            problems.extend(table.problems());
        }

        if self.stages.silver.script.as_os_str().is_empty() {
            problems.push("stages.silver.script must be set".to_string());
        }
        if self.stages.gold.script.as_os_str().is_empty() {
            problems.push("stages.gold.script must be set".to_string());
        }

        if self.schedule.interval_secs.is_some() && self.schedule.daily_at.is_some() {
            problems.push("schedule: set either interval-secs or daily-at, not both".to_string());
        }
        if self.schedule.interval_secs == Some(0) {
            problems.push("schedule.interval-secs must be greater than zero".to_string());
        }
        if let Some(value) = &self.schedule.daily_at
            && parse_daily_at(value).is_err()
        {
            problems.push(format!("schedule.daily-at: '{}' is not HH:MM", value));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            debug!(count = problems.len(), "Config::validate: found problems");
            Err(ConfigError::Invalid(problems))
        }
    }

    /// Audit database path (defaults to the warehouse file)
    pub fn audit_path(&self) -> &Path {
        self.audit.path.as_deref().unwrap_or(&self.warehouse.path)
    }
}

/// Parse a `HH:MM` wall-clock time
pub fn parse_daily_at(value: &str) -> std::result::Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").map_err(|_| ConfigError::InvalidTime {
        value: value.to_string(),
    })
}

/// Warehouse database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WarehouseConfig {
    /// Main database file
    pub path: PathBuf,

    /// Schema name -> database file attached at connection open
    pub attach: BTreeMap<String, PathBuf>,

    /// How long a connection waits on a locked database
    #[serde(rename = "busy-timeout-ms")]
    pub busy_timeout_ms: u64,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/warehouse.db"),
            attach: BTreeMap::new(),
            busy_timeout_ms: 5000,
        }
    }
}

/// Audit log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Database holding the audit table (defaults to the warehouse file)
    pub path: Option<PathBuf>,

    /// Audit table name
    pub table: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: None,
            table: DEFAULT_AUDIT_TABLE.to_string(),
        }
    }
}

/// Stage configuration, one section per stage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StagesConfig {
    /// Source-data generator; omitted means the pipeline starts at bronze
    pub generate: Option<CommandConfig>,

    /// Bronze incremental load
    pub bronze: BronzeConfig,

    /// Silver transformation script
    pub silver: ScriptStageConfig,

    /// Gold rebuild script
    pub gold: ScriptStageConfig,
}

/// External command stage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    /// Program to execute
    pub program: String,

    /// Program arguments
    pub args: Vec<String>,

    /// Working directory (defaults to the current directory)
    #[serde(rename = "working-dir")]
    pub working_dir: Option<PathBuf>,

    /// Extra environment variables (the parent environment is inherited)
    pub env: BTreeMap<String, String>,

    /// Timeout in seconds
    #[serde(rename = "timeout-secs")]
    pub timeout_secs: u64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            program: String::new(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            timeout_secs: 600,
        }
    }
}

/// Bronze load configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BronzeConfig {
    /// Audit process name for the bronze stage
    #[serde(rename = "process-name")]
    pub process_name: String,

    /// Tables to load, in load order
    pub tables: Vec<TableLoadSpec>,
}

impl Default for BronzeConfig {
    fn default() -> Self {
        Self {
            process_name: "bronze_incremental_load".to_string(),
            tables: Vec::new(),
        }
    }
}

/// SQL script stage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptStageConfig {
    /// Path to the SQL script
    pub script: PathBuf,
}

/// Recurring schedule configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Fixed interval between runs
    #[serde(rename = "interval-secs")]
    pub interval_secs: Option<u64>,

    /// Local wall-clock time for a daily run (HH:MM)
    #[serde(rename = "daily-at")]
    pub daily_at: Option<String>,

    /// Run once immediately when the scheduler starts
    #[serde(rename = "run-on-start")]
    pub run_on_start: bool,

    /// Lock file guarding against overlapping runs
    #[serde(rename = "lock-file")]
    pub lock_file: PathBuf,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        let lock_file = dirs::runtime_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("dwetl")
            .join("dwetl.lock");

        Self {
            interval_secs: None,
            daily_at: None,
            run_on_start: false,
            lock_file,
        }
    }
}

impl TableLoadSpec {
    fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let label = format!("stages.bronze.tables[{}]", self.target);

        if !is_valid_table_name(&self.target) {
            problems.push(format!("{}: invalid target table name", label));
        }
        if self.file.as_os_str().is_empty() {
            problems.push(format!("{}: file must be set", label));
        }
        if self.columns.is_empty() {
            problems.push(format!("{}: columns must not be empty", label));
        }

        let mut seen = HashSet::new();
        for column in &self.columns {
            if !is_valid_identifier(column) {
                problems.push(format!("{}: invalid column name '{}'", label, column));
            }
            if !seen.insert(column.as_str()) {
                problems.push(format!("{}: column '{}' listed twice", label, column));
            }
        }

        if self.key.is_empty() {
            problems.push(format!("{}: key must name at least one column", label));
        }
        for key in &self.key {
            if !self.columns.contains(key) {
                problems.push(format!("{}: key column '{}' is not in columns", label, key));
            }
        }
        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_YAML: &str = r#"
log-level: debug
verbose: true
warehouse:
  path: /tmp/dw/warehouse.db
  attach:
    bronze: /tmp/dw/bronze.db
    gold: /tmp/dw/gold.db
  busy-timeout-ms: 2000
stages:
  generate:
    program: python3
    args: [data_generator.py]
    timeout-secs: 60
  bronze:
    tables:
      - target: bronze.crm_cust_info
        file: data_files/cust_info.csv
        columns: [cst_id, cst_key, cst_firstname]
        key: [cst_id]
  silver:
    script: sql/silver.sql
  gold:
    script: sql/gold.sql
schedule:
  daily-at: "06:00"
"#;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.audit.table, "etl_log");
        assert_eq!(config.warehouse.busy_timeout_ms, 5000);
        assert_eq!(config.stages.bronze.process_name, "bronze_incremental_load");
        assert!(config.stages.generate.is_none());
        assert!(!config.verbose);
    }

    #[test]
    fn test_deserialize_config() {
        let config: Config = serde_yaml::from_str(FULL_YAML).unwrap();

        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert!(config.verbose);
        assert_eq!(config.warehouse.attach.len(), 2);
        assert_eq!(config.warehouse.busy_timeout_ms, 2000);

        let generate = config.stages.generate.as_ref().unwrap();
        assert_eq!(generate.program, "python3");
        assert_eq!(generate.timeout_secs, 60);

        let table = &config.stages.bronze.tables[0];
        assert_eq!(table.target, "bronze.crm_cust_info");
        assert_eq!(table.columns, vec!["cst_id", "cst_key", "cst_firstname"]);
        assert_eq!(config.schedule.daily_at.as_deref(), Some("06:00"));

        config.validate().unwrap();
    }

    #[test]
    fn test_audit_path_defaults_to_warehouse() {
        let config: Config = serde_yaml::from_str(FULL_YAML).unwrap();
        assert_eq!(config.audit_path(), Path::new("/tmp/dw/warehouse.db"));
    }

    #[test]
    fn test_default_config_fails_validation() {
        let err = Config::default().validate().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("at least one table"));
        assert!(msg.contains("stages.silver.script"));
    }

    #[test]
    fn test_validate_reports_bad_table_spec() {
        let mut config: Config = serde_yaml::from_str(FULL_YAML).unwrap();
        let table = &mut config.stages.bronze.tables[0];
        table.key = vec!["missing".to_string()];
        table.columns.push("cst_id".to_string());

        let ConfigError::Invalid(problems) = config.validate().unwrap_err() else {
            panic!("expected Invalid");
        };
        assert!(problems.iter().any(|p| p.contains("'missing' is not in columns")));
        assert!(problems.iter().any(|p| p.contains("'cst_id' listed twice")));
    }

    #[test]
    fn test_validate_rejects_both_schedules() {
        let mut config: Config = serde_yaml::from_str(FULL_YAML).unwrap();
        config.schedule.interval_secs = Some(60);

        let msg = config.validate().unwrap_err().to_string();
        assert!(msg.contains("either interval-secs or daily-at"));
    }

    #[test]
    fn test_validate_accepts_schema_qualified_audit_table() {
        let mut config: Config = serde_yaml::from_str(FULL_YAML).unwrap();
        config.audit.table = "gold.etl_log".to_string();
        config.validate().unwrap();

        config.audit.table = "etl log".to_string();
        let msg = config.validate().unwrap_err().to_string();
        assert!(msg.contains("audit.table: invalid table name 'etl log'"));
    }

    #[test]
    fn test_parse_daily_at() {
        assert_eq!(parse_daily_at("06:30").unwrap(), NaiveTime::from_hms_opt(6, 30, 0).unwrap());
        assert!(parse_daily_at("6pm").is_err());
    }

    #[test]
    fn test_load_explicit_path() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("dwetl.yml");
        fs::write(&path, FULL_YAML).unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.source.as_deref(), Some(path.as_path()));
        assert_eq!(config.stages.bronze.tables.len(), 1);
    }

    #[test]
    fn test_load_missing_explicit_path_fails() {
        let result = Config::load(Some(&PathBuf::from("/nonexistent/dwetl.yml")));
        assert!(result.is_err());
    }
}
