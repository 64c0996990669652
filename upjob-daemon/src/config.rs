//! Configuration management for the update daemon.
//!
//! Loaded from `/etc/upjob/daemon.yaml` by default. Every section falls back
//! to its defaults, and CLI flags are applied on top.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use upjob_core::orchestrator::{DEFAULT_PROGRESS_DEBOUNCE, DEFAULT_WATCHDOG_INTERVAL};
use upjob_core::policy::DEFAULT_MIN_BATTERY_PERCENTAGE;
use upjob_core::{Classification, OrchestratorConfig, PolicySnapshot, UpdateMode};

use crate::cli::Args;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/upjob/daemon.yaml";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub orchestrator: OrchestratorSection,
    /// Initial policy toggles
    pub policy: PolicySection,
    pub update_log: UpdateLogSection,
    /// Simulated remote job service
    pub simulation: SimulationSection,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config =
            serde_yaml::from_str(&content).with_context(|| "Failed to parse config file")?;

        Ok(config)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if args.atomic_upgrade {
            self.policy.atomic_upgrade = true;
        }
        if let Some(ref locale) = args.locale {
            self.orchestrator.locale = locale.clone();
        }
        self
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        self.orchestrator.validate()?;
        self.policy.validate()?;
        self.update_log.validate()?;
        self.simulation.validate()
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            watchdog_interval: self.orchestrator.watchdog_interval_duration(),
            progress_debounce: self.orchestrator.progress_debounce,
            locale: self.orchestrator.locale.clone(),
        }
    }

    pub fn policy_snapshot(&self) -> PolicySnapshot {
        let p = &self.policy;
        PolicySnapshot {
            auto_check: p.auto_check,
            auto_download: p.auto_download,
            auto_install: p.auto_install,
            auto_clean_cache: p.auto_clean_cache,
            update_notify: p.update_notify,
            update_mode: p.update_mode_mask(),
            atomic_upgrade: p.atomic_upgrade,
            min_battery_percentage: self.orchestrator.min_battery_percentage,
            ..PolicySnapshot::default()
        }
    }
}

// =============================================================================
// ORCHESTRATOR
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    /// Silence after which a job is failed (e.g. "30m")
    pub watchdog_interval: String,
    /// Minimum progress increase relayed to listeners
    pub progress_debounce: f64,
    /// Battery level below which upgrades are refused while discharging
    pub min_battery_percentage: f64,
    /// Locale used for change logs
    pub locale: String,
    /// Path whose volume receives downloaded packages
    pub space_check_path: PathBuf,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            watchdog_interval: format!("{}m", DEFAULT_WATCHDOG_INTERVAL.as_secs() / 60),
            progress_debounce: DEFAULT_PROGRESS_DEBOUNCE,
            min_battery_percentage: DEFAULT_MIN_BATTERY_PERCENTAGE,
            locale: "en_US".to_string(),
            space_check_path: PathBuf::from("/var/cache/apt/archives"),
        }
    }
}

impl OrchestratorSection {
    pub fn watchdog_interval_duration(&self) -> Duration {
        parse_duration(&self.watchdog_interval).unwrap_or(DEFAULT_WATCHDOG_INTERVAL)
    }

    fn validate(&self) -> Result<(), String> {
        if parse_duration(&self.watchdog_interval).is_none() {
            return Err(format!(
                "Invalid watchdog interval '{}'. Use format like '30s', '10m', '1h'",
                self.watchdog_interval
            ));
        }
        if !(0.0..1.0).contains(&self.progress_debounce) {
            return Err(format!(
                "Progress debounce must be in [0, 1), got {}",
                self.progress_debounce
            ));
        }
        if !(0.0..=100.0).contains(&self.min_battery_percentage) {
            return Err(format!(
                "Minimum battery percentage must be in [0, 100], got {}",
                self.min_battery_percentage
            ));
        }
        if self.locale.is_empty() {
            return Err("Locale cannot be empty".to_string());
        }
        Ok(())
    }
}

// =============================================================================
// POLICY
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySection {
    pub auto_check: bool,
    pub auto_download: bool,
    pub auto_install: bool,
    pub auto_clean_cache: bool,
    pub update_notify: bool,
    /// Enabled classifications: system, security, unknown
    pub update_mode: Vec<String>,
    pub atomic_upgrade: bool,
}

impl Default for PolicySection {
    fn default() -> Self {
        let defaults = PolicySnapshot::default();
        Self {
            auto_check: defaults.auto_check,
            auto_download: defaults.auto_download,
            auto_install: defaults.auto_install,
            auto_clean_cache: defaults.auto_clean_cache,
            update_notify: defaults.update_notify,
            update_mode: vec!["system".into(), "security".into(), "unknown".into()],
            atomic_upgrade: defaults.atomic_upgrade,
        }
    }
}

impl PolicySection {
    /// Update-mode bit mask of the listed classifications.
    pub fn update_mode_mask(&self) -> UpdateMode {
        let bits = self
            .update_mode
            .iter()
            .filter_map(|name| name.parse::<Classification>().ok())
            .fold(0, |bits, c| bits | c.mode_bit());
        UpdateMode(bits)
    }

    fn validate(&self) -> Result<(), String> {
        for name in &self.update_mode {
            if name.parse::<Classification>().is_err() {
                return Err(format!(
                    "Invalid update mode entry '{}'. Must be system, security, unknown or all",
                    name
                ));
            }
        }
        Ok(())
    }
}

// =============================================================================
// UPDATE LOG
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateLogSection {
    /// Fetch version logs at all
    pub enabled: bool,
    /// Base URL of the update-log server
    pub server_url: String,
    /// Ask for logs of unstable releases too
    pub unstable: bool,
    /// Request timeout (e.g. "30s")
    pub timeout: String,
}

impl Default for UpdateLogSection {
    fn default() -> Self {
        Self {
            enabled: false,
            server_url: "http://localhost:9000".to_string(),
            unstable: false,
            timeout: "30s".to_string(),
        }
    }
}

impl UpdateLogSection {
    pub fn timeout_duration(&self) -> Duration {
        parse_duration(&self.timeout).unwrap_or(Duration::from_secs(30))
    }

    fn validate(&self) -> Result<(), String> {
        if self.enabled && self.server_url.is_empty() {
            return Err("Update-log server URL cannot be empty".to_string());
        }
        if parse_duration(&self.timeout).is_none() {
            return Err(format!("Invalid update-log timeout '{}'", self.timeout));
        }
        Ok(())
    }
}

// =============================================================================
// SIMULATION
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationSection {
    /// Time between two notifications of a simulated job (e.g. "500ms")
    pub step_interval: String,
    /// Bytes reported per package
    pub package_size: u64,
    /// Packages offered per install job id
    pub packages: HashMap<String, Vec<String>>,
    /// Job id → failure description for jobs that should fail
    pub failures: HashMap<String, String>,
}

impl Default for SimulationSection {
    fn default() -> Self {
        let packages = HashMap::from([
            (
                "system_upgrade".to_string(),
                vec!["base-files".to_string(), "linux-image-generic".to_string()],
            ),
            ("security_upgrade".to_string(), vec!["openssl".to_string()]),
        ]);
        Self {
            step_interval: "500ms".to_string(),
            package_size: 8 * 1024 * 1024,
            packages,
            failures: HashMap::new(),
        }
    }
}

impl SimulationSection {
    pub fn step_duration(&self) -> Duration {
        parse_duration(&self.step_interval).unwrap_or(Duration::from_millis(500))
    }

    fn validate(&self) -> Result<(), String> {
        match parse_duration(&self.step_interval) {
            Some(d) if !d.is_zero() => Ok(()),
            _ => Err(format!("Invalid step interval '{}'", self.step_interval)),
        }
    }
}

/// Parse a duration string like "500ms", "30s", "10m", "1h", "1d".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(num) = s.strip_suffix("ms") {
        return num.parse().ok().map(Duration::from_millis);
    }

    let (split, unit) = s.char_indices().last()?;
    let num: u64 = s[..split].parse().ok()?;

    let scale = match unit {
        's' => 1,
        'm' => 60,
        'h' => 3600,
        'd' => 86400,
        _ => return None,
    };

    num.checked_mul(scale).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("10m"), Some(Duration::from_secs(600)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("1d"), Some(Duration::from_secs(86400)));
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("s"), None);
    }

    #[test]
    fn test_parse_duration_rejects_odd_input() {
        assert_eq!(parse_duration("30秒"), None);
        assert_eq!(parse_duration("5µ"), None);
        assert_eq!(parse_duration("秒"), None);
        assert_eq!(parse_duration(&format!("{}d", u64::MAX)), None);

        let mut config = Config::default();
        config.orchestrator.watchdog_interval = "30秒".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.orchestrator_config().watchdog_interval, DEFAULT_WATCHDOG_INTERVAL);
        assert_eq!(config.policy_snapshot().update_mode, UpdateMode::ALL);
    }

    #[test]
    fn test_load_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
orchestrator:
  watchdog_interval: 10m
  min_battery_percentage: 40
policy:
  auto_download: true
  update_mode: [system]
simulation:
  step_interval: 100ms
  failures:
    prepare_security_upgrade: "E: No space left on device"
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(
            config.orchestrator.watchdog_interval_duration(),
            Duration::from_secs(600)
        );
        assert_eq!(config.orchestrator.locale, "en_US");

        let policy = config.policy_snapshot();
        assert!(policy.auto_download);
        assert!(!policy.auto_install);
        assert_eq!(policy.min_battery_percentage, 40.0);
        assert!(policy.update_mode.contains(Classification::System));
        assert!(!policy.update_mode.contains(Classification::Safe));
        assert_eq!(config.simulation.step_duration(), Duration::from_millis(100));
        assert_eq!(config.simulation.failures.len(), 1);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut config = Config::default();
        config.orchestrator.watchdog_interval = "forever".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.policy.update_mode = vec!["games".to_string()];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.simulation.step_interval = "0ms".to_string();
        assert!(config.validate().is_err());

        assert!(Config::load("/nonexistent/upjob.yaml").is_err());
    }
}
