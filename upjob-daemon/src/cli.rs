//! Command-line argument parsing.

use clap::Parser;
use upjob_common::LogFormat;

/// upjob daemon - update-job orchestrator
#[derive(Parser, Debug)]
#[command(name = "upjob-daemon")]
#[command(about = "upjob daemon - drives check, download and install jobs")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Log output format (pretty, json)
    #[arg(long, default_value = "pretty")]
    pub log_format: LogFormat,

    /// Shorthand for --log-format json
    #[arg(long)]
    pub log_json: bool,

    /// Refresh the package sources after init
    #[arg(long)]
    pub check: bool,

    /// Upgrade a classification (system, security, unknown). Repeatable.
    #[arg(long = "upgrade", value_name = "CLASSIFICATION")]
    pub upgrade: Vec<String>,

    /// Back up the system before installing
    #[arg(long)]
    pub atomic_upgrade: bool,

    /// Locale for change logs (e.g. en_US, zh_CN)
    #[arg(long)]
    pub locale: Option<String>,

    /// Stop after this long even if jobs are still running (e.g. "90s", "5m")
    #[arg(long, default_value = "10m")]
    pub run_for: String,
}

impl Args {
    /// Effective log format after the `--log-json` shorthand.
    pub fn log_format(&self) -> LogFormat {
        if self.log_json {
            LogFormat::Json
        } else {
            self.log_format
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeatable_upgrade() {
        let args = Args::parse_from([
            "upjob-daemon",
            "--check",
            "--upgrade",
            "system",
            "--upgrade",
            "security",
            "--log-json",
        ]);
        assert!(args.check);
        assert_eq!(args.log_format(), LogFormat::Json);
        assert_eq!(args.upgrade, vec!["system", "security"]);
        assert_eq!(args.run_for, "10m");
        assert!(args.config.is_none());
    }

    #[test]
    fn test_log_format_flag() {
        let args = Args::parse_from(["upjob-daemon", "--log-format", "json"]);
        assert_eq!(args.log_format(), LogFormat::Json);

        let args = Args::parse_from(["upjob-daemon"]);
        assert_eq!(args.log_format(), LogFormat::Pretty);

        assert!(Args::try_parse_from(["upjob-daemon", "--log-format", "xml"]).is_err());
    }
}
