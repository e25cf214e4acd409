//! Command-line interface parsing for statcache
//!
//! Each subcommand maps to one view of the statistics service. Lookback
//! windows are validated by clap through `Lookback`'s `FromStr`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::data::Lookback;
use crate::service::{parse_country_list, DEFAULT_METRIC};

/// statcache - cached COVID-19 statistics with offline fallback
#[derive(Parser, Debug)]
#[command(name = "statcache")]
#[command(about = "Cached COVID-19 statistics with snapshot fallback")]
#[command(version)]
pub struct Cli {
    /// Path to a TOML config file (default: ./statcache.toml if present)
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Worldwide totals with recovery, fatality and active rates
    Global,
    /// Every country's current record
    Countries,
    /// Country names, ISO codes and flags
    Directory,
    /// One country's record with rates
    Country {
        /// Country name or ISO2/ISO3 code
        name: String,
    },
    /// Daily historical series for a country
    History {
        country: String,
        /// Number of days to look back, or "all"
        #[arg(long, value_name = "N")]
        days: Option<Lookback>,
    },
    /// Vaccination series for a country
    Vaccination {
        country: String,
        /// Number of days to look back, or "all"
        #[arg(long, value_name = "N|all")]
        days: Option<Lookback>,
    },
    /// Compare countries side by side, or on a single metric
    ///
    /// Examples:
    ///   statcache compare germany,france
    ///   statcache compare germany,france --metric deaths
    Compare {
        /// Comma-separated country names or codes
        countries: String,
        /// Compare only this metric (e.g. cases, deaths, tests)
        #[arg(long, value_name = "METRIC", num_args = 0..=1, default_missing_value = DEFAULT_METRIC)]
        metric: Option<String>,
    },
    /// Weighted risk assessment for a country
    Risk { country: String },
    /// Export summary with the last 30 days of history
    Export { country: String },
    /// Keep global totals and the country list refreshed until Ctrl-C
    Watch,
}

impl Cli {
    /// Countries named by a `compare` command
    pub fn compare_countries(&self) -> Vec<String> {
        match &self.command {
            Command::Compare { countries, .. } => parse_country_list(countries),
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_global() {
        let cli = Cli::parse_from(["statcache", "global"]);
        assert_eq!(cli.command, Command::Global);
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_cli_parse_config_after_subcommand() {
        let cli = Cli::parse_from(["statcache", "countries", "--config", "my.toml"]);
        assert_eq!(cli.command, Command::Countries);
        assert_eq!(cli.config, Some(PathBuf::from("my.toml")));
    }

    #[test]
    fn test_cli_parse_history_days() {
        let cli = Cli::parse_from(["statcache", "history", "germany", "--days", "14"]);
        assert_eq!(
            cli.command,
            Command::History {
                country: "germany".into(),
                days: Some(Lookback::Days(14)),
            }
        );
    }

    #[test]
    fn test_cli_parse_history_without_days() {
        let cli = Cli::parse_from(["statcache", "history", "germany"]);
        assert!(matches!(cli.command, Command::History { days: None, .. }));
    }

    #[test]
    fn test_cli_parse_vaccination_all() {
        let cli = Cli::parse_from(["statcache", "vaccination", "chile", "--days", "all"]);
        assert!(matches!(
            cli.command,
            Command::Vaccination {
                days: Some(Lookback::All),
                ..
            }
        ));
    }

    #[test]
    fn test_cli_rejects_invalid_days() {
        assert!(Cli::try_parse_from(["statcache", "history", "germany", "--days", "0"]).is_err());
        assert!(Cli::try_parse_from(["statcache", "history", "germany", "--days", "week"]).is_err());
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["statcache"]).is_err());
    }

    #[test]
    fn test_cli_parse_compare() {
        let cli = Cli::parse_from(["statcache", "compare", "germany, france,"]);
        assert_eq!(cli.compare_countries(), vec!["germany", "france"]);
        assert!(matches!(cli.command, Command::Compare { metric: None, .. }));
    }

    #[test]
    fn test_cli_parse_compare_metric() {
        let cli = Cli::parse_from(["statcache", "compare", "de,fr", "--metric", "deaths"]);
        assert!(matches!(
            cli.command,
            Command::Compare { metric: Some(ref m), .. } if m == "deaths"
        ));

        let cli = Cli::parse_from(["statcache", "compare", "de,fr", "--metric"]);
        assert!(matches!(
            cli.command,
            Command::Compare { metric: Some(ref m), .. } if m == "cases"
        ));
    }
}
