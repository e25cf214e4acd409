//! Core data model for the statistics cache
//!
//! This module defines the data categories served by the cache, the keys
//! entries are addressed by, and the typed queries that name a single
//! upstream resource.

pub mod models;
pub mod upstream;

pub use models::{CountryInfo, CountryRecord, GlobalTotals};
pub use upstream::{HttpUpstream, Upstream};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Default lookback window for historical series, in days
pub const DEFAULT_HISTORY_DAYS: u32 = 30;

/// An enumerated data domain served by the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    /// Worldwide totals (`/all`)
    GlobalTotals,
    /// Snapshot of every country (`/countries`)
    AllCountries,
    /// Cumulative series for one country (`/historical/{country}`)
    CountryHistory,
    /// Cumulative vaccine doses for one country
    CountryVaccination,
}

impl Category {
    /// Whether entries of this category are addressed by a per-country sub-key
    pub fn is_keyed(self) -> bool {
        matches!(self, Category::CountryHistory | Category::CountryVaccination)
    }

    /// Stable identifier used in snapshot paths
    pub fn slug(self) -> &'static str {
        match self {
            Category::GlobalTotals => "global",
            Category::AllCountries => "countries",
            Category::CountryHistory => "history",
            Category::CountryVaccination => "vaccination",
        }
    }

    /// Human-readable name used in messages
    pub fn label(self) -> &'static str {
        match self {
            Category::GlobalTotals => "Global",
            Category::AllCountries => "Country",
            Category::CountryHistory => "Historical",
            Category::CountryVaccination => "Vaccination",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

/// Address of a cache entry and its snapshot
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub category: Category,
    pub sub_key: String,
}

impl CacheKey {
    pub fn new(category: Category, sub_key: impl Into<String>) -> Self {
        Self {
            category,
            sub_key: sub_key.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sub_key.is_empty() {
            write!(f, "{}", self.category)
        } else {
            write!(f, "{}/{}", self.category, self.sub_key)
        }
    }
}

/// How far back a time series request reaches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Lookback {
    Days(u32),
    All,
}

impl fmt::Display for Lookback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lookback::Days(days) => write!(f, "{}", days),
            Lookback::All => f.write_str("all"),
        }
    }
}

impl FromStr for Lookback {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("all") {
            return Ok(Lookback::All);
        }
        match trimmed.parse::<u32>() {
            Ok(days) if days > 0 => Ok(Lookback::Days(days)),
            _ => Err(format!(
                "invalid lookback '{}': expected a positive number of days or 'all'",
                s
            )),
        }
    }
}

/// A single upstream resource request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Global,
    AllCountries,
    History { country: String, lookback: Lookback },
    Vaccination { country: String, lookback: Lookback },
}

impl Query {
    pub fn history(country: impl Into<String>, lookback: Lookback) -> Self {
        Query::History {
            country: country.into(),
            lookback,
        }
    }

    pub fn vaccination(country: impl Into<String>, lookback: Lookback) -> Self {
        Query::Vaccination {
            country: country.into(),
            lookback,
        }
    }

    pub fn category(&self) -> Category {
        match self {
            Query::Global => Category::GlobalTotals,
            Query::AllCountries => Category::AllCountries,
            Query::History { .. } => Category::CountryHistory,
            Query::Vaccination { .. } => Category::CountryVaccination,
        }
    }

    /// Within-category identifier
    ///
    /// Empty for the zero-key categories; otherwise the lower-cased country
    /// joined with the lookback window, so different windows never share an
    /// entry.
    pub fn sub_key(&self) -> String {
        match self {
            Query::Global | Query::AllCountries => String::new(),
            Query::History { country, lookback } | Query::Vaccination { country, lookback } => {
                format!("{}|{}", country.trim().to_lowercase(), lookback)
            }
        }
    }

    pub fn key(&self) -> CacheKey {
        CacheKey::new(self.category(), self.sub_key())
    }

    /// Country named by a keyed query
    pub fn country(&self) -> Option<&str> {
        match self {
            Query::History { country, .. } | Query::Vaccination { country, .. } => {
                Some(country.trim())
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_key_categories_use_empty_sub_key() {
        assert_eq!(Query::Global.sub_key(), "");
        assert_eq!(Query::AllCountries.sub_key(), "");
        assert!(!Category::GlobalTotals.is_keyed());
        assert!(Category::CountryHistory.is_keyed());
    }

    #[test]
    fn test_sub_key_combines_country_and_lookback() {
        let q = Query::history(" Germany ", Lookback::Days(30));
        assert_eq!(q.sub_key(), "germany|30");
        assert_eq!(q.country(), Some("Germany"));

        let v = Query::vaccination("Germany", Lookback::All);
        assert_eq!(v.sub_key(), "germany|all");
    }

    #[test]
    fn test_same_sub_key_in_different_categories_gives_distinct_keys() {
        let h = Query::history("france", Lookback::Days(7)).key();
        let v = Query::vaccination("france", Lookback::Days(7)).key();
        assert_eq!(h.sub_key, v.sub_key);
        assert_ne!(h, v);
    }

    #[test]
    fn test_lookback_parsing() {
        assert_eq!("all".parse::<Lookback>().unwrap(), Lookback::All);
        assert_eq!("ALL".parse::<Lookback>().unwrap(), Lookback::All);
        assert_eq!("14".parse::<Lookback>().unwrap(), Lookback::Days(14));
        assert!("0".parse::<Lookback>().is_err());
        assert!("-3".parse::<Lookback>().is_err());
        assert!("week".parse::<Lookback>().is_err());
    }

    #[test]
    fn test_cache_key_display() {
        assert_eq!(CacheKey::new(Category::GlobalTotals, "").to_string(), "global");
        assert_eq!(
            Query::history("italy", Lookback::Days(5)).key().to_string(),
            "history/italy|5"
        );
    }
}
