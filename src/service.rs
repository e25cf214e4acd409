//! Collaborator-facing surface
//!
//! One resolve-and-derive entry point per view. Every method resolves what it
//! needs through the orchestrator, derives the view on read, and reports
//! failures as an [`ApiError`] a route layer can serialize directly.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::cache::{Orchestrator, Resolved, Source};
use crate::config::{Config, DefaultsConfig};
use crate::data::{CountryRecord, GlobalTotals, Lookback, Query, DEFAULT_HISTORY_DAYS};
use crate::derived::{
    self, ComparisonRow, DirectoryEntry, ExportSummary, HistoricalView, RiskAssessment, RiskConfig,
    VaccinationView,
};
use crate::error::{ApiError, ErrorKind};

/// Metric compared when the caller names none
pub const DEFAULT_METRIC: &str = "cases";

/// A derived view plus where its data came from
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Served<T> {
    pub data: T,
    pub fetched_at: DateTime<Utc>,
    pub source: Source,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl<T> Served<T> {
    fn new(data: T, resolved: &Resolved) -> Self {
        Self {
            data,
            fetched_at: resolved.fetched_at,
            source: resolved.source,
            warnings: resolved.warning.iter().cloned().collect(),
        }
    }

    /// Folds in the outcome of another resolve the view depends on
    fn also(mut self, resolved: &Resolved) -> Self {
        self.fetched_at = self.fetched_at.min(resolved.fetched_at);
        self.warnings.extend(resolved.warning.iter().cloned());
        self
    }
}

/// Splits a comma-separated country list, dropping empty items
pub fn parse_country_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Statistics views over a shared orchestrator
#[derive(Clone)]
pub struct StatsService {
    orchestrator: Orchestrator,
    risk: RiskConfig,
    defaults: DefaultsConfig,
}

impl StatsService {
    pub fn new(orchestrator: Orchestrator, risk: RiskConfig, defaults: DefaultsConfig) -> Self {
        Self {
            orchestrator,
            risk,
            defaults,
        }
    }

    pub fn from_config(orchestrator: Orchestrator, config: &Config) -> Self {
        Self::new(orchestrator, config.risk.clone(), config.defaults.clone())
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    async fn resolve(&self, query: &Query) -> Result<Resolved, ApiError> {
        let resolved = self.orchestrator.resolve(query).await?;
        debug!(key = %query.key(), source = ?resolved.source, "resolved");
        Ok(resolved)
    }

    /// Worldwide totals annotated with rate percentages
    pub async fn global(&self) -> Result<Served<Value>, ApiError> {
        let resolved = self.resolve(&Query::Global).await?;
        let totals: GlobalTotals = decode(&resolved.payload, "global totals")?;
        let rates = derived::compute_rates(
            totals.cases,
            totals.recovered,
            totals.deaths,
            totals.active,
        );
        Ok(Served::new(derived::with_rates(&resolved.payload, rates), &resolved))
    }

    /// The full all-countries payload
    pub async fn countries(&self) -> Result<Served<Value>, ApiError> {
        let resolved = self.resolve(&Query::AllCountries).await?;
        Ok(Served::new(resolved.payload.as_ref().clone(), &resolved))
    }

    /// Country names, codes and flags for autocomplete
    pub async fn directory(&self) -> Result<Served<Vec<DirectoryEntry>>, ApiError> {
        let resolved = self.resolve(&Query::AllCountries).await?;
        Ok(Served::new(derived::country_directory(&resolved.payload), &resolved))
    }

    /// One country's record annotated with rate percentages
    pub async fn country(&self, name: &str) -> Result<Served<Value>, ApiError> {
        let name = require_country(name)?;
        let resolved = self.resolve(&Query::AllCountries).await?;
        let (raw, record) = lookup_country(&resolved.payload, name)?;
        let rates = derived::compute_rates(
            record.cases,
            record.recovered,
            record.deaths,
            record.active,
        );
        Ok(Served::new(derived::with_rates(raw, rates), &resolved))
    }

    /// Cumulative series and daily deltas for one country
    pub async fn historical(
        &self,
        country: &str,
        lookback: Option<Lookback>,
    ) -> Result<Served<HistoricalView>, ApiError> {
        let country = require_country(country)?;
        let lookback = lookback.unwrap_or_else(|| self.defaults.history_lookback());
        let resolved = self.resolve(&Query::history(country, lookback)).await?;
        Ok(Served::new(derived::historical_view(&resolved.payload), &resolved))
    }

    /// Vaccination series and daily deltas for one country
    pub async fn vaccination(
        &self,
        country: &str,
        lookback: Option<Lookback>,
    ) -> Result<Served<VaccinationView>, ApiError> {
        let country = require_country(country)?;
        let lookback = lookback.unwrap_or_else(|| self.defaults.vaccination_lookback());
        let resolved = self.resolve(&Query::vaccination(country, lookback)).await?;
        Ok(Served::new(derived::vaccination_view(&resolved.payload), &resolved))
    }

    /// Side-by-side rows for the named countries; unknown names are omitted
    pub async fn compare(&self, countries: &[String]) -> Result<Served<Vec<ComparisonRow>>, ApiError> {
        require_countries(countries)?;
        let resolved = self.resolve(&Query::AllCountries).await?;
        Ok(Served::new(
            derived::compare_countries(&resolved.payload, countries),
            &resolved,
        ))
    }

    /// One metric across the named countries
    pub async fn compare_metric(
        &self,
        countries: &[String],
        metric: &str,
    ) -> Result<Served<Map<String, Value>>, ApiError> {
        require_countries(countries)?;
        let metric = metric.trim();
        if metric.is_empty() {
            return Err(ApiError::bad_request("Please specify a metric to compare"));
        }

        let resolved = self.resolve(&Query::AllCountries).await?;
        let result = derived::compare_metric(&resolved.payload, countries, metric);
        if result.is_empty() {
            return Err(ApiError::not_found(format!(
                "No '{}' data found for the specified countries",
                metric
            )));
        }
        Ok(Served::new(result, &resolved))
    }

    /// Weighted risk score for one country
    pub async fn risk(&self, country: &str) -> Result<Served<RiskAssessment>, ApiError> {
        let country = require_country(country)?;
        let resolved = self.resolve(&Query::AllCountries).await?;
        let (_, record) = lookup_country(&resolved.payload, country)?;
        Ok(Served::new(derived::assess_risk(&record, &self.risk), &resolved))
    }

    /// Country record combined with its recent history
    pub async fn export(&self, country: &str) -> Result<Served<ExportSummary>, ApiError> {
        let country = require_country(country)?;
        let countries = self.resolve(&Query::AllCountries).await?;
        let (_, record) = lookup_country(&countries.payload, country)?;

        let history_query = Query::history(country, Lookback::Days(DEFAULT_HISTORY_DAYS));
        let history = self.resolve(&history_query).await?;

        let summary = derived::export_summary(&record, &history.payload);
        Ok(Served::new(summary, &countries).also(&history))
    }
}

fn require_country(name: &str) -> Result<&str, ApiError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ApiError::bad_request("Please specify a country"));
    }
    Ok(name)
}

fn require_countries(countries: &[String]) -> Result<(), ApiError> {
    if countries.iter().all(|c| c.trim().is_empty()) {
        return Err(ApiError::bad_request("Please specify countries to compare"));
    }
    Ok(())
}

/// Finds a country in the all-countries payload and decodes it
fn lookup_country<'a>(countries: &'a Value, name: &str) -> Result<(&'a Value, CountryRecord), ApiError> {
    let raw = derived::find_country(countries, name)
        .ok_or_else(|| ApiError::not_found(format!("Country '{}' not found", name)))?;
    let record = decode(raw, "country record")?;
    Ok((raw, record))
}

fn decode<T: serde::de::DeserializeOwned>(payload: &Value, what: &str) -> Result<T, ApiError> {
    serde_json::from_value(payload.clone()).map_err(|e| {
        warn!("cached {} did not decode: {}", what, e);
        ApiError::new(
            ErrorKind::MalformedPayload,
            format!("Cached {} could not be read", what),
        )
    })
}
