//! Derived metrics computed from cached payloads
//!
//! Every function here is pure: views are rebuilt from the cached payload on
//! each request and never cached themselves.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::data::models::json_count;
use crate::data::CountryRecord;

/// Rounds to 2 decimal places
fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// ── Rates ─────────────────────────────────────────────────────────────

/// Outcome percentages relative to total cases
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Rates {
    pub recovery_rate: f64,
    pub fatality_rate: f64,
    pub active_case_percentage: f64,
}

/// Computes rate percentages, each rounded to 2 decimals
///
/// All rates are 0 when `cases` is not positive. Other counts are taken as
/// reported, so a negative `active` yields a negative percentage.
pub fn compute_rates(cases: i64, recovered: i64, deaths: i64, active: i64) -> Rates {
    if cases <= 0 {
        return Rates {
            recovery_rate: 0.0,
            fatality_rate: 0.0,
            active_case_percentage: 0.0,
        };
    }
    let cases = cases as f64;
    Rates {
        recovery_rate: round2(recovered as f64 / cases * 100.0),
        fatality_rate: round2(deaths as f64 / cases * 100.0),
        active_case_percentage: round2(active as f64 / cases * 100.0),
    }
}

/// Returns a copy of a JSON object with the rate fields merged in
pub fn with_rates(payload: &Value, rates: Rates) -> Value {
    let mut annotated = payload.clone();
    if let Some(obj) = annotated.as_object_mut() {
        obj.insert("recoveryRate".into(), Value::from(rates.recovery_rate));
        obj.insert("fatalityRate".into(), Value::from(rates.fatality_rate));
        obj.insert(
            "activeCasePercentage".into(),
            Value::from(rates.active_case_percentage),
        );
    }
    annotated
}

// ── Risk ──────────────────────────────────────────────────────────────

/// Ordered risk categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum RiskLevel {
    #[serde(rename = "Very Low")]
    VeryLow,
    Low,
    Moderate,
    High,
    #[serde(rename = "Very High")]
    VeryHigh,
}

/// Score thresholds; a score strictly above a threshold reaches that level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskThresholds {
    pub very_high: f64,
    pub high: f64,
    pub moderate: f64,
    pub low: f64,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            very_high: 70.0,
            high: 50.0,
            moderate: 30.0,
            low: 10.0,
        }
    }
}

impl RiskLevel {
    pub fn from_score(score: f64, thresholds: &RiskThresholds) -> Self {
        if score > thresholds.very_high {
            RiskLevel::VeryHigh
        } else if score > thresholds.high {
            RiskLevel::High
        } else if score > thresholds.moderate {
            RiskLevel::Moderate
        } else if score > thresholds.low {
            RiskLevel::Low
        } else {
            RiskLevel::VeryLow
        }
    }
}

/// Weights and scales of the risk score
///
/// Each per-million component contributes
/// `min(per_million / divisor, component_cap) * weight`; testing adds
/// `clamp(1 - tests_per_million / testing_saturation, 0, 1) * testing_weight`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub active_weight: f64,
    pub active_divisor: f64,
    pub death_weight: f64,
    pub death_divisor: f64,
    pub critical_weight: f64,
    pub critical_divisor: f64,
    pub component_cap: f64,
    pub testing_weight: f64,
    pub testing_saturation: f64,
    pub thresholds: RiskThresholds,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            active_weight: 0.4,
            active_divisor: 500.0,
            death_weight: 0.3,
            death_divisor: 250.0,
            critical_weight: 0.2,
            critical_divisor: 25.0,
            component_cap: 100.0,
            testing_weight: 0.1,
            testing_saturation: 500_000.0,
            thresholds: RiskThresholds::default(),
        }
    }
}

impl RiskConfig {
    /// Validation problems, empty when the config is usable
    pub fn issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        for (name, weight) in [
            ("risk.active_weight", self.active_weight),
            ("risk.death_weight", self.death_weight),
            ("risk.critical_weight", self.critical_weight),
            ("risk.testing_weight", self.testing_weight),
            ("risk.component_cap", self.component_cap),
        ] {
            if !(weight >= 0.0) {
                issues.push(format!("{} must be >= 0", name));
            }
        }
        for (name, divisor) in [
            ("risk.active_divisor", self.active_divisor),
            ("risk.death_divisor", self.death_divisor),
            ("risk.critical_divisor", self.critical_divisor),
            ("risk.testing_saturation", self.testing_saturation),
        ] {
            if !(divisor > 0.0) {
                issues.push(format!("{} must be > 0", name));
            }
        }
        let t = &self.thresholds;
        if !(t.very_high > t.high && t.high > t.moderate && t.moderate > t.low) {
            issues.push("risk.thresholds must be strictly descending from very_high to low".into());
        }
        issues
    }
}

/// Inputs of the risk score, per million population
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskFactors {
    pub active_cases: f64,
    pub death_rate: f64,
    pub critical_cases: f64,
    pub testing_rate: f64,
}

/// Risk assessment for one country
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskAssessment {
    pub country: String,
    pub score: f64,
    pub category: RiskLevel,
    pub factors: RiskFactors,
}

/// Computes the weighted 0-100 risk score for a country
pub fn assess_risk(record: &CountryRecord, config: &RiskConfig) -> RiskAssessment {
    let component = |per_million: f64, divisor: f64, weight: f64| {
        (per_million / divisor).min(config.component_cap) * weight
    };

    let active = component(
        record.active_per_one_million,
        config.active_divisor,
        config.active_weight,
    );
    let deaths = component(
        record.deaths_per_one_million,
        config.death_divisor,
        config.death_weight,
    );
    let critical = component(
        record.critical_per_one_million,
        config.critical_divisor,
        config.critical_weight,
    );
    let testing = (1.0 - record.tests_per_one_million / config.testing_saturation).clamp(0.0, 1.0)
        * config.testing_weight;

    let score = round2(active + deaths + critical + testing);

    RiskAssessment {
        country: record.country.clone(),
        score,
        category: RiskLevel::from_score(score, &config.thresholds),
        factors: RiskFactors {
            active_cases: record.active_per_one_million,
            death_rate: record.deaths_per_one_million,
            critical_cases: record.critical_per_one_million,
            testing_rate: record.tests_per_one_million,
        },
    }
}

// ── Series ────────────────────────────────────────────────────────────

/// Day-over-day differences of a cumulative series
///
/// The first delta is always 0; an empty series yields an empty result.
pub fn daily_deltas(series: &[i64]) -> Vec<i64> {
    let mut deltas = Vec::with_capacity(series.len());
    if series.is_empty() {
        return deltas;
    }
    deltas.push(0);
    deltas.extend(series.windows(2).map(|pair| pair[1] - pair[0]));
    deltas
}

/// Chart-ready historical series for one country
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoricalView {
    pub country: Option<String>,
    pub dates: Vec<String>,
    pub cases: Vec<i64>,
    pub deaths: Vec<i64>,
    pub recovered: Vec<i64>,
    pub new_cases: Vec<i64>,
    pub new_deaths: Vec<i64>,
    pub new_recovered: Vec<i64>,
}

/// Builds the historical view from a `/historical/{country}` payload
///
/// Dates follow the `cases` timeline in upstream order; `deaths` and
/// `recovered` are aligned to those dates, 0 where missing.
pub fn historical_view(payload: &Value) -> HistoricalView {
    let timeline = payload.get("timeline").unwrap_or(payload);
    let empty = Map::new();
    let series = |name: &str| timeline.get(name).and_then(Value::as_object).unwrap_or(&empty);

    let cases_map = series("cases");
    let deaths_map = series("deaths");
    let recovered_map = series("recovered");

    let dates: Vec<String> = cases_map.keys().cloned().collect();
    let aligned = |map: &Map<String, Value>| -> Vec<i64> {
        dates
            .iter()
            .map(|date| map.get(date).map(json_count).unwrap_or(0))
            .collect()
    };

    let cases = aligned(cases_map);
    let deaths = aligned(deaths_map);
    let recovered = aligned(recovered_map);

    HistoricalView {
        country: payload
            .get("country")
            .and_then(Value::as_str)
            .map(str::to_string),
        new_cases: daily_deltas(&cases),
        new_deaths: daily_deltas(&deaths),
        new_recovered: daily_deltas(&recovered),
        dates,
        cases,
        deaths,
        recovered,
    }
}

/// Chart-ready vaccination series for one country
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VaccinationView {
    pub country: Option<String>,
    pub dates: Vec<String>,
    pub vaccinations: Vec<i64>,
    pub new_vaccinations: Vec<i64>,
}

/// Builds the vaccination view from a vaccine coverage payload
///
/// Accepts the timeline as a `date -> total` object or as an array of
/// `{ "date", "total" }` records.
pub fn vaccination_view(payload: &Value) -> VaccinationView {
    let timeline = payload.get("timeline").unwrap_or(payload);

    let (dates, vaccinations): (Vec<String>, Vec<i64>) = match timeline {
        Value::Object(map) => map
            .iter()
            .filter(|(key, _)| key.as_str() != "country")
            .map(|(date, total)| (date.clone(), json_count(total)))
            .unzip(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| {
                let date = item.get("date")?.as_str()?.to_string();
                Some((date, item.get("total").map(json_count).unwrap_or(0)))
            })
            .unzip(),
        _ => (Vec::new(), Vec::new()),
    };

    VaccinationView {
        country: payload
            .get("country")
            .and_then(Value::as_str)
            .map(str::to_string),
        new_vaccinations: daily_deltas(&vaccinations),
        dates,
        vaccinations,
    }
}

// ── Countries ─────────────────────────────────────────────────────────

/// True if a raw country object matches a name or ISO code, ignoring case
pub fn country_matches(record: &Value, ident: &str) -> bool {
    let ident = ident.trim();
    if ident.is_empty() {
        return false;
    }
    let field_eq = |value: Option<&Value>| {
        value
            .and_then(Value::as_str)
            .is_some_and(|s| s.eq_ignore_ascii_case(ident))
    };
    let info = record.get("countryInfo");
    field_eq(record.get("country"))
        || field_eq(info.and_then(|i| i.get("iso2")))
        || field_eq(info.and_then(|i| i.get("iso3")))
}

/// Finds a country in an all-countries payload
pub fn find_country<'a>(countries: &'a Value, ident: &str) -> Option<&'a Value> {
    countries
        .as_array()?
        .iter()
        .find(|record| country_matches(record, ident))
}

/// Entry of the country directory used for autocomplete
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirectoryEntry {
    pub name: String,
    pub code: String,
    pub flag: Option<String>,
}

/// Lists countries that carry an ISO2 code, sorted by name
pub fn country_directory(countries: &Value) -> Vec<DirectoryEntry> {
    let mut entries: Vec<DirectoryEntry> = countries
        .as_array()
        .map(|items| items.as_slice())
        .unwrap_or_default()
        .iter()
        .filter_map(|item| serde_json::from_value::<CountryRecord>(item.clone()).ok())
        .filter_map(|record| {
            let code = record.country_info.iso2?;
            Some(DirectoryEntry {
                name: record.country,
                code,
                flag: record.country_info.flag,
            })
        })
        .collect();
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    entries
}

/// One row of a side-by-side country comparison
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonRow {
    pub country: String,
    pub cases: i64,
    pub deaths: i64,
    pub recovered: i64,
    pub active: i64,
    pub cases_per_one_million: f64,
    pub deaths_per_one_million: f64,
    pub tests: i64,
    pub tests_per_one_million: f64,
    pub population: i64,
}

impl From<CountryRecord> for ComparisonRow {
    fn from(record: CountryRecord) -> Self {
        Self {
            country: record.country,
            cases: record.cases,
            deaths: record.deaths,
            recovered: record.recovered,
            active: record.active,
            cases_per_one_million: record.cases_per_one_million,
            deaths_per_one_million: record.deaths_per_one_million,
            tests: record.tests,
            tests_per_one_million: record.tests_per_one_million,
            population: record.population,
        }
    }
}

/// Projects the requested countries into comparison rows
///
/// Rows follow request order; unknown countries are silently left out.
pub fn compare_countries<S: AsRef<str>>(countries: &Value, idents: &[S]) -> Vec<ComparisonRow> {
    idents
        .iter()
        .filter_map(|ident| find_country(countries, ident.as_ref()))
        .filter_map(|record| serde_json::from_value::<CountryRecord>(record.clone()).ok())
        .map(ComparisonRow::from)
        .collect()
}

/// Compares one metric across countries
///
/// Returns `name -> { value, perMillion, population }` keyed by the requested
/// name, in request order. Countries that are unknown or lack a numeric
/// `metric` are left out.
pub fn compare_metric<S: AsRef<str>>(countries: &Value, idents: &[S], metric: &str) -> Map<String, Value> {
    let mut result = Map::new();
    for ident in idents {
        let Some(record) = find_country(countries, ident.as_ref()) else {
            continue;
        };
        let Some(value) = record.get(metric).and_then(Value::as_f64) else {
            continue;
        };
        let per_million = record
            .get(format!("{}PerOneMillion", metric))
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        let population = record.get("population").map(json_count).unwrap_or(0);
        result.insert(
            ident.as_ref().trim().to_string(),
            json!({
                "value": value,
                "perMillion": per_million,
                "population": population,
            }),
        );
    }
    result
}

// ── Export ────────────────────────────────────────────────────────────

/// Summary record for exporting one country
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportSummary {
    pub country: String,
    pub updated: String,
    pub total_cases: i64,
    pub active_cases: i64,
    pub recovered: i64,
    pub deaths: i64,
    pub tests: i64,
    pub population: i64,
    pub cases_per_one_million: f64,
    pub deaths_per_one_million: f64,
    pub historical: Value,
}

/// Combines a country record with its history payload for export
pub fn export_summary(record: &CountryRecord, history: &Value) -> ExportSummary {
    let updated = DateTime::<Utc>::from_timestamp_millis(record.updated)
        .unwrap_or(DateTime::UNIX_EPOCH)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string();

    ExportSummary {
        country: record.country.clone(),
        updated,
        total_cases: record.cases,
        active_cases: record.active,
        recovered: record.recovered,
        deaths: record.deaths,
        tests: record.tests,
        population: record.population,
        cases_per_one_million: record.cases_per_one_million,
        deaths_per_one_million: record.deaths_per_one_million,
        historical: history
            .get("timeline")
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new())),
    }
}
