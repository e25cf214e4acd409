//! Typed views over upstream payloads
//!
//! The cache stores payloads as opaque JSON; derived views deserialize the
//! parts they need into these structs. Every field is defaulted since the
//! upstream omits fields freely (e.g. `recovered` for some countries), and
//! numbers are read leniently: upstream counts can be negative, fractional or
//! null, and one odd value must not hide an otherwise valid record.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Reads a JSON number as an integer count, truncating fractions
///
/// Null and non-numeric values count as 0.
pub(crate) fn json_count(value: &Value) -> i64 {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f as i64))
        .unwrap_or(0)
}

fn lenient_count<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(|value| json_count(&value))
}

fn lenient_rate<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(|value| value.as_f64().unwrap_or(0.0))
}

/// Worldwide totals from `/all`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalTotals {
    #[serde(deserialize_with = "lenient_count")]
    pub updated: i64,
    #[serde(deserialize_with = "lenient_count")]
    pub cases: i64,
    #[serde(deserialize_with = "lenient_count")]
    pub deaths: i64,
    #[serde(deserialize_with = "lenient_count")]
    pub recovered: i64,
    #[serde(deserialize_with = "lenient_count")]
    pub active: i64,
    #[serde(deserialize_with = "lenient_count")]
    pub critical: i64,
    #[serde(deserialize_with = "lenient_count")]
    pub tests: i64,
    #[serde(deserialize_with = "lenient_count")]
    pub population: i64,
    #[serde(deserialize_with = "lenient_count")]
    pub affected_countries: i64,
}

/// Identifying metadata nested in every country record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CountryInfo {
    pub iso2: Option<String>,
    pub iso3: Option<String>,
    pub flag: Option<String>,
}

/// One element of the `/countries` array
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CountryRecord {
    pub country: String,
    pub country_info: CountryInfo,
    #[serde(deserialize_with = "lenient_count")]
    pub updated: i64,
    #[serde(deserialize_with = "lenient_count")]
    pub cases: i64,
    #[serde(deserialize_with = "lenient_count")]
    pub deaths: i64,
    #[serde(deserialize_with = "lenient_count")]
    pub recovered: i64,
    #[serde(deserialize_with = "lenient_count")]
    pub active: i64,
    #[serde(deserialize_with = "lenient_count")]
    pub critical: i64,
    #[serde(deserialize_with = "lenient_count")]
    pub tests: i64,
    #[serde(deserialize_with = "lenient_count")]
    pub population: i64,
    #[serde(deserialize_with = "lenient_rate")]
    pub cases_per_one_million: f64,
    #[serde(deserialize_with = "lenient_rate")]
    pub deaths_per_one_million: f64,
    #[serde(deserialize_with = "lenient_rate")]
    pub tests_per_one_million: f64,
    #[serde(deserialize_with = "lenient_rate")]
    pub active_per_one_million: f64,
    #[serde(deserialize_with = "lenient_rate")]
    pub recovered_per_one_million: f64,
    #[serde(deserialize_with = "lenient_rate")]
    pub critical_per_one_million: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    const COUNTRY_JSON: &str = r#"{
        "updated": 1700000000000,
        "country": "Germany",
        "countryInfo": {
            "_id": 276,
            "iso2": "DE",
            "iso3": "DEU",
            "lat": 51,
            "long": 9,
            "flag": "https://disease.sh/assets/img/flags/de.png"
        },
        "cases": 38437756,
        "todayCases": 0,
        "deaths": 174979,
        "recovered": 38240600,
        "active": 22177,
        "critical": 0,
        "casesPerOneMillion": 458236,
        "deathsPerOneMillion": 2086,
        "tests": 122332384,
        "testsPerOneMillion": 1458359,
        "population": 83883596,
        "continent": "Europe",
        "activePerOneMillion": 264.38,
        "recoveredPerOneMillion": 455886.07,
        "criticalPerOneMillion": 0
    }"#;

    #[test]
    fn test_parse_country_record() {
        let record: CountryRecord = serde_json::from_str(COUNTRY_JSON).unwrap();
        assert_eq!(record.country, "Germany");
        assert_eq!(record.country_info.iso2.as_deref(), Some("DE"));
        assert_eq!(record.cases, 38437756);
        assert!((record.active_per_one_million - 264.38).abs() < 1e-9);
    }

    #[test]
    fn test_missing_fields_default_to_zero() {
        let record: CountryRecord =
            serde_json::from_str(r#"{"country": "Atlantis", "cases": 5}"#).unwrap();
        assert_eq!(record.cases, 5);
        assert_eq!(record.recovered, 0);
        assert!(record.country_info.iso2.is_none());
    }

    #[test]
    fn test_odd_numbers_do_not_fail_the_record() {
        let record: CountryRecord = serde_json::from_str(
            r#"{
                "country": "Chile",
                "cases": 100,
                "recovered": 116,
                "active": -21,
                "tests": 1500.7,
                "population": null,
                "testsPerOneMillion": null
            }"#,
        )
        .unwrap();
        assert_eq!(record.active, -21);
        assert_eq!(record.tests, 1500);
        assert_eq!(record.population, 0);
        assert_eq!(record.tests_per_one_million, 0.0);

        let totals: GlobalTotals =
            serde_json::from_str(r#"{"cases": 10, "active": -3, "affectedCountries": 2.0}"#).unwrap();
        assert_eq!(totals.active, -3);
        assert_eq!(totals.affected_countries, 2);
    }
}
