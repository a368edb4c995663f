//! Ingestion configuration
//!
//! Everything is read from environment variables (a `.env` file is honored)
//! and falls back to the defaults below. The indicator catalog is built in;
//! only file names can be overridden.

use encoding_rs::Encoding;
use std::path::PathBuf;
use std::str::FromStr;

use crate::entities::MetricKind;
use crate::error::ConfigError;
use crate::loader::CountrySeed;
use crate::source::ColumnSelector;

pub const DEFAULT_DATA_DIR: &str = "data";
pub const DEFAULT_REGISTRY_FILE: &str = "CAPACIDADE_GERACAO.csv";
pub const DEFAULT_REGISTRY_DELIMITER: &str = ";";
pub const DEFAULT_ENCODINGS: &str = "utf-8,latin1";
pub const DEFAULT_EXPORT_PATH: &str = "query_results/full_database_export.csv";
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

const INDICATOR_DELIMITER: u8 = b',';

/// Built-in indicator files, in load order
fn catalog() -> Vec<(MetricKind, &'static str, ColumnSelector)> {
    let named = |column: &str| ColumnSelector::Name(column.to_string());
    vec![
        (
            MetricKind::CleanFuelAccess,
            "access-to-clean-fuels-and-technologies-for-cooking.csv",
            named("Proportion of population with primary reliance on clean fuels and technologies for cooking (%) - Residence area type: Total"),
        ),
        (
            MetricKind::CleanEnergyInvestment,
            "international-finance-clean-energy.csv",
            named("7.a.1 - International financial flows to developing countries in support of clean energy research and development and renewable energy production, including in hybrid systems (millions of constant 2021 United States dollars) - EG_IFF_RANDN - All renewables"),
        ),
        (
            MetricKind::RenewablePerCapita,
            "renewable-electricity-generating-capacity-per-capita.csv",
            // The header of this column changes between releases
            ColumnSelector::Position(3),
        ),
        (
            MetricKind::RenewableShare,
            "share-of-final-energy-consumption-from-renewable-sources.csv",
            named("7.2.1 - Renewable energy share in the total final energy consumption (%) - EG_FEC_RNEW"),
        ),
        (
            MetricKind::ElectricityAccess,
            "share-of-the-population-with-access-to-electricity.csv",
            named("Access to electricity (% of population)"),
        ),
        (MetricKind::Hdi, "human-development-index.csv", named("Human Development Index")),
    ]
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct RegistrySource {
    pub file: PathBuf,
    pub delimiter: u8,
    pub country: CountrySeed,
}

#[derive(Debug, Clone)]
pub struct IndicatorSource {
    pub metric: MetricKind,
    pub file: PathBuf,
    pub value_column: ColumnSelector,
    pub delimiter: u8,
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// `None` when `DATABASE_URL` is unset
    pub database: Option<DatabaseConfig>,
    pub data_dir: PathBuf,
    /// Candidate encodings for every source, tried in order
    pub encodings: Vec<&'static Encoding>,
    pub registry: RegistrySource,
    pub indicators: Vec<IndicatorSource>,
    pub export_path: PathBuf,
}

impl IngestConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let database = match var("DATABASE_URL") {
            Some(url) => Some(DatabaseConfig {
                url,
                max_connections: parse_var(&var, "DATABASE_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS)?,
                connect_timeout_secs: parse_var(&var, "DATABASE_CONNECT_TIMEOUT", DEFAULT_CONNECT_TIMEOUT_SECS)?,
            }),
            None => None,
        };

        let data_dir = PathBuf::from(var("ENERDATA_DATA_DIR").unwrap_or_else(|| DEFAULT_DATA_DIR.to_string()));
        let encodings = parse_encodings(&var("ENERDATA_REGISTRY_ENCODINGS").unwrap_or_else(|| DEFAULT_ENCODINGS.to_string()))?;

        let registry = RegistrySource {
            file: data_dir.join(var("ENERDATA_REGISTRY_FILE").unwrap_or_else(|| DEFAULT_REGISTRY_FILE.to_string())),
            delimiter: parse_delimiter(
                "ENERDATA_REGISTRY_DELIMITER",
                &var("ENERDATA_REGISTRY_DELIMITER").unwrap_or_else(|| DEFAULT_REGISTRY_DELIMITER.to_string()),
            )?,
            country: {
                let default = CountrySeed::default();
                CountrySeed {
                    code: var("ENERDATA_REGISTRY_COUNTRY_CODE").unwrap_or(default.code),
                    name: var("ENERDATA_REGISTRY_COUNTRY_NAME").unwrap_or(default.name),
                }
            },
        };

        let indicators = catalog()
            .into_iter()
            .map(|(metric, file, value_column)| {
                let file = var(file_override_var(metric).as_str()).unwrap_or_else(|| file.to_string());
                IndicatorSource {
                    metric,
                    file: data_dir.join(file),
                    value_column,
                    delimiter: INDICATOR_DELIMITER,
                }
            })
            .collect();

        let export_path = PathBuf::from(var("ENERDATA_EXPORT_PATH").unwrap_or_else(|| DEFAULT_EXPORT_PATH.to_string()));

        let config = Self {
            database,
            data_dir,
            encodings,
            registry,
            indicators,
            export_path,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(db) = &self.database {
            if db.max_connections == 0 {
                return Err(ConfigError::InvalidVar {
                    var: "DATABASE_MAX_CONNECTIONS",
                    reason: "must be greater than 0".to_string(),
                });
            }
        }
        if self.encodings.is_empty() {
            return Err(ConfigError::Invalid("at least one source encoding is required".to_string()));
        }
        if self.registry.country.code.trim().is_empty() {
            return Err(ConfigError::InvalidVar {
                var: "ENERDATA_REGISTRY_COUNTRY_CODE",
                reason: "must not be blank".to_string(),
            });
        }
        Ok(())
    }

    pub fn indicator(&self, metric: MetricKind) -> Option<&IndicatorSource> {
        self.indicators.iter().find(|source| source.metric == metric)
    }
}

/// `ENERDATA_<METRIC>_FILE`
pub fn file_override_var(metric: MetricKind) -> String {
    format!("ENERDATA_{}_FILE", metric.as_str().to_uppercase())
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(name) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidVar {
            var: name,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn parse_delimiter(name: &'static str, raw: &str) -> Result<u8, ConfigError> {
    match raw {
        "\\t" | "tab" => Ok(b'\t'),
        _ => match raw.as_bytes() {
            [byte] if byte.is_ascii() && *byte != b'"' => Ok(*byte),
            _ => Err(ConfigError::InvalidVar {
                var: name,
                reason: format!("expected a single ASCII character, got '{}'", raw),
            }),
        },
    }
}

/// Comma-separated WHATWG encoding labels
pub fn parse_encodings(raw: &str) -> Result<Vec<&'static Encoding>, ConfigError> {
    let mut encodings = Vec::new();
    for label in raw.split(',').map(str::trim).filter(|l| !l.is_empty()) {
        let encoding =
            Encoding::for_label(label.as_bytes()).ok_or_else(|| ConfigError::UnknownEncoding(label.to_string()))?;
        if !encodings.contains(&encoding) {
            encodings.push(encoding);
        }
    }
    Ok(encodings)
}
