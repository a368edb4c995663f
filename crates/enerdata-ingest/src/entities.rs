//! Entity kinds and their natural keys
//!
//! An [`EntityKind`] describes how one kind of entity maps onto its table:
//! which columns identify it (the natural key), which columns carry its
//! attributes, and how a natural key is rebuilt from stored key columns when
//! a resolution cache is seeded.

use chrono::NaiveDate;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::Debug;
use std::hash::Hash;

use crate::schema::{self, Column, SurrogateId, TableDef, Value};

pub trait EntityKind: Send + Sync {
    type Key: Clone + Eq + Hash + Debug + Send + Sync;
    type Attrs: Clone + Debug + Send + Sync;

    fn table(&self) -> &'static TableDef;

    /// Columns that identify the row; a `NULL` value means "column is null"
    fn key_columns(&self, key: &Self::Key) -> Vec<Column>;

    /// Non-key columns written on first insert
    fn attribute_columns(&self, key: &Self::Key, attrs: &Self::Attrs) -> Vec<Column>;

    /// Columns rewritten when an existing row is seen again. Empty for every
    /// kind whose first recorded values win.
    fn refresh_columns(&self, _attrs: &Self::Attrs) -> Vec<Column> {
        Vec::new()
    }

    /// Rebuild a natural key from `table().key_columns`, in that order
    fn key_from_values(&self, values: &[Value]) -> Option<Self::Key>;
}

fn text_at(values: &[Value], index: usize) -> Option<String> {
    values.get(index).and_then(Value::as_text).map(str::to_string)
}

fn id_at(values: &[Value], index: usize) -> Option<SurrogateId> {
    values.get(index).and_then(Value::as_id)
}

// ============================================================================
// Country
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct Countries;

#[derive(Debug, Clone, PartialEq)]
pub struct CountryAttrs {
    pub name: Option<String>,
}

impl EntityKind for Countries {
    type Key = String;
    type Attrs = CountryAttrs;

    fn table(&self) -> &'static TableDef {
        &schema::COUNTRY
    }

    fn key_columns(&self, code: &String) -> Vec<Column> {
        vec![Column::new("code", Value::text(code.as_str()))]
    }

    fn attribute_columns(&self, _code: &String, attrs: &CountryAttrs) -> Vec<Column> {
        vec![Column::new("name", Value::Text(attrs.name.clone()))]
    }

    fn key_from_values(&self, values: &[Value]) -> Option<String> {
        text_at(values, 0)
    }
}

// ============================================================================
// Subsystem
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct Subsystems;

/// Region codes are only unique within one country's grid
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubsystemKey {
    pub country_id: SurrogateId,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubsystemAttrs {
    pub name: Option<String>,
}

impl EntityKind for Subsystems {
    type Key = SubsystemKey;
    type Attrs = SubsystemAttrs;

    fn table(&self) -> &'static TableDef {
        &schema::SUBSYSTEM
    }

    fn key_columns(&self, key: &SubsystemKey) -> Vec<Column> {
        vec![
            Column::new("country_id", Value::id(key.country_id)),
            Column::new("code", Value::text(key.code.as_str())),
        ]
    }

    fn attribute_columns(&self, _key: &SubsystemKey, attrs: &SubsystemAttrs) -> Vec<Column> {
        vec![Column::new("name", Value::Text(attrs.name.clone()))]
    }

    // Region names are cosmetic and follow the latest source. An absent name
    // never replaces a recorded one.
    fn refresh_columns(&self, attrs: &SubsystemAttrs) -> Vec<Column> {
        match &attrs.name {
            Some(name) => vec![Column::new("name", Value::text(name.as_str()))],
            None => Vec::new(),
        }
    }

    fn key_from_values(&self, values: &[Value]) -> Option<SubsystemKey> {
        Some(SubsystemKey {
            country_id: id_at(values, 0)?,
            code: text_at(values, 1)?,
        })
    }
}

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct States;

#[derive(Debug, Clone, PartialEq)]
pub struct StateAttrs {
    pub name: Option<String>,
    pub subsystem_id: SurrogateId,
}

impl EntityKind for States {
    type Key = String;
    type Attrs = StateAttrs;

    fn table(&self) -> &'static TableDef {
        &schema::STATE
    }

    fn key_columns(&self, code: &String) -> Vec<Column> {
        vec![Column::new("code", Value::text(code.as_str()))]
    }

    fn attribute_columns(&self, _code: &String, attrs: &StateAttrs) -> Vec<Column> {
        vec![
            Column::new("name", Value::Text(attrs.name.clone())),
            Column::new("subsystem_id", Value::id(attrs.subsystem_id)),
        ]
    }

    fn key_from_values(&self, values: &[Value]) -> Option<String> {
        text_at(values, 0)
    }
}

// ============================================================================
// Owner
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct Owners;

impl EntityKind for Owners {
    type Key = String;
    type Attrs = ();

    fn table(&self) -> &'static TableDef {
        &schema::OWNER
    }

    fn key_columns(&self, name: &String) -> Vec<Column> {
        vec![Column::new("name", Value::text(name.as_str()))]
    }

    fn attribute_columns(&self, _name: &String, _attrs: &()) -> Vec<Column> {
        Vec::new()
    }

    fn key_from_values(&self, values: &[Value]) -> Option<String> {
        text_at(values, 0)
    }
}

// ============================================================================
// Plant
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct Plants;

/// A plant is identified by its registry installation code when the source
/// has one, otherwise by its name within a state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PlantKey {
    InstallationCode(String),
    NameInState { name: String, state_id: SurrogateId },
}

impl PlantKey {
    pub fn new(installation_code: Option<&str>, name: Option<&str>, state_id: SurrogateId) -> Option<Self> {
        match (installation_code, name) {
            (Some(code), _) => Some(PlantKey::InstallationCode(code.to_string())),
            (None, Some(name)) => Some(PlantKey::NameInState {
                name: name.to_string(),
                state_id,
            }),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlantAttrs {
    pub name: Option<String>,
    pub state_id: SurrogateId,
    pub owner_id: Option<SurrogateId>,
    pub plant_type: Option<String>,
    pub operating_mode: Option<String>,
}

impl EntityKind for Plants {
    type Key = PlantKey;
    type Attrs = PlantAttrs;

    fn table(&self) -> &'static TableDef {
        &schema::PLANT
    }

    fn key_columns(&self, key: &PlantKey) -> Vec<Column> {
        match key {
            PlantKey::InstallationCode(code) => {
                vec![Column::new("installation_code", Value::text(code.as_str()))]
            },
            PlantKey::NameInState { name, state_id } => vec![
                Column::new("installation_code", Value::Text(None)),
                Column::new("name", Value::text(name.as_str())),
                Column::new("state_id", Value::id(*state_id)),
            ],
        }
    }

    fn attribute_columns(&self, key: &PlantKey, attrs: &PlantAttrs) -> Vec<Column> {
        let mut columns = Vec::with_capacity(5);
        if let PlantKey::InstallationCode(_) = key {
            columns.push(Column::new("name", Value::Text(attrs.name.clone())));
            columns.push(Column::new("state_id", Value::id(attrs.state_id)));
        }
        columns.push(Column::new("owner_id", Value::Id(attrs.owner_id)));
        columns.push(Column::new("plant_type", Value::Text(attrs.plant_type.clone())));
        columns.push(Column::new("operating_mode", Value::Text(attrs.operating_mode.clone())));
        columns
    }

    fn key_from_values(&self, values: &[Value]) -> Option<PlantKey> {
        match text_at(values, 0) {
            Some(code) => Some(PlantKey::InstallationCode(code)),
            None => Some(PlantKey::NameInState {
                name: text_at(values, 1)?,
                state_id: id_at(values, 2)?,
            }),
        }
    }
}

// ============================================================================
// Generating unit
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct GeneratingUnits;

#[derive(Debug, Clone, PartialEq)]
pub struct UnitAttrs {
    pub plant_id: SurrogateId,
    pub name: Option<String>,
    pub number: Option<i32>,
    pub capacity_mw: Option<f64>,
    pub fuel: Option<String>,
    pub test_date: Option<NaiveDate>,
    pub operation_date: Option<NaiveDate>,
    pub decommission_date: Option<NaiveDate>,
}

impl EntityKind for GeneratingUnits {
    type Key = String;
    type Attrs = UnitAttrs;

    fn table(&self) -> &'static TableDef {
        &schema::GENERATING_UNIT
    }

    fn key_columns(&self, code: &String) -> Vec<Column> {
        vec![Column::new("equipment_code", Value::text(code.as_str()))]
    }

    fn attribute_columns(&self, _code: &String, attrs: &UnitAttrs) -> Vec<Column> {
        vec![
            Column::new("plant_id", Value::id(attrs.plant_id)),
            Column::new("name", Value::Text(attrs.name.clone())),
            Column::new("unit_number", Value::Integer(attrs.number)),
            Column::new("capacity_mw", Value::Float(attrs.capacity_mw)),
            Column::new("fuel", Value::Text(attrs.fuel.clone())),
            Column::new("test_date", Value::Date(attrs.test_date)),
            Column::new("operation_date", Value::Date(attrs.operation_date)),
            Column::new("decommission_date", Value::Date(attrs.decommission_date)),
        ]
    }

    fn key_from_values(&self, values: &[Value]) -> Option<String> {
        text_at(values, 0)
    }
}

// ============================================================================
// Country-year metrics
// ============================================================================

/// One indicator table per variant; all share the (country, year) key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    ElectricityAccess,
    CleanFuelAccess,
    RenewableShare,
    CleanEnergyInvestment,
    RenewablePerCapita,
    Hdi,
}

impl MetricKind {
    pub const ALL: [MetricKind; 6] = [
        MetricKind::ElectricityAccess,
        MetricKind::CleanFuelAccess,
        MetricKind::RenewableShare,
        MetricKind::CleanEnergyInvestment,
        MetricKind::RenewablePerCapita,
        MetricKind::Hdi,
    ];

    /// Column holding the metric value
    pub fn value_column(self) -> &'static str {
        match self {
            MetricKind::ElectricityAccess | MetricKind::CleanFuelAccess | MetricKind::RenewableShare => {
                "percentage"
            },
            MetricKind::CleanEnergyInvestment => "usd_millions",
            MetricKind::RenewablePerCapita => "watts_per_capita",
            MetricKind::Hdi => "index_value",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MetricKind::ElectricityAccess => "electricity_access",
            MetricKind::CleanFuelAccess => "clean_fuel_access",
            MetricKind::RenewableShare => "renewable_share",
            MetricKind::CleanEnergyInvestment => "clean_energy_investment",
            MetricKind::RenewablePerCapita => "renewable_per_capita",
            MetricKind::Hdi => "hdi",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MetricKey {
    pub country_id: SurrogateId,
    pub year: i32,
}

impl EntityKind for MetricKind {
    type Key = MetricKey;
    type Attrs = Option<f64>;

    fn table(&self) -> &'static TableDef {
        match self {
            MetricKind::ElectricityAccess => &schema::ELECTRICITY_ACCESS,
            MetricKind::CleanFuelAccess => &schema::CLEAN_FUEL_ACCESS,
            MetricKind::RenewableShare => &schema::RENEWABLE_SHARE,
            MetricKind::CleanEnergyInvestment => &schema::CLEAN_ENERGY_INVESTMENT,
            MetricKind::RenewablePerCapita => &schema::RENEWABLE_PER_CAPITA,
            MetricKind::Hdi => &schema::HDI,
        }
    }

    fn key_columns(&self, key: &MetricKey) -> Vec<Column> {
        vec![
            Column::new("country_id", Value::id(key.country_id)),
            Column::new("year", Value::Integer(Some(key.year))),
        ]
    }

    fn attribute_columns(&self, _key: &MetricKey, value: &Option<f64>) -> Vec<Column> {
        vec![Column::new(self.value_column(), Value::Float(*value))]
    }

    fn key_from_values(&self, values: &[Value]) -> Option<MetricKey> {
        Some(MetricKey {
            country_id: id_at(values, 0)?,
            year: values.get(1).and_then(Value::as_integer)?,
        })
    }
}
