//! Static descriptors of the relational schema
//!
//! Repositories never see table or column names that come from data: every
//! statement is assembled from the `TableDef` constants below, and every
//! value travels as a typed [`Value`].

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Storage-assigned row identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SurrogateId(pub i64);

impl fmt::Display for SurrogateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// SQL type of a column, used when reading natural keys back from storage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Integer,
    Id,
    Float,
    Date,
}

/// A nullable, typed column value
#[derive(Debug, Clone)]
pub enum Value {
    Text(Option<String>),
    Integer(Option<i32>),
    Id(Option<SurrogateId>),
    Float(Option<f64>),
    Date(Option<NaiveDate>),
}

impl Value {
    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(Some(s.into()))
    }

    pub fn id(id: SurrogateId) -> Self {
        Value::Id(Some(id))
    }

    pub fn null(column_type: ColumnType) -> Self {
        match column_type {
            ColumnType::Text => Value::Text(None),
            ColumnType::Integer => Value::Integer(None),
            ColumnType::Id => Value::Id(None),
            ColumnType::Float => Value::Float(None),
            ColumnType::Date => Value::Date(None),
        }
    }

    pub fn is_null(&self) -> bool {
        match self {
            Value::Text(v) => v.is_none(),
            Value::Integer(v) => v.is_none(),
            Value::Id(v) => v.is_none(),
            Value::Float(v) => v.is_none(),
            Value::Date(v) => v.is_none(),
        }
    }

    pub fn column_type(&self) -> ColumnType {
        match self {
            Value::Text(_) => ColumnType::Text,
            Value::Integer(_) => ColumnType::Integer,
            Value::Id(_) => ColumnType::Id,
            Value::Float(_) => ColumnType::Float,
            Value::Date(_) => ColumnType::Date,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(v) => v.as_deref(),
            _ => None,
        }
    }

    pub fn as_id(&self) -> Option<SurrogateId> {
        match self {
            Value::Id(v) => *v,
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i32> {
        match self {
            Value::Integer(v) => *v,
            _ => None,
        }
    }
}

// Floats compare by bit pattern so values can take part in key indexes.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Id(a), Value::Id(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.map(f64::to_bits) == b.map(f64::to_bits),
            (Value::Date(a), Value::Date(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Text(v) => v.hash(state),
            Value::Integer(v) => v.hash(state),
            Value::Id(v) => v.hash(state),
            Value::Float(v) => v.map(f64::to_bits).hash(state),
            Value::Date(v) => v.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Text(Some(v)) => write!(f, "{}", v),
            Value::Integer(Some(v)) => write!(f, "{}", v),
            Value::Id(Some(v)) => write!(f, "{}", v),
            Value::Float(Some(v)) => write!(f, "{}", v),
            Value::Date(Some(v)) => write!(f, "{}", v),
            _ => write!(f, "NULL"),
        }
    }
}

/// A named column value
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Column {
    pub name: &'static str,
    pub value: Value,
}

impl Column {
    pub fn new(name: &'static str, value: Value) -> Self {
        Self { name, value }
    }
}

/// A foreign key from `column` to the surrogate id of table `references`
#[derive(Debug)]
pub struct ForeignKey {
    pub column: &'static str,
    pub references: &'static str,
}

/// Static description of one table
#[derive(Debug)]
pub struct TableDef {
    pub name: &'static str,
    pub id_column: &'static str,
    /// Every column that takes part in any natural key of the table, in the
    /// order `scan_natural_keys` returns them
    pub key_columns: &'static [(&'static str, ColumnType)],
    pub foreign_keys: &'static [ForeignKey],
}

impl TableDef {
    pub fn foreign_key(&self, column: &str) -> Option<&ForeignKey> {
        self.foreign_keys.iter().find(|fk| fk.column == column)
    }
}

impl PartialEq for TableDef {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for TableDef {}

pub static COUNTRY: TableDef = TableDef {
    name: "country",
    id_column: "country_id",
    key_columns: &[("code", ColumnType::Text)],
    foreign_keys: &[],
};

pub static SUBSYSTEM: TableDef = TableDef {
    name: "subsystem",
    id_column: "subsystem_id",
    key_columns: &[("country_id", ColumnType::Id), ("code", ColumnType::Text)],
    foreign_keys: &[ForeignKey {
        column: "country_id",
        references: "country",
    }],
};

pub static STATE: TableDef = TableDef {
    name: "state",
    id_column: "state_id",
    key_columns: &[("code", ColumnType::Text)],
    foreign_keys: &[ForeignKey {
        column: "subsystem_id",
        references: "subsystem",
    }],
};

pub static OWNER: TableDef = TableDef {
    name: "asset_owner",
    id_column: "owner_id",
    key_columns: &[("name", ColumnType::Text)],
    foreign_keys: &[],
};

pub static PLANT: TableDef = TableDef {
    name: "power_plant",
    id_column: "plant_id",
    key_columns: &[
        ("installation_code", ColumnType::Text),
        ("name", ColumnType::Text),
        ("state_id", ColumnType::Id),
    ],
    foreign_keys: &[
        ForeignKey {
            column: "state_id",
            references: "state",
        },
        ForeignKey {
            column: "owner_id",
            references: "asset_owner",
        },
    ],
};

pub static GENERATING_UNIT: TableDef = TableDef {
    name: "generating_unit",
    id_column: "unit_id",
    key_columns: &[("equipment_code", ColumnType::Text)],
    foreign_keys: &[ForeignKey {
        column: "plant_id",
        references: "power_plant",
    }],
};

const METRIC_KEY: &[(&str, ColumnType)] = &[("country_id", ColumnType::Id), ("year", ColumnType::Integer)];

const METRIC_FK: &[ForeignKey] = &[ForeignKey {
    column: "country_id",
    references: "country",
}];

pub static ELECTRICITY_ACCESS: TableDef = TableDef {
    name: "electricity_access",
    id_column: "id",
    key_columns: METRIC_KEY,
    foreign_keys: METRIC_FK,
};

pub static CLEAN_FUEL_ACCESS: TableDef = TableDef {
    name: "clean_fuel_access",
    id_column: "id",
    key_columns: METRIC_KEY,
    foreign_keys: METRIC_FK,
};

pub static RENEWABLE_SHARE: TableDef = TableDef {
    name: "renewable_share",
    id_column: "id",
    key_columns: METRIC_KEY,
    foreign_keys: METRIC_FK,
};

pub static CLEAN_ENERGY_INVESTMENT: TableDef = TableDef {
    name: "clean_energy_investment",
    id_column: "id",
    key_columns: METRIC_KEY,
    foreign_keys: METRIC_FK,
};

pub static RENEWABLE_PER_CAPITA: TableDef = TableDef {
    name: "renewable_per_capita",
    id_column: "id",
    key_columns: METRIC_KEY,
    foreign_keys: METRIC_FK,
};

pub static HDI: TableDef = TableDef {
    name: "hdi",
    id_column: "id",
    key_columns: METRIC_KEY,
    foreign_keys: METRIC_FK,
};
