//! Typed rows of the two source families
//!
//! Raw projected values from [`crate::source`] are normalized here, once per
//! row. Nothing downstream sees raw tokens.

use chrono::NaiveDate;

use crate::normalize::{clean_text, parse_date, parse_int, parse_number, parse_year};
use crate::source::{ColumnSelector, Projection};

/// Registry columns in projection order, with whether the file must carry them
const REGISTRY_COLUMNS: &[(&str, bool)] = &[
    ("id_subsistema", true),
    ("nom_subsistema", false),
    ("id_estado", true),
    ("nom_estado", false),
    ("nom_agenteproprietario", false),
    ("nom_usina", true),
    ("nom_tipousina", false),
    ("nom_modalidadeoperacao", false),
    ("ceg", false),
    ("cod_equipamento", true),
    ("nom_unidadegeradora", false),
    ("num_unidadegeradora", false),
    ("val_potenciaefetiva", false),
    ("nom_combustivel", false),
    ("dat_entradateste", false),
    ("dat_entradaoperacao", false),
    ("dat_desativacao", false),
];

fn field(raw: &[Option<String>], index: usize) -> Option<&str> {
    raw.get(index).and_then(|v| v.as_deref())
}

/// One normalized row of the generation-capacity registry
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistryRow {
    pub subsystem_code: Option<String>,
    pub subsystem_name: Option<String>,
    pub state_code: Option<String>,
    pub state_name: Option<String>,
    pub owner: Option<String>,
    pub plant_name: Option<String>,
    pub plant_type: Option<String>,
    pub operating_mode: Option<String>,
    pub installation_code: Option<String>,
    pub equipment_code: Option<String>,
    pub unit_name: Option<String>,
    pub unit_number: Option<i32>,
    pub capacity_mw: Option<f64>,
    pub fuel: Option<String>,
    pub test_date: Option<NaiveDate>,
    pub operation_date: Option<NaiveDate>,
    pub decommission_date: Option<NaiveDate>,
}

impl RegistryRow {
    pub fn projection() -> Projection {
        REGISTRY_COLUMNS
            .iter()
            .fold(Projection::new(), |projection, (name, required)| {
                if *required {
                    projection.required(*name)
                } else {
                    projection.optional(*name)
                }
            })
    }

    /// Build from values ordered like [`RegistryRow::projection`]
    pub fn from_raw(raw: &[Option<String>]) -> Self {
        let text = |i| clean_text(field(raw, i));
        Self {
            subsystem_code: text(0),
            subsystem_name: text(1),
            state_code: text(2),
            state_name: text(3),
            owner: text(4),
            plant_name: text(5),
            plant_type: text(6),
            operating_mode: text(7),
            installation_code: text(8),
            equipment_code: text(9),
            unit_name: text(10),
            unit_number: parse_int(field(raw, 11)),
            capacity_mw: parse_number(field(raw, 12)),
            fuel: text(13),
            test_date: parse_date(field(raw, 14)),
            operation_date: parse_date(field(raw, 15)),
            decommission_date: parse_date(field(raw, 16)),
        }
    }
}

/// One normalized (country, year, value) observation of an indicator file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndicatorRow {
    pub country_name: Option<String>,
    pub country_code: Option<String>,
    pub year: Option<i32>,
    pub value: Option<f64>,
}

impl IndicatorRow {
    pub fn projection(value_column: ColumnSelector) -> Projection {
        Projection::new()
            .optional("Entity")
            .required("Code")
            .required("Year")
            .column(value_column, true)
    }

    pub fn from_raw(raw: &[Option<String>]) -> Self {
        Self {
            country_name: clean_text(field(raw, 0)),
            country_code: clean_text(field(raw, 1)),
            year: parse_year(field(raw, 2)),
            value: parse_number(field(raw, 3)),
        }
    }
}
