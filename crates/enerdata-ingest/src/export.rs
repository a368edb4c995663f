//! Full-database CSV export
//!
//! Read-only projection of every table: countries joined with their
//! registry hierarchy and with one row per (country, year) of indicator
//! values. Indicator tables are aligned on year so they do not multiply
//! each other.

use serde::Serialize;
use sqlx::{PgPool, Row};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::entities::{EntityKind, MetricKind};
use crate::error::{IngestError, Result};

const REGISTRY_COLUMNS: &[(&str, &str)] = &[
    ("c.country_id", "country_id"),
    ("c.code", "country_code"),
    ("c.name", "country_name"),
    ("s.subsystem_id", "subsystem_id"),
    ("s.code", "subsystem_code"),
    ("s.name", "subsystem_name"),
    ("st.state_id", "state_id"),
    ("st.code", "state_code"),
    ("st.name", "state_name"),
    ("o.owner_id", "owner_id"),
    ("o.name", "owner_name"),
    ("p.plant_id", "plant_id"),
    ("p.name", "plant_name"),
    ("p.plant_type", "plant_type"),
    ("p.operating_mode", "operating_mode"),
    ("p.installation_code", "installation_code"),
    ("u.unit_id", "unit_id"),
    ("u.equipment_code", "equipment_code"),
    ("u.name", "unit_name"),
    ("u.unit_number", "unit_number"),
    ("u.capacity_mw", "capacity_mw"),
    ("u.fuel", "fuel"),
    ("u.test_date", "test_date"),
    ("u.operation_date", "operation_date"),
    ("u.decommission_date", "decommission_date"),
    ("m.year", "year"),
];

/// Export query and its header row
pub fn export_query() -> (String, Vec<String>) {
    let mut headers: Vec<String> = REGISTRY_COLUMNS.iter().map(|(_, alias)| alias.to_string()).collect();
    let mut select: Vec<String> = REGISTRY_COLUMNS
        .iter()
        .map(|(expr, alias)| format!("{}::text AS {}", expr, alias))
        .collect();

    let mut years = Vec::new();
    let mut values = Vec::new();
    let mut joins = Vec::new();
    for kind in MetricKind::ALL {
        let table = kind.table().name;
        years.push(format!("SELECT country_id, year FROM {}", table));
        values.push(format!("m_{0}.{1} AS {0}", kind, kind.value_column()));
        joins.push(format!(
            "LEFT JOIN {table} m_{kind} ON m_{kind}.country_id = y.country_id AND m_{kind}.year = y.year",
            table = table,
            kind = kind
        ));
        select.push(format!("m.{0}::text AS {0}", kind));
        headers.push(kind.to_string());
    }

    let sql = format!(
        "WITH metric_years AS ({years}), \
         metrics AS (SELECT y.country_id, y.year, {values} FROM metric_years y {joins}) \
         SELECT {select} \
         FROM country c \
         LEFT JOIN subsystem s ON s.country_id = c.country_id \
         LEFT JOIN state st ON st.subsystem_id = s.subsystem_id \
         LEFT JOIN power_plant p ON p.state_id = st.state_id \
         LEFT JOIN asset_owner o ON o.owner_id = p.owner_id \
         LEFT JOIN generating_unit u ON u.plant_id = p.plant_id \
         LEFT JOIN metrics m ON m.country_id = c.country_id \
         ORDER BY c.code, s.code, st.code, p.plant_id, u.unit_id, m.year",
        years = years.join(" UNION "),
        values = values.join(", "),
        joins = joins.join(" "),
        select = select.join(", "),
    );

    (sql, headers)
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportSummary {
    pub path: PathBuf,
    pub rows: usize,
    pub columns: usize,
}

/// Write the full projection to `output` as CSV with a header row
pub async fn export_database(pool: &PgPool, output: &Path) -> Result<ExportSummary> {
    let (sql, headers) = export_query();
    let rows = sqlx::query(&sql).fetch_all(pool).await.map_err(crate::error::StoreError::from)?;

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| IngestError::Export(format!("cannot create {}: {}", parent.display(), e)))?;
    }

    let csv_error = |e: csv::Error| IngestError::Export(format!("cannot write {}: {}", output.display(), e));
    let mut writer = csv::Writer::from_path(output).map_err(csv_error)?;
    writer.write_record(&headers).map_err(csv_error)?;

    for row in &rows {
        let mut record = Vec::with_capacity(headers.len());
        for i in 0..headers.len() {
            let value: Option<String> = row.try_get(i).map_err(crate::error::StoreError::from)?;
            record.push(value.unwrap_or_default());
        }
        writer.write_record(&record).map_err(csv_error)?;
    }
    writer
        .flush()
        .map_err(|e| IngestError::Export(format!("cannot write {}: {}", output.display(), e)))?;

    info!(path = %output.display(), rows = rows.len(), "Database exported");

    Ok(ExportSummary {
        path: output.to_path_buf(),
        rows: rows.len(),
        columns: headers.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_covers_every_metric_table() {
        let (sql, headers) = export_query();

        for kind in MetricKind::ALL {
            assert!(sql.contains(&format!("FROM {}", kind.table().name)), "{}", kind);
            assert!(headers.contains(&kind.to_string()));
        }
        assert_eq!(headers.len(), REGISTRY_COLUMNS.len() + MetricKind::ALL.len());
        assert_eq!(sql.matches("::text AS").count(), headers.len());
    }
}
