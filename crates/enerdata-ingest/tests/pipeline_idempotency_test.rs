//! Idempotency and integrity tests for the loader
//!
//! All tests run against the in-memory repository, which enforces natural
//! key uniqueness and foreign keys the same way the PostgreSQL schema does.

use std::collections::{BTreeMap, HashSet};

use enerdata_ingest::entities::MetricKind;
use enerdata_ingest::loader::{CountrySeed, Loader, Step, StepReport};
use enerdata_ingest::records::{IndicatorRow, RegistryRow};
use enerdata_ingest::resolver::ResolverSet;
use enerdata_ingest::schema::{
    self, TableDef, Value, COUNTRY, ELECTRICITY_ACCESS, GENERATING_UNIT, OWNER, PLANT, STATE, SUBSYSTEM,
};
use enerdata_ingest::store::MemoryRepository;

fn registry_row(subsystem: &str, state: &str, owner: Option<&str>, plant: &str, unit: &str) -> RegistryRow {
    RegistryRow {
        subsystem_code: Some(subsystem.to_string()),
        subsystem_name: Some(format!("Subsystem {}", subsystem)),
        state_code: Some(state.to_string()),
        state_name: Some(format!("State {}", state)),
        owner: owner.map(str::to_string),
        plant_name: Some(plant.to_string()),
        plant_type: Some("UHE".to_string()),
        operating_mode: Some("TIPO I".to_string()),
        equipment_code: Some(unit.to_string()),
        unit_name: Some(format!("Unit {}", unit)),
        unit_number: Some(1),
        capacity_mw: Some(100.0),
        fuel: Some("Hídrica".to_string()),
        ..RegistryRow::default()
    }
}

fn registry_batch() -> Vec<RegistryRow> {
    vec![
        registry_row("S", "RS", Some("Agente X"), "Usina Sul", "RSUS-UG1"),
        registry_row("S", "RS", Some("Agente X"), "Usina Sul", "RSUS-UG2"),
        registry_row("S", "SC", Some("Agente Y"), "Usina Costa", "SCUC-UG1"),
        registry_row("N", "PA", None, "Usina Norte", "PAUN-UG1"),
        RegistryRow {
            installation_code: Some("UTE.GN.RJ.000001-0.01".to_string()),
            ..registry_row("SE", "RJ", Some("Agente Z"), "Usina Rio", "RJUR-UG1")
        },
    ]
}

fn indicator(code: Option<&str>, year: i32, value: Option<f64>) -> IndicatorRow {
    IndicatorRow {
        country_name: code.map(|c| format!("Country {}", c)),
        country_code: code.map(str::to_string),
        year: Some(year),
        value,
    }
}

fn indicator_batch() -> Vec<IndicatorRow> {
    vec![
        indicator(Some("BRA"), 2020, Some(99.7)),
        indicator(Some("BRA"), 2021, Some(99.8)),
        indicator(Some("ARG"), 2020, Some(100.0)),
        indicator(None, 2020, Some(90.1)),
    ]
}

const ALL_TABLES: &[&TableDef] = &[
    &COUNTRY,
    &SUBSYSTEM,
    &STATE,
    &OWNER,
    &PLANT,
    &GENERATING_UNIT,
    &schema::ELECTRICITY_ACCESS,
    &schema::CLEAN_FUEL_ACCESS,
    &schema::RENEWABLE_SHARE,
    &schema::CLEAN_ENERGY_INVESTMENT,
    &schema::RENEWABLE_PER_CAPITA,
    &schema::HDI,
];

fn counts(repo: &MemoryRepository) -> BTreeMap<&'static str, usize> {
    ALL_TABLES.iter().map(|t| (t.name, repo.row_count(t))).collect()
}

/// One full run with a fresh resolver set, like a separate process would do
async fn run_once(repo: &MemoryRepository) -> Vec<StepReport> {
    let mut resolvers = ResolverSet::new();
    let mut loader = Loader::new(repo, &mut resolvers);
    let mut reports = loader.load_registry(&registry_batch(), &CountrySeed::default()).await;
    reports.extend(loader.load_indicator(MetricKind::ElectricityAccess, &indicator_batch()).await);
    reports
}

fn step<'a>(reports: &'a [StepReport], step: Step) -> &'a StepReport {
    reports
        .iter()
        .find(|r| r.step == step)
        .unwrap_or_else(|| panic!("no report for {}", step))
}

fn ids(repo: &MemoryRepository, table: &TableDef) -> HashSet<Value> {
    repo.rows(table)
        .into_iter()
        .filter_map(|row| row.get(table.id_column).cloned())
        .collect()
}

#[tokio::test]
async fn test_rerun_inserts_nothing() {
    let repo = MemoryRepository::new();

    let first = run_once(&repo).await;
    let after_first = counts(&repo);
    let second = run_once(&repo).await;
    let after_second = counts(&repo);

    assert!(first.iter().all(|r| !r.is_failed()));
    assert!(second.iter().all(|r| !r.is_failed()));
    assert_eq!(after_first, after_second);
    assert_eq!(second.iter().map(|r| r.counts.inserted).sum::<usize>(), 0);

    assert_eq!(after_first["country"], 2);
    assert_eq!(after_first["subsystem"], 3);
    assert_eq!(after_first["state"], 4);
    assert_eq!(after_first["asset_owner"], 3);
    assert_eq!(after_first["power_plant"], 4);
    assert_eq!(after_first["generating_unit"], 5);
    assert_eq!(after_first["electricity_access"], 3);
}

#[tokio::test]
async fn test_rerun_only_refreshes_subsystems() {
    let repo = MemoryRepository::new();
    run_once(&repo).await;
    let second = run_once(&repo).await;

    for report in &second {
        let expected = if report.step == Step::Subsystems { 3 } else { 0 };
        assert_eq!(report.counts.updated, expected, "{}", report.step);
    }
}

#[tokio::test]
async fn test_natural_keys_stay_unique() {
    let repo = MemoryRepository::new();
    run_once(&repo).await;
    run_once(&repo).await;

    for table in ALL_TABLES {
        let keys: Vec<Vec<Value>> = repo
            .rows(table)
            .iter()
            .map(|row| {
                table
                    .key_columns
                    .iter()
                    .map(|(name, ty)| row.get(name).cloned().unwrap_or_else(|| Value::null(*ty)))
                    .collect()
            })
            .collect();
        let distinct: HashSet<_> = keys.iter().collect();
        assert_eq!(distinct.len(), keys.len(), "duplicate natural key in {}", table.name);
    }
}

#[tokio::test]
async fn test_every_reference_points_at_an_existing_row() {
    let repo = MemoryRepository::new();
    run_once(&repo).await;

    for table in ALL_TABLES {
        for fk in table.foreign_keys {
            let parent = ALL_TABLES
                .iter()
                .find(|t| t.name == fk.references)
                .unwrap_or_else(|| panic!("unknown table {}", fk.references));
            let parent_ids = ids(&repo, parent);
            for row in repo.rows(table) {
                let value = row.get(fk.column).cloned().unwrap_or(Value::Id(None));
                assert!(
                    value.is_null() || parent_ids.contains(&value),
                    "{}.{} = {} has no parent",
                    table.name,
                    fk.column,
                    value
                );
            }
        }
    }
}

#[tokio::test]
async fn test_unparseable_capacity_keeps_the_unit() {
    let repo = MemoryRepository::new();
    let mut resolvers = ResolverSet::new();
    let mut loader = Loader::new(&repo, &mut resolvers);

    let raw: Vec<Option<String>> = [
        "S", "Sul", "RS", "Rio Grande do Sul", "Agente X", "Usina Sul", "UHE", "TIPO I", "", "RSUS-UG1", "UG 1", "1",
        "cem", "Hídrica", "", "", "",
    ]
    .iter()
    .map(|v| Some(v.to_string()))
    .collect();
    let row = RegistryRow::from_raw(&raw);
    assert_eq!(row.capacity_mw, None);

    let reports = loader.load_registry(&[row], &CountrySeed::default()).await;

    assert_eq!(step(&reports, Step::GeneratingUnits).counts.inserted, 1);
    let units = repo.rows(&GENERATING_UNIT);
    assert_eq!(units.len(), 1);
    assert_eq!(units[0].get("capacity_mw"), Some(&Value::Float(None)));
    assert_eq!(units[0].get("unit_number"), Some(&Value::Integer(Some(1))));
}

#[tokio::test]
async fn test_rows_without_country_code_are_never_stored() {
    let repo = MemoryRepository::new();
    let reports = run_once(&repo).await;

    let countries = step(&reports, Step::IndicatorCountries(MetricKind::ElectricityAccess));
    assert_eq!(countries.counts.skipped_missing_key, 1);
    let values = step(&reports, Step::MetricValues(MetricKind::ElectricityAccess));
    assert_eq!(values.counts.skipped_missing_key, 1);

    let countries = repo.rows(&COUNTRY);
    assert_eq!(countries.len(), 2);
    assert!(countries
        .iter()
        .all(|r| r.get("code").is_some_and(|v| !v.is_null())));
    assert_eq!(repo.row_count(&ELECTRICITY_ACCESS), 3);
}

#[tokio::test]
async fn test_repeated_owner_resolves_to_one_row() {
    let repo = MemoryRepository::new();
    let mut resolvers = ResolverSet::new();
    let mut loader = Loader::new(&repo, &mut resolvers);

    let rows = vec![
        registry_row("S", "RS", Some("Agente X"), "Usina A", "UG-A"),
        registry_row("S", "RS", Some("Agente X"), "Usina B", "UG-B"),
    ];
    let reports = loader.load_registry(&rows, &CountrySeed::default()).await;

    let owners = step(&reports, Step::Owners);
    assert_eq!(owners.counts.candidates, 1);
    assert_eq!(owners.counts.inserted, 1);
    assert_eq!(repo.row_count(&OWNER), 1);

    let owner_id = resolvers.owners.cached(&"Agente X".to_string()).map(Value::id);
    let plants = repo.rows(&PLANT);
    assert_eq!(plants.len(), 2);
    assert!(plants.iter().all(|p| p.get("owner_id").cloned() == owner_id));
}

#[tokio::test]
async fn test_subsystem_name_is_refreshed_on_the_next_run() {
    let repo = MemoryRepository::new();

    let mut first_batch = vec![
        registry_row("S", "RS", None, "Usina A", "UG-A"),
        registry_row("S", "SC", None, "Usina B", "UG-B"),
    ];
    first_batch[0].subsystem_name = Some("Sul".to_string());
    first_batch[1].subsystem_name = Some("Sul".to_string());

    let mut resolvers = ResolverSet::new();
    let reports = Loader::new(&repo, &mut resolvers)
        .load_registry(&first_batch, &CountrySeed::default())
        .await;
    let subsystems = step(&reports, Step::Subsystems);
    assert_eq!(subsystems.counts.inserted, 1);
    assert_eq!(subsystems.counts.updated, 0);

    let mut second_batch = first_batch.clone();
    second_batch[0].subsystem_name = Some("Região Sul".to_string());
    second_batch[1].subsystem_name = Some("Região Sul".to_string());

    let mut resolvers = ResolverSet::new();
    let reports = Loader::new(&repo, &mut resolvers)
        .load_registry(&second_batch, &CountrySeed::default())
        .await;
    let subsystems = step(&reports, Step::Subsystems);
    assert_eq!(subsystems.counts.inserted, 0);
    assert_eq!(subsystems.counts.updated, 1);

    let rows = repo.rows(&SUBSYSTEM);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("name"), Some(&Value::text("Região Sul")));
}

#[tokio::test]
async fn test_metric_row_for_unknown_country_is_skipped() {
    let repo = MemoryRepository::new();
    let mut resolvers = ResolverSet::new();
    let mut loader = Loader::new(&repo, &mut resolvers);

    let report = loader
        .load_metric(MetricKind::ElectricityAccess, &[indicator(Some("ZZZ"), 2020, Some(55.5))])
        .await;

    assert!(!report.is_failed());
    assert_eq!(report.counts.skipped_unresolved, 1);
    assert_eq!(report.counts.inserted, 0);
    assert_eq!(repo.row_count(&ELECTRICITY_ACCESS), 0);
    assert_eq!(repo.row_count(&COUNTRY), 0);
}

#[tokio::test]
async fn test_failed_owner_step_does_not_block_plants() {
    let repo = MemoryRepository::new();
    repo.fail_writes_to(&OWNER);

    let mut resolvers = ResolverSet::new();
    let reports = Loader::new(&repo, &mut resolvers)
        .load_registry(&registry_batch(), &CountrySeed::default())
        .await;

    assert!(step(&reports, Step::Owners).is_failed());
    assert_eq!(step(&reports, Step::Owners).counts.inserted, 0);
    assert!(!step(&reports, Step::Plants).is_failed());
    assert!(!step(&reports, Step::GeneratingUnits).is_failed());

    assert_eq!(repo.row_count(&OWNER), 0);
    assert_eq!(repo.row_count(&PLANT), 4);
    assert_eq!(repo.row_count(&GENERATING_UNIT), 5);
    assert!(repo
        .rows(&PLANT)
        .iter()
        .all(|p| p.get("owner_id") == Some(&Value::Id(None))));
    assert!(resolvers.owners.is_empty());
}

#[tokio::test]
async fn test_failed_state_step_skips_dependents() {
    let repo = MemoryRepository::new();
    repo.fail_writes_to(&STATE);

    let mut resolvers = ResolverSet::new();
    let reports = Loader::new(&repo, &mut resolvers)
        .load_registry(&registry_batch(), &CountrySeed::default())
        .await;

    assert!(step(&reports, Step::States).is_failed());
    assert_eq!(step(&reports, Step::Plants).counts.skipped_unresolved, 4);
    assert_eq!(step(&reports, Step::GeneratingUnits).counts.skipped_unresolved, 5);
    assert_eq!(repo.row_count(&STATE), 0);
    assert_eq!(repo.row_count(&PLANT), 0);
    assert_eq!(repo.row_count(&GENERATING_UNIT), 0);
    // Independent steps still committed
    assert_eq!(repo.row_count(&SUBSYSTEM), 3);
    assert_eq!(repo.row_count(&OWNER), 3);

    // A later run with a healthy store fills the gap
    repo.clear_failures();
    let second = run_once(&repo).await;
    assert!(second.iter().all(|r| !r.is_failed()));
    assert_eq!(repo.row_count(&STATE), 4);
    assert_eq!(repo.row_count(&GENERATING_UNIT), 5);
}

#[tokio::test]
async fn test_unit_without_plant_is_a_warning_not_an_error() {
    let repo = MemoryRepository::new();
    let mut resolvers = ResolverSet::new();

    let orphan = RegistryRow {
        state_code: None,
        ..registry_row("S", "RS", Some("Agente X"), "Usina Sem Estado", "UG-ORPHAN")
    };
    let rows = vec![registry_row("S", "RS", Some("Agente X"), "Usina A", "UG-A"), orphan];
    let reports = Loader::new(&repo, &mut resolvers)
        .load_registry(&rows, &CountrySeed::default())
        .await;

    let units = step(&reports, Step::GeneratingUnits);
    assert!(!units.is_failed());
    assert_eq!(units.counts.inserted, 1);
    assert_eq!(units.counts.skipped_unresolved, 1);
    assert_eq!(step(&reports, Step::Plants).counts.skipped_unresolved, 1);
}

#[tokio::test]
async fn test_plants_with_and_without_installation_code() {
    let repo = MemoryRepository::new();
    let mut resolvers = ResolverSet::new();

    let coded = RegistryRow {
        installation_code: Some("UHE.PH.RS.000001-1.01".to_string()),
        ..registry_row("S", "RS", None, "Usina A", "UG-1")
    };
    // Same code, renamed in a later row: still the same plant
    let renamed = RegistryRow {
        installation_code: Some("UHE.PH.RS.000001-1.01".to_string()),
        ..registry_row("S", "RS", None, "Usina A (nova)", "UG-2")
    };
    // Same name and state but no code: a different identity
    let uncoded = registry_row("S", "RS", None, "Usina A", "UG-3");

    let reports = Loader::new(&repo, &mut resolvers)
        .load_registry(&[coded, renamed, uncoded], &CountrySeed::default())
        .await;

    assert_eq!(step(&reports, Step::Plants).counts.inserted, 2);
    assert_eq!(step(&reports, Step::GeneratingUnits).counts.inserted, 3);
    let plants = repo.rows(&PLANT);
    assert!(plants.iter().any(|p| p.get("name") == Some(&Value::text("Usina A"))
        && p.get("installation_code") == Some(&Value::text("UHE.PH.RS.000001-1.01"))));
}

#[tokio::test]
async fn test_metric_tables_are_independent() {
    let repo = MemoryRepository::new();
    let mut resolvers = ResolverSet::new();
    let mut loader = Loader::new(&repo, &mut resolvers);

    let rows = vec![indicator(Some("BRA"), 2020, Some(0.76))];
    loader.load_indicator(MetricKind::Hdi, &rows).await;
    let reports = loader.load_indicator(MetricKind::RenewableShare, &rows).await;

    assert_eq!(reports[0].counts.inserted, 0);
    assert_eq!(reports[0].counts.existing, 1);
    assert_eq!(reports[1].counts.inserted, 1);
    assert_eq!(repo.row_count(&schema::HDI), 1);
    assert_eq!(repo.row_count(&schema::RENEWABLE_SHARE), 1);
    assert_eq!(repo.row_count(&COUNTRY), 1);
}

#[tokio::test]
async fn test_absent_subsystem_name_keeps_the_stored_one() {
    let repo = MemoryRepository::new();

    let mut named = registry_row("S", "RS", None, "Usina A", "UG-A");
    named.subsystem_name = Some("Sul".to_string());
    let mut resolvers = ResolverSet::new();
    Loader::new(&repo, &mut resolvers)
        .load_registry(&[named.clone()], &CountrySeed::default())
        .await;

    let unnamed = RegistryRow {
        subsystem_name: None,
        ..named
    };
    let mut resolvers = ResolverSet::new();
    let reports = Loader::new(&repo, &mut resolvers)
        .load_registry(&[unnamed], &CountrySeed::default())
        .await;

    let subsystems = step(&reports, Step::Subsystems);
    assert_eq!(subsystems.counts.updated, 0);
    assert_eq!(subsystems.counts.existing, 1);
    let rows = repo.rows(&SUBSYSTEM);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("name"), Some(&Value::text("Sul")));
}

#[tokio::test]
async fn test_subsystem_takes_first_present_name_in_batch() {
    let repo = MemoryRepository::new();
    let mut resolvers = ResolverSet::new();

    let mut first = registry_row("S", "RS", None, "Usina A", "UG-A");
    first.subsystem_name = None;
    let mut second = registry_row("S", "SC", None, "Usina B", "UG-B");
    second.subsystem_name = Some("Sul".to_string());

    let reports = Loader::new(&repo, &mut resolvers)
        .load_registry(&[first, second], &CountrySeed::default())
        .await;

    assert_eq!(step(&reports, Step::Subsystems).counts.inserted, 1);
    assert_eq!(repo.rows(&SUBSYSTEM)[0].get("name"), Some(&Value::text("Sul")));
}

#[tokio::test]
async fn test_coded_plant_resolves_from_a_later_row() {
    let repo = MemoryRepository::new();
    let mut resolvers = ResolverSet::new();

    let code = "UHE.PH.RS.000002-0.01".to_string();
    // First row for the plant has no state; the second one does
    let stateless = RegistryRow {
        state_code: None,
        installation_code: Some(code.clone()),
        ..registry_row("S", "RS", Some("Agente X"), "Usina Coded", "UG-C1")
    };
    let located = RegistryRow {
        installation_code: Some(code.clone()),
        ..registry_row("S", "RS", Some("Agente X"), "Usina Coded", "UG-C2")
    };

    let reports = Loader::new(&repo, &mut resolvers)
        .load_registry(&[stateless, located], &CountrySeed::default())
        .await;

    let plants = step(&reports, Step::Plants);
    assert_eq!(plants.counts.candidates, 1);
    assert_eq!(plants.counts.inserted, 1);
    assert_eq!(plants.counts.skipped_unresolved, 0);

    // Both units find the plant through its installation code
    let units = step(&reports, Step::GeneratingUnits);
    assert_eq!(units.counts.inserted, 2);
    assert_eq!(units.counts.skipped_unresolved, 0);

    let stored = repo.rows(&PLANT);
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].get("installation_code"), Some(&Value::text(code)));
}
