//! Dependency-ordered loading
//!
//! The loader walks the fixed dependency graph
//! `Country <- Subsystem <- State <- Plant <- GeneratingUnit` (plus
//! `Country <- metric`) one step at a time. Each step runs in its own
//! session: it either commits and publishes its resolved ids to the
//! [`ResolverSet`], or rolls back and leaves both the store and the caches as
//! they were before the step. Later steps always run; rows whose parents
//! did not resolve are skipped and counted.

use serde::{Serialize, Serializer};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::{debug, error, info, warn};

use crate::entities::{
    CountryAttrs, MetricKey, MetricKind, PlantAttrs, PlantKey, StateAttrs, SubsystemAttrs, SubsystemKey, UnitAttrs,
};
use crate::error::StoreResult;
use crate::records::{IndicatorRow, RegistryRow};
use crate::resolver::{Resolution, ResolverSet, Staged};
use crate::schema::{self, SurrogateId, TableDef};
use crate::store::{Repository, Session};

/// Country that registry rows belong to; the registry has no country column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountrySeed {
    pub code: String,
    pub name: String,
}

impl Default for CountrySeed {
    fn default() -> Self {
        Self {
            code: "BRA".to_string(),
            name: "Brazil".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Country,
    Subsystems,
    States,
    Owners,
    Plants,
    GeneratingUnits,
    /// Countries named by an indicator file
    IndicatorCountries(MetricKind),
    MetricValues(MetricKind),
}

impl Step {
    pub fn table(self) -> &'static TableDef {
        use crate::entities::EntityKind;

        match self {
            Step::Country | Step::IndicatorCountries(_) => &schema::COUNTRY,
            Step::Subsystems => &schema::SUBSYSTEM,
            Step::States => &schema::STATE,
            Step::Owners => &schema::OWNER,
            Step::Plants => &schema::PLANT,
            Step::GeneratingUnits => &schema::GENERATING_UNIT,
            Step::MetricValues(kind) => kind.table(),
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Country => f.write_str("country"),
            Step::Subsystems => f.write_str("subsystems"),
            Step::States => f.write_str("states"),
            Step::Owners => f.write_str("owners"),
            Step::Plants => f.write_str("plants"),
            Step::GeneratingUnits => f.write_str("generating_units"),
            Step::IndicatorCountries(kind) => write!(f, "{}.countries", kind),
            Step::MetricValues(kind) => write!(f, "{}.values", kind),
        }
    }
}

impl Serialize for Step {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "error", rename_all = "snake_case")]
pub enum StepStatus {
    Committed,
    Failed(String),
}

/// Counters of one step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StepCounts {
    /// Distinct natural keys the step considered
    pub candidates: usize,
    pub inserted: usize,
    /// Keys that were already stored (from this run or an earlier one)
    pub existing: usize,
    pub updated: usize,
    pub skipped_missing_key: usize,
    pub skipped_unresolved: usize,
}

impl StepCounts {
    fn record(&mut self, resolution: Resolution) {
        match resolution {
            Resolution::Inserted(_) => self.inserted += 1,
            Resolution::Cached(_) | Resolution::Existing(_) => self.existing += 1,
            Resolution::Refreshed(_) => self.updated += 1,
        }
    }

    pub fn skipped(&self) -> usize {
        self.skipped_missing_key + self.skipped_unresolved
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub step: Step,
    pub table: &'static str,
    #[serde(flatten)]
    pub counts: StepCounts,
    pub status: StepStatus,
}

impl StepReport {
    pub fn is_failed(&self) -> bool {
        matches!(self.status, StepStatus::Failed(_))
    }
}

/// Run one step body in its own session, then commit or roll back and report.
///
/// `$body` is a future borrowing the named session and counts.
macro_rules! run_step {
    ($loader:ident, $step:expr, |$session:ident, $counts:ident| $body:expr) => {{
        let mut $counts = StepCounts::default();
        let result = match $loader.repo.begin().await {
            Ok(mut $session) => {
                let result = $body.await;
                $loader.finish($session, result).await
            },
            Err(e) => Err(e),
        };
        $loader.report($step, $counts, result)
    }};
}

pub struct Loader<'a, R: Repository> {
    repo: &'a R,
    resolvers: &'a mut ResolverSet,
}

impl<'a, R: Repository> Loader<'a, R> {
    pub fn new(repo: &'a R, resolvers: &'a mut ResolverSet) -> Self {
        Self { repo, resolvers }
    }

    /// Country seed, then subsystems, states, owners, plants and generating
    /// units of one registry batch
    pub async fn load_registry(&mut self, rows: &[RegistryRow], country: &CountrySeed) -> Vec<StepReport> {
        let mut reports = Vec::with_capacity(6);

        reports.push(run_step!(self, Step::Country, |session, counts| {
            self.seed_country(&mut session, country, &mut counts)
        }));
        let country_id = self.resolvers.countries.cached(&country.code);

        reports.push(run_step!(self, Step::Subsystems, |session, counts| {
            self.subsystems(&mut session, rows, country_id, &mut counts)
        }));
        reports.push(run_step!(self, Step::States, |session, counts| {
            self.states(&mut session, rows, country_id, &mut counts)
        }));
        reports.push(run_step!(self, Step::Owners, |session, counts| {
            self.owners(&mut session, rows, &mut counts)
        }));
        reports.push(run_step!(self, Step::Plants, |session, counts| {
            self.plants(&mut session, rows, &mut counts)
        }));
        reports.push(run_step!(self, Step::GeneratingUnits, |session, counts| {
            self.units(&mut session, rows, &mut counts)
        }));

        reports
    }

    /// Countries of an indicator batch, then its (country, year) values
    pub async fn load_indicator(&mut self, kind: MetricKind, rows: &[IndicatorRow]) -> Vec<StepReport> {
        vec![
            self.load_countries(kind, rows).await,
            self.load_metric(kind, rows).await,
        ]
    }

    pub async fn load_countries(&mut self, kind: MetricKind, rows: &[IndicatorRow]) -> StepReport {
        run_step!(self, Step::IndicatorCountries(kind), |session, counts| {
            self.countries(&mut session, rows, &mut counts)
        })
    }

    /// Metric rows only; countries must already be resolvable
    pub async fn load_metric(&mut self, kind: MetricKind, rows: &[IndicatorRow]) -> StepReport {
        run_step!(self, Step::MetricValues(kind), |session, counts| {
            self.metric_values(&mut session, kind, rows, &mut counts)
        })
    }

    /// Commit on success, roll back on failure, and move the resolver caches
    /// along with the transaction
    async fn finish(&mut self, session: R::Session, result: StoreResult<()>) -> StoreResult<()> {
        match result {
            Ok(()) => match session.commit().await {
                Ok(()) => {
                    self.resolvers.commit_pending();
                    Ok(())
                },
                Err(e) => {
                    self.resolvers.discard_pending();
                    Err(e)
                },
            },
            Err(e) => {
                if let Err(rollback_err) = session.rollback().await {
                    warn!(error = %rollback_err, "Rollback failed");
                }
                self.resolvers.discard_pending();
                Err(e)
            },
        }
    }

    fn report(&self, step: Step, counts: StepCounts, result: StoreResult<()>) -> StepReport {
        let table = step.table().name;
        match result {
            Ok(()) => {
                info!(
                    step = %step,
                    table,
                    candidates = counts.candidates,
                    inserted = counts.inserted,
                    existing = counts.existing,
                    updated = counts.updated,
                    skipped_missing_key = counts.skipped_missing_key,
                    "Step committed"
                );
                if counts.skipped_unresolved > 0 {
                    warn!(
                        step = %step,
                        table,
                        skipped = counts.skipped_unresolved,
                        "Rows skipped: referenced entity did not resolve"
                    );
                }
                StepReport {
                    step,
                    table,
                    counts,
                    status: StepStatus::Committed,
                }
            },
            Err(e) => {
                error!(step = %step, table, error = %e, "Step rolled back");
                // Nothing the step wrote survived the rollback
                let counts = StepCounts {
                    candidates: counts.candidates,
                    skipped_missing_key: counts.skipped_missing_key,
                    skipped_unresolved: counts.skipped_unresolved,
                    ..StepCounts::default()
                };
                StepReport {
                    step,
                    table,
                    counts,
                    status: StepStatus::Failed(e.to_string()),
                }
            },
        }
    }

    // ------------------------------------------------------------------------
    // Step bodies
    // ------------------------------------------------------------------------

    async fn seed_country(
        &mut self,
        session: &mut R::Session,
        country: &CountrySeed,
        counts: &mut StepCounts,
    ) -> StoreResult<()> {
        counts.candidates = 1;
        let attrs = CountryAttrs {
            name: Some(country.name.clone()),
        };
        let resolution = self.resolvers.countries.resolve(session, &country.code, &attrs).await?;
        counts.record(resolution);
        Ok(())
    }

    async fn subsystems(
        &mut self,
        session: &mut R::Session,
        rows: &[RegistryRow],
        country_id: Option<SurrogateId>,
        counts: &mut StepCounts,
    ) -> StoreResult<()> {
        // Distinct codes in first-seen order, each with its first present name
        let mut subsystems: Vec<(&String, Option<&String>)> = Vec::new();
        let mut index: HashMap<&String, usize> = HashMap::new();
        for row in rows {
            let Some(code) = row.subsystem_code.as_ref() else {
                counts.skipped_missing_key += 1;
                continue;
            };
            match index.get(code) {
                Some(&i) => {
                    let name: &mut Option<&String> = &mut subsystems[i].1;
                    if name.is_none() {
                        *name = row.subsystem_name.as_ref();
                    }
                },
                None => {
                    index.insert(code, subsystems.len());
                    subsystems.push((code, row.subsystem_name.as_ref()));
                },
            }
        }

        for (code, name) in subsystems {
            counts.candidates += 1;

            let Some(country_id) = country_id else {
                counts.skipped_unresolved += 1;
                continue;
            };
            let key = SubsystemKey {
                country_id,
                code: code.clone(),
            };
            let attrs = SubsystemAttrs { name: name.cloned() };
            counts.record(self.resolvers.subsystems.resolve(session, &key, &attrs).await?);
        }
        Ok(())
    }

    async fn states(
        &mut self,
        session: &mut R::Session,
        rows: &[RegistryRow],
        country_id: Option<SurrogateId>,
        counts: &mut StepCounts,
    ) -> StoreResult<()> {
        let mut seen = HashSet::new();
        for row in rows {
            let Some(code) = row.state_code.as_ref() else {
                counts.skipped_missing_key += 1;
                continue;
            };
            if !seen.insert(code) {
                continue;
            }
            counts.candidates += 1;

            // The region on the state's first row is its subsystem
            let subsystem_id = match (country_id, row.subsystem_code.as_ref()) {
                (Some(country_id), Some(subsystem)) => {
                    let key = SubsystemKey {
                        country_id,
                        code: subsystem.clone(),
                    };
                    self.resolvers.subsystems.lookup(session, &key).await?
                },
                _ => None,
            };
            let Some(subsystem_id) = subsystem_id else {
                counts.skipped_unresolved += 1;
                continue;
            };

            let attrs = StateAttrs {
                name: row.state_name.clone(),
                subsystem_id,
            };
            counts.record(self.resolvers.states.resolve(session, code, &attrs).await?);
        }
        Ok(())
    }

    async fn owners(&mut self, session: &mut R::Session, rows: &[RegistryRow], counts: &mut StepCounts) -> StoreResult<()> {
        let mut seen = HashSet::new();
        for name in rows.iter().filter_map(|row| row.owner.as_ref()) {
            if !seen.insert(name) {
                continue;
            }
            counts.candidates += 1;
            counts.record(self.resolvers.owners.resolve(session, name, &()).await?);
        }
        Ok(())
    }

    async fn plants(&mut self, session: &mut R::Session, rows: &[RegistryRow], counts: &mut StepCounts) -> StoreResult<()> {
        // Rows grouped by plant identity, in first-seen order
        let mut groups: Vec<Vec<&RegistryRow>> = Vec::new();
        let mut index: HashMap<_, usize> = HashMap::new();
        for row in rows {
            let identity = match (&row.installation_code, &row.plant_name) {
                (Some(code), _) => (Some(code), None, None),
                (None, Some(name)) => (None, Some(name), row.state_code.as_ref()),
                (None, None) => {
                    counts.skipped_missing_key += 1;
                    continue;
                },
            };
            match index.get(&identity) {
                Some(&i) => groups[i].push(row),
                None => {
                    index.insert(identity, groups.len());
                    groups.push(vec![row]);
                },
            }
        }

        for group in groups {
            counts.candidates += 1;

            // The first row whose state resolves describes the plant
            let mut resolved = None;
            for row in group {
                if let Some(code) = row.state_code.as_ref() {
                    if let Some(state_id) = self.resolvers.states.lookup(session, code).await? {
                        resolved = Some((row, state_id));
                        break;
                    }
                }
            }
            let Some((row, state_id)) = resolved else {
                counts.skipped_unresolved += 1;
                continue;
            };
            let Some(key) = PlantKey::new(row.installation_code.as_deref(), row.plant_name.as_deref(), state_id) else {
                counts.skipped_missing_key += 1;
                continue;
            };

            // A plant is kept even when its owner did not resolve
            let owner_id = match row.owner.as_ref() {
                Some(owner) => {
                    let id = self.resolvers.owners.lookup(session, owner).await?;
                    if id.is_none() {
                        debug!(owner = %owner, "Owner unresolved, plant stored without owner");
                    }
                    id
                },
                None => None,
            };

            let attrs = PlantAttrs {
                name: row.plant_name.clone(),
                state_id,
                owner_id,
                plant_type: row.plant_type.clone(),
                operating_mode: row.operating_mode.clone(),
            };
            counts.record(self.resolvers.plants.resolve(session, &key, &attrs).await?);
        }
        Ok(())
    }

    async fn units(&mut self, session: &mut R::Session, rows: &[RegistryRow], counts: &mut StepCounts) -> StoreResult<()> {
        let mut seen = HashSet::new();
        for row in rows {
            let Some(code) = row.equipment_code.as_ref() else {
                counts.skipped_missing_key += 1;
                continue;
            };
            if !seen.insert(code) {
                continue;
            }
            counts.candidates += 1;

            let Some(plant_id) = self.plant_id_for(session, row).await? else {
                counts.skipped_unresolved += 1;
                continue;
            };

            let attrs = UnitAttrs {
                plant_id,
                name: row.unit_name.clone(),
                number: row.unit_number,
                capacity_mw: row.capacity_mw,
                fuel: row.fuel.clone(),
                test_date: row.test_date,
                operation_date: row.operation_date,
                decommission_date: row.decommission_date,
            };
            counts.record(self.resolvers.units.resolve(session, code, &attrs).await?);
        }
        Ok(())
    }

    async fn plant_id_for(&mut self, session: &mut R::Session, row: &RegistryRow) -> StoreResult<Option<SurrogateId>> {
        if let Some(code) = row.installation_code.as_ref() {
            let key = PlantKey::InstallationCode(code.clone());
            return self.resolvers.plants.lookup(session, &key).await;
        }
        let Some(state_code) = row.state_code.as_ref() else {
            return Ok(None);
        };
        let Some(state_id) = self.resolvers.states.lookup(session, state_code).await? else {
            return Ok(None);
        };
        let Some(key) = PlantKey::new(None, row.plant_name.as_deref(), state_id) else {
            return Ok(None);
        };
        self.resolvers.plants.lookup(session, &key).await
    }

    async fn countries(&mut self, session: &mut R::Session, rows: &[IndicatorRow], counts: &mut StepCounts) -> StoreResult<()> {
        let mut seen = HashSet::new();
        for row in rows {
            let Some(code) = row.country_code.as_ref() else {
                counts.skipped_missing_key += 1;
                continue;
            };
            if !seen.insert(code) {
                continue;
            }
            counts.candidates += 1;

            let attrs = CountryAttrs {
                name: row.country_name.clone(),
            };
            counts.record(self.resolvers.countries.resolve(session, code, &attrs).await?);
        }
        Ok(())
    }

    async fn metric_values(
        &mut self,
        session: &mut R::Session,
        kind: MetricKind,
        rows: &[IndicatorRow],
        counts: &mut StepCounts,
    ) -> StoreResult<()> {
        let (countries, metric) = self.resolvers.metric(kind);
        let mut seen = HashSet::new();
        for row in rows {
            let (Some(code), Some(year)) = (row.country_code.as_ref(), row.year) else {
                counts.skipped_missing_key += 1;
                continue;
            };
            if !seen.insert((code, year)) {
                continue;
            }
            counts.candidates += 1;

            let Some(country_id) = countries.lookup(session, code).await? else {
                counts.skipped_unresolved += 1;
                continue;
            };
            let key = MetricKey { country_id, year };
            counts.record(metric.resolve(session, &key, &row.value).await?);
        }
        Ok(())
    }
}
