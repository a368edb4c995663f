//! Entity resolution
//!
//! A [`Resolver`] maps natural keys of one entity kind to surrogate ids. It
//! is seeded once per run from the store, answers repeated keys from memory,
//! and otherwise runs the two-step protocol: attempt an insert, and when the
//! store reports the key as already present, fetch the existing id.
//!
//! Ids learned inside a step stay *pending* until the loader commits that
//! step. A rolled-back step discards them so the cache never points at rows
//! that do not exist.

use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

use crate::entities::{
    Countries, EntityKind, GeneratingUnits, MetricKind, Owners, Plants, States, Subsystems,
};
use crate::error::{StoreError, StoreResult};
use crate::schema::SurrogateId;
use crate::store::{InsertOutcome, Session};

/// How a key was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Answered from the resolution cache without touching storage
    Cached(SurrogateId),
    /// A new row was written
    Inserted(SurrogateId),
    /// The store already held the key; nothing was written
    Existing(SurrogateId),
    /// The store already held the key and its refreshable attributes were
    /// rewritten
    Refreshed(SurrogateId),
}

impl Resolution {
    pub fn id(self) -> SurrogateId {
        match self {
            Resolution::Cached(id)
            | Resolution::Inserted(id)
            | Resolution::Existing(id)
            | Resolution::Refreshed(id) => id,
        }
    }
}

/// Cache state that follows the fate of the current step's transaction
pub trait Staged {
    fn commit_pending(&mut self);
    fn discard_pending(&mut self);
}

pub struct Resolver<K: EntityKind> {
    kind: K,
    committed: HashMap<K::Key, SurrogateId>,
    pending: HashMap<K::Key, SurrogateId>,
    /// Keys whose refreshable attributes were already written this run
    refreshed: HashSet<K::Key>,
    pending_refreshed: HashSet<K::Key>,
    seeded: bool,
}

impl<K: EntityKind> Resolver<K> {
    pub fn new(kind: K) -> Self {
        Self {
            kind,
            committed: HashMap::new(),
            pending: HashMap::new(),
            refreshed: HashSet::new(),
            pending_refreshed: HashSet::new(),
            seeded: false,
        }
    }

    pub fn kind(&self) -> &K {
        &self.kind
    }

    /// Id of `key` if this run has already resolved it
    pub fn cached(&self, key: &K::Key) -> Option<SurrogateId> {
        self.pending
            .get(key)
            .or_else(|| self.committed.get(key))
            .copied()
    }

    /// Number of keys known to the cache
    pub fn len(&self) -> usize {
        self.committed.len() + self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load every persisted (natural key, id) pair of this kind
    pub async fn seed<S: Session>(&mut self, session: &mut S) -> StoreResult<()> {
        if self.seeded {
            return Ok(());
        }

        let table = self.kind.table();
        let mut skipped = 0usize;
        for (values, id) in session.scan_natural_keys(table).await? {
            match self.kind.key_from_values(&values) {
                Some(key) => {
                    self.committed.insert(key, id);
                },
                None => skipped += 1,
            }
        }

        debug!(
            table = table.name,
            cached = self.committed.len(),
            skipped,
            "Resolution cache seeded"
        );
        self.seeded = true;
        Ok(())
    }

    /// Id of `key` from the cache or the store, without inserting
    pub async fn lookup<S: Session>(&mut self, session: &mut S, key: &K::Key) -> StoreResult<Option<SurrogateId>> {
        self.seed(session).await?;
        Ok(self.cached(key))
    }

    /// Resolve `key` to a surrogate id, inserting the entity with `attrs`
    /// when it is not stored yet
    pub async fn resolve<S: Session>(
        &mut self,
        session: &mut S,
        key: &K::Key,
        attrs: &K::Attrs,
    ) -> StoreResult<Resolution> {
        self.seed(session).await?;

        if let Some(id) = self.cached(key) {
            if self.needs_refresh(key, attrs) {
                return self.refresh(session, key, attrs).await;
            }
            return Ok(Resolution::Cached(id));
        }

        let table = self.kind.table();
        let key_columns = self.kind.key_columns(key);
        let attributes = self.kind.attribute_columns(key, attrs);

        let resolution = match session.insert_if_absent(table, &key_columns, &attributes).await? {
            InsertOutcome::Inserted(id) => {
                // Freshly written attributes need no refresh later in the run
                if !self.kind.refresh_columns(attrs).is_empty() {
                    self.pending_refreshed.insert(key.clone());
                }
                Resolution::Inserted(id)
            },
            InsertOutcome::AlreadyPresent => {
                let id = session
                    .find_by_natural_key(table, &key_columns)
                    .await?
                    .ok_or(StoreError::Vanished { table: table.name })?;
                self.pending.insert(key.clone(), id);
                if self.needs_refresh(key, attrs) {
                    return self.refresh(session, key, attrs).await;
                }
                Resolution::Existing(id)
            },
        };

        self.pending.insert(key.clone(), resolution.id());
        Ok(resolution)
    }

    fn needs_refresh(&self, key: &K::Key, attrs: &K::Attrs) -> bool {
        !self.kind.refresh_columns(attrs).is_empty()
            && !self.refreshed.contains(key)
            && !self.pending_refreshed.contains(key)
    }

    async fn refresh<S: Session>(&mut self, session: &mut S, key: &K::Key, attrs: &K::Attrs) -> StoreResult<Resolution> {
        let table = self.kind.table();
        let id = session
            .update_attributes(table, &self.kind.key_columns(key), &self.kind.refresh_columns(attrs))
            .await?
            .ok_or(StoreError::Vanished { table: table.name })?;

        self.pending_refreshed.insert(key.clone());
        self.pending.insert(key.clone(), id);
        Ok(Resolution::Refreshed(id))
    }
}

impl<K: EntityKind> Staged for Resolver<K> {
    fn commit_pending(&mut self) {
        self.committed.extend(self.pending.drain());
        self.refreshed.extend(self.pending_refreshed.drain());
    }

    fn discard_pending(&mut self) {
        self.pending.clear();
        self.pending_refreshed.clear();
    }
}

/// Every resolver of one pipeline run
pub struct ResolverSet {
    pub countries: Resolver<Countries>,
    pub subsystems: Resolver<Subsystems>,
    pub states: Resolver<States>,
    pub owners: Resolver<Owners>,
    pub plants: Resolver<Plants>,
    pub units: Resolver<GeneratingUnits>,
    metrics: BTreeMap<MetricKind, Resolver<MetricKind>>,
}

impl ResolverSet {
    pub fn new() -> Self {
        Self {
            countries: Resolver::new(Countries),
            subsystems: Resolver::new(Subsystems),
            states: Resolver::new(States),
            owners: Resolver::new(Owners),
            plants: Resolver::new(Plants),
            units: Resolver::new(GeneratingUnits),
            metrics: MetricKind::ALL
                .iter()
                .map(|kind| (*kind, Resolver::new(*kind)))
                .collect(),
        }
    }

    /// Countries resolver together with the resolver of `kind`
    pub fn metric(&mut self, kind: MetricKind) -> (&mut Resolver<Countries>, &mut Resolver<MetricKind>) {
        let metric = self.metrics.entry(kind).or_insert_with(|| Resolver::new(kind));
        (&mut self.countries, metric)
    }
}

impl Default for ResolverSet {
    fn default() -> Self {
        Self::new()
    }
}

impl Staged for ResolverSet {
    fn commit_pending(&mut self) {
        self.countries.commit_pending();
        self.subsystems.commit_pending();
        self.states.commit_pending();
        self.owners.commit_pending();
        self.plants.commit_pending();
        self.units.commit_pending();
        self.metrics.values_mut().for_each(Staged::commit_pending);
    }

    fn discard_pending(&mut self) {
        self.countries.discard_pending();
        self.subsystems.discard_pending();
        self.states.discard_pending();
        self.owners.discard_pending();
        self.plants.discard_pending();
        self.units.discard_pending();
        self.metrics.values_mut().for_each(Staged::discard_pending);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::entities::{CountryAttrs, SubsystemAttrs, SubsystemKey};
    use crate::schema::{Value, COUNTRY, OWNER, SUBSYSTEM};
    use crate::store::{MemoryRepository, Repository};

    fn brazil() -> CountryAttrs {
        CountryAttrs {
            name: Some("Brazil".to_string()),
        }
    }

    fn region(name: &str) -> SubsystemAttrs {
        SubsystemAttrs {
            name: Some(name.to_string()),
        }
    }

    #[tokio::test]
    async fn test_repeated_keys_are_answered_from_cache() {
        let repo = MemoryRepository::new();
        let mut session = repo.begin().await.unwrap();
        let mut owners = Resolver::new(Owners);

        let first = owners.resolve(&mut session, &"Agente X".to_string(), &()).await.unwrap();
        let second = owners.resolve(&mut session, &"Agente X".to_string(), &()).await.unwrap();
        session.commit().await.unwrap();

        assert!(matches!(first, Resolution::Inserted(_)));
        assert_eq!(second, Resolution::Cached(first.id()));
        assert_eq!(repo.row_count(&OWNER), 1);
    }

    #[tokio::test]
    async fn test_seeding_finds_rows_from_earlier_runs() {
        let repo = MemoryRepository::new();

        let mut session = repo.begin().await.unwrap();
        let mut countries = Resolver::new(Countries);
        let id = countries.resolve(&mut session, &"BRA".to_string(), &brazil()).await.unwrap().id();
        session.commit().await.unwrap();

        let mut session = repo.begin().await.unwrap();
        let mut fresh = Resolver::new(Countries);
        let again = fresh.resolve(&mut session, &"BRA".to_string(), &brazil()).await.unwrap();
        assert_eq!(again, Resolution::Cached(id));
        assert_eq!(fresh.lookup(&mut session, &"ARG".to_string()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unseeded_duplicate_falls_back_to_fetch() {
        let repo = MemoryRepository::new();
        let mut session = repo.begin().await.unwrap();

        // Seed an empty cache, then write the key behind the resolver's back
        let mut countries = Resolver::new(Countries);
        countries.seed(&mut session).await.unwrap();
        let InsertOutcome::Inserted(id) = session
            .insert_if_absent(&COUNTRY, &Countries.key_columns(&"BRA".to_string()), &[])
            .await
            .unwrap()
        else {
            panic!("expected insert");
        };

        let resolution = countries.resolve(&mut session, &"BRA".to_string(), &brazil()).await.unwrap();
        assert_eq!(resolution, Resolution::Existing(id));
    }

    #[tokio::test]
    async fn test_subsystem_name_refreshes_once_per_run() {
        let repo = MemoryRepository::new();
        let mut session = repo.begin().await.unwrap();
        let country = Resolver::new(Countries)
            .resolve(&mut session, &"BRA".to_string(), &brazil())
            .await
            .unwrap()
            .id();
        session.commit().await.unwrap();
        let key = SubsystemKey {
            country_id: country,
            code: "S".to_string(),
        };

        // First run inserts; a repeat in the same run is a cache hit
        let mut session = repo.begin().await.unwrap();
        let mut subsystems = Resolver::new(Subsystems);
        let first = subsystems.resolve(&mut session, &key, &region("Sul")).await.unwrap();
        let repeat = subsystems.resolve(&mut session, &key, &region("Sul")).await.unwrap();
        session.commit().await.unwrap();
        subsystems.commit_pending();
        assert!(matches!(first, Resolution::Inserted(_)));
        assert!(matches!(repeat, Resolution::Cached(_)));

        // Second run refreshes the name on first sight, then hits the cache
        let mut session = repo.begin().await.unwrap();
        let mut subsystems = Resolver::new(Subsystems);
        let refreshed = subsystems.resolve(&mut session, &key, &region("Região Sul")).await.unwrap();
        let cached = subsystems.resolve(&mut session, &key, &region("Região Sul")).await.unwrap();
        session.commit().await.unwrap();

        assert_eq!(refreshed, Resolution::Refreshed(first.id()));
        assert_eq!(cached, Resolution::Cached(first.id()));
        assert_eq!(repo.row_count(&SUBSYSTEM), 1);
        assert_eq!(repo.rows(&SUBSYSTEM)[0].get("name"), Some(&Value::text("Região Sul")));
    }

    #[tokio::test]
    async fn test_discarded_ids_leave_the_cache() {
        let repo = MemoryRepository::new();
        let mut owners = Resolver::new(Owners);

        let mut session = repo.begin().await.unwrap();
        owners.resolve(&mut session, &"Agente X".to_string(), &()).await.unwrap();
        session.rollback().await.unwrap();
        owners.discard_pending();
        assert_eq!(owners.cached(&"Agente X".to_string()), None);

        let mut session = repo.begin().await.unwrap();
        let resolution = owners.resolve(&mut session, &"Agente X".to_string(), &()).await.unwrap();
        session.commit().await.unwrap();
        owners.commit_pending();
        assert!(matches!(resolution, Resolution::Inserted(_)));
        assert_eq!(owners.cached(&"Agente X".to_string()), Some(resolution.id()));
    }

    #[test]
    fn test_resolver_set_covers_every_metric() {
        let mut set = ResolverSet::new();
        for kind in MetricKind::ALL {
            let (_, metric) = set.metric(kind);
            assert_eq!(*metric.kind(), kind);
        }
    }
}
