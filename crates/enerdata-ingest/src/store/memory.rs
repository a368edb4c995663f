//! In-process repository
//!
//! Backs `--dry-run` and the test-suite. It behaves like the relational
//! store where the loader can observe a difference: natural keys are unique
//! per key shape, foreign keys must point at existing rows, and a session
//! sees nothing of another session's uncommitted writes.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{InsertOutcome, Repository, Session};
use crate::error::{StoreError, StoreResult};
use crate::schema::{Column, SurrogateId, TableDef, Value};

type Row = BTreeMap<&'static str, Value>;

#[derive(Debug, Clone, Default)]
struct MemoryTable {
    next_id: i64,
    rows: BTreeMap<SurrogateId, Row>,
    /// Normalized (sorted by column name) natural key -> id
    keys: HashMap<Vec<Column>, SurrogateId>,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    tables: HashMap<&'static str, MemoryTable>,
}

impl MemoryState {
    fn contains(&self, table: &str, id: SurrogateId) -> bool {
        self.tables
            .get(table)
            .is_some_and(|t| t.rows.contains_key(&id))
    }
}

fn normalize_key(key: &[Column]) -> Vec<Column> {
    let mut key = key.to_vec();
    key.sort_by(|a, b| a.name.cmp(b.name));
    key
}

/// Repository holding every table in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryRepository {
    state: Arc<Mutex<MemoryState>>,
    failing_tables: Arc<Mutex<HashSet<&'static str>>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later write to `table` fail with [`StoreError::Unavailable`]
    pub fn fail_writes_to(&self, table: &'static TableDef) {
        if let Ok(mut failing) = self.failing_tables.lock() {
            failing.insert(table.name);
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut failing) = self.failing_tables.lock() {
            failing.clear();
        }
    }

    pub fn row_count(&self, table: &TableDef) -> usize {
        self.lock_state()
            .ok()
            .and_then(|state| state.tables.get(table.name).map(|t| t.rows.len()))
            .unwrap_or(0)
    }

    /// Committed row counts for every table that has been written to
    pub fn table_counts(&self) -> BTreeMap<&'static str, usize> {
        self.lock_state()
            .map(|state| {
                state
                    .tables
                    .iter()
                    .map(|(name, table)| (*name, table.rows.len()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Committed rows of `table`, each with its id column included
    pub fn rows(&self, table: &TableDef) -> Vec<BTreeMap<&'static str, Value>> {
        let Ok(state) = self.lock_state() else {
            return Vec::new();
        };
        state
            .tables
            .get(table.name)
            .map(|t| {
                t.rows
                    .iter()
                    .map(|(id, row)| {
                        let mut row = row.clone();
                        row.insert(table.id_column, Value::id(*id));
                        row
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn lock_state(&self) -> StoreResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    type Session = MemorySession;

    async fn begin(&self) -> StoreResult<MemorySession> {
        let working = self.lock_state()?.clone();
        let failing = self
            .failing_tables
            .lock()
            .map(|f| f.clone())
            .unwrap_or_default();

        Ok(MemorySession {
            shared: Arc::clone(&self.state),
            working,
            failing,
        })
    }
}

/// Snapshot of the store taken at `begin`, published on `commit`
pub struct MemorySession {
    shared: Arc<Mutex<MemoryState>>,
    working: MemoryState,
    failing: HashSet<&'static str>,
}

impl MemorySession {
    fn check_writable(&self, table: &TableDef) -> StoreResult<()> {
        if self.failing.contains(table.name) {
            return Err(StoreError::Unavailable(format!(
                "writes to {} are disabled",
                table.name
            )));
        }
        Ok(())
    }

    fn check_references(&self, table: &'static TableDef, columns: &[Column]) -> StoreResult<()> {
        for column in columns {
            let Some(fk) = table.foreign_key(column.name) else {
                continue;
            };
            if let Some(id) = column.value.as_id() {
                if !self.working.contains(fk.references, id) {
                    return Err(StoreError::ForeignKey {
                        table: table.name,
                        column: fk.column,
                    });
                }
            }
        }
        Ok(())
    }

    fn lookup(&self, table: &TableDef, key: &[Column]) -> Option<SurrogateId> {
        self.working
            .tables
            .get(table.name)
            .and_then(|t| t.keys.get(&normalize_key(key)).copied())
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn insert_if_absent(
        &mut self,
        table: &'static TableDef,
        key: &[Column],
        attributes: &[Column],
    ) -> StoreResult<InsertOutcome> {
        self.check_writable(table)?;

        if self.lookup(table, key).is_some() {
            return Ok(InsertOutcome::AlreadyPresent);
        }

        self.check_references(table, key)?;
        self.check_references(table, attributes)?;

        let stored = self.working.tables.entry(table.name).or_default();
        stored.next_id += 1;
        let id = SurrogateId(stored.next_id);

        let row: Row = key
            .iter()
            .chain(attributes)
            .map(|c| (c.name, c.value.clone()))
            .collect();
        stored.rows.insert(id, row);
        stored.keys.insert(normalize_key(key), id);

        Ok(InsertOutcome::Inserted(id))
    }

    async fn find_by_natural_key(
        &mut self,
        table: &'static TableDef,
        key: &[Column],
    ) -> StoreResult<Option<SurrogateId>> {
        Ok(self.lookup(table, key))
    }

    async fn update_attributes(
        &mut self,
        table: &'static TableDef,
        key: &[Column],
        attributes: &[Column],
    ) -> StoreResult<Option<SurrogateId>> {
        self.check_writable(table)?;

        let Some(id) = self.lookup(table, key) else {
            return Ok(None);
        };
        self.check_references(table, attributes)?;

        if let Some(row) = self
            .working
            .tables
            .get_mut(table.name)
            .and_then(|t| t.rows.get_mut(&id))
        {
            for column in attributes {
                row.insert(column.name, column.value.clone());
            }
        }

        Ok(Some(id))
    }

    async fn scan_natural_keys(
        &mut self,
        table: &'static TableDef,
    ) -> StoreResult<Vec<(Vec<Value>, SurrogateId)>> {
        let Some(stored) = self.working.tables.get(table.name) else {
            return Ok(Vec::new());
        };

        Ok(stored
            .rows
            .iter()
            .map(|(id, row)| {
                let values = table
                    .key_columns
                    .iter()
                    .map(|(name, ty)| row.get(name).cloned().unwrap_or_else(|| Value::null(*ty)))
                    .collect();
                (values, *id)
            })
            .collect())
    }

    async fn commit(self) -> StoreResult<()> {
        let mut shared = self
            .shared
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))?;
        *shared = self.working;
        Ok(())
    }

    async fn rollback(self) -> StoreResult<()> {
        Ok(())
    }
}
