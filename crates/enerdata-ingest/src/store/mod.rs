//! Repository interface consumed by the resolver and the loader
//!
//! A [`Repository`] hands out [`Session`]s. Each session is one transaction:
//! nothing it writes is visible after [`Session::rollback`], and everything
//! it writes becomes durable together on [`Session::commit`].
//!
//! Natural-key uniqueness is enforced by the store itself. Callers rely on
//! [`Session::insert_if_absent`] reporting [`InsertOutcome::AlreadyPresent`]
//! instead of creating a duplicate.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::schema::{Column, SurrogateId, TableDef, Value};

pub use memory::MemoryRepository;
pub use postgres::PgRepository;

/// Result of an insert attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(SurrogateId),
    /// A row with the same natural key already exists; its id has to be
    /// fetched with [`Session::find_by_natural_key`]
    AlreadyPresent,
}

#[async_trait]
pub trait Repository: Send + Sync {
    type Session: Session;

    async fn begin(&self) -> StoreResult<Self::Session>;
}

#[async_trait]
pub trait Session: Send {
    async fn insert_if_absent(
        &mut self,
        table: &'static TableDef,
        key: &[Column],
        attributes: &[Column],
    ) -> StoreResult<InsertOutcome>;

    async fn find_by_natural_key(
        &mut self,
        table: &'static TableDef,
        key: &[Column],
    ) -> StoreResult<Option<SurrogateId>>;

    async fn update_attributes(
        &mut self,
        table: &'static TableDef,
        key: &[Column],
        attributes: &[Column],
    ) -> StoreResult<Option<SurrogateId>>;

    /// Every stored row's `table.key_columns` values with its id
    async fn scan_natural_keys(
        &mut self,
        table: &'static TableDef,
    ) -> StoreResult<Vec<(Vec<Value>, SurrogateId)>>;

    async fn commit(self) -> StoreResult<()>;

    async fn rollback(self) -> StoreResult<()>;
}
