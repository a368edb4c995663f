//! PostgreSQL repository
//!
//! Every statement is assembled from static [`TableDef`] identifiers with
//! values bound as parameters. `insert_if_absent` is wrapped in a savepoint
//! so that a uniqueness rejection leaves the surrounding step transaction
//! usable.

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row, Transaction};
use std::time::Duration;
use tracing::{debug, info};

use super::{InsertOutcome, Repository, Session};
use crate::config::DatabaseConfig;
use crate::error::{IngestError, StoreError, StoreResult};
use crate::schema::{Column, ColumnType, SurrogateId, TableDef, Value};

const INSERT_SAVEPOINT: &str = "insert_if_absent";

/// Statements that close the savepoint after a rejected insert, leaving the
/// transaction as it was before the insert
const UNDO_INSERT: [&str; 2] = ["ROLLBACK TO SAVEPOINT", "RELEASE SAVEPOINT"];

/// Create the connection pool described by `config`
pub async fn create_pool(config: &DatabaseConfig) -> StoreResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .connect(&config.url)
        .await?;

    info!(
        max_connections = config.max_connections,
        "Database connection pool created"
    );

    Ok(pool)
}

#[derive(Debug, Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &DatabaseConfig) -> StoreResult<Self> {
        Ok(Self::new(create_pool(config).await?))
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<(), IngestError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        debug!("Schema migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Repository for PgRepository {
    type Session = PgSession;

    async fn begin(&self) -> StoreResult<PgSession> {
        let tx = self.pool.begin().await?;
        Ok(PgSession { tx })
    }
}

/// One database transaction
pub struct PgSession {
    tx: Transaction<'static, Postgres>,
}

fn push_value(builder: &mut QueryBuilder<'_, Postgres>, value: &Value) {
    match value.clone() {
        Value::Text(v) => {
            builder.push_bind(v);
        },
        Value::Integer(v) => {
            builder.push_bind(v);
        },
        Value::Id(v) => {
            builder.push_bind(v.map(|id| id.0));
        },
        Value::Float(v) => {
            builder.push_bind(v);
        },
        Value::Date(v) => {
            builder.push_bind(v);
        },
    }
}

/// `a = $1 AND b IS NULL AND ...`
fn push_key_predicate(builder: &mut QueryBuilder<'_, Postgres>, key: &[Column]) {
    for (i, column) in key.iter().enumerate() {
        if i > 0 {
            builder.push(" AND ");
        }
        builder.push(column.name);
        if column.value.is_null() {
            builder.push(" IS NULL");
        } else {
            builder.push(" = ");
            push_value(builder, &column.value);
        }
    }
}

fn decode_column(row: &PgRow, index: usize, column_type: ColumnType) -> StoreResult<Value> {
    let value = match column_type {
        ColumnType::Text => Value::Text(row.try_get::<Option<String>, _>(index)?),
        ColumnType::Integer => Value::Integer(row.try_get::<Option<i32>, _>(index)?),
        ColumnType::Id => Value::Id(row.try_get::<Option<i64>, _>(index)?.map(SurrogateId)),
        ColumnType::Float => Value::Float(row.try_get::<Option<f64>, _>(index)?),
        ColumnType::Date => Value::Date(row.try_get::<Option<NaiveDate>, _>(index)?),
    };
    Ok(value)
}

/// Map foreign-key violations onto the offending column; everything else
/// stays a database error
fn classify(table: &'static TableDef, error: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(ref db_err) = error {
        if db_err.is_foreign_key_violation() {
            let constraint = db_err.constraint().unwrap_or_default();
            let column = table
                .foreign_keys
                .iter()
                .find(|fk| constraint.contains(fk.column))
                .or_else(|| table.foreign_keys.first())
                .map(|fk| fk.column)
                .unwrap_or("unknown");
            return StoreError::ForeignKey {
                table: table.name,
                column,
            };
        }
    }
    StoreError::Database(error)
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = error {
        return db_err.is_unique_violation();
    }
    false
}

impl PgSession {
    async fn execute_savepoint(&mut self, statement: &str) -> StoreResult<()> {
        sqlx::query(&format!("{} {}", statement, INSERT_SAVEPOINT))
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn insert_row(
        &mut self,
        table: &'static TableDef,
        key: &[Column],
        attributes: &[Column],
    ) -> Result<SurrogateId, sqlx::Error> {
        let mut builder = QueryBuilder::<Postgres>::new("INSERT INTO ");
        builder.push(table.name).push(" (");
        {
            let mut names = builder.separated(", ");
            for column in key.iter().chain(attributes) {
                names.push(column.name);
            }
        }
        builder.push(") VALUES (");
        for (i, column) in key.iter().chain(attributes).enumerate() {
            if i > 0 {
                builder.push(", ");
            }
            push_value(&mut builder, &column.value);
        }
        builder.push(") RETURNING ").push(table.id_column);

        let row = builder.build().fetch_one(&mut *self.tx).await?;
        Ok(SurrogateId(row.try_get::<i64, _>(0)?))
    }
}

#[async_trait]
impl Session for PgSession {
    async fn insert_if_absent(
        &mut self,
        table: &'static TableDef,
        key: &[Column],
        attributes: &[Column],
    ) -> StoreResult<InsertOutcome> {
        self.execute_savepoint("SAVEPOINT").await?;

        match self.insert_row(table, key, attributes).await {
            Ok(id) => {
                self.execute_savepoint("RELEASE SAVEPOINT").await?;
                Ok(InsertOutcome::Inserted(id))
            },
            Err(e) => {
                for statement in UNDO_INSERT {
                    self.execute_savepoint(statement).await?;
                }
                if is_unique_violation(&e) {
                    debug!(table = table.name, "Natural key already present");
                    Ok(InsertOutcome::AlreadyPresent)
                } else {
                    Err(classify(table, e))
                }
            },
        }
    }

    async fn find_by_natural_key(
        &mut self,
        table: &'static TableDef,
        key: &[Column],
    ) -> StoreResult<Option<SurrogateId>> {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT ");
        builder
            .push(table.id_column)
            .push(" FROM ")
            .push(table.name)
            .push(" WHERE ");
        push_key_predicate(&mut builder, key);

        let row = builder.build().fetch_optional(&mut *self.tx).await?;
        match row {
            Some(row) => Ok(Some(SurrogateId(row.try_get::<i64, _>(0)?))),
            None => Ok(None),
        }
    }

    async fn update_attributes(
        &mut self,
        table: &'static TableDef,
        key: &[Column],
        attributes: &[Column],
    ) -> StoreResult<Option<SurrogateId>> {
        if attributes.is_empty() {
            return self.find_by_natural_key(table, key).await;
        }

        let mut builder = QueryBuilder::<Postgres>::new("UPDATE ");
        builder.push(table.name).push(" SET ");
        for (i, column) in attributes.iter().enumerate() {
            if i > 0 {
                builder.push(", ");
            }
            builder.push(column.name).push(" = ");
            push_value(&mut builder, &column.value);
        }
        builder.push(" WHERE ");
        push_key_predicate(&mut builder, key);
        builder.push(" RETURNING ").push(table.id_column);

        let row = builder
            .build()
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| classify(table, e))?;
        match row {
            Some(row) => Ok(Some(SurrogateId(row.try_get::<i64, _>(0)?))),
            None => Ok(None),
        }
    }

    async fn scan_natural_keys(
        &mut self,
        table: &'static TableDef,
    ) -> StoreResult<Vec<(Vec<Value>, SurrogateId)>> {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT ");
        builder.push(table.id_column);
        for (name, _) in table.key_columns {
            builder.push(", ").push(*name);
        }
        builder.push(" FROM ").push(table.name);

        let rows = builder.build().fetch_all(&mut *self.tx).await?;

        let mut scanned = Vec::with_capacity(rows.len());
        for row in &rows {
            let id = SurrogateId(row.try_get::<i64, _>(0)?);
            let values = table
                .key_columns
                .iter()
                .enumerate()
                .map(|(i, (_, column_type))| decode_column(row, i + 1, *column_type))
                .collect::<StoreResult<Vec<_>>>()?;
            scanned.push((values, id));
        }

        debug!(table = table.name, rows = scanned.len(), "Scanned natural keys");
        Ok(scanned)
    }

    async fn commit(self) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> StoreResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
