//! Error types for the ingestion pipeline

use std::path::PathBuf;
use thiserror::Error;

/// Failures while turning a source file into projected rows
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to read source file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Source '{label}' could not be decoded with any of: {tried}")]
    Undecodable { label: String, tried: String },

    #[error("Malformed delimited data in '{label}': {source}")]
    Csv {
        label: String,
        #[source]
        source: csv::Error,
    },

    #[error("Source '{label}' has no column {column}")]
    MissingColumn { label: String, column: String },
}

pub type SourceResult<T> = std::result::Result<T, SourceError>;

/// Failures reported by a repository implementation
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Foreign key violation on {table}.{column}: referenced row does not exist")]
    ForeignKey {
        table: &'static str,
        column: &'static str,
    },

    #[error("Insert into {table} reported an existing row, but no row matches its natural key")]
    Vanished { table: &'static str },

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Invalid configuration values
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {reason}")]
    InvalidVar { var: &'static str, reason: String },

    #[error("Unknown text encoding label '{0}'")]
    UnknownEncoding(String),

    #[error("{0}")]
    Invalid(String),
}

/// Top-level error for a pipeline run
#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Export failed: {0}")]
    Export(String),
}

pub type Result<T> = std::result::Result<T, IngestError>;
