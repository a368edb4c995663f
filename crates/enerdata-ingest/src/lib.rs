//! Enerdata Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Loads the national generation-capacity registry and a set of country-year
//! energy indicators into a normalized relational schema.
//!
//! # Overview
//!
//! - [`source`] decodes delimited files and projects their columns
//! - [`records`] and [`normalize`] turn raw tokens into typed rows
//! - [`resolver`] maps natural keys to surrogate ids, one cache per run
//! - [`loader`] writes entity kinds in dependency order, one transaction per
//!   step
//! - [`store`] is the repository interface with PostgreSQL and in-memory
//!   implementations
//!
//! # Example
//!
//! ```no_run
//! use enerdata_ingest::{IngestConfig, MemoryRepository, Pipeline, PipelineOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::from_env()?;
//!     let repo = MemoryRepository::new();
//!     let summary = Pipeline::new(&config, &repo).run(&PipelineOptions::default()).await;
//!     println!("{} rows inserted", summary.total_inserted());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod entities;
pub mod error;
pub mod export;
pub mod loader;
pub mod normalize;
pub mod pipeline;
pub mod records;
pub mod resolver;
pub mod schema;
pub mod source;
pub mod store;

pub use config::IngestConfig;
pub use entities::MetricKind;
pub use error::{IngestError, Result};
pub use loader::{CountrySeed, Loader, StepReport, StepStatus};
pub use pipeline::{Pipeline, PipelineOptions, RunSummary};
pub use resolver::ResolverSet;
pub use store::{MemoryRepository, PgRepository, Repository};
