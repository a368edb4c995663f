//! Pipeline driver
//!
//! Reads every configured source and feeds it to the [`Loader`] in a fixed
//! order: the registry first, then the indicator files in catalog order.
//! One [`ResolverSet`] serves the whole run. A source that cannot be read is
//! reported and skipped; every other source still loads.

use serde::Serialize;
use std::path::PathBuf;
use tracing::{error, info, instrument};

use crate::config::{IndicatorSource, IngestConfig};
use crate::entities::MetricKind;
use crate::loader::{Loader, StepReport};
use crate::records::{IndicatorRow, RegistryRow};
use crate::resolver::ResolverSet;
use crate::source::SourceReader;
use crate::store::Repository;

#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    pub skip_registry: bool,
    /// Restrict indicator sources; empty means all of them
    pub metrics: Vec<MetricKind>,
}

impl PipelineOptions {
    fn includes(&self, metric: MetricKind) -> bool {
        self.metrics.is_empty() || self.metrics.contains(&metric)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "error", rename_all = "snake_case")]
pub enum SourceStatus {
    Loaded,
    Unreadable(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub source: String,
    pub path: PathBuf,
    pub encoding: Option<&'static str>,
    pub rows: usize,
    pub status: SourceStatus,
    pub steps: Vec<StepReport>,
}

impl SourceReport {
    pub fn is_failed(&self) -> bool {
        matches!(self.status, SourceStatus::Unreadable(_)) || self.steps.iter().any(StepReport::is_failed)
    }

    fn unreadable(source: String, path: PathBuf, reason: String) -> Self {
        Self {
            source,
            path,
            encoding: None,
            rows: 0,
            status: SourceStatus::Unreadable(reason),
            steps: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub sources: Vec<SourceReport>,
}

impl RunSummary {
    pub fn has_failures(&self) -> bool {
        self.sources.iter().any(SourceReport::is_failed)
    }

    pub fn steps(&self) -> impl Iterator<Item = &StepReport> {
        self.sources.iter().flat_map(|s| s.steps.iter())
    }

    pub fn total_inserted(&self) -> usize {
        self.steps().map(|s| s.counts.inserted).sum()
    }

    pub fn total_skipped(&self) -> usize {
        self.steps().map(|s| s.counts.skipped()).sum()
    }
}

pub struct Pipeline<'a, R: Repository> {
    config: &'a IngestConfig,
    repo: &'a R,
}

impl<'a, R: Repository> Pipeline<'a, R> {
    pub fn new(config: &'a IngestConfig, repo: &'a R) -> Self {
        Self { config, repo }
    }

    #[instrument(skip_all)]
    pub async fn run(&self, options: &PipelineOptions) -> RunSummary {
        let mut resolvers = ResolverSet::new();
        let mut loader = Loader::new(self.repo, &mut resolvers);
        let mut summary = RunSummary::default();

        if options.skip_registry {
            info!("Registry skipped");
        } else {
            summary.sources.push(self.load_registry(&mut loader).await);
        }

        for source in self.config.indicators.iter().filter(|s| options.includes(s.metric)) {
            summary.sources.push(self.load_indicator(&mut loader, source).await);
        }

        info!(
            sources = summary.sources.len(),
            inserted = summary.total_inserted(),
            skipped = summary.total_skipped(),
            failed = summary.has_failures(),
            "Pipeline run finished"
        );
        summary
    }

    async fn load_registry(&self, loader: &mut Loader<'_, R>) -> SourceReport {
        let registry = &self.config.registry;
        let label = "registry".to_string();

        let reader = SourceReader::new(registry.delimiter, self.config.encodings.clone());
        let table = match reader.read_path(&registry.file, &RegistryRow::projection()) {
            Ok(table) => table,
            Err(e) => {
                error!(source = %label, path = %registry.file.display(), error = %e, "Source unreadable");
                return SourceReport::unreadable(label, registry.file.clone(), e.to_string());
            },
        };

        let rows: Vec<RegistryRow> = table.rows.iter().map(|raw| RegistryRow::from_raw(raw)).collect();
        info!(source = %label, rows = rows.len(), encoding = table.encoding, "Loading registry");
        let steps = loader.load_registry(&rows, &registry.country).await;

        SourceReport {
            source: label,
            path: registry.file.clone(),
            encoding: Some(table.encoding),
            rows: rows.len(),
            status: SourceStatus::Loaded,
            steps,
        }
    }

    async fn load_indicator(&self, loader: &mut Loader<'_, R>, source: &IndicatorSource) -> SourceReport {
        let label = source.metric.to_string();

        let reader = SourceReader::new(source.delimiter, self.config.encodings.clone());
        let projection = IndicatorRow::projection(source.value_column.clone());
        let table = match reader.read_path(&source.file, &projection) {
            Ok(table) => table,
            Err(e) => {
                error!(source = %label, path = %source.file.display(), error = %e, "Source unreadable");
                return SourceReport::unreadable(label, source.file.clone(), e.to_string());
            },
        };

        let rows: Vec<IndicatorRow> = table.rows.iter().map(|raw| IndicatorRow::from_raw(raw)).collect();
        info!(source = %label, rows = rows.len(), encoding = table.encoding, "Loading indicator");
        let steps = loader.load_indicator(source.metric, &rows).await;

        SourceReport {
            source: label,
            path: source.file.clone(),
            encoding: Some(table.encoding),
            rows: rows.len(),
            status: SourceStatus::Loaded,
            steps,
        }
    }
}
