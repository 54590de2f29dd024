use chrono::Utc;

use crate::error::AppError;
use crate::job::{ScrapeJob, UrlOutcome};
use crate::models::{ExtractionSchema, Record, compute_hash};
use crate::schema::SchemaResolver;
use crate::traits::{Exporter, Extractor, JobHandler};

/// Job handler running the extract → hash → export pipeline over the pages
/// of a successful run.
///
/// Generic over the extractor and exporter so tests can inject mocks.
#[derive(Clone)]
pub struct ExtractExportHandler<X: Extractor, P: Exporter> {
    extractor: X,
    exporter: P,
    resolver: SchemaResolver,
    default_destination: Option<String>,
}

impl<X: Extractor, P: Exporter> ExtractExportHandler<X, P> {
    pub fn new(extractor: X, exporter: P, resolver: SchemaResolver) -> Self {
        Self {
            extractor,
            exporter,
            resolver,
            default_destination: None,
        }
    }

    /// Destination used for jobs without an `exporter_ref`.
    pub fn with_default_destination(mut self, destination: impl Into<String>) -> Self {
        self.default_destination = Some(destination.into());
        self
    }

    /// Turn fetched pages into records. Without a schema, records carry
    /// only page metadata.
    pub fn build_records(
        &self,
        schema: Option<&ExtractionSchema>,
        pages: &[UrlOutcome],
    ) -> Result<Vec<Record>, AppError> {
        let scraped_at = Utc::now();
        pages
            .iter()
            .filter_map(|outcome| outcome.result.success().map(|page| (outcome, page)))
            .map(|(outcome, page)| {
                let fields = match schema {
                    Some(schema) => self.extractor.extract(&page.body, &page.final_url, schema)?,
                    None => serde_json::Map::new(),
                };
                Ok(Record {
                    url: outcome.url.clone(),
                    fields,
                    content_hash: compute_hash(&page.body),
                    scraped_at,
                })
            })
            .collect()
    }
}

impl<X: Extractor, P: Exporter> JobHandler for ExtractExportHandler<X, P> {
    async fn handle(&self, job: &ScrapeJob, pages: &[UrlOutcome]) -> Result<(), AppError> {
        let schema = match &job.schema_ref {
            Some(schema_ref) => Some(self.resolver.resolve(schema_ref)?),
            None => None,
        };

        let records = self.build_records(schema.as_ref(), pages)?;
        tracing::debug!(job = %job.name, records = records.len(), "Extraction complete");

        let Some(destination) = job
            .exporter_ref
            .as_deref()
            .or(self.default_destination.as_deref())
        else {
            tracing::info!(job = %job.name, "No exporter configured, records discarded");
            return Ok(());
        };

        self.exporter.export(&records, destination).await?;
        tracing::info!(
            job = %job.name,
            records = records.len(),
            destination,
            "Records exported"
        );
        Ok(())
    }
}
