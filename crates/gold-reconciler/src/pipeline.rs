//! Extraction pipeline
//!
//! Document → extractor → extraction log → reconciliation. Every extractor
//! output is logged before reconciliation is attempted, so the Bronze layer
//! keeps it even when the Gold entity is locked.

use std::sync::Arc;

use tracing::info;

use gold_core::{EntityKind, NewExtractionLog, Result};

use crate::batch::{BatchReconciler, BatchReport};
use crate::extractor::{FieldExtractor, SourceDocument};

/// Runs extraction and reconciliation end to end
pub struct ExtractionPipeline {
    extractor: Arc<dyn FieldExtractor>,
    batch: BatchReconciler,
    pipeline_version: String,
}

impl ExtractionPipeline {
    pub fn new(
        extractor: Arc<dyn FieldExtractor>,
        batch: BatchReconciler,
        pipeline_version: impl Into<String>,
    ) -> Self {
        Self {
            extractor,
            batch,
            pipeline_version: pipeline_version.into(),
        }
    }

    /// Extract `kind` records from `document`, log them and reconcile them
    pub async fn ingest(&self, kind: EntityKind, document: &SourceDocument) -> Result<BatchReport> {
        let outputs = self.extractor.extract(kind, document).await?;
        info!(
            document = %document.id,
            kind = %kind,
            extractor = self.extractor.name(),
            records = outputs.len(),
            "Extraction finished"
        );

        let logs = outputs
            .into_iter()
            .map(|output| {
                let mut log = output.into_log(kind, &document.id, &self.pipeline_version);
                if log.model_name.is_none() {
                    log.model_name = Some(self.extractor.name().to_string());
                }
                log
            })
            .collect();
        Ok(self.submit(logs).await)
    }

    /// Append externally produced extraction records and reconcile them.
    ///
    /// Records without a pipeline label get this pipeline's label.
    pub async fn submit(&self, logs: Vec<NewExtractionLog>) -> BatchReport {
        let logs = logs
            .into_iter()
            .map(|log| log.with_default_pipeline_version(&self.pipeline_version))
            .collect();
        self.batch.submit(logs).await
    }
}
