// src/pipeline.rs

//! Batch orchestration: Extract → Transform → Load → (optional) report.
//!
//! Inputs are extracted (optionally several at a time), parsed and normalized
//! into one ordered batch, and that batch is loaded in a single transaction.
//! Per-input failures are handled by [`FailurePolicy`]; a load failure always
//! fails the batch.

use crate::config::{Config, StoreConfig};
use crate::error::{InputError, PipelineError};
use crate::extract::Extractor;
use crate::normalize::{CanonicalDocument, Normalizer};
use crate::report::{Reporter, generate_report};
use crate::response::{RawRecord, parse_object};
use crate::store::DocumentStore;
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{Instrument, error, info, info_span, warn};

/// What to do when one input cannot be extracted or parsed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Log it, leave it out of the batch and carry on.
    #[default]
    Skip,
    /// Fail the whole batch before anything is loaded.
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedInput {
    pub input: String,
    pub reason: String,
}

/// Canonical documents keyed by natural key, ready for loading.
#[derive(Debug, Clone, Default)]
pub struct TransformedBatch {
    pub documents: BTreeMap<String, CanonicalDocument>,
    pub skipped: Vec<SkippedInput>,
    pub defaulted_fields: usize,
}

#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub loaded: usize,
    pub skipped: Vec<SkippedInput>,
    pub defaulted_fields: usize,
    /// Where the report was written, when one was generated.
    pub report: Option<PathBuf>,
    pub report_error: Option<String>,
}

pub struct Pipeline<'a> {
    extractor: &'a dyn Extractor,
    normalizer: Normalizer,
    extension: String,
    on_input_error: FailurePolicy,
    concurrency: usize,
}

impl<'a> Pipeline<'a> {
    pub fn new(extractor: &'a dyn Extractor, config: &Config) -> Self {
        Self {
            extractor,
            normalizer: Normalizer::new(config.normalize.numeric_policy),
            extension: config.extract.extension.clone(),
            on_input_error: config.pipeline.on_input_error,
            concurrency: config.pipeline.concurrency.max(1),
        }
    }

    /// The store key for an input identifier, e.g. `000` → `000.jpg`.
    pub fn natural_key(&self, input: &str) -> String {
        format!("{input}.{}", self.extension)
    }

    async fn extract_one(&self, input: &str) -> Result<RawRecord, InputError> {
        let text = self.extractor.extract(input).await?;
        Ok(parse_object(&text)?)
    }

    /// Extract and normalize every input; nothing is written.
    pub async fn transform(&self, inputs: &[String]) -> Result<TransformedBatch, PipelineError> {
        let mut seen = HashSet::new();
        let unique: Vec<&String> = inputs.iter().filter(|i| seen.insert(i.as_str())).collect();
        info!(inputs = unique.len(), concurrency = self.concurrency, "Extracting batch");

        // `buffered` yields results in input order regardless of completion order.
        let results: Vec<(&String, Result<RawRecord, InputError>)> = stream::iter(unique)
            .map(|input| async move {
                let result = self
                    .extract_one(input)
                    .instrument(info_span!("extract", input = %input))
                    .await;
                (input, result)
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut batch = TransformedBatch::default();
        for (input, result) in results {
            match result {
                Ok(record) => {
                    let normalized = self.normalizer.document(input, &record);
                    let key = self.natural_key(input);
                    info!(
                        input = %input,
                        filename = %key,
                        document_id = %normalized.document.document_id,
                        line_items = normalized.document.line_items.len(),
                        defaulted = normalized.defaulted_fields,
                        "Document normalized"
                    );
                    batch.defaulted_fields += normalized.defaulted_fields;
                    batch.documents.insert(key, normalized.document);
                }
                Err(e) => match self.on_input_error {
                    FailurePolicy::Skip => {
                        warn!(input = %input, error = %e, "Skipping input");
                        batch.skipped.push(SkippedInput {
                            input: input.clone(),
                            reason: e.to_string(),
                        });
                    }
                    FailurePolicy::Abort => {
                        error!(input = %input, error = %e, "Input failed, aborting batch");
                        return Err(PipelineError::InputAborted {
                            input: input.clone(),
                            reason: e.to_string(),
                        });
                    }
                },
            }
        }

        Ok(batch)
    }

    /// Run one batch end to end.
    ///
    /// The store connection is acquired for the load only and released before
    /// the report (if any) reads the committed state on its own connection.
    pub async fn run(
        &self,
        inputs: &[String],
        store_config: &StoreConfig,
        report: Option<(&dyn Reporter, &Path)>,
    ) -> Result<BatchOutcome, PipelineError> {
        let batch = self.transform(inputs).await?;

        let loaded = {
            let mut store = DocumentStore::open(store_config)?;
            let loaded = store.load(&batch.documents)?;
            store.close()?;
            loaded
        };
        info!(
            loaded,
            skipped = batch.skipped.len(),
            defaulted = batch.defaulted_fields,
            "Data loaded! {loaded} documents processed."
        );

        let mut outcome = BatchOutcome {
            loaded,
            skipped: batch.skipped,
            defaulted_fields: batch.defaulted_fields,
            report: None,
            report_error: None,
        };

        if let Some((reporter, path)) = report {
            match generate_report(store_config, reporter, path).await {
                Ok(path) => outcome.report = Some(path),
                Err(e) => {
                    error!(error = %e, "Report generation failed; loaded data is unaffected");
                    outcome.report_error = Some(e.to_string());
                }
            }
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ExtractError, LlmError, ReportError};
    use crate::normalize::{LineItem, SENTINEL};
    use crate::store::Snapshot;
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use std::collections::HashMap;
    use std::str::FromStr;
    use std::sync::Mutex;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    /// Canned responses per input; inputs without one fail like a missing image.
    #[derive(Default)]
    struct FakeExtractor {
        responses: HashMap<String, String>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeExtractor {
        fn with(mut self, input: &str, response: &str) -> Self {
            self.responses.insert(input.to_string(), response.to_string());
            self
        }
    }

    #[async_trait]
    impl Extractor for FakeExtractor {
        async fn extract(&self, input: &str) -> Result<String, ExtractError> {
            self.calls.lock().unwrap().push(input.to_string());
            self.responses
                .get(input)
                .cloned()
                .ok_or_else(|| ExtractError::InputNotFound {
                    path: PathBuf::from(format!("inputs/{input}.jpg")),
                })
        }
    }

    struct FixedReporter(Result<&'static str, ()>);

    #[async_trait]
    impl Reporter for FixedReporter {
        async fn generate(&self, _snapshot: &Snapshot) -> Result<String, ReportError> {
            match self.0 {
                Ok(text) => Ok(text.to_string()),
                Err(()) => Err(ReportError::Llm(LlmError::EmptyResponse)),
            }
        }
    }

    /// Builds the real report prompt and returns it as the report text.
    struct PromptReporter;

    #[async_trait]
    impl Reporter for PromptReporter {
        async fn generate(&self, snapshot: &Snapshot) -> Result<String, ReportError> {
            crate::report::build_prompt(snapshot)
        }
    }

    fn inputs(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn temp_store() -> (tempfile::TempDir, StoreConfig) {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            db_path: dir.path().join("invoices.db"),
        };
        (dir, config)
    }

    const ACME: &str = r#"Here is the JSON: {"document_id":"INV-1","name":"Acme","line_items":[{"item":"Widget","qty":"2","price":"10,50"}]}"#;

    #[tokio::test]
    async fn test_end_to_end_with_one_failed_extraction() {
        let extractor = FakeExtractor::default().with("000", ACME);
        let config = Config::default();
        let (_dir, store_config) = temp_store();

        let outcome = Pipeline::new(&extractor, &config)
            .run(&inputs(&["000", "001"]), &store_config, None)
            .await
            .unwrap();

        assert_eq!(outcome.loaded, 1);
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(outcome.skipped[0].input, "001");
        assert!(outcome.skipped[0].reason.contains("001.jpg"));

        let store = DocumentStore::open(&store_config).unwrap();
        assert_eq!(store.counts().unwrap(), (1, 1));
        let stored = store.document("000.jpg").unwrap().unwrap();
        assert_eq!(stored.document.document_id, "INV-1");
        assert_eq!(stored.document.name, "Acme");
        assert_eq!(stored.document.description, SENTINEL);
        let item = &stored.line_items[0];
        assert_eq!(item.item, "Widget");
        assert_eq!(item.quantity, dec("2.0"));
        assert_eq!(item.unit_price, dec("10.5"));
        assert_eq!(item.total, dec("0.0"));
    }

    #[tokio::test]
    async fn test_persistence_failure_rolls_back_batch() {
        let extractor = FakeExtractor::default()
            .with("000", ACME)
            .with("001", r#"{"document_id":"INV-2","name":"Globex"}"#);
        let config = Config::default();
        let (_dir, store_config) = temp_store();

        {
            let store = DocumentStore::open(&store_config).unwrap();
            store
                .connection()
                .execute_batch(
                    "CREATE TRIGGER reject_001 BEFORE INSERT ON documents
                     WHEN NEW.filename = '001.jpg'
                     BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
                )
                .unwrap();
        }

        let result = Pipeline::new(&extractor, &config)
            .run(&inputs(&["000", "001"]), &store_config, None)
            .await;

        assert!(matches!(result, Err(PipelineError::Store(_))));
        let store = DocumentStore::open(&store_config).unwrap();
        assert_eq!(store.counts().unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn test_abort_policy_loads_nothing() {
        let extractor = FakeExtractor::default().with("000", ACME);
        let mut config = Config::default();
        config.pipeline.on_input_error = FailurePolicy::Abort;
        let (_dir, store_config) = temp_store();

        let result = Pipeline::new(&extractor, &config)
            .run(&inputs(&["000", "001"]), &store_config, None)
            .await;

        assert!(matches!(
            result,
            Err(PipelineError::InputAborted { ref input, .. }) if input == "001"
        ));
        assert!(!store_config.db_path.exists());
    }

    #[tokio::test]
    async fn test_unparseable_responses_are_skipped() {
        let extractor = FakeExtractor::default()
            .with("000", "Sorry, I cannot read this image.")
            .with("001", "{\"document_id\": INV-2}")
            .with("002", "{\"document_id\": \"INV-3\"");
        let batch = Pipeline::new(&extractor, &Config::default())
            .transform(&inputs(&["000", "001", "002"]))
            .await
            .unwrap();

        assert!(batch.documents.is_empty());
        let reasons: Vec<&str> = batch.skipped.iter().map(|s| s.reason.as_str()).collect();
        assert!(reasons[0].contains("no balanced JSON object"));
        assert!(reasons[1].contains("malformed"));
        assert!(reasons[2].contains("no balanced JSON object"));
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let extractor = FakeExtractor::default().with("000", ACME);
        let config = Config::default();
        let (_dir, store_config) = temp_store();
        let pipeline = Pipeline::new(&extractor, &config);

        for _ in 0..3 {
            pipeline
                .run(&inputs(&["000"]), &store_config, None)
                .await
                .unwrap();
        }

        let store = DocumentStore::open(&store_config).unwrap();
        assert_eq!(store.counts().unwrap(), (1, 1));
    }

    #[tokio::test]
    async fn test_duplicate_inputs_extracted_once() {
        let extractor = FakeExtractor::default().with("000", ACME);
        let batch = Pipeline::new(&extractor, &Config::default())
            .transform(&inputs(&["000", "000"]))
            .await
            .unwrap();

        assert_eq!(batch.documents.len(), 1);
        assert_eq!(extractor.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_extraction_is_deterministic() {
        let mut extractor = FakeExtractor::default();
        let names: Vec<String> = (0..12).map(|i| format!("{i:03}")).collect();
        for name in &names {
            extractor = extractor.with(
                name,
                &format!(r#"{{"id": "INV-{name}", "items": [{{"name": "Part", "quantity": 1, "amount": "5"}}]}}"#),
            );
        }
        let mut config = Config::default();
        config.pipeline.concurrency = 4;
        config.extract.extension = "png".into();

        let batch = Pipeline::new(&extractor, &config)
            .transform(&names)
            .await
            .unwrap();

        let keys: Vec<&String> = batch.documents.keys().collect();
        assert_eq!(keys.len(), 12);
        assert_eq!(keys[0], "000.png");
        assert_eq!(keys[11], "011.png");
        assert_eq!(
            batch.documents["007.png"].line_items,
            vec![LineItem {
                item: "Part".into(),
                quantity: dec("1"),
                unit_price: Decimal::ZERO,
                total: dec("5"),
            }]
        );
    }

    #[tokio::test]
    async fn test_report_written_after_load() {
        let extractor = FakeExtractor::default().with("000", ACME);
        let (dir, store_config) = temp_store();
        let report_path = dir.path().join("reports/report.tex");
        let reporter = FixedReporter(Ok("\\section{Executive Report}"));
        let report: (&dyn Reporter, &Path) = (&reporter, &report_path);

        let outcome = Pipeline::new(&extractor, &Config::default())
            .run(&inputs(&["000"]), &store_config, Some(report))
            .await
            .unwrap();

        assert_eq!(outcome.report.as_deref(), Some(report_path.as_path()));
        assert_eq!(
            std::fs::read_to_string(&report_path).unwrap(),
            "\\section{Executive Report}"
        );
    }

    #[tokio::test]
    async fn test_report_failure_keeps_loaded_batch() {
        let extractor = FakeExtractor::default().with("000", ACME);
        let (dir, store_config) = temp_store();
        let report_path = dir.path().join("report.tex");
        let reporter = FixedReporter(Err(()));
        let report: (&dyn Reporter, &Path) = (&reporter, &report_path);

        let outcome = Pipeline::new(&extractor, &Config::default())
            .run(&inputs(&["000"]), &store_config, Some(report))
            .await
            .unwrap();

        assert_eq!(outcome.loaded, 1);
        assert!(outcome.report.is_none());
        assert!(outcome.report_error.unwrap().contains("empty response"));
        assert!(!report_path.exists());
    }

    #[tokio::test]
    async fn test_report_overflow_is_recorded_not_fatal() {
        let huge = r#"{"document_id":"INV-9","name":"Big","line_items":[
            {"item":"A","total":"79228162514264337593543950335"},
            {"item":"B","total":"79228162514264337593543950335"}]}"#;
        let extractor = FakeExtractor::default().with("000", huge);
        let (dir, store_config) = temp_store();
        let report_path = dir.path().join("report.tex");
        let report: (&dyn Reporter, &Path) = (&PromptReporter, &report_path);

        let outcome = Pipeline::new(&extractor, &Config::default())
            .run(&inputs(&["000"]), &store_config, Some(report))
            .await
            .unwrap();

        assert_eq!(outcome.loaded, 1);
        assert!(outcome.report.is_none());
        assert!(outcome.report_error.unwrap().contains("decimal range"));
        assert!(!report_path.exists());
    }
}
