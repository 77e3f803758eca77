//! Persists parser output into the document store and, in the training
//! phase, publishes vector embeddings.
//!
//! Both phases check the job's cancel flag between batches and report
//! progress through the job store after every batch. Per-unit failures
//! become failed-import records and never halt the job.

use crate::embedding::OllamaEmbedder;
use crate::error::{EmbeddingError, Error, Result};
use crate::job::{JobStatus, JobStore};
use crate::parser::{ExportScanner, FailedLine, ParsedFile, ParsedMessage};
use crate::store::{
    ChromaStore, MongoStore, StoredConversation, StoredMessage, VectorMetadata, VectorRecord,
    accumulate_user_activity, from_bson_datetime, snippet,
};
use futures::TryStreamExt as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Messages per document-store insert batch.
const IMPORT_BATCH: usize = 500;
/// Messages per embedding round; bounds peak memory during training.
const TRAINING_BATCH: usize = 64;
/// Retry budget for transient store failures.
const STORE_ATTEMPTS: u32 = 5;

/// Retry a store operation on transient failures with exponential backoff
/// (base 500 ms, cap 16 s). Non-transient errors escalate immediately.
async fn with_store_retries<T, F, Fut>(operation: &str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match call().await {
            Ok(value) => return Ok(value),
            Err(Error::Store(error)) if error.is_transient() && attempt < STORE_ATTEMPTS => {
                let delay = std::time::Duration::from_millis(500)
                    .saturating_mul(2u32.saturating_pow(attempt - 1))
                    .min(std::time::Duration::from_secs(16));
                tracing::warn!(
                    operation,
                    attempt,
                    %error,
                    "transient store failure, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(error) => return Err(error),
        }
    }
}

/// How a phase ended.
#[derive(Debug, PartialEq, Eq)]
pub enum PhaseOutcome {
    Completed,
    Cancelled,
}

/// Import and training executor.
#[derive(Clone)]
pub struct Indexer {
    mongo: MongoStore,
    chroma: Arc<ChromaStore>,
    embedder: Arc<OllamaEmbedder>,
    jobs: JobStore,
}

impl Indexer {
    pub fn new(
        mongo: MongoStore,
        chroma: Arc<ChromaStore>,
        embedder: Arc<OllamaEmbedder>,
        jobs: JobStore,
    ) -> Self {
        Self {
            mongo,
            chroma,
            embedder,
            jobs,
        }
    }

    /// Import phase: extract tree -> document store.
    pub async fn run_import(
        &self,
        job_id: &str,
        extract_root: &Path,
        cancel: &AtomicBool,
    ) -> Result<PhaseOutcome> {
        self.mongo.ensure_indexes().await?;

        let scanner = Arc::new(open_scanner(extract_root).await?);
        let total = {
            let scanner = Arc::clone(&scanner);
            tokio::task::spawn_blocking(move || scanner.count_messages())
                .await
                .map_err(|e| anyhow::anyhow!("count task failed: {e}"))?
        };

        tracing::info!(job_id = %job_id, total, "import started");
        let mut processed = 0usize;

        for path in scanner.conversation_files() {
            if cancel.load(Ordering::Relaxed) {
                return Ok(PhaseOutcome::Cancelled);
            }

            let parsed = {
                let scanner = Arc::clone(&scanner);
                let path = path.clone();
                tokio::task::spawn_blocking(move || scanner.parse_file(&path))
                    .await
                    .map_err(|e| anyhow::anyhow!("parse task failed: {e}"))?
            };

            match self
                .import_file(job_id, parsed, cancel, &mut processed, total)
                .await?
            {
                PhaseOutcome::Completed => {}
                PhaseOutcome::Cancelled => return Ok(PhaseOutcome::Cancelled),
            }
        }

        tracing::info!(job_id = %job_id, processed, "import finished");
        Ok(PhaseOutcome::Completed)
    }

    async fn import_file(
        &self,
        job_id: &str,
        parsed: ParsedFile,
        cancel: &AtomicBool,
        processed: &mut usize,
        total: usize,
    ) -> Result<PhaseOutcome> {
        self.mongo
            .record_failed_imports(job_id, &parsed.failures)
            .await?;

        let Some(conversation) = &parsed.conversation else {
            if !parsed.messages.is_empty() {
                // Without Channel ID and Type there is no conversation to
                // attach the messages to.
                self.mongo
                    .record_failed_import(
                        job_id,
                        &FailedLine {
                            file_path: parsed.path.clone(),
                            line_number: -1,
                            error: format!(
                                "missing Channel ID/Type header; {} messages skipped",
                                parsed.messages.len()
                            ),
                        },
                    )
                    .await?;
            }
            return Ok(PhaseOutcome::Completed);
        };

        self.mongo
            .upsert_conversation(&StoredConversation::from_parsed(conversation))
            .await?;

        for message in &parsed.messages {
            for file_ref in &message.files {
                if !file_ref.id.is_empty() {
                    self.mongo.upsert_file(&file_ref.into()).await?;
                }
            }
        }

        for batch in parsed.messages.chunks(IMPORT_BATCH) {
            if cancel.load(Ordering::Relaxed) {
                return Ok(PhaseOutcome::Cancelled);
            }

            let stored: Vec<StoredMessage> =
                batch.iter().map(StoredMessage::from_parsed).collect();
            let inserted =
                with_store_retries("insert messages", || self.mongo.insert_messages(&stored))
                    .await?;

            let refs: Vec<&ParsedMessage> = batch.iter().collect();
            for activity in accumulate_user_activity(&refs) {
                self.mongo.upsert_user_activity(&activity).await?;
            }

            *processed += batch.len();
            tracing::debug!(
                job_id = %job_id,
                inserted,
                skipped = batch.len() - inserted,
                "message batch written"
            );
            self.jobs
                .advance(
                    job_id,
                    JobStatus::Importing,
                    &format!("Imported {processed} of {total} messages"),
                    percent(*processed, total),
                )
                .await?;
        }

        Ok(PhaseOutcome::Completed)
    }

    /// Training phase: document store -> embeddings -> vector store.
    pub async fn run_training(&self, job_id: &str, cancel: &AtomicBool) -> Result<PhaseOutcome> {
        let total = self.mongo.message_count().await? as usize;
        tracing::info!(job_id = %job_id, total, "training started");

        let mut cursor = self.mongo.stream_messages_for_training().await?;
        let mut batch: Vec<StoredMessage> = Vec::with_capacity(TRAINING_BATCH);
        let mut trained = 0usize;

        loop {
            let next = cursor.try_next().await.map_err(crate::error::StoreError::from)?;
            if let Some(message) = next {
                batch.push(message);
                if batch.len() < TRAINING_BATCH {
                    continue;
                }
            } else if batch.is_empty() {
                break;
            }

            if cancel.load(Ordering::Relaxed) {
                return Ok(PhaseOutcome::Cancelled);
            }

            let size = batch.len();
            self.train_batch(job_id, std::mem::take(&mut batch)).await?;
            trained += size;
            self.jobs
                .advance(
                    job_id,
                    JobStatus::Training,
                    &format!("Trained {trained} of {total} messages"),
                    percent(trained, total),
                )
                .await?;
        }

        self.cull_orphan_vectors().await?;
        tracing::info!(job_id = %job_id, trained, "training finished");
        Ok(PhaseOutcome::Completed)
    }

    /// Embed one batch and upsert it. A permanent embedding failure is
    /// recorded and skipped; the job continues.
    async fn train_batch(&self, job_id: &str, batch: Vec<StoredMessage>) -> Result<()> {
        let prompts: Vec<String> = batch.iter().map(embedding_prompt).collect();
        let first_id = batch
            .first()
            .and_then(StoredMessage::vector_id)
            .unwrap_or_default();

        let embeddings = match self.embedder.embed_batch(&prompts).await {
            Ok(embeddings) => embeddings,
            Err(error @ (EmbeddingError::Permanent(_) | EmbeddingError::DimensionMismatch { .. })) => {
                tracing::warn!(job_id = %job_id, %error, "embedding batch failed permanently");
                self.mongo
                    .record_failed_import(
                        job_id,
                        &FailedLine {
                            file_path: PathBuf::from(format!("training:batch:{first_id}")),
                            line_number: -1,
                            error: error.to_string(),
                        },
                    )
                    .await?;
                return Ok(());
            }
            Err(error) => return Err(error.into()),
        };

        let records: Vec<VectorRecord> = batch
            .iter()
            .zip(embeddings)
            .filter_map(|(message, embedding)| {
                let id = message.vector_id()?;
                Some(VectorRecord {
                    id,
                    embedding,
                    metadata: VectorMetadata {
                        conversation_id: message.conversation_id.clone(),
                        username: message.username.clone().unwrap_or_default(),
                        ts: from_bson_datetime(message.ts).to_rfc3339(),
                        text: snippet(&message.text),
                    },
                })
            })
            .collect();

        with_store_retries("vector upsert", || self.upsert_vectors(&records)).await
    }

    async fn upsert_vectors(&self, records: &[VectorRecord]) -> Result<()> {
        self.chroma.upsert(records).await.map_err(Error::from)
    }

    /// Remove vector records whose message no longer exists.
    async fn cull_orphan_vectors(&self) -> Result<()> {
        let vector_ids = self.chroma.list_ids().await?;
        if vector_ids.is_empty() {
            return Ok(());
        }
        let message_ids = self.mongo.all_message_ids().await?;
        let orphans: Vec<String> = vector_ids
            .into_iter()
            .filter(|id| !message_ids.contains(id))
            .collect();
        if !orphans.is_empty() {
            tracing::info!(count = orphans.len(), "culling orphan vectors");
            self.chroma.delete_ids(&orphans).await?;
        }
        Ok(())
    }
}

async fn open_scanner(extract_root: &Path) -> Result<ExportScanner> {
    let extract_root = extract_root.to_path_buf();
    tokio::task::spawn_blocking(move || ExportScanner::open(&extract_root))
        .await
        .map_err(|e| anyhow::anyhow!("scan task failed: {e}"))?
}

/// Integer-rounded percent, saturating at 100.
fn percent(done: usize, total: usize) -> i32 {
    if total == 0 {
        return 100;
    }
    (((done * 100 + total / 2) / total).min(100)) as i32
}

/// What gets embedded for a message. Empty-text messages (bare file shares,
/// system lines) still need a vector so the stores stay in lock-step.
fn embedding_prompt(message: &StoredMessage) -> String {
    if !message.text.trim().is_empty() {
        return message.text.clone();
    }
    let mut parts = vec![message.kind.clone()];
    if let Some(username) = &message.username {
        parts.push(username.clone());
    }
    for file in &message.files {
        if !file.name.is_empty() {
            parts.push(file.name.clone());
        }
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::MessageKind;
    use crate::store::to_bson_datetime;
    use chrono::{TimeZone as _, Utc};
    use mongodb::bson;

    #[test]
    fn percent_rounds_and_saturates() {
        assert_eq!(percent(0, 10), 0);
        assert_eq!(percent(1, 3), 33);
        assert_eq!(percent(2, 3), 67);
        assert_eq!(percent(10, 10), 100);
        assert_eq!(percent(11, 10), 100);
        assert_eq!(percent(0, 0), 100);
    }

    #[test]
    fn embedding_prompt_prefers_text() {
        let ts = Utc.with_ymd_and_hms(2023, 6, 22, 15, 56, 54).unwrap();
        let mut parsed = ParsedMessage::new("C01", ts, 0, MessageKind::Message);
        parsed.username = Some("alice".into());
        parsed.text = "hello world".into();
        let stored = StoredMessage::from_parsed(&parsed);
        assert_eq!(embedding_prompt(&stored), "hello world");
    }

    #[test]
    fn embedding_prompt_falls_back_for_empty_text() {
        let ts = Utc.with_ymd_and_hms(2023, 6, 22, 15, 56, 54).unwrap();
        let mut parsed = ParsedMessage::new("C01", ts, 0, MessageKind::FileShare);
        parsed.username = Some("alice".into());
        parsed.files.push(crate::parser::FileRef {
            id: "F1".into(),
            name: "report.pdf".into(),
            mimetype: None,
            path: None,
        });
        let stored = StoredMessage::from_parsed(&parsed);
        assert_eq!(embedding_prompt(&stored), "file_share alice report.pdf");
    }

    #[test]
    fn vector_metadata_snapshots_the_envelope() {
        let ts = Utc.with_ymd_and_hms(2023, 6, 22, 15, 56, 54).unwrap();
        let mut parsed = ParsedMessage::new("C01", ts, 0, MessageKind::Message);
        parsed.username = Some("alice".into());
        parsed.text = "hello".into();
        let mut stored = StoredMessage::from_parsed(&parsed);
        stored.id = Some(bson::oid::ObjectId::new());
        assert!(stored.vector_id().is_some());
        assert_eq!(stored.ts, to_bson_datetime(ts));
    }
}
