//! Application context: every client and component, built once at startup
//! and injected into the HTTP layer and the pipeline. No process-wide
//! singletons.

use crate::config::Config;
use crate::embedding::OllamaEmbedder;
use crate::error::Result;
use crate::indexer::Indexer;
use crate::job::JobStore;
use crate::pipeline::PipelineController;
use crate::search::SearchEngine;
use crate::store::{ChromaStore, MongoStore};
use serde::Serialize;
use std::sync::Arc;

/// Shared application state.
pub struct AppContext {
    pub config: Config,
    pub mongo: MongoStore,
    pub chroma: Arc<ChromaStore>,
    pub embedder: Arc<OllamaEmbedder>,
    pub jobs: JobStore,
    pub search: SearchEngine,
    pub pipeline: Arc<PipelineController>,
}

/// What a clear operation removed.
#[derive(Debug, Default, Serialize)]
pub struct ClearSummary {
    pub messages_deleted: u64,
    pub failed_imports_deleted: u64,
    pub jobs_deleted: u64,
    pub vectors_cleared: bool,
}

impl AppContext {
    /// Connect all clients and wire the components together.
    pub async fn initialise(config: Config) -> Result<Arc<Self>> {
        config.ensure_dirs().map_err(crate::error::Error::from)?;

        let mongo = MongoStore::connect(&config.mongo_url, &config.mongo_db).await?;
        let chroma = Arc::new(ChromaStore::new(config.chroma_url()));
        let embedder = Arc::new(OllamaEmbedder::new(
            config.ollama_url.clone(),
            config.embedding_model.clone(),
        ));
        let jobs = JobStore::new(mongo.database());

        let indexer = Indexer::new(
            mongo.clone(),
            Arc::clone(&chroma),
            Arc::clone(&embedder),
            jobs.clone(),
        );
        let search = SearchEngine::new(mongo.clone(), Arc::clone(&chroma), Arc::clone(&embedder));
        let pipeline = PipelineController::new(config.clone(), jobs.clone(), indexer);

        tracing::info!(
            mongo_db = %config.mongo_db,
            chroma = %config.chroma_url(),
            ollama = %config.ollama_url,
            data_dir = %config.data_dir.display(),
            "context initialised"
        );

        Ok(Arc::new(Self {
            config,
            mongo,
            chroma,
            embedder,
            jobs,
            search,
            pipeline,
        }))
    }

    /// Selective truncation. Clearing messages always clears the vector
    /// store in tandem to preserve the dual-write invariant; clearing
    /// uploads removes job records plus staged archives and extract trees.
    pub async fn clear(
        &self,
        messages: bool,
        uploads: bool,
        embeddings: bool,
    ) -> Result<ClearSummary> {
        let mut summary = ClearSummary::default();

        if messages {
            summary.messages_deleted = self.mongo.clear_messages().await?;
            summary.failed_imports_deleted = self.mongo.clear_failed_imports().await?;
            self.chroma.clear().await?;
            summary.vectors_cleared = true;
        }

        if embeddings && !summary.vectors_cleared {
            self.chroma.clear().await?;
            summary.vectors_cleared = true;
        }

        if uploads {
            summary.jobs_deleted = self.jobs.clear().await?;
            let uploads_dir = self.config.uploads_dir();
            let extracts_dir = self.config.data_dir.join("extracts");
            tokio::task::spawn_blocking(move || {
                remove_dir_contents(&uploads_dir);
                remove_dir_contents(&extracts_dir);
            })
            .await
            .map_err(|e| anyhow::anyhow!("clear task failed: {e}"))?;
        }

        tracing::info!(
            messages,
            uploads,
            embeddings,
            deleted = summary.messages_deleted,
            "clear finished"
        );
        Ok(summary)
    }

    /// Clear everything: documents, vectors, jobs, and on-disk artefacts.
    pub async fn clear_all(&self) -> Result<ClearSummary> {
        self.clear(true, true, true).await
    }
}

/// Best-effort removal of a directory's children; the directory itself
/// stays.
fn remove_dir_contents(dir: &std::path::Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let result = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        if let Err(error) = result {
            tracing::warn!(path = %path.display(), %error, "failed to remove artefact");
        }
    }
}
