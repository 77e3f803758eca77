//! Pipeline controller: sequences extraction, import, and training for a
//! job, updating the job store and honouring cancel requests.
//!
//! One background worker per job, gated by a CPU-count semaphore so
//! multiple jobs can advance concurrently without unbounded parallelism.
//! Cancellation is cooperative: every stage polls the job's flag between
//! units of work. The controller never deletes the extract tree; the clear
//! operations own artefact removal.

use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::extract::{Extraction, extract_archive, extract_tree_is_usable};
use crate::indexer::{Indexer, PhaseOutcome};
use crate::job::{JobStatus, JobStore};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{RwLock, Semaphore};

/// How a `start` request enters the pipeline.
#[derive(Debug, PartialEq, Eq)]
enum StartPlan {
    /// A usable extract tree exists; skip straight to import.
    ResumeImport(PathBuf),
    /// Extract the archive first.
    ExtractFirst,
    /// Neither a usable tree nor the archive exists.
    Unrunnable,
}

/// Decide how to start, given what is on disk.
fn plan_start(extract_path: Option<&Path>, tree_usable: bool, archive_exists: bool) -> StartPlan {
    match extract_path {
        Some(path) if tree_usable => StartPlan::ResumeImport(path.to_path_buf()),
        _ if archive_exists => StartPlan::ExtractFirst,
        _ => StartPlan::Unrunnable,
    }
}

/// Drives jobs through the ingestion state machine.
pub struct PipelineController {
    config: Config,
    jobs: JobStore,
    indexer: Indexer,
    /// Per-job cancel flags, present while a worker is running.
    cancel_flags: RwLock<HashMap<String, Arc<AtomicBool>>>,
    /// Jobs with a live worker; guards double starts.
    active: RwLock<HashSet<String>>,
    /// Bounds concurrently advancing jobs.
    semaphore: Arc<Semaphore>,
}

impl PipelineController {
    pub fn new(config: Config, jobs: JobStore, indexer: Indexer) -> Arc<Self> {
        let pool_size = config.worker_pool_size.max(1);
        Arc::new(Self {
            config,
            jobs,
            indexer,
            cancel_flags: RwLock::new(HashMap::new()),
            active: RwLock::new(HashSet::new()),
            semaphore: Arc::new(Semaphore::new(pool_size)),
        })
    }

    /// Enqueue a pipeline run for a job in UPLOADED, ERROR, or CANCELLED.
    pub async fn start(self: &Arc<Self>, job_id: &str) -> Result<()> {
        let job = self.jobs.require(job_id).await?;
        if !job.status.is_startable() {
            return Err(PipelineError::InvalidTransition {
                from: job.status.to_string(),
                to: JobStatus::Extracting.to_string(),
            }
            .into());
        }

        {
            let mut active = self.active.write().await;
            if !active.insert(job_id.to_string()) {
                return Err(PipelineError::AlreadyRunning(job_id.to_string()).into());
            }
        }

        let cancel = Arc::new(AtomicBool::new(false));
        self.cancel_flags
            .write()
            .await
            .insert(job_id.to_string(), Arc::clone(&cancel));

        let controller = Arc::clone(self);
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            let _permit = controller.semaphore.clone().acquire_owned().await;
            tracing::info!(job_id = %job_id, "pipeline worker started");

            if let Err(error) = controller.execute(&job_id, &cancel).await {
                tracing::error!(%error, job_id = %job_id, "pipeline stage failed");
                if let Err(store_error) =
                    controller.jobs.record_error(&job_id, &error.to_string()).await
                {
                    tracing::error!(
                        error = %store_error,
                        job_id = %job_id,
                        "failed to record job error"
                    );
                }
            }

            controller.cleanup(&job_id).await;
            tracing::info!(job_id = %job_id, "pipeline worker finished");
        });

        Ok(())
    }

    /// Request cancellation. The running worker observes the flag at its
    /// next check-point; a job with no live worker but an active status is
    /// moved to CANCELLED directly.
    pub async fn cancel(&self, job_id: &str) -> Result<()> {
        let job = self.jobs.require(job_id).await?;
        if let Some(flag) = self.cancel_flags.read().await.get(job_id) {
            flag.store(true, Ordering::Relaxed);
            tracing::info!(job_id = %job_id, "cancel requested");
            return Ok(());
        }
        if job.status.is_active() {
            // Stale active status from an earlier process; no worker to stop.
            self.jobs.record_cancel(job_id).await?;
        }
        Ok(())
    }

    /// Whether a worker is currently running this job.
    pub async fn is_running(&self, job_id: &str) -> bool {
        self.active.read().await.contains(job_id)
    }

    async fn cleanup(&self, job_id: &str) {
        self.cancel_flags.write().await.remove(job_id);
        self.active.write().await.remove(job_id);
    }

    async fn execute(&self, job_id: &str, cancel: &Arc<AtomicBool>) -> Result<()> {
        let job = self.jobs.require(job_id).await?;

        let extract_path = job.extract_path.as_deref().map(Path::new);
        let tree_usable = extract_path.is_some_and(extract_tree_is_usable);
        let archive_exists = Path::new(&job.archive_path).is_file();

        let extract_root = match plan_start(extract_path, tree_usable, archive_exists) {
            StartPlan::ResumeImport(path) => {
                tracing::info!(job_id = %job_id, extract_root = %path.display(), "resuming from extract tree");
                self.jobs
                    .advance(job_id, JobStatus::Importing, "Resuming import", 0)
                    .await?;
                path
            }
            StartPlan::ExtractFirst => {
                self.jobs
                    .advance(job_id, JobStatus::Extracting, "Starting extraction", 0)
                    .await?;
                match self.extract_stage(&job.id, &job.archive_path, cancel).await? {
                    Some(path) => {
                        self.jobs
                            .advance(job_id, JobStatus::Importing, "Starting import", 0)
                            .await?;
                        path
                    }
                    None => {
                        self.jobs.record_cancel(job_id).await?;
                        return Ok(());
                    }
                }
            }
            StartPlan::Unrunnable => {
                return Err(match extract_path {
                    Some(path) => PipelineError::MissingExtractDir(path.to_path_buf()).into(),
                    None => PipelineError::MissingArchive(job_id.to_string()).into(),
                });
            }
        };

        match self.indexer.run_import(job_id, &extract_root, cancel).await? {
            PhaseOutcome::Completed => {
                self.jobs
                    .advance(job_id, JobStatus::Imported, "Import complete", 100)
                    .await?;
            }
            PhaseOutcome::Cancelled => {
                self.jobs.record_cancel(job_id).await?;
                return Ok(());
            }
        }

        self.jobs
            .advance(job_id, JobStatus::Training, "Starting training", 0)
            .await?;
        match self.indexer.run_training(job_id, cancel).await? {
            PhaseOutcome::Completed => {
                self.jobs
                    .advance(job_id, JobStatus::Complete, "Ingestion complete", 100)
                    .await?;
            }
            PhaseOutcome::Cancelled => {
                self.jobs.record_cancel(job_id).await?;
            }
        }

        Ok(())
    }

    /// Run extraction under `spawn_blocking`, forwarding progress into the
    /// job store. Returns the extract root, or None when cancelled.
    async fn extract_stage(
        &self,
        job_id: &str,
        archive_path: &str,
        cancel: &Arc<AtomicBool>,
    ) -> Result<Option<PathBuf>> {
        let archive = PathBuf::from(archive_path);
        let extract_root = self.config.extract_dir(job_id);

        let (progress_tx, mut progress_rx) = tokio::sync::mpsc::channel(16);
        let task_cancel = Arc::clone(cancel);
        let task_archive = archive.clone();
        let task_root = extract_root.clone();
        let handle = tokio::task::spawn_blocking(move || {
            extract_archive(&task_archive, &task_root, &task_cancel, |progress| {
                let _ = progress_tx.blocking_send(progress);
            })
        });

        while let Some(progress) = progress_rx.recv().await {
            self.jobs
                .advance(
                    job_id,
                    JobStatus::Extracting,
                    &format!(
                        "Extracting files... {}/{}",
                        progress.files_done, progress.files_total
                    ),
                    progress.percent,
                )
                .await?;
        }

        let extraction = handle
            .await
            .map_err(|e| anyhow::anyhow!("extraction task failed: {e}"))??;

        match extraction {
            Extraction::Completed(outcome) => {
                self.jobs.set_extract_path(job_id, &outcome.extract_root).await?;
                self.jobs
                    .advance(job_id, JobStatus::Extracted, "Extraction complete", 100)
                    .await?;
                Ok(Some(outcome.extract_root))
            }
            Extraction::Cancelled { .. } => Ok(None),
        }
    }
}
