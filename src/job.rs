//! Job lifecycle model and the store backing it.
//!
//! The `uploads` collection is the single source of truth for every
//! ingestion job. All status transitions are writes here; the HTTP layer
//! only ever reads.

use crate::error::{PipelineError, Result};
use futures::TryStreamExt as _;
use mongodb::bson::{self, doc};
use mongodb::{Collection, Database};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Lifecycle states. Serialized in canonical upper-case; lowercase variants
/// must never surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Uploading,
    Uploaded,
    Extracting,
    Extracted,
    Importing,
    Imported,
    Training,
    Complete,
    Error,
    Cancelled,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Uploading => "UPLOADING",
            Self::Uploaded => "UPLOADED",
            Self::Extracting => "EXTRACTING",
            Self::Extracted => "EXTRACTED",
            Self::Importing => "IMPORTING",
            Self::Imported => "IMPORTED",
            Self::Training => "TRAINING",
            Self::Complete => "COMPLETE",
            Self::Error => "ERROR",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

impl JobStatus {
    /// True while a worker may be advancing the job.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Extracting | Self::Extracted | Self::Importing | Self::Imported | Self::Training
        )
    }

    /// True for states a `start` request may run from.
    pub fn is_startable(&self) -> bool {
        matches!(self, Self::Uploaded | Self::Error | Self::Cancelled)
    }

    /// Whether the state machine permits `self -> to`.
    ///
    /// Same-state writes are progress bumps and are always permitted for
    /// active states.
    pub fn can_transition(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        if *self == to {
            return self.is_active();
        }
        match (*self, to) {
            (Uploading, Uploaded) => true,
            (Uploaded | Error | Cancelled, Extracting) => true,
            // Resume with an existing extract tree skips extraction.
            (Uploaded | Error | Cancelled, Importing) => true,
            (Extracting, Extracted) => true,
            (Extracted, Importing) => true,
            (Importing, Imported) => true,
            (Imported, Training) => true,
            (Training, Complete) => true,
            (from, Cancelled | Error) if from.is_active() => true,
            _ => false,
        }
    }

    /// The stage a status belongs to, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Extracting | Self::Extracted => Some(Stage::Extracting),
            Self::Importing | Self::Imported => Some(Stage::Importing),
            Self::Training => Some(Stage::Training),
            _ => None,
        }
    }

    /// Overall-progress window `(base, width)` for this status. Stages map
    /// onto disjoint slices of 0-100 so overall progress is monotone across
    /// the pipeline.
    fn progress_window(&self) -> (i32, i32) {
        match self {
            Self::Uploading | Self::Uploaded => (0, 0),
            Self::Extracting => (0, 30),
            Self::Extracted => (30, 0),
            Self::Importing => (30, 45),
            Self::Imported => (75, 0),
            Self::Training => (75, 25),
            Self::Complete => (100, 0),
            Self::Error | Self::Cancelled => (0, 0),
        }
    }
}

/// Named pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Extracting,
    Importing,
    Training,
}

/// One ingestion job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    #[serde(rename = "_id")]
    pub id: String,
    pub filename: String,
    pub size_bytes: i64,
    pub archive_path: String,
    /// Set once extraction finishes; preserved on ERROR and CANCELLED.
    pub extract_path: Option<String>,
    pub status: JobStatus,
    pub current_stage: Option<Stage>,
    /// 0-100 within the current stage.
    pub stage_progress: i32,
    /// Human-readable progress line.
    pub progress: String,
    /// 0-100 across the whole pipeline.
    pub progress_percent: i32,
    pub error: Option<String>,
    pub created_at: bson::DateTime,
    pub updated_at: bson::DateTime,
}

/// The status fields the UI polls.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusView {
    pub id: String,
    pub filename: String,
    pub status: JobStatus,
    pub current_stage: Option<Stage>,
    pub progress: String,
    pub progress_percent: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Job {
    pub fn status_view(&self) -> JobStatusView {
        JobStatusView {
            id: self.id.clone(),
            filename: self.filename.clone(),
            status: self.status,
            current_stage: self.current_stage,
            progress: self.progress.clone(),
            progress_percent: self.progress_percent,
            error: self.error.clone(),
            created_at: rfc3339(self.created_at),
            updated_at: rfc3339(self.updated_at),
        }
    }
}

fn rfc3339(datetime: bson::DateTime) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp_millis(datetime.timestamp_millis())
        .unwrap_or(chrono::DateTime::UNIX_EPOCH)
        .to_rfc3339()
}

/// Durable record of every job, backed by the `uploads` collection.
#[derive(Clone)]
pub struct JobStore {
    collection: Collection<Job>,
}

impl JobStore {
    pub fn new(database: &Database) -> Self {
        Self {
            collection: database.collection("uploads"),
        }
    }

    /// Insert a job in UPLOADING and return it. The archive path is
    /// recorded by [`JobStore::finish_upload`] once the stream lands.
    pub async fn create(&self, filename: &str) -> Result<Job> {
        let now = bson::DateTime::now();
        let job = Job {
            id: uuid::Uuid::new_v4().to_string(),
            filename: filename.to_string(),
            size_bytes: 0,
            archive_path: String::new(),
            extract_path: None,
            status: JobStatus::Uploading,
            current_stage: None,
            stage_progress: 0,
            progress: "Uploading archive".to_string(),
            progress_percent: 0,
            error: None,
            created_at: now,
            updated_at: now,
        };
        self.collection
            .insert_one(&job)
            .await
            .map_err(crate::error::StoreError::from)?;
        Ok(job)
    }

    /// Atomic status/progress update. Validates the transition, clamps the
    /// stage progress, keeps it monotone within a stage, recomputes the
    /// overall percent, and bumps `updated_at`.
    pub async fn advance(
        &self,
        job_id: &str,
        new_status: JobStatus,
        progress_line: &str,
        stage_progress: i32,
    ) -> Result<()> {
        let job = self.require(job_id).await?;
        if !job.status.can_transition(new_status) {
            return Err(PipelineError::InvalidTransition {
                from: job.status.to_string(),
                to: new_status.to_string(),
            }
            .into());
        }

        let mut stage_progress = stage_progress.clamp(0, 100);
        if job.status == new_status {
            stage_progress = stage_progress.max(job.stage_progress);
        }
        let (base, width) = new_status.progress_window();
        let progress_percent = (base + width * stage_progress / 100).clamp(0, 100);
        let progress_percent = if new_status == job.status {
            progress_percent.max(job.progress_percent)
        } else {
            progress_percent
        };

        let mut update = doc! {
            "status": bson::to_bson(&new_status).map_err(|e| anyhow::anyhow!(e))?,
            "stage_progress": stage_progress,
            "progress": progress_line,
            "progress_percent": progress_percent,
            "updated_at": bson::DateTime::now(),
        };
        if let Some(stage) = new_status.stage() {
            update.insert(
                "current_stage",
                bson::to_bson(&stage).map_err(|e| anyhow::anyhow!(e))?,
            );
        }
        if new_status == JobStatus::Complete {
            update.insert("progress_percent", 100);
            update.insert("stage_progress", 100);
        }
        // Leaving a terminal error state clears the old message.
        if job.status == JobStatus::Error {
            update.insert("error", bson::Bson::Null);
        }

        self.collection
            .update_one(doc! {"_id": job_id}, doc! {"$set": update})
            .await
            .map_err(crate::error::StoreError::from)?;
        Ok(())
    }

    /// Record the staged archive and move UPLOADING -> UPLOADED.
    pub async fn finish_upload(
        &self,
        job_id: &str,
        size_bytes: i64,
        archive_path: &Path,
    ) -> Result<()> {
        self.collection
            .update_one(
                doc! {"_id": job_id},
                doc! {"$set": {
                    "size_bytes": size_bytes,
                    "archive_path": archive_path.display().to_string(),
                    "updated_at": bson::DateTime::now(),
                }},
            )
            .await
            .map_err(crate::error::StoreError::from)?;
        self.advance(job_id, JobStatus::Uploaded, "Upload complete", 100)
            .await
    }

    /// Move to ERROR with a descriptive message. The extract path survives.
    pub async fn record_error(&self, job_id: &str, message: &str) -> Result<()> {
        tracing::warn!(job_id = %job_id, error = %message, "job failed");
        self.collection
            .update_one(
                doc! {"_id": job_id},
                doc! {"$set": {
                    "status": "ERROR",
                    "error": message,
                    "progress": format!("Failed: {message}"),
                    "updated_at": bson::DateTime::now(),
                }},
            )
            .await
            .map_err(crate::error::StoreError::from)?;
        Ok(())
    }

    /// Move to CANCELLED. The extract path survives.
    pub async fn record_cancel(&self, job_id: &str) -> Result<()> {
        tracing::info!(job_id = %job_id, "job cancelled");
        self.collection
            .update_one(
                doc! {"_id": job_id},
                doc! {"$set": {
                    "status": "CANCELLED",
                    "progress": "Cancelled",
                    "updated_at": bson::DateTime::now(),
                }},
            )
            .await
            .map_err(crate::error::StoreError::from)?;
        Ok(())
    }

    /// Record where the archive was extracted to.
    pub async fn set_extract_path(&self, job_id: &str, extract_path: &Path) -> Result<()> {
        self.collection
            .update_one(
                doc! {"_id": job_id},
                doc! {"$set": {
                    "extract_path": extract_path.display().to_string(),
                    "updated_at": bson::DateTime::now(),
                }},
            )
            .await
            .map_err(crate::error::StoreError::from)?;
        Ok(())
    }

    pub async fn get(&self, job_id: &str) -> Result<Option<Job>> {
        self.collection
            .find_one(doc! {"_id": job_id})
            .await
            .map_err(|e| crate::error::StoreError::from(e).into())
    }

    /// Fetch a job or fail with `JobNotFound`.
    pub async fn require(&self, job_id: &str) -> Result<Job> {
        self.get(job_id)
            .await?
            .ok_or_else(|| PipelineError::JobNotFound(job_id.to_string()).into())
    }

    /// All jobs, newest first.
    pub async fn list(&self) -> Result<Vec<Job>> {
        let cursor = self
            .collection
            .find(doc! {})
            .sort(doc! {"created_at": -1})
            .await
            .map_err(crate::error::StoreError::from)?;
        cursor
            .try_collect()
            .await
            .map_err(|e| crate::error::StoreError::from(e).into())
    }

    /// Remove every job record. Used by the clear operations.
    pub async fn clear(&self) -> Result<u64> {
        let result = self
            .collection
            .delete_many(doc! {})
            .await
            .map_err(crate::error::StoreError::from)?;
        Ok(result.deleted_count)
    }
}
