//! Admin handlers: archive upload and pipeline control.

use super::ApiError;
use crate::context::{AppContext, ClearSummary};
use crate::job::{JobStatus, JobStatusView};
use axum::Json;
use axum::extract::{Multipart, Path, State};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::io::AsyncWriteExt as _;

#[derive(Serialize)]
pub(super) struct UploadResponse {
    job_id: String,
    filename: String,
    size_bytes: i64,
    status: JobStatus,
}

#[derive(Serialize)]
pub(super) struct ActionResponse {
    job_id: String,
    status: &'static str,
}

#[derive(Deserialize)]
pub(super) struct ClearRequest {
    #[serde(default)]
    messages: bool,
    #[serde(default)]
    uploads: bool,
    #[serde(default)]
    embeddings: bool,
}

/// `POST /admin/upload` (multipart): stream the archive to
/// `<DATA_DIR>/uploads/<job_id>_<filename>` and create the job.
pub(super) async fn upload(
    State(context): State<Arc<AppContext>>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|error| ApiError::bad_request(format!("malformed multipart body: {error}")))?
    {
        let Some(filename) = field.file_name().map(sanitize_filename) else {
            continue;
        };

        let job = context.jobs.create(&filename).await?;
        let target = context
            .config
            .uploads_dir()
            .join(format!("{}_{}", job.id, filename));

        match stream_to_file(field, &target).await {
            Ok(size_bytes) => {
                context.jobs.finish_upload(&job.id, size_bytes, &target).await?;
                tracing::info!(
                    job_id = %job.id,
                    filename = %filename,
                    size_bytes,
                    "archive staged"
                );
                return Ok(Json(UploadResponse {
                    job_id: job.id,
                    filename,
                    size_bytes,
                    status: JobStatus::Uploaded,
                }));
            }
            Err(error) => {
                context
                    .jobs
                    .record_error(&job.id, &format!("upload failed: {error}"))
                    .await?;
                return Err(ApiError::bad_request(format!("upload failed: {error}")));
            }
        }
    }

    Err(ApiError::bad_request("multipart body contained no file field"))
}

async fn stream_to_file(
    mut field: axum::extract::multipart::Field<'_>,
    target: &std::path::Path,
) -> anyhow::Result<i64> {
    let mut file = tokio::fs::File::create(target).await?;
    let mut size_bytes: i64 = 0;
    while let Some(chunk) = field.chunk().await? {
        size_bytes += chunk.len() as i64;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(size_bytes)
}

/// Multipart filenames may carry client path prefixes; keep the final
/// component only.
fn sanitize_filename(raw: &str) -> String {
    let name = raw
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(raw)
        .trim()
        .to_string();
    if name.is_empty() { "export.zip".to_string() } else { name }
}

/// `GET /admin/import-status`: status map for every job.
pub(super) async fn import_status_all(
    State(context): State<Arc<AppContext>>,
) -> Result<Json<BTreeMap<String, JobStatusView>>, ApiError> {
    let jobs = context.jobs.list().await?;
    Ok(Json(
        jobs.into_iter()
            .map(|job| (job.id.clone(), job.status_view()))
            .collect(),
    ))
}

/// `GET /admin/import/{job_id}/status`.
pub(super) async fn import_status(
    State(context): State<Arc<AppContext>>,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatusView>, ApiError> {
    let job = context.jobs.require(&job_id).await?;
    Ok(Json(job.status_view()))
}

/// `POST /admin/import/{job_id}/start`: enqueue a pipeline run. Handles
/// resume from ERROR or CANCELLED.
pub(super) async fn start_import(
    State(context): State<Arc<AppContext>>,
    Path(job_id): Path<String>,
) -> Result<Json<ActionResponse>, ApiError> {
    context.pipeline.start(&job_id).await?;
    Ok(Json(ActionResponse {
        job_id,
        status: "started",
    }))
}

/// `POST /admin/import/{job_id}/cancel`: set the cancel flag; the worker
/// stops at its next check-point.
pub(super) async fn cancel_import(
    State(context): State<Arc<AppContext>>,
    Path(job_id): Path<String>,
) -> Result<Json<ActionResponse>, ApiError> {
    context.pipeline.cancel(&job_id).await?;
    Ok(Json(ActionResponse {
        job_id,
        status: "cancelling",
    }))
}

/// `POST /admin/restart-import/{job_id}`: alias for start from a terminal
/// state.
pub(super) async fn restart_import(
    state: State<Arc<AppContext>>,
    path: Path<String>,
) -> Result<Json<ActionResponse>, ApiError> {
    start_import(state, path).await
}

/// `POST /admin/clear-all`.
pub(super) async fn clear_all(
    State(context): State<Arc<AppContext>>,
) -> Result<Json<ClearSummary>, ApiError> {
    let summary = context.clear_all().await?;
    Ok(Json(summary))
}

/// `POST /admin/clear`: selective truncation. The vector store is always
/// cleared in tandem with messages.
pub(super) async fn clear(
    State(context): State<Arc<AppContext>>,
    Json(request): Json<ClearRequest>,
) -> Result<Json<ClearSummary>, ApiError> {
    if !request.messages && !request.uploads && !request.embeddings {
        return Err(ApiError::bad_request(
            "nothing to clear: set messages, uploads, and/or embeddings",
        ));
    }
    let summary = context
        .clear(request.messages, request.uploads, request.embeddings)
        .await?;
    Ok(Json(summary))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filenames_lose_client_path_prefixes() {
        assert_eq!(sanitize_filename("export.zip"), "export.zip");
        assert_eq!(sanitize_filename("C:\\Users\\a\\export.zip"), "export.zip");
        assert_eq!(sanitize_filename("/tmp/export.zip"), "export.zip");
        assert_eq!(sanitize_filename("  "), "export.zip");
    }
}
