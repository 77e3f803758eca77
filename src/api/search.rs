//! Search handler.

use super::ApiError;
use crate::context::AppContext;
use crate::search::SearchResult;
use axum::Json;
use axum::extract::State;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Hard cap on requested result counts.
const MAX_LIMIT: usize = 100;

#[derive(Deserialize)]
pub(super) struct SearchRequest {
    query: String,
    /// Mixing weight: 0 = pure lexical, 1 = pure vector.
    #[serde(default = "default_alpha")]
    hybrid_alpha: f64,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_alpha() -> f64 {
    0.5
}

fn default_limit() -> usize {
    20
}

#[derive(Serialize)]
pub(super) struct SearchResponse {
    count: usize,
    results: Vec<SearchResult>,
}

/// `POST /api/v1/search` with `{query, hybrid_alpha, limit}`.
pub(super) async fn search(
    State(context): State<Arc<AppContext>>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, ApiError> {
    let limit = request.limit.min(MAX_LIMIT);
    let results = context
        .search
        .search(&request.query, request.hybrid_alpha, limit)
        .await?;
    Ok(Json(SearchResponse {
        count: results.len(),
        results,
    }))
}
