//! Vector store client.
//!
//! Talks to a Chroma server over its REST API. A single collection
//! `messages` in cosine space holds one record per message, keyed by the
//! message's document id with a metadata snapshot for result rendering.

use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;

/// The one collection this service maintains.
const COLLECTION_NAME: &str = "messages";
/// Metadata text snippets are capped to keep the store compact.
pub const SNIPPET_MAX_CHARS: usize = 512;
/// Page size for id listing during orphan culling.
const LIST_PAGE: usize = 1000;

/// Metadata snapshot stored alongside each vector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VectorMetadata {
    pub conversation_id: String,
    pub username: String,
    /// RFC 3339 UTC timestamp.
    pub ts: String,
    /// Text snippet capped at [`SNIPPET_MAX_CHARS`] characters.
    pub text: String,
}

/// A record to upsert.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub id: String,
    pub embedding: Vec<f32>,
    pub metadata: VectorMetadata,
}

/// One k-NN hit.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: String,
    /// Cosine similarity in [-1, 1], derived from the store's distance.
    pub similarity: f32,
    pub metadata: Option<VectorMetadata>,
}

#[derive(Deserialize)]
struct CollectionResponse {
    id: String,
}

#[derive(Deserialize)]
struct QueryResponse {
    ids: Vec<Vec<String>>,
    distances: Option<Vec<Vec<f32>>>,
    metadatas: Option<Vec<Vec<Option<VectorMetadata>>>>,
}

#[derive(Deserialize)]
struct GetResponse {
    ids: Vec<String>,
}

/// REST client for the vector store.
pub struct ChromaStore {
    client: reqwest::Client,
    base_url: String,
    /// Cached collection id; cleared when the collection is dropped.
    collection_id: RwLock<Option<String>>,
}

impl ChromaStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            collection_id: RwLock::new(None),
        }
    }

    /// Resolve (and create if needed) the `messages` collection.
    async fn collection_id(&self) -> Result<String, StoreError> {
        if let Some(id) = self.collection_id.read().await.clone() {
            return Ok(id);
        }

        let response = self
            .client
            .post(format!("{}/api/v1/collections", self.base_url))
            .json(&json!({
                "name": COLLECTION_NAME,
                "metadata": {"hnsw:space": "cosine"},
                "get_or_create": true,
            }))
            .send()
            .await?;
        let response = check(response).await?;
        let collection: CollectionResponse = response
            .json()
            .await
            .map_err(|error| StoreError::VectorResponse(error.to_string()))?;

        *self.collection_id.write().await = Some(collection.id.clone());
        Ok(collection.id)
    }

    /// Upsert a batch of records. Keyed by id, so retries are harmless.
    pub async fn upsert(&self, records: &[VectorRecord]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let collection = self.collection_id().await?;

        let ids: Vec<&str> = records.iter().map(|record| record.id.as_str()).collect();
        let embeddings: Vec<&[f32]> = records
            .iter()
            .map(|record| record.embedding.as_slice())
            .collect();
        let metadatas: Vec<&VectorMetadata> =
            records.iter().map(|record| &record.metadata).collect();
        let documents: Vec<&str> = records
            .iter()
            .map(|record| record.metadata.text.as_str())
            .collect();

        let response = self
            .client
            .post(format!(
                "{}/api/v1/collections/{collection}/upsert",
                self.base_url
            ))
            .json(&json!({
                "ids": ids,
                "embeddings": embeddings,
                "metadatas": metadatas,
                "documents": documents,
            }))
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    /// k-nearest neighbours by cosine similarity.
    pub async fn query(
        &self,
        embedding: &[f32],
        n_results: usize,
    ) -> Result<Vec<VectorHit>, StoreError> {
        if n_results == 0 {
            return Ok(Vec::new());
        }
        let collection = self.collection_id().await?;

        let response = self
            .client
            .post(format!(
                "{}/api/v1/collections/{collection}/query",
                self.base_url
            ))
            .json(&json!({
                "query_embeddings": [embedding],
                "n_results": n_results,
                "include": ["metadatas", "distances"],
            }))
            .send()
            .await?;
        let response = check(response).await?;
        let payload: QueryResponse = response
            .json()
            .await
            .map_err(|error| StoreError::VectorResponse(error.to_string()))?;

        let ids = payload.ids.into_iter().next().unwrap_or_default();
        let distances = payload
            .distances
            .and_then(|rows| rows.into_iter().next())
            .unwrap_or_default();
        let metadatas = payload
            .metadatas
            .and_then(|rows| rows.into_iter().next())
            .unwrap_or_default();

        let hits = ids
            .into_iter()
            .enumerate()
            .map(|(index, id)| VectorHit {
                id,
                similarity: distances
                    .get(index)
                    .map(|distance| 1.0 - distance)
                    .unwrap_or(0.0),
                metadata: metadatas.get(index).cloned().flatten(),
            })
            .collect();
        Ok(hits)
    }

    /// Every id currently in the collection, paged.
    pub async fn list_ids(&self) -> Result<Vec<String>, StoreError> {
        let collection = self.collection_id().await?;
        let mut all = Vec::new();
        let mut offset = 0usize;
        loop {
            let response = self
                .client
                .post(format!(
                    "{}/api/v1/collections/{collection}/get",
                    self.base_url
                ))
                .json(&json!({
                    "include": [],
                    "limit": LIST_PAGE,
                    "offset": offset,
                }))
                .send()
                .await?;
            let response = check(response).await?;
            let page: GetResponse = response
                .json()
                .await
                .map_err(|error| StoreError::VectorResponse(error.to_string()))?;
            let count = page.ids.len();
            all.extend(page.ids);
            if count < LIST_PAGE {
                return Ok(all);
            }
            offset += count;
        }
    }

    /// Delete specific records, e.g. orphan vectors found during training.
    pub async fn delete_ids(&self, ids: &[String]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let collection = self.collection_id().await?;
        let response = self
            .client
            .post(format!(
                "{}/api/v1/collections/{collection}/delete",
                self.base_url
            ))
            .json(&json!({"ids": ids}))
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    /// Record count in the collection.
    pub async fn count(&self) -> Result<u64, StoreError> {
        let collection = self.collection_id().await?;
        let response = self
            .client
            .get(format!(
                "{}/api/v1/collections/{collection}/count",
                self.base_url
            ))
            .send()
            .await?;
        let response = check(response).await?;
        response
            .json::<u64>()
            .await
            .map_err(|error| StoreError::VectorResponse(error.to_string()))
    }

    /// Drop the collection. The next operation recreates it empty; callers
    /// truncate the document store in the same breath to preserve the
    /// dual-write invariant.
    pub async fn clear(&self) -> Result<(), StoreError> {
        let response = self
            .client
            .delete(format!(
                "{}/api/v1/collections/{COLLECTION_NAME}",
                self.base_url
            ))
            .send()
            .await?;
        // A missing collection is already clear.
        if response.status() != reqwest::StatusCode::NOT_FOUND {
            check(response).await?;
        }
        *self.collection_id.write().await = None;
        tracing::info!("vector collection cleared");
        Ok(())
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(StoreError::VectorRejected { status, body })
}

/// Cap text to the metadata snippet limit on a character boundary.
pub fn snippet(text: &str) -> String {
    if text.chars().count() <= SNIPPET_MAX_CHARS {
        return text.to_string();
    }
    text.chars().take(SNIPPET_MAX_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn mock_collection(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/api/v1/collections"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"id": "col-1", "name": "messages"})),
            )
            .expect(1)
            .mount(server)
            .await;
    }

    fn record(id: &str) -> VectorRecord {
        VectorRecord {
            id: id.to_string(),
            embedding: vec![0.1, 0.2],
            metadata: VectorMetadata {
                conversation_id: "C01".into(),
                username: "alice".into(),
                ts: "2023-06-22T15:56:54+00:00".into(),
                text: "hello".into(),
            },
        }
    }

    #[tokio::test]
    async fn collection_is_created_once_and_cached() {
        let server = MockServer::start().await;
        mock_collection(&server).await;
        Mock::given(method("POST"))
            .and(path("/api/v1/collections/col-1/upsert"))
            .respond_with(ResponseTemplate::new(200))
            .expect(2)
            .mount(&server)
            .await;

        let store = ChromaStore::new(server.uri());
        store.upsert(&[record("m1")]).await.unwrap();
        store.upsert(&[record("m2")]).await.unwrap();
    }

    #[tokio::test]
    async fn query_maps_distance_to_similarity() {
        let server = MockServer::start().await;
        mock_collection(&server).await;
        Mock::given(method("POST"))
            .and(path("/api/v1/collections/col-1/query"))
            .and(body_partial_json(json!({"n_results": 2})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ids": [["m1", "m2"]],
                "distances": [[0.1, 0.4]],
                "metadatas": [[
                    {"conversation_id": "C01", "username": "alice",
                     "ts": "2023-06-22T15:56:54+00:00", "text": "hello"},
                    null
                ]],
            })))
            .mount(&server)
            .await;

        let store = ChromaStore::new(server.uri());
        let hits = store.query(&[0.1, 0.2], 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "m1");
        assert!((hits[0].similarity - 0.9).abs() < 1e-6);
        assert_eq!(hits[0].metadata.as_ref().unwrap().username, "alice");
        assert!((hits[1].similarity - 0.6).abs() < 1e-6);
        assert!(hits[1].metadata.is_none());
    }

    #[tokio::test]
    async fn clear_drops_the_collection_and_cache() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/collections"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"id": "col-1", "name": "messages"})),
            )
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/v1/collections/messages"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/collections/col-1/count"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!(0)))
            .mount(&server)
            .await;

        let store = ChromaStore::new(server.uri());
        assert_eq!(store.count().await.unwrap(), 0);
        store.clear().await.unwrap();
        // Next call re-resolves the collection.
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn server_errors_surface_with_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/collections"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let store = ChromaStore::new(server.uri());
        let error = store.upsert(&[record("m1")]).await.unwrap_err();
        match error {
            StoreError::VectorRejected { status, body } => {
                assert_eq!(status, reqwest::StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(body, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn snippet_caps_on_char_boundary() {
        assert_eq!(snippet("short"), "short");
        let long: String = "é".repeat(SNIPPET_MAX_CHARS + 10);
        let capped = snippet(&long);
        assert_eq!(capped.chars().count(), SNIPPET_MAX_CHARS);
    }
}
