//! Hybrid search: lexical and vector retrieval fused under a mixing weight.
//!
//! The engine is stateless. Result consistency depends on the indexer's
//! dual-write discipline between the two stores.

use crate::embedding::OllamaEmbedder;
use crate::error::Result;
use crate::store::{ChromaStore, MongoStore, from_bson_datetime};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// One ranked search hit.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub message_id: String,
    pub conversation_id: String,
    pub username: Option<String>,
    pub ts: String,
    pub text: String,
    pub score: f64,
    /// The full-text side contributed this hit.
    pub keyword_match: bool,
    /// The vector side contributed this hit.
    pub semantic_match: bool,
}

/// A message known to one or both retrieval sides, pre-fusion.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: String,
    pub conversation_id: String,
    pub username: Option<String>,
    pub ts: DateTime<Utc>,
    pub text: String,
    pub lexical: Option<f64>,
    pub vector: Option<f64>,
}

/// Executes hybrid queries across both stores.
pub struct SearchEngine {
    mongo: MongoStore,
    chroma: Arc<ChromaStore>,
    embedder: Arc<OllamaEmbedder>,
}

impl SearchEngine {
    pub fn new(mongo: MongoStore, chroma: Arc<ChromaStore>, embedder: Arc<OllamaEmbedder>) -> Self {
        Self {
            mongo,
            chroma,
            embedder,
        }
    }

    /// Run a hybrid query. `alpha` is clamped to [0, 1]; 0 is pure lexical,
    /// 1 pure vector. An empty query returns no results.
    pub async fn search(&self, query: &str, alpha: f64, limit: usize) -> Result<Vec<SearchResult>> {
        let query = query.trim();
        if query.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let alpha = alpha.clamp(0.0, 1.0);
        let candidate_pool = limit * 2;

        let mut candidates: HashMap<String, Candidate> = HashMap::new();

        // Lexical side. Skipped at alpha=1, where it cannot contribute.
        if alpha < 1.0 {
            for scored in self.mongo.text_search(query, candidate_pool).await? {
                let Some(id) = scored.message.vector_id() else {
                    continue;
                };
                candidates.insert(
                    id.clone(),
                    Candidate {
                        id,
                        conversation_id: scored.message.conversation_id.clone(),
                        username: scored.message.username.clone(),
                        ts: from_bson_datetime(scored.message.ts),
                        text: scored.message.text.clone(),
                        lexical: Some(scored.score),
                        vector: None,
                    },
                );
            }
        }

        // Vector side. Skipped at alpha=0, so the lexical law holds without
        // touching the embedding endpoint. The store rejects k larger than
        // the collection, so clamp first.
        if alpha > 0.0 {
            let pool = candidate_pool.min(self.chroma.count().await? as usize);
            if pool > 0 {
                let embedding = self.embedder.embed(query).await?;
                for hit in self.chroma.query(&embedding, pool).await? {
                    let similarity = f64::from(hit.similarity);
                    if let Some(candidate) = candidates.get_mut(&hit.id) {
                        candidate.vector = Some(similarity);
                        continue;
                    }
                    let Some(metadata) = hit.metadata else {
                        tracing::warn!(id = %hit.id, "vector hit without metadata snapshot");
                        continue;
                    };
                    let ts = DateTime::parse_from_rfc3339(&metadata.ts)
                        .map(|ts| ts.with_timezone(&Utc))
                        .unwrap_or(DateTime::UNIX_EPOCH);
                    candidates.insert(
                        hit.id.clone(),
                        Candidate {
                            id: hit.id,
                            conversation_id: metadata.conversation_id,
                            username: (!metadata.username.is_empty())
                                .then_some(metadata.username),
                            ts,
                            text: metadata.text,
                            lexical: None,
                            vector: Some(similarity),
                        },
                    );
                }
            }
        }

        Ok(fuse(candidates.into_values().collect(), alpha, limit))
    }
}

/// Normalise both score sets, fuse under `alpha`, rank, and truncate.
///
/// Scores are min-max normalised to [0, 1] over their own candidate set; a
/// candidate missing from one side scores 0 there. Ties break toward the
/// more recent timestamp, then the lexicographically smaller conversation
/// id.
pub fn fuse(candidates: Vec<Candidate>, alpha: f64, limit: usize) -> Vec<SearchResult> {
    let lexical_range = score_range(candidates.iter().filter_map(|candidate| candidate.lexical));
    let vector_range = score_range(candidates.iter().filter_map(|candidate| candidate.vector));

    let mut results: Vec<SearchResult> = candidates
        .into_iter()
        .map(|candidate| {
            let lexical = candidate
                .lexical
                .map(|score| normalise(score, lexical_range))
                .unwrap_or(0.0);
            let vector = candidate
                .vector
                .map(|score| normalise(score, vector_range))
                .unwrap_or(0.0);
            SearchResult {
                message_id: candidate.id,
                conversation_id: candidate.conversation_id,
                username: candidate.username,
                ts: candidate.ts.to_rfc3339(),
                text: candidate.text,
                score: (1.0 - alpha) * lexical + alpha * vector,
                keyword_match: candidate.lexical.is_some(),
                semantic_match: candidate.vector.is_some(),
            }
        })
        .collect();

    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.ts.cmp(&a.ts))
            .then_with(|| a.conversation_id.cmp(&b.conversation_id))
    });
    results.truncate(limit);
    results
}

fn score_range(scores: impl Iterator<Item = f64>) -> Option<(f64, f64)> {
    let mut range: Option<(f64, f64)> = None;
    for score in scores {
        range = Some(match range {
            None => (score, score),
            Some((min, max)) => (min.min(score), max.max(score)),
        });
    }
    range
}

/// Min-max normalise into [0, 1]. A degenerate range (single candidate or
/// identical scores) normalises to 1.0.
fn normalise(score: f64, range: Option<(f64, f64)>) -> f64 {
    match range {
        Some((min, max)) if max > min => (score - min) / (max - min),
        Some(_) => 1.0,
        None => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone as _;

    fn candidate(
        id: &str,
        ts_hour: u32,
        lexical: Option<f64>,
        vector: Option<f64>,
    ) -> Candidate {
        Candidate {
            id: id.to_string(),
            conversation_id: "C01".into(),
            username: Some("alice".into()),
            ts: Utc.with_ymd_and_hms(2024, 1, 5, ts_hour, 0, 0).unwrap(),
            text: format!("text for {id}"),
            lexical,
            vector,
        }
    }

    #[test]
    fn alpha_zero_is_the_lexical_ranking() {
        let candidates = vec![
            candidate("low", 1, Some(1.0), Some(0.99)),
            candidate("high", 2, Some(5.0), Some(0.10)),
            candidate("mid", 3, Some(3.0), None),
        ];
        let results = fuse(candidates, 0.0, 10);
        let ids: Vec<&str> = results.iter().map(|result| result.message_id.as_str()).collect();
        assert_eq!(ids, vec!["high", "mid", "low"]);
    }

    #[test]
    fn alpha_one_is_the_vector_ranking() {
        let candidates = vec![
            candidate("far", 1, Some(9.0), Some(0.20)),
            candidate("near", 2, None, Some(0.95)),
            candidate("mid", 3, None, Some(0.60)),
        ];
        let results = fuse(candidates, 1.0, 10);
        let ids: Vec<&str> = results.iter().map(|result| result.message_id.as_str()).collect();
        assert_eq!(ids, vec!["near", "mid", "far"]);
    }

    #[test]
    fn balanced_alpha_blends_both_sides() {
        let candidates = vec![
            candidate("keyword", 1, Some(10.0), None),
            candidate("semantic", 1, None, Some(0.9)),
            candidate("both", 1, Some(5.0), Some(0.5)),
        ];
        let results = fuse(candidates, 0.5, 10);

        let keyword = results
            .iter()
            .find(|result| result.message_id == "keyword")
            .unwrap();
        assert!(keyword.keyword_match);
        assert!(!keyword.semantic_match);

        let semantic = results
            .iter()
            .find(|result| result.message_id == "semantic")
            .unwrap();
        assert!(!semantic.keyword_match);
        assert!(semantic.semantic_match);

        let both = results
            .iter()
            .find(|result| result.message_id == "both")
            .unwrap();
        assert!(both.keyword_match && both.semantic_match);
    }

    #[test]
    fn missing_side_scores_zero() {
        let candidates = vec![
            candidate("both", 1, Some(2.0), Some(0.8)),
            candidate("lexical_only", 1, Some(4.0), None),
        ];
        let results = fuse(candidates, 0.5, 10);
        // lexical_only: normalised lexical 1.0, vector 0 -> 0.5
        // both: lexical 0 (min), vector 1.0 (only/degenerate) -> 0.5 each side
        let lexical_only = results
            .iter()
            .find(|result| result.message_id == "lexical_only")
            .unwrap();
        assert!((lexical_only.score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn ties_break_by_recency_then_conversation() {
        let mut older = candidate("older", 1, Some(1.0), None);
        older.conversation_id = "C01".into();
        let mut newer = candidate("newer", 5, Some(1.0), None);
        newer.conversation_id = "C09".into();
        let results = fuse(vec![older, newer], 0.0, 10);
        assert_eq!(results[0].message_id, "newer");

        let mut first = candidate("conv_a", 2, Some(1.0), None);
        first.conversation_id = "C01".into();
        let mut second = candidate("conv_b", 2, Some(1.0), None);
        second.conversation_id = "C02".into();
        let results = fuse(vec![second, first], 0.0, 10);
        assert_eq!(results[0].message_id, "conv_a");
    }

    #[test]
    fn truncates_to_limit() {
        let candidates = (0..10)
            .map(|index| candidate(&format!("m{index}"), 1, Some(index as f64), None))
            .collect();
        let results = fuse(candidates, 0.0, 3);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].message_id, "m9");
    }

    #[test]
    fn degenerate_score_range_normalises_to_one() {
        let candidates = vec![candidate("only", 1, Some(7.5), None)];
        let results = fuse(candidates, 0.0, 10);
        assert!((results[0].score - 1.0).abs() < 1e-9);
    }
}
