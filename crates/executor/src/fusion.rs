//! Hybrid text + vector score fusion.
//!
//! Two rankings — BM25 text hits and vector k-NN hits — fuse into one.
//! Reciprocal Rank Fusion (`score = Σ w_i / (k + rank_i)`, default
//! `k = 60`) is the default because BM25 scores and vector distances
//! live on incomparable scales; min-max weighted fusion normalizes both
//! sides into [0, 1] first and then blends with explicit weights.

use themis_core::error::Result;
use themis_core::limits::DEFAULT_RRF_K;
use themis_engine::Themis;
use themis_index::vector::Whitelist;

/// Fusion algorithm.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FusionMode {
    /// Reciprocal Rank Fusion with the given `k`.
    Rrf {
        /// Rank damping constant.
        k: f64,
    },
    /// Min-max normalize both score lists, then weighted sum.
    WeightedMinMax,
}

impl Default for FusionMode {
    fn default() -> Self {
        FusionMode::Rrf { k: DEFAULT_RRF_K }
    }
}

/// A hybrid search request.
#[derive(Debug, Clone)]
pub struct FusionRequest {
    /// Fulltext index to search.
    pub text_index: String,
    /// Vector index to search.
    pub vector_index: String,
    /// The text query.
    pub text_query: String,
    /// The query vector.
    pub query_vector: Vec<f32>,
    /// Final result size.
    pub top_k: usize,
    /// Fusion algorithm.
    pub mode: FusionMode,
    /// Weight of the text ranking.
    pub weight_text: f64,
    /// Weight of the vector ranking.
    pub weight_vector: f64,
    /// Optional whitelist forwarded to the vector side.
    pub whitelist: Option<Whitelist>,
}

impl FusionRequest {
    /// A request with RRF defaults and equal weights.
    pub fn new(
        text_index: impl Into<String>,
        vector_index: impl Into<String>,
        text_query: impl Into<String>,
        query_vector: Vec<f32>,
        top_k: usize,
    ) -> Self {
        FusionRequest {
            text_index: text_index.into(),
            vector_index: vector_index.into(),
            text_query: text_query.into(),
            query_vector,
            top_k,
            mode: FusionMode::default(),
            weight_text: 1.0,
            weight_vector: 1.0,
            whitelist: None,
        }
    }
}

/// One fused hit.
#[derive(Debug, Clone, PartialEq)]
pub struct FusionHit {
    /// Primary key.
    pub pk: String,
    /// Fused score (higher is better).
    pub score: f64,
    /// Rank in the text ranking, if present there.
    pub text_rank: Option<usize>,
    /// Rank in the vector ranking, if present there.
    pub vector_rank: Option<usize>,
}

/// Fuse two rankings. Inputs are `(pk, score)` lists sorted best-first;
/// for the vector list the score is a distance (smaller is better),
/// which only matters for min-max, where it is inverted.
pub fn fuse(
    text: &[(String, f64)],
    vector: &[(String, f64)],
    mode: FusionMode,
    weight_text: f64,
    weight_vector: f64,
    top_k: usize,
) -> Vec<FusionHit> {
    use std::collections::HashMap;

    let mut merged: HashMap<&str, FusionHit> = HashMap::new();
    let slot = |pk: &str| -> String { pk.to_string() };

    match mode {
        FusionMode::Rrf { k } => {
            for (rank, (pk, _)) in text.iter().enumerate() {
                let entry = merged.entry(pk.as_str()).or_insert_with(|| FusionHit {
                    pk: slot(pk),
                    score: 0.0,
                    text_rank: None,
                    vector_rank: None,
                });
                entry.score += weight_text / (k + (rank + 1) as f64);
                entry.text_rank = Some(rank + 1);
            }
            for (rank, (pk, _)) in vector.iter().enumerate() {
                let entry = merged.entry(pk.as_str()).or_insert_with(|| FusionHit {
                    pk: slot(pk),
                    score: 0.0,
                    text_rank: None,
                    vector_rank: None,
                });
                entry.score += weight_vector / (k + (rank + 1) as f64);
                entry.vector_rank = Some(rank + 1);
            }
        }
        FusionMode::WeightedMinMax => {
            let norm = |scores: &[(String, f64)], invert: bool| -> Vec<f64> {
                let lo = scores.iter().map(|(_, s)| *s).fold(f64::INFINITY, f64::min);
                let hi = scores
                    .iter()
                    .map(|(_, s)| *s)
                    .fold(f64::NEG_INFINITY, f64::max);
                scores
                    .iter()
                    .map(|(_, s)| {
                        let n = if hi > lo { (s - lo) / (hi - lo) } else { 1.0 };
                        if invert {
                            1.0 - n
                        } else {
                            n
                        }
                    })
                    .collect()
            };
            let text_norm = norm(text, false);
            // Vector scores are distances: smaller is better.
            let vector_norm = norm(vector, true);
            for (rank, ((pk, _), n)) in text.iter().zip(&text_norm).enumerate() {
                let entry = merged.entry(pk.as_str()).or_insert_with(|| FusionHit {
                    pk: slot(pk),
                    score: 0.0,
                    text_rank: None,
                    vector_rank: None,
                });
                entry.score += weight_text * n;
                entry.text_rank = Some(rank + 1);
            }
            for (rank, ((pk, _), n)) in vector.iter().zip(&vector_norm).enumerate() {
                let entry = merged.entry(pk.as_str()).or_insert_with(|| FusionHit {
                    pk: slot(pk),
                    score: 0.0,
                    text_rank: None,
                    vector_rank: None,
                });
                entry.score += weight_vector * n;
                entry.vector_rank = Some(rank + 1);
            }
        }
    }

    let mut hits: Vec<FusionHit> = merged.into_values().collect();
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.pk.cmp(&b.pk))
    });
    hits.truncate(top_k);
    hits
}

/// Run both searches and fuse. Each side over-fetches a few multiples
/// of `top_k` so the fusion has enough overlap to rank on.
pub fn hybrid_search(db: &Themis, request: &FusionRequest) -> Result<Vec<FusionHit>> {
    let fetch = (request.top_k * 4).max(request.top_k);
    let text_hits: Vec<(String, f64)> = db
        .fulltext_search(&request.text_index, &request.text_query, fetch)?
        .into_iter()
        .map(|hit| (hit.pk, hit.score))
        .collect();
    let vector_hits: Vec<(String, f64)> = db
        .vector_search_index(
            &request.vector_index,
            &request.query_vector,
            fetch,
            request.whitelist.as_ref(),
            None,
        )?
        .into_iter()
        .map(|(pk, distance)| (pk, distance as f64))
        .collect();
    Ok(fuse(
        &text_hits,
        &vector_hits,
        request.mode,
        request.weight_text,
        request.weight_vector,
        request.top_k,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranking(items: &[(&str, f64)]) -> Vec<(String, f64)> {
        items.iter().map(|(pk, s)| (pk.to_string(), *s)).collect()
    }

    #[test]
    fn test_rrf_both_lists_beat_single_list() {
        let text = ranking(&[("a", 9.0), ("b", 5.0), ("c", 1.0)]);
        let vector = ranking(&[("a", 0.1), ("d", 0.2), ("b", 0.4)]);
        let hits = fuse(&text, &vector, FusionMode::default(), 1.0, 1.0, 10);
        // "a" ranks first in both lists and must win overall.
        assert_eq!(hits[0].pk, "a");
        assert_eq!(hits[0].text_rank, Some(1));
        assert_eq!(hits[0].vector_rank, Some(1));
        // "b" appears in both and outranks the single-list "c"/"d".
        assert_eq!(hits[1].pk, "b");
    }

    #[test]
    fn test_text_only_weights_reproduce_text_order() {
        let text = ranking(&[("a", 9.0), ("b", 5.0), ("c", 1.0)]);
        let vector = ranking(&[("c", 0.1), ("b", 0.2), ("a", 0.4)]);
        let hits = fuse(&text, &vector, FusionMode::default(), 1.0, 0.0, 10);
        let order: Vec<_> = hits.iter().map(|h| h.pk.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);

        let hits = fuse(&text, &vector, FusionMode::default(), 0.0, 1.0, 10);
        let order: Vec<_> = hits.iter().map(|h| h.pk.as_str()).collect();
        assert_eq!(order, vec!["c", "b", "a"]);
    }

    #[test]
    fn test_minmax_inverts_distances() {
        let text = ranking(&[("a", 2.0), ("b", 1.0)]);
        // "b" is nearer in vector space.
        let vector = ranking(&[("b", 0.1), ("a", 0.9)]);
        let hits = fuse(&text, &vector, FusionMode::WeightedMinMax, 0.0, 1.0, 10);
        assert_eq!(hits[0].pk, "b");
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn test_empty_sides() {
        let text = ranking(&[("a", 1.0)]);
        let hits = fuse(&text, &[], FusionMode::default(), 1.0, 1.0, 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].vector_rank, None);

        let hits = fuse(&[], &[], FusionMode::default(), 1.0, 1.0, 10);
        assert!(hits.is_empty());
    }

    #[test]
    fn test_top_k_truncation_and_tiebreak() {
        let text = ranking(&[("a", 1.0), ("b", 1.0), ("c", 1.0)]);
        let hits = fuse(&text, &[], FusionMode::default(), 1.0, 1.0, 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].pk, "a");
    }
}
