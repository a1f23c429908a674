//! Reciprocal Rank Fusion of vector and keyword rankings.
//!
//! Each list contributes `weight / (k + rank)` (1-based rank) for the items it contains;
//! items absent from a list get nothing from it. Fused order is by score descending,
//! then by vector rank (items the vector list ranked come first, best rank first), then
//! by key, so the output is fully deterministic.

use crate::error::IndexError;
use crate::storage::FileId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::hash::Hash;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Rank offset in `1 / (k + rank)`; larger values flatten the head of each list
    pub rrf_k: u32,
    pub vector_weight: f64,
    pub keyword_weight: f64,
    /// Multiplier for items found by both lists (1.0 disables it)
    pub both_lists_boost: f64,
    /// In hybrid mode, rank with a single list when the other has no results. When
    /// disabled, hybrid mode only returns items once both lists produced something.
    pub single_list_fallback: bool,
    /// Content mode also consults the keyword index
    pub content_uses_keyword: bool,
    /// Below this cosine similarity, filename hits are ignored and a path substring
    /// match is used instead
    pub min_filename_similarity: f32,
    /// Raw candidates fetched per requested result, before scoping and dedup
    pub candidate_multiplier: usize,
    /// Maps fused scores (well below 0.05) onto a 0-100 display scale
    pub score_multiplier: f64,
    pub default_limit: usize,
    pub max_limit: usize,
    pub snippet_length: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            rrf_k: 60,
            vector_weight: 1.0,
            keyword_weight: 1.0,
            both_lists_boost: 1.0,
            single_list_fallback: true,
            content_uses_keyword: false,
            min_filename_similarity: 0.3,
            candidate_multiplier: 4,
            score_multiplier: 3000.0,
            default_limit: 20,
            max_limit: 200,
            snippet_length: 300,
        }
    }
}

impl SearchConfig {
    pub fn with_rrf_k(mut self, k: u32) -> Self {
        self.rrf_k = k;
        self
    }

    pub fn with_weights(mut self, vector: f64, keyword: f64) -> Self {
        self.vector_weight = vector;
        self.keyword_weight = keyword;
        self
    }

    pub fn with_single_list_fallback(mut self, enabled: bool) -> Self {
        self.single_list_fallback = enabled;
        self
    }

    pub fn with_content_keyword(mut self, enabled: bool) -> Self {
        self.content_uses_keyword = enabled;
        self
    }

    pub fn validate(&self) -> Result<(), IndexError> {
        let weight_ok = |w: f64| (0.0..=1.0).contains(&w);
        if self.rrf_k == 0 {
            return Err(IndexError::invalid_config("rrf_k must be at least 1"));
        }
        if !weight_ok(self.vector_weight) || !weight_ok(self.keyword_weight) {
            return Err(IndexError::invalid_config(
                "search weights must be between 0.0 and 1.0",
            ));
        }
        if self.both_lists_boost < 1.0 {
            return Err(IndexError::invalid_config("both_lists_boost must be >= 1.0"));
        }
        if !(0.0..=1.0).contains(&self.min_filename_similarity) {
            return Err(IndexError::invalid_config(
                "min_filename_similarity must be between 0.0 and 1.0",
            ));
        }
        if self.score_multiplier <= 0.0 {
            return Err(IndexError::invalid_config("score_multiplier must be positive"));
        }
        if self.candidate_multiplier == 0 || self.default_limit == 0 {
            return Err(IndexError::invalid_config(
                "candidate_multiplier and default_limit must be positive",
            ));
        }
        if self.max_limit < self.default_limit {
            return Err(IndexError::invalid_config(
                "max_limit must be at least default_limit",
            ));
        }
        Ok(())
    }

    /// Fused score on the 0-100 scale shown to users.
    pub fn display_score(&self, score: f64) -> f64 {
        (score * self.score_multiplier).min(100.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FusedHit<K> {
    pub key: K,
    pub score: f64,
    /// 1-based
    pub vector_rank: Option<usize>,
    /// 1-based
    pub keyword_rank: Option<usize>,
}

impl<K> FusedHit<K> {
    pub fn in_both(&self) -> bool {
        self.vector_rank.is_some() && self.keyword_rank.is_some()
    }
}

fn fused_order<K: Ord>(a: &FusedHit<K>, b: &FusedHit<K>) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| match (a.vector_rank, b.vector_rank) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.key.cmp(&b.key))
}

/// Fuse two rankings. A key repeated within one list keeps its best rank.
pub fn reciprocal_rank_fusion<K>(
    vector: &[K],
    keyword: &[K],
    config: &SearchConfig,
) -> Vec<FusedHit<K>>
where
    K: Ord + Hash + Clone,
{
    let k = f64::from(config.rrf_k);
    let mut hits: HashMap<K, FusedHit<K>> = HashMap::with_capacity(vector.len() + keyword.len());

    for (position, key) in vector.iter().enumerate() {
        let entry = hits.entry(key.clone()).or_insert_with(|| FusedHit {
            key: key.clone(),
            score: 0.0,
            vector_rank: None,
            keyword_rank: None,
        });
        if entry.vector_rank.is_none() {
            entry.vector_rank = Some(position + 1);
        }
    }
    for (position, key) in keyword.iter().enumerate() {
        let entry = hits.entry(key.clone()).or_insert_with(|| FusedHit {
            key: key.clone(),
            score: 0.0,
            vector_rank: None,
            keyword_rank: None,
        });
        if entry.keyword_rank.is_none() {
            entry.keyword_rank = Some(position + 1);
        }
    }

    let mut fused: Vec<FusedHit<K>> = hits
        .into_values()
        .map(|mut hit| {
            let from_vector = hit
                .vector_rank
                .map_or(0.0, |rank| config.vector_weight / (k + rank as f64));
            let from_keyword = hit
                .keyword_rank
                .map_or(0.0, |rank| config.keyword_weight / (k + rank as f64));
            hit.score = from_vector + from_keyword;
            if hit.in_both() {
                hit.score *= config.both_lists_boost;
            }
            hit
        })
        .collect();
    fused.sort_by(fused_order);
    fused
}

/// Collapse hits to one per file, keeping each file's highest-scoring hit.
///
/// The result is ordered by score descending; equal scores keep their input order.
pub fn dedupe_by_file<T>(
    hits: Vec<T>,
    file_of: impl Fn(&T) -> FileId,
    score_of: impl Fn(&T) -> f64,
) -> Vec<T> {
    let mut best: HashMap<FileId, (usize, T)> = HashMap::new();
    for (position, hit) in hits.into_iter().enumerate() {
        let file = file_of(&hit);
        match best.get(&file) {
            Some((_, current)) if score_of(current) >= score_of(&hit) => {}
            _ => {
                best.insert(file, (position, hit));
            }
        }
    }

    let mut kept: Vec<(usize, T)> = best.into_values().collect();
    kept.sort_by(|(pa, a), (pb, b)| score_of(b).total_cmp(&score_of(a)).then(pa.cmp(pb)));
    kept.into_iter().map(|(_, hit)| hit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(hits: &[FusedHit<&'static str>]) -> Vec<&'static str> {
        hits.iter().map(|h| h.key).collect()
    }

    #[test]
    fn test_rrf_tie_breaks_are_deterministic() {
        let config = SearchConfig::default().with_rrf_k(1);
        let fused = reciprocal_rank_fusion(&["A", "B", "C"], &["B", "A", "D"], &config);

        assert_eq!(keys(&fused), vec!["A", "B", "C", "D"]);
        let expected = [1.0 / 2.0 + 1.0 / 3.0, 1.0 / 3.0 + 1.0 / 2.0, 0.25, 0.25];
        for (hit, want) in fused.iter().zip(expected) {
            assert!((hit.score - want).abs() < 1e-12, "{}: {}", hit.key, hit.score);
        }
        assert_eq!(fused[0].score, fused[1].score);
        assert_eq!(fused[3].vector_rank, None);
        assert_eq!(fused[3].keyword_rank, Some(3));
    }

    #[test]
    fn test_keyword_only_ties_break_by_key() {
        let config = SearchConfig::default();
        let fused = reciprocal_rank_fusion(&["Z"], &["Z", "Y", "X"], &config);
        // Y and X differ in rank, so only the score decides
        assert_eq!(keys(&fused), vec!["Z", "Y", "X"]);

        let tied = reciprocal_rank_fusion::<&str>(&["Q"], &["P"], &config);
        assert_eq!(keys(&tied), vec!["Q", "P"]);

        let unranked = reciprocal_rank_fusion::<&str>(&[], &[], &config);
        assert!(unranked.is_empty());
    }

    #[test]
    fn test_single_list_scores_match_rank() {
        let config = SearchConfig::default();
        let fused = reciprocal_rank_fusion(&[3_i64, 1, 2], &[], &config);
        assert_eq!(fused.iter().map(|h| h.key).collect::<Vec<_>>(), vec![3, 1, 2]);
        assert!((fused[0].score - 1.0 / 61.0).abs() < 1e-12);
    }

    #[test]
    fn test_repeated_key_keeps_best_rank() {
        let config = SearchConfig::default().with_rrf_k(1);
        let fused = reciprocal_rank_fusion(&["A", "B", "A"], &[], &config);
        assert_eq!(fused[0].key, "A");
        assert_eq!(fused[0].vector_rank, Some(1));
        assert!((fused[0].score - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_weights_and_boost() {
        let config = SearchConfig {
            both_lists_boost: 2.0,
            ..SearchConfig::default().with_rrf_k(1).with_weights(1.0, 0.5)
        };
        let fused = reciprocal_rank_fusion(&["A", "B"], &["B"], &config);
        // B: (1/3 + 0.5 * 1/2) * 2, A: 1/2
        assert_eq!(keys(&fused), vec!["B", "A"]);
        assert!((fused[0].score - (1.0 / 3.0 + 0.25) * 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_dedupe_keeps_max_score() {
        let hits = vec![
            (1_i64, "a-0", 0.2),
            (2, "b-0", 0.9),
            (1, "a-3", 0.7),
            (3, "c-1", 0.1),
            (1, "a-1", 0.5),
            (2, "b-2", 0.3),
        ];
        let deduped = dedupe_by_file(hits, |h| h.0, |h| h.2);
        assert_eq!(
            deduped,
            vec![(2, "b-0", 0.9), (1, "a-3", 0.7), (3, "c-1", 0.1)]
        );
    }

    #[test]
    fn test_dedupe_equal_scores_keep_first() {
        let hits = vec![(7_i64, "first", 0.4), (7, "second", 0.4)];
        assert_eq!(dedupe_by_file(hits, |h| h.0, |h| h.2), vec![(7, "first", 0.4)]);
    }

    #[test]
    fn test_config_validation() {
        assert!(SearchConfig::default().validate().is_ok());
        assert!(SearchConfig::default().with_rrf_k(0).validate().is_err());
        assert!(
            SearchConfig::default()
                .with_weights(1.5, 0.5)
                .validate()
                .is_err()
        );
        assert_eq!(SearchConfig::default().display_score(1.0), 100.0);
        assert!((SearchConfig::default().display_score(0.01) - 30.0).abs() < 1e-9);
    }
}
