use super::{RelevanceModel, RerankError};
use crate::embedding::hashing::terms;
use async_trait::async_trait;
use std::collections::HashSet;

/// Offline relevance model scoring passages by query-term coverage.
///
/// The score is the fraction of distinct query terms found in the passage, plus a small bonus
/// for every adjacent query-term pair that also appears adjacently in the passage. Scores fall in
/// `[0, 1.5]`; no normalization across candidates is attempted.
#[derive(Debug, Default, Clone, Copy)]
pub struct LexicalRelevance;

const BIGRAM_WEIGHT: f32 = 0.5;

fn bigrams(words: &[String]) -> HashSet<(String, String)> {
    words
        .windows(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect()
}

pub(crate) fn lexical_score(query: &str, passage: &str) -> f32 {
    let query_terms: Vec<String> = terms(query).collect();
    if query_terms.is_empty() {
        return 0.0;
    }
    let distinct: HashSet<&String> = query_terms.iter().collect();
    let passage_terms: Vec<String> = terms(passage).collect();
    let passage_set: HashSet<&String> = passage_terms.iter().collect();

    let hits = distinct.iter().filter(|term| passage_set.contains(*term)).count();
    let coverage = hits as f32 / distinct.len() as f32;

    let query_pairs = bigrams(&query_terms);
    if query_pairs.is_empty() {
        return coverage;
    }
    let passage_pairs = bigrams(&passage_terms);
    let pair_hits = query_pairs.intersection(&passage_pairs).count();
    coverage + BIGRAM_WEIGHT * pair_hits as f32 / query_pairs.len() as f32
}

#[async_trait]
impl RelevanceModel for LexicalRelevance {
    async fn score(&self, query: &str, passages: &[&str]) -> Result<Vec<f32>, RerankError> {
        Ok(passages
            .iter()
            .map(|passage| lexical_score(query, passage))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_phrase_match_beats_scattered_terms() {
        let query = "buffer overflow exploit";
        let phrase = lexical_score(query, "A classic buffer overflow exploit overwrites the stack.");
        let scattered = lexical_score(query, "The exploit filled a buffer until overflow.");
        let unrelated = lexical_score(query, "Caesar ciphers shift letters.");
        assert!(phrase > scattered);
        assert!(scattered > unrelated);
        assert_eq!(unrelated, 0.0);
    }

    #[tokio::test]
    async fn scores_align_with_passages() {
        let scores = LexicalRelevance
            .score("sql injection", &["sql injection attack", "xss attack"])
            .await
            .expect("scores");
        assert_eq!(scores.len(), 2);
        assert!(scores[0] > scores[1]);
    }
}
