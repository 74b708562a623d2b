//! Best-identity search over the enrolled embeddings.

use crate::store::Identities;
use crate::types::Embedding;

/// Score reported when there is nothing to compare against.
pub const NO_MATCH_SCORE: f32 = -1.0;

/// Result of scanning the store for a query embedding.
///
/// The score is not a decision: callers apply their own threshold via
/// [`BestMatch::accepted`].
#[derive(Debug, Clone, PartialEq)]
pub struct BestMatch {
    /// Name of the highest-scoring identity, `None` if the store was empty.
    pub name: Option<String>,
    /// Cosine similarity of that identity [-1, 1], or [`NO_MATCH_SCORE`].
    pub score: f32,
}

impl BestMatch {
    pub fn none() -> Self {
        Self {
            name: None,
            score: NO_MATCH_SCORE,
        }
    }

    /// The matched name if its score clears `threshold`.
    pub fn accepted(&self, threshold: f32) -> Option<&str> {
        match &self.name {
            Some(name) if self.score >= threshold => Some(name.as_str()),
            _ => None,
        }
    }
}

/// Strategy for comparing a query embedding against the enrolled identities.
pub trait Matcher {
    fn find_best_match(&self, query: &Embedding, identities: &Identities) -> BestMatch;
}

/// Cosine similarity matcher doing a full linear scan.
///
/// Identities are visited in name order and only a strictly greater score
/// replaces the current best, so ties always resolve to the first name.
#[derive(Debug, Default, Clone, Copy)]
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn find_best_match(&self, query: &Embedding, identities: &Identities) -> BestMatch {
        let mut best = BestMatch::none();

        for (name, stored) in identities {
            if stored.dim() != query.dim() {
                tracing::debug!(
                    name = %name,
                    stored = stored.dim(),
                    query = query.dim(),
                    "skipping identity with mismatched embedding dimension"
                );
                continue;
            }

            let score = query.similarity(stored);
            if best.name.is_none() || score > best.score {
                best = BestMatch {
                    name: Some(name.clone()),
                    score,
                };
            }
        }

        best
    }
}
