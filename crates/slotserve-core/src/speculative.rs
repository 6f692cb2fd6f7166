//! Draft proposal by n-gram lookup over a slot's own history.

use derivative::Derivative;
use serde::{Deserialize, Serialize};

use crate::runtime::NULL_TOKEN;

#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct SpeculativeParams {
    /// Maximum number of draft tokens verified per step.
    #[derivative(Default(value = "8"))]
    pub n_max: usize,
    /// Drafts shorter than this are not worth verifying.
    #[derivative(Default(value = "2"))]
    pub n_min: usize,
    /// Longest n-gram matched against the history.
    #[derivative(Default(value = "3"))]
    pub ngram: usize,
}

/// Propose tokens that continue `history`, taken from what followed the most recent
/// earlier occurrence of its trailing n-gram. At most `limit` tokens are returned.
pub fn draft(history: &[u32], params: &SpeculativeParams, limit: usize) -> Vec<u32> {
    let limit = limit.min(params.n_max);
    if limit == 0 || limit < params.n_min {
        return vec![];
    }

    let len = history.len();
    for n in (1..=params.ngram).rev() {
        if len <= n {
            continue;
        }
        let key = &history[len - n..];
        if key.contains(&NULL_TOKEN) {
            continue;
        }

        let found = (0..len - n)
            .rev()
            .find(|&start| &history[start..start + n] == key);
        let Some(start) = found else {
            continue;
        };

        let draft: Vec<u32> = history[start + n..]
            .iter()
            .copied()
            .take_while(|&token| token != NULL_TOKEN)
            .take(limit)
            .collect();
        if draft.len() >= params.n_min.max(1) {
            return draft;
        }
    }
    vec![]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(n_max: usize, n_min: usize, ngram: usize) -> SpeculativeParams {
        SpeculativeParams {
            n_max,
            n_min,
            ngram,
        }
    }

    #[test]
    fn continues_repeated_pattern() {
        let history = [1, 2, 3, 4, 5, 1, 2, 3];
        assert_eq!(draft(&history, &params(4, 1, 3), 16), vec![4, 5, 1, 2]);
    }

    #[test]
    fn prefers_most_recent_occurrence() {
        let history = [7, 1, 9, 9, 7, 1, 8, 8, 7, 1];
        assert_eq!(draft(&history, &params(2, 1, 2), 16), vec![8, 8]);
    }

    #[test]
    fn falls_back_to_shorter_ngrams() {
        let history = [5, 6, 0, 6];
        assert_eq!(draft(&history, &params(3, 1, 3), 16), vec![0, 6]);
    }

    #[test]
    fn respects_limits() {
        let history = [1, 2, 3, 4, 1, 2];
        assert_eq!(draft(&history, &params(8, 1, 2), 1), vec![3]);
        assert!(draft(&history, &params(8, 3, 2), 2).is_empty());
        assert!(draft(&[1, 2, 3], &params(8, 1, 3), 16).is_empty());
    }

    #[test]
    fn never_drafts_media_positions() {
        let history = [1, 2, NULL_TOKEN, 4, 1, 2];
        assert!(draft(&history, &params(4, 1, 2), 16).is_empty());
    }
}
