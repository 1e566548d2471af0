//! Similarity scoring between k-mer sets.
//!
//! Comparisons operate on the sorted key arrays only (counts are ignored),
//! so they work identically on full k-mer sets and MinHash fingerprints.

use std::str::FromStr;

use rayon::prelude::*;

use crate::error::{Result, StrainError};
use crate::kmer::count_common;

/// Scoring metric for pairwise k-mer set comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scoring {
    /// Intersection over union.
    Jaccard,
    /// Intersection over the smaller set; a proper subset scores 1.
    Minsize,
    /// Intersection over the larger set.
    Maxsize,
    /// Intersection over the mean set size, as used by Mash.
    Meansize,
    /// Intersection over the size of the second (reference) set; useful when
    /// comparing reads against an assembled reference.
    Reference,
}

impl FromStr for Scoring {
    type Err = StrainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "jaccard" => Ok(Scoring::Jaccard),
            "minsize" => Ok(Scoring::Minsize),
            "maxsize" => Ok(Scoring::Maxsize),
            "meansize" => Ok(Scoring::Meansize),
            "reference" => Ok(Scoring::Reference),
            other => Err(StrainError::InvalidConfig(format!(
                "unknown scoring method '{other}'"
            ))),
        }
    }
}

/// Numerator and denominator of the similarity between two sorted k-mer
/// arrays under the given metric.
pub fn similarity_fraction(a: &[u64], b: &[u64], scoring: Scoring) -> (f64, f64) {
    let intersection = count_common(a, b) as f64;
    let denominator = match scoring {
        Scoring::Jaccard => a.len() as f64 + b.len() as f64 - intersection,
        Scoring::Minsize => a.len().min(b.len()) as f64,
        Scoring::Maxsize => a.len().max(b.len()) as f64,
        Scoring::Meansize => (a.len() + b.len()) as f64 / 2.0,
        Scoring::Reference => b.len() as f64,
    };
    (intersection, denominator)
}

/// Similarity score between two sorted k-mer arrays; 0 when the denominator
/// is empty.
pub fn similarity_score(a: &[u64], b: &[u64], scoring: Scoring) -> f64 {
    let (numerator, denominator) = similarity_fraction(a, b, scoring);
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

/// One scored pair of named k-mer sets.
#[derive(Debug, Clone)]
pub struct Comparison {
    pub name1: String,
    pub name2: String,
    pub numerator: f64,
    pub denominator: f64,
}

impl Comparison {
    pub fn score(&self) -> f64 {
        if self.denominator > 0.0 {
            self.numerator / self.denominator
        } else {
            0.0
        }
    }
}

fn sort_comparisons(mut scores: Vec<Comparison>) -> Vec<Comparison> {
    scores.sort_by(|a, b| {
        b.score()
            .total_cmp(&a.score())
            .then_with(|| (a.name1.as_str(), a.name2.as_str()).cmp(&(b.name1.as_str(), b.name2.as_str())))
    });
    scores
}

/// Compare one sample against every reference set, highest scores first.
pub fn one_vs_all(
    sample: (&str, &[u64]),
    references: &[(String, Vec<u64>)],
    scoring: Scoring,
) -> Vec<Comparison> {
    let (sample_name, sample_kmers) = sample;
    let scores: Vec<Comparison> = references
        .par_iter()
        .map(|(name, kmers)| {
            let (numerator, denominator) = similarity_fraction(sample_kmers, kmers, scoring);
            Comparison {
                name1: sample_name.to_string(),
                name2: name.clone(),
                numerator,
                denominator,
            }
        })
        .collect();
    sort_comparisons(scores)
}

/// All pairwise comparisons between the given sets, highest scores first.
///
/// The asymmetric `reference` metric is meaningless here and is rejected.
pub fn all_vs_all(references: &[(String, Vec<u64>)], scoring: Scoring) -> Result<Vec<Comparison>> {
    if scoring == Scoring::Reference {
        return Err(StrainError::InvalidConfig(
            "'reference' scoring is meaningless in all-vs-all mode".into(),
        ));
    }

    let pairs: Vec<(usize, usize)> = (0..references.len())
        .flat_map(|i| (i + 1..references.len()).map(move |j| (i, j)))
        .collect();

    let scores: Vec<Comparison> = pairs
        .par_iter()
        .map(|&(i, j)| {
            let (name1, kmers1) = &references[i];
            let (name2, kmers2) = &references[j];
            let (numerator, denominator) = similarity_fraction(kmers1, kmers2, scoring);
            Comparison {
                name1: name1.clone(),
                name2: name2.clone(),
                numerator,
                denominator,
            }
        })
        .collect();
    Ok(sort_comparisons(scores))
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &[u64] = &[1, 2, 3, 4, 5, 6];
    const B: &[u64] = &[4, 5, 6, 7];

    #[test]
    fn test_similarity_scores() {
        // |A ∩ B| = 3, |A| = 6, |B| = 4.
        assert!((similarity_score(A, B, Scoring::Jaccard) - 3.0 / 7.0).abs() < 1e-12);
        assert!((similarity_score(A, B, Scoring::Minsize) - 3.0 / 4.0).abs() < 1e-12);
        assert!((similarity_score(A, B, Scoring::Maxsize) - 3.0 / 6.0).abs() < 1e-12);
        assert!((similarity_score(A, B, Scoring::Meansize) - 3.0 / 5.0).abs() < 1e-12);
        assert!((similarity_score(A, B, Scoring::Reference) - 3.0 / 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_similarity_fraction_matches_score() {
        for scoring in [
            Scoring::Jaccard,
            Scoring::Minsize,
            Scoring::Maxsize,
            Scoring::Meansize,
            Scoring::Reference,
        ] {
            let (num, den) = similarity_fraction(A, B, scoring);
            assert!((num / den - similarity_score(A, B, scoring)).abs() < 1e-12);
        }
    }

    #[test]
    fn test_empty_sets_score_zero() {
        assert_eq!(similarity_score(&[], &[], Scoring::Jaccard), 0.0);
        assert_eq!(similarity_score(A, &[], Scoring::Reference), 0.0);
    }

    #[test]
    fn test_scoring_from_str() {
        assert_eq!("meansize".parse::<Scoring>().unwrap(), Scoring::Meansize);
        assert!("cosine".parse::<Scoring>().is_err());
    }

    #[test]
    fn test_all_vs_all_rejects_reference_scoring() {
        let refs = vec![("a".to_string(), vec![1]), ("b".to_string(), vec![1])];
        assert!(matches!(
            all_vs_all(&refs, Scoring::Reference),
            Err(StrainError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_one_vs_all_sorted_descending() {
        let refs = vec![
            ("far".to_string(), vec![100, 200]),
            ("near".to_string(), vec![1, 2, 3]),
        ];
        let scores = one_vs_all(("sample", &[1, 2, 3, 4]), &refs, Scoring::Jaccard);
        assert_eq!(scores[0].name2, "near");
        assert!(scores[0].score() > scores[1].score());
    }

    #[test]
    fn test_all_vs_all_pair_count() {
        let refs: Vec<(String, Vec<u64>)> = (0..4)
            .map(|i| (format!("s{i}"), vec![i as u64]))
            .collect();
        let scores = all_vs_all(&refs, Scoring::Jaccard).unwrap();
        assert_eq!(scores.len(), 6);
    }
}
