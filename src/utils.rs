//! Small numeric and bookkeeping helpers shared across the toolkit.

use std::path::Path;

use statrs::distribution::{DiscreteCDF, Poisson};

use crate::error::{Result, StrainError};

/// Percentage of `part` in `whole`; 0 when `whole` is zero.
pub fn pct(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

/// Median of a slice of unsigned values, averaging the two middle elements
/// for even lengths. Returns 0 for an empty slice.
pub fn median<T: Copy + Into<u64> + Ord>(values: &[T]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<T> = values.to_vec();
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid].into() as f64
    } else {
        (sorted[mid - 1].into() as f64 + sorted[mid].into() as f64) / 2.0
    }
}

/// Lander-Waterman expected fraction of a genome covered at the given mean
/// coverage, assuming uniformly distributed reads.
pub fn lander_waterman(coverage: f64) -> f64 {
    1.0 - (-coverage).exp()
}

/// Coverage above which a position is considered implausibly deep.
///
/// Uses the inverse Poisson CDF at one part in 10M for low coverage; for
/// higher coverage the quantile is essentially linear in the mean, so a
/// linear formula is used instead.
pub fn poisson_coverage_cutoff(mean: f64) -> Result<f64> {
    const CUTOFF: f64 = 0.9999999;

    if mean < 50.0 {
        let dist = Poisson::new(mean)
            .map_err(|e| StrainError::InvalidConfig(format!("Poisson mean {mean}: {e}")))?;
        Ok(dist.inverse_cdf(CUTOFF) as f64)
    } else {
        Ok((mean * 1.5 + 15.0).ceil())
    }
}

/// Scale the minimum significant gap size by the Lander-Waterman expected
/// covered fraction, so low-coverage samples do not report spurious gaps.
pub fn scale_min_gap_size(min_gap: u32, mean_coverage: f64) -> usize {
    let lw = lander_waterman(mean_coverage);
    if lw > 0.0 {
        (min_gap as f64 / lw) as usize
    } else {
        min_gap as usize
    }
}

/// Maximal runs of equal values in `values`, as `(start, end, value)`
/// half-open intervals, keeping only runs of at least `min_len` positions.
pub fn find_consecutive_runs(values: &[bool], min_len: usize) -> Vec<(usize, usize, bool)> {
    let mut runs = Vec::new();
    let mut start = 0;
    for i in 1..=values.len() {
        if i == values.len() || values[i] != values[start] {
            if i - start >= min_len.max(1) {
                runs.push((start, i, values[start]));
            }
            start = i;
        }
    }
    runs
}

/// Jukes-Cantor distance from an observed SNP rate.
pub fn jukes_cantor_distance(snp_rate: f64) -> f64 {
    -0.75 * (1.0 - (4.0 / 3.0) * snp_rate).ln()
}

/// Kimura two-parameter distance from transition and transversion fractions.
pub fn kimura_distance(transitions: f64, transversions: f64) -> f64 {
    -0.5 * ((1.0 - 2.0 * transitions - transversions) * (1.0 - 2.0 * transversions).sqrt()).ln()
}

/// Parse a count with an optional K/M/G suffix, e.g. "500M" or "2G".
pub fn parse_num_suffix(value: &str) -> Result<u64> {
    let value = value.trim();
    let (digits, multiplier) = match value.chars().last() {
        Some('k') | Some('K') => (&value[..value.len() - 1], 1_000u64),
        Some('m') | Some('M') => (&value[..value.len() - 1], 1_000_000),
        Some('g') | Some('G') => (&value[..value.len() - 1], 1_000_000_000),
        _ => (value, 1),
    };
    let base: u64 = digits
        .parse()
        .map_err(|_| StrainError::InvalidConfig(format!("not a count: '{value}'")))?;
    Ok(base * multiplier)
}

/// Base name of a path without its final extension, used to derive sample
/// and strain names from file names.
pub fn name_from_path(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}
