//! Per-scaffold pileup evidence and derived calls.
//!
//! A [`ScaffoldCallData`] holds dense fixed-length counters indexed by
//! 0-based position: per-allele read counts and base-quality sums, rejected
//! reads, low-mapping-quality reads and mapping-quality sums. After
//! accumulation it is finalized in three passes: coverage, allele calls,
//! gap detection.

use indexmap::IndexMap;
use log::{info, warn};
use ndarray::{Array3, Axis};

use crate::call::allele::{Allele, NUM_ALLELES};
use crate::error::{Result, StrainError};
use crate::reference::{self, Reference};
use crate::utils::{self, median};

/// A no-evidence region `[start, end)` on one scaffold, a proxy for deleted
/// or diverged content in the sampled strain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    pub start: usize,
    pub end: usize,
}

impl Gap {
    pub fn length(&self) -> usize {
        self.end - self.start
    }
}

/// Pileup statistics for a single scaffold.
pub struct ScaffoldCallData {
    pub name: String,
    pub length: usize,
    /// Uniquely mapped reads assigned to this scaffold.
    pub read_count: u64,

    /// Reference allele per position.
    pub refmask: Vec<Allele>,
    /// Per position: `[0, a]` counts of good reads supporting allele `a`,
    /// `[1, a]` their summed base qualities.
    pub alleles: Array3<u32>,
    /// Reads rejected at this position.
    pub bad: Vec<u32>,
    /// Otherwise-good reads with low mapping quality.
    pub lowmq_count: Vec<u32>,
    /// Sum of mapping qualities.
    pub mq_sum: Vec<u32>,

    /// Good-read depth plus low-mapping-quality reads per position.
    pub coverage: Vec<u64>,
    /// Positions with implausibly high coverage (conserved regions).
    pub high_coverage: Vec<bool>,
    /// Alleles with any quality evidence.
    pub weak: Vec<Allele>,
    /// Alleles passing the confident-call thresholds.
    pub strong: Vec<Allele>,
    /// Positions dominated by low-mapping-quality reads.
    pub lowmq: Vec<bool>,
    pub gaps: Vec<Gap>,

    pub mean_coverage: f64,
    pub median_coverage: f64,
    pub coverage_cutoff: f64,
    /// Fraction of this scaffold shared with other scaffolds, from the
    /// reference metadata sidecar.
    pub repetitiveness: f64,
}

impl ScaffoldCallData {
    pub fn new(name: &str, length: usize) -> Self {
        ScaffoldCallData {
            name: name.to_string(),
            length,
            read_count: 0,
            refmask: vec![Allele::N; length],
            alleles: Array3::zeros((length, 2, NUM_ALLELES)),
            bad: vec![0; length],
            lowmq_count: vec![0; length],
            mq_sum: vec![0; length],
            coverage: Vec::new(),
            high_coverage: Vec::new(),
            weak: Vec::new(),
            strong: Vec::new(),
            lowmq: Vec::new(),
            gaps: Vec::new(),
            mean_coverage: 0.0,
            median_coverage: 0.0,
            coverage_cutoff: 0.0,
            repetitiveness: 0.0,
        }
    }

    /// Fill the reference mask from the scaffold sequence.
    pub fn set_refmask(&mut self, sequence: &[u8]) {
        for (mask, &base) in self.refmask.iter_mut().zip(sequence) {
            *mask = Allele::from_base(base);
        }
    }

    /// Count of good reads at one position.
    pub fn depth(&self, loc: usize) -> u64 {
        (0..NUM_ALLELES)
            .map(|a| self.alleles[[loc, 0, a]] as u64)
            .sum()
    }

    /// Sum of all quality evidence at one position.
    pub fn qual_total(&self, loc: usize) -> u64 {
        (0..NUM_ALLELES)
            .map(|a| self.alleles[[loc, 1, a]] as u64)
            .sum()
    }

    /// Count of all reads at one position, including rejected ones.
    pub fn total_depth(&self, loc: usize) -> u64 {
        self.depth(loc) + self.lowmq_count[loc] as u64
    }

    pub fn allele_count(&self, loc: usize, allele: Allele) -> u32 {
        allele.index().map_or(0, |ix| self.alleles[[loc, 0, ix]])
    }

    pub fn allele_qual(&self, loc: usize, allele: Allele) -> u32 {
        allele.index().map_or(0, |ix| self.alleles[[loc, 1, ix]])
    }

    /// Fraction of quality evidence supporting the reference base.
    pub fn ref_fraction(&self, loc: usize) -> f64 {
        let total = self.qual_total(loc);
        if total == 0 {
            return 0.0;
        }
        self.allele_qual(loc, self.refmask[loc]) as f64 / total as f64
    }

    /// Mean mapping quality of good reads at one position.
    pub fn mean_mq(&self, loc: usize) -> f64 {
        let depth = self.depth(loc);
        if depth == 0 {
            return 0.0;
        }
        self.mq_sum[loc] as f64 / depth as f64
    }

    /// First finalization pass: per-position coverage and the high-coverage
    /// mask.
    ///
    /// Coverage counts good reads plus low-mapping-quality reads. The cutoff
    /// for plausible coverage comes from the Poisson quantile at the median;
    /// in metagenomic samples, positions far beyond it are usually conserved
    /// regions attracting reads from other organisms, where no confident
    /// call about the target strain is possible. The median is used rather
    /// than the mean because the mean itself may be dominated by such
    /// regions.
    pub fn calculate_coverage(&mut self) -> Result<()> {
        self.coverage = self
            .alleles
            .index_axis(Axis(1), 0)
            .sum_axis(Axis(1))
            .iter()
            .zip(&self.lowmq_count)
            .map(|(&good, &lowmq)| good as u64 + lowmq as u64)
            .collect();

        let total: u64 = self.coverage.iter().sum();
        self.mean_coverage = if self.length > 0 {
            total as f64 / self.length as f64
        } else {
            0.0
        };
        self.median_coverage = median(&self.coverage);

        self.coverage_cutoff = utils::poisson_coverage_cutoff(self.median_coverage.max(0.5))?;
        info!(
            "Scaffold {} has mean coverage {:.2} (median: {}). High coverage cutoff: {}",
            self.name, self.mean_coverage, self.median_coverage, self.coverage_cutoff
        );

        self.high_coverage = self
            .coverage
            .iter()
            .map(|&c| c as f64 > self.coverage_cutoff)
            .collect();
        Ok(())
    }

    /// Second finalization pass: weak and strong allele calls.
    ///
    /// An allele has weak evidence when any quality supports it; it is
    /// called strong when its quality sum exceeds `min_pileup_qual` and its
    /// share of the position's total quality exceeds `min_qual_frac`. High
    /// coverage positions are never called.
    pub fn call_alleles(&mut self, min_pileup_qual: u32, min_qual_frac: f64) {
        self.weak = vec![Allele::N; self.length];
        self.strong = vec![Allele::N; self.length];

        for pos in 0..self.length {
            if self.high_coverage[pos] {
                continue;
            }

            let qual_sum = self.qual_total(pos);
            let mut weak = Allele::N;
            let mut strong = Allele::N;

            for (ix, mask) in Allele::MASKS.iter().enumerate() {
                let qual = self.alleles[[pos, 1, ix]];
                if qual > 0 {
                    weak = weak | *mask;
                }
                let qual_frac = if qual_sum > 0 {
                    qual as f64 / qual_sum as f64
                } else {
                    0.0
                };
                if qual > min_pileup_qual && qual_frac > min_qual_frac {
                    strong = strong | *mask;
                }
            }

            self.weak[pos] = weak;
            self.strong[pos] = strong;
        }
    }

    /// Third finalization pass: coverage gaps.
    ///
    /// A position counts as covered when a weak call is possible or when it
    /// is dominated by low-mapping-quality reads (a repeat region will never
    /// be called, but that does not make it a gap). Maximal uncovered runs of
    /// at least the coverage-scaled minimum size are reported.
    pub fn find_gaps(&mut self, min_gap_size: u32) {
        let min_size = utils::scale_min_gap_size(min_gap_size, self.mean_coverage);
        info!(
            "{}: scaled min-gap size {} at mean coverage {:.2}",
            self.name, min_size, self.mean_coverage
        );

        self.lowmq = (0..self.length)
            .map(|pos| {
                let lowmq = self.lowmq_count[pos];
                lowmq > 1 && lowmq as u64 > self.depth(pos)
            })
            .collect();

        let covered: Vec<bool> = (0..self.length)
            .map(|pos| !self.weak[pos].is_empty() || self.lowmq[pos])
            .collect();

        self.gaps = utils::find_consecutive_runs(&covered, min_size)
            .into_iter()
            .filter(|&(_, _, value)| !value)
            .map(|(start, end, _)| Gap { start, end })
            .collect();
    }
}

/// All per-scaffold call data plus genome-wide statistics for one run.
pub struct VariantCallData {
    pub scaffolds: IndexMap<String, ScaffoldCallData>,
    pub reference_length: usize,
    pub min_gap_size: u32,
    pub mean_coverage: f64,
    pub median_coverage: f64,
    pub uniquely_mapped_reads: u64,
}

impl VariantCallData {
    /// Create zeroed call data for the given `(name, length)` scaffolds.
    pub fn new<'a>(
        scaffolds: impl IntoIterator<Item = (&'a str, usize)>,
        min_gap_size: u32,
    ) -> Self {
        let scaffolds: IndexMap<String, ScaffoldCallData> = scaffolds
            .into_iter()
            .map(|(name, length)| (name.to_string(), ScaffoldCallData::new(name, length)))
            .collect();
        let reference_length = scaffolds.values().map(|s| s.length).sum();

        VariantCallData {
            scaffolds,
            reference_length,
            min_gap_size,
            mean_coverage: 0.0,
            median_coverage: 0.0,
            uniquely_mapped_reads: 0,
        }
    }

    /// Fill reference masks and per-scaffold repetitiveness from the
    /// reference and its optional metadata sidecar.
    pub fn load_reference(&mut self, reference: &Reference) -> Result<()> {
        for (name, data) in &mut self.scaffolds {
            let sequence = reference.scaffold(name).ok_or_else(|| {
                StrainError::MissingData(format!(
                    "scaffold '{}' not in reference {}",
                    name,
                    reference.path.display()
                ))
            })?;
            data.set_refmask(sequence);
        }

        if let Some(metadata) = reference::load_metadata(&reference.path)? {
            for (name, repetitiveness) in metadata.repetitiveness {
                if let Some(data) = self.scaffolds.get_mut(&name) {
                    info!("Scaffold {name} repetitiveness: {repetitiveness:.2}");
                    data.repetitiveness = repetitiveness;
                }
            }
        }
        Ok(())
    }

    fn scaffold_mut(&mut self, scaffold: &str) -> Result<&mut ScaffoldCallData> {
        self.scaffolds.get_mut(scaffold).ok_or_else(|| {
            StrainError::MissingData(format!("scaffold '{scaffold}' not in reference"))
        })
    }

    /// Record one uniquely mapped read for abundance estimation.
    pub fn inc_uniquely_mapped_reads(&mut self, scaffold: &str) -> Result<()> {
        self.uniquely_mapped_reads += 1;
        self.scaffold_mut(scaffold)?.read_count += 1;
        Ok(())
    }

    /// Record a rejected read at one position.
    pub fn bad_read(&mut self, scaffold: &str, pos: usize) -> Result<()> {
        let data = self.scaffold_mut(scaffold)?;
        if pos < data.length {
            data.bad[pos] += 1;
        }
        Ok(())
    }

    /// Record an otherwise-good read with low mapping quality. Out-of-range
    /// positions (from propagated alternative locations) are ignored with a
    /// warning.
    pub fn low_mapping_quality(&mut self, scaffold: &str, pos: usize) -> Result<()> {
        let data = self.scaffold_mut(scaffold)?;
        if pos >= data.length {
            warn!(
                "Position {} for scaffold {} of length {} out of bounds, ignoring",
                pos, data.name, data.length
            );
            return Ok(());
        }
        data.lowmq_count[pos] += 1;
        Ok(())
    }

    /// Add to the mapping-quality sum at one position.
    pub fn update_mapping_quality(&mut self, scaffold: &str, pos: usize, mq: u8) -> Result<()> {
        let data = self.scaffold_mut(scaffold)?;
        if pos < data.length {
            data.mq_sum[pos] += mq as u32;
        }
        Ok(())
    }

    /// Record a good read supporting `allele` at one position. With `rc`,
    /// the reverse-complement allele is recorded instead (used when
    /// propagating to an alternative location on the other strand).
    pub fn good_read(
        &mut self,
        scaffold: &str,
        pos: usize,
        allele: Allele,
        base_quality: u8,
        mapping_quality: u8,
        rc: bool,
    ) -> Result<()> {
        let base = if rc { allele.rc() } else { allele };
        let Some(ix) = base.index() else {
            return Ok(());
        };

        let data = self.scaffold_mut(scaffold)?;
        if pos >= data.length {
            warn!(
                "Position {} for scaffold {} of length {} out of bounds, ignoring",
                pos, data.name, data.length
            );
            return Ok(());
        }
        data.alleles[[pos, 0, ix]] += 1;
        data.alleles[[pos, 1, ix]] += base_quality as u32;
        data.mq_sum[pos] += mapping_quality as u32;
        Ok(())
    }

    /// Finalization pass 1 over all scaffolds, plus genome-wide mean and
    /// median coverage.
    pub fn analyze_coverage(&mut self) -> Result<()> {
        for data in self.scaffolds.values_mut() {
            data.calculate_coverage()?;
        }

        let all_coverage: Vec<u64> = self
            .scaffolds
            .values()
            .flat_map(|s| s.coverage.iter().copied())
            .collect();
        let total: u64 = all_coverage.iter().sum();
        self.mean_coverage = if self.reference_length > 0 {
            total as f64 / self.reference_length as f64
        } else {
            0.0
        };
        self.median_coverage = median(&all_coverage);
        Ok(())
    }

    /// Finalization pass 2 over all scaffolds.
    pub fn call_alleles(&mut self, min_pileup_qual: u32, min_qual_frac: f64) {
        for data in self.scaffolds.values_mut() {
            data.call_alleles(min_pileup_qual, min_qual_frac);
        }
    }

    /// Finalization pass 3 over all scaffolds.
    pub fn find_gaps(&mut self) {
        let min_gap_size = self.min_gap_size;
        for data in self.scaffolds.values_mut() {
            data.find_gaps(min_gap_size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform_scaffold(length: usize, depth: u32, qual: u32) -> ScaffoldCallData {
        let mut data = ScaffoldCallData::new("chr", length);
        data.set_refmask(&vec![b'A'; length]);
        for pos in 0..length {
            data.alleles[[pos, 0, 0]] = depth;
            data.alleles[[pos, 1, 0]] = depth * qual;
        }
        data
    }

    #[test]
    fn test_calculate_coverage_uniform() {
        let mut data = uniform_scaffold(100, 30, 30);
        data.calculate_coverage().unwrap();

        assert!(data.coverage.iter().all(|&c| c == 30));
        assert_eq!(data.mean_coverage, 30.0);
        assert_eq!(data.median_coverage, 30.0);
        // Poisson(30) quantile at 1-1e-7 is far below 2x coverage.
        assert!(data.coverage_cutoff > 30.0);
        assert!(data.high_coverage.iter().all(|&h| !h));
    }

    #[test]
    fn test_coverage_includes_lowmq() {
        let mut data = uniform_scaffold(10, 5, 30);
        data.lowmq_count[3] = 7;
        data.calculate_coverage().unwrap();
        assert_eq!(data.coverage[3], 12);
        assert_eq!(data.depth(3), 5);
        assert_eq!(data.total_depth(3), 12);
    }

    #[test]
    fn test_call_alleles_uniform_reference() {
        let mut data = uniform_scaffold(1000, 30, 30);
        data.calculate_coverage().unwrap();
        data.call_alleles(50, 0.1);

        for pos in 0..data.length {
            assert_eq!(data.strong[pos], data.refmask[pos]);
            assert_eq!(data.weak[pos], data.refmask[pos]);
        }
    }

    #[test]
    fn test_call_alleles_mixed_position() {
        let mut data = uniform_scaffold(10, 30, 30);
        // Position 5 also carries a well-supported T and a single weak G.
        data.alleles[[5, 0, 3]] = 20;
        data.alleles[[5, 1, 3]] = 600;
        data.alleles[[5, 0, 2]] = 1;
        data.alleles[[5, 1, 2]] = 20;
        data.calculate_coverage().unwrap();
        data.call_alleles(50, 0.1);

        assert_eq!(data.strong[5], Allele::A | Allele::T);
        assert_eq!(data.weak[5], Allele::A | Allele::T | Allele::G);
        assert!(!data.strong[5].is_single());
    }

    #[test]
    fn test_high_coverage_positions_not_called() {
        let mut data = uniform_scaffold(100, 30, 30);
        // One conserved-looking position with far too many reads.
        data.alleles[[50, 0, 0]] = 500;
        data.alleles[[50, 1, 0]] = 15000;
        data.calculate_coverage().unwrap();
        data.call_alleles(50, 0.1);

        assert!(data.high_coverage[50]);
        assert_eq!(data.strong[50], Allele::N);
        assert_eq!(data.weak[50], Allele::N);
        assert_eq!(data.strong[49], Allele::A);
    }

    #[test]
    fn test_find_gaps_uniform_coverage_has_none() {
        let mut data = uniform_scaffold(1000, 30, 30);
        data.calculate_coverage().unwrap();
        data.call_alleles(50, 0.1);
        data.find_gaps(100);
        assert!(data.gaps.is_empty());
    }

    #[test]
    fn test_find_gaps_detects_uncovered_run() {
        let mut data = ScaffoldCallData::new("chr", 1000);
        data.set_refmask(&vec![b'C'; 1000]);
        for pos in (0..400).chain(600..1000) {
            data.alleles[[pos, 0, 1]] = 30;
            data.alleles[[pos, 1, 1]] = 900;
        }
        data.calculate_coverage().unwrap();
        data.call_alleles(50, 0.1);
        data.find_gaps(100);

        assert_eq!(data.gaps, vec![Gap { start: 400, end: 600 }]);
        assert_eq!(data.gaps[0].length(), 200);
    }

    #[test]
    fn test_find_gaps_lowmq_region_is_covered() {
        let mut data = ScaffoldCallData::new("chr", 1000);
        data.set_refmask(&vec![b'C'; 1000]);
        for pos in (0..400).chain(600..1000) {
            data.alleles[[pos, 0, 1]] = 30;
            data.alleles[[pos, 1, 1]] = 900;
        }
        // The uncovered stretch is full of low-MQ reads: a repeat, not a gap.
        for pos in 400..600 {
            data.lowmq_count[pos] = 10;
        }
        data.calculate_coverage().unwrap();
        data.call_alleles(50, 0.1);
        data.find_gaps(100);

        assert!(data.lowmq[400]);
        assert!(data.gaps.is_empty());
    }

    #[test]
    fn test_gap_scaling_at_low_coverage() {
        let mut data = ScaffoldCallData::new("chr", 1000);
        data.set_refmask(&vec![b'C'; 1000]);
        // Sparse coverage: mean well below 1, so the minimum gap size is
        // scaled up and a 200-base hole no longer qualifies.
        for pos in (0..400).step_by(10).chain((600..1000).step_by(10)) {
            data.alleles[[pos, 0, 1]] = 1;
            data.alleles[[pos, 1, 1]] = 30;
        }
        data.calculate_coverage().unwrap();
        data.call_alleles(0, 0.0);
        data.find_gaps(200);
        assert!(data.gaps.iter().all(|g| g.length() > 200));
    }

    #[test]
    fn test_variant_call_data_updates() {
        let mut data = VariantCallData::new([("chr1", 100), ("chr2", 50)], 100);

        data.inc_uniquely_mapped_reads("chr1").unwrap();
        data.good_read("chr1", 10, Allele::G, 30, 60, false).unwrap();
        data.good_read("chr1", 10, Allele::C, 30, 60, true).unwrap();
        data.bad_read("chr2", 5).unwrap();
        data.low_mapping_quality("chr2", 7).unwrap();
        data.update_mapping_quality("chr2", 7, 2).unwrap();

        let chr1 = &data.scaffolds["chr1"];
        assert_eq!(chr1.read_count, 1);
        // The rc flag complements the allele: C -> G.
        assert_eq!(chr1.allele_count(10, Allele::G), 2);
        assert_eq!(chr1.allele_qual(10, Allele::G), 60);
        assert_eq!(chr1.mq_sum[10], 120);

        let chr2 = &data.scaffolds["chr2"];
        assert_eq!(chr2.bad[5], 1);
        assert_eq!(chr2.lowmq_count[7], 1);
        assert_eq!(chr2.mq_sum[7], 2);

        assert!(matches!(
            data.good_read("chrX", 0, Allele::A, 30, 60, false),
            Err(StrainError::MissingData(_))
        ));
    }

    #[test]
    fn test_out_of_range_propagation_ignored() {
        let mut data = VariantCallData::new([("chr1", 10)], 100);
        data.low_mapping_quality("chr1", 500).unwrap();
        data.good_read("chr1", 500, Allele::A, 30, 2, false).unwrap();
        assert!(data.scaffolds["chr1"].lowmq_count.iter().all(|&c| c == 0));
    }

    #[test]
    fn test_analyze_coverage_genome_wide() {
        let mut data = VariantCallData::new([("chr1", 100), ("chr2", 100)], 100);
        for pos in 0..100 {
            data.scaffolds.get_mut("chr1").unwrap().alleles[[pos, 0, 0]] = 20;
        }
        data.analyze_coverage().unwrap();
        assert_eq!(data.mean_coverage, 10.0);
        assert_eq!(data.median_coverage, 10.0);
    }

    #[test]
    fn test_ref_fraction_and_mean_mq() {
        let mut data = uniform_scaffold(10, 10, 30);
        data.mq_sum[0] = 600;
        assert_eq!(data.ref_fraction(0), 1.0);
        assert_eq!(data.mean_mq(0), 60.0);

        let empty = ScaffoldCallData::new("chr", 10);
        assert_eq!(empty.ref_fraction(0), 0.0);
        assert_eq!(empty.mean_mq(0), 0.0);
    }
}
