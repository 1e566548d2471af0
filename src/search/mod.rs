//! Strain genome search: iterative decomposition of a sample k-mer set
//! against a pan-genome database.
//!
//! Each iteration scores every candidate strain by how well it explains the
//! remaining sample k-mers, reports the winner (and optionally runners-up),
//! then subtracts the winner's k-mers from the sample before the next
//! iteration. Scoring within one iteration is embarrassingly parallel;
//! exclusion writes happen sequentially between iterations, so parallel and
//! sequential scoring produce identical results.

use std::io::Write;
use std::path::Path;

use log::info;
use rayon::prelude::*;

use crate::database::{PanGenome, StrainKmerSet};
use crate::error::{Result, StrainError};
use crate::kmer::{self, store, KmerSet};
use crate::utils::{median, name_from_path};

/// Sample k-mer set with its original totals preserved.
///
/// The set itself is progressively reduced during a search run (first to its
/// intersection with the pan-genome, then by per-iteration exclusions);
/// `total_kmers` and `distinct_kmers` keep the pre-reduction values for
/// reporting.
#[derive(Debug, Clone)]
pub struct Sample {
    pub name: String,
    pub set: KmerSet,
    pub total_kmers: u64,
    pub distinct_kmers: usize,
}

impl Sample {
    pub fn new(name: String, set: KmerSet) -> Self {
        let total_kmers = set.total_counts();
        let distinct_kmers = set.distinct();
        Sample {
            name,
            set,
            total_kmers,
            distinct_kmers,
        }
    }

    /// Load a sample from a k-mer set container, deriving its name from the
    /// file name.
    pub fn from_file(path: &Path) -> Result<Self> {
        info!("Loading sample {}", path.display());
        let set = store::load_kmerset(path)?;
        let sample = Sample::new(name_from_path(path), set);
        info!(
            "{} distinct k-mers, {} total k-mers",
            sample.distinct_kmers, sample.total_kmers
        );
        Ok(sample)
    }
}

/// Search configuration.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// Maximum strains to look for.
    pub iterations: usize,
    /// Best matches reported per iteration.
    pub top: usize,
    /// Minimum score for a winner to be accepted.
    pub min_score: f64,
    /// Minimum evenness for a candidate to survive scoring.
    pub min_evenness: f64,
    /// Candidates keeping less than this fraction of their original distinct
    /// k-mers after exclusion are no longer scored.
    pub min_frac: f64,
    /// Minimum fraction of remaining sample k-mers a candidate must account
    /// for.
    pub min_acct: f64,
    /// Multiplier over the median sample frequency above which a k-mer is
    /// considered non-specific and excluded up front.
    pub universal: f64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            iterations: 5,
            top: 1,
            min_score: 0.01,
            min_evenness: 0.6,
            min_frac: 0.01,
            min_acct: 0.01,
            universal: 10.0,
        }
    }
}

impl SearchConfig {
    fn validate(&self) -> Result<()> {
        if self.top < 1 {
            return Err(StrainError::InvalidConfig("top must be at least 1".into()));
        }
        for (name, value) in [
            ("min_score", self.min_score),
            ("min_evenness", self.min_evenness),
            ("min_frac", self.min_frac),
            ("min_acct", self.min_acct),
            ("universal", self.universal),
        ] {
            if value < 0.0 || !value.is_finite() {
                return Err(StrainError::InvalidConfig(format!(
                    "{name} must be a non-negative number, got {value}"
                )));
            }
        }
        Ok(())
    }
}

/// Score record for one candidate strain in one iteration.
#[derive(Debug, Clone)]
pub struct StrainScore {
    pub strain: String,
    /// Original distinct k-mers of the strain.
    pub gkmers: usize,
    /// Distinct k-mers remaining after exclusions.
    pub ikmers: usize,
    /// Distinct sample k-mers remaining this iteration.
    pub skmers: usize,
    /// Fraction of the strain's remaining k-mers seen in the sample.
    pub cov: f64,
    /// Mean sample frequency of the shared k-mers.
    pub kcov: f64,
    /// Mean genome coverage implied by the shared k-mers.
    pub gcov: f64,
    /// Fraction of remaining sample k-mers accounted for by this strain.
    pub acct: f64,
    /// Observed over Lander-Waterman-expected coverage fraction.
    pub even: f64,
    /// Coverage weighted by inverse pan-genome occurrence.
    pub wcov: f64,
    /// Specificity of the observed k-mers for this strain.
    pub spec: f64,
    /// Unweighted score: cov * acct * min(even, 1/even).
    pub score0: f64,
    /// Final score with the specificity component.
    pub score: f64,
}

/// Sample-level statistics reported before any strains.
#[derive(Debug, Clone)]
pub struct SampleStats {
    pub sample: String,
    pub total_kmers: u64,
    pub distinct_kmers: usize,
    /// Sample k-mers (with multiplicity) shared with the pan-genome.
    pub pan_kmers: u64,
    /// Mean pan-genome k-mer frequency in the sample.
    pub pan_kcov: f64,
    /// Percentage of all sample k-mers found in the pan-genome, scaled by
    /// the fingerprint fraction in fingerprint mode.
    pub pan_pct: f64,
}

/// Result of one search run: sample statistics plus labelled strain scores.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub stats: SampleStats,
    /// `(iteration label, score)` pairs; labels are `i`, or `i.rank` when
    /// more than one strain is reported per iteration.
    pub strains: Vec<(String, StrainScore)>,
}

/// The iterative strain search engine.
pub struct StrainSearch {
    config: SearchConfig,
}

impl StrainSearch {
    pub fn new(config: SearchConfig) -> Result<Self> {
        config.validate()?;
        Ok(StrainSearch { config })
    }

    /// Find the reference strains closest to the strains present in
    /// `sample`.
    ///
    /// The sample and the pan-genome's cached strain sets are consumed by
    /// the run: both are reduced in place. Open a fresh pan-genome and
    /// sample per independent search.
    ///
    /// # Arguments
    ///
    /// * `pan` - The pan-genome database to search against.
    /// * `sample` - The sample k-mer set, totals preserved for reporting.
    /// * `score_strains` - Restrict scoring to these strains (primarily for
    ///   debugging); all database strains when `None`.
    pub fn find_close_references(
        &self,
        pan: &mut PanGenome,
        sample: &mut Sample,
        score_strains: Option<&[String]>,
    ) -> Result<SearchResult> {
        let strains: Vec<String> = match score_strains {
            Some(names) => names.to_vec(),
            None => pan.strain_names(),
        };

        info!(
            "Sample {} has {} k-mers",
            sample.name,
            sample.set.total_counts()
        );

        // Reduce the sample to its intersection with the pan-genome; nothing
        // outside it can ever be scored.
        sample.set.intersect(&pan.set.kmers);

        // Exclude k-mers occurring in the sample far more often than the
        // median pan-genome k-mer frequency. These are conserved across many
        // organisms and carry no strain signal.
        let universal_limit = median(&sample.set.counts) * self.config.universal;
        let mut excludes: Vec<u64> = sample
            .set
            .kmers
            .iter()
            .zip(&sample.set.counts)
            .filter(|&(_, &c)| c as f64 > universal_limit)
            .map(|(&km, _)| km)
            .collect();
        sample.set.exclude(&excludes);

        let pan_kmers = sample.set.total_counts();
        let pan_kcov = if sample.set.distinct() > 0 {
            pan_kmers as f64 / sample.set.distinct() as f64
        } else {
            0.0
        };
        let mut pan_pct = if sample.total_kmers > 0 {
            pan_kmers as f64 * 100.0 / sample.total_kmers as f64
        } else {
            0.0
        };
        if pan.use_fingerprint {
            pan_pct /= pan.fingerprint_fraction;
        }

        info!(
            "Sample {} has {} k-mers ({} distinct) in common with pan-genome database ({:.2}%)",
            sample.name,
            pan_kmers,
            sample.set.distinct(),
            pan_pct
        );

        let mut result = SearchResult {
            stats: SampleStats {
                sample: sample.name.clone(),
                total_kmers: sample.total_kmers,
                distinct_kmers: sample.distinct_kmers,
                pan_kmers,
                pan_kcov,
                pan_pct,
            },
            strains: Vec::new(),
        };

        for iteration in 0..self.config.iterations {
            // Apply the pending exclusions to every candidate, sequentially.
            // Exclusion is monotone, so re-applying a set already excluded
            // from a strain is a no-op.
            for name in &strains {
                pan.load_strain(name)?.exclude(&excludes);
            }

            // Scoring only reads the pan-genome and sample.
            let pan_set: &KmerSet = &pan.set;
            let sample_view: &Sample = sample;
            let views: Vec<&StrainKmerSet> = strains
                .iter()
                .filter_map(|name| pan.strain(name))
                .collect();
            let mut scores: Vec<StrainScore> = views
                .par_iter()
                .filter_map(|strain| self.score_strain(pan_set, strain, sample_view))
                .filter(|score| score.even >= self.config.min_evenness)
                .collect();

            scores.sort_by(|a, b| {
                b.score
                    .total_cmp(&a.score)
                    .then_with(|| a.strain.cmp(&b.strain))
            });

            if scores.is_empty() {
                info!("No good strains found, quitting");
                break;
            }

            let winner = &scores[0];
            if winner.score < self.config.min_score {
                info!(
                    "Score {:.3} for {} below minimum {:.3}, quitting",
                    winner.score, winner.strain, self.config.min_score
                );
                break;
            }

            info!("Found strain {}, score {:.3}", winner.strain, winner.score);
            let winner_name = winner.strain.clone();

            for (rank, score) in scores
                .iter()
                .take(self.config.top.min(scores.len()))
                .enumerate()
            {
                let label = if self.config.top == 1 {
                    iteration.to_string()
                } else {
                    format!("{iteration}.{rank}")
                };
                result.strains.push((label, score.clone()));
            }

            // The winner's remaining k-mers become the exclusion set for the
            // next iteration and leave the sample immediately.
            excludes = pan
                .strain(&winner_name)
                .map(|s| s.set.kmers.clone())
                .unwrap_or_default();
            sample.set.exclude(&excludes);
        }

        Ok(result)
    }

    /// Score one candidate strain against the remaining sample.
    ///
    /// Returns `None` when too little of the strain is left after exclusion,
    /// when it shares no k-mers with the sample, or when it accounts for too
    /// small a fraction of the sample.
    fn score_strain(
        &self,
        pan_set: &KmerSet,
        strain: &StrainKmerSet,
        sample: &Sample,
    ) -> Option<StrainScore> {
        if (strain.set.distinct() as f64) < self.config.min_frac * strain.distinct_kmers as f64 {
            return None;
        }

        // Occurrence of each remaining strain k-mer across the pan-genome,
        // the basis for the inverse-specificity weights.
        let ix = kmer::intersect_ix(&pan_set.kmers, &strain.set.kmers);
        let strain_pan_counts = kmer::gather(&pan_set.counts, &ix);

        let common = kmer::intersect(&strain.set.kmers, &sample.set.kmers);
        if common.is_empty() {
            return None;
        }

        let ix_strain = kmer::intersect_ix(&strain.set.kmers, &common);
        let counts = kmer::gather(&strain.set.counts, &ix_strain);
        let pan_counts = kmer::gather(&strain_pan_counts, &ix_strain);

        let ix_sample = kmer::intersect_ix(&sample.set.kmers, &common);
        let sample_counts = kmer::gather(&sample.set.counts, &ix_sample);
        let sample_count: u64 = sample_counts.iter().map(|&c| c as u64).sum();

        let accounted = sample_count as f64 / sample.set.total_counts() as f64;
        if accounted < self.config.min_acct {
            return None;
        }

        let covered = common.len() as f64 / strain.set.distinct() as f64;
        let kmer_coverage = sample_count as f64 / common.len() as f64;
        let genome_coverage = sample_count as f64 / strain.set.total_counts() as f64;

        // Lander-Waterman estimate of the covered fraction if the observed
        // k-mers were randomly distributed across the genome.
        let est_covered = 1.0 - (-genome_coverage).exp();
        let evenness = covered / est_covered;

        let score0 = covered * accounted * evenness.min(1.0 / evenness);

        // Weight each shared k-mer by the inverse of its pan-genome
        // occurrence, so k-mers unique to this strain count fully and
        // broadly shared ones barely count.
        let strain_total_weight: f64 = counts
            .iter()
            .zip(&pan_counts)
            .map(|(&c, &p)| c as f64 / p as f64)
            .sum();
        let sample_total_weight: f64 = sample_counts
            .iter()
            .zip(&pan_counts)
            .map(|(&c, &p)| c as f64 / p as f64)
            .sum();

        let weighted_coverage = sample_total_weight / strain_total_weight;

        let strain_count: u64 = counts.iter().map(|&c| c as u64).sum();
        let strain_mean_weight = strain_total_weight / strain_count as f64;
        let sample_mean_weight = sample_total_weight / sample_count as f64;

        // Close to 1 for random sampling of this strain; low when the shared
        // k-mers also occur in other strains, high when the sample holds only
        // a strain-specific chunk of the genome.
        let specificity = sample_mean_weight / strain_mean_weight;

        let score = score0 * specificity.min(1.0 / specificity);

        Some(StrainScore {
            strain: strain.name.clone(),
            gkmers: strain.distinct_kmers,
            ikmers: strain.set.distinct(),
            skmers: sample.set.distinct(),
            cov: covered,
            kcov: kmer_coverage,
            gcov: genome_coverage,
            acct: accounted,
            even: evenness,
            wcov: weighted_coverage,
            spec: specificity,
            score0,
            score,
        })
    }
}

/// Write a search result as two tab-separated tables: sample statistics,
/// then one row per reported strain.
pub fn write_results<W: Write>(out: W, result: &SearchResult) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .flexible(true)
        .from_writer(out);

    let io_err = |e: csv::Error| StrainError::BadInput(format!("writing results: {e}"));

    writer
        .write_record(["sample", "totalkmers", "distinct", "pkmers", "pkcov", "pan%"])
        .map_err(io_err)?;
    let stats = &result.stats;
    writer
        .write_record([
            stats.sample.clone(),
            stats.total_kmers.to_string(),
            stats.distinct_kmers.to_string(),
            stats.pan_kmers.to_string(),
            format!("{:.3}", stats.pan_kcov),
            format!("{:.3}", stats.pan_pct),
        ])
        .map_err(io_err)?;

    writer
        .write_record([
            "i", "strain", "gkmers", "ikmers", "skmers", "cov", "kcov", "gcov", "acct", "even",
            "score0", "spec", "wcov", "score",
        ])
        .map_err(io_err)?;
    for (label, s) in &result.strains {
        writer
            .write_record([
                label.clone(),
                s.strain.clone(),
                s.gkmers.to_string(),
                s.ikmers.to_string(),
                s.skmers.to_string(),
                format!("{:.3}", s.cov),
                format!("{:.3}", s.kcov),
                format!("{:.3}", s.gcov),
                format!("{:.3}", s.acct),
                format!("{:.3}", s.even),
                format!("{:.3}", s.score0),
                format!("{:.3}", s.spec),
                format!("{:.3}", s.wcov),
                format!("{:.3}", s.score),
            ])
            .map_err(io_err)?;
    }

    writer.flush().map_err(|e| StrainError::BadInput(format!("writing results: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::build_database;
    use crate::kmer::store::save_kmerset;
    use std::path::PathBuf;
    use tempfile::tempdir;

    const K: u32 = 7;

    // Two synthetic genomes sharing a block, each with private sequence.
    const GENOME_X: &[u8] =
        b"GATTACAGGCATTTACAGACCAGGTTCCAAGGTTACGATCTTGACCGGATTACCAGTTACCAGA";
    const GENOME_Y: &[u8] =
        b"TTGACCGGATTACCAGTTACCAGACCGCGCGATATATCGCGCTAGCTAGGCGCGATTGCATGCA";

    fn kmerset_of(seq: &[u8]) -> KmerSet {
        let mut set = KmerSet::new(K).unwrap();
        set.kmerize_seq(seq);
        set
    }

    fn build_db(dir: &Path) -> PathBuf {
        let path_x = dir.join("strain_x.kset");
        let path_y = dir.join("strain_y.kset");
        save_kmerset(&kmerset_of(GENOME_X), &path_x, false).unwrap();
        save_kmerset(&kmerset_of(GENOME_Y), &path_y, false).unwrap();

        let db_path = dir.join("pan.kdb");
        build_database(&[path_x, path_y], &db_path, None, false).unwrap();
        db_path
    }

    /// Sample drawn from strain X only, each k-mer seen `depth` times.
    fn sample_from_x(depth: u32) -> Sample {
        let mut set = KmerSet::new(K).unwrap();
        for _ in 0..depth {
            let mut once = KmerSet::new(K).unwrap();
            once.kmerize_seq(GENOME_X);
            set = set.merge_kmerset(&once);
        }
        Sample::new("sample_x".to_string(), set)
    }

    #[test]
    fn test_single_strain_search() {
        let dir = tempdir().unwrap();
        let mut pan = PanGenome::open(&build_db(dir.path()), false).unwrap();
        let mut sample = sample_from_x(10);

        let search = StrainSearch::new(SearchConfig::default()).unwrap();
        let result = search
            .find_close_references(&mut pan, &mut sample, None)
            .unwrap();

        // Exactly one strain found: X in iteration 0; the sample is emptied
        // by the exclusion so iteration 1 reports nothing.
        assert_eq!(result.strains.len(), 1);
        let (label, score) = &result.strains[0];
        assert_eq!(label, "0");
        assert_eq!(score.strain, "strain_x");

        // Error-free full-genome sampling at depth 10: everything covered
        // and accounted for, evenness and score near 1.
        assert!((score.cov - 1.0).abs() < 1e-9);
        assert!((score.acct - 1.0).abs() < 1e-9);
        assert!((score.even - 1.0).abs() < 1e-3);
        assert!(score.score > 0.95);
    }

    #[test]
    fn test_sample_stats_full_overlap() {
        let dir = tempdir().unwrap();
        let mut pan = PanGenome::open(&build_db(dir.path()), false).unwrap();
        let mut sample = sample_from_x(10);
        let total = sample.total_kmers;

        let search = StrainSearch::new(SearchConfig::default()).unwrap();
        let result = search
            .find_close_references(&mut pan, &mut sample, None)
            .unwrap();

        // Every sample k-mer is in the pan-genome and none exceeds the
        // universal limit, so the pan percentage is 100.
        assert_eq!(result.stats.pan_kmers, total);
        assert!((result.stats.pan_pct - 100.0).abs() < 1e-9);

        let x = kmerset_of(GENOME_X);
        let expected_kcov = total as f64 / x.distinct() as f64;
        assert!((result.stats.pan_kcov - expected_kcov).abs() < 1e-9);
    }

    #[test]
    fn test_zero_iterations_reports_stats_only() {
        let dir = tempdir().unwrap();
        let mut pan = PanGenome::open(&build_db(dir.path()), false).unwrap();
        let mut sample = sample_from_x(10);

        let config = SearchConfig {
            iterations: 0,
            ..Default::default()
        };
        let search = StrainSearch::new(config).unwrap();
        let result = search
            .find_close_references(&mut pan, &mut sample, None)
            .unwrap();
        assert!(result.strains.is_empty());
        assert!(result.stats.pan_kmers > 0);
    }

    #[test]
    fn test_no_overlap_yields_empty_result() {
        let dir = tempdir().unwrap();
        let mut pan = PanGenome::open(&build_db(dir.path()), false).unwrap();

        let mut set = KmerSet::new(K).unwrap();
        // Poly-A carries a single distinct k-mer; drown it below every
        // threshold or miss the pan-genome entirely.
        set.kmerize_seq(b"AAAAAAAAAAAAAAA");
        let mut sample = Sample::new("unrelated".to_string(), set);

        let search = StrainSearch::new(SearchConfig::default()).unwrap();
        let result = search
            .find_close_references(&mut pan, &mut sample, None)
            .unwrap();
        assert!(result.strains.is_empty());
    }

    #[test]
    fn test_top_two_labels() {
        let dir = tempdir().unwrap();
        let mut pan = PanGenome::open(&build_db(dir.path()), false).unwrap();
        // A mixed sample covering both genomes; both strains should score in
        // iteration 0.
        let mut set = KmerSet::new(K).unwrap();
        for _ in 0..10 {
            let mut once = KmerSet::new(K).unwrap();
            once.kmerize_seq(GENOME_X);
            set = set.merge_kmerset(&once);
            let mut once = KmerSet::new(K).unwrap();
            once.kmerize_seq(GENOME_Y);
            set = set.merge_kmerset(&once);
        }
        let mut sample = Sample::new("mixed".to_string(), set);

        let config = SearchConfig {
            top: 2,
            min_evenness: 0.0,
            min_acct: 0.0,
            ..Default::default()
        };
        let search = StrainSearch::new(config).unwrap();
        let result = search
            .find_close_references(&mut pan, &mut sample, None)
            .unwrap();

        assert!(result.strains.len() >= 2);
        assert_eq!(result.strains[0].0, "0.0");
        assert_eq!(result.strains[1].0, "0.1");
    }

    #[test]
    fn test_min_acct_filters_minor_strain() {
        let dir = tempdir().unwrap();
        let mut pan = PanGenome::open(&build_db(dir.path()), false).unwrap();

        // Sample overwhelmingly from Y with a single pass over X: X accounts
        // for a small fraction of the sample and is dropped by min_acct.
        let mut set = KmerSet::new(K).unwrap();
        for _ in 0..50 {
            let mut once = KmerSet::new(K).unwrap();
            once.kmerize_seq(GENOME_Y);
            set = set.merge_kmerset(&once);
        }
        let mut once = KmerSet::new(K).unwrap();
        once.kmerize_seq(GENOME_X);
        set = set.merge_kmerset(&once);
        let mut sample = Sample::new("mostly_y".to_string(), set);

        let config = SearchConfig {
            iterations: 1,
            min_acct: 0.5,
            min_evenness: 0.0,
            ..Default::default()
        };
        let search = StrainSearch::new(config).unwrap();
        let result = search
            .find_close_references(&mut pan, &mut sample, None)
            .unwrap();

        assert_eq!(result.strains.len(), 1);
        assert_eq!(result.strains[0].1.strain, "strain_y");
    }

    #[test]
    fn test_deterministic_across_runs() {
        let dir = tempdir().unwrap();
        let db = build_db(dir.path());

        let run = || {
            let mut pan = PanGenome::open(&db, false).unwrap();
            let mut sample = sample_from_x(10);
            let search = StrainSearch::new(SearchConfig::default()).unwrap();
            let result = search
                .find_close_references(&mut pan, &mut sample, None)
                .unwrap();
            let mut out = Vec::new();
            write_results(&mut out, &result).unwrap();
            out
        };

        assert_eq!(run(), run());
    }

    #[test]
    fn test_config_validation() {
        let bad = SearchConfig {
            min_score: -1.0,
            ..Default::default()
        };
        assert!(matches!(
            StrainSearch::new(bad),
            Err(StrainError::InvalidConfig(_))
        ));

        let bad = SearchConfig {
            top: 0,
            ..Default::default()
        };
        assert!(StrainSearch::new(bad).is_err());
    }

    #[test]
    fn test_output_format() {
        let result = SearchResult {
            stats: SampleStats {
                sample: "s1".to_string(),
                total_kmers: 1000,
                distinct_kmers: 100,
                pan_kmers: 900,
                pan_kcov: 9.0,
                pan_pct: 90.0,
            },
            strains: vec![(
                "0".to_string(),
                StrainScore {
                    strain: "x".to_string(),
                    gkmers: 50,
                    ikmers: 50,
                    skmers: 90,
                    cov: 1.0,
                    kcov: 10.0,
                    gcov: 10.0,
                    acct: 1.0,
                    even: 1.0,
                    wcov: 1.0,
                    spec: 1.0,
                    score0: 1.0,
                    score: 1.0,
                },
            )],
        };

        let mut out = Vec::new();
        write_results(&mut out, &result).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], "sample\ttotalkmers\tdistinct\tpkmers\tpkcov\tpan%");
        assert_eq!(lines[1], "s1\t1000\t100\t900\t9.000\t90.000");
        assert!(lines[2].starts_with("i\tstrain\tgkmers"));
        assert_eq!(
            lines[3],
            "0\tx\t50\t50\t90\t1.000\t10.000\t10.000\t1.000\t1.000\t1.000\t1.000\t1.000\t1.000"
        );
    }
}
