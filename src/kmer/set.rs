//! Sorted k-mer set with counts, spectrum analysis and MinHash sketching.
//!
//! A [`KmerSet`] is created empty, grown by streaming k-merization, frozen
//! into sorted unique arrays, optionally sketched, and then treated as
//! read-only (apart from the set-algebra reductions used by the strain
//! search). After every mutator the following invariants hold: `kmers` is
//! strictly ascending, `counts` runs parallel to it with every entry >= 1,
//! and the fingerprint (when present) is a sorted subset of `kmers`.

use std::path::Path;

use itertools::Itertools;
use log::{debug, info, warn};

use crate::error::{Result, StrainError};
use crate::io;
use crate::kmer::{self, MAX_K, MIN_K};

/// Default batch size for streaming k-merization, in k-mers.
pub const DEFAULT_BATCH_SIZE: usize = 100_000_000;

/// Options for [`KmerSet::kmerize_file`].
#[derive(Debug, Clone)]
pub struct KmerizeOptions {
    /// K-mers accumulated before a batch is deduplicated and merged.
    pub batch_size: usize,
    /// Stop after roughly this many total k-mers.
    pub limit: Option<u64>,
    /// Drop count-1 k-mers whenever there are more singletons than this.
    /// Bounds the memory ceiling when k-merizing error-rich read data.
    pub prune: Option<u64>,
}

impl Default for KmerizeOptions {
    fn default() -> Self {
        KmerizeOptions {
            batch_size: DEFAULT_BATCH_SIZE,
            limit: None,
            prune: None,
        }
    }
}

/// A set of canonical k-mers with their frequencies.
#[derive(Debug, Clone)]
pub struct KmerSet {
    /// K-mer length.
    pub k: u32,
    /// Strictly increasing packed k-mers.
    pub kmers: Vec<u64>,
    /// Frequency per k-mer, parallel to `kmers`.
    pub counts: Vec<u32>,
    /// MinHash fingerprint: a sorted subset of `kmers`.
    pub fingerprint: Option<Vec<u64>>,
    /// Number of sequences k-merized into this set.
    pub n_seqs: u64,
    /// Number of bases k-merized into this set.
    pub n_bases: u64,
    /// Total k-mers seen, before deduplication.
    pub n_kmers: u64,
    /// Number of k-mers with count 1, tracked during accumulation.
    pub singletons: u64,
}

impl PartialEq for KmerSet {
    fn eq(&self, other: &Self) -> bool {
        self.k == other.k
            && self.kmers == other.kmers
            && self.counts == other.counts
            && self.fingerprint == other.fingerprint
    }
}

impl KmerSet {
    /// Create an empty set for the given k-mer length.
    pub fn new(k: u32) -> Result<Self> {
        if !(MIN_K..=MAX_K).contains(&k) {
            return Err(StrainError::InvalidConfig(format!(
                "k-mer size {k} out of supported range {MIN_K}..={MAX_K}"
            )));
        }
        Ok(KmerSet {
            k,
            kmers: Vec::new(),
            counts: Vec::new(),
            fingerprint: None,
            n_seqs: 0,
            n_bases: 0,
            n_kmers: 0,
            singletons: 0,
        })
    }

    /// Number of distinct k-mers.
    pub fn distinct(&self) -> usize {
        self.kmers.len()
    }

    /// Sum of all counts.
    pub fn total_counts(&self) -> u64 {
        self.counts.iter().map(|&c| c as u64).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.kmers.is_empty()
    }

    /// Replace this set with the k-mers of a single sequence.
    pub fn kmerize_seq(&mut self, seq: &[u8]) {
        let mut raw = Vec::new();
        kmer::kmerize_into(self.k, seq, &mut raw);
        self.n_seqs += 1;
        self.n_bases += seq.len() as u64;
        self.n_kmers = raw.len() as u64;
        let (kmers, counts) = kmer::unique_counts(raw);
        self.kmers = kmers;
        self.counts = counts;
        self.update_singletons();
    }

    /// Stream a sequence file into this set.
    ///
    /// Records accumulate into batches of roughly `batch_size` k-mers; each
    /// full batch is deduplicated and merged into the running set, keeping
    /// memory bounded. Malformed records are skipped with a warning.
    ///
    /// # Arguments
    ///
    /// * `path` - FASTA/FASTQ file, optionally gz/bz2 compressed.
    /// * `options` - Batch size, plus the optional `limit` (stop once this
    ///   many k-mers have been seen) and `prune` (drop singletons whenever
    ///   they outnumber the threshold, bounding memory on error-rich reads).
    pub fn kmerize_file(&mut self, path: &Path, options: &KmerizeOptions) -> Result<()> {
        let mut reader = io::open_sequence_reader(path)?;

        let mut batch: Vec<u64> = Vec::new();
        let mut n_seqs = 0u64;
        let mut n_bases = 0u64;
        let mut pruned = false;

        while let Some(record) = reader.next() {
            let record = match record {
                Ok(r) => r,
                Err(e) => {
                    warn!("Skipping malformed record in {}: {}", path.display(), e);
                    continue;
                }
            };

            let seq = record.seq();
            n_seqs += 1;
            n_bases += seq.len() as u64;

            if batch.len() + seq.len() > options.batch_size {
                self.process_batch(&mut batch, n_seqs, n_bases);
                n_seqs = 0;
                n_bases = 0;
                if options.limit.is_some_and(|l| self.n_kmers > l) {
                    break;
                }
                if options.prune.is_some_and(|p| self.singletons > p) {
                    self.prune_singletons();
                    pruned = true;
                }
            }

            kmer::kmerize_into(self.k, &seq, &mut batch);
            if options
                .limit
                .is_some_and(|l| self.n_kmers + batch.len() as u64 >= l)
            {
                break;
            }
        }

        self.process_batch(&mut batch, n_seqs, n_bases);
        if pruned {
            self.prune_singletons();
        }

        info!(
            "{}: {} seqs, {} bases, {} k-mers, {} distinct, {} singletons",
            path.display(),
            self.n_seqs,
            self.n_bases,
            self.n_kmers,
            self.distinct(),
            self.singletons
        );
        Ok(())
    }

    /// Deduplicate a raw batch and merge it into the accumulated set.
    /// The merge completes before the next batch begins, preserving the
    /// sorted-unique invariant.
    fn process_batch(&mut self, batch: &mut Vec<u64>, n_seqs: u64, n_bases: u64) {
        self.n_seqs += n_seqs;
        self.n_bases += n_bases;
        self.n_kmers += batch.len() as u64;

        let (new_kmers, new_counts) = kmer::unique_counts(std::mem::take(batch));

        if self.kmers.is_empty() {
            self.kmers = new_kmers;
            self.counts = new_counts;
        } else {
            let (kmers, counts) =
                kmer::merge_counts(&self.kmers, &self.counts, &new_kmers, &new_counts);
            self.kmers = kmers;
            self.counts = counts;
        }

        self.update_singletons();
        debug!(
            "batch merged: {} distinct, {} singletons",
            self.distinct(),
            self.singletons
        );
    }

    fn update_singletons(&mut self) {
        self.singletons = self.counts.iter().filter(|&&c| c == 1).count() as u64;
    }

    /// Drop all k-mers with count 1.
    pub fn prune_singletons(&mut self) {
        let keep: Vec<usize> = (0..self.counts.len())
            .filter(|&i| self.counts[i] > 1)
            .collect();
        self.kmers = kmer::gather(&self.kmers, &keep);
        self.counts = kmer::gather(&self.counts, &keep);
        self.singletons = 0;
        debug!("Pruned singletons: {} distinct k-mers remain", self.distinct());
    }

    /// Out-of-place merge with another set; neither operand is mutated.
    pub fn merge_kmerset(&self, other: &KmerSet) -> KmerSet {
        let (kmers, counts) =
            kmer::merge_counts(&self.kmers, &self.counts, &other.kmers, &other.counts);
        KmerSet {
            k: self.k,
            kmers,
            counts,
            fingerprint: None,
            n_seqs: self.n_seqs + other.n_seqs,
            n_bases: self.n_bases + other.n_bases,
            n_kmers: self.n_kmers + other.n_kmers,
            singletons: 0,
        }
    }

    /// Restrict this set to the k-mers present in `keys`, reindexing counts.
    pub fn intersect(&mut self, keys: &[u64]) {
        let ix = kmer::intersect_ix(&self.kmers, keys);
        self.kmers = kmer::gather(&self.kmers, &ix);
        self.counts = kmer::gather(&self.counts, &ix);
    }

    /// Remove the k-mers present in `keys`, reindexing counts.
    pub fn exclude(&mut self, keys: &[u64]) {
        let remaining = kmer::diff(&self.kmers, keys);
        let ix = kmer::intersect_ix(&self.kmers, &remaining);
        self.counts = kmer::gather(&self.counts, &ix);
        self.kmers = remaining;
    }

    /// Reduce both operands to their common key set.
    pub fn mutual_intersect(&mut self, other: &mut KmerSet) {
        self.intersect(&other.kmers.clone());
        other.intersect(&self.kmers);
    }

    /// Keep only k-mers with counts in `[min_freq, max_freq]`.
    pub fn freq_filter(&mut self, min_freq: u32, max_freq: Option<u32>) {
        let keep: Vec<usize> = (0..self.counts.len())
            .filter(|&i| {
                self.counts[i] >= min_freq && max_freq.is_none_or(|m| self.counts[i] <= m)
            })
            .collect();
        self.kmers = kmer::gather(&self.kmers, &keep);
        self.counts = kmer::gather(&self.counts, &keep);
    }

    /// The k-mer frequency histogram: `(frequency, number of k-mers)` pairs
    /// in ascending frequency.
    pub fn spectrum(&self) -> (Vec<u32>, Vec<u64>) {
        let mut sorted = self.counts.clone();
        sorted.sort_unstable();

        let mut freqs = Vec::new();
        let mut occurrences = Vec::new();
        for (n, freq) in sorted.into_iter().dedup_with_count() {
            freqs.push(freq);
            occurrences.push(n as u64);
        }
        (freqs, occurrences)
    }

    /// Locate the error/signal boundary in the k-mer spectrum.
    ///
    /// Scans the spectrum in ascending frequency for a local minimum (the
    /// error valley) followed by a local maximum (the haploid coverage peak).
    /// Climbing out of the valley requires a frequency bin with more than
    /// 1000 k-mers that exceeds the valley by a factor of `1 + delta`; the
    /// peak is confirmed once a later bin drops below it by `1 - delta`.
    /// The scan stops at a zero gap after the peak or once frequencies exceed
    /// `max_copy_number` times the peak frequency.
    ///
    /// Returns `(min_freq, max_freq, last_freq)`, or `None` when no peak
    /// rises at least `1 + delta` above a valley.
    pub fn spectrum_min_max(&self, delta: f64, max_copy_number: u32) -> Option<(u32, u32, u32)> {
        let (freqs, counts) = self.spectrum();

        let mut min_index = 0usize;
        let mut max_index = 0usize;
        let mut have_min = false;
        let mut have_max = false;
        let mut last_freq = 0u32;
        let mut last = 0usize;

        for i in 0..freqs.len() {
            let count = counts[i];
            let zero_gap = freqs[i] > last_freq + 1;
            if have_max
                && (zero_gap || freqs[i] as u64 > freqs[max_index] as u64 * max_copy_number as u64)
            {
                break;
            }
            if have_min {
                if count > counts[max_index] {
                    max_index = i;
                }
                if (count as f64) < counts[max_index] as f64 * (1.0 - delta) {
                    have_max = true;
                }
            } else if count > 1000 && count as f64 > counts[min_index] as f64 * (1.0 + delta) {
                // Climbed out of the error valley; the current bin is the
                // initial peak candidate.
                have_min = true;
                max_index = i;
            } else if zero_gap || count < counts[min_index] {
                min_index = i;
                max_index = i;
            }
            last_freq = freqs[i];
            last = i;
        }

        if min_index > 0
            && max_index > 0
            && counts[max_index] as f64 > counts[min_index] as f64 * (1.0 + delta)
        {
            Some((freqs[min_index], freqs[max_index], freqs[last]))
        } else {
            None
        }
    }

    /// Apply the spectrum thresholds as a frequency filter, pruning the
    /// error tail. Returns the thresholds used, if any were found.
    pub fn spectrum_filter(&mut self) -> Option<(u32, u32, u32)> {
        let thresholds = self.spectrum_min_max(0.5, 20);
        if let Some((min_freq, _, upper)) = thresholds {
            self.freq_filter(min_freq, Some(upper));
        }
        thresholds
    }

    /// Select a MinHash fingerprint of `round(fraction * |kmers|)` k-mers.
    ///
    /// K-mers are ranked by their FNV-1a hash with ties broken by the k-mer
    /// itself, so the selection is deterministic for identical inputs. The
    /// fingerprint is stored sorted.
    pub fn min_hash(&mut self, fraction: f64) -> &[u64] {
        let n = (self.kmers.len() as f64 * fraction).round() as usize;
        let n = n.min(self.kmers.len());

        let hashes = kmer::fnv_hash(self.k, &self.kmers);
        let mut order: Vec<usize> = (0..self.kmers.len()).collect();
        order.sort_unstable_by_key(|&i| (hashes[i], i));
        order.truncate(n);

        let mut fingerprint = kmer::gather(&self.kmers, &order);
        fingerprint.sort_unstable();
        self.fingerprint = Some(fingerprint);
        self.fingerprint.as_deref().unwrap_or(&[])
    }

    /// Swap the active key array for the MinHash fingerprint.
    ///
    /// Counts are unavailable in fingerprint mode; they are replaced by ones
    /// so downstream scoring degrades to presence-only weights.
    pub fn fingerprint_override(&mut self) -> Result<()> {
        let fingerprint = self
            .fingerprint
            .clone()
            .ok_or_else(|| StrainError::MissingData("k-mer set has no fingerprint".into()))?;
        self.counts = vec![1; fingerprint.len()];
        self.kmers = fingerprint;
        Ok(())
    }

    /// Shannon entropy of the count distribution, in bases (bits / 2).
    pub fn entropy(&self) -> f64 {
        let total = self.total_counts();
        if total == 0 {
            return 0.0;
        }
        let total = total as f64;
        let bits: f64 = self
            .counts
            .iter()
            .map(|&c| {
                let p = c as f64 / total;
                p * p.log2()
            })
            .sum();
        -bits / 2.0
    }
}
