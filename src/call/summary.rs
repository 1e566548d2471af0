//! Per-scaffold and genome-wide call summaries.
//!
//! Rolls the finalized per-scaffold call data into one record per scaffold
//! plus a `TOTAL` record, including repetitiveness-corrected strain
//! abundances and transition/transversion counts at SNP positions.

use std::io::Write;

use crate::call::allele::{is_transition, Allele};
use crate::call::data::VariantCallData;
use crate::error::{Result, StrainError};
use crate::utils::{median, pct};

/// Summary statistics for one scaffold (or for the whole genome in the
/// `TOTAL` record).
#[derive(Debug, Clone)]
pub struct ScaffoldSummary {
    pub name: String,
    pub length: usize,
    pub repetitiveness: f64,
    /// Mean coverage, excluding abnormally high coverage positions but
    /// counting low-MQ-dominated ones.
    pub coverage: f64,
    pub median_coverage: f64,
    pub u_reads: u64,
    /// Normalized strain abundance; 1 for the TOTAL record.
    pub abundance: f64,
    pub callable: u64,
    pub callable_pct: f64,
    pub confirmed: u64,
    pub confirmed_pct: f64,
    pub snps: u64,
    pub snp_pct: f64,
    pub multi: u64,
    pub multi_pct: f64,
    pub lowmq: u64,
    pub lowmq_pct: f64,
    pub high_coverage: u64,
    pub high_coverage_pct: f64,
    pub gap_count: usize,
    pub gap_length: usize,
    pub transitions: u64,
    pub ts_pct: f64,
    pub transversions: u64,
    pub tv_pct: f64,
}

/// Count transitions and transversions between paired reference and called
/// alleles.
pub fn count_ts_tv(reference: &[Allele], called: &[Allele]) -> (u64, u64) {
    let mut transitions = 0;
    let mut transversions = 0;
    for (&r, &c) in reference.iter().zip(called) {
        if is_transition(r, c) {
            transitions += 1;
        } else {
            transversions += 1;
        }
    }
    (transitions, transversions)
}

/// Summarize finalized call data into per-scaffold records plus a `TOTAL`
/// record.
pub fn summarize(data: &VariantCallData) -> Vec<ScaffoldSummary> {
    // Abundance normalization: reads per unique (non-repetitive) base,
    // normalized to sum to 1 across scaffolds.
    let raw_abundance: Vec<f64> = data
        .scaffolds
        .values()
        .map(|s| {
            let unique_length = s.length as f64 * (1.0 - s.repetitiveness);
            if unique_length > 0.0 {
                s.read_count as f64 / unique_length
            } else {
                0.0
            }
        })
        .collect();
    let abundance_sum: f64 = raw_abundance.iter().sum();

    let mut summaries = Vec::with_capacity(data.scaffolds.len() + 1);
    let mut coverages = Vec::with_capacity(data.scaffolds.len());

    let mut total_callable = 0u64;
    let mut total_confirmed = 0u64;
    let mut total_snps = 0u64;
    let mut total_multi = 0u64;
    let mut total_lowmq = 0u64;
    let mut total_high = 0u64;
    let mut total_gaps = 0usize;
    let mut total_gap_length = 0usize;
    let mut total_ts = 0u64;
    let mut total_tv = 0u64;
    let mut total_singles = 0u64;

    for (scaffold, raw) in data.scaffolds.values().zip(&raw_abundance) {
        let mut callable = 0u64;
        let mut confirmed = 0u64;
        let mut singles = 0u64;
        let mut multi = 0u64;
        let mut snp_refs = Vec::new();
        let mut snp_calls = Vec::new();

        for pos in 0..scaffold.length {
            let strong = scaffold.strong[pos];
            if strong.is_empty() {
                continue;
            }
            callable += 1;

            if !(strong & scaffold.refmask[pos]).is_empty() {
                confirmed += 1;
            }
            if strong.is_single() {
                singles += 1;
                // Strong evidence for exactly one allele which is not the
                // reference base.
                if !(strong & !scaffold.refmask[pos]).is_empty() {
                    snp_refs.push(scaffold.refmask[pos]);
                    snp_calls.push(strong);
                }
            } else {
                multi += 1;
            }
        }

        let snps = snp_refs.len() as u64;
        let (transitions, transversions) = count_ts_tv(&snp_refs, &snp_calls);

        let lowmq = scaffold.lowmq.iter().filter(|&&l| l).count() as u64;
        let high = scaffold.high_coverage.iter().filter(|&&h| h).count() as u64;

        // High coverage positions distort the mean; low-MQ positions are
        // still covered even though they are never called.
        let summed_coverage: u64 = scaffold
            .coverage
            .iter()
            .zip(&scaffold.high_coverage)
            .filter(|&(_, &high)| !high)
            .map(|(&c, _)| c)
            .sum::<u64>()
            + lowmq;
        let coverage = if scaffold.length > 0 {
            summed_coverage as f64 / scaffold.length as f64
        } else {
            0.0
        };
        let coverage_with_lowmq: Vec<u64> = scaffold
            .coverage
            .iter()
            .zip(&scaffold.lowmq)
            .map(|(&c, &l)| c + l as u64)
            .collect();
        let median_coverage = median(&coverage_with_lowmq);
        coverages.push(coverage);

        let gap_count = scaffold.gaps.len();
        let gap_length: usize = scaffold.gaps.iter().map(|g| g.length()).sum();

        total_callable += callable;
        total_confirmed += confirmed;
        total_snps += snps;
        total_multi += multi;
        total_lowmq += lowmq;
        total_high += high;
        total_gaps += gap_count;
        total_gap_length += gap_length;
        total_ts += transitions;
        total_tv += transversions;
        total_singles += singles;

        summaries.push(ScaffoldSummary {
            name: scaffold.name.clone(),
            length: scaffold.length,
            repetitiveness: scaffold.repetitiveness,
            coverage,
            median_coverage,
            u_reads: scaffold.read_count,
            abundance: if abundance_sum > 0.0 {
                raw / abundance_sum
            } else {
                0.0
            },
            callable,
            callable_pct: pct(callable, scaffold.length as u64),
            confirmed,
            confirmed_pct: pct(confirmed, callable),
            snps,
            snp_pct: pct(snps, callable),
            multi,
            multi_pct: pct(multi, callable),
            lowmq,
            lowmq_pct: pct(lowmq, scaffold.length as u64),
            high_coverage: high,
            high_coverage_pct: pct(high, scaffold.length as u64),
            gap_count,
            gap_length,
            transitions,
            ts_pct: pct(transitions, singles),
            transversions,
            tv_pct: pct(transversions, singles),
        });
    }

    let reference_length = data.reference_length as u64;
    let avg_repetitiveness = if data.scaffolds.is_empty() {
        0.0
    } else {
        data.scaffolds
            .values()
            .map(|s| s.repetitiveness)
            .sum::<f64>()
            / data.scaffolds.len() as f64
    };
    let weighted_coverage = if reference_length > 0 {
        coverages
            .iter()
            .zip(data.scaffolds.values())
            .map(|(c, s)| c * s.length as f64)
            .sum::<f64>()
            / reference_length as f64
    } else {
        0.0
    };

    summaries.push(ScaffoldSummary {
        name: "TOTAL".to_string(),
        length: data.reference_length,
        repetitiveness: avg_repetitiveness,
        coverage: weighted_coverage,
        median_coverage: data.median_coverage,
        u_reads: data.uniquely_mapped_reads,
        abundance: 1.0,
        callable: total_callable,
        callable_pct: pct(total_callable, reference_length),
        confirmed: total_confirmed,
        confirmed_pct: pct(total_confirmed, total_callable),
        snps: total_snps,
        snp_pct: pct(total_snps, total_callable),
        multi: total_multi,
        multi_pct: pct(total_multi, total_callable),
        lowmq: total_lowmq,
        lowmq_pct: pct(total_lowmq, reference_length),
        high_coverage: total_high,
        high_coverage_pct: pct(total_high, reference_length),
        gap_count: total_gaps,
        gap_length: total_gap_length,
        transitions: total_ts,
        ts_pct: pct(total_ts, total_singles),
        transversions: total_tv,
        tv_pct: pct(total_tv, total_singles),
    });

    summaries
}

/// Write summaries as a tab-separated table, one row per scaffold plus the
/// `TOTAL` row.
pub fn write_summary<W: Write>(out: W, summaries: &[ScaffoldSummary]) -> Result<()> {
    let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_writer(out);
    let io_err = |e: csv::Error| StrainError::BadInput(format!("writing summary: {e}"));

    writer
        .write_record([
            "name",
            "length",
            "repetitiveness",
            "coverage",
            "median",
            "uReads",
            "abundance",
            "callable",
            "callablePct",
            "confirmed",
            "confirmedPct",
            "snps",
            "snpPct",
            "multi",
            "multiPct",
            "lowmq",
            "lowmqPct",
            "high",
            "highPct",
            "gapCount",
            "gapLength",
            "transitions",
            "tsPct",
            "transversions",
            "tvPct",
        ])
        .map_err(io_err)?;

    for s in summaries {
        writer
            .write_record([
                s.name.clone(),
                s.length.to_string(),
                format!("{:.3}", s.repetitiveness),
                format!("{:.3}", s.coverage),
                format!("{:.3}", s.median_coverage),
                s.u_reads.to_string(),
                format!("{:.3}", s.abundance),
                s.callable.to_string(),
                format!("{:.3}", s.callable_pct),
                s.confirmed.to_string(),
                format!("{:.3}", s.confirmed_pct),
                s.snps.to_string(),
                format!("{:.3}", s.snp_pct),
                s.multi.to_string(),
                format!("{:.3}", s.multi_pct),
                s.lowmq.to_string(),
                format!("{:.3}", s.lowmq_pct),
                s.high_coverage.to_string(),
                format!("{:.3}", s.high_coverage_pct),
                s.gap_count.to_string(),
                s.gap_length.to_string(),
                s.transitions.to_string(),
                format!("{:.3}", s.ts_pct),
                s.transversions.to_string(),
                format!("{:.3}", s.tv_pct),
            ])
            .map_err(io_err)?;
    }

    writer
        .flush()
        .map_err(|e| StrainError::BadInput(format!("writing summary: {e}")))
}
