//! Reference-based variant calling.
//!
//! The caller consumes read alignments against a concatenated reference,
//! accumulates per-position allele and quality evidence, calls strong and
//! weak alleles, detects coverage gaps and summarizes per-scaffold and
//! genome-wide statistics. Strain mixtures are modelled as independent
//! haploid populations; multi-allelic positions simply carry several allele
//! bits.

pub mod allele;
pub mod caller;
pub mod data;
pub mod summary;

pub use allele::Allele;
pub use caller::{Alignment, CallerConfig, PileupColumn, PileupRead, VariantCaller};
pub use data::{Gap, ScaffoldCallData, VariantCallData};
pub use summary::{summarize, write_summary, ScaffoldSummary};
