//! Command-line interface.
//!
//! One subcommand per tool operation: k-merizing sequence files, inspecting
//! and comparing k-mer sets, building pan-genome databases and searching
//! samples against them. The variant caller is a library-level component
//! driven by an external alignment reader and has no subcommand here.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use log::info;

use crate::database::{self, PanGenome, DEFAULT_FINGERPRINT_FRACTION};
use crate::io::create_output;
use crate::kmer::compare::{self, Scoring};
use crate::kmer::store;
use crate::kmer::{kmer_string, KmerSet};
use crate::search::{Sample, SearchConfig, StrainSearch};
use crate::utils::{name_from_path, parse_num_suffix};
use crate::DEFAULT_K;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Number of threads to use
    #[arg(short, long, default_value_t = 1)]
    pub threads: usize,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// K-merize reference sequences or sample reads into a k-mer set file
    Kmerize {
        /// Input sequence files (FASTA or FASTQ, optionally gz/bz2)
        #[arg(required = true)]
        sequences: Vec<PathBuf>,

        /// K-mer size
        #[arg(short, long, default_value_t = DEFAULT_K)]
        k: u32,

        /// Output k-mer set file
        #[arg(short, long)]
        output: PathBuf,

        /// Compute and save a MinHash fingerprint (sketch)
        #[arg(short, long)]
        fingerprint: bool,

        /// Fraction of k-mers to keep for the fingerprint
        #[arg(short = 's', long, default_value_t = DEFAULT_FINGERPRINT_FRACTION)]
        sketch_fraction: f64,

        /// Filter k-mers by the k-mer spectrum, pruning sequencing errors
        #[arg(short = 'F', long)]
        filter: bool,

        /// Only process about this many k-mers (supports K/M/G suffixes)
        #[arg(short, long)]
        limit: Option<String>,

        /// Prune singletons after accumulating this many (K/M/G suffixes)
        #[arg(short, long)]
        prune: Option<String>,
    },

    /// Print statistics about a k-mer set
    Stats {
        /// The k-mer set file to load
        kmerset: PathBuf,

        /// Output the k-mer size
        #[arg(short)]
        k: bool,

        /// Output every k-mer with its count
        #[arg(short, long)]
        counts: bool,

        /// Output the k-mer frequency histogram
        #[arg(short = 'H', long)]
        histogram: bool,

        /// Output the Shannon entropy in bases
        #[arg(short, long)]
        entropy: bool,

        /// Output file, defaults to standard output
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Compare k-mer sets: one-vs-all or all-vs-all
    Compare {
        /// K-mer set files to compare
        #[arg(required = true)]
        kmersets: Vec<PathBuf>,

        /// Compare this sample against all given sets
        #[arg(short, long, conflicts_with = "all_vs_all")]
        sample: Option<PathBuf>,

        /// Perform all-vs-all comparisons
        #[arg(short, long)]
        all_vs_all: bool,

        /// Use the MinHash fingerprints instead of the full k-mer sets
        #[arg(short, long)]
        fingerprint: bool,

        /// Scoring metric: jaccard, minsize, maxsize, meansize or reference
        #[arg(short = 'S', long, default_value = "jaccard")]
        scoring: String,

        /// Output numerator and denominator instead of the evaluated score
        #[arg(short = 'F', long)]
        fraction: bool,

        /// Output file, defaults to standard output
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Create a pan-genome database from k-merized reference strains
    Createdb {
        /// K-mer set files of the reference strains
        kmersets: Vec<PathBuf>,

        /// Read additional k-mer set filenames from a file
        #[arg(short = 'f', long)]
        from_file: Option<PathBuf>,

        /// Pan-genome database output file
        #[arg(short, long)]
        output: PathBuf,

        /// Fingerprint the pan-genome union set
        #[arg(short = 'F', long)]
        fingerprint: bool,

        /// Fraction of k-mers to keep for the fingerprint
        #[arg(short = 's', long, default_value_t = DEFAULT_FINGERPRINT_FRACTION)]
        sketch_fraction: f64,
    },

    /// Search a sample for the closest reference strains
    Search {
        /// Pan-genome database file
        pan: PathBuf,

        /// Sample k-mer set file
        sample: PathBuf,

        /// Output text file, defaults to standard output
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Maximum strains to look for
        #[arg(short, long, default_value_t = 5)]
        iterations: usize,

        /// Best matches to report per iteration
        #[arg(short, long, default_value_t = 1)]
        top: usize,

        /// Use fingerprints rather than whole k-mer sets
        #[arg(short, long)]
        fingerprint: bool,

        /// Minimum fraction of original k-mers left in a strain
        #[arg(short = 'F', long, default_value_t = 0.01)]
        min_frac: f64,

        /// Minimum score
        #[arg(short = 's', long, default_value_t = 0.01)]
        min_score: f64,

        /// Minimum evenness
        #[arg(short = 'e', long, default_value_t = 0.6)]
        min_evenness: f64,

        /// Minimum fraction of sample k-mers a strain must account for
        #[arg(short = 'a', long, default_value_t = 0.01)]
        min_acct: f64,

        /// Exclude sample k-mers above this multiple of the median frequency
        #[arg(short = 'u', long, default_value_t = 10.0)]
        universal: f64,

        /// Only score these strains
        #[arg(short = 'S', long)]
        score_strains: Vec<String>,
    },
}

/// Dispatch a parsed command line.
pub fn run_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Kmerize {
            sequences,
            k,
            output,
            fingerprint,
            sketch_fraction,
            filter,
            limit,
            prune,
        } => {
            let mut kmerset = KmerSet::new(k)?;
            let options = crate::kmer::set::KmerizeOptions {
                limit: limit.as_deref().map(parse_num_suffix).transpose()?,
                prune: prune.as_deref().map(parse_num_suffix).transpose()?,
                ..Default::default()
            };

            for path in &sequences {
                info!("K-merizing file {}...", path.display());
                kmerset.kmerize_file(path, &options)?;
            }

            if filter {
                match kmerset.spectrum_filter() {
                    Some((min_freq, _, upper)) => info!(
                        "Filtered k-mer set; only k-mers within frequency range [{min_freq}, \
                         {upper}] are kept"
                    ),
                    None => info!("No spectrum thresholds found, k-mer set left unfiltered"),
                }
            }

            if fingerprint {
                kmerset.min_hash(sketch_fraction);
            }

            info!("Writing k-mer set to {}", output.display());
            store::save_kmerset(&kmerset, &output, true)?;
        }

        Commands::Stats {
            kmerset,
            k,
            counts,
            histogram,
            entropy,
            output,
        } => {
            info!("Loading k-mer set {}", kmerset.display());
            let set = store::load_kmerset(&kmerset)?;
            let mut out = create_output(output.as_deref())?;

            if k {
                writeln!(out, "K\t{}", set.k)?;
            }
            if counts {
                for (kmer, count) in set.kmers.iter().zip(&set.counts) {
                    writeln!(out, "{}\t{}", kmer_string(set.k, *kmer), count)?;
                }
            }
            if histogram {
                let (freqs, occurrences) = set.spectrum();
                for (freq, n) in freqs.iter().zip(&occurrences) {
                    writeln!(out, "{freq}\t{n}")?;
                }
            }
            if entropy {
                writeln!(out, "Entropy\t{:.2}", set.entropy())?;
            }
        }

        Commands::Compare {
            kmersets,
            sample,
            all_vs_all,
            fingerprint,
            scoring,
            fraction,
            output,
        } => {
            if sample.is_none() && !all_vs_all {
                bail!("either --sample or --all-vs-all is required");
            }
            let scoring: Scoring = scoring.parse()?;

            let load = |path: &PathBuf| -> anyhow::Result<(String, Vec<u64>)> {
                let set = store::load_kmerset(path)?;
                let kmers = if fingerprint {
                    set.fingerprint.clone().with_context(|| {
                        format!("{} has no fingerprint", path.display())
                    })?
                } else {
                    set.kmers
                };
                Ok((name_from_path(path), kmers))
            };

            info!("Loading {} k-mer sets...", kmersets.len());
            let references: Vec<(String, Vec<u64>)> = kmersets
                .iter()
                .map(&load)
                .collect::<anyhow::Result<Vec<_>>>()?;

            let scores = match sample {
                Some(sample_path) => {
                    let (name, kmers) = load(&sample_path)?;
                    info!("Start {name} vs all comparison...");
                    compare::one_vs_all((name.as_str(), kmers.as_slice()), &references, scoring)
                }
                None => {
                    info!("Start computing pairwise similarities...");
                    compare::all_vs_all(&references, scoring)?
                }
            };

            let mut out = create_output(output.as_deref())?;
            for score in scores {
                if fraction {
                    writeln!(
                        out,
                        "{}\t{}\t{}\t{}\t{:.5}",
                        score.name1,
                        score.name2,
                        score.numerator,
                        score.denominator,
                        score.score()
                    )?;
                } else {
                    writeln!(out, "{}\t{}\t{:.5}", score.name1, score.name2, score.score())?;
                }
            }
        }

        Commands::Createdb {
            mut kmersets,
            from_file,
            output,
            fingerprint,
            sketch_fraction,
        } => {
            if let Some(list) = from_file {
                let content = std::fs::read_to_string(&list)
                    .with_context(|| format!("reading k-mer set list {}", list.display()))?;
                kmersets.extend(content.lines().map(|l| PathBuf::from(l.trim())));
            }
            if kmersets.is_empty() {
                bail!("no k-mer sets given and nothing read from the given file");
            }

            let fraction = fingerprint.then_some(sketch_fraction);
            database::build_database(&kmersets, &output, fraction, true)?;
            info!("Done.");
        }

        Commands::Search {
            pan,
            sample,
            output,
            iterations,
            top,
            fingerprint,
            min_frac,
            min_score,
            min_evenness,
            min_acct,
            universal,
            score_strains,
        } => {
            info!(
                "Running strain search on sample {} with database {}",
                sample.display(),
                pan.display()
            );
            let mut pangenome = PanGenome::open(&pan, fingerprint)?;
            let mut sample_set = Sample::from_file(&sample)?;

            let config = SearchConfig {
                iterations,
                top,
                min_score,
                min_evenness,
                min_frac,
                min_acct,
                universal,
            };
            let search = StrainSearch::new(config)?;

            let strains = (!score_strains.is_empty()).then_some(score_strains.as_slice());
            let result = search.find_close_references(&mut pangenome, &mut sample_set, strains)?;

            let out = create_output(output.as_deref())?;
            crate::search::write_results(out, &result)?;
            info!("Done.");
        }
    }

    Ok(())
}
