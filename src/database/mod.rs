//! Pan-genome database of reference strain k-mer sets.
//!
//! A pan-genome groups the k-mer sets of many reference strains together
//! with their union. The union's counts record the number of strains
//! containing each k-mer, which the strain search uses as inverse-specificity
//! weights. Strain sets are converted lazily and memoized; during a search
//! run the cached entries are shrunk in place by exclusion, so a fresh
//! `PanGenome` is opened per independent search.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use log::info;

use crate::error::{Result, StrainError};
use crate::kmer::store::{self, KmerSetGroup};
use crate::kmer::KmerSet;
use crate::utils::name_from_path;

/// Default fraction of k-mers kept for a MinHash fingerprint.
pub const DEFAULT_FINGERPRINT_FRACTION: f64 = 0.01;

/// A reference strain's k-mer set plus the scalars the search engine needs.
///
/// `distinct_kmers` and `total_kmers` are captured at load time; the set
/// itself may later be reduced by exclusion.
#[derive(Debug, Clone)]
pub struct StrainKmerSet {
    pub name: String,
    pub set: KmerSet,
    pub total_kmers: u64,
    pub distinct_kmers: usize,
}

impl StrainKmerSet {
    pub fn new(name: String, set: KmerSet) -> Self {
        let total_kmers = set.total_counts();
        let distinct_kmers = set.distinct();
        StrainKmerSet {
            name,
            set,
            total_kmers,
            distinct_kmers,
        }
    }

    /// Remove the given k-mers from this strain's set.
    pub fn exclude(&mut self, keys: &[u64]) {
        self.set.exclude(keys);
    }
}

/// A pan-genome database opened read-only from a container file.
pub struct PanGenome {
    pub path: PathBuf,
    /// Union k-mer set; counts are per-k-mer strain occurrence.
    pub set: KmerSet,
    /// Whether the MinHash fingerprints are the active key arrays.
    pub use_fingerprint: bool,
    /// MinHash fraction of the stored fingerprints; 1.0 outside fingerprint
    /// mode.
    pub fingerprint_fraction: f64,
    groups: IndexMap<String, KmerSetGroup>,
    cache: HashMap<String, StrainKmerSet>,
}

impl PanGenome {
    /// Open a pan-genome database.
    ///
    /// In fingerprint mode the union's key array is swapped for its MinHash
    /// fingerprint and the stored `fingerprint_fraction` becomes required.
    pub fn open(path: &Path, use_fingerprint: bool) -> Result<Self> {
        info!("Loading pan-genome {}", path.display());
        let container = store::load_container(path)?;

        if container.strains.is_empty() {
            return Err(StrainError::BadInput(format!(
                "{}: container holds no strain groups",
                path.display()
            )));
        }

        let mut set = container.root.into_set()?;
        let mut fingerprint_fraction = 1.0;
        if use_fingerprint {
            if container.fingerprint_fraction <= 0.0 {
                return Err(StrainError::MissingData(format!(
                    "{}: no fingerprint fraction stored; database was built without fingerprints",
                    path.display()
                )));
            }
            fingerprint_fraction = container.fingerprint_fraction;
            set.fingerprint_override()?;
            info!("fingerprint_fraction={fingerprint_fraction}");
        }

        let groups: IndexMap<String, KmerSetGroup> = container.strains.into_iter().collect();
        info!(
            "{} strains, {} distinct k-mers in pan-genome",
            groups.len(),
            set.distinct()
        );

        Ok(PanGenome {
            path: path.to_path_buf(),
            set,
            use_fingerprint,
            fingerprint_fraction,
            groups,
            cache: HashMap::new(),
        })
    }

    /// Strain names in database order.
    pub fn strain_names(&self) -> Vec<String> {
        self.groups.keys().cloned().collect()
    }

    /// Load a strain k-mer set, memoizing the conversion.
    pub fn load_strain(&mut self, name: &str) -> Result<&mut StrainKmerSet> {
        match self.cache.entry(name.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let group = self.groups.get(name).ok_or_else(|| {
                    StrainError::MissingData(format!(
                        "strain '{}' not in pan-genome {}",
                        name,
                        self.path.display()
                    ))
                })?;
                let mut set = group.clone().into_set()?;
                if self.use_fingerprint {
                    set.fingerprint_override()?;
                }
                Ok(entry.insert(StrainKmerSet::new(name.to_string(), set)))
            }
        }
    }

    /// A cached strain, if it has been loaded.
    pub fn strain(&self, name: &str) -> Option<&StrainKmerSet> {
        self.cache.get(name)
    }
}

/// Build a pan-genome database from individual k-mer set files.
///
/// The union's counts record in how many strains each k-mer occurs, so every
/// strain contributes presence (count 1 per k-mer) to the union regardless
/// of its own copy numbers. With a `fingerprint` fraction, a MinHash
/// fingerprint of the union is computed and the fraction is persisted for
/// fingerprint-mode consumers.
pub fn build_database(
    kmerset_paths: &[PathBuf],
    output: &Path,
    fingerprint: Option<f64>,
    compress: bool,
) -> Result<()> {
    if kmerset_paths.is_empty() {
        return Err(StrainError::InvalidConfig(
            "no k-mer sets given for database construction".into(),
        ));
    }

    let mut union: Option<KmerSet> = None;
    let mut strains = Vec::with_capacity(kmerset_paths.len());

    for path in kmerset_paths {
        let name = name_from_path(path);
        let set = store::load_kmerset(path)?;
        info!("Adding k-mer set {name}");

        let mut presence = set.clone();
        presence.counts = vec![1; presence.kmers.len()];
        union = Some(match union {
            None => presence,
            Some(u) => {
                if u.k != presence.k {
                    return Err(StrainError::BadInput(format!(
                        "{}: k={} does not match database k={}",
                        path.display(),
                        presence.k,
                        u.k
                    )));
                }
                u.merge_kmerset(&presence)
            }
        });

        strains.push((name, set));
    }

    let Some(mut union) = union else {
        return Err(StrainError::InvalidConfig(
            "no k-mer sets given for database construction".into(),
        ));
    };
    let mut fraction = 0.0;
    if let Some(f) = fingerprint {
        if !(0.0..=1.0).contains(&f) || f == 0.0 {
            return Err(StrainError::InvalidConfig(format!(
                "fingerprint fraction {f} outside (0, 1]"
            )));
        }
        fraction = f;
        union.min_hash(fraction);
    }

    info!("Saving pan-genome database to {}", output.display());
    store::save_database(&union, &strains, fraction, output, compress)
}
