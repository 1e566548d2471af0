//! Concatenated multi-scaffold reference with coordinate translation.
//!
//! Variant calling runs against a reference built by concatenating one or
//! more (possibly multi-contig) genomes. Scaffolds keep their input order;
//! genome-wide coordinates are 0-based, scaffold coordinates 1-based.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use log::{info, warn};
use serde::Deserialize;

use crate::error::{Result, StrainError};
use crate::io;

/// An ordered collection of named scaffold sequences.
pub struct Reference {
    pub path: PathBuf,
    scaffolds: IndexMap<String, Vec<u8>>,
    length: usize,
}

impl Reference {
    /// Load a reference from a FASTA file. Sequences are uppercased.
    pub fn from_fasta(path: &Path) -> Result<Self> {
        let mut reader = io::open_sequence_reader(path)?;
        let mut scaffolds = IndexMap::new();

        while let Some(record) = reader.next() {
            let record = record.map_err(|e| StrainError::external(path, e))?;
            let name = String::from_utf8_lossy(record.id())
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_string();
            let sequence = record.seq().to_ascii_uppercase();
            scaffolds.insert(name, sequence);
        }

        let reference = Self::from_scaffolds(path, scaffolds);
        info!(
            "Reference {} has {} scaffolds with a total of {} bases",
            path.display(),
            reference.scaffolds.len(),
            reference.length
        );
        Ok(reference)
    }

    /// Build a reference from in-memory scaffolds, preserving their order.
    pub fn from_scaffolds(path: &Path, scaffolds: IndexMap<String, Vec<u8>>) -> Self {
        let length = scaffolds.values().map(|s| s.len()).sum();
        Reference {
            path: path.to_path_buf(),
            scaffolds,
            length,
        }
    }

    /// Total length of all scaffolds.
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Scaffold names in input order.
    pub fn scaffold_names(&self) -> impl Iterator<Item = &str> {
        self.scaffolds.keys().map(|s| s.as_str())
    }

    /// `(name, length)` pairs in input order.
    pub fn scaffold_lengths(&self) -> impl Iterator<Item = (&str, usize)> {
        self.scaffolds.iter().map(|(n, s)| (n.as_str(), s.len()))
    }

    /// The sequence of one scaffold.
    pub fn scaffold(&self, name: &str) -> Option<&[u8]> {
        self.scaffolds.get(name).map(|s| s.as_slice())
    }

    /// Translate a 0-based genome-wide coordinate into a scaffold name and
    /// 1-based local coordinate.
    pub fn scaffold_coord(&self, coord: usize) -> Option<(&str, usize)> {
        let mut offset = 0;
        for (name, seq) in &self.scaffolds {
            if coord < offset + seq.len() {
                return Some((name.as_str(), coord + 1 - offset));
            }
            offset += seq.len();
        }
        None
    }

    /// Translate a 1-based scaffold coordinate into a 0-based genome-wide
    /// coordinate.
    pub fn scaffold_to_genome_coord(&self, scaffold: &str, coord: usize) -> Option<usize> {
        let mut offset = 0;
        for (name, seq) in &self.scaffolds {
            if name == scaffold {
                return Some(offset + coord - 1);
            }
            offset += seq.len();
        }
        None
    }

    /// Extract `length` bases of `name` starting at 1-based `coord`.
    pub fn get_sequence(&self, name: &str, coord: usize, length: usize) -> Result<&[u8]> {
        let seq = self.scaffolds.get(name).ok_or_else(|| {
            StrainError::MissingData(format!(
                "scaffold '{}' not in reference {}",
                name,
                self.path.display()
            ))
        })?;
        if coord == 0 || coord - 1 + length > seq.len() {
            return Err(StrainError::MissingData(format!(
                "coordinates {coord}..{} out of range for scaffold '{name}' of length {}",
                coord + length - 1,
                seq.len()
            )));
        }
        Ok(&seq[coord - 1..coord - 1 + length])
    }
}

/// Sidecar metadata for a reference, as produced by reference preparation.
///
/// `repetitiveness` maps each scaffold to the fraction of its content shared
/// with other scaffolds in the concatenated reference.
#[derive(Debug, Clone, Deserialize)]
pub struct ReferenceMetadata {
    pub repetitiveness: HashMap<String, f64>,
}

/// Load the `.meta.json` sidecar next to a reference FASTA.
///
/// A missing sidecar is not an error: abundance is then computed without
/// repetitiveness correction, with a warning.
pub fn load_metadata(fasta: &Path) -> Result<Option<ReferenceMetadata>> {
    let meta_path = fasta.with_extension("meta.json");
    if !meta_path.is_file() {
        warn!(
            "No metadata file {} for reference; abundance metrics may be skewed by repetitive \
             content",
            meta_path.display()
        );
        return Ok(None);
    }

    let file = File::open(&meta_path).map_err(|e| StrainError::external(&meta_path, e))?;
    let metadata: ReferenceMetadata = serde_json::from_reader(file)
        .map_err(|e| StrainError::BadInput(format!("{}: {}", meta_path.display(), e)))?;
    Ok(Some(metadata))
}
