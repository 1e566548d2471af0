//! Binary persistence for k-mer sets and pan-genome databases.
//!
//! A container carries a `type` tag ("KmerSet"), a format version, the
//! scalar attributes `k` and `nSeqs`, and up to three aligned arrays:
//! `kmers` (u64), `counts` (u32) and `fingerprint` (u64). A database file
//! additionally holds one named group per strain, each satisfying the same
//! schema, with the top-level set representing the union of all strains.
//! Containers are bincode-encoded and optionally gzip-compressed; the codec
//! is detected on load from the gzip magic bytes.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use bincode::{Decode, Encode};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::debug;

use crate::error::{Result, StrainError};
use crate::kmer::KmerSet;

/// Value of the container `type` attribute.
pub const FILE_TYPE: &str = "KmerSet";

/// Current container format version.
pub const FORMAT_VERSION: u32 = 1;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// One k-mer set within a container: the top-level set or a strain group.
#[derive(Debug, Clone, Encode, Decode)]
pub(crate) struct KmerSetGroup {
    pub k: u32,
    pub n_seqs: u64,
    pub kmers: Vec<u64>,
    pub counts: Vec<u32>,
    pub fingerprint: Option<Vec<u64>>,
}

/// On-disk container for a k-mer set or a pan-genome database.
#[derive(Debug, Encode, Decode)]
pub(crate) struct Container {
    pub file_type: String,
    pub version: u32,
    /// MinHash fraction used for the fingerprints; 0 when none was computed.
    /// Required by consumers operating in fingerprint mode.
    pub fingerprint_fraction: f64,
    pub root: KmerSetGroup,
    /// Per-strain groups, in database insertion order. Empty for a plain
    /// k-mer set file.
    pub strains: Vec<(String, KmerSetGroup)>,
}

impl KmerSetGroup {
    pub fn from_set(set: &KmerSet) -> Self {
        KmerSetGroup {
            k: set.k,
            n_seqs: set.n_seqs,
            kmers: set.kmers.clone(),
            counts: set.counts.clone(),
            fingerprint: set.fingerprint.clone(),
        }
    }

    /// Convert into a [`KmerSet`], validating the schema invariants.
    pub fn into_set(self) -> Result<KmerSet> {
        if self.kmers.len() != self.counts.len() {
            return Err(StrainError::BadInput(format!(
                "inconsistent parallel arrays: {} kmers vs {} counts",
                self.kmers.len(),
                self.counts.len()
            )));
        }
        if self.kmers.windows(2).any(|w| w[0] >= w[1]) {
            return Err(StrainError::BadInput(
                "k-mer array is not strictly sorted".into(),
            ));
        }
        if self.counts.iter().any(|&c| c == 0) {
            return Err(StrainError::BadInput("zero count in k-mer set".into()));
        }
        if let Some(fp) = &self.fingerprint {
            if fp.windows(2).any(|w| w[0] >= w[1]) {
                return Err(StrainError::BadInput(
                    "fingerprint array is not strictly sorted".into(),
                ));
            }
        }

        let mut set = KmerSet::new(self.k)?;
        set.n_seqs = self.n_seqs;
        set.kmers = self.kmers;
        set.counts = self.counts;
        set.fingerprint = self.fingerprint;
        Ok(set)
    }
}

fn write_container(container: &Container, path: &Path, compress: bool) -> Result<()> {
    let file = File::create(path).map_err(|e| StrainError::external(path, e))?;
    let config = bincode::config::standard();

    let result = if compress {
        let mut writer = GzEncoder::new(BufWriter::new(file), Compression::default());
        bincode::encode_into_std_write(container, &mut writer, config)
            .map_err(|e| StrainError::external(path, e))?;
        writer.finish().map(|_| ())
    } else {
        let mut writer = BufWriter::new(file);
        bincode::encode_into_std_write(container, &mut writer, config)
            .map_err(|e| StrainError::external(path, e))?;
        writer.flush()
    };
    result.map_err(|e| StrainError::external(path, e))
}

pub(crate) fn load_container(path: &Path) -> Result<Container> {
    let file = File::open(path).map_err(|e| StrainError::external(path, e))?;
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 2];
    reader
        .read_exact(&mut magic)
        .map_err(|e| StrainError::external(path, e))?;
    let magic_reader = magic.as_slice().chain(reader);

    let config = bincode::config::standard();
    let container: Container = if magic == GZIP_MAGIC {
        let mut decoder = GzDecoder::new(magic_reader);
        bincode::decode_from_std_read(&mut decoder, config)
            .map_err(|e| StrainError::BadInput(format!("{}: {}", path.display(), e)))?
    } else {
        let mut plain = magic_reader;
        bincode::decode_from_std_read(&mut plain, config)
            .map_err(|e| StrainError::BadInput(format!("{}: {}", path.display(), e)))?
    };

    if container.file_type != FILE_TYPE {
        return Err(StrainError::BadInput(format!(
            "{}: not a KmerSet container, unexpected type '{}'",
            path.display(),
            container.file_type
        )));
    }
    if container.version != FORMAT_VERSION {
        return Err(StrainError::BadInput(format!(
            "{}: unsupported container version {} (expected {})",
            path.display(),
            container.version,
            FORMAT_VERSION
        )));
    }

    debug!(
        "Loaded container {} ({} strain groups)",
        path.display(),
        container.strains.len()
    );
    Ok(container)
}

/// Save a single k-mer set.
pub fn save_kmerset(set: &KmerSet, path: &Path, compress: bool) -> Result<()> {
    let container = Container {
        file_type: FILE_TYPE.to_string(),
        version: FORMAT_VERSION,
        fingerprint_fraction: 0.0,
        root: KmerSetGroup::from_set(set),
        strains: Vec::new(),
    };
    write_container(&container, path, compress)
}

/// Load a single k-mer set, validating type tag, version and array
/// consistency.
pub fn load_kmerset(path: &Path) -> Result<KmerSet> {
    load_container(path)?.root.into_set()
}

/// Save a pan-genome database: the union set, the per-strain groups and the
/// fingerprint fraction used for sketching (0 when none).
pub fn save_database(
    union: &KmerSet,
    strains: &[(String, KmerSet)],
    fingerprint_fraction: f64,
    path: &Path,
    compress: bool,
) -> Result<()> {
    let container = Container {
        file_type: FILE_TYPE.to_string(),
        version: FORMAT_VERSION,
        fingerprint_fraction,
        root: KmerSetGroup::from_set(union),
        strains: strains
            .iter()
            .map(|(name, set)| (name.clone(), KmerSetGroup::from_set(set)))
            .collect(),
    };
    write_container(&container, path, compress)
}
