//! Input/output helpers.
//!
//! Sequence parsing is delegated to `needletail`, which handles FASTA and
//! FASTQ with transparent gzip/bzip2 decompression. The core only ever sees
//! an iterator of records; format and compression detection live here.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use needletail::{parse_fastx_file, FastxReader};

use crate::error::{Result, StrainError};

/// Open a FASTA/FASTQ file (optionally gz/bz2 compressed) for streaming.
///
/// Failures to open or recognize the file surface as
/// [`StrainError::ExternalFailure`] with the offending path attached.
pub fn open_sequence_reader(path: &Path) -> Result<Box<dyn FastxReader>> {
    parse_fastx_file(path).map_err(|e| StrainError::external(path, e))
}

/// Open an output stream: a file when a path is given, standard output
/// otherwise.
pub fn create_output(path: Option<&Path>) -> Result<Box<dyn Write>> {
    match path {
        Some(p) => {
            let file = File::create(p).map_err(|e| StrainError::external(p, e))?;
            Ok(Box::new(BufWriter::new(file)))
        }
        None => Ok(Box::new(io::stdout())),
    }
}
