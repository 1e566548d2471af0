//! Variant caller driver.
//!
//! Consumes two streams produced by the external alignment collaborator: a
//! plain iterator of alignments (for abundance estimation) and an iterator
//! of pileup columns (for evidence accumulation). The driver applies the
//! read-quality gates, feeds the per-scaffold counters and runs the three
//! finalization passes. It is strictly sequential: the pileup pass depends
//! on rejected mates recorded earlier in alignment order.

use std::collections::HashSet;
use std::sync::Arc;

use log::{debug, info};

use crate::call::allele::Allele;
use crate::call::data::VariantCallData;
use crate::error::{Result, StrainError};
use crate::reference::Reference;

/// One read alignment as reported by the external alignment reader.
#[derive(Debug, Clone)]
pub struct Alignment {
    pub query_name: String,
    pub reference_name: String,
    pub mapping_quality: u8,
    pub is_paired: bool,
    pub is_proper_pair: bool,
    pub is_reverse: bool,
    pub query_length: usize,
    pub query_alignment_length: usize,
    /// Inferred template length; sign encodes orientation.
    pub template_length: i64,
    /// 0-based reference interval covered by the alignment.
    pub reference_start: usize,
    pub reference_end: usize,
    pub query_sequence: Vec<u8>,
    pub query_qualities: Vec<u8>,
    /// Edit distance (NM tag), when reported.
    pub num_mismatches: Option<u32>,
    /// Ambiguous-alignment tag (XA): semicolon-separated
    /// `scaffold,±pos,cigar,mismatches` entries.
    pub alt_locations: Option<String>,
}

impl Alignment {
    fn is_clipped(&self) -> bool {
        self.query_alignment_length != self.query_length
    }

    fn insert_too_short(&self) -> bool {
        self.is_paired && (self.template_length.unsigned_abs() as usize) < self.query_length
    }

    fn too_many_mismatches(&self, ceiling: Option<u32>) -> bool {
        match ceiling {
            Some(max) => self.num_mismatches.unwrap_or(0) > max,
            None => false,
        }
    }
}

/// One read's contribution to a pileup column.
#[derive(Debug, Clone)]
pub struct PileupRead {
    pub alignment: Arc<Alignment>,
    /// The read has a deletion at this column.
    pub is_del: bool,
    /// Length of the indel starting at this column; positive for an
    /// insertion.
    pub indel: i32,
    /// Query offset of this column, or of the next aligned base within a
    /// deletion.
    pub query_position_or_next: usize,
}

/// One pileup column: every read overlapping a reference position.
#[derive(Debug, Clone)]
pub struct PileupColumn {
    pub reference_name: String,
    pub reference_pos: usize,
    pub reads: Vec<PileupRead>,
}

/// An alternative alignment location decoded from the ambiguous-alignment
/// tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AltLocation {
    pub scaffold: String,
    /// Translated 0-based reference position; may fall outside the scaffold.
    pub pos: i64,
    /// Whether the alternative is on the opposite strand from the primary.
    pub rc: bool,
}

/// Read-quality gates and call thresholds.
#[derive(Debug, Clone)]
pub struct CallerConfig {
    /// Minimum base quality for a pileup observation.
    pub min_qual: u8,
    /// Minimum summed base quality for a strong allele call.
    pub min_pileup_qual: u32,
    /// Minimum fraction of a position's quality an allele needs for a strong
    /// call.
    pub min_qual_frac: f64,
    /// Below this mapping quality reads count as low-MQ evidence only.
    pub min_mapping_quality: u8,
    /// Minimum size of a reported coverage gap, before coverage scaling.
    pub min_gap_size: u32,
    /// Reject reads with more mismatches than this, when set.
    pub max_num_mismatches: Option<u32>,
}

impl Default for CallerConfig {
    fn default() -> Self {
        CallerConfig {
            min_qual: 5,
            min_pileup_qual: 50,
            min_qual_frac: 0.1,
            min_mapping_quality: 5,
            min_gap_size: 2000,
            max_num_mismatches: None,
        }
    }
}

/// Collects read alignments and updates the per-scaffold call statistics.
pub struct VariantCaller {
    config: CallerConfig,
    discarded_reads: HashSet<String>,
}

impl VariantCaller {
    pub fn new(config: CallerConfig) -> Result<Self> {
        if !(0.0..=1.0).contains(&config.min_qual_frac) {
            return Err(StrainError::InvalidConfig(format!(
                "min_qual_frac {} outside [0, 1]",
                config.min_qual_frac
            )));
        }
        Ok(VariantCaller {
            config,
            discarded_reads: HashSet::new(),
        })
    }

    /// Process the alignment and pileup streams against a reference and
    /// produce finalized call data.
    ///
    /// # Arguments
    ///
    /// * `reference` - The concatenated reference the reads were aligned to.
    /// * `alignments` - Every alignment once, for abundance estimation.
    /// * `pileup` - Pileup columns in reference order.
    ///
    /// # Returns
    ///
    /// * `Result<VariantCallData>` - Finalized per-scaffold call data, ready
    ///   for summarizing.
    pub fn process<A, P>(
        &mut self,
        reference: &Reference,
        alignments: A,
        pileup: P,
    ) -> Result<VariantCallData>
    where
        A: IntoIterator<Item = Alignment>,
        P: IntoIterator<Item = PileupColumn>,
    {
        let mut data = VariantCallData::new(reference.scaffold_lengths(), self.config.min_gap_size);
        data.load_reference(reference)?;

        info!("Estimating abundance...");
        for alignment in alignments {
            // Only count uniquely mapped reads.
            if alignment.mapping_quality < 3 || alignment.alt_locations.is_some() {
                continue;
            }
            if alignment.is_paired && !alignment.is_proper_pair {
                continue;
            }
            if alignment.is_clipped() {
                continue;
            }
            if alignment.insert_too_short() {
                continue;
            }
            if alignment.too_many_mismatches(self.config.max_num_mismatches) {
                continue;
            }
            data.inc_uniquely_mapped_reads(&alignment.reference_name)?;
        }

        info!("Processing pileups...");
        self.discarded_reads = HashSet::new();
        for column in pileup {
            for read in &column.reads {
                self.assess_read(&mut data, &column.reference_name, column.reference_pos, read)?;
            }
        }

        info!("Analyzing coverage...");
        data.analyze_coverage()?;

        info!("Calling alleles...");
        data.call_alleles(self.config.min_pileup_qual, self.config.min_qual_frac);

        info!("Finding gaps...");
        data.find_gaps();
        info!("Done.");

        Ok(data)
    }

    fn assess_read(
        &mut self,
        data: &mut VariantCallData,
        scaffold: &str,
        refpos: usize,
        read: &PileupRead,
    ) -> Result<()> {
        let alignment = &read.alignment;

        // Query names are shared between mates; a read whose mate was
        // rejected is rejected too.
        if self.discarded_reads.contains(&alignment.query_name) {
            return data.bad_read(scaffold, refpos);
        }

        if alignment.is_paired && !alignment.is_proper_pair {
            self.discarded_reads.insert(alignment.query_name.clone());
            return data.bad_read(scaffold, refpos);
        }

        // Restrict ourselves to full-length alignments.
        if alignment.is_clipped() {
            self.discarded_reads.insert(alignment.query_name.clone());
            return data.bad_read(scaffold, refpos);
        }

        if alignment.insert_too_short() {
            self.discarded_reads.insert(alignment.query_name.clone());
            return data.bad_read(scaffold, refpos);
        }

        if alignment.too_many_mismatches(self.config.max_num_mismatches) {
            self.discarded_reads.insert(alignment.query_name.clone());
            return data.bad_read(scaffold, refpos);
        }

        // Base quality gate; a low-quality base rejects only this position,
        // the rest of the read may still contribute elsewhere.
        let pos = read.query_position_or_next;
        let Some(&qual) = alignment.query_qualities.get(pos) else {
            return data.bad_read(scaffold, refpos);
        };
        if qual < self.config.min_qual {
            return data.bad_read(scaffold, refpos);
        }

        // Insertions and deletions are treated like alleles.
        let base = if read.is_del {
            Allele::DEL
        } else if read.indel > 0 {
            Allele::INS
        } else {
            let base = alignment
                .query_sequence
                .get(pos)
                .map(|&b| Allele::from_base(b))
                .unwrap_or(Allele::N);
            if base.is_empty() {
                return data.bad_read(scaffold, refpos);
            }
            base
        };

        let mq = alignment.mapping_quality;

        // Otherwise-good reads with low mapping quality mark repeats; the
        // low-MQ count is propagated to every location the read maps
        // equally well, which influences gap prediction there.
        if mq < self.config.min_mapping_quality {
            data.low_mapping_quality(scaffold, refpos)?;
            for alt in Self::alternative_locations(alignment, refpos) {
                if alt.pos >= 0 {
                    data.low_mapping_quality(&alt.scaffold, alt.pos as usize)?;
                } else {
                    debug!("Negative alternative position, ignoring");
                }
            }
            return Ok(());
        }

        data.good_read(scaffold, refpos, base, qual, mq, false)?;

        if mq <= 3 {
            // Scoring a barely-placeable read: score its alternative
            // alignment locations too, with the complemented base when the
            // strands differ.
            for alt in Self::alternative_locations(alignment, refpos) {
                if alt.pos >= 0 {
                    data.good_read(&alt.scaffold, alt.pos as usize, base, qual, mq, alt.rc)?;
                }
            }
        }

        Ok(())
    }

    /// Decode the ambiguous-alignment tag into alternative locations for the
    /// reference position `loc` of the primary alignment.
    ///
    /// Entries with clipped or indel-containing cigars are skipped, as are
    /// entries with more mismatches than the primary alignment. The primary
    /// read offset is carried onto each alternative, honouring strand.
    pub fn alternative_locations(alignment: &Alignment, loc: usize) -> Vec<AltLocation> {
        let Some(xa) = &alignment.alt_locations else {
            return Vec::new();
        };
        let nm = alignment.num_mismatches.unwrap_or(0);

        let read_rc = alignment.is_reverse;
        let offset = if read_rc {
            alignment.reference_end as i64 - loc as i64 - 1
        } else {
            loc as i64 - alignment.reference_start as i64
        };

        let mut locations = Vec::new();
        for entry in xa.split(';') {
            if entry.is_empty() {
                continue;
            }
            let fields: Vec<&str> = entry.split(',').collect();
            if fields.len() != 4 {
                debug!("Ignoring malformed alternative alignment '{entry}'");
                continue;
            }

            let cigar = fields[2];
            if cigar.contains(['S', 'H', 'D', 'I']) {
                // Clipped or indel-containing alternative; skip to keep
                // coordinates in sync with the primary.
                debug!("Ignoring clipped alternative alignment");
                continue;
            }

            let (Ok(pos), Ok(alt_nm)) = (fields[1].parse::<i64>(), fields[3].parse::<u32>())
            else {
                debug!("Ignoring malformed alternative alignment '{entry}'");
                continue;
            };
            if alt_nm > nm {
                continue;
            }

            let rc = pos < 0;
            let pos = pos.abs() - 1;
            let coord = if rc {
                pos + alignment.query_length as i64 - offset - 1
            } else {
                pos + offset
            };

            locations.push(AltLocation {
                scaffold: fields[0].to_string(),
                pos: coord,
                rc: rc != read_rc,
            });
        }
        locations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use std::path::Path;

    fn simple_alignment(name: &str, scaffold: &str, base: u8, qual: u8, mq: u8) -> Arc<Alignment> {
        Arc::new(Alignment {
            query_name: name.to_string(),
            reference_name: scaffold.to_string(),
            mapping_quality: mq,
            is_paired: false,
            is_proper_pair: false,
            is_reverse: false,
            query_length: 1,
            query_alignment_length: 1,
            template_length: 0,
            reference_start: 0,
            reference_end: 1,
            query_sequence: vec![base],
            query_qualities: vec![qual],
            num_mismatches: Some(0),
            alt_locations: None,
        })
    }

    fn pileup_read(alignment: Arc<Alignment>) -> PileupRead {
        PileupRead {
            alignment,
            is_del: false,
            indel: 0,
            query_position_or_next: 0,
        }
    }

    fn uniform_reference(length: usize) -> Reference {
        let mut scaffolds = IndexMap::new();
        scaffolds.insert("chr".to_string(), vec![b'A'; length]);
        Reference::from_scaffolds(Path::new("ref.fa"), scaffolds)
    }

    /// Depth-`depth` matching pileup over `positions`, quality 30, MQ 60.
    fn uniform_pileup(positions: impl Iterator<Item = usize>, depth: usize) -> Vec<PileupColumn> {
        positions
            .map(|pos| PileupColumn {
                reference_name: "chr".to_string(),
                reference_pos: pos,
                reads: (0..depth)
                    .map(|i| pileup_read(simple_alignment(&format!("r{pos}_{i}"), "chr", b'A', 30, 60)))
                    .collect(),
            })
            .collect()
    }

    #[test]
    fn test_uniform_reference_calls_confirm_everywhere() {
        let reference = uniform_reference(1000);
        let pileup = uniform_pileup(0..1000, 30);
        let alignments: Vec<Alignment> = (0..100)
            .map(|i| (*simple_alignment(&format!("a{i}"), "chr", b'A', 30, 60)).clone())
            .collect();

        let mut caller = VariantCaller::new(CallerConfig::default()).unwrap();
        let data = caller.process(&reference, alignments, pileup).unwrap();

        let chr = &data.scaffolds["chr"];
        assert_eq!(chr.read_count, 100);
        for pos in 0..1000 {
            assert_eq!(chr.strong[pos], chr.refmask[pos]);
        }
        assert!(chr.gaps.is_empty());
        assert_eq!(data.mean_coverage, 30.0);
    }

    #[test]
    fn test_gap_detection_end_to_end() {
        let reference = uniform_reference(1000);
        let pileup = uniform_pileup((0..400).chain(600..1000), 30);

        let config = CallerConfig {
            min_gap_size: 100,
            ..Default::default()
        };
        let mut caller = VariantCaller::new(config).unwrap();
        let data = caller.process(&reference, Vec::new(), pileup).unwrap();

        let chr = &data.scaffolds["chr"];
        assert_eq!(chr.gaps.len(), 1);
        assert_eq!((chr.gaps[0].start, chr.gaps[0].end), (400, 600));
    }

    #[test]
    fn test_abundance_gates() {
        let reference = uniform_reference(100);

        let good = (*simple_alignment("good", "chr", b'A', 30, 60)).clone();
        let mut low_mq = good.clone();
        low_mq.mapping_quality = 2;
        let mut ambiguous = good.clone();
        ambiguous.alt_locations = Some("chr,+5,1M,0;".to_string());
        let mut clipped = good.clone();
        clipped.query_alignment_length = 0;
        let mut improper = good.clone();
        improper.is_paired = true;
        improper.is_proper_pair = false;
        let mut short_insert = good.clone();
        short_insert.is_paired = true;
        short_insert.is_proper_pair = true;
        short_insert.query_length = 100;
        short_insert.query_alignment_length = 100;
        short_insert.template_length = 50;
        let mut mismatched = good.clone();
        mismatched.num_mismatches = Some(10);

        let alignments = vec![good, low_mq, ambiguous, clipped, improper, short_insert, mismatched];

        let config = CallerConfig {
            max_num_mismatches: Some(5),
            ..Default::default()
        };
        let mut caller = VariantCaller::new(config).unwrap();
        let data = caller
            .process(&reference, alignments, Vec::new())
            .unwrap();

        // Of the seven, only the first passes every gate.
        assert_eq!(data.uniquely_mapped_reads, 1);
        assert_eq!(data.scaffolds["chr"].read_count, 1);
    }

    #[test]
    fn test_discarded_mate_rejects_later_positions() {
        let reference = uniform_reference(100);

        let mut clipped = (*simple_alignment("pair1", "chr", b'A', 30, 60)).clone();
        clipped.query_alignment_length = 0;
        let clipped = Arc::new(clipped);
        let mate = simple_alignment("pair1", "chr", b'A', 30, 60);

        let pileup = vec![
            PileupColumn {
                reference_name: "chr".to_string(),
                reference_pos: 0,
                reads: vec![pileup_read(clipped)],
            },
            PileupColumn {
                reference_name: "chr".to_string(),
                reference_pos: 1,
                reads: vec![pileup_read(mate)],
            },
        ];

        let mut caller = VariantCaller::new(CallerConfig::default()).unwrap();
        let data = caller.process(&reference, Vec::new(), pileup).unwrap();

        let chr = &data.scaffolds["chr"];
        // Both the clipped read and its (otherwise fine) mate are rejected.
        assert_eq!(chr.bad[0], 1);
        assert_eq!(chr.bad[1], 1);
        assert_eq!(chr.depth(1), 0);
    }

    #[test]
    fn test_low_base_quality_rejects_position_only() {
        let reference = uniform_reference(100);
        let read = simple_alignment("r1", "chr", b'A', 2, 60);

        let pileup = vec![PileupColumn {
            reference_name: "chr".to_string(),
            reference_pos: 0,
            reads: vec![pileup_read(read.clone())],
        }];

        let mut caller = VariantCaller::new(CallerConfig::default()).unwrap();
        let data = caller.process(&reference, Vec::new(), pileup).unwrap();

        let chr = &data.scaffolds["chr"];
        assert_eq!(chr.bad[0], 1);
        // The read itself is not discarded.
        assert!(!caller.discarded_reads.contains("r1"));
    }

    #[test]
    fn test_indels_and_n_bases() {
        let reference = uniform_reference(100);

        let del = PileupRead {
            alignment: simple_alignment("d", "chr", b'A', 30, 60),
            is_del: true,
            indel: 0,
            query_position_or_next: 0,
        };
        let ins = PileupRead {
            alignment: simple_alignment("i", "chr", b'A', 30, 60),
            is_del: false,
            indel: 3,
            query_position_or_next: 0,
        };
        let n_base = pileup_read(simple_alignment("n", "chr", b'N', 30, 60));

        let pileup = vec![PileupColumn {
            reference_name: "chr".to_string(),
            reference_pos: 7,
            reads: vec![del, ins, n_base],
        }];

        let mut caller = VariantCaller::new(CallerConfig::default()).unwrap();
        let data = caller.process(&reference, Vec::new(), pileup).unwrap();

        let chr = &data.scaffolds["chr"];
        assert_eq!(chr.allele_count(7, Allele::DEL), 1);
        assert_eq!(chr.allele_count(7, Allele::INS), 1);
        assert_eq!(chr.bad[7], 1);
    }

    #[test]
    fn test_low_mapping_quality_counted_not_called() {
        let reference = uniform_reference(100);
        let read = simple_alignment("r1", "chr", b'A', 30, 4);

        let pileup = vec![PileupColumn {
            reference_name: "chr".to_string(),
            reference_pos: 3,
            reads: vec![pileup_read(read)],
        }];

        let mut caller = VariantCaller::new(CallerConfig::default()).unwrap();
        let data = caller.process(&reference, Vec::new(), pileup).unwrap();

        let chr = &data.scaffolds["chr"];
        assert_eq!(chr.lowmq_count[3], 1);
        assert_eq!(chr.depth(3), 0);
    }

    fn xa_alignment() -> Alignment {
        Alignment {
            query_name: "xa".to_string(),
            reference_name: "chr1".to_string(),
            mapping_quality: 2,
            is_paired: false,
            is_proper_pair: false,
            is_reverse: false,
            query_length: 100,
            query_alignment_length: 100,
            template_length: 0,
            reference_start: 100,
            reference_end: 200,
            query_sequence: vec![b'A'; 100],
            query_qualities: vec![30; 100],
            num_mismatches: Some(1),
            alt_locations: Some("chr2,+501,100M,0;chr2,-301,100M,1;chr3,+11,50S50M,0;chr3,+21,100M,5;".to_string()),
        }
    }

    #[test]
    fn test_alternative_locations_forward_primary() {
        let alignment = xa_alignment();
        // Column at reference 105 is query offset 5.
        let alts = VariantCaller::alternative_locations(&alignment, 105);

        // The clipped entry and the higher-mismatch entry are dropped.
        assert_eq!(alts.len(), 2);
        // Forward alternative at 0-based 500: same offset from its start.
        assert_eq!(alts[0], AltLocation { scaffold: "chr2".to_string(), pos: 505, rc: false });
        // Reverse alternative at 0-based 300: offset counted from the other
        // end, strands differ from the forward primary.
        assert_eq!(alts[1], AltLocation { scaffold: "chr2".to_string(), pos: 300 + 100 - 5 - 1, rc: true });
    }

    #[test]
    fn test_alternative_locations_reverse_primary() {
        let mut alignment = xa_alignment();
        alignment.is_reverse = true;
        // For a reverse primary the offset counts from the alignment end.
        let alts = VariantCaller::alternative_locations(&alignment, 105);

        let offset = 200 - 105 - 1; // 94
        // Forward alternative differs in strand from the reverse primary.
        assert_eq!(alts[0].pos, 500 + offset);
        assert!(alts[0].rc);
        // Reverse alternative now matches the primary strand.
        assert_eq!(alts[1].pos, 300 + 100 - offset - 1);
        assert!(!alts[1].rc);
    }

    #[test]
    fn test_low_mq_propagates_to_alternatives() {
        let mut scaffolds = IndexMap::new();
        scaffolds.insert("chr1".to_string(), vec![b'A'; 1000]);
        scaffolds.insert("chr2".to_string(), vec![b'A'; 1000]);
        let reference = Reference::from_scaffolds(Path::new("ref.fa"), scaffolds);

        let read = PileupRead {
            alignment: Arc::new(xa_alignment()),
            is_del: false,
            indel: 0,
            query_position_or_next: 5,
        };
        let pileup = vec![PileupColumn {
            reference_name: "chr1".to_string(),
            reference_pos: 105,
            reads: vec![read],
        }];

        let mut caller = VariantCaller::new(CallerConfig::default()).unwrap();
        let data = caller.process(&reference, Vec::new(), pileup).unwrap();

        assert_eq!(data.scaffolds["chr1"].lowmq_count[105], 1);
        assert_eq!(data.scaffolds["chr2"].lowmq_count[505], 1);
        assert_eq!(data.scaffolds["chr2"].lowmq_count[300 + 100 - 5 - 1], 1);
    }

    #[test]
    fn test_mq3_good_read_propagates_with_rc_base() {
        let mut scaffolds = IndexMap::new();
        scaffolds.insert("chr1".to_string(), vec![b'A'; 1000]);
        scaffolds.insert("chr2".to_string(), vec![b'A'; 1000]);
        let reference = Reference::from_scaffolds(Path::new("ref.fa"), scaffolds);

        let mut alignment = xa_alignment();
        alignment.mapping_quality = 3;
        alignment.query_sequence = vec![b'C'; 100];
        let read = PileupRead {
            alignment: Arc::new(alignment),
            is_del: false,
            indel: 0,
            query_position_or_next: 5,
        };
        let pileup = vec![PileupColumn {
            reference_name: "chr1".to_string(),
            reference_pos: 105,
            reads: vec![read],
        }];

        let config = CallerConfig {
            min_mapping_quality: 3,
            ..Default::default()
        };
        let mut caller = VariantCaller::new(config).unwrap();
        let data = caller.process(&reference, Vec::new(), pileup).unwrap();

        // Primary and same-strand alternative record C; the opposite-strand
        // alternative records the complement G.
        assert_eq!(data.scaffolds["chr1"].allele_count(105, Allele::C), 1);
        assert_eq!(data.scaffolds["chr2"].allele_count(505, Allele::C), 1);
        assert_eq!(
            data.scaffolds["chr2"].allele_count(300 + 100 - 5 - 1, Allele::G),
            1
        );
    }

    #[test]
    fn test_config_validation() {
        let bad = CallerConfig {
            min_qual_frac: 1.5,
            ..Default::default()
        };
        assert!(matches!(
            VariantCaller::new(bad),
            Err(StrainError::InvalidConfig(_))
        ));
    }
}
