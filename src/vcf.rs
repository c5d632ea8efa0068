//! VCF reading and writing for variant caller and annotator exchange

use crate::utils::is_gzipped;
use crate::{MutmapError, MutmapResult, Variant};
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

/// Column indices for VCF parsing
#[derive(Debug, Clone)]
pub struct VcfColumnIndices {
    pub chrom: usize,
    pub pos: usize,
    pub ref_allele: usize,
    pub alt: usize,
    pub info: usize,
}

impl Default for VcfColumnIndices {
    fn default() -> Self {
        Self {
            chrom: 0,
            pos: 1,
            ref_allele: 3,
            alt: 4,
            info: 7,
        }
    }
}

impl VcfColumnIndices {
    pub fn from_header(header_line: &str) -> MutmapResult<Self> {
        let fields: Vec<&str> = header_line.trim().split('\t').collect();
        let find = |names: &[&str]| {
            fields
                .iter()
                .position(|col| names.contains(col))
                .ok_or_else(|| {
                    MutmapError::InvalidVariant(format!("{} column not found in VCF header", names[0]))
                })
        };

        Ok(VcfColumnIndices {
            chrom: find(&["CHROM", "#CHROM"])?,
            pos: find(&["POS"])?,
            ref_allele: find(&["REF"])?,
            alt: find(&["ALT"])?,
            info: find(&["INFO"])?,
        })
    }
}

/// Represents a VCF record with essential information
#[derive(Debug, Clone, PartialEq)]
pub struct VcfRecord {
    pub variant: Variant,
    pub info: String,
}

impl VcfRecord {
    pub fn from_line_with_indices(line: &str, indices: &VcfColumnIndices) -> MutmapResult<Self> {
        let fields: Vec<&str> = line.split('\t').collect();
        let needed = [
            indices.chrom,
            indices.pos,
            indices.ref_allele,
            indices.alt,
            indices.info,
        ]
        .into_iter()
        .max()
        .unwrap_or(0);

        if fields.len() <= needed {
            return Err(MutmapError::InvalidVariant(format!(
                "Invalid VCF line format - not enough columns: {}",
                line
            )));
        }

        let pos = fields[indices.pos]
            .parse::<u32>()
            .map_err(|_| MutmapError::InvalidVariant(format!("Invalid position: {}", fields[indices.pos])))?;

        Ok(VcfRecord {
            variant: Variant::new(
                fields[indices.chrom].to_string(),
                pos,
                fields[indices.ref_allele].to_string(),
                fields[indices.alt].to_string(),
            ),
            info: fields[indices.info].to_string(),
        })
    }

    /// Parse with the standard column order
    pub fn from_line(line: &str) -> MutmapResult<Self> {
        Self::from_line_with_indices(line, &VcfColumnIndices::default())
    }

    pub fn to_line(&self) -> String {
        format!(
            "{}\t{}\t.\t{}\t{}\t.\tPASS\t{}",
            self.variant.chrom,
            self.variant.pos,
            self.variant.ref_allele,
            self.variant.alt_allele,
            self.info
        )
    }

    /// Value of an INFO key, if present
    pub fn info_field(&self, key: &str) -> Option<&str> {
        self.info.split(';').find_map(|entry| {
            let (k, v) = entry.split_once('=')?;
            (k == key).then_some(v)
        })
    }

    /// One record per alternate allele
    pub fn split_alleles(&self) -> Vec<Variant> {
        self.variant
            .alt_allele
            .split(',')
            .filter(|alt| !alt.is_empty() && *alt != ".")
            .map(|alt| {
                Variant::new(
                    self.variant.chrom.clone(),
                    self.variant.pos,
                    self.variant.ref_allele.clone(),
                    alt.to_string(),
                )
            })
            .collect()
    }
}

/// Parse VCF records from a reader, skipping malformed lines with a warning
pub fn read_vcf_records<R: BufRead>(reader: R) -> MutmapResult<Vec<VcfRecord>> {
    let mut records = Vec::new();
    let mut column_indices: Option<VcfColumnIndices> = None;

    for line in reader.lines() {
        let line = line?;
        let line = line.trim_end();

        if line.starts_with("##") {
            continue;
        }

        if line.starts_with('#') {
            column_indices = Some(VcfColumnIndices::from_header(line)?);
            continue;
        }

        if line.is_empty() {
            continue;
        }

        let record = match column_indices {
            Some(ref indices) => VcfRecord::from_line_with_indices(line, indices),
            None => VcfRecord::from_line(line),
        };

        match record {
            Ok(record) => records.push(record),
            Err(e) => log::warn!("Skipping invalid VCF record: {}", e),
        }
    }

    Ok(records)
}

/// Read VCF variants from a plain or gzipped file, one per alternate allele
pub fn read_vcf_variants<P: AsRef<Path>>(path: P) -> MutmapResult<Vec<Variant>> {
    let file = File::open(&path)
        .map_err(|_| MutmapError::FileNotFound(path.as_ref().to_string_lossy().to_string()))?;

    let reader: Box<dyn BufRead> = if is_gzipped(&path)? {
        Box::new(BufReader::new(MultiGzDecoder::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };

    Ok(read_vcf_records(reader)?
        .iter()
        .flat_map(VcfRecord::split_alleles)
        .collect())
}

/// Write a minimal sites-only VCF
pub fn write_vcf<W: Write>(writer: &mut W, variants: &[Variant]) -> MutmapResult<()> {
    writeln!(writer, "##fileformat=VCFv4.2")?;

    let mut contigs: Vec<&str> = variants.iter().map(|v| v.chrom.as_str()).collect();
    contigs.dedup();
    for contig in contigs {
        writeln!(writer, "##contig=<ID={}>", contig)?;
    }

    writeln!(writer, "#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO")?;
    for variant in variants {
        let record = VcfRecord {
            variant: variant.clone(),
            info: ".".to_string(),
        };
        writeln!(writer, "{}", record.to_line())?;
    }
    Ok(())
}
