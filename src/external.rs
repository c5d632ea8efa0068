//! Variant calling and annotation through external tools

use crate::candidates::{Annotation, Impact, VariantAnnotator, VariantCaller};
use crate::vcf::{read_vcf_records, read_vcf_variants, write_vcf, VcfRecord};
use crate::{MutmapError, MutmapResult, Pool, Region, Variant};
use std::collections::HashMap;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};

fn stderr_excerpt(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let lines: Vec<&str> = text.lines().rev().take(5).collect();
    lines.into_iter().rev().collect::<Vec<_>>().join(" | ")
}

fn check_output(tool: &str, output: &Output) -> MutmapResult<()> {
    if output.status.success() {
        return Ok(());
    }
    Err(MutmapError::external(
        tool,
        format!(
            "exit code {:?}: {}",
            output.status.code(),
            stderr_excerpt(&output.stderr)
        ),
    ))
}

/// Kill and reap a pipeline stage whose consumer could not be started
fn stop_child(child: &mut Child) {
    if let Err(e) = child.kill() {
        log::debug!("Could not kill child process {}: {}", child.id(), e);
    }
    let _ = child.wait();
}

/// `bcftools mpileup | bcftools call -mv` over every file of both pools
#[derive(Debug, Clone)]
pub struct BcftoolsCaller {
    program: PathBuf,
    reference: PathBuf,
    min_mapping_quality: u8,
    min_base_quality: u8,
}

impl BcftoolsCaller {
    pub fn new<P: AsRef<Path>>(reference: P, min_mapping_quality: u8, min_base_quality: u8) -> Self {
        Self {
            program: PathBuf::from("bcftools"),
            reference: reference.as_ref().to_path_buf(),
            min_mapping_quality,
            min_base_quality,
        }
    }

    pub fn with_program<P: AsRef<Path>>(mut self, program: P) -> Self {
        self.program = program.as_ref().to_path_buf();
        self
    }
}

impl VariantCaller for BcftoolsCaller {
    fn call(&self, region: &Region, wild_type: &Pool, mutant: &Pool) -> MutmapResult<Vec<Variant>> {
        // mpileup's diagnostics go to a file so a full pipe cannot stall it
        let mut mpileup_stderr = tempfile::tempfile()?;

        let mut mpileup = Command::new(&self.program)
            .arg("mpileup")
            .arg("-f")
            .arg(&self.reference)
            .arg("-r")
            .arg(region.to_string())
            .arg("-q")
            .arg(self.min_mapping_quality.to_string())
            .arg("-Q")
            .arg(self.min_base_quality.to_string())
            .arg("-Ou")
            .args(wild_type.files.iter().chain(&mutant.files))
            .stdout(Stdio::piped())
            .stderr(Stdio::from(mpileup_stderr.try_clone()?))
            .spawn()
            .map_err(|e| MutmapError::external("bcftools mpileup", e.to_string()))?;

        let Some(pipe) = mpileup.stdout.take() else {
            stop_child(&mut mpileup);
            return Err(MutmapError::external("bcftools mpileup", "no stdout pipe"));
        };

        let call = match Command::new(&self.program)
            .args(["call", "-mv", "-Ov"])
            .stdin(Stdio::from(pipe))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
        {
            Ok(call) => call,
            Err(e) => {
                stop_child(&mut mpileup);
                return Err(MutmapError::external("bcftools call", e.to_string()));
            }
        };

        let status = mpileup.wait()?;
        if !status.success() {
            let mut stderr = Vec::new();
            mpileup_stderr.seek(SeekFrom::Start(0))?;
            mpileup_stderr.read_to_end(&mut stderr)?;
            return Err(MutmapError::external(
                "bcftools mpileup",
                format!("exit code {:?}: {}", status.code(), stderr_excerpt(&stderr)),
            ));
        }
        check_output("bcftools call", &call)?;

        let records = read_vcf_records(Cursor::new(call.stdout))?;
        let mut variants: Vec<Variant> = records.iter().flat_map(VcfRecord::split_alleles).collect();
        variants.sort();
        log::debug!("bcftools called {} variants in {}", variants.len(), region);
        Ok(variants)
    }
}

/// Serves variants from a pre-called VCF instead of calling them
#[derive(Debug, Clone)]
pub struct VcfFileCaller {
    variants: Vec<Variant>,
}

impl VcfFileCaller {
    pub fn from_path<P: AsRef<Path>>(path: P) -> MutmapResult<Self> {
        let mut variants = read_vcf_variants(path)?;
        variants.sort();
        log::info!("Loaded {} pre-called variants", variants.len());
        Ok(Self { variants })
    }

    pub fn from_variants(mut variants: Vec<Variant>) -> Self {
        variants.sort();
        Self { variants }
    }
}

impl VariantCaller for VcfFileCaller {
    fn call(&self, region: &Region, _wild_type: &Pool, _mutant: &Pool) -> MutmapResult<Vec<Variant>> {
        Ok(self
            .variants
            .iter()
            .filter(|v| region.contains(&v.chrom, v.pos))
            .cloned()
            .collect())
    }
}

/// Pick the most severe `ANN` entry for `alt`.
///
/// Entries look like `Allele|Annotation|Annotation_Impact|Gene_Name|...`.
pub fn parse_ann(value: &str, alt: &str) -> Option<Annotation> {
    value
        .split(',')
        .filter_map(|entry| {
            let fields: Vec<&str> = entry.split('|').collect();
            if fields.len() < 3 || fields[0] != alt {
                return None;
            }
            let impact = Impact::parse(fields[2])?;
            let gene = fields
                .get(3)
                .filter(|g| !g.is_empty())
                .map(|g| g.to_string());
            Some(Annotation {
                consequence: fields[1].to_string(),
                impact,
                gene,
            })
        })
        .fold(None, |best: Option<Annotation>, a| match best {
            Some(b) if b.impact >= a.impact => Some(b),
            _ => Some(a),
        })
}

/// `snpEff ann` against a configured genome database
#[derive(Debug, Clone)]
pub struct SnpEffAnnotator {
    program: PathBuf,
    genome: String,
}

impl SnpEffAnnotator {
    pub fn new(genome: &str) -> Self {
        Self {
            program: PathBuf::from("snpEff"),
            genome: genome.to_string(),
        }
    }

    pub fn with_program<P: AsRef<Path>>(mut self, program: P) -> Self {
        self.program = program.as_ref().to_path_buf();
        self
    }
}

impl VariantAnnotator for SnpEffAnnotator {
    fn annotate(&self, variants: &[Variant]) -> MutmapResult<Vec<Option<Annotation>>> {
        if variants.is_empty() {
            return Ok(Vec::new());
        }

        let mut input = tempfile::Builder::new().suffix(".vcf").tempfile()?;
        write_vcf(&mut input, variants)?;
        input.flush()?;

        let output = Command::new(&self.program)
            .args(["ann", "-noStats", "-noLog"])
            .arg(&self.genome)
            .arg(input.path())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| MutmapError::external("snpEff", e.to_string()))?;
        check_output("snpEff", &output)?;

        let mut annotated: HashMap<Variant, Annotation> = HashMap::new();
        for record in read_vcf_records(Cursor::new(output.stdout))? {
            if let Some(ann) = record.info_field("ANN") {
                if let Some(annotation) = parse_ann(ann, &record.variant.alt_allele) {
                    annotated.insert(record.variant, annotation);
                }
            }
        }

        Ok(variants.iter().map(|v| annotated.get(v).cloned()).collect())
    }
}

/// Leaves every variant unannotated
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAnnotator;

impl VariantAnnotator for NoopAnnotator {
    fn annotate(&self, variants: &[Variant]) -> MutmapResult<Vec<Option<Annotation>>> {
        Ok(vec![None; variants.len()])
    }
}

/// Fail early when an external program cannot be started at all
pub fn check_program(program: &Path, version_arg: &str) -> MutmapResult<()> {
    Command::new(program)
        .arg(version_arg)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|_| ())
        .map_err(|e| MutmapError::InvalidConfig(format!("cannot run {}: {}", program.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_ann_picks_most_severe_for_allele() {
        let ann = "T|synonymous_variant|LOW|geneA|id|transcript,\
                   T|stop_gained|HIGH|geneA|id|transcript,\
                   G|missense_variant|MODERATE|geneB|id|transcript";
        let annotation = parse_ann(ann, "T").unwrap();
        assert_eq!(annotation.impact, Impact::High);
        assert_eq!(annotation.consequence, "stop_gained");
        assert_eq!(annotation.gene.as_deref(), Some("geneA"));

        let annotation = parse_ann(ann, "G").unwrap();
        assert_eq!(annotation.impact, Impact::Moderate);
    }

    #[test]
    fn test_parse_ann_unresolvable() {
        assert!(parse_ann("T|x|UNKNOWN|g", "T").is_none());
        assert!(parse_ann("C|x|HIGH|g", "T").is_none());
        assert!(parse_ann("", "T").is_none());
    }

    #[test]
    fn test_noop_annotator() {
        let variants = vec![Variant::new("chr1".to_string(), 5, "A".to_string(), "C".to_string())];
        assert_eq!(NoopAnnotator.annotate(&variants).unwrap(), vec![None]);
    }

    #[test]
    fn test_vcf_file_caller_filters_region() {
        let mut vcf = NamedTempFile::new().unwrap();
        writeln!(vcf, "##fileformat=VCFv4.2").unwrap();
        writeln!(vcf, "#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO").unwrap();
        writeln!(vcf, "chr1\t150\t.\tA\tT\t.\tPASS\t.").unwrap();
        writeln!(vcf, "chr1\t50\t.\tC\tG,T\t.\tPASS\t.").unwrap();
        writeln!(vcf, "chr2\t150\t.\tA\tT\t.\tPASS\t.").unwrap();
        writeln!(vcf, "chr1\t500\t.\tA\tT\t.\tPASS\t.").unwrap();

        let caller = VcfFileCaller::from_path(vcf.path()).unwrap();
        let pool = Pool::new("p", Vec::new());
        let found = caller
            .call(&Region::new("chr1", 1, 200), &pool, &pool)
            .unwrap();

        let positions: Vec<u32> = found.iter().map(|v| v.pos).collect();
        assert_eq!(positions, vec![50, 50, 150]);
        assert!(found.iter().all(|v| v.chrom == "chr1"));
    }

    #[test]
    fn test_missing_program_is_external_failure() {
        let caller = BcftoolsCaller::new("ref.fa", 20, 13).with_program("/nonexistent/bcftools");
        let pool = Pool::new("p", vec![PathBuf::from("a.bam")]);
        let result = caller.call(&Region::new("chr1", 1, 10), &pool, &pool);
        assert!(matches!(result, Err(MutmapError::ExternalTool { .. })));

        let annotator = SnpEffAnnotator::new("GRCz11").with_program("/nonexistent/snpEff");
        let variants = vec![Variant::new("chr1".to_string(), 5, "A".to_string(), "C".to_string())];
        assert!(matches!(
            annotator.annotate(&variants),
            Err(MutmapError::ExternalTool { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_stop_child_reaps_process() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        stop_child(&mut child);
        let status = child.try_wait().unwrap().expect("child should have exited");
        assert!(!status.success());

        // Stopping an already reaped child is harmless
        stop_child(&mut child);
    }

    #[test]
    fn test_check_program_missing() {
        assert!(check_program(Path::new("/nonexistent/tool"), "--version").is_err());
    }
}
