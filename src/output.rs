//! Candidate table and run summary writers

use crate::state::PipelineState;
use crate::utils::{ensure_parent_dirs, has_extension};
use crate::MutmapResult;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::path::Path;

#[derive(Debug, Serialize)]
struct CandidateRow<'a> {
    chrom: &'a str,
    pos: u32,
    #[serde(rename = "ref")]
    ref_allele: &'a str,
    #[serde(rename = "alt")]
    alt_allele: &'a str,
    rank: usize,
    impact: &'a str,
    consequence: &'a str,
    gene: &'a str,
    peak_start: u32,
    peak_end: u32,
    peak_apex: u32,
    distance_to_apex: u32,
    p_value: String,
}

#[derive(Debug, Serialize)]
struct SummaryRow<'a> {
    chrom: &'a str,
    informative_positions: usize,
    peaks: usize,
    refined_peaks: usize,
    candidates: usize,
    issues: String,
}

fn open_output(path: &Path) -> MutmapResult<Box<dyn Write>> {
    ensure_parent_dirs(path)?;
    let file = File::create(path)?;
    Ok(if has_extension(path, "gz") {
        Box::new(GzEncoder::new(file, Compression::default()))
    } else {
        Box::new(file)
    })
}

fn tsv_writer(path: &Path) -> MutmapResult<csv::Writer<Box<dyn Write>>> {
    Ok(csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(open_output(path)?))
}

/// Write ranked candidates, chromosomes in order, gzip-compressed when the
/// path ends in `.gz`. Returns the number of rows written.
pub fn write_candidates(state: &PipelineState, path: &Path) -> MutmapResult<usize> {
    let mut writer = tsv_writer(path)?;
    let mut rows = 0;

    for candidates in state.candidates.values() {
        for (i, candidate) in candidates.iter().enumerate() {
            let annotation = candidate.annotation.as_ref();
            writer.serialize(CandidateRow {
                chrom: &candidate.variant.chrom,
                pos: candidate.variant.pos,
                ref_allele: &candidate.variant.ref_allele,
                alt_allele: &candidate.variant.alt_allele,
                rank: i + 1,
                impact: annotation.map(|a| a.impact.as_str()).unwrap_or("."),
                consequence: annotation.map(|a| a.consequence.as_str()).unwrap_or("."),
                gene: annotation.and_then(|a| a.gene.as_deref()).unwrap_or("."),
                peak_start: candidate.peak_start,
                peak_end: candidate.peak_end,
                peak_apex: candidate.peak_apex,
                distance_to_apex: candidate.distance_to_apex,
                p_value: candidate.significance.to_string(),
            })?;
            rows += 1;
        }
    }

    // csv writes no header without records
    if rows == 0 {
        writer.write_record([
            "chrom",
            "pos",
            "ref",
            "alt",
            "rank",
            "impact",
            "consequence",
            "gene",
            "peak_start",
            "peak_end",
            "peak_apex",
            "distance_to_apex",
            "p_value",
        ])?;
    }

    writer.flush()?;
    log::info!("Wrote {} candidates to {}", rows, path.display());
    Ok(rows)
}

/// Write one row per chromosome with stage counts and its issues
pub fn write_summary(state: &PipelineState, path: &Path) -> MutmapResult<()> {
    let mut writer = tsv_writer(path)?;

    for chrom in &state.chromosomes {
        let issues: Vec<String> = state
            .issues_for(chrom)
            .map(|i| format!("{}/{}: {}", i.stage, i.kind, i.message))
            .collect();

        writer.serialize(SummaryRow {
            chrom,
            informative_positions: state.distances.get(chrom).map_or(0, Vec::len),
            peaks: state.peaks.get(chrom).map_or(0, Vec::len),
            refined_peaks: state.refined.get(chrom).map_or(0, Vec::len),
            candidates: state.candidates.get(chrom).map_or(0, Vec::len),
            issues: issues.join("; "),
        })?;
    }

    writer.flush()?;
    log_run_summary(state);
    Ok(())
}

fn log_run_summary(state: &PipelineState) {
    let with_data = state.chromosomes_with_data().len();
    let peaks: usize = state.peaks.values().map(Vec::len).sum();
    let significant = state
        .refined
        .values()
        .flatten()
        .filter(|p| p.significance.is_determinate())
        .count();
    let candidates: usize = state.candidates.values().map(Vec::len).sum();

    log::info!("Run summary:");
    log::info!("  Chromosomes with data: {} of {}", with_data, state.chromosomes.len());
    log::info!("  Peaks: {} ({} with a determinate p-value)", peaks, significant);
    log::info!("  Candidates: {}", candidates);
    if !state.issues.is_empty() {
        log::warn!("  Issues: {}", state.issues.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidates::{Annotation, Candidate, Impact};
    use crate::refine::Significance;
    use crate::state::{IssueKind, Stage};
    use crate::{MapConfig, Pool, Variant};
    use flate2::read::MultiGzDecoder;
    use std::io::Read;
    use tempfile::tempdir;

    fn state() -> PipelineState {
        let mut state = PipelineState::new(MapConfig::new(
            Pool::new("wild_type", Vec::new()),
            Pool::new("mutant", Vec::new()),
        ));
        state.chromosomes = vec!["chr1".to_string(), "chr2".to_string()];
        state.candidates.insert(
            "chr1".to_string(),
            vec![
                Candidate {
                    variant: Variant::new("chr1".to_string(), 120, "C".to_string(), "T".to_string()),
                    annotation: Some(Annotation {
                        consequence: "stop_gained".to_string(),
                        impact: Impact::High,
                        gene: Some("tnnt2a".to_string()),
                    }),
                    peak_start: 100,
                    peak_end: 200,
                    peak_apex: 150,
                    significance: Significance::Determinate(0.01),
                    distance_to_apex: 30,
                },
                Candidate {
                    variant: Variant::new("chr1".to_string(), 140, "G".to_string(), "A".to_string()),
                    annotation: None,
                    peak_start: 100,
                    peak_end: 200,
                    peak_apex: 150,
                    significance: Significance::Indeterminate,
                    distance_to_apex: 10,
                },
            ],
        );
        state.record_issue(Stage::Distance, "chr2", IssueKind::DataAbsence, "no positions");
        state
    }

    #[test]
    fn test_write_candidates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("candidates.tsv");
        assert_eq!(write_candidates(&state(), &path).unwrap(), 2);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("chrom\tpos\tref\talt\trank"));
        assert_eq!(
            lines[1],
            "chr1\t120\tC\tT\t1\tHIGH\tstop_gained\ttnnt2a\t100\t200\t150\t30\t0.01"
        );
        assert!(lines[2].ends_with("\tindeterminate"));
        assert!(lines[2].contains("\t.\t.\t.\t"));
    }

    #[test]
    fn test_write_candidates_gzip_and_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out/candidates.tsv.gz");
        let mut empty = state();
        empty.candidates.clear();
        assert_eq!(write_candidates(&empty, &path).unwrap(), 0);

        let mut content = String::new();
        MultiGzDecoder::new(File::open(&path).unwrap())
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.starts_with("chrom\tpos"));
    }

    #[test]
    fn test_write_summary() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("summary.tsv");
        write_summary(&state(), &path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(
            lines[0],
            "chrom\tinformative_positions\tpeaks\trefined_peaks\tcandidates\tissues"
        );
        assert_eq!(lines[1], "chr1\t0\t0\t0\t2\t");
        assert_eq!(lines[2], "chr2\t0\t0\t0\t0\tdistance/data_absence: no positions");
    }
}
