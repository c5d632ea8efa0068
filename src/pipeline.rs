//! Stage driver: per-chromosome fan-out, issue bookkeeping and checkpointing

use crate::candidates::{generate_candidates, ChromosomeCandidates, VariantAnnotator, VariantCaller};
use crate::distance::{calculate_distances, collect_informative_positions, DistancePoint};
use crate::loess::{min_points, smooth_chromosome, SmoothedTrack};
use crate::peaks::{find_peaks, Peak};
use crate::pileup::PileupSource;
use crate::refine::{refine_peaks, RefinedPeak};
use crate::state::{CheckpointStore, IssueKind, PipelineState, Stage};
use crate::utils::{log_memory_usage, log_progress, retry_with_backoff, RetryPolicy, Timer};
use crate::{MapConfig, MutmapError, MutmapResult};
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};

/// External collaborators a run depends on
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub pileup: &'a dyn PileupSource,
    pub caller: &'a dyn VariantCaller,
    pub annotator: &'a dyn VariantAnnotator,
}

fn retry_policy(config: &MapConfig) -> RetryPolicy {
    RetryPolicy::new(config.max_retries, config.retry_backoff_ms)
}

/// Chromosomes to analyze: the configured list, or every chromosome seen
/// in either pool, wild-type header order first
pub fn resolve_chromosomes(config: &MapConfig, pileup: &dyn PileupSource) -> MutmapResult<Vec<String>> {
    if !config.chromosomes.is_empty() {
        return Ok(config.chromosomes.clone());
    }

    let policy = retry_policy(config);
    let mut chromosomes = Vec::new();
    let mut seen = BTreeSet::new();
    for pool in [&config.wild_type, &config.mutant] {
        let names = retry_with_backoff(&policy, &format!("reading {} headers", pool.name), || {
            pileup.chromosomes(pool)
        })?;
        for name in names {
            if seen.insert(name.clone()) {
                chromosomes.push(name);
            }
        }
    }
    Ok(chromosomes)
}

/// Map `work` over `items` in parallel, logging progress as workers finish
fn fan_out<T, R, F>(stage: Stage, items: &[T], work: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
{
    let done = AtomicUsize::new(0);
    let total = items.len();
    items
        .par_iter()
        .map(|item| {
            let result = work(item);
            let finished = done.fetch_add(1, Ordering::Relaxed) + 1;
            log_progress(finished, total, &format!("Stage {}", stage));
            result
        })
        .collect()
}

fn check_prerequisites(stage: Stage, state: &PipelineState) -> MutmapResult<()> {
    match stage.previous() {
        Some(previous) if !state.is_completed(previous) => Err(MutmapError::StageOrder(format!(
            "stage '{}' needs '{}' to complete first",
            stage, previous
        ))),
        _ => Ok(()),
    }
}

/// Run a single stage over every chromosome and return the updated state.
///
/// Results of `stage` and all later stages are replaced, so running a stage
/// twice on the same input gives the same state.
pub fn run_stage(stage: Stage, state: PipelineState, ctx: &Collaborators) -> MutmapResult<PipelineState> {
    check_prerequisites(stage, &state)?;

    let mut state = state;
    state.reset_from(stage);

    let _timer = Timer::new(&format!("Stage {}", stage));
    match stage {
        Stage::Distance => run_distance(&mut state, ctx)?,
        Stage::Smoothing => run_smoothing(&mut state),
        Stage::PeakFinding => run_peak_finding(&mut state),
        Stage::Refinement => run_refinement(&mut state, ctx),
        Stage::Candidates => run_candidates(&mut state, ctx),
    }
    state.mark_completed(stage);
    log_memory_usage(stage.name());

    Ok(state)
}

fn run_distance(state: &mut PipelineState, ctx: &Collaborators) -> MutmapResult<()> {
    let chromosomes = resolve_chromosomes(&state.config, ctx.pileup)?;
    if chromosomes.is_empty() {
        return Err(MutmapError::NoData(
            "no chromosomes found in either pool".to_string(),
        ));
    }
    log::info!("Computing distances over {} chromosomes", chromosomes.len());

    let config = &state.config;
    let policy = retry_policy(config);
    let results: Vec<(String, MutmapResult<Vec<DistancePoint>>)> = fan_out(Stage::Distance, &chromosomes, |chrom| {
        let points = retry_with_backoff(&policy, &format!("pileup of {}", chrom), || {
            calculate_distances(ctx.pileup, config, chrom)
        });
        (chrom.clone(), points)
    });

    for (chrom, result) in results {
        match result {
            Ok(points) if points.is_empty() => {
                log::warn!("{}: no informative positions", chrom);
                state.record_issue(
                    Stage::Distance,
                    &chrom,
                    IssueKind::DataAbsence,
                    "no position passed the depth and allele frequency filters",
                );
                state.distances.insert(chrom, points);
            }
            Ok(points) => {
                log::info!("{}: {} informative positions", chrom, points.len());
                state.distances.insert(chrom, points);
            }
            Err(e) => {
                log::error!("{}: pileup failed: {}", chrom, e);
                state.record_issue(Stage::Distance, &chrom, IssueKind::ExternalToolFailure, e.to_string());
            }
        }
    }
    state.chromosomes = chromosomes;

    if state.chromosomes_with_data().is_empty() {
        return Err(MutmapError::NoData(
            "no chromosome has informative positions in both pools".to_string(),
        ));
    }
    Ok(())
}

fn run_smoothing(state: &mut PipelineState) {
    let config = &state.config;
    let chromosomes: Vec<&String> = state
        .distances
        .iter()
        .filter(|(_, points)| !points.is_empty())
        .map(|(chrom, _)| chrom)
        .collect();

    let results: Vec<(String, usize, Option<SmoothedTrack>)> = fan_out(Stage::Smoothing, &chromosomes, |chrom| {
        let points = &state.distances[chrom.as_str()];
        ((*chrom).clone(), points.len(), smooth_chromosome(points, config))
    });

    let needed = min_points(config.loess_degree);
    for (chrom, n, track) in results {
        match track {
            Some(track) => {
                log::debug!("{}: smoothed {} points with span {}", chrom, track.len(), track.span);
                state.smoothed.insert(chrom, track);
            }
            None => {
                log::warn!("{}: {} points, at least {} needed for smoothing", chrom, n, needed);
                state.record_issue(
                    Stage::Smoothing,
                    &chrom,
                    IssueKind::InsufficientSample,
                    format!("{} informative positions, at least {} needed", n, needed),
                );
            }
        }
    }
}

fn run_peak_finding(state: &mut PipelineState) {
    let min_prominence = state.config.min_prominence;
    let tracks: Vec<(&String, &SmoothedTrack)> = state.smoothed.iter().collect();

    let results: Vec<(String, Vec<Peak>)> = fan_out(Stage::PeakFinding, &tracks, |(chrom, track)| {
        ((*chrom).clone(), find_peaks(chrom, track, min_prominence))
    });

    for (chrom, peaks) in results {
        if peaks.is_empty() {
            log::info!("{}: no peaks above prominence {}", chrom, min_prominence);
        } else {
            log::info!("{}: {} peaks", chrom, peaks.len());
        }
        state.peaks.insert(chrom, peaks);
    }
}

fn run_refinement(state: &mut PipelineState, ctx: &Collaborators) {
    let config = &state.config;
    let min_null_samples = config.min_null_samples;
    let policy = retry_policy(config);
    let chromosomes: Vec<&String> = state.peaks.keys().collect();

    let results: Vec<(String, MutmapResult<Vec<RefinedPeak>>)> = fan_out(Stage::Refinement, &chromosomes, |chrom| {
        let chrom = chrom.as_str();
        let peaks = &state.peaks[chrom];
        if peaks.is_empty() {
            return (chrom.to_string(), Ok(Vec::new()));
        }
        let refined = match state.smoothed.get(chrom) {
            Some(track) => retry_with_backoff(&policy, &format!("re-reading pileup of {}", chrom), || {
                collect_informative_positions(ctx.pileup, config, chrom)
            })
            .map(|pairs| refine_peaks(chrom, peaks, track, &pairs, config)),
            None => Err(MutmapError::NoData(format!("{} has no smoothed track", chrom))),
        };
        (chrom.to_string(), refined)
    });

    for (chrom, result) in results {
        match result {
            Ok(refined) => {
                for peak in refined.iter().filter(|p| !p.significance.is_determinate()) {
                    log::warn!(
                        "{}: peak at {} has {} usable null samples, {} needed",
                        chrom,
                        peak.apex,
                        peak.null_samples,
                        min_null_samples
                    );
                    state.record_issue(
                        Stage::Refinement,
                        &chrom,
                        IssueKind::InsufficientSample,
                        format!(
                            "peak at {}: {} null samples, {} needed",
                            peak.apex, peak.null_samples, min_null_samples
                        ),
                    );
                }
                state.refined.insert(chrom, refined);
            }
            Err(e) => {
                log::error!("{}: refinement failed: {}", chrom, e);
                let kind = if matches!(e, MutmapError::NoData(_)) {
                    IssueKind::DataAbsence
                } else {
                    IssueKind::ExternalToolFailure
                };
                state.record_issue(Stage::Refinement, &chrom, kind, e.to_string());
            }
        }
    }
}

fn run_candidates(state: &mut PipelineState, ctx: &Collaborators) {
    let config = &state.config;
    let policy = retry_policy(config);
    let chromosomes: Vec<&String> = state.refined.keys().collect();

    let results: Vec<(String, ChromosomeCandidates)> = fan_out(Stage::Candidates, &chromosomes, |chrom| {
        let found = generate_candidates(
            &state.refined[chrom.as_str()],
            &config.wild_type,
            &config.mutant,
            ctx.caller,
            ctx.annotator,
            &policy,
        );
        ((*chrom).clone(), found)
    });

    for (chrom, found) in results {
        for failure in found.failures {
            state.record_issue(
                Stage::Candidates,
                &chrom,
                IssueKind::ExternalToolFailure,
                format!("{}: {}", failure.region, failure.message),
            );
        }
        log::info!("{}: {} candidate variants", chrom, found.candidates.len());
        state.candidates.insert(chrom, found.candidates);
    }
}

/// Run every stage the state has not completed yet, writing a checkpoint
/// after each one when a store is given
pub fn run_pipeline(
    state: PipelineState,
    ctx: &Collaborators,
    checkpoints: Option<&CheckpointStore>,
) -> MutmapResult<PipelineState> {
    let mut state = state;
    if let Some(last) = state.last_completed() {
        log::info!("Resuming after stage '{}'", last);
    }

    while let Some(stage) = state.next_stage() {
        log::info!("Running stage '{}'", stage);
        state = run_stage(stage, state, ctx)?;
        if let Some(store) = checkpoints {
            store.save(stage, &state)?;
        }
    }

    let total: usize = state.candidates.values().map(Vec::len).sum();
    log::info!(
        "Pipeline finished: {} chromosomes, {} candidates, {} issues",
        state.chromosomes.len(),
        total,
        state.issues.len()
    );
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::{NoopAnnotator, VcfFileCaller};
    use crate::pileup::{AlleleCounts, MemoryPileupSource, PositionRecord};
    use crate::Pool;
    use std::path::PathBuf;

    fn config() -> MapConfig {
        MapConfig {
            permutations: 20,
            min_null_samples: 5,
            ..MapConfig::new(
                Pool::new("wild_type", vec![PathBuf::from("wt.bam")]),
                Pool::new("mutant", vec![PathBuf::from("mut.bam")]),
            )
        }
    }

    fn source() -> MemoryPileupSource {
        let mut source = MemoryPileupSource::new();
        for pos in 1..=12 {
            source.insert(
                "wild_type",
                PositionRecord::new("chr1", pos, AlleleCounts::from_counts([25, 0, 5, 0, 0])),
            );
            source.insert(
                "mutant",
                PositionRecord::new("chr1", pos, AlleleCounts::from_counts([24, 0, 6, 0, 0])),
            );
        }
        source
    }

    #[test]
    fn test_resolve_chromosomes_union() {
        let mut source = source();
        source.insert(
            "mutant",
            PositionRecord::new("chrM", 3, AlleleCounts::from_counts([10, 0, 0, 0, 0])),
        );
        let chromosomes = resolve_chromosomes(&config(), &source).unwrap();
        assert_eq!(chromosomes, vec!["chr1".to_string(), "chrM".to_string()]);

        let mut restricted = config();
        restricted.chromosomes = vec!["chr9".to_string()];
        assert_eq!(resolve_chromosomes(&restricted, &source).unwrap(), vec!["chr9".to_string()]);
    }

    #[test]
    fn test_stage_order_enforced() {
        let source = source();
        let caller = VcfFileCaller::from_variants(Vec::new());
        let ctx = Collaborators {
            pileup: &source,
            caller: &caller,
            annotator: &NoopAnnotator,
        };
        let result = run_stage(Stage::PeakFinding, PipelineState::new(config()), &ctx);
        assert!(matches!(result, Err(MutmapError::StageOrder(_))));
    }

    #[test]
    fn test_no_data_is_fatal() {
        let source = MemoryPileupSource::new();
        let caller = VcfFileCaller::from_variants(Vec::new());
        let ctx = Collaborators {
            pileup: &source,
            caller: &caller,
            annotator: &NoopAnnotator,
        };
        let result = run_stage(Stage::Distance, PipelineState::new(config()), &ctx);
        assert!(matches!(result, Err(MutmapError::NoData(_))));

        let mut restricted = config();
        restricted.chromosomes = vec!["chr1".to_string()];
        let result = run_stage(Stage::Distance, PipelineState::new(restricted), &ctx);
        assert!(matches!(result, Err(MutmapError::NoData(_))));
    }

    #[test]
    fn test_insufficient_points_recorded() {
        let mut source = source();
        for pos in 1..=2 {
            source.insert(
                "wild_type",
                PositionRecord::new("chr2", pos, AlleleCounts::from_counts([20, 0, 10, 0, 0])),
            );
            source.insert(
                "mutant",
                PositionRecord::new("chr2", pos, AlleleCounts::from_counts([10, 0, 20, 0, 0])),
            );
        }
        let caller = VcfFileCaller::from_variants(Vec::new());
        let ctx = Collaborators {
            pileup: &source,
            caller: &caller,
            annotator: &NoopAnnotator,
        };

        let state = run_stage(Stage::Distance, PipelineState::new(config()), &ctx).unwrap();
        let state = run_stage(Stage::Smoothing, state, &ctx).unwrap();

        assert!(state.smoothed.contains_key("chr1"));
        assert!(!state.smoothed.contains_key("chr2"));
        let issues: Vec<_> = state.issues_for("chr2").collect();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind, IssueKind::InsufficientSample);
        assert_eq!(issues[0].stage, Stage::Smoothing);
    }

    #[test]
    fn test_rerun_earlier_stage_discards_later_results() {
        let source = source();
        let caller = VcfFileCaller::from_variants(Vec::new());
        let ctx = Collaborators {
            pileup: &source,
            caller: &caller,
            annotator: &NoopAnnotator,
        };

        let state = run_pipeline(PipelineState::new(config()), &ctx, None).unwrap();
        assert_eq!(state.completed, Stage::ALL.to_vec());

        let state = run_stage(Stage::Smoothing, state, &ctx).unwrap();
        assert_eq!(state.completed, vec![Stage::Distance, Stage::Smoothing]);
        assert!(state.peaks.is_empty());
        assert!(state.candidates.is_empty());
        assert_eq!(state.next_stage(), Some(Stage::PeakFinding));
    }
}
