//! Candidate variant generation inside refined peak intervals

use crate::refine::{RefinedPeak, Significance};
use crate::utils::{retry_with_backoff, RetryPolicy};
use crate::{MutmapError, MutmapResult, Pool, Region, Variant};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;

/// Predicted effect severity, least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Impact {
    Modifier,
    Low,
    Moderate,
    High,
}

impl Impact {
    pub fn parse(s: &str) -> Option<Impact> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MODIFIER" => Some(Impact::Modifier),
            "LOW" => Some(Impact::Low),
            "MODERATE" => Some(Impact::Moderate),
            "HIGH" => Some(Impact::High),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Impact::Modifier => "MODIFIER",
            Impact::Low => "LOW",
            Impact::Moderate => "MODERATE",
            Impact::High => "HIGH",
        }
    }
}

impl fmt::Display for Impact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub consequence: String,
    pub impact: Impact,
    pub gene: Option<String>,
}

/// Calls variants from both pools' alignments inside a region
pub trait VariantCaller: Send + Sync {
    fn call(&self, region: &Region, wild_type: &Pool, mutant: &Pool) -> MutmapResult<Vec<Variant>>;
}

/// Predicts variant consequences. The result is aligned with the input;
/// `None` marks a variant the annotator could not resolve.
pub trait VariantAnnotator: Send + Sync {
    fn annotate(&self, variants: &[Variant]) -> MutmapResult<Vec<Option<Annotation>>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub variant: Variant,
    pub annotation: Option<Annotation>,
    pub peak_start: u32,
    pub peak_end: u32,
    pub peak_apex: u32,
    pub significance: Significance,
    pub distance_to_apex: u32,
}

impl Candidate {
    pub fn impact(&self) -> Option<Impact> {
        self.annotation.as_ref().map(|a| a.impact)
    }
}

/// An interval whose collaborators failed after all retries
#[derive(Debug, Clone, PartialEq)]
pub struct IntervalFailure {
    pub region: Region,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChromosomeCandidates {
    pub candidates: Vec<Candidate>,
    pub failures: Vec<IntervalFailure>,
}

fn compare_significance(a: &Significance, b: &Significance) -> Ordering {
    match (a, b) {
        (Significance::Determinate(x), Significance::Determinate(y)) => x.total_cmp(y),
        (Significance::Determinate(_), Significance::Indeterminate) => Ordering::Less,
        (Significance::Indeterminate, Significance::Determinate(_)) => Ordering::Greater,
        (Significance::Indeterminate, Significance::Indeterminate) => Ordering::Equal,
    }
}

/// Ranking order: significance, then severity, then proximity to the apex
pub fn compare_candidates(a: &Candidate, b: &Candidate) -> Ordering {
    compare_significance(&a.significance, &b.significance)
        .then_with(|| b.impact().cmp(&a.impact()))
        .then_with(|| a.distance_to_apex.cmp(&b.distance_to_apex))
        .then_with(|| a.variant.cmp(&b.variant))
}

/// Sort candidates and keep each variant once, at its best rank
pub fn rank_candidates(mut candidates: Vec<Candidate>) -> Vec<Candidate> {
    candidates.sort_by(compare_candidates);
    let mut seen = HashSet::new();
    candidates.retain(|c| seen.insert(c.variant.clone()));
    candidates
}

fn candidates_for_peak(
    peak: &RefinedPeak,
    wild_type: &Pool,
    mutant: &Pool,
    caller: &dyn VariantCaller,
    annotator: &dyn VariantAnnotator,
    policy: &RetryPolicy,
) -> MutmapResult<Vec<Candidate>> {
    let region = Region::new(&peak.chrom, peak.start, peak.end);

    let mut variants = retry_with_backoff(policy, &format!("variant calling in {}", region), || {
        caller.call(&region, wild_type, mutant)
    })?;
    variants.retain(|v| region.contains(&v.chrom, v.pos));

    if variants.is_empty() {
        log::info!("No variants called in {}", region);
        return Ok(Vec::new());
    }

    let annotations = retry_with_backoff(policy, &format!("annotation of {}", region), || {
        let annotations = annotator.annotate(&variants)?;
        if annotations.len() != variants.len() {
            return Err(MutmapError::external(
                "annotator",
                format!(
                    "returned {} annotations for {} variants",
                    annotations.len(),
                    variants.len()
                ),
            ));
        }
        Ok(annotations)
    })?;

    let unresolved = annotations.iter().filter(|a| a.is_none()).count();
    if unresolved > 0 {
        log::warn!("{} of {} variants in {} left unannotated", unresolved, variants.len(), region);
    }

    Ok(variants
        .into_iter()
        .zip(annotations)
        .map(|(variant, annotation)| Candidate {
            distance_to_apex: variant.pos.abs_diff(peak.apex),
            variant,
            annotation,
            peak_start: peak.start,
            peak_end: peak.end,
            peak_apex: peak.apex,
            significance: peak.significance,
        })
        .collect())
}

/// Produce one chromosome's ranked candidates. Intervals whose collaborators
/// keep failing are reported and excluded; the others still contribute.
pub fn generate_candidates(
    peaks: &[RefinedPeak],
    wild_type: &Pool,
    mutant: &Pool,
    caller: &dyn VariantCaller,
    annotator: &dyn VariantAnnotator,
    policy: &RetryPolicy,
) -> ChromosomeCandidates {
    let mut candidates = Vec::new();
    let mut failures = Vec::new();

    for peak in peaks {
        match candidates_for_peak(peak, wild_type, mutant, caller, annotator, policy) {
            Ok(found) => candidates.extend(found),
            Err(e) => {
                let region = Region::new(&peak.chrom, peak.start, peak.end);
                log::error!("Excluding {} from candidates: {}", region, e);
                failures.push(IntervalFailure {
                    region,
                    message: e.to_string(),
                });
            }
        }
    }

    ChromosomeCandidates {
        candidates: rank_candidates(candidates),
        failures,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn variant(pos: u32, alt: &str) -> Variant {
        Variant::new("chr1".to_string(), pos, "A".to_string(), alt.to_string())
    }

    fn peak(start: u32, end: u32, apex: u32, significance: Significance) -> RefinedPeak {
        RefinedPeak {
            chrom: "chr1".to_string(),
            start,
            end,
            apex,
            apex_value: 0.5,
            significance,
            null_samples: 200,
        }
    }

    fn pools() -> (Pool, Pool) {
        (Pool::new("wt", Vec::new()), Pool::new("mut", Vec::new()))
    }

    struct FixedCaller(Vec<Variant>);

    impl VariantCaller for FixedCaller {
        fn call(&self, region: &Region, _: &Pool, _: &Pool) -> MutmapResult<Vec<Variant>> {
            Ok(self
                .0
                .iter()
                .filter(|v| region.contains(&v.chrom, v.pos))
                .cloned()
                .collect())
        }
    }

    /// HIGH for T, MODERATE for G, unresolved otherwise
    struct AlleleAnnotator;

    impl VariantAnnotator for AlleleAnnotator {
        fn annotate(&self, variants: &[Variant]) -> MutmapResult<Vec<Option<Annotation>>> {
            Ok(variants
                .iter()
                .map(|v| {
                    let impact = match v.alt_allele.as_str() {
                        "T" => Impact::High,
                        "G" => Impact::Moderate,
                        _ => return None,
                    };
                    Some(Annotation {
                        consequence: "missense_variant".to_string(),
                        impact,
                        gene: None,
                    })
                })
                .collect())
        }
    }

    struct FailingCaller {
        calls: AtomicUsize,
        failures_before_success: usize,
    }

    impl VariantCaller for FailingCaller {
        fn call(&self, _: &Region, _: &Pool, _: &Pool) -> MutmapResult<Vec<Variant>> {
            let n = self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            if n < self.failures_before_success {
                Err(MutmapError::external("bcftools", "connection reset"))
            } else {
                Ok(vec![variant(50, "T")])
            }
        }
    }

    #[test]
    fn test_impact_parse_and_order() {
        assert_eq!(Impact::parse("high"), Some(Impact::High));
        assert_eq!(Impact::parse("MODIFIER"), Some(Impact::Modifier));
        assert_eq!(Impact::parse("severe"), None);
        assert!(Impact::High > Impact::Moderate);
        assert!(Some(Impact::Modifier) > None);
    }

    #[test]
    fn test_ranking_order() {
        let (wt, mt) = pools();
        let caller = FixedCaller(vec![
            variant(100, "C"),
            variant(104, "T"),
            variant(110, "G"),
            variant(300, "T"),
        ]);
        let peaks = vec![
            peak(90, 120, 100, Significance::Determinate(0.01)),
            peak(290, 310, 300, Significance::Indeterminate),
        ];

        let result = generate_candidates(&peaks, &wt, &mt, &caller, &AlleleAnnotator, &RetryPolicy::new(0, 1));
        assert!(result.failures.is_empty());

        let order: Vec<u32> = result.candidates.iter().map(|c| c.variant.pos).collect();
        // HIGH before MODERATE before unannotated; indeterminate peak last
        assert_eq!(order, vec![104, 110, 100, 300]);
        assert_eq!(result.candidates[0].distance_to_apex, 4);
        assert!(result.candidates[2].annotation.is_none());
    }

    #[test]
    fn test_overlapping_peaks_keep_best_rank() {
        let (wt, mt) = pools();
        let caller = FixedCaller(vec![variant(150, "T")]);
        let peaks = vec![
            peak(100, 200, 120, Significance::Determinate(0.2)),
            peak(140, 260, 150, Significance::Determinate(0.01)),
        ];

        let result = generate_candidates(&peaks, &wt, &mt, &caller, &AlleleAnnotator, &RetryPolicy::new(0, 1));
        assert_eq!(result.candidates.len(), 1);
        assert_eq!(result.candidates[0].peak_apex, 150);
        assert_eq!(result.candidates[0].distance_to_apex, 0);
    }

    #[test]
    fn test_transient_caller_failure_is_retried() {
        let (wt, mt) = pools();
        let caller = FailingCaller {
            calls: AtomicUsize::new(0),
            failures_before_success: 2,
        };
        let peaks = vec![peak(1, 100, 50, Significance::Determinate(0.0))];

        let result = generate_candidates(&peaks, &wt, &mt, &caller, &AlleleAnnotator, &RetryPolicy::new(3, 1));
        assert!(result.failures.is_empty());
        assert_eq!(result.candidates.len(), 1);
    }

    #[test]
    fn test_persistent_failure_excludes_interval() {
        let (wt, mt) = pools();
        let caller = FailingCaller {
            calls: AtomicUsize::new(0),
            failures_before_success: usize::MAX,
        };
        let peaks = vec![peak(1, 100, 50, Significance::Determinate(0.0))];

        let result = generate_candidates(&peaks, &wt, &mt, &caller, &AlleleAnnotator, &RetryPolicy::new(1, 1));
        assert!(result.candidates.is_empty());
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].region, Region::new("chr1", 1, 100));
        assert_eq!(caller.calls.load(AtomicOrdering::SeqCst), 2);
    }

    #[test]
    fn test_misaligned_annotations_are_rejected() {
        struct ShortAnnotator;
        impl VariantAnnotator for ShortAnnotator {
            fn annotate(&self, _: &[Variant]) -> MutmapResult<Vec<Option<Annotation>>> {
                Ok(Vec::new())
            }
        }

        let (wt, mt) = pools();
        let caller = FixedCaller(vec![variant(10, "T")]);
        let peaks = vec![peak(1, 20, 10, Significance::Determinate(0.0))];

        let result = generate_candidates(&peaks, &wt, &mt, &caller, &ShortAnnotator, &RetryPolicy::new(0, 1));
        assert!(result.candidates.is_empty());
        assert_eq!(result.failures.len(), 1);
    }
}
