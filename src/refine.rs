//! Peak refinement by label-permutation resampling
//!
//! Every trial pools the reads of both pools at each informative position,
//! redraws the wild-type reads without replacement (depths are preserved),
//! and reruns the distance and smoothing steps. The maximum of each
//! resampled track is one sample of the chromosome's null distribution.
//! Trials are pure functions of the paired counts and a per-trial seed, so
//! they run in parallel and reproduce exactly on re-runs.

use crate::distance::{raw_distance, PairedCounts};
use crate::loess::{min_points, Loess, SmoothedTrack};
use crate::peaks::Peak;
use crate::pileup::{AlleleCounts, ALPHABET};
use crate::MapConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Empirical p-value of a peak, or `Indeterminate` when the null was too small
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Significance {
    Determinate(f64),
    Indeterminate,
}

impl Significance {
    pub fn p_value(&self) -> Option<f64> {
        match self {
            Significance::Determinate(p) => Some(*p),
            Significance::Indeterminate => None,
        }
    }

    pub fn is_determinate(&self) -> bool {
        matches!(self, Significance::Determinate(_))
    }
}

impl fmt::Display for Significance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Significance::Determinate(p) => write!(f, "{}", p),
            Significance::Indeterminate => write!(f, "indeterminate"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinedPeak {
    pub chrom: String,
    pub start: u32,
    pub end: u32,
    pub apex: u32,
    pub apex_value: f64,
    pub significance: Significance,
    pub null_samples: usize,
}

impl RefinedPeak {
    pub fn contains(&self, pos: u32) -> bool {
        self.start <= pos && pos <= self.end
    }
}

/// Sorted maxima of the resampled tracks
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NullDistribution {
    maxima: Vec<f64>,
}

impl NullDistribution {
    pub fn from_maxima(mut maxima: Vec<f64>) -> Self {
        maxima.retain(|m| m.is_finite());
        maxima.sort_by(|a, b| a.total_cmp(b));
        Self { maxima }
    }

    pub fn len(&self) -> usize {
        self.maxima.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maxima.is_empty()
    }

    pub fn median(&self) -> Option<f64> {
        let n = self.maxima.len();
        if n == 0 {
            return None;
        }
        Some(if n % 2 == 1 {
            self.maxima[n / 2]
        } else {
            (self.maxima[n / 2 - 1] + self.maxima[n / 2]) / 2.0
        })
    }

    /// Fraction of null maxima at or above `observed`
    pub fn significance(&self, observed: f64, min_samples: usize) -> Significance {
        if self.maxima.len() < min_samples || self.maxima.is_empty() {
            return Significance::Indeterminate;
        }
        let below = self.maxima.partition_point(|&m| m < observed);
        let at_or_above = self.maxima.len() - below;
        Significance::Determinate(at_or_above as f64 / self.maxima.len() as f64)
    }
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

/// Stable seed for one trial on one chromosome
pub fn trial_seed(seed: u64, chrom: &str, trial: usize) -> u64 {
    // FNV-1a keeps the value stable across builds and platforms
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in chrom.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    splitmix64(seed ^ splitmix64(hash ^ splitmix64(trial as u64)))
}

/// Relabel the reads at one position, preserving both pools' depths
pub fn permute_position<R: Rng>(pair: &PairedCounts, rng: &mut R) -> (AlleleCounts, AlleleCounts) {
    let mut combined = pair.wild_type;
    combined.merge(&pair.mutant);

    let total = combined.depth() as usize;
    let wild_type_depth = pair.wild_type.depth() as usize;

    // Draw whichever pool is smaller and give the rest to the other
    let draw_wild_type = wild_type_depth <= total - wild_type_depth;
    let amount = if draw_wild_type {
        wild_type_depth
    } else {
        total - wild_type_depth
    };

    let mut bounds = [0usize; ALPHABET.len()];
    let mut acc = 0usize;
    for (b, &c) in bounds.iter_mut().zip(combined.counts.iter()) {
        acc += c as usize;
        *b = acc;
    }

    let mut drawn = AlleleCounts::new();
    for read in rand::seq::index::sample(rng, total, amount).into_iter() {
        let symbol = bounds.partition_point(|&b| b <= read);
        drawn.counts[symbol] += 1;
    }

    let mut rest = combined;
    for (r, d) in rest.counts.iter_mut().zip(drawn.counts.iter()) {
        *r -= d;
    }

    if draw_wild_type {
        (drawn, rest)
    } else {
        (rest, drawn)
    }
}

/// One resampling trial; returns the maximum of the resampled smoothed track
pub fn permutation_trial(
    pairs: &[PairedCounts],
    xs: &[f64],
    loess: &Loess,
    depth_pseudocount: f64,
    seed: u64,
) -> Option<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let ys: Vec<f64> = pairs
        .iter()
        .map(|pair| {
            let (wild_type, mutant) = permute_position(pair, &mut rng);
            raw_distance(&wild_type, &mutant, depth_pseudocount)
        })
        .collect();

    loess
        .smooth_values(xs, &ys)
        .into_iter()
        .filter(|v| v.is_finite())
        .reduce(f64::max)
}

/// Build a chromosome's null distribution from `config.permutations` trials
pub fn null_distribution(
    chrom: &str,
    pairs: &[PairedCounts],
    span: f64,
    config: &MapConfig,
) -> NullDistribution {
    if pairs.len() < min_points(config.loess_degree) {
        return NullDistribution::default();
    }

    let xs: Vec<f64> = pairs.iter().map(|p| p.pos as f64).collect();
    let loess = Loess::new(span, config.loess_degree);

    let maxima: Vec<f64> = (0..config.permutations)
        .into_par_iter()
        .filter_map(|trial| {
            permutation_trial(
                pairs,
                &xs,
                &loess,
                config.depth_pseudocount,
                trial_seed(config.seed, chrom, trial),
            )
        })
        .collect();

    NullDistribution::from_maxima(maxima)
}

/// Interval around `apex` bounded by the first points on each side whose
/// smoothed value falls below `apex_value - z * sd(apex)`. A side that never
/// drops below the threshold extends to the track end.
pub fn peak_interval(track: &SmoothedTrack, apex: u32, z: f64) -> Option<(u32, u32)> {
    let points = &track.points;
    let idx = points.binary_search_by_key(&apex, |p| p.pos).ok()?;
    let apex_point = points[idx];
    let threshold = apex_point.value - z * apex_point.local_variance.max(0.0).sqrt();

    let start = points[..idx]
        .iter()
        .rev()
        .find(|p| p.value < threshold)
        .or(points.first())
        .map(|p| p.pos)?;
    let end = points[idx + 1..]
        .iter()
        .find(|p| p.value < threshold)
        .or(points.last())
        .map(|p| p.pos)?;

    Some((start, end))
}

/// Refine one chromosome's peaks against a single shared null distribution
pub fn refine_peaks(
    chrom: &str,
    peaks: &[Peak],
    track: &SmoothedTrack,
    pairs: &[PairedCounts],
    config: &MapConfig,
) -> Vec<RefinedPeak> {
    if peaks.is_empty() {
        return Vec::new();
    }

    let null = null_distribution(chrom, pairs, track.span, config);
    log::debug!(
        "{}: {} null samples, median {:?}",
        chrom,
        null.len(),
        null.median()
    );

    peaks
        .iter()
        .filter_map(|peak| {
            let (start, end) = match peak_interval(track, peak.apex, config.interval_z) {
                Some(bounds) => bounds,
                None => {
                    log::warn!("{}: apex {} is not on the smoothed track", chrom, peak.apex);
                    return None;
                }
            };
            Some(RefinedPeak {
                chrom: chrom.to_string(),
                start,
                end,
                apex: peak.apex,
                apex_value: peak.value,
                significance: null.significance(peak.value, config.min_null_samples),
                null_samples: null.len(),
            })
        })
        .collect()
}
