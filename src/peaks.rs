//! Preliminary peak detection on smoothed tracks

use crate::loess::{SmoothedPoint, SmoothedTrack};
use serde::{Deserialize, Serialize};

/// A local maximum of a smoothed track that cleared the prominence threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peak {
    pub chrom: String,
    pub apex: u32,
    pub value: f64,
    pub prominence: f64,
}

/// Height of the plateau `values[start..=end]` above the higher of its two
/// side bases. A side base is the lowest value reached walking outward
/// before meeting a strictly higher value or the chromosome end.
fn prominence(values: &[f64], start: usize, end: usize) -> f64 {
    let height = values[start];

    let left_base = if start == 0 {
        None
    } else {
        let mut base = height;
        for &v in values[..start].iter().rev() {
            if v > height {
                break;
            }
            base = base.min(v);
        }
        Some(base)
    };

    let right_base = if end + 1 >= values.len() {
        None
    } else {
        let mut base = height;
        for &v in &values[end + 1..] {
            if v > height {
                break;
            }
            base = base.min(v);
        }
        Some(base)
    };

    let reference = match (left_base, right_base) {
        (Some(l), Some(r)) => l.max(r),
        (Some(l), None) => l,
        (None, Some(r)) => r,
        (None, None) => height,
    };

    height - reference
}

/// Index within the plateau whose coordinate is closest to its midpoint
fn plateau_apex(points: &[SmoothedPoint], start: usize, end: usize) -> usize {
    let mid = (points[start].pos as f64 + points[end].pos as f64) / 2.0;
    let mut best = start;
    for i in start..=end {
        if (points[i].pos as f64 - mid).abs() < (points[best].pos as f64 - mid).abs() {
            best = i;
        }
    }
    best
}

/// Find the peaks of one chromosome's track, in coordinate order.
///
/// A run of equal values is a local maximum when every existing neighbour
/// is strictly lower; a chromosome end counts as lower, but a track that is
/// one flat run has no peak.
pub fn find_peaks(chrom: &str, track: &SmoothedTrack, min_prominence: f64) -> Vec<Peak> {
    let points = &track.points;
    let values: Vec<f64> = points.iter().map(|p| p.value).collect();
    let n = values.len();
    let mut peaks = Vec::new();

    let mut start = 0;
    while start < n {
        let height = values[start];
        let mut end = start;
        while end + 1 < n && values[end + 1] == height {
            end += 1;
        }

        let left = (start > 0).then(|| values[start - 1]);
        let right = (end + 1 < n).then(|| values[end + 1]);
        let is_maximum = (left.is_some() || right.is_some())
            && left.map_or(true, |l| l < height)
            && right.map_or(true, |r| r < height);

        if is_maximum {
            let prom = prominence(&values, start, end);
            if prom >= min_prominence {
                let apex = plateau_apex(points, start, end);
                peaks.push(Peak {
                    chrom: chrom.to_string(),
                    apex: points[apex].pos,
                    value: height,
                    prominence: prom,
                });
            } else {
                log::trace!(
                    "Rejected local maximum at {}:{} (prominence {:.4})",
                    chrom,
                    points[start].pos,
                    prom
                );
            }
        }

        start = end + 1;
    }

    peaks
}
