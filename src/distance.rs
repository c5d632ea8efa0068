//! Allele-frequency distance between the wild-type and mutant pools

use crate::pileup::{AlleleCounts, PileupSource, PositionRecord, PositionStream};
use crate::{MapConfig, MutmapError, MutmapResult};
use serde::{Deserialize, Serialize};

/// Distance between the pools at one retained position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistancePoint {
    pub chrom: String,
    pub pos: u32,
    pub raw_distance: f64,
}

/// Both pools' counts at a coordinate present in each
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairedCounts {
    pub pos: u32,
    pub wild_type: AlleleCounts,
    pub mutant: AlleleCounts,
}

/// Down-weights shallow positions: `dmin / (dmin + pseudocount)`.
///
/// Symmetric in its depth arguments.
pub fn depth_confidence(depth_a: u32, depth_b: u32, pseudocount: f64) -> f64 {
    let dmin = depth_a.min(depth_b) as f64;
    if dmin == 0.0 {
        return 0.0;
    }
    dmin / (dmin + pseudocount)
}

/// Euclidean distance between the two frequency vectors, scaled by depth confidence
pub fn raw_distance(a: &AlleleCounts, b: &AlleleCounts, pseudocount: f64) -> f64 {
    let fa = a.frequencies();
    let fb = b.frequencies();
    let euclid = fa
        .iter()
        .zip(fb.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt();
    euclid * depth_confidence(a.depth(), b.depth(), pseudocount)
}

/// Frequency of the second most common symbol across both pools combined
pub fn combined_minor_allele_freq(a: &AlleleCounts, b: &AlleleCounts) -> f64 {
    let mut combined = *a;
    combined.merge(b);
    let total = combined.depth();
    if total == 0 {
        return 0.0;
    }

    let mut counts = combined.counts;
    counts.sort_unstable_by(|x, y| y.cmp(x));
    counts[1] as f64 / total as f64
}

/// Depth and allele-frequency filter. Neither quantity changes when reads
/// are relabelled between pools.
pub fn is_informative(pair: &PairedCounts, config: &MapConfig) -> bool {
    pair.wild_type.depth() >= config.min_depth
        && pair.mutant.depth() >= config.min_depth
        && combined_minor_allele_freq(&pair.wild_type, &pair.mutant) >= config.min_allele_freq
}

/// Merge-join of two coordinate-ordered pool streams
pub struct PairedPositions<'a> {
    wild_type: PositionStream<'a>,
    mutant: PositionStream<'a>,
    last_wild_type: Option<u32>,
    last_mutant: Option<u32>,
}

pub fn pair_positions<'a>(wild_type: PositionStream<'a>, mutant: PositionStream<'a>) -> PairedPositions<'a> {
    PairedPositions {
        wild_type,
        mutant,
        last_wild_type: None,
        last_mutant: None,
    }
}

fn next_ordered(
    stream: &mut PositionStream<'_>,
    last: &mut Option<u32>,
    pool: &str,
) -> Option<MutmapResult<PositionRecord>> {
    match stream.next()? {
        Ok(record) => {
            if let Some(prev) = *last {
                if record.pos <= prev {
                    return Some(Err(MutmapError::external(
                        "pileup",
                        format!(
                            "{} stream out of order on {}: {} after {}",
                            pool, record.chrom, record.pos, prev
                        ),
                    )));
                }
            }
            *last = Some(record.pos);
            Some(Ok(record))
        }
        Err(e) => Some(Err(e)),
    }
}

impl Iterator for PairedPositions<'_> {
    type Item = MutmapResult<PairedCounts>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut wt = match next_ordered(&mut self.wild_type, &mut self.last_wild_type, "wild-type")? {
            Ok(r) => r,
            Err(e) => return Some(Err(e)),
        };
        let mut mt = match next_ordered(&mut self.mutant, &mut self.last_mutant, "mutant")? {
            Ok(r) => r,
            Err(e) => return Some(Err(e)),
        };

        loop {
            if wt.pos == mt.pos {
                return Some(Ok(PairedCounts {
                    pos: wt.pos,
                    wild_type: wt.counts,
                    mutant: mt.counts,
                }));
            }

            if wt.pos < mt.pos {
                wt = match next_ordered(&mut self.wild_type, &mut self.last_wild_type, "wild-type")? {
                    Ok(r) => r,
                    Err(e) => return Some(Err(e)),
                };
            } else {
                mt = match next_ordered(&mut self.mutant, &mut self.last_mutant, "mutant")? {
                    Ok(r) => r,
                    Err(e) => return Some(Err(e)),
                };
            }
        }
    }
}

fn open_pair<'a>(
    source: &'a dyn PileupSource,
    config: &MapConfig,
    chrom: &str,
) -> MutmapResult<PairedPositions<'a>> {
    let wild_type = source.positions(&config.wild_type, chrom)?;
    let mutant = source.positions(&config.mutant, chrom)?;
    Ok(pair_positions(wild_type, mutant))
}

/// Compute one chromosome's distance points in ascending coordinate order.
///
/// Pileup records are consumed as they stream and are not retained.
pub fn calculate_distances(
    source: &dyn PileupSource,
    config: &MapConfig,
    chrom: &str,
) -> MutmapResult<Vec<DistancePoint>> {
    let mut points = Vec::new();
    for pair in open_pair(source, config, chrom)? {
        let pair = pair?;
        if !is_informative(&pair, config) {
            continue;
        }
        points.push(DistancePoint {
            chrom: chrom.to_string(),
            pos: pair.pos,
            raw_distance: raw_distance(&pair.wild_type, &pair.mutant, config.depth_pseudocount),
        });
    }
    Ok(points)
}

/// Collect the informative paired counts of one chromosome for resampling
pub fn collect_informative_positions(
    source: &dyn PileupSource,
    config: &MapConfig,
    chrom: &str,
) -> MutmapResult<Vec<PairedCounts>> {
    let mut pairs = Vec::new();
    for pair in open_pair(source, config, chrom)? {
        let pair = pair?;
        if is_informative(&pair, config) {
            pairs.push(pair);
        }
    }
    Ok(pairs)
}
