//! Loess smoothing of per-chromosome distance tracks
//!
//! Local fits are tricube-weighted polynomial regressions over the points
//! within a symmetric coordinate window. The window half-width is a fraction
//! of the chromosome's position range, so smoothing resolution is comparable
//! across chromosomes of different lengths and unevenly spaced positions are
//! handled naturally.
//!
//! Fits are computed at anchor points no more than a fifth of the half-width
//! apart and interpolated linearly between them, which keeps the cost linear
//! in the number of positions. Sparse tracks have every point as an anchor.

use crate::distance::DistancePoint;
use crate::MapConfig;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use ndarray_linalg::{Eigh, UPLO};
use serde::{Deserialize, Serialize};

/// Spans tried when the span is chosen by AICc
pub const SPAN_GRID: [f64; 10] = [0.05, 0.1, 0.15, 0.2, 0.25, 0.3, 0.35, 0.4, 0.45, 0.5];

const MAX_DEGREE: usize = 2;
/// Eigenvalue ratio below which a local normal matrix counts as singular
const SINGULAR_RATIO: f64 = 1e-10;
/// Largest gap between fit anchors, as a fraction of the window half-width
const ANCHOR_CELL: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SmoothedPoint {
    pub pos: u32,
    pub value: f64,
    /// Variance of the fitted value, from the local fit's residuals
    pub local_variance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmoothedTrack {
    /// Window fraction the track was fitted with
    pub span: f64,
    pub points: Vec<SmoothedPoint>,
}

impl SmoothedTrack {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn max_value(&self) -> Option<f64> {
        self.points.iter().map(|p| p.value).reduce(f64::max)
    }
}

/// Fewest points a chromosome needs for a fit of this degree
pub fn min_points(degree: usize) -> usize {
    degree + 2
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct LocalFit {
    value: f64,
    local_variance: f64,
    /// Diagonal entry of the smoother matrix
    leverage: f64,
}

impl LocalFit {
    fn lerp(&self, other: &LocalFit, t: f64) -> LocalFit {
        let mix = |a: f64, b: f64| a + t * (b - a);
        LocalFit {
            value: mix(self.value, other.value),
            local_variance: mix(self.local_variance, other.local_variance),
            leverage: mix(self.leverage, other.leverage),
        }
    }
}

fn tricube(u: f64) -> f64 {
    let u = u.abs();
    if u >= 1.0 {
        0.0
    } else {
        let t = 1.0 - u * u * u;
        t * t * t
    }
}

/// Inverse of a symmetric positive semi-definite matrix through its
/// eigendecomposition; `None` when it is numerically singular
fn symmetric_inverse(a: &Array2<f64>) -> Option<Array2<f64>> {
    let (eigenvalues, eigenvectors) = a.eigh(UPLO::Lower).ok()?;
    let largest = eigenvalues.iter().copied().fold(0.0, f64::max);
    if largest <= 0.0 || eigenvalues.iter().any(|&l| l <= largest * SINGULAR_RATIO) {
        return None;
    }
    let scaled = &eigenvectors / &eigenvalues.view().insert_axis(Axis(0));
    Some(scaled.dot(&eigenvectors.t()))
}

/// Design matrix of scaled offsets `u^0 .. u^degree`
fn design_matrix(us: &Array1<f64>, degree: usize) -> Array2<f64> {
    Array2::from_shape_fn((us.len(), degree + 1), |(j, k)| us[j].powi(k as i32))
}

/// Indices of the points the local fits are computed at: the first and last
/// point, plus enough in between that neighbouring anchors are at most
/// `max_gap` apart or adjacent in the data
fn anchor_indices(xs: &[f64], max_gap: f64) -> Vec<usize> {
    let n = xs.len();
    let mut anchors = Vec::new();
    if n == 0 {
        return anchors;
    }
    anchors.push(0);
    let mut last = xs[0];
    for i in 1..n {
        if i + 1 == n || xs[i + 1] - last > max_gap {
            anchors.push(i);
            last = xs[i];
        }
    }
    anchors
}

/// Local regression with a fixed span and degree
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Loess {
    pub span: f64,
    pub degree: usize,
}

impl Loess {
    pub fn new(span: f64, degree: usize) -> Self {
        Self {
            span,
            degree: degree.min(MAX_DEGREE),
        }
    }

    fn half_width(&self, xs: &[f64]) -> f64 {
        match (xs.first(), xs.last()) {
            (Some(first), Some(last)) => self.span * (last - first) / 2.0,
            _ => 0.0,
        }
    }

    /// Fit at point `i` over every point within `h` of it
    fn fit_point(&self, xs: &[f64], ys: &[f64], i: usize, h: f64) -> LocalFit {
        let x0 = xs[i];
        let lo = xs.partition_point(|&x| x < x0 - h);
        let hi = xs.partition_point(|&x| x <= x0 + h);

        let us = Array1::from_iter(
            xs[lo..hi]
                .iter()
                .map(|&x| if h > 0.0 { (x - x0) / h } else { 0.0 }),
        );
        let ws = us.mapv(tricube);
        let y = ArrayView1::from(&ys[lo..hi]);

        let mut degree = self.degree;
        loop {
            let x = design_matrix(&us, degree);
            let wx = &x * &ws.view().insert_axis(Axis(1));
            let xtwx = x.t().dot(&wx);

            let inv = match symmetric_inverse(&xtwx) {
                Some(inv) => inv,
                None if degree > 0 => {
                    degree -= 1;
                    continue;
                }
                None => {
                    return LocalFit {
                        value: ys[i],
                        local_variance: 0.0,
                        leverage: 1.0,
                    }
                }
            };

            let beta = inv.dot(&wx.t().dot(&y));
            // Row of the smoother matrix that produces the fitted value at x0
            let hat = wx.dot(&inv.row(0));
            let resid = &y - &x.dot(&beta);

            let weight_sum = ws.sum();
            let sigma2 = if weight_sum > 0.0 {
                (&ws * &resid * &resid).sum() / weight_sum
            } else {
                0.0
            };

            return LocalFit {
                value: beta[0],
                local_variance: sigma2 * hat.dot(&hat),
                leverage: inv[[0, 0]],
            };
        }
    }

    /// Fit at the anchor points and interpolate linearly in between.
    /// `xs` must be strictly increasing.
    fn fit_all(&self, xs: &[f64], ys: &[f64]) -> Vec<LocalFit> {
        let h = self.half_width(xs);
        let anchors = anchor_indices(xs, ANCHOR_CELL * h);
        let fits: Vec<LocalFit> = anchors
            .iter()
            .map(|&i| self.fit_point(xs, ys, i, h))
            .collect();

        let mut all = Vec::with_capacity(xs.len());
        for (k, &i) in anchors.iter().enumerate() {
            all.push(fits[k]);
            if let Some(&next) = anchors.get(k + 1) {
                let width = xs[next] - xs[i];
                for j in i + 1..next {
                    all.push(fits[k].lerp(&fits[k + 1], (xs[j] - xs[i]) / width));
                }
            }
        }
        all
    }

    /// Smoothed values only; used by the permutation trials
    pub fn smooth_values(&self, xs: &[f64], ys: &[f64]) -> Vec<f64> {
        self.fit_all(xs, ys).into_iter().map(|f| f.value).collect()
    }

    /// Smooth a chromosome's distance points; `None` when there are too few
    pub fn smooth(&self, points: &[DistancePoint]) -> Option<SmoothedTrack> {
        if points.len() < min_points(self.degree) {
            return None;
        }

        let xs: Vec<f64> = points.iter().map(|p| p.pos as f64).collect();
        let ys: Vec<f64> = points.iter().map(|p| p.raw_distance).collect();

        let smoothed = self
            .fit_all(&xs, &ys)
            .into_iter()
            .zip(points.iter())
            .map(|(fit, point)| SmoothedPoint {
                pos: point.pos,
                value: fit.value,
                local_variance: fit.local_variance,
            })
            .collect();

        Some(SmoothedTrack {
            span: self.span,
            points: smoothed,
        })
    }

    /// Corrected AIC of the fit, or `None` when it is undefined
    pub fn aicc(&self, xs: &[f64], ys: &[f64]) -> Option<f64> {
        let n = xs.len() as f64;
        let fits = self.fit_all(xs, ys);
        let trace: f64 = fits.iter().map(|f| f.leverage).sum();
        let rss: f64 = fits
            .iter()
            .zip(ys.iter())
            .map(|(f, y)| (y - f.value) * (y - f.value))
            .sum();

        let sigma2 = rss / n;
        let denom = n - trace - 2.0;
        if denom <= 0.0 || sigma2 <= 0.0 {
            return None;
        }
        Some(sigma2.ln() + 1.0 + 2.0 * (trace + 1.0) / denom)
    }
}

/// Span from [`SPAN_GRID`] with the lowest AICc, or `fallback` if none is defined
pub fn choose_span(points: &[DistancePoint], degree: usize, fallback: f64) -> f64 {
    let xs: Vec<f64> = points.iter().map(|p| p.pos as f64).collect();
    let ys: Vec<f64> = points.iter().map(|p| p.raw_distance).collect();

    SPAN_GRID
        .iter()
        .filter_map(|&span| Loess::new(span, degree).aicc(&xs, &ys).map(|a| (span, a)))
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(span, _)| span)
        .unwrap_or(fallback)
}

/// Smooth one chromosome with the configured span policy
pub fn smooth_chromosome(points: &[DistancePoint], config: &MapConfig) -> Option<SmoothedTrack> {
    if points.len() < min_points(config.loess_degree) {
        return None;
    }

    let span = if config.optimize_span {
        let span = choose_span(points, config.loess_degree, config.loess_span);
        log::debug!("Chose loess span {} by AICc", span);
        span
    } else {
        config.loess_span
    };

    Loess::new(span, config.loess_degree).smooth(points)
}
