//! Piecewise-constant step fitting in the style of asv's `step_detect`
//!
//! The series is fit with an L1 Potts model (each segment takes its median,
//! each extra segment costs `gamma`). The fit is solved on pieces of at most
//! `MAX_PIECE` samples, then neighbouring pieces are merged. `gamma` comes
//! from a golden-section search on a log scale that minimises a penalised log
//! residual, where the residual accounts for lag-one noise correlation.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};

/// Longest piece considered by the restricted Potts solve
const MAX_PIECE: usize = 20;

/// One constant segment `[l, r)` of a fit
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub l: usize,
    pub r: usize,
    /// Median of the segment
    pub value: f64,
    pub min: f64,
    /// Mean absolute deviation from `value`
    pub err: f64,
}

impl Step {
    pub fn len(&self) -> usize {
        self.r - self.l
    }

    pub fn is_empty(&self) -> bool {
        self.r == self.l
    }
}

/// An upward step that is not undone by any later step
#[derive(Debug, Clone, PartialEq)]
pub struct StepChange {
    /// Last index of the earlier step
    pub idx_before: usize,
    /// First index of the following step
    pub idx_after: usize,
    pub val_before: f64,
    /// Lowest level reached after the step
    pub val_after: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Total(f64);

impl Eq for Total {}

impl PartialOrd for Total {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Total {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Running median and L1 deviation of a growing window
#[derive(Default)]
struct RunningMedian {
    low: BinaryHeap<Total>,
    high: BinaryHeap<Reverse<Total>>,
    low_sum: f64,
    high_sum: f64,
}

impl RunningMedian {
    fn push(&mut self, x: f64) {
        match self.low.peek() {
            Some(top) if x > top.0 => {
                self.high.push(Reverse(Total(x)));
                self.high_sum += x;
            }
            _ => {
                self.low.push(Total(x));
                self.low_sum += x;
            }
        }

        if self.low.len() > self.high.len() + 1 {
            if let Some(Total(v)) = self.low.pop() {
                self.low_sum -= v;
                self.high.push(Reverse(Total(v)));
                self.high_sum += v;
            }
        } else if self.high.len() > self.low.len() {
            if let Some(Reverse(Total(v))) = self.high.pop() {
                self.high_sum -= v;
                self.low.push(Total(v));
                self.low_sum += v;
            }
        }
    }

    fn lower_median(&self) -> f64 {
        self.low.peek().map(|t| t.0).unwrap_or(0.0)
    }

    /// Sum of |x - median| over the window
    fn deviation(&self) -> f64 {
        let m = self.lower_median();
        (m * self.low.len() as f64 - self.low_sum) + (self.high_sum - m * self.high.len() as f64)
    }
}

/// Lazily computed L1 segment costs of a series
struct L1Dist<'a> {
    y: &'a [f64],
    cache: HashMap<(usize, usize), f64>,
}

impl<'a> L1Dist<'a> {
    fn new(y: &'a [f64]) -> Self {
        Self { y, cache: HashMap::new() }
    }

    /// Sum of absolute deviations of `y[l..r]` from its median
    fn cost(&mut self, l: usize, r: usize) -> f64 {
        if r <= l {
            return 0.0;
        }
        let y = self.y;
        *self.cache.entry((l, r)).or_insert_with(|| {
            let mut window = RunningMedian::default();
            for &x in &y[l..r] {
                window.push(x);
            }
            window.deviation().max(0.0)
        })
    }
}

/// Potts fit for one `gamma` with segments of at most `max_size` samples.
/// Returns segment right ends.
fn solve_potts(y: &[f64], gamma: f64, max_size: usize) -> Vec<usize> {
    let n = y.len();
    let mut best = vec![f64::INFINITY; n + 1];
    let mut prev = vec![0usize; n + 1];
    best[0] = -gamma;

    for right in 0..n {
        let lowest = (right + 1).saturating_sub(max_size);

        let mut window = RunningMedian::default();
        let mut costs = Vec::with_capacity(right + 1 - lowest);
        for left in (lowest..=right).rev() {
            window.push(y[left]);
            costs.push((left, window.deviation().max(0.0)));
        }

        // ties go to the later left edge
        for &(left, cost) in costs.iter().rev() {
            let total = best[left] + gamma + cost;
            if total <= best[right + 1] {
                best[right + 1] = total;
                prev[right + 1] = left;
            }
        }
    }

    let mut rights = Vec::new();
    let mut r = n;
    while r > 0 {
        rights.push(r);
        r = prev[r];
    }
    rights.reverse();
    rights
}

/// Merge neighbouring pieces while that lowers the Potts cost, then shift
/// each boundary by up to `max_size` samples if that lowers the L1 cost.
fn merge_pieces(mut rights: Vec<usize>, gamma: f64, dist: &mut L1Dist<'_>, max_size: usize) -> Vec<usize> {
    loop {
        let mut min_change = 0.0;
        let mut min_change_j = rights.len();
        let mut l = 0;
        for j in 1..rights.len() {
            if min_change_j + 2 < j {
                break;
            }
            let change = dist.cost(l, rights[j])
                - (dist.cost(l, rights[j - 1]) + dist.cost(rights[j - 1], rights[j]) + gamma);
            if change <= min_change {
                min_change = change;
                min_change_j = j - 1;
            }
            l = rights[j - 1];
        }

        if min_change_j < rights.len() {
            rights.remove(min_change_j);
        } else {
            break;
        }
    }

    let reach = max_size as isize;
    let mut l = 0;
    for j in 1..rights.len() {
        let boundary = rights[j - 1];
        let mut best_score = dist.cost(l, boundary) + dist.cost(boundary, rights[j]);
        let mut best_pos = boundary;
        for off in -reach..=reach {
            let pos = boundary as isize + off;
            if off == 0 || pos <= l as isize || pos >= rights[j] as isize {
                continue;
            }
            let pos = pos as usize;
            let score = dist.cost(l, pos) + dist.cost(pos, rights[j]);
            if score < best_score {
                best_score = score;
                best_pos = pos;
            }
        }
        rights[j - 1] = best_pos;
        l = best_pos;
    }

    rights
}

/// `|E_0| + Σ |E_j - rho E_{j-1}|` over the residuals `E` of a fit
fn sigma_star(y: &[f64], rights: &[usize], values: &[f64], rho: f64) -> f64 {
    let mut e_prev = y[0] - values[0];
    let mut s = e_prev.abs();
    let mut l = 1;
    for (&r, &v) in rights.iter().zip(values) {
        for &yv in &y[l.min(r)..r] {
            let e = yv - v;
            s += (e - rho * e_prev).abs();
            e_prev = e;
        }
        l = r;
    }
    s
}

/// Golden-section minimisation of `f` on `[a, b]`. With `expand_bounds` the
/// first two evaluations land on `a` and `b` themselves.
fn golden_search(mut f: impl FnMut(f64) -> f64, a: f64, b: f64, xatol: f64, ftol: f64, expand_bounds: bool) -> f64 {
    let ratio = 2.0 / (1.0 + 5f64.sqrt());

    let (mut x0, mut x3) = if expand_bounds {
        (
            (ratio * a - (1.0 - ratio) * b) / (2.0 * ratio - 1.0),
            (ratio * b - (1.0 - ratio) * a) / (2.0 * ratio - 1.0),
        )
    } else {
        (a, b)
    };

    let mut x1 = ratio * x0 + (1.0 - ratio) * x3;
    let mut x2 = (1.0 - ratio) * x0 + ratio * x3;
    let mut f1 = f(x1);
    let mut f2 = f(x2);
    let f0 = f1.abs().max(f2.abs());

    while (x0 - x3).abs() >= xatol && (f1 - f2).abs() >= ftol * f0 {
        if f2 < f1 {
            x0 = x1;
            x1 = x2;
            x2 = ratio * x1 + (1.0 - ratio) * x3;
            f1 = f2;
            f2 = f(x2);
        } else {
            x3 = x2;
            x2 = x1;
            x1 = ratio * x2 + (1.0 - ratio) * x0;
            f2 = f1;
            f1 = f(x1);
        }
    }

    if f2 < f1 { x2 } else { x1 }
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid]
    } else {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    }
}

fn segment_values(y: &[f64], rights: &[usize]) -> Vec<f64> {
    let mut l = 0;
    rights
        .iter()
        .map(|&r| {
            let value = median(&y[l..r]);
            l = r;
            value
        })
        .collect()
}

fn steps_from_rights(y: &[f64], rights: &[usize]) -> Vec<Step> {
    let mut steps = Vec::with_capacity(rights.len());
    let mut l = 0;
    for &r in rights {
        let segment = &y[l..r];
        let value = median(segment);
        let dist: f64 = segment.iter().map(|v| (v - value).abs()).sum();
        steps.push(Step {
            l,
            r,
            value,
            min: segment.iter().copied().fold(f64::INFINITY, f64::min),
            err: dist / segment.len() as f64,
        });
        l = r;
    }
    steps
}

/// Score of a fit: `beta · pieces + ln(sigma_0 + sigma*)`, with the residual
/// autocorrelation `rho` fitted first and `sigma_0` a noise floor taken from
/// the fitted levels.
fn fit_objective(y: &[f64], rights: &[usize], beta: f64) -> f64 {
    let values = segment_values(y, rights);
    let rho = golden_search(|rho| sigma_star(y, rights, &values, rho), -1.0, 1.0, 0.05, 1e-8, true);

    let sigma_0 = if values.len() > 2 {
        0.1 * values.windows(2).map(|w| (w[1] - w[0]).abs()).fold(f64::INFINITY, f64::min)
    } else {
        0.001 * values.iter().map(|v| v.abs()).fold(f64::INFINITY, f64::min)
    };
    let sigma_0 = sigma_0.max(1e-300);

    beta * rights.len() as f64 + (sigma_0 + sigma_star(y, rights, &values, rho)).ln()
}

/// Fit constant steps to `y`, choosing the segment penalty automatically
pub fn detect_steps(y: &[f64]) -> Vec<Step> {
    let n = y.len();
    if n == 0 {
        return Vec::new();
    }

    let mut dist = L1Dist::new(y);
    let beta = 4.0 * (n as f64).ln() / n as f64;
    let gamma_0 = match dist.cost(0, n) {
        d if d > 0.0 => d,
        _ => 1.0,
    };

    let mut best: Option<(f64, Vec<usize>)> = None;
    let lowest = (0.1 / n as f64).ln();
    golden_search(
        |x| {
            let gamma = gamma_0 * x.exp();
            let rights = solve_potts(y, gamma, MAX_PIECE);
            let rights = merge_pieces(rights, gamma, &mut dist, MAX_PIECE);
            let objective = fit_objective(y, &rights, beta);
            if best.as_ref().is_none_or(|(score, _)| objective < *score) {
                best = Some((objective, rights));
            }
            objective
        },
        lowest,
        0.0,
        lowest.abs() * 0.1,
        0.0,
        true,
    );

    let rights = best.map(|(_, r)| r).unwrap_or_else(|| vec![n]);
    steps_from_rights(y, &rights)
}

/// Upward steps whose level is never undone later on.
///
/// Steps are scanned from the end while tracking the lowest later level; a
/// step is reported when that level sits above it by more than both noise
/// estimates. Steps shorter than `min_size` are never compared and never
/// become the reference level.
pub fn detect_regressions(steps: &[Step], min_size: usize) -> Vec<StepChange> {
    let Some(last) = steps.last() else {
        return Vec::new();
    };

    let mut best_v = last.value;
    let mut best_err = last.err;
    let mut prev_l = last.l;
    let mut found = Vec::new();

    for step in steps.iter().rev() {
        if step.len() >= min_size {
            if best_v - best_err > step.value + step.err {
                found.push(StepChange {
                    idx_before: step.r - 1,
                    idx_after: prev_l,
                    val_before: step.value,
                    val_after: best_v,
                });
            }
            if step.value < best_v {
                best_v = step.value;
                best_err = step.err;
            }
        }
        prev_l = step.l;
    }

    found.reverse();
    found
}
