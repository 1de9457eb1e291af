//! PELT change-point search with an RBF kernel cost

const KERNEL_CLIP_LOW: f64 = 1e-2;
const KERNEL_CLIP_HIGH: f64 = 1e2;

/// Kernel cost of a segment under a Gaussian (RBF) kernel.
///
/// Scaled squared distances between distinct samples are clipped to
/// `[KERNEL_CLIP_LOW, KERNEL_CLIP_HIGH]` before the exponential, so equal
/// samples still score `e^-0.01` off the diagonal. The Gram matrix is reduced to 2-D prefix sums so every segment cost is
/// O(1) after an O(n²) fit.
pub struct RbfCost {
    n: usize,
    /// `(n + 1) × (n + 1)` prefix sums of the Gram matrix
    prefix: Vec<f64>,
}

impl RbfCost {
    pub fn fit(signal: &[f64]) -> Self {
        let n = signal.len();
        let gamma = median_heuristic_gamma(signal);
        let width = n + 1;
        let mut prefix = vec![0.0; width * width];

        for i in 0..n {
            let mut row = 0.0;
            for j in 0..n {
                let d = signal[i] - signal[j];
                row += if i == j {
                    1.0
                } else {
                    (-(gamma * d * d).clamp(KERNEL_CLIP_LOW, KERNEL_CLIP_HIGH)).exp()
                };
                prefix[(i + 1) * width + (j + 1)] = prefix[i * width + (j + 1)] + row;
            }
        }

        Self { n, prefix }
    }

    fn block(&self, start: usize, end: usize) -> f64 {
        let w = self.n + 1;
        self.prefix[end * w + end] - self.prefix[start * w + end] - self.prefix[end * w + start]
            + self.prefix[start * w + start]
    }

    /// Cost of `signal[start..end]`
    pub fn error(&self, start: usize, end: usize) -> f64 {
        if end <= start {
            return 0.0;
        }
        let len = (end - start) as f64;
        len - self.block(start, end) / len
    }
}

/// `1 / median(pairwise squared distances)`, or 1 when that median is 0
pub fn median_heuristic_gamma(signal: &[f64]) -> f64 {
    let n = signal.len();
    if n < 2 {
        return 1.0;
    }

    let mut distances = Vec::with_capacity(n * (n - 1) / 2);
    for i in 0..n {
        for j in (i + 1)..n {
            let d = signal[i] - signal[j];
            distances.push(d * d);
        }
    }

    let median = median(&mut distances);
    if median > 0.0 { 1.0 / median } else { 1.0 }
}

fn median(values: &mut [f64]) -> f64 {
    let len = values.len();
    let mid = len / 2;
    let (_, upper, _) = values.select_nth_unstable_by(mid, f64::total_cmp);
    let upper = *upper;
    if len % 2 == 1 {
        return upper;
    }
    let lower = values[..mid].iter().copied().fold(f64::NEG_INFINITY, f64::max);
    (lower + upper) / 2.0
}

/// Pruned exact linear time search over breakpoints placed every `jump`
/// samples, with segments of at least `min_size` samples.
#[derive(Debug, Clone)]
pub struct Pelt {
    pub min_size: usize,
    pub jump: usize,
}

impl Default for Pelt {
    fn default() -> Self {
        Self { min_size: 2, jump: 5 }
    }
}

impl Pelt {
    /// Sorted segment ends; the last one is always `signal.len()`.
    /// Empty when the signal is shorter than one segment.
    pub fn predict(&self, signal: &[f64], penalty: f64) -> Vec<usize> {
        let n = signal.len();
        let jump = self.jump.max(1);
        if n == 0 || n < self.min_size {
            return Vec::new();
        }

        let cost = RbfCost::fit(signal);

        let mut candidates: Vec<usize> = (0..n).step_by(jump).filter(|&k| k >= self.min_size).collect();
        candidates.push(n);

        // best[t]: optimal total cost of signal[..t]; prev[t]: last segment start
        let mut best = vec![f64::INFINITY; n + 1];
        let mut prev = vec![0usize; n + 1];
        best[0] = 0.0;
        let mut admissible: Vec<usize> = Vec::new();

        for &end in &candidates {
            let newest = (end - self.min_size) / jump * jump;
            admissible.push(newest);

            let mut totals = Vec::with_capacity(admissible.len());
            let mut best_total = f64::INFINITY;
            let mut best_start = 0;
            for &start in &admissible {
                if !best[start].is_finite() {
                    totals.push(f64::INFINITY);
                    continue;
                }
                let total = best[start] + cost.error(start, end) + penalty;
                if total < best_total {
                    best_total = total;
                    best_start = start;
                }
                totals.push(total);
            }

            best[end] = best_total;
            prev[end] = best_start;

            admissible = admissible
                .into_iter()
                .zip(totals)
                .filter(|&(_, total)| total <= best_total + penalty)
                .map(|(start, _)| start)
                .collect();
        }

        let mut ends = Vec::new();
        let mut end = n;
        while end > 0 {
            ends.push(end);
            end = prev[end];
        }
        ends.reverse();
        ends
    }
}
