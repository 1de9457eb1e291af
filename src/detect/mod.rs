//! Breakpoint detection over benchmark summary series
//!
//! Two detectors are available:
//! - [`DetectionMethod::Rbf`]: PELT with an RBF kernel cost (see [`pelt`])
//! - [`DetectionMethod::Asv`]: asv-style L1 step fit (see [`steps`])
//!
//! Only runtime *drops* are reported (negative, finite `delta_pct`).

pub mod pelt;
pub mod steps;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};
use crate::collection::SummaryRow;
use crate::{Error, Result};

const RBF_EPSILON: f64 = 1e-10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetectionMethod {
    #[default]
    Rbf,
    Asv,
}

impl FromStr for DetectionMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "rbf" => Ok(Self::Rbf),
            "asv" => Ok(Self::Asv),
            other => Err(Error::Detection(format!("Unknown method: {}. Use 'asv' or 'rbf'.", other))),
        }
    }
}

impl fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rbf => write!(f, "rbf"),
            Self::Asv => write!(f, "asv"),
        }
    }
}

/// A commit flagged as a significant runtime drop in one benchmark
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Breakpoint {
    pub benchmark: String,
    pub hash: String,
    /// Commit credited with the change
    pub gt_hash: String,
    /// Relative change in percent; negative means faster
    pub delta_pct: f64,
    pub start_time: f64,
    pub end_time: f64,
}

/// Time series of one benchmark ordered by revision
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub benchmark: String,
    pub times: Vec<f64>,
    pub hashes: Vec<String>,
}

impl Series {
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }
}

/// Group summary rows by benchmark in first-seen order. Rows without a
/// finite time or without a commit hash are dropped.
pub fn benchmark_series(summaries: &[SummaryRow]) -> Vec<Series> {
    let mut order: Vec<String> = Vec::new();
    let mut grouped: HashMap<&str, Vec<&SummaryRow>> = HashMap::new();

    for row in summaries {
        if !grouped.contains_key(row.benchmark.as_str()) {
            order.push(row.benchmark.clone());
        }
        let entry = grouped.entry(row.benchmark.as_str()).or_default();
        if row.time.is_some_and(f64::is_finite) && row.hash.is_some() {
            entry.push(row);
        }
    }

    order
        .into_iter()
        .map(|benchmark| {
            let mut rows = grouped.remove(benchmark.as_str()).unwrap_or_default();
            rows.sort_by_key(|r| r.revision);
            Series {
                times: rows.iter().filter_map(|r| r.time).collect(),
                hashes: rows.iter().filter_map(|r| r.hash.clone()).collect(),
                benchmark,
            }
        })
        .collect()
}

fn is_speedup(delta_pct: f64) -> bool {
    delta_pct.is_finite() && delta_pct < 0.0
}

/// PELT/RBF detection on one series
pub fn detect_rbf(series: &Series) -> Vec<Breakpoint> {
    let y = &series.times;
    let n = y.len();
    if n == 0 {
        return Vec::new();
    }

    let penalty = 3.0 * (n as f64).ln();
    pelt::Pelt::default()
        .predict(y, penalty)
        .into_iter()
        .filter(|&end| end < n)
        .filter_map(|end| {
            let before = y[end - 1];
            let after = y[end];
            let delta_pct = (after - before) / (before + RBF_EPSILON) * 100.0;
            is_speedup(delta_pct).then(|| Breakpoint {
                benchmark: series.benchmark.clone(),
                hash: series.hashes[end - 1].clone(),
                gt_hash: series.hashes[end].clone(),
                delta_pct,
                start_time: before,
                end_time: after,
            })
        })
        .collect()
}

/// asv-style step detection on one series. Steps are fit to the negated
/// times so that speedups show up as upward jumps.
pub fn detect_asv(series: &Series) -> Vec<Breakpoint> {
    let negated: Vec<f64> = series.times.iter().map(|t| -t).collect();
    let fitted = steps::detect_steps(&negated);

    steps::detect_regressions(&fitted, 2)
        .into_iter()
        .filter_map(|change| {
            let before = -change.val_before;
            let after = -change.val_after;
            if before == 0.0 {
                return None;
            }
            let delta_pct = (after - before) / before * 100.0;
            is_speedup(delta_pct).then(|| Breakpoint {
                benchmark: series.benchmark.clone(),
                hash: series.hashes[change.idx_after].clone(),
                gt_hash: series.hashes[change.idx_before].clone(),
                delta_pct,
                start_time: series.times[change.idx_before],
                end_time: series.times[change.idx_after],
            })
        })
        .collect()
}

/// Detect breakpoints for every benchmark of a summary table
pub fn detect_all_breakpoints(summaries: &[SummaryRow], method: DetectionMethod) -> Vec<Breakpoint> {
    let series = benchmark_series(summaries);
    tracing::debug!("Running {} detection on {} benchmarks", method, series.len());

    series
        .iter()
        .flat_map(|s| match method {
            DetectionMethod::Rbf => detect_rbf(s),
            DetectionMethod::Asv => detect_asv(s),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(benchmark: &str, revision: i64, time: Option<f64>) -> SummaryRow {
        SummaryRow {
            revision,
            time,
            hash: Some(format!("h{}", revision)),
            date: None,
            benchmark: benchmark.to_string(),
        }
    }

    fn step_rows(benchmark: &str, before: f64, after: f64, len: i64) -> Vec<SummaryRow> {
        (0..2 * len)
            .map(|i| row(benchmark, i, Some(if i < len { before } else { after })))
            .collect()
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!("rbf".parse::<DetectionMethod>().unwrap(), DetectionMethod::Rbf);
        assert_eq!("ASV".parse::<DetectionMethod>().unwrap(), DetectionMethod::Asv);
        let err = "kmeans".parse::<DetectionMethod>().unwrap_err();
        assert!(err.to_string().contains("Unknown method"));
        assert_eq!(DetectionMethod::default().to_string(), "rbf");
    }

    #[test]
    fn test_series_grouping_and_ordering() {
        let rows = vec![
            row("b", 2, Some(2.0)),
            row("a", 3, Some(3.0)),
            row("b", 1, Some(1.0)),
            row("b", 4, None),
            SummaryRow { hash: None, ..row("b", 5, Some(9.0)) },
            row("c", 1, None),
        ];
        let series = benchmark_series(&rows);
        let names: Vec<_> = series.iter().map(|s| s.benchmark.as_str()).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
        assert_eq!(series[0].times, vec![1.0, 2.0]);
        assert_eq!(series[0].hashes, vec!["h1", "h2"]);
        assert!(series[2].is_empty());
    }

    #[test]
    fn test_rbf_reports_speedup() {
        let rows = step_rows("bench.time_sort", 10.0, 5.0, 20);
        let found = detect_all_breakpoints(&rows, DetectionMethod::Rbf);
        assert_eq!(found.len(), 1);
        let bp = &found[0];
        assert_eq!(bp.hash, "h19");
        assert_eq!(bp.gt_hash, "h20");
        assert_eq!(bp.start_time, 10.0);
        assert_eq!(bp.end_time, 5.0);
        assert!((bp.delta_pct + 50.0).abs() < 1e-6);
    }

    #[test]
    fn test_rbf_ignores_slowdown() {
        let rows = step_rows("bench.time_sort", 5.0, 10.0, 20);
        assert!(detect_all_breakpoints(&rows, DetectionMethod::Rbf).is_empty());
    }

    #[test]
    fn test_rbf_skips_infinite_change() {
        // -1e-10 + 1e-10 == 0, so the relative change is -inf
        let rows = step_rows("bench.time_zero", -1e-10, -5.0, 20);
        let found = detect_all_breakpoints(&rows, DetectionMethod::Rbf);
        assert!(found.is_empty());
        assert!(!is_speedup(f64::NEG_INFINITY));
        assert!(!is_speedup(f64::NAN));
        assert!(is_speedup(-0.5));
    }

    #[test]
    fn test_asv_reports_speedup() {
        let rows = step_rows("bench.time_io", 2.0, 1.0, 15);
        let found = detect_all_breakpoints(&rows, DetectionMethod::Asv);
        assert_eq!(found.len(), 1);
        let bp = &found[0];
        assert_eq!(bp.hash, "h15");
        assert_eq!(bp.gt_hash, "h14");
        assert!((bp.delta_pct + 50.0).abs() < 1e-9);
        assert_eq!(bp.start_time, 2.0);
        assert_eq!(bp.end_time, 1.0);
    }

    #[test]
    fn test_asv_ignores_slowdown_and_flat() {
        assert!(detect_all_breakpoints(&step_rows("x", 1.0, 2.0, 15), DetectionMethod::Asv).is_empty());
        let flat: Vec<_> = (0..20).map(|i| row("x", i, Some(1.0))).collect();
        assert!(detect_all_breakpoints(&flat, DetectionMethod::Asv).is_empty());
    }

    #[test]
    fn test_tiny_series_yield_nothing() {
        let rows = vec![row("x", 1, Some(1.0))];
        assert!(detect_all_breakpoints(&rows, DetectionMethod::Rbf).is_empty());
        assert!(detect_all_breakpoints(&rows, DetectionMethod::Asv).is_empty());
        assert!(detect_all_breakpoints(&[], DetectionMethod::Rbf).is_empty());
    }
}
