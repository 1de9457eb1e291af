use tabled::{settings::Style, Table, Tabled};
use crate::detect::Breakpoint;

#[derive(Tabled)]
pub struct TableRow {
    #[tabled(rename = "Metric")]
    pub metric: String,
    #[tabled(rename = "Value")]
    pub value: String,
}

#[derive(Default)]
pub struct TableBuilder {
    rows: Vec<TableRow>,
}

impl TableBuilder {
    pub fn new() -> Self {
        Self { rows: Vec::new() }
    }

    pub fn add_row(&mut self, label: &str, value: &str) {
        self.rows.push(TableRow {
            metric: label.to_string(),
            value: value.to_string(),
        });
    }

    pub fn build(&self) -> String {
        if self.rows.is_empty() {
            return String::new();
        }

        Table::new(&self.rows).with(Style::rounded()).to_string()
    }
}

pub fn stats_table(stats: &[(&str, &str)]) -> String {
    let mut builder = TableBuilder::new();
    for (label, value) in stats {
        builder.add_row(label, value);
    }
    builder.build()
}

#[derive(Tabled)]
struct BreakpointRow {
    #[tabled(rename = "Benchmark")]
    benchmark: String,
    #[tabled(rename = "Commit")]
    gt_hash: String,
    #[tabled(rename = "Before")]
    start_time: String,
    #[tabled(rename = "After")]
    end_time: String,
    #[tabled(rename = "Δ%")]
    delta_pct: String,
}

/// The `limit` largest improvements, most negative delta first
pub fn breakpoint_table(breakpoints: &[Breakpoint], limit: usize) -> String {
    let mut sorted: Vec<&Breakpoint> = breakpoints.iter().collect();
    sorted.sort_by(|a, b| a.delta_pct.total_cmp(&b.delta_pct));

    let rows: Vec<BreakpointRow> = sorted
        .into_iter()
        .take(limit)
        .map(|bp| BreakpointRow {
            benchmark: bp.benchmark.clone(),
            gt_hash: bp.gt_hash.chars().take(10).collect(),
            start_time: format!("{:.4e}", bp.start_time),
            end_time: format!("{:.4e}", bp.end_time),
            delta_pct: format!("{:.1}", bp.delta_pct),
        })
        .collect();

    if rows.is_empty() {
        return String::new();
    }
    Table::new(&rows).with(Style::rounded()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_builder_renders_nothing() {
        assert!(TableBuilder::new().build().is_empty());
    }

    #[test]
    fn test_stats_table_contains_rows() {
        let table = stats_table(&[("Repositories", "12"), ("Commits", "340")]);
        assert!(table.contains("Repositories"));
        assert!(table.contains("340"));
    }
}
