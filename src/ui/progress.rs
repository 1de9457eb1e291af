use crate::ui::theme;
use crate::ui::Icons;
use indicatif::{HumanDuration, ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;
use std::time::{Duration, Instant};

fn visible(pb: ProgressBar) -> ProgressBar {
    if console::Term::stderr().is_term() {
        pb
    } else {
        ProgressBar::hidden()
    }
}

/// Counted progress for one pipeline stage (repos enriched, commits fetched, ...)
pub struct StageProgress {
    pb: ProgressBar,
    started: Instant,
}

impl StageProgress {
    pub fn new(total: usize, label: &str) -> Self {
        let pb = visible(ProgressBar::new(total as u64));
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.cyan} {prefix} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
        {
            pb.set_style(style.progress_chars("=> "));
        }
        pb.set_prefix(label.to_string());
        Self { pb, started: Instant::now() }
    }

    pub fn inc(&self) {
        self.pb.inc(1);
    }

    pub fn finish(&self, summary: &str) {
        self.pb.finish_and_clear();
        println!(
            "{} {} {}",
            Icons::CHECK.style(theme().success.clone()),
            summary.style(theme().success.clone()),
            format!("({})", HumanDuration(self.started.elapsed())).style(theme().dim.clone())
        );
    }
}

/// Sleep for `duration`, showing the remaining seconds on stderr.
pub async fn countdown(duration: Duration, label: &str) {
    let pb = visible(ProgressBar::new_spinner());
    let until = Instant::now() + duration;
    loop {
        let remaining = until.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        pb.set_message(format!("{} {} {:>4.0}s …", Icons::HOURGLASS, label, remaining.as_secs_f64()));
        pb.tick();
        tokio::time::sleep(remaining.min(Duration::from_secs(1))).await;
    }
    pb.finish_and_clear();
}
