use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use omni_core::{ProgressSample, ProgressSink};

const BAR_STYLE: &str = "{prefix:>12.cyan.bold} [{elapsed_precise}] {wide_bar:.cyan/blue} {bytes}/{total_bytes} ({msg}, {eta})";
const SPINNER_STYLE: &str = "{spinner:.blue} {prefix:>12.cyan.bold} [{elapsed_precise}] {bytes} ({msg})";

/// Renders progress samples on a terminal bar. Starts as a spinner and
/// switches to a bar once a sample carries the total size.
pub struct BarSink {
    bar: ProgressBar,
    sized: bool,
}

impl BarSink {
    pub fn new(prefix: &str, hidden: bool) -> Self {
        let bar = if hidden {
            ProgressBar::hidden()
        } else {
            ProgressBar::new_spinner()
        };
        if let Ok(style) = ProgressStyle::with_template(SPINNER_STYLE) {
            bar.set_style(style);
        }
        bar.set_prefix(prefix.to_string());
        Self { bar, sized: false }
    }

    pub fn finish(&self) {
        self.bar.finish();
    }

    pub fn abandon(&self) {
        self.bar.abandon();
    }

    /// Runs `f` with the bar hidden, for printing without tearing it.
    pub fn suspend<R>(&self, f: impl FnOnce() -> R) -> R {
        self.bar.suspend(f)
    }
}

impl ProgressSink for BarSink {
    fn on_progress(&mut self, sample: &ProgressSample) {
        if let Some(total) = sample.total.filter(|t| *t > 0) {
            if !self.sized {
                if let Ok(style) = ProgressStyle::with_template(BAR_STYLE) {
                    self.bar.set_style(style.progress_chars("█▓▒░  "));
                }
                self.sized = true;
            }
            self.bar.set_length(total);
        }
        self.bar.set_position(sample.bytes);
        self.bar
            .set_message(format!("{}/s", HumanBytes(sample.rate as u64)));
    }
}
