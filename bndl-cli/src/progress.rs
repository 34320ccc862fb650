//! Terminal progress bar backing the engine's progress capability.

use bndl::ProgressSink;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

/// Progress sink rendering an indicatif bar on stderr.
///
/// The bar starts hidden and appears on the first `start` call, so quiet
/// phases (validation, manifest composition) draw nothing.
pub struct CliProgress {
    bar: ProgressBar,
}

impl std::fmt::Debug for CliProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CliProgress").finish_non_exhaustive()
    }
}

impl Default for CliProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl CliProgress {
    pub fn new() -> Self {
        let bar = ProgressBar::hidden();
        let style = ProgressStyle::with_template(
            "{spinner:.green} [{bar:30.cyan/blue}] {pos}/{len} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style.progress_chars("=> "));
        Self { bar }
    }
}

impl ProgressSink for CliProgress {
    fn start(&self, total: u64) {
        self.bar.set_draw_target(ProgressDrawTarget::stderr());
        self.bar.set_length(total);
        self.bar.set_position(0);
    }

    fn advance(&self, n: u64) {
        self.bar.inc(n);
    }

    fn success(&self, msg: &str) {
        self.bar.println(format!("{} {msg}", "✔".green()));
    }

    fn fail(&self, msg: &str) {
        self.bar.println(format!("{} {msg}", "✘".red()));
    }
}
