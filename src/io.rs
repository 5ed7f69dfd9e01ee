use std::fmt::Display;
use std::sync::LazyLock;
use std::time::Instant;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

const ANSI_BLUE: Style = Style::new().blue();
const ANSI_BOLD: Style = Style::new().bold();
const ANSI_GREEN: Style = Style::new().green();
const ANSI_DIM: Style = Style::new().dim();

static PROGRESS_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .expect("Error setting progress bar template")
        .progress_chars("=>-")
});

pub fn as_overhead(s: Instant) -> impl Display {
    let f = format!("(+{}ms)", s.elapsed().as_millis());
    ANSI_BLUE.apply_to(f)
}

/// Progress bar over `len` items, drawn on stderr only when it's a terminal.
pub(crate) fn progress(len: usize, msg: impl Into<String>) -> ProgressBar {
    let pb = if console::user_attended_stderr() {
        ProgressBar::new(len as u64)
    } else {
        ProgressBar::hidden()
    };
    pb.set_style(PROGRESS_STYLE.clone());
    pb.set_message(msg.into());
    pb
}

pub(crate) fn header(text: impl Display) -> impl Display {
    ANSI_BOLD.apply_to(text.to_string())
}

pub(crate) fn marker(enabled: bool) -> impl Display {
    if enabled {
        ANSI_GREEN.apply_to("✓")
    } else {
        ANSI_DIM.apply_to("○")
    }
}
