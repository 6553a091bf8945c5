//! Terminal output for check runs

use std::io::IsTerminal;
use std::time::Duration;

use anstyle::{AnsiColor, Color, Effects};

use crate::commands::Failure;

const BOLD: anstyle::Style = anstyle::Style::new().effects(Effects::BOLD);
const DIM: anstyle::Style = anstyle::Style::new().effects(Effects::DIMMED);
const GREEN: anstyle::Style = anstyle::Style::new().fg_color(Some(Color::Ansi(AnsiColor::Green)));
const RED: anstyle::Style = anstyle::Style::new().fg_color(Some(Color::Ansi(AnsiColor::Red)));
const YELLOW: anstyle::Style =
    anstyle::Style::new().fg_color(Some(Color::Ansi(AnsiColor::Yellow)));

/// Color helpers, only emitting escape codes when stderr is a terminal.
#[derive(Debug, Clone, Copy)]
pub struct Style {
    color: bool,
}

impl Style {
    #[must_use]
    pub fn stderr() -> Self {
        Self {
            color: std::io::stderr().is_terminal(),
        }
    }

    #[must_use]
    pub fn plain() -> Self {
        Self { color: false }
    }

    fn paint(self, style: anstyle::Style, s: &str) -> String {
        if self.color {
            format!("{}{s}{}", style.render(), style.render_reset())
        } else {
            s.to_string()
        }
    }

    #[must_use]
    pub fn bold(self, s: &str) -> String {
        self.paint(BOLD, s)
    }

    #[must_use]
    pub fn dim(self, s: &str) -> String {
        self.paint(DIM, s)
    }

    #[must_use]
    pub fn green(self, s: &str) -> String {
        self.paint(GREEN, s)
    }

    #[must_use]
    pub fn red(self, s: &str) -> String {
        self.paint(RED, s)
    }

    #[must_use]
    pub fn yellow(self, s: &str) -> String {
        self.paint(YELLOW, s)
    }
}

#[must_use]
pub fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    let tenths = d.subsec_millis() / 100;
    if total_secs < 60 {
        format!("{total_secs}.{tenths}s")
    } else {
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        format!("{mins}m {secs}.{tenths}s")
    }
}

/// Counts for the summary line printed after a run-all dispatch
#[derive(Debug, Default, Clone, Copy)]
pub struct Tally {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[must_use]
pub fn summary_line(sty: Style, tally: Tally, total: usize, elapsed: Duration) -> String {
    let mut parts = Vec::new();
    if tally.passed > 0 {
        parts.push(sty.green(&format!("{} passed", tally.passed)));
    }
    if tally.failed > 0 {
        parts.push(sty.red(&format!("{} failed", tally.failed)));
    }
    if tally.skipped > 0 {
        parts.push(sty.yellow(&format!("{} skipped", tally.skipped)));
    }
    format!(
        "{} {} {}",
        sty.bold(&format!("{total} commands:")),
        parts.join(&sty.dim(", ")),
        sty.dim(&format!("({})", format_duration(elapsed)))
    )
}

/// Aggregated failure text for a group.
///
/// With `list_errors` every failure's detail is included, indented under its command name.
/// Otherwise only `hint` follows the list of failed commands.
#[must_use]
pub fn failure_report(group: &str, failures: &[&Failure], list_errors: bool, hint: &str) -> String {
    let names: Vec<&str> = failures.iter().map(|f| f.command.as_str()).collect();
    let mut report = format!("{group} failed: {}", names.join(", "));
    if list_errors {
        for failure in failures {
            report.push('\n');
            report.push_str(&failure.command);
            report.push(':');
            for line in failure.detail.lines() {
                report.push_str("\n  ");
                report.push_str(line);
            }
        }
    } else {
        report.push('\n');
        report.push_str(hint);
    }
    report
}
