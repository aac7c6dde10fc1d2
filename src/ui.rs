//! Operator-facing terminal output: startup stage spinners and the live
//! calibration status line. Log lines go through `log`; this is only what a
//! person at the terminal needs to see.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

use crate::calibration::{CalibrationConfig, Lens};

const SPINNER_TICK: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

impl std::str::FromStr for UiMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "auto" => Ok(UiMode::Auto),
            "plain" => Ok(UiMode::Plain),
            "pretty" => Ok(UiMode::Pretty),
            other => Err(anyhow::anyhow!("unknown ui mode {other:?} (auto|plain|pretty)")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Ui {
    mode: UiMode,
    is_tty: bool,
}

impl Ui {
    pub fn new(mode: UiMode, is_tty: bool) -> Self {
        Self { mode, is_tty }
    }

    fn pretty(&self) -> bool {
        match self.mode {
            UiMode::Auto => self.is_tty,
            UiMode::Plain => false,
            UiMode::Pretty => true,
        }
    }

    /// Announce a startup stage. Call `StageGuard::done` once it succeeds; a
    /// guard dropped without it reports the stage as failed.
    pub fn stage(&self, name: &str) -> StageGuard {
        let output = if self.pretty() {
            let bar = ProgressBar::with_draw_target(None, ProgressDrawTarget::stderr())
                .with_style(
                    ProgressStyle::with_template("{spinner:.cyan} {msg} {elapsed}")
                        .unwrap_or_else(|_| ProgressStyle::default_spinner()),
                )
                .with_message(name.to_string());
            bar.enable_steady_tick(SPINNER_TICK);
            StageOutput::Spinner(bar)
        } else {
            eprintln!("[{}] started", name);
            StageOutput::Lines
        };
        StageGuard {
            name: name.to_string(),
            started: Instant::now(),
            output,
            succeeded: false,
        }
    }

    /// Print the current lens parameters, overwriting the previous line on a tty.
    pub fn calibration_status(&self, cfg: &CalibrationConfig) {
        let line = calibration_status_line(cfg);
        if self.pretty() {
            eprint!("\r\x1b[2K{}", line);
        } else {
            eprintln!("{}", line);
        }
    }

    pub fn calibration_help(&self, lines: &[String]) {
        eprintln!("---- lens calibration ----");
        for line in lines {
            eprintln!("  {}", line);
        }
        eprintln!("  (type keys, then Enter)");
        eprintln!("--------------------------");
    }
}

pub fn calibration_status_line(cfg: &CalibrationConfig) -> String {
    Lens::ALL
        .iter()
        .map(|lens| {
            let p = cfg.lens(*lens);
            format!(
                "{}: cx={:.1} cy={:.1} r={:.1}",
                lens.name(),
                p.center_x,
                p.center_y,
                p.radius
            )
        })
        .collect::<Vec<_>>()
        .join(" | ")
}

enum StageOutput {
    Spinner(ProgressBar),
    Lines,
}

pub struct StageGuard {
    name: String,
    started: Instant,
    output: StageOutput,
    succeeded: bool,
}

impl StageGuard {
    pub fn done(mut self) {
        self.succeeded = true;
    }
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        let took = format_duration(self.started.elapsed());
        let summary = if self.succeeded {
            format!("{} ok in {}", self.name, took)
        } else {
            format!("{} failed after {}", self.name, took)
        };
        match &self.output {
            StageOutput::Spinner(bar) if self.succeeded => bar.finish_with_message(summary),
            StageOutput::Spinner(bar) => bar.abandon_with_message(summary),
            StageOutput::Lines => eprintln!("[{}]", summary),
        }
    }
}

/// `250ms` below a second, `1.50s` above.
fn format_duration(d: Duration) -> String {
    match d.as_millis() {
        ms @ 0..=999 => format!("{}ms", ms),
        _ => format!("{:.2}s", d.as_secs_f64()),
    }
}
