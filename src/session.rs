//! Interactive lens calibration.
//!
//! A `CalibrationSession` polls discrete commands from an `InputProvider`,
//! applies them to a working `CalibrationConfig`, and swaps a freshly built
//! remap table into the running pipeline so the effect is visible at once.
//! Nothing is written to disk until the operator commits; exiting any other
//! way discards the adjustments.

use anyhow::{anyhow, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::calibration::{CalibrationConfig, CalibrationStore, Lens};
use crate::error::PipelineError;
use crate::frame::Resolution;
use crate::remap::{BlendCurve, RemapTable, SharedTable};

/// Pixels per adjustment step.
pub const DEFAULT_STEP_PX: f64 = 2.0;
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LensParam {
    CenterX,
    CenterY,
    Radius,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Decrease,
    Increase,
}

impl Direction {
    fn sign(&self) -> f64 {
        match self {
            Direction::Decrease => -1.0,
            Direction::Increase => 1.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CalibrationCommand {
    Adjust {
        lens: Lens,
        param: LensParam,
        direction: Direction,
    },
    /// Persist the working calibration and leave the session.
    Commit,
    /// Leave without persisting.
    Cancel,
}

/// Source of calibration commands.
pub trait InputProvider {
    /// Next command, or `None` if nothing arrived within `timeout`.
    fn poll(&mut self, timeout: Duration) -> Result<Option<CalibrationCommand>>;
}

/// A closed channel reads as `Cancel`: no further input can arrive.
impl InputProvider for Receiver<CalibrationCommand> {
    fn poll(&mut self, timeout: Duration) -> Result<Option<CalibrationCommand>> {
        match self.recv_timeout(timeout) {
            Ok(command) => Ok(Some(command)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Ok(Some(CalibrationCommand::Cancel)),
        }
    }
}

/// Key to command table.
#[derive(Clone, Debug)]
pub struct KeyBindings {
    keys: Vec<(char, CalibrationCommand)>,
}

impl KeyBindings {
    pub fn new(keys: Vec<(char, CalibrationCommand)>) -> Self {
        Self { keys }
    }

    pub fn command(&self, key: char) -> Option<CalibrationCommand> {
        self.keys
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, command)| *command)
    }

    /// One line per binding pair, for the operator.
    pub fn help(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for lens in Lens::ALL {
            for (param, label) in [
                (LensParam::CenterX, "cx"),
                (LensParam::CenterY, "cy"),
                (LensParam::Radius, "radius"),
            ] {
                let key_for = |direction| {
                    self.keys
                        .iter()
                        .find(|(_, c)| {
                            *c == CalibrationCommand::Adjust {
                                lens,
                                param,
                                direction,
                            }
                        })
                        .map(|(k, _)| *k)
                };
                if let (Some(dec), Some(inc)) =
                    (key_for(Direction::Decrease), key_for(Direction::Increase))
                {
                    lines.push(format!("{}/{} - {} lens {}", dec, inc, lens.name(), label));
                }
            }
        }
        for (key, command) in &self.keys {
            match command {
                CalibrationCommand::Commit => lines.push(format!("{} - save and exit", key)),
                CalibrationCommand::Cancel => lines.push(format!("{} - exit without saving", key)),
                CalibrationCommand::Adjust { .. } => {}
            }
        }
        lines
    }
}

impl Default for KeyBindings {
    fn default() -> Self {
        use CalibrationCommand::Adjust;
        use Direction::{Decrease, Increase};
        use LensParam::{CenterX, CenterY, Radius};

        let adjust = |lens, param, direction| Adjust {
            lens,
            param,
            direction,
        };
        Self::new(vec![
            ('a', adjust(Lens::Left, CenterX, Decrease)),
            ('d', adjust(Lens::Left, CenterX, Increase)),
            ('w', adjust(Lens::Left, CenterY, Decrease)),
            ('s', adjust(Lens::Left, CenterY, Increase)),
            ('z', adjust(Lens::Left, Radius, Decrease)),
            ('x', adjust(Lens::Left, Radius, Increase)),
            ('j', adjust(Lens::Right, CenterX, Decrease)),
            ('l', adjust(Lens::Right, CenterX, Increase)),
            ('i', adjust(Lens::Right, CenterY, Decrease)),
            ('k', adjust(Lens::Right, CenterY, Increase)),
            ('n', adjust(Lens::Right, Radius, Decrease)),
            ('m', adjust(Lens::Right, Radius, Increase)),
            ('q', CalibrationCommand::Commit),
            ('c', CalibrationCommand::Cancel),
        ])
    }
}

/// Line-buffered terminal input: every bound character typed before Enter
/// becomes one command.
pub struct StdinInput {
    commands: Receiver<CalibrationCommand>,
}

impl StdinInput {
    pub fn spawn(bindings: KeyBindings) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        std::thread::spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                for key in line.chars().filter(|c| !c.is_whitespace()) {
                    match bindings.command(key) {
                        Some(command) => {
                            if tx.send(command).is_err() {
                                return;
                            }
                        }
                        None => log::debug!("calibration: unbound key {:?}", key),
                    }
                }
            }
            log::info!("calibration: input closed");
        });
        Self { commands: rx }
    }
}

impl InputProvider for StdinInput {
    fn poll(&mut self, timeout: Duration) -> Result<Option<CalibrationCommand>> {
        self.commands.poll(timeout)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SessionOutcome {
    Committed(CalibrationConfig),
    Cancelled,
    /// Shutdown was requested before a commit.
    Interrupted,
}

pub struct CalibrationSession {
    initial: CalibrationConfig,
    working: CalibrationConfig,
    store: CalibrationStore,
    table: Arc<SharedTable>,
    output: Resolution,
    curve: BlendCurve,
    step_px: f64,
    on_change: Option<Box<dyn FnMut(&CalibrationConfig) + Send>>,
}

impl CalibrationSession {
    /// Start from the calibration the current table was built with.
    pub fn new(
        calibration: CalibrationConfig,
        store: CalibrationStore,
        table: Arc<SharedTable>,
        curve: BlendCurve,
    ) -> Self {
        let output = table.load().output();
        Self {
            initial: calibration,
            working: calibration,
            store,
            table,
            output,
            curve,
            step_px: DEFAULT_STEP_PX,
            on_change: None,
        }
    }

    pub fn with_step(mut self, step_px: f64) -> Self {
        self.step_px = step_px;
        self
    }

    /// Called with the working calibration after every accepted adjustment.
    pub fn on_change(mut self, f: impl FnMut(&CalibrationConfig) + Send + 'static) -> Self {
        self.on_change = Some(Box::new(f));
        self
    }

    pub fn working(&self) -> &CalibrationConfig {
        &self.working
    }

    /// Poll and apply commands until commit, cancel, or shutdown.
    pub fn run(
        &mut self,
        input: &mut dyn InputProvider,
        shutdown: &AtomicBool,
    ) -> Result<SessionOutcome> {
        loop {
            if shutdown.load(Ordering::SeqCst) {
                log::info!("calibration: interrupted, adjustments discarded");
                return Ok(SessionOutcome::Interrupted);
            }
            let Some(command) = input.poll(POLL_TIMEOUT)? else {
                continue;
            };

            // Apply everything already queued, then rebuild once.
            let mut pending = Some(command);
            let mut candidate = self.working;
            let mut changed = false;
            while let Some(command) = pending.take() {
                match command {
                    CalibrationCommand::Adjust {
                        lens,
                        param,
                        direction,
                    } => {
                        let mut next = candidate;
                        self.adjust(&mut next, lens, param, direction);
                        match next.validate(self.table.load().source()) {
                            Ok(()) => {
                                candidate = next;
                                changed = true;
                            }
                            Err(err) => log::warn!("calibration: adjustment rejected: {}", err),
                        }
                        pending = input.poll(Duration::ZERO)?;
                    }
                    CalibrationCommand::Commit => {
                        self.apply(candidate, changed)?;
                        if let Some(outcome) = self.commit() {
                            return Ok(outcome);
                        }
                        changed = false;
                        candidate = self.working;
                    }
                    CalibrationCommand::Cancel => {
                        self.restore_initial()?;
                        log::info!("calibration: cancelled, adjustments discarded");
                        return Ok(SessionOutcome::Cancelled);
                    }
                }
            }
            self.apply(candidate, changed)?;
        }
    }

    fn adjust(
        &self,
        cfg: &mut CalibrationConfig,
        lens: Lens,
        param: LensParam,
        direction: Direction,
    ) {
        let delta = self.step_px * direction.sign();
        let params = cfg.lens_mut(lens);
        match param {
            LensParam::CenterX => params.center_x += delta,
            LensParam::CenterY => params.center_y += delta,
            LensParam::Radius => params.radius += delta,
        }
    }

    /// Rebuild and swap in the table for `candidate`. The previous table stays
    /// live if the build rejects it.
    fn apply(&mut self, candidate: CalibrationConfig, changed: bool) -> Result<()> {
        if !changed {
            return Ok(());
        }
        let source = self.table.load().source();
        match RemapTable::build(&candidate, source, self.output, self.curve) {
            Ok(table) => {
                let version = self.table.swap(table);
                self.working = candidate;
                log::debug!("calibration: table v{} live", version);
                if let Some(on_change) = self.on_change.as_mut() {
                    on_change(&self.working);
                }
                Ok(())
            }
            Err(err @ PipelineError::CalibrationInvalid(_)) => {
                log::warn!("calibration: rebuild rejected: {}", err);
                Ok(())
            }
            Err(err) => Err(anyhow!(err)),
        }
    }

    /// `None` when persisting failed and the session should keep going.
    fn commit(&mut self) -> Option<SessionOutcome> {
        match self.store.save(&self.working) {
            Ok(()) => Some(SessionOutcome::Committed(self.working)),
            Err(err) => {
                log::error!("calibration: {}; still calibrating", err);
                None
            }
        }
    }

    fn restore_initial(&mut self) -> Result<()> {
        if self.working == self.initial {
            return Ok(());
        }
        let source = self.table.load().source();
        let table = RemapTable::build(&self.initial, source, self.output, self.curve)?;
        self.table.swap(table);
        self.working = self.initial;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
