// Result assembly: drains the outcome channel and restores per-machine
// chronological order, independent of the order windows completed in.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::dispatch::{Outcome, WindowOutcome};
use crate::error::ClientError;
use crate::frame::PredictionFrame;
use crate::plan::TimeWindow;

/// One window whose retry sequence ended in failure.
#[derive(Debug, Clone)]
pub struct WindowError {
    pub window: TimeWindow,
    pub attempts: u32,
    pub message: String,
}

impl std::fmt::Display for WindowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} (after {} attempts)",
            self.window, self.message, self.attempts
        )
    }
}

/// Everything a run produced for one machine.
#[derive(Debug, Clone)]
pub struct PredictionResult {
    /// Successful windows concatenated in window-start order.
    pub frame: PredictionFrame,
    /// Resampled input values, when the server included them.
    pub resampled: Option<PredictionFrame>,
    /// Failed windows in window-start order.
    pub errors: Vec<WindowError>,
}

impl PredictionResult {
    fn empty() -> Self {
        Self {
            frame: PredictionFrame::new(Vec::new()),
            resampled: None,
            errors: Vec::new(),
        }
    }

    /// True when every dispatched window for this machine succeeded.
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Per-machine results for one run, keyed by machine name.
///
/// Every requested machine appears exactly once; a machine none of whose
/// windows succeeded still has an entry with an empty frame.
#[derive(Debug, Clone, Default)]
pub struct RunResult {
    pub machines: BTreeMap<String, PredictionResult>,
}

impl RunResult {
    /// Names of machines with at least one failed window.
    pub fn failed_machines(&self) -> Vec<&str> {
        self.machines
            .iter()
            .filter(|(_, result)| !result.is_complete())
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn has_failures(&self) -> bool {
        self.machines.values().any(|result| !result.is_complete())
    }
}

/// Collects window outcomes and merges them into a [`RunResult`].
///
/// Outcomes arrive in completion order; each machine's bucket is keyed by
/// window start so iteration restores chronological order at merge time.
pub struct ResultAssembler {
    expected: Vec<String>,
}

impl ResultAssembler {
    pub fn new(machines: impl IntoIterator<Item = String>) -> Self {
        Self {
            expected: machines.into_iter().collect(),
        }
    }

    /// Drain the outcome channel until the dispatcher closes it, then merge.
    ///
    /// Per-window failures become error entries, never an `Err`. An outcome
    /// for a machine that was never requested is a structural error.
    pub async fn run(
        self,
        mut outcome_rx: mpsc::Receiver<WindowOutcome>,
    ) -> Result<RunResult, ClientError> {
        let mut buckets: HashMap<String, BTreeMap<DateTime<Utc>, WindowOutcome>> = HashMap::new();

        while let Some(outcome) = outcome_rx.recv().await {
            let name = outcome.machine.name.clone();
            if !self.expected.iter().any(|machine| *machine == name) {
                return Err(ClientError::internal(format!(
                    "outcome for machine {name} that was never requested"
                )));
            }
            debug!(
                machine = %name,
                window = %outcome.window,
                success = outcome.outcome.is_success(),
                "Buffering outcome"
            );
            buckets
                .entry(name)
                .or_default()
                .insert(outcome.window.start, outcome);
        }

        let mut result = RunResult::default();
        for name in &self.expected {
            let bucket = buckets.remove(name).unwrap_or_default();
            result
                .machines
                .insert(name.clone(), merge_bucket(name, bucket));
        }

        let windows_failed: usize = result
            .machines
            .values()
            .map(|machine| machine.errors.len())
            .sum();
        info!(
            machines = result.machines.len(),
            windows_failed, "Assembly complete"
        );
        Ok(result)
    }
}

/// Merge one machine's outcomes, already ordered by window start.
fn merge_bucket(
    machine: &str,
    bucket: BTreeMap<DateTime<Utc>, WindowOutcome>,
) -> PredictionResult {
    let mut frame: Option<PredictionFrame> = None;
    let mut resampled: Option<PredictionFrame> = None;
    let mut errors = Vec::new();

    for (_, outcome) in bucket {
        let WindowOutcome {
            window,
            attempts,
            outcome,
            ..
        } = outcome;
        match outcome {
            Outcome::Success {
                frame: data,
                resampled: extra,
            } => {
                if let Err(e) = append_frame(&mut frame, data) {
                    warn!(
                        machine,
                        window = %window,
                        error = %e,
                        "Dropping window whose columns do not match earlier windows"
                    );
                    errors.push(WindowError {
                        window,
                        attempts,
                        message: e.to_string(),
                    });
                    continue;
                }
                if let Some(extra) = extra
                    && let Err(e) = append_frame(&mut resampled, extra)
                {
                    warn!(
                        machine,
                        window = %window,
                        error = %e,
                        "Dropping resampled block whose columns do not match earlier windows"
                    );
                    errors.push(WindowError {
                        window,
                        attempts,
                        message: e.to_string(),
                    });
                }
            }
            Outcome::Failure { message, .. } => {
                errors.push(WindowError {
                    window,
                    attempts,
                    message,
                });
            }
        }
    }

    PredictionResult {
        frame: frame.unwrap_or_else(|| PredictionFrame::new(Vec::new())),
        resampled,
        errors,
    }
}

fn append_frame(
    target: &mut Option<PredictionFrame>,
    frame: PredictionFrame,
) -> Result<(), ClientError> {
    match target {
        None => {
            *target = Some(frame);
            Ok(())
        }
        Some(existing) => existing.append(frame),
    }
}
