use crate::engine::{EngineError, RunSettings, RunSummary};
use crate::fault::FaultRecord;
use std::time::Instant;
use tracing::{error, info, warn};

/// A `RunObserver` is told about every step of a fuzzing run, synchronously
/// and in order.
///
/// Observers are handed to the engine when it is built. Every method has a
/// no-op default. An error returned from the run, test, iteration or fault
/// events aborts the run; errors from `run_error` and `run_finished` are only
/// logged since the run is already ending.
pub trait RunObserver: Send {
    fn run_starting(&mut self, _settings: &RunSettings) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn test_starting(&mut self, _state_model: &str) -> Result<(), anyhow::Error> {
        Ok(())
    }

    /// `total` is the number of iterations of the run when known.
    fn iteration_starting(&mut self, _iteration: u64, _total: Option<u64>) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn iteration_finished(&mut self, _iteration: u64) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn fault(&mut self, _fault: &FaultRecord) -> Result<(), anyhow::Error> {
        Ok(())
    }

    /// The iteration was lost to a soft error; the run continues.
    fn iteration_error(&mut self, _iteration: u64, _error: &EngineError) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn run_error(&mut self, _error: &EngineError) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn run_finished(&mut self, _summary: &RunSummary) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

/// Logs a progress line every `interval` iterations, plus every fault and
/// error.
pub struct ProgressObserver {
    interval: u64,
    started: Option<Instant>,
    completed: u64,
    faults: u64,
}

impl ProgressObserver {
    pub fn new(interval: u64) -> Self {
        Self {
            interval: interval.max(1),
            started: None,
            completed: 0,
            faults: 0,
        }
    }
}

impl Default for ProgressObserver {
    fn default() -> Self {
        Self::new(100)
    }
}

impl RunObserver for ProgressObserver {
    fn run_starting(&mut self, settings: &RunSettings) -> Result<(), anyhow::Error> {
        self.started = Some(Instant::now());
        info!(run = %settings.run_name, seed = settings.seed, "run starting");
        Ok(())
    }

    fn iteration_finished(&mut self, iteration: u64) -> Result<(), anyhow::Error> {
        self.completed += 1;
        if self.completed % self.interval == 0 {
            let elapsed = self.started.map(|s| s.elapsed().as_secs_f64()).unwrap_or_default();
            let rate = if elapsed > 0.0 {
                self.completed as f64 / elapsed
            } else {
                0.0
            };
            info!(
                iteration,
                completed = self.completed,
                faults = self.faults,
                "{rate:.1} iterations/s"
            );
        }
        Ok(())
    }

    fn fault(&mut self, fault: &FaultRecord) -> Result<(), anyhow::Error> {
        self.faults += 1;
        warn!(
            iteration = fault.iteration,
            bucket = %fault.bucket,
            "fault: {}",
            fault.title
        );
        Ok(())
    }

    fn iteration_error(&mut self, iteration: u64, error: &EngineError) -> Result<(), anyhow::Error> {
        warn!(iteration, "iteration failed: {error}");
        Ok(())
    }

    fn run_error(&mut self, error: &EngineError) -> Result<(), anyhow::Error> {
        error!("run failed: {error}");
        Ok(())
    }

    fn run_finished(&mut self, summary: &RunSummary) -> Result<(), anyhow::Error> {
        info!(
            iterations = summary.iterations,
            faults = summary.faults,
            soft_errors = summary.soft_errors,
            stop = ?summary.stop,
            "run finished"
        );
        Ok(())
    }
}
