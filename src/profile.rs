//! Kernel timing.
//!
//! The trainer reports each kernel stage it runs to an optional
//! [`KernelProfiler`]. With profiling on, every stage is flushed and
//! waited on before the clock stops, so durations are wall time on the
//! host including submission overhead. Expect training to slow down.

use std::fmt;
use std::time::Duration;

use log::info;

/// Kernel stages of one training step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelStage {
    /// Squared distance from the sample to every neuron.
    Distance,
    /// Per-group minimum.
    LocalMin,
    /// One cross-group reduction round.
    GlobalMin,
    /// Neighborhood update.
    Update,
}

impl KernelStage {
    /// All stages, in dispatch order.
    pub const ALL: [KernelStage; 4] = [
        KernelStage::Distance,
        KernelStage::LocalMin,
        KernelStage::GlobalMin,
        KernelStage::Update,
    ];

    /// Kernel entry point name.
    pub fn entry_point(self) -> &'static str {
        match self {
            KernelStage::Distance => "calculate_distances",
            KernelStage::LocalMin => "find_global_first_pass",
            KernelStage::GlobalMin => "find_global_min",
            KernelStage::Update => "update_network",
        }
    }

    fn slot(self) -> usize {
        self as usize
    }
}

impl fmt::Display for KernelStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.entry_point())
    }
}

/// Receives kernel timings.
pub trait KernelProfiler: Send {
    /// Records one invocation of `stage`.
    fn record(&mut self, stage: KernelStage, elapsed: Duration);

    /// Called once after a training run.
    fn finish_run(&mut self) {}

    /// Accumulated totals, if this profiler keeps them.
    fn report(&self) -> Option<&ProfileReport> {
        None
    }
}

/// Cumulative time and invocation count per stage.
#[derive(Debug, Clone, Default)]
pub struct ProfileReport {
    totals: [Duration; 4],
    counts: [u64; 4],
}

impl ProfileReport {
    /// Empty report.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cumulative time spent in `stage`.
    pub fn total(&self, stage: KernelStage) -> Duration {
        self.totals[stage.slot()]
    }

    /// Number of recorded invocations of `stage`.
    pub fn count(&self, stage: KernelStage) -> u64 {
        self.counts[stage.slot()]
    }

    /// Mean time per invocation.
    pub fn mean(&self, stage: KernelStage) -> Option<Duration> {
        let n = self.count(stage);
        (n > 0).then(|| self.total(stage) / n as u32)
    }

    /// Clears all totals.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Logs the report at info level.
    pub fn log_summary(&self) {
        for stage in KernelStage::ALL {
            info!(
                "{:<24} {:>8} calls {:>12.3} ms total",
                stage.entry_point(),
                self.count(stage),
                self.total(stage).as_secs_f64() * 1e3
            );
        }
    }
}

impl KernelProfiler for ProfileReport {
    fn record(&mut self, stage: KernelStage, elapsed: Duration) {
        self.totals[stage.slot()] += elapsed;
        self.counts[stage.slot()] += 1;
    }

    fn finish_run(&mut self) {
        self.log_summary();
    }

    fn report(&self) -> Option<&ProfileReport> {
        Some(self)
    }
}
