//! Scoped wall-clock timers.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::info;

/// Elapsed time of one finished phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseTiming {
    /// Phase tag
    pub tag: String,
    /// Rank that measured it
    pub rank: u64,
    /// Elapsed milliseconds
    pub elapsed_ms: f64,
}

/// Logs the elapsed time of a phase when finished or dropped.
pub struct PhaseTimer {
    tag: String,
    rank: u64,
    start: Instant,
    reported: bool,
}

impl PhaseTimer {
    /// Starts timing `tag` on `rank`.
    pub fn start(tag: impl Into<String>, rank: u64) -> Self {
        let tag = tag.into();
        tracing::debug!(%tag, rank, "phase started");
        Self {
            tag,
            rank,
            start: Instant::now(),
            reported: false,
        }
    }

    /// Time since the timer started.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stops the timer and returns the measurement.
    pub fn finish(mut self) -> PhaseTiming {
        self.report()
    }

    fn report(&mut self) -> PhaseTiming {
        self.reported = true;
        let elapsed_ms = self.elapsed().as_secs_f64() * 1000.0;
        info!(tag = %self.tag, rank = self.rank, elapsed_ms, "phase finished");
        PhaseTiming {
            tag: self.tag.clone(),
            rank: self.rank,
            elapsed_ms,
        }
    }
}

impl Drop for PhaseTimer {
    fn drop(&mut self) {
        if !self.reported {
            self.report();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_reports_once() {
        let timer = PhaseTimer::start("Writing: run.json", 3);
        let timing = timer.finish();
        assert_eq!(timing.tag, "Writing: run.json");
        assert_eq!(timing.rank, 3);
        assert!(timing.elapsed_ms >= 0.0);
    }

    #[test]
    fn test_elapsed_grows() {
        let timer = PhaseTimer::start("Main", 0);
        let before = timer.elapsed();
        std::thread::sleep(Duration::from_millis(2));
        assert!(timer.elapsed() > before);
    }
}
