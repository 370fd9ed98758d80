use std::time::{Duration, Instant};

use tracing::debug;

#[derive(Debug, Clone)]
pub struct StepTiming {
    pub name: &'static str,
    pub duration: Duration,
}

/// Wall-clock durations of the CLI's load, process and write steps.
#[derive(Debug, Default)]
pub struct StepTimings {
    steps: Vec<StepTiming>,
}

impl StepTimings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_step(&mut self, name: &'static str, duration: Duration) {
        self.steps.push(StepTiming { name, duration });
    }

    pub fn total_duration(&self) -> Duration {
        self.steps.iter().map(|s| s.duration).sum()
    }

    pub fn log_summary(&self) {
        let total = self.total_duration();
        for step in &self.steps {
            let percentage = if total.as_secs_f64() > 0.0 {
                (step.duration.as_secs_f64() / total.as_secs_f64()) * 100.0
            } else {
                0.0
            };
            debug!(
                step = step.name,
                elapsed_ms = step.duration.as_secs_f64() * 1000.0,
                percentage,
                "step timing"
            );
        }
        debug!(total_ms = total.as_secs_f64() * 1000.0, "total");
    }
}

pub struct Timer {
    start: Instant,
    name: &'static str,
}

impl Timer {
    pub fn start(name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            name,
        }
    }

    pub fn stop(self) -> (&'static str, Duration) {
        (self.name, self.start.elapsed())
    }
}
