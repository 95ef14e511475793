//! Delegation metrics, computed once per orchestration.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::state::Phase;

/// Wall-clock time spent in each phase, in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTimings {
    pub decision_ms: u64,
    pub analysis_ms: u64,
    pub decomposition_ms: u64,
    pub execution_ms: u64,
    pub synthesis_ms: u64,
}

impl PhaseTimings {
    pub fn total_ms(&self) -> u64 {
        self.decision_ms
            .saturating_add(self.analysis_ms)
            .saturating_add(self.decomposition_ms)
            .saturating_add(self.execution_ms)
            .saturating_add(self.synthesis_ms)
    }

    fn slot(&mut self, phase: Phase) -> Option<&mut u64> {
        match phase {
            Phase::Decision => Some(&mut self.decision_ms),
            Phase::Analysis => Some(&mut self.analysis_ms),
            Phase::Decomposition => Some(&mut self.decomposition_ms),
            Phase::Execution => Some(&mut self.execution_ms),
            Phase::Synthesis => Some(&mut self.synthesis_ms),
            Phase::Complete | Phase::Failed => None,
        }
    }
}

/// Times phases as the orchestrator moves through them.
#[derive(Debug)]
pub struct PhaseClock {
    current: Phase,
    since: Instant,
    timings: PhaseTimings,
}

impl PhaseClock {
    pub fn start() -> Self {
        Self {
            current: Phase::Decision,
            since: Instant::now(),
            timings: PhaseTimings::default(),
        }
    }

    /// Close the running phase and start timing `next`.
    pub fn enter(&mut self, next: Phase) {
        let elapsed = duration_ms(self.since.elapsed());
        if let Some(slot) = self.timings.slot(self.current) {
            *slot = slot.saturating_add(elapsed);
        }
        self.current = next;
        self.since = Instant::now();
    }

    /// Timings so far, including the running phase.
    pub fn timings(&self) -> PhaseTimings {
        let mut timings = self.timings.clone();
        if let Some(slot) = timings.slot(self.current) {
            *slot = slot.saturating_add(duration_ms(self.since.elapsed()));
        }
        timings
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Summary numbers for one orchestration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DelegationMetrics {
    pub subtasks_created: usize,
    pub subtasks_pruned: usize,
    pub subtasks_completed: usize,
    pub subtasks_failed: usize,
    pub subtasks_skipped: usize,
    pub agents_used: BTreeSet<String>,
    pub total_tokens: u64,
    /// Share of context tokens isolation avoided sending, 0..=100.
    pub token_savings_percentage: f64,
    pub timings: PhaseTimings,
}

impl DelegationMetrics {
    /// `saved / full * 100`, 0 when nothing was sent.
    pub fn savings_percentage(saved: usize, full: usize) -> f64 {
        if full == 0 {
            return 0.0;
        }
        (saved as f64 / full as f64 * 100.0).clamp(0.0, 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_savings_percentage() {
        assert_eq!(DelegationMetrics::savings_percentage(0, 0), 0.0);
        assert_eq!(DelegationMetrics::savings_percentage(25, 100), 25.0);
        assert_eq!(DelegationMetrics::savings_percentage(300, 100), 100.0);
    }

    #[test]
    fn test_clock_attributes_time_to_phases() {
        let mut clock = PhaseClock::start();
        std::thread::sleep(Duration::from_millis(5));
        clock.enter(Phase::Analysis);
        clock.enter(Phase::Complete);

        let timings = clock.timings();
        assert!(timings.decision_ms >= 5);
        assert_eq!(timings.execution_ms, 0);
        assert_eq!(timings.total_ms(), timings.decision_ms + timings.analysis_ms);
    }
}
