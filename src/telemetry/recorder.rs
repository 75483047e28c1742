use std::collections::VecDeque;

use super::event::EngineEvent;
use super::metrics::{compute_stats, EngineStats};

const MAX_EVENTS: usize = 10_000;

#[derive(Debug)]
pub struct TelemetryRecorder {
    buffer: VecDeque<EngineEvent>,
    /// Events evicted from the ring, folded in so counters never go backwards.
    evicted: EngineStats,
}

impl Default for TelemetryRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryRecorder {
    pub fn new() -> Self {
        Self {
            buffer: VecDeque::with_capacity(MAX_EVENTS),
            evicted: EngineStats::default(),
        }
    }

    pub fn record(&mut self, event: EngineEvent) {
        if self.buffer.len() >= MAX_EVENTS {
            if let Some(old) = self.buffer.pop_front() {
                self.evicted.apply(&old);
            }
        }
        self.buffer.push_back(event);
    }

    pub fn snapshot(&self) -> EngineStats {
        // Delegate to pure functional metrics module
        let mut stats = self.evicted.clone();
        stats.merge(&compute_stats(&self.buffer));
        stats
    }

    pub fn recent(&self, n: usize) -> Vec<EngineEvent> {
        let skip = self.buffer.len().saturating_sub(n);
        self.buffer.iter().skip(skip).cloned().collect()
    }
}
