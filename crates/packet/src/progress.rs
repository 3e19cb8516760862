//! Progress accounting and ETA estimation.
//!
//! Phase durations are folded into a rolling average kept per work id in an
//! injected [`KeyValueStore`]. Because the table outlives a single run, a repeat
//! compilation of the same work starts with a non-zero ETA.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ports::KeyValueStore;
use crate::{PacketState, PhaseId, Progress, WorkId};

/// Number of samples the rolling average effectively spans.
pub const ROLLING_WINDOW: u32 = 20;

/// Rolling average phase duration for one work.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DurationStat {
    pub avg_ms: f64,
    pub samples: u32,
}

impl DurationStat {
    pub fn first(elapsed_ms: u64) -> Self {
        Self { avg_ms: elapsed_ms as f64, samples: 1 }
    }

    /// Folds one more sample in. Older samples decay once the window is full.
    #[must_use]
    pub fn record(self, elapsed_ms: u64) -> Self {
        let n = (self.samples + 1).min(ROLLING_WINDOW);
        Self {
            avg_ms: self.avg_ms + (elapsed_ms as f64 - self.avg_ms) / f64::from(n),
            samples: self.samples.saturating_add(1),
        }
    }

    pub fn avg_ms_rounded(&self) -> u64 {
        self.avg_ms.max(0.0).round() as u64
    }
}

/// Estimated time left for `remaining` phases at `avg_ms` each.
pub fn eta_ms(avg_ms: Option<u64>, remaining: usize) -> Option<u64> {
    avg_ms.map(|avg| avg.saturating_mul(remaining as u64))
}

/// Tracks one compilation's [`Progress`] and keeps the duration table current.
pub struct ProgressTracker {
    work: WorkId,
    store: Arc<dyn KeyValueStore<DurationStat>>,
    stat: Option<DurationStat>,
    progress: Progress,
}

impl ProgressTracker {
    /// Starts tracking, seeding the average from the table when it has an
    /// entry for `work`.
    pub fn start(
        work: WorkId,
        store: Arc<dyn KeyValueStore<DurationStat>>,
        total_phases: usize,
        total_segments: usize,
    ) -> Self {
        let stat = store.get(work.as_str());
        let avg_phase_ms = stat.map(|s| s.avg_ms_rounded());
        Self {
            work,
            store,
            stat,
            progress: Progress {
                total_phases,
                ready_phases: 0,
                total_segments,
                ready_segments: 0,
                state: PacketState::Compiling,
                current_phase_id: None,
                avg_phase_ms,
                eta_ms: eta_ms(avg_phase_ms, total_phases),
            },
        }
    }

    pub fn begin_phase(&mut self, phase: &PhaseId) {
        self.progress.current_phase_id = Some(phase.clone());
    }

    /// Records a finished phase covering `segments` canonical segments.
    pub fn phase_done(&mut self, segments: usize, elapsed: Duration) -> &Progress {
        let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        let stat = match self.stat {
            Some(s) => s.record(ms),
            None => DurationStat::first(ms),
        };
        self.stat = Some(stat);
        self.store.set(self.work.as_str(), stat);

        let p = &mut self.progress;
        p.ready_phases = (p.ready_phases + 1).min(p.total_phases);
        p.ready_segments = (p.ready_segments + segments).min(p.total_segments);
        p.avg_phase_ms = Some(stat.avg_ms_rounded());
        p.eta_ms = eta_ms(p.avg_phase_ms, p.total_phases - p.ready_phases);
        p
    }

    /// Sets the terminal state and clears the in-flight fields.
    pub fn finish(&mut self, state: PacketState) -> Progress {
        self.progress.state = state;
        self.progress.current_phase_id = None;
        self.progress.eta_ms = Some(0);
        self.progress.clone()
    }

    pub fn snapshot(&self) -> &Progress {
        &self.progress
    }
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("work", &self.work)
            .field("stat", &self.stat)
            .field("progress", &self.progress)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::InMemoryStore;

    #[test]
    fn rolling_average_converges() {
        let mut stat = DurationStat::first(1000);
        stat = stat.record(2000);
        assert_eq!(stat.avg_ms_rounded(), 1500);
        for _ in 0..200 {
            stat = stat.record(3000);
        }
        assert_eq!(stat.avg_ms_rounded(), 3000);
        assert_eq!(stat.samples, 202);
    }

    #[test]
    fn eta_counts_remaining_phases() {
        assert_eq!(eta_ms(Some(1200), 3), Some(3600));
        assert_eq!(eta_ms(None, 3), None);
    }

    #[test]
    fn repeat_run_starts_with_seeded_eta() {
        let store: Arc<InMemoryStore<DurationStat>> = Arc::new(InMemoryStore::new());
        let work = WorkId::new("mn10").unwrap();

        let mut first = ProgressTracker::start(work.clone(), store.clone(), 2, 3);
        assert_eq!(first.snapshot().eta_ms, None);
        first.begin_phase(&PhaseId::numbered(1));
        let p = first.phase_done(2, Duration::from_millis(400));
        assert_eq!((p.ready_phases, p.ready_segments), (1, 2));
        assert_eq!(p.eta_ms, Some(400));
        first.phase_done(1, Duration::from_millis(600));
        let done = first.finish(PacketState::Complete);
        assert_eq!(done.ready_segments, 3);
        assert_eq!(done.avg_phase_ms, Some(500));

        let second = ProgressTracker::start(work, store, 2, 3);
        assert_eq!(second.snapshot().avg_phase_ms, Some(500));
        assert_eq!(second.snapshot().eta_ms, Some(1000));
    }
}
