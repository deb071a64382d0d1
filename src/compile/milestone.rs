//! Monotonic stage-onset tracking.
//!
//! For a staged progression (kidney-function stage, liver-severity
//! stage) the tracker records, per stage, the first day the stage was
//! reached and never improved on since. Observing a better stage cancels
//! the recorded onset of every worse stage: the earlier deterioration is
//! then known to have been a resolved excursion, and only a later
//! qualifying deterioration may record a new, later onset.

/// Onset dates for one staged progression. Stage 0 means "no data" and
/// is never observed.
#[derive(Debug, Clone)]
pub struct StageTracker {
    onsets: Vec<Option<i64>>,
}

impl StageTracker {
    pub fn new(max_stage: u8) -> Self {
        Self {
            onsets: vec![None; max_stage as usize + 1],
        }
    }

    /// Observe the stage held at the close of `day`.
    pub fn observe(&mut self, stage: u8, day: i64) {
        let stage = (stage as usize).min(self.onsets.len() - 1);
        if stage == 0 {
            return;
        }
        // A jump across stages reaches the intermediate ones too; an
        // already-set onset is never moved earlier or later.
        for s in 1..=stage {
            if self.onsets[s].is_none() {
                self.onsets[s] = Some(day);
            }
        }
        // Improvement invalidates the onsets of all worse stages.
        for s in stage + 1..self.onsets.len() {
            self.onsets[s] = None;
        }
    }

    /// First day `stage` was reached and held, if it ever was.
    pub fn onset(&self, stage: u8) -> Option<i64> {
        self.onsets.get(stage as usize).copied().flatten()
    }

    pub fn max_stage(&self) -> u8 {
        (self.onsets.len() - 1) as u8
    }
}
