use crate::corpus::Corpus;
use crate::input::FuzzInput;
use thiserror::Error;

/// Errors that can occur during scheduler operations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SchedulerError {
    /// Indicates that the corpus is empty, and therefore no parent can be scheduled.
    #[error("Corpus is empty, cannot schedule next input")]
    CorpusEmpty,
}

/// The power schedule: how many children a parent gets before the cursor moves on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerSchedule {
    /// Children for a parent that covers as much as the best saved input.
    pub baseline: usize,
    /// Extra factor applied to favored parents.
    pub favored_multiplier: usize,
}

impl Default for PowerSchedule {
    fn default() -> Self {
        Self {
            baseline: 100,
            favored_multiplier: 40,
        }
    }
}

impl PowerSchedule {
    /// Target children for `parent`, given the largest per-run coverage of any saved input.
    ///
    /// Seeds always get the baseline. Other inputs are scaled by their share of
    /// `max_coverage` (integer division). Favored inputs are then multiplied.
    pub fn target_children(&self, parent: &FuzzInput, max_coverage: usize) -> usize {
        let mut target = self.baseline;
        if max_coverage > 0 && !parent.is_seed() {
            let covered = parent.meta.non_zero_coverage.unwrap_or(0);
            target = self.baseline.saturating_mul(covered) / max_coverage;
        }
        if parent.is_favored() {
            target = target.saturating_mul(self.favored_multiplier);
        }
        target
    }
}

/// The parent chosen for the next child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub parent: usize,
    /// The cursor wrapped to the start of the corpus, completing a cycle.
    pub completed_cycle: bool,
}

/// Round-robin cursor over the corpus driven by a [`PowerSchedule`].
#[derive(Debug, Clone, Default)]
pub struct PowerScheduler {
    schedule: PowerSchedule,
    parent_idx: usize,
    children_generated: usize,
    cycles_completed: usize,
}

impl PowerScheduler {
    pub fn new(schedule: PowerSchedule) -> Self {
        Self {
            schedule,
            ..Self::default()
        }
    }

    pub fn schedule(&self) -> &PowerSchedule {
        &self.schedule
    }

    pub fn parent_idx(&self) -> usize {
        self.parent_idx
    }

    pub fn children_generated(&self) -> usize {
        self.children_generated
    }

    pub fn cycles_completed(&self) -> usize {
        self.cycles_completed
    }

    /// Picks the parent for the next child.
    ///
    /// While the current parent has reached its target the cursor advances,
    /// resetting the child counter and counting a cycle on every wrap to 0.
    /// Parents with a target of zero are skipped; if a full pass finds no
    /// parent below its target, the one under the cursor is used anyway.
    pub fn select_parent(
        &mut self,
        corpus: &Corpus,
        max_coverage: usize,
    ) -> Result<Selection, SchedulerError> {
        let len = corpus.len();
        if len == 0 {
            return Err(SchedulerError::CorpusEmpty);
        }
        if self.parent_idx >= len {
            self.parent_idx = 0;
        }

        let mut completed_cycle = false;
        for _ in 0..len {
            let parent = corpus
                .get(self.parent_idx)
                .ok_or(SchedulerError::CorpusEmpty)?;
            if self.children_generated < self.schedule.target_children(parent, max_coverage) {
                break;
            }
            self.parent_idx = (self.parent_idx + 1) % len;
            self.children_generated = 0;
            if self.parent_idx == 0 {
                self.cycles_completed += 1;
                completed_cycle = true;
            }
        }

        Ok(Selection {
            parent: self.parent_idx,
            completed_cycle,
        })
    }

    /// Counts a child produced for the current parent.
    pub fn record_child(&mut self) {
        self.children_generated += 1;
    }
}
