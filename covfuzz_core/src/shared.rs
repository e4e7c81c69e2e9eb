use crate::coverage::CoverageMap;
use crate::guidance::{CorpusGuidance, GuidanceError, TrialOutcome};
use crate::input::FuzzInput;
use crate::stats::StatsSnapshot;
use crate::storage::CorpusStorage;
use rand::Rng;
use std::sync::{Arc, Mutex, MutexGuard};

/// A guidance engine shared between worker threads.
///
/// Each call takes the lock for the whole selection or ingestion step, so
/// the corpus, cursor, and coverage maps are only ever touched by one thread
/// at a time. Targets run outside the lock.
pub struct SharedGuidance<S: CorpusStorage, R: Rng> {
    inner: Arc<Mutex<CorpusGuidance<S, R>>>,
}

impl<S: CorpusStorage, R: Rng> Clone for SharedGuidance<S, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: CorpusStorage, R: Rng> SharedGuidance<S, R> {
    pub fn new(guidance: CorpusGuidance<S, R>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(guidance)),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, CorpusGuidance<S, R>>, GuidanceError> {
        self.inner.lock().map_err(|_| GuidanceError::Poisoned)
    }

    pub fn next_input(&self) -> Result<FuzzInput, GuidanceError> {
        self.lock()?.next_input()
    }

    pub fn report_result(
        &self,
        input: FuzzInput,
        run: &CoverageMap,
        valid: bool,
    ) -> Result<TrialOutcome, GuidanceError> {
        self.lock()?.report_result(input, run, valid)
    }

    pub fn has_input(&self) -> Result<bool, GuidanceError> {
        Ok(self.lock()?.has_input())
    }

    pub fn display_stats(&self, force: bool) -> Result<Option<StatsSnapshot>, GuidanceError> {
        self.lock()?.display_stats(force)
    }

    pub fn stats(&self) -> Result<StatsSnapshot, GuidanceError> {
        Ok(self.lock()?.stats())
    }

    /// Runs `f` with exclusive access to the engine.
    pub fn with_engine<T>(
        &self,
        f: impl FnOnce(&mut CorpusGuidance<S, R>) -> T,
    ) -> Result<T, GuidanceError> {
        Ok(f(&mut *self.lock()?))
    }
}
