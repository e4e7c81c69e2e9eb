use crate::config::{ConfigError, CovfuzzConfig, GuidanceSettings};
use crate::corpus::{Corpus, CorpusError};
use crate::coverage::CoverageMap;
use crate::feedback::{CoverageFeedback, SaveReason, Verdict, join_reasons};
use crate::input::{FuzzInput, GenerationLimits, InputError};
use crate::mutator::{HavocMutator, MutationError, Mutator, SpliceMutator};
use crate::scheduler::{PowerScheduler, SchedulerError};
use crate::stats::{StatsSnapshot, exec_rate, status_line};
use crate::storage::{CorpusEntryMetadata, CorpusStorage, StorageError, resolve_seed_paths};
use log::{debug, error, info, trace, warn};
use rand::Rng;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;

/// The single error kind surfaced by the guidance engine.
#[derive(Error, Debug)]
pub enum GuidanceError {
    #[error(transparent)]
    Input(#[from] InputError),

    #[error(transparent)]
    Mutation(#[from] MutationError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Corpus(#[from] CorpusError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The saved inputs do not own exactly the covered points.
    #[error("Responsibility mismatch: {responsible} points owned, {covered} points covered")]
    ResponsibilityMismatch { responsible: usize, covered: usize },

    /// A run's coverage snapshot has a different size than the engine's maps.
    #[error("Coverage snapshot has {actual} counters, expected {expected}")]
    CoverageSizeMismatch { expected: usize, actual: usize },

    /// A thread panicked while holding the shared engine.
    #[error("Guidance engine lock was poisoned")]
    Poisoned,
}

/// What `report_result` did with a trial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrialOutcome {
    Saved { id: usize, reasons: Vec<SaveReason> },
    /// Evaluated, but nothing new was covered.
    Discarded,
    /// Invalid run while only valid inputs may be saved.
    Ignored,
}

/// Coverage-guided input selection and corpus management.
///
/// The engine hands out one input at a time through [`next_input`] and takes
/// it back, together with the run's coverage, through [`report_result`].
///
/// [`next_input`]: CorpusGuidance::next_input
/// [`report_result`]: CorpusGuidance::report_result
pub struct CorpusGuidance<S: CorpusStorage, R: Rng> {
    settings: GuidanceSettings,
    limits: GenerationLimits,
    max_trials: Option<u64>,
    max_duration: Option<Duration>,
    log_all_inputs: bool,

    storage: S,
    rng: R,

    seeds: VecDeque<FuzzInput>,
    corpus: Corpus,
    feedback: CoverageFeedback,
    scheduler: PowerScheduler,
    havoc: HavocMutator,
    splice: SpliceMutator,

    /// Largest per-run non-zero count of any saved input.
    max_coverage: usize,
    trials: u64,
    valid_trials: u64,
    num_favored_last_cycle: usize,
    last_input_len: usize,
    /// Trial count at which the status line was last logged.
    last_status_trials: Option<u64>,

    start_time: Instant,
    last_refresh: Instant,
    last_refresh_trials: u64,
}

impl<S: CorpusStorage, R: Rng> CorpusGuidance<S, R> {
    pub fn new(settings: GuidanceSettings, storage: S, rng: R) -> Result<Self, GuidanceError> {
        settings.validate()?;
        let now = Instant::now();
        Ok(Self {
            limits: settings.generation_limits(),
            max_trials: None,
            max_duration: None,
            log_all_inputs: false,
            storage,
            rng,
            seeds: VecDeque::new(),
            corpus: Corpus::new(),
            feedback: CoverageFeedback::new(
                settings.coverage_map_size,
                settings.validity_fuzzing,
                settings.disable_save_new_counts,
            ),
            scheduler: PowerScheduler::new(settings.power_schedule()),
            havoc: settings.havoc_mutator(),
            splice: settings.splice_mutator(),
            max_coverage: 0,
            trials: 0,
            valid_trials: 0,
            num_favored_last_cycle: 0,
            last_input_len: 0,
            last_status_trials: None,
            start_time: now,
            last_refresh: now,
            last_refresh_trials: 0,
            settings,
        })
    }

    /// Builds an engine with the guidance heuristics, budget, and trial
    /// logging taken from `config`. Seeds are not loaded.
    pub fn from_config(config: &CovfuzzConfig, storage: S, rng: R) -> Result<Self, GuidanceError> {
        Ok(Self::new(config.guidance.clone(), storage, rng)?
            .with_budget(config.fuzzer.max_trials, config.fuzzer.max_duration())
            .with_trial_logging(config.corpus.log_all_inputs))
    }

    pub fn with_budget(mut self, max_trials: Option<u64>, max_duration: Option<Duration>) -> Self {
        self.max_trials = max_trials;
        self.max_duration = max_duration;
        self
    }

    pub fn with_trial_logging(mut self, enabled: bool) -> Self {
        self.log_all_inputs = enabled;
        self
    }

    pub fn settings(&self) -> &GuidanceSettings {
        &self.settings
    }

    pub fn corpus(&self) -> &Corpus {
        &self.corpus
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn total_coverage(&self) -> &CoverageMap {
        self.feedback.total()
    }

    pub fn valid_coverage(&self) -> &CoverageMap {
        self.feedback.valid()
    }

    pub fn max_coverage(&self) -> usize {
        self.max_coverage
    }

    pub fn trials(&self) -> u64 {
        self.trials
    }

    pub fn pending_seeds(&self) -> usize {
        self.seeds.len()
    }

    /// Queues a seed; queued seeds are handed out before any mutation.
    pub fn add_seed(&mut self, seed: FuzzInput) {
        self.seeds.push_back(seed);
    }

    /// Opens every seed file below `paths` and queues it. Returns the number queued.
    pub fn add_seed_paths(&mut self, paths: &[PathBuf]) -> Result<usize, GuidanceError> {
        let files = resolve_seed_paths(paths)?;
        for file in &files {
            debug!("Queueing seed {file:?}");
            self.add_seed(FuzzInput::open_seed(file)?);
        }
        Ok(files.len())
    }

    /// Whether the trial and time budget allow another trial.
    pub fn has_input(&self) -> bool {
        if self.max_trials.is_some_and(|max| self.trials >= max) {
            return false;
        }
        if self
            .max_duration
            .is_some_and(|max| self.start_time.elapsed() >= max)
        {
            return false;
        }
        true
    }

    /// Produces the input for the next trial.
    ///
    /// Queued seeds come first. With an empty corpus a fresh input is
    /// spawned. Otherwise the power schedule picks a parent and a child is
    /// derived from it by splice or havoc.
    pub fn next_input(&mut self) -> Result<FuzzInput, GuidanceError> {
        if let Some(seed) = self.seeds.pop_front() {
            trace!("Trial {}: seed {:?}", self.trials, seed.meta.description);
            return Ok(seed);
        }
        if self.corpus.is_empty() {
            trace!("Trial {}: fresh input", self.trials);
            return Ok(FuzzInput::fresh(self.limits, self.rng.next_u64()));
        }

        let selection = self.scheduler.select_parent(&self.corpus, self.max_coverage)?;
        if selection.completed_cycle {
            self.complete_cycle()?;
        }
        let parent = self
            .corpus
            .get(selection.parent)
            .ok_or(CorpusError::InputNotFound(selection.parent))?;

        let child = if self.rng.random_bool(self.settings.splice_probability) {
            Mutator::mutate(&mut self.splice, parent, &self.corpus, &mut self.rng)?
        } else {
            Mutator::mutate(&mut self.havoc, parent, &self.corpus, &mut self.rng)?
        };
        self.scheduler.record_child();
        trace!(
            "Trial {}: child {:?} of parent {}",
            self.trials, child.meta.description, selection.parent
        );
        Ok(child)
    }

    /// Ingests the result of running `input`.
    ///
    /// `run` is the per-run coverage snapshot and must have the engine's map size.
    pub fn report_result(
        &mut self,
        mut input: FuzzInput,
        run: &CoverageMap,
        valid: bool,
    ) -> Result<TrialOutcome, GuidanceError> {
        let expected = self.feedback.total().len();
        if run.len() != expected {
            return Err(GuidanceError::CoverageSizeMismatch {
                expected,
                actual: run.len(),
            });
        }

        self.trials += 1;
        self.last_input_len = input.len();
        input.meta.valid = valid;
        if self.log_all_inputs {
            self.storage.log_trial_input(self.trials, input.as_bytes())?;
        }

        // Trim before merging: an input that cannot be saved must not leave
        // unowned points in the cumulative maps.
        if input.is_seed() && !valid {
            input.trim()?;
            let verdict = self.feedback.absorb_invalid_seed(run);
            return self.save(input, run, verdict);
        }

        if valid {
            self.valid_trials += 1;
        } else if self.settings.save_only_valid {
            trace!("Trial {}: invalid run ignored", self.trials);
            return Ok(TrialOutcome::Ignored);
        }

        let verdict = self.feedback.assess(run, valid);
        if verdict.is_interesting() {
            input.trim()?;
        }
        self.feedback.commit(run, valid);
        if !verdict.is_interesting() {
            return Ok(TrialOutcome::Discarded);
        }
        self.save(input, run, verdict)
    }

    fn save(
        &mut self,
        mut input: FuzzInput,
        run: &CoverageMap,
        verdict: Verdict,
    ) -> Result<TrialOutcome, GuidanceError> {
        if input.is_empty() {
            return Err(InputError::EmptyAfterTrim.into());
        }
        let id = self.corpus.next_id();
        let reasons = join_reasons(&verdict.reasons);
        let entry = CorpusEntryMetadata {
            description: input.meta.description.clone(),
            reasons: reasons.clone(),
            parent: input.meta.parent,
            size: input.len(),
        };
        let slot = self.storage.persist_input(id, input.as_bytes(), &entry)?;

        let non_zero = run.non_zero_count();
        self.max_coverage = self.max_coverage.max(non_zero);
        if let Some(parent) = input.meta.parent {
            self.corpus.record_offspring(parent)?;
        }

        let len = input.len();
        input.meta.save_path = Some(slot);
        input.meta.coverage = Some(run.clone());
        input.meta.non_zero_coverage = Some(non_zero);
        input.meta.offspring = 0;
        let claimed = verdict.responsibilities.len();
        let description = input.meta.description.clone();
        let id = self.corpus.insert(input, verdict.responsibilities);

        info!("Saved id_{id:06} ({description}) reasons: {reasons}, owns {claimed} points");
        self.last_input_len = len;
        self.announce(exec_rate(self.trials, self.start_time.elapsed()));
        self.storage.write_coverage(self.feedback.total())?;
        self.display_stats(false)?;

        Ok(TrialOutcome::Saved {
            id,
            reasons: verdict.reasons,
        })
    }

    /// End-of-cycle bookkeeping: count favored inputs and check that they own
    /// exactly the covered points.
    fn complete_cycle(&mut self) -> Result<(), GuidanceError> {
        info!("Cycle {} completed", self.scheduler.cycles_completed());
        let mut responsible = 0;
        let mut favored = 0;
        for input in self.corpus.iter().filter(|input| input.is_favored()) {
            let owned = input.responsibility_count();
            debug!(
                "Input {} is responsible for {owned} points",
                input.id().unwrap_or_default()
            );
            responsible += owned;
            favored += 1;
        }
        self.num_favored_last_cycle = favored;

        let covered = self.feedback.total().non_zero_count();
        info!("{favored} favored inputs, {covered} points covered");
        if responsible != covered {
            if self.settings.multithreaded {
                warn!(
                    "Saved inputs own {responsible} points but {covered} are covered; \
                     coverage was recorded between executions"
                );
            } else {
                error!("Responsibility mismatch: {responsible} owned, {covered} covered");
                return Err(GuidanceError::ResponsibilityMismatch {
                    responsible,
                    covered,
                });
            }
        }
        Ok(())
    }

    /// Counters of the session so far.
    pub fn stats(&self) -> StatsSnapshot {
        let elapsed = self.start_time.elapsed();
        let total = self.feedback.total();
        let valid = self.feedback.valid();
        StatsSnapshot {
            elapsed,
            trials: self.trials,
            valid_trials: self.valid_trials,
            cycles_completed: self.scheduler.cycles_completed(),
            saved_inputs: self.corpus.len(),
            favored_inputs: self.num_favored_last_cycle,
            total_coverage: total.non_zero_count(),
            valid_coverage: valid.non_zero_count(),
            total_coverage_percent: total.coverage_percent(),
            valid_coverage_percent: valid.coverage_percent(),
            interval_exec_rate: exec_rate(
                self.trials - self.last_refresh_trials,
                self.last_refresh.elapsed(),
            ),
            overall_exec_rate: exec_rate(self.trials, elapsed),
        }
    }

    /// Logs progress and appends a plot line.
    ///
    /// Unless `force` is set, does nothing when the previous refresh is more
    /// recent than the configured refresh period. Returns the reported
    /// snapshot, if any.
    pub fn display_stats(&mut self, force: bool) -> Result<Option<StatsSnapshot>, GuidanceError> {
        if !force && self.last_refresh.elapsed() < self.settings.stats_refresh() {
            return Ok(None);
        }
        let stats = self.stats();
        self.last_refresh = Instant::now();
        self.last_refresh_trials = self.trials;

        self.announce(stats.interval_exec_rate);
        if !self.seeds.is_empty() || self.corpus.is_empty() {
            debug!("{stats} | parent <seed>");
        } else {
            debug!(
                "{stats} | parent {} ({}/{} children)",
                self.scheduler.parent_idx(),
                self.scheduler.children_generated(),
                self.corpus
                    .get(self.scheduler.parent_idx())
                    .map(|p| self.scheduler.schedule().target_children(p, self.max_coverage))
                    .unwrap_or_default()
            );
        }
        self.storage.append_plot_line(&stats.plot_line())?;
        Ok(Some(stats))
    }

    /// Logs the libFuzzer-style status line, at most once per trial.
    ///
    /// Returns `false` if the line was already logged for the current trial.
    fn announce(&mut self, rate: f64) -> bool {
        if self.last_status_trials == Some(self.trials) {
            return false;
        }
        self.last_status_trials = Some(self.trials);
        info!(
            "{}",
            status_line(
                self.trials,
                self.feedback.total().non_zero_count(),
                rate,
                self.last_input_len,
            )
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{NextByte, SeedInput};
    use crate::storage::InMemoryStorage;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;
    use std::collections::BTreeSet;
    use std::io::Cursor;
    use tempfile::tempdir;

    const MAP: usize = 64;

    fn settings() -> GuidanceSettings {
        GuidanceSettings {
            coverage_map_size: MAP,
            multithreaded: false,
            ..GuidanceSettings::default()
        }
    }

    fn engine(settings: GuidanceSettings) -> CorpusGuidance<InMemoryStorage, ChaCha8Rng> {
        CorpusGuidance::new(settings, InMemoryStorage::new(), ChaCha8Rng::seed_from_u64(7)).unwrap()
    }

    fn run(points: &[usize]) -> CoverageMap {
        let mut map = CoverageMap::new(MAP);
        for &p in points {
            map.record_hit(p);
        }
        map
    }

    fn memory_seed(bytes: &[u8]) -> FuzzInput {
        FuzzInput::seed(SeedInput::from_reader("mem", Cursor::new(bytes.to_vec())))
    }

    fn consume_all(input: &mut FuzzInput) -> Vec<u8> {
        let mut bytes = Vec::new();
        let mut index = 0;
        while let NextByte::Byte(b) = input.next(index).unwrap() {
            bytes.push(b);
            index += 1;
        }
        bytes
    }

    #[test]
    fn seed_file_is_tried_first_and_saved_with_its_coverage() {
        let dir = tempdir().unwrap();
        let seed_path = dir.path().join("seed");
        std::fs::write(&seed_path, [1, 2, 3, 4, 5, 6, 7, 8]).unwrap();

        let mut guidance = engine(settings());
        assert_eq!(guidance.add_seed_paths(&[seed_path]).unwrap(), 1);

        let mut input = guidance.next_input().unwrap();
        assert!(input.is_seed());
        assert_eq!(consume_all(&mut input), vec![1, 2, 3, 4, 5, 6, 7, 8]);

        let outcome = guidance.report_result(input, &run(&[3, 9, 27]), true).unwrap();
        assert_eq!(
            outcome,
            TrialOutcome::Saved {
                id: 0,
                reasons: vec![SaveReason::NewCounts, SaveReason::NewCoverage, SaveReason::NewValid],
            }
        );
        assert_eq!(guidance.corpus().len(), 1);
        let saved = guidance.corpus().get(0).unwrap();
        assert_eq!(saved.responsibility_count(), 3);
        assert!(saved.is_favored());
        assert_eq!(saved.meta.non_zero_coverage, Some(3));
        assert_eq!(guidance.max_coverage(), 3);
        assert_eq!(guidance.storage().inputs[&0].0, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(guidance.storage().inputs[&0].1.reasons, "+count +cov +valid");
    }

    #[test]
    fn empty_corpus_spawns_fresh_inputs() {
        let mut guidance = engine(GuidanceSettings {
            generate_eof_when_out: false,
            ..settings()
        });
        let mut input = guidance.next_input().unwrap();
        assert!(!input.is_seed());
        assert_eq!(input.meta.description, "random");
        assert!(input.is_empty());
        assert!(matches!(input.next(0).unwrap(), NextByte::Byte(_)));
    }

    #[test]
    fn invalid_seed_is_kept_and_trimmed() {
        let mut guidance = engine(settings());
        guidance.add_seed(memory_seed(&[10, 20, 30, 40]));
        let mut input = guidance.next_input().unwrap();
        input.next(0).unwrap();
        input.next(1).unwrap();

        let outcome = guidance.report_result(input, &run(&[4, 5]), false).unwrap();
        assert_eq!(
            outcome,
            TrialOutcome::Saved {
                id: 0,
                reasons: vec![SaveReason::InitialSeed]
            }
        );
        let saved = guidance.corpus().get(0).unwrap();
        assert_eq!(saved.as_bytes(), &[10, 20]);
        assert!(!saved.meta.valid);
        assert_eq!(saved.responsibility_count(), 2);
        assert_eq!(guidance.total_coverage().non_zero_count(), 2);
        assert_eq!(guidance.valid_coverage().non_zero_count(), 0);
        assert!(guidance.storage().coverage.is_some());
    }

    #[test]
    fn invalid_runs_respect_save_only_valid() {
        let mut guidance = engine(GuidanceSettings {
            generate_eof_when_out: false,
            save_only_valid: true,
            ..settings()
        });
        let mut input = guidance.next_input().unwrap();
        input.next(0).unwrap();
        assert_eq!(
            guidance.report_result(input, &run(&[1]), false).unwrap(),
            TrialOutcome::Ignored
        );
        assert!(guidance.corpus().is_empty());
        assert_eq!(guidance.total_coverage().non_zero_count(), 0);

        let mut input = guidance.next_input().unwrap();
        input.next(0).unwrap();
        assert!(matches!(
            guidance.report_result(input, &run(&[1]), true).unwrap(),
            TrialOutcome::Saved { id: 0, .. }
        ));
        assert_eq!(guidance.stats().trials, 2);
        assert_eq!(guidance.stats().valid_trials, 1);
    }

    #[test]
    fn repeated_coverage_is_discarded() {
        let mut guidance = engine(settings());
        guidance.add_seed(memory_seed(&[1]));
        guidance.add_seed(memory_seed(&[2]));
        for expected_saved in [true, false] {
            let mut input = guidance.next_input().unwrap();
            consume_all(&mut input);
            let outcome = guidance.report_result(input, &run(&[8]), true).unwrap();
            assert_eq!(matches!(outcome, TrialOutcome::Saved { .. }), expected_saved);
        }
        assert_eq!(guidance.corpus().len(), 1);
    }

    #[test]
    fn unread_input_cannot_be_saved() {
        let mut guidance = engine(settings());
        let input = guidance.next_input().unwrap();
        let result = guidance.report_result(input, &run(&[2]), true);
        assert!(matches!(
            result,
            Err(GuidanceError::Input(InputError::EmptyAfterTrim))
        ));
        assert!(guidance.corpus().is_empty());
        assert_eq!(guidance.total_coverage().non_zero_count(), 0);
        assert_eq!(guidance.valid_coverage().non_zero_count(), 0);
    }

    #[test]
    fn empty_seed_leaves_coverage_consistent() {
        let mut guidance = engine(GuidanceSettings {
            num_children_baseline: 1,
            num_children_multiplier_favored: 1,
            ..settings()
        });
        guidance.add_seed(memory_seed(&[]));
        guidance.add_seed(memory_seed(&[7, 7]));

        let mut empty = guidance.next_input().unwrap();
        assert_eq!(empty.next(0).unwrap(), NextByte::Eof);
        let result = guidance.report_result(empty, &run(&[16]), false);
        assert!(matches!(
            result,
            Err(GuidanceError::Input(InputError::EmptyAfterTrim))
        ));
        assert_eq!(guidance.total_coverage().non_zero_count(), 0);

        let mut seed = guidance.next_input().unwrap();
        consume_all(&mut seed);
        guidance.report_result(seed, &run(&[1]), true).unwrap();

        for _ in 0..4 {
            guidance.next_input().unwrap();
        }
        assert!(guidance.stats().cycles_completed >= 1);
        assert_eq!(
            guidance.corpus().responsibility_sum(),
            guidance.total_coverage().non_zero_count()
        );
    }

    #[test]
    fn status_line_is_logged_once_per_trial() {
        let mut guidance = engine(settings());
        guidance.add_seed(memory_seed(&[1, 2]));
        let mut seed = guidance.next_input().unwrap();
        consume_all(&mut seed);
        guidance.report_result(seed, &run(&[5]), true).unwrap();

        assert!(!guidance.announce(0.0), "save already logged this trial");
        guidance.display_stats(true).unwrap();
        assert_eq!(guidance.last_status_trials, Some(1));

        let child = guidance.next_input().unwrap();
        guidance.report_result(child, &run(&[5]), true).unwrap();
        assert!(guidance.announce(0.0));
        assert!(!guidance.announce(0.0));
    }

    #[test]
    fn wrong_snapshot_size_is_rejected() {
        let mut guidance = engine(settings());
        let input = guidance.next_input().unwrap();
        let result = guidance.report_result(input, &CoverageMap::new(MAP + 1), true);
        assert!(matches!(
            result,
            Err(GuidanceError::CoverageSizeMismatch {
                expected: MAP,
                actual: 65
            })
        ));
        assert_eq!(guidance.trials(), 0);
    }

    #[test]
    fn saved_child_counts_as_offspring_of_its_parent() {
        let mut guidance = engine(settings());
        guidance.add_seed(memory_seed(&[1, 2, 3, 4]));
        let mut seed = guidance.next_input().unwrap();
        consume_all(&mut seed);
        guidance.report_result(seed, &run(&[0, 1]), true).unwrap();

        let mut child = guidance.next_input().unwrap();
        assert_eq!(child.meta.parent, Some(0));
        consume_all(&mut child);
        let outcome = guidance.report_result(child, &run(&[0, 1, 2, 3, 4]), true).unwrap();
        assert!(matches!(outcome, TrialOutcome::Saved { id: 1, .. }));

        assert_eq!(guidance.corpus().get(0).unwrap().meta.offspring, 1);
        assert_eq!(guidance.corpus().get(1).unwrap().meta.offspring, 0);
        assert_eq!(guidance.max_coverage(), 5);
        assert_eq!(guidance.storage().inputs[&1].1.parent, Some(0));
    }

    #[test]
    fn responsibilities_stay_exclusive_across_saves() {
        let mut guidance = engine(settings());
        for (bytes, points) in [
            (&[1u8][..], &[1usize, 2, 3][..]),
            (&[2u8][..], &[2, 3, 4][..]),
            (&[3u8][..], &[4, 5][..]),
        ] {
            guidance.add_seed(memory_seed(bytes));
            let mut input = guidance.next_input().unwrap();
            consume_all(&mut input);
            guidance.report_result(input, &run(points), false).unwrap();
        }

        let mut seen = BTreeSet::new();
        for input in guidance.corpus().iter() {
            for point in input.meta.responsibilities.as_ref().unwrap() {
                assert!(seen.insert(*point), "point {point} owned twice");
            }
        }
        assert_eq!(
            guidance.corpus().responsibility_sum(),
            guidance.total_coverage().non_zero_count()
        );
    }

    fn engine_with_stray_coverage(multithreaded: bool) -> CorpusGuidance<InMemoryStorage, ChaCha8Rng> {
        let mut guidance = engine(GuidanceSettings {
            num_children_baseline: 1,
            num_children_multiplier_favored: 1,
            multithreaded,
            ..settings()
        });
        guidance.add_seed(memory_seed(&[1, 2]));
        let mut seed = guidance.next_input().unwrap();
        consume_all(&mut seed);
        guidance.report_result(seed, &run(&[1]), true).unwrap();
        // Coverage merged without any saved input claiming it.
        guidance.feedback.evaluate(&run(&[40]), true);
        guidance
    }

    #[test]
    fn responsibility_mismatch_is_fatal_when_single_threaded() {
        let mut guidance = engine_with_stray_coverage(false);
        guidance.next_input().unwrap();
        match guidance.next_input() {
            Err(GuidanceError::ResponsibilityMismatch {
                responsible,
                covered,
            }) => {
                assert_eq!(responsible, 1);
                assert_eq!(covered, 2);
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
    }

    #[test]
    fn responsibility_mismatch_is_a_warning_when_multithreaded() {
        let mut guidance = engine_with_stray_coverage(true);
        guidance.next_input().unwrap();
        let child = guidance.next_input().unwrap();
        assert_eq!(child.meta.parent, Some(0));
        assert_eq!(guidance.stats().cycles_completed, 1);
        assert_eq!(guidance.stats().favored_inputs, 1);
    }

    #[test]
    fn budget_limits_trials() {
        let mut guidance = engine(settings()).with_budget(Some(2), None);
        for _ in 0..2 {
            assert!(guidance.has_input());
            let input = guidance.next_input().unwrap();
            guidance.report_result(input, &run(&[]), true).unwrap();
        }
        assert!(!guidance.has_input());

        let expired = engine(settings()).with_budget(None, Some(Duration::ZERO));
        assert!(!expired.has_input());
    }

    #[test]
    fn forced_stats_append_a_plot_line() {
        let mut guidance = engine(settings());
        let input = guidance.next_input().unwrap();
        guidance.report_result(input, &run(&[]), false).unwrap();

        let stats = guidance.display_stats(true).unwrap().unwrap();
        assert_eq!(stats.trials, 1);
        assert_eq!(stats.valid_trials, 0);
        let line = guidance.storage().plot_lines.last().unwrap();
        assert!(line.starts_with("time: "));
        assert!(line.contains("trials: 1, valid: 0, fuzz_cycle: 0, saved_inputs: 0"));
        assert!(guidance.display_stats(false).unwrap().is_none());
    }

    #[test]
    fn trial_logging_records_every_input() {
        let mut guidance = engine(GuidanceSettings {
            generate_eof_when_out: false,
            ..settings()
        })
        .with_trial_logging(true);
        let mut input = guidance.next_input().unwrap();
        input.next(0).unwrap();
        guidance.report_result(input, &run(&[]), true).unwrap();
        assert_eq!(guidance.storage().logged_trials.len(), 1);
        assert_eq!(guidance.storage().logged_trials[0].0, 1);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let result = CorpusGuidance::new(
            GuidanceSettings {
                splice_probability: 2.0,
                ..settings()
            },
            InMemoryStorage::new(),
            ChaCha8Rng::seed_from_u64(0),
        );
        assert!(matches!(result, Err(GuidanceError::Config(_))));
    }
}
