use crate::coverage::CoverageMap;
use std::collections::BTreeSet;
use std::fmt;

/// Why an input was kept in the corpus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveReason {
    /// An invalid seed, kept unconditionally.
    InitialSeed,
    /// Some counter of the cumulative map moved into a new bucket.
    NewCounts,
    /// The cumulative number of covered points grew.
    NewCoverage,
    /// The cumulative number of points covered by valid runs grew.
    NewValid,
}

impl SaveReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaveReason::InitialSeed => "initial_seed",
            SaveReason::NewCounts => "+count",
            SaveReason::NewCoverage => "+cov",
            SaveReason::NewValid => "+valid",
        }
    }
}

impl fmt::Display for SaveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Joins reasons the way they appear in logs and the corpus index.
pub fn join_reasons(reasons: &[SaveReason]) -> String {
    reasons
        .iter()
        .map(SaveReason::as_str)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Outcome of evaluating one run against the cumulative coverage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Verdict {
    /// Points this run may claim if it is saved.
    pub responsibilities: BTreeSet<usize>,
    pub reasons: Vec<SaveReason>,
}

impl Verdict {
    pub fn is_interesting(&self) -> bool {
        !self.reasons.is_empty()
    }
}

/// Owns the two cumulative coverage maps and decides which runs are worth keeping.
///
/// Every merge into the valid map is also a merge into the total map, so a
/// point non-zero in `valid` is always non-zero in `total`.
#[derive(Debug, Clone)]
pub struct CoverageFeedback {
    total: CoverageMap,
    valid: CoverageMap,
    validity_fuzzing: bool,
    disable_save_new_counts: bool,
}

impl CoverageFeedback {
    pub fn new(map_size: usize, validity_fuzzing: bool, disable_save_new_counts: bool) -> Self {
        Self {
            total: CoverageMap::new(map_size),
            valid: CoverageMap::new(map_size),
            validity_fuzzing,
            disable_save_new_counts,
        }
    }

    pub fn total(&self) -> &CoverageMap {
        &self.total
    }

    pub fn valid(&self) -> &CoverageMap {
        &self.valid
    }

    /// Points newly covered by `run` relative to the total map, plus (for valid
    /// runs) points newly covered relative to the valid map.
    ///
    /// Must be called before `run` is merged.
    pub fn compute_responsibilities(&self, run: &CoverageMap, valid: bool) -> BTreeSet<usize> {
        let mut result = run.new_indices(&self.total);
        if valid {
            result.extend(run.new_indices(&self.valid));
        }
        result
    }

    /// Collects every save reason `run` would earn and the points it would
    /// claim, without touching the cumulative maps.
    ///
    /// Pair with [`commit`](Self::commit) once the run is known to be
    /// acceptable, so that a rejected input leaves no unowned coverage behind.
    pub fn assess(&self, run: &CoverageMap, valid: bool) -> Verdict {
        let new_total = run.new_indices(&self.total);
        let new_valid = if valid {
            run.new_indices(&self.valid)
        } else {
            BTreeSet::new()
        };

        let mut reasons = Vec::new();
        if !self.disable_save_new_counts && self.total.would_change(run) {
            reasons.push(SaveReason::NewCounts);
        }
        if !new_total.is_empty() {
            reasons.push(SaveReason::NewCoverage);
        }
        if self.validity_fuzzing && !new_valid.is_empty() {
            reasons.push(SaveReason::NewValid);
        }

        let mut responsibilities = new_total;
        responsibilities.extend(new_valid);
        Verdict {
            responsibilities,
            reasons,
        }
    }

    /// Merges `run` into the total map, and into the valid map if `valid`.
    pub fn commit(&mut self, run: &CoverageMap, valid: bool) {
        self.total.merge(run);
        if valid {
            self.valid.merge(run);
        }
    }

    /// [`assess`](Self::assess) followed by [`commit`](Self::commit).
    pub fn evaluate(&mut self, run: &CoverageMap, valid: bool) -> Verdict {
        let verdict = self.assess(run, valid);
        self.commit(run, valid);
        verdict
    }

    /// Accounts for an invalid seed: its new points are claimed and merged
    /// into the total map only.
    pub fn absorb_invalid_seed(&mut self, run: &CoverageMap) -> Verdict {
        let responsibilities = self.compute_responsibilities(run, false);
        self.total.merge(run);
        Verdict {
            responsibilities,
            reasons: vec![SaveReason::InitialSeed],
        }
    }
}
