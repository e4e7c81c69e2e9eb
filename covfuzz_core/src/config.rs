use crate::coverage::DEFAULT_MAP_SIZE;
use crate::input::GenerationLimits;
use crate::mutator::{DEFAULT_ZERO_FILL_PROBABILITY, HavocMutator, SpliceMutator};
use crate::scheduler::PowerSchedule;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    /// A probability setting lies outside `[0, 1]`.
    #[error("Setting '{name}' must be a probability in [0, 1], got {value}")]
    InvalidProbability { name: &'static str, value: f64 },

    /// A mean setting is below 1.
    #[error("Setting '{name}' must be at least 1.0, got {value}")]
    InvalidMean { name: &'static str, value: f64 },

    /// A size setting is zero.
    #[error("Setting '{0}' must be greater than zero")]
    ZeroSize(&'static str),
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    #[serde(default)]
    pub max_trials: Option<u64>,
    #[serde(default)]
    pub max_duration_secs: Option<u64>,
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Seeds the engine PRNG; absent means seeded from the OS.
    #[serde(default)]
    pub rng_seed: Option<u64>,
}

pub fn default_threads() -> usize {
    1
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            max_trials: None,
            max_duration_secs: None,
            threads: default_threads(),
            rng_seed: None,
        }
    }
}

impl FuzzerSettings {
    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration_secs.map(Duration::from_secs)
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CorpusConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub seed_paths: Vec<PathBuf>,
    /// Writes every trial to `all/success`; meant for debugging only.
    #[serde(default)]
    pub log_all_inputs: bool,
}

pub fn default_output_dir() -> PathBuf {
    PathBuf::from("./fuzz-results")
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            seed_paths: Vec::new(),
            log_all_inputs: false,
        }
    }
}

/// Heuristics of the guidance engine.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct GuidanceSettings {
    #[serde(default = "default_coverage_map_size")]
    pub coverage_map_size: usize,
    #[serde(default = "default_max_input_size")]
    pub max_input_size: usize,
    #[serde(default = "default_true")]
    pub generate_eof_when_out: bool,
    #[serde(default = "default_num_children_baseline")]
    pub num_children_baseline: usize,
    #[serde(default = "default_num_children_multiplier_favored")]
    pub num_children_multiplier_favored: usize,
    #[serde(default = "default_splice_probability")]
    pub splice_probability: f64,
    #[serde(default = "default_mean_mutation_count")]
    pub mean_mutation_count: f64,
    #[serde(default = "default_mean_mutation_size")]
    pub mean_mutation_size: f64,
    #[serde(default = "default_true")]
    pub constant_mutation_size: bool,
    #[serde(default = "default_zero_fill_probability")]
    pub zero_fill_probability: f64,
    #[serde(default = "default_true")]
    pub validity_fuzzing: bool,
    #[serde(default)]
    pub save_only_valid: bool,
    #[serde(default)]
    pub disable_save_new_counts: bool,
    /// Downgrades the end-of-cycle responsibility check to a warning.
    #[serde(default = "default_true")]
    pub multithreaded: bool,
    #[serde(default = "default_stats_refresh_ms")]
    pub stats_refresh_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_coverage_map_size() -> usize {
    DEFAULT_MAP_SIZE
}

fn default_max_input_size() -> usize {
    10240
}

fn default_num_children_baseline() -> usize {
    100
}

fn default_num_children_multiplier_favored() -> usize {
    40
}

fn default_splice_probability() -> f64 {
    0.1
}

fn default_mean_mutation_count() -> f64 {
    4.0
}

fn default_mean_mutation_size() -> f64 {
    1.0
}

fn default_zero_fill_probability() -> f64 {
    DEFAULT_ZERO_FILL_PROBABILITY
}

fn default_stats_refresh_ms() -> u64 {
    300
}

impl Default for GuidanceSettings {
    fn default() -> Self {
        Self {
            coverage_map_size: default_coverage_map_size(),
            max_input_size: default_max_input_size(),
            generate_eof_when_out: true,
            num_children_baseline: default_num_children_baseline(),
            num_children_multiplier_favored: default_num_children_multiplier_favored(),
            splice_probability: default_splice_probability(),
            mean_mutation_count: default_mean_mutation_count(),
            mean_mutation_size: default_mean_mutation_size(),
            constant_mutation_size: true,
            zero_fill_probability: default_zero_fill_probability(),
            validity_fuzzing: true,
            save_only_valid: false,
            disable_save_new_counts: false,
            multithreaded: true,
            stats_refresh_ms: default_stats_refresh_ms(),
        }
    }
}

impl GuidanceSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("splice-probability", self.splice_probability),
            ("zero-fill-probability", self.zero_fill_probability),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidProbability { name, value });
            }
        }
        for (name, value) in [
            ("mean-mutation-count", self.mean_mutation_count),
            ("mean-mutation-size", self.mean_mutation_size),
        ] {
            if value.is_nan() || value < 1.0 {
                return Err(ConfigError::InvalidMean { name, value });
            }
        }
        if self.coverage_map_size == 0 {
            return Err(ConfigError::ZeroSize("coverage-map-size"));
        }
        if self.max_input_size == 0 {
            return Err(ConfigError::ZeroSize("max-input-size"));
        }
        Ok(())
    }

    pub fn generation_limits(&self) -> GenerationLimits {
        GenerationLimits {
            max_input_size: self.max_input_size,
            eof_when_exhausted: self.generate_eof_when_out,
        }
    }

    pub fn power_schedule(&self) -> PowerSchedule {
        PowerSchedule {
            baseline: self.num_children_baseline,
            favored_multiplier: self.num_children_multiplier_favored,
        }
    }

    pub fn havoc_mutator(&self) -> HavocMutator {
        HavocMutator {
            mean_mutation_count: self.mean_mutation_count,
            mean_mutation_size: self.mean_mutation_size,
            constant_mutation_size: self.constant_mutation_size,
            zero_fill_probability: self.zero_fill_probability,
            limits: self.generation_limits(),
        }
    }

    pub fn splice_mutator(&self) -> SpliceMutator {
        SpliceMutator {
            limits: self.generation_limits(),
        }
    }

    pub fn stats_refresh(&self) -> Duration {
        Duration::from_millis(self.stats_refresh_ms)
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CovfuzzConfig {
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
    #[serde(default)]
    pub corpus: CorpusConfig,
    #[serde(default)]
    pub guidance: GuidanceSettings,
}

impl CovfuzzConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: CovfuzzConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        config
            .guidance
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid configuration in {:?}: {}", path, e))?;

        Ok(config)
    }
}
