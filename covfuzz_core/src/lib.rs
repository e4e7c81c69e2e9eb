pub mod config;
pub mod corpus;
pub mod coverage;
pub mod executor;
pub mod feedback;
pub mod guidance;
pub mod input;
pub mod mutator;
pub mod scheduler;
pub mod shared;
pub mod stats;
pub mod storage;

pub use config::{ConfigError, CorpusConfig, CovfuzzConfig, FuzzerSettings, GuidanceSettings};
pub use corpus::{Corpus, CorpusError};
pub use coverage::{CoverageMap, DEFAULT_MAP_SIZE};
pub use executor::{Execution, ExecutionStatus, Executor, InProcessExecutor, ParameterStream};
pub use feedback::{CoverageFeedback, SaveReason, Verdict};
pub use guidance::{CorpusGuidance, GuidanceError, TrialOutcome};
pub use input::{
    ByteStream, FuzzInput, GeneratedInput, GenerationLimits, InputError, InputMeta, NextByte,
    SeedInput,
};
pub use mutator::{HavocMutator, MutationError, Mutator, SpliceMutator};
pub use scheduler::{PowerSchedule, PowerScheduler, SchedulerError, Selection};
pub use shared::SharedGuidance;
pub use stats::StatsSnapshot;
pub use storage::{CorpusStorage, InMemoryStorage, OnDiskStorage, StorageError};
