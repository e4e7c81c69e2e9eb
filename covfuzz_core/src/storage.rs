use crate::coverage::CoverageMap;
use bincode::config::{Configuration, Fixint, LittleEndian, NoLimit};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while persisting corpus entries and fuzzing statistics.
#[derive(Error, Debug)]
pub enum StorageError {
    /// An I/O error occurred while reading or writing the output directory.
    #[error("Storage I/O error: {0}")]
    Io(String),

    /// The corpus index could not be (de)serialized as JSON.
    #[error("Corpus index serialization error: {0}")]
    Index(String),

    /// The coverage state could not be (de)serialized with bincode.
    #[error("Coverage state serialization error: {0}")]
    CoverageState(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Index(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for StorageError {
    fn from(err: bincode::error::EncodeError) -> Self {
        StorageError::CoverageState(format!("Bincode encoding error: {err}"))
    }
}

impl From<bincode::error::DecodeError> for StorageError {
    fn from(err: bincode::error::DecodeError) -> Self {
        StorageError::CoverageState(format!("Bincode decoding error: {err}"))
    }
}

/// What the corpus index records for every saved input.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CorpusEntryMetadata {
    /// Provenance of the input, e.g. `seed` or `src:000003,havoc:2`.
    pub description: String,
    /// Space separated save reasons, e.g. `+count +cov`.
    pub reasons: String,
    pub parent: Option<usize>,
    pub size: usize,
}

/// The persistence collaborator of the guidance engine.
///
/// The engine only ever asks to write bytes to a numbered slot and to refresh
/// its statistics artifacts; layout and format are up to the implementation.
pub trait CorpusStorage: Send {
    /// Stores the bytes of a newly saved input.
    ///
    /// # Arguments
    /// * `id`: The corpus identifier assigned to the input. Identifiers are dense and
    ///   increase by one per save.
    /// * `bytes`: The trimmed bytes of the input.
    /// * `entry`: Description, save reasons, parent and size, for implementations
    ///   that keep an index next to the raw bytes.
    ///
    /// # Returns
    /// A `Result` containing the path the bytes were written to, or a `StorageError`
    /// if the write fails.
    fn persist_input(
        &mut self,
        id: usize,
        bytes: &[u8],
        entry: &CorpusEntryMetadata,
    ) -> Result<PathBuf, StorageError>;

    /// Replaces the stored cumulative coverage state.
    ///
    /// # Arguments
    /// * `coverage`: The total coverage map after the latest save.
    ///
    /// # Returns
    /// A `Result` indicating success, or a `StorageError` if the state could not be
    /// encoded or written.
    fn write_coverage(&mut self, coverage: &CoverageMap) -> Result<(), StorageError>;

    /// Appends one line to the plot log.
    ///
    /// # Arguments
    /// * `line`: A formatted plot row without the trailing newline.
    ///
    /// # Returns
    /// A `Result` indicating success, or a `StorageError` if the append fails.
    fn append_plot_line(&mut self, line: &str) -> Result<(), StorageError>;

    /// Records the bytes of an arbitrary trial, for debugging runs that log every input.
    ///
    /// # Arguments
    /// * `trial`: The 1-based trial number the bytes belong to.
    /// * `bytes`: The bytes of the input as executed, before any trimming.
    ///
    /// # Returns
    /// A `Result` indicating success, or a `StorageError` if the write fails.
    fn log_trial_input(&mut self, trial: u64, bytes: &[u8]) -> Result<(), StorageError>;
}

fn coverage_bincode_config() -> Configuration<LittleEndian, Fixint, NoLimit> {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

/// Decodes a coverage state previously written by [`OnDiskStorage::write_coverage`].
pub fn load_coverage_state(path: &Path) -> Result<CoverageMap, StorageError> {
    let bytes = fs::read(path)
        .map_err(|e| StorageError::Io(format!("Failed to read coverage state {path:?}: {e}")))?;
    let (map, _len): (CoverageMap, usize) =
        bincode::decode_from_slice(&bytes, coverage_bincode_config())?;
    Ok(map)
}

/// Expands seed paths into a sorted list of files.
///
/// Directories are read one level deep; hidden files are skipped. Paths that
/// are neither file nor directory are an error.
pub fn resolve_seed_paths(paths: &[PathBuf]) -> Result<Vec<PathBuf>, StorageError> {
    let mut resolved = Vec::new();
    for path in paths {
        if path.is_file() {
            resolved.push(path.clone());
        } else if path.is_dir() {
            let mut in_dir = Vec::new();
            for entry in fs::read_dir(path).map_err(|e| {
                StorageError::Io(format!("Failed to read seed directory {path:?}: {e}"))
            })? {
                let file_path = entry?.path();
                let hidden = file_path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with('.'));
                if file_path.is_file() && !hidden {
                    in_dir.push(file_path);
                }
            }
            in_dir.sort();
            resolved.extend(in_dir);
        } else {
            return Err(StorageError::Io(format!(
                "Seed path {path:?} is neither a file nor a directory"
            )));
        }
    }
    Ok(resolved)
}

/// Persists the corpus and statistics under one output directory.
///
/// Layout:
/// * `corpus/id_NNNNNN` raw bytes of each saved input
/// * `corpus_index.json` metadata of each saved input
/// * `coverage_hash` human readable coverage listing and digest
/// * `coverage.bin` bincode encoded cumulative coverage
/// * `plot_data` one stats line per refresh
/// * `all/success/id_NNNNNNNNN` every trial, only when enabled
#[derive(Debug)]
pub struct OnDiskStorage {
    output_dir: PathBuf,
    corpus_dir: PathBuf,
    all_inputs_dir: Option<PathBuf>,
    index: BTreeMap<usize, CorpusEntryMetadata>,
}

impl OnDiskStorage {
    const CORPUS_DIR: &'static str = "corpus";
    const INDEX_FILENAME: &'static str = "corpus_index.json";
    const COVERAGE_LISTING: &'static str = "coverage_hash";
    const COVERAGE_STATE: &'static str = "coverage.bin";
    const PLOT_FILENAME: &'static str = "plot_data";

    /// Creates the output tree and removes artifacts of a previous run.
    ///
    /// Only files this storage writes are deleted; the output directory
    /// itself is never removed.
    pub fn prepare(output_dir: &Path, log_all_inputs: bool) -> Result<Self, StorageError> {
        if output_dir.exists() && !output_dir.is_dir() {
            return Err(StorageError::Io(format!(
                "Output path {output_dir:?} exists but is not a directory"
            )));
        }
        let corpus_dir = output_dir.join(Self::CORPUS_DIR);
        fs::create_dir_all(&corpus_dir).map_err(|e| {
            StorageError::Io(format!("Failed to create corpus directory {corpus_dir:?}: {e}"))
        })?;

        for stale in [
            Self::INDEX_FILENAME,
            Self::COVERAGE_LISTING,
            Self::COVERAGE_STATE,
            Self::PLOT_FILENAME,
        ] {
            let path = output_dir.join(stale);
            if path.is_file() {
                fs::remove_file(&path)?;
            }
        }
        for entry in fs::read_dir(&corpus_dir)? {
            let path = entry?.path();
            if path.is_file() {
                fs::remove_file(&path)?;
            }
        }

        let all_inputs_dir = if log_all_inputs {
            let dir = output_dir.join("all").join("success");
            fs::create_dir_all(&dir)?;
            Some(dir)
        } else {
            None
        };

        Ok(Self {
            output_dir: output_dir.to_path_buf(),
            corpus_dir,
            all_inputs_dir,
            index: BTreeMap::new(),
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn corpus_dir(&self) -> &Path {
        &self.corpus_dir
    }

    pub fn coverage_state_path(&self) -> PathBuf {
        self.output_dir.join(Self::COVERAGE_STATE)
    }

    pub fn plot_path(&self) -> PathBuf {
        self.output_dir.join(Self::PLOT_FILENAME)
    }

    pub fn index_path(&self) -> PathBuf {
        self.output_dir.join(Self::INDEX_FILENAME)
    }

    fn save_index(&self) -> Result<(), StorageError> {
        let path = self.index_path();
        let file = File::create(&path)
            .map_err(|e| StorageError::Io(format!("Failed to create index file {path:?}: {e}")))?;
        serde_json::to_writer_pretty(BufWriter::new(file), &self.index)?;
        Ok(())
    }
}

impl CorpusStorage for OnDiskStorage {
    fn persist_input(
        &mut self,
        id: usize,
        bytes: &[u8],
        entry: &CorpusEntryMetadata,
    ) -> Result<PathBuf, StorageError> {
        let path = self.corpus_dir.join(format!("id_{id:06}"));
        fs::write(&path, bytes)
            .map_err(|e| StorageError::Io(format!("Failed to write input file {path:?}: {e}")))?;
        self.index.insert(id, entry.clone());
        self.save_index()?;
        Ok(path)
    }

    fn write_coverage(&mut self, coverage: &CoverageMap) -> Result<(), StorageError> {
        let listing = self.output_dir.join(Self::COVERAGE_LISTING);
        let mut out = BufWriter::new(File::create(&listing)?);
        write!(out, "{coverage}")?;
        let digest: String = coverage.digest().iter().map(|b| format!("{b:02x}")).collect();
        writeln!(out, "Hash: {digest}")?;
        out.flush()?;

        let encoded = bincode::encode_to_vec(coverage, coverage_bincode_config())?;
        fs::write(self.coverage_state_path(), encoded)?;
        Ok(())
    }

    fn append_plot_line(&mut self, line: &str) -> Result<(), StorageError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.plot_path())?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    fn log_trial_input(&mut self, trial: u64, bytes: &[u8]) -> Result<(), StorageError> {
        if let Some(dir) = &self.all_inputs_dir {
            fs::write(dir.join(format!("id_{trial:09}")), bytes)?;
        }
        Ok(())
    }
}

/// Keeps every artifact in memory. Useful for tests and for embedders that
/// persist the corpus elsewhere.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    pub inputs: BTreeMap<usize, (Vec<u8>, CorpusEntryMetadata)>,
    pub coverage: Option<CoverageMap>,
    pub plot_lines: Vec<String>,
    pub logged_trials: Vec<(u64, Vec<u8>)>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CorpusStorage for InMemoryStorage {
    fn persist_input(
        &mut self,
        id: usize,
        bytes: &[u8],
        entry: &CorpusEntryMetadata,
    ) -> Result<PathBuf, StorageError> {
        self.inputs.insert(id, (bytes.to_vec(), entry.clone()));
        Ok(PathBuf::from(format!("id_{id:06}")))
    }

    fn write_coverage(&mut self, coverage: &CoverageMap) -> Result<(), StorageError> {
        self.coverage = Some(coverage.clone());
        Ok(())
    }

    fn append_plot_line(&mut self, line: &str) -> Result<(), StorageError> {
        self.plot_lines.push(line.to_string());
        Ok(())
    }

    fn log_trial_input(&mut self, trial: u64, bytes: &[u8]) -> Result<(), StorageError> {
        self.logged_trials.push((trial, bytes.to_vec()));
        Ok(())
    }
}
