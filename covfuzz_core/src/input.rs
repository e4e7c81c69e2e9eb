use crate::coverage::CoverageMap;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::collections::BTreeSet;
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised by the byte pull protocol and by post-run trimming.
#[derive(Error, Debug)]
pub enum InputError {
    /// A seed received a request for an index other than the next unread one
    /// while its source still had bytes. This is a harness bug, not a data problem.
    #[error("Bytes from seed out of order: expected index {expected}, got {requested}")]
    OutOfOrder { expected: usize, requested: usize },

    /// Opening, reading or closing the seed source failed.
    #[error("Seed source I/O error: {0}")]
    Io(#[from] io::Error),

    /// Nothing was requested from the input, so trimming left it empty.
    #[error("Input is empty after trimming; nothing was requested from the generator")]
    EmptyAfterTrim,
}

/// Result of one pull from an input: a byte, or end-of-stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextByte {
    Byte(u8),
    Eof,
}

impl NextByte {
    pub fn byte(self) -> Option<u8> {
        match self {
            NextByte::Byte(b) => Some(b),
            NextByte::Eof => None,
        }
    }
}

/// The lazy, replayable byte source consumed by the program under test.
///
/// Callers must request indices strictly in order starting at 0. Both variants
/// keep the materialized bytes in a backing buffer and count how many of them
/// the last execution actually pulled.
pub trait ByteStream {
    /// Returns the byte at `index`, materializing it if the variant allows.
    ///
    /// # Arguments
    /// * `index`: The position requested by the target. Must equal the number of
    ///   bytes already handed out.
    ///
    /// # Returns
    /// A `Result` containing the byte, or `NextByte::Eof` once the stream is
    /// exhausted. Generated inputs answer an out-of-order index with EOF; seeds
    /// fail with `InputError::OutOfOrder` while their source still has bytes.
    fn next(&mut self, index: usize) -> Result<NextByte, InputError>;

    /// Truncates the backing buffer to the bytes pulled by the last execution.
    ///
    /// # Returns
    /// A `Result` indicating success, or `InputError::EmptyAfterTrim` if the last
    /// execution pulled no bytes at all.
    fn trim(&mut self) -> Result<(), InputError>;

    fn as_bytes(&self) -> &[u8];

    /// Number of bytes handed out so far.
    fn requested(&self) -> usize;

    fn len(&self) -> usize {
        self.as_bytes().len()
    }

    fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

fn truncate_to_requested(values: &mut Vec<u8>, requested: usize) -> Result<(), InputError> {
    values.truncate(requested);
    values.shrink_to_fit();
    if values.is_empty() {
        return Err(InputError::EmptyAfterTrim);
    }
    Ok(())
}

/// Limits applied to freshly generated bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationLimits {
    /// No byte is handed out at or beyond this index.
    pub max_input_size: usize,
    /// Return EOF instead of inventing bytes past the materialized buffer.
    pub eof_when_exhausted: bool,
}

impl Default for GenerationLimits {
    fn default() -> Self {
        Self {
            max_input_size: 10240,
            eof_when_exhausted: true,
        }
    }
}

/// Bytes replayed from a buffer and, past its end, either EOF or fresh random bytes.
///
/// Each instance owns a PRNG seeded from the engine, so fresh bytes are
/// reproducible for a given engine seed.
#[derive(Debug, Clone)]
pub struct GeneratedInput {
    values: Vec<u8>,
    requested: usize,
    limits: GenerationLimits,
    rng: ChaCha8Rng,
}

impl GeneratedInput {
    /// An input with nothing materialized yet.
    pub fn new(limits: GenerationLimits, rng_seed: u64) -> Self {
        Self::from_bytes(Vec::new(), limits, rng_seed)
    }

    /// An input that replays `values` before generating anything new.
    pub fn from_bytes(values: Vec<u8>, limits: GenerationLimits, rng_seed: u64) -> Self {
        Self {
            values,
            requested: 0,
            limits,
            rng: ChaCha8Rng::seed_from_u64(rng_seed),
        }
    }

    pub fn limits(&self) -> GenerationLimits {
        self.limits
    }
}

impl ByteStream for GeneratedInput {
    fn next(&mut self, index: usize) -> Result<NextByte, InputError> {
        if index != self.requested || self.requested >= self.limits.max_input_size {
            return Ok(NextByte::Eof);
        }
        if let Some(&value) = self.values.get(index) {
            self.requested += 1;
            return Ok(NextByte::Byte(value));
        }
        if self.limits.eof_when_exhausted {
            return Ok(NextByte::Eof);
        }
        let value: u8 = self.rng.random();
        self.values.push(value);
        self.requested += 1;
        Ok(NextByte::Byte(value))
    }

    fn trim(&mut self) -> Result<(), InputError> {
        truncate_to_requested(&mut self.values, self.requested)
    }

    fn as_bytes(&self) -> &[u8] {
        &self.values
    }

    fn requested(&self) -> usize {
        self.requested
    }
}

/// Bytes pulled in order from an external source such as a seed file.
///
/// Once the source is exhausted every further request yields EOF and the
/// source is never read again.
pub struct SeedInput {
    origin: PathBuf,
    values: Vec<u8>,
    requested: usize,
    source: Option<Box<dyn Read + Send>>,
    exhausted: bool,
}

impl SeedInput {
    /// Opens `path` once; bytes are read lazily as the target pulls them.
    pub fn open(path: &Path) -> Result<Self, InputError> {
        let file = File::open(path)?;
        Ok(Self::from_reader(path, BufReader::new(file)))
    }

    /// Wraps an already-open byte source. `origin` is only used for display.
    pub fn from_reader<R: Read + Send + 'static>(origin: impl Into<PathBuf>, reader: R) -> Self {
        Self {
            origin: origin.into(),
            values: Vec::new(),
            requested: 0,
            source: Some(Box::new(reader)),
            exhausted: false,
        }
    }

    pub fn origin(&self) -> &Path {
        &self.origin
    }

    /// Whether the underlying source is still held open.
    pub fn is_open(&self) -> bool {
        self.source.is_some()
    }

    fn read_one(&mut self) -> Result<Option<u8>, InputError> {
        let Some(source) = self.source.as_mut() else {
            return Ok(None);
        };
        let mut buf = [0u8; 1];
        loop {
            match source.read(&mut buf) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(buf[0])),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(InputError::Io(e)),
            }
        }
    }
}

impl ByteStream for SeedInput {
    fn next(&mut self, index: usize) -> Result<NextByte, InputError> {
        if self.exhausted {
            return Ok(NextByte::Eof);
        }
        let Some(value) = self.read_one()? else {
            self.exhausted = true;
            return Ok(NextByte::Eof);
        };
        if index != self.values.len() {
            return Err(InputError::OutOfOrder {
                expected: self.values.len(),
                requested: index,
            });
        }
        self.values.push(value);
        self.requested += 1;
        Ok(NextByte::Byte(value))
    }

    fn trim(&mut self) -> Result<(), InputError> {
        self.source = None;
        self.exhausted = true;
        truncate_to_requested(&mut self.values, self.requested)
    }

    fn as_bytes(&self) -> &[u8] {
        &self.values
    }

    fn requested(&self) -> usize {
        self.requested
    }
}

impl fmt::Debug for SeedInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeedInput")
            .field("origin", &self.origin)
            .field("len", &self.values.len())
            .field("requested", &self.requested)
            .field("open", &self.source.is_some())
            .finish()
    }
}

/// Bookkeeping shared by every input variant.
///
/// Fields documented as "once saved" stay `None` until the engine keeps the
/// input in its corpus.
#[derive(Debug, Clone, Default)]
pub struct InputMeta {
    /// Provenance, e.g. `random`, `seed`, `src:000004,havoc:3`.
    pub description: String,
    /// Per-run coverage snapshot, once saved.
    pub coverage: Option<CoverageMap>,
    /// Validity reported for the last execution.
    pub valid: bool,
    pub favored: bool,
    /// Coverage points this input currently owns, once saved.
    pub responsibilities: Option<BTreeSet<usize>>,
    /// Corpus identifier, once saved.
    pub id: Option<usize>,
    /// Storage slot, once saved.
    pub save_path: Option<PathBuf>,
    /// Cached non-zero count of `coverage`, once saved.
    pub non_zero_coverage: Option<usize>,
    /// Children derived from this input that were themselves saved.
    pub offspring: usize,
    /// Corpus id of the input this one was derived from.
    pub parent: Option<usize>,
}

#[derive(Debug)]
enum InputKind {
    Generated(GeneratedInput),
    Seed(SeedInput),
}

/// One candidate byte sequence together with its bookkeeping.
#[derive(Debug)]
pub struct FuzzInput {
    pub meta: InputMeta,
    kind: InputKind,
}

impl FuzzInput {
    /// An empty generated input, spawned when there is no corpus to mutate.
    pub fn fresh(limits: GenerationLimits, rng_seed: u64) -> Self {
        Self::generated(GeneratedInput::new(limits, rng_seed), "random".to_string())
    }

    pub fn generated(input: GeneratedInput, description: String) -> Self {
        Self {
            meta: InputMeta {
                description,
                valid: true,
                ..InputMeta::default()
            },
            kind: InputKind::Generated(input),
        }
    }

    pub fn seed(input: SeedInput) -> Self {
        Self {
            meta: InputMeta {
                description: "seed".to_string(),
                valid: true,
                ..InputMeta::default()
            },
            kind: InputKind::Seed(input),
        }
    }

    /// Opens a seed file as an input.
    pub fn open_seed(path: &Path) -> Result<Self, InputError> {
        SeedInput::open(path).map(Self::seed)
    }

    pub fn is_seed(&self) -> bool {
        matches!(self.kind, InputKind::Seed(_))
    }

    pub fn id(&self) -> Option<usize> {
        self.meta.id
    }

    pub fn is_favored(&self) -> bool {
        self.meta.favored
    }

    pub fn responsibility_count(&self) -> usize {
        self.meta.responsibilities.as_ref().map_or(0, BTreeSet::len)
    }

    fn stream(&self) -> &dyn ByteStream {
        match &self.kind {
            InputKind::Generated(g) => g,
            InputKind::Seed(s) => s,
        }
    }

    fn stream_mut(&mut self) -> &mut dyn ByteStream {
        match &mut self.kind {
            InputKind::Generated(g) => g,
            InputKind::Seed(s) => s,
        }
    }

    pub fn next(&mut self, index: usize) -> Result<NextByte, InputError> {
        self.stream_mut().next(index)
    }

    pub fn trim(&mut self) -> Result<(), InputError> {
        self.stream_mut().trim()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.stream().as_bytes()
    }

    pub fn requested(&self) -> usize {
        self.stream().requested()
    }

    pub fn len(&self) -> usize {
        self.stream().len()
    }

    pub fn is_empty(&self) -> bool {
        self.stream().is_empty()
    }
}
