use crate::coverage::CoverageMap;
use crate::input::{FuzzInput, InputError, NextByte};
use std::io::{self, Read};
use std::panic::{AssertUnwindSafe, catch_unwind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// The target accepted the input.
    Valid,
    /// The target rejected the input.
    Invalid,
    Crash(String),
}

/// Result of running the target once.
#[derive(Debug, Clone)]
pub struct Execution {
    pub status: ExecutionStatus,
    /// Coverage recorded during this run only.
    pub coverage: CoverageMap,
}

impl Execution {
    /// Crashes count as invalid runs.
    pub fn is_valid(&self) -> bool {
        self.status == ExecutionStatus::Valid
    }
}

/// Feeds the bytes of one input to the target in strict sequential order.
///
/// The stream owns the index it asks for, so a target reading through it can
/// never break the ordering contract of the input.
#[derive(Debug)]
pub struct ParameterStream {
    input: FuzzInput,
    index: usize,
    exhausted: bool,
}

impl ParameterStream {
    pub fn new(input: FuzzInput) -> Self {
        Self {
            input,
            index: 0,
            exhausted: false,
        }
    }

    /// The next byte, or `None` once the input signals end of stream.
    pub fn next_byte(&mut self) -> Result<Option<u8>, InputError> {
        if self.exhausted {
            return Ok(None);
        }
        match self.input.next(self.index)? {
            NextByte::Byte(b) => {
                self.index += 1;
                Ok(Some(b))
            }
            NextByte::Eof => {
                self.exhausted = true;
                Ok(None)
            }
        }
    }

    /// Bytes handed to the target so far.
    pub fn consumed(&self) -> usize {
        self.index
    }

    pub fn into_input(self) -> FuzzInput {
        self.input
    }
}

impl Read for ParameterStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.next_byte().map_err(io::Error::other)? {
                Some(b) => {
                    buf[filled] = b;
                    filled += 1;
                }
                None => break,
            }
        }
        Ok(filled)
    }
}

pub trait Executor {
    /// Runs the target on `input` and hands the input back with the outcome.
    fn execute(&mut self, input: FuzzInput) -> (FuzzInput, Execution);
}

/// Runs a harness closure in the current process.
///
/// The harness reads its input from the [`ParameterStream`], records hits in
/// the fresh [`CoverageMap`], and returns whether the input was valid. A
/// panic in the harness is reported as [`ExecutionStatus::Crash`].
pub struct InProcessExecutor<F>
where
    F: Fn(&mut ParameterStream, &mut CoverageMap) -> bool,
{
    harness_fn: F,
    map_size: usize,
}

impl<F> InProcessExecutor<F>
where
    F: Fn(&mut ParameterStream, &mut CoverageMap) -> bool,
{
    pub fn new(harness_fn: F, map_size: usize) -> Self {
        Self {
            harness_fn,
            map_size,
        }
    }
}

impl<F> Executor for InProcessExecutor<F>
where
    F: Fn(&mut ParameterStream, &mut CoverageMap) -> bool,
{
    fn execute(&mut self, input: FuzzInput) -> (FuzzInput, Execution) {
        let mut stream = ParameterStream::new(input);
        let mut coverage = CoverageMap::new(self.map_size);

        let result = catch_unwind(AssertUnwindSafe(|| {
            (self.harness_fn)(&mut stream, &mut coverage)
        }));

        let status = match result {
            Ok(true) => ExecutionStatus::Valid,
            Ok(false) => ExecutionStatus::Invalid,
            Err(panic_payload) => {
                let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic type".to_string()
                };
                ExecutionStatus::Crash(msg)
            }
        };

        (stream.into_input(), Execution { status, coverage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{GeneratedInput, GenerationLimits, SeedInput};
    use std::io::Cursor;

    fn generated(bytes: &[u8]) -> FuzzInput {
        FuzzInput::generated(
            GeneratedInput::from_bytes(bytes.to_vec(), GenerationLimits::default(), 0),
            "random".to_string(),
        )
    }

    fn magic_harness(stream: &mut ParameterStream, coverage: &mut CoverageMap) -> bool {
        let mut prefix = Vec::new();
        while let Ok(Some(b)) = stream.next_byte() {
            coverage.record_hit(prefix.len());
            prefix.push(b);
            if prefix.len() == 3 {
                break;
            }
        }
        if prefix == b"BAD" {
            panic!("Boom!");
        }
        prefix.first() == Some(&b'A')
    }

    #[test]
    fn stream_reads_bytes_in_order_until_eof() {
        let mut stream = ParameterStream::new(generated(&[7, 8]));
        assert_eq!(stream.next_byte().unwrap(), Some(7));
        assert_eq!(stream.next_byte().unwrap(), Some(8));
        assert_eq!(stream.next_byte().unwrap(), None);
        assert_eq!(stream.next_byte().unwrap(), None);
        assert_eq!(stream.consumed(), 2);
        assert_eq!(stream.into_input().requested(), 2);
    }

    #[test]
    fn stream_implements_read() {
        let seed = FuzzInput::seed(SeedInput::from_reader("mem", Cursor::new(b"hello".to_vec())));
        let mut stream = ParameterStream::new(seed);
        let mut text = String::new();
        stream.read_to_string(&mut text).unwrap();
        assert_eq!(text, "hello");
    }

    #[test]
    fn executor_reports_validity_and_coverage() {
        let mut executor = InProcessExecutor::new(magic_harness, 16);

        let (input, execution) = executor.execute(generated(b"ABCDEF"));
        assert!(execution.is_valid());
        assert_eq!(execution.coverage.non_zero_count(), 3);
        assert_eq!(input.requested(), 3);

        let (_, execution) = executor.execute(generated(b"ZZ"));
        assert_eq!(execution.status, ExecutionStatus::Invalid);
        assert_eq!(execution.coverage.non_zero_count(), 2);
    }

    #[test]
    fn executor_catches_panic() {
        let mut executor = InProcessExecutor::new(magic_harness, 16);
        let (input, execution) = executor.execute(generated(b"BAD!"));
        match &execution.status {
            ExecutionStatus::Crash(msg) => assert!(msg.contains("Boom!")),
            other => panic!("Expected a crash, got {other:?}"),
        }
        assert!(!execution.is_valid());
        assert_eq!(input.requested(), 3, "input survives the panic");
    }
}
