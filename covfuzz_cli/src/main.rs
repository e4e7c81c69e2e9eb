use covfuzz_core::config::CovfuzzConfig;
use covfuzz_core::coverage::CoverageMap;
use covfuzz_core::executor::{Executor, InProcessExecutor, ParameterStream};
use covfuzz_core::guidance::{CorpusGuidance, GuidanceError, TrialOutcome};
use covfuzz_core::input::{FuzzInput, InputError, SeedInput};
use covfuzz_core::shared::SharedGuidance;
use covfuzz_core::storage::OnDiskStorage;

use clap::Parser;
use log::{info, warn};
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::io::Cursor;
use std::path::PathBuf;
use std::thread;
use std::time::Instant;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    #[clap(short = 'n', long)]
    max_trials: Option<u64>,
    #[clap(short = 'd', long)]
    max_duration_secs: Option<u64>,
    #[clap(short, long, value_parser)]
    output_dir: Option<PathBuf>,
    /// Seed files or directories; replaces the configured seed paths.
    #[clap(short, long, value_parser)]
    seed: Vec<PathBuf>,
    #[clap(short, long)]
    threads: Option<usize>,
    #[clap(long)]
    rng_seed: Option<u64>,
}

type Engine = CorpusGuidance<OnDiskStorage, ChaCha8Rng>;

const DEFAULT_SEED: &[u8] = b"FUZZ\x04abcd";
const MAGIC: &[u8] = b"FUZZ";

/// Demonstration target: a magic header, a length byte, then a body whose
/// xor checksum selects the final branch.
fn demo_harness(stream: &mut ParameterStream, coverage: &mut CoverageMap) -> bool {
    for (depth, &expected) in MAGIC.iter().enumerate() {
        match stream.next_byte() {
            Ok(Some(b)) if b == expected => coverage.record_hit(depth),
            Ok(Some(_)) => {
                coverage.record_hit(8 + depth);
                return false;
            }
            _ => {
                coverage.record_hit(16 + depth);
                return false;
            }
        }
    }

    let Ok(Some(len)) = stream.next_byte() else {
        coverage.record_hit(24);
        return false;
    };
    if len == 0xFF {
        panic!("length byte 0xFF is reserved");
    }
    coverage.record_hit(32 + usize::from(len % 16));

    let mut checksum = 0u8;
    for _ in 0..len {
        match stream.next_byte() {
            Ok(Some(b)) => {
                checksum ^= b;
                coverage.record_hit(64 + usize::from(b));
            }
            _ => {
                coverage.record_hit(25);
                return false;
            }
        }
    }
    coverage.record_hit(320 + usize::from(checksum % 32));
    true
}

/// Errors that only cost the current trial.
fn is_trial_error(err: &GuidanceError) -> bool {
    matches!(
        err,
        GuidanceError::Input(InputError::EmptyAfterTrim | InputError::OutOfOrder { .. })
    )
}

fn log_outcome(result: Result<TrialOutcome, GuidanceError>) -> Result<(), GuidanceError> {
    match result {
        Ok(_) => Ok(()),
        Err(err) if is_trial_error(&err) => {
            warn!("Trial aborted: {err}");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

fn fuzz_single(mut guidance: Engine, map_size: usize) -> Result<Engine, GuidanceError> {
    let mut executor = InProcessExecutor::new(demo_harness, map_size);
    while guidance.has_input() {
        let input = guidance.next_input()?;
        let (input, execution) = executor.execute(input);
        log_outcome(guidance.report_result(input, &execution.coverage, execution.is_valid()))?;
    }
    Ok(guidance)
}

fn fuzz_parallel(
    shared: SharedGuidance<OnDiskStorage, ChaCha8Rng>,
    threads: usize,
    map_size: usize,
) -> Result<(), anyhow::Error> {
    let workers: Vec<_> = (0..threads)
        .map(|worker| {
            let shared = shared.clone();
            thread::Builder::new()
                .name(format!("worker-{worker}"))
                .spawn(move || -> Result<(), GuidanceError> {
                    let mut executor = InProcessExecutor::new(demo_harness, map_size);
                    while shared.has_input()? {
                        let input = shared.next_input()?;
                        let (input, execution) = executor.execute(input);
                        log_outcome(shared.report_result(
                            input,
                            &execution.coverage,
                            execution.is_valid(),
                        ))?;
                    }
                    Ok(())
                })
        })
        .collect::<Result<_, _>>()?;

    for worker in workers {
        worker
            .join()
            .map_err(|_| anyhow::anyhow!("Worker thread panicked"))??;
    }
    Ok(())
}

fn main() -> Result<(), anyhow::Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut config = match cli.config_file {
        Some(config_path) => {
            info!("Loading configuration from specified path: {config_path:?}");
            CovfuzzConfig::load_from_file(&config_path)?
        }
        None => {
            let default_config_path = PathBuf::from("covfuzz.toml");
            if default_config_path.exists() {
                info!("No config file specified via CLI, loading default: {default_config_path:?}");
                CovfuzzConfig::load_from_file(&default_config_path)?
            } else {
                info!("No config file specified and default 'covfuzz.toml' not found, using built-in defaults.");
                CovfuzzConfig::default()
            }
        }
    };

    if let Some(max_trials) = cli.max_trials {
        config.fuzzer.max_trials = Some(max_trials);
    }
    if let Some(secs) = cli.max_duration_secs {
        config.fuzzer.max_duration_secs = Some(secs);
    }
    if let Some(output_dir) = cli.output_dir {
        config.corpus.output_dir = output_dir;
    }
    if !cli.seed.is_empty() {
        config.corpus.seed_paths = cli.seed;
    }
    if let Some(threads) = cli.threads {
        config.fuzzer.threads = threads;
    }
    if let Some(rng_seed) = cli.rng_seed {
        config.fuzzer.rng_seed = Some(rng_seed);
    }
    let threads = config.fuzzer.threads.max(1);
    if threads > 1 {
        config.guidance.multithreaded = true;
    }
    if config.fuzzer.max_trials.is_none() && config.fuzzer.max_duration_secs.is_none() {
        warn!("No trial or time limit configured; fuzzing until interrupted");
    }

    info!("Effective configuration: {config:#?}");

    let rng_seed = config.fuzzer.rng_seed.unwrap_or_else(rand::random);
    info!("PRNG seed: {rng_seed}");
    let rng = ChaCha8Rng::seed_from_u64(rng_seed);

    let storage = OnDiskStorage::prepare(&config.corpus.output_dir, config.corpus.log_all_inputs)?;
    let mut guidance = CorpusGuidance::from_config(&config, storage, rng)?;

    let queued = guidance.add_seed_paths(&config.corpus.seed_paths)?;
    if queued == 0 {
        info!("No seed inputs found, starting from the built-in seed");
        guidance.add_seed(FuzzInput::seed(SeedInput::from_reader(
            "<builtin>",
            Cursor::new(DEFAULT_SEED.to_vec()),
        )));
    } else {
        info!("Queued {queued} seed inputs");
    }

    let map_size = config.guidance.coverage_map_size;
    info!(
        "Starting fuzz loop with {threads} thread(s), results in {:?}",
        config.corpus.output_dir
    );
    let start_time = Instant::now();

    let stats = if threads > 1 {
        let shared = SharedGuidance::new(guidance);
        fuzz_parallel(shared.clone(), threads, map_size)?;
        shared.display_stats(true)?;
        shared.stats()?
    } else {
        let mut guidance = fuzz_single(guidance, map_size)?;
        guidance.display_stats(true)?;
        guidance.stats()
    };

    let elapsed_total = start_time.elapsed();
    println!("\nFuzz loop finished in {elapsed_total:.2?}.");
    println!("{stats}");

    Ok(())
}
