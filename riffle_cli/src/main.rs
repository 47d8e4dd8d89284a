use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::{Context, bail};
use clap::Parser;
use log::{info, warn};
use rand_chacha::ChaCha8Rng;
use rand_core::{RngCore, SeedableRng};

use riffle_core::artifacts::{CrashSink, ImportLedger};
use riffle_core::config::{FuzzerContext, MapVariant, RiffleConfig};
use riffle_core::corpus::Corpus;
use riffle_core::engine::{Engine, ReprlChannel};
use riffle_core::feedback::{self, IdentityStandardizer};
use riffle_core::mutator;
use riffle_core::probe;
use riffle_core::stats::FuzzerStats;
use riffle_core::testcase::Testcase;

/// Built-in first seed when no seed directory is given.
const DEFAULT_SEED: &str = "var v0 = 0;\nfor (var v1 = 0; v1 < 100; v1++) {\nv0 += v1;\n}\nfunction f0(a) { return a + v0; }\nf0(1);";

#[derive(Parser, Debug)]
#[clap(author, version, about = "Coverage-guided JavaScript engine fuzzer", long_about = None)]
struct Cli {
    /// Directory holding the corpus, coverage maps and crash artifacts.
    #[clap(short, long)]
    output_dir: PathBuf,
    #[clap(short, long)]
    config_file: Option<PathBuf>,
    /// Continue from the saved coverage map and corpus in the output
    /// directory.
    #[clap(long)]
    resume: bool,
    /// Directory of seed programs for a first run.
    #[clap(long)]
    seed_dir: Option<PathBuf>,
    /// Run every .js file in a directory through the admission pipeline,
    /// then exit.
    #[clap(long, value_name = "DIR", group = "mode")]
    import: Option<PathBuf>,
    /// Re-minimize every corpus entry against its required edges, then
    /// compact the corpus directory.
    #[clap(long, group = "mode")]
    minimize_corpus: bool,
    /// Re-probe every corpus entry and rewrite its state file.
    #[clap(long, group = "mode")]
    recalculate_states: bool,
    /// Re-measure every corpus entry's expected runtime.
    #[clap(long, group = "mode")]
    recalibrate_runtimes: bool,
    /// Execute a directory of programs and report per-file outcomes.
    #[clap(long, value_name = "DIR", group = "mode")]
    run_testsuite: Option<PathBuf>,
}

fn load_config(explicit: Option<&PathBuf>) -> Result<RiffleConfig, anyhow::Error> {
    if let Some(path) = explicit {
        info!("Loading configuration from {}", path.display());
        return RiffleConfig::load_from_file(path);
    }
    let default_path = PathBuf::from("riffle.toml");
    if default_path.exists() {
        info!("Loading configuration from ./riffle.toml");
        return RiffleConfig::load_from_file(&default_path);
    }
    info!("No configuration file found, using built-in defaults");
    Ok(RiffleConfig::default())
}

/// The `.js` files directly under `dir`, in name order.
fn js_files(dir: &Path) -> Result<Vec<PathBuf>, anyhow::Error> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|e| e == "js") {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// Run a program once through discovery and, when it triggered new
/// coverage, through the full admission pipeline.
fn submit_candidate(
    engine: &mut Engine<ReprlChannel>,
    corpus: &mut Corpus,
    rng: &mut ChaCha8Rng,
    code: &str,
) -> Result<Option<usize>, anyhow::Error> {
    let timeout = engine.default_timeout();
    let pre = engine.backup_coverage();
    let result = engine.execute_safe(code, timeout)?;
    if result.num_new_edges == 0 {
        return Ok(None);
    }
    Ok(feedback::handle_new_file(
        engine,
        corpus,
        rng,
        code,
        &pre,
        &IdentityStandardizer,
    )?)
}

fn import_directory(
    ctx: &FuzzerContext,
    engine: &mut Engine<ReprlChannel>,
    corpus: &mut Corpus,
    rng: &mut ChaCha8Rng,
    dir: &Path,
) -> Result<(), anyhow::Error> {
    let mut ledger = ImportLedger::open(ctx)?;
    info!("Importing from {}", dir.display());
    let summary = feedback::import_directory(
        engine,
        corpus,
        rng,
        dir,
        &mut ledger,
        &IdentityStandardizer,
    )?;
    engine.save_coverage(&ctx.map_path(MapVariant::Final))?;
    info!(
        "Import done: {} admitted, {} already imported, {} rejected",
        summary.admitted, summary.skipped_known, summary.rejected
    );
    Ok(())
}

fn minimize_corpus(
    ctx: &FuzzerContext,
    engine: &mut Engine<ReprlChannel>,
    corpus: &mut Corpus,
    rng: &mut ChaCha8Rng,
) -> Result<(), anyhow::Error> {
    for id in corpus.ids() {
        let Some(entry) = corpus.get(id) else {
            continue;
        };
        let text = entry.testcase.text();
        let edges = entry.required_edges.clone();
        let minimized = feedback::minimize_for_edges(engine, &text, &edges)?;
        if minimized == text {
            continue;
        }
        info!(
            "tc{id}: {} lines down to {}",
            text.lines().count(),
            minimized.lines().count()
        );
        let state = probe::compute_state(engine, &minimized, rng)?;
        let mut testcase = Testcase::from_text(&minimized);
        testcase.state = state;
        corpus.replace_testcase(id, testcase)?;
    }
    let survivors = corpus.compact()?;
    engine.save_coverage(&ctx.map_path(MapVariant::Minimizer))?;
    info!("Corpus minimized and compacted to {survivors} entries");
    Ok(())
}

fn recalculate_states(
    engine: &mut Engine<ReprlChannel>,
    corpus: &mut Corpus,
    rng: &mut ChaCha8Rng,
) -> Result<(), anyhow::Error> {
    for id in corpus.ids() {
        let Some(entry) = corpus.get(id) else {
            continue;
        };
        let text = entry.testcase.text();
        let state = probe::compute_state(engine, &text, rng)?;
        corpus.update_state(id, state)?;
        info!("Recalculated state of tc{id}");
    }
    Ok(())
}

fn recalibrate_runtimes(
    engine: &mut Engine<ReprlChannel>,
    corpus: &mut Corpus,
) -> Result<(), anyhow::Error> {
    for id in corpus.ids() {
        let Some(entry) = corpus.get(id) else {
            continue;
        };
        let text = entry.testcase.text();
        let mut state = entry.testcase.state.clone();
        let previous = state.expected_runtime_ms;
        state.expected_runtime_ms = probe::measure_expected_runtime(engine, &text)?;
        info!(
            "tc{id}: expected runtime {previous}ms -> {}ms",
            state.expected_runtime_ms
        );
        corpus.update_state(id, state)?;
    }
    Ok(())
}

fn run_testsuite(
    ctx: &FuzzerContext,
    engine: &mut Engine<ReprlChannel>,
    dir: &Path,
) -> Result<(), anyhow::Error> {
    let paths = js_files(dir)?;
    let timeout = engine.default_timeout();
    let mut failures = 0usize;
    for path in &paths {
        let text = fs::read_to_string(path)?;
        let result = engine.execute_safe(&text, timeout)?;
        info!(
            "{}: {} in {}ms, {} edges hit",
            path.display(),
            result.status.label(),
            result.exec_time.as_millis(),
            result.num_hit_edges
        );
        if !result.status.is_success() {
            failures += 1;
        }
    }
    engine.save_coverage(&ctx.map_path(MapVariant::Testsuite))?;
    if failures > 0 {
        bail!("{failures} of {} testsuite programs did not succeed", paths.len());
    }
    info!("All {} testsuite programs succeeded", paths.len());
    Ok(())
}

fn fuzz_loop(
    ctx: &FuzzerContext,
    engine: &mut Engine<ReprlChannel>,
    corpus: &mut Corpus,
    rng: &mut ChaCha8Rng,
) -> Result<(), anyhow::Error> {
    let settings = ctx.config.fuzzer.clone();
    let sweep_interval = ctx.config.corpus.sweep_interval;
    let timeout = engine.default_timeout();
    let sink = CrashSink::new(ctx);
    let mut mutators = mutator::default_mutators::<ChaCha8Rng>();
    let mut stats = FuzzerStats::new();

    info!(
        "Fuzzing for {} iterations over {} corpus entries",
        settings.max_iterations,
        corpus.len()
    );
    for iteration in 1..=settings.max_iterations {
        let pre = engine.backup_coverage();
        let (source_id, mut candidate) = {
            let Some(entry) = corpus.random_select(rng) else {
                bail!("corpus is empty; seed it with --import or a seed directory");
            };
            (entry.id, entry.testcase.clone())
        };

        let stacked = 1 + rng.next_u64() % settings.mutations_per_round.max(1) as u64;
        let mut applied = 0usize;
        for _ in 0..stacked {
            if mutator::apply_random_mutation(&mut mutators, &mut candidate, rng, Some(&*corpus))?
                .is_some()
            {
                applied += 1;
            }
        }
        if applied == 0 {
            stats.record_no_target();
            continue;
        }

        let code = candidate.text();
        let result = engine.execute_safe(&code, timeout)?;
        stats.record_status(&result.status);
        corpus.record_outcome(source_id, &result.status);

        if result.status.is_crash() {
            sink.record(&code, &result)?;
        }
        if result.num_new_edges > 0
            && feedback::handle_new_file(engine, corpus, rng, &code, &pre, &IdentityStandardizer)?
                .is_some()
        {
            stats.record_admission();
            pre.save(&ctx.map_path(MapVariant::Previous))?;
        }

        if iteration % sweep_interval == 0 {
            let dropped = corpus.sweep_disabled()?;
            stats.record_disabled(dropped.len());
        }
        if iteration % settings.save_interval == 0 {
            engine.save_coverage(&ctx.map_path(MapVariant::Final))?;
        }
        stats.maybe_report(corpus.len(), engine.coverage().triggered_count());
    }

    engine.save_coverage(&ctx.map_path(MapVariant::Final))?;
    info!(
        "Done: {} iterations, {} admissions, {} crashes, {:.1} iterations/s",
        stats.total_iterations,
        stats.corpus_admissions,
        stats.crashes,
        stats.iterations_per_second()
    );
    Ok(())
}

fn main() -> Result<(), anyhow::Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let config = load_config(cli.config_file.as_ref())?;
    let ctx = FuzzerContext::new(config, cli.output_dir.clone());
    ctx.ensure_layout()?;

    let seed = ctx.config.fuzzer.seed.unwrap_or_else(|| {
        std::time::SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    });
    info!("RNG seed {seed}");
    let mut rng = ChaCha8Rng::seed_from_u64(seed);

    let channel = ReprlChannel::new(&ctx.config.engine)?;
    let mut engine = Engine::initialize(channel, &ctx.config.engine)?;

    let final_map = ctx.map_path(MapVariant::Final);
    if cli.resume {
        engine
            .load_coverage(&final_map)
            .with_context(|| format!("resuming from {}", final_map.display()))?;
    } else if final_map.exists() {
        warn!(
            "{} exists but --resume was not given; starting from a fresh map",
            final_map.display()
        );
    }
    engine.calibrate()?;

    let mut corpus = Corpus::open(&ctx)?;
    if !cli.resume && !corpus.is_empty() {
        warn!(
            "Output directory already holds {} corpus entries, reusing them",
            corpus.len()
        );
    }

    if let Some(dir) = cli.import.as_deref() {
        return import_directory(&ctx, &mut engine, &mut corpus, &mut rng, dir);
    }
    if cli.minimize_corpus {
        return minimize_corpus(&ctx, &mut engine, &mut corpus, &mut rng);
    }
    if cli.recalculate_states {
        return recalculate_states(&mut engine, &mut corpus, &mut rng);
    }
    if cli.recalibrate_runtimes {
        return recalibrate_runtimes(&mut engine, &mut corpus);
    }
    if let Some(dir) = cli.run_testsuite.as_deref() {
        return run_testsuite(&ctx, &mut engine, dir);
    }

    if corpus.is_empty() {
        match cli.seed_dir.as_deref() {
            Some(dir) => import_directory(&ctx, &mut engine, &mut corpus, &mut rng, dir)?,
            None => {
                info!("Empty corpus, bootstrapping from the built-in seed");
                if submit_candidate(&mut engine, &mut corpus, &mut rng, DEFAULT_SEED)?.is_none() {
                    bail!("the built-in seed produced no coverage; is the target instrumented?");
                }
            }
        }
    }

    fuzz_loop(&ctx, &mut engine, &mut corpus, &mut rng)
}
