use serde::Deserialize;
use std::path::PathBuf;

use crate::harness::HarnessProfile;

fn default_engine_command() -> String {
    "./d8".to_string()
}

fn default_engine_args() -> Vec<String> {
    vec!["--fuzzing".to_string()]
}

fn default_timeout_ms() -> u64 {
    2000
}

fn default_restart_threshold() -> u32 {
    100
}

/// Child-engine settings: what to spawn and how patient to be with it.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Path to the instrumented engine binary.
    #[serde(default = "default_engine_command")]
    pub command: String,
    /// Arguments passed on every spawn.
    #[serde(default = "default_engine_args")]
    pub args: Vec<String>,
    /// Per-execution timeout in milliseconds. Query executions get a fixed
    /// multiplier on top of this.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Executions after which the child is proactively restarted to bound
    /// state leakage between runs.
    #[serde(default = "default_restart_threshold")]
    pub restart_threshold: u32,
    /// Status-word table and channel names for the harness build in use.
    #[serde(default)]
    pub harness: HarnessProfile,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: default_engine_command(),
            args: default_engine_args(),
            timeout_ms: default_timeout_ms(),
            restart_threshold: default_restart_threshold(),
            harness: HarnessProfile::default(),
        }
    }
}

fn default_max_expected_runtime_ms() -> u64 {
    500
}

fn default_min_uses_before_disable() -> u64 {
    10
}

fn default_max_exception_rate() -> f64 {
    0.75
}

fn default_max_hang_rate() -> f64 {
    0.31
}

fn default_sweep_interval() -> u64 {
    5000
}

fn default_forbidden_fragments() -> Vec<String> {
    vec!["Worker".to_string(), "WebAssembly".to_string()]
}

/// Corpus admission and retention policy.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CorpusConfig {
    /// Entries whose expected runtime exceeds this are never admitted.
    #[serde(default = "default_max_expected_runtime_ms")]
    pub max_expected_runtime_ms: u64,
    /// Minimum uses as a mutation ingredient before the disablement rates
    /// apply to an entry.
    #[serde(default = "default_min_uses_before_disable")]
    pub min_uses_before_disable: u64,
    /// Exception-rate ceiling; above it an entry is permanently disabled.
    #[serde(default = "default_max_exception_rate")]
    pub max_exception_rate: f64,
    /// Hang-rate ceiling; above it an entry is permanently disabled.
    #[serde(default = "default_max_hang_rate")]
    pub max_hang_rate: f64,
    /// Executions between disablement sweeps.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: u64,
    /// Source fragments the generic mutation engine must not be fed
    /// (worker spawning, wasm byte-array programs).
    #[serde(default = "default_forbidden_fragments")]
    pub forbidden_fragments: Vec<String>,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            max_expected_runtime_ms: default_max_expected_runtime_ms(),
            min_uses_before_disable: default_min_uses_before_disable(),
            max_exception_rate: default_max_exception_rate(),
            max_hang_rate: default_max_hang_rate(),
            sweep_interval: default_sweep_interval(),
            forbidden_fragments: default_forbidden_fragments(),
        }
    }
}

fn default_iterations() -> u64 {
    1_000_000
}

fn default_save_interval() -> u64 {
    1000
}

fn default_mutations_per_round() -> u32 {
    3
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    /// Total fuzzing iterations before a clean exit.
    #[serde(default = "default_iterations")]
    pub max_iterations: u64,
    /// RNG seed; absent means seed from entropy.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Iterations between coverage-map saves and statistics lines.
    #[serde(default = "default_save_interval")]
    pub save_interval: u64,
    /// Upper bound on mutations stacked onto one candidate per iteration.
    #[serde(default = "default_mutations_per_round")]
    pub mutations_per_round: u32,
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            max_iterations: default_iterations(),
            seed: None,
            save_interval: default_save_interval(),
            mutations_per_round: default_mutations_per_round(),
        }
    }
}

/// Root configuration, loaded from a TOML file or defaulted.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct RiffleConfig {
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub corpus: CorpusConfig,
}

impl RiffleConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: RiffleConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }
}

/// Which logical snapshot a coverage-map file on disk holds. All variants
/// share one raw format and differ only in what they mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapVariant {
    /// The live map as of the last save.
    Final,
    /// The map as it stood before the most recent admission.
    Previous,
    /// Scratch variant used by corpus-minimization runs.
    Minimizer,
    /// Scratch variant used by testsuite runs.
    Testsuite,
}

impl MapVariant {
    fn file_name(&self) -> &'static str {
        match self {
            MapVariant::Final => "coverage_final.bin",
            MapVariant::Previous => "coverage_previous.bin",
            MapVariant::Minimizer => "coverage_minimizer.bin",
            MapVariant::Testsuite => "coverage_testsuite.bin",
        }
    }
}

/// Everything the components need to know about this fuzzer instance:
/// parsed configuration plus the resolved output-directory paths. Built
/// once at startup and passed by reference to every constructor; there is
/// no global configuration state anywhere.
#[derive(Debug, Clone)]
pub struct FuzzerContext {
    pub config: RiffleConfig,
    pub output_dir: PathBuf,
}

impl FuzzerContext {
    pub fn new(config: RiffleConfig, output_dir: PathBuf) -> Self {
        FuzzerContext { config, output_dir }
    }

    pub fn corpus_dir(&self) -> PathBuf {
        self.output_dir.join("corpus")
    }

    pub fn crash_dir(&self) -> PathBuf {
        self.output_dir.join("crashes")
    }

    /// Fixed path of the permanently-disabled-filenames set.
    pub fn disabled_set_path(&self) -> PathBuf {
        self.output_dir.join("disabled_testcases.json")
    }

    /// Fixed path of the already-imported-file hash set.
    pub fn import_ledger_path(&self) -> PathBuf {
        self.output_dir.join("imported_hashes.json")
    }

    pub fn map_path(&self, variant: MapVariant) -> PathBuf {
        self.output_dir.join(variant.file_name())
    }

    /// Create the output directory tree if it is not there yet.
    pub fn ensure_layout(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.output_dir)?;
        std::fs::create_dir_all(self.corpus_dir())?;
        std::fs::create_dir_all(self.crash_dir())?;
        Ok(())
    }
}
