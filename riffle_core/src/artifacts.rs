use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info};
use serde::Serialize;
use thiserror::Error;

use crate::config::FuzzerContext;
use crate::engine::ExecutionResult;
use crate::harness::ExecutionStatus;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("failed to write crash artifact: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize crash report: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Metadata written next to a crashing program.
#[derive(Debug, Serialize)]
pub struct CrashReport {
    pub label: String,
    /// Terminating signal number, when the crash class carries one.
    pub signal: Option<u8>,
    pub exec_time_ms: u64,
    pub unreliable_score: u32,
    pub num_hit_edges: usize,
    /// Seconds since the Unix epoch at recording time.
    pub recorded_at: u64,
}

/// Persists crashing programs under the output directory.
///
/// Each crash gets its own directory named `<label>_<md5-of-program>`,
/// holding the program text, the captured stderr and a JSON report. The
/// hash makes re-finds of the same program land on the same directory,
/// which is treated as already-recorded and skipped.
pub struct CrashSink {
    crash_dir: PathBuf,
}

impl CrashSink {
    pub fn new(ctx: &FuzzerContext) -> Self {
        CrashSink {
            crash_dir: ctx.crash_dir(),
        }
    }

    /// Record a crash, returning the artifact directory, or `None` when
    /// the same program has been recorded before.
    pub fn record(
        &self,
        code: &str,
        result: &ExecutionResult,
    ) -> Result<Option<PathBuf>, ArtifactError> {
        let digest = md5::compute(code.as_bytes());
        let dir = self
            .crash_dir
            .join(format!("{}_{digest:x}", result.status.label()));
        if dir.exists() {
            debug!("Crash {} already recorded, skipping", dir.display());
            return Ok(None);
        }
        fs::create_dir_all(&dir)?;

        let signal = match result.status {
            ExecutionStatus::Crash(signal) => Some(signal),
            _ => None,
        };
        let report = CrashReport {
            label: result.status.label().to_string(),
            signal,
            exec_time_ms: result.exec_time.as_millis() as u64,
            unreliable_score: result.unreliable_score,
            num_hit_edges: result.num_hit_edges,
            recorded_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        };

        fs::write(dir.join("program.js"), code)?;
        fs::write(dir.join("stderr.txt"), &result.stderr)?;
        fs::write(
            dir.join("report.json"),
            serde_json::to_string_pretty(&report)?,
        )?;
        info!("Recorded {} artifact at {}", report.label, dir.display());
        Ok(Some(dir))
    }
}

/// Hashes of files already run through the import pipeline, persisted as
/// JSON under the output directory. A re-import of the same directory
/// skips every file whose hash is recorded, admitted or not; probing a
/// known file again cannot change the outcome.
#[derive(Debug)]
pub struct ImportLedger {
    path: PathBuf,
    hashes: BTreeSet<String>,
}

impl ImportLedger {
    pub fn open(ctx: &FuzzerContext) -> Result<Self, ArtifactError> {
        let path = ctx.import_ledger_path();
        let hashes = if path.exists() {
            serde_json::from_str(&fs::read_to_string(&path)?)?
        } else {
            BTreeSet::new()
        };
        Ok(ImportLedger { path, hashes })
    }

    pub fn contains(&self, text: &str) -> bool {
        self.hashes.contains(&content_hash(text))
    }

    /// Record a processed file and persist the set immediately, so an
    /// interrupted import does not redo finished files.
    pub fn record(&mut self, text: &str) -> Result<(), ArtifactError> {
        if self.hashes.insert(content_hash(text)) {
            fs::write(&self.path, serde_json::to_string_pretty(&self.hashes)?)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}

fn content_hash(text: &str) -> String {
    format!("{:x}", md5::compute(text.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RiffleConfig;
    use std::time::Duration;
    use tempfile::tempdir;

    fn crash_result(signal: u8, stderr: &str) -> ExecutionResult {
        ExecutionResult {
            status: ExecutionStatus::Crash(signal),
            exec_time: Duration::from_millis(12),
            output: String::new(),
            stderr: stderr.to_string(),
            unreliable_score: 0,
            num_new_edges: 0,
            num_hit_edges: 0,
        }
    }

    fn sink(dir: &std::path::Path) -> CrashSink {
        let ctx = FuzzerContext::new(RiffleConfig::default(), dir.to_path_buf());
        ctx.ensure_layout().unwrap();
        CrashSink::new(&ctx)
    }

    #[test]
    fn test_record_writes_program_stderr_and_report() {
        let dir = tempdir().unwrap();
        let sink = sink(dir.path());
        let result = crash_result(11, "Received signal 11 SEGV");

        let artifact = sink.record("boom();", &result).unwrap().unwrap();
        assert!(artifact.starts_with(dir.path().join("crashes")));
        assert!(
            artifact
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("crash_")
        );
        assert_eq!(fs::read_to_string(artifact.join("program.js")).unwrap(), "boom();");
        assert_eq!(
            fs::read_to_string(artifact.join("stderr.txt")).unwrap(),
            "Received signal 11 SEGV"
        );
        let report: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(artifact.join("report.json")).unwrap())
                .unwrap();
        assert_eq!(report["label"], "crash");
        assert_eq!(report["signal"], 11);
        assert_eq!(report["exec_time_ms"], 12);
    }

    #[test]
    fn test_record_skips_already_recorded_program() {
        let dir = tempdir().unwrap();
        let sink = sink(dir.path());
        let result = crash_result(6, "abort");

        assert!(sink.record("boom();", &result).unwrap().is_some());
        assert!(sink.record("boom();", &result).unwrap().is_none());
    }

    #[test]
    fn test_distinct_programs_get_distinct_directories() {
        let dir = tempdir().unwrap();
        let sink = sink(dir.path());
        let result = crash_result(11, "");

        let a = sink.record("a();", &result).unwrap().unwrap();
        let b = sink.record("b();", &result).unwrap().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_import_ledger_round_trips_on_disk() {
        let dir = tempdir().unwrap();
        let ctx = FuzzerContext::new(RiffleConfig::default(), dir.path().to_path_buf());
        ctx.ensure_layout().unwrap();

        let mut ledger = ImportLedger::open(&ctx).unwrap();
        assert!(ledger.is_empty());
        ledger.record("a();").unwrap();
        ledger.record("b();").unwrap();
        // Recording the same content twice keeps a single hash.
        ledger.record("a();").unwrap();
        assert_eq!(ledger.len(), 2);

        let reopened = ImportLedger::open(&ctx).unwrap();
        assert!(reopened.contains("a();"));
        assert!(reopened.contains("b();"));
        assert!(!reopened.contains("c();"));
    }

    #[test]
    fn test_exception_crash_report_has_no_signal() {
        let dir = tempdir().unwrap();
        let sink = sink(dir.path());
        let result = ExecutionResult {
            status: ExecutionStatus::ExceptionCrash,
            exec_time: Duration::from_millis(3),
            output: String::new(),
            stderr: String::new(),
            unreliable_score: 2,
            num_new_edges: 0,
            num_hit_edges: 5,
        };

        let artifact = sink.record("weird();", &result).unwrap().unwrap();
        let report: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(artifact.join("report.json")).unwrap())
                .unwrap();
        assert_eq!(report["label"], "exception_crash");
        assert!(report["signal"].is_null());
        assert_eq!(report["unreliable_score"], 2);
    }
}
