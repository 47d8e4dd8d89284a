use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use rand::Rng;
use thiserror::Error;

use crate::artifacts::{ArtifactError, ImportLedger};
use crate::corpus::{Corpus, CorpusError};
use crate::coverage::CoverageSnapshot;
use crate::engine::{Engine, EngineChannel, EngineError};
use crate::probe;
use crate::testcase::Testcase;

/// Reproduction runs granted to a candidate before it is dismissed as a
/// one-off.
const REPRODUCTION_ATTEMPTS: usize = 2;

/// Re-runs in the per-edge reliability filter.
const RELIABILITY_ITERATIONS: usize = 4;

/// Below this many lines the chunked minimization pass is skipped and
/// only single lines are tried.
const FAST_MINIMIZE_MIN_LINES: usize = 4;

#[derive(Debug, Error)]
pub enum FeedbackError {
    #[error("engine failure during admission: {0}")]
    Engine(#[from] EngineError),
    #[error("corpus failure during admission: {0}")]
    Corpus(#[from] CorpusError),
    #[error("import I/O failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("import ledger failure: {0}")]
    Ledger(#[from] ArtifactError),
}

/// Rewrites a candidate into a canonical form between the minimization
/// passes. The rewritten text is only kept when it still reaches every
/// claimed edge, so an implementation is free to be aggressive.
pub trait Standardizer {
    fn standardize(&self, text: &str) -> String;
}

/// The default standardizer: leaves the program as-is.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityStandardizer;

impl Standardizer for IdentityStandardizer {
    fn standardize(&self, text: &str) -> String {
        text.to_string()
    }
}

/// Full admission pipeline for a program that triggered new coverage.
///
/// The global map is rewound to `pre_discovery` so the candidate has to
/// earn its edges again from scratch: reproduce against a fresh child,
/// survive the per-edge reliability filter, stay interesting through
/// minimization and standardization, and pass the corpus gate after a
/// fresh probe. Whatever happens, the map the caller saw at discovery
/// time is restored before returning; admission never loses committed
/// coverage.
///
/// Returns the new corpus id, or `None` when the candidate was dropped
/// at any stage.
pub fn handle_new_file<C: EngineChannel, R: Rng + ?Sized>(
    engine: &mut Engine<C>,
    corpus: &mut Corpus,
    rng: &mut R,
    candidate: &str,
    pre_discovery: &CoverageSnapshot,
    standardizer: &dyn Standardizer,
) -> Result<Option<usize>, FeedbackError> {
    let discovered = engine.backup_coverage();
    engine.restore_coverage(pre_discovery);
    let outcome = admit_candidate(engine, corpus, rng, candidate, pre_discovery, standardizer);
    engine.restore_coverage(&discovered);
    outcome
}

fn admit_candidate<C: EngineChannel, R: Rng + ?Sized>(
    engine: &mut Engine<C>,
    corpus: &mut Corpus,
    rng: &mut R,
    candidate: &str,
    pre_discovery: &CoverageSnapshot,
    standardizer: &dyn Standardizer,
) -> Result<Option<usize>, FeedbackError> {
    let edges = reproduce(engine, candidate, pre_discovery)?;
    if edges.is_empty() {
        debug!("Candidate did not reproduce its coverage, dropping it");
        return Ok(None);
    }
    let edges = filter_reliable_edges(engine, candidate, edges)?;
    if edges.is_empty() {
        debug!("No edge survived the reliability filter, dropping candidate");
        return Ok(None);
    }

    let mut lines: Vec<String> = candidate.lines().map(String::from).collect();
    let before = lines.len();
    if lines.len() >= FAST_MINIMIZE_MIN_LINES {
        let chunk = (lines.len() / 16).max(2);
        minimize_lines(engine, &mut lines, &edges, chunk)?;
    }

    // Standardize between the passes; a rewrite that loses an edge is
    // discarded wholesale.
    let text = lines.join("\n");
    let standardized = standardizer.standardize(&text);
    if standardized != text {
        let timeout = engine.default_timeout();
        if edges_still_hit(engine, &standardized, &edges, timeout)? {
            lines = standardized.lines().map(String::from).collect();
        } else {
            debug!("Standardized form lost coverage, keeping the original");
        }
    }

    minimize_lines(engine, &mut lines, &edges, 1)?;
    let text = lines.join("\n");
    debug!(
        "Minimized candidate from {} to {} lines for {} edges",
        before,
        lines.len(),
        edges.len()
    );

    let state = probe::compute_state(engine, &text, rng)?;
    let mut testcase = Testcase::from_text(&text);
    testcase.state = state;
    if !corpus.should_testcase_be_loaded(&testcase) {
        debug!("Candidate rejected by the corpus gate after minimization");
        return Ok(None);
    }
    let id = corpus.add(testcase, edges)?;
    info!("New corpus entry tc{id} ({} lines)", lines.len());
    Ok(Some(id))
}

/// Outcome tallies of a directory import.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    pub admitted: usize,
    /// Files whose content hash was already in the ledger.
    pub skipped_known: usize,
    /// Files processed but dropped by the admission pipeline.
    pub rejected: usize,
}

/// Run every `.js` file under `dir` through discovery and admission, in
/// name order. Files whose content hash is already in the ledger are
/// skipped outright; every processed file is recorded in the ledger
/// whether it was admitted or not, so re-importing the same directory
/// does no engine work at all.
pub fn import_directory<C: EngineChannel, R: Rng + ?Sized>(
    engine: &mut Engine<C>,
    corpus: &mut Corpus,
    rng: &mut R,
    dir: &Path,
    ledger: &mut ImportLedger,
    standardizer: &dyn Standardizer,
) -> Result<ImportSummary, FeedbackError> {
    let mut paths: Vec<PathBuf> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|e| e == "js") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut summary = ImportSummary::default();
    for path in &paths {
        let text = fs::read_to_string(path)?;
        if ledger.contains(&text) {
            debug!("Skipping {}: already imported", path.display());
            summary.skipped_known += 1;
            continue;
        }

        let timeout = engine.default_timeout();
        let pre = engine.backup_coverage();
        let result = engine.execute_safe(&text, timeout)?;
        let admitted = if result.num_new_edges > 0 {
            handle_new_file(engine, corpus, rng, &text, &pre, standardizer)?
        } else {
            None
        };
        match admitted {
            Some(id) => {
                info!("Imported {} as tc{id}", path.display());
                summary.admitted += 1;
            }
            None => {
                info!("Rejected {}: no stable new coverage", path.display());
                summary.rejected += 1;
            }
        }
        ledger.record(&text)?;
    }
    Ok(summary)
}

/// Re-minimize an already-trusted program against its stored edge set,
/// chunked pass first, then single lines. Returns the reduced text.
pub fn minimize_for_edges<C: EngineChannel>(
    engine: &mut Engine<C>,
    text: &str,
    edges: &[u32],
) -> Result<String, EngineError> {
    let mut lines: Vec<String> = text.lines().map(String::from).collect();
    if lines.len() >= FAST_MINIMIZE_MIN_LINES {
        let chunk = (lines.len() / 16).max(2);
        minimize_lines(engine, &mut lines, edges, chunk)?;
    }
    minimize_lines(engine, &mut lines, edges, 1)?;
    Ok(lines.join("\n"))
}

/// Re-run the candidate against a freshly restarted child and report the
/// edges it triggers beyond `pre`. Empty when nothing reproduces within
/// the allowed attempts.
fn reproduce<C: EngineChannel>(
    engine: &mut Engine<C>,
    candidate: &str,
    pre: &CoverageSnapshot,
) -> Result<Vec<u32>, EngineError> {
    let timeout = engine.default_timeout();
    engine.restart_child()?;
    for attempt in 1..=REPRODUCTION_ATTEMPTS {
        let result = engine.execute(candidate, timeout)?;
        if result.status.is_success() {
            let edges = engine.coverage().newly_triggered_since(pre);
            if !edges.is_empty() {
                return Ok(edges);
            }
        }
        debug!(
            "Reproduction attempt {attempt} ended with {:?} and no new edges",
            result.status
        );
    }
    Ok(Vec::new())
}

/// Keep only edges the candidate hits on (nearly) every run. Each edge is
/// forgiven one miss; a second miss drops it.
fn filter_reliable_edges<C: EngineChannel>(
    engine: &mut Engine<C>,
    candidate: &str,
    edges: Vec<u32>,
) -> Result<Vec<u32>, EngineError> {
    let timeout = engine.default_timeout();
    let mut tracked: Vec<(u32, bool)> = edges.into_iter().map(|edge| (edge, false)).collect();
    for _ in 0..RELIABILITY_ITERATIONS {
        let result = engine.execute_once(candidate, timeout, false)?;
        if !result.status.is_success() {
            engine.restart_child()?;
            continue;
        }
        tracked.retain_mut(|(edge, missed_once)| {
            if engine.last_run_hit(*edge) {
                true
            } else if !*missed_once {
                *missed_once = true;
                true
            } else {
                false
            }
        });
        if tracked.is_empty() {
            break;
        }
    }
    Ok(tracked.into_iter().map(|(edge, _)| edge).collect())
}

/// One run of `text`; true when it succeeds and still reaches every edge.
fn edges_still_hit<C: EngineChannel>(
    engine: &mut Engine<C>,
    text: &str,
    edges: &[u32],
    timeout: std::time::Duration,
) -> Result<bool, EngineError> {
    let result = engine.execute_once(text, timeout, false)?;
    Ok(result.status.is_success() && edges.iter().all(|&edge| engine.last_run_hit(edge)))
}

/// Greedy minimization from the back of the program: drop `chunk` lines
/// at a time, keep the removal when every claimed edge is still reached,
/// put the lines back otherwise. Never empties the program.
fn minimize_lines<C: EngineChannel>(
    engine: &mut Engine<C>,
    lines: &mut Vec<String>,
    edges: &[u32],
    chunk: usize,
) -> Result<(), EngineError> {
    let timeout = engine.default_timeout();
    let mut start = lines.len();
    while start > 0 {
        let take = chunk.min(start);
        start -= take;
        if lines.len() <= take {
            break;
        }
        let removed: Vec<String> = lines.drain(start..start + take).collect();
        let candidate = lines.join("\n");
        if !edges_still_hit(engine, &candidate, edges, timeout)? {
            for (offset, line) in removed.into_iter().enumerate() {
                lines.insert(start + offset, line);
            }
        }
    }
    Ok(())
}
