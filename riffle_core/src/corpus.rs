use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use bincode::{
    self,
    config::{Configuration, Fixint, LittleEndian, NoLimit},
    error::{DecodeError, EncodeError},
};
use log::{debug, info, warn};
use rand_core::RngCore;
use thiserror::Error;

use crate::config::{CorpusConfig, FuzzerContext};
use crate::harness::ExecutionStatus;
use crate::state::{StateError, TestcaseState};
use crate::testcase::Testcase;

/// Errors from corpus storage and policy operations.
#[derive(Error, Debug)]
pub enum CorpusError {
    /// The requested entry id is not in the active corpus list.
    #[error("Entry {0} not found in corpus")]
    EntryNotFound(usize),

    /// An I/O error while reading or writing corpus files.
    #[error("Corpus I/O error: {0}")]
    Io(String),

    /// A testcase state file failed to encode, decode or persist.
    #[error("Corpus state error: {0}")]
    State(#[from] StateError),

    /// Serializing an index or edge set failed.
    #[error("Corpus serialization error: {0}")]
    Serialization(String),

    /// Deserializing an index or edge set failed.
    #[error("Corpus deserialization error: {0}")]
    Deserialization(String),
}

impl From<std::io::Error> for CorpusError {
    fn from(err: std::io::Error) -> Self {
        CorpusError::Io(err.to_string())
    }
}
impl From<serde_json::Error> for CorpusError {
    fn from(err: serde_json::Error) -> Self {
        CorpusError::Deserialization(format!("JSON operation error: {}", err))
    }
}
impl From<EncodeError> for CorpusError {
    fn from(err: EncodeError) -> Self {
        CorpusError::Serialization(format!("Bincode encoding error: {}", err))
    }
}
impl From<DecodeError> for CorpusError {
    fn from(err: DecodeError) -> Self {
        CorpusError::Deserialization(format!("Bincode decoding error: {}", err))
    }
}

/// One admitted program: its text and probed state, the edge set it is
/// obligated to keep reproducing, and the outcome counters feeding the
/// disablement policy. Counters start at zero each time the corpus is
/// loaded; the disablement policy only reasons about the current run.
#[derive(Debug, Clone)]
pub struct CorpusEntry {
    pub id: usize,
    pub testcase: Testcase,
    /// Edge indices whose discovery justified admitting this entry.
    /// Replayed during admission verification and corpus minimization.
    pub required_edges: Vec<u32>,
    pub uses: u64,
    pub exceptions: u64,
    pub hangs: u64,
}

impl CorpusEntry {
    fn new(id: usize, testcase: Testcase, required_edges: Vec<u32>) -> Self {
        CorpusEntry {
            id,
            testcase,
            required_edges,
            uses: 0,
            exceptions: 0,
            hangs: 0,
        }
    }

    pub fn source_name(&self) -> String {
        source_file_name(self.id)
    }

    pub fn exception_rate(&self) -> f64 {
        if self.uses == 0 {
            return 0.0;
        }
        self.exceptions as f64 / self.uses as f64
    }

    pub fn hang_rate(&self) -> f64 {
        if self.uses == 0 {
            return 0.0;
        }
        self.hangs as f64 / self.uses as f64
    }
}

fn source_file_name(id: usize) -> String {
    format!("tc{id}.js")
}

fn state_file_name(id: usize) -> String {
    format!("tc{id}.js.state")
}

fn coverage_file_name(id: usize) -> String {
    format!("tc{id}_required_coverage.bin")
}

/// Entry id of a corpus source file name, `None` for anything else.
fn parse_source_id(name: &str) -> Option<usize> {
    name.strip_prefix("tc")?.strip_suffix(".js")?.parse().ok()
}

fn bincode_config() -> Configuration<LittleEndian, Fixint, NoLimit> {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

fn save_required_edges(path: &Path, edges: &[u32]) -> Result<(), CorpusError> {
    let bytes = bincode::encode_to_vec(edges, bincode_config())?;
    fs::write(path, bytes)?;
    Ok(())
}

fn load_required_edges(path: &Path) -> Result<Vec<u32>, CorpusError> {
    let bytes = fs::read(path)?;
    let (edges, _len): (Vec<u32>, usize) = bincode::decode_from_slice(&bytes, bincode_config())?;
    Ok(edges)
}

fn load_disabled_set(path: &Path) -> Result<BTreeSet<String>, CorpusError> {
    if !path.exists() {
        return Ok(BTreeSet::new());
    }
    let content = fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(BTreeSet::new());
    }
    Ok(serde_json::from_str(&content)?)
}

/// On-disk corpus of admitted testcases. Every entry is three files in
/// the corpus directory: `tcN.js` (source), `tcN.js.state` (probed
/// state) and `tcN_required_coverage.bin` (edge indices). Entries that
/// fail the admission gate or fall to the disablement policy have their
/// file names recorded in a persisted disabled set and are skipped on
/// every future load without re-evaluation.
pub struct Corpus {
    dir: PathBuf,
    disabled_path: PathBuf,
    policy: CorpusConfig,
    entries: Vec<CorpusEntry>,
    disabled: BTreeSet<String>,
    next_id: usize,
}

impl Corpus {
    /// Open the corpus under the context's output directory, loading
    /// every readable entry that passes the admission gate. Unreadable
    /// entries are skipped with a warning; gate failures are moved to
    /// the permanently-disabled set.
    pub fn open(ctx: &FuzzerContext) -> Result<Self, CorpusError> {
        let dir = ctx.corpus_dir();
        fs::create_dir_all(&dir)?;
        let disabled_path = ctx.disabled_set_path();
        let disabled = load_disabled_set(&disabled_path)?;
        let mut corpus = Corpus {
            dir,
            disabled_path,
            policy: ctx.config.corpus.clone(),
            entries: Vec::new(),
            disabled,
            next_id: 1,
        };
        corpus.scan_directory()?;
        Ok(corpus)
    }

    fn scan_directory(&mut self) -> Result<(), CorpusError> {
        let mut ids: Vec<usize> = Vec::new();
        for dir_entry in fs::read_dir(&self.dir)? {
            let dir_entry = dir_entry?;
            if let Some(name) = dir_entry.file_name().to_str() {
                if let Some(id) = parse_source_id(name) {
                    ids.push(id);
                }
            }
        }
        ids.sort_unstable();

        let mut newly_disabled = false;
        for id in ids {
            // New admissions must never collide with anything on disk,
            // disabled files included.
            self.next_id = self.next_id.max(id + 1);
            let name = source_file_name(id);
            if self.disabled.contains(&name) {
                debug!("Skipping permanently disabled corpus entry {name}");
                continue;
            }
            match self.load_entry(id) {
                Ok(entry) => {
                    if self.should_testcase_be_loaded(&entry.testcase) {
                        self.entries.push(entry);
                    } else {
                        info!("Corpus entry {name} fails the admission gate, disabling it");
                        self.disabled.insert(name);
                        newly_disabled = true;
                    }
                }
                Err(err) => {
                    warn!("Skipping corpus entry {name}: {err}");
                }
            }
        }
        if newly_disabled {
            self.save_disabled_set()?;
        }
        info!(
            "Loaded {} corpus entries from {:?} ({} in the disabled set)",
            self.entries.len(),
            self.dir,
            self.disabled.len()
        );
        Ok(())
    }

    fn load_entry(&self, id: usize) -> Result<CorpusEntry, CorpusError> {
        let text = fs::read_to_string(self.dir.join(source_file_name(id)))?;
        let state = TestcaseState::load(&self.dir.join(state_file_name(id)))?;
        let required = load_required_edges(&self.dir.join(coverage_file_name(id)))?;
        Ok(CorpusEntry::new(id, Testcase::new(&text, state), required))
    }

    /// Admission gate, applied both when a candidate is admitted and
    /// when an entry is loaded back from disk. Rejects programs that are
    /// too slow to be worth mutating, have no insertable line at all,
    /// contain constructs the mutation engine must not touch, or whose
    /// recorded line count disagrees with the text on disk.
    pub fn should_testcase_be_loaded(&self, testcase: &Testcase) -> bool {
        let state = &testcase.state;
        if state.expected_runtime_ms > self.policy.max_expected_runtime_ms {
            debug!(
                "Gate: expected runtime {}ms is above the {}ms ceiling",
                state.expected_runtime_ms, self.policy.max_expected_runtime_ms
            );
            return false;
        }
        if state.insertable_line_count() == 0 {
            debug!("Gate: no insertable lines, nothing to mutate");
            return false;
        }
        if !testcase.is_consistent() {
            debug!(
                "Gate: recorded line count {} disagrees with the text ({} lines)",
                state.number_of_lines,
                testcase.line_count()
            );
            return false;
        }
        let text = testcase.text();
        if let Some(fragment) = self
            .policy
            .forbidden_fragments
            .iter()
            .find(|f| text.contains(f.as_str()))
        {
            debug!("Gate: contains forbidden fragment {fragment:?}");
            return false;
        }
        true
    }

    /// Admit a testcase with the edge set that justified it. Assigns the
    /// next sequential id, writes all three entry files and appends the
    /// entry to the active list.
    pub fn add(
        &mut self,
        testcase: Testcase,
        required_edges: Vec<u32>,
    ) -> Result<usize, CorpusError> {
        let id = self.next_id;
        let entry = CorpusEntry::new(id, testcase, required_edges);
        self.persist_entry(&entry)?;
        info!(
            "Admitted corpus entry {} ({} lines, {} required edges)",
            entry.source_name(),
            entry.testcase.line_count(),
            entry.required_edges.len()
        );
        self.entries.push(entry);
        self.next_id += 1;
        Ok(id)
    }

    fn persist_entry(&self, entry: &CorpusEntry) -> Result<(), CorpusError> {
        entry
            .testcase
            .save(&self.dir.join(source_file_name(entry.id)))?;
        entry
            .testcase
            .state
            .save(&self.dir.join(state_file_name(entry.id)))?;
        save_required_edges(
            &self.dir.join(coverage_file_name(entry.id)),
            &entry.required_edges,
        )?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[CorpusEntry] {
        &self.entries
    }

    /// Active entry ids, for callers that iterate while mutating.
    pub fn ids(&self) -> Vec<usize> {
        self.entries.iter().map(|e| e.id).collect()
    }

    pub fn get(&self, id: usize) -> Option<&CorpusEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Pick a mutation ingredient uniformly at random.
    pub fn random_select(&self, rng: &mut dyn RngCore) -> Option<&CorpusEntry> {
        if self.entries.is_empty() {
            return None;
        }
        let index = rng.next_u64() as usize % self.entries.len();
        self.entries.get(index)
    }

    /// Account one use of an entry as a mutation ingredient. Unknown ids
    /// are ignored; the entry may have been swept between selection and
    /// outcome.
    pub fn record_outcome(&mut self, id: usize, status: &ExecutionStatus) {
        let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) else {
            return;
        };
        entry.uses += 1;
        match status {
            ExecutionStatus::ExceptionThrown(_) => entry.exceptions += 1,
            ExecutionStatus::Timeout => entry.hangs += 1,
            _ => {}
        }
    }

    /// Periodic disablement sweep: every entry past the minimum use
    /// count whose exception or hang rate is over its ceiling is moved
    /// to the permanently-disabled set and dropped from the active list.
    /// Returns the ids that were disabled.
    pub fn sweep_disabled(&mut self) -> Result<Vec<usize>, CorpusError> {
        let policy = &self.policy;
        let mut dropped = Vec::new();
        self.entries.retain(|entry| {
            if entry.uses < policy.min_uses_before_disable {
                return true;
            }
            let exception_rate = entry.exception_rate();
            let hang_rate = entry.hang_rate();
            if exception_rate > policy.max_exception_rate || hang_rate > policy.max_hang_rate {
                info!(
                    "Disabling corpus entry {}: {} uses, exception rate {:.2}, hang rate {:.2}",
                    entry.source_name(),
                    entry.uses,
                    exception_rate,
                    hang_rate
                );
                dropped.push(entry.id);
                return false;
            }
            true
        });
        if dropped.is_empty() {
            return Ok(dropped);
        }
        for id in &dropped {
            self.disabled.insert(source_file_name(*id));
        }
        self.save_disabled_set()?;
        Ok(dropped)
    }

    /// Replace an entry's state and rewrite its state file. Used by the
    /// state-recalculation mode after a fresh probe.
    pub fn update_state(&mut self, id: usize, state: TestcaseState) -> Result<(), CorpusError> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(CorpusError::EntryNotFound(id))?;
        entry.testcase.state = state;
        entry
            .testcase
            .state
            .save(&self.dir.join(state_file_name(id)))?;
        Ok(())
    }

    /// Replace an entry's program and state wholesale, rewriting all of
    /// its files. Used by the corpus-minimization mode.
    pub fn replace_testcase(&mut self, id: usize, testcase: Testcase) -> Result<(), CorpusError> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(CorpusError::EntryNotFound(id))?;
        entry.testcase = testcase;
        let snapshot = entry.clone();
        self.persist_entry(&snapshot)?;
        Ok(())
    }

    /// Rewrite the corpus directory so the surviving entries are
    /// numbered contiguously from 1, deleting the files of disabled and
    /// skipped entries. The disabled set is cleared afterwards since the
    /// file names it held no longer exist. Returns the surviving count.
    pub fn compact(&mut self) -> Result<usize, CorpusError> {
        let mut on_disk: Vec<usize> = Vec::new();
        for dir_entry in fs::read_dir(&self.dir)? {
            let dir_entry = dir_entry?;
            if let Some(name) = dir_entry.file_name().to_str() {
                if let Some(id) = parse_source_id(name) {
                    on_disk.push(id);
                }
            }
        }
        for id in on_disk {
            self.remove_entry_files(id)?;
        }
        for (index, entry) in self.entries.iter_mut().enumerate() {
            entry.id = index + 1;
        }
        for entry in &self.entries {
            self.persist_entry(entry)?;
        }
        self.next_id = self.entries.len() + 1;
        self.disabled.clear();
        self.save_disabled_set()?;
        info!("Compacted corpus to {} contiguous entries", self.entries.len());
        Ok(self.entries.len())
    }

    fn remove_entry_files(&self, id: usize) -> Result<(), CorpusError> {
        for name in [
            source_file_name(id),
            state_file_name(id),
            coverage_file_name(id),
        ] {
            match fs::remove_file(self.dir.join(&name)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn save_disabled_set(&self) -> Result<(), CorpusError> {
        let file = File::create(&self.disabled_path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), &self.disabled)
            .map_err(|e| CorpusError::Serialization(format!("Failed to write disabled set: {e}")))?;
        Ok(())
    }
}
