use std::ffi::CString;
use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use thiserror::Error;

use crate::config::EngineConfig;
use crate::coverage::{CoverageError, CoverageMap, CoverageSnapshot, bitmap_len, count_hits, run_contains};
use crate::harness::{ExecutionStatus, HarnessProfile};

/// Fd numbers the child expects its REPRL channel on, by convention with
/// the native harness: commands in, status out, program text in, structured
/// output out.
const CHILD_CMD_FD: RawFd = 100;
const CHILD_STATUS_FD: RawFd = 101;
const CHILD_SCRIPT_FD: RawFd = 102;
const CHILD_OUTPUT_FD: RawFd = 103;

const HANDSHAKE: &[u8; 4] = b"HELO";
const EXEC_COMMAND: &[u8; 4] = b"exec";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout multiplier for query executions (internal introspection
/// snippets that must never spuriously time out).
const QUERY_TIMEOUT_FACTOR: u32 = 20;

/// Upper bound on de-flaking iterations in [`Engine::execute_safe`].
const MAX_SAFE_ITERATIONS: usize = 135;

/// Programs run once after the child first comes up, so that startup noise
/// is committed to the baseline before any real candidate is judged.
const CALIBRATION_SNIPPETS: &[&str] = &[
    "const calib_a = 1 + 1;",
    "for (let calib_i = 0; calib_i < 16; calib_i++) { Math.sqrt(calib_i); }",
    "try { undefined_calibration_symbol; } catch (e) {}",
];

/// Errors from the channel and shared-memory plumbing. Target outcomes
/// (crash, timeout, exception) are never errors; see `ExecutionStatus`.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Failed to spawn engine child: {0}")]
    Spawn(String),
    #[error("REPRL channel fault: {0}")]
    Channel(String),
    #[error("Shared memory fault: {0}")]
    SharedMemory(String),
    #[error(transparent)]
    Coverage(#[from] CoverageError),
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Channel(err.to_string())
    }
}

/// Result of one engine invocation, as handed to the fuzzing loop.
///
/// Constructed fresh per invocation. The only post-construction mutations
/// anywhere are the internal-error relabel in `execute_once` and the
/// unreliable-score fill-in at the end of `execute_safe`.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub exec_time: Duration,
    /// Structured output the program sent over the designated channel.
    pub output: String,
    /// Captured child stderr; populated only when status is a crash class.
    pub stderr: String,
    /// 0 = trustworthy, up to 10 = maximally non-deterministic.
    pub unreliable_score: u32,
    /// Edges newly committed to the global map by this call.
    pub num_new_edges: usize,
    /// Edges hit by this run, new or not. Only meaningful on success.
    pub num_hit_edges: usize,
}

/// What one raw channel round-trip produced, before status decoding.
#[derive(Debug, Clone)]
pub struct RawExecution {
    pub status_word: u32,
    pub exec_time: Duration,
    pub output: String,
    pub stderr: String,
    /// Per-run edge buffer (run sense: bit 1 = hit).
    pub edges: Vec<u8>,
}

/// Transport to one engine child. The real implementation speaks REPRL
/// over pipes and shared memory; tests substitute a scripted double.
pub trait EngineChannel {
    fn is_running(&self) -> bool;
    fn spawn(&mut self) -> Result<(), EngineError>;
    fn stop(&mut self);
    /// Run one program in the live child. The caller guarantees the child
    /// is running. On watchdog expiry the child is killed and the returned
    /// status word carries the harness timeout pattern.
    fn run(&mut self, code: &str, timeout: Duration) -> Result<RawExecution, EngineError>;
    /// Edge count reported by the harness; 0 until the first spawn.
    fn num_edges(&self) -> u32;
}

fn set_nonblocking(fd: RawFd) -> Result<(), EngineError> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(EngineError::Channel(std::io::Error::last_os_error().to_string()));
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(EngineError::Channel(std::io::Error::last_os_error().to_string()));
    }
    Ok(())
}

fn make_pipe() -> Result<(RawFd, RawFd), EngineError> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(EngineError::Channel(std::io::Error::last_os_error().to_string()));
    }
    Ok((fds[0], fds[1]))
}

/// Read everything currently buffered on a non-blocking reader.
fn drain_nonblocking(reader: &mut Option<impl Read>) -> String {
    let mut collected = Vec::new();
    if let Some(r) = reader.as_mut() {
        let mut buf = [0u8; 4096];
        loop {
            match r.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => collected.extend_from_slice(&buf[..n]),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    }
    String::from_utf8_lossy(&collected).into_owned()
}

/// The shared-memory region the harness writes per-run edge bits into.
/// Layout: little-endian `u32` edge count, then one bit per edge.
struct ShmRegion {
    name: CString,
    ptr: *mut u8,
    size: usize,
}

// The region is owned by exactly one channel and only touched between
// executions, never concurrently with the child writing it.
unsafe impl Send for ShmRegion {}

impl ShmRegion {
    fn create(name: &str, size: usize) -> Result<Self, EngineError> {
        let cname = CString::new(name)
            .map_err(|_| EngineError::SharedMemory("invalid region name".to_string()))?;
        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o600) };
        if fd < 0 {
            return Err(EngineError::SharedMemory(
                std::io::Error::last_os_error().to_string(),
            ));
        }
        if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
            let err = std::io::Error::last_os_error();
            unsafe {
                libc::close(fd);
                libc::shm_unlink(cname.as_ptr());
            }
            return Err(EngineError::SharedMemory(err.to_string()));
        }
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };
        if ptr == libc::MAP_FAILED {
            let err = std::io::Error::last_os_error();
            unsafe { libc::shm_unlink(cname.as_ptr()) };
            return Err(EngineError::SharedMemory(err.to_string()));
        }
        Ok(ShmRegion {
            name: cname,
            ptr: ptr as *mut u8,
            size,
        })
    }

    fn num_edges(&self) -> u32 {
        let mut header = [0u8; 4];
        unsafe { std::ptr::copy_nonoverlapping(self.ptr, header.as_mut_ptr(), 4) };
        u32::from_le_bytes(header)
    }

    fn edge_bytes(&self, num_edges: u32) -> Vec<u8> {
        let len = std::cmp::min(bitmap_len(num_edges), self.size - 4);
        let slice = unsafe { std::slice::from_raw_parts(self.ptr.add(4), len) };
        slice.to_vec()
    }

    fn clear_edges(&self) {
        unsafe { std::ptr::write_bytes(self.ptr.add(4), 0, self.size - 4) };
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
            libc::shm_unlink(self.name.as_ptr());
        }
    }
}

/// REPRL transport to a real engine child: four dedicated pipes dup2'd
/// onto fixed fd numbers plus the shared-memory edge region, with the
/// region name passed through the environment.
pub struct ReprlChannel {
    command: String,
    args: Vec<String>,
    profile: HarnessProfile,
    shm: ShmRegion,
    shm_name: String,
    child: Option<Child>,
    cmd_wr: Option<File>,
    status_rd: Option<File>,
    script_wr: Option<File>,
    output_rd: Option<File>,
    child_stdout: Option<std::process::ChildStdout>,
    child_stderr: Option<std::process::ChildStderr>,
    num_edges: u32,
    spawn_generation: u32,
}

impl ReprlChannel {
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        let shm_name = format!("/riffle_shm_{}", std::process::id());
        let shm = ShmRegion::create(&shm_name, config.harness.shm_size)?;
        Ok(ReprlChannel {
            command: config.command.clone(),
            args: config.args.clone(),
            profile: config.harness.clone(),
            shm,
            shm_name,
            child: None,
            cmd_wr: None,
            status_rd: None,
            script_wr: None,
            output_rd: None,
            child_stdout: None,
            child_stderr: None,
            num_edges: 0,
            spawn_generation: 0,
        })
    }

    fn close_channel_files(&mut self) {
        self.cmd_wr = None;
        self.status_rd = None;
        self.script_wr = None;
        self.output_rd = None;
        self.child_stdout = None;
        self.child_stderr = None;
    }

    /// Kill and reap the child, returning the status word its death maps
    /// to: the terminating signal in the low byte, or the internal-error
    /// word for a silent clean exit.
    fn reap_status_word(&mut self) -> u32 {
        let word = match self.child.take() {
            Some(mut child) => {
                let _ = child.kill();
                match child.wait() {
                    Ok(status) => match status.signal() {
                        Some(signal) => signal as u32,
                        None => self.profile.internal_error_word,
                    },
                    Err(_) => self.profile.internal_error_word,
                }
            }
            None => self.profile.internal_error_word,
        };
        self.close_channel_files();
        word
    }

    /// Wait for the 4-byte status word with a deadline. `Ok(None)` means
    /// the watchdog fired; the child has not been touched yet.
    fn poll_status(&mut self, deadline: Instant) -> Result<Option<u32>, EngineError> {
        let fd = match self.status_rd.as_ref() {
            Some(f) => f.as_raw_fd(),
            None => return Err(EngineError::Channel("status pipe is closed".to_string())),
        };
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let ms = remaining.as_millis() as libc::c_int;
            let mut pfd = libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            };
            let rc = unsafe { libc::poll(&mut pfd, 1, ms) };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(EngineError::Channel(err.to_string()));
            }
            if rc == 0 {
                return Ok(None);
            }
            let read_result = {
                let mut word = [0u8; 4];
                match self.status_rd.as_mut() {
                    Some(r) => r.read_exact(&mut word).map(|_| u32::from_le_bytes(word)),
                    None => {
                        return Err(EngineError::Channel("status pipe is closed".to_string()));
                    }
                }
            };
            return match read_result {
                Ok(word) => Ok(Some(word)),
                // EOF: the child died without reporting. Reap and map its
                // exit to a status word.
                Err(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    Ok(Some(self.reap_status_word()))
                }
                Err(e) => Err(EngineError::Channel(e.to_string())),
            };
        }
    }
}

impl EngineChannel for ReprlChannel {
    fn is_running(&self) -> bool {
        self.child.is_some()
    }

    fn spawn(&mut self) -> Result<(), EngineError> {
        self.stop();

        let (cmd_rd, cmd_wr) = make_pipe()?;
        let (status_rd, status_wr) = make_pipe()?;
        let (script_rd, script_wr) = make_pipe()?;
        let (output_rd, output_wr) = make_pipe()?;

        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("SHM_ID", &self.shm_name);
        unsafe {
            command.pre_exec(move || {
                for (from, to) in [
                    (cmd_rd, CHILD_CMD_FD),
                    (status_wr, CHILD_STATUS_FD),
                    (script_rd, CHILD_SCRIPT_FD),
                    (output_wr, CHILD_OUTPUT_FD),
                ] {
                    if libc::dup2(from, to) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                unsafe {
                    for fd in [
                        cmd_rd, cmd_wr, status_rd, status_wr, script_rd, script_wr, output_rd,
                        output_wr,
                    ] {
                        libc::close(fd);
                    }
                }
                return Err(EngineError::Spawn(format!("{}: {}", self.command, e)));
            }
        };

        // The child holds its dup2'd copies; release the originals here.
        unsafe {
            libc::close(cmd_rd);
            libc::close(status_wr);
            libc::close(script_rd);
            libc::close(output_wr);
        }

        set_nonblocking(output_rd)?;
        if let Some(out) = child.stdout.as_ref() {
            set_nonblocking(out.as_raw_fd())?;
        }
        if let Some(err) = child.stderr.as_ref() {
            set_nonblocking(err.as_raw_fd())?;
        }

        self.child_stdout = child.stdout.take();
        self.child_stderr = child.stderr.take();
        self.cmd_wr = Some(unsafe { File::from_raw_fd(cmd_wr) });
        self.status_rd = Some(unsafe { File::from_raw_fd(status_rd) });
        self.script_wr = Some(unsafe { File::from_raw_fd(script_wr) });
        self.output_rd = Some(unsafe { File::from_raw_fd(output_rd) });
        self.child = Some(child);

        // Handshake: the harness echoes HELO once its REPRL loop is up.
        if let Some(w) = self.cmd_wr.as_mut() {
            w.write_all(HANDSHAKE)?;
            w.flush()?;
        }
        match self.poll_status(Instant::now() + HANDSHAKE_TIMEOUT)? {
            Some(word) if word.to_le_bytes() == *HANDSHAKE => {}
            other => {
                self.stop();
                return Err(EngineError::Channel(format!(
                    "engine did not complete the handshake (got {other:?})"
                )));
            }
        }

        let num_edges = self.shm.num_edges();
        if num_edges == 0 || num_edges > self.profile.max_edges() {
            self.stop();
            return Err(EngineError::SharedMemory(format!(
                "harness reported an implausible edge count: {num_edges}"
            )));
        }
        self.num_edges = num_edges;
        self.spawn_generation += 1;
        debug!(
            "Engine child up (generation {}), {} edges instrumented",
            self.spawn_generation, num_edges
        );
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        self.close_channel_files();
    }

    fn run(&mut self, code: &str, timeout: Duration) -> Result<RawExecution, EngineError> {
        if !self.is_running() {
            return Err(EngineError::Channel(
                "engine child is not running".to_string(),
            ));
        }
        self.shm.clear_edges();
        let start = Instant::now();

        let write_result = (|| -> std::io::Result<()> {
            let cmd = self
                .cmd_wr
                .as_mut()
                .ok_or_else(|| std::io::Error::other("command pipe closed"))?;
            cmd.write_all(EXEC_COMMAND)?;
            cmd.write_all(&(code.len() as u64).to_le_bytes())?;
            cmd.flush()?;
            let script = self
                .script_wr
                .as_mut()
                .ok_or_else(|| std::io::Error::other("script pipe closed"))?;
            script.write_all(code.as_bytes())?;
            script.flush()?;
            Ok(())
        })();

        let status_word = match write_result {
            Ok(()) => match self.poll_status(start + timeout)? {
                Some(word) => {
                    // Crash words mean the child is gone; reap it so the
                    // next spawn starts clean.
                    if word & 0xff != 0
                        && word != self.profile.exception_crash_word
                        && word != self.profile.internal_error_word
                    {
                        let _ = self.reap_status_word();
                    }
                    word
                }
                None => {
                    trace!("Watchdog fired after {:?}, killing child", timeout);
                    self.reap_status_word();
                    self.profile.timeout_word
                }
            },
            // A write fault means the child is already dead; its exit
            // status is the real answer.
            Err(ref e) if e.kind() == std::io::ErrorKind::BrokenPipe => self.reap_status_word(),
            Err(e) => return Err(EngineError::Channel(e.to_string())),
        };

        let exec_time = start.elapsed();
        let output = drain_nonblocking(&mut self.output_rd);
        let _ = drain_nonblocking(&mut self.child_stdout);
        let stderr = drain_nonblocking(&mut self.child_stderr);
        let edges = self.shm.edge_bytes(self.num_edges);

        Ok(RawExecution {
            status_word,
            exec_time,
            output,
            stderr,
            edges,
        })
    }

    fn num_edges(&self) -> u32 {
        self.num_edges
    }
}

impl Drop for ReprlChannel {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Required consecutive-clean-iteration streak for the de-flaking loop,
/// escalating with the total iteration count so a noisy snippet has to
/// prove itself harder the longer it stays noisy.
fn required_streak(total_iterations: usize) -> usize {
    match total_iterations {
        0..=5 => 3,
        6..=10 => 5,
        11..=15 => 7,
        16..=25 => 10,
        26..=50 => 15,
        _ => 25,
    }
}

/// The execution engine: one child, one global coverage map, and the
/// policy layers that turn raw channel round-trips into trusted results.
pub struct Engine<C: EngineChannel> {
    channel: C,
    profile: HarnessProfile,
    coverage: CoverageMap,
    default_timeout: Duration,
    restart_threshold: u32,
    execs_since_spawn: u32,
    last_run_edges: Vec<u8>,
    total_executions: u64,
}

impl<C: EngineChannel> Engine<C> {
    /// Spawn the child once and size the coverage map from the edge count
    /// the harness reports.
    pub fn initialize(mut channel: C, config: &EngineConfig) -> Result<Self, EngineError> {
        channel.spawn()?;
        let num_edges = channel.num_edges();
        Ok(Engine {
            channel,
            profile: config.harness.clone(),
            coverage: CoverageMap::new(num_edges),
            default_timeout: Duration::from_millis(config.timeout_ms),
            restart_threshold: config.restart_threshold,
            execs_since_spawn: 0,
            last_run_edges: vec![0; bitmap_len(num_edges)],
            total_executions: 0,
        })
    }

    pub fn profile(&self) -> &HarnessProfile {
        &self.profile
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn total_executions(&self) -> u64 {
        self.total_executions
    }

    pub fn coverage(&self) -> &CoverageMap {
        &self.coverage
    }

    /// Commit startup noise to the baseline by running a few trivial
    /// programs and accepting whatever edges they light up.
    pub fn calibrate(&mut self) -> Result<(), EngineError> {
        for snippet in CALIBRATION_SNIPPETS {
            let result = self.execute_once(snippet, self.default_timeout, true)?;
            if result.status.is_success() {
                self.coverage.scan_and_commit(&self.last_run_edges);
            }
        }
        info!(
            "Calibrated engine baseline: {} edges triggered",
            self.coverage.triggered_count()
        );
        Ok(())
    }

    fn ensure_running(&mut self) -> Result<(), EngineError> {
        if !self.channel.is_running() {
            self.channel.spawn()?;
            self.execs_since_spawn = 0;
        }
        Ok(())
    }

    /// Stop the child and bring up a fresh one.
    pub fn restart_child(&mut self) -> Result<(), EngineError> {
        self.channel.stop();
        self.ensure_running()
    }

    fn run_raw(&mut self, code: &str, timeout: Duration) -> Result<RawExecution, EngineError> {
        if self.execs_since_spawn >= self.restart_threshold {
            debug!(
                "Restart threshold of {} executions reached, recycling child",
                self.restart_threshold
            );
            self.channel.stop();
        }
        self.ensure_running()?;
        let raw = self.channel.run(code, timeout)?;
        self.execs_since_spawn += 1;
        self.total_executions += 1;
        Ok(raw)
    }

    /// Single-shot execution with status classification. `is_query`
    /// requests the widened timeout for introspection snippets. An
    /// InternalError triggers one transparent respawn-and-retry; a repeat
    /// is relabelled as the benign crash-exception class and logged.
    pub fn execute_once(
        &mut self,
        code: &str,
        timeout: Duration,
        is_query: bool,
    ) -> Result<ExecutionResult, EngineError> {
        let effective = if is_query {
            timeout * QUERY_TIMEOUT_FACTOR
        } else {
            timeout
        };

        let mut raw = self.run_raw(code, effective)?;
        let mut status = self.profile.decode(raw.status_word);
        if status == ExecutionStatus::InternalError {
            warn!("Harness reported an internal error, respawning and retrying once");
            self.restart_child()?;
            raw = self.run_raw(code, effective)?;
            status = self.profile.decode(raw.status_word);
            if status == ExecutionStatus::InternalError {
                warn!("Internal error repeated after respawn, relabelling as exception crash");
                status = ExecutionStatus::ExceptionCrash;
            }
        }

        // Crash, exception-crash and timeout all invalidate the child; the
        // next call respawns lazily.
        if matches!(
            status,
            ExecutionStatus::Crash(_) | ExecutionStatus::ExceptionCrash | ExecutionStatus::Timeout
        ) {
            self.channel.stop();
        }

        let stderr = if status.is_crash() {
            std::mem::take(&mut raw.stderr)
        } else {
            String::new()
        };
        let num_hit_edges = count_hits(&raw.edges);
        self.last_run_edges = raw.edges;

        Ok(ExecutionResult {
            status,
            exec_time: raw.exec_time,
            output: raw.output,
            stderr,
            unreliable_score: 0,
            num_new_edges: 0,
            num_hit_edges,
        })
    }

    /// Execution with coverage bookkeeping and suspect/confirm filtering.
    ///
    /// New edges seen on a successful run are treated as suspect until the
    /// identical program reproduces them against a freshly restarted child
    /// with a 1.5x timeout margin; only then are they committed to the
    /// global map. One full retry of the sequence is allowed before the
    /// second result is returned as-is.
    pub fn execute(&mut self, code: &str, timeout: Duration) -> Result<ExecutionResult, EngineError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let result = self.execute_once(code, timeout, false)?;
            if !result.status.is_success() {
                return Ok(result);
            }
            let suspects = self.coverage.peek_new(&self.last_run_edges);
            if suspects.is_empty() {
                return Ok(result);
            }

            debug!(
                "{} suspect new edges, confirming against a fresh child",
                suspects.len()
            );
            self.restart_child()?;
            let confirm_timeout = timeout * 3 / 2;
            let mut confirm = self.execute_once(code, confirm_timeout, false)?;
            if confirm.status.is_success() {
                let committed = self.coverage.scan_and_commit(&self.last_run_edges);
                if committed.len() < suspects.len() {
                    debug!(
                        "Only {} of {} suspect edges survived confirmation",
                        committed.len(),
                        suspects.len()
                    );
                }
                confirm.num_new_edges = committed.len();
                return Ok(confirm);
            }
            if attempts >= 2 {
                return Ok(confirm);
            }
            debug!(
                "Suspect coverage did not confirm ({:?}), retrying the sequence once",
                confirm.status
            );
        }
    }

    /// The fully de-flaked entry point the fuzzing loop uses.
    ///
    /// After `execute` reports new coverage, the same program is re-run up
    /// to 135 times until an escalating streak of consecutive iterations
    /// shows no further new edges; everything that keeps appearing gets
    /// committed along the way so flaky edges stop registering as new.
    /// The returned result is the first one, with its unreliable score set
    /// in proportion to how long stabilization took.
    pub fn execute_safe(
        &mut self,
        code: &str,
        timeout: Duration,
    ) -> Result<ExecutionResult, EngineError> {
        let mut first = self.execute(code, timeout)?;
        if first.num_new_edges == 0 {
            return Ok(first);
        }

        let mut iterations = 0usize;
        let mut clean_streak = 0usize;
        let mut stabilized = false;
        while iterations < MAX_SAFE_ITERATIONS {
            iterations += 1;
            let result = self.execute_once(code, timeout, false)?;
            let extra = if result.status.is_success() {
                self.coverage.scan_and_commit(&self.last_run_edges)
            } else {
                Vec::new()
            };
            if extra.is_empty() {
                clean_streak += 1;
            } else {
                trace!(
                    "De-flake iteration {} surfaced {} more edges",
                    iterations,
                    extra.len()
                );
                clean_streak = 0;
            }
            if clean_streak >= required_streak(iterations) {
                stabilized = true;
                break;
            }
        }

        if !stabilized {
            warn!(
                "Coverage did not stabilize within {} iterations, marking result maximally unreliable",
                MAX_SAFE_ITERATIONS
            );
        }
        first.unreliable_score = ((iterations * 10) / MAX_SAFE_ITERATIONS) as u32;
        Ok(first)
    }

    /// True if the most recent run hit `edge`.
    pub fn last_run_hit(&self, edge: u32) -> bool {
        run_contains(&self.last_run_edges, edge)
    }

    /// Edges the most recent run hit that the live map has not yet
    /// absorbed. Pure inspection, commits nothing.
    pub fn peek_new_edges(&self) -> Vec<u32> {
        self.coverage.peek_new(&self.last_run_edges)
    }

    pub fn backup_coverage(&self) -> CoverageSnapshot {
        self.coverage.backup()
    }

    pub fn restore_coverage(&mut self, snapshot: &CoverageSnapshot) {
        self.coverage.restore(snapshot);
    }

    pub fn save_coverage(&self, path: &std::path::Path) -> Result<(), EngineError> {
        self.coverage.save(path)?;
        Ok(())
    }

    /// Replace the live map with a dump from disk. The file must exist.
    pub fn load_coverage(&mut self, path: &std::path::Path) -> Result<(), EngineError> {
        self.coverage = CoverageMap::load(path, self.channel.num_edges())?;
        Ok(())
    }

    /// Flip edges back to untriggered for a verification replay.
    pub fn reset_coverage_edges(&mut self, edges: &[u32]) {
        self.coverage.reset_edges(edges);
    }

    /// Commit edges directly, bypassing suspicion (used when restoring a
    /// known-good discovered set).
    pub fn mark_coverage_edges(&mut self, edges: &[u32]) {
        self.coverage.commit(edges);
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;

    /// What one scripted call should produce.
    pub(crate) struct ScriptedResponse {
        pub status_word: u32,
        pub hit_edges: Vec<u32>,
        pub output: String,
        pub stderr: String,
    }

    impl ScriptedResponse {
        pub fn success(hit_edges: &[u32]) -> Self {
            ScriptedResponse {
                status_word: 0,
                hit_edges: hit_edges.to_vec(),
                output: String::new(),
                stderr: String::new(),
            }
        }

        pub fn exception(code: u8) -> Self {
            ScriptedResponse {
                status_word: (code as u32) << 8,
                hit_edges: Vec::new(),
                output: String::new(),
                stderr: String::new(),
            }
        }

        pub fn crash(signal: u8, stderr: &str) -> Self {
            ScriptedResponse {
                status_word: signal as u32,
                hit_edges: Vec::new(),
                output: String::new(),
                stderr: stderr.to_string(),
            }
        }

        pub fn timeout() -> Self {
            ScriptedResponse {
                status_word: 1 << 16,
                hit_edges: Vec::new(),
                output: String::new(),
                stderr: String::new(),
            }
        }

        pub fn internal_error() -> Self {
            ScriptedResponse {
                status_word: 0xff00,
                hit_edges: Vec::new(),
                output: String::new(),
                stderr: String::new(),
            }
        }

        pub fn with_output(mut self, output: &str) -> Self {
            self.output = output.to_string();
            self
        }
    }

    type Responder = Box<dyn FnMut(u32, &str) -> ScriptedResponse + Send>;

    /// In-memory stand-in for a live engine child. The responder closure
    /// gets the 1-based call index and the program text and decides what
    /// the "child" does.
    pub(crate) struct ScriptedChannel {
        num_edges: u32,
        running: bool,
        pub spawn_count: u32,
        pub calls: u32,
        pub last_timeout: Option<Duration>,
        responder: Responder,
    }

    impl ScriptedChannel {
        pub fn new(num_edges: u32, responder: Responder) -> Self {
            ScriptedChannel {
                num_edges,
                running: false,
                spawn_count: 0,
                calls: 0,
                last_timeout: None,
                responder,
            }
        }

        pub fn edges_to_buf(num_edges: u32, hits: &[u32]) -> Vec<u8> {
            let mut buf = vec![0u8; bitmap_len(num_edges)];
            for &edge in hits {
                buf[(edge / 8) as usize] |= 1 << (edge % 8);
            }
            buf
        }
    }

    impl EngineChannel for ScriptedChannel {
        fn is_running(&self) -> bool {
            self.running
        }

        fn spawn(&mut self) -> Result<(), EngineError> {
            self.running = true;
            self.spawn_count += 1;
            Ok(())
        }

        fn stop(&mut self) {
            self.running = false;
        }

        fn run(&mut self, code: &str, timeout: Duration) -> Result<RawExecution, EngineError> {
            if !self.running {
                return Err(EngineError::Channel(
                    "engine child is not running".to_string(),
                ));
            }
            self.calls += 1;
            self.last_timeout = Some(timeout);
            let response = (self.responder)(self.calls, code);
            // Child death on timeout or signal, like the real transport.
            if response.status_word & (1 << 16) != 0
                || (response.status_word & 0xff != 0 && response.status_word != 0x4548)
            {
                self.running = false;
            }
            Ok(RawExecution {
                status_word: response.status_word,
                exec_time: Duration::from_millis(1),
                output: response.output,
                stderr: response.stderr,
                edges: Self::edges_to_buf(self.num_edges, &response.hit_edges),
            })
        }

        fn num_edges(&self) -> u32 {
            self.num_edges
        }
    }

    pub(crate) fn scripted_engine(
        num_edges: u32,
        responder: Responder,
    ) -> Engine<ScriptedChannel> {
        let channel = ScriptedChannel::new(num_edges, responder);
        Engine::initialize(channel, &EngineConfig::default()).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_utils::*;
    use super::*;

    #[test]
    fn test_execute_once_classifies_success() {
        let mut engine = scripted_engine(64, Box::new(|_, _| ScriptedResponse::success(&[1, 2])));
        let result = engine.execute_once("const x = 1;", Duration::from_millis(100), false).unwrap();
        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.num_hit_edges, 2);
        assert_eq!(result.num_new_edges, 0);
    }

    #[test]
    fn test_execute_once_classifies_exception_without_stderr() {
        let mut engine = scripted_engine(
            64,
            Box::new(|_, _| {
                let mut r = ScriptedResponse::exception(3);
                r.stderr = "noise".to_string();
                r
            }),
        );
        let result = engine.execute_once("throw 42;", Duration::from_millis(100), false).unwrap();
        assert_eq!(result.status, ExecutionStatus::ExceptionThrown(3));
        // stderr is a crash-only field.
        assert!(result.stderr.is_empty());
    }

    #[test]
    fn test_execute_once_populates_stderr_on_crash() {
        let mut engine = scripted_engine(
            64,
            Box::new(|_, _| ScriptedResponse::crash(11, "Segmentation fault")),
        );
        let result = engine.execute_once("boom();", Duration::from_millis(100), false).unwrap();
        assert_eq!(result.status, ExecutionStatus::Crash(11));
        assert_eq!(result.stderr, "Segmentation fault");
    }

    #[test]
    fn test_internal_error_respawns_and_retries_once() {
        let mut engine = scripted_engine(
            64,
            Box::new(|call, _| {
                if call == 1 {
                    ScriptedResponse::internal_error()
                } else {
                    ScriptedResponse::success(&[5])
                }
            }),
        );
        let result = engine.execute_once("1;", Duration::from_millis(100), false).unwrap();
        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(engine.channel.spawn_count, 2);
    }

    #[test]
    fn test_repeated_internal_error_relabelled_exception_crash() {
        let mut engine = scripted_engine(64, Box::new(|_, _| ScriptedResponse::internal_error()));
        let result = engine.execute_once("1;", Duration::from_millis(100), false).unwrap();
        assert_eq!(result.status, ExecutionStatus::ExceptionCrash);
        assert_eq!(engine.channel.calls, 2);
    }

    #[test]
    fn test_query_widens_timeout() {
        let mut engine = scripted_engine(64, Box::new(|_, _| ScriptedResponse::success(&[])));
        engine.execute_once("1;", Duration::from_millis(50), true).unwrap();
        assert_eq!(
            engine.channel.last_timeout,
            Some(Duration::from_millis(50 * 20))
        );
        engine.execute_once("1;", Duration::from_millis(50), false).unwrap();
        assert_eq!(engine.channel.last_timeout, Some(Duration::from_millis(50)));
    }

    #[test]
    fn test_timeout_invalidates_child_and_respawns_lazily() {
        let mut engine = scripted_engine(
            64,
            Box::new(|call, _| {
                if call == 1 {
                    ScriptedResponse::timeout()
                } else {
                    ScriptedResponse::success(&[])
                }
            }),
        );
        let result = engine.execute_once("while(true){}", Duration::from_millis(10), false).unwrap();
        assert_eq!(result.status, ExecutionStatus::Timeout);
        assert!(!engine.channel.is_running());
        engine.execute_once("1;", Duration::from_millis(10), false).unwrap();
        assert_eq!(engine.channel.spawn_count, 2);
    }

    #[test]
    fn test_restart_threshold_recycles_child() {
        let mut engine = {
            let channel = ScriptedChannel::new(64, Box::new(|_, _| ScriptedResponse::success(&[])));
            let config = EngineConfig {
                restart_threshold: 3,
                ..EngineConfig::default()
            };
            Engine::initialize(channel, &config).unwrap()
        };
        for _ in 0..7 {
            engine.execute_once("1;", Duration::from_millis(10), false).unwrap();
        }
        // Spawned once at initialize, then recycled after every 3rd run.
        assert!(engine.channel.spawn_count >= 3);
    }

    #[test]
    fn test_execute_commits_only_confirmed_edges() {
        // Edge 7 appears on both runs, edge 9 only on the first.
        let mut engine = scripted_engine(
            64,
            Box::new(|call, _| {
                if call == 1 {
                    ScriptedResponse::success(&[7, 9])
                } else {
                    ScriptedResponse::success(&[7])
                }
            }),
        );
        let result = engine.execute("var x = 1;", Duration::from_millis(100)).unwrap();
        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.num_new_edges, 1);
        assert!(engine.coverage().is_triggered(7));
        assert!(!engine.coverage().is_triggered(9));
        // Confirmation ran against a fresh child.
        assert_eq!(engine.channel.spawn_count, 2);
    }

    #[test]
    fn test_execute_reports_zero_when_nothing_new() {
        let mut engine = scripted_engine(64, Box::new(|_, _| ScriptedResponse::success(&[3])));
        let first = engine.execute("a;", Duration::from_millis(100)).unwrap();
        assert_eq!(first.num_new_edges, 1);
        let second = engine.execute("a;", Duration::from_millis(100)).unwrap();
        assert_eq!(second.num_new_edges, 0);
        // No suspects on the second call, so no confirmation restart.
        assert_eq!(engine.channel.calls, 3);
    }

    #[test]
    fn test_execute_confirm_uses_wider_timeout() {
        let mut engine = scripted_engine(64, Box::new(|_, _| ScriptedResponse::success(&[1])));
        engine.execute("a;", Duration::from_millis(100)).unwrap();
        // Last call was the confirmation run at 1.5x.
        assert_eq!(
            engine.channel.last_timeout,
            Some(Duration::from_millis(150))
        );
    }

    #[test]
    fn test_execute_returns_second_result_when_confirm_keeps_failing() {
        // Success with new edges, then timeout on every confirmation.
        let mut engine = scripted_engine(
            64,
            Box::new(|call, _| {
                if call % 2 == 1 {
                    ScriptedResponse::success(&[4])
                } else {
                    ScriptedResponse::timeout()
                }
            }),
        );
        let result = engine.execute("a;", Duration::from_millis(100)).unwrap();
        assert_eq!(result.status, ExecutionStatus::Timeout);
        assert!(!engine.coverage().is_triggered(4));
    }

    #[test]
    fn test_execute_safe_deterministic_program_settles_immediately() {
        let mut engine = scripted_engine(64, Box::new(|_, _| ScriptedResponse::success(&[10, 11])));
        let first = engine.execute_safe("var x = 1;", Duration::from_millis(100)).unwrap();
        assert_eq!(first.num_new_edges, 2);
        assert_eq!(first.unreliable_score, 0);
        // Re-running the identical program reports nothing new.
        let second = engine.execute_safe("var x = 1;", Duration::from_millis(100)).unwrap();
        assert_eq!(second.num_new_edges, 0);
        assert_eq!(second.unreliable_score, 0);
    }

    #[test]
    fn test_execute_safe_flaky_edges_raise_unreliable_score() {
        // A stable edge plus a fresh flaky edge on every 3rd call until
        // call 18, then fully deterministic.
        let mut engine = scripted_engine(
            512,
            Box::new(|call, _| {
                let mut edges = vec![1];
                if call % 3 == 0 && call <= 18 {
                    edges.push(100 + call);
                }
                ScriptedResponse::success(&edges)
            }),
        );
        let result = engine.execute_safe("flaky();", Duration::from_millis(100)).unwrap();
        assert_eq!(result.num_new_edges, 1);
        assert!(result.unreliable_score > 0);
        assert!(result.unreliable_score < 10);
        // The flaky edges were neutralized into the map along the way.
        assert!(engine.coverage().is_triggered(103));
        assert!(engine.coverage().is_triggered(118));
    }

    #[test]
    fn test_execute_safe_gives_up_at_cap_with_max_score() {
        // A brand-new edge on every single run: never stabilizes.
        let mut engine = scripted_engine(
            8192,
            Box::new(|call, _| ScriptedResponse::success(&[call])),
        );
        let result = engine.execute_safe("chaos();", Duration::from_millis(100)).unwrap();
        assert_eq!(result.unreliable_score, 10);
    }

    #[test]
    fn test_no_backslide_across_failures() {
        let mut engine = scripted_engine(
            64,
            Box::new(|call, _| match call {
                1 | 2 => ScriptedResponse::success(&[20]),
                3 => ScriptedResponse::crash(9, "boom"),
                4 => ScriptedResponse::timeout(),
                _ => ScriptedResponse::exception(1),
            }),
        );
        engine.execute("a;", Duration::from_millis(100)).unwrap();
        assert!(engine.coverage().is_triggered(20));
        engine.execute("b;", Duration::from_millis(100)).unwrap();
        assert!(engine.coverage().is_triggered(20));
        engine.execute("c;", Duration::from_millis(100)).unwrap();
        assert!(engine.coverage().is_triggered(20));
        engine.execute("d;", Duration::from_millis(100)).unwrap();
        assert!(engine.coverage().is_triggered(20));
    }

    #[test]
    fn test_backup_restore_rolls_coverage_back() {
        let mut engine = scripted_engine(64, Box::new(|_, _| ScriptedResponse::success(&[30, 31])));
        let snapshot = engine.backup_coverage();
        let first = engine.execute("n();", Duration::from_millis(100)).unwrap();
        assert_eq!(first.num_new_edges, 2);
        engine.restore_coverage(&snapshot);
        let again = engine.execute("n();", Duration::from_millis(100)).unwrap();
        assert_eq!(again.num_new_edges, 2);
    }

    #[test]
    fn test_required_streak_escalation() {
        assert_eq!(required_streak(1), 3);
        assert_eq!(required_streak(5), 3);
        assert_eq!(required_streak(6), 5);
        assert_eq!(required_streak(10), 5);
        assert_eq!(required_streak(11), 7);
        assert_eq!(required_streak(15), 7);
        assert_eq!(required_streak(16), 10);
        assert_eq!(required_streak(25), 10);
        assert_eq!(required_streak(26), 15);
        assert_eq!(required_streak(50), 15);
        assert_eq!(required_streak(51), 25);
        assert_eq!(required_streak(134), 25);
    }

    #[test]
    fn test_calibrate_commits_baseline() {
        let mut engine = scripted_engine(64, Box::new(|_, _| ScriptedResponse::success(&[40, 41])));
        engine.calibrate().unwrap();
        assert!(engine.coverage().is_triggered(40));
        assert!(engine.coverage().is_triggered(41));
        // The baseline no longer registers as new.
        let result = engine.execute("x;", Duration::from_millis(100)).unwrap();
        assert_eq!(result.num_new_edges, 0);
    }

    #[test]
    fn test_last_run_hit_reflects_most_recent_buffer() {
        let mut engine = scripted_engine(
            64,
            Box::new(|call, _| {
                if call == 1 {
                    ScriptedResponse::success(&[2])
                } else {
                    ScriptedResponse::success(&[3])
                }
            }),
        );
        engine.execute_once("a;", Duration::from_millis(50), false).unwrap();
        assert!(engine.last_run_hit(2));
        assert!(!engine.last_run_hit(3));
        engine.execute_once("b;", Duration::from_millis(50), false).unwrap();
        assert!(engine.last_run_hit(3));
        assert!(!engine.last_run_hit(2));
    }
}
