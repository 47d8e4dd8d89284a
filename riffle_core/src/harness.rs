use serde::Deserialize;

/// Classified outcome of a single engine invocation.
///
/// These are routed results, not host-language errors: the fuzzing loop
/// branches on them. Only channel-level faults (broken pipes, failed
/// spawns) surface as `EngineError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// The child ran the program to completion and exited cleanly with code 0.
    Success,
    /// Clean exit with a nonzero code; the payload is the exit code the
    /// harness reported (the uncaught-exception path).
    ExceptionThrown(u8),
    /// The child was terminated by a signal; the payload is the signal number.
    Crash(u8),
    /// A known-benign harness artifact (auxiliary worker-process forks die
    /// with a fixed status word). Routed like a crash, triaged separately.
    ExceptionCrash,
    /// The watchdog fired and the child was killed.
    Timeout,
    /// Harness-level failure distinct from anything the target did. The
    /// engine retries once transparently before surfacing it.
    InternalError,
}

impl ExecutionStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionStatus::Success)
    }

    /// True for the outcomes that produce a crash artifact on disk.
    pub fn is_crash(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Crash(_) | ExecutionStatus::ExceptionCrash
        )
    }

    /// Short lowercase label used in log lines and artifact directory names.
    pub fn label(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::ExceptionThrown(_) => "exception",
            ExecutionStatus::Crash(_) => "crash",
            ExecutionStatus::ExceptionCrash => "exception_crash",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::InternalError => "internal_error",
        }
    }
}

fn default_output_function() -> String {
    "fuzzilli".to_string()
}

fn default_print_tag() -> String {
    "FUZZILLI_PRINT".to_string()
}

fn default_crash_tag() -> String {
    "FUZZILLI_CRASH".to_string()
}

fn default_timeout_word() -> u32 {
    1 << 16
}

fn default_internal_error_word() -> u32 {
    0xff00
}

fn default_exception_crash_word() -> u32 {
    0x4548
}

fn default_shm_size() -> usize {
    0x100000
}

/// Status-word constants and channel names for one native harness build.
///
/// The special words were observed empirically on a specific harness
/// version and do not generalize, so they are carried as a configuration
/// table rather than inline literals. A different engine binding is a new
/// table entry, not a code change.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct HarnessProfile {
    /// Name of the global function the target program calls to reach the
    /// structured output channel.
    #[serde(default = "default_output_function")]
    pub output_function: String,
    /// First argument selecting the print command on the output channel.
    #[serde(default = "default_print_tag")]
    pub print_tag: String,
    /// First argument selecting the deliberate-crash command.
    #[serde(default = "default_crash_tag")]
    pub crash_tag: String,
    /// Bit set in the status word when the watchdog killed the child.
    #[serde(default = "default_timeout_word")]
    pub timeout_word: u32,
    /// Exact status word for a harness-level failure.
    #[serde(default = "default_internal_error_word")]
    pub internal_error_word: u32,
    /// Exact status word for the benign worker-fork artifact.
    #[serde(default = "default_exception_crash_word")]
    pub exception_crash_word: u32,
    /// Size in bytes of the shared-memory coverage region (4-byte edge-count
    /// header followed by one bit per edge).
    #[serde(default = "default_shm_size")]
    pub shm_size: usize,
}

impl Default for HarnessProfile {
    fn default() -> Self {
        HarnessProfile {
            output_function: default_output_function(),
            print_tag: default_print_tag(),
            crash_tag: default_crash_tag(),
            timeout_word: default_timeout_word(),
            internal_error_word: default_internal_error_word(),
            exception_crash_word: default_exception_crash_word(),
            shm_size: default_shm_size(),
        }
    }
}

impl HarnessProfile {
    /// Upper bound on edges the shared-memory region can describe.
    pub fn max_edges(&self) -> u32 {
        ((self.shm_size - 4) * 8) as u32
    }

    /// Decode a raw status word into a classified outcome.
    ///
    /// Order matters: the special words are matched exactly before any
    /// bit-pattern test, otherwise the worker-fork word would be misread as
    /// "killed by signal 0x48".
    pub fn decode(&self, raw: u32) -> ExecutionStatus {
        if raw == self.exception_crash_word {
            return ExecutionStatus::ExceptionCrash;
        }
        if raw == self.internal_error_word {
            return ExecutionStatus::InternalError;
        }
        if raw & self.timeout_word != 0 {
            return ExecutionStatus::Timeout;
        }
        let signal = (raw & 0xff) as u8;
        if signal != 0 {
            return ExecutionStatus::Crash(signal);
        }
        let exit_code = ((raw >> 8) & 0xff) as u8;
        if exit_code == 0 {
            ExecutionStatus::Success
        } else {
            ExecutionStatus::ExceptionThrown(exit_code)
        }
    }

    /// Render a call on the structured output channel.
    pub fn print_call(&self, expression: &str) -> String {
        format!(
            "{}('{}', {});",
            self.output_function, self.print_tag, expression
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> HarnessProfile {
        HarnessProfile::default()
    }

    #[test]
    fn test_decode_clean_exit_zero_is_success() {
        assert_eq!(profile().decode(0), ExecutionStatus::Success);
    }

    #[test]
    fn test_decode_nonzero_exit_is_exception() {
        assert_eq!(profile().decode(1 << 8), ExecutionStatus::ExceptionThrown(1));
        assert_eq!(
            profile().decode(42 << 8),
            ExecutionStatus::ExceptionThrown(42)
        );
    }

    #[test]
    fn test_decode_signal_byte_is_crash() {
        assert_eq!(profile().decode(11), ExecutionStatus::Crash(11));
        assert_eq!(profile().decode(6), ExecutionStatus::Crash(6));
    }

    #[test]
    fn test_decode_timeout_bit() {
        assert_eq!(profile().decode(1 << 16), ExecutionStatus::Timeout);
    }

    #[test]
    fn test_decode_special_words_take_precedence() {
        // 0x4548 has a nonzero low byte; it must not decode as Crash(0x48).
        assert_eq!(profile().decode(0x4548), ExecutionStatus::ExceptionCrash);
        // 0xff00 looks like exit code 0xff; it must not decode as an exception.
        assert_eq!(profile().decode(0xff00), ExecutionStatus::InternalError);
    }

    #[test]
    fn test_status_labels_and_predicates() {
        assert!(ExecutionStatus::Success.is_success());
        assert!(!ExecutionStatus::Timeout.is_success());
        assert!(ExecutionStatus::Crash(9).is_crash());
        assert!(ExecutionStatus::ExceptionCrash.is_crash());
        assert!(!ExecutionStatus::ExceptionThrown(1).is_crash());
        assert_eq!(ExecutionStatus::ExceptionCrash.label(), "exception_crash");
    }

    #[test]
    fn test_print_call_renders_configured_channel() {
        let call = profile().print_call("'hits=' + n");
        assert_eq!(call, "fuzzilli('FUZZILLI_PRINT', 'hits=' + n);");
    }

    #[test]
    fn test_max_edges_accounts_for_header() {
        let p = profile();
        assert_eq!(p.max_edges(), ((0x100000 - 4) * 8) as u32);
    }
}
