use std::collections::BTreeMap;

use log::{debug, trace};
use rand::Rng;

use crate::engine::{Engine, EngineChannel, EngineError};
use crate::harness::{ExecutionStatus, HarnessProfile};
use crate::state::{JsType, SyntaxClass, TestcaseState, balanced_brace_intervals};

/// Counter variable injected by the line-classification probes; obscure
/// enough not to collide with program identifiers.
const COUNTER_NAME: &str = "__riffle_cnt";

/// Output-channel tags the instrumented programs report under.
const COUNT_TAG: &str = "rcount";
const TYPE_TAG: &str = "rtype";
const LENGTH_TAG: &str = "rlen";
const ARITY_TAG: &str = "rarity";

/// A probe line executing at least this often marks a hot loop body.
const HOT_LINE_THRESHOLD: u64 = 1000;

const RUNTIME_SAMPLES: u32 = 3;
const MAX_INDEX_SAMPLES: usize = 8;
const MAX_PROBE_TARGETS: usize = 64;

/// Runtime classifier injected ahead of type probes. The strings it
/// returns are the wire vocabulary `JsType::from_wire` decodes.
const CLASSIFY_HELPER: &str = r#"function __riffle_classify(x) {
  if (x === undefined) return 'undefined';
  if (x === null) return 'null';
  var t = typeof x;
  if (t === 'boolean') return 'boolean';
  if (t === 'number') return Number.isFinite(x) ? 'real_number' : 'special_number';
  if (t === 'bigint') return 'bigint';
  if (t === 'string') return 'string';
  if (t === 'symbol') return 'symbol';
  if (t === 'function') {
    var cn = x.constructor ? x.constructor.name : '';
    if (cn === 'AsyncFunction') return 'async_function';
    if (cn === 'GeneratorFunction') return 'generator_function';
    return 'function';
  }
  if (x instanceof Error) {
    return (x.constructor && x.constructor.name ? x.constructor.name : 'Error').toLowerCase();
  }
  var name = Object.prototype.toString.call(x).slice(8, -1);
  if (name === 'global' || name === 'Window') return 'global_object';
  if (name.indexOf('WebAssembly.') === 0) return 'wasm_' + name.slice(12).toLowerCase();
  var plain = name.replace(/ /g, '_').toLowerCase();
  if (plain === 'object') {
    return x.constructor === Object || x.constructor === undefined ? 'object' : 'unknown_object';
  }
  return plain;
}"#;

/// Compute a fresh state for `text` by dynamic probing: classify every
/// insertion position, then discover types, array lengths and function
/// arities at the statement-insertable positions, then measure runtime.
pub fn compute_state<C: EngineChannel, R: Rng + ?Sized>(
    engine: &mut Engine<C>,
    text: &str,
    rng: &mut R,
) -> Result<TestcaseState, EngineError> {
    let lines: Vec<String> = text.lines().map(|l| l.to_string()).collect();
    let mut state = TestcaseState::new(lines.len(), text.len());

    classify_lines(engine, &lines, &mut state)?;
    state.brace_intervals = balanced_brace_intervals(text);

    let targets = collect_probe_targets(text);
    if !targets.is_empty() {
        probe_types(engine, &lines, &targets, &mut state)?;
        probe_arrays_and_functions(engine, &lines, &mut state, rng)?;
    }

    state.expected_runtime_ms = measure_expected_runtime(engine, text)?;
    debug!(
        "Probed state: {} insertable of {} positions, {} typed names, runtime {}ms",
        state.insertable_line_count(),
        state.number_of_lines + 1,
        state.variable_types.len(),
        state.expected_runtime_ms
    );
    Ok(state)
}

/// Average wall-clock runtime over a few plain executions, in
/// milliseconds. Falls back to the timeout when nothing succeeds.
pub fn measure_expected_runtime<C: EngineChannel>(
    engine: &mut Engine<C>,
    text: &str,
) -> Result<u64, EngineError> {
    let timeout = engine.default_timeout();
    let mut total_ms = 0u64;
    let mut successes = 0u64;
    for _ in 0..RUNTIME_SAMPLES {
        let result = engine.execute_once(text, timeout, false)?;
        if result.status.is_success() {
            total_ms += result.exec_time.as_millis() as u64;
            successes += 1;
        }
    }
    if successes == 0 {
        return Ok(timeout.as_millis() as u64);
    }
    Ok(total_ms / successes)
}

/// Probe every insertion position with the three syntax variants, in
/// preference order, and record the execution-count marks from the first
/// variant that runs cleanly.
fn classify_lines<C: EngineChannel>(
    engine: &mut Engine<C>,
    lines: &[String],
    state: &mut TestcaseState,
) -> Result<(), EngineError> {
    let timeout = engine.default_timeout();
    for at in 0..=lines.len() {
        let mut threw = false;
        let mut timed_out = false;
        for class in [
            SyntaxClass::Statement,
            SyntaxClass::TrailingComma,
            SyntaxClass::LeadingComma,
        ] {
            let code = instrument_count_probe(engine.profile(), lines, at, class);
            let result = engine.execute_once(&code, timeout, true)?;
            match result.status {
                ExecutionStatus::Success => {
                    state.mark_line(at, class);
                    if let Some(count) = parse_count(&result.output) {
                        if count == 0 {
                            state.dead_lines.push(at);
                        } else if count >= HOT_LINE_THRESHOLD {
                            state.hot_lines.push(at);
                        }
                    }
                    break;
                }
                ExecutionStatus::Timeout => timed_out = true,
                _ => threw = true,
            }
        }
        if threw {
            state.exception_prone_lines.push(at);
        }
        if timed_out {
            state.timeout_prone_lines.push(at);
        }
    }
    state.dead_lines.sort_unstable();
    state.hot_lines.sort_unstable();
    state.exception_prone_lines.sort_unstable();
    state.timeout_prone_lines.sort_unstable();
    Ok(())
}

/// Build one classification variant: counter declaration on top, the
/// counting side effect spliced in at `at` in the requested syntax form,
/// and a count report at the end.
fn instrument_count_probe(
    profile: &HarnessProfile,
    lines: &[String],
    at: usize,
    class: SyntaxClass,
) -> String {
    let probe = match class {
        SyntaxClass::Statement => format!("{COUNTER_NAME}++;"),
        SyntaxClass::TrailingComma => format!("{COUNTER_NAME}++,"),
        SyntaxClass::LeadingComma => format!(",{COUNTER_NAME}++"),
        SyntaxClass::NotInsertable => String::new(),
    };
    let report = profile.print_call(&format!("'{COUNT_TAG} ' + {COUNTER_NAME}"));
    let mut out = String::new();
    out.push_str(&format!("var {COUNTER_NAME} = 0;\n"));
    for line in &lines[..at] {
        out.push_str(line);
        out.push('\n');
    }
    out.push_str(&probe);
    out.push('\n');
    for line in &lines[at..] {
        out.push_str(line);
        out.push('\n');
    }
    out.push_str(&report);
    out
}

fn parse_count(output: &str) -> Option<u64> {
    tagged_fields(output, COUNT_TAG)
        .first()
        .and_then(|fields| fields.first())
        .and_then(|v| v.parse().ok())
}

/// Lines of the output channel starting with `tag`, split into fields.
fn tagged_fields<'a>(output: &'a str, tag: &str) -> Vec<Vec<&'a str>> {
    output
        .lines()
        .filter_map(|line| {
            let rest = line.trim().strip_prefix(tag)?.strip_prefix(' ')?;
            Some(rest.split_whitespace().collect())
        })
        .collect()
}

/// One guarded classification print for `target`, reporting under
/// `rtype <line> <target> <category>`.
fn type_probe_statement(profile: &HarnessProfile, line: usize, target: &str) -> String {
    let call = profile.print_call(&format!(
        "'{TYPE_TAG} {line} {target} ' + __riffle_classify({target})"
    ));
    format!("try {{ {call} }} catch (e) {{}}")
}

/// Batched type discovery: one execution per statement-insertable line,
/// with every target probed behind its own exception guard so one bad
/// read cannot abort the rest.
fn probe_types<C: EngineChannel>(
    engine: &mut Engine<C>,
    lines: &[String],
    targets: &[String],
    state: &mut TestcaseState,
) -> Result<(), EngineError> {
    let timeout = engine.default_timeout();
    let probe_lines = state.statement_lines.clone();
    let mut observed_defined: BTreeMap<String, bool> = BTreeMap::new();
    for at in probe_lines {
        let batch: Vec<String> = targets
            .iter()
            .map(|t| type_probe_statement(engine.profile(), at, t))
            .collect();
        let code = instrument_statement_batch(lines, at, &batch);
        let result = engine.execute_once(&code, timeout, true)?;
        if !result.status.is_success() {
            trace!("Type probe at line {at} did not run cleanly, skipping");
            continue;
        }
        for fields in tagged_fields(&result.output, TYPE_TAG) {
            let [line_str, name, category] = fields.as_slice() else {
                continue;
            };
            let Ok(line) = line_str.parse::<usize>() else {
                continue;
            };
            let ty = JsType::from_wire(category);
            let defined = observed_defined.entry(name.to_string()).or_insert(false);
            if ty == JsType::Undefined {
                continue;
            }
            *defined = true;
            let observations = state.variable_types.entry(name.to_string()).or_default();
            if !observations.contains(&(line, ty)) {
                observations.push((line, ty));
                observations.sort_by_key(|(l, _)| *l);
            }
        }
    }
    state.unused_names = observed_defined
        .into_iter()
        .filter_map(|(name, defined)| (!defined).then_some(name))
        .collect();
    Ok(())
}

/// Splice a batch of probe statements, joined on one line, in at `at`,
/// with the classifier helper prepended.
fn instrument_statement_batch(lines: &[String], at: usize, batch: &[String]) -> String {
    let mut out = String::new();
    out.push_str(CLASSIFY_HELPER);
    out.push('\n');
    for line in &lines[..at] {
        out.push_str(line);
        out.push('\n');
    }
    out.push_str(&batch.join(" "));
    out.push('\n');
    for line in &lines[at..] {
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Second discovery pass over names whose type is already known: array
/// lengths (with a bounded element-type sample for long arrays) and
/// function arities.
fn probe_arrays_and_functions<C: EngineChannel, R: Rng + ?Sized>(
    engine: &mut Engine<C>,
    lines: &[String],
    state: &mut TestcaseState,
    rng: &mut R,
) -> Result<(), EngineError> {
    let timeout = engine.default_timeout();
    // (line, probe statements) batched per line, like the type pass.
    let mut batches: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    for (name, observations) in state.variable_types.iter() {
        for (line, ty) in observations {
            if ty.is_array_like() {
                let call = engine.profile().print_call(&format!(
                    "'{LENGTH_TAG} {line} {name} ' + {name}.length"
                ));
                batches
                    .entry(*line)
                    .or_default()
                    .push(format!("try {{ {call} }} catch (e) {{}}"));
            } else if ty.is_function() {
                let call = engine
                    .profile()
                    .print_call(&format!("'{ARITY_TAG} {name} ' + {name}.length"));
                batches
                    .entry(*line)
                    .or_default()
                    .push(format!("try {{ {call} }} catch (e) {{}}"));
            }
        }
    }

    for (at, batch) in batches {
        let code = instrument_statement_batch(lines, at, &batch);
        let result = engine.execute_once(&code, timeout, true)?;
        if !result.status.is_success() {
            continue;
        }
        for fields in tagged_fields(&result.output, LENGTH_TAG) {
            let [line_str, name, len_str] = fields.as_slice() else {
                continue;
            };
            let (Ok(line), Ok(len)) = (line_str.parse::<usize>(), len_str.parse::<u64>()) else {
                continue;
            };
            let observations = state.array_lengths.entry(name.to_string()).or_default();
            match observations.iter_mut().find(|(l, _)| *l == line) {
                Some((_, lengths)) => {
                    if !lengths.contains(&len) {
                        lengths.push(len);
                    }
                }
                None => {
                    observations.push((line, vec![len]));
                    observations.sort_by_key(|(l, _)| *l);
                }
            }
        }
        for fields in tagged_fields(&result.output, ARITY_TAG) {
            let [name, arity_str] = fields.as_slice() else {
                continue;
            };
            if let Ok(arity) = arity_str.parse::<usize>() {
                state.function_arities.insert(name.to_string(), arity);
            }
        }
    }

    probe_long_array_elements(engine, lines, state, rng)?;
    Ok(())
}

/// For arrays too long to enumerate, probe the types of a bounded index
/// sample: the first few slots, the last one, and a random pick of
/// integer literals appearing in the source.
fn probe_long_array_elements<C: EngineChannel, R: Rng + ?Sized>(
    engine: &mut Engine<C>,
    lines: &[String],
    state: &mut TestcaseState,
    rng: &mut R,
) -> Result<(), EngineError> {
    let timeout = engine.default_timeout();
    let source_literals = integer_literals(&lines.join("\n"));
    let mut batches: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    for (name, observations) in state.array_lengths.iter() {
        for (line, lengths) in observations {
            let Some(&len) = lengths.iter().max() else {
                continue;
            };
            if len <= MAX_INDEX_SAMPLES as u64 {
                continue;
            }
            let mut sample: Vec<u64> = vec![0, 1, 2, len - 1];
            let mut candidates: Vec<u64> = source_literals
                .iter()
                .copied()
                .filter(|&l| l < len && !sample.contains(&l))
                .collect();
            while sample.len() < MAX_INDEX_SAMPLES && !candidates.is_empty() {
                let pick = rng.random_range(0..candidates.len());
                sample.push(candidates.swap_remove(pick));
            }
            for idx in sample {
                let target = format!("{name}[{idx}]");
                batches
                    .entry(*line)
                    .or_default()
                    .push(type_probe_statement(engine.profile(), *line, &target));
            }
        }
    }

    for (at, batch) in batches {
        let code = instrument_statement_batch(lines, at, &batch);
        let result = engine.execute_once(&code, timeout, true)?;
        if !result.status.is_success() {
            continue;
        }
        for fields in tagged_fields(&result.output, TYPE_TAG) {
            let [line_str, name, category] = fields.as_slice() else {
                continue;
            };
            let Ok(line) = line_str.parse::<usize>() else {
                continue;
            };
            let ty = JsType::from_wire(category);
            if ty == JsType::Undefined {
                continue;
            }
            let observations = state.variable_types.entry(name.to_string()).or_default();
            if !observations.contains(&(line, ty)) {
                observations.push((line, ty));
                observations.sort_by_key(|(l, _)| *l);
            }
        }
    }
    Ok(())
}

pub(crate) fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$'
}

pub(crate) fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$'
}

/// A canonical numbered name like `v0` or `f12`.
fn is_numbered_name(ident: &str) -> bool {
    let mut chars = ident.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
        && ident.len() > 1
        && chars.all(|c| c.is_ascii_digit())
}

fn integer_literals(text: &str) -> Vec<u64> {
    let mut literals = Vec::new();
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i].is_ascii_digit() && (i == 0 || !is_ident_char(chars[i - 1])) {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            let next = chars.get(i).copied();
            if next == Some('.') || next.is_some_and(is_ident_char) {
                // A float or digit-prefixed token, consume the tail whole.
                while i < chars.len() && (chars[i] == '.' || is_ident_char(chars[i])) {
                    i += 1;
                }
            } else if let Ok(value) = chars[start..i].iter().collect::<String>().parse() {
                if !literals.contains(&value) {
                    literals.push(value);
                }
            }
        } else {
            i += 1;
        }
    }
    literals
}

/// Names and simple access expressions worth probing: declared
/// identifiers, canonical numbered names, one-level property accesses
/// and literal index accesses. Order of first appearance, capped.
pub fn collect_probe_targets(text: &str) -> Vec<String> {
    const KEYWORDS: &[&str] = &[
        "var", "let", "const", "function", "class", "return", "if", "else", "for", "while", "do",
        "switch", "case", "default", "break", "continue", "new", "delete", "typeof", "instanceof",
        "in", "of", "this", "try", "catch", "finally", "throw", "void", "yield", "await", "async",
        "null", "true", "false", "undefined", "with", "debugger", "super", "extends", "static",
        "get", "set",
    ];
    const DECL_KEYWORDS: &[&str] = &["var", "let", "const", "function", "class"];

    let chars: Vec<char> = text.chars().collect();
    let mut targets: Vec<String> = Vec::new();
    let mut add = |t: String, targets: &mut Vec<String>| {
        if targets.len() < MAX_PROBE_TARGETS && !targets.contains(&t) {
            targets.push(t);
        }
    };

    let mut prev_ident: Option<String> = None;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '/' && chars.get(i + 1) == Some(&'/') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
        } else if c == '/' && chars.get(i + 1) == Some(&'*') {
            i += 2;
            while i + 1 < chars.len() && !(chars[i] == '*' && chars[i + 1] == '/') {
                i += 1;
            }
            i += 2;
        } else if c == '"' || c == '\'' || c == '`' {
            i += 1;
            while i < chars.len() && chars[i] != c {
                if chars[i] == '\\' {
                    i += 1;
                }
                i += 1;
            }
            i += 1;
        } else if is_ident_start(c) {
            let start = i;
            while i < chars.len() && is_ident_char(chars[i]) {
                i += 1;
            }
            let ident: String = chars[start..i].iter().collect();
            if !KEYWORDS.contains(&ident.as_str()) && ident != COUNTER_NAME {
                let declared = prev_ident
                    .as_deref()
                    .is_some_and(|p| DECL_KEYWORDS.contains(&p));
                if declared || is_numbered_name(&ident) {
                    add(ident.clone(), &mut targets);
                }
                // One-level property access: a.b
                if chars.get(i) == Some(&'.')
                    && chars.get(i + 1).copied().is_some_and(is_ident_start)
                {
                    let mut j = i + 1;
                    while j < chars.len() && is_ident_char(chars[j]) {
                        j += 1;
                    }
                    let prop: String = chars[i + 1..j].iter().collect();
                    add(format!("{ident}.{prop}"), &mut targets);
                }
                // Literal index access: a[3]
                if chars.get(i) == Some(&'[')
                    && chars.get(i + 1).copied().is_some_and(|c| c.is_ascii_digit())
                {
                    let mut j = i + 1;
                    while j < chars.len() && chars[j].is_ascii_digit() {
                        j += 1;
                    }
                    if chars.get(j) == Some(&']') {
                        let idx: String = chars[i + 1..j].iter().collect();
                        add(format!("{ident}[{idx}]"), &mut targets);
                    }
                }
            }
            prev_ident = Some(ident);
        } else {
            if !c.is_whitespace() {
                prev_ident = None;
            }
            i += 1;
        }
    }
    targets
}
