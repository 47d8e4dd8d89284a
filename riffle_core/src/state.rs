use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use bincode::{Decode, Encode};
use thiserror::Error;

/// On-disk schema version written ahead of every serialized state.
/// Version 1 predates hot-line tracking and the reliability score.
const STATE_SCHEMA_VERSION: u32 = 2;

#[derive(Error, Debug)]
pub enum StateError {
    #[error("Unsupported state schema version {0}")]
    UnsupportedSchema(u32),
    #[error("State decode failed: {0}")]
    Decode(String),
    #[error("State encode failed: {0}")]
    Encode(String),
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StateError {
    fn from(err: std::io::Error) -> Self {
        StateError::Io(err.to_string())
    }
}

/// Coarse runtime-type classification of a JavaScript value, as reported
/// by the probe harness. Closed set; the wire strings in `from_wire` /
/// `to_wire` are the only place the names exist as text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
pub enum JsType {
    Undefined,
    Null,
    Boolean,
    RealNumber,
    SpecialNumber,
    BigInt,
    String,
    Symbol,
    Function,
    AsyncFunction,
    GeneratorFunction,
    Array,
    Int8Array,
    Uint8Array,
    Uint8ClampedArray,
    Int16Array,
    Uint16Array,
    Int32Array,
    Uint32Array,
    Float32Array,
    Float64Array,
    BigInt64Array,
    BigUint64Array,
    ArrayBuffer,
    SharedArrayBuffer,
    DataView,
    Set,
    Map,
    WeakSet,
    WeakMap,
    WeakRef,
    RegExp,
    Date,
    Promise,
    Proxy,
    Error,
    TypeError,
    RangeError,
    SyntaxError,
    ReferenceError,
    EvalError,
    UriError,
    AggregateError,
    ArrayIterator,
    MapIterator,
    SetIterator,
    StringIterator,
    RegExpStringIterator,
    Generator,
    WasmModule,
    WasmInstance,
    WasmMemory,
    WasmTable,
    WasmGlobal,
    FinalizationRegistry,
    Object,
    GlobalObject,
    UnknownObject,
}

impl JsType {
    /// Decode the category string the probe harness prints. Anything the
    /// table does not know collapses into the catch-all bucket.
    pub fn from_wire(s: &str) -> JsType {
        match s {
            "undefined" => JsType::Undefined,
            "null" => JsType::Null,
            "boolean" => JsType::Boolean,
            "real_number" => JsType::RealNumber,
            "special_number" => JsType::SpecialNumber,
            "bigint" => JsType::BigInt,
            "string" => JsType::String,
            "symbol" => JsType::Symbol,
            "function" => JsType::Function,
            "async_function" => JsType::AsyncFunction,
            "generator_function" => JsType::GeneratorFunction,
            "array" => JsType::Array,
            "int8array" => JsType::Int8Array,
            "uint8array" => JsType::Uint8Array,
            "uint8clampedarray" => JsType::Uint8ClampedArray,
            "int16array" => JsType::Int16Array,
            "uint16array" => JsType::Uint16Array,
            "int32array" => JsType::Int32Array,
            "uint32array" => JsType::Uint32Array,
            "float32array" => JsType::Float32Array,
            "float64array" => JsType::Float64Array,
            "bigint64array" => JsType::BigInt64Array,
            "biguint64array" => JsType::BigUint64Array,
            "arraybuffer" => JsType::ArrayBuffer,
            "sharedarraybuffer" => JsType::SharedArrayBuffer,
            "dataview" => JsType::DataView,
            "set" => JsType::Set,
            "map" => JsType::Map,
            "weakset" => JsType::WeakSet,
            "weakmap" => JsType::WeakMap,
            "weakref" => JsType::WeakRef,
            "regexp" => JsType::RegExp,
            "date" => JsType::Date,
            "promise" => JsType::Promise,
            "proxy" => JsType::Proxy,
            "error" => JsType::Error,
            "typeerror" => JsType::TypeError,
            "rangeerror" => JsType::RangeError,
            "syntaxerror" => JsType::SyntaxError,
            "referenceerror" => JsType::ReferenceError,
            "evalerror" => JsType::EvalError,
            "urierror" => JsType::UriError,
            "aggregateerror" => JsType::AggregateError,
            "array_iterator" => JsType::ArrayIterator,
            "map_iterator" => JsType::MapIterator,
            "set_iterator" => JsType::SetIterator,
            "string_iterator" => JsType::StringIterator,
            "regexp_string_iterator" => JsType::RegExpStringIterator,
            "generator" => JsType::Generator,
            "wasm_module" => JsType::WasmModule,
            "wasm_instance" => JsType::WasmInstance,
            "wasm_memory" => JsType::WasmMemory,
            "wasm_table" => JsType::WasmTable,
            "wasm_global" => JsType::WasmGlobal,
            "finalizationregistry" => JsType::FinalizationRegistry,
            "object" => JsType::Object,
            "global_object" => JsType::GlobalObject,
            _ => JsType::UnknownObject,
        }
    }

    pub fn to_wire(self) -> &'static str {
        match self {
            JsType::Undefined => "undefined",
            JsType::Null => "null",
            JsType::Boolean => "boolean",
            JsType::RealNumber => "real_number",
            JsType::SpecialNumber => "special_number",
            JsType::BigInt => "bigint",
            JsType::String => "string",
            JsType::Symbol => "symbol",
            JsType::Function => "function",
            JsType::AsyncFunction => "async_function",
            JsType::GeneratorFunction => "generator_function",
            JsType::Array => "array",
            JsType::Int8Array => "int8array",
            JsType::Uint8Array => "uint8array",
            JsType::Uint8ClampedArray => "uint8clampedarray",
            JsType::Int16Array => "int16array",
            JsType::Uint16Array => "uint16array",
            JsType::Int32Array => "int32array",
            JsType::Uint32Array => "uint32array",
            JsType::Float32Array => "float32array",
            JsType::Float64Array => "float64array",
            JsType::BigInt64Array => "bigint64array",
            JsType::BigUint64Array => "biguint64array",
            JsType::ArrayBuffer => "arraybuffer",
            JsType::SharedArrayBuffer => "sharedarraybuffer",
            JsType::DataView => "dataview",
            JsType::Set => "set",
            JsType::Map => "map",
            JsType::WeakSet => "weakset",
            JsType::WeakMap => "weakmap",
            JsType::WeakRef => "weakref",
            JsType::RegExp => "regexp",
            JsType::Date => "date",
            JsType::Promise => "promise",
            JsType::Proxy => "proxy",
            JsType::Error => "error",
            JsType::TypeError => "typeerror",
            JsType::RangeError => "rangeerror",
            JsType::SyntaxError => "syntaxerror",
            JsType::ReferenceError => "referenceerror",
            JsType::EvalError => "evalerror",
            JsType::UriError => "urierror",
            JsType::AggregateError => "aggregateerror",
            JsType::ArrayIterator => "array_iterator",
            JsType::MapIterator => "map_iterator",
            JsType::SetIterator => "set_iterator",
            JsType::StringIterator => "string_iterator",
            JsType::RegExpStringIterator => "regexp_string_iterator",
            JsType::Generator => "generator",
            JsType::WasmModule => "wasm_module",
            JsType::WasmInstance => "wasm_instance",
            JsType::WasmMemory => "wasm_memory",
            JsType::WasmTable => "wasm_table",
            JsType::WasmGlobal => "wasm_global",
            JsType::FinalizationRegistry => "finalizationregistry",
            JsType::Object => "object",
            JsType::GlobalObject => "global_object",
            JsType::UnknownObject => "unknown_object",
        }
    }

    /// Indexable, length-bearing kinds the array-length probe applies to.
    pub fn is_array_like(self) -> bool {
        matches!(
            self,
            JsType::Array
                | JsType::Int8Array
                | JsType::Uint8Array
                | JsType::Uint8ClampedArray
                | JsType::Int16Array
                | JsType::Uint16Array
                | JsType::Int32Array
                | JsType::Uint32Array
                | JsType::Float32Array
                | JsType::Float64Array
                | JsType::BigInt64Array
                | JsType::BigUint64Array
        )
    }

    pub fn is_function(self) -> bool {
        matches!(
            self,
            JsType::Function | JsType::AsyncFunction | JsType::GeneratorFunction
        )
    }
}

/// How code may legally be spliced in at one line position. Every
/// position has exactly one class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum SyntaxClass {
    Statement,
    TrailingComma,
    LeadingComma,
    NotInsertable,
}

/// Dynamically probed metadata for one program. Line-keyed collections
/// use insertion positions `0..=number_of_lines`; the final position is
/// the append-at-end point.
///
/// A state is owned by exactly one program. Mutation paths clone before
/// editing so the corpus copy stays canonical.
#[derive(Debug, Clone, Default, PartialEq, Encode, Decode)]
pub struct TestcaseState {
    pub number_of_lines: usize,
    pub size_bytes: usize,
    /// Syntax classes, pairwise disjoint per line.
    pub statement_lines: Vec<usize>,
    pub trailing_comma_lines: Vec<usize>,
    pub leading_comma_lines: Vec<usize>,
    /// Orthogonal behavioral marks.
    pub dead_lines: Vec<usize>,
    pub hot_lines: Vec<usize>,
    pub timeout_prone_lines: Vec<usize>,
    pub exception_prone_lines: Vec<usize>,
    /// name -> ordered (line, observed runtime type).
    pub variable_types: BTreeMap<String, Vec<(usize, JsType)>>,
    /// name -> ordered (line, observed lengths).
    pub array_lengths: BTreeMap<String, Vec<(usize, Vec<u64>)>>,
    /// Names that read back as undefined everywhere they were probed.
    pub unused_names: Vec<String>,
    pub function_arities: BTreeMap<String, usize>,
    /// Balanced `{`/`}` pairs as (open line, close line).
    pub brace_intervals: Vec<(usize, usize)>,
    pub expected_runtime_ms: u64,
    /// Unreliable score carried over from admission, 0 = deterministic.
    pub reliability: u32,
}

/// Shift a sorted line set for an insertion of `k` lines at `at`: keys
/// past the point move up, a key exactly at the point is kept on both
/// sides of the splice.
fn shift_lines_insert(lines: &mut Vec<usize>, at: usize, k: usize) {
    let mut out = Vec::with_capacity(lines.len() + 1);
    for &line in lines.iter() {
        if line < at {
            out.push(line);
        } else if line == at {
            out.push(at);
            out.push(at + k);
        } else {
            out.push(line + k);
        }
    }
    out.sort_unstable();
    out.dedup();
    *lines = out;
}

/// Shift a sorted line set for a removal of `count` lines at `start`;
/// keys inside the removed region are dropped.
fn shift_lines_remove(lines: &mut Vec<usize>, start: usize, count: usize) {
    let mut out = Vec::with_capacity(lines.len());
    for &line in lines.iter() {
        if line < start {
            out.push(line);
        } else if line >= start + count {
            out.push(line - count);
        }
    }
    *lines = out;
}

fn shift_observations_insert<T: Clone + PartialEq>(
    observations: &mut Vec<(usize, T)>,
    at: usize,
    k: usize,
) {
    let mut out = Vec::with_capacity(observations.len() + 1);
    for (line, value) in observations.iter() {
        if *line < at {
            out.push((*line, value.clone()));
        } else if *line == at {
            out.push((at, value.clone()));
            out.push((at + k, value.clone()));
        } else {
            out.push((*line + k, value.clone()));
        }
    }
    out.sort_by_key(|(line, _)| *line);
    out.dedup();
    *observations = out;
}

fn shift_observations_remove<T: Clone>(
    observations: &mut Vec<(usize, T)>,
    start: usize,
    count: usize,
) {
    let mut out = Vec::with_capacity(observations.len());
    for (line, value) in observations.iter() {
        if *line < start {
            out.push((*line, value.clone()));
        } else if *line >= start + count {
            out.push((*line - count, value.clone()));
        }
    }
    *observations = out;
}

impl TestcaseState {
    pub fn new(number_of_lines: usize, size_bytes: usize) -> Self {
        TestcaseState {
            number_of_lines,
            size_bytes,
            ..TestcaseState::default()
        }
    }

    /// The syntax class of one insertion position.
    pub fn class_of(&self, line: usize) -> SyntaxClass {
        if self.statement_lines.contains(&line) {
            SyntaxClass::Statement
        } else if self.trailing_comma_lines.contains(&line) {
            SyntaxClass::TrailingComma
        } else if self.leading_comma_lines.contains(&line) {
            SyntaxClass::LeadingComma
        } else {
            SyntaxClass::NotInsertable
        }
    }

    /// Assign a syntax class, clearing the line from the other classes so
    /// the sets stay pairwise disjoint.
    pub fn mark_line(&mut self, line: usize, class: SyntaxClass) {
        self.statement_lines.retain(|&l| l != line);
        self.trailing_comma_lines.retain(|&l| l != line);
        self.leading_comma_lines.retain(|&l| l != line);
        let target = match class {
            SyntaxClass::Statement => &mut self.statement_lines,
            SyntaxClass::TrailingComma => &mut self.trailing_comma_lines,
            SyntaxClass::LeadingComma => &mut self.leading_comma_lines,
            SyntaxClass::NotInsertable => return,
        };
        if !target.contains(&line) {
            target.push(line);
            target.sort_unstable();
        }
    }

    /// Every position where code can be spliced in, regardless of class.
    pub fn insertable_lines(&self) -> Vec<usize> {
        let mut all = Vec::with_capacity(
            self.statement_lines.len()
                + self.trailing_comma_lines.len()
                + self.leading_comma_lines.len(),
        );
        all.extend_from_slice(&self.statement_lines);
        all.extend_from_slice(&self.trailing_comma_lines);
        all.extend_from_slice(&self.leading_comma_lines);
        all.sort_unstable();
        all.dedup();
        all
    }

    pub fn insertable_line_count(&self) -> usize {
        self.statement_lines.len()
            + self.trailing_comma_lines.len()
            + self.leading_comma_lines.len()
    }

    /// Record `text` spliced in at position `at`, remapping every
    /// line-keyed collection. A key equal to `at` is duplicated onto both
    /// sides of the splice.
    pub fn insert_line(&mut self, at: usize, text: &str) {
        let k = text.lines().count().max(1);
        for lines in [
            &mut self.statement_lines,
            &mut self.trailing_comma_lines,
            &mut self.leading_comma_lines,
            &mut self.dead_lines,
            &mut self.hot_lines,
            &mut self.timeout_prone_lines,
            &mut self.exception_prone_lines,
        ] {
            shift_lines_insert(lines, at, k);
        }
        for observations in self.variable_types.values_mut() {
            shift_observations_insert(observations, at, k);
        }
        for observations in self.array_lengths.values_mut() {
            shift_observations_insert(observations, at, k);
        }
        for interval in self.brace_intervals.iter_mut() {
            if interval.0 >= at {
                interval.0 += k;
            }
            if interval.1 >= at {
                interval.1 += k;
            }
        }
        self.number_of_lines += k;
        self.size_bytes += text.len() + 1;
    }

    /// Record removal of `count` lines starting at `start`. `removed_text`
    /// is the removed region joined with newlines; a region that begins
    /// with a `return` statement un-marks the line that follows it as
    /// dead, since removing the return can make it reachable.
    pub fn remove_lines(&mut self, start: usize, count: usize, removed_text: &str) {
        for lines in [
            &mut self.statement_lines,
            &mut self.trailing_comma_lines,
            &mut self.leading_comma_lines,
            &mut self.dead_lines,
            &mut self.hot_lines,
            &mut self.timeout_prone_lines,
            &mut self.exception_prone_lines,
        ] {
            shift_lines_remove(lines, start, count);
        }
        for observations in self.variable_types.values_mut() {
            shift_observations_remove(observations, start, count);
        }
        self.variable_types.retain(|_, obs| !obs.is_empty());
        for observations in self.array_lengths.values_mut() {
            shift_observations_remove(observations, start, count);
        }
        self.array_lengths.retain(|_, obs| !obs.is_empty());
        self.brace_intervals.retain(|&(open, close)| {
            !(start..start + count).contains(&open) && !(start..start + count).contains(&close)
        });
        for interval in self.brace_intervals.iter_mut() {
            if interval.0 >= start + count {
                interval.0 -= count;
            }
            if interval.1 >= start + count {
                interval.1 -= count;
            }
        }
        if removed_text.trim_start().starts_with("return") {
            self.dead_lines.retain(|&l| l != start);
        }
        self.number_of_lines = self.number_of_lines.saturating_sub(count);
        self.size_bytes = self.size_bytes.saturating_sub(removed_text.len() + 1);
    }

    /// Splice another program's state into this one at `point`: this
    /// state's keys remap as for an insertion of the other program's line
    /// count, the other state's keys land offset by `point`.
    pub fn merge_at(&mut self, point: usize, other: &TestcaseState) {
        let k = other.number_of_lines;
        for lines in [
            &mut self.statement_lines,
            &mut self.trailing_comma_lines,
            &mut self.leading_comma_lines,
            &mut self.dead_lines,
            &mut self.hot_lines,
            &mut self.timeout_prone_lines,
            &mut self.exception_prone_lines,
        ] {
            shift_lines_insert(lines, point, k);
        }
        for observations in self.variable_types.values_mut() {
            shift_observations_insert(observations, point, k);
        }
        for observations in self.array_lengths.values_mut() {
            shift_observations_insert(observations, point, k);
        }
        for interval in self.brace_intervals.iter_mut() {
            if interval.0 >= point {
                interval.0 += k;
            }
            if interval.1 >= point {
                interval.1 += k;
            }
        }

        let offset = |lines: &[usize]| lines.iter().map(|&l| l + point).collect::<Vec<_>>();
        let merge_set = |own: &mut Vec<usize>, incoming: Vec<usize>| {
            own.extend(incoming);
            own.sort_unstable();
            own.dedup();
        };
        merge_set(&mut self.statement_lines, offset(&other.statement_lines));
        merge_set(
            &mut self.trailing_comma_lines,
            offset(&other.trailing_comma_lines),
        );
        merge_set(
            &mut self.leading_comma_lines,
            offset(&other.leading_comma_lines),
        );
        merge_set(&mut self.dead_lines, offset(&other.dead_lines));
        merge_set(&mut self.hot_lines, offset(&other.hot_lines));
        merge_set(
            &mut self.timeout_prone_lines,
            offset(&other.timeout_prone_lines),
        );
        merge_set(
            &mut self.exception_prone_lines,
            offset(&other.exception_prone_lines),
        );

        for (name, observations) in other.variable_types.iter() {
            let entry = self.variable_types.entry(name.clone()).or_default();
            for (line, ty) in observations {
                entry.push((line + point, *ty));
            }
            entry.sort_by_key(|(line, _)| *line);
            entry.dedup();
        }
        for (name, observations) in other.array_lengths.iter() {
            let entry = self.array_lengths.entry(name.clone()).or_default();
            for (line, lengths) in observations {
                entry.push((line + point, lengths.clone()));
            }
            entry.sort_by_key(|(line, _)| *line);
            entry.dedup();
        }
        for name in other.unused_names.iter() {
            if !self.unused_names.contains(name) {
                self.unused_names.push(name.clone());
            }
        }
        for (name, arity) in other.function_arities.iter() {
            self.function_arities.entry(name.clone()).or_insert(*arity);
        }
        for &(open, close) in other.brace_intervals.iter() {
            self.brace_intervals.push((open + point, close + point));
        }
        self.brace_intervals.sort_unstable();

        self.number_of_lines += k;
        self.size_bytes += other.size_bytes + 1;
        self.expected_runtime_ms += other.expected_runtime_ms;
        self.reliability = self.reliability.max(other.reliability);
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, StateError> {
        let config = bincode::config::standard()
            .with_little_endian()
            .with_fixed_int_encoding();
        let mut bytes = bincode::encode_to_vec(STATE_SCHEMA_VERSION, config)
            .map_err(|e| StateError::Encode(e.to_string()))?;
        let payload =
            bincode::encode_to_vec(self, config).map_err(|e| StateError::Encode(e.to_string()))?;
        bytes.extend_from_slice(&payload);
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StateError> {
        let config = bincode::config::standard()
            .with_little_endian()
            .with_fixed_int_encoding();
        let (version, used): (u32, usize) = bincode::decode_from_slice(bytes, config)
            .map_err(|e| StateError::Decode(e.to_string()))?;
        match version {
            STATE_SCHEMA_VERSION => {
                let (state, _): (TestcaseState, usize) =
                    bincode::decode_from_slice(&bytes[used..], config)
                        .map_err(|e| StateError::Decode(e.to_string()))?;
                Ok(state)
            }
            1 => {
                let (legacy, _): (StateV1, usize) =
                    bincode::decode_from_slice(&bytes[used..], config)
                        .map_err(|e| StateError::Decode(e.to_string()))?;
                Ok(legacy.upgrade())
            }
            other => Err(StateError::UnsupportedSchema(other)),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), StateError> {
        fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, StateError> {
        let bytes = fs::read(path)?;
        TestcaseState::from_bytes(&bytes)
    }
}

/// Schema version 1 layout, accepted on load and upgraded in place.
#[derive(Debug, Encode, Decode)]
struct StateV1 {
    number_of_lines: usize,
    size_bytes: usize,
    statement_lines: Vec<usize>,
    trailing_comma_lines: Vec<usize>,
    leading_comma_lines: Vec<usize>,
    dead_lines: Vec<usize>,
    timeout_prone_lines: Vec<usize>,
    exception_prone_lines: Vec<usize>,
    variable_types: BTreeMap<String, Vec<(usize, JsType)>>,
    array_lengths: BTreeMap<String, Vec<(usize, Vec<u64>)>>,
    unused_names: Vec<String>,
    function_arities: BTreeMap<String, usize>,
    brace_intervals: Vec<(usize, usize)>,
    expected_runtime_ms: u64,
}

impl StateV1 {
    fn upgrade(self) -> TestcaseState {
        TestcaseState {
            number_of_lines: self.number_of_lines,
            size_bytes: self.size_bytes,
            statement_lines: self.statement_lines,
            trailing_comma_lines: self.trailing_comma_lines,
            leading_comma_lines: self.leading_comma_lines,
            dead_lines: self.dead_lines,
            hot_lines: Vec::new(),
            timeout_prone_lines: self.timeout_prone_lines,
            exception_prone_lines: self.exception_prone_lines,
            variable_types: self.variable_types,
            array_lengths: self.array_lengths,
            unused_names: self.unused_names,
            function_arities: self.function_arities,
            brace_intervals: self.brace_intervals,
            expected_runtime_ms: self.expected_runtime_ms,
            reliability: 0,
        }
    }
}

/// Balanced `{`/`}` pairs of a program as (open line, close line),
/// skipping braces inside string and template literals. Unbalanced
/// leftovers are ignored.
pub fn balanced_brace_intervals(text: &str) -> Vec<(usize, usize)> {
    let mut intervals = Vec::new();
    let mut stack = Vec::new();
    let mut in_string: Option<char> = None;
    let mut escaped = false;
    for (line_idx, line) in text.lines().enumerate() {
        for c in line.chars() {
            if escaped {
                escaped = false;
                continue;
            }
            match in_string {
                Some(quote) => match c {
                    '\\' => escaped = true,
                    _ if c == quote => in_string = None,
                    _ => {}
                },
                None => match c {
                    '"' | '\'' | '`' => in_string = Some(c),
                    '{' => stack.push(line_idx),
                    '}' => {
                        if let Some(open) = stack.pop() {
                            intervals.push((open, line_idx));
                        }
                    }
                    _ => {}
                },
            }
        }
        // Plain string literals cannot span lines.
        if in_string != Some('`') {
            in_string = None;
        }
        escaped = false;
    }
    intervals.sort_unstable();
    intervals
}
