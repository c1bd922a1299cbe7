//! The native call surface exposed by the engine
//!
//! `EngineCalls` is the narrow, enumerable set of operations the host side
//! is allowed to use. It is deliberately flat and handle-based: the engine
//! owns every object, the host only ever holds `Raw*` handles and moves
//! reference units around.
//!
//! ## Reference discipline
//!
//! Every operation that returns a `RawValue` transfers exactly one
//! reference unit to the caller. The caller gives a unit back with
//! `value_ref_down` (or hands it off, e.g. `frame_set_return` consumes
//! one). Containers take their own reference on insert and drop it when an
//! element is overwritten or the container dies. Dropping the refcount of a
//! live cell below zero, or touching a stale handle, is a bug in the caller
//! and panics inside the engine.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::error::{NativeResult, ScriptError};
use crate::handle::{RawContext, RawEngine, RawValue};
use crate::hooks::{ContextExtension, DispatcherHooks, EngineExtension};

/// Runtime type of a value cell.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ValueTag {
    Nil,
    Int,
    Flt,
    Str,
    Bytes,
    Map,
    Arr,
    Fun,
}

impl ValueTag {
    pub fn name(self) -> &'static str {
        match self {
            ValueTag::Nil => "nil",
            ValueTag::Int => "int",
            ValueTag::Flt => "flt",
            ValueTag::Str => "str",
            ValueTag::Bytes => "bytes",
            ValueTag::Map => "map",
            ValueTag::Arr => "arr",
            ValueTag::Fun => "fun",
        }
    }
}

/// Engine behavior flags, readable and writable while the engine is open.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct TraitFlags(u32);

impl TraitFlags {
    /// Reading a named variable that was never assigned is an error
    /// instead of yielding nil.
    pub const STRICT_VARS: TraitFlags = TraitFlags(1 << 0);
    /// `/` on two integers yields a float instead of truncating.
    pub const FLOAT_DIV: TraitFlags = TraitFlags(1 << 1);

    pub const fn empty() -> Self {
        TraitFlags(0)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> Self {
        TraitFlags(bits)
    }

    pub fn contains(self, other: TraitFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: TraitFlags) -> Self {
        TraitFlags(self.0 | other.0)
    }

    pub fn without(self, other: TraitFlags) -> Self {
        TraitFlags(self.0 & !other.0)
    }
}

/// Where a context's console output goes.
#[derive(Debug, Clone, Default)]
pub enum OutputSink {
    /// Write to the process stdout.
    #[default]
    Inherit,
    /// Append to a shared buffer (tests, embedders).
    Capture(Arc<Mutex<String>>),
    /// Stream to an already-opened file. Shared so a cloned `IoSpec`
    /// keeps appending to the same handle.
    File(Arc<Mutex<std::fs::File>>),
    /// Discard.
    Null,
}

impl OutputSink {
    /// Fresh capture sink plus the buffer to read it back from.
    pub fn capture() -> (OutputSink, Arc<Mutex<String>>) {
        let buf = Arc::new(Mutex::new(String::new()));
        (OutputSink::Capture(buf.clone()), buf)
    }

    /// Sink writing to `file`.
    pub fn file(file: std::fs::File) -> OutputSink {
        OutputSink::File(Arc::new(Mutex::new(file)))
    }
}

/// I/O binding for a context, fixed at `context_open`.
#[derive(Debug, Clone, Default)]
pub struct IoSpec {
    /// Input files the script may consume. Empty means stdin.
    pub inputs: Vec<PathBuf>,
    pub output: OutputSink,
}

/// Key of one container field during iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKey {
    Index(i64),
    Name(String),
}

/// Opaque iteration state handed back to `value_fields_next`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FieldCursor(pub u64);

/// One step of container iteration. `value` carries a transferred
/// reference unit like every other value-returning operation.
#[derive(Debug)]
pub struct FieldEntry {
    pub cursor: FieldCursor,
    pub key: FieldKey,
    pub value: RawValue,
}

/// The complete set of native operations the host may invoke.
///
/// Implementations are process-global libraries: `Send + Sync`, consumed
/// behind `Arc<dyn EngineCalls>`, and safe to call from any thread. All
/// fallible operations follow the fail-then-inspect convention: on
/// `NativeFault`, the structured description is available through
/// `engine_error_info` / `context_error_info` until the next operation on
/// the same object overwrites it.
pub trait EngineCalls: Send + Sync {
    // ========================================================================
    // Engine instances
    // ========================================================================

    fn engine_open(&self) -> NativeResult<RawEngine>;

    /// Destroys the engine and everything it still owns. Stale handles
    /// derived from it fail loudly afterwards.
    fn engine_close(&self, engine: RawEngine);

    /// Parse program text. A second parse replaces the previous program;
    /// contexts opened against the old program keep running it.
    fn engine_parse_text(&self, engine: RawEngine, source: &str) -> NativeResult<()>;

    /// Parse the concatenation of the given script files.
    fn engine_parse_files(&self, engine: RawEngine, files: &[PathBuf]) -> NativeResult<()>;

    /// Declare a global before parsing; returns its table index.
    fn engine_add_global(&self, engine: RawEngine, name: &str) -> NativeResult<usize>;

    /// Look up a global's table index. With `include_builtins` false the
    /// engine-provided globals (ARGC, ARGV, ...) are not visible.
    fn engine_find_global(
        &self,
        engine: RawEngine,
        name: &str,
        include_builtins: bool,
    ) -> NativeResult<usize>;

    /// Register a host function callable from scripts. Calls arriving from
    /// script code are arity-checked against `min_args..=max_args` before
    /// the dispatcher hook runs. `sig` is the engine's argument-spec
    /// string and is only validated, not interpreted, by this engine.
    fn engine_register_function(
        &self,
        engine: RawEngine,
        name: &str,
        min_args: usize,
        max_args: usize,
        sig: &str,
    ) -> NativeResult<()>;

    /// Attach host bookkeeping data, readable back inside dispatcher hooks.
    fn engine_set_extension(&self, engine: RawEngine, ext: EngineExtension);

    fn engine_get_trait(&self, engine: RawEngine) -> TraitFlags;
    fn engine_set_trait(&self, engine: RawEngine, flags: TraitFlags);

    fn engine_error_info(&self, engine: RawEngine) -> ScriptError;
    fn engine_set_error(&self, engine: RawEngine, msg: &str);

    /// Install the process-wide dispatcher hooks. Later installs replace
    /// earlier ones; engines opened before the install see the hooks too.
    fn install_dispatcher(&self, hooks: DispatcherHooks);

    // ========================================================================
    // Execution contexts
    // ========================================================================

    fn context_open(&self, engine: RawEngine, id: u64, io: &IoSpec) -> NativeResult<RawContext>;

    /// Destroys the context and frees every value cell it still holds.
    fn context_close(&self, context: RawContext);

    fn context_set_extension(&self, context: RawContext, ext: ContextExtension);

    /// Run the program's main body. `args` populate ARGC/ARGV. Returns the
    /// top-level return value (nil when the body falls off the end).
    fn context_exec(&self, context: RawContext, args: &[String]) -> NativeResult<RawValue>;

    /// Call a named script function.
    fn context_call(
        &self,
        context: RawContext,
        name: &str,
        args: &[RawValue],
    ) -> NativeResult<RawValue>;

    /// Bind a value to a global slot obtained from `engine_add_global` /
    /// `engine_find_global`. Consumes one reference unit of `value`; the
    /// previous binding's unit is dropped.
    fn context_set_global(
        &self,
        context: RawContext,
        index: usize,
        value: RawValue,
    ) -> NativeResult<()>;

    /// Snapshot of the context's named (implicitly created) variables.
    fn context_named_vars(&self, context: RawContext) -> NativeResult<Vec<(String, RawValue)>>;

    /// Mark a signal pending. The running script observes it at the next
    /// cooperative checkpoint and unwinds with an interruption error; an
    /// idle context keeps the mark for its next run.
    fn context_raise_signal(&self, context: RawContext, signo: i32);

    fn context_error_info(&self, context: RawContext) -> ScriptError;
    fn context_set_error(&self, context: RawContext, msg: &str);

    // ========================================================================
    // Host-call frames (valid only inside a dispatched host call)
    // ========================================================================

    fn frame_arg_count(&self, context: RawContext) -> NativeResult<usize>;
    fn frame_arg(&self, context: RawContext, index: usize) -> NativeResult<RawValue>;

    /// Set the value the script call evaluates to. Consumes one reference
    /// unit from the caller.
    fn frame_set_return(&self, context: RawContext, value: RawValue) -> NativeResult<()>;

    // ========================================================================
    // Values
    // ========================================================================

    fn value_make_int(&self, context: RawContext, v: i64) -> NativeResult<RawValue>;
    fn value_make_flt(&self, context: RawContext, v: f64) -> NativeResult<RawValue>;
    fn value_make_str(&self, context: RawContext, v: &str) -> NativeResult<RawValue>;
    fn value_make_bytes(&self, context: RawContext, v: &[u8]) -> NativeResult<RawValue>;
    fn value_make_map(&self, context: RawContext) -> NativeResult<RawValue>;
    fn value_make_arr(&self, context: RawContext, capacity: usize) -> NativeResult<RawValue>;

    fn value_ref_up(&self, context: RawContext, value: RawValue);
    fn value_ref_down(&self, context: RawContext, value: RawValue);

    fn value_tag(&self, context: RawContext, value: RawValue) -> ValueTag;

    fn value_to_int(&self, context: RawContext, value: RawValue) -> NativeResult<i64>;
    fn value_to_flt(&self, context: RawContext, value: RawValue) -> NativeResult<f64>;
    fn value_to_str(&self, context: RawContext, value: RawValue) -> NativeResult<String>;
    fn value_to_bytes(&self, context: RawContext, value: RawValue) -> NativeResult<Vec<u8>>;

    /// Human-readable rendering, never fails ("nil" for nil).
    fn value_display(&self, context: RawContext, value: RawValue) -> String;

    /// Element count of a map, array, string or byte-string.
    fn value_len(&self, context: RawContext, value: RawValue) -> NativeResult<usize>;

    /// Array element read; an in-range unset slot reads as a fresh nil.
    fn value_index_get(
        &self,
        context: RawContext,
        value: RawValue,
        index: i64,
    ) -> NativeResult<RawValue>;

    /// Array element write, growing the array as needed. Consumes one
    /// reference unit of `item`.
    fn value_index_set(
        &self,
        context: RawContext,
        value: RawValue,
        index: i64,
        item: RawValue,
    ) -> NativeResult<()>;

    /// Map field read; a missing key reads as a fresh nil.
    fn value_key_get(
        &self,
        context: RawContext,
        value: RawValue,
        key: &str,
    ) -> NativeResult<RawValue>;

    /// Map field write. Consumes one reference unit of `item`.
    fn value_key_set(
        &self,
        context: RawContext,
        value: RawValue,
        key: &str,
        item: RawValue,
    ) -> NativeResult<()>;

    /// Begin container iteration; `None` for an empty container.
    fn value_fields_first(
        &self,
        context: RawContext,
        value: RawValue,
    ) -> NativeResult<Option<FieldEntry>>;

    /// Continue iteration from a cursor previously handed out.
    fn value_fields_next(
        &self,
        context: RawContext,
        value: RawValue,
        cursor: FieldCursor,
    ) -> NativeResult<Option<FieldEntry>>;
}
