//! Process-global engine library
//!
//! `KestrelVm` owns every engine and context behind generation-counted
//! arenas and exposes them exclusively through the [`EngineCalls`] handle
//! surface. One instance serves the whole process (see [`library`]);
//! embedders that want isolation (tests, mostly) can run their own.
//!
//! Handle misuse is a host bug: operations on a stale engine or context
//! handle panic rather than touching whatever object reused the slot. The
//! one exception is `context_raise_signal`, which arrives from arbitrary
//! threads at arbitrary times and is allowed to miss.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use tracing::{debug, warn};

use kestrel_api::{
    ContextExtension, DispatcherHooks, EngineCalls, EngineExtension, FieldCursor, FieldEntry,
    FieldKey, IoSpec, NativeResult, RawContext, RawEngine, RawValue, ScriptError, TraitFlags,
    ValueTag,
};

use crate::arena::Arena;
use crate::context::ContextInst;
use crate::engine::EngineInst;
use crate::eval;
use crate::heap::{tag_of, Heap, Payload};
use crate::parser;

/// Script name used for programs parsed from a bare string.
const INLINE_SCRIPT_NAME: &str = "(script)";

static LIBRARY: Lazy<Arc<KestrelVm>> = Lazy::new(|| Arc::new(KestrelVm::new()));

/// The process-wide engine library behind the native call surface.
pub fn library() -> Arc<KestrelVm> {
    LIBRARY.clone()
}

pub struct KestrelVm {
    engines: Mutex<Arena<Arc<EngineInst>>>,
    contexts: Mutex<Arena<Arc<ContextInst>>>,
    hooks: Mutex<Option<DispatcherHooks>>,
}

impl KestrelVm {
    pub fn new() -> Self {
        Self {
            engines: Mutex::new(Arena::new()),
            contexts: Mutex::new(Arena::new()),
            hooks: Mutex::new(None),
        }
    }

    fn engine(&self, h: RawEngine) -> Arc<EngineInst> {
        self.engines
            .lock()
            .unwrap()
            .get(h.index(), h.generation())
            .cloned()
            .unwrap_or_else(|| panic!("stale engine handle {:#x}", h.to_bits()))
    }

    fn context(&self, h: RawContext) -> Arc<ContextInst> {
        self.contexts
            .lock()
            .unwrap()
            .get(h.index(), h.generation())
            .cloned()
            .unwrap_or_else(|| panic!("stale context handle {:#x}", h.to_bits()))
    }

    fn context_if_live(&self, h: RawContext) -> Option<Arc<ContextInst>> {
        self.contexts
            .lock()
            .unwrap()
            .get(h.index(), h.generation())
            .cloned()
    }

    fn dispatcher(&self) -> Option<DispatcherHooks> {
        *self.hooks.lock().unwrap()
    }
}

impl Default for KestrelVm {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineCalls for KestrelVm {
    // ========================================================================
    // Engine instances
    // ========================================================================

    fn engine_open(&self) -> NativeResult<RawEngine> {
        let (index, generation) = self
            .engines
            .lock()
            .unwrap()
            .insert(Arc::new(EngineInst::new()));
        let handle = RawEngine::from_parts(index, generation);
        debug!(engine = handle.to_bits(), "engine opened");
        Ok(handle)
    }

    fn engine_close(&self, engine: RawEngine) {
        let closed = self
            .engines
            .lock()
            .unwrap()
            .remove(engine.index(), engine.generation())
            .unwrap_or_else(|| panic!("stale engine handle {:#x}", engine.to_bits()));
        // Anything still parked under this engine dies with it.
        let orphans: Vec<(u32, u32)> = {
            let contexts = self.contexts.lock().unwrap();
            contexts
                .iter()
                .filter(|(_, _, ctx)| Arc::ptr_eq(&ctx.engine, &closed))
                .map(|(index, generation, _)| (index, generation))
                .collect()
        };
        if !orphans.is_empty() {
            warn!(
                engine = engine.to_bits(),
                count = orphans.len(),
                "closing engine with live contexts"
            );
        }
        let mut contexts = self.contexts.lock().unwrap();
        for (index, generation) in orphans {
            contexts.remove(index, generation);
        }
        debug!(engine = engine.to_bits(), "engine closed");
    }

    fn engine_parse_text(&self, engine: RawEngine, source: &str) -> NativeResult<()> {
        let inst = self.engine(engine);
        match parser::parse(source, INLINE_SCRIPT_NAME) {
            Ok(program) => {
                inst.install_program(program);
                Ok(())
            }
            Err(err) => inst.fail(err),
        }
    }

    fn engine_parse_files(&self, engine: RawEngine, files: &[PathBuf]) -> NativeResult<()> {
        let inst = self.engine(engine);
        let Some(first) = files.first() else {
            return inst.fail(ScriptError::bare("no script files given"));
        };
        let mut source = String::new();
        for path in files {
            match std::fs::read_to_string(path) {
                Ok(text) => {
                    source.push_str(&text);
                    if !source.ends_with('\n') {
                        source.push('\n');
                    }
                }
                Err(err) => {
                    return inst.fail(ScriptError::bare(format!(
                        "cannot read script '{}': {err}",
                        path.display()
                    )))
                }
            }
        }
        match parser::parse(&source, &first.display().to_string()) {
            Ok(program) => {
                inst.install_program(program);
                Ok(())
            }
            Err(err) => inst.fail(err),
        }
    }

    fn engine_add_global(&self, engine: RawEngine, name: &str) -> NativeResult<usize> {
        self.engine(engine).add_global(name)
    }

    fn engine_find_global(
        &self,
        engine: RawEngine,
        name: &str,
        include_builtins: bool,
    ) -> NativeResult<usize> {
        self.engine(engine).find_global(name, include_builtins)
    }

    fn engine_register_function(
        &self,
        engine: RawEngine,
        name: &str,
        min_args: usize,
        max_args: usize,
        sig: &str,
    ) -> NativeResult<()> {
        self.engine(engine)
            .register_function(name, min_args, max_args, sig)
    }

    fn engine_set_extension(&self, engine: RawEngine, ext: EngineExtension) {
        *self.engine(engine).ext.lock().unwrap() = Some(ext);
    }

    fn engine_get_trait(&self, engine: RawEngine) -> TraitFlags {
        *self.engine(engine).traits.lock().unwrap()
    }

    fn engine_set_trait(&self, engine: RawEngine, flags: TraitFlags) {
        *self.engine(engine).traits.lock().unwrap() = flags;
    }

    fn engine_error_info(&self, engine: RawEngine) -> ScriptError {
        self.engine(engine).last_error()
    }

    fn engine_set_error(&self, engine: RawEngine, msg: &str) {
        self.engine(engine).set_error(ScriptError::bare(msg));
    }

    fn install_dispatcher(&self, hooks: DispatcherHooks) {
        *self.hooks.lock().unwrap() = Some(hooks);
        debug!("dispatcher hooks installed");
    }

    // ========================================================================
    // Execution contexts
    // ========================================================================

    fn context_open(&self, engine: RawEngine, id: u64, io: &IoSpec) -> NativeResult<RawContext> {
        let inst = self.engine(engine);
        let Some(program) = inst.current_program() else {
            return inst.fail(ScriptError::bare("no program has been parsed"));
        };
        let context = Arc::new(ContextInst::new(inst, program, id, io.clone()));
        let (index, generation) = self.contexts.lock().unwrap().insert(context);
        let handle = RawContext::from_parts(index, generation);
        debug!(context = handle.to_bits(), id, "context opened");
        Ok(handle)
    }

    fn context_close(&self, context: RawContext) {
        self.contexts
            .lock()
            .unwrap()
            .remove(context.index(), context.generation())
            .unwrap_or_else(|| panic!("stale context handle {:#x}", context.to_bits()));
        debug!(context = context.to_bits(), "context closed");
    }

    fn context_set_extension(&self, context: RawContext, ext: ContextExtension) {
        *self.context(context).ext.lock().unwrap() = Some(ext);
    }

    fn context_exec(&self, context: RawContext, args: &[String]) -> NativeResult<RawValue> {
        let ctx = self.context(context);
        match eval::exec_main(&ctx, self.dispatcher(), args) {
            Ok(value) => Ok(value),
            Err(err) => ctx.fail(err),
        }
    }

    fn context_call(
        &self,
        context: RawContext,
        name: &str,
        args: &[RawValue],
    ) -> NativeResult<RawValue> {
        let ctx = self.context(context);
        match eval::call_function(&ctx, self.dispatcher(), name, args) {
            Ok(value) => Ok(value),
            Err(err) => ctx.fail(err),
        }
    }

    fn context_set_global(
        &self,
        context: RawContext,
        index: usize,
        value: RawValue,
    ) -> NativeResult<()> {
        self.context(context).set_global_unit(index, value)
    }

    fn context_named_vars(&self, context: RawContext) -> NativeResult<Vec<(String, RawValue)>> {
        Ok(self.context(context).named_snapshot())
    }

    fn context_raise_signal(&self, context: RawContext, signo: i32) {
        // A raise can land after teardown; a miss is not an error.
        match self.context_if_live(context) {
            Some(ctx) => ctx.raise_signal(signo),
            None => warn!(
                context = context.to_bits(),
                signo, "signal raised on stale context handle"
            ),
        }
    }

    fn context_error_info(&self, context: RawContext) -> ScriptError {
        self.context(context).last_error()
    }

    fn context_set_error(&self, context: RawContext, msg: &str) {
        let ctx = self.context(context);
        ctx.set_host_error(msg);
        ctx.record_error(ScriptError::bare(msg));
    }

    // ========================================================================
    // Host-call frames
    // ========================================================================

    fn frame_arg_count(&self, context: RawContext) -> NativeResult<usize> {
        self.context(context).frame_arg_count()
    }

    fn frame_arg(&self, context: RawContext, index: usize) -> NativeResult<RawValue> {
        self.context(context).frame_arg(index)
    }

    fn frame_set_return(&self, context: RawContext, value: RawValue) -> NativeResult<()> {
        self.context(context).frame_set_return(value)
    }

    // ========================================================================
    // Values
    // ========================================================================

    fn value_make_int(&self, context: RawContext, v: i64) -> NativeResult<RawValue> {
        Ok(self.context(context).make(Payload::Int(v)))
    }

    fn value_make_flt(&self, context: RawContext, v: f64) -> NativeResult<RawValue> {
        Ok(self.context(context).make(Payload::Flt(v)))
    }

    fn value_make_str(&self, context: RawContext, v: &str) -> NativeResult<RawValue> {
        Ok(self.context(context).make(Payload::Str(v.to_string())))
    }

    fn value_make_bytes(&self, context: RawContext, v: &[u8]) -> NativeResult<RawValue> {
        Ok(self.context(context).make(Payload::Bytes(v.to_vec())))
    }

    fn value_make_map(&self, context: RawContext) -> NativeResult<RawValue> {
        Ok(self
            .context(context)
            .make(Payload::Map(Default::default())))
    }

    fn value_make_arr(&self, context: RawContext, capacity: usize) -> NativeResult<RawValue> {
        Ok(self
            .context(context)
            .make(Payload::Arr(Vec::with_capacity(capacity))))
    }

    fn value_ref_up(&self, context: RawContext, value: RawValue) {
        self.context(context).retain(value);
    }

    fn value_ref_down(&self, context: RawContext, value: RawValue) {
        self.context(context).release(value);
    }

    fn value_tag(&self, context: RawContext, value: RawValue) -> ValueTag {
        let ctx = self.context(context);
        let heap = ctx.heap.lock().unwrap();
        tag_from(heap.payload(value))
    }

    fn value_to_int(&self, context: RawContext, value: RawValue) -> NativeResult<i64> {
        let ctx = self.context(context);
        let out = ctx.heap.lock().unwrap().coerce_int(value);
        out.or_else(|msg| ctx.fail(ScriptError::bare(msg)))
    }

    fn value_to_flt(&self, context: RawContext, value: RawValue) -> NativeResult<f64> {
        let ctx = self.context(context);
        let out = ctx.heap.lock().unwrap().coerce_flt(value);
        out.or_else(|msg| ctx.fail(ScriptError::bare(msg)))
    }

    fn value_to_str(&self, context: RawContext, value: RawValue) -> NativeResult<String> {
        let ctx = self.context(context);
        let out = ctx.heap.lock().unwrap().coerce_str(value);
        out.or_else(|msg| ctx.fail(ScriptError::bare(msg)))
    }

    fn value_to_bytes(&self, context: RawContext, value: RawValue) -> NativeResult<Vec<u8>> {
        let ctx = self.context(context);
        let out = ctx.heap.lock().unwrap().coerce_bytes(value);
        out.or_else(|msg| ctx.fail(ScriptError::bare(msg)))
    }

    fn value_display(&self, context: RawContext, value: RawValue) -> String {
        let ctx = self.context(context);
        let heap = ctx.heap.lock().unwrap();
        heap.display(value)
    }

    fn value_len(&self, context: RawContext, value: RawValue) -> NativeResult<usize> {
        let ctx = self.context(context);
        let out = ctx.heap.lock().unwrap().length(value);
        out.or_else(|msg| ctx.fail(ScriptError::bare(msg)))
    }

    fn value_index_get(
        &self,
        context: RawContext,
        value: RawValue,
        index: i64,
    ) -> NativeResult<RawValue> {
        let ctx = self.context(context);
        let out = {
            let mut heap = ctx.heap.lock().unwrap();
            let found = match heap.payload(value) {
                Payload::Arr(items) => {
                    if index < 0 {
                        Err(format!("array index {index} out of range"))
                    } else {
                        Ok(items.get(index as usize).copied().flatten())
                    }
                }
                Payload::Map(_) => Err("cannot index map with int".to_string()),
                other => Err(format!("value of type {} is not indexable", tag_of(other))),
            };
            found.map(|found| match found {
                Some(h) => {
                    heap.retain(h);
                    h
                }
                None => heap.alloc(Payload::Nil),
            })
        };
        out.or_else(|msg| ctx.fail(ScriptError::bare(msg)))
    }

    fn value_index_set(
        &self,
        context: RawContext,
        value: RawValue,
        index: i64,
        item: RawValue,
    ) -> NativeResult<()> {
        let ctx = self.context(context);
        let out = {
            let mut heap = ctx.heap.lock().unwrap();
            let displaced = match heap.payload_mut(value) {
                Payload::Arr(items) => {
                    if index < 0 {
                        Err(format!("array index {index} out of range"))
                    } else {
                        let at = index as usize;
                        if at >= items.len() {
                            items.resize(at + 1, None);
                        }
                        Ok(items[at].replace(item))
                    }
                }
                Payload::Map(_) => Err("cannot index map with int".to_string()),
                other => Err(format!("value of type {} is not indexable", tag_of(other))),
            };
            match displaced {
                Ok(Some(old)) => {
                    heap.release(old);
                    Ok(())
                }
                Ok(None) => Ok(()),
                Err(msg) => {
                    heap.release(item);
                    Err(msg)
                }
            }
        };
        out.or_else(|msg| ctx.fail(ScriptError::bare(msg)))
    }

    fn value_key_get(
        &self,
        context: RawContext,
        value: RawValue,
        key: &str,
    ) -> NativeResult<RawValue> {
        let ctx = self.context(context);
        let out = {
            let mut heap = ctx.heap.lock().unwrap();
            let found = match heap.payload(value) {
                Payload::Map(fields) => Ok(fields.get(key).copied()),
                Payload::Arr(_) => Err("cannot index arr with str".to_string()),
                other => Err(format!("value of type {} is not indexable", tag_of(other))),
            };
            found.map(|found| match found {
                Some(h) => {
                    heap.retain(h);
                    h
                }
                None => heap.alloc(Payload::Nil),
            })
        };
        out.or_else(|msg| ctx.fail(ScriptError::bare(msg)))
    }

    fn value_key_set(
        &self,
        context: RawContext,
        value: RawValue,
        key: &str,
        item: RawValue,
    ) -> NativeResult<()> {
        let ctx = self.context(context);
        let out = {
            let mut heap = ctx.heap.lock().unwrap();
            let displaced = match heap.payload_mut(value) {
                Payload::Map(fields) => Ok(fields.insert(key.to_string(), item)),
                Payload::Arr(_) => Err("cannot index arr with str".to_string()),
                other => Err(format!("value of type {} is not indexable", tag_of(other))),
            };
            match displaced {
                Ok(Some(old)) => {
                    heap.release(old);
                    Ok(())
                }
                Ok(None) => Ok(()),
                Err(msg) => {
                    heap.release(item);
                    Err(msg)
                }
            }
        };
        out.or_else(|msg| ctx.fail(ScriptError::bare(msg)))
    }

    fn value_fields_first(
        &self,
        context: RawContext,
        value: RawValue,
    ) -> NativeResult<Option<FieldEntry>> {
        let ctx = self.context(context);
        let out = {
            let mut heap = ctx.heap.lock().unwrap();
            field_entry_from(&mut heap, value, 0)
        };
        out.or_else(|msg| ctx.fail(ScriptError::bare(msg)))
    }

    fn value_fields_next(
        &self,
        context: RawContext,
        value: RawValue,
        cursor: FieldCursor,
    ) -> NativeResult<Option<FieldEntry>> {
        let ctx = self.context(context);
        let out = {
            let mut heap = ctx.heap.lock().unwrap();
            field_entry_from(&mut heap, value, cursor.0 + 1)
        };
        out.or_else(|msg| ctx.fail(ScriptError::bare(msg)))
    }
}

fn tag_from(payload: &Payload) -> ValueTag {
    match payload {
        Payload::Nil => ValueTag::Nil,
        Payload::Int(_) => ValueTag::Int,
        Payload::Flt(_) => ValueTag::Flt,
        Payload::Str(_) => ValueTag::Str,
        Payload::Bytes(_) => ValueTag::Bytes,
        Payload::Arr(_) => ValueTag::Arr,
        Payload::Map(_) => ValueTag::Map,
        Payload::Fun(_) => ValueTag::Fun,
    }
}

/// Find the first container element at or after `start`. Array cursors are
/// slot positions (unset slots are skipped); map cursors are entry ranks in
/// key order. Mutating a container between steps redirects but never breaks
/// the walk.
fn field_entry_from(
    heap: &mut Heap,
    container: RawValue,
    start: u64,
) -> Result<Option<FieldEntry>, String> {
    let found = match heap.payload(container) {
        Payload::Arr(items) => items
            .iter()
            .enumerate()
            .skip(start as usize)
            .find_map(|(position, slot)| {
                slot.map(|value| (position as u64, FieldKey::Index(position as i64), value))
            }),
        Payload::Map(fields) => fields
            .iter()
            .nth(start as usize)
            .map(|(key, value)| (start, FieldKey::Name(key.clone()), *value)),
        other => return Err(format!("value of type {} is not iterable", tag_of(other))),
    };
    Ok(found.map(|(cursor, key, value)| {
        heap.retain(value);
        FieldEntry {
            cursor: FieldCursor(cursor),
            key,
            value,
        }
    }))
}

#[cfg(test)]
mod tests {
    use kestrel_api::DispatchSignal;

    use super::*;

    fn open_with(vm: &KestrelVm, source: &str) -> (RawEngine, RawContext) {
        let engine = vm.engine_open().unwrap();
        vm.engine_parse_text(engine, source).unwrap();
        let context = vm.context_open(engine, 1, &IoSpec::default()).unwrap();
        (engine, context)
    }

    #[test]
    fn parse_exec_and_call_round_trip() {
        let vm = KestrelVm::new();
        let (engine, context) = open_with(&vm, "function f(a){ return a+1 }\nreturn f(41);");

        let out = vm.context_exec(context, &[]).unwrap();
        assert_eq!(vm.value_to_int(context, out).unwrap(), 42);
        vm.value_ref_down(context, out);

        let arg = vm.value_make_int(context, 41).unwrap();
        let out = vm.context_call(context, "f", &[arg]).unwrap();
        assert_eq!(vm.value_to_int(context, out).unwrap(), 42);
        vm.value_ref_down(context, out);
        vm.value_ref_down(context, arg);

        vm.context_close(context);
        vm.engine_close(engine);
    }

    #[test]
    fn parse_failure_leaves_a_structured_error() {
        let vm = KestrelVm::new();
        let engine = vm.engine_open().unwrap();
        assert!(vm.engine_parse_text(engine, "function {").is_err());
        let err = vm.engine_error_info(engine);
        assert_eq!(err.file, "(script)");
        assert_eq!(err.line, 1);
        assert!(!err.msg.is_empty());
        vm.engine_close(engine);
    }

    #[test]
    fn context_open_requires_a_parsed_program() {
        let vm = KestrelVm::new();
        let engine = vm.engine_open().unwrap();
        assert!(vm.context_open(engine, 1, &IoSpec::default()).is_err());
        assert_eq!(
            vm.engine_error_info(engine).msg,
            "no program has been parsed"
        );
        vm.engine_close(engine);
    }

    #[test]
    fn reparsing_does_not_disturb_open_contexts() {
        let vm = KestrelVm::new();
        let (engine, context) = open_with(&vm, "return 1;");
        vm.engine_parse_text(engine, "return 2;").unwrap();
        let old = vm.context_exec(context, &[]).unwrap();
        assert_eq!(vm.value_to_int(context, old).unwrap(), 1);
        vm.value_ref_down(context, old);

        let fresh = vm.context_open(engine, 2, &IoSpec::default()).unwrap();
        let new = vm.context_exec(fresh, &[]).unwrap();
        assert_eq!(vm.value_to_int(fresh, new).unwrap(), 2);
        vm.value_ref_down(fresh, new);
        vm.engine_close(engine);
    }

    #[test]
    fn declared_globals_bind_before_exec() {
        let vm = KestrelVm::new();
        let engine = vm.engine_open().unwrap();
        let slot = vm.engine_add_global(engine, "limit").unwrap();
        vm.engine_parse_text(engine, "return limit + 1;").unwrap();
        let context = vm.context_open(engine, 1, &IoSpec::default()).unwrap();

        let v = vm.value_make_int(context, 41).unwrap();
        vm.context_set_global(context, slot, v).unwrap();
        let out = vm.context_exec(context, &[]).unwrap();
        assert_eq!(vm.value_to_int(context, out).unwrap(), 42);
        vm.value_ref_down(context, out);
        vm.engine_close(engine);
    }

    #[test]
    fn find_global_can_hide_builtins() {
        let vm = KestrelVm::new();
        let engine = vm.engine_open().unwrap();
        assert!(vm.engine_find_global(engine, "ARGC", true).is_ok());
        assert!(vm.engine_find_global(engine, "ARGC", false).is_err());
        assert_eq!(vm.engine_error_info(engine).msg, "no such global 'ARGC'");
        vm.engine_close(engine);
    }

    #[test]
    fn named_vars_surface_after_exec() {
        let vm = KestrelVm::new();
        let (engine, context) = open_with(&vm, "hits = 3; label = \"ok\";");
        let out = vm.context_exec(context, &[]).unwrap();
        vm.value_ref_down(context, out);

        let vars = vm.context_named_vars(context).unwrap();
        let names: Vec<&str> = vars.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["hits", "label"]);
        for (name, value) in vars {
            if name == "hits" {
                assert_eq!(vm.value_to_int(context, value).unwrap(), 3);
            }
            vm.value_ref_down(context, value);
        }
        vm.engine_close(engine);
    }

    #[test]
    fn container_ops_cover_arrays_and_maps() {
        let vm = KestrelVm::new();
        let (engine, context) = open_with(&vm, "return 0;");

        let arr = vm.value_make_arr(context, 4).unwrap();
        let ten = vm.value_make_int(context, 10).unwrap();
        let thirty = vm.value_make_int(context, 30).unwrap();
        vm.value_index_set(context, arr, 0, ten).unwrap();
        vm.value_index_set(context, arr, 2, thirty).unwrap();
        assert_eq!(vm.value_len(context, arr).unwrap(), 2);
        assert_eq!(vm.value_tag(context, arr), ValueTag::Arr);

        // The unset middle slot reads back as nil.
        let hole = vm.value_index_get(context, arr, 1).unwrap();
        assert_eq!(vm.value_tag(context, hole), ValueTag::Nil);
        vm.value_ref_down(context, hole);

        let walk: Vec<(FieldKey, i64)> = {
            let mut seen = Vec::new();
            let mut step = vm.value_fields_first(context, arr).unwrap();
            while let Some(entry) = step {
                seen.push((
                    entry.key.clone(),
                    vm.value_to_int(context, entry.value).unwrap(),
                ));
                vm.value_ref_down(context, entry.value);
                step = vm.value_fields_next(context, arr, entry.cursor).unwrap();
            }
            seen
        };
        assert_eq!(
            walk,
            vec![(FieldKey::Index(0), 10), (FieldKey::Index(2), 30)]
        );
        vm.value_ref_down(context, arr);

        let map = vm.value_make_map(context).unwrap();
        let two = vm.value_make_int(context, 2).unwrap();
        let one = vm.value_make_int(context, 1).unwrap();
        vm.value_key_set(context, map, "b", two).unwrap();
        vm.value_key_set(context, map, "a", one).unwrap();
        assert_eq!(vm.value_len(context, map).unwrap(), 2);

        let first = vm.value_fields_first(context, map).unwrap().unwrap();
        assert_eq!(first.key, FieldKey::Name("a".to_string()));
        vm.value_ref_down(context, first.value);
        let second = vm
            .value_fields_next(context, map, first.cursor)
            .unwrap()
            .unwrap();
        assert_eq!(second.key, FieldKey::Name("b".to_string()));
        vm.value_ref_down(context, second.value);
        assert!(vm
            .value_fields_next(context, map, second.cursor)
            .unwrap()
            .is_none());
        vm.value_ref_down(context, map);

        vm.engine_close(engine);
    }

    #[test]
    fn container_writes_replace_and_release() {
        let vm = KestrelVm::new();
        let (engine, context) = open_with(&vm, "return 0;");
        let ctx = vm.context(context);
        let baseline = ctx.live_values();

        let map = vm.value_make_map(context).unwrap();
        let old = vm.value_make_str(context, "old").unwrap();
        let new = vm.value_make_str(context, "new").unwrap();
        vm.value_key_set(context, map, "k", old).unwrap();
        vm.value_key_set(context, map, "k", new).unwrap();
        let got = vm.value_key_get(context, map, "k").unwrap();
        assert_eq!(vm.value_to_str(context, got).unwrap(), "new");
        vm.value_ref_down(context, got);
        vm.value_ref_down(context, map);

        assert_eq!(ctx.live_values(), baseline);
        vm.engine_close(engine);
    }

    #[test]
    fn conversion_failures_are_inspectable() {
        let vm = KestrelVm::new();
        let (engine, context) = open_with(&vm, "return 0;");
        let map = vm.value_make_map(context).unwrap();
        assert!(vm.value_to_int(context, map).is_err());
        assert_eq!(
            vm.context_error_info(context).msg,
            "cannot convert map to int"
        );
        vm.value_ref_down(context, map);
        vm.engine_close(engine);
    }

    #[test]
    fn traits_apply_to_later_runs() {
        let vm = KestrelVm::new();
        let (engine, context) = open_with(&vm, "return 7 / 2;");
        let out = vm.context_exec(context, &[]).unwrap();
        assert_eq!(vm.value_to_int(context, out).unwrap(), 3);
        vm.value_ref_down(context, out);

        vm.engine_set_trait(
            engine,
            vm.engine_get_trait(engine).with(TraitFlags::FLOAT_DIV),
        );
        let out = vm.context_exec(context, &[]).unwrap();
        assert_eq!(vm.value_to_flt(context, out).unwrap(), 3.5);
        vm.value_ref_down(context, out);
        vm.engine_close(engine);
    }

    #[test]
    fn exec_failure_keeps_the_context_usable() {
        let vm = KestrelVm::new();
        let (engine, context) = open_with(&vm, "return nope();");
        assert!(vm.context_exec(context, &[]).is_err());
        assert_eq!(
            vm.context_error_info(context).msg,
            "undefined function 'nope'"
        );
        // The same context still runs follow-up calls.
        assert!(vm.context_exec(context, &[]).is_err());
        vm.engine_close(engine);
    }

    #[test]
    fn closing_the_engine_sweeps_its_contexts() {
        let vm = KestrelVm::new();
        let (engine, _context) = open_with(&vm, "return 0;");
        assert_eq!(vm.contexts.lock().unwrap().live(), 1);
        vm.engine_close(engine);
        assert_eq!(vm.contexts.lock().unwrap().live(), 0);
    }

    #[test]
    #[should_panic(expected = "stale engine handle")]
    fn stale_engine_handles_panic() {
        let vm = KestrelVm::new();
        let engine = vm.engine_open().unwrap();
        vm.engine_close(engine);
        let _ = vm.engine_parse_text(engine, "return 0;");
    }

    #[test]
    #[should_panic(expected = "stale context handle")]
    fn stale_context_handles_panic() {
        let vm = KestrelVm::new();
        let (engine, context) = open_with(&vm, "return 0;");
        vm.context_close(context);
        let _ = vm.context_exec(context, &[]);
        vm.engine_close(engine);
    }

    #[test]
    fn raising_a_signal_on_a_stale_context_is_ignored() {
        let vm = KestrelVm::new();
        let (engine, context) = open_with(&vm, "return 0;");
        vm.context_close(context);
        vm.context_raise_signal(context, 2);
        vm.engine_close(engine);
    }

    #[test]
    fn pending_signal_interrupts_the_next_exec() {
        let vm = KestrelVm::new();
        let (engine, context) = open_with(&vm, "x = 1; return x;");
        vm.context_raise_signal(context, 2);
        assert!(vm.context_exec(context, &[]).is_err());
        assert_eq!(
            vm.context_error_info(context).msg,
            "interrupted by signal 2"
        );
        vm.engine_close(engine);
    }

    // The dispatcher is process-wide, so everything that needs hooks runs in
    // this one test against the shared library instance.
    #[test]
    fn dispatcher_routes_host_calls_and_failures() {
        fn hook(
            _engine: EngineExtension,
            context: ContextExtension,
            name: &str,
        ) -> DispatchSignal {
            let vm = library();
            let handle = RawContext::from_bits(context.context_slot as u64);
            match name {
                "echo" => {
                    assert_eq!(vm.frame_arg_count(handle).unwrap(), 1);
                    let arg = vm.frame_arg(handle, 0).unwrap();
                    let text = vm.value_to_str(handle, arg).unwrap();
                    vm.value_ref_down(handle, arg);
                    let out = vm.value_make_str(handle, &format!("echo:{text}")).unwrap();
                    vm.frame_set_return(handle, out).unwrap();
                    DispatchSignal::Handled
                }
                _ => {
                    vm.context_set_error(handle, "backend offline");
                    DispatchSignal::Fail
                }
            }
        }
        fn sigset(_context: ContextExtension, _signo: i32, _reset: bool) {}

        let vm = library();
        vm.install_dispatcher(DispatcherHooks {
            on_host_call: hook,
            on_sigset: sigset,
        });

        let engine = vm.engine_open().unwrap();
        vm.engine_register_function(engine, "echo", 1, 1, "v").unwrap();
        vm.engine_register_function(engine, "boom", 0, 0, "").unwrap();
        vm.engine_set_extension(
            engine,
            EngineExtension {
                engine_slot: engine.to_bits() as usize,
            },
        );
        vm.engine_parse_text(engine, "return echo(\"hi\");").unwrap();
        let context = vm.context_open(engine, 7, &IoSpec::default()).unwrap();
        vm.context_set_extension(
            context,
            ContextExtension {
                engine_slot: engine.to_bits() as usize,
                context_slot: context.to_bits() as usize,
            },
        );

        let out = vm.context_exec(context, &[]).unwrap();
        assert_eq!(vm.value_to_str(context, out).unwrap(), "echo:hi");
        vm.value_ref_down(context, out);

        vm.engine_parse_text(engine, "return boom();").unwrap();
        let failing = vm.context_open(engine, 8, &IoSpec::default()).unwrap();
        vm.context_set_extension(
            failing,
            ContextExtension {
                engine_slot: engine.to_bits() as usize,
                context_slot: failing.to_bits() as usize,
            },
        );
        assert!(vm.context_exec(failing, &[]).is_err());
        let err = vm.context_error_info(failing);
        assert_eq!(err.msg, "backend offline");
        assert_eq!(err.line, 1);

        vm.engine_close(engine);
    }
}
