//! Execution context state
//!
//! A context pairs a snapshot of the engine's program with its own value
//! heap, global bindings, named variables and host-call frame stack. All
//! interior state sits behind brief per-structure mutexes; nothing is held
//! across interpretation, which is what lets host callbacks re-enter the
//! value operations mid-call.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use kestrel_api::{
    ContextExtension, IoSpec, NativeFault, NativeResult, OutputSink, RawValue, ScriptError,
};
use tracing::warn;

use crate::ast::Program;
use crate::engine::EngineInst;
use crate::heap::{Heap, Payload};

/// One dispatched host call. The frame owns one unit per argument and one
/// for the pending return value.
#[derive(Debug)]
pub struct HostFrame {
    pub args: Vec<RawValue>,
    pub ret: Option<RawValue>,
}

#[derive(Debug)]
pub struct ContextInst {
    pub id: u64,
    pub engine: Arc<EngineInst>,
    pub program: Arc<Program>,
    pub io: IoSpec,
    pub heap: Mutex<Heap>,
    globals: Mutex<Vec<RawValue>>,
    named: Mutex<BTreeMap<String, RawValue>>,
    frames: Mutex<Vec<HostFrame>>,
    pending_signal: AtomicI32,
    host_error: Mutex<Option<String>>,
    last_error: Mutex<ScriptError>,
    pub ext: Mutex<Option<ContextExtension>>,
}

impl ContextInst {
    pub fn new(engine: Arc<EngineInst>, program: Arc<Program>, id: u64, io: IoSpec) -> Self {
        let mut heap = Heap::new();
        let globals = (0..engine.global_count())
            .map(|_| heap.alloc(Payload::Nil))
            .collect();
        Self {
            id,
            engine,
            program,
            io,
            heap: Mutex::new(heap),
            globals: Mutex::new(globals),
            named: Mutex::new(BTreeMap::new()),
            frames: Mutex::new(Vec::new()),
            pending_signal: AtomicI32::new(0),
            host_error: Mutex::new(None),
            last_error: Mutex::new(ScriptError::bare("no error")),
            ext: Mutex::new(None),
        }
    }

    // ------------------------------------------------------------------
    // errors
    // ------------------------------------------------------------------

    pub fn fail<T>(&self, err: ScriptError) -> NativeResult<T> {
        *self.last_error.lock().unwrap() = err;
        Err(NativeFault)
    }

    pub fn record_error(&self, err: ScriptError) {
        *self.last_error.lock().unwrap() = err;
    }

    pub fn last_error(&self) -> ScriptError {
        self.last_error.lock().unwrap().clone()
    }

    /// Message deposited by the host via `context_set_error` during a
    /// failing dispatch, consumed when the engine raises the call error.
    pub fn set_host_error(&self, msg: &str) {
        *self.host_error.lock().unwrap() = Some(msg.to_string());
    }

    pub fn take_host_error(&self) -> Option<String> {
        self.host_error.lock().unwrap().take()
    }

    // ------------------------------------------------------------------
    // values
    // ------------------------------------------------------------------

    pub fn make(&self, payload: Payload) -> RawValue {
        self.heap.lock().unwrap().alloc(payload)
    }

    pub fn retain(&self, h: RawValue) {
        self.heap.lock().unwrap().retain(h);
    }

    pub fn release(&self, h: RawValue) {
        self.heap.lock().unwrap().release(h);
    }

    pub fn live_values(&self) -> usize {
        self.heap.lock().unwrap().live()
    }

    // ------------------------------------------------------------------
    // globals and named variables
    // ------------------------------------------------------------------

    /// Bind a global slot, taking over the caller's unit.
    pub fn set_global_unit(&self, index: usize, value: RawValue) -> NativeResult<()> {
        let mut globals = self.globals.lock().unwrap();
        let Some(slot) = globals.get_mut(index) else {
            drop(globals);
            self.release(value);
            return self.fail(ScriptError::bare(format!(
                "global index {index} out of range"
            )));
        };
        let old = std::mem::replace(slot, value);
        drop(globals);
        self.release(old);
        Ok(())
    }

    /// Read a global slot; the returned handle carries a fresh unit.
    pub fn global_unit(&self, index: usize) -> Option<RawValue> {
        let globals = self.globals.lock().unwrap();
        let h = *globals.get(index)?;
        drop(globals);
        self.retain(h);
        Some(h)
    }

    /// Write a named variable, taking over the caller's unit.
    pub fn set_named_unit(&self, name: &str, value: RawValue) {
        let old = self.named.lock().unwrap().insert(name.to_string(), value);
        if let Some(old) = old {
            self.release(old);
        }
    }

    /// Read a named variable (+1), or `None` when it was never written.
    pub fn named_unit(&self, name: &str) -> Option<RawValue> {
        let named = self.named.lock().unwrap();
        let h = *named.get(name)?;
        drop(named);
        self.retain(h);
        Some(h)
    }

    pub fn named_snapshot(&self) -> Vec<(String, RawValue)> {
        let named = self.named.lock().unwrap();
        let pairs: Vec<(String, RawValue)> =
            named.iter().map(|(k, v)| (k.clone(), *v)).collect();
        drop(named);
        for (_, h) in &pairs {
            self.retain(*h);
        }
        pairs
    }

    // ------------------------------------------------------------------
    // host-call frames
    // ------------------------------------------------------------------

    pub fn push_frame(&self, args: Vec<RawValue>) {
        self.frames.lock().unwrap().push(HostFrame { args, ret: None });
    }

    /// Pop the current frame and release the units it still owns,
    /// returning the pending return unit (if the host set one).
    pub fn pop_frame(&self) -> Option<RawValue> {
        let frame = self
            .frames
            .lock()
            .unwrap()
            .pop()
            .expect("frame stack underflow");
        for arg in frame.args {
            self.release(arg);
        }
        frame.ret
    }

    pub fn frame_arg_count(&self) -> NativeResult<usize> {
        let frames = self.frames.lock().unwrap();
        match frames.last() {
            Some(frame) => Ok(frame.args.len()),
            None => {
                drop(frames);
                self.fail(ScriptError::bare("no host call in progress"))
            }
        }
    }

    pub fn frame_arg(&self, index: usize) -> NativeResult<RawValue> {
        let frames = self.frames.lock().unwrap();
        let Some(frame) = frames.last() else {
            drop(frames);
            return self.fail(ScriptError::bare("no host call in progress"));
        };
        let Some(&h) = frame.args.get(index) else {
            let have = frame.args.len();
            drop(frames);
            return self.fail(ScriptError::bare(format!(
                "argument index {index} out of range ({have} arguments)"
            )));
        };
        drop(frames);
        self.retain(h);
        Ok(h)
    }

    /// Install the call's return value, taking over the caller's unit.
    pub fn frame_set_return(&self, value: RawValue) -> NativeResult<()> {
        let mut frames = self.frames.lock().unwrap();
        let Some(frame) = frames.last_mut() else {
            drop(frames);
            self.release(value);
            return self.fail(ScriptError::bare("no host call in progress"));
        };
        let old = frame.ret.replace(value);
        drop(frames);
        if let Some(old) = old {
            self.release(old);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // signals and output
    // ------------------------------------------------------------------

    pub fn raise_signal(&self, signo: i32) {
        self.pending_signal.store(signo, Ordering::SeqCst);
    }

    /// Consume the pending signal mark, if any.
    pub fn take_signal(&self) -> Option<i32> {
        match self.pending_signal.swap(0, Ordering::SeqCst) {
            0 => None,
            signo => Some(signo),
        }
    }

    pub fn write_output(&self, text: &str) {
        match &self.io.output {
            OutputSink::Inherit => {
                let stdout = std::io::stdout();
                let mut lock = stdout.lock();
                if let Err(err) = lock.write_all(text.as_bytes()) {
                    warn!(context = self.id, %err, "dropping script output");
                }
            }
            OutputSink::Capture(buf) => buf.lock().unwrap().push_str(text),
            OutputSink::File(file) => {
                if let Err(err) = file.lock().unwrap().write_all(text.as_bytes()) {
                    warn!(context = self.id, %err, "dropping script output");
                }
            }
            OutputSink::Null => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser;

    fn context() -> ContextInst {
        let engine = Arc::new(EngineInst::new());
        let program = Arc::new(parser::parse("x = 1;", "t").unwrap());
        ContextInst::new(engine, program, 1, IoSpec::default())
    }

    #[test]
    fn open_seeds_one_nil_per_global() {
        let ctx = context();
        assert_eq!(ctx.live_values(), crate::engine::BUILTIN_GLOBALS.len());
    }

    #[test]
    fn set_global_releases_previous_binding() {
        let ctx = context();
        let before = ctx.live_values();
        let v = ctx.make(Payload::Int(10));
        ctx.set_global_unit(0, v).unwrap();
        // New cell bound, old nil freed.
        assert_eq!(ctx.live_values(), before);
        let read = ctx.global_unit(0).unwrap();
        assert_eq!(*ctx.heap.lock().unwrap().payload(read), Payload::Int(10));
        ctx.release(read);
    }

    #[test]
    fn out_of_range_global_fails_without_leak() {
        let ctx = context();
        let before = ctx.live_values();
        let v = ctx.make(Payload::Int(1));
        assert!(ctx.set_global_unit(999, v).is_err());
        assert_eq!(ctx.live_values(), before);
        assert_eq!(ctx.last_error().msg, "global index 999 out of range");
    }

    #[test]
    fn named_vars_round_trip() {
        let ctx = context();
        let v = ctx.make(Payload::Str("seen".into()));
        ctx.set_named_unit("flag", v);
        let read = ctx.named_unit("flag").unwrap();
        assert_eq!(
            *ctx.heap.lock().unwrap().payload(read),
            Payload::Str("seen".into())
        );
        ctx.release(read);
        assert!(ctx.named_unit("missing").is_none());
    }

    #[test]
    fn frame_ops_require_live_call() {
        let ctx = context();
        assert!(ctx.frame_arg_count().is_err());
        assert_eq!(ctx.last_error().msg, "no host call in progress");
    }

    #[test]
    fn frame_owns_args_and_return() {
        let ctx = context();
        let base = ctx.live_values();
        let a = ctx.make(Payload::Int(1));
        ctx.push_frame(vec![a]);
        assert_eq!(ctx.frame_arg_count().unwrap(), 1);

        let got = ctx.frame_arg(0).unwrap();
        assert_eq!(got, a);
        ctx.release(got);

        let ret = ctx.make(Payload::Int(2));
        ctx.frame_set_return(ret).unwrap();
        let ret2 = ctx.make(Payload::Int(3));
        ctx.frame_set_return(ret2).unwrap(); // replaces and frees the first

        let out = ctx.pop_frame().expect("return value set");
        assert_eq!(*ctx.heap.lock().unwrap().payload(out), Payload::Int(3));
        ctx.release(out);
        assert_eq!(ctx.live_values(), base);
    }

    #[test]
    fn signal_mark_is_consumed_once() {
        let ctx = context();
        ctx.raise_signal(2);
        assert_eq!(ctx.take_signal(), Some(2));
        assert_eq!(ctx.take_signal(), None);
    }
}
