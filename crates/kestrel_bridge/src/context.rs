//! Context host object
//!
//! A [`Context`] is one execution of the engine's parsed program: private
//! global bindings, private value heap, and a chain of every host-visible
//! [`Value`] created through it. Contexts are chained under their engine
//! so an engine close sweeps them; their values are chained under them
//! for the same reason.
//!
//! Teardown order is the mirror of creation: close every chained value,
//! release the native context, splice out of the engine chain, free the
//! slot. The membership receipt makes the splice idempotent no matter
//! which of explicit close, engine cascade or drop runs first.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use kestrel_api::{ContextExtension, EngineCalls, IoSpec, RawContext, RawValue};
use tracing::{debug, trace, warn};

use crate::chain::{Chain, Membership};
use crate::engine::EngineShared;
use crate::error::{BridgeError, Result};
use crate::slot;
use crate::value::{Value, ValueShared};

/// Watcher invoked when the script asks to watch (`reset` false) or
/// ignore (`reset` true) a signal number.
pub type SigsetWatcher = Arc<dyn Fn(i32, bool) + Send + Sync>;

pub(crate) struct ContextShared {
    pub(crate) calls: Arc<dyn EngineCalls>,
    pub(crate) handle: RawContext,
    pub(crate) id: u64,
    pub(crate) slot: OnceLock<usize>,
    pub(crate) closed: AtomicBool,
    close_gate: Mutex<()>,
    membership: Mutex<Option<Membership<EngineShared>>>,
    pub(crate) values: Mutex<Chain<ValueShared>>,
    /// Depth of dispatched host calls currently on this context's stack.
    pub(crate) live_calls: AtomicUsize,
    pub(crate) sigset_watcher: Mutex<Option<SigsetWatcher>>,
}

impl ContextShared {
    pub(crate) fn slot_id(&self) -> usize {
        *self.slot.get().expect("context slot unpublished")
    }

    /// Best-effort signal delivery; a closed or closing context just
    /// drops the request.
    pub(crate) fn raise(&self, signo: i32) {
        if self.closed.load(Ordering::SeqCst) {
            warn!(context = self.id, signo, "dropping signal for closed context");
            return;
        }
        self.calls.context_raise_signal(self.handle, signo);
    }

    pub(crate) fn teardown(&self) {
        let _gate = self.close_gate.lock().unwrap();
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let leftovers = self.values.lock().unwrap().snapshot();
        if !leftovers.is_empty() {
            debug!(
                context = self.id,
                count = leftovers.len(),
                "context closed with live values"
            );
        }
        for value in leftovers {
            value.teardown();
        }
        self.calls.context_close(self.handle);
        let membership = self.membership.lock().unwrap().take();
        if let Some(m) = membership {
            if let Some(engine) = m.parent.upgrade() {
                engine.contexts.lock().unwrap().splice(m.node);
            }
        }
        slot::contexts()
            .lock()
            .unwrap()
            .remove(self.slot_id())
            .expect("context slot already freed");
        debug!(context = self.id, "context closed");
    }
}

impl Drop for ContextShared {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Handle to one execution context.
#[derive(Clone)]
pub struct Context {
    pub(crate) shared: Arc<ContextShared>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.shared.id)
            .field("handle", &self.shared.handle)
            .field("closed", &self.shared.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl Context {
    pub(crate) fn from_shared(shared: Arc<ContextShared>) -> Context {
        Context { shared }
    }

    /// Open a native context, register it in the context table, publish
    /// its extension record and chain it under the engine.
    pub(crate) fn open(engine: &Arc<EngineShared>, id: u64, io: IoSpec) -> Result<Context> {
        let handle = engine
            .calls
            .context_open(engine.handle, id, &io)
            .map_err(|_| BridgeError::Script(engine.calls.engine_error_info(engine.handle)))?;
        let shared = Arc::new(ContextShared {
            calls: engine.calls.clone(),
            handle,
            id,
            slot: OnceLock::new(),
            closed: AtomicBool::new(false),
            close_gate: Mutex::new(()),
            membership: Mutex::new(None),
            values: Mutex::new(Chain::new()),
            live_calls: AtomicUsize::new(0),
            sigset_watcher: Mutex::new(None),
        });
        let slot = slot::contexts().lock().unwrap().add(&shared);
        shared.slot.set(slot).expect("context slot published twice");
        {
            let mut chain = engine.contexts.lock().unwrap();
            if engine.closed.load(Ordering::SeqCst) {
                // Lost the race against engine teardown. The native side
                // is swept by the engine close; retract the host side.
                drop(chain);
                shared.closed.store(true, Ordering::SeqCst);
                slot::contexts()
                    .lock()
                    .unwrap()
                    .remove(slot)
                    .expect("context slot already freed");
                return Err(BridgeError::Closed);
            }
            // Engine teardown snapshots under this lock before it sweeps
            // the native side, so the handle is still live here.
            engine.calls.context_set_extension(
                handle,
                ContextExtension {
                    engine_slot: engine.slot_id(),
                    context_slot: slot,
                },
            );
            let node = chain.append(shared.clone());
            *shared.membership.lock().unwrap() = Some(Membership {
                parent: Arc::downgrade(engine),
                node,
            });
        }
        debug!(context = id, slot, "context opened");
        Ok(Context { shared })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            Err(BridgeError::Closed)
        } else {
            Ok(())
        }
    }

    /// Structured description of the most recent failure on this context.
    fn inspect(&self) -> BridgeError {
        BridgeError::Script(self.shared.calls.context_error_info(self.shared.handle))
    }

    /// Chain a freshly returned native handle; its transferred reference
    /// unit becomes the chained value's unit.
    fn adopt(&self, raw: RawValue) -> Result<Value> {
        Value::bind(&self.shared, raw)
    }

    fn check_same_context(&self, value: &Value) -> Result<()> {
        value.ensure_open()?;
        if value.context_handle() != self.shared.handle {
            return Err(BridgeError::ForeignValue);
        }
        Ok(())
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// This context's index in the process-wide context table.
    pub fn slot_id(&self) -> usize {
        self.shared.slot_id()
    }

    /// Run the program's main body. `args` populate the script's ARGC and
    /// ARGV; the returned value is the body's top-level return (nil when
    /// it falls off the end).
    pub fn exec(&self, args: &[String]) -> Result<Value> {
        self.ensure_open()?;
        trace!(context = self.shared.id, argc = args.len(), "exec");
        let raw = self
            .shared
            .calls
            .context_exec(self.shared.handle, args)
            .map_err(|_| self.inspect())?;
        self.adopt(raw)
    }

    /// Call a named script function. The arguments keep their own
    /// reference units; the result arrives as a fresh chained value.
    pub fn call(&self, name: &str, args: &[&Value]) -> Result<Value> {
        self.ensure_open()?;
        let mut raws = Vec::with_capacity(args.len());
        for arg in args {
            self.check_same_context(arg)?;
            raws.push(arg.raw());
        }
        trace!(context = self.shared.id, name, argc = raws.len(), "call");
        let raw = self
            .shared
            .calls
            .context_call(self.shared.handle, name, &raws)
            .map_err(|_| self.inspect())?;
        self.adopt(raw)
    }

    /// Bind `value` to a global slot from `add_global` / `find_global`.
    /// The binding holds its own reference unit; the passed value keeps
    /// the one it had.
    pub fn set_global(&self, index: usize, value: &Value) -> Result<()> {
        self.ensure_open()?;
        self.check_same_context(value)?;
        // The global table takes over the extra unit, error or not.
        self.shared.calls.value_ref_up(self.shared.handle, value.raw());
        self.shared
            .calls
            .context_set_global(self.shared.handle, index, value.raw())
            .map_err(|_| self.inspect())
    }

    /// Snapshot of the context's named (implicitly created) variables,
    /// each surfaced as a fresh chained value.
    pub fn named_vars(&self) -> Result<Vec<(String, Value)>> {
        self.ensure_open()?;
        let raws = self
            .shared
            .calls
            .context_named_vars(self.shared.handle)
            .map_err(|_| self.inspect())?;
        let mut out = Vec::with_capacity(raws.len());
        for (name, raw) in raws {
            out.push((name, self.adopt(raw)?));
        }
        Ok(out)
    }

    /// Mark a signal pending on the running script, which unwinds at its
    /// next cooperative checkpoint. Best effort: a closed context drops
    /// the request.
    pub fn raise_signal(&self, signo: i32) {
        self.shared.raise(signo);
    }

    /// Install the watcher told about the script's `signal_watch` /
    /// `signal_ignore` requests. Replaces any previous watcher.
    pub fn on_sigset(&self, watcher: impl Fn(i32, bool) + Send + Sync + 'static) {
        *self.shared.sigset_watcher.lock().unwrap() = Some(Arc::new(watcher));
    }

    /// Number of values currently chained under this context.
    pub fn value_count(&self) -> usize {
        self.shared.values.lock().unwrap().count()
    }

    // ------------------------------------------------------------------
    // Host-call frame (valid inside a dispatched callback)
    // ------------------------------------------------------------------

    fn ensure_in_call(&self) -> Result<()> {
        self.ensure_open()?;
        if self.shared.live_calls.load(Ordering::SeqCst) == 0 {
            return Err(BridgeError::NotInCall);
        }
        Ok(())
    }

    /// Number of arguments of the host call being dispatched.
    pub fn arg_count(&self) -> Result<usize> {
        self.ensure_in_call()?;
        self.shared
            .calls
            .frame_arg_count(self.shared.handle)
            .map_err(|_| self.inspect())
    }

    /// One argument of the host call being dispatched.
    pub fn arg(&self, index: usize) -> Result<Value> {
        self.ensure_in_call()?;
        let raw = self
            .shared
            .calls
            .frame_arg(self.shared.handle, index)
            .map_err(|_| self.inspect())?;
        self.adopt(raw)
    }

    /// Set the value the script call evaluates to. The frame holds its
    /// own reference unit; the passed value keeps the one it had.
    pub fn set_return(&self, value: &Value) -> Result<()> {
        self.ensure_in_call()?;
        self.check_same_context(value)?;
        // The frame takes over the extra unit, error or not.
        self.shared.calls.value_ref_up(self.shared.handle, value.raw());
        self.shared
            .calls
            .frame_set_return(self.shared.handle, value.raw())
            .map_err(|_| self.inspect())
    }

    // ------------------------------------------------------------------
    // Value constructors
    // ------------------------------------------------------------------

    pub fn new_int(&self, v: i64) -> Result<Value> {
        self.ensure_open()?;
        let raw = self
            .shared
            .calls
            .value_make_int(self.shared.handle, v)
            .map_err(|_| self.inspect())?;
        self.adopt(raw)
    }

    pub fn new_flt(&self, v: f64) -> Result<Value> {
        self.ensure_open()?;
        let raw = self
            .shared
            .calls
            .value_make_flt(self.shared.handle, v)
            .map_err(|_| self.inspect())?;
        self.adopt(raw)
    }

    pub fn new_str(&self, v: &str) -> Result<Value> {
        self.ensure_open()?;
        let raw = self
            .shared
            .calls
            .value_make_str(self.shared.handle, v)
            .map_err(|_| self.inspect())?;
        self.adopt(raw)
    }

    pub fn new_bytes(&self, v: &[u8]) -> Result<Value> {
        self.ensure_open()?;
        let raw = self
            .shared
            .calls
            .value_make_bytes(self.shared.handle, v)
            .map_err(|_| self.inspect())?;
        self.adopt(raw)
    }

    pub fn new_map(&self) -> Result<Value> {
        self.ensure_open()?;
        let raw = self
            .shared
            .calls
            .value_make_map(self.shared.handle)
            .map_err(|_| self.inspect())?;
        self.adopt(raw)
    }

    pub fn new_arr(&self, capacity: usize) -> Result<Value> {
        self.ensure_open()?;
        let raw = self
            .shared
            .calls
            .value_make_arr(self.shared.handle, capacity)
            .map_err(|_| self.inspect())?;
        self.adopt(raw)
    }

    /// Integer if the text parses as one, else float, else string. The
    /// conversion command-line assignments want.
    pub fn new_num_or_str(&self, text: &str) -> Result<Value> {
        if let Ok(v) = text.parse::<i64>() {
            return self.new_int(v);
        }
        if let Ok(v) = text.parse::<f64>() {
            return self.new_flt(v);
        }
        self.new_str(text)
    }

    /// Close the context and every value still chained under it. Safe to
    /// call any number of times, from any clone.
    pub fn close(&self) {
        self.shared.teardown();
    }
}
