//! Engine host object
//!
//! An [`Engine`] owns one native engine instance: the parsed program, the
//! declared globals, and the chain of contexts opened against it. Wrappers
//! are cheap clones over a shared core; the core tears itself down exactly
//! once, whether through an explicit [`Engine::close`], the drop of the
//! last wrapper, or not at all before process exit.
//!
//! Teardown order is fixed: mark closed, close every chained context (a
//! native engine close would strand their host wrappers on stale
//! handles), release the native engine, free the slot.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use dashmap::DashMap;
use kestrel_api::{EngineCalls, EngineExtension, IoSpec, RawEngine, ScriptError, TraitFlags};
use tracing::{debug, warn};

use crate::chain::Chain;
use crate::context::{Context, ContextShared};
use crate::dispatch;
use crate::error::{BridgeError, Result};
use crate::slot;

/// Host closure invoked when a script calls a registered function.
///
/// The closure reads arguments and sets its return value through the
/// frame operations on the [`Context`] it is handed; returning an error
/// surfaces the error's message at the script call site.
pub type HostCallback = Arc<dyn Fn(&Context) -> Result<()> + Send + Sync>;

pub(crate) struct EngineShared {
    pub(crate) calls: Arc<dyn EngineCalls>,
    pub(crate) handle: RawEngine,
    pub(crate) slot: OnceLock<usize>,
    pub(crate) closed: AtomicBool,
    /// Serializes teardown so a second closer waits for the first to
    /// finish instead of racing it.
    close_gate: Mutex<()>,
    pub(crate) contexts: Mutex<Chain<ContextShared>>,
    pub(crate) host_fns: DashMap<String, HostCallback>,
}

impl EngineShared {
    pub(crate) fn slot_id(&self) -> usize {
        *self.slot.get().expect("engine slot unpublished")
    }

    pub(crate) fn teardown(&self) {
        let _gate = self.close_gate.lock().unwrap();
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let orphans = self.contexts.lock().unwrap().snapshot();
        if !orphans.is_empty() {
            warn!(
                engine = self.handle.to_bits(),
                count = orphans.len(),
                "engine closed with live contexts"
            );
        }
        for context in orphans {
            context.teardown();
        }
        self.calls.engine_close(self.handle);
        slot::engines()
            .lock()
            .unwrap()
            .remove(self.slot_id())
            .expect("engine slot already freed");
        debug!(engine = self.handle.to_bits(), "engine closed");
    }
}

impl Drop for EngineShared {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Handle to a native engine instance.
#[derive(Clone)]
pub struct Engine {
    pub(crate) shared: Arc<EngineShared>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("handle", &self.shared.handle)
            .field("closed", &self.shared.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl Engine {
    /// Open a fresh engine on the given native library and register it in
    /// the process-wide engine table. The dispatcher trampolines are
    /// (re-)installed on every open; they are the same static functions
    /// each time, so repeat installs are harmless.
    pub fn open(calls: Arc<dyn EngineCalls>) -> Result<Engine> {
        let handle = calls
            .engine_open()
            .map_err(|_| BridgeError::Script(ScriptError::bare("cannot open engine")))?;
        let shared = Arc::new(EngineShared {
            calls: calls.clone(),
            handle,
            slot: OnceLock::new(),
            closed: AtomicBool::new(false),
            close_gate: Mutex::new(()),
            contexts: Mutex::new(Chain::new()),
            host_fns: DashMap::new(),
        });
        let slot = slot::engines().lock().unwrap().add(&shared);
        shared.slot.set(slot).expect("engine slot published twice");
        calls.engine_set_extension(handle, EngineExtension { engine_slot: slot });
        calls.install_dispatcher(dispatch::hooks());
        debug!(engine = handle.to_bits(), slot, "engine opened");
        Ok(Engine { shared })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            Err(BridgeError::Closed)
        } else {
            Ok(())
        }
    }

    /// Structured description of the most recent failure on this engine.
    fn inspect(&self) -> BridgeError {
        BridgeError::Script(self.shared.calls.engine_error_info(self.shared.handle))
    }

    /// Parse program text. Contexts already open keep running the program
    /// they were opened with.
    pub fn parse_text(&self, source: &str) -> Result<()> {
        self.ensure_open()?;
        self.shared
            .calls
            .engine_parse_text(self.shared.handle, source)
            .map_err(|_| self.inspect())
    }

    /// Parse the concatenation of the given script files.
    pub fn parse_files(&self, files: &[PathBuf]) -> Result<()> {
        self.ensure_open()?;
        self.shared
            .calls
            .engine_parse_files(self.shared.handle, files)
            .map_err(|_| self.inspect())
    }

    /// Declare a global before parsing; returns its table index.
    pub fn add_global(&self, name: &str) -> Result<usize> {
        self.ensure_open()?;
        self.shared
            .calls
            .engine_add_global(self.shared.handle, name)
            .map_err(|_| self.inspect())
    }

    /// Look up a global's table index.
    pub fn find_global(&self, name: &str, include_builtins: bool) -> Result<usize> {
        self.ensure_open()?;
        self.shared
            .calls
            .engine_find_global(self.shared.handle, name, include_builtins)
            .map_err(|_| self.inspect())
    }

    /// Register `callback` under `name`, callable from scripts with
    /// `min_args..=max_args` arguments. Re-registration replaces the
    /// previous closure.
    pub fn register_function(
        &self,
        name: &str,
        min_args: usize,
        max_args: usize,
        sig: &str,
        callback: impl Fn(&Context) -> Result<()> + Send + Sync + 'static,
    ) -> Result<()> {
        self.ensure_open()?;
        self.shared
            .calls
            .engine_register_function(self.shared.handle, name, min_args, max_args, sig)
            .map_err(|_| self.inspect())?;
        self.shared
            .host_fns
            .insert(name.to_string(), Arc::new(callback));
        debug!(engine = self.shared.handle.to_bits(), name, "host function registered");
        Ok(())
    }

    pub fn trait_flags(&self) -> Result<TraitFlags> {
        self.ensure_open()?;
        Ok(self.shared.calls.engine_get_trait(self.shared.handle))
    }

    pub fn set_trait_flags(&self, flags: TraitFlags) -> Result<()> {
        self.ensure_open()?;
        self.shared.calls.engine_set_trait(self.shared.handle, flags);
        Ok(())
    }

    /// Open an execution context against the currently parsed program.
    pub fn new_context(&self, id: u64, io: IoSpec) -> Result<Context> {
        self.ensure_open()?;
        Context::open(&self.shared, id, io)
    }

    /// Number of contexts currently chained under this engine.
    pub fn context_count(&self) -> usize {
        self.shared.contexts.lock().unwrap().count()
    }

    /// This engine's index in the process-wide engine table.
    pub fn slot_id(&self) -> usize {
        self.shared.slot_id()
    }

    /// Close the engine and everything still chained under it. Safe to
    /// call any number of times, from any clone.
    pub fn close(&self) {
        self.shared.teardown();
    }
}
