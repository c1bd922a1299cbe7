//! Dispatcher trampolines
//!
//! The engine calls host code through two process-wide function pointers.
//! Both resolve the extension records they are handed back into live host
//! objects via the slot tables; a slot that no longer upgrades means the
//! wrapper died while the call was in flight, and the dispatch is dropped
//! rather than followed into freed state.
//!
//! Host-call resolution is two-level: the engine slot finds the closure
//! registry, the context slot finds the context the frame operations act
//! on. A name with no registered closure and a closure that returns an
//! error both report through the context's error channel and fail the
//! call at the script call site.

use std::sync::atomic::Ordering;

use kestrel_api::{ContextExtension, DispatchSignal, DispatcherHooks, EngineExtension};
use tracing::{debug, warn};

use crate::context::Context;
use crate::slot;

pub(crate) fn hooks() -> DispatcherHooks {
    DispatcherHooks {
        on_host_call: host_call,
        on_sigset: sigset,
    }
}

fn host_call(
    engine_ext: EngineExtension,
    context_ext: ContextExtension,
    name: &str,
) -> DispatchSignal {
    let Some(engine) = slot::resolve_engine(engine_ext.engine_slot) else {
        warn!(slot = engine_ext.engine_slot, name, "host call on dead engine slot");
        return DispatchSignal::Fail;
    };
    let Some(context) = slot::resolve_context(context_ext.context_slot) else {
        warn!(slot = context_ext.context_slot, name, "host call on dead context slot");
        return DispatchSignal::Fail;
    };
    let Some(callback) = engine.host_fns.get(name).map(|entry| entry.value().clone()) else {
        context
            .calls
            .context_set_error(context.handle, &format!("function '{name}' not found"));
        return DispatchSignal::Fail;
    };

    let wrapper = Context::from_shared(context.clone());
    context.live_calls.fetch_add(1, Ordering::SeqCst);
    let outcome = callback(&wrapper);
    context.live_calls.fetch_sub(1, Ordering::SeqCst);

    match outcome {
        Ok(()) => DispatchSignal::Handled,
        Err(err) => {
            debug!(name, %err, "host call failed");
            context
                .calls
                .context_set_error(context.handle, &err.channel_message());
            DispatchSignal::Fail
        }
    }
}

fn sigset(context_ext: ContextExtension, signo: i32, reset: bool) {
    let Some(context) = slot::resolve_context(context_ext.context_slot) else {
        warn!(slot = context_ext.context_slot, signo, "sigset on dead context slot");
        return;
    };
    let watcher = context.sigset_watcher.lock().unwrap().clone();
    if let Some(watcher) = watcher {
        watcher(signo, reset);
    }
}
