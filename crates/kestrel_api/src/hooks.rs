//! Dispatcher hooks: how the engine calls back into host code
//!
//! The engine knows nothing about host objects. When a script calls a
//! registered function, the engine invokes the process-wide host-call hook
//! with the extension data the host previously attached to the engine and
//! the context; the host uses those records to find its own objects again.
//! Hooks are plain function pointers because the host side installs static
//! trampolines, exactly once.

/// Host bookkeeping attached to an engine, echoed back in hooks.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EngineExtension {
    /// Slot of the host-side engine wrapper in the host's engine table.
    pub engine_slot: usize,
}

/// Host bookkeeping attached to a context, echoed back in hooks.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ContextExtension {
    pub engine_slot: usize,
    /// Slot of the host-side context wrapper in the host's context table.
    pub context_slot: usize,
}

/// Outcome of a dispatched host call.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DispatchSignal {
    /// The host handled the call; the frame's return value stands.
    Handled,
    /// The host failed; the engine reads the context error and raises it
    /// at the script call site.
    Fail,
}

/// Invoked when a script calls a registered host function. The frame
/// operations (`frame_arg_count`, `frame_arg`, `frame_set_return`) are
/// valid on `context` for the duration of the hook.
pub type HostCallHook =
    fn(engine: EngineExtension, context: ContextExtension, name: &str) -> DispatchSignal;

/// Invoked when a script asks to watch (`reset` false) or ignore
/// (`reset` true) a signal number, so the host can track interest.
pub type SigsetHook = fn(context: ContextExtension, signo: i32, reset: bool);

/// The pair of process-wide hooks, installed via
/// [`EngineCalls::install_dispatcher`](crate::calls::EngineCalls::install_dispatcher).
#[derive(Debug, Copy, Clone)]
pub struct DispatcherHooks {
    pub on_host_call: HostCallHook,
    pub on_sigset: SigsetHook,
}
