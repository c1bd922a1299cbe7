//! Kestrel Engine API
//!
//! Shared vocabulary between the script engine (`kestrel_vm`) and the
//! host-side bridge (`kestrel_bridge`):
//! - Opaque generation-indexed handles for engines, contexts and values
//! - The `EngineCalls` surface the engine exposes to its embedder
//! - Dispatcher hooks so the engine can call back into host code
//!
//! The bridge only ever talks to the engine through `Arc<dyn EngineCalls>`,
//! so an alternative engine implementation can be slotted in without
//! touching host code.

pub mod calls;
pub mod error;
pub mod handle;
pub mod hooks;

pub use calls::{
    EngineCalls, FieldCursor, FieldEntry, FieldKey, IoSpec, OutputSink, TraitFlags, ValueTag,
};
pub use error::{NativeFault, NativeResult, ScriptError};
pub use handle::{RawContext, RawEngine, RawValue};
pub use hooks::{ContextExtension, DispatchSignal, DispatcherHooks, EngineExtension};
