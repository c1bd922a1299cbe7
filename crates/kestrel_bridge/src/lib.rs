//! Kestrel Bridge
//!
//! Host-side lifecycle controller over the engine's native call surface.
//! The engine ([`kestrel_api::EngineCalls`]) owns every script object and
//! hands out opaque handles; this crate owns the discipline around them:
//!
//! - **Slot tables:** process-wide identity maps so the engine can refer
//!   back to host wrappers by index instead of pointer
//! - **Ownership chains:** every context is chained under its engine and
//!   every value under its context, so closing a parent sweeps the
//!   children the host forgot
//! - **Lifecycle:** [`Engine`], [`Context`] and [`Value`] wrappers with
//!   idempotent teardown, whether closed explicitly, by cascade or by
//!   dropping the last clone
//! - **Dispatch:** script calls to registered host functions route
//!   through static trampolines back to the owning engine's closures
//! - **Signal relay:** a worker thread fanning raised signals out to
//!   enlisted contexts
//!
//! Every tracked value owns exactly one engine-side reference unit,
//! acquired when the wrapper is chained and released when it is
//! unchained. Operations that store a value somewhere the engine keeps
//! its own reference (globals, containers, call returns) push an extra
//! unit first, so the wrapper's unit always survives the operation.

mod chain;
mod dispatch;
mod slot;

pub mod context;
pub mod engine;
pub mod error;
pub mod relay;
pub mod value;

pub use context::{Context, SigsetWatcher};
pub use engine::{Engine, HostCallback};
pub use error::{BridgeError, Result};
pub use relay::SignalRelay;
pub use slot::{context_slot_stats, engine_slot_stats, SlotStats};
pub use value::{Fields, Value};

pub use kestrel_api::{
    EngineCalls, FieldKey, IoSpec, OutputSink, ScriptError, TraitFlags, ValueTag,
};
