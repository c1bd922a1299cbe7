//! Kestrel Script Engine
//!
//! A self-contained, handle-based script engine implementing the
//! [`kestrel_api::EngineCalls`] surface. Hosts drive it exclusively through
//! opaque generation-indexed handles; the engine owns every object and
//! detects stale or double-released handles instead of following them.
//!
//! ## Architecture
//!
//! - **Instances:** engines and execution contexts live in generational
//!   arenas inside one process-global library value
//! - **Values:** each context owns a refcounted cell heap; every
//!   value-returning operation transfers one reference unit to the caller
//! - **Execution:** hand-rolled lexer + recursive-descent parser feeding a
//!   tree-walking evaluator with cooperative signal checkpoints
//! - **Host calls:** registered functions dispatch through process-wide
//!   hooks installed by the embedder; frame operations are re-entrant, so
//!   host code may create and inspect values mid-call

pub mod arena;
pub mod ast;
pub mod context;
pub mod engine;
pub mod eval;
pub mod heap;
pub mod lexer;
pub mod parser;
pub mod vm;

pub use vm::{library, KestrelVm};
