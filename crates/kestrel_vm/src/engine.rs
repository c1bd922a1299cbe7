//! Engine instance state
//!
//! An engine owns the parsed program, the global-variable declarations and
//! the host-function registrations shared by every context opened on it.
//! Value state lives in the contexts; the engine itself is cheap to share.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use kestrel_api::{EngineExtension, NativeFault, NativeResult, ScriptError, TraitFlags};

use crate::ast::Program;

/// Globals every program sees, in fixed table order.
pub const BUILTIN_GLOBALS: [&str; 4] = ["ARGC", "ARGV", "SCRIPTNAME", "FS"];

pub const GBL_ARGC: usize = 0;
pub const GBL_ARGV: usize = 1;
pub const GBL_SCRIPTNAME: usize = 2;
pub const GBL_FS: usize = 3;

#[derive(Debug, Clone)]
pub struct GlobalDef {
    pub name: String,
    pub builtin: bool,
}

/// A host-function registration. `sig` is kept verbatim for the host's own
/// use; only the arity range is enforced by the engine.
#[derive(Debug, Clone)]
pub struct HostFnDef {
    pub min_args: usize,
    pub max_args: usize,
    pub sig: String,
}

#[derive(Debug)]
pub struct EngineInst {
    pub program: Mutex<Option<Arc<Program>>>,
    pub globals: Mutex<Vec<GlobalDef>>,
    pub host_fns: Mutex<HashMap<String, HostFnDef>>,
    pub ext: Mutex<Option<EngineExtension>>,
    pub traits: Mutex<TraitFlags>,
    last_error: Mutex<ScriptError>,
}

impl EngineInst {
    pub fn new() -> Self {
        let globals = BUILTIN_GLOBALS
            .iter()
            .map(|&name| GlobalDef {
                name: name.to_string(),
                builtin: true,
            })
            .collect();
        Self {
            program: Mutex::new(None),
            globals: Mutex::new(globals),
            host_fns: Mutex::new(HashMap::new()),
            ext: Mutex::new(None),
            traits: Mutex::new(TraitFlags::empty()),
            last_error: Mutex::new(ScriptError::bare("no error")),
        }
    }

    /// Record a failure and produce the fault marker for the caller.
    pub fn fail<T>(&self, err: ScriptError) -> NativeResult<T> {
        *self.last_error.lock().unwrap() = err;
        Err(NativeFault)
    }

    pub fn set_error(&self, err: ScriptError) {
        *self.last_error.lock().unwrap() = err;
    }

    pub fn last_error(&self) -> ScriptError {
        self.last_error.lock().unwrap().clone()
    }

    pub fn add_global(&self, name: &str) -> NativeResult<usize> {
        if self.program.lock().unwrap().is_some() {
            return self.fail(ScriptError::bare(format!(
                "cannot declare global '{name}' after parse"
            )));
        }
        if !is_ident(name) {
            return self.fail(ScriptError::bare(format!("bad global name '{name}'")));
        }
        let mut globals = self.globals.lock().unwrap();
        if globals.iter().any(|g| g.name == name) {
            return self.fail(ScriptError::bare(format!("duplicate global '{name}'")));
        }
        globals.push(GlobalDef {
            name: name.to_string(),
            builtin: false,
        });
        Ok(globals.len() - 1)
    }

    pub fn find_global(&self, name: &str, include_builtins: bool) -> NativeResult<usize> {
        let globals = self.globals.lock().unwrap();
        match globals
            .iter()
            .position(|g| g.name == name && (include_builtins || !g.builtin))
        {
            Some(index) => Ok(index),
            None => {
                drop(globals);
                self.fail(ScriptError::bare(format!("no such global '{name}'")))
            }
        }
    }

    /// Name lookup used by the evaluator; never fails, never skips
    /// builtins.
    pub fn global_index(&self, name: &str) -> Option<usize> {
        self.globals
            .lock()
            .unwrap()
            .iter()
            .position(|g| g.name == name)
    }

    pub fn global_count(&self) -> usize {
        self.globals.lock().unwrap().len()
    }

    pub fn register_function(
        &self,
        name: &str,
        min_args: usize,
        max_args: usize,
        sig: &str,
    ) -> NativeResult<()> {
        if !is_ident(name) {
            return self.fail(ScriptError::bare(format!("bad function name '{name}'")));
        }
        if min_args > max_args {
            return self.fail(ScriptError::bare(format!(
                "function '{name}': min arity {min_args} exceeds max arity {max_args}"
            )));
        }
        // Re-registration replaces the previous entry.
        self.host_fns.lock().unwrap().insert(
            name.to_string(),
            HostFnDef {
                min_args,
                max_args,
                sig: sig.to_string(),
            },
        );
        Ok(())
    }

    pub fn host_fn(&self, name: &str) -> Option<HostFnDef> {
        self.host_fns.lock().unwrap().get(name).cloned()
    }

    pub fn install_program(&self, program: Program) {
        *self.program.lock().unwrap() = Some(Arc::new(program));
    }

    pub fn current_program(&self) -> Option<Arc<Program>> {
        self.program.lock().unwrap().clone()
    }
}

impl Default for EngineInst {
    fn default() -> Self {
        Self::new()
    }
}

fn is_ident(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_globals_come_first() {
        let eng = EngineInst::new();
        assert_eq!(eng.global_index("ARGC"), Some(0));
        assert_eq!(eng.global_index("FS"), Some(3));
    }

    #[test]
    fn added_globals_follow_builtins() {
        let eng = EngineInst::new();
        let idx = eng.add_global("threshold").unwrap();
        assert_eq!(idx, BUILTIN_GLOBALS.len());
        assert_eq!(eng.find_global("threshold", false).unwrap(), idx);
    }

    #[test]
    fn find_global_can_hide_builtins() {
        let eng = EngineInst::new();
        assert!(eng.find_global("ARGC", false).is_err());
        assert_eq!(eng.last_error().msg, "no such global 'ARGC'");
        assert_eq!(eng.find_global("ARGC", true).unwrap(), 0);
    }

    #[test]
    fn duplicate_global_is_rejected() {
        let eng = EngineInst::new();
        eng.add_global("dup").unwrap();
        assert!(eng.add_global("dup").is_err());
        assert_eq!(eng.last_error().msg, "duplicate global 'dup'");
    }

    #[test]
    fn globals_are_frozen_after_parse() {
        let eng = EngineInst::new();
        eng.install_program(crate::parser::parse("x = 1;", "t").unwrap());
        assert!(eng.add_global("late").is_err());
    }

    #[test]
    fn arity_range_is_validated() {
        let eng = EngineInst::new();
        assert!(eng.register_function("f", 3, 1, "vvv").is_err());
        eng.register_function("f", 1, 3, "vvv").unwrap();
        let def = eng.host_fn("f").unwrap();
        assert_eq!((def.min_args, def.max_args), (1, 3));
    }
}
