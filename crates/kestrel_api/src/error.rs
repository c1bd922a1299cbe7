//! Error types crossing the engine boundary

use thiserror::Error;

/// Marker returned by a failing native call.
///
/// The engine keeps the structured description of the most recent failure
/// per engine / per context; callers that receive a `NativeFault` read it
/// back through `engine_error_info` or `context_error_info`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Error)]
#[error("native call failed")]
pub struct NativeFault;

pub type NativeResult<T> = Result<T, NativeFault>;

/// Structured error information reported by the engine.
///
/// `line` and `col` are 1-based and zero when the failure has no source
/// location (e.g. an operation rejected before any script ran). `file` is
/// the script name given at parse time, or empty.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{file}[{line},{col}] {msg}")]
pub struct ScriptError {
    pub line: u32,
    pub col: u32,
    pub file: String,
    pub msg: String,
}

impl ScriptError {
    /// Error with no source location.
    pub fn bare(msg: impl Into<String>) -> Self {
        Self {
            line: 0,
            col: 0,
            file: String::new(),
            msg: msg.into(),
        }
    }

    pub fn at(file: impl Into<String>, line: u32, col: u32, msg: impl Into<String>) -> Self {
        Self {
            line,
            col,
            file: file.into(),
            msg: msg.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_location() {
        let err = ScriptError::at("calc.ks", 3, 14, "undefined function 'fob'");
        assert_eq!(err.to_string(), "calc.ks[3,14] undefined function 'fob'");
    }

    #[test]
    fn bare_error_has_zero_location() {
        let err = ScriptError::bare("engine is closed");
        assert_eq!(err.line, 0);
        assert_eq!(err.to_string(), "[0,0] engine is closed");
    }
}
