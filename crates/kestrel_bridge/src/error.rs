//! Bridge-side error type
//!
//! Engine failures arrive as a [`ScriptError`] read back from the error
//! channel after a failed native call; everything else here is a condition
//! the bridge detects before touching the engine at all.

use kestrel_api::ScriptError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// The object (engine, context or value) has already been closed.
    #[error("object is closed")]
    Closed,

    /// A frame operation was used outside a dispatched host call.
    #[error("no host call in progress")]
    NotInCall,

    /// The signal relay worker has shut down.
    #[error("signal relay is shut down")]
    RelayDown,

    /// A value from one context was passed to an operation on another.
    #[error("value belongs to a different context")]
    ForeignValue,

    #[error(transparent)]
    Script(#[from] ScriptError),
}

impl BridgeError {
    /// The message the dispatcher reports into the native error channel.
    /// Script errors keep their bare message; the location is re-attached
    /// by the engine at the call site.
    pub(crate) fn channel_message(&self) -> String {
        match self {
            BridgeError::Script(err) => err.msg.clone(),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_errors_pass_through_display() {
        let err = BridgeError::from(ScriptError::at("job.ks", 4, 2, "bad call"));
        assert_eq!(err.to_string(), "job.ks[4,2] bad call");
    }

    #[test]
    fn channel_message_strips_location() {
        let err = BridgeError::from(ScriptError::at("job.ks", 4, 2, "bad call"));
        assert_eq!(err.channel_message(), "bad call");
        assert_eq!(BridgeError::Closed.channel_message(), "object is closed");
    }
}
