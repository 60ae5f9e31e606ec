//! Error types for the reactive engine.

use thiserror::Error;

use crate::reactive::ReactionId;

/// Errors raised by reads, writes, and reaction executions.
///
/// Errors are never swallowed by the scheduler: a failure inside a tracked
/// function surfaces to whoever called `execute`, and a failure inside a
/// deferred flush surfaces from `Runtime::run_until_idle` (or from
/// `Runtime::transaction` when it happens while draining).
#[derive(Debug, Error)]
pub enum ReactiveError {
    /// The reaction handle refers to a disposed (or reused) arena slot.
    #[error("reaction {0} has been disposed")]
    Disposed(ReactionId),

    /// A reaction was executed while it was already running.
    ///
    /// This is the per-reaction active guard; it is what stops a derived
    /// value from reading itself.
    #[error("reaction `{label}` ({id}) is already running")]
    Reentrant { id: ReactionId, label: String },

    /// Subscribing or listening on something that has no registry.
    #[error("`{property}` on `{owner}` is not an observable object")]
    NotObservable { owner: String, property: String },

    /// Writing a derived property that has no paired setter.
    #[error("`{property}` on `{owner}` is derived and has no setter")]
    ReadOnly { owner: String, property: String },

    /// A reader or tracked function failed.
    #[error("read failed: {0}")]
    Read(String),

    /// `run_until_idle` exceeded the configured drain budget.
    #[error("deferred queue still busy after {limit} callbacks")]
    DrainLimit { limit: usize },

    /// The runtime configuration could not be parsed.
    #[error("invalid runtime config: {0}")]
    Config(#[from] serde_json::Error),
}

impl ReactiveError {
    /// Build a [`ReactiveError::Read`] from any displayable message.
    pub fn read(message: impl std::fmt::Display) -> Self {
        Self::Read(message.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ReactiveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_property() {
        let err = ReactiveError::ReadOnly {
            owner: "todo".into(),
            property: "done".into(),
        };
        assert_eq!(err.to_string(), "`done` on `todo` is derived and has no setter");

        let err = ReactiveError::read("boom");
        assert_eq!(err.to_string(), "read failed: boom");
    }

    #[test]
    fn config_errors_convert() {
        let parse = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: ReactiveError = parse.into();
        assert!(matches!(err, ReactiveError::Config(_)));
    }
}
