//! Error types for the instrumentation phase.

use thiserror::Error;

/// Which side of the dispatch an arity check was performed against.
///
/// The wording difference is deliberate: the before side counts against the
/// target function's own inputs, the after side against the synthesized
/// trampoline (context + inputs + outputs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AritySide {
    BeforeTarget,
    AfterTrampoline,
}

impl std::fmt::Display for AritySide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AritySide::BeforeTarget => write!(f, "target function"),
            AritySide::AfterTrampoline => write!(f, "trampoline"),
        }
    }
}

/// Structured error type for rule application.
///
/// The first three kinds are recoverable: the driver rolls the session back
/// and skips the rule. `AstMalformed` is fatal and propagates; `Cancelled`
/// ends the phase with a cancelled status.
#[derive(Error, Debug)]
pub enum InstrumentError {
    #[error("target function `{name}` not found in package")]
    TargetNotFound {
        name: String,
        /// Closest declared name, when fuzzy lookup found one.
        suggestion: Option<String>,
    },

    #[error("invalid hook signature for `{hook}`: {reason}")]
    HookSignature { hook: String, reason: String },

    #[error("hook declares {declared} params but {side} only has {available} params available")]
    HookArity {
        declared: usize,
        available: usize,
        side: AritySide,
    },

    #[error("malformed AST: {detail}")]
    AstMalformed { detail: String },

    #[error("instrumentation cancelled")]
    Cancelled,
}

impl InstrumentError {
    /// Recoverable errors roll back the current rule; fatal ones abort the
    /// phase without rollback.
    pub fn is_fatal(&self) -> bool {
        matches!(self, InstrumentError::AstMalformed { .. })
    }
}
