//! # weft-instrument
//!
//! Compile-time instrumentation core for Rust packages.
//!
//! Given a package's parsed source and a set of hook rules, the core
//! synthesizes trampoline functions, fills them with guarded dispatch to
//! user-authored before/after hooks, and reroutes the target's call sites
//! (or its own body, for entry-point targets) through them. The result is a
//! rewritten AST; reading source in and writing source out is the build
//! driver's job.
//!
//! The pipeline, leaves first:
//!
//! - `session`: the parsed package, lookup, snapshot/rollback, rendering
//! - `signature`: hook signature analysis into positional parameter traits
//! - `trampoline`: trampoline pair synthesis with deterministic names
//! - `dispatch`: guarded, panic-contained hook call emission
//! - `rewrite`: call-site rewriting and entry-point body injection
//! - `phase`: the per-package, per-rule transactional driver
//!
//! The core is pure AST-in / AST-out: no file I/O, no CLI, no persisted
//! state. Generated code references the `weft-runtime` crate's ABI.

pub mod dispatch;
pub mod error;
pub mod naming;
pub mod phase;
pub mod rewrite;
pub mod rule;
pub mod session;
pub mod signature;
pub mod trampoline;

pub use error::{AritySide, InstrumentError};
pub use phase::{
    rewrite_package, CancelFlag, OutcomeKind, PhaseReport, PhaseStatus, RuleOutcome,
};
pub use rule::{HookRef, HookRule, InjectMode};
pub use session::{AstSession, TargetFunction};
pub use signature::{HookSignature, ParamTrait};
