//! # Weft
//!
//! Compile-time instrumentation for Rust packages: calls to selected
//! functions are rerouted through generated trampolines that dispatch to
//! user-authored before/after hooks, with no change to user source.
//!
//! ## Features
//!
//! - **`instrument`** (default) - The AST rewriting core used at build time
//! - **`runtime`** (default) - The `HookContext` ABI referenced by
//!   instrumented programs
//!
//! Build tooling typically depends on the `instrument` feature alone;
//! instrumented programs depend on `runtime` alone.

// Re-export the instrumentation core (build-time)
#[cfg(feature = "instrument")]
pub use weft_instrument as instrument;

// Re-export the runtime ABI (run-time)
#[cfg(feature = "runtime")]
pub use weft_runtime as runtime;

/// Prelude module for convenient imports
pub mod prelude {
    #[cfg(feature = "instrument")]
    pub use weft_instrument::{
        rewrite_package, AstSession, CancelFlag, HookRef, HookRule, InjectMode, InstrumentError,
        PhaseReport,
    };

    #[cfg(feature = "runtime")]
    pub use weft_runtime::{HookContext, Slot};
}
