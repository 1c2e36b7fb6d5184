//! # Handle Debug Runtime
//!
//! A debug-mode handle layer for native extensions. Native code never holds
//! host values directly: it holds opaque [`Handle`]s, and in debug mode every
//! handle operation is checked.
//!
//! - **Handle Table**: generational arena of debug records
//! - **Validity Checker**: classifies each access as ok, use-after-close,
//!   double-close or unknown
//! - **Scope Tracker**: nested per-thread frames that attribute leaks
//! - **Hook Dispatcher**: routes every violation to a user hook, or
//!   terminates the process when none is installed
//!
//! ## Technical Standards
//!
//! - **Stale detection**: generation-tagged indices per the
//!   [generational arena](https://crates.io/crates/generational-arena) pattern
//! - **Locking**: [parking_lot](https://docs.rs/parking_lot) mutexes, never
//!   held across a hook call
//! - **Diagnostics**: [tracing](https://docs.rs/tracing) events at every
//!   operation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       DEBUG CONTEXT                              │
//! │                      (context.rs)                                │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │ Handle Table │  │   Validity   │  │    Scopes    │          │
//! │  │  (table.rs)  │──│(validity.rs) │  │  (scope.rs)  │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │         │                                   │                   │
//! │         └──────────── Violation ────────────┘                   │
//! │                           │                                     │
//! │                  ┌──────────────┐  ┌──────────────┐             │
//! │                  │    Hooks     │  │   Modules    │             │
//! │                  │  (hook.rs)   │  │ (module.rs)  │             │
//! │                  └──────────────┘  └──────────────┘             │
//! │                                                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use hdebug_runtime::{DebugContext, RecordingHook};
//!
//! let ctx: DebugContext<String> = DebugContext::new();
//! let hook = Arc::new(RecordingHook::new());
//! let _session = ctx.hook_session(hook.clone()).unwrap();
//!
//! let mut scope = ctx.enter_monitoring_scope();
//! let _forgotten = ctx.create("leaked".to_string());
//! let report = scope.exit();
//!
//! assert_eq!(report.len(), 1);
//! assert_eq!(ctx.violation_counts().leak, 1);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod context;
pub mod handle;
pub mod hook;
pub mod module;
pub mod scope;
pub mod table;
pub mod validity;
pub mod violation;

// Re-exports
pub use config::{ConfigError, DebugConfig, DebugConfigBuilder, LogLevel};
pub use context::{DebugContext, LeakReport, ScopeGuard};
pub use handle::{Generation, Handle, SlotIndex};
pub use hook::{
    Action, HookDispatcher, HookError, HookSession, RecordingHook, ViolationCounts, ViolationHook,
    FATAL_EXIT_CODE,
};
pub use module::{CallConv, CallError, MethodDef, NativeFn, NativeModule};
pub use scope::{FrameId, FrameKind, ScopeError, ScopeTracker};
pub use table::{HandleState, HandleTable, TableStats};
pub use validity::{classify, Access, Classification};
pub use violation::{Operation, Violation, ViolationKind};

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
