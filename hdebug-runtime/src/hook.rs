//! Violation Hooks
//!
//! Every detected violation passes through exactly one place: the
//! [`HookDispatcher`]. The dispatcher counts it, hands it to the installed
//! hook, and carries out the [`Action`] the hook returns.
//!
//! # Policy
//!
//! - **No hook installed**: every violation terminates the process with
//!   [`FATAL_EXIT_CODE`] (or the configured code).
//! - **Hook installed**: the hook decides. [`RecordingHook`] records and
//!   continues, which lets test harnesses assert exact counts.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use hdebug_runtime::hook::{HookDispatcher, RecordingHook, FATAL_EXIT_CODE};
//!
//! let dispatcher = HookDispatcher::new(FATAL_EXIT_CODE);
//! let hook = Arc::new(RecordingHook::new());
//! let _session = dispatcher.session(hook.clone()).unwrap();
//! assert!(dispatcher.is_installed());
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use crate::violation::{Violation, ViolationKind};

/// Exit status of a process terminated by a handle violation.
///
/// Distinct from success (0), generic failure (1) and Rust's panic exit
/// status (101).
pub const FATAL_EXIT_CODE: i32 = 86;

/// What to do after a violation has been reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Keep running; the failing operation returns its error or sentinel.
    Continue,
    /// Exit the process immediately with this status.
    Terminate(i32),
}

/// A policy invoked once for every violation, in order of detection.
///
/// Hooks run with no internal lock held and may perform handle operations
/// of their own.
pub trait ViolationHook: Send + Sync {
    /// Decide what happens after `violation`.
    fn on_violation(&self, violation: &Violation) -> Action;
}

impl<F> ViolationHook for F
where
    F: Fn(&Violation) -> Action + Send + Sync,
{
    fn on_violation(&self, violation: &Violation) -> Action {
        self(violation)
    }
}

/// Hook that records every violation and continues.
#[derive(Debug, Default)]
pub struct RecordingHook {
    records: Mutex<Vec<Violation>>,
}

impl RecordingHook {
    /// Create an empty recording hook.
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded violations, oldest first.
    pub fn violations(&self) -> Vec<Violation> {
        self.records.lock().clone()
    }

    /// Number of recorded violations.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Check if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Number of recorded violations of one kind.
    pub fn count(&self, kind: ViolationKind) -> usize {
        self.records.lock().iter().filter(|v| v.kind == kind).count()
    }

    /// Forget everything recorded so far.
    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

impl ViolationHook for RecordingHook {
    fn on_violation(&self, violation: &Violation) -> Action {
        self.records.lock().push(violation.clone());
        Action::Continue
    }
}

/// Snapshot of per-kind violation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ViolationCounts {
    /// USE_AFTER_CLOSE reports.
    pub use_after_close: u64,
    /// DOUBLE_CLOSE reports.
    pub double_close: u64,
    /// UNKNOWN_HANDLE reports.
    pub unknown_handle: u64,
    /// LEAK reports.
    pub leak: u64,
}

impl ViolationCounts {
    /// Count for one kind.
    pub fn get(&self, kind: ViolationKind) -> u64 {
        match kind {
            ViolationKind::UseAfterClose => self.use_after_close,
            ViolationKind::DoubleClose => self.double_close,
            ViolationKind::UnknownHandle => self.unknown_handle,
            ViolationKind::Leak => self.leak,
        }
    }

    /// Sum over all kinds.
    pub fn total(&self) -> u64 {
        ViolationKind::ALL.iter().map(|k| self.get(*k)).sum()
    }

    /// Sum over the invalid-handle kinds (everything but leaks).
    pub fn invalid_handles(&self) -> u64 {
        self.total() - self.leak
    }

    /// Check if no violation was counted.
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Non-zero counts, in reporting order.
    pub fn nonzero(&self) -> impl Iterator<Item = (ViolationKind, u64)> + '_ {
        ViolationKind::ALL
            .into_iter()
            .map(|k| (k, self.get(k)))
            .filter(|(_, n)| *n > 0)
    }
}

impl fmt::Display for ViolationCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (kind, n)) in self.nonzero().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", kind, n)?;
        }
        write!(f, "}}")
    }
}

/// Errors from hook installation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HookError {
    /// A session is already active.
    #[error("a violation hook is already installed")]
    AlreadyInstalled,
}

/// The single channel through which violations are reported.
pub struct HookDispatcher {
    hook: Mutex<Option<Arc<dyn ViolationHook>>>,
    counters: [AtomicU64; 4],
    fatal_exit_code: i32,
}

impl HookDispatcher {
    /// Create a dispatcher with no hook installed.
    pub fn new(fatal_exit_code: i32) -> Self {
        Self {
            hook: Mutex::new(None),
            counters: Default::default(),
            fatal_exit_code,
        }
    }

    /// Install a hook for a new session and reset the counters.
    pub fn install(&self, hook: Arc<dyn ViolationHook>) -> Result<(), HookError> {
        let mut slot = self.hook.lock();
        if slot.is_some() {
            return Err(HookError::AlreadyInstalled);
        }
        self.reset_counts();
        *slot = Some(hook);
        tracing::debug!("violation hook installed");
        Ok(())
    }

    /// Install a hook for the lifetime of the returned guard.
    pub fn session(&self, hook: Arc<dyn ViolationHook>) -> Result<HookSession<'_>, HookError> {
        self.install(hook)?;
        Ok(HookSession { dispatcher: self })
    }

    /// Remove the installed hook, restoring the fatal default.
    pub fn remove(&self) -> Option<Arc<dyn ViolationHook>> {
        let removed = self.hook.lock().take();
        if removed.is_some() {
            tracing::debug!("violation hook removed");
        }
        removed
    }

    /// Check if a hook is installed.
    pub fn is_installed(&self) -> bool {
        self.hook.lock().is_some()
    }

    /// Report a violation and carry out the resulting action.
    ///
    /// Returns only if the action is [`Action::Continue`].
    pub fn notify(&self, violation: &Violation) -> Action {
        self.counters[violation.kind.index()].fetch_add(1, Ordering::SeqCst);
        tracing::warn!(
            kind = violation.kind.as_str(),
            handle = %violation.handle,
            operation = %violation.operation,
            frame = ?violation.frame,
            "handle violation"
        );

        // Clone out of the lock so the hook can re-enter the dispatcher.
        let hook = self.hook.lock().clone();
        let action = match hook {
            Some(hook) => hook.on_violation(violation),
            None => Action::Terminate(self.fatal_exit_code),
        };

        if let Action::Terminate(code) = action {
            terminate(violation, code);
        }
        action
    }

    /// Current counters.
    pub fn counts(&self) -> ViolationCounts {
        let load = |kind: ViolationKind| self.counters[kind.index()].load(Ordering::SeqCst);
        ViolationCounts {
            use_after_close: load(ViolationKind::UseAfterClose),
            double_close: load(ViolationKind::DoubleClose),
            unknown_handle: load(ViolationKind::UnknownHandle),
            leak: load(ViolationKind::Leak),
        }
    }

    /// Zero all counters.
    pub fn reset_counts(&self) {
        for counter in &self.counters {
            counter.store(0, Ordering::SeqCst);
        }
    }

    /// Exit status used when no hook is installed.
    pub fn fatal_exit_code(&self) -> i32 {
        self.fatal_exit_code
    }
}

impl fmt::Debug for HookDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookDispatcher")
            .field("installed", &self.is_installed())
            .field("counts", &self.counts())
            .field("fatal_exit_code", &self.fatal_exit_code)
            .finish()
    }
}

/// Guard that removes its hook when dropped.
#[must_use = "the hook is removed as soon as the session is dropped"]
pub struct HookSession<'a> {
    dispatcher: &'a HookDispatcher,
}

impl HookSession<'_> {
    /// Counters accumulated during this session.
    pub fn counts(&self) -> ViolationCounts {
        self.dispatcher.counts()
    }
}

impl Drop for HookSession<'_> {
    fn drop(&mut self) {
        self.dispatcher.remove();
    }
}

fn terminate(violation: &Violation, code: i32) -> ! {
    tracing::error!(%violation, exit_code = code, "fatal handle violation, terminating");
    eprintln!("hdebug: fatal: {}", violation);
    std::process::exit(code)
}
