//! # Debug Context
//!
//! The integration surface the host runtime talks to.
//!
//! Every handle operation performed on behalf of native code goes through a
//! [`DebugContext`]: it consults the handle table, attributes new handles to
//! the calling thread's innermost scope frame, and routes every violation to
//! the hook dispatcher. Native invocations are bracketed by
//! [`DebugContext::call_native`], which owns the argument handles for the
//! duration of the call and takes ownership of the returned handle.
//!
//! ## Locking
//!
//! The table and the scope tracker each sit behind their own mutex and the
//! two are never held together. Neither is held while the hook runs or while
//! a released host value is dropped, so both may re-enter the context.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use hdebug_runtime::{DebugContext, RecordingHook, ViolationKind};
//!
//! let ctx: DebugContext<Arc<str>> = DebugContext::new();
//! let hook = Arc::new(RecordingHook::new());
//! let _session = ctx.hook_session(hook.clone()).unwrap();
//!
//! let h = ctx.create(Arc::from("value"));
//! ctx.close(h).unwrap();
//! assert!(ctx.close(h).is_err());
//! assert_eq!(ctx.violation_counts().get(ViolationKind::DoubleClose), 1);
//! ```

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::DebugConfig;
use crate::handle::Handle;
use crate::hook::{HookDispatcher, HookError, HookSession, ViolationCounts, ViolationHook};
use crate::module::CallError;
use crate::scope::{FrameId, FrameKind, ScopeError, ScopeTracker};
use crate::table::{HandleTable, TableStats};
use crate::violation::{Operation, Violation};

/// Leaks reported when a frame exited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeakReport {
    /// The frame that exited.
    pub frame: FrameId,
    /// One LEAK per handle left open, in creation order.
    pub leaks: Vec<Violation>,
}

impl LeakReport {
    fn empty(frame: FrameId) -> Self {
        Self {
            frame,
            leaks: Vec::new(),
        }
    }

    /// Check if nothing leaked.
    pub fn is_clean(&self) -> bool {
        self.leaks.is_empty()
    }

    /// Number of leaked handles.
    pub fn len(&self) -> usize {
        self.leaks.len()
    }

    /// Check if the report is empty.
    pub fn is_empty(&self) -> bool {
        self.leaks.is_empty()
    }

    /// The leaked handles.
    pub fn handles(&self) -> impl Iterator<Item = Handle> + '_ {
        self.leaks.iter().map(|v| v.handle)
    }
}

/// Debug-mode handle layer.
pub struct DebugContext<V> {
    table: Mutex<HandleTable<V>>,
    scopes: Mutex<ScopeTracker>,
    dispatcher: HookDispatcher,
    config: DebugConfig,
}

impl<V> DebugContext<V> {
    /// Create a context with the default configuration.
    pub fn new() -> Self {
        Self::with_config(DebugConfig::default())
    }

    /// Create a context configured from `HDEBUG_*` environment variables.
    pub fn from_env() -> Self {
        Self::with_config(DebugConfig::from_env())
    }

    /// Create a context with an explicit configuration.
    pub fn with_config(config: DebugConfig) -> Self {
        Self {
            table: Mutex::new(HandleTable::new(
                config.initial_capacity,
                config.closed_quarantine,
            )),
            scopes: Mutex::new(ScopeTracker::new()),
            dispatcher: HookDispatcher::new(config.fatal_exit_code),
            config,
        }
    }

    /// The configuration this context was built with.
    pub fn config(&self) -> &DebugConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Handle operations
    // ------------------------------------------------------------------

    /// Open a handle to a host value.
    ///
    /// The handle is attributed to the calling thread's innermost frame.
    pub fn create(&self, value: V) -> Handle {
        let frame = self.scopes.lock().innermost();
        let opened = self.table.lock().create(value, frame);
        match opened {
            Some(opened) => {
                self.scopes.lock().register(frame, opened.serial, opened.handle);
                tracing::trace!(handle = %opened.handle, %frame, "create");
                opened.handle
            }
            None => Handle::INVALID,
        }
    }

    /// Register an immortal constant handle.
    ///
    /// Constants are always open, never leak, and closing one is ignored.
    pub fn constant(&self, value: V) -> Handle {
        let handle = self.table.lock().create_constant(value);
        handle.unwrap_or(Handle::INVALID)
    }

    /// Close a handle, releasing its value.
    pub fn close(&self, handle: Handle) -> Result<(), Violation> {
        let result = self.table.lock().close(handle);
        match result {
            Ok(closed) if closed.constant => {
                tracing::debug!(%handle, "close of a constant handle ignored");
                Ok(())
            }
            Ok(closed) => {
                self.scopes.lock().forget(closed.frame, closed.serial);
                tracing::trace!(%handle, "close");
                drop(closed.value);
                Ok(())
            }
            Err(violation) => Err(self.report(violation)),
        }
    }

    /// Check if a handle currently names an open record.
    ///
    /// Diagnostic only; never decide program logic on it.
    pub fn is_open(&self, handle: Handle) -> bool {
        self.table.lock().is_open(handle)
    }

    /// The frame a current handle was created in.
    pub fn creation_frame(&self, handle: Handle) -> Option<FrameId> {
        self.table.lock().record(handle).map(|r| r.frame())
    }

    /// Live non-constant handles in creation order.
    pub fn open_handles(&self) -> Vec<Handle> {
        self.table.lock().open_handles()
    }

    /// Number of live non-constant handles.
    pub fn open_handle_count(&self) -> usize {
        self.table.lock().open_count()
    }

    /// Table activity counters.
    pub fn stats(&self) -> TableStats {
        self.table.lock().stats()
    }

    // ------------------------------------------------------------------
    // Scope frames
    // ------------------------------------------------------------------

    /// Push a frame for the current thread.
    ///
    /// Prefer [`scope`](Self::scope), which guarantees the matching pop.
    pub fn push_frame(&self, kind: FrameKind) -> FrameId {
        let frame = self.scopes.lock().push(kind);
        tracing::debug!(%frame, "push frame");
        frame
    }

    /// Pop the current thread's innermost frame and report its leaks.
    ///
    /// Popping anything but the innermost frame means the integration layer
    /// is broken; the process is aborted.
    pub fn pop_frame(&self, frame: FrameId) -> LeakReport {
        match self.try_pop_frame(frame) {
            Ok(report) => report,
            Err(err) => internal_fatal(&err),
        }
    }

    /// Pop a frame, returning scope misuse as an error instead of aborting.
    pub fn try_pop_frame(&self, frame: FrameId) -> Result<LeakReport, ScopeError> {
        let popped = self.scopes.lock().pop(frame)?;
        tracing::debug!(%frame, kind = %popped.kind(), live = popped.live_count(), "pop frame");

        let leaks: Vec<Violation> = {
            let mut table = self.table.lock();
            popped
                .live_handles()
                .filter(|h| table.mark_leaked(*h))
                .map(|h| Violation::leak(h, frame, Operation::ScopeExit))
                .collect()
        };

        for leak in &leaks {
            self.dispatcher.notify(leak);
        }
        Ok(LeakReport { frame, leaks })
    }

    /// Push a frame that is popped when the guard exits or drops.
    pub fn scope(&self, kind: FrameKind) -> ScopeGuard<'_, V> {
        ScopeGuard {
            ctx: self,
            frame: self.push_frame(kind),
            exited: false,
        }
    }

    /// Start a user-delimited leak-monitoring window.
    pub fn enter_monitoring_scope(&self) -> ScopeGuard<'_, V> {
        self.scope(FrameKind::Monitor)
    }

    /// End a monitoring window. Exiting twice reports nothing new.
    pub fn exit_monitoring_scope(&self, scope: &mut ScopeGuard<'_, V>) -> LeakReport {
        scope.exit()
    }

    /// Pop the implicit root frame: every open handle not already reported
    /// is a leak.
    pub fn teardown(&self) -> LeakReport {
        let handles = self.table.lock().drain_unreported();
        let leaks: Vec<Violation> = handles
            .into_iter()
            .map(|h| Violation::leak(h, FrameId::ROOT, Operation::Teardown))
            .collect();

        tracing::debug!(leaks = leaks.len(), "teardown");
        for leak in &leaks {
            self.dispatcher.notify(leak);
        }
        LeakReport {
            frame: FrameId::ROOT,
            leaks,
        }
    }

    /// The calling thread's innermost frame.
    pub fn current_frame(&self) -> FrameId {
        self.scopes.lock().innermost()
    }

    // ------------------------------------------------------------------
    // Hooks
    // ------------------------------------------------------------------

    /// Install a violation hook, starting a new counting session.
    pub fn install_hook(&self, hook: Arc<dyn ViolationHook>) -> Result<(), HookError> {
        self.dispatcher.install(hook)
    }

    /// Remove the installed hook. Returns `false` if none was installed.
    pub fn remove_hook(&self) -> bool {
        self.dispatcher.remove().is_some()
    }

    /// Install a hook for the lifetime of the returned guard.
    pub fn hook_session(&self, hook: Arc<dyn ViolationHook>) -> Result<HookSession<'_>, HookError> {
        self.dispatcher.session(hook)
    }

    /// Violation counters for the current session.
    pub fn violation_counts(&self) -> ViolationCounts {
        self.dispatcher.counts()
    }

    /// The dispatcher all violations pass through.
    pub fn dispatcher(&self) -> &HookDispatcher {
        &self.dispatcher
    }

    fn report(&self, violation: Violation) -> Violation {
        self.dispatcher.notify(&violation);
        violation
    }
}

impl<V: Clone> DebugContext<V> {
    /// Open a second, independently closed handle to the same value.
    ///
    /// Returns [`Handle::INVALID`] after reporting if `handle` is not open.
    pub fn dup(&self, handle: Handle) -> Handle {
        let frame = self.scopes.lock().innermost();
        let result = self.table.lock().dup(handle, frame);
        match result {
            Ok(opened) => {
                self.scopes.lock().register(frame, opened.serial, opened.handle);
                tracing::trace!(from = %handle, handle = %opened.handle, %frame, "dup");
                opened.handle
            }
            Err(violation) => {
                self.report(violation);
                Handle::INVALID
            }
        }
    }

    /// Dereference an open handle.
    pub fn resolve(&self, handle: Handle) -> Result<V, Violation> {
        self.resolve_as(handle, Operation::Resolve)
    }

    fn resolve_as(&self, handle: Handle, op: Operation) -> Result<V, Violation> {
        let result = self.table.lock().resolve_as(handle, op);
        result.map_err(|violation| self.report(violation))
    }

    /// Invoke a native function under the host calling protocol.
    ///
    /// A call frame is pushed and one handle is opened per argument. After
    /// `f` returns the argument handles are closed (native code only borrows
    /// them), the returned handle is resolved and closed (ownership passes to
    /// the host), and the frame is popped, reporting anything else left open.
    ///
    /// `f` signals failure by returning [`Handle::INVALID`].
    pub fn call_native<F>(&self, name: &str, args: Vec<V>, f: F) -> Result<V, CallError>
    where
        F: FnOnce(&Self, &[Handle]) -> Handle,
    {
        let mut frame = self.scope(FrameKind::Call {
            name: name.to_string(),
        });
        let args = ArgHandles {
            ctx: self,
            handles: args.into_iter().map(|v| self.create(v)).collect(),
        };

        let ret = f(self, &args.handles);
        drop(args);

        let result = if ret.is_invalid() {
            Err(CallError::NoResult(name.to_string()))
        } else {
            match self.resolve_as(ret, Operation::Return) {
                Ok(value) => {
                    // Just resolved, so the close cannot fail.
                    let _ = self.close(ret);
                    Ok(value)
                }
                Err(violation) => Err(CallError::Violation(violation)),
            }
        };

        frame.exit();
        result
    }
}

impl<V> Default for DebugContext<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> fmt::Debug for DebugContext<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugContext")
            .field("table", &*self.table.lock())
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

/// A pushed frame that is popped exactly once.
#[must_use = "the frame is popped as soon as the guard is dropped"]
pub struct ScopeGuard<'a, V> {
    ctx: &'a DebugContext<V>,
    frame: FrameId,
    exited: bool,
}

impl<V> ScopeGuard<'_, V> {
    /// The guarded frame.
    pub fn frame(&self) -> FrameId {
        self.frame
    }

    /// Pop the frame and report its leaks.
    ///
    /// Only the first call pops; later calls return an empty report.
    pub fn exit(&mut self) -> LeakReport {
        if self.exited {
            return LeakReport::empty(self.frame);
        }
        self.exited = true;
        self.ctx.pop_frame(self.frame)
    }

    /// Check if the frame was already popped.
    pub fn is_exited(&self) -> bool {
        self.exited
    }
}

impl<V> Drop for ScopeGuard<'_, V> {
    fn drop(&mut self) {
        self.exit();
    }
}

/// Argument handles borrowed by a native call; closed on drop.
struct ArgHandles<'a, V> {
    ctx: &'a DebugContext<V>,
    handles: Vec<Handle>,
}

impl<V> Drop for ArgHandles<'_, V> {
    fn drop(&mut self) {
        for handle in &self.handles {
            // A native function that closed its own argument is reported here.
            let _ = self.ctx.close(*handle);
        }
    }
}

fn internal_fatal(err: &ScopeError) -> ! {
    tracing::error!(error = %err, "scope tracker misuse, aborting");
    eprintln!("hdebug: internal error: {}", err);
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DebugConfig;
    use crate::hook::{Action, RecordingHook};
    use crate::violation::ViolationKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Ctx = DebugContext<Arc<String>>;

    fn ctx_with_hook(quarantine: usize) -> (Ctx, Arc<RecordingHook>) {
        let config = DebugConfig::builder()
            .closed_quarantine(quarantine)
            .build()
            .unwrap();
        let ctx = Ctx::with_config(config);
        let hook = Arc::new(RecordingHook::new());
        ctx.install_hook(hook.clone()).unwrap();
        (ctx, hook)
    }

    fn value(s: &str) -> Arc<String> {
        Arc::new(s.to_string())
    }

    #[test]
    fn test_dup_then_close_both() {
        let (ctx, hook) = ctx_with_hook(16);
        let h1 = ctx.create(value("a"));
        let h2 = ctx.dup(h1);
        ctx.close(h2).unwrap();
        ctx.close(h1).unwrap();
        assert!(hook.is_empty());
        assert!(ctx.teardown().is_clean());
        assert!(ctx.violation_counts().is_empty());
    }

    #[test]
    fn test_dup_of_closed_returns_sentinel() {
        let (ctx, hook) = ctx_with_hook(16);
        let h = ctx.create(value("a"));
        ctx.close(h).unwrap();

        let d = ctx.dup(h);
        assert_eq!(d, Handle::INVALID);
        assert_eq!(hook.count(ViolationKind::UseAfterClose), 1);

        // The sentinel fails its own checks downstream.
        assert_eq!(ctx.close(d).unwrap_err().kind, ViolationKind::UnknownHandle);
        assert_eq!(ctx.violation_counts().total(), 2);
    }

    #[test]
    fn test_close_releases_value_outside_lock() {
        struct Reenter(std::sync::Weak<DebugContext<Reenter>>);
        impl Drop for Reenter {
            fn drop(&mut self) {
                // Runs while the context is closing the handle that held us.
                if let Some(ctx) = self.0.upgrade() {
                    assert_eq!(ctx.open_handle_count(), 0);
                }
            }
        }

        let ctx = Arc::new(DebugContext::<Reenter>::new());
        let h = ctx.create(Reenter(Arc::downgrade(&ctx)));
        ctx.close(h).unwrap();
        assert!(!ctx.is_open(h));
    }

    #[test]
    fn test_hook_can_perform_handle_operations() {
        let ctx = Arc::new(Ctx::with_config(
            DebugConfig::builder().closed_quarantine(16).build().unwrap(),
        ));
        let calls = Arc::new(AtomicUsize::new(0));
        let weak = Arc::downgrade(&ctx);
        let seen = calls.clone();
        ctx.install_hook(Arc::new(move |_: &Violation| {
            seen.fetch_add(1, Ordering::SeqCst);
            if let Some(ctx) = weak.upgrade() {
                let scratch = ctx.create(value("scratch"));
                ctx.close(scratch).unwrap();
            }
            Action::Continue
        }))
        .unwrap();

        let h = ctx.create(value("x"));
        ctx.close(h).unwrap();
        assert!(ctx.close(h).is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.open_handle_count(), 0);
    }

    #[test]
    fn test_handles_attributed_to_innermost_frame() {
        let (ctx, _hook) = ctx_with_hook(16);
        let root_handle = ctx.create(value("root"));
        assert_eq!(ctx.creation_frame(root_handle), Some(FrameId::ROOT));

        let mut scope = ctx.enter_monitoring_scope();
        let inner = ctx.create(value("inner"));
        assert_eq!(ctx.creation_frame(inner), Some(scope.frame()));
        assert_eq!(ctx.current_frame(), scope.frame());

        ctx.close(inner).unwrap();
        assert!(scope.exit().is_clean());
        assert_eq!(ctx.current_frame(), FrameId::ROOT);
        ctx.close(root_handle).unwrap();
    }

    #[test]
    fn test_leak_is_attributed_and_reported_once() {
        let (ctx, hook) = ctx_with_hook(16);
        let mut scope = ctx.enter_monitoring_scope();
        let frame = scope.frame();
        let leaked = ctx.create(value("leaked"));

        let report = ctx.exit_monitoring_scope(&mut scope);
        assert_eq!(report.frame, frame);
        assert_eq!(report.handles().collect::<Vec<_>>(), vec![leaked]);
        assert_eq!(report.leaks[0].frame, Some(frame));

        assert!(ctx.exit_monitoring_scope(&mut scope).is_clean());
        drop(scope);
        assert!(ctx.teardown().is_clean());
        assert_eq!(hook.count(ViolationKind::Leak), 1);
    }

    #[test]
    fn test_closed_in_child_frame_is_not_leak() {
        let (ctx, hook) = ctx_with_hook(16);
        let mut outer = ctx.enter_monitoring_scope();
        let h = ctx.create(value("outer"));
        {
            let _inner = ctx.scope(FrameKind::Call { name: "closer".into() });
            ctx.close(h).unwrap();
        }
        assert!(outer.exit().is_clean());
        assert!(hook.is_empty());
    }

    #[test]
    fn test_child_leak_not_reported_by_parent() {
        let (ctx, hook) = ctx_with_hook(16);
        let mut outer = ctx.enter_monitoring_scope();
        let mut inner = ctx.enter_monitoring_scope();
        let h = ctx.create(value("child"));
        assert_eq!(inner.exit().len(), 1);
        assert!(outer.exit().is_clean());
        assert!(ctx.teardown().is_clean());
        assert_eq!(hook.count(ViolationKind::Leak), 1);
        ctx.close(h).unwrap();
    }

    #[test]
    fn test_try_pop_out_of_order() {
        let (ctx, hook) = ctx_with_hook(16);
        let outer = ctx.push_frame(FrameKind::Monitor);
        let inner = ctx.push_frame(FrameKind::Monitor);
        assert_eq!(
            ctx.try_pop_frame(outer).unwrap_err(),
            ScopeError::OutOfOrder {
                expected: inner,
                found: outer
            }
        );
        ctx.pop_frame(inner);
        ctx.pop_frame(outer);
        // Scope misuse never reaches the hook.
        assert!(hook.is_empty());
    }

    #[test]
    fn test_constants_are_immortal() {
        let (ctx, hook) = ctx_with_hook(0);
        let none = ctx.constant(value("None"));
        let mut scope = ctx.enter_monitoring_scope();
        let d = ctx.dup(none);
        ctx.close(none).unwrap();
        ctx.close(none).unwrap();
        assert!(ctx.is_open(none));
        assert_eq!(ctx.resolve(none).unwrap().as_str(), "None");
        ctx.close(d).unwrap();
        assert!(scope.exit().is_clean());
        assert!(ctx.teardown().is_clean());
        assert!(hook.is_empty());
    }

    #[test]
    fn test_call_native_transfers_return_value() {
        let (ctx, hook) = ctx_with_hook(16);
        let result = ctx.call_native("f", vec![value("hello")], |ctx, args| {
            let x = ctx.create(value("42"));
            let arg_dup = ctx.dup(args[0]);
            let b = ctx.dup(x);
            ctx.close(x).unwrap();
            ctx.close(arg_dup).unwrap();
            b
        });
        assert_eq!(result.unwrap().as_str(), "42");
        assert!(hook.is_empty());
        assert_eq!(ctx.open_handle_count(), 0);
        assert_eq!(ctx.current_frame(), FrameId::ROOT);
    }

    #[test]
    fn test_call_native_reports_leak_in_call_frame() {
        let (ctx, hook) = ctx_with_hook(16);
        let result = ctx.call_native("leaky", vec![], |ctx, _| {
            ctx.create(value("forgotten"));
            ctx.create(value("result"))
        });
        assert_eq!(result.unwrap().as_str(), "result");
        let leaks = hook.violations();
        assert_eq!(leaks.len(), 1);
        assert_eq!(leaks[0].kind, ViolationKind::Leak);
        assert_eq!(leaks[0].operation, Operation::ScopeExit);
    }

    #[test]
    fn test_call_native_returning_argument() {
        let (ctx, hook) = ctx_with_hook(16);
        // Returning a borrowed argument without dup: it is closed first.
        let result = ctx.call_native("echo", vec![value("arg")], |_, args| args[0]);
        let err = result.unwrap_err();
        assert!(matches!(
            err,
            CallError::Violation(ref v) if v.kind == ViolationKind::UseAfterClose
        ));
        assert_eq!(hook.violations()[0].operation, Operation::Return);
    }

    #[test]
    fn test_call_native_no_result() {
        let (ctx, hook) = ctx_with_hook(16);
        let err = ctx
            .call_native("fails", vec![], |_, _| Handle::INVALID)
            .unwrap_err();
        assert_eq!(err, CallError::NoResult("fails".into()));
        assert!(hook.is_empty());
    }

    #[test]
    fn test_session_teardown_restores_default() {
        let ctx = Ctx::new();
        {
            let _session = ctx.hook_session(Arc::new(RecordingHook::new())).unwrap();
            assert!(ctx.dispatcher().is_installed());
        }
        assert!(!ctx.dispatcher().is_installed());
        assert!(!ctx.remove_hook());
    }
}
