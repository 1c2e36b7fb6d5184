//! # Native Modules
//!
//! A native module is a named table of native functions, each declared with
//! the calling convention it expects. Calls are dispatched by name through
//! [`DebugContext::call_native`], so every argument and return value is a
//! checked handle.
//!
//! ```rust
//! use hdebug_runtime::{CallConv, DebugContext, MethodDef, NativeModule};
//!
//! let module: NativeModule<i64> = NativeModule::new("mytest")
//!     .method(MethodDef::new("identity", CallConv::O, |ctx, args| ctx.dup(args[0])));
//!
//! let ctx = DebugContext::new();
//! assert_eq!(module.call(&ctx, "identity", vec![7]).unwrap(), 7);
//! ```

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::context::DebugContext;
use crate::handle::Handle;
use crate::violation::Violation;

/// Native function body: receives borrowed argument handles and returns a
/// handle it owns, or [`Handle::INVALID`] on failure.
pub type NativeFn<V> = Arc<dyn Fn(&DebugContext<V>, &[Handle]) -> Handle + Send + Sync>;

/// Argument convention of a native function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallConv {
    /// No arguments.
    NoArgs,
    /// Exactly one argument.
    O,
    /// Any number of arguments.
    VarArgs,
}

impl CallConv {
    /// Check if `count` arguments are acceptable.
    pub fn accepts(&self, count: usize) -> bool {
        match self {
            CallConv::NoArgs => count == 0,
            CallConv::O => count == 1,
            CallConv::VarArgs => true,
        }
    }

    fn expected(&self) -> &'static str {
        match self {
            CallConv::NoArgs => "no arguments",
            CallConv::O => "exactly one argument",
            CallConv::VarArgs => "any number of arguments",
        }
    }
}

/// Errors from invoking a native function.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// A handle violation was detected and the hook chose to continue.
    #[error(transparent)]
    Violation(#[from] Violation),

    /// The function signalled failure by returning no handle.
    #[error("native function `{0}` returned no result")]
    NoResult(String),

    /// The module has no method of that name.
    #[error("module `{module}` has no method `{method}`")]
    NoSuchMethod {
        /// Module name.
        module: String,
        /// Requested method.
        method: String,
    },

    /// Wrong number of arguments for the method's convention.
    #[error("`{method}` takes {expected} ({given} given)")]
    ArityMismatch {
        /// Method name.
        method: String,
        /// Description of the accepted arity.
        expected: &'static str,
        /// Number of arguments supplied.
        given: usize,
    },
}

/// One method of a native module.
pub struct MethodDef<V> {
    name: String,
    doc: Option<String>,
    conv: CallConv,
    func: NativeFn<V>,
}

impl<V> MethodDef<V> {
    /// Define a method.
    pub fn new<F>(name: impl Into<String>, conv: CallConv, func: F) -> Self
    where
        F: Fn(&DebugContext<V>, &[Handle]) -> Handle + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            doc: None,
            conv,
            func: Arc::new(func),
        }
    }

    /// Attach a docstring.
    pub fn with_doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }

    /// Method name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Docstring, if any.
    pub fn doc(&self) -> Option<&str> {
        self.doc.as_deref()
    }

    /// Calling convention.
    pub fn conv(&self) -> CallConv {
        self.conv
    }
}

impl<V> Clone for MethodDef<V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            doc: self.doc.clone(),
            conv: self.conv,
            func: Arc::clone(&self.func),
        }
    }
}

impl<V> fmt::Debug for MethodDef<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDef")
            .field("name", &self.name)
            .field("conv", &self.conv)
            .finish_non_exhaustive()
    }
}

/// A named table of native functions.
pub struct NativeModule<V> {
    name: String,
    doc: Option<String>,
    methods: Vec<MethodDef<V>>,
}

impl<V> NativeModule<V> {
    /// Create an empty module.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            doc: None,
            methods: Vec::new(),
        }
    }

    /// Attach a module docstring.
    pub fn with_doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }

    /// Add a method, replacing any existing method with the same name.
    pub fn method(mut self, def: MethodDef<V>) -> Self {
        match self.methods.iter_mut().find(|m| m.name == def.name) {
            Some(existing) => *existing = def,
            None => self.methods.push(def),
        }
        self
    }

    /// Module name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Module docstring, if any.
    pub fn doc(&self) -> Option<&str> {
        self.doc.as_deref()
    }

    /// Look up a method.
    pub fn get(&self, name: &str) -> Option<&MethodDef<V>> {
        self.methods.iter().find(|m| m.name == name)
    }

    /// Methods in definition order.
    pub fn methods(&self) -> impl Iterator<Item = &MethodDef<V>> {
        self.methods.iter()
    }
}

impl<V: Clone> NativeModule<V> {
    /// Call a method by name.
    pub fn call(&self, ctx: &DebugContext<V>, name: &str, args: Vec<V>) -> Result<V, CallError> {
        let def = self.get(name).ok_or_else(|| CallError::NoSuchMethod {
            module: self.name.clone(),
            method: name.to_string(),
        })?;

        if !def.conv.accepts(args.len()) {
            return Err(CallError::ArityMismatch {
                method: def.name.clone(),
                expected: def.conv.expected(),
                given: args.len(),
            });
        }

        ctx.call_native(&def.name, args, |ctx, handles| (def.func)(ctx, handles))
    }
}

impl<V> fmt::Debug for NativeModule<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeModule")
            .field("name", &self.name)
            .field("methods", &self.methods)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DebugConfig;
    use crate::hook::RecordingHook;
    use crate::violation::ViolationKind;
    use parking_lot::Mutex;

    fn recording_ctx() -> (DebugContext<String>, Arc<RecordingHook>) {
        let ctx = DebugContext::with_config(
            DebugConfig::builder().closed_quarantine(64).build().unwrap(),
        );
        let hook = Arc::new(RecordingHook::new());
        ctx.install_hook(hook.clone()).unwrap();
        (ctx, hook)
    }

    #[test]
    fn test_unknown_method() {
        let (ctx, _) = recording_ctx();
        let module: NativeModule<String> = NativeModule::new("m");
        assert_eq!(
            module.call(&ctx, "missing", vec![]).unwrap_err(),
            CallError::NoSuchMethod {
                module: "m".into(),
                method: "missing".into()
            }
        );
    }

    #[test]
    fn test_arity_checked_before_call() {
        let (ctx, _) = recording_ctx();
        let module: NativeModule<String> = NativeModule::new("m")
            .method(MethodDef::new("one", CallConv::O, |ctx, args| ctx.dup(args[0])));

        let err = module.call(&ctx, "one", vec![]).unwrap_err();
        assert_eq!(
            err,
            CallError::ArityMismatch {
                method: "one".into(),
                expected: "exactly one argument",
                given: 0
            }
        );
        assert!(err.to_string().contains("(0 given)"));
        assert_eq!(ctx.stats().created, 0);
    }

    #[test]
    fn test_method_replacement_and_docs() {
        let module: NativeModule<String> = NativeModule::new("m")
            .with_doc("test module")
            .method(MethodDef::new("f", CallConv::NoArgs, |_, _| Handle::INVALID))
            .method(
                MethodDef::new("f", CallConv::VarArgs, |_, _| Handle::INVALID).with_doc("second"),
            );

        assert_eq!(module.doc(), Some("test module"));
        assert_eq!(module.methods().count(), 1);
        let f = module.get("f").unwrap();
        assert_eq!(f.conv(), CallConv::VarArgs);
        assert_eq!(f.doc(), Some("second"));
    }

    #[test]
    fn test_kept_argument_is_invalid_in_later_call() {
        let (ctx, hook) = recording_ctx();
        let kept = Arc::new(Mutex::new(Handle::INVALID));

        let keep = Arc::clone(&kept);
        let stash = Arc::clone(&kept);
        let module: NativeModule<String> = NativeModule::new("mytest")
            .method(MethodDef::new("f", CallConv::O, move |ctx, args| {
                *keep.lock() = args[0];
                ctx.create("None".to_string())
            }))
            .method(MethodDef::new("g", CallConv::NoArgs, move |ctx, _| {
                ctx.dup(*stash.lock())
            }));

        assert_eq!(module.call(&ctx, "f", vec!["foo".into()]).unwrap(), "None");
        assert!(hook.is_empty());

        let err = module.call(&ctx, "g", vec![]).unwrap_err();
        assert_eq!(err, CallError::NoResult("g".into()));
        assert_eq!(ctx.violation_counts().invalid_handles(), 1);
        assert_eq!(hook.count(ViolationKind::UseAfterClose), 1);
    }

    #[test]
    fn test_closing_argument_is_double_close() {
        let (ctx, hook) = recording_ctx();
        let module: NativeModule<String> =
            NativeModule::new("m").method(MethodDef::new("f", CallConv::O, |ctx, args| {
                let _ = ctx.close(args[0]);
                ctx.create("ok".to_string())
            }));

        assert_eq!(module.call(&ctx, "f", vec!["x".into()]).unwrap(), "ok");
        assert_eq!(hook.count(ViolationKind::DoubleClose), 1);
        assert_eq!(ctx.open_handle_count(), 0);
    }
}
