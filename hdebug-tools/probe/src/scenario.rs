//! Named handle-misuse scenarios.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::ValueEnum;

use hdebug_runtime::{CallConv, DebugContext, FrameKind, Handle, MethodDef, NativeModule};

/// Host value type used by every scenario.
pub type Value = Arc<String>;

fn val(s: &str) -> Value {
    Arc::new(s.to_string())
}

/// A scenario the probe can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Scenario {
    /// Create, dup and close everything: no violations.
    Clean,
    /// Close the same handle twice.
    DoubleClose,
    /// Resolve a handle after closing it.
    UseAfterClose,
    /// Leave a handle open when a monitoring scope exits.
    Leak,
    /// Resolve a token that was never issued.
    UnknownHandle,
    /// Keep a call argument and use it in a later call.
    KeptArgument,
    /// Pop an outer frame while an inner frame is active.
    OutOfOrderPop,
}

impl Scenario {
    /// Every scenario, in listing order.
    pub const ALL: [Scenario; 7] = [
        Scenario::Clean,
        Scenario::DoubleClose,
        Scenario::UseAfterClose,
        Scenario::Leak,
        Scenario::UnknownHandle,
        Scenario::KeptArgument,
        Scenario::OutOfOrderPop,
    ];

    /// Command-line name.
    pub fn name(&self) -> &'static str {
        match self {
            Scenario::Clean => "clean",
            Scenario::DoubleClose => "double-close",
            Scenario::UseAfterClose => "use-after-close",
            Scenario::Leak => "leak",
            Scenario::UnknownHandle => "unknown-handle",
            Scenario::KeptArgument => "kept-argument",
            Scenario::OutOfOrderPop => "out-of-order-pop",
        }
    }

    /// One-line description.
    pub fn description(&self) -> &'static str {
        match self {
            Scenario::Clean => "create h1, dup to h2, close h2, close h1",
            Scenario::DoubleClose => "create h, close h, close h",
            Scenario::UseAfterClose => "create h, close h, resolve h",
            Scenario::Leak => "enter scope, create h, exit scope",
            Scenario::UnknownHandle => "resolve a token that was never issued",
            Scenario::KeptArgument => "f keeps its argument, g dups it in a later call",
            Scenario::OutOfOrderPop => "push two frames, pop the outer one first",
        }
    }

    /// Run the scenario against `ctx`.
    ///
    /// Violations flow through the context's hook; with no hook installed
    /// the first one terminates the process.
    pub fn run(&self, ctx: &DebugContext<Value>) -> Result<()> {
        match self {
            Scenario::Clean => {
                let h1 = ctx.create(val("x"));
                let h2 = ctx.dup(h1);
                ctx.close(h2)?;
                ctx.close(h1)?;
            }
            Scenario::DoubleClose => {
                let h = ctx.create(val("x"));
                ctx.close(h)?;
                let _ = ctx.close(h);
            }
            Scenario::UseAfterClose => {
                let h = ctx.create(val("x"));
                ctx.close(h)?;
                let _ = ctx.resolve(h);
            }
            Scenario::Leak => {
                let mut scope = ctx.enter_monitoring_scope();
                ctx.create(val("leaked"));
                let report = ctx.exit_monitoring_scope(&mut scope);
                tracing::info!(leaks = report.len(), frame = %report.frame, "scope exited");
            }
            Scenario::UnknownHandle => {
                let _ = ctx.resolve(Handle::new(4096, 7));
            }
            Scenario::KeptArgument => {
                let module = keeping_module();
                module.call(ctx, "f", vec![val("foo")])?;
                // The unrelated argument takes the first recycled slot.
                if let Err(err) = module.call(ctx, "g", vec![val("bar")]) {
                    tracing::info!(error = %err, "g failed");
                }
            }
            Scenario::OutOfOrderPop => {
                let outer = ctx.push_frame(FrameKind::Monitor);
                let inner = ctx.push_frame(FrameKind::Monitor);
                ctx.pop_frame(outer);
                ctx.pop_frame(inner);
                bail!("out-of-order pop was not rejected");
            }
        }
        Ok(())
    }
}

/// `f` stores its argument handle; `g` tries to dup it later.
fn keeping_module() -> NativeModule<Value> {
    let kept = Arc::new(KeptHandle::default());
    let store = Arc::clone(&kept);
    NativeModule::new("mytest")
        .method(MethodDef::new("f", CallConv::O, move |ctx, args| {
            store.set(args[0]);
            ctx.create(val("None"))
        }))
        .method(MethodDef::new("g", CallConv::VarArgs, move |ctx, _| {
            ctx.dup(kept.get())
        }))
}

/// A handle slot shared between native functions.
#[derive(Debug, Default)]
struct KeptHandle(AtomicU64);

impl KeptHandle {
    fn set(&self, handle: Handle) {
        self.0.store(handle.raw(), Ordering::SeqCst);
    }

    fn get(&self) -> Handle {
        Handle::from_raw(self.0.load(Ordering::SeqCst))
    }
}
