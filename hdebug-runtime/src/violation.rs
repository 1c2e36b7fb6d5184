//! Violation records.
//!
//! A [`Violation`] is produced exactly once for every misuse the debug
//! context detects and is handed to the hook dispatcher. It is also the error
//! type of the handle operations that can fail, so callers that continue past
//! a violation still see what went wrong.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::handle::Handle;
use crate::scope::FrameId;

/// Kind of handle misuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationKind {
    /// A closed handle was used.
    UseAfterClose,
    /// A closed handle was closed again.
    DoubleClose,
    /// The handle never existed or its slot has since been recycled.
    UnknownHandle,
    /// A handle was still open when its creation frame exited.
    Leak,
}

impl ViolationKind {
    /// All kinds, in reporting order.
    pub const ALL: [ViolationKind; 4] = [
        ViolationKind::UseAfterClose,
        ViolationKind::DoubleClose,
        ViolationKind::UnknownHandle,
        ViolationKind::Leak,
    ];

    /// Stable name used in logs and reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationKind::UseAfterClose => "USE_AFTER_CLOSE",
            ViolationKind::DoubleClose => "DOUBLE_CLOSE",
            ViolationKind::UnknownHandle => "UNKNOWN_HANDLE",
            ViolationKind::Leak => "LEAK",
        }
    }

    /// Whether this kind is an invalid-handle use rather than a leak.
    pub fn is_invalid_handle(&self) -> bool {
        !matches!(self, ViolationKind::Leak)
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            ViolationKind::UseAfterClose => 0,
            ViolationKind::DoubleClose => 1,
            ViolationKind::UnknownHandle => 2,
            ViolationKind::Leak => 3,
        }
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The operation during which a violation was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Duplicating a handle.
    Dup,
    /// Closing a handle.
    Close,
    /// Dereferencing a handle to its value.
    Resolve,
    /// Converting a native function's return handle into a host value.
    Return,
    /// Exiting a scope frame.
    ScopeExit,
    /// Popping the implicit root frame.
    Teardown,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Dup => "dup",
            Operation::Close => "close",
            Operation::Resolve => "resolve",
            Operation::Return => "return",
            Operation::ScopeExit => "scope exit",
            Operation::Teardown => "teardown",
        };
        f.write_str(name)
    }
}

/// A detected handle violation.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{kind} on handle {handle} during {operation}")]
pub struct Violation {
    /// What went wrong.
    pub kind: ViolationKind,
    /// The offending handle.
    pub handle: Handle,
    /// The operation that detected it.
    pub operation: Operation,
    /// Frame the violation is attributed to (set for leaks).
    pub frame: Option<FrameId>,
}

impl Violation {
    /// Create a violation detected synchronously at an operation.
    pub fn new(kind: ViolationKind, handle: Handle, operation: Operation) -> Self {
        Self {
            kind,
            handle,
            operation,
            frame: None,
        }
    }

    /// Create a leak attributed to a frame.
    pub fn leak(handle: Handle, frame: FrameId, operation: Operation) -> Self {
        Self {
            kind: ViolationKind::Leak,
            handle,
            operation,
            frame: Some(frame),
        }
    }
}
