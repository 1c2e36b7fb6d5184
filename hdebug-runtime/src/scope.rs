//! # Scope Tracking
//!
//! Leak attribution by nested scope frames.
//!
//! ## Design
//!
//! A frame delimits a window in which handles are opened: one call into
//! native code, or a user-defined monitoring session. Frames nest strictly
//! and each OS thread has its own stack; a frame must be popped by the thread
//! that pushed it, in LIFO order.
//!
//! Each frame keeps the handles created while it was innermost, keyed by
//! creation serial so that leaks are reported in creation order. Closing a
//! handle removes it from its creation frame wherever the close happens, so
//! a handle created in a frame and closed in a nested child is not a leak.
//!
//! The implicit root frame ([`FrameId::ROOT`]) is innermost whenever a
//! thread has no frames of its own. Its membership is not tracked here: the
//! root is only ever popped at teardown, where every remaining open handle
//! in the table is a leak.
//!
//! ```text
//!   thread A            thread B
//!   ┌─────────┐
//!   │ frame 3 │ ◄─ innermost
//!   ├─────────┤         ┌─────────┐
//!   │ frame 1 │         │ frame 2 │ ◄─ innermost
//!   └────┬────┘         └────┬────┘
//!        └────── ROOT ───────┘
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::thread::{self, ThreadId};

use serde::Serialize;
use thiserror::Error;

use crate::handle::Handle;

/// Identifier of a scope frame. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct FrameId(u64);

impl FrameId {
    /// The implicit process-wide outermost frame.
    pub const ROOT: Self = Self(0);

    /// Get the raw identifier.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == FrameId::ROOT {
            write!(f, "frame#root")
        } else {
            write!(f, "frame#{}", self.0)
        }
    }
}

/// What a frame delimits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKind {
    /// One invocation of a native function.
    Call {
        /// Name of the native function.
        name: String,
    },
    /// A user-delimited monitoring window.
    Monitor,
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameKind::Call { name } => write!(f, "call `{}`", name),
            FrameKind::Monitor => write!(f, "monitor"),
        }
    }
}

/// Misuse of the scope tracker by its integration layer.
///
/// These are defects in the code that brackets native calls, not in native
/// code, and are never routed through the violation hook.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScopeError {
    /// The frame is not the innermost frame of its thread.
    #[error("{found} popped while {expected} is innermost")]
    OutOfOrder {
        /// The innermost frame.
        expected: FrameId,
        /// The frame that was popped.
        found: FrameId,
    },
    /// The frame was already popped or never existed.
    #[error("{0} is not active")]
    NotActive(FrameId),
    /// The frame was pushed by a different thread.
    #[error("{0} belongs to another thread")]
    WrongThread(FrameId),
    /// The root frame is only popped by teardown.
    #[error("the root frame cannot be popped")]
    RootFrame,
}

/// One active scope frame.
#[derive(Debug)]
pub struct ScopeFrame {
    id: FrameId,
    parent: FrameId,
    kind: FrameKind,
    thread: ThreadId,
    /// Handles opened in this frame and not yet closed, by creation serial.
    live: BTreeMap<u64, Handle>,
}

impl ScopeFrame {
    /// The frame identifier.
    pub fn id(&self) -> FrameId {
        self.id
    }

    /// The enclosing frame.
    pub fn parent(&self) -> FrameId {
        self.parent
    }

    /// What the frame delimits.
    pub fn kind(&self) -> &FrameKind {
        &self.kind
    }

    /// Handles opened here and not closed, in creation order.
    pub fn live_handles(&self) -> impl Iterator<Item = Handle> + '_ {
        self.live.values().copied()
    }

    /// Number of handles opened here and not closed.
    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}

/// Per-thread stacks of scope frames.
#[derive(Debug)]
pub struct ScopeTracker {
    frames: HashMap<FrameId, ScopeFrame>,
    stacks: HashMap<ThreadId, Vec<FrameId>>,
    next_id: u64,
}

impl ScopeTracker {
    /// Create a tracker with only the root frame.
    pub fn new() -> Self {
        Self {
            frames: HashMap::new(),
            stacks: HashMap::new(),
            next_id: 1,
        }
    }

    /// Push a new innermost frame for the current thread.
    pub fn push(&mut self, kind: FrameKind) -> FrameId {
        let id = FrameId(self.next_id);
        self.next_id += 1;

        let thread = thread::current().id();
        let stack = self.stacks.entry(thread).or_default();
        let parent = stack.last().copied().unwrap_or(FrameId::ROOT);
        stack.push(id);

        self.frames.insert(
            id,
            ScopeFrame {
                id,
                parent,
                kind,
                thread,
                live: BTreeMap::new(),
            },
        );
        id
    }

    /// Pop the current thread's innermost frame.
    ///
    /// `frame` must be that innermost frame. The popped frame is returned
    /// with the handles still attributed to it; deciding which of those are
    /// leaks is up to the caller, which can see the table.
    pub fn pop(&mut self, frame: FrameId) -> Result<ScopeFrame, ScopeError> {
        if frame == FrameId::ROOT {
            return Err(ScopeError::RootFrame);
        }

        let thread = thread::current().id();
        match self.frames.get(&frame) {
            None => return Err(ScopeError::NotActive(frame)),
            Some(f) if f.thread != thread => return Err(ScopeError::WrongThread(frame)),
            Some(_) => {}
        }

        let stack = self.stacks.get_mut(&thread).ok_or(ScopeError::NotActive(frame))?;
        let innermost = stack.last().copied().unwrap_or(FrameId::ROOT);
        if innermost != frame {
            return Err(ScopeError::OutOfOrder {
                expected: innermost,
                found: frame,
            });
        }

        stack.pop();
        if stack.is_empty() {
            self.stacks.remove(&thread);
        }
        self.frames.remove(&frame).ok_or(ScopeError::NotActive(frame))
    }

    /// The current thread's innermost frame.
    pub fn innermost(&self) -> FrameId {
        self.stacks
            .get(&thread::current().id())
            .and_then(|stack| stack.last().copied())
            .unwrap_or(FrameId::ROOT)
    }

    /// Number of frames on the current thread's stack, excluding the root.
    pub fn depth(&self) -> usize {
        self.stacks
            .get(&thread::current().id())
            .map_or(0, |stack| stack.len())
    }

    /// Check if a frame is still on some thread's stack.
    pub fn is_active(&self, frame: FrameId) -> bool {
        frame == FrameId::ROOT || self.frames.contains_key(&frame)
    }

    /// Look up an active frame.
    pub fn frame(&self, frame: FrameId) -> Option<&ScopeFrame> {
        self.frames.get(&frame)
    }

    /// Attribute a newly opened handle to `frame`.
    pub fn register(&mut self, frame: FrameId, serial: u64, handle: Handle) {
        if let Some(f) = self.frames.get_mut(&frame) {
            f.live.insert(serial, handle);
        }
    }

    /// Drop a closed handle from the frame it was created in.
    ///
    /// The frame may already be gone, for a handle that was reported leaked
    /// and closed afterwards.
    pub fn forget(&mut self, frame: FrameId, serial: u64) {
        if let Some(f) = self.frames.get_mut(&frame) {
            f.live.remove(&serial);
        }
    }
}

impl Default for ScopeTracker {
    fn default() -> Self {
        Self::new()
    }
}
