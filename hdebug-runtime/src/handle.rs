//! # Handle Identifiers
//!
//! The opaque token handed to native code in place of a pointer.
//!
//! ## Layout
//!
//! A [`Handle`] is a single `u64`:
//!
//! ```text
//!  63                32 31                 0
//! ┌────────────────────┬────────────────────┐
//! │     generation     │     slot + 1       │
//! └────────────────────┴────────────────────┘
//! ```
//!
//! The slot is stored off-by-one so that the all-zero token never names a
//! slot; it is the [`Handle::INVALID`] sentinel. Because every token carries
//! the generation of the record it was minted for, a token that outlives its
//! slot's recycling no longer matches the slot and is detected instead of
//! silently aliasing the new record.
//!
//! ## Technical References
//!
//! - [Handles are the better pointers](https://floooh.github.io/2018/06/17/handles-vs-pointers.html)

use std::fmt;

use serde::Serialize;

/// Generation counter for detecting stale handles.
pub type Generation = u32;

/// Index of a slot in the handle table.
pub type SlotIndex = u32;

/// Reserved generation values.
pub mod generation {
    use super::Generation;

    /// Generation of a freshly allocated slot.
    pub const FIRST: Generation = 0;
    /// A slot that reaches this generation is retired instead of recycled.
    pub const OVERFLOW_GUARD: Generation = u32::MAX;
}

const SLOT_BITS: u32 = 32;
const SLOT_MASK: u64 = (1 << SLOT_BITS) - 1;

/// Opaque handle identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Handle(u64);

impl Handle {
    /// The sentinel returned when an operation could not produce a handle.
    ///
    /// It never names a slot, so every later operation on it is reported as
    /// an unknown handle.
    pub const INVALID: Self = Self(0);

    /// Build a handle from a slot index and generation.
    pub const fn new(slot: SlotIndex, generation: Generation) -> Self {
        Self(((generation as u64) << SLOT_BITS) | (slot as u64 + 1))
    }

    /// Reinterpret a raw token received from native code.
    ///
    /// Any value is accepted; validity is decided by the table.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw token as exposed to native code.
    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// The slot this handle refers to, or `None` for the sentinel.
    pub const fn slot(&self) -> Option<SlotIndex> {
        match self.0 & SLOT_MASK {
            0 => None,
            n => Some((n - 1) as SlotIndex),
        }
    }

    /// The generation this handle was minted for.
    pub const fn generation(&self) -> Generation {
        (self.0 >> SLOT_BITS) as Generation
    }

    /// Check if this is the invalid sentinel (or any token without a slot).
    pub const fn is_invalid(&self) -> bool {
        self.slot().is_none()
    }
}

impl Default for Handle {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.slot() {
            Some(slot) => f
                .debug_struct("Handle")
                .field("slot", &slot)
                .field("generation", &self.generation())
                .finish(),
            None => write!(f, "Handle(INVALID:{:#x})", self.0),
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.slot() {
            Some(slot) => write!(f, "h{}.{}", slot, self.generation()),
            None => write!(f, "h<invalid>"),
        }
    }
}
