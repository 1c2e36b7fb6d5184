//! # Handle Table
//!
//! Generational arena mapping handle slots to debug records.
//!
//! ## Design
//!
//! Every slot holds the most recent record minted for it. A record is never
//! removed, only closed; the slot is recycled later with its generation
//! incremented, which invalidates every token minted for the previous
//! occupant. This is the [generational arena](https://crates.io/crates/generational-arena)
//! pattern for solving the ABA problem.
//!
//! Closed slots are not reused straight away. They wait in a FIFO quarantine
//! so that a stale token used shortly after its close is reported precisely
//! (use-after-close or double-close) rather than as an unknown handle.
//!
//! The table never calls out to a hook. Operations return a [`Violation`]
//! and the caller decides what to do with it after releasing its lock.
//! Values released by a close are handed back to the caller for the same
//! reason: dropping a host value may run arbitrary code.

use std::collections::VecDeque;

use crate::handle::{generation, Generation, Handle, SlotIndex};
use crate::scope::FrameId;
use crate::validity::{classify, Access};
use crate::violation::{Operation, Violation, ViolationKind};

/// Lifecycle state of a handle record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// The handle may be used.
    Open,
    /// The handle was closed; its value has been released.
    Closed,
}

/// Debug metadata for one handle.
#[derive(Debug)]
pub struct HandleRecord<V> {
    generation: Generation,
    state: HandleState,
    /// Retained host value; `None` once closed.
    value: Option<V>,
    /// Frame that was innermost when the record was created.
    frame: FrameId,
    /// Process-wide creation order.
    serial: u64,
    constant: bool,
    leak_reported: bool,
}

impl<V> HandleRecord<V> {
    /// Current generation of the record's slot.
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Current state.
    pub fn state(&self) -> HandleState {
        self.state
    }

    /// Frame the record was created in.
    pub fn frame(&self) -> FrameId {
        self.frame
    }

    /// Creation serial number.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Whether this is an immortal context constant.
    pub fn is_constant(&self) -> bool {
        self.constant
    }

    fn is_live(&self) -> bool {
        self.state == HandleState::Open && !self.constant
    }
}

/// A freshly opened handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Opened {
    /// The new handle.
    pub handle: Handle,
    /// Its creation serial, used to order leak reports.
    pub serial: u64,
}

/// Result of a successful close.
#[derive(Debug)]
pub struct Closed<V> {
    /// Frame the handle was created in.
    pub frame: FrameId,
    /// Creation serial of the closed record.
    pub serial: u64,
    /// The released value, to be dropped by the caller.
    pub value: Option<V>,
    /// The handle was a constant and was left open.
    pub constant: bool,
}

/// Counters describing table activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableStats {
    /// Handles created from values.
    pub created: u64,
    /// Handles created by dup.
    pub duplicated: u64,
    /// Successful closes.
    pub closed: u64,
    /// Slots reused with a new generation.
    pub recycled: u64,
    /// Slots withdrawn because their generation overflowed.
    pub retired: u64,
}

/// Generational handle table.
pub struct HandleTable<V> {
    slots: Vec<HandleRecord<V>>,
    /// Closed slots, oldest first.
    free: VecDeque<SlotIndex>,
    quarantine: usize,
    next_serial: u64,
    stats: TableStats,
}

impl<V> HandleTable<V> {
    /// Create a table that keeps `quarantine` closed slots out of reuse.
    pub fn new(initial_capacity: usize, quarantine: usize) -> Self {
        Self {
            slots: Vec::with_capacity(initial_capacity),
            free: VecDeque::new(),
            quarantine,
            next_serial: 0,
            stats: TableStats::default(),
        }
    }

    /// Open a new handle to `value`, attributed to `frame`.
    ///
    /// Returns `None` only if the slot space is exhausted.
    pub fn create(&mut self, value: V, frame: FrameId) -> Option<Opened> {
        let opened = self.open(value, frame, false)?;
        self.stats.created += 1;
        Some(opened)
    }

    /// Register an immortal constant.
    pub fn create_constant(&mut self, value: V) -> Option<Handle> {
        self.open(value, FrameId::ROOT, true).map(|o| o.handle)
    }

    /// Close a handle, returning what the caller needs to finish the job.
    pub fn close(&mut self, handle: Handle) -> Result<Closed<V>, Violation> {
        let slot = self.check(handle, Access::Close, Operation::Close)?;
        let record = &mut self.slots[slot as usize];

        if record.constant {
            return Ok(Closed {
                frame: record.frame,
                serial: record.serial,
                value: None,
                constant: true,
            });
        }

        record.state = HandleState::Closed;
        let value = record.value.take();
        let closed = Closed {
            frame: record.frame,
            serial: record.serial,
            value,
            constant: false,
        };

        if record.generation < generation::OVERFLOW_GUARD {
            self.free.push_back(slot);
        } else {
            self.stats.retired += 1;
        }
        self.stats.closed += 1;
        Ok(closed)
    }

    /// Current state of the record a handle names, if the handle is current.
    pub fn state(&self, handle: Handle) -> Option<HandleState> {
        self.record(handle).map(|r| r.state)
    }

    /// Look up the record a handle names, if the handle is current.
    pub fn record(&self, handle: Handle) -> Option<&HandleRecord<V>> {
        let record = self.slots.get(handle.slot()? as usize)?;
        (record.generation == handle.generation()).then_some(record)
    }

    /// Check if a handle names an open record.
    pub fn is_open(&self, handle: Handle) -> bool {
        self.state(handle) == Some(HandleState::Open)
    }

    /// Mark an open handle as reported leaked.
    ///
    /// Returns `false` if the handle is closed, constant, stale, or was
    /// already reported, so each leak is reported at most once.
    pub fn mark_leaked(&mut self, handle: Handle) -> bool {
        let Some(slot) = handle.slot() else {
            return false;
        };
        match self.slots.get_mut(slot as usize) {
            Some(record)
                if record.generation == handle.generation()
                    && record.is_live()
                    && !record.leak_reported =>
            {
                record.leak_reported = true;
                true
            }
            _ => false,
        }
    }

    /// Mark every unreported live handle as leaked and return them in
    /// creation order.
    pub fn drain_unreported(&mut self) -> Vec<Handle> {
        let mut leaked: Vec<(u64, Handle)> = Vec::new();
        for (slot, record) in self.slots.iter_mut().enumerate() {
            if record.is_live() && !record.leak_reported {
                record.leak_reported = true;
                leaked.push((record.serial, Handle::new(slot as SlotIndex, record.generation)));
            }
        }
        leaked.sort_unstable_by_key(|(serial, _)| *serial);
        leaked.into_iter().map(|(_, h)| h).collect()
    }

    /// Live (open, non-constant) handles in creation order.
    pub fn open_handles(&self) -> Vec<Handle> {
        let mut open: Vec<(u64, Handle)> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_live())
            .map(|(slot, r)| (r.serial, Handle::new(slot as SlotIndex, r.generation)))
            .collect();
        open.sort_unstable_by_key(|(serial, _)| *serial);
        open.into_iter().map(|(_, h)| h).collect()
    }

    /// Number of live handles.
    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|r| r.is_live()).count()
    }

    /// Number of slots ever allocated.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Activity counters.
    pub fn stats(&self) -> TableStats {
        self.stats
    }

    /// Classify an access and return the slot if it may proceed.
    fn check(&self, handle: Handle, access: Access, op: Operation) -> Result<SlotIndex, Violation> {
        let Some(slot) = handle.slot() else {
            return Err(Violation::new(ViolationKind::UnknownHandle, handle, op));
        };
        let record = self.slots.get(slot as usize).map(|r| (r.generation, r.state));

        match classify(record, handle.generation(), access).violation_kind() {
            Some(kind) => Err(Violation::new(kind, handle, op)),
            None => Ok(slot),
        }
    }

    fn open(&mut self, value: V, frame: FrameId, constant: bool) -> Option<Opened> {
        let serial = self.next_serial;

        let handle = if self.free.len() > self.quarantine {
            let slot = self.free.pop_front()?;
            let record = &mut self.slots[slot as usize];
            record.generation += 1;
            record.state = HandleState::Open;
            record.value = Some(value);
            record.frame = frame;
            record.serial = serial;
            record.constant = constant;
            record.leak_reported = false;
            self.stats.recycled += 1;
            Handle::new(slot, record.generation)
        } else {
            // The top slot index would overflow the handle encoding.
            if self.slots.len() >= (u32::MAX - 1) as usize {
                tracing::error!(slots = self.slots.len(), "handle slot space exhausted");
                return None;
            }
            let slot = self.slots.len() as SlotIndex;
            self.slots.push(HandleRecord {
                generation: generation::FIRST,
                state: HandleState::Open,
                value: Some(value),
                frame,
                serial,
                constant,
                leak_reported: false,
            });
            Handle::new(slot, generation::FIRST)
        };

        self.next_serial += 1;
        Some(Opened { handle, serial })
    }

    #[cfg(test)]
    pub(crate) fn force_generation(&mut self, slot: SlotIndex, gen: Generation) {
        self.slots[slot as usize].generation = gen;
    }
}

impl<V: Clone> HandleTable<V> {
    /// Open a second, independent handle to the value `handle` denotes.
    pub fn dup(&mut self, handle: Handle, frame: FrameId) -> Result<Opened, Violation> {
        let value = self.resolve_as(handle, Operation::Dup)?;
        let opened = self
            .open(value, frame, false)
            .ok_or_else(|| Violation::new(ViolationKind::UnknownHandle, handle, Operation::Dup))?;
        self.stats.duplicated += 1;
        Ok(opened)
    }

    /// Return a retained copy of the value an open handle denotes.
    pub fn resolve(&self, handle: Handle) -> Result<V, Violation> {
        self.resolve_as(handle, Operation::Resolve)
    }

    /// Resolve on behalf of a specific operation.
    pub fn resolve_as(&self, handle: Handle, op: Operation) -> Result<V, Violation> {
        let slot = self.check(handle, Access::Use, op)?;
        self.slots[slot as usize]
            .value
            .clone()
            .ok_or_else(|| Violation::new(ViolationKind::UseAfterClose, handle, op))
    }
}

impl<V> std::fmt::Debug for HandleTable<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleTable")
            .field("slots", &self.slots.len())
            .field("free", &self.free.len())
            .field("quarantine", &self.quarantine)
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn table(quarantine: usize) -> HandleTable<Arc<String>> {
        HandleTable::new(8, quarantine)
    }

    fn value(s: &str) -> Arc<String> {
        Arc::new(s.to_string())
    }

    #[test]
    fn test_create_and_resolve() {
        let mut t = table(0);
        let h = t.create(value("a"), FrameId::ROOT).unwrap().handle;
        assert_eq!(h.generation(), generation::FIRST);
        assert_eq!(t.resolve(h).unwrap().as_str(), "a");
        assert!(t.is_open(h));
        assert_eq!(t.open_count(), 1);
    }

    #[test]
    fn test_close_releases_value() {
        let mut t = table(0);
        let v = value("held");
        let h = t.create(v.clone(), FrameId::ROOT).unwrap().handle;
        assert_eq!(Arc::strong_count(&v), 2);

        let closed = t.close(h).unwrap();
        drop(closed);
        assert_eq!(Arc::strong_count(&v), 1);
        assert_eq!(t.state(h), Some(HandleState::Closed));
    }

    #[test]
    fn test_double_close() {
        let mut t = table(4);
        let h = t.create(value("x"), FrameId::ROOT).unwrap().handle;
        t.close(h).unwrap();
        let err = t.close(h).unwrap_err();
        assert_eq!(err.kind, ViolationKind::DoubleClose);
        assert_eq!(err.operation, Operation::Close);
    }

    #[test]
    fn test_use_after_close() {
        let mut t = table(4);
        let h = t.create(value("x"), FrameId::ROOT).unwrap().handle;
        t.close(h).unwrap();
        for _ in 0..3 {
            assert_eq!(t.resolve(h).unwrap_err().kind, ViolationKind::UseAfterClose);
        }
        let err = t.dup(h, FrameId::ROOT).unwrap_err();
        assert_eq!(err.kind, ViolationKind::UseAfterClose);
        assert_eq!(err.operation, Operation::Dup);
    }

    #[test]
    fn test_dup_is_independent() {
        let mut t = table(0);
        let v = value("shared");
        let h1 = t.create(v.clone(), FrameId::ROOT).unwrap().handle;
        let h2 = t.dup(h1, FrameId::ROOT).unwrap().handle;
        assert_ne!(h1, h2);
        assert_eq!(Arc::strong_count(&v), 3);

        t.close(h1).unwrap();
        assert!(t.is_open(h2));
        assert_eq!(t.resolve(h2).unwrap().as_str(), "shared");
        assert_eq!(t.stats().duplicated, 1);
    }

    #[test]
    fn test_never_allocated_slot_is_unknown() {
        let mut t = table(0);
        for raw in [0u64, 1, 42, u64::MAX, 7 << 32] {
            let h = Handle::from_raw(raw);
            assert_eq!(t.close(h).unwrap_err().kind, ViolationKind::UnknownHandle);
            assert_eq!(t.resolve(h).unwrap_err().kind, ViolationKind::UnknownHandle);
        }
    }

    #[test]
    fn test_recycled_slot_rejects_stale_handle() {
        let mut t = table(0);
        let a = t.create(value("a"), FrameId::ROOT).unwrap().handle;
        t.close(a).unwrap();
        let b = t.create(value("b"), FrameId::ROOT).unwrap().handle;

        assert_eq!(a.slot(), b.slot());
        assert_eq!(b.generation(), a.generation() + 1);

        assert_eq!(t.resolve(a).unwrap_err().kind, ViolationKind::UnknownHandle);
        assert_eq!(t.close(a).unwrap_err().kind, ViolationKind::UnknownHandle);
        assert!(t.is_open(b));
        assert_eq!(t.resolve(b).unwrap().as_str(), "b");
        assert_eq!(t.stats().recycled, 1);
    }

    #[test]
    fn test_quarantine_delays_reuse() {
        let mut t = table(2);
        let a = t.create(value("a"), FrameId::ROOT).unwrap().handle;
        let b = t.create(value("b"), FrameId::ROOT).unwrap().handle;
        t.close(a).unwrap();
        t.close(b).unwrap();

        // Two closed slots, quarantine of two: a fresh slot is used.
        let c = t.create(value("c"), FrameId::ROOT).unwrap().handle;
        assert_eq!(c.slot(), Some(2));
        assert_eq!(t.resolve(a).unwrap_err().kind, ViolationKind::UseAfterClose);

        t.close(c).unwrap();
        // Three closed slots: the oldest (a's) is recycled.
        let d = t.create(value("d"), FrameId::ROOT).unwrap().handle;
        assert_eq!(d.slot(), a.slot());
        assert_eq!(t.resolve(a).unwrap_err().kind, ViolationKind::UnknownHandle);
    }

    #[test]
    fn test_overflowed_slot_is_retired() {
        let mut t = table(0);
        let h = t.create(value("old"), FrameId::ROOT).unwrap().handle;
        t.force_generation(0, generation::OVERFLOW_GUARD);
        let h = Handle::new(h.slot().unwrap(), generation::OVERFLOW_GUARD);
        t.close(h).unwrap();

        let fresh = t.create(value("new"), FrameId::ROOT).unwrap().handle;
        assert_eq!(fresh.slot(), Some(1));
        assert_eq!(t.stats().retired, 1);
        assert_eq!(t.close(h).unwrap_err().kind, ViolationKind::DoubleClose);
    }

    #[test]
    fn test_constant_survives_close() {
        let mut t = table(0);
        let none = t.create_constant(value("None")).unwrap();
        let closed = t.close(none).unwrap();
        assert!(closed.constant);
        assert!(t.is_open(none));
        assert_eq!(t.open_count(), 0);
        assert!(t.open_handles().is_empty());
    }

    #[test]
    fn test_mark_leaked_once() {
        let mut t = table(0);
        let h = t.create(value("leak"), FrameId::ROOT).unwrap().handle;
        assert!(t.mark_leaked(h));
        assert!(!t.mark_leaked(h));
        assert!(t.drain_unreported().is_empty());
    }

    #[test]
    fn test_drain_unreported_in_creation_order() {
        let mut t = table(0);
        let a = t.create(value("a"), FrameId::ROOT).unwrap().handle;
        let b = t.create(value("b"), FrameId::ROOT).unwrap().handle;
        t.close(a).unwrap();
        let c = t.create(value("c"), FrameId::ROOT).unwrap().handle; // reuses a's slot
        assert_eq!(t.open_handles(), vec![b, c]);
        assert_eq!(t.drain_unreported(), vec![b, c]);
        assert!(t.drain_unreported().is_empty());
    }
}
