//! Validity checking.
//!
//! [`classify`] is the single decision point for every handle operation. It
//! is pure: the handle table looks up the slot, asks for a classification,
//! and only then mutates state or reports. The same record and requested
//! generation always classify the same way, so repeated misuse produces
//! identical reports.

use crate::handle::Generation;
use crate::table::HandleState;
use crate::violation::ViolationKind;

/// How an operation touches a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Any read: dup, resolve, return conversion.
    Use,
    /// Closing the handle.
    Close,
}

/// Outcome of [`classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// The handle is open; the operation may proceed.
    Ok,
    /// The handle was closed and is being used.
    UseAfterClose,
    /// The handle was closed and is being closed again.
    DoubleClose,
    /// No record matches the slot and generation.
    UnknownHandle,
}

impl Classification {
    /// The violation this classification reports, if any.
    pub fn violation_kind(&self) -> Option<ViolationKind> {
        match self {
            Classification::Ok => None,
            Classification::UseAfterClose => Some(ViolationKind::UseAfterClose),
            Classification::DoubleClose => Some(ViolationKind::DoubleClose),
            Classification::UnknownHandle => Some(ViolationKind::UnknownHandle),
        }
    }

    /// Check if the operation may proceed.
    pub fn is_ok(&self) -> bool {
        matches!(self, Classification::Ok)
    }
}

/// Classify an access against the record currently occupying a slot.
///
/// `record` is the slot's `(generation, state)`, or `None` if the slot was
/// never allocated. Rules are applied in order:
///
/// 1. no record, or a generation mismatch: [`Classification::UnknownHandle`]
/// 2. closed record, closing: [`Classification::DoubleClose`]
/// 3. closed record, any other access: [`Classification::UseAfterClose`]
/// 4. open record: [`Classification::Ok`]
pub fn classify(
    record: Option<(Generation, HandleState)>,
    requested: Generation,
    access: Access,
) -> Classification {
    match record {
        None => Classification::UnknownHandle,
        Some((generation, _)) if generation != requested => Classification::UnknownHandle,
        Some((_, HandleState::Closed)) => match access {
            Access::Close => Classification::DoubleClose,
            Access::Use => Classification::UseAfterClose,
        },
        Some((_, HandleState::Open)) => Classification::Ok,
    }
}
