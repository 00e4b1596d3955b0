//! Error types returned by the address-space manager.

use core::fmt;

/// Errors that can occur during address-space operations.
///
/// None of these are retried internally. A failed operation leaves the address space
/// exactly as it was before the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// A misaligned address or size, a zero size, or an area that does not belong to the space.
    InvalidArgument,
    /// The address or range lies outside the address space's bounds.
    OutOfRange,
    /// A range collides with an existing area, or two layout windows overlap.
    Overlap,
    /// No gap large enough was found.
    OutOfSpace,
    /// The address space is being deleted.
    Gone,
    /// The translation layer failed.
    TranslationFailure(TranslationError),
    /// The lock primitive is no longer usable. Fatal for the operation in progress.
    LockFailure,
    /// An address space is already registered for this process.
    AlreadyExists,
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument => f.write_str("invalid argument"),
            Self::OutOfRange => f.write_str("address outside of address space"),
            Self::Overlap => f.write_str("range overlaps an existing area"),
            Self::OutOfSpace => f.write_str("no free range large enough"),
            Self::Gone => f.write_str("address space is being deleted"),
            Self::TranslationFailure(err) => write!(f, "translation layer failure: {err}"),
            Self::LockFailure => f.write_str("address space lock is unusable"),
            Self::AlreadyExists => f.write_str("address space already registered"),
        }
    }
}

impl core::error::Error for VmError {}

impl From<TranslationError> for VmError {
    fn from(err: TranslationError) -> Self {
        Self::TranslationFailure(err)
    }
}

/// Errors reported by a translation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslationError {
    /// Physical memory (frames or page tables) is exhausted.
    OutOfMemory,
    /// Part of the range is already mapped.
    AlreadyMapped,
    /// No more translation maps can be created.
    MapLimit,
}

impl fmt::Display for TranslationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => f.write_str("out of physical memory"),
            Self::AlreadyMapped => f.write_str("range already mapped"),
            Self::MapLimit => f.write_str("translation map limit reached"),
        }
    }
}

impl core::error::Error for TranslationError {}
