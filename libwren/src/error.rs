pub(crate) use anyhow::Error;
use std::fmt::Display;

pub type Result<T = (), E = Error> = core::result::Result<T, E>;

/// Classification of a fatal link failure. Attached to the error chain so that callers can
/// distinguish bad input from linker defects without parsing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkFailure {
    /// A relocation type we don't have a descriptor for. Later passes cannot reason about an
    /// unknown descriptor, so the link aborts immediately.
    BadRelocation,

    /// A computed relocation value doesn't fit the descriptor's field.
    Overflow,

    /// A non-weak reference with no definition.
    UndefinedSymbol,

    /// A branch remained unreachable even after stub insertion.
    OutOfRange,

    /// A relocation type that is recognised but not valid in the current link mode.
    Unsupported,

    /// An internal invariant was violated. Always indicates a logic defect rather than bad
    /// input.
    InternalInconsistency,
}

impl Display for LinkFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LinkFailure::BadRelocation => "bad relocation",
            LinkFailure::Overflow => "relocation overflow",
            LinkFailure::UndefinedSymbol => "undefined symbol",
            LinkFailure::OutOfRange => "branch out of range",
            LinkFailure::Unsupported => "unsupported relocation for this output kind",
            LinkFailure::InternalInconsistency => "internal inconsistency",
        };
        f.write_str(name)
    }
}

impl core::error::Error for LinkFailure {}

/// Returns the failure classification carried by `error`, if any.
#[must_use]
pub fn failure_kind(error: &Error) -> Option<LinkFailure> {
    error.downcast_ref::<LinkFailure>().copied()
}

/// Like `anyhow::bail!`, but tags the error with a [`LinkFailure`] classification.
macro_rules! fail {
    ($kind:expr, $($rest:tt)*) => {
        return Err($crate::error::Error::new($kind).context(format!($($rest)*)))
    };
}

pub(crate) use fail;
