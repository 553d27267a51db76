//! Crate-wide error type.
//!
//! Mirrors the five error kinds the engine distinguishes: malformed input,
//! unsatisfiable links, policy skips, resource exhaustion and collaborator
//! failures. Policy skips are logged and swallowed by callers rather than
//! propagated as `Err`, so they are not represented here.

use core::result;

pub type Result<T> = result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A bounds check, magic number check or structural invariant failed
    /// while parsing a Mach-O buffer.
    #[error("malformed Mach-O: {0}")]
    Malformed(String),

    /// A `scroll` read or write failed, e.g. an out-of-range offset.
    #[error(transparent)]
    Scroll(#[from] scroll::Error),

    /// The vtable linker could not reach a fixed point, or an ABI
    /// invariant (pad slot, undeclared virtual) was violated.
    #[error("unsatisfiable vtable link for class {class}: {reason}")]
    UnsatisfiableLink { class: String, reason: String },

    /// The host allocator or destination buffer ran out of room.
    #[error("resource exhaustion: {0}")]
    ResourceExhausted(String),

    /// A collaborator (storage, config) failed to produce what the engine
    /// asked for; the affected entry should be disabled, not the whole run.
    #[error("collaborator failure for {identifier} ({comment}): {reason}")]
    Collaborator {
        identifier: String,
        comment: String,
        reason: String,
    },
}

impl Error {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Error::Malformed(msg.into())
    }

    pub fn unsatisfiable(class: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::UnsatisfiableLink {
            class: class.into(),
            reason: reason.into(),
        }
    }

    pub fn collaborator(
        identifier: impl Into<String>,
        comment: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::Collaborator {
            identifier: identifier.into(),
            comment: comment.into(),
            reason: reason.into(),
        }
    }
}
