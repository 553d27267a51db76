//! Generic pattern-match find/replace, with optional masks, used for both
//! kernel-wide patches and per-kext patches.
//!
//! A [`Patch`] describes *what* to look for and what to put in its place;
//! [`apply`] describes *where*: it owns the scan loop, the skip/count/limit
//! bookkeeping, and the symbolic-base restriction.

use crate::error::{Error, Result};

/// One configured find/replace rule. Mirrors the wire shape of a
/// `Kernel.Patch[]` entry once its `identifier`/version window have
/// already been checked by the caller.
#[derive(Debug, Clone)]
pub struct Patch {
    pub find: Vec<u8>,
    pub replace: Vec<u8>,
    pub find_mask: Option<Vec<u8>>,
    pub replace_mask: Option<Vec<u8>>,
    /// Symbol name to resolve as the search base; `None` means search the
    /// whole buffer from offset 0.
    pub base: Option<String>,
    /// Maximum number of matches to apply; 0 means unlimited.
    pub count: usize,
    /// Number of leading matches to skip before applying any.
    pub skip: usize,
    /// Maximum distance from the base to search; 0 means unbounded.
    pub limit: usize,
}

impl Patch {
    /// Validates the shape invariants a malformed config can violate:
    /// replace must match find's length unless the mask machinery allows
    /// otherwise, and any mask present must match find's length exactly.
    pub fn validate(&self) -> Result<()> {
        if self.find.is_empty() {
            return Err(Error::malformed("patch find pattern is empty"));
        }
        if self.replace.len() != self.find.len() {
            return Err(Error::malformed("patch replace length does not match find length"));
        }
        if let Some(mask) = &self.find_mask {
            if mask.len() != self.find.len() {
                return Err(Error::malformed("patch find-mask length does not match find length"));
            }
        }
        if let Some(mask) = &self.replace_mask {
            if mask.len() != self.replace.len() {
                return Err(Error::malformed("patch replace-mask length does not match replace length"));
            }
        }
        Ok(())
    }
}

/// Compares `buf[at..at+find.len()]` against `find`, honouring `mask` when
/// present: a mask bit of 0 means "don't care" at that byte.
fn matches_at(buf: &[u8], at: usize, find: &[u8], mask: Option<&[u8]>) -> bool {
    if at + find.len() > buf.len() {
        return false;
    }
    let window = &buf[at..at + find.len()];
    match mask {
        Some(mask) => window
            .iter()
            .zip(find)
            .zip(mask)
            .all(|((&b, &f), &m)| (b & m) == (f & m)),
        None => window == find,
    }
}

fn write_at(buf: &mut [u8], at: usize, replace: &[u8], mask: Option<&[u8]>) {
    let window = &mut buf[at..at + replace.len()];
    match mask {
        Some(mask) => {
            for ((b, &r), &m) in window.iter_mut().zip(replace).zip(mask) {
                *b = (*b & !m) | (r & m);
            }
        }
        None => window.copy_from_slice(replace),
    }
}

/// Applies `patch` to `buf`, searching from `base_offset` (the resolved
/// symbolic base, or 0) and returns the number of matches patched.
/// `validate` is assumed to have already been called.
pub fn apply(buf: &mut [u8], patch: &Patch, base_offset: usize) -> Result<usize> {
    let search_end = if patch.limit == 0 {
        buf.len()
    } else {
        (base_offset + patch.limit).min(buf.len())
    };

    let mut applied = 0usize;
    let mut skipped = 0usize;
    let mut pos = base_offset;

    while pos < search_end {
        if matches_at(buf, pos, &patch.find, patch.find_mask.as_deref()) {
            if skipped < patch.skip {
                skipped += 1;
                pos += 1;
                continue;
            }
            write_at(buf, pos, &patch.replace, patch.replace_mask.as_deref());
            applied += 1;
            pos += patch.find.len();
            if patch.count != 0 && applied >= patch.count {
                break;
            }
            continue;
        }
        pos += 1;
    }

    Ok(applied)
}
