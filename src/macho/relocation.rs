//! Relocation entries, needed only to tell a genuine zero vtable terminator
//! from a zero slot that is actually relocation-driven (i.e. still needs a
//! symbol bound into it by the vtable linker).

use scroll::{Pread, Pwrite, SizeWith};

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct RelocationInfo {
    pub r_address: i32,
    pub r_info: u32,
}

pub const SIZEOF_RELOCATION_INFO: usize = 8;

impl RelocationInfo {
    #[inline(always)]
    pub fn is_extern(&self) -> bool {
        (self.r_info >> 27) & 0x1 != 0
    }

    #[inline(always)]
    pub fn symbolnum(&self) -> u32 {
        self.r_info & 0x00ff_ffff
    }
}

/// Reads `count` relocation entries starting at `offset`.
pub fn read_relocations(buffer: &[u8], offset: usize, count: usize) -> scroll::Result<Vec<RelocationInfo>> {
    let mut out = Vec::with_capacity(count);
    let mut off = offset;
    for _ in 0..count {
        out.push(buffer.pread_with(off, scroll::LE)?);
        off += SIZEOF_RELOCATION_INFO;
    }
    Ok(out)
}

/// The external relocation in `relocs` that targets the byte offset
/// `section_relative_offset` within the section they belong to, if any.
pub fn external_relocation_at(relocs: &[RelocationInfo], section_relative_offset: i64) -> Option<&RelocationInfo> {
    relocs
        .iter()
        .find(|r| r.is_extern() && r.r_address as i64 == section_relative_offset)
}
