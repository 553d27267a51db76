//! The 64-bit Mach-O header.

use scroll::{Pread, Pwrite, SizeWith};

use super::constants::*;
use crate::error::{Error, Result};

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct Header64 {
    pub magic: u32,
    pub cputype: u32,
    pub cpusubtype: u32,
    pub filetype: u32,
    pub ncmds: u32,
    pub sizeofcmds: u32,
    pub flags: u32,
    pub reserved: u32,
}

pub const SIZEOF_HEADER_64: usize = 32;

impl Header64 {
    /// Parses and validates the header: magic, CPU type and file type must
    /// all match what this engine supports. No partial header is ever
    /// returned; failures are hard.
    pub fn parse(buffer: &[u8]) -> Result<Self> {
        let header: Header64 = buffer
            .pread_with(0, scroll::LE)
            .map_err(|_| Error::malformed("buffer too small for a Mach-O header"))?;

        if header.magic != MH_MAGIC_64 {
            return Err(Error::malformed(format!(
                "bad magic: {:#x}",
                header.magic
            )));
        }
        if header.cputype != cputype::CPU_TYPE_X86_64 {
            return Err(Error::malformed(format!(
                "unsupported cputype: {:#x} (only x86_64 is supported)",
                header.cputype
            )));
        }
        if header.filetype != MH_EXECUTE && header.filetype != MH_KEXT_BUNDLE {
            return Err(Error::malformed(format!(
                "unsupported filetype: {:#x} (only MH_EXECUTE and MH_KEXT_BUNDLE are supported)",
                header.filetype
            )));
        }
        Ok(header)
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        SIZEOF_HEADER_64
    }

    #[inline(always)]
    pub fn is_dyld_linked(&self) -> bool {
        self.flags & MH_DYLDLINK != 0
    }
}
