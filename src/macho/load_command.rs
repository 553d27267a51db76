//! Load commands, modelled as a sum type dispatched by the `cmd` tag.
//!
//! Only the commands this engine actually inspects get their own variant;
//! everything else becomes [`CommandVariant::Unsupported`] but is still
//! tracked so the strip pass can find and remove it by tag.

use scroll::{Pread, Pwrite, SizeWith};

use super::constants::*;
use crate::error::{Error, Result};

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct LoadCommandHeader {
    pub cmd: u32,
    pub cmdsize: u32,
}

pub const SIZEOF_LOAD_COMMAND: usize = 8;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct Section64 {
    pub sectname: [u8; 16],
    pub segname: [u8; 16],
    pub addr: u64,
    pub size: u64,
    pub offset: u32,
    pub align: u32,
    pub reloff: u32,
    pub nreloc: u32,
    pub flags: u32,
    pub reserved1: u32,
    pub reserved2: u32,
    pub reserved3: u32,
}

pub const SIZEOF_SECTION_64: usize = 80;

impl Section64 {
    pub fn name(&self) -> Result<&str> {
        cstr16(&self.sectname)
    }

    pub fn segname(&self) -> Result<&str> {
        cstr16(&self.segname)
    }

    pub fn section_type(&self) -> u32 {
        self.flags & SECTION_TYPE
    }

    pub fn is_zerofill(&self) -> bool {
        self.section_type() == S_ZEROFILL
    }
}

fn cstr16(bytes: &[u8; 16]) -> Result<&str> {
    let len = bytes.iter().position(|&b| b == 0).unwrap_or(16);
    core::str::from_utf8(&bytes[..len]).map_err(|_| Error::malformed("non-UTF8 segment/section name"))
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct SegmentCommand64 {
    pub segname: [u8; 16],
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub maxprot: u32,
    pub initprot: u32,
    pub nsects: u32,
    pub flags: u32,
}

pub const SIZEOF_SEGMENT_COMMAND_64: usize = 64;

impl SegmentCommand64 {
    pub fn name(&self) -> Result<&str> {
        cstr16(&self.segname)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct SymtabCommand {
    pub symoff: u32,
    pub nsyms: u32,
    pub stroff: u32,
    pub strsize: u32,
}

pub const SIZEOF_SYMTAB_COMMAND: usize = 16;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct DysymtabCommand {
    pub ilocalsym: u32,
    pub nlocalsym: u32,
    pub iextdefsym: u32,
    pub nextdefsym: u32,
    pub iundefsym: u32,
    pub nundefsym: u32,
    pub tocoff: u32,
    pub ntoc: u32,
    pub modtaboff: u32,
    pub nmodtab: u32,
    pub extrefsymoff: u32,
    pub nextrefsyms: u32,
    pub indirectsymoff: u32,
    pub nindirectsyms: u32,
    pub extreloff: u32,
    pub nextrel: u32,
    pub locreloff: u32,
    pub nlocrel: u32,
}

pub const SIZEOF_DYSYMTAB_COMMAND: usize = 72;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct UuidCommand {
    pub uuid: [u8; 16],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct EntryPointCommand {
    pub entryoff: u64,
    pub stacksize: u64,
}

/// Tagged union of the load commands this engine recognises. Every variant
/// carries the command's own body (the shared `cmd`/`cmdsize` header is kept
/// alongside it in [`LoadCommand`]).
#[derive(Debug, Clone)]
pub enum CommandVariant {
    Segment64(SegmentCommand64, Vec<Section64>),
    Symtab(SymtabCommand),
    Dysymtab(DysymtabCommand),
    Uuid(UuidCommand),
    UnixThread,
    Main(EntryPointCommand),
    /// One of the load commands the expander strips when asked to.
    Strippable,
    /// Anything else; copied through verbatim, never interpreted.
    Unsupported,
}

impl CommandVariant {
    /// Whether this command belongs to the set the image expander strips:
    /// code signature, dyld info (both variants), function starts,
    /// data-in-code, and dylib code-sign DRs.
    pub fn is_strippable(tag: u32) -> bool {
        matches!(
            tag,
            LC_CODE_SIGNATURE
                | LC_DYLD_INFO
                | LC_DYLD_INFO_ONLY
                | LC_FUNCTION_STARTS
                | LC_DATA_IN_CODE
                | LC_DYLIB_CODE_SIGN_DRS
        )
    }
}

#[derive(Debug, Clone)]
pub struct LoadCommand {
    /// Offset of this command's header within the Mach-O buffer.
    pub offset: usize,
    pub cmd: u32,
    pub cmdsize: usize,
    pub command: CommandVariant,
}

impl LoadCommand {
    /// Parses one load command at `offset`. Does not advance `offset`
    /// itself; the caller is expected to do so by `cmdsize` once this
    /// returns, mirroring the enumeration contract of the rest of the
    /// reader.
    pub fn parse(buffer: &[u8], offset: usize) -> Result<Self> {
        let lc: LoadCommandHeader = buffer.pread_with(offset, scroll::LE)?;
        let cmdsize = lc.cmdsize as usize;

        if cmdsize < SIZEOF_LOAD_COMMAND {
            return Err(Error::malformed(format!(
                "load command at {offset:#x} has size {cmdsize} smaller than its header"
            )));
        }
        if cmdsize % 8 != 0 {
            return Err(Error::malformed(format!(
                "load command at {offset:#x} has size {cmdsize} not a multiple of 8"
            )));
        }
        let end = offset
            .checked_add(cmdsize)
            .ok_or_else(|| Error::malformed("load command size overflows"))?;
        if end > buffer.len() {
            return Err(Error::malformed(format!(
                "load command at {offset:#x} overruns the buffer"
            )));
        }

        let body_off = offset + SIZEOF_LOAD_COMMAND;
        let command = match lc.cmd {
            LC_SEGMENT_64 => {
                let seg: SegmentCommand64 = buffer.pread_with(body_off, scroll::LE)?;
                let nsects = seg.nsects as usize;
                let mut sections = Vec::with_capacity(nsects);
                let mut soff = body_off + SIZEOF_SEGMENT_COMMAND_64;
                for _ in 0..nsects {
                    let section: Section64 = buffer.pread_with(soff, scroll::LE)?;
                    sections.push(section);
                    soff += SIZEOF_SECTION_64;
                }
                if soff > end {
                    return Err(Error::malformed(format!(
                        "segment {:?} section array overruns its own command",
                        seg.name()
                    )));
                }
                CommandVariant::Segment64(seg, sections)
            }
            LC_SYMTAB => CommandVariant::Symtab(buffer.pread_with(body_off, scroll::LE)?),
            LC_DYSYMTAB => CommandVariant::Dysymtab(buffer.pread_with(body_off, scroll::LE)?),
            LC_UUID => CommandVariant::Uuid(buffer.pread_with(body_off, scroll::LE)?),
            LC_UNIXTHREAD | LC_THREAD => CommandVariant::UnixThread,
            LC_MAIN => CommandVariant::Main(buffer.pread_with(body_off, scroll::LE)?),
            tag if CommandVariant::is_strippable(tag) => CommandVariant::Strippable,
            _ => CommandVariant::Unsupported,
        };

        Ok(LoadCommand {
            offset,
            cmd: lc.cmd,
            cmdsize,
            command,
        })
    }
}

