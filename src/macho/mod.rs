//! A zero-copy, bounds-checked 64-bit Mach-O reader.
//!
//! [`MachContext`] borrows a byte buffer and never trusts a single field in
//! it: every accessor re-validates the range it is about to hand back
//! against the buffer it borrowed from, so a caller holding a non-null
//! result from any of them can trust it completely.

pub mod constants;
pub mod fat;
pub mod header;
pub mod load_command;
pub mod relocation;
pub mod symtab;

use crate::error::{Error, Result};
use header::Header64;
use load_command::{CommandVariant, LoadCommand, SegmentCommand64, Section64};
use relocation::RelocationInfo;
use symtab::{DynamicSymbolInfo, SymbolTable};

/// The root handle onto a single parsed Mach-O image. Owns nothing; borrows
/// the buffer it was built from for its entire lifetime.
pub struct MachContext<'a> {
    pub buffer: &'a [u8],
    pub header: Header64,
    pub load_commands: Vec<LoadCommand>,
    symbols: Option<SymbolTable<'a>>,
    dynamic: Option<DynamicSymbolInfo>,
}

impl<'a> MachContext<'a> {
    /// Parses `buffer` as a standalone (non-fat) Mach-O image: validates
    /// the header, then every load command in turn, accumulating their
    /// sizes and comparing the total against `sizeofcmds`. No partial
    /// context is ever returned.
    pub fn parse(buffer: &'a [u8]) -> Result<Self> {
        let header = Header64::parse(buffer)?;

        let mut load_commands = Vec::with_capacity(header.ncmds as usize);
        let mut offset = header.size();
        let mut total_size = 0usize;

        for _ in 0..header.ncmds {
            let lc = LoadCommand::parse(buffer, offset)?;
            total_size += lc.cmdsize;
            offset += lc.cmdsize;
            load_commands.push(lc);
        }

        if total_size != header.sizeofcmds as usize {
            return Err(Error::malformed(format!(
                "sum of load command sizes ({total_size}) does not match sizeofcmds ({})",
                header.sizeofcmds
            )));
        }
        if header.size() + total_size > buffer.len() {
            return Err(Error::malformed("load commands overrun the buffer"));
        }

        let mut ctx = MachContext {
            buffer,
            header,
            load_commands,
            symbols: None,
            dynamic: None,
        };
        ctx.cache_symbol_tables()?;
        Ok(ctx)
    }

    /// Unwraps a fat wrapper if present, then parses the x86_64 slice.
    pub fn parse_maybe_fat(buffer: &'a [u8]) -> Result<Self> {
        let slice = fat::unwrap_fat(buffer)?;
        Self::parse(slice)
    }

    pub fn file_size(&self) -> usize {
        self.buffer.len()
    }

    fn cache_symbol_tables(&mut self) -> Result<()> {
        let symtab_cmd = self.load_commands.iter().find_map(|lc| match &lc.command {
            CommandVariant::Symtab(s) => Some(*s),
            _ => None,
        });
        if let Some(symtab) = symtab_cmd {
            self.symbols = Some(SymbolTable::parse(self.buffer, &symtab)?);
        }

        if self.header.is_dyld_linked() {
            if let Some(dysymtab) = self.load_commands.iter().find_map(|lc| match &lc.command {
                CommandVariant::Dysymtab(d) => Some(*d),
                _ => None,
            }) {
                let info = DynamicSymbolInfo::from(&dysymtab);
                let end = info
                    .indirect_symoff
                    .checked_add(info.nindirectsyms.saturating_mul(4))
                    .ok_or_else(|| Error::malformed("indirect symbol table overflows"))?;
                if end > self.buffer.len() {
                    return Err(Error::malformed("indirect symbol table runs past end of file"));
                }
                self.dynamic = Some(info);
            }
        }
        Ok(())
    }

    pub fn symbols(&self) -> Option<&SymbolTable<'a>> {
        self.symbols.as_ref()
    }

    pub fn dynamic_symbol_info(&self) -> Option<&DynamicSymbolInfo> {
        self.dynamic.as_ref()
    }

    /// Iterates segments in load-command order. `prev` is the
    /// previously-returned segment's command offset, or `None` to start
    /// from the beginning.
    pub fn next_segment(&self, prev: Option<usize>) -> Option<&SegmentCommand64> {
        let mut found_prev = prev.is_none();
        for lc in &self.load_commands {
            if let CommandVariant::Segment64(seg, _) = &lc.command {
                if found_prev {
                    return Some(seg);
                }
                if Some(lc.offset) == prev {
                    found_prev = true;
                }
            }
        }
        None
    }

    pub fn segments(&self) -> impl Iterator<Item = &SegmentCommand64> {
        self.load_commands.iter().filter_map(|lc| match &lc.command {
            CommandVariant::Segment64(seg, _) => Some(seg),
            _ => None,
        })
    }

    pub fn get_segment_by_name(&self, name: &str) -> Option<&SegmentCommand64> {
        self.segments().find(|seg| seg.name().ok() == Some(name))
    }

    pub fn sections_of(&self, segment: &SegmentCommand64) -> &[Section64] {
        for lc in &self.load_commands {
            if let CommandVariant::Segment64(seg, sections) = &lc.command {
                if core::ptr::eq(seg, segment) {
                    return sections;
                }
            }
        }
        &[]
    }

    pub fn next_section<'b>(
        &'b self,
        segment: &'b SegmentCommand64,
        prev: Option<usize>,
    ) -> Option<(usize, &'b Section64)> {
        let sections = self.sections_of(segment);
        let start = prev.map(|i| i + 1).unwrap_or(0);
        sections.get(start).map(|s| (start, s))
    }

    pub fn get_section_by_name(&self, segname: &str, sectname: &str) -> Option<&Section64> {
        for seg in self.segments() {
            if seg.name().ok() != Some(segname) {
                continue;
            }
            for section in self.sections_of(seg) {
                if section.name().ok() == Some(sectname) {
                    return Some(section);
                }
            }
        }
        None
    }

    pub fn get_section_by_index(&self, index: usize) -> Option<&Section64> {
        let mut i = 1usize; // section indices are 1-based; NO_SECT is 0
        for seg in self.segments() {
            for section in self.sections_of(seg) {
                if i == index {
                    return Some(section);
                }
                i += 1;
            }
        }
        None
    }

    pub fn get_section_by_address(&self, addr: u64) -> Option<&Section64> {
        for seg in self.segments() {
            for section in self.sections_of(seg) {
                if addr >= section.addr && addr < section.addr + section.size {
                    return Some(section);
                }
            }
        }
        None
    }

    /// Finds the segment containing virtual address `addr` and converts it
    /// to a file offset, returning the offset plus the number of
    /// contiguous bytes remaining from there to the end of the segment's
    /// file data.
    pub fn file_offset_from_va(&self, addr: u64) -> Option<(usize, usize)> {
        for seg in self.segments() {
            if addr >= seg.vmaddr && addr < seg.vmaddr + seg.vmsize {
                let delta = addr - seg.vmaddr;
                if delta >= seg.filesize {
                    // lands in the zero-filled tail; no file bytes back it.
                    return None;
                }
                let file_off = (seg.fileoff + delta) as usize;
                let remaining = (seg.filesize - delta) as usize;
                return Some((file_off, remaining));
            }
        }
        None
    }

    /// Slices `len` bytes at virtual address `addr`, bounds-checked against
    /// both the owning segment and the underlying buffer.
    pub fn bytes_at_va(&self, addr: u64, len: usize) -> Result<&'a [u8]> {
        let (off, remaining) = self
            .file_offset_from_va(addr)
            .ok_or_else(|| Error::malformed(format!("address {addr:#x} is not backed by any segment")))?;
        if len > remaining {
            return Err(Error::malformed(format!(
                "requested {len} bytes at {addr:#x} but only {remaining} remain in segment"
            )));
        }
        self.buffer
            .get(off..off + len)
            .ok_or_else(|| Error::malformed("slice at VA runs past end of buffer"))
    }

    /// Relocations belonging to the section that contains virtual address
    /// `addr`, if any.
    pub fn relocations_for_address(&self, addr: u64) -> Result<Vec<RelocationInfo>> {
        match self.get_section_by_address(addr) {
            Some(section) if section.nreloc > 0 => {
                relocation::read_relocations(self.buffer, section.reloff as usize, section.nreloc as usize)
                    .map_err(Error::from)
            }
            _ => Ok(Vec::new()),
        }
    }
}
