//! Rewrites a Mach-O whose segments are tightly packed in file order into
//! one whose file layout matches its in-memory layout: file offsets become
//! page-aligned and every segment's file size equals its virtual size, so
//! a single `mmap`-equivalent of the file reproduces the runtime image.

use scroll::Pwrite;

use crate::error::{Error, Result};
use crate::macho::constants::{SEG_LINKEDIT, X86_PAGE_SIZE};
use crate::macho::load_command::{CommandVariant, SIZEOF_LOAD_COMMAND, SIZEOF_SECTION_64, SIZEOF_SEGMENT_COMMAND_64};
use crate::macho::MachContext;

fn to_u32(value: u64, what: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::malformed(format!("{what} overflows a 32-bit field")))
}

/// Expands `ctx` into `dest`, returning the number of bytes written.
/// When `strip` is set, load commands that no longer describe valid data
/// after expansion (code signature, dyld info, function starts,
/// data-in-code, dylib code-sign DRs) are compacted out.
pub fn expand(ctx: &MachContext, dest: &mut [u8], strip: bool) -> Result<usize> {
    let header_region_len = ctx.header.size() + ctx.header.sizeofcmds as usize;
    if dest.len() < header_region_len {
        return Err(Error::ResourceExhausted("destination too small for header and load commands".into()));
    }
    dest[..header_region_len].copy_from_slice(&ctx.buffer[..header_region_len]);

    let has_segments = ctx.segments().next().is_some();
    let total_size = if has_segments {
        expand_segments(ctx, dest, header_region_len)?
    } else {
        // Kernel-resource kexts carry their whole payload outside any
        // segment; there is nothing to re-lay-out, so copy the file as-is.
        let file_size = ctx.file_size();
        if file_size > dest.len() {
            return Err(Error::ResourceExhausted("destination too small for raw fallback copy".into()));
        }
        dest[header_region_len..file_size].copy_from_slice(&ctx.buffer[header_region_len..file_size]);
        file_size
    };

    if strip {
        strip_load_commands(ctx, dest)?;
    }

    Ok(total_size)
}

fn expand_segments(ctx: &MachContext, dest: &mut [u8], header_region_len: usize) -> Result<usize> {
    let first = ctx
        .segments()
        .next()
        .ok_or_else(|| Error::malformed("expand_segments called with no segments"))?;
    let base_relation = first
        .vmaddr
        .checked_sub(first.fileoff)
        .ok_or_else(|| Error::malformed("first segment's file offset exceeds its virtual address"))?;

    let mut total_size = header_region_len;

    for lc in &ctx.load_commands {
        let CommandVariant::Segment64(seg, sections) = &lc.command else {
            continue;
        };

        if seg.filesize > seg.vmsize {
            return Err(Error::malformed(format!(
                "segment {:?} has file size larger than virtual size",
                seg.name()
            )));
        }

        let new_foff = seg
            .vmaddr
            .checked_sub(base_relation)
            .ok_or_else(|| Error::malformed("segment virtual address precedes the base relation"))?;
        if new_foff % X86_PAGE_SIZE != 0 {
            return Err(Error::malformed(format!(
                "expanded file offset {new_foff:#x} for segment {:?} is not page-aligned",
                seg.name()
            )));
        }
        let delta = new_foff
            .checked_sub(seg.fileoff)
            .ok_or_else(|| Error::malformed("segment would need to shrink during expansion"))?;

        // Do not re-copy the header/load-command region already written.
        let (copy_foff, copy_fsize, copy_vmsize) = if seg.fileoff <= header_region_len as u64 {
            let cfo = header_region_len as u64;
            let cfs = seg
                .filesize
                .checked_sub(cfo)
                .ok_or_else(|| Error::malformed("header does not fit inside the first segment"))?;
            let cvs = seg
                .vmsize
                .checked_sub(cfo)
                .ok_or_else(|| Error::malformed("header does not fit inside the first segment"))?;
            (cfo, cfs, cvs)
        } else {
            (seg.fileoff, seg.filesize, seg.vmsize)
        };

        let dest_off = (copy_foff + delta) as usize;
        let end = dest_off
            .checked_add(copy_vmsize as usize)
            .ok_or_else(|| Error::malformed("segment copy range overflows"))?;
        if end > dest.len() {
            return Err(Error::ResourceExhausted(format!(
                "destination too small to expand segment {:?}",
                seg.name()
            )));
        }
        total_size = total_size.max(end);

        let src_off = copy_foff as usize;
        let data_end = dest_off + copy_fsize as usize;
        dest[dest_off..data_end].copy_from_slice(&ctx.buffer[src_off..src_off + copy_fsize as usize]);
        for b in &mut dest[data_end..end] {
            *b = 0;
        }

        let body_off = lc.offset + SIZEOF_LOAD_COMMAND;
        let mut mutated_seg = *seg;
        mutated_seg.fileoff = new_foff;
        mutated_seg.filesize = mutated_seg.vmsize;
        dest.pwrite_with(body_off, mutated_seg, scroll::LE)?;

        if seg.name().ok() == Some(SEG_LINKEDIT) {
            rewrite_linkedit_tables(ctx, dest, delta)?;
        }

        let sect_base_off = body_off + SIZEOF_SEGMENT_COMMAND_64;
        let mut section_delta = delta;
        let mut cursor = seg.fileoff;
        for (i, sect) in sections.iter().enumerate() {
            let mut mutated_sect = *sect;
            let new_offset = if sect.offset == 0 {
                let off = cursor + section_delta;
                section_delta += sect.size;
                off
            } else {
                let off = sect.offset as u64 + section_delta;
                cursor = off + sect.size;
                off
            };
            mutated_sect.offset = to_u32(new_offset, "section file offset")?;
            let sect_off = sect_base_off + i * SIZEOF_SECTION_64;
            dest.pwrite_with(sect_off, mutated_sect, scroll::LE)?;
        }
    }

    Ok(total_size)
}

/// Shifts the symtab/dysymtab offset fields living in `__LINKEDIT` by
/// `delta`. Mirrors an oddity in the tool this engine's design is modeled
/// on: the dynamic symbol table's *count* of table-of-contents entries is
/// bumped here too, not just its offset fields. Kept unchanged rather than
/// "fixed" absent evidence this was ever anything but intentional.
fn rewrite_linkedit_tables(ctx: &MachContext, dest: &mut [u8], delta: u64) -> Result<()> {
    for lc in &ctx.load_commands {
        match &lc.command {
            CommandVariant::Symtab(s) => {
                let body_off = lc.offset + SIZEOF_LOAD_COMMAND;
                let mut mutated = *s;
                let delta32 = to_u32(delta, "symtab delta")?;
                if mutated.symoff != 0 {
                    mutated.symoff += delta32;
                }
                if mutated.stroff != 0 {
                    mutated.stroff += delta32;
                }
                dest.pwrite_with(body_off, mutated, scroll::LE)?;
            }
            CommandVariant::Dysymtab(d) => {
                let body_off = lc.offset + SIZEOF_LOAD_COMMAND;
                let mut mutated = *d;
                let delta32 = to_u32(delta, "dysymtab delta")?;
                if mutated.ntoc != 0 {
                    mutated.ntoc += delta32;
                }
                if mutated.modtaboff != 0 {
                    mutated.modtaboff += delta32;
                }
                if mutated.extrefsymoff != 0 {
                    mutated.extrefsymoff += delta32;
                }
                if mutated.indirectsymoff != 0 {
                    mutated.indirectsymoff += delta32;
                }
                if mutated.extreloff != 0 {
                    mutated.extreloff += delta32;
                }
                if mutated.locreloff != 0 {
                    mutated.locreloff += delta32;
                }
                dest.pwrite_with(body_off, mutated, scroll::LE)?;
            }
            _ => {}
        }
    }
    Ok(())
}

/// Compacts out every strippable load command, decrementing the header's
/// command count and total command size and zeroing the freed tail.
fn strip_load_commands(ctx: &MachContext, dest: &mut [u8]) -> Result<()> {
    let mut write_off = ctx.header.size();
    let mut new_ncmds = 0u32;
    let mut new_cmdsize = 0u32;

    for lc in &ctx.load_commands {
        if matches!(lc.command, CommandVariant::Strippable) {
            continue;
        }
        if write_off != lc.offset {
            dest.copy_within(lc.offset..lc.offset + lc.cmdsize, write_off);
        }
        write_off += lc.cmdsize;
        new_ncmds += 1;
        new_cmdsize += lc.cmdsize as u32;
    }

    let tail_end = ctx.header.size() + ctx.header.sizeofcmds as usize;
    if tail_end > write_off {
        for b in &mut dest[write_off..tail_end] {
            *b = 0;
        }
    }

    let mut header = ctx.header;
    header.ncmds = new_ncmds;
    header.sizeofcmds = new_cmdsize;
    dest.pwrite_with(0, header, scroll::LE)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macho::constants::{cputype, MH_EXECUTE, MH_MAGIC_64};
    use crate::macho::load_command::{LoadCommandHeader, SegmentCommand64};
    use scroll::Pwrite;

    const LC_SEGMENT_64: u32 = 0x19;

    /// Builds a minimal two-segment Mach-O: `__TEXT` (vaddr 0, vsize 0x1000,
    /// fsize 0x1000, foff 0) and `__DATA` (vaddr 0x2000, vsize 0x2000, fsize
    /// 0x1000, foff 0x1000), matching the expansion worked example.
    fn two_segment_image() -> Vec<u8> {
        let header_len = 32usize;
        let cmd_len = SIZEOF_LOAD_COMMAND + SIZEOF_SEGMENT_COMMAND_64;
        let cmds_size = cmd_len * 2;
        let mut buf = vec![0u8; header_len + cmds_size + 0x2000];

        buf.pwrite_with(
            0,
            crate::macho::header::Header64 {
                magic: MH_MAGIC_64,
                cputype: cputype::CPU_TYPE_X86_64,
                cpusubtype: 0,
                filetype: MH_EXECUTE,
                ncmds: 2,
                sizeofcmds: cmds_size as u32,
                flags: 0,
                reserved: 0,
            },
            scroll::LE,
        )
        .unwrap();

        let mut off = header_len;
        buf.pwrite_with(off, LoadCommandHeader { cmd: LC_SEGMENT_64, cmdsize: cmd_len as u32 }, scroll::LE)
            .unwrap();
        buf.pwrite_with(
            off + SIZEOF_LOAD_COMMAND,
            SegmentCommand64 {
                segname: {
                    let mut n = [0u8; 16];
                    n[..6].copy_from_slice(b"__TEXT");
                    n
                },
                vmaddr: 0x0,
                vmsize: 0x1000,
                fileoff: 0x0,
                filesize: 0x1000,
                maxprot: 7,
                initprot: 7,
                nsects: 0,
                flags: 0,
            },
            scroll::LE,
        )
        .unwrap();
        off += cmd_len;

        buf.pwrite_with(off, LoadCommandHeader { cmd: LC_SEGMENT_64, cmdsize: cmd_len as u32 }, scroll::LE)
            .unwrap();
        buf.pwrite_with(
            off + SIZEOF_LOAD_COMMAND,
            SegmentCommand64 {
                segname: {
                    let mut n = [0u8; 16];
                    n[..6].copy_from_slice(b"__DATA");
                    n
                },
                vmaddr: 0x2000,
                vmsize: 0x2000,
                fileoff: 0x1000,
                filesize: 0x1000,
                maxprot: 7,
                initprot: 7,
                nsects: 0,
                flags: 0,
            },
            scroll::LE,
        )
        .unwrap();

        // Mark DATA's source file bytes [0x1000, 0x2000) with a distinct pattern.
        for b in buf[0x1000..0x2000].iter_mut() {
            *b = 0xAB;
        }
        buf
    }

    #[test]
    fn expands_two_segments_per_worked_example() {
        let source = two_segment_image();
        let ctx = MachContext::parse(&source).unwrap();

        let mut dest = vec![0u8; 0x4000];
        let written = expand(&ctx, &mut dest, false).unwrap();
        assert_eq!(written, 0x4000);

        let expanded = MachContext::parse(&dest[..written]).unwrap();
        let text = expanded.get_segment_by_name("__TEXT").unwrap();
        let data = expanded.get_segment_by_name("__DATA").unwrap();

        assert_eq!(text.fileoff, 0x0);
        assert_eq!(text.filesize, 0x1000);
        assert_eq!(data.fileoff, 0x2000);
        assert_eq!(data.filesize, 0x2000);
        assert_eq!(text.vmaddr - text.fileoff, data.vmaddr - data.fileoff);

        assert!(dest[0x2000..0x3000].iter().all(|&b| b == 0xAB));
        assert!(dest[0x3000..0x4000].iter().all(|&b| b == 0));
    }
}
