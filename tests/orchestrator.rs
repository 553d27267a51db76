//! End-to-end pipeline tests: build a minimal synthetic kernel by hand
//! (header + `__TEXT` + `__PRELINK_INFO` segments, each with one section)
//! and drive it through [`Orchestrator::process`], the way
//! `expander`'s own tests build a minimal Mach-O rather than depending on
//! a fixture binary.

use scroll::Pwrite;

use prelink_engine::config::{KernelConfig, PatchEntry};
use prelink_engine::macho::constants::{cputype, MH_EXECUTE, MH_MAGIC_64};
use prelink_engine::macho::header::Header64;
use prelink_engine::macho::load_command::{
    LoadCommandHeader, Section64, SegmentCommand64, SIZEOF_LOAD_COMMAND, SIZEOF_SECTION_64,
    SIZEOF_SEGMENT_COMMAND_64,
};
use prelink_engine::orchestrator::{CpuInfo, Orchestrator};
use prelink_engine::storage::MemoryStorage;

const LC_SEGMENT_64: u32 = 0x19;

fn name16(s: &str) -> [u8; 16] {
    let mut n = [0u8; 16];
    n[..s.len()].copy_from_slice(s.as_bytes());
    n
}

/// A two-segment kernel: `__TEXT` carries the Darwin version marker plus a
/// four-byte target for a kernel-wide patch; `__PRELINK_INFO` carries an
/// `__info` section holding a minimal plist with an empty
/// `_PrelinkInfoDictionary` array. Returns the buffer and the file offset
/// of the patch target.
fn synthetic_kernel() -> (Vec<u8>, usize) {
    let header_len = 32usize;
    let cmd_len = SIZEOF_LOAD_COMMAND + SIZEOF_SEGMENT_COMMAND_64 + SIZEOF_SECTION_64;
    let cmds_size = cmd_len * 2;

    let text_fileoff = header_len + cmds_size;
    let text_size = 0x200usize;
    let info_fileoff = text_fileoff + text_size;
    let info_size = 0x400usize;
    let total = info_fileoff + info_size;

    let mut buf = vec![0u8; total];

    buf.pwrite_with(
        0,
        Header64 {
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
            segname: name16("__TEXT"),
            vmaddr: 0x1000,
            vmsize: text_size as u64,
            fileoff: text_fileoff as u64,
            filesize: text_size as u64,
            maxprot: 7,
            initprot: 7,
            nsects: 1,
            flags: 0,
        },
        scroll::LE,
    )
    .unwrap();
    buf.pwrite_with(
        off + SIZEOF_LOAD_COMMAND + SIZEOF_SEGMENT_COMMAND_64,
        Section64 {
            sectname: name16("__text"),
            segname: name16("__TEXT"),
            addr: 0x1000,
            size: text_size as u64,
            offset: text_fileoff as u32,
            align: 0,
            reloff: 0,
            nreloc: 0,
            flags: 0,
            reserved1: 0,
            reserved2: 0,
            reserved3: 0,
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
            segname: name16("__PRELINK_INFO"),
            vmaddr: 0x2000,
            vmsize: info_size as u64,
            fileoff: info_fileoff as u64,
            filesize: info_size as u64,
            maxprot: 7,
            initprot: 7,
            nsects: 1,
            flags: 0,
        },
        scroll::LE,
    )
    .unwrap();
    buf.pwrite_with(
        off + SIZEOF_LOAD_COMMAND + SIZEOF_SEGMENT_COMMAND_64,
        Section64 {
            sectname: name16("__info"),
            segname: name16("__PRELINK_INFO"),
            addr: 0x2000,
            size: info_size as u64,
            offset: info_fileoff as u32,
            align: 0,
            reloff: 0,
            nreloc: 0,
            flags: 0,
            reserved1: 0,
            reserved2: 0,
            reserved3: 0,
        },
        scroll::LE,
    )
    .unwrap();

    let marker = b"Darwin Kernel Version 19.6.0: Mon Aug 31 22:12:52 PDT 2020; root:xnu\0";
    buf[text_fileoff..text_fileoff + marker.len()].copy_from_slice(marker);

    let patch_target_offset = text_fileoff + marker.len() + 16;
    buf[patch_target_offset..patch_target_offset + 4].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);

    let plist_xml = br#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
	<key>_PrelinkInfoDictionary</key>
	<array>
	</array>
</dict>
</plist>
"#;
    buf[info_fileoff..info_fileoff + plist_xml.len()].copy_from_slice(plist_xml);

    (buf, patch_target_offset)
}

fn base_patch_entry() -> PatchEntry {
    PatchEntry {
        enabled: true,
        identifier: "kernel".into(),
        base: None,
        find: "deadbeef".into(),
        replace: "cafebabe".into(),
        find_mask: None,
        replace_mask: None,
        count: 1,
        skip: 0,
        limit: 0,
        min_kernel: String::new(),
        max_kernel: String::new(),
        comment: "test patch".into(),
    }
}

#[test]
fn kernel_wide_patch_lands_at_the_expected_offset() {
    let (kernel, patch_offset) = synthetic_kernel();

    let mut config = KernelConfig::default();
    config.patch.push(base_patch_entry());

    let storage = MemoryStorage::new();
    let orchestrator = Orchestrator::new(&config, &storage, CpuInfo::default());
    let patched = orchestrator.process(&kernel).unwrap();

    assert_eq!(&patched[patch_offset..patch_offset + 4], &[0xca, 0xfe, 0xba, 0xbe]);
}

#[test]
fn patch_outside_its_version_window_is_skipped_not_applied() {
    let (kernel, patch_offset) = synthetic_kernel();

    let mut config = KernelConfig::default();
    let mut entry = base_patch_entry();
    entry.min_kernel = "20.0.0".into(); // kernel reports 19.6.0
    config.patch.push(entry);

    let storage = MemoryStorage::new();
    let orchestrator = Orchestrator::new(&config, &storage, CpuInfo::default());
    let patched = orchestrator.process(&kernel).unwrap();

    assert_eq!(&patched[patch_offset..patch_offset + 4], &[0xde, 0xad, 0xbe, 0xef]);
}

#[test]
fn borked_patch_entry_is_skipped_without_aborting_the_run() {
    let (kernel, _patch_offset) = synthetic_kernel();

    let mut config = KernelConfig::default();
    let mut entry = base_patch_entry();
    entry.find = "aa".into();
    entry.replace = "bbbb".into(); // mismatched length: fails validate()
    config.patch.push(entry);

    let storage = MemoryStorage::new();
    let orchestrator = Orchestrator::new(&config, &storage, CpuInfo::default());
    assert!(orchestrator.process(&kernel).is_ok());
}

#[test]
fn process_preserves_kernel_length_when_nothing_is_injected() {
    let (kernel, _patch_offset) = synthetic_kernel();
    let config = KernelConfig::default();
    let storage = MemoryStorage::new();
    let orchestrator = Orchestrator::new(&config, &storage, CpuInfo::default());
    let patched = orchestrator.process(&kernel).unwrap();
    assert_eq!(patched.len(), kernel.len());
}
