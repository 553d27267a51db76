//! Exercises the vtable fixed-point linker end to end against a synthetic
//! three-level class chain `A <- B <- C`, built by hand the same way
//! `synthetic_kernel()` in tests/orchestrator.rs builds a kernel: real
//! Mach-O bytes for everything the linker actually reads off disk (vtable
//! words, relocations, the raw symbol table), with the pool's own
//! bookkeeping (SMCP symbols, metaclass markers, vtable symbol addresses)
//! supplied directly as `LinkedSymbol`s.
//!
//! Each class's zero vtable slot is backed by a real external relocation
//! pointing at its own distinctly-named, undefined stub symbol
//! (`_weak_base_method_stub`, `_another_stub_b`, `_another_stub_c`) chosen
//! so that none of them share the mangled `__ZN<len><class>` prefix the
//! old name-prefix scan keyed off: a symbol-table-order heuristic would
//! have no way to line these up with the right slot, while resolving each
//! slot's own relocation does it correctly regardless of name or order.

use scroll::Pwrite;

use prelink_engine::macho::constants::{cputype, LC_SEGMENT_64, LC_SYMTAB, MH_KEXT_BUNDLE, MH_MAGIC_64};
use prelink_engine::macho::header::Header64;
use prelink_engine::macho::load_command::{
    LoadCommandHeader, Section64, SegmentCommand64, SymtabCommand, SIZEOF_LOAD_COMMAND, SIZEOF_SECTION_64,
    SIZEOF_SEGMENT_COMMAND_64, SIZEOF_SYMTAB_COMMAND,
};
use prelink_engine::macho::relocation::RelocationInfo;
use prelink_engine::macho::symtab::Nlist64;
use prelink_engine::macho::MachContext;
use prelink_engine::resolver::{KextPool, LinkedSymbol, PrelinkedKext};
use prelink_engine::vtable::{
    self, metaclass_instance_symbol_for_class, metaclass_name_for_class, metaclass_vtable_symbol_for_class,
    smcp_symbol_for_class, vtable_symbol_for_class, PrelinkedVtable, OS_METACLASS_VTABLE_NAME,
};
use prelink_engine::Error;

fn name16(s: &str) -> [u8; 16] {
    let mut n = [0u8; 16];
    n[..s.len()].copy_from_slice(s.as_bytes());
    n
}

fn push_cstr(table: &mut Vec<u8>, s: &str) -> u32 {
    let off = table.len() as u32;
    table.extend_from_slice(s.as_bytes());
    table.push(0);
    off
}

/// Hand-built `LinkedSymbol`s are 'static for the test's convenience; leak
/// the mangled names rather than threading a string arena through.
fn leak(s: String) -> &'static str {
    Box::leak(s.into_boxed_str())
}

struct Layout {
    base_vt_va: u64,
    osmeta_vt_va: u64,
    a_vt_va: u64,
    b_vt_va: u64,
    c_vt_va: u64,
}

/// One `__DATA` segment/section holding, back to back: `Base`'s fully
/// resolved vtable, the (empty) `OSMetaClass` root vtable, then a zero-slot
/// vtable for each of `A`, `B` and (if `include_c`) `C`, each slot backed by
/// a real external relocation naming a distinct undefined stub symbol in a
/// genuine `LC_SYMTAB`.
fn synthetic_chain_kext(include_c: bool) -> (Vec<u8>, Layout) {
    let header_len = 32usize;
    let seg_cmd_len = SIZEOF_LOAD_COMMAND + SIZEOF_SEGMENT_COMMAND_64 + SIZEOF_SECTION_64;
    let symtab_cmd_len = SIZEOF_LOAD_COMMAND + SIZEOF_SYMTAB_COMMAND;
    let cmds_size = seg_cmd_len + symtab_cmd_len;
    let data_fileoff = header_len + cmds_size;

    // header(16) + 1 resolved entry(8) + terminator(8)
    let one_entry_vtable_len = 32usize;
    // header(16) + terminator(8), zero entries
    let empty_vtable_len = 24usize;

    let base_vt_fileoff = data_fileoff;
    let osmeta_vt_fileoff = base_vt_fileoff + one_entry_vtable_len;
    let a_vt_fileoff = osmeta_vt_fileoff + empty_vtable_len;
    let b_vt_fileoff = a_vt_fileoff + one_entry_vtable_len;
    let c_vt_fileoff = b_vt_fileoff + one_entry_vtable_len;

    let data_end_fileoff = if include_c {
        c_vt_fileoff + one_entry_vtable_len
    } else {
        b_vt_fileoff + one_entry_vtable_len
    };
    let data_len = data_end_fileoff - data_fileoff;

    let stub_names: &[&str] = if include_c {
        &["_weak_base_method_stub", "_another_stub_b", "_another_stub_c"]
    } else {
        &["_weak_base_method_stub", "_another_stub_b"]
    };
    let nreloc = stub_names.len();

    let reloc_fileoff = data_fileoff + data_len;
    let reloc_table_len = nreloc * 8;
    let symoff = reloc_fileoff + reloc_table_len;
    let sym_table_len = nreloc * 16;
    let stroff = symoff + sym_table_len;

    let mut strtab = vec![0u8];
    let strxs: Vec<u32> = stub_names.iter().map(|s| push_cstr(&mut strtab, s)).collect();
    let strsize = strtab.len();
    let total = stroff + strsize;

    let mut buf = vec![0u8; total];

    buf.pwrite_with(
        0,
        Header64 {
            magic: MH_MAGIC_64,
            cputype: cputype::CPU_TYPE_X86_64,
            cpusubtype: 0,
            filetype: MH_KEXT_BUNDLE,
            ncmds: 2,
            sizeofcmds: cmds_size as u32,
            flags: 0,
            reserved: 0,
        },
        scroll::LE,
    )
    .unwrap();

    let mut off = header_len;
    buf.pwrite_with(off, LoadCommandHeader { cmd: LC_SEGMENT_64, cmdsize: seg_cmd_len as u32 }, scroll::LE)
        .unwrap();
    buf.pwrite_with(
        off + SIZEOF_LOAD_COMMAND,
        SegmentCommand64 {
            segname: name16("__DATA"),
            vmaddr: data_fileoff as u64,
            vmsize: data_len as u64,
            fileoff: data_fileoff as u64,
            filesize: data_len as u64,
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
            sectname: name16("__data"),
            segname: name16("__DATA"),
            addr: data_fileoff as u64,
            size: data_len as u64,
            offset: data_fileoff as u32,
            align: 0,
            reloff: reloc_fileoff as u32,
            nreloc: nreloc as u32,
            flags: 0,
            reserved1: 0,
            reserved2: 0,
            reserved3: 0,
        },
        scroll::LE,
    )
    .unwrap();
    off += seg_cmd_len;

    buf.pwrite_with(off, LoadCommandHeader { cmd: LC_SYMTAB, cmdsize: symtab_cmd_len as u32 }, scroll::LE)
        .unwrap();
    buf.pwrite_with(
        off + SIZEOF_LOAD_COMMAND,
        SymtabCommand {
            symoff: symoff as u32,
            nsyms: nreloc as u32,
            stroff: stroff as u32,
            strsize: strsize as u32,
        },
        scroll::LE,
    )
    .unwrap();

    // Base's single, already-resolved vtable entry.
    buf.pwrite_with(base_vt_fileoff + 16, 0x5000u64, scroll::LE).unwrap();

    let slot_fileoffs = if include_c {
        vec![a_vt_fileoff, b_vt_fileoff, c_vt_fileoff]
    } else {
        vec![a_vt_fileoff, b_vt_fileoff]
    };
    for (i, vt_fileoff) in slot_fileoffs.iter().enumerate() {
        let slot_rel = (vt_fileoff + 16 - data_fileoff) as i32;
        buf.pwrite_with(
            reloc_fileoff + i * 8,
            RelocationInfo {
                r_address: slot_rel,
                r_info: (1u32 << 27) | (i as u32),
            },
            scroll::LE,
        )
        .unwrap();
        buf.pwrite_with(
            symoff + i * 16,
            Nlist64 {
                n_strx: strxs[i],
                n_type: 0x01, // N_UNDF | N_EXT
                n_sect: 0,
                n_desc: 0,
                n_value: 0,
            },
            scroll::LE,
        )
        .unwrap();
    }

    let layout = Layout {
        base_vt_va: base_vt_fileoff as u64,
        osmeta_vt_va: osmeta_vt_fileoff as u64,
        a_vt_va: a_vt_fileoff as u64,
        b_vt_va: b_vt_fileoff as u64,
        c_vt_va: if include_c { c_vt_fileoff as u64 } else { 0 },
    };
    (buf, layout)
}

fn bookkeeping_symbols(layout: &Layout, include_c: bool) -> Vec<LinkedSymbol<'static>> {
    const MARK_BASE: u64 = 0x9000;
    const MARK_A: u64 = 0x9001;
    const MARK_B: u64 = 0x9002;

    fn defined(name: &'static str, value: u64) -> LinkedSymbol<'static> {
        LinkedSymbol {
            name: Some(name),
            nlist: Nlist64 {
                n_strx: 0,
                n_type: 0x0f, // defined (section) | external
                n_sect: 1,
                n_desc: 0,
                n_value: value,
            },
        }
    }
    fn marker(name: &'static str, value: u64) -> LinkedSymbol<'static> {
        LinkedSymbol {
            name: Some(name),
            nlist: Nlist64 {
                n_strx: 0,
                n_type: 0x01, // undefined | external: a pure bookkeeping join key
                n_sect: 0,
                n_desc: 0,
                n_value: value,
            },
        }
    }

    // `find_by_value` is a linear scan that returns the first match, so each
    // parent's gMetaClass marker must appear *before* the child SMCP symbol
    // carrying the same sentinel value — otherwise a child's own SMCP entry
    // would match itself instead of the marker it's meant to resolve to.
    let mut syms = vec![
        defined("__ZN4Base6methodEv", 0x5000),
        defined(leak(vtable_symbol_for_class("Base")), layout.base_vt_va),
        defined(OS_METACLASS_VTABLE_NAME, layout.osmeta_vt_va),
        marker(leak(metaclass_instance_symbol_for_class("Base")), MARK_BASE),
        marker(leak(smcp_symbol_for_class("A")), MARK_BASE),
        defined(leak(vtable_symbol_for_class("A")), layout.a_vt_va),
        defined(leak(metaclass_vtable_symbol_for_class("A")), 0xdead_0001),
        marker(leak(metaclass_instance_symbol_for_class("A")), MARK_A),
        marker(leak(smcp_symbol_for_class("B")), MARK_A),
        defined(leak(vtable_symbol_for_class("B")), layout.b_vt_va),
        defined(leak(metaclass_vtable_symbol_for_class("B")), 0xdead_0002),
        // C is discoverable (its SMCP/marker pair still resolves B as its
        // parent) in both variants; only its own vtable symbol differs.
        marker(leak(metaclass_instance_symbol_for_class("B")), MARK_B),
        marker(leak(smcp_symbol_for_class("C")), MARK_B),
    ];

    if include_c {
        syms.push(defined(leak(vtable_symbol_for_class("C")), layout.c_vt_va));
        syms.push(defined(leak(metaclass_vtable_symbol_for_class("C")), 0xdead_0003));
    }

    syms
}

fn build_pool(include_c: bool) -> (KextPool<'static>, usize) {
    let (buf, layout) = synthetic_chain_kext(include_c);
    let buf: &'static [u8] = Box::leak(buf.into_boxed_slice());
    let macho = MachContext::parse(buf).unwrap();
    let linked_symbols = bookkeeping_symbols(&layout, include_c);
    let num_cxx_symbols = linked_symbols.len();
    let kext = PrelinkedKext::new("com.example.chain".into(), linked_symbols, num_cxx_symbols, vec![], macho);

    let mut pool = KextPool::default();
    let idx = pool.push(kext);
    (pool, idx)
}

fn find_vtable<'a>(vtables: &'a [PrelinkedVtable<'a>], name: &str) -> &'a PrelinkedVtable<'a> {
    vtables.iter().find(|v| v.name == name).unwrap_or_else(|| panic!("no linked vtable named {name}"))
}

#[test]
fn three_level_chain_propagates_the_resolved_address_through_each_relocated_slot() {
    let (mut pool, idx) = build_pool(true);

    vtable::link_kext(&mut pool, idx).expect("A <- B <- C should link to a fixed point");

    let vtables = &pool.get(idx).vtables;
    let a_vt = find_vtable(vtables, &vtable_symbol_for_class("A"));
    let b_vt = find_vtable(vtables, &vtable_symbol_for_class("B"));
    let c_vt = find_vtable(vtables, &vtable_symbol_for_class("C"));

    assert_eq!(a_vt.entries.len(), 1);
    assert_eq!(a_vt.entries[0].address, 0x5000);
    assert_eq!(a_vt.entries[0].name, Some("_weak_base_method_stub"));

    assert_eq!(b_vt.entries.len(), 1);
    assert_eq!(b_vt.entries[0].address, 0x5000);
    assert_eq!(b_vt.entries[0].name, Some("_another_stub_b"));

    assert_eq!(c_vt.entries.len(), 1);
    assert_eq!(c_vt.entries[0].address, 0x5000);
    assert_eq!(c_vt.entries[0].name, Some("_another_stub_c"));

    // Metaclass vtables link too, inheriting from the fixed OSMetaClass root.
    assert!(find_vtable(vtables, &metaclass_vtable_symbol_for_class("A")).entries.is_empty());
    assert_eq!(metaclass_name_for_class("C"), "CMetaClass");
}

#[test]
fn missing_vtable_symbol_for_the_last_class_gets_stuck_at_a_fixed_point() {
    let (mut pool, idx) = build_pool(false);

    let err = vtable::link_kext(&mut pool, idx).expect_err("C has no vtable symbol of its own to patch");

    // A and B had everything they needed and patched in the first pass;
    // only C is left in the stuck set reported by the error.
    match err {
        Error::UnsatisfiableLink { class, .. } => assert_eq!(class, "C"),
        other => panic!("expected an unsatisfiable-link error stuck on C, got {other:?}"),
    }
}
