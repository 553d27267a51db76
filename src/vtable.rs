//! Rebuilds the vtables a compiler/linker would normally finish linking,
//! for every C++-style class whose super-metaclass-pointer (SMCP) symbol
//! shows up in a kext's own symbol table.
//!
//! The Itanium-ish name mangling conventions used here (`__ZTV`, `__ZN...
//! 10superClassE`, `___cxa_pure_virtual`, the hardcoded root
//! `__ZTV11OSMetaClassE`) are the load-bearing, externally observable
//! symbol names; everything else (pad-slot detection, the solve-symbol
//! list) is this engine's own bookkeeping.

use std::collections::{HashMap, VecDeque};

use scroll::Pread;

use crate::error::{Error, Result};
use crate::macho::relocation::{external_relocation_at, RelocationInfo};
use crate::resolver::{KextPool, LinkedSymbol, SymbolFilter};

pub const VTABLE_HEADER_LEN: usize = 2;
pub const VTABLE_ENTRY_SIZE: u64 = 8;
pub const PURE_VIRTUAL_SYMBOL: &str = "___cxa_pure_virtual";
pub const OS_METACLASS_VTABLE_NAME: &str = "__ZTV11OSMetaClassE";
/// Substring marking a pad slot reserved for ABI-compatible expansion.
pub const PAD_SLOT_MARKER: &str = "_RESERVED";
/// A scan this long would mean the file is lying about where the vtable ends.
const MAX_VTABLE_ENTRIES: usize = 4096;

#[derive(Debug, Clone, Copy)]
pub struct VtableEntry<'a> {
    pub name: Option<&'a str>,
    pub address: u64,
}

#[derive(Debug, Clone)]
pub struct PrelinkedVtable<'a> {
    pub name: String,
    pub entries: Vec<VtableEntry<'a>>,
}

// --- Symbol mangling conventions -------------------------------------------

pub fn vtable_symbol_for_class(class: &str) -> String {
    format!("__ZTV{}{}E", class.len(), class)
}

pub fn metaclass_name_for_class(class: &str) -> String {
    format!("{class}MetaClass")
}

pub fn metaclass_vtable_symbol_for_class(class: &str) -> String {
    vtable_symbol_for_class(&metaclass_name_for_class(class))
}

pub fn smcp_symbol_for_class(class: &str) -> String {
    format!("__ZN{}{}10superClassE", class.len(), class)
}

pub fn metaclass_instance_symbol_for_class(class: &str) -> String {
    format!("__ZN{}{}9gMetaClassE", class.len(), class)
}

pub fn function_prefix_for_class(class: &str) -> String {
    format!("__ZN{}{}", class.len(), class)
}

fn split_length_prefix(s: &str) -> Option<(usize, &str)> {
    let digits_len = s.find(|c: char| !c.is_ascii_digit())?;
    if digits_len == 0 {
        return None;
    }
    let len: usize = s[..digits_len].parse().ok()?;
    Some((len, &s[digits_len..]))
}

pub fn class_name_from_smcp_symbol(sym: &str) -> Option<&str> {
    let rest = sym.strip_prefix("__ZN")?;
    let (len, body) = split_length_prefix(rest)?;
    let (name, tail) = body.get(..len).zip(body.get(len..))?;
    (tail == "10superClassE").then_some(name)
}

fn class_name_from_metaclass_instance_symbol(sym: &str) -> Option<&str> {
    let rest = sym.strip_prefix("__ZN")?;
    let (len, body) = split_length_prefix(rest)?;
    let (name, tail) = body.get(..len).zip(body.get(len..))?;
    (tail == "9gMetaClassE").then_some(name)
}

fn is_pad_slot(name: &str) -> bool {
    name.contains(PAD_SLOT_MARKER)
}

// --- Low-level vtable data access -------------------------------------------

fn read_vtable_word(pool: &KextPool<'_>, kext_index: usize, va: u64) -> Result<u64> {
    let macho = &pool.get(kext_index).macho;
    let bytes = macho.bytes_at_va(va, VTABLE_ENTRY_SIZE as usize)?;
    Ok(bytes.pread_with(0, scroll::LE)?)
}

fn relocations_at(pool: &KextPool<'_>, kext_index: usize, va: u64) -> Result<Vec<RelocationInfo>> {
    pool.get(kext_index).macho.relocations_for_address(va)
}

/// The section-relative byte offset of virtual address `va`, against the
/// section that contains it (or `va` itself if it falls outside any
/// section this context knows about).
fn section_relative_offset(pool: &KextPool<'_>, kext_index: usize, va: u64) -> i64 {
    let section_addr = pool
        .get(kext_index)
        .macho
        .get_section_by_address(va)
        .map(|s| s.addr)
        .unwrap_or(va);
    (va - section_addr) as i64
}

/// Resolves the external relocation targeting `slot_va`, if any, to the
/// symbol it points at by reading the kext's own raw nlist table at the
/// relocation's `symbolnum()` index directly — the same file offset the
/// relocation itself names, not a name-prefix guess.
fn symbol_for_relocated_slot<'a>(
    pool: &KextPool<'a>,
    kext_index: usize,
    relocs: &[RelocationInfo],
    slot_va: u64,
) -> Result<Option<LinkedSymbol<'a>>> {
    let rel_off = section_relative_offset(pool, kext_index, slot_va);
    let Some(reloc) = external_relocation_at(relocs, rel_off) else {
        return Ok(None);
    };
    let macho = &pool.get(kext_index).macho;
    let table = macho.symbols().ok_or_else(|| {
        Error::malformed(format!("vtable slot at {slot_va:#x} has a relocation but kext carries no symbol table"))
    })?;
    let (nlist, name) = table.get(reloc.symbolnum() as usize)?;
    Ok(Some(LinkedSymbol { name, nlist }))
}

/// Scans the vtable at `va` for its true terminator: a zero data word with
/// no external relocation pointing at it. Entries must be 8-byte aligned.
fn raw_entry_count(pool: &KextPool<'_>, kext_index: usize, va: u64) -> Result<usize> {
    if va % VTABLE_ENTRY_SIZE != 0 {
        return Err(Error::malformed(format!("vtable at {va:#x} is not 8-byte aligned")));
    }
    let relocs = relocations_at(pool, kext_index, va)?;

    let mut idx = 0usize;
    loop {
        if idx > MAX_VTABLE_ENTRIES {
            return Err(Error::malformed("vtable scan exceeded sane bound"));
        }
        let slot_va = va + (VTABLE_HEADER_LEN as u64 + idx as u64) * VTABLE_ENTRY_SIZE;
        let value = read_vtable_word(pool, kext_index, slot_va)?;
        if value == 0 {
            if symbol_for_relocated_slot(pool, kext_index, &relocs, slot_va)?.is_some() {
                idx += 1;
                continue;
            }
            return Ok(idx);
        }
        idx += 1;
    }
}

/// Slices a vtable's entries as they stand in the file, resolving each
/// nonzero slot to a C++ symbol and each relocation-driven zero slot to the
/// symbol its relocation names. A zero slot with no relocation is the real
/// terminator and never reaches here (see [`raw_entry_count`]).
fn slice_vtable_raw<'a>(pool: &KextPool<'a>, kext_index: usize, va: u64) -> Result<Vec<VtableEntry<'a>>> {
    let count = raw_entry_count(pool, kext_index, va)?;
    let relocs = relocations_at(pool, kext_index, va)?;
    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let slot_va = va + (VTABLE_HEADER_LEN as u64 + i as u64) * VTABLE_ENTRY_SIZE;
        let value = read_vtable_word(pool, kext_index, slot_va)?;
        if value == 0 {
            match symbol_for_relocated_slot(pool, kext_index, &relocs, slot_va)? {
                Some(sym) => entries.push(VtableEntry {
                    name: sym.name,
                    address: sym.value(),
                }),
                None => entries.push(VtableEntry { name: None, address: 0 }),
            }
            continue;
        }
        let resolved = pool.find_by_value(kext_index, value, SymbolFilter::CxxOnly);
        match resolved {
            Some((_, sym)) => entries.push(VtableEntry {
                name: sym.name,
                address: value,
            }),
            None => entries.push(VtableEntry { name: None, address: 0 }),
        }
    }
    Ok(entries)
}

fn get_or_build_vtable<'a>(
    pool: &KextPool<'a>,
    kext_index: usize,
    linked: &mut HashMap<String, PrelinkedVtable<'a>>,
    name: &str,
) -> Result<Option<PrelinkedVtable<'a>>> {
    if let Some(v) = linked.get(name) {
        return Ok(Some(v.clone()));
    }
    match pool.find_by_name(kext_index, name, SymbolFilter::Any) {
        Some((owner, sym)) if sym.nlist.is_defined() && sym.value() != 0 => {
            let entries = slice_vtable_raw(pool, owner, sym.value())?;
            let vt = PrelinkedVtable {
                name: name.to_string(),
                entries,
            };
            linked.insert(name.to_string(), vt.clone());
            Ok(Some(vt))
        }
        _ => Ok(None),
    }
}

// --- Single-entry patch rule -------------------------------------------------

enum PatchAction {
    Untouched,
    Patched,
}

/// The semantic heart of the linker: decides what happens to one child
/// vtable slot, given the corresponding already-linked parent entry.
fn patch_single_entry(
    class_name: &str,
    parent_entry: &VtableEntry,
    child: &mut LinkedSymbol,
) -> Result<PatchAction> {
    let Some(parent_name) = parent_entry.name else {
        // Parent entry was itself stripped; nothing to inherit.
        return Ok(PatchAction::Untouched);
    };

    if child.nlist.is_local_defined() {
        return Ok(PatchAction::Untouched);
    }

    let child_name = child.name;
    if child_name == Some(PURE_VIRTUAL_SYMBOL) {
        return Ok(PatchAction::Untouched);
    }
    if child_name == Some(parent_name) {
        return Ok(PatchAction::Untouched);
    }

    if is_pad_slot(parent_name) {
        return Err(Error::unsatisfiable(
            class_name,
            format!("child overrides pad slot {parent_name}, ABI break"),
        ));
    }

    if !child.nlist.is_defined() {
        let prefix = function_prefix_for_class(class_name);
        if child_name.is_some_and(|n| n.starts_with(&prefix)) {
            return Err(Error::unsatisfiable(
                class_name,
                format!(
                    "{} declares a virtual method without defining it",
                    child_name.unwrap_or("<unnamed>")
                ),
            ));
        }
    }

    child.nlist.n_value = parent_entry.address;
    if !is_pad_slot(parent_name) && child.nlist.n_value & 1 != 0 {
        log::warn!("vtable: solved symbol for {class_name} has an odd (unaligned) address");
    }

    Ok(PatchAction::Patched)
}

/// Patches a child vtable against its linked parent: for each of the
/// parent's `[0, |P|)` slots, either accepts the child's own direct
/// pointer, or — for a zero slot — resolves *that exact slot's* external
/// relocation to its symbol via `symbolnum()` and patches it against the
/// parent entry. A zero slot with no relocation is the child's own
/// terminator, so entries stop there; the parent may have more slots than
/// the child defines when the child hasn't overridden every method.
fn patch_vtable_entries<'a>(
    class_name: &str,
    parent: &PrelinkedVtable<'a>,
    pool: &KextPool<'a>,
    kext_index: usize,
    child_va: u64,
) -> Result<Vec<VtableEntry<'a>>> {
    let relocs = relocations_at(pool, kext_index, child_va)?;
    let mut entries = Vec::with_capacity(parent.entries.len());

    for (i, parent_entry) in parent.entries.iter().enumerate() {
        let slot_va = child_va + (VTABLE_HEADER_LEN as u64 + i as u64) * VTABLE_ENTRY_SIZE;
        let value = read_vtable_word(pool, kext_index, slot_va)?;

        if value != 0 {
            let resolved = pool.find_by_value(kext_index, value, SymbolFilter::CxxOnly);
            match resolved {
                Some((_, sym)) => entries.push(VtableEntry {
                    name: sym.name,
                    address: value,
                }),
                None => entries.push(VtableEntry { name: None, address: 0 }),
            }
            continue;
        }

        let Some(mut symbol) = symbol_for_relocated_slot(pool, kext_index, &relocs, slot_va)? else {
            break;
        };
        patch_single_entry(class_name, parent_entry, &mut symbol)?;
        entries.push(VtableEntry {
            name: symbol.name,
            address: symbol.value(),
        });
    }

    Ok(entries)
}

// --- Fixed-point driver -------------------------------------------------------

enum PatchOutcome {
    Patched,
    NotYetReady,
}

fn try_patch_class<'a>(
    pool: &KextPool<'a>,
    kext_index: usize,
    class: &str,
    linked: &mut HashMap<String, PrelinkedVtable<'a>>,
) -> Result<PatchOutcome> {
    // Resolve the immediate parent's name via the SMCP's stored value.
    let smcp_name = smcp_symbol_for_class(class);
    let Some((_, smcp_sym)) = pool.find_by_name(kext_index, &smcp_name, SymbolFilter::Any) else {
        return Ok(PatchOutcome::NotYetReady);
    };
    if smcp_sym.value() == 0 {
        return Ok(PatchOutcome::NotYetReady);
    }
    let Some((_, parent_marker)) = pool.find_by_value(kext_index, smcp_sym.value(), SymbolFilter::Any) else {
        return Ok(PatchOutcome::NotYetReady);
    };
    let Some(parent_name) = parent_marker.name.and_then(class_name_from_metaclass_instance_symbol) else {
        return Err(Error::unsatisfiable(
            class,
            "super-metaclass pointer does not resolve to a metaclass instance symbol",
        ));
    };

    // Everything needed must be available before any mutation happens, so
    // that a class that cannot fully link yet is left completely alone.
    let Some(parent_vtable) = get_or_build_vtable(pool, kext_index, linked, &vtable_symbol_for_class(parent_name))?
    else {
        return Ok(PatchOutcome::NotYetReady);
    };
    let own_vtable_symbol = vtable_symbol_for_class(class);
    let Some((_, own_vtable_sym)) = pool.find_by_name(kext_index, &own_vtable_symbol, SymbolFilter::Any) else {
        return Ok(PatchOutcome::NotYetReady);
    };
    if !own_vtable_sym.nlist.is_defined() || own_vtable_sym.value() == 0 {
        return Ok(PatchOutcome::NotYetReady);
    }

    let metaclass_name = metaclass_name_for_class(class);
    let own_metaclass_vtable_symbol = vtable_symbol_for_class(&metaclass_name);
    let Some((_, own_metaclass_vtable_sym)) =
        pool.find_by_name(kext_index, &own_metaclass_vtable_symbol, SymbolFilter::Any)
    else {
        return Ok(PatchOutcome::NotYetReady);
    };
    if !own_metaclass_vtable_sym.nlist.is_defined() || own_metaclass_vtable_sym.value() == 0 {
        return Ok(PatchOutcome::NotYetReady);
    }
    let Some(metaclass_parent) = get_or_build_vtable(pool, kext_index, linked, OS_METACLASS_VTABLE_NAME)? else {
        return Ok(PatchOutcome::NotYetReady);
    };

    // Everything is available: patch the class vtable, then its metaclass.
    let class_entries = patch_vtable_entries(class, &parent_vtable, pool, kext_index, own_vtable_sym.value())?;
    linked.insert(
        own_vtable_symbol.clone(),
        PrelinkedVtable {
            name: own_vtable_symbol,
            entries: class_entries,
        },
    );

    let meta_entries = patch_vtable_entries(
        &metaclass_name,
        &metaclass_parent,
        pool,
        kext_index,
        own_metaclass_vtable_sym.value(),
    )?;
    linked.insert(
        own_metaclass_vtable_symbol.clone(),
        PrelinkedVtable {
            name: own_metaclass_vtable_symbol,
            entries: meta_entries,
        },
    );

    Ok(PatchOutcome::Patched)
}

/// Links every class discoverable via an SMCP symbol in `kext`'s own
/// symbol table, iterating to a fixed point so dependents patch in
/// topological order. On success, the kext's `vtables` field is populated
/// with one [`PrelinkedVtable`] per class vtable and per metaclass vtable.
pub fn link_kext(pool: &mut KextPool<'_>, kext_index: usize) -> Result<()> {
    let discovered: Vec<String> = pool
        .get(kext_index)
        .cxx_symbols()
        .iter()
        .filter_map(|s| s.name.and_then(class_name_from_smcp_symbol).map(str::to_string))
        .collect();

    let mut linked: HashMap<String, PrelinkedVtable> = HashMap::new();
    let mut pending: VecDeque<String> = discovered.into_iter().collect();

    while !pending.is_empty() {
        let mut next_round = VecDeque::new();
        let mut progressed = false;

        while let Some(class) = pending.pop_front() {
            match try_patch_class(pool, kext_index, &class, &mut linked)? {
                PatchOutcome::Patched => progressed = true,
                PatchOutcome::NotYetReady => next_round.push_back(class),
            }
        }

        if !progressed {
            let stuck: Vec<String> = next_round.into_iter().collect();
            return Err(Error::unsatisfiable(
                stuck.join(", "),
                "vtable iteration reached a fixed point with classes still unpatched",
            ));
        }
        pending = next_round;
    }

    let kext = pool.get_mut(kext_index);
    kext.vtables = linked.into_values().collect();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mangles_and_unmangles_class_names() {
        assert_eq!(vtable_symbol_for_class("IOService"), "__ZTV9IOServiceE");
        assert_eq!(smcp_symbol_for_class("IOService"), "__ZN9IOService10superClassE");
        assert_eq!(
            metaclass_vtable_symbol_for_class("IOService"),
            "__ZTV18IOServiceMetaClassE"
        );
        assert_eq!(class_name_from_smcp_symbol("__ZN9IOService10superClassE"), Some("IOService"));
        assert_eq!(
            class_name_from_metaclass_instance_symbol("__ZN9IOService9gMetaClassE"),
            Some("IOService")
        );
        assert_eq!(class_name_from_smcp_symbol("not a symbol"), None);
    }

    #[test]
    fn pad_slot_detection() {
        assert!(is_pad_slot("__ZN15OSMetaClassBase9_RESERVEDEv"));
        assert!(!is_pad_slot("__ZN9IOService5startEv"));
    }
}
