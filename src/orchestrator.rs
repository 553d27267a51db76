//! The top-level entry point: one call per kernel open. Reads the running
//! kernel version, applies kernel-wide patches, opens a prelinked context
//! over the kernel (parsing its embedded kext pool and linking vtables),
//! applies per-kext patches and blockers, injects new kexts, and reports
//! the final image size.
//!
//! Mirrors `OcKernelProcessPrelinked`/`OcKernelApplyPatches` from the tool
//! this engine's shape is modeled on: a kernel-only patch phase runs
//! before the prelinked container is even opened, then a second phase
//! runs against kexts inside it.

use std::io::Cursor;

use log::{info, warn};

use crate::config::KernelConfig;
use crate::error::{Error, Result};
use crate::macho::MachContext;
use crate::patch::{self, Patch};
use crate::quirks;
use crate::resolver::{KextPool, LinkedSymbol, PrelinkedKext};
use crate::storage::Storage;
use crate::version;
use crate::vtable;

const PRELINK_INFO_SEGMENT: &str = "__PRELINK_INFO";
const PRELINK_INFO_SECTION: &str = "__info";
const PRELINK_TEXT_SEGMENT: &str = "__PRELINK_TEXT";
const PRELINK_INFO_DICTIONARY_KEY: &str = "_PrelinkInfoDictionary";
const PRELINK_BUNDLE_PATH_KEY: &str = "_PrelinkBundlePath";
const PRELINK_EXECUTABLE_LOAD_ADDR_KEY: &str = "_PrelinkExecutableLoadAddr";
const PRELINK_EXECUTABLE_SIZE_KEY: &str = "_PrelinkExecutableSize";
const BUNDLE_IDENTIFIER_KEY: &str = "CFBundleIdentifier";
const BUNDLE_LIBRARIES_KEY: &str = "OSBundleLibraries";

/// Headroom reserved for the prelinked container's growth, mirroring
/// `PRELINK_INFO_RESERVE_SIZE`: enough slack for the info dictionary to
/// grow by a handful of new kext entries before injection even starts.
const PRELINK_INFO_RESERVE_SIZE: usize = 0x4000;

/// CPU identification consumed only by the CPUID-emulation patch.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuInfo {
    pub vendor: [u8; 12],
    pub family: u32,
    pub model: u32,
    pub stepping: u32,
}

/// One resolved patch action: a concrete file-offset window to apply a
/// [`Patch`] to, computed ahead of time so the mutation pass never needs
/// a live borrow of the context it was resolved against.
struct ResolvedPatch {
    base_offset: usize,
    patch: Patch,
    label: String,
}

/// Top-level engine value. Threads configuration, storage and CPU info
/// through a single call per kernel open, per the "only three globals"
/// design note — here they are fields of one value instead.
pub struct Orchestrator<'a, S: Storage> {
    config: &'a KernelConfig,
    storage: &'a S,
    cpu: CpuInfo,
}

impl<'a, S: Storage> Orchestrator<'a, S> {
    pub fn new(config: &'a KernelConfig, storage: &'a S, cpu: CpuInfo) -> Self {
        Orchestrator { config, storage, cpu }
    }

    /// Runs the full pipeline over `kernel`, returning the patched image.
    pub fn process(&self, kernel: &[u8]) -> Result<Vec<u8>> {
        let reserve = self.reservation_size();
        let mut buffer = Vec::with_capacity(kernel.len() + reserve);
        buffer.extend_from_slice(kernel);
        let content_len = buffer.len();
        buffer.resize(kernel.len() + reserve, 0);

        let darwin_version = version::parse_darwin_version_marker(&buffer[..content_len]);
        info!("kernel version {}", version::format_darwin_version(darwin_version));

        self.apply_kernel_only_patches(&mut buffer[..content_len], darwin_version)?;

        let final_len = self.process_prelinked(&mut buffer, content_len, darwin_version)?;
        buffer.truncate(final_len);
        Ok(buffer)
    }

    /// Walks the add list and estimates the extra bytes the prelinked
    /// container needs, so the caller (here: `process` itself) allocates
    /// a large enough buffer up front.
    fn reservation_size(&self) -> usize {
        let mut size = PRELINK_INFO_RESERVE_SIZE;
        for entry in &self.config.add {
            if !entry.enabled {
                continue;
            }
            size += 4096; // plist dict entry + section alignment slack, per kext
        }
        size
    }

    fn apply_kernel_only_patches(&self, kernel: &mut [u8], darwin_version: u32) -> Result<()> {
        // The kernel image is itself a valid Mach-O with its own symbol
        // table, so a "kernel" patch can carry a symbolic base. Resolve
        // every base in one read-only pass before anything mutates the
        // buffer the context borrows from.
        let mut resolved = Vec::new();
        {
            let ctx = MachContext::parse(kernel)?;
            for entry in &self.config.patch {
                if !entry.enabled || entry.identifier != "kernel" {
                    continue;
                }
                if let Some(action) = self.resolve_config_patch(entry, darwin_version, Some(&ctx))? {
                    resolved.push(action);
                }
            }
        }

        for action in &resolved {
            match patch::apply(kernel, &action.patch, action.base_offset) {
                Ok(n) => info!("patch {} applied ({n} matches)", action.label),
                Err(e) => warn!("patch {} failed: {e}", action.label),
            }
        }

        for id in self.config.quirks.enabled() {
            let (target, patch) = quirks::patch_for(id);
            if target != "kernel" {
                continue;
            }
            match patch::apply(kernel, &patch, 0) {
                Ok(n) => info!("quirk {} applied ({n} matches)", id.name()),
                Err(e) => warn!("quirk {} failed: {e}", id.name()),
            }
        }

        if self.config.emulate.is_active() {
            self.apply_cpuid_emulation(kernel)?;
        }

        Ok(())
    }

    fn apply_cpuid_emulation(&self, kernel: &mut [u8]) -> Result<()> {
        info!(
            "cpuid1 emulation requested on host family {:#x} model {:#x} stepping {:#x}",
            self.cpu.family, self.cpu.model, self.cpu.stepping
        );
        let data = self.config.emulate.data()?;
        let mask = self.config.emulate.mask()?;
        if data.len() != mask.len() {
            return Err(Error::malformed("Cpuid1Data and Cpuid1Mask must be the same length"));
        }
        let patch = Patch {
            find: vec![0; data.len()],
            replace: data,
            find_mask: None,
            replace_mask: Some(mask),
            base: None,
            count: 1,
            skip: 0,
            limit: 0,
        };
        // Without a real CPUID trap site to target, this only demonstrates
        // the wiring: a real port would locate the `cpuid_set_info`
        // leaf-1 constant table and patch that specific window instead of
        // scanning from the start of the image.
        let _ = patch::apply(kernel, &patch, 0);
        Ok(())
    }

    /// Version-gates and validates a config patch entry, resolving its
    /// symbolic base (if any) against `ctx`, without touching any buffer.
    /// Returns `None` for a patch that should be skipped (version window,
    /// malformed shape, or an unresolvable base), logging why.
    fn resolve_config_patch(
        &self,
        entry: &crate::config::PatchEntry,
        darwin_version: u32,
        ctx: Option<&MachContext<'_>>,
    ) -> Result<Option<ResolvedPatch>> {
        let min = version::parse_darwin_version(&entry.min_kernel);
        let max = version::parse_darwin_version(&entry.max_kernel);
        if !version::match_darwin_version(darwin_version, min, max) {
            info!(
                "patch {} ({}) skipped: version {} outside [{}, {}]",
                entry.identifier, entry.comment, darwin_version, min, max
            );
            return Ok(None);
        }

        let patch = entry.to_patch()?;
        if let Err(e) = patch.validate() {
            info!("patch {} ({}) is borked: {e}", entry.identifier, entry.comment);
            return Ok(None);
        }

        let base_offset = match (&patch.base, ctx) {
            (Some(name), Some(ctx)) => resolve_symbol_offset(ctx, name)?,
            (Some(_), None) => {
                warn!("patch {} ({}) has a symbolic base but no context to resolve it in", entry.identifier, entry.comment);
                return Ok(None);
            }
            (None, _) => 0,
        };

        Ok(Some(ResolvedPatch { base_offset, patch, label: format!("{} ({})", entry.identifier, entry.comment) }))
    }

    /// Opens the prelinked container, links vtables, applies per-kext
    /// patches and blockers, injects new kexts, finalises the info
    /// dictionary and returns the final content length.
    fn process_prelinked(&self, buffer: &mut Vec<u8>, content_len: usize, darwin_version: u32) -> Result<usize> {
        let mut pool = PrelinkedContext::open(&buffer[..content_len])?;

        for idx in 0..pool.pool.kexts.len() {
            if let Err(e) = vtable::link_kext(&mut pool.pool, idx) {
                return Err(e);
            }
        }

        let mut actions = Vec::new();
        for entry in &self.config.patch {
            if !entry.enabled || entry.identifier == "kernel" {
                continue;
            }
            let Some(kext_idx) = pool.pool.find_by_identifier(&entry.identifier) else {
                warn!("patch target {} not found in prelinked kexts", entry.identifier);
                continue;
            };
            let ctx = &pool.pool.get(kext_idx).macho;
            if let Some(action) = self.resolve_config_patch(entry, darwin_version, Some(ctx))? {
                actions.push(action);
            }
        }

        for entry in &self.config.block {
            if !entry.enabled {
                continue;
            }
            let Some(kext_idx) = pool.pool.find_by_identifier(&entry.identifier) else {
                warn!("block target {} not found in prelinked kexts", entry.identifier);
                continue;
            };
            let min = version::parse_darwin_version(&entry.min_kernel);
            let max = version::parse_darwin_version(&entry.max_kernel);
            if !version::match_darwin_version(darwin_version, min, max) {
                continue;
            }
            actions.push(block_action(&pool.pool.get(kext_idx).macho, &entry.identifier)?);
        }

        for id in self.config.quirks.enabled() {
            let (target, patch) = quirks::patch_for(id);
            if target == "kernel" {
                continue;
            }
            let Some(_kext_idx) = pool.pool.find_by_identifier(target) else {
                continue;
            };
            actions.push(ResolvedPatch { base_offset: 0, patch, label: target.to_string() });
        }

        let prelink_info_section = pool
            .ctx
            .get_section_by_name(PRELINK_INFO_SEGMENT, PRELINK_INFO_SECTION)
            .ok_or_else(|| Error::malformed("missing __PRELINK_INFO section"))?;
        let info_offset = prelink_info_section.offset as usize;
        let info_capacity = prelink_info_section.size as usize;

        let prelink_text_end = pool
            .ctx
            .get_segment_by_name(PRELINK_TEXT_SEGMENT)
            .map(|seg| (seg.fileoff + seg.filesize) as usize)
            .unwrap_or(content_len);

        let mut info = pool.info.clone();
        drop(pool);

        for action in &actions {
            match patch::apply(buffer, &action.patch, action.base_offset) {
                Ok(n) => info!("prelink patch/block {} applied ({n} matches)", action.label),
                Err(e) => warn!("prelink patch/block {} failed: {e}", action.label),
            }
        }

        let mut cursor = prelink_text_end;
        for entry in &self.config.add {
            if !entry.enabled {
                continue;
            }
            let min = version::parse_darwin_version(&entry.min_kernel);
            let max = version::parse_darwin_version(&entry.max_kernel);
            if !version::match_darwin_version(darwin_version, min, max) {
                info!("kext injection skips {} ({}): version mismatch", entry.bundle_path, entry.comment);
                continue;
            }
            let capacity = buffer.len();
            match self.inject_kext(buffer, &mut cursor, capacity, entry, &mut info) {
                Ok(()) => info!("kext injection {} ({}) succeeded", entry.bundle_path, entry.comment),
                Err(e) => warn!("kext injection {} ({}) failed: {e}", entry.bundle_path, entry.comment),
            }
        }

        let mut xml = Vec::new();
        info.to_writer_xml(&mut xml)
            .map_err(|e| Error::malformed(format!("failed to serialise prelink info: {e}")))?;
        if xml.len() > info_capacity {
            return Err(Error::ResourceExhausted("prelink info dictionary grew past its reserved section size".into()));
        }
        buffer[info_offset..info_offset + xml.len()].copy_from_slice(&xml);
        for b in &mut buffer[info_offset + xml.len()..info_offset + info_capacity] {
            *b = 0;
        }

        Ok(cursor.max(info_offset + info_capacity))
    }

    /// Appends one kext's plist + executable into the prelinked text
    /// region starting at `*cursor`, recording a new entry in `info`'s
    /// `_PrelinkInfoDictionary` array.
    fn inject_kext(
        &self,
        buffer: &mut [u8],
        cursor: &mut usize,
        capacity: usize,
        entry: &crate::config::AddKextEntry,
        info: &mut plist::Value,
    ) -> Result<()> {
        let plist_path = format!("{}/{}", entry.bundle_path, entry.plist_path);
        let plist_bytes = self.storage.read_file(&format!("Kexts/{plist_path}"))?;
        let identifier = plist::Value::from_reader(Cursor::new(&plist_bytes.bytes))
            .ok()
            .and_then(|v| v.as_dictionary().and_then(|d| d.get(BUNDLE_IDENTIFIER_KEY)).and_then(|v| v.as_string()).map(str::to_string))
            .ok_or_else(|| Error::malformed("kext plist is missing CFBundleIdentifier"))?;

        let mut load_addr = 0u64;
        let mut size = 0u64;

        if let Some(exec_path) = &entry.executable_path {
            let exec_bytes = self
                .storage
                .read_file(&format!("Kexts/{}/{}", entry.bundle_path, exec_path))?;
            let exec_ctx = MachContext::parse_maybe_fat(&exec_bytes.bytes)?;
            let mut scratch = vec![0u8; exec_bytes.bytes.len() * 2 + 4096];
            let written = crate::expander::expand(&exec_ctx, &mut scratch, true)?;

            let start = *cursor;
            let end = start + written;
            if end > capacity {
                return Err(Error::ResourceExhausted("prelinked buffer has no room left for injected kext".into()));
            }
            buffer[start..end].copy_from_slice(&scratch[..written]);
            *cursor = end;

            load_addr = exec_ctx
                .get_segment_by_name(crate::macho::constants::SEG_TEXT)
                .map(|seg| seg.vmaddr)
                .unwrap_or(0);
            size = written as u64;
        }

        let dict = info
            .as_dictionary_mut()
            .ok_or_else(|| Error::malformed("prelink info root is not a dictionary"))?;
        let array = dict
            .get_mut(PRELINK_INFO_DICTIONARY_KEY)
            .and_then(|v| v.as_array_mut())
            .ok_or_else(|| Error::malformed("prelink info is missing _PrelinkInfoDictionary"))?;

        let mut new_entry = plist::Dictionary::new();
        new_entry.insert(BUNDLE_IDENTIFIER_KEY.to_string(), plist::Value::String(identifier));
        new_entry.insert(PRELINK_BUNDLE_PATH_KEY.to_string(), plist::Value::String(format!("/Library/Extensions/{}", entry.bundle_path)));
        if size > 0 {
            new_entry.insert(PRELINK_EXECUTABLE_LOAD_ADDR_KEY.to_string(), plist::Value::Integer(load_addr.into()));
            new_entry.insert(PRELINK_EXECUTABLE_SIZE_KEY.to_string(), plist::Value::Integer(size.into()));
        }
        array.push(plist::Value::Dictionary(new_entry));

        Ok(())
    }
}

/// Resolves `name` to a file offset within `ctx`'s buffer via a defined,
/// external symbol lookup in its own symbol table.
fn resolve_symbol_offset(ctx: &MachContext<'_>, name: &str) -> Result<usize> {
    let symbols = ctx.symbols().ok_or_else(|| Error::malformed("context has no symbol table to resolve a base in"))?;
    for result in symbols.iter() {
        let (sym, sym_name) = result?;
        if sym_name == Some(name) && sym.is_defined() {
            let (offset, _) = ctx
                .file_offset_from_va(sym.n_value)
                .ok_or_else(|| Error::malformed(format!("symbol {name} has no backing file offset")))?;
            return Ok(offset);
        }
    }
    Err(Error::malformed(format!("base symbol {name} not found")))
}

/// Builds the patch that overwrites a kext's start-routine prologue so
/// loading it fails safely, per the block-kext contract.
fn block_action(ctx: &MachContext<'_>, identifier: &str) -> Result<ResolvedPatch> {
    let entry_va = ctx
        .get_section_by_name(crate::macho::constants::SEG_TEXT, crate::macho::constants::SECT_TEXT)
        .map(|s| s.addr)
        .ok_or_else(|| Error::malformed("blocked kext has no __text section to patch"))?;
    let (offset, remaining) = ctx
        .file_offset_from_va(entry_va)
        .ok_or_else(|| Error::malformed("blocked kext's start routine has no file backing"))?;
    // `xor eax, eax; ret` — a universally safe "fail immediately" stub.
    let stub: &[u8] = &[0x31, 0xc0, 0xc3];
    if remaining < stub.len() {
        return Err(Error::malformed("blocked kext's __text section is too small for the stub"));
    }
    Ok(ResolvedPatch {
        base_offset: offset,
        patch: Patch {
            find: vec![0; stub.len()],
            replace: stub.to_vec(),
            find_mask: Some(vec![0; stub.len()]),
            replace_mask: None,
            base: None,
            count: 1,
            skip: 0,
            limit: 0,
        },
        label: identifier.to_string(),
    })
}

/// The parsed prelinked container: the outer Mach-O context, the pool of
/// kexts extracted from `_PrelinkInfoDictionary`, and the parsed info
/// dictionary itself (kept so injection can append to it later).
///
/// Exposed publicly so a caller can open one directly (e.g. to inspect
/// the kext pool of an already-prelinked kernel) without going through
/// the full [`Orchestrator::process`] pipeline.
pub struct PrelinkedContext<'a> {
    pub ctx: MachContext<'a>,
    pub pool: KextPool<'a>,
    pub info: plist::Value,
}

impl<'a> PrelinkedContext<'a> {
    pub fn open(buffer: &'a [u8]) -> Result<Self> {
        let ctx = MachContext::parse(buffer)?;
        let section = ctx
            .get_section_by_name(PRELINK_INFO_SEGMENT, PRELINK_INFO_SECTION)
            .ok_or_else(|| Error::malformed("kernel has no __PRELINK_INFO section"))?;
        let info_bytes = ctx.bytes_at_va(section.addr, section.size as usize)?;
        let nul_at = info_bytes.iter().position(|&b| b == 0).unwrap_or(info_bytes.len());
        let info = plist::Value::from_reader(Cursor::new(&info_bytes[..nul_at]))
            .map_err(|e| Error::malformed(format!("failed to parse __PRELINK_INFO: {e}")))?;

        let entries: Vec<&plist::Dictionary> = info
            .as_dictionary()
            .and_then(|d| d.get(PRELINK_INFO_DICTIONARY_KEY))
            .and_then(|v| v.as_array())
            .ok_or_else(|| Error::malformed("_PrelinkInfoDictionary is missing or not an array"))?
            .iter()
            .filter_map(|v| v.as_dictionary())
            .collect();

        let mut pool = KextPool::default();

        for dict in &entries {
            let identifier = dict
                .get(BUNDLE_IDENTIFIER_KEY)
                .and_then(|v| v.as_string())
                .ok_or_else(|| Error::malformed("prelinked kext entry is missing CFBundleIdentifier"))?
                .to_string();

            let load_addr = dict.get(PRELINK_EXECUTABLE_LOAD_ADDR_KEY).and_then(|v| v.as_unsigned_integer());
            let size = dict.get(PRELINK_EXECUTABLE_SIZE_KEY).and_then(|v| v.as_unsigned_integer());

            let (linked_symbols, num_cxx_symbols, macho) = match (load_addr, size) {
                (Some(addr), Some(len)) if len > 0 => {
                    let sub_buffer = ctx.bytes_at_va(addr, len as usize)?;
                    let sub_ctx = MachContext::parse(sub_buffer)?;
                    let (syms, cxx) = collect_symbols(&sub_ctx)?;
                    (syms, cxx, sub_ctx)
                }
                // Codeless kexts (plist only, no linked executable) still
                // get a pool entry so dependents can resolve their name.
                // `PrelinkedKext` always owns a `MachContext`, so this
                // reuses the outer kernel's own (always-valid) context as
                // an inert placeholder rather than making `macho` optional.
                _ => (Vec::new(), 0, MachContext::parse(buffer)?),
            };

            let dependency_names: Vec<String> = dict
                .get(BUNDLE_LIBRARIES_KEY)
                .and_then(|v| v.as_dictionary())
                .map(|deps| deps.keys().cloned().collect())
                .unwrap_or_default();

            let dependencies = dependency_names
                .iter()
                .filter_map(|name| pool.find_by_identifier(name))
                .collect();

            pool.push(PrelinkedKext::new(identifier, linked_symbols, num_cxx_symbols, dependencies, macho));
        }

        Ok(PrelinkedContext { ctx, pool, info })
    }
}

/// Reads every symbol in `ctx`'s table and reorders it so mangled C++
/// names form a contiguous trailing slice, matching the invariant
/// [`PrelinkedKext::cxx_symbols`] assumes. A real prelinked symtab
/// already has this layout by construction; we re-derive it here since
/// this engine parses each kext's table directly rather than trusting
/// kxld's original bookkeeping.
fn collect_symbols<'a>(ctx: &MachContext<'a>) -> Result<(Vec<LinkedSymbol<'a>>, usize)> {
    let Some(table) = ctx.symbols() else {
        return Ok((Vec::new(), 0));
    };
    let mut plain = Vec::new();
    let mut cxx = Vec::new();
    for result in table.iter() {
        let (nlist, name) = result?;
        let sym = LinkedSymbol { name, nlist };
        if name.is_some_and(|n| n.starts_with("__Z")) {
            cxx.push(sym);
        } else {
            plain.push(sym);
        }
    }
    let num_cxx = cxx.len();
    plain.extend(cxx);
    Ok((plain, num_cxx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::storage::MemoryStorage;

    #[test]
    fn reservation_grows_with_enabled_add_entries() {
        let mut config = KernelConfig::default();
        config.add.push(crate::config::AddKextEntry {
            enabled: true,
            bundle_path: "Lilu.kext".into(),
            plist_path: "Contents/Info.plist".into(),
            executable_path: None,
            min_kernel: String::new(),
            max_kernel: String::new(),
            comment: String::new(),
        });
        let storage = MemoryStorage::new();
        let orchestrator = Orchestrator::new(&config, &storage, CpuInfo::default());
        assert!(orchestrator.reservation_size() > PRELINK_INFO_RESERVE_SIZE);
    }
}
