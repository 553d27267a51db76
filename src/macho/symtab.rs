//! The nlist symbol table and its companion string table.

use scroll::{Pread, Pwrite, SizeWith};

use super::constants::*;
use super::load_command::{DysymtabCommand, SymtabCommand};
use crate::error::{Error, Result};

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct Nlist64 {
    pub n_strx: u32,
    pub n_type: u8,
    pub n_sect: u8,
    pub n_desc: u16,
    pub n_value: u64,
}

pub const SIZEOF_NLIST_64: usize = 16;

impl Nlist64 {
    #[inline(always)]
    pub fn is_defined(&self) -> bool {
        self.n_type & N_TYPE != N_UNDF
    }

    #[inline(always)]
    pub fn is_external(&self) -> bool {
        self.n_type & N_EXT != 0
    }

    /// A symbol that is defined but not external: a local symbol that the
    /// vtable linker must never try to patch over.
    #[inline(always)]
    pub fn is_local_defined(&self) -> bool {
        self.is_defined() && !self.is_external()
    }
}

/// A zero-copy view of a symbol table plus the string table it indexes
/// into. Every accessor re-validates bounds before handing back a slice.
#[derive(Debug, Clone, Copy)]
pub struct SymbolTable<'a> {
    data: &'a [u8],
    symoff: usize,
    nsyms: usize,
    stroff: usize,
    strsize: usize,
}

impl<'a> SymbolTable<'a> {
    pub fn parse(data: &'a [u8], symtab: &SymtabCommand) -> Result<Self> {
        let table = SymbolTable {
            data,
            symoff: symtab.symoff as usize,
            nsyms: symtab.nsyms as usize,
            stroff: symtab.stroff as usize,
            strsize: symtab.strsize as usize,
        };

        let sym_bytes = table
            .nsyms
            .checked_mul(SIZEOF_NLIST_64)
            .and_then(|n| n.checked_add(table.symoff))
            .ok_or_else(|| Error::malformed("symtab entries * size + offset overflows"))?;
        if sym_bytes > data.len() {
            return Err(Error::malformed("symtab entries run past end of file"));
        }

        let str_end = table
            .stroff
            .checked_add(table.strsize)
            .ok_or_else(|| Error::malformed("string table offset + size overflows"))?;
        if str_end > data.len() {
            return Err(Error::malformed("string table runs past end of file"));
        }
        if table.strsize > 0 && data[str_end - 1] != 0 {
            return Err(Error::malformed("string table is not NUL-terminated"));
        }

        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.nsyms
    }

    pub fn is_empty(&self) -> bool {
        self.nsyms == 0
    }

    /// Reads symbol `index` and resolves its name. An out-of-range string
    /// index is treated as an absent name rather than a hard error, per
    /// the reader's bounded-adversarial-input contract.
    pub fn get(&self, index: usize) -> Result<(Nlist64, Option<&'a str>)> {
        if index >= self.nsyms {
            return Err(Error::malformed("symbol index out of range"));
        }
        let off = self.symoff + index * SIZEOF_NLIST_64;
        let sym: Nlist64 = self.data.pread_with(off, scroll::LE)?;
        let name = self.string_at(sym.n_strx as usize);
        Ok((sym, name))
    }

    pub fn string_at(&self, strx: usize) -> Option<&'a str> {
        if strx >= self.strsize {
            return None;
        }
        self.data.pread::<&str>(self.stroff + strx).ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = Result<(Nlist64, Option<&'a str>)>> + '_ {
        (0..self.nsyms).map(move |i| self.get(i))
    }
}

/// Bookkeeping derived from the dysymtab command, used by the symbol
/// resolver to find the indirect symbol table when present.
#[derive(Debug, Clone, Copy, Default)]
pub struct DynamicSymbolInfo {
    pub indirect_symoff: usize,
    pub nindirectsyms: usize,
}

impl From<&DysymtabCommand> for DynamicSymbolInfo {
    fn from(d: &DysymtabCommand) -> Self {
        DynamicSymbolInfo {
            indirect_symoff: d.indirectsymoff as usize,
            nindirectsyms: d.nindirectsyms as usize,
        }
    }
}
