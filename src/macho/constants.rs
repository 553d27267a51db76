//! Raw constants from `<mach-o/loader.h>` and friends, x86_64-only.

/// 64-bit magic, little-endian host.
pub const MH_MAGIC_64: u32 = 0xfeed_facf;
/// 64-bit magic, byte-swapped (big-endian fat wrapper host).
pub const MH_CIGAM_64: u32 = 0xcffa_edfe;

pub mod cputype {
    pub const CPU_ARCH_ABI64: u32 = 0x0100_0000;
    pub const CPU_TYPE_X86: u32 = 7;
    pub const CPU_TYPE_X86_64: u32 = CPU_TYPE_X86 | CPU_ARCH_ABI64;
}

/// relocatable object file - explicitly unsupported by this engine.
pub const MH_OBJECT: u32 = 0x1;
/// demand paged executable file
pub const MH_EXECUTE: u32 = 0x2;
/// dynamically bound bundle file (kext)
pub const MH_KEXT_BUNDLE: u32 = 0xb;

/// the object file is input for the dynamic linker and can't be statically
/// link edited again; presence gates whether dysymtab/indirect-symbol
/// tables are looked up.
pub const MH_DYLDLINK: u32 = 0x4;

pub const LC_REQ_DYLD: u32 = 0x8000_0000;

pub const LC_SEGMENT_64: u32 = 0x19;
pub const LC_SYMTAB: u32 = 0x2;
pub const LC_DYSYMTAB: u32 = 0xb;
pub const LC_UUID: u32 = 0x1b;
pub const LC_UNIXTHREAD: u32 = 0x5;
pub const LC_THREAD: u32 = 0x4;
pub const LC_MAIN: u32 = 0x28 | LC_REQ_DYLD;

pub const LC_CODE_SIGNATURE: u32 = 0x1d;
pub const LC_DYLD_INFO: u32 = 0x22;
pub const LC_DYLD_INFO_ONLY: u32 = 0x22 | LC_REQ_DYLD;
pub const LC_FUNCTION_STARTS: u32 = 0x26;
pub const LC_DATA_IN_CODE: u32 = 0x29;
pub const LC_DYLIB_CODE_SIGN_DRS: u32 = 0x2b;

/// the segment containing all structs created and maintained by the link
/// editor: symbol, string and relocation tables.
pub const SEG_LINKEDIT: &str = "__LINKEDIT";
pub const SEG_TEXT: &str = "__TEXT";
pub const SECT_TEXT: &str = "__text";

/// section offset of zero means the section is zero-filled and contributes
/// no bytes to the file.
pub const S_ZEROFILL: u32 = 0x1;
pub const SECTION_TYPE: u32 = 0x0000_00ff;

/// x86_64 page size this engine aligns segment deltas to.
pub const X86_PAGE_SIZE: u64 = 0x1000;

/// nlist `n_type` bits.
pub const N_STAB: u8 = 0xe0;
pub const N_TYPE: u8 = 0x0e;
pub const N_EXT: u8 = 0x01;
pub const N_UNDF: u8 = 0x0;
