//! Configuration surface consumed by the orchestrator: kext add/block
//! lists, kernel patches, CPUID emulation and the named quirks, all
//! deserialised from a property list.
//!
//! Kept deliberately opaque to everything below the orchestrator: nothing
//! in [`crate::macho`], [`crate::resolver`] or [`crate::vtable`] knows
//! this module exists.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::patch::Patch;

/// Decodes a lowercase hex string into bytes. Config-file patch bytes are
/// carried as hex rather than plist `<data>` blobs, so the only encoding
/// this module needs is one it owns outright.
fn decode_hex(s: &str) -> Result<Vec<u8>> {
    if s.len() % 2 != 0 {
        return Err(Error::malformed("hex byte string has odd length"));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| Error::malformed("invalid hex digit")))
        .collect()
}

/// Top-level `Kernel` dictionary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KernelConfig {
    #[serde(default)]
    pub add: Vec<AddKextEntry>,
    #[serde(default)]
    pub block: Vec<BlockKextEntry>,
    #[serde(default)]
    pub patch: Vec<PatchEntry>,
    #[serde(default)]
    pub emulate: EmulateConfig,
    #[serde(default)]
    pub quirks: QuirksConfig,
}

/// `Kernel.Add[]` entry: a kext bundle to inject into the prelinked image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddKextEntry {
    pub enabled: bool,
    pub bundle_path: String,
    pub plist_path: String,
    #[serde(default)]
    pub executable_path: Option<String>,
    #[serde(default)]
    pub min_kernel: String,
    #[serde(default)]
    pub max_kernel: String,
    #[serde(default)]
    pub comment: String,
}

/// `Kernel.Block[]` entry: a kext identifier to refuse to load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockKextEntry {
    pub enabled: bool,
    pub identifier: String,
    #[serde(default)]
    pub min_kernel: String,
    #[serde(default)]
    pub max_kernel: String,
    #[serde(default)]
    pub comment: String,
}

/// `Kernel.Patch[]` entry, the config-file shape of a [`Patch`] plus its
/// targeting and version-window fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchEntry {
    pub enabled: bool,
    /// "kernel" or a kext bundle identifier.
    pub identifier: String,
    #[serde(default)]
    pub base: Option<String>,
    /// Hex-encoded pattern bytes, e.g. `"0f30"`.
    pub find: String,
    pub replace: String,
    #[serde(default)]
    pub find_mask: Option<String>,
    #[serde(default)]
    pub replace_mask: Option<String>,
    #[serde(default)]
    pub count: usize,
    #[serde(default)]
    pub skip: usize,
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub min_kernel: String,
    #[serde(default)]
    pub max_kernel: String,
    #[serde(default)]
    pub comment: String,
}

impl PatchEntry {
    pub fn to_patch(&self) -> Result<Patch> {
        Ok(Patch {
            find: decode_hex(&self.find)?,
            replace: decode_hex(&self.replace)?,
            find_mask: self.find_mask.as_deref().map(decode_hex).transpose()?,
            replace_mask: self.replace_mask.as_deref().map(decode_hex).transpose()?,
            base: self.base.clone(),
            count: self.count,
            skip: self.skip,
            limit: self.limit,
        })
    }
}

/// `Kernel.Emulate.Cpuid1{Data,Mask}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmulateConfig {
    #[serde(default)]
    pub cpuid1_data: String,
    #[serde(default)]
    pub cpuid1_mask: String,
}

impl EmulateConfig {
    pub fn data(&self) -> Result<Vec<u8>> {
        decode_hex(&self.cpuid1_data)
    }

    pub fn mask(&self) -> Result<Vec<u8>> {
        decode_hex(&self.cpuid1_mask)
    }
}

impl EmulateConfig {
    pub fn is_active(&self) -> bool {
        !self.cpuid1_data.is_empty()
    }
}

/// `Kernel.Quirks.*`: one boolean per named quirk in [`crate::quirks`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuirksConfig {
    #[serde(default)]
    pub apple_cpu_pm_cfg_lock: bool,
    #[serde(default)]
    pub apple_xcpm_cfg_lock: bool,
    #[serde(default)]
    pub apple_xcpm_extra_msrs: bool,
    #[serde(default)]
    pub apple_xcpm_force_boost: bool,
    #[serde(default)]
    pub disable_io_mapper: bool,
    #[serde(default)]
    pub disable_rtc_checksum: bool,
    #[serde(default)]
    pub external_disk_icons: bool,
    #[serde(default)]
    pub increase_pci_bar_size: bool,
    #[serde(default)]
    pub lapic_kernel_panic: bool,
    #[serde(default)]
    pub panic_no_kext_dump: bool,
    #[serde(default)]
    pub power_timeout_kernel_panic: bool,
    #[serde(default)]
    pub third_party_drives: bool,
    #[serde(default)]
    pub xhci_port_limit: bool,
    #[serde(default)]
    pub custom_smbios_guid: bool,
    #[serde(default)]
    pub dummy_power_management: bool,
}

impl QuirksConfig {
    /// Enabled quirk IDs, in declaration order.
    pub fn enabled(&self) -> Vec<crate::quirks::QuirkId> {
        use crate::quirks::QuirkId;
        let table: &[(bool, QuirkId)] = &[
            (self.apple_cpu_pm_cfg_lock, QuirkId::AppleCpuPmCfgLock),
            (self.apple_xcpm_cfg_lock, QuirkId::AppleXcpmCfgLock),
            (self.apple_xcpm_extra_msrs, QuirkId::AppleXcpmExtraMsrs),
            (self.apple_xcpm_force_boost, QuirkId::AppleXcpmForceBoost),
            (self.disable_io_mapper, QuirkId::DisableIoMapper),
            (self.disable_rtc_checksum, QuirkId::DisableRtcChecksum),
            (self.external_disk_icons, QuirkId::ExternalDiskIcons),
            (self.increase_pci_bar_size, QuirkId::IncreasePciBarSize),
            (self.lapic_kernel_panic, QuirkId::LapicKernelPanic),
            (self.panic_no_kext_dump, QuirkId::PanicNoKextDump),
            (self.power_timeout_kernel_panic, QuirkId::PowerTimeoutKernelPanic),
            (self.third_party_drives, QuirkId::ThirdPartyDrives),
            (self.xhci_port_limit, QuirkId::XhciPortLimit),
            (self.custom_smbios_guid, QuirkId::CustomSmbiosGuid),
            (self.dummy_power_management, QuirkId::DummyPowerManagement),
        ];
        table.iter().filter(|(enabled, _)| *enabled).map(|(_, id)| *id).collect()
    }
}
