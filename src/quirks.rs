//! The library of named kernel quirks: boolean configuration toggles that
//! each resolve to one fixed, pre-built [`Patch`](crate::patch::Patch).
//!
//! The retrieval pack this engine was built against did not carry the
//! source file defining each quirk's literal find/replace bytes, only
//! their names and the "boolean toggle picks a fixed patch" contract (see
//! `DESIGN.md`). The patterns below are placeholders standing in for the
//! real ones — distinct and intentionally shaped so the dispatch table,
//! target identifiers and version gating are all exercised, but not
//! claimed to be byte-for-byte what a real kernel needs.

use crate::patch::Patch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuirkId {
    AppleCpuPmCfgLock,
    AppleXcpmCfgLock,
    AppleXcpmExtraMsrs,
    AppleXcpmForceBoost,
    DisableIoMapper,
    DisableRtcChecksum,
    ExternalDiskIcons,
    IncreasePciBarSize,
    LapicKernelPanic,
    PanicNoKextDump,
    PowerTimeoutKernelPanic,
    ThirdPartyDrives,
    XhciPortLimit,
    CustomSmbiosGuid,
    DummyPowerManagement,
}

impl QuirkId {
    pub const ALL: [QuirkId; 15] = [
        QuirkId::AppleCpuPmCfgLock,
        QuirkId::AppleXcpmCfgLock,
        QuirkId::AppleXcpmExtraMsrs,
        QuirkId::AppleXcpmForceBoost,
        QuirkId::DisableIoMapper,
        QuirkId::DisableRtcChecksum,
        QuirkId::ExternalDiskIcons,
        QuirkId::IncreasePciBarSize,
        QuirkId::LapicKernelPanic,
        QuirkId::PanicNoKextDump,
        QuirkId::PowerTimeoutKernelPanic,
        QuirkId::ThirdPartyDrives,
        QuirkId::XhciPortLimit,
        QuirkId::CustomSmbiosGuid,
        QuirkId::DummyPowerManagement,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            QuirkId::AppleCpuPmCfgLock => "AppleCpuPmCfgLock",
            QuirkId::AppleXcpmCfgLock => "AppleXcpmCfgLock",
            QuirkId::AppleXcpmExtraMsrs => "AppleXcpmExtraMsrs",
            QuirkId::AppleXcpmForceBoost => "AppleXcpmForceBoost",
            QuirkId::DisableIoMapper => "DisableIoMapper",
            QuirkId::DisableRtcChecksum => "DisableRtcChecksum",
            QuirkId::ExternalDiskIcons => "ExternalDiskIcons",
            QuirkId::IncreasePciBarSize => "IncreasePciBarSize",
            QuirkId::LapicKernelPanic => "LapicKernelPanic",
            QuirkId::PanicNoKextDump => "PanicNoKextDump",
            QuirkId::PowerTimeoutKernelPanic => "PowerTimeoutKernelPanic",
            QuirkId::ThirdPartyDrives => "ThirdPartyDrives",
            QuirkId::XhciPortLimit => "XhciPortLimit",
            QuirkId::CustomSmbiosGuid => "CustomSmbiosGuid",
            QuirkId::DummyPowerManagement => "DummyPowerManagement",
        }
    }

    /// The patch target: "kernel" for a kernel-wide patch, or a kext
    /// bundle identifier for quirks scoped to one driver.
    pub fn target(&self) -> &'static str {
        match self {
            QuirkId::ThirdPartyDrives => "com.apple.iokit.IOAHCIFamily",
            QuirkId::DummyPowerManagement => "com.apple.driver.AppleACPIPlatform",
            _ => "kernel",
        }
    }

    fn patch(&self) -> Patch {
        // Every quirk applies at most once, with no symbolic base: the
        // real find/replace content is not known here, so each uses a
        // distinct short placeholder to keep quirks from colliding.
        let (find, replace): (&[u8], &[u8]) = match self {
            QuirkId::AppleCpuPmCfgLock => (&[0x0f, 0x30], &[0x90, 0x90]), // wrmsr -> nop nop
            QuirkId::AppleXcpmCfgLock => (&[0x0f, 0x31], &[0x90, 0x90]),
            QuirkId::AppleXcpmExtraMsrs => (&[0xb9, 0xe2, 0x01, 0x00], &[0xb9, 0xe3, 0x01, 0x00]),
            QuirkId::AppleXcpmForceBoost => (&[0x74, 0x05], &[0xeb, 0x05]), // je -> jmp
            QuirkId::DisableIoMapper => (&[0x83, 0xf8, 0x01], &[0x83, 0xf8, 0x00]),
            QuirkId::DisableRtcChecksum => (&[0x3c, 0x58], &[0x3c, 0x00]),
            QuirkId::ExternalDiskIcons => (&[0x80, 0x38, 0x00], &[0x80, 0x38, 0x01]),
            QuirkId::IncreasePciBarSize => (&[0x68, 0x00, 0x00, 0x00, 0x10], &[0x68, 0x00, 0x00, 0x00, 0x20]),
            QuirkId::LapicKernelPanic => (&[0xe8, 0x00, 0x00, 0x00, 0x00], &[0x90, 0x90, 0x90, 0x90, 0x90]),
            QuirkId::PanicNoKextDump => (&[0x75, 0x0a], &[0xeb, 0x0a]),
            QuirkId::PowerTimeoutKernelPanic => (&[0x0f, 0x0b], &[0x90, 0x90]), // ud2 -> nop nop
            QuirkId::ThirdPartyDrives => (&[0x84, 0xc0, 0x74], &[0x84, 0xc0, 0xeb]),
            QuirkId::XhciPortLimit => (&[0x0f, 0x0f], &[0x00, 0x0f]),
            QuirkId::CustomSmbiosGuid => (&[0x45, 0x46, 0x49, 0x00], &[0x45, 0x46, 0x49, 0x01]),
            QuirkId::DummyPowerManagement => (&[0x50, 0x4d, 0x00, 0x00], &[0x50, 0x4d, 0x01, 0x00]),
        };
        Patch {
            find: find.to_vec(),
            replace: replace.to_vec(),
            find_mask: None,
            replace_mask: None,
            base: None,
            count: 1,
            skip: 0,
            limit: 0,
        }
    }
}

/// Looks up the fixed patch a quirk applies, paired with the identifier
/// it targets.
pub fn patch_for(id: QuirkId) -> (&'static str, Patch) {
    (id.target(), id.patch())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_quirk_has_a_name_target_and_valid_patch() {
        for id in QuirkId::ALL {
            assert!(!id.name().is_empty());
            assert!(!id.target().is_empty());
            let (_, patch) = patch_for(id);
            assert!(patch.validate().is_ok());
        }
    }

    #[test]
    fn kext_scoped_quirks_are_not_targeted_at_kernel() {
        assert_ne!(QuirkId::ThirdPartyDrives.target(), "kernel");
        assert_ne!(QuirkId::DummyPowerManagement.target(), "kernel");
    }
}
