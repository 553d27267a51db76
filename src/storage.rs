//! The storage collaborator: fetches kext plist and executable bytes by
//! path. Kept as a trait so the orchestrator never assumes a real
//! filesystem exists underneath it — the host environment is a firmware
//! volume, a test fixture, or anything else that can answer `read_file`.

use crate::error::{Error, Result};

/// A file fetched from storage: its bytes plus the size the caller
/// declared (kept distinct from `bytes.len()` because some callers size
/// a destination buffer before the read completes).
#[derive(Debug, Clone)]
pub struct FileContents {
    pub bytes: Vec<u8>,
}

impl FileContents {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Abstracts "fetch the bytes at this path" away from any concrete
/// filesystem. Paths are engine-relative, e.g. `Kexts/Lilu.kext/Contents/Info.plist`.
pub trait Storage {
    fn read_file(&self, path: &str) -> Result<FileContents>;
}

/// An in-memory [`Storage`] backing tests and any host that has already
/// staged its kext bundles into memory (e.g. a UEFI volume already read
/// into RAM).
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    files: std::collections::HashMap<String, Vec<u8>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) -> &mut Self {
        self.files.insert(path.into(), bytes.into());
        self
    }
}

impl Storage for MemoryStorage {
    fn read_file(&self, path: &str) -> Result<FileContents> {
        self.files
            .get(path)
            .map(|bytes| FileContents { bytes: bytes.clone() })
            .ok_or_else(|| Error::collaborator(path, "read_file", "file not found in storage"))
    }
}
