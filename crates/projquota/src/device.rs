//! Backing-device handle for quota-control calls.

use std::ffi::CString;
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// Identifies the mounted filesystem instance that quota-control calls
/// operate on.
///
/// `quotactl(2)` addresses a filesystem through a block-device special
/// file. Resolving that node is the storage layer's job: it typically
/// stats the home directory and creates a device node for `st_dev` next to
/// it. This type only carries the resolved path, which must remain valid
/// for the lifetime of the controller using it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackingDevice {
    path: PathBuf,
}

impl BackingDevice {
    /// Wrap a resolved block-device path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The device node path handed to `quotactl(2)`.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The path as a NUL-terminated C string.
    ///
    /// Returns `None` only if the path contains an interior NUL byte.
    pub(crate) fn to_cstring(&self) -> Option<CString> {
        CString::new(self.path.as_os_str().as_bytes()).ok()
    }
}

impl fmt::Display for BackingDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.path.display().fmt(f)
    }
}
