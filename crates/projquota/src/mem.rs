//! In-memory store implementations.
//!
//! Substitutes for the kernel-backed stores in test environments without an
//! XFS mount: [`InMemoryAttrStore`] keeps tags keyed by path,
//! [`InMemoryQuotaBackend`] keeps block limits keyed by project ID and
//! mirrors the real backend's 512-byte block rounding. Both offer failure
//! injection so callers can exercise the unsupported-filesystem and
//! permission-error paths.
//!
//! These are test doubles, not a fallback: quotas are never emulated on
//! filesystems without project-quota support.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use nix::errno::Errno;

use crate::attr::{AttrError, AttrStore};
use crate::backend::{blocks_to_bytes, bytes_to_blocks, LimitError, QuotaBackend};
use crate::device::BackingDevice;

#[derive(Debug, Default)]
struct AttrState {
    tags: HashMap<PathBuf, u32>,
    inherit: HashSet<PathBuf>,
    denied: HashSet<PathBuf>,
}

/// In-memory [`AttrStore`]: tags keyed by path.
#[derive(Debug, Default)]
pub struct InMemoryAttrStore {
    state: Mutex<AttrState>,
}

impl InMemoryAttrStore {
    /// Create an empty store (every path reads as untagged).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-tag a path, as if an earlier process or an operator had done it.
    pub fn seed(&self, path: &Path, project_id: u32) {
        self.lock().tags.insert(path.to_owned(), project_id);
    }

    /// Make accesses to `path` fail, simulating a permission or I/O error.
    pub fn deny(&self, path: &Path) {
        self.lock().denied.insert(path.to_owned());
    }

    /// Undo a previous [`Self::deny`].
    pub fn allow(&self, path: &Path) {
        self.lock().denied.remove(path);
    }

    /// Whether the inheritable bit has been set on `path`.
    #[must_use]
    pub fn inherits(&self, path: &Path) -> bool {
        self.lock().inherit.contains(path)
    }

    fn lock(&self) -> MutexGuard<'_, AttrState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AttrStore for InMemoryAttrStore {
    fn project_id(&self, path: &Path) -> Result<u32, AttrError> {
        let state = self.lock();
        if state.denied.contains(path) {
            return Err(AttrError::Get {
                path: path.to_owned(),
                errno: Errno::EACCES,
            });
        }
        Ok(state.tags.get(path).copied().unwrap_or(0))
    }

    fn set_project_id(&self, path: &Path, project_id: u32) -> Result<(), AttrError> {
        let mut state = self.lock();
        if state.denied.contains(path) {
            return Err(AttrError::Set {
                path: path.to_owned(),
                project_id,
                errno: Errno::EACCES,
            });
        }
        state.tags.insert(path.to_owned(), project_id);
        state.inherit.insert(path.to_owned());
        Ok(())
    }
}

#[derive(Debug, Default)]
struct BackendState {
    /// Hard-limit blocks per project ID (soft mirrors hard).
    limits: HashMap<u32, u64>,
    refuse: bool,
}

/// In-memory [`QuotaBackend`]: block limits keyed by project ID.
#[derive(Debug, Default)]
pub struct InMemoryQuotaBackend {
    state: Mutex<BackendState>,
}

impl InMemoryQuotaBackend {
    /// Create an empty backend (every project reads as unlimited).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every call while `refuse` is true, simulating a filesystem
    /// mounted without quota accounting.
    pub fn refuse_calls(&self, refuse: bool) {
        self.lock().refuse = refuse;
    }

    /// The stored hard limit for `project_id`, in blocks.
    #[must_use]
    pub fn limit_blocks(&self, project_id: u32) -> Option<u64> {
        self.lock().limits.get(&project_id).copied()
    }

    fn lock(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl QuotaBackend for InMemoryQuotaBackend {
    fn set_limit(
        &self,
        device: &BackingDevice,
        project_id: u32,
        limit_bytes: u64,
    ) -> Result<(), LimitError> {
        let mut state = self.lock();
        if state.refuse {
            return Err(LimitError::Set {
                device: device.path().to_owned(),
                project_id,
                errno: Errno::EOPNOTSUPP,
            });
        }
        state.limits.insert(project_id, bytes_to_blocks(limit_bytes));
        Ok(())
    }

    fn get_limit(&self, device: &BackingDevice, project_id: u32) -> Result<u64, LimitError> {
        let state = self.lock();
        if state.refuse {
            return Err(LimitError::Get {
                device: device.path().to_owned(),
                project_id,
                errno: Errno::EOPNOTSUPP,
            });
        }
        Ok(blocks_to_bytes(state.limits.get(&project_id).copied().unwrap_or(0)))
    }
}
