//! Public quota surface: assign-and-limit, read-current-limit.
//!
//! The controller composes the registry with the attribute store and the
//! quota backend. `set_quota` runs allocate → tag → record → limit as one
//! critical section per registry; `get_quota` never allocates. All calls
//! are synchronous, bounded kernel operations: no background work, no
//! internal retries, no queueing.
//!
//! Initialization is fail-fast: it rebuilds the registry from on-disk tags
//! and then proves that the kernel actually enforces project quotas by
//! running a full assign-and-zero-limit cycle on a scratch directory.
//! Silently accepting limits the kernel ignores would be a correctness
//! hazard, so a failed probe aborts initialization with
//! [`QuotaError::Unsupported`].

use std::path::{Path, PathBuf};

use tempfile::Builder;
use tracing::{debug, warn};

use crate::attr::{AttrStore, FsAttrStore};
use crate::backend::{QuotaBackend, XfsQuotaBackend};
use crate::device::BackingDevice;
use crate::error::{QuotaError, QuotaResult};
use crate::registry::ProjectRegistry;

/// Name prefix of the scratch directory used by the support probe.
const PROBE_DIR_PREFIX: &str = "quota-probe-";

/// Assigns project IDs to directories and caps their size through the
/// kernel's project quota accounting.
///
/// Generic over the attribute store and quota backend so the full control
/// flow can run against the in-memory implementations in [`crate::mem`];
/// production callers use [`QuotaController::initialize`], which picks the
/// kernel-backed pair.
#[derive(Debug)]
pub struct QuotaController<A = FsAttrStore, B = XfsQuotaBackend> {
    home: PathBuf,
    device: BackingDevice,
    attrs: A,
    backend: B,
    registry: ProjectRegistry,
}

impl QuotaController {
    /// Initialize against `home` with the kernel-backed stores.
    ///
    /// `device` is the backing block-device node resolved by the storage
    /// layer; it must stay valid for the controller's lifetime.
    ///
    /// # Errors
    ///
    /// Returns [`QuotaError::Unsupported`] when `home` is not on a
    /// filesystem with working project quota accounting. Callers should
    /// treat that as "quota feature unavailable", not as a fatal fault of
    /// the storage layer.
    pub fn initialize(home: impl Into<PathBuf>, device: BackingDevice) -> QuotaResult<Self> {
        Self::with_parts(home, device, FsAttrStore, XfsQuotaBackend)
    }
}

impl<A: AttrStore, B: QuotaBackend> QuotaController<A, B> {
    /// Initialize with explicit store implementations.
    ///
    /// Rebuilds the registry from the tags on disk, then runs the support
    /// probe. The probe's scratch directory is removed whether or not the
    /// probe succeeds, and its trial allocation is erased so the first
    /// real assignment still receives the first usable ID.
    pub fn with_parts(
        home: impl Into<PathBuf>,
        device: BackingDevice,
        attrs: A,
        backend: B,
    ) -> QuotaResult<Self> {
        let home = home.into();
        let registry = ProjectRegistry::recover(&home, &attrs)?;
        let controller = Self {
            home,
            device,
            attrs,
            backend,
            registry,
        };
        controller.probe_support()?;
        debug!(
            home = %controller.home.display(),
            device = %controller.device,
            next_project_id = controller.registry.next_project_id(),
            "project quota controller initialized"
        );
        Ok(controller)
    }

    /// Assign a project ID to `path` (first call only) and set its block
    /// limit to `size_bytes`, hard == soft.
    ///
    /// `size_bytes == 0` means "no limit enforced". The limit the kernel
    /// stores is `size_bytes` rounded up to a multiple of 512 bytes.
    ///
    /// # Errors
    ///
    /// [`QuotaError::Attr`] if tagging fails: the path stays unregistered
    /// and a retry reattempts tagging with the same reserved ID.
    /// [`QuotaError::Limit`] if the kernel call fails after registration:
    /// the assignment stays in place with its previous limit.
    pub fn set_quota(&self, path: impl AsRef<Path>, size_bytes: u64) -> QuotaResult<()> {
        let path = path.as_ref();
        let mut registry = self.registry.guard();
        let allocation = registry.allocate(path)?;
        if allocation.newly_assigned {
            self.attrs.set_project_id(path, allocation.project_id)?;
            registry.record(path, allocation.project_id);
        }
        debug!(
            path = %path.display(),
            project_id = allocation.project_id,
            size_bytes,
            "setting project quota"
        );
        self.backend
            .set_limit(&self.device, allocation.project_id, size_bytes)?;
        registry.set_quota_bytes(path, size_bytes);
        Ok(())
    }

    /// Read the current hard limit for `path`, in bytes.
    ///
    /// # Errors
    ///
    /// [`QuotaError::NotRegistered`] if `path` was never assigned; reads
    /// never allocate.
    pub fn get_quota(&self, path: impl AsRef<Path>) -> QuotaResult<u64> {
        let path = path.as_ref();
        let registry = self.registry.guard();
        let project_id = registry
            .lookup(path)
            .ok_or_else(|| QuotaError::NotRegistered {
                path: path.to_owned(),
            })?;
        let limit = self.backend.get_limit(&self.device, project_id)?;
        Ok(limit)
    }

    /// The home directory this controller manages.
    #[must_use]
    pub fn home(&self) -> &Path {
        &self.home
    }

    /// The backing device quota calls are issued against.
    #[must_use]
    pub fn device(&self) -> &BackingDevice {
        &self.device
    }

    /// Read-only view of the registry, for diagnostics.
    #[must_use]
    pub fn registry(&self) -> &ProjectRegistry {
        &self.registry
    }

    fn probe_support(&self) -> QuotaResult<()> {
        let restore_next = self.registry.next_project_id();
        let scratch = Builder::new()
            .prefix(PROBE_DIR_PREFIX)
            .tempdir_in(&self.home)
            .map_err(|source| {
                QuotaError::io(
                    format!("create probe directory under {}", self.home.display()),
                    source,
                )
            })?;
        let outcome = self.set_quota(scratch.path(), 0);
        // TempDir removes the scratch directory on drop either way.
        self.registry.forget_probe(scratch.path(), restore_next);
        outcome.map_err(|source| {
            warn!(
                home = %self.home.display(),
                error = %source,
                "project quota support probe failed"
            );
            QuotaError::Unsupported {
                home: self.home.clone(),
                source: Box::new(source),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::*;
    use crate::mem::{InMemoryAttrStore, InMemoryQuotaBackend};

    fn device() -> BackingDevice {
        BackingDevice::new("/dev/backing-test")
    }

    #[test]
    fn test_probe_leaves_no_trace() {
        let home = TempDir::new().unwrap();
        let controller = QuotaController::with_parts(
            home.path(),
            device(),
            InMemoryAttrStore::new(),
            InMemoryQuotaBackend::new(),
        )
        .unwrap();

        assert!(controller.registry().is_empty());
        assert_eq!(controller.registry().next_project_id(), 1);
        assert_eq!(fs::read_dir(home.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_worked_example() {
        let home = TempDir::new().unwrap();
        let a = home.path().join("a");
        let b = home.path().join("b");
        fs::create_dir(&a).unwrap();
        fs::create_dir(&b).unwrap();

        let attrs = Arc::new(InMemoryAttrStore::new());
        let controller = QuotaController::with_parts(
            home.path(),
            device(),
            Arc::clone(&attrs),
            InMemoryQuotaBackend::new(),
        )
        .unwrap();

        controller.set_quota(&a, 10 * 1024 * 1024).unwrap();
        controller.set_quota(&b, 20 * 1024 * 1024).unwrap();

        assert_eq!(controller.registry().project_id_of(&a), Some(1));
        assert_eq!(controller.registry().project_id_of(&b), Some(2));
        assert_eq!(controller.get_quota(&a).unwrap(), 10_485_760);
        // Tag written through, marked inheritable.
        assert_eq!(attrs.project_id(&a).unwrap(), 1);
        assert!(attrs.inherits(&a));
    }

    #[test]
    fn test_failed_probe_is_unsupported_and_cleans_up() {
        let home = TempDir::new().unwrap();
        let backend = InMemoryQuotaBackend::new();
        backend.refuse_calls(true);

        let err = QuotaController::with_parts(
            home.path(),
            device(),
            InMemoryAttrStore::new(),
            backend,
        )
        .unwrap_err();

        assert!(err.is_unsupported());
        assert_eq!(fs::read_dir(home.path()).unwrap().count(), 0);
    }
}
