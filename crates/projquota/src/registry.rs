//! Project-ID allocation and recovery.
//!
//! The registry owns the one piece of shared-mutable state in the system:
//! the path → project-ID mapping and the allocation cursor. There is no
//! persisted index: the filesystem itself is the database. At startup the
//! mapping is rebuilt by reading the tags already on disk, so the
//! association survives process restarts without a state file that could
//! drift out of sync with the real attributes.
//!
//! # Invariants
//!
//! - Project IDs are unique among all assignments this registry ever made
//!   and strictly increase in allocation order.
//! - `next_project_id` exceeds every ID observed on disk under the home
//!   directory, including orphaned or externally-assigned tags, so new
//!   allocations can never collide with a pre-existing tag.
//! - `next_project_id` never decreases and never wraps.
//! - IDs are never reclaimed: removing a directory does not free its ID,
//!   which keeps a stale kernel quota record from silently reappearing on
//!   a new directory that would otherwise receive a recycled ID.
//!
//! # Baseline Offset
//!
//! The home directory's own tag (0 if untagged) is the baseline: the first
//! ID this registry hands out is `baseline + 1`. An operator can therefore
//! pre-tag the home directory to reserve the ID range at or below that
//! value for external quota management.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::attr::AttrStore;
use crate::error::{QuotaError, QuotaResult};

/// One directory's quota identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectAssignment {
    /// Absolute directory path; unique key within the registry.
    pub path: PathBuf,
    /// Assigned project ID.
    pub project_id: u32,
    /// Last successfully-set block limit in bytes. `None` until the first
    /// successful limit call; `Some(0)` is an explicit "no limit".
    pub quota_bytes: Option<u64>,
}

/// Outcome of an [`RegistryGuard::allocate`] call.
pub(crate) struct Allocation {
    /// The ID assigned or looked up.
    pub project_id: u32,
    /// True if the path had no confirmed assignment yet, meaning the
    /// caller still has to tag the directory and record the result.
    pub newly_assigned: bool,
}

#[derive(Debug)]
struct RegistryState {
    baseline_project_id: u32,
    next_project_id: u32,
    assignments: HashMap<PathBuf, ProjectAssignment>,
    /// IDs reserved for a path whose tag write has not been confirmed yet.
    /// A retry after a failed tagging attempt reuses the reserved ID
    /// instead of burning a fresh one, and the allocation cursor never
    /// moves backwards.
    pending: HashMap<PathBuf, u32>,
}

/// In-memory mapping of directory path → project ID, with allocation and
/// recovery. Internally locked; see [`ProjectRegistry::guard`].
#[derive(Debug)]
pub struct ProjectRegistry {
    state: Mutex<RegistryState>,
}

impl ProjectRegistry {
    /// Rebuild the registry from the tags already on disk.
    ///
    /// Reads the home directory's own tag as the baseline offset, then
    /// scans the immediate subdirectories of `home`: every tagged ID > 0
    /// is recorded and the allocation cursor is advanced past it.
    ///
    /// # Errors
    ///
    /// Returns [`QuotaError::Unsupported`] if the home directory's tag
    /// cannot be read (the fsxattr interface is the first support test),
    /// and fails outright on any unreadable subdirectory, since a skipped
    /// directory could hide a colliding project ID.
    pub fn recover(home: &Path, attrs: &impl AttrStore) -> QuotaResult<Self> {
        let baseline = attrs
            .project_id(home)
            .map_err(|source| QuotaError::Unsupported {
                home: home.to_owned(),
                source: Box::new(source.into()),
            })?;
        let mut next = baseline.checked_add(1).ok_or(QuotaError::IdExhausted)?;

        let mut assignments = HashMap::new();
        let entries = fs::read_dir(home)
            .map_err(|source| QuotaError::io(format!("read directory {}", home.display()), source))?;
        for entry in entries {
            let entry = entry.map_err(|source| {
                QuotaError::io(format!("read directory {}", home.display()), source)
            })?;
            let file_type = entry.file_type().map_err(|source| {
                QuotaError::io(format!("stat {}", entry.path().display()), source)
            })?;
            if !file_type.is_dir() {
                continue;
            }
            let path = entry.path();
            let project_id = attrs.project_id(&path)?;
            if project_id == 0 {
                continue;
            }
            next = next.max(project_id.checked_add(1).ok_or(QuotaError::IdExhausted)?);
            assignments.insert(
                path.clone(),
                ProjectAssignment {
                    path,
                    project_id,
                    quota_bytes: None,
                },
            );
        }

        debug!(
            home = %home.display(),
            baseline_project_id = baseline,
            next_project_id = next,
            recovered = assignments.len(),
            "rebuilt project registry from on-disk tags"
        );
        Ok(Self {
            state: Mutex::new(RegistryState {
                baseline_project_id: baseline,
                next_project_id: next,
                assignments,
                pending: HashMap::new(),
            }),
        })
    }

    /// Acquire the registry lock for one controller operation.
    ///
    /// The controller holds the guard across its whole call (allocate, tag,
    /// record, limit update): quota operations are infrequent and not
    /// latency-sensitive, and the single critical section rules out
    /// half-initialized assignments and duplicate IDs under concurrency.
    pub(crate) fn guard(&self) -> RegistryGuard<'_> {
        RegistryGuard {
            state: self.lock(),
        }
    }

    /// Erase the probe's traces: its scratch directory is gone and no
    /// caller has observed the ID, so the first real assignment still
    /// receives the first usable ID.
    pub(crate) fn forget_probe(&self, path: &Path, restore_next: u32) {
        let mut state = self.lock();
        state.assignments.remove(path);
        state.pending.remove(path);
        state.next_project_id = restore_next;
    }

    /// The project ID tagged on the home directory at recovery (0 if none).
    #[must_use]
    pub fn baseline_project_id(&self) -> u32 {
        self.lock().baseline_project_id
    }

    /// The smallest unused project ID.
    #[must_use]
    pub fn next_project_id(&self) -> u32 {
        self.lock().next_project_id
    }

    /// The confirmed project ID for `path`, if any.
    #[must_use]
    pub fn project_id_of(&self, path: &Path) -> Option<u32> {
        self.lock().assignments.get(path).map(|a| a.project_id)
    }

    /// Snapshot of all confirmed assignments.
    #[must_use]
    pub fn assignments(&self) -> Vec<ProjectAssignment> {
        self.lock().assignments.values().cloned().collect()
    }

    /// Number of confirmed assignments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().assignments.len()
    }

    /// True if no assignment has been confirmed yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        // A poisoning panic cannot leave the state half-mutated: every
        // mutation is a single insert/remove after its kernel call
        // succeeded.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive access to the registry for the duration of one operation.
pub(crate) struct RegistryGuard<'a> {
    state: MutexGuard<'a, RegistryState>,
}

impl RegistryGuard<'_> {
    /// Return the existing ID for `path`, or reserve the next one.
    ///
    /// Reservation does not touch the disk; tagging is the caller's job,
    /// confirmed afterwards via [`Self::record`].
    pub(crate) fn allocate(&mut self, path: &Path) -> QuotaResult<Allocation> {
        if let Some(existing) = self.state.assignments.get(path) {
            return Ok(Allocation {
                project_id: existing.project_id,
                newly_assigned: false,
            });
        }
        if let Some(&reserved) = self.state.pending.get(path) {
            return Ok(Allocation {
                project_id: reserved,
                newly_assigned: true,
            });
        }
        let project_id = self.state.next_project_id;
        self.state.next_project_id = project_id.checked_add(1).ok_or(QuotaError::IdExhausted)?;
        self.state.pending.insert(path.to_owned(), project_id);
        Ok(Allocation {
            project_id,
            newly_assigned: true,
        })
    }

    /// Confirm an assignment after the tag write succeeded.
    pub(crate) fn record(&mut self, path: &Path, project_id: u32) {
        self.state.pending.remove(path);
        self.state.assignments.insert(
            path.to_owned(),
            ProjectAssignment {
                path: path.to_owned(),
                project_id,
                quota_bytes: None,
            },
        );
    }

    /// Remember the last successfully-set limit for `path`.
    pub(crate) fn set_quota_bytes(&mut self, path: &Path, quota_bytes: u64) {
        if let Some(assignment) = self.state.assignments.get_mut(path) {
            assignment.quota_bytes = Some(quota_bytes);
        }
    }

    /// The confirmed project ID for `path`, if any.
    pub(crate) fn lookup(&self, path: &Path) -> Option<u32> {
        self.state.assignments.get(path).map(|a| a.project_id)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;
    use crate::mem::InMemoryAttrStore;

    fn empty_registry() -> ProjectRegistry {
        ProjectRegistry {
            state: Mutex::new(RegistryState {
                baseline_project_id: 0,
                next_project_id: 1,
                assignments: HashMap::new(),
                pending: HashMap::new(),
            }),
        }
    }

    #[test]
    fn test_allocate_is_monotonic_per_path() {
        let registry = empty_registry();
        let mut guard = registry.guard();
        let a = guard.allocate(Path::new("/data/a")).unwrap();
        guard.record(Path::new("/data/a"), a.project_id);
        let b = guard.allocate(Path::new("/data/b")).unwrap();
        guard.record(Path::new("/data/b"), b.project_id);
        assert_eq!(a.project_id, 1);
        assert_eq!(b.project_id, 2);
        assert!(a.newly_assigned && b.newly_assigned);
    }

    #[test]
    fn test_allocate_returns_existing_assignment() {
        let registry = empty_registry();
        let mut guard = registry.guard();
        let first = guard.allocate(Path::new("/data/a")).unwrap();
        guard.record(Path::new("/data/a"), first.project_id);
        let again = guard.allocate(Path::new("/data/a")).unwrap();
        assert_eq!(again.project_id, first.project_id);
        assert!(!again.newly_assigned);
    }

    #[test]
    fn test_pending_reservation_survives_failed_tagging() {
        let registry = empty_registry();
        let mut guard = registry.guard();

        // First attempt reserves ID 1 but tagging fails: no record call.
        let first = guard.allocate(Path::new("/data/a")).unwrap();
        assert_eq!(first.project_id, 1);

        // An unrelated path does not steal the reservation.
        let other = guard.allocate(Path::new("/data/b")).unwrap();
        assert_eq!(other.project_id, 2);

        // The retry gets the same reserved ID, still as a new assignment.
        let retry = guard.allocate(Path::new("/data/a")).unwrap();
        assert_eq!(retry.project_id, 1);
        assert!(retry.newly_assigned);
        drop(guard);

        // Not registered until record confirms the tag.
        assert_eq!(registry.project_id_of(Path::new("/data/a")), None);
    }

    #[test]
    fn test_recover_uses_home_tag_as_baseline() {
        let home = TempDir::new().unwrap();
        let attrs = InMemoryAttrStore::new();
        attrs.seed(home.path(), 999);

        let registry = ProjectRegistry::recover(home.path(), &attrs).unwrap();
        assert_eq!(registry.baseline_project_id(), 999);
        assert_eq!(registry.next_project_id(), 1000);
    }

    #[test]
    fn test_recover_advances_past_existing_tags() {
        let home = TempDir::new().unwrap();
        let tagged = home.path().join("layer-a");
        let untagged = home.path().join("layer-b");
        fs::create_dir(&tagged).unwrap();
        fs::create_dir(&untagged).unwrap();
        // Manually assigned tag far above anything this registry produced.
        let attrs = InMemoryAttrStore::new();
        attrs.seed(&tagged, 1005);

        let registry = ProjectRegistry::recover(home.path(), &attrs).unwrap();
        assert_eq!(registry.project_id_of(&tagged), Some(1005));
        assert_eq!(registry.project_id_of(&untagged), None);
        assert_eq!(registry.next_project_id(), 1006);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_recover_skips_plain_files() {
        let home = TempDir::new().unwrap();
        fs::write(home.path().join("not-a-dir"), b"x").unwrap();

        let registry = ProjectRegistry::recover(home.path(), &InMemoryAttrStore::new()).unwrap();
        assert!(registry.is_empty());
        assert_eq!(registry.next_project_id(), 1);
    }

    #[test]
    fn test_recover_fails_on_unreadable_subdirectory() {
        let home = TempDir::new().unwrap();
        let opaque = home.path().join("opaque");
        fs::create_dir(&opaque).unwrap();
        let attrs = InMemoryAttrStore::new();
        attrs.deny(&opaque);

        let err = ProjectRegistry::recover(home.path(), &attrs).unwrap_err();
        assert!(matches!(err, QuotaError::Attr(_)));
    }

    #[test]
    fn test_recover_fails_on_unreadable_home() {
        let home = TempDir::new().unwrap();
        let attrs = InMemoryAttrStore::new();
        attrs.deny(home.path());

        let err = ProjectRegistry::recover(home.path(), &attrs).unwrap_err();
        assert!(err.is_unsupported());
    }
}
