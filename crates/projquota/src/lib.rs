//! Per-directory disk limits backed by XFS project quota accounting.
//!
//! A storage layer that creates one directory per logical unit (a
//! container's writable layer, a build sandbox) can cap each directory's
//! total size without per-file accounting: every directory gets a unique,
//! monotonically increasing project ID tagged into its extended
//! attributes, and the kernel's project quota accounting enforces the
//! byte limit.
//!
//! The filesystem itself is the database. After a restart the registry is
//! rebuilt by reading the tags back from disk, so there is no separate
//! index file that could drift out of sync with the real attributes.
//! Initialization probes whether the kernel actually enforces project
//! quotas and fails fast when it does not: limits are never silently
//! ignored, and they are never emulated.
//!
//! # Components
//!
//! - [`attr`]: inheritable project-ID tags via the fsxattr ioctl pair
//! - [`backend`]: limit get/set via XFS `quotactl(2)` commands
//! - [`registry`]: ID allocation and restart recovery
//! - [`controller`]: the public assign-and-limit surface
//! - [`device`]: handle for the backing block-device node
//! - [`mem`]: in-memory stores for tests without an XFS mount
//!
//! # Example
//!
//! ```rust,no_run
//! use projquota::{BackingDevice, QuotaController};
//!
//! // The storage layer resolves the block device backing its home
//! // directory (typically a mknod'ed node next to it).
//! let device = BackingDevice::new("/var/lib/store/backingFsBlockDev");
//! let quotas = QuotaController::initialize("/var/lib/store/layers", device)?;
//!
//! quotas.set_quota("/var/lib/store/layers/abc", 10 * 1024 * 1024)?;
//! assert_eq!(quotas.get_quota("/var/lib/store/layers/abc")?, 10 * 1024 * 1024);
//! # Ok::<(), projquota::QuotaError>(())
//! ```

pub mod attr;
pub mod backend;
pub mod controller;
pub mod device;
pub mod error;
pub mod mem;
pub mod registry;

pub use controller::QuotaController;
pub use device::BackingDevice;
pub use error::{QuotaError, QuotaResult};
pub use registry::{ProjectAssignment, ProjectRegistry};
