//! Kernel quota-control boundary.
//!
//! Translates a project ID plus byte limit into the XFS quota-control
//! protocol: a `fs_disk_quota` request issued through `quotactl(2)` against
//! the backing device. Limits travel in 512-byte basic blocks; byte values
//! are rounded up so a requested cap is never silently lowered.
//!
//! Hard and soft limits are always set equal, in one call carrying a
//! combined field mask, so there is no window where the two disagree.
//!
//! # Command Encoding
//!
//! XFS quota commands live in their own command space: `XQM_CMD(n)` is
//! `('X' << 8) + n`, and the full `quotactl` command shifts that past the
//! quota-type byte (`QCMD`). Project quotas are type 2.

use std::path::PathBuf;
use std::ptr;
use std::sync::Arc;

use nix::errno::Errno;
use thiserror::Error;

use crate::device::BackingDevice;

/// Quota block limits are expressed in 512-byte basic blocks.
pub const BASIC_BLOCK_SIZE: u64 = 512;

const fn xqm_cmd(n: i32) -> i32 {
    (('X' as i32) << 8) + n
}

const fn qcmd(cmd: i32, qtype: i32) -> i32 {
    (cmd << 8) | (qtype & 0xff)
}

/// Project quota type selector (`PRJQUOTA`).
const PRJQUOTA: i32 = 2;

/// `Q_XSETQLIM` scoped to project quotas: set disk limits.
const Q_XSETPQLIM: i32 = qcmd(xqm_cmd(4), PRJQUOTA);

/// `Q_XGETQUOTA` scoped to project quotas: get disk limits and usage.
const Q_XGETPQUOTA: i32 = qcmd(xqm_cmd(3), PRJQUOTA);

/// `fs_disk_quota` version understood by current kernels.
const FS_DQUOT_VERSION: i8 = 1;

/// Marks the record as a project quota (`d_flags`).
const FS_PROJ_QUOTA: i8 = 2;

/// Field-mask bit selecting the block soft limit.
const FS_DQ_BSOFT: u16 = 1 << 2;

/// Field-mask bit selecting the block hard limit.
const FS_DQ_BHARD: u16 = 1 << 3;

/// Mirror of the kernel's `struct fs_disk_quota` (`linux/dqblk_xfs.h`).
///
/// Block limits and counts are in 512-byte basic blocks.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct FsDiskQuota {
    d_version: i8,
    d_flags: i8,
    d_fieldmask: u16,
    d_id: u32,
    d_blk_hardlimit: u64,
    d_blk_softlimit: u64,
    d_ino_hardlimit: u64,
    d_ino_softlimit: u64,
    d_bcount: u64,
    d_icount: u64,
    d_itimer: i32,
    d_btimer: i32,
    d_iwarns: u16,
    d_bwarns: u16,
    d_padding2: i32,
    d_rtb_hardlimit: u64,
    d_rtb_softlimit: u64,
    d_rtbcount: u64,
    d_rtbtimer: i32,
    d_rtbwarns: u16,
    d_padding3: i16,
    d_padding4: [u8; 8],
}

/// Convert a byte limit to basic blocks, rounding up.
pub(crate) fn bytes_to_blocks(bytes: u64) -> u64 {
    bytes.div_ceil(BASIC_BLOCK_SIZE)
}

/// Convert a basic-block count back to bytes.
pub(crate) fn blocks_to_bytes(blocks: u64) -> u64 {
    blocks.saturating_mul(BASIC_BLOCK_SIZE)
}

/// Errors from kernel quota-control calls.
///
/// Every non-zero error code is surfaced with its (device, project ID)
/// context, never swallowed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LimitError {
    /// Setting the block limits failed.
    #[error("failed to set quota limit for project {project_id} on {device}: {errno}")]
    Set {
        /// Backing device the call addressed.
        device: PathBuf,
        /// Target project ID.
        project_id: u32,
        /// Kernel error code.
        errno: Errno,
    },

    /// Reading the block limits failed.
    #[error("failed to get quota limit for project {project_id} on {device}: {errno}")]
    Get {
        /// Backing device the call addressed.
        device: PathBuf,
        /// Target project ID.
        project_id: u32,
        /// Kernel error code.
        errno: Errno,
    },
}

/// Issues get/set limit calls for a project ID against a backing device.
pub trait QuotaBackend {
    /// Set both the hard and the soft block limit to `limit_bytes`.
    ///
    /// `limit_bytes == 0` means "no limit enforced".
    fn set_limit(
        &self,
        device: &BackingDevice,
        project_id: u32,
        limit_bytes: u64,
    ) -> Result<(), LimitError>;

    /// Read the current hard block limit in bytes.
    fn get_limit(&self, device: &BackingDevice, project_id: u32) -> Result<u64, LimitError>;
}

impl<B: QuotaBackend + ?Sized> QuotaBackend for Arc<B> {
    fn set_limit(
        &self,
        device: &BackingDevice,
        project_id: u32,
        limit_bytes: u64,
    ) -> Result<(), LimitError> {
        (**self).set_limit(device, project_id, limit_bytes)
    }

    fn get_limit(&self, device: &BackingDevice, project_id: u32) -> Result<u64, LimitError> {
        (**self).get_limit(device, project_id)
    }
}

/// The kernel-backed implementation: XFS quota commands via `quotactl(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct XfsQuotaBackend;

impl XfsQuotaBackend {
    /// Issue one quotactl command for `project_id` with `quota` as the
    /// request/response buffer.
    fn quotactl(
        device: &BackingDevice,
        cmd: i32,
        project_id: u32,
        quota: &mut FsDiskQuota,
    ) -> Result<(), Errno> {
        let special = device.to_cstring().ok_or(Errno::EINVAL)?;
        // The kernel takes qid_t as a signed int; IDs above i32::MAX still
        // round-trip bit-for-bit.
        #[allow(clippy::cast_possible_wrap)]
        let id = project_id as libc::c_int;
        // SAFETY: `special` is a valid NUL-terminated path, `quota` is a
        // correctly laid out fs_disk_quota, and both outlive the call.
        let rc = unsafe {
            libc::quotactl(
                cmd,
                special.as_ptr(),
                id,
                ptr::from_mut(quota).cast::<libc::c_char>(),
            )
        };
        Errno::result(rc).map(drop)
    }
}

impl QuotaBackend for XfsQuotaBackend {
    fn set_limit(
        &self,
        device: &BackingDevice,
        project_id: u32,
        limit_bytes: u64,
    ) -> Result<(), LimitError> {
        let blocks = bytes_to_blocks(limit_bytes);
        let mut quota = FsDiskQuota {
            d_version: FS_DQUOT_VERSION,
            d_flags: FS_PROJ_QUOTA,
            d_fieldmask: FS_DQ_BHARD | FS_DQ_BSOFT,
            d_id: project_id,
            d_blk_hardlimit: blocks,
            d_blk_softlimit: blocks,
            ..FsDiskQuota::default()
        };
        Self::quotactl(device, Q_XSETPQLIM, project_id, &mut quota).map_err(|errno| {
            LimitError::Set {
                device: device.path().to_owned(),
                project_id,
                errno,
            }
        })
    }

    fn get_limit(&self, device: &BackingDevice, project_id: u32) -> Result<u64, LimitError> {
        let mut quota = FsDiskQuota::default();
        Self::quotactl(device, Q_XGETPQUOTA, project_id, &mut quota).map_err(|errno| {
            LimitError::Get {
                device: device.path().to_owned(),
                project_id,
                errno,
            }
        })?;
        Ok(blocks_to_bytes(quota.d_blk_hardlimit))
    }
}
