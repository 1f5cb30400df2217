//! Inheritable project-ID tags on directories.
//!
//! The tag lives in the filesystem's extended attribute structure, read and
//! written through the generic `FS_IOC_FSGETXATTR` / `FS_IOC_FSSETXATTR`
//! ioctl pair on an open directory fd, not through the quota-control call.
//! Writes are read-modify-write: the structure carries flags unrelated to
//! project quotas that must be preserved.
//!
//! Reading a tag doubles as the cheapest support test: the get ioctl fails
//! outright on filesystems without the fsxattr interface.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::errno::Errno;
use thiserror::Error;

/// Flag bit causing new files and directories created under a tagged
/// directory to inherit its project ID.
pub const FS_XFLAG_PROJINHERIT: u32 = 0x0000_0200;

/// Mirror of the kernel's `struct fsxattr` (`linux/fs.h`).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Fsxattr {
    /// Extended flags (`FS_XFLAG_*`).
    pub fsx_xflags: u32,
    /// Extent size hint.
    pub fsx_extsize: u32,
    /// Number of extents (read-only).
    pub fsx_nextents: u32,
    /// Project identifier.
    pub fsx_projid: u32,
    /// Copy-on-write extent size hint.
    pub fsx_cowextsize: u32,
    /// Reserved.
    pub fsx_pad: [u8; 8],
}

mod sys {
    use super::Fsxattr;

    nix::ioctl_read!(fs_ioc_fsgetxattr, b'X', 31, Fsxattr);
    nix::ioctl_write_ptr!(fs_ioc_fssetxattr, b'X', 32, Fsxattr);
}

/// Errors from reading or writing a directory's project-ID tag.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AttrError {
    /// The directory could not be opened.
    #[error("failed to open directory {path}: {source}")]
    Open {
        /// Directory that could not be opened.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The get-attributes ioctl failed.
    #[error("failed to read project ID of {path}: {errno}")]
    Get {
        /// Directory whose tag could not be read.
        path: PathBuf,
        /// Kernel error code.
        errno: Errno,
    },

    /// The set-attributes ioctl failed.
    #[error("failed to tag {path} with project ID {project_id}: {errno}")]
    Set {
        /// Directory that could not be tagged.
        path: PathBuf,
        /// Project ID the write carried.
        project_id: u32,
        /// Kernel error code.
        errno: Errno,
    },
}

/// Reads and writes the inheritable project-ID tag on a directory.
pub trait AttrStore {
    /// Read the project ID tagged on `path` (0 if never tagged).
    fn project_id(&self, path: &Path) -> Result<u32, AttrError>;

    /// Tag `path` with `project_id` and mark the tag as inheritable by
    /// children created later under it.
    fn set_project_id(&self, path: &Path, project_id: u32) -> Result<(), AttrError>;
}

impl<S: AttrStore + ?Sized> AttrStore for Arc<S> {
    fn project_id(&self, path: &Path) -> Result<u32, AttrError> {
        (**self).project_id(path)
    }

    fn set_project_id(&self, path: &Path, project_id: u32) -> Result<(), AttrError> {
        (**self).set_project_id(path, project_id)
    }
}

/// The kernel-backed store: fsxattr ioctls on an open directory fd.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsAttrStore;

impl FsAttrStore {
    fn open_dir(path: &Path) -> Result<File, AttrError> {
        // O_DIRECTORY: refuse to tag through anything but a directory.
        OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_DIRECTORY)
            .open(path)
            .map_err(|source| AttrError::Open {
                path: path.to_owned(),
                source,
            })
    }

    fn read_attrs(dir: &File, path: &Path) -> Result<Fsxattr, AttrError> {
        let mut attrs = Fsxattr::default();
        // SAFETY: `dir` is an open directory fd and `attrs` is a correctly
        // laid out fsxattr the kernel writes into.
        unsafe { sys::fs_ioc_fsgetxattr(dir.as_raw_fd(), &mut attrs) }.map_err(|errno| {
            AttrError::Get {
                path: path.to_owned(),
                errno,
            }
        })?;
        Ok(attrs)
    }
}

impl AttrStore for FsAttrStore {
    fn project_id(&self, path: &Path) -> Result<u32, AttrError> {
        let dir = Self::open_dir(path)?;
        Ok(Self::read_attrs(&dir, path)?.fsx_projid)
    }

    fn set_project_id(&self, path: &Path, project_id: u32) -> Result<(), AttrError> {
        let dir = Self::open_dir(path)?;
        let mut attrs = Self::read_attrs(&dir, path)?;
        attrs.fsx_projid = project_id;
        attrs.fsx_xflags |= FS_XFLAG_PROJINHERIT;
        // SAFETY: `dir` is an open directory fd and `attrs` is a correctly
        // laid out fsxattr the kernel reads from.
        unsafe { sys::fs_ioc_fssetxattr(dir.as_raw_fd(), &attrs) }.map_err(|errno| {
            AttrError::Set {
                path: path.to_owned(),
                project_id,
                errno,
            }
        })?;
        Ok(())
    }
}
