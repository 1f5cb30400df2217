//! Public error taxonomy for quota operations.
//!
//! Errors carry enough context (path, project ID, device) for the caller to
//! log meaningfully. Nothing is retried internally: every operation here is
//! idempotent, so retry policy belongs to the caller.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::attr::AttrError;
use crate::backend::LimitError;

/// Result alias for quota operations.
pub type QuotaResult<T> = Result<T, QuotaError>;

/// Errors surfaced by the quota controller and registry.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QuotaError {
    /// Project quotas are unavailable under the home directory.
    ///
    /// Fatal at initialization: the subsystem must not be used at all.
    /// Callers should treat this as "quota feature unavailable" rather
    /// than a crash: many filesystems legitimately lack project-quota
    /// support.
    #[error("project quotas unsupported under {home}")]
    Unsupported {
        /// Home directory the probe ran against.
        home: PathBuf,
        /// The failure that revealed the missing support.
        source: Box<QuotaError>,
    },

    /// Tagging a directory with its project ID failed.
    #[error(transparent)]
    Attr(#[from] AttrError),

    /// A kernel quota-control call failed.
    ///
    /// On a filesystem where tagging succeeds this usually means quota
    /// accounting is not enabled (e.g. mounted without `prjquota`).
    #[error(transparent)]
    Limit(#[from] LimitError),

    /// A limit was requested for a path that was never assigned.
    #[error("no quota registered for {path}")]
    NotRegistered {
        /// The unregistered path.
        path: PathBuf,
    },

    /// An I/O failure outside the tag and quota interfaces (recovery scan,
    /// probe scratch directory).
    #[error("{context}: {source}")]
    Io {
        /// What was being attempted.
        context: String,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// The 32-bit project-ID space is exhausted.
    ///
    /// Only reachable when an existing tag sits at `u32::MAX`; IDs are
    /// never recycled, so the allocator refuses to wrap.
    #[error("project ID space exhausted")]
    IdExhausted,
}

impl QuotaError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// True when initialization failed because the filesystem cannot
    /// support project quotas.
    #[must_use]
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }
}
