//! Free disk space probe consulted before a snapshot.
//!
//! The pipeline itself never checks capacity; callers run [`ensure_room`]
//! first with the configured threshold.

use std::io;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Capacity check failures.
#[derive(Debug, Error)]
pub enum DiskError {
    /// Less space than the configured threshold
    #[error("Insufficient free space on {path}: need {need} bytes, have {have}")]
    Insufficient {
        /// Probed path
        path: String,
        /// Required free bytes
        need: u64,
        /// Available free bytes
        have: u64,
    },
    /// The probe itself failed
    #[error("Free space probe failed on {path}: {source}")]
    Probe {
        /// Probed path
        path: String,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },
}

/// Reports bytes available to an unprivileged writer on the filesystem holding a path.
pub trait FreeSpaceProbe: Send + Sync {
    /// Free bytes available at `path`.
    fn free_bytes(&self, path: &Path) -> io::Result<u64>;
}

/// [`FreeSpaceProbe`] backed by `statvfs(3)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatvfsProbe;

#[cfg(unix)]
impl FreeSpaceProbe for StatvfsProbe {
    fn free_bytes(&self, path: &Path) -> io::Result<u64> {
        use std::ffi::CString;
        use std::mem::MaybeUninit;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let mut stat = MaybeUninit::<libc::statvfs>::uninit();
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        // statvfs returned 0, so the struct is filled in.
        let stat = unsafe { stat.assume_init() };
        Ok((stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64))
    }
}

#[cfg(not(unix))]
impl FreeSpaceProbe for StatvfsProbe {
    fn free_bytes(&self, _path: &Path) -> io::Result<u64> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "statvfs is only available on unix",
        ))
    }
}

/// Fail unless `probe` reports at least `min_free_bytes` at `path`.
pub fn ensure_room(
    probe: &dyn FreeSpaceProbe,
    path: &Path,
    min_free_bytes: u64,
) -> Result<u64, DiskError> {
    let have = probe.free_bytes(path).map_err(|source| DiskError::Probe {
        path: path.display().to_string(),
        source,
    })?;
    debug!(path = %path.display(), have, need = min_free_bytes, "free space probed");
    if have < min_free_bytes {
        return Err(DiskError::Insufficient {
            path: path.display().to_string(),
            need: min_free_bytes,
            have,
        });
    }
    Ok(have)
}
