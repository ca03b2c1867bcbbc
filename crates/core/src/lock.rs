//! Process-wide instance lock
//!
//! Windows uses a named mutex. Unix uses an exclusive advisory lock on a file
//! in the runtime directory; the kernel drops it when the owning process
//! exits, so a crashed primary never leaves a stale lock behind.

use crate::config::GuardConfig;
use crate::error::{InstanceError, Result};

/// Which side of the single-instance protocol this process is on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Holds the lock and owns the activation listener
    Primary,
    /// Found the lock taken; forwards its arguments and exits
    Secondary,
}

/// Opaque ownership of the instance lock, released on drop
#[derive(Debug)]
pub struct LockHandle {
    inner: imp::OsLock,
}

/// One-shot, non-blocking check at startup.
///
/// Returns the role together with the lock when this process became primary.
pub fn acquire_or_detect(config: &GuardConfig) -> Result<(Role, Option<LockHandle>)> {
    match imp::try_acquire(config)? {
        Some(inner) => {
            tracing::info!("Acquired instance lock `{}`", config.mutex_name);
            Ok((Role::Primary, Some(LockHandle { inner })))
        }
        None => {
            tracing::info!(
                "Instance lock `{}` is held by another process",
                config.mutex_name
            );
            Ok((Role::Secondary, None))
        }
    }
}

impl LockHandle {
    /// Release the lock before the process exits
    pub fn release(self) {
        drop(self);
    }

    /// Keep the lock held until the process exits
    pub fn retain_until_exit(self) {
        std::mem::forget(self);
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.inner.release();
        tracing::debug!("Instance lock released");
    }
}

#[cfg(windows)]
mod imp {
    use super::*;
    use std::io;
    use windows::core::{Error, HSTRING};
    use windows::Win32::Foundation::{CloseHandle, ERROR_ALREADY_EXISTS, HANDLE};
    use windows::Win32::System::Threading::{CreateMutexW, ReleaseMutex};

    #[derive(Debug)]
    pub struct OsLock {
        handle: HANDLE,
    }

    pub fn try_acquire(config: &GuardConfig) -> Result<Option<OsLock>> {
        let name = HSTRING::from(config.mutex_name.as_str());

        unsafe {
            let handle = CreateMutexW(None, true, &name).map_err(|e| {
                InstanceError::LockCreationFailed {
                    name: config.mutex_name.clone(),
                    source: io::Error::new(io::ErrorKind::Other, e),
                }
            })?;

            // No other Win32 call may run between CreateMutexW and this check
            if Error::from_win32().code() == ERROR_ALREADY_EXISTS.to_hresult() {
                let _ = CloseHandle(handle);
                return Ok(None);
            }

            Ok(Some(OsLock { handle }))
        }
    }

    impl OsLock {
        pub fn release(&mut self) {
            unsafe {
                let _ = ReleaseMutex(self.handle);
                let _ = CloseHandle(self.handle);
            }
        }
    }
}

#[cfg(not(windows))]
mod imp {
    use super::*;
    use fs2::FileExt;
    use std::fs::{self, File, OpenOptions};
    use std::io::Write;

    #[derive(Debug)]
    pub struct OsLock {
        file: File,
    }

    pub fn try_acquire(config: &GuardConfig) -> Result<Option<OsLock>> {
        let lock_failed = |source| InstanceError::LockCreationFailed {
            name: config.mutex_name.clone(),
            source,
        };

        fs::create_dir_all(&config.runtime_dir).map_err(lock_failed)?;

        // Each open gets its own file description, so two guards in one
        // process contend with each other just like two processes do.
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(config.lock_path())
            .map_err(lock_failed)?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() == fs2::lock_contended_error().kind() {
                return Ok(None);
            }
            return Err(lock_failed(e));
        }

        // The pid is informational only; failing to record it is harmless.
        let _ = file
            .set_len(0)
            .and_then(|_| writeln!(file, "{}", std::process::id()));

        Ok(Some(OsLock { file }))
    }

    impl OsLock {
        pub fn release(&mut self) {
            let _ = FileExt::unlock(&self.file);
        }
    }
}
