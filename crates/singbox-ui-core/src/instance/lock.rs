//! Machine-wide named mutex guarding the single interactive instance
//!
//! Windows uses a `Global\` named mutex so the gate spans user sessions and
//! elevation levels. Unix uses an advisory `flock` on a lock file in the
//! state directory; the kernel drops the lock when the holder dies.

use thiserror::Error;

use crate::retry::RetryPolicy;

/// Error type for instance lock operations
#[derive(Debug, Error)]
pub enum InstanceError {
    /// The OS refused to create or open the mutex
    #[error("cannot open instance mutex {name}: {source}")]
    Os {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// Another process still holds the mutex
    #[error("instance mutex {name} is still held")]
    StillHeld { name: String },

    /// An acquisition attempt ran past its timeout
    #[error("timed out waiting for the instance mutex")]
    Timeout,
}

impl From<tokio::time::error::Elapsed> for InstanceError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        InstanceError::Timeout
    }
}

/// Name of the instance mutex
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutexName {
    #[cfg(unix)]
    path: std::path::PathBuf,
    #[cfg(windows)]
    name: String,
}

impl MutexName {
    /// Mutex registered under `name` in the default (global) namespace
    pub fn new(name: &str) -> Self {
        #[cfg(unix)]
        {
            Self {
                path: crate::ipc::protocol::state_dir().join(format!("{}.lock", name)),
            }
        }
        #[cfg(windows)]
        {
            Self {
                name: format!("Global\\{}", name),
            }
        }
    }

    /// Mutex backed by an explicit lock file
    #[cfg(unix)]
    pub fn from_path(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl std::fmt::Display for MutexName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        #[cfg(unix)]
        {
            write!(f, "{}", self.path.display())
        }
        #[cfg(windows)]
        {
            write!(f, "{}", self.name)
        }
    }
}

/// Handle to the instance mutex
///
/// Holding the value keeps the OS handle open; dropping it releases.
#[derive(Debug)]
pub struct InstanceLock {
    name: MutexName,
    already_existed: bool,
    forced: bool,
    #[cfg(unix)]
    file: Option<std::fs::File>,
    /// Set once this handle holds the `flock`
    #[cfg(unix)]
    owned: std::sync::Arc<std::sync::atomic::AtomicBool>,
    #[cfg(windows)]
    handle: Option<windows_sys::Win32::Foundation::HANDLE>,
}

impl InstanceLock {
    /// Create or open the named mutex. Never blocks.
    ///
    /// [`already_existed`](Self::already_existed) reports whether another
    /// live handle had the name.
    #[cfg(unix)]
    pub fn acquire(name: &MutexName) -> Result<Self, InstanceError> {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;

        let os_err = |source| InstanceError::Os {
            name: name.to_string(),
            source,
        };

        if let Some(dir) = name.path.parent() {
            std::fs::create_dir_all(dir).map_err(os_err)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&name.path)
            .map_err(os_err)?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        let already_existed = if rc == 0 {
            // Record the owner for diagnostics; failure is harmless
            let _ = file.set_len(0);
            let _ = write!(file, "{}", std::process::id());
            false
        } else {
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::WouldBlock {
                return Err(os_err(err));
            }
            true
        };

        Ok(Self {
            name: name.clone(),
            already_existed,
            forced: false,
            file: Some(file),
            owned: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(!already_existed)),
        })
    }

    /// Create or open the named mutex. Never blocks.
    ///
    /// [`already_existed`](Self::already_existed) reports whether another
    /// live handle had the name.
    #[cfg(windows)]
    pub fn acquire(name: &MutexName) -> Result<Self, InstanceError> {
        use windows_sys::Win32::Foundation::{GetLastError, ERROR_ALREADY_EXISTS};
        use windows_sys::Win32::System::Threading::CreateMutexW;

        let wide: Vec<u16> = name
            .name
            .encode_utf16()
            .chain(std::iter::once(0))
            .collect();

        let (handle, last_error) =
            unsafe { (CreateMutexW(std::ptr::null(), 0, wide.as_ptr()), GetLastError()) };
        if handle == 0 {
            return Err(InstanceError::Os {
                name: name.to_string(),
                source: std::io::Error::from_raw_os_error(last_error as i32),
            });
        }

        Ok(Self {
            name: name.clone(),
            already_existed: last_error == ERROR_ALREADY_EXISTS,
            forced: false,
            handle: Some(handle),
        })
    }

    /// Re-acquire the mutex after a restart hand-off.
    ///
    /// Each attempt opens the mutex; while the previous owner still holds
    /// it the handle is closed again so the name can disappear. Once the
    /// policy is exhausted a fresh lock is taken anyway and marked
    /// [`forced`](Self::forced): startup must proceed even if the old
    /// process never lets go. A forced lock keeps waiting for the mutex in
    /// the background, so it becomes the owner as soon as the old process
    /// exits and later launches still see it as held.
    pub async fn recapture(name: &MutexName, policy: &RetryPolicy) -> Result<Self, InstanceError> {
        let attempt = move || async move {
            let mut lock = Self::acquire(name)?;
            if lock.already_existed {
                lock.release();
                return Err(InstanceError::StillHeld {
                    name: name.to_string(),
                });
            }
            Ok(lock)
        };

        match policy.retry(attempt).await {
            Ok(lock) => {
                tracing::debug!("Recaptured instance mutex {}", name);
                Ok(lock)
            }
            Err(InstanceError::StillHeld { .. }) => {
                tracing::warn!(
                    "Instance mutex {} still held after {} attempts; continuing anyway",
                    name,
                    policy.attempts
                );
                Self::take_over(name)
            }
            Err(e) => Err(e),
        }
    }

    /// Open the mutex regardless of its owner and wait for the `flock` on a
    /// dedicated thread.
    ///
    /// The thread locks a duplicate of the descriptor. `flock` belongs to
    /// the shared open file description, so the lock lasts until the last
    /// of the two descriptors is closed.
    #[cfg(unix)]
    fn take_over(name: &MutexName) -> Result<Self, InstanceError> {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;
        use std::sync::atomic::Ordering;

        let mut lock = Self::acquire(name)?;
        lock.forced = true;
        if !lock.already_existed {
            return Ok(lock);
        }

        let os_err = |source| InstanceError::Os {
            name: name.to_string(),
            source,
        };
        let mut file = match lock.file.as_ref() {
            Some(file) => file.try_clone().map_err(os_err)?,
            None => return Ok(lock),
        };
        let owned = lock.owned.clone();
        let label = name.to_string();

        std::thread::Builder::new()
            .name("instance-lock".to_string())
            .spawn(move || loop {
                let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
                if rc == 0 {
                    let _ = file.set_len(0);
                    let _ = write!(file, "{}", std::process::id());
                    owned.store(true, Ordering::SeqCst);
                    tracing::info!("Took over instance mutex {}", label);
                    return;
                }
                let err = std::io::Error::last_os_error();
                if err.kind() != std::io::ErrorKind::Interrupted {
                    tracing::warn!("Waiting for instance mutex {} failed: {}", label, err);
                    return;
                }
            })
            .map_err(os_err)?;

        Ok(lock)
    }

    #[cfg(windows)]
    fn take_over(name: &MutexName) -> Result<Self, InstanceError> {
        // The open handle alone keeps the named mutex alive
        let mut lock = Self::acquire(name)?;
        lock.forced = true;
        Ok(lock)
    }

    /// Whether another handle to the mutex existed when this one was opened
    pub fn already_existed(&self) -> bool {
        self.already_existed
    }

    /// Whether this lock was taken after an exhausted recapture budget
    pub fn forced(&self) -> bool {
        self.forced
    }

    /// Whether the handle is still open
    pub fn is_held(&self) -> bool {
        #[cfg(unix)]
        {
            self.file.is_some()
        }
        #[cfg(windows)]
        {
            self.handle.is_some()
        }
    }

    /// Whether this handle is the exclusive owner of the mutex.
    ///
    /// False for a forced lock until the previous owner lets go.
    pub fn owns_lock(&self) -> bool {
        #[cfg(unix)]
        {
            self.file.is_some() && self.owned.load(std::sync::atomic::Ordering::SeqCst)
        }
        #[cfg(windows)]
        {
            self.handle.is_some()
        }
    }

    /// Name of the mutex
    pub fn name(&self) -> &MutexName {
        &self.name
    }

    /// Close the handle. Safe to call repeatedly.
    pub fn release(&mut self) {
        #[cfg(unix)]
        {
            // Closing the descriptor drops the flock
            if self.file.take().is_some() {
                tracing::debug!("Released instance mutex {}", self.name);
            }
        }
        #[cfg(windows)]
        {
            if let Some(handle) = self.handle.take() {
                unsafe {
                    windows_sys::Win32::Foundation::CloseHandle(handle);
                }
                tracing::debug!("Released instance mutex {}", self.name);
            }
        }
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        self.release();
    }
}
