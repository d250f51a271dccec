//! Durable sync for table files
//!
//! Saving a table writes the slot array and then the header; legacy
//! conversion renames a rewritten data file over the old one. Both need the
//! bytes (and the rename) on stable storage before they report success.

use std::fs::File;
use std::io;
use std::path::Path;

/// Flush file contents to stable storage.
///
/// - Linux: `fdatasync()`, file metadata such as mtime is not forced
/// - macOS/iOS: `fcntl(F_FULLFSYNC)`, plain fsync stops at the drive cache there
/// - Windows: `FlushFileBuffers()`
/// - elsewhere: `File::sync_data`
///
/// May block for a long time under heavy I/O; don't call it holding a heap lock.
pub fn durable_sync(file: &File) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the descriptor comes from a live File and stays open for the call.
        let rc = unsafe { libc::fdatasync(file.as_raw_fd()) };
        if rc == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the descriptor comes from a live File and stays open for the call.
        let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_FULLFSYNC) };
        if rc == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
    }

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::FlushFileBuffers;
        // SAFETY: the handle comes from a live File and stays open for the call.
        let ok = unsafe { FlushFileBuffers(file.as_raw_handle() as *mut _) };
        if ok != 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios", target_os = "windows")))]
    {
        file.sync_data()
    }
}

/// Persist a rename or file creation inside `dir`.
///
/// Directories can't be opened as files on Windows; there the rename itself
/// is already durable, so this is a no-op.
pub fn sync_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        let handle = File::open(dir)?;
        durable_sync(&handle)
    }

    #[cfg(not(unix))]
    {
        let _ = dir;
        Ok(())
    }
}

/// Sync the directory holding `path`, if it has one.
pub fn sync_parent_dir(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => sync_dir(parent),
        _ => Ok(()),
    }
}
