use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// An exclusive lock file guarding a heap file. The heap is mapped by a
/// single process; a second open of the same store must fail rather than
/// race the first process's allocator.
#[derive(Debug)]
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Creates a FileLock next to the given heap file (`<heap>.lock`) and
    /// locks it. The lock file contains the process ID for debugging.
    pub fn lock_for<P: AsRef<Path>>(heap_path: P) -> io::Result<Self> {
        let mut name = heap_path.as_ref().as_os_str().to_os_string();
        name.push(".lock");
        Self::lock(PathBuf::from(name))
    }

    /// Creates a new FileLock at the given path and locks it.
    pub fn lock<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        Self::try_lock(&file)?;

        // Write process ID to the lock file for debugging
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { _file: file, path })
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> io::Result<()> {
        use libc::{flock, LOCK_EX, LOCK_NB};

        let fd = file.as_raw_fd();
        let result = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock(_file: &File) -> io::Result<()> {
        // No advisory locking on this platform; open still succeeds.
        Ok(())
    }

    /// Get the path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // The OS releases the lock when the file handle closes. The lock
        // file itself is left behind to avoid unlink races with a process
        // that is concurrently acquiring it.
    }
}
