//! Small filesystem helpers shared by the storage engine: atomic
//! durable writes and advisory exclusive locking. Adapted from the
//! teacher's `tools::file_set_contents`/`tools::lock_file` helpers.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::{Duration, Instant};

use nix::fcntl::{flock, FlockArg};
use nix::sys::stat;
use nix::unistd;

/// Writes `data` to `path` atomically: write to a sibling temp file, fsync,
/// then rename over the destination. A reader never observes a partially
/// written file.
pub fn file_set_contents<P: AsRef<Path>>(path: P, data: &[u8]) -> io::Result<()> {
    let path = path.as_ref();
    let mut template = path.to_owned();
    let ext = template
        .extension()
        .map(|e| format!("{}.tmp_XXXXXX", e.to_string_lossy()))
        .unwrap_or_else(|| "tmp_XXXXXX".to_string());
    template.set_extension(ext);

    let (fd, tmp_path) = unistd::mkstemp(&template)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("mkstemp failed: {}", e)))?;

    let mode = stat::Mode::S_IRUSR | stat::Mode::S_IWUSR | stat::Mode::S_IRGRP | stat::Mode::S_IROTH;
    if let Err(err) = stat::fchmod(fd, mode) {
        let _ = unistd::unlink(&tmp_path);
        return Err(io::Error::new(io::ErrorKind::Other, format!("fchmod failed: {}", err)));
    }

    use std::os::unix::io::FromRawFd;
    let mut file = unsafe { File::from_raw_fd(fd) };

    let result = (|| {
        file.write_all(data)?;
        file.sync_all()?;
        std::fs::rename(&tmp_path, path)
    })();

    if result.is_err() {
        let _ = unistd::unlink(&tmp_path);
    }
    result
}

/// Opens (creating if necessary) an exclusive advisory lock on `path`,
/// blocking (with a poll loop) until acquired or `timeout` elapses.
pub fn lock_file<P: AsRef<Path>>(path: P, timeout: Duration) -> io::Result<File> {
    let path = path.as_ref();
    let lockfile = OpenOptions::new().create(true).append(true).open(path)?;
    let fd = lockfile.as_raw_fd();

    let start = Instant::now();
    loop {
        match flock(fd, FlockArg::LockExclusiveNonblock) {
            Ok(_) => return Ok(lockfile),
            Err(_) => {
                if start.elapsed() >= timeout {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("unable to acquire lock on {:?}", path),
                    ));
                }
                std::thread::sleep(Duration::from_millis(20));
            }
        }
    }
}

/// Ensures durability of an already-open file (fsync).
pub fn fsync_file(file: &File) -> io::Result<()> {
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn atomic_write_then_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.dat");
        file_set_contents(&path, b"hello").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    }

    #[test]
    fn lock_can_be_reacquired_after_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lock");
        {
            let _l = lock_file(&path, Duration::from_millis(100)).unwrap();
        }
        let _l2 = lock_file(&path, Duration::from_millis(100)).unwrap();
    }
}
