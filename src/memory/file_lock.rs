//! 跨进程独占文件锁（unix flock），保护持久化存储不被多个进程交错写入
//!
//! acquire 是阻塞调用，需在 spawn_blocking 中使用。非 unix 平台退化为只创建锁文件。

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::core::AgentError;

/// 持有期间独占锁，drop 时释放
#[derive(Debug)]
pub struct FileLockGuard {
    file: File,
    path: PathBuf,
}

impl FileLockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::flock(
                std::os::unix::io::AsRawFd::as_raw_fd(&self.file),
                libc::LOCK_UN,
            );
        }
        #[cfg(not(unix))]
        let _ = &self.file;
    }
}

#[cfg(unix)]
fn try_lock(file: &File) -> bool {
    let fd = std::os::unix::io::AsRawFd::as_raw_fd(file);
    unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) == 0 }
}

#[cfg(not(unix))]
fn try_lock(_file: &File) -> bool {
    true
}

/// 轮询获取独占锁，超时返回 Memory 错误
pub fn acquire(lock_path: &Path, timeout: Duration) -> Result<FileLockGuard, AgentError> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path)
        .map_err(|e| {
            AgentError::Memory(format!("Cannot open lock file {}: {e}", lock_path.display()))
        })?;

    let deadline = Instant::now() + timeout;
    loop {
        if try_lock(&file) {
            return Ok(FileLockGuard {
                file,
                path: lock_path.to_path_buf(),
            });
        }
        if Instant::now() >= deadline {
            return Err(AgentError::Memory(format!(
                "Timed out acquiring lock {} after {}ms",
                lock_path.display(),
                timeout.as_millis()
            )));
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_second_holder_times_out_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.lock");
        let first = acquire(&path, Duration::from_millis(100)).unwrap();
        // flock 锁在打开的文件描述上，同进程第二次 open 也会被挡住
        let err = acquire(&path, Duration::from_millis(120)).unwrap_err();
        assert!(matches!(err, AgentError::Memory(_)));
        drop(first);
        assert!(acquire(&path, Duration::from_millis(100)).is_ok());
    }
}
