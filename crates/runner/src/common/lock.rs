use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use fs2::FileExt;

use crate::common::error::RunnerError;

/// Advisory exclusive lock guaranteeing a single agent instance per host.
/// The lock is held for the lifetime of the value and released by the OS on
/// process exit, so a crashed instance never wedges the host.
pub struct ExclusiveLock {
    _file: File,
    path: PathBuf,
}

impl ExclusiveLock {
    pub fn acquire(name: &str) -> crate::Result<Self> {
        let path = std::env::temp_dir().join(format!("{name}.lock"));
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)?;
        file.try_lock_exclusive().map_err(|_| {
            RunnerError::Config(format!(
                "an instance of this process is already running (lock {})",
                path.display()
            ))
        })?;
        // Best effort breadcrumb for operators inspecting the lock file.
        let _ = file.set_len(0);
        let _ = writeln!(file, "{}", std::process::id());
        Ok(ExclusiveLock { _file: file, path })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::ExclusiveLock;

    #[test]
    fn test_second_acquire_fails() {
        let name = format!("runner-lock-test-{}", std::process::id());
        let held = ExclusiveLock::acquire(&name).unwrap();
        assert!(ExclusiveLock::acquire(&name).is_err());
        drop(held);
        assert!(ExclusiveLock::acquire(&name).is_ok());
    }
}
