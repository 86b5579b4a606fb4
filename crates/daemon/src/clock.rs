//! Time and filesystem-stat sources for the state core.
//!
//! Both are injected seams so tests can drive time and file sizes
//! deterministically; production wires in the system-backed variants.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Wall-clock source in whole epoch seconds.
pub trait Clock: Send + Sync {
    /// Current wall time as seconds since the Unix epoch.
    fn now(&self) -> i64;
}

/// System wall clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

/// Manually advanced clock for deterministic tests.
#[derive(Debug)]
pub struct FakeClock {
    now: Mutex<i64>,
}

impl FakeClock {
    pub fn new(start: i64) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move time forward by `secs`.
    pub fn advance(&self, secs: i64) {
        *self.now.lock().unwrap() += secs;
    }

    /// Jump to an absolute time.
    pub fn set(&self, now: i64) {
        *self.now.lock().unwrap() = now;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> i64 {
        *self.now.lock().unwrap()
    }
}

/// Size and mtime of a file as observed by a stat call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size_bytes: u64,
    pub mtime: i64,
}

/// Error from a stat call. `NotFound` is a definitive answer (the path is
/// gone), everything else is transient.
#[derive(Debug, Error)]
pub enum StatError {
    #[error("file not found")]
    NotFound,
    #[error("stat failed: {0}")]
    Io(String),
}

/// Filesystem stat indirection so the planner's size sampling can be faked.
pub trait StatSource: Send + Sync {
    fn stat(&self, path: &Path) -> Result<FileStat, StatError>;

    fn exists(&self, path: &Path) -> bool {
        self.stat(path).is_ok()
    }
}

/// Real filesystem stats.
#[derive(Debug, Default)]
pub struct SystemStatSource;

impl StatSource for SystemStatSource {
    fn stat(&self, path: &Path) -> Result<FileStat, StatError> {
        match std::fs::metadata(path) {
            Ok(meta) => {
                let mtime = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0);
                Ok(FileStat {
                    size_bytes: meta.len(),
                    mtime,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StatError::NotFound),
            Err(e) => Err(StatError::Io(e.to_string())),
        }
    }
}

/// In-memory stat table for tests. Absent paths report `NotFound`.
#[derive(Debug, Default)]
pub struct FakeStatSource {
    files: Mutex<HashMap<PathBuf, FileStat>>,
}

impl FakeStatSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, path: &Path, size_bytes: u64, mtime: i64) {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), FileStat { size_bytes, mtime });
    }

    pub fn remove(&self, path: &Path) {
        self.files.lock().unwrap().remove(path);
    }
}

impl StatSource for FakeStatSource {
    fn stat(&self, path: &Path) -> Result<FileStat, StatError> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .copied()
            .ok_or(StatError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_reasonable() {
        let clock = SystemClock;
        // After 2020-01-01, before 2100-01-01
        let now = clock.now();
        assert!(now > 1_577_836_800);
        assert!(now < 4_102_444_800);
    }

    #[test]
    fn test_fake_clock_advances() {
        let clock = FakeClock::new(100);
        assert_eq!(clock.now(), 100);
        clock.advance(30);
        assert_eq!(clock.now(), 130);
        clock.set(1000);
        assert_eq!(clock.now(), 1000);
    }

    #[test]
    fn test_fake_stat_source_round_trip() {
        let stats = FakeStatSource::new();
        let path = Path::new("/media/a.mkv");

        assert!(matches!(stats.stat(path), Err(StatError::NotFound)));
        assert!(!stats.exists(path));

        stats.set(path, 1000, 42);
        let s = stats.stat(path).unwrap();
        assert_eq!(s.size_bytes, 1000);
        assert_eq!(s.mtime, 42);
        assert!(stats.exists(path));

        stats.remove(path);
        assert!(!stats.exists(path));
    }

    #[test]
    fn test_system_stat_source_missing_file() {
        let src = SystemStatSource;
        let err = src
            .stat(Path::new("/nonexistent/definitely/missing.mkv"))
            .unwrap_err();
        assert!(matches!(err, StatError::NotFound));
    }
}
