//! Utility functions for file handling, retries and progress reporting

use crate::{MutmapError, MutmapResult};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

/// Check if a file is gzip compressed
pub fn is_gzipped<P: AsRef<Path>>(path: P) -> MutmapResult<bool> {
    let mut file = File::open(path)?;
    let mut buffer = [0; 2];

    match file.read_exact(&mut buffer) {
        Ok(()) => Ok(buffer == [0x1f, 0x8b]),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(MutmapError::Io(e)),
    }
}

/// Get the number of CPU cores, with a fallback default
pub fn get_num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}

/// Validate file paths and check if they exist
pub fn validate_file_exists<P: AsRef<Path>>(path: P) -> MutmapResult<()> {
    if !path.as_ref().exists() {
        return Err(MutmapError::FileNotFound(
            path.as_ref().to_string_lossy().to_string(),
        ));
    }
    Ok(())
}

/// Validate that a file is readable
pub fn validate_file_readable<P: AsRef<Path>>(path: P) -> MutmapResult<()> {
    validate_file_exists(&path)?;

    File::open(&path)
        .map_err(|_| MutmapError::FileNotFound(path.as_ref().to_string_lossy().to_string()))?;

    Ok(())
}

/// Check if a path has a specific extension
pub fn has_extension<P: AsRef<Path>>(path: P, extension: &str) -> bool {
    path.as_ref()
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| s.eq_ignore_ascii_case(extension))
        .unwrap_or(false)
}

/// Create parent directories if they don't exist
pub fn ensure_parent_dirs<P: AsRef<Path>>(path: P) -> MutmapResult<()> {
    if let Some(parent) = path.as_ref().parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Log progress information
pub fn log_progress(current: usize, total: usize, message: &str) {
    if total > 0 {
        let percentage = (current as f64 / total as f64) * 100.0;
        log::info!("{}: {} / {} ({:.1}%)", message, current, total, percentage);
    }
}

/// Bounded retry schedule with exponential backoff
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: usize, base_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_millis(base_delay_ms),
        }
    }

    fn delay(&self, attempt: usize) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt as u32)
    }
}

/// Run `op`, retrying retryable errors up to `policy.max_retries` times
pub fn retry_with_backoff<T, F>(policy: &RetryPolicy, what: &str, mut op: F) -> MutmapResult<T>
where
    F: FnMut() -> MutmapResult<T>,
{
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.delay(attempt);
                log::warn!(
                    "{} failed (attempt {} of {}): {}; retrying in {:?}",
                    what,
                    attempt + 1,
                    policy.max_retries + 1,
                    e,
                    delay
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Timer utility for measuring execution time
pub struct Timer {
    start: std::time::Instant,
    name: String,
}

impl Timer {
    pub fn new(name: &str) -> Self {
        log::info!("Starting timer: {}", name);
        Timer {
            start: std::time::Instant::now(),
            name: name.to_string(),
        }
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }

    pub fn log_elapsed(&self) {
        let duration = self.elapsed();
        log::info!("Timer '{}' elapsed: {:.2?}", self.name, duration);
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.log_elapsed();
    }
}

/// Memory usage reporting utility
pub fn log_memory_usage(context: &str) {
    #[cfg(unix)]
    {
        use std::fs;
        if let Ok(status) = fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                if line.starts_with("VmRSS:") {
                    if let Some(memory_str) = line.split_whitespace().nth(1) {
                        if let Ok(memory_kb) = memory_str.parse::<u64>() {
                            let memory_mb = memory_kb / 1024;
                            log::debug!("Memory usage ({}): {} MB", context, memory_mb);
                        }
                    }
                    break;
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        log::debug!("Memory usage logging not supported on this platform ({})", context);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_is_gzipped() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "test content").unwrap();
        assert!(!is_gzipped(temp_file.path()).unwrap());

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(&[0x1f, 0x8b]).unwrap();
        assert!(is_gzipped(temp_file.path()).unwrap());
    }

    #[test]
    fn test_get_num_cpus() {
        assert!(get_num_cpus() >= 1);
    }

    #[test]
    fn test_validate_file_exists() {
        let temp_file = NamedTempFile::new().unwrap();
        assert!(validate_file_exists(temp_file.path()).is_ok());
        assert!(validate_file_readable(temp_file.path()).is_ok());

        assert!(validate_file_exists("/nonexistent/file").is_err());
    }

    #[test]
    fn test_has_extension() {
        assert!(has_extension("candidates.tsv.gz", "gz"));
        assert!(has_extension("candidates.TSV", "tsv"));
        assert!(!has_extension("candidates.tsv", "gz"));
        assert!(!has_extension("candidates", "gz"));
    }

    #[test]
    fn test_retry_succeeds_after_transient_failures() {
        let policy = RetryPolicy::new(3, 1);
        let calls = Cell::new(0);
        let result = retry_with_backoff(&policy, "flaky", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(MutmapError::external("flaky", "transient"))
            } else {
                Ok(calls.get())
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn test_retry_gives_up() {
        let policy = RetryPolicy::new(2, 1);
        let calls = Cell::new(0);
        let result: MutmapResult<()> = retry_with_backoff(&policy, "broken", || {
            calls.set(calls.get() + 1);
            Err(MutmapError::external("broken", "down"))
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_retry_skips_non_retryable() {
        let policy = RetryPolicy::new(5, 1);
        let calls = Cell::new(0);
        let result: MutmapResult<()> = retry_with_backoff(&policy, "config", || {
            calls.set(calls.get() + 1);
            Err(MutmapError::InvalidConfig("bad".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_timer() {
        let timer = Timer::new("test");
        std::thread::sleep(std::time::Duration::from_millis(1));
        assert!(timer.elapsed().as_millis() >= 1);
    }
}
