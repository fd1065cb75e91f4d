//! Retry policy for transient backend failures

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{self, Read};
use std::thread;
use std::time::Duration;
use tracing::warn;

use super::{ObjectListing, StorageBackend, WriteOptions};
use crate::{ChunkStoreError, Result};

/// How often and how patiently to retry `Transient` failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, initial_ms: u64, max_ms: u64) -> Self {
        self.initial_backoff_ms = initial_ms;
        self.max_backoff_ms = max_ms.max(initial_ms);
        self
    }

    /// Delay before retry number `retry` (1-based), doubling up to the cap
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry.saturating_sub(1)).unwrap_or(u64::MAX);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Counts bytes pulled from a write stream so a failed write is only retried
/// if nothing was consumed yet.
struct CountingReader<'a> {
    inner: &'a mut dyn Read,
    count: u64,
}

impl Read for CountingReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

/// Backend decorator applying a [`RetryPolicy`]
pub struct RetryingBackend<B> {
    inner: B,
    policy: RetryPolicy,
}

impl<B: StorageBackend> RetryingBackend<B> {
    pub fn new(inner: B, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn with_retry<T>(&self, operation: &str, target: &str, mut call: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempt = 1;
        loop {
            match call() {
                Err(e) if e.is_transient() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.backoff(attempt);
                    warn!(
                        operation,
                        object = target,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transient storage failure, retrying: {}",
                        e
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

impl<B: StorageBackend> StorageBackend for RetryingBackend<B> {
    fn create_space(&self, space_id: &str) -> Result<()> {
        self.with_retry("create_space", space_id, || self.inner.create_space(space_id))
    }

    fn space_exists(&self, space_id: &str) -> Result<bool> {
        self.with_retry("space_exists", space_id, || self.inner.space_exists(space_id))
    }

    fn write(
        &self,
        space_id: &str,
        object_id: &str,
        stream: &mut dyn Read,
        byte_size: u64,
        options: &WriteOptions,
    ) -> Result<String> {
        let mut attempt = 1;
        loop {
            let mut counting = CountingReader {
                inner: &mut *stream,
                count: 0,
            };
            let result = self
                .inner
                .write(space_id, object_id, &mut counting, byte_size, options);
            match result {
                Err(ChunkStoreError::Transient(msg))
                    if counting.count == 0 && attempt < self.policy.max_attempts =>
                {
                    let delay = self.policy.backoff(attempt);
                    warn!(
                        operation = "write",
                        object = object_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transient storage failure, retrying: {}",
                        msg
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn read(&self, space_id: &str, object_id: &str) -> Result<Box<dyn Read + Send>> {
        self.with_retry("read", object_id, || self.inner.read(space_id, object_id))
    }

    fn properties(&self, space_id: &str, object_id: &str) -> Result<HashMap<String, String>> {
        self.with_retry("properties", object_id, || {
            self.inner.properties(space_id, object_id)
        })
    }

    fn delete(&self, space_id: &str, object_id: &str) -> Result<()> {
        self.with_retry("delete", object_id, || self.inner.delete(space_id, object_id))
    }

    fn list(&self, space_id: &str, prefix: Option<&str>) -> Result<ObjectListing<'_>> {
        self.with_retry("list", space_id, || self.inner.list(space_id, prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` writes and deletes with a transient error
    struct FlakyBackend {
        inner: MemoryBackend,
        failures: AtomicU32,
        consume_before_failing: bool,
    }

    impl FlakyBackend {
        fn new(failures: u32) -> Self {
            let inner = MemoryBackend::new();
            inner.create_space("s").unwrap();
            Self {
                inner,
                failures: AtomicU32::new(failures),
                consume_before_failing: false,
            }
        }

        fn should_fail(&self) -> bool {
            self.failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    impl StorageBackend for FlakyBackend {
        fn create_space(&self, space_id: &str) -> Result<()> {
            self.inner.create_space(space_id)
        }
        fn space_exists(&self, space_id: &str) -> Result<bool> {
            self.inner.space_exists(space_id)
        }
        fn write(
            &self,
            space_id: &str,
            object_id: &str,
            stream: &mut dyn Read,
            byte_size: u64,
            options: &WriteOptions,
        ) -> Result<String> {
            if self.should_fail() {
                if self.consume_before_failing {
                    let mut byte = [0u8; 1];
                    stream.read_exact(&mut byte)?;
                }
                return Err(ChunkStoreError::Transient("connection reset".into()));
            }
            self.inner.write(space_id, object_id, stream, byte_size, options)
        }
        fn read(&self, space_id: &str, object_id: &str) -> Result<Box<dyn Read + Send>> {
            self.inner.read(space_id, object_id)
        }
        fn properties(&self, space_id: &str, object_id: &str) -> Result<HashMap<String, String>> {
            self.inner.properties(space_id, object_id)
        }
        fn delete(&self, space_id: &str, object_id: &str) -> Result<()> {
            if self.should_fail() {
                return Err(ChunkStoreError::Transient("throttled".into()));
            }
            self.inner.delete(space_id, object_id)
        }
        fn list(&self, space_id: &str, prefix: Option<&str>) -> Result<ObjectListing<'_>> {
            self.inner.list(space_id, prefix)
        }
    }

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::new().with_max_attempts(attempts).with_backoff(1, 2)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::new().with_backoff(100, 350);
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(80), Duration::from_millis(350));
    }

    #[test]
    fn test_write_retried_until_success() {
        let backend = RetryingBackend::new(FlakyBackend::new(2), fast_policy(3));
        let digest = backend
            .write("s", "a", &mut &b"hello"[..], 5, &WriteOptions::default())
            .unwrap();
        assert_eq!(digest, "5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn test_exhausted_retries_surface_error() {
        let backend = RetryingBackend::new(FlakyBackend::new(5), fast_policy(3));
        backend
            .inner()
            .inner
            .write("s", "a", &mut &b"x"[..], 1, &WriteOptions::default())
            .unwrap();
        assert!(matches!(
            backend.delete("s", "a"),
            Err(ChunkStoreError::Transient(_))
        ));
        // two failures left after three attempts
        assert_eq!(backend.inner().failures.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_partially_consumed_write_not_retried() {
        let mut flaky = FlakyBackend::new(1);
        flaky.consume_before_failing = true;
        let backend = RetryingBackend::new(flaky, fast_policy(3));
        assert!(matches!(
            backend.write("s", "a", &mut &b"hello"[..], 5, &WriteOptions::default()),
            Err(ChunkStoreError::Transient(_))
        ));
    }

    #[test]
    fn test_not_found_not_retried() {
        let backend = RetryingBackend::new(FlakyBackend::new(0), fast_policy(3));
        assert!(matches!(
            backend.read("s", "missing").map(|_| ()),
            Err(ChunkStoreError::NotFound(_))
        ));
    }
}
