//! Byte-stream copy transport
//!
//! The transport moves bytes and reports typed results. It does not
//! guarantee the bytes match the requested digest; callers re-hash what
//! they receive. [`FaultInjection`] can make the transport substitute
//! corrupted bytes so that contract stays exercised.

use crate::lifecycle::ShutdownSignal;
use crate::transfer::result::{CopyOptions, CopyResult, ExistenceResult};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

const CHUNK_SIZE: usize = 64 * 1024;

/// Existence-check timeouts kept for diagnostics
const RECENT_EXISTENCE_CHECKS: usize = 64;

/// Transport used to pull content bytes from a peer path
#[async_trait]
pub trait CopyTransport: Send + Sync {
    /// Stream `source` into `destination`
    async fn copy_to(
        &self,
        source: &Path,
        destination: &mut (dyn AsyncWrite + Unpin + Send),
        expected_size: Option<u64>,
        options: &CopyOptions,
    ) -> CopyResult;

    /// Check whether `path` exists within `timeout`
    async fn check_file_exists(&self, path: &Path, timeout: Duration) -> ExistenceResult;
}

/// Faults the file copier can be told to inject
#[derive(Debug, Clone, Default)]
pub struct FaultInjection {
    /// Flip bits in every copied chunk
    pub corrupt_content: bool,
    /// Return this instead of checking the file system
    pub existence_override: Option<ExistenceResult>,
    /// Sleep this long before each chunk
    pub chunk_delay: Option<Duration>,
}

/// Copy transport over a (possibly shared) file system
#[derive(Debug, Default)]
pub struct FileCopier {
    faults: FaultInjection,
    existence_checks: Mutex<ExistenceChecks>,
}

#[derive(Debug, Default)]
struct ExistenceChecks {
    total: u64,
    recent: VecDeque<Duration>,
}

impl ExistenceChecks {
    fn push(&mut self, timeout: Duration) {
        self.total += 1;
        if self.recent.len() == RECENT_EXISTENCE_CHECKS {
            self.recent.pop_front();
        }
        self.recent.push_back(timeout);
    }
}

enum StreamError {
    Source(std::io::Error),
    Destination(std::io::Error),
}

enum Finish {
    Done(Result<(), StreamError>),
    TimedOut,
    Cancelled,
}

impl FileCopier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_faults(faults: FaultInjection) -> Self {
        Self {
            faults,
            existence_checks: Mutex::default(),
        }
    }

    /// Timeouts of the most recent existence checks, oldest first
    pub fn existence_checks(&self) -> Vec<Duration> {
        self.existence_checks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recent
            .iter()
            .copied()
            .collect()
    }

    /// Number of existence checks issued so far
    pub fn existence_check_count(&self) -> u64 {
        self.existence_checks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .total
    }

    async fn stream(
        &self,
        source: &mut (dyn AsyncRead + Unpin + Send),
        destination: &mut (dyn AsyncWrite + Unpin + Send),
        copied: &mut u64,
    ) -> Result<(), StreamError> {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            if let Some(delay) = self.faults.chunk_delay {
                tokio::time::sleep(delay).await;
            }
            let n = source.read(&mut buf).await.map_err(StreamError::Source)?;
            if n == 0 {
                break;
            }
            if self.faults.corrupt_content {
                for byte in &mut buf[..n] {
                    *byte ^= 0xA5;
                }
            }
            destination
                .write_all(&buf[..n])
                .await
                .map_err(StreamError::Destination)?;
            *copied += n as u64;
        }
        destination.flush().await.map_err(StreamError::Destination)
    }
}

async fn elapse(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}

async fn cancelled(signal: Option<ShutdownSignal>) {
    match signal {
        Some(mut signal) => signal.wait().await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl CopyTransport for FileCopier {
    async fn copy_to(
        &self,
        source: &Path,
        destination: &mut (dyn AsyncWrite + Unpin + Send),
        expected_size: Option<u64>,
        options: &CopyOptions,
    ) -> CopyResult {
        let mut file = match fs::File::open(source).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Copy source {} not found", source.display());
                return CopyResult::FileNotFound;
            }
            Err(e) => {
                return CopyResult::SourceReadError {
                    bytes_copied: 0,
                    reason: e.to_string(),
                }
            }
        };

        let mut copied = 0u64;
        let finished = {
            let transfer = self.stream(&mut file, destination, &mut copied);
            tokio::select! {
                result = transfer => Finish::Done(result),
                _ = elapse(options.timeout) => Finish::TimedOut,
                _ = cancelled(options.cancel.clone()) => Finish::Cancelled,
            }
        };

        let result = match finished {
            Finish::Done(Ok(())) => CopyResult::Success {
                bytes_copied: copied,
            },
            Finish::Done(Err(StreamError::Source(e))) => CopyResult::SourceReadError {
                bytes_copied: copied,
                reason: e.to_string(),
            },
            Finish::Done(Err(StreamError::Destination(e))) => CopyResult::DestinationPathError {
                bytes_copied: copied,
                reason: e.to_string(),
            },
            Finish::TimedOut => CopyResult::Timeout {
                bytes_copied: copied,
            },
            Finish::Cancelled => CopyResult::Cancelled {
                bytes_copied: copied,
            },
        };

        if let (CopyResult::Success { bytes_copied }, Some(expected)) = (&result, expected_size) {
            if *bytes_copied != expected {
                warn!(
                    "Copied {} bytes from {}, expected {}",
                    bytes_copied,
                    source.display(),
                    expected
                );
            }
        }
        result
    }

    async fn check_file_exists(&self, path: &Path, timeout: Duration) -> ExistenceResult {
        self.existence_checks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(timeout);

        if let Some(result) = &self.faults.existence_override {
            return result.clone();
        }

        match tokio::time::timeout(timeout, fs::metadata(path)).await {
            Ok(Ok(metadata)) => ExistenceResult::Exists {
                size: metadata.len(),
            },
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => ExistenceResult::NotExists,
            Ok(Err(e)) => ExistenceResult::Error {
                reason: e.to_string(),
            },
            Err(_) => ExistenceResult::Error {
                reason: format!("existence check timed out after {:?}", timeout),
            },
        }
    }
}
