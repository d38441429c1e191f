use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use rand::Rng;

/// Sizing and timing of the worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker execution units.
    pub workers: usize,
    /// Maximum number of assignments queued while all workers are busy.
    /// Submissions beyond this depth are rejected immediately.
    pub queue_depth: usize,
    /// Per-attempt execution timeout. A worker that has not reported within
    /// this bound is abandoned and freed for new assignments.
    pub job_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_depth: 16,
            job_timeout: Duration::from_secs(300),
        }
    }
}

/// Retry policy for transient attempt failures (lost worker, timeout).
///
/// `max_retries` bounds the total number of dispatch attempts: an attempt is
/// retried while the job's attempt count is still below it.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_factor: u32,
    pub backoff_cap_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_base_ms: 1_000,
            backoff_factor: 2,
            backoff_cap_ms: 30_000,
        }
    }
}

impl RetryConfig {
    /// Delay to sleep before re-dispatching after the given attempt number
    /// (1-based) failed. Exponential in the attempt number, capped, with a
    /// small random jitter so concurrent retries spread out.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let full = self
            .backoff_base_ms
            .saturating_mul(u64::from(self.backoff_factor).saturating_pow(exp))
            .min(self.backoff_cap_ms);
        if full == 0 {
            return Duration::ZERO;
        }
        let low = full - full / 4;
        let ms = rand::thread_rng().gen_range(low..=full);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Address the HTTP API listens on.
    pub listen_addr: SocketAddr,
    /// Directory artifacts and the latest-pointer are persisted under.
    pub artifact_dir: PathBuf,
    /// How long a synchronous submission may wait for the job to finish.
    pub sync_wait: Duration,
    pub pool: PoolConfig,
    pub retry: RetryConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            // Hardcoded valid address, always parses
            listen_addr: "127.0.0.1:8080"
                .parse()
                .expect("default listen address is valid"),
            artifact_dir: PathBuf::from("artifacts"),
            sync_wait: Duration::from_secs(60),
            pool: PoolConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn new(listen_addr: SocketAddr, artifact_dir: PathBuf) -> Self {
        Self {
            listen_addr,
            artifact_dir,
            ..Default::default()
        }
    }
}
