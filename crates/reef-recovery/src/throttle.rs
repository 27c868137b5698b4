//! Token bucket rate limiter for recovery transfers.
//!
//! Tokens are bytes. The bucket refills at the configured rate and holds at
//! most one second's worth, so a burst of sessions cannot exceed the limit
//! for long. Transfers larger than the bucket are charged in bucket-sized
//! slices.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::debug;

/// Bandwidth limiter shared by every recovery session.
pub struct Throttle {
    bytes_per_sec: AtomicU64,
    bucket: Mutex<Bucket>,
}

struct Bucket {
    available: f64,
    last_refill: Instant,
    rate: f64,
}

impl Bucket {
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.available = (self.available + elapsed * self.rate).min(self.rate);
            self.last_refill = now;
        }
    }
}

impl Throttle {
    /// Create a throttle that starts with a full bucket.
    pub fn new(bytes_per_sec: u64) -> Arc<Self> {
        let rate = bytes_per_sec as f64;
        Arc::new(Self {
            bytes_per_sec: AtomicU64::new(bytes_per_sec),
            bucket: Mutex::new(Bucket {
                available: rate,
                last_refill: Instant::now(),
                rate,
            }),
        })
    }

    /// Wait until `bytes` tokens have been consumed.
    pub async fn acquire(&self, bytes: u64) {
        let mut remaining = bytes as f64;
        while remaining > 0.0 {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                bucket.refill();

                let slice = remaining.min(bucket.rate.max(1.0));
                if bucket.available >= slice {
                    bucket.available -= slice;
                    remaining -= slice;
                    continue;
                }
                if bucket.rate > 0.0 {
                    Duration::from_secs_f64((slice - bucket.available) / bucket.rate)
                } else {
                    // Zero rate blocks until the rate is raised.
                    Duration::from_millis(100)
                }
            };

            debug!(
                wait_ms = wait.as_millis() as u64,
                remaining = remaining as u64,
                "recovery throttle waiting for tokens"
            );
            tokio::time::sleep(wait).await;
        }
    }

    /// Consume tokens if they are available right now.
    pub async fn try_acquire(&self, bytes: u64) -> bool {
        let bytes = bytes as f64;
        let mut bucket = self.bucket.lock().await;
        bucket.refill();
        if bucket.available >= bytes {
            bucket.available -= bytes;
            true
        } else {
            false
        }
    }

    /// Change the limit at runtime.
    pub async fn set_rate(&self, bytes_per_sec: u64) {
        self.bytes_per_sec.store(bytes_per_sec, Ordering::Relaxed);
        let mut bucket = self.bucket.lock().await;
        bucket.rate = bytes_per_sec as f64;
        bucket.available = bucket.available.min(bucket.rate);
        debug!(bytes_per_sec, "recovery throttle rate updated");
    }

    /// The configured limit.
    pub fn rate(&self) -> u64 {
        self.bytes_per_sec.load(Ordering::Relaxed)
    }
}
