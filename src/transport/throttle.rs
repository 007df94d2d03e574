//! Bandwidth limiting shared by every transfer worker.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Token bucket refilled at `rate` bytes per second, one second of burst.
#[derive(Debug)]
pub struct Throttle {
    rate: f64,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last: Instant,
}

impl Throttle {
    /// `None` when the limit is zero (unlimited).
    pub fn per_kib(kib_per_sec: u64) -> Option<Arc<Self>> {
        if kib_per_sec == 0 {
            return None;
        }
        let rate = (kib_per_sec * 1024) as f64;
        Some(Arc::new(Self {
            rate,
            bucket: Mutex::new(Bucket {
                tokens: rate,
                last: Instant::now(),
            }),
        }))
    }

    /// Take `bytes` from the bucket, sleeping off any debt.
    pub fn consume(&self, bytes: usize) {
        let wait = {
            let Ok(mut bucket) = self.bucket.lock() else {
                return;
            };
            let now = Instant::now();
            let elapsed = now.duration_since(bucket.last).as_secs_f64();
            bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.rate);
            bucket.last = now;
            bucket.tokens -= bytes as f64;
            if bucket.tokens < 0.0 {
                Duration::from_secs_f64(-bucket.tokens / self.rate)
            } else {
                Duration::ZERO
            }
        };
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }
    }
}

/// Chunk size handed to the bucket, so a large write cannot burst.
const CHUNK: usize = 16 * 1024;

/// `Write` adapter that charges every byte to a shared [`Throttle`].
pub struct ThrottledWriter<W> {
    inner: W,
    throttle: Option<Arc<Throttle>>,
}

impl<W: Write> ThrottledWriter<W> {
    pub fn new(inner: W, throttle: Option<Arc<Throttle>>) -> Self {
        Self { inner, throttle }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for ThrottledWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let len = buf.len().min(CHUNK);
        let written = self.inner.write(&buf[..len])?;
        if let Some(t) = &self.throttle {
            t.consume(written);
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
