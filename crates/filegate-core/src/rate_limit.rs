//! Token-bucket rate limiting for file transfers.
//!
//! A [`Limiter`] wraps any tokio stream in a [`Limited`] adapter. Every read
//! or write is split into chunks (8 KiB by default) and each chunk first
//! reserves its cost from the bucket. Reservations that overdraw the bucket
//! sleep for exactly the deficit, so throughput converges on the configured
//! rate without polling. Tokens are counted in KiB.
//!
//! A zero rate means unlimited: the adapter forwards calls untouched.
//!
//! [`RateLimiterRegistry`] hands out one shared limiter per
//! `(identity, rate)` pair and forgets limiters that sit idle.

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use filegate_common::{SweeperHandle, TtlMap};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite, ReadBuf};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{FsError, Result};

/// Default bytes per rate-limited chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

const KIB: f64 = 1024.0;

struct BucketState {
    tokens: f64,
    last: Instant,
}

/// Reservation-based token bucket measured in KiB.
pub struct TokenBucket {
    /// KiB per second and capacity in KiB; `None` means unlimited.
    limits: Option<(f64, f64)>,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Creates a bucket refilling at `rate_bytes` per second.
    ///
    /// Capacity is one second of traffic but never less than one chunk. Rates
    /// below 1 KiB/s stay fractional. The bucket starts full.
    pub fn new(rate_bytes: u64, chunk_size: usize) -> Self {
        if rate_bytes == 0 {
            return Self::unlimited();
        }
        let rate = rate_bytes as f64 / KIB;
        let capacity = rate.max(chunk_size as f64 / KIB);
        Self {
            limits: Some((rate, capacity)),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last: Instant::now(),
            }),
        }
    }

    pub fn unlimited() -> Self {
        Self {
            limits: None,
            state: Mutex::new(BucketState {
                tokens: 0.0,
                last: Instant::now(),
            }),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.limits.is_none()
    }

    /// Reserves `cost` KiB and returns how long the caller must wait.
    fn reserve(&self, cost: f64) -> Duration {
        let Some((rate, capacity)) = self.limits else {
            return Duration::ZERO;
        };
        let mut state = self.state.lock();
        let now = Instant::now();
        let refill = now.saturating_duration_since(state.last).as_secs_f64() * rate;
        state.tokens = (state.tokens + refill).min(capacity);
        state.last = now;
        state.tokens -= cost;
        if state.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.tokens / rate)
        }
    }

    fn refund(&self, cost: f64) {
        if let Some((_, capacity)) = self.limits {
            let mut state = self.state.lock();
            state.tokens = (state.tokens + cost).min(capacity);
        }
    }

    /// Waits until `bytes` may pass, or until `cancel` fires.
    ///
    /// A cancelled wait gives its reservation back.
    pub async fn acquire(&self, bytes: usize, cancel: &CancellationToken) -> Result<()> {
        if self.is_unlimited() || bytes == 0 {
            return Ok(());
        }
        if cancel.is_cancelled() {
            return Err(FsError::RateLimitWaitCancelled);
        }
        let cost = bytes as f64 / KIB;
        let wait = self.reserve(cost);
        if wait.is_zero() {
            return Ok(());
        }
        tokio::select! {
            () = tokio::time::sleep(wait) => Ok(()),
            () = cancel.cancelled() => {
                self.refund(cost);
                Err(FsError::RateLimitWaitCancelled)
            }
        }
    }
}

/// A shared rate limit that can wrap any number of streams.
pub struct Limiter {
    bucket: Arc<TokenBucket>,
    rate: u64,
    chunk_size: usize,
}

impl Limiter {
    pub fn new(rate_bytes: u64) -> Self {
        Self::with_chunk_size(rate_bytes, DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(rate_bytes: u64, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            bucket: Arc::new(TokenBucket::new(rate_bytes, chunk_size)),
            rate: rate_bytes,
            chunk_size,
        }
    }

    /// Configured rate in bytes per second; zero means unlimited.
    pub fn rate(&self) -> u64 {
        self.rate
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Waits for permission to move `bytes`.
    pub async fn wait(&self, bytes: usize, cancel: &CancellationToken) -> Result<()> {
        self.bucket.acquire(bytes, cancel).await
    }

    pub fn limit_reader<R: AsyncRead + Unpin>(&self, reader: R, cancel: CancellationToken) -> Limited<R> {
        self.wrap(reader, cancel)
    }

    pub fn limit_writer<W: AsyncWrite + Unpin>(&self, writer: W, cancel: CancellationToken) -> Limited<W> {
        self.wrap(writer, cancel)
    }

    pub fn limit_read_writer<S>(&self, stream: S, cancel: CancellationToken) -> Limited<S>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.wrap(stream, cancel)
    }

    fn wrap<S>(&self, inner: S, cancel: CancellationToken) -> Limited<S> {
        Limited {
            inner,
            bucket: Arc::clone(&self.bucket),
            chunk_size: self.chunk_size,
            cancel,
            read: Permit::Idle,
            write: Permit::Idle,
        }
    }
}

type Acquire = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

enum Permit {
    Idle,
    Waiting(Acquire, usize),
    Granted(usize),
}

/// A stream whose reads and writes pass through a token bucket.
pub struct Limited<S> {
    inner: S,
    bucket: Arc<TokenBucket>,
    chunk_size: usize,
    cancel: CancellationToken,
    read: Permit,
    write: Permit,
}

impl<S: fmt::Debug> fmt::Debug for Limited<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Limited")
            .field("inner", &self.inner)
            .field("chunk_size", &self.chunk_size)
            .field("unlimited", &self.bucket.is_unlimited())
            .finish_non_exhaustive()
    }
}

impl<S> Limited<S> {
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    /// Polls until `wanted` bytes (capped at one chunk) are granted.
    fn poll_permit(
        permit: &mut Permit,
        bucket: &Arc<TokenBucket>,
        cancel: &CancellationToken,
        chunk_size: usize,
        wanted: usize,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<usize>> {
        loop {
            match permit {
                Permit::Granted(n) => return Poll::Ready(Ok(*n)),
                Permit::Idle => {
                    let n = wanted.min(chunk_size);
                    let bucket = Arc::clone(bucket);
                    let cancel = cancel.clone();
                    let fut: Acquire = Box::pin(async move { bucket.acquire(n, &cancel).await });
                    *permit = Permit::Waiting(fut, n);
                }
                Permit::Waiting(fut, n) => {
                    let n = *n;
                    match ready!(fut.as_mut().poll(cx)) {
                        Ok(()) => *permit = Permit::Granted(n),
                        Err(e) => {
                            *permit = Permit::Idle;
                            return Poll::Ready(Err(e.into_io()));
                        }
                    }
                }
            }
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Limited<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.bucket.is_unlimited() || buf.remaining() == 0 {
            return Pin::new(&mut this.inner).poll_read(cx, buf);
        }
        let granted = ready!(Self::poll_permit(
            &mut this.read,
            &this.bucket,
            &this.cancel,
            this.chunk_size,
            buf.remaining(),
            cx,
        ))?;

        let dst = buf.initialize_unfilled_to(granted.min(buf.remaining()));
        let mut chunk = ReadBuf::new(dst);
        ready!(Pin::new(&mut this.inner).poll_read(cx, &mut chunk))?;
        let filled = chunk.filled().len();
        buf.advance(filled);
        this.read = Permit::Idle;
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Limited<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.bucket.is_unlimited() || buf.is_empty() {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        }
        let granted = ready!(Self::poll_permit(
            &mut this.write,
            &this.bucket,
            &this.cancel,
            this.chunk_size,
            buf.len(),
            cx,
        ))?;

        let n = granted.min(buf.len());
        let written = ready!(Pin::new(&mut this.inner).poll_write(cx, &buf[..n]))?;
        this.write = Permit::Idle;
        Poll::Ready(Ok(written))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl<S: AsyncSeek + Unpin> AsyncSeek for Limited<S> {
    fn start_seek(self: Pin<&mut Self>, position: io::SeekFrom) -> io::Result<()> {
        Pin::new(&mut self.get_mut().inner).start_seek(position)
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Pin::new(&mut self.get_mut().inner).poll_complete(cx)
    }
}

/// Shared limiters keyed by identity and rate, expired after idling.
pub struct RateLimiterRegistry {
    limiters: Arc<TtlMap<(String, u64), Arc<Limiter>>>,
    chunk_size: usize,
}

impl RateLimiterRegistry {
    pub fn new(idle_ttl: Duration, chunk_size: usize) -> Self {
        Self {
            limiters: Arc::new(TtlMap::with_idle_expiry(idle_ttl)),
            chunk_size,
        }
    }

    /// Returns the limiter for `(key, rate)`, creating it atomically if absent.
    pub fn get_limiter(&self, key: &str, rate_bytes: u64) -> Arc<Limiter> {
        let chunk_size = self.chunk_size;
        self.limiters.get_or_insert_with((key.to_string(), rate_bytes), || {
            tracing::debug!(key, rate_bytes, "creating rate limiter");
            Arc::new(Limiter::with_chunk_size(rate_bytes, chunk_size))
        })
    }

    /// Number of cached limiters, including idle ones not yet swept.
    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    /// Sweeps idle limiters in the background.
    pub fn spawn_sweeper(&self, interval: Duration) -> SweeperHandle {
        self.limiters.spawn_sweeper(interval)
    }
}
