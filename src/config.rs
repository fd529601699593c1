//! Externally-supplied configuration.
//!
//! The bridge consumes these values but does not own their provenance: TLS
//! bounds and concurrency limits are forwarded to the transport adapter,
//! watermarks govern the byte channels, and the idle timeout drives pool
//! eviction. Everything is defaulted if absent.

use std::time::Duration;

/// TLS protocol version bound, forwarded to the transport adapter.
///
/// The bridge performs no TLS itself; the bounds only participate in the
/// session configuration fingerprint and the adapter's native setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

/// Per-session configuration.
///
/// Two requests share a pooled session exactly when their configurations
/// produce the same [`SessionKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionConfig {
    /// Minimum TLS version the native transport may negotiate.
    pub tls_min: TlsVersion,
    /// Maximum TLS version the native transport may negotiate.
    pub tls_max: TlsVersion,
    /// Upper bound on concurrent tasks the native handle should allow.
    pub max_concurrent_tasks: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tls_min: TlsVersion::Tls12,
            tls_max: TlsVersion::Tls13,
            max_concurrent_tasks: 64,
        }
    }
}

/// Fingerprint of everything that forces a distinct native configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    tls_min: TlsVersion,
    tls_max: TlsVersion,
    max_concurrent_tasks: usize,
}

impl SessionConfig {
    /// Computes the pooling fingerprint for this configuration.
    pub fn key(&self) -> SessionKey {
        SessionKey {
            tls_min: self.tls_min,
            tls_max: self.tls_max,
            max_concurrent_tasks: self.max_concurrent_tasks,
        }
    }
}

/// Whether a pool is a long-lived shared resource or scoped to one unit of
/// work. Both reject use after shutdown; the mode records intent for the
/// owner of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolMode {
    /// Long-lived, shared across many callers.
    #[default]
    Shared,
    /// Ephemeral, torn down when its owning scope ends.
    Scoped,
}

/// Pool-wide configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Storage mode of the pool.
    pub mode: PoolMode,
    /// A session idle for 80% of this duration is evicted.
    pub idle_timeout: Duration,
    /// Buffered response bytes at which chunk delivery is paused.
    pub high_watermark: usize,
    /// Buffered response bytes below which delivery resumes.
    pub low_watermark: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            mode: PoolMode::Shared,
            idle_timeout: Duration::from_secs(60),
            high_watermark: 64 * 1024,
            low_watermark: 32 * 1024,
        }
    }
}

impl PoolConfig {
    /// Validates the watermark relationship.
    ///
    /// # Panics
    ///
    /// Panics unless `low_watermark < high_watermark`; a backwards pair is a
    /// construction-time programming error, not a recoverable condition.
    pub(crate) fn assert_watermarks(&self) {
        assert!(
            self.low_watermark < self.high_watermark,
            "low watermark ({}) must be below high watermark ({})",
            self.low_watermark,
            self.high_watermark,
        );
    }
}
