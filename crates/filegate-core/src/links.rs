//! Short-lived download links.
//!
//! A link maps an opaque id to `{path, token}` so a file can be fetched
//! without exposing its real path. Identical payloads minted within the TTL
//! share one id. Expiry is left entirely to the TTL maps.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use filegate_common::{SweeperHandle, TtlMap};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FsError, Result};

/// Default link lifetime.
pub const DEFAULT_LINK_TTL: Duration = Duration::from_secs(3 * 60 * 60);

/// Default prefix of generated download URLs.
pub const DEFAULT_URL_PREFIX: &str = "/api/v1/fsd";

/// Bits reserved for the per-millisecond sequence.
const SEQUENCE_BITS: u32 = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadLink {
    pub id: u64,
    pub path: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct LinkPayload<'a> {
    path: &'a str,
    token: &'a str,
}

/// Monotonic id source: milliseconds since the epoch in the high bits and a
/// sequence in the low bits. Ids never repeat within a process, even if the
/// wall clock steps backwards.
#[derive(Debug, Default)]
pub struct IdGenerator {
    last: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> u64 {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64);
        let floor = millis << SEQUENCE_BITS;
        let previous = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(floor.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        floor.max(previous + 1)
    }
}

/// Issues and resolves download links.
pub struct DownloadLinkRegistry {
    by_payload: Arc<TtlMap<String, DownloadLink>>,
    by_id: Arc<TtlMap<u64, DownloadLink>>,
    ids: IdGenerator,
    url_prefix: String,
}

impl Default for DownloadLinkRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_LINK_TTL)
    }
}

impl DownloadLinkRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self::with_url_prefix(ttl, DEFAULT_URL_PREFIX)
    }

    pub fn with_url_prefix(ttl: Duration, url_prefix: impl Into<String>) -> Self {
        Self {
            by_payload: Arc::new(TtlMap::new(ttl)),
            by_id: Arc::new(TtlMap::new(ttl)),
            ids: IdGenerator::new(),
            url_prefix: url_prefix.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.by_id.ttl()
    }

    /// Returns the id for `{path, token}`, minting one if none is live.
    pub fn create_link(&self, path: &str, token: &str) -> Result<u64> {
        let payload = serde_json::to_string(&LinkPayload { path, token })
            .map_err(|e| FsError::InvalidInput(format!("unserializable link payload: {e}")))?;
        let ttl = self.ttl();
        let link = self.by_payload.get_or_insert_with(payload, || {
            let expires_at = Utc::now()
                + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(3));
            DownloadLink {
                id: self.ids.next_id(),
                path: path.to_string(),
                token: token.to_string(),
                expires_at,
            }
        });

        // Keep the id side alive exactly as long as the payload side
        if !self.by_id.contains_key(&link.id) {
            let remaining = (link.expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            self.by_id.insert_with_ttl(link.id, link.clone(), remaining);
            debug!(id = link.id, path, "minted download link");
        }
        Ok(link.id)
    }

    /// Looks up a live link.
    pub fn resolve(&self, id: u64) -> Result<DownloadLink> {
        self.by_id.get(&id).ok_or(FsError::LinkExpired)
    }

    /// Parses a textual id (as found in a URL) and resolves it.
    pub fn resolve_str(&self, id: &str) -> Result<DownloadLink> {
        let id = id.parse::<u64>().map_err(|_| FsError::LinkExpired)?;
        self.resolve(id)
    }

    /// URL a client uses to fetch the link; directories download as zip.
    pub fn download_url(&self, id: u64, file_name: &str, is_dir: bool) -> String {
        let suffix = if is_dir { ".zip" } else { "" };
        format!("{}/{id}/{file_name}{suffix}", self.url_prefix)
    }

    /// Sweeps expired links in the background. Both handles must be kept.
    pub fn spawn_sweepers(&self, interval: Duration) -> [SweeperHandle; 2] {
        [
            self.by_payload.spawn_sweeper(interval),
            self.by_id.spawn_sweeper(interval),
        ]
    }
}
