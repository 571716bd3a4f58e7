//! Live State Cache.
//!
//! One [`LiveSnapshot`] per device id, replaced as a whole on every fusion.
//! Readers clone an `Arc` under a short read lock, so they see either the
//! previous record or the next one, never a mix.
//!
//! Ownership: each entry records the session that registered it. Only that
//! session may publish, so a late result from an old connection cannot
//! overwrite the state of a newer one.
//!
//! Lifecycle of an entry:
//!
//! ```text
//! register ─► connected ─► (disconnect) ─► connected=false ─► (grace elapses) ─► expired
//!     ▲                                            │
//!     └──────────── device reconnects ─────────────┘
//! ```
//!
//! Expired entries keep a tombstone so "expired" and "never connected" stay
//! distinguishable. Tombstones are dropped after [`TOMBSTONE_TTL`], and at
//! most [`MAX_TOMBSTONES`] are kept, oldest evicted first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::detection::Detection;
use crate::fusion::{fuse, FusionResult, FusionWeights};

/// How long an expired device stays distinguishable from an unknown one.
pub const TOMBSTONE_TTL: Duration = Duration::from_secs(3600);

/// Upper bound on retained tombstones.
pub const MAX_TOMBSTONES: usize = 4096;

/// Externally visible state of one device.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveSnapshot {
    /// Device id
    pub device_id: String,
    /// Session that produced this record
    pub session_id: Uuid,
    /// Whether that session is still connected
    pub connected: bool,
    /// Latest annotated frame, JPEG
    pub frame: Option<Bytes>,
    /// Detections drawn on `frame`
    pub detections: Vec<Detection>,
    /// Latest fusion
    pub fusion: FusionResult,
    /// Monotonic version across the whole cache
    pub version: u64,
    /// Time of this record
    pub updated_at: DateTime<Utc>,
    /// When the session ended, if it has
    pub disconnected_at: Option<DateTime<Utc>>,
}

impl LiveSnapshot {
    /// Rounded fused count.
    pub fn people_count(&self) -> u32 {
        self.fusion.people_count()
    }
}

/// New frame content for a publish.
#[derive(Debug, Clone)]
pub struct FrameUpdate {
    /// Annotated JPEG
    pub jpeg: Bytes,
    /// Detections drawn on it
    pub detections: Vec<Detection>,
}

/// Result of a cache lookup.
#[derive(Debug, Clone)]
pub enum Lookup {
    /// Connected, or disconnected within the grace window
    Live(Arc<LiveSnapshot>),
    /// Known device whose grace window has elapsed
    Expired {
        /// When it expired
        expired_at: DateTime<Utc>,
    },
    /// Never seen
    Unknown,
}

#[derive(Debug)]
enum Entry {
    Active { snapshot: Arc<LiveSnapshot> },
    Tombstone { expired_at: DateTime<Utc> },
}

/// Per-device snapshot store.
#[derive(Debug)]
pub struct LiveStateCache {
    entries: RwLock<HashMap<String, Entry>>,
    grace: Duration,
    version: AtomicU64,
}

impl LiveStateCache {
    /// Create a cache that retains disconnected snapshots for `grace`.
    pub fn new(grace: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            grace,
            version: AtomicU64::new(0),
        }
    }

    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Make `session` the owner of `device_id`.
    ///
    /// A reconnecting device keeps its last frame and fusion until the new
    /// session publishes; a new device starts with a `no_data` record
    /// carrying the current `weights`.
    pub fn register(&self, device_id: &str, session: Uuid, weights: FusionWeights) -> Arc<LiveSnapshot> {
        let now = Utc::now();
        let mut entries = self.entries.write();
        let previous = match entries.get(device_id) {
            Some(Entry::Active { snapshot }) => Some(snapshot.clone()),
            _ => None,
        };

        let snapshot = Arc::new(LiveSnapshot {
            device_id: device_id.to_string(),
            session_id: session,
            connected: true,
            frame: previous.as_ref().and_then(|p| p.frame.clone()),
            detections: previous.as_ref().map(|p| p.detections.clone()).unwrap_or_default(),
            fusion: previous
                .as_ref()
                .map(|p| p.fusion.clone())
                .unwrap_or_else(|| fuse(None, None, weights, now)),
            version: self.next_version(),
            updated_at: now,
            disconnected_at: None,
        });
        entries.insert(
            device_id.to_string(),
            Entry::Active {
                snapshot: snapshot.clone(),
            },
        );
        snapshot
    }

    /// Replace the snapshot of `device_id` if `session` still owns it.
    ///
    /// Without a `frame`, the previous frame and detections are carried
    /// over. Returns the new snapshot, or `None` for a stale session.
    pub fn publish(
        &self,
        device_id: &str,
        session: Uuid,
        fusion: FusionResult,
        frame: Option<FrameUpdate>,
    ) -> Option<Arc<LiveSnapshot>> {
        let mut entries = self.entries.write();
        let Some(Entry::Active { snapshot }) = entries.get_mut(device_id) else {
            return None;
        };
        if snapshot.session_id != session || !snapshot.connected {
            return None;
        }

        let (frame, detections) = match frame {
            Some(update) => (Some(update.jpeg), update.detections),
            None => (snapshot.frame.clone(), snapshot.detections.clone()),
        };
        let next = Arc::new(LiveSnapshot {
            device_id: device_id.to_string(),
            session_id: session,
            connected: true,
            frame,
            detections,
            fusion,
            version: self.next_version(),
            updated_at: Utc::now(),
            disconnected_at: None,
        });
        *snapshot = next.clone();
        Some(next)
    }

    /// Mark the device disconnected if `session` still owns it.
    pub fn mark_disconnected(&self, device_id: &str, session: Uuid) -> Option<Arc<LiveSnapshot>> {
        let mut entries = self.entries.write();
        let Some(Entry::Active { snapshot }) = entries.get_mut(device_id) else {
            return None;
        };
        if snapshot.session_id != session {
            return None;
        }

        let now = Utc::now();
        let mut next = (**snapshot).clone();
        next.connected = false;
        next.disconnected_at = Some(now);
        next.updated_at = now;
        next.version = self.next_version();
        let next = Arc::new(next);
        *snapshot = next.clone();
        Some(next)
    }

    /// Look up a device.
    pub fn get(&self, device_id: &str) -> Lookup {
        self.get_at(device_id, Utc::now())
    }

    /// Look up a device as of `now`.
    pub fn get_at(&self, device_id: &str, now: DateTime<Utc>) -> Lookup {
        match self.entries.read().get(device_id) {
            Some(Entry::Active { snapshot }) => match self.expiry_of(snapshot) {
                Some(expired_at) if expired_at <= now => Lookup::Expired { expired_at },
                _ => Lookup::Live(snapshot.clone()),
            },
            Some(Entry::Tombstone { expired_at }) => Lookup::Expired {
                expired_at: *expired_at,
            },
            None => Lookup::Unknown,
        }
    }

    /// All live snapshots (connected or within grace), sorted by device id.
    pub fn list(&self) -> Vec<Arc<LiveSnapshot>> {
        let now = Utc::now();
        let mut out: Vec<_> = self
            .entries
            .read()
            .values()
            .filter_map(|e| match e {
                Entry::Active { snapshot } => match self.expiry_of(snapshot) {
                    Some(expired_at) if expired_at <= now => None,
                    _ => Some(snapshot.clone()),
                },
                Entry::Tombstone { .. } => None,
            })
            .collect();
        out.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        out
    }

    /// Number of connected devices.
    pub fn connected_count(&self) -> usize {
        self.entries
            .read()
            .values()
            .filter(|e| matches!(e, Entry::Active { snapshot } if snapshot.connected))
            .count()
    }

    /// Turn entries past their grace window into tombstones, freeing their
    /// frames, then drop tombstones older than [`TOMBSTONE_TTL`] or beyond
    /// [`MAX_TOMBSTONES`]. Returns how many entries were expired.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.write();
        let mut purged = 0;
        for entry in entries.values_mut() {
            let expired_at = match entry {
                Entry::Active { snapshot } => self.expiry_of(snapshot).filter(|at| *at <= now),
                Entry::Tombstone { .. } => None,
            };
            if let Some(expired_at) = expired_at {
                *entry = Entry::Tombstone { expired_at };
                purged += 1;
            }
        }

        let ttl = chrono::Duration::from_std(TOMBSTONE_TTL).unwrap_or(chrono::Duration::MAX);
        entries.retain(|_, entry| match entry {
            Entry::Tombstone { expired_at } => expired_at.checked_add_signed(ttl).map_or(true, |end| end > now),
            Entry::Active { .. } => true,
        });

        let mut tombstones: Vec<(DateTime<Utc>, String)> = entries
            .iter()
            .filter_map(|(id, entry)| match entry {
                Entry::Tombstone { expired_at } => Some((*expired_at, id.clone())),
                Entry::Active { .. } => None,
            })
            .collect();
        if tombstones.len() > MAX_TOMBSTONES {
            tombstones.sort();
            let excess = tombstones.len() - MAX_TOMBSTONES;
            for (_, id) in tombstones.into_iter().take(excess) {
                entries.remove(&id);
            }
        }
        purged
    }

    /// Number of expired devices still remembered.
    pub fn tombstone_count(&self) -> usize {
        self.entries
            .read()
            .values()
            .filter(|e| matches!(e, Entry::Tombstone { .. }))
            .count()
    }

    fn expiry_of(&self, snapshot: &LiveSnapshot) -> Option<DateTime<Utc>> {
        // A grace window too large to represent never expires.
        let grace = chrono::Duration::from_std(self.grace).ok()?;
        snapshot.disconnected_at?.checked_add_signed(grace)
    }
}
