//! Per-client transfer sessions.
//!
//! A session pins one raster for the duration of a chunk sequence. Chunk 0
//! opens a new generation; every other chunk is served from whatever the
//! latest installed generation pinned, so a client always reassembles a
//! single consistent image.

use std::{
    collections::{HashMap, HashSet},
    net::IpAddr,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use photoframe_types::{
    device::ClientKey,
    raster::{RasterBuffer, RasterSpec},
    PhotoframeError, Result,
};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

/// Claim on the next generation of a client's session, handed out by [`SessionStore::begin`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub key: ClientKey,
    pub generation: Uuid,
    seq: u64,
}

/// The raster a generation serves, plus where it came from.
#[derive(Debug, Clone)]
pub struct PinnedImage {
    pub buffer: Arc<RasterBuffer>,
    pub bucket: String,
    pub image: String,
}

#[derive(Debug, Clone)]
struct ClientSession {
    generation: Uuid,
    pinned: PinnedImage,
    started_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Entry {
    latest_seq: u64,
    session: Option<ClientSession>,
    last_access: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub client: ClientKey,
    pub generation: Uuid,
    pub bucket: String,
    pub image: String,
    pub started_at: DateTime<Utc>,
    pub idle_secs: u64,
}

#[derive(Default)]
struct StoreState {
    next_seq: u64,
    entries: HashMap<ClientKey, Entry>,
}

#[derive(Default)]
pub struct SessionStore {
    state: Mutex<StoreState>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new generation for `key` and run `choose` inside the same critical section.
    ///
    /// Whatever the previous generation pinned is released immediately, so
    /// until [`install`](Self::install) lands, non-zero chunks for `key` fail
    /// with `Sequence` rather than serving the old image.
    pub fn begin<T>(
        &self,
        key: ClientKey,
        choose: impl FnOnce() -> Result<T>,
    ) -> Result<(Ticket, T)> {
        let mut state = self.lock()?;
        state.next_seq += 1;
        let seq = state.next_seq;
        let entry = state.entries.entry(key).or_insert_with(|| Entry {
            latest_seq: 0,
            session: None,
            last_access: Instant::now(),
        });
        entry.latest_seq = seq;
        entry.session = None;
        entry.last_access = Instant::now();
        let chosen = choose()?;
        Ok((
            Ticket {
                key,
                generation: Uuid::new_v4(),
                seq,
            },
            chosen,
        ))
    }

    /// Pin `image` for the ticket's generation. Returns `false` when a newer
    /// chunk 0 for the same client already superseded this one.
    pub fn install(&self, ticket: &Ticket, image: PinnedImage) -> Result<bool> {
        let mut state = self.lock()?;
        let entry = state.entries.entry(ticket.key).or_insert_with(|| Entry {
            latest_seq: ticket.seq,
            session: None,
            last_access: Instant::now(),
        });
        if entry.latest_seq > ticket.seq {
            debug!(
                "Generation {} for {} superseded before install",
                ticket.generation, ticket.key
            );
            return Ok(false);
        }
        entry.latest_seq = ticket.seq;
        entry.last_access = Instant::now();
        entry.session = Some(ClientSession {
            generation: ticket.generation,
            pinned: image,
            started_at: Utc::now(),
        });
        Ok(true)
    }

    /// Copy of chunk `index` from the client's pinned raster; refreshes its idle clock.
    pub fn chunk(&self, key: &ClientKey, spec: &RasterSpec, index: i64) -> Result<Vec<u8>> {
        let mut state = self.lock()?;
        let entry = state
            .entries
            .get_mut(key)
            .ok_or(PhotoframeError::Sequence)?;
        let session = entry.session.as_ref().ok_or(PhotoframeError::Sequence)?;
        let bytes = session.pinned.buffer.chunk(spec, index)?.to_vec();
        entry.last_access = Instant::now();
        Ok(bytes)
    }

    /// Generation currently pinned for `key`, if any.
    pub fn generation(&self, key: &ClientKey) -> Option<Uuid> {
        let state = self.lock().ok()?;
        state
            .entries
            .get(key)
            .and_then(|entry| entry.session.as_ref())
            .map(|session| session.generation)
    }

    /// Remove sessions idle for longer than `timeout` as of `now`.
    pub fn evict_idle(&self, now: Instant, timeout: Duration) -> Result<Vec<ClientKey>> {
        let mut state = self.lock()?;
        let expired: Vec<ClientKey> = state
            .entries
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.last_access) > timeout)
            .map(|(key, _)| *key)
            .collect();
        for key in &expired {
            state.entries.remove(key);
        }
        Ok(expired)
    }

    /// Source addresses of clients that still have a session.
    pub fn active_addresses(&self) -> HashSet<IpAddr> {
        let Ok(state) = self.lock() else {
            return HashSet::new();
        };
        state
            .entries
            .keys()
            .filter_map(|key| match key {
                ClientKey::Address(ip) => Some(*ip),
                ClientKey::Device(_) => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().map(|state| state.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<SessionSummary> {
        let Ok(state) = self.lock() else {
            return Vec::new();
        };
        let now = Instant::now();
        let mut sessions: Vec<SessionSummary> = state
            .entries
            .iter()
            .filter_map(|(key, entry)| {
                let session = entry.session.as_ref()?;
                Some(SessionSummary {
                    client: *key,
                    generation: session.generation,
                    bucket: session.pinned.bucket.clone(),
                    image: session.pinned.image.clone(),
                    started_at: session.started_at,
                    idle_secs: now.saturating_duration_since(entry.last_access).as_secs(),
                })
            })
            .collect();
        sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        sessions
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>> {
        self.state
            .lock()
            .map_err(|_| PhotoframeError::Ops("failed to lock session store".into()))
    }
}
