use moka::Expiry;
use moka::future::Cache;
use moka::notification::RemovalCause;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use time;

/// Session keys live for a day; a stalled upload silently expires and the
/// next `InitUpload` starts fresh.
const UPLOAD_SESSION_TTL: time::Duration = time::Duration::hours(24);
/// Tombstones are long-lived but still reconstructable from the metadata
/// store, so 30 days is an optimization window, not a correctness bound.
const TOMBSTONE_TTL: time::Duration = time::Duration::days(30);

pub const UPLOADING: &str = "uploading";

#[derive(Debug, Clone)]
pub struct MokaExpiration(time::Duration);

impl MokaExpiration {
    pub fn new(duration: time::Duration) -> Self {
        MokaExpiration(duration)
    }
    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(self.0.whole_seconds() as u64)
    }
}

/// Per-entry TTL carried in the value tuple. Updates reset the clock, which
/// is what gives the chunk set its refresh-on-add behavior.
pub struct PerEntryExpiry;

impl<K, V> Expiry<K, (MokaExpiration, V)> for PerEntryExpiry {
    fn expire_after_create(
        &self,
        _: &K,
        value: &(MokaExpiration, V),
        _: Instant,
    ) -> Option<Duration> {
        Some(value.0.as_duration())
    }

    fn expire_after_update(
        &self,
        _: &K,
        value: &(MokaExpiration, V),
        _: Instant,
        _: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.0.as_duration())
    }
}

pub type MokaVal<V> = (MokaExpiration, V);

fn build_cache<K, V>() -> Cache<K, MokaVal<V>>
where
    K: Clone + Eq + Hash + Send + Sync + Debug + 'static,
    V: Clone + Send + Sync + 'static,
{
    Cache::builder()
        .expire_after(PerEntryExpiry)
        .eviction_listener(|key: Arc<K>, _value: MokaVal<V>, cause: RemovalCause| {
            tracing::trace!("Evicted key: {:?}, cause: {:?}", &*key, &cause);
        })
        .build()
}

/// Finished-chunk index set for one upload session. The set mutates in
/// place; the cache entry is re-inserted on each add to renew the TTL.
pub type ChunkSet = Arc<Mutex<HashSet<String>>>;

fn session_key(user: &str, hash: &str) -> String {
    let mut s = String::with_capacity(user.len() + 1 + hash.len());
    s.push_str(user);
    s.push(':');
    s.push_str(hash);
    s
}

/// Hot state fronting the metadata store: upload-status flag, finished-chunk
/// set, and the instant-hit tombstone. Everything here is derived and
/// reconstructable; a missing key reads as `None`, never as a failure.
pub struct CacheState {
    upload_status: Cache<String, MokaVal<String>>,
    upload_chunks: Cache<String, MokaVal<ChunkSet>>,
    tombstone: Cache<String, MokaVal<String>>,
}

impl CacheState {
    pub fn new() -> Self {
        Self {
            upload_status: build_cache(),
            upload_chunks: build_cache(),
            tombstone: build_cache(),
        }
    }

    pub async fn upload_status(&self, user: &str, hash: &str) -> Option<String> {
        self.upload_status
            .get(&session_key(user, hash))
            .await
            .map(|(_, v)| v)
    }

    pub async fn set_upload_status(&self, user: &str, hash: &str, status: &str) {
        self.upload_status
            .insert(
                session_key(user, hash),
                (MokaExpiration::new(UPLOAD_SESSION_TTL), status.to_string()),
            )
            .await;
    }

    pub async fn add_finished_chunk(&self, user: &str, hash: &str, index: &str) {
        let key = session_key(user, hash);
        let (_, set) = self
            .upload_chunks
            .get_with(key.clone(), async {
                (
                    MokaExpiration::new(UPLOAD_SESSION_TTL),
                    Arc::new(Mutex::new(HashSet::new())),
                )
            })
            .await;
        set.lock().insert(index.to_string());
        // Re-insert the same set to renew the 24 h window on every add.
        self.upload_chunks
            .insert(key, (MokaExpiration::new(UPLOAD_SESSION_TTL), set))
            .await;
    }

    pub async fn finished_chunk_set(&self, user: &str, hash: &str) -> HashSet<String> {
        match self.upload_chunks.get(&session_key(user, hash)).await {
            Some((_, set)) => set.lock().clone(),
            None => HashSet::new(),
        }
    }

    /// Members of the finished-chunk set in ascending numeric order.
    pub async fn finished_chunks(&self, user: &str, hash: &str) -> Vec<String> {
        let mut chunks: Vec<String> = self.finished_chunk_set(user, hash).await.into_iter().collect();
        chunks.sort_by_key(|idx| idx.parse::<u64>().unwrap_or(u64::MAX));
        chunks
    }

    pub async fn tombstone(&self, user: &str, hash: &str) -> Option<String> {
        self.tombstone
            .get(&session_key(user, hash))
            .await
            .map(|(_, v)| v)
    }

    pub async fn set_tombstone(&self, user: &str, hash: &str, url: &str) {
        self.tombstone
            .insert(
                session_key(user, hash),
                (MokaExpiration::new(TOMBSTONE_TTL), url.to_string()),
            )
            .await;
    }

    pub async fn remove_tombstone(&self, user: &str, hash: &str) {
        self.tombstone.invalidate(&session_key(user, hash)).await;
    }

    /// Tears down both session keys after a successful merge (or when a
    /// session is abandoned on purpose).
    pub async fn drop_upload_session(&self, user: &str, hash: &str) {
        let key = session_key(user, hash);
        self.upload_status.invalidate(&key).await;
        self.upload_chunks.invalidate(&key).await;
    }
}
