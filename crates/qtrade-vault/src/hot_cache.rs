use moka::future::Cache;
use qtrade_models::memory::MemoryRecord;
use std::time::Duration;
use uuid::Uuid;

/// In-memory hot cache of memory records, backed by moka.
///
/// Fronts id lookups so agents re-reading the same excerpts during a run
/// don't hit SQLite. Every vault write invalidates the touched ids.
pub struct HotCache {
    inner: Cache<Uuid, MemoryRecord>,
}

impl HotCache {
    pub fn new(max_capacity: u64, ttl: Duration) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub async fn get(&self, id: &Uuid) -> Option<MemoryRecord> {
        self.inner.get(id).await
    }

    pub async fn insert(&self, record: MemoryRecord) {
        self.inner.insert(record.id, record).await;
    }

    pub async fn invalidate(&self, id: &Uuid) {
        self.inner.invalidate(id).await;
    }

    /// Drop every id touched by a multi-record write.
    pub async fn invalidate_all<I>(&self, ids: I)
    where
        I: IntoIterator<Item = Uuid>,
    {
        for id in ids {
            self.inner.invalidate(&id).await;
        }
    }
}
