use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::config::{
    retention, CACHE_CLEANUP_INTERVAL_SECS, CACHE_CLEANUP_STARTUP_DELAY_SECS,
};
use crate::schedule::ScheduledTask;
use crate::types::{FoundBlockRecord, ShareRecord};

// ---------------------------------------------------------------------------
// Partitions
// ---------------------------------------------------------------------------

/// Named cache partitions, each with its own retention period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
    PoolInfo,
    MinerInfo,
    Shares,
    Blocks,
    Payouts,
    /// Preferences and bookkeeping. Never cleaned.
    Metadata,
}

impl Partition {
    pub const ALL: [Partition; 6] = [
        Partition::PoolInfo,
        Partition::MinerInfo,
        Partition::Shares,
        Partition::Blocks,
        Partition::Payouts,
        Partition::Metadata,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Partition::PoolInfo => "pool_info",
            Partition::MinerInfo => "miner_info",
            Partition::Shares => "shares",
            Partition::Blocks => "blocks",
            Partition::Payouts => "payouts",
            Partition::Metadata => "metadata",
        }
    }

    /// None = kept until an explicit clear.
    pub fn retention(self) -> Option<Duration> {
        let secs = match self {
            Partition::PoolInfo => retention::POOL_INFO_SECS,
            Partition::MinerInfo => retention::MINER_INFO_SECS,
            Partition::Shares => retention::SHARES_SECS,
            Partition::Blocks => retention::BLOCKS_SECS,
            Partition::Payouts => retention::PAYOUTS_SECS,
            Partition::Metadata => return None,
        };
        Some(Duration::from_secs(secs))
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Entries and read results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
    pub id: String,
    pub data: T,
    /// Write time, ms since epoch. Drives retention.
    pub timestamp: i64,
    /// Read time, ms since epoch.
    pub last_accessed: i64,
}

/// Outcome of a cache read. Backend failures surface as `Unavailable`
/// instead of errors; callers treat it like a miss.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheRead<T> {
    Hit(CacheEntry<T>),
    Miss,
    Unavailable,
}

impl<T> CacheRead<T> {
    pub fn hit(self) -> Option<CacheEntry<T>> {
        match self {
            CacheRead::Hit(entry) => Some(entry),
            CacheRead::Miss | CacheRead::Unavailable => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Record keys
// ---------------------------------------------------------------------------

/// Dedup key for a share: (API URL, side height, template id).
pub fn share_key(api_url: &str, share: &ShareRecord) -> String {
    format!("{api_url}|{}|{}", share.side_height, share.template_id)
}

/// Dedup key for a found block: (API URL, main height, block id).
pub fn block_key(api_url: &str, block: &FoundBlockRecord) -> String {
    format!("{api_url}|{}|{}", block.main_block.height, block.main_block.id)
}

// ---------------------------------------------------------------------------
// LocalCache
// ---------------------------------------------------------------------------

/// Best-effort durable cache on SQLite. Every operation degrades to a no-op or
/// a miss when the backend is missing or failing; nothing here returns an error.
#[derive(Clone)]
pub struct LocalCache {
    pool: Option<SqlitePool>,
}

impl LocalCache {
    /// Open (creating if needed) the cache file. Falls back to a disabled cache on failure.
    pub async fn open(db_path: &str) -> Self {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        match SqlitePool::connect_with(options).await {
            Ok(pool) => match Self::from_pool(pool).await {
                Ok(cache) => {
                    info!("Local cache ready at {db_path}");
                    cache
                }
                Err(e) => {
                    warn!("Local cache migration failed, running without cache: {e}");
                    Self::disabled()
                }
            },
            Err(e) => {
                warn!("Local cache unavailable at {db_path}, running without cache: {e}");
                Self::disabled()
            }
        }
    }

    pub async fn from_pool(pool: SqlitePool) -> crate::error::Result<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool: Some(pool) })
    }

    /// A cache with no backend: writes are skipped, reads always miss.
    pub fn disabled() -> Self {
        Self { pool: None }
    }

    pub fn is_available(&self) -> bool {
        self.pool.is_some()
    }

    /// Upsert `value` under (partition, key) with a fresh write timestamp.
    /// Returns whether the value was stored.
    pub async fn put<T: Serialize>(&self, partition: Partition, key: &str, value: &T) -> bool {
        self.put_at(partition, key, value, now_ms()).await
    }

    pub(crate) async fn put_at<T: Serialize>(
        &self,
        partition: Partition,
        key: &str,
        value: &T,
        written_at_ms: i64,
    ) -> bool {
        let Some(pool) = &self.pool else { return false };
        let data = match serde_json::to_string(value) {
            Ok(d) => d,
            Err(e) => {
                warn!(partition = %partition, key, "Cache serialize failed: {e}");
                return false;
            }
        };
        match upsert(pool, partition, key, &data, written_at_ms).await {
            Ok(()) => true,
            Err(e) => {
                warn!(partition = %partition, key, "Cache write failed: {e}");
                false
            }
        }
    }

    /// Read (partition, key) and refresh its `last_accessed`.
    pub async fn get<T: DeserializeOwned>(&self, partition: Partition, key: &str) -> CacheRead<T> {
        let Some(pool) = &self.pool else { return CacheRead::Unavailable };

        let row: Option<(String, i64)> = match sqlx::query_as(
            "SELECT data, timestamp FROM cache_entries WHERE partition = ? AND id = ?",
        )
        .bind(partition.as_str())
        .bind(key)
        .fetch_optional(pool)
        .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(partition = %partition, key, "Cache read failed: {e}");
                return CacheRead::Unavailable;
            }
        };

        let Some((data, timestamp)) = row else { return CacheRead::Miss };

        let data: T = match serde_json::from_str(&data) {
            Ok(d) => d,
            Err(e) => {
                // Schema drift: treat the stale entry as absent.
                debug!(partition = %partition, key, "Cache entry undecodable: {e}");
                return CacheRead::Miss;
            }
        };

        let last_accessed = now_ms();
        if let Err(e) = sqlx::query(
            "UPDATE cache_entries SET last_accessed = ? WHERE partition = ? AND id = ?",
        )
        .bind(last_accessed)
        .bind(partition.as_str())
        .bind(key)
        .execute(pool)
        .await
        {
            debug!(partition = %partition, key, "Cache touch failed: {e}");
        }

        CacheRead::Hit(CacheEntry {
            id: key.to_string(),
            data,
            timestamp,
            last_accessed,
        })
    }

    /// Store each share under its dedup key. Returns the number written.
    pub async fn put_shares(&self, api_url: &str, shares: &[ShareRecord]) -> usize {
        let keyed: Vec<(String, &ShareRecord)> =
            shares.iter().map(|s| (share_key(api_url, s), s)).collect();
        self.put_batch(Partition::Shares, &keyed).await
    }

    /// Store each found block under its dedup key. Returns the number written.
    pub async fn put_blocks(&self, api_url: &str, blocks: &[FoundBlockRecord]) -> usize {
        let keyed: Vec<(String, &FoundBlockRecord)> =
            blocks.iter().map(|b| (block_key(api_url, b), b)).collect();
        self.put_batch(Partition::Blocks, &keyed).await
    }

    async fn put_batch<T: Serialize>(&self, partition: Partition, items: &[(String, &T)]) -> usize {
        let Some(pool) = &self.pool else { return 0 };
        if items.is_empty() {
            return 0;
        }
        match upsert_batch(pool, partition, items, now_ms()).await {
            Ok(n) => n,
            Err(e) => {
                warn!(partition = %partition, count = items.len(), "Cache batch write failed: {e}");
                0
            }
        }
    }

    /// Delete entries older than their partition's retention. Metadata is skipped.
    /// Returns the number of removed entries.
    pub async fn cleanup(&self) -> u64 {
        self.cleanup_at(now_ms()).await
    }

    pub(crate) async fn cleanup_at(&self, now_ms: i64) -> u64 {
        let Some(pool) = &self.pool else { return 0 };
        let mut removed = 0u64;

        for partition in Partition::ALL {
            let Some(retention) = partition.retention() else { continue };
            let cutoff = now_ms - retention.as_millis() as i64;
            match sqlx::query("DELETE FROM cache_entries WHERE partition = ? AND timestamp < ?")
                .bind(partition.as_str())
                .bind(cutoff)
                .execute(pool)
                .await
            {
                Ok(res) => removed += res.rows_affected(),
                Err(e) => warn!(partition = %partition, "Cache cleanup failed: {e}"),
            }
        }

        if removed > 0 {
            info!(removed, "Cache cleanup removed {removed} expired entries");
        }
        removed
    }

    /// Approximate stored bytes (payload plus key lengths).
    pub async fn size_estimate(&self) -> u64 {
        let Some(pool) = &self.pool else { return 0 };
        sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(SUM(LENGTH(data) + LENGTH(id)), 0) FROM cache_entries",
        )
        .fetch_one(pool)
        .await
        .map(|n| n.max(0) as u64)
        .unwrap_or_else(|e| {
            warn!("Cache size estimate failed: {e}");
            0
        })
    }

    pub async fn entry_count(&self, partition: Partition) -> u64 {
        let Some(pool) = &self.pool else { return 0 };
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM cache_entries WHERE partition = ?")
            .bind(partition.as_str())
            .fetch_one(pool)
            .await
            .map(|n| n.max(0) as u64)
            .unwrap_or(0)
    }

    /// Remove every cached record. Preferences in the metadata partition survive.
    pub async fn clear(&self) -> u64 {
        let Some(pool) = &self.pool else { return 0 };
        match sqlx::query("DELETE FROM cache_entries WHERE partition <> ?")
            .bind(Partition::Metadata.as_str())
            .execute(pool)
            .await
        {
            Ok(res) => {
                info!(removed = res.rows_affected(), "Cache cleared");
                res.rows_affected()
            }
            Err(e) => {
                warn!("Cache clear failed: {e}");
                0
            }
        }
    }

    pub async fn preference(&self, key: &str) -> Option<String> {
        self.get::<String>(Partition::Metadata, key)
            .await
            .hit()
            .map(|e| e.data)
    }

    pub async fn set_preference(&self, key: &str, value: &str) -> bool {
        self.put(Partition::Metadata, key, &value).await
    }

    pub async fn remove_preference(&self, key: &str) {
        let Some(pool) = &self.pool else { return };
        if let Err(e) = sqlx::query("DELETE FROM cache_entries WHERE partition = ? AND id = ?")
            .bind(Partition::Metadata.as_str())
            .bind(key)
            .execute(pool)
            .await
        {
            warn!(key, "Preference removal failed: {e}");
        }
    }
}

async fn upsert(
    pool: &SqlitePool,
    partition: Partition,
    key: &str,
    data: &str,
    written_at_ms: i64,
) -> sqlx::Result<()> {
    sqlx::query(UPSERT_SQL)
        .bind(partition.as_str())
        .bind(key)
        .bind(data)
        .bind(written_at_ms)
        .bind(written_at_ms)
        .execute(pool)
        .await?;
    Ok(())
}

async fn upsert_batch<T: Serialize>(
    pool: &SqlitePool,
    partition: Partition,
    items: &[(String, &T)],
    written_at_ms: i64,
) -> crate::error::Result<usize> {
    let mut tx = pool.begin().await?;
    for (key, value) in items {
        let data = serde_json::to_string(value)?;
        sqlx::query(UPSERT_SQL)
            .bind(partition.as_str())
            .bind(key.as_str())
            .bind(data)
            .bind(written_at_ms)
            .bind(written_at_ms)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(items.len())
}

const UPSERT_SQL: &str = r#"
    INSERT INTO cache_entries (partition, id, data, timestamp, last_accessed)
    VALUES (?, ?, ?, ?, ?)
    ON CONFLICT(partition, id) DO UPDATE SET
        data = excluded.data,
        timestamp = excluded.timestamp,
        last_accessed = excluded.last_accessed
"#;

/// Hourly cleanup, with one pass shortly after startup.
pub fn spawn_cleanup(cache: LocalCache) -> ScheduledTask {
    spawn_cleanup_every(
        cache,
        Duration::from_secs(CACHE_CLEANUP_STARTUP_DELAY_SECS),
        Duration::from_secs(CACHE_CLEANUP_INTERVAL_SECS),
    )
}

pub(crate) fn spawn_cleanup_every(cache: LocalCache, initial_delay: Duration, period: Duration) -> ScheduledTask {
    ScheduledTask::spawn("cache-cleanup", initial_delay, period, move || {
        let cache = cache.clone();
        async move {
            let removed = cache.cleanup().await;
            let bytes = cache.size_estimate().await;
            debug!(removed, bytes, "Cache size after cleanup");
        }
    })
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    const DAY_MS: i64 = 24 * 3_600 * 1_000;

    /// Single-connection in-memory cache; every connection to `:memory:` is a new database.
    pub(crate) async fn in_memory_cache() -> LocalCache {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        LocalCache::from_pool(pool).await.unwrap()
    }

    fn share(height: u64, template: &str, difficulty: u64) -> ShareRecord {
        ShareRecord {
            side_height: height,
            template_id: template.to_string(),
            difficulty,
            miner_address: "4miner".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn put_then_get_round_trips_and_touches() {
        let cache = in_memory_cache().await;
        assert!(cache.put_at(Partition::PoolInfo, "https://p", &42u64, 1_000).await);

        let entry = cache.get::<u64>(Partition::PoolInfo, "https://p").await.hit().unwrap();
        assert_eq!(entry.data, 42);
        assert_eq!(entry.timestamp, 1_000);
        assert!(entry.last_accessed > 1_000);
    }

    #[tokio::test]
    async fn missing_key_is_a_miss() {
        let cache = in_memory_cache().await;
        assert_eq!(cache.get::<u64>(Partition::Shares, "nope").await, CacheRead::Miss);
    }

    #[tokio::test]
    async fn same_share_key_overwrites() {
        let cache = in_memory_cache().await;
        cache.put_shares("https://p", &[share(100, "t1", 5)]).await;
        cache.put_shares("https://p", &[share(100, "t1", 7)]).await;

        assert_eq!(cache.entry_count(Partition::Shares).await, 1);
        let key = share_key("https://p", &share(100, "t1", 0));
        let stored = cache.get::<ShareRecord>(Partition::Shares, &key).await.hit().unwrap();
        assert_eq!(stored.data.difficulty, 7);
    }

    #[tokio::test]
    async fn distinct_api_urls_do_not_collide() {
        let cache = in_memory_cache().await;
        cache.put_shares("https://a", &[share(100, "t1", 5)]).await;
        cache.put_shares("https://b", &[share(100, "t1", 5)]).await;
        assert_eq!(cache.entry_count(Partition::Shares).await, 2);
    }

    #[tokio::test]
    async fn cleanup_removes_only_expired_entries() {
        let cache = in_memory_cache().await;
        let now = 400 * DAY_MS;
        cache.put_at(Partition::Shares, "old", &1u8, now - 31 * DAY_MS).await;
        cache.put_at(Partition::Shares, "young", &2u8, now - 29 * DAY_MS).await;
        cache.put_at(Partition::PoolInfo, "stale-pool", &3u8, now - 2 * DAY_MS).await;
        cache.put_at(Partition::Metadata, "p2pool_address", &"4abc", 0).await;

        let removed = cache.cleanup_at(now).await;

        assert_eq!(removed, 2);
        assert_eq!(cache.get::<u8>(Partition::Shares, "old").await, CacheRead::Miss);
        assert!(cache.get::<u8>(Partition::Shares, "young").await.hit().is_some());
        assert_eq!(cache.get::<u8>(Partition::PoolInfo, "stale-pool").await, CacheRead::Miss);
        assert_eq!(cache.preference("p2pool_address").await.as_deref(), Some("4abc"));
    }

    #[tokio::test]
    async fn scheduled_cleanup_runs_after_delay_then_every_period() {
        let cache = in_memory_cache().await;
        let expired = now_ms() - 31 * DAY_MS;
        cache.put_at(Partition::Shares, "old", &1u8, expired).await;
        cache.put(Partition::Shares, "fresh", &2u8).await;

        let task = spawn_cleanup_every(cache.clone(), Duration::from_millis(100), Duration::from_millis(300));
        assert_eq!(cache.entry_count(Partition::Shares).await, 2);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(cache.entry_count(Partition::Shares).await, 1);

        cache.put_at(Partition::Shares, "old-again", &3u8, expired).await;
        assert_eq!(cache.entry_count(Partition::Shares).await, 2);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(cache.entry_count(Partition::Shares).await, 1);
        assert!(cache.get::<u8>(Partition::Shares, "fresh").await.hit().is_some());

        task.shutdown().await;
    }

    #[tokio::test]
    async fn disabled_cache_degrades_to_misses() {
        let cache = LocalCache::disabled();
        assert!(!cache.put(Partition::PoolInfo, "k", &1u8).await);
        assert_eq!(cache.get::<u8>(Partition::PoolInfo, "k").await, CacheRead::Unavailable);
        assert_eq!(cache.put_shares("https://p", &[share(1, "t", 1)]).await, 0);
        assert_eq!(cache.cleanup().await, 0);
        assert_eq!(cache.size_estimate().await, 0);
    }

    #[tokio::test]
    async fn clear_keeps_preferences() {
        let cache = in_memory_cache().await;
        cache.set_preference("p2pool_api_url", "https://p").await;
        cache.put_shares("https://p", &[share(1, "a", 1), share(2, "b", 1)]).await;
        assert!(cache.size_estimate().await > 0);

        assert_eq!(cache.clear().await, 2);
        assert_eq!(cache.entry_count(Partition::Shares).await, 0);
        assert_eq!(cache.preference("p2pool_api_url").await.as_deref(), Some("https://p"));

        cache.remove_preference("p2pool_api_url").await;
        assert!(cache.preference("p2pool_api_url").await.is_none());
    }

    #[tokio::test]
    async fn undecodable_entry_reads_as_miss() {
        let cache = in_memory_cache().await;
        cache.put(Partition::MinerInfo, "k", &"text").await;
        assert_eq!(cache.get::<u64>(Partition::MinerInfo, "k").await, CacheRead::Miss);
    }
}
