use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::local_cache::now_ms;
use crate::cache::{LocalCache, Partition};
use crate::config::{
    poll_intervals, DEFAULT_API_URL, DEFAULT_BLOCKS_LIMIT, DEFAULT_MINER_LIMIT,
    DEFAULT_PAYOUTS_LIMIT, DEFAULT_SHARES_LIMIT, LOAD_MORE_INCREMENT, PREF_ADDRESS_KEY,
    PREF_API_URL_KEY,
};
use crate::error::{AppError, Result};
use crate::fetch::FetchError;
use crate::fetcher::PoolApi;
use crate::miner_scope::{self, newest_first, ScopedRecord};
use crate::types::{
    FoundBlockRecord, MinerSnapshot, PayoutRecord, PoolSnapshot, PriceSnapshot, ShareRecord, Target,
};

// ---------------------------------------------------------------------------
// Entity kinds and keys
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    PoolInfo,
    RecentShares,
    FoundBlocks,
    Price,
    MinerInfo,
    MinerShares,
    MinerBlocks,
    MinerPayouts,
    MinerWindowShares,
}

impl EntityKind {
    /// Fixed order; aggregate `error` reports the first failing kind in this order.
    pub const ALL: [EntityKind; 9] = [
        EntityKind::PoolInfo,
        EntityKind::RecentShares,
        EntityKind::FoundBlocks,
        EntityKind::Price,
        EntityKind::MinerInfo,
        EntityKind::MinerShares,
        EntityKind::MinerBlocks,
        EntityKind::MinerPayouts,
        EntityKind::MinerWindowShares,
    ];

    pub fn is_miner_scoped(self) -> bool {
        matches!(
            self,
            EntityKind::MinerInfo
                | EntityKind::MinerShares
                | EntityKind::MinerBlocks
                | EntityKind::MinerPayouts
                | EntityKind::MinerWindowShares
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::PoolInfo => "pool_info",
            EntityKind::RecentShares => "recent_shares",
            EntityKind::FoundBlocks => "found_blocks",
            EntityKind::Price => "price",
            EntityKind::MinerInfo => "miner_info",
            EntityKind::MinerShares => "miner_shares",
            EntityKind::MinerBlocks => "miner_blocks",
            EntityKind::MinerPayouts => "miner_payouts",
            EntityKind::MinerWindowShares => "miner_window_shares",
        }
    }

    pub fn poll_interval(self) -> Duration {
        let secs = match self {
            EntityKind::PoolInfo => poll_intervals::POOL_INFO_SECS,
            EntityKind::RecentShares => poll_intervals::SHARES_SECS,
            EntityKind::FoundBlocks => poll_intervals::FOUND_BLOCKS_SECS,
            EntityKind::Price => poll_intervals::PRICE_SECS,
            EntityKind::MinerInfo => poll_intervals::MINER_INFO_SECS,
            EntityKind::MinerShares => poll_intervals::MINER_SHARES_SECS,
            EntityKind::MinerBlocks => poll_intervals::MINER_BLOCKS_SECS,
            EntityKind::MinerPayouts => poll_intervals::PAYOUTS_SECS,
            EntityKind::MinerWindowShares => poll_intervals::WINDOW_SHARES_SECS,
        };
        Duration::from_secs(secs)
    }

    /// Page size for list entities; 0 for single-value entities.
    pub fn default_limit(self) -> usize {
        match self {
            EntityKind::RecentShares => DEFAULT_SHARES_LIMIT,
            EntityKind::FoundBlocks => DEFAULT_BLOCKS_LIMIT,
            EntityKind::MinerShares | EntityKind::MinerBlocks => DEFAULT_MINER_LIMIT,
            EntityKind::MinerPayouts => DEFAULT_PAYOUTS_LIMIT,
            EntityKind::PoolInfo
            | EntityKind::Price
            | EntityKind::MinerInfo
            | EntityKind::MinerWindowShares => 0,
        }
    }

    pub fn supports_load_more(self) -> bool {
        self.default_limit() > 0
    }

    pub fn partition(self) -> Partition {
        match self {
            EntityKind::PoolInfo | EntityKind::Price => Partition::PoolInfo,
            EntityKind::MinerInfo => Partition::MinerInfo,
            EntityKind::RecentShares | EntityKind::MinerShares | EntityKind::MinerWindowShares => {
                Partition::Shares
            }
            EntityKind::FoundBlocks | EntityKind::MinerBlocks => Partition::Blocks,
            EntityKind::MinerPayouts => Partition::Payouts,
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identity of one tracked entity. Pool-wide kinds carry no address, so
/// switching miners keeps pool data; switching API URL starts every key fresh.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    pub api_url: String,
    pub address: Option<String>,
    pub kind: EntityKind,
}

impl EntityKey {
    /// Key of the entity-level cache entry.
    pub fn cache_id(&self) -> String {
        match (self.kind, self.address.as_deref()) {
            (EntityKind::PoolInfo, _) => self.api_url.clone(),
            (EntityKind::Price, _) => "price|monero|usd".to_string(),
            (EntityKind::MinerInfo, Some(addr)) => format!("{}|{addr}", self.api_url),
            (kind, addr) => format!("{}|{}|{kind}", self.api_url, addr.unwrap_or("*")),
        }
    }
}

// ---------------------------------------------------------------------------
// Entity data and state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EntityData {
    Pool(PoolSnapshot),
    Price(PriceSnapshot),
    Miner(Option<MinerSnapshot>),
    Shares(Vec<ShareRecord>),
    Blocks(Vec<FoundBlockRecord>),
    Payouts(Vec<PayoutRecord>),
}

impl EntityData {
    /// Record count for lists, 1 for single values (0 for an unknown miner).
    pub fn len(&self) -> usize {
        match self {
            EntityData::Pool(_) | EntityData::Price(_) => 1,
            EntityData::Miner(m) => usize::from(m.is_some()),
            EntityData::Shares(v) => v.len(),
            EntityData::Blocks(v) => v.len(),
            EntityData::Payouts(v) => v.len(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EntityState {
    pub data: Option<EntityData>,
    /// Write time of the data shown: fetch time, or the cache entry's write time.
    pub last_update_ms: Option<i64>,
    pub error: Option<String>,
    pub completed_first_fetch: bool,
    pub refreshing: bool,
    pub from_cache: bool,
    pub limit: usize,
    /// Set when `load_more` found nothing beyond what is loaded; cleared once a
    /// later fetch returns more records.
    pub exhausted: bool,
}

/// Result of one refresh, typed instead of thrown.
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    Fresh,
    /// Upstream failed; the cached value written at `written_at_ms` is served.
    FromCache { written_at_ms: i64 },
    /// Upstream failed and nothing is cached. Previous in-memory data is kept.
    Failed(String),
    /// Another refresh of the same key was in flight; its result is shared.
    Coalesced,
    /// Miner-scoped kind with no address set.
    NotTracked,
}

impl RefreshOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshOutcome::Fresh => "fresh",
            RefreshOutcome::FromCache { .. } => "from_cache",
            RefreshOutcome::Failed(_) => "failed",
            RefreshOutcome::Coalesced => "coalesced",
            RefreshOutcome::NotTracked => "not_tracked",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadMoreOutcome {
    pub added: usize,
    pub total: usize,
    pub exhausted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregateStatus {
    pub is_loading: bool,
    pub is_refreshing: bool,
    pub last_update_ms: Option<i64>,
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// DataOrchestrator
// ---------------------------------------------------------------------------

/// Owns every tracked entity: fetch, write-through, cache fallback, pagination
/// and aggregate status.
pub struct DataOrchestrator {
    api: PoolApi,
    cache: LocalCache,
    target: RwLock<Target>,
    entities: DashMap<EntityKey, EntityState>,
    /// At most one in-flight fetch per key.
    inflight: DashMap<EntityKey, Arc<tokio::sync::Mutex<()>>>,
}

impl DataOrchestrator {
    pub fn new(api: PoolApi, cache: LocalCache, target: Target) -> Arc<Self> {
        Arc::new(Self {
            api,
            cache,
            target: RwLock::new(target),
            entities: DashMap::new(),
            inflight: DashMap::new(),
        })
    }

    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }

    pub fn target(&self) -> Target {
        self.target.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Switch API URL and/or address and persist both as preferences.
    /// In-memory state of other combinations is dropped; cache entries stay.
    pub async fn set_target(&self, target: Target) {
        let changed = {
            let mut current = self.target.write().unwrap_or_else(PoisonError::into_inner);
            if *current == target {
                false
            } else {
                *current = target.clone();
                true
            }
        };

        self.cache.set_preference(PREF_API_URL_KEY, &target.api_url).await;
        match &target.address {
            Some(addr) => {
                self.cache.set_preference(PREF_ADDRESS_KEY, addr).await;
            }
            None => self.cache.remove_preference(PREF_ADDRESS_KEY).await,
        }

        if changed {
            let keep = |k: &EntityKey| {
                k.api_url == target.api_url && (k.address.is_none() || k.address == target.address)
            };
            self.entities.retain(|k, _| keep(k));
            self.inflight.retain(|k, _| keep(k));
            info!(
                api_url = %target.api_url,
                address = target.address.as_deref().unwrap_or("-"),
                "Tracking target changed",
            );
        }
    }

    /// Kinds tracked for the current target.
    pub fn tracked_kinds(&self) -> Vec<EntityKind> {
        let has_address = self.target().address.is_some();
        EntityKind::ALL
            .into_iter()
            .filter(|k| has_address || !k.is_miner_scoped())
            .collect()
    }

    fn key(&self, kind: EntityKind) -> Option<EntityKey> {
        let target = self.target();
        let address = if kind.is_miner_scoped() {
            Some(target.address?)
        } else {
            None
        };
        Some(EntityKey { api_url: target.api_url, address, kind })
    }

    pub fn state(&self, kind: EntityKind) -> Option<EntityState> {
        let key = self.key(kind)?;
        self.entities.get(&key).map(|s| s.clone())
    }

    pub fn data(&self, kind: EntityKind) -> Option<EntityData> {
        self.state(kind).and_then(|s| s.data)
    }

    // --- typed getters -----------------------------------------------------

    pub fn pool_info(&self) -> Option<PoolSnapshot> {
        match self.data(EntityKind::PoolInfo)? {
            EntityData::Pool(p) => Some(p),
            _ => None,
        }
    }

    pub fn price(&self) -> Option<PriceSnapshot> {
        match self.data(EntityKind::Price)? {
            EntityData::Price(p) => Some(p),
            _ => None,
        }
    }

    pub fn miner_info(&self) -> Option<MinerSnapshot> {
        match self.data(EntityKind::MinerInfo)? {
            EntityData::Miner(m) => m,
            _ => None,
        }
    }

    pub fn recent_shares(&self) -> Option<Vec<ShareRecord>> {
        self.shares_of(EntityKind::RecentShares)
    }

    pub fn miner_shares(&self) -> Option<Vec<ShareRecord>> {
        self.shares_of(EntityKind::MinerShares)
    }

    pub fn miner_window_shares(&self) -> Option<Vec<ShareRecord>> {
        self.shares_of(EntityKind::MinerWindowShares)
    }

    pub fn found_blocks(&self) -> Option<Vec<FoundBlockRecord>> {
        self.blocks_of(EntityKind::FoundBlocks)
    }

    pub fn miner_blocks(&self) -> Option<Vec<FoundBlockRecord>> {
        self.blocks_of(EntityKind::MinerBlocks)
    }

    pub fn miner_payouts(&self) -> Option<Vec<PayoutRecord>> {
        match self.data(EntityKind::MinerPayouts)? {
            EntityData::Payouts(p) => Some(p),
            _ => None,
        }
    }

    fn shares_of(&self, kind: EntityKind) -> Option<Vec<ShareRecord>> {
        match self.data(kind)? {
            EntityData::Shares(s) => Some(s),
            _ => None,
        }
    }

    fn blocks_of(&self, kind: EntityKind) -> Option<Vec<FoundBlockRecord>> {
        match self.data(kind)? {
            EntityData::Blocks(b) => Some(b),
            _ => None,
        }
    }

    // --- refresh -----------------------------------------------------------

    /// Fetch one entity. On failure, serve the latest cache entry for its key;
    /// only when none exists is the error surfaced on the entity.
    pub async fn refresh(&self, kind: EntityKind) -> RefreshOutcome {
        let Some(key) = self.key(kind) else {
            return RefreshOutcome::NotTracked;
        };

        let lock = self.inflight.entry(key.clone()).or_default().clone();
        let _guard = match lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                let _ = lock.lock().await;
                debug!(entity = %kind, "Refresh coalesced with in-flight fetch");
                return RefreshOutcome::Coalesced;
            }
        };

        let limit = self.begin_refresh(&key);
        let result = self.fetch_entity(&key, limit, None).await;

        match result {
            Ok(data) => {
                self.write_through(&key, &data).await;
                let fetched_at = now_ms();
                self.update_current(&key, |st| {
                    let loaded = st.data.as_ref().map_or(0, EntityData::len);
                    if data.len() > loaded {
                        st.exhausted = false;
                    }
                    st.data = Some(data);
                    st.last_update_ms = Some(fetched_at);
                    st.error = None;
                    st.from_cache = false;
                });
                RefreshOutcome::Fresh
            }
            Err(e) => self.fall_back_to_cache(&key, e).await,
        }
    }

    /// Refresh every tracked entity concurrently.
    pub async fn refetch(&self) -> Vec<(EntityKind, RefreshOutcome)> {
        let kinds = self.tracked_kinds();
        let outcomes = join_all(kinds.iter().map(|k| self.refresh(*k))).await;
        kinds.into_iter().zip(outcomes).collect()
    }

    /// Re-fetch a list entity with its limit raised by `LOAD_MORE_INCREMENT`.
    /// When upstream has nothing beyond what is loaded, the limit is not raised.
    pub async fn load_more(&self, kind: EntityKind) -> Result<LoadMoreOutcome> {
        if !kind.supports_load_more() {
            return Err(AppError::Unsupported(format!("load_more on {kind}")));
        }
        let key = self
            .key(kind)
            .ok_or_else(|| AppError::Unsupported(format!("{kind} needs a miner address")))?;

        let lock = self.inflight.entry(key.clone()).or_default().clone();
        let _guard = lock.lock().await;

        let (current_limit, current_len) = self
            .entities
            .get(&key)
            .map(|s| (s.limit, s.data.as_ref().map_or(0, EntityData::len)))
            .unwrap_or((kind.default_limit(), 0));
        let current_limit = current_limit.max(kind.default_limit());
        let new_limit = current_limit + LOAD_MORE_INCREMENT;

        self.begin_refresh(&key);
        let data = match self.fetch_entity(&key, new_limit, None).await {
            Ok(d) => d,
            Err(e) => {
                self.update_current(&key, |st| st.error = Some(e.to_string()));
                return Err(e.into());
            }
        };

        let total = data.len();
        let grew = total > current_len;
        self.write_through(&key, &data).await;
        let fetched_at = now_ms();
        self.update_current(&key, |st| {
            st.data = Some(data);
            st.last_update_ms = Some(fetched_at);
            st.error = None;
            st.from_cache = false;
            st.exhausted = !grew;
            if grew {
                st.limit = new_limit;
            }
        });

        debug!(entity = %kind, total, grew, limit = new_limit, "load_more done");
        Ok(LoadMoreOutcome {
            added: total.saturating_sub(current_len),
            total,
            exhausted: !grew,
        })
    }

    /// Append older miner shares/blocks below the lowest loaded height using the
    /// historical scan. Returns how many new records were added.
    pub async fn load_older(&self, kind: EntityKind) -> Result<usize> {
        if !matches!(kind, EntityKind::MinerShares | EntityKind::MinerBlocks) {
            return Err(AppError::Unsupported(format!("load_older on {kind}")));
        }
        let key = self
            .key(kind)
            .ok_or_else(|| AppError::Unsupported(format!("{kind} needs a miner address")))?;

        let lock = self.inflight.entry(key.clone()).or_default().clone();
        let _guard = lock.lock().await;

        let Some(current) = self.entities.get(&key).and_then(|s| s.data.clone()) else {
            return Ok(0);
        };
        let cursor = match &current {
            EntityData::Shares(s) => s.iter().map(|r| r.height()).min(),
            EntityData::Blocks(b) => b.iter().map(|r| r.height()).min(),
            _ => None,
        };
        let Some(cursor) = cursor else { return Ok(0) };

        self.begin_refresh(&key);
        let older = match self.fetch_entity(&key, LOAD_MORE_INCREMENT, Some(cursor)).await {
            Ok(d) => d,
            Err(e) => {
                self.update_current(&key, |st| st.error = Some(e.to_string()));
                return Err(e.into());
            }
        };

        let before = current.len();
        let merged = match (current, older) {
            (EntityData::Shares(mut have), EntityData::Shares(more)) => {
                EntityData::Shares(merge_records(&mut have, more))
            }
            (EntityData::Blocks(mut have), EntityData::Blocks(more)) => {
                EntityData::Blocks(merge_records(&mut have, more))
            }
            (current, _) => current,
        };
        let total = merged.len();
        self.write_through(&key, &merged).await;
        self.update_current(&key, |st| {
            st.data = Some(merged);
            st.limit = st.limit.max(total);
            st.error = None;
        });
        Ok(total.saturating_sub(before))
    }

    /// Aggregate over the entities tracked for the current target.
    pub fn status(&self) -> AggregateStatus {
        let mut status = AggregateStatus::default();
        for kind in self.tracked_kinds() {
            let Some(key) = self.key(kind) else { continue };
            let Some(st) = self.entities.get(&key) else {
                status.is_loading = true;
                continue;
            };
            status.is_loading |= !st.completed_first_fetch;
            status.is_refreshing |= st.refreshing;
            if let Some(ts) = st.last_update_ms {
                status.last_update_ms = Some(status.last_update_ms.map_or(ts, |m| m.max(ts)));
            }
            if status.error.is_none() {
                status.error = st.error.clone();
            }
        }
        status
    }

    // --- internals ---------------------------------------------------------

    /// Mark the entity as refreshing and return the limit to fetch with.
    fn begin_refresh(&self, key: &EntityKey) -> usize {
        let mut st = self.entities.entry(key.clone()).or_insert_with(|| EntityState {
            limit: key.kind.default_limit(),
            ..EntityState::default()
        });
        st.refreshing = true;
        st.limit
    }

    /// Apply `f` and close out the refresh, unless the target moved on meanwhile
    /// (the key was dropped by `set_target`), in which case the result is discarded.
    fn update_current(&self, key: &EntityKey, f: impl FnOnce(&mut EntityState)) {
        match self.entities.get_mut(key) {
            Some(mut st) => {
                f(&mut st);
                st.refreshing = false;
                st.completed_first_fetch = true;
            }
            None => debug!(entity = %key.kind, "Discarding result for stale target"),
        }
    }

    async fn fall_back_to_cache(&self, key: &EntityKey, err: FetchError) -> RefreshOutcome {
        let cached = self
            .cache
            .get::<EntityData>(key.kind.partition(), &key.cache_id())
            .await
            .hit();

        match cached {
            Some(entry) => {
                info!(
                    entity = %key.kind,
                    age_ms = now_ms() - entry.timestamp,
                    "Fetch failed, serving cached value: {err}",
                );
                let written_at_ms = entry.timestamp;
                self.update_current(key, |st| {
                    st.data = Some(entry.data);
                    st.last_update_ms = Some(written_at_ms);
                    st.error = None;
                    st.from_cache = true;
                });
                RefreshOutcome::FromCache { written_at_ms }
            }
            None => {
                warn!(entity = %key.kind, "Fetch failed with nothing cached: {err}");
                let message = err.to_string();
                self.update_current(key, |st| st.error = Some(message.clone()));
                RefreshOutcome::Failed(message)
            }
        }
    }

    async fn fetch_entity(
        &self,
        key: &EntityKey,
        limit: usize,
        from_height: Option<u64>,
    ) -> std::result::Result<EntityData, FetchError> {
        let base = key.api_url.as_str();
        let address = key.address.as_deref().unwrap_or_default();
        let data = match key.kind {
            EntityKind::PoolInfo => EntityData::Pool(self.api.pool_info(base).await?),
            EntityKind::Price => EntityData::Price(self.api.price().await?),
            EntityKind::RecentShares => {
                EntityData::Shares(newest_first(self.api.shares(base, limit, None).await?, limit))
            }
            EntityKind::FoundBlocks => EntityData::Blocks(newest_first(
                self.api.found_blocks(base, limit, None).await?,
                limit,
            )),
            EntityKind::MinerInfo => EntityData::Miner(self.api.miner_info(base, address).await?),
            EntityKind::MinerShares => EntityData::Shares(
                miner_scope::miner_shares(&self.api, base, address, limit, from_height).await?,
            ),
            EntityKind::MinerBlocks => EntityData::Blocks(
                miner_scope::miner_blocks(&self.api, base, address, limit, from_height).await?,
            ),
            EntityKind::MinerPayouts => {
                EntityData::Payouts(self.api.payouts(base, address, limit).await?)
            }
            EntityKind::MinerWindowShares => EntityData::Shares(
                self.api.side_blocks_in_window(base, Some(address), None, None).await?,
            ),
        };
        Ok(data)
    }

    /// Persist the entity snapshot, plus individual share/block records under their dedup keys.
    async fn write_through(&self, key: &EntityKey, data: &EntityData) {
        self.cache.put(key.kind.partition(), &key.cache_id(), data).await;
        match data {
            EntityData::Shares(shares) => {
                self.cache.put_shares(&key.api_url, shares).await;
            }
            EntityData::Blocks(blocks) => {
                self.cache.put_blocks(&key.api_url, blocks).await;
            }
            _ => {}
        }
    }
}

/// Append `more` to `have` skipping known natural keys, newest first.
fn merge_records<T: ScopedRecord + Clone>(have: &mut Vec<T>, more: Vec<T>) -> Vec<T> {
    for record in more {
        if !have.iter().any(|h| h.natural_key() == record.natural_key()) {
            have.push(record);
        }
    }
    let len = have.len();
    newest_first(std::mem::take(have), len)
}

/// Resolve the startup target: explicit configuration wins, then stored
/// preferences, then the public default observer.
pub async fn restore_target(
    cache: &LocalCache,
    api_url: Option<String>,
    address: Option<String>,
) -> Target {
    let api_url = match api_url {
        Some(u) => u,
        None => cache
            .preference(PREF_API_URL_KEY)
            .await
            .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
    };
    let address = match address {
        Some(a) => Some(a),
        None => cache.preference(PREF_ADDRESS_KEY).await,
    };
    Target::new(api_url, address)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
