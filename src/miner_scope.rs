//! Miner-scoped share/block listing.
//!
//! The observer API filters `/api/shares` and `/api/found_blocks` by `miner`,
//! but cannot combine that filter with a "from height" cursor. Going further
//! back for one miner therefore means scanning unfiltered bulk pages and
//! filtering client-side. That historical path is a workaround for the upstream
//! gap and costs O(attempts x batch size); the direct path is the normal route.

use std::collections::HashSet;
use std::future::Future;

use tracing::{debug, warn};

use crate::config::reconstruction::{
    BATCH_GROWTH_FACTOR, INITIAL_BATCH_SIZE, MAX_ATTEMPTS, MAX_BATCH_SIZE,
};
use crate::fetch::FetchError;
use crate::fetcher::PoolApi;
use crate::types::{FoundBlockRecord, ShareRecord};

/// A record that can be attributed to a miner and ordered by height.
pub trait ScopedRecord {
    fn height(&self) -> u64;
    fn miner_address(&self) -> &str;
    /// Natural identity used to drop duplicates across pages.
    fn natural_key(&self) -> &str;
}

impl ScopedRecord for ShareRecord {
    fn height(&self) -> u64 {
        self.side_height
    }

    fn miner_address(&self) -> &str {
        &self.miner_address
    }

    fn natural_key(&self) -> &str {
        &self.template_id
    }
}

impl ScopedRecord for FoundBlockRecord {
    fn height(&self) -> u64 {
        self.main_block.height
    }

    fn miner_address(&self) -> &str {
        &self.miner_address
    }

    fn natural_key(&self) -> &str {
        &self.main_block.id
    }
}

/// Scan bounds for the historical path.
#[derive(Debug, Clone, Copy)]
pub struct ScanLimits {
    pub initial_batch: usize,
    pub growth_factor: usize,
    pub max_batch: usize,
    pub max_attempts: usize,
}

impl Default for ScanLimits {
    fn default() -> Self {
        Self {
            initial_batch: INITIAL_BATCH_SIZE,
            growth_factor: BATCH_GROWTH_FACTOR,
            max_batch: MAX_BATCH_SIZE,
            max_attempts: MAX_ATTEMPTS,
        }
    }
}

impl ScanLimits {
    /// Batch size for 0-indexed `attempt`: `initial * growth^attempt`, capped.
    pub fn batch_size(&self, attempt: usize) -> usize {
        let mut size = self.initial_batch.max(1);
        for _ in 0..attempt {
            size = size.saturating_mul(self.growth_factor.max(1));
            if size >= self.max_batch {
                break;
            }
        }
        size.min(self.max_batch)
    }
}

/// Why a historical scan stopped. Logged and returned for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStop {
    LimitReached,
    MaxAttempts,
    EmptyPage,
    NoProgress,
}

#[derive(Debug, Clone)]
pub struct ScanResult<T> {
    pub records: Vec<T>,
    pub attempts: usize,
    pub stop: ScanStop,
}

/// Sort descending by height and keep the first `limit`.
pub fn newest_first<T: ScopedRecord>(mut records: Vec<T>, limit: usize) -> Vec<T> {
    records.sort_by(|a, b| b.height().cmp(&a.height()));
    records.truncate(limit);
    records
}

/// Historical scan over unfiltered pages produced by `fetch_page(batch_size)`.
///
/// Accepts records of `miner` strictly below `from_height`, dedupes by natural key,
/// and moves the cursor down to the lowest height of each unfiltered page, so a
/// page without matches still makes progress. Once moved, the cursor height itself
/// is accepted: a page limit can split records sharing that height. A failed page
/// is logged and counts as an attempt that yielded nothing.
pub async fn scan_history<T, F, Fut>(
    miner: &str,
    limit: usize,
    from_height: u64,
    limits: ScanLimits,
    mut fetch_page: F,
) -> ScanResult<T>
where
    T: ScopedRecord,
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<Vec<T>, FetchError>>,
{
    let mut accepted: Vec<T> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut cursor = from_height;
    let mut cursor_inclusive = false;
    let mut previous_min: Option<u64> = None;
    let mut attempts = 0usize;
    let mut stop = ScanStop::MaxAttempts;

    while attempts < limits.max_attempts {
        if accepted.len() >= limit {
            stop = ScanStop::LimitReached;
            break;
        }

        let batch = limits.batch_size(attempts);
        attempts += 1;

        let page = match fetch_page(batch).await {
            Ok(p) => p,
            Err(e) => {
                warn!(miner, attempt = attempts, batch, "History page fetch failed, skipping: {e}");
                continue;
            }
        };

        let Some(page_min) = page.iter().map(|r| r.height()).min() else {
            stop = ScanStop::EmptyPage;
            break;
        };

        let before = accepted.len();
        for record in page {
            let height = record.height();
            let in_range = height < cursor || (cursor_inclusive && height == cursor);
            if record.miner_address() != miner || !in_range {
                continue;
            }
            if seen.insert(record.natural_key().to_string()) {
                accepted.push(record);
            }
        }
        debug!(
            miner,
            attempt = attempts,
            batch,
            page_min,
            cursor,
            matched = accepted.len() - before,
            "History page scanned"
        );

        if previous_min.is_some_and(|prev| page_min >= prev) {
            stop = ScanStop::NoProgress;
            break;
        }
        previous_min = Some(page_min);
        if page_min < cursor {
            cursor = page_min;
            cursor_inclusive = true;
        }
    }

    if accepted.len() >= limit {
        stop = ScanStop::LimitReached;
    }

    ScanResult {
        records: newest_first(accepted, limit),
        attempts,
        stop,
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// The `limit` most recent shares of `miner`, older than `from_height` if given.
pub async fn miner_shares(
    api: &PoolApi,
    base: &str,
    miner: &str,
    limit: usize,
    from_height: Option<u64>,
) -> Result<Vec<ShareRecord>, FetchError> {
    match from_height {
        None => {
            let shares = api.shares(base, limit, Some(miner)).await?;
            Ok(newest_first(shares, limit))
        }
        Some(from) => {
            let result = scan_history(miner, limit, from, ScanLimits::default(), |batch| {
                api.shares(base, batch, None)
            })
            .await;
            debug!(miner, found = result.records.len(), stop = ?result.stop, "Share history scan done");
            Ok(result.records)
        }
    }
}

/// The `limit` most recent found blocks of `miner`, older than `from_height` if given.
pub async fn miner_blocks(
    api: &PoolApi,
    base: &str,
    miner: &str,
    limit: usize,
    from_height: Option<u64>,
) -> Result<Vec<FoundBlockRecord>, FetchError> {
    match from_height {
        None => {
            let blocks = api.found_blocks(base, limit, Some(miner)).await?;
            Ok(newest_first(blocks, limit))
        }
        Some(from) => {
            let result = scan_history(miner, limit, from, ScanLimits::default(), |batch| {
                api.found_blocks(base, batch, None)
            })
            .await;
            debug!(miner, found = result.records.len(), stop = ?result.stop, "Block history scan done");
            Ok(result.records)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::retry::RetryPolicy;
    use crate::fetch::{FetchClient, HttpTransport, TransportError};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    const TIP: u64 = 10_000;

    /// Serves `/api/shares` from a synthetic chain: heights TIP, TIP-1, ...
    /// `miner_of(height)` decides the owner. Honors `limit` and `miner`.
    struct ChainTransport {
        miner_of: fn(u64) -> &'static str,
        depth: u64,
        fail_calls: Vec<usize>,
        calls: Mutex<Vec<String>>,
    }

    impl ChainTransport {
        fn new(miner_of: fn(u64) -> &'static str, depth: u64) -> Arc<Self> {
            Arc::new(Self { miner_of, depth, fail_calls: Vec::new(), calls: Mutex::new(Vec::new()) })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl HttpTransport for ChainTransport {
        async fn get_json(&self, url: &str) -> Result<serde_json::Value, TransportError> {
            let call_index = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(url.to_string());
                calls.len()
            };
            if self.fail_calls.contains(&call_index) {
                return Err(TransportError::Network("connection reset".into()));
            }

            let parsed = reqwest::Url::parse(url).unwrap();
            let mut limit = 0u64;
            let mut miner: Option<String> = None;
            for (k, v) in parsed.query_pairs() {
                match k.as_ref() {
                    "limit" => limit = v.parse().unwrap(),
                    "miner" => miner = Some(v.into_owned()),
                    _ => {}
                }
            }

            let mut out = Vec::new();
            // Ascending order on purpose: callers must sort.
            for height in (TIP.saturating_sub(self.depth) + 1..=TIP).rev() {
                let owner = (self.miner_of)(height);
                if miner.as_deref().is_some_and(|m| m != owner) {
                    continue;
                }
                out.push(serde_json::json!({
                    "side_height": height,
                    "template_id": format!("t{height}"),
                    "difficulty": 1000,
                    "miner_address": owner,
                }));
                if out.len() as u64 >= limit {
                    break;
                }
            }
            out.reverse();
            Ok(serde_json::Value::Array(out))
        }
    }

    fn api(transport: Arc<ChainTransport>) -> PoolApi {
        let client = FetchClient::new(transport).with_policy(RetryPolicy::no_retry());
        PoolApi::new(Arc::new(client), "http://price")
    }

    fn every_tenth(height: u64) -> &'static str {
        if height % 10 == 0 { "alice" } else { "bob" }
    }

    #[tokio::test]
    async fn direct_path_returns_miner_shares_newest_first() {
        // alice owns 5 of the top 50 heights: 10000, 9990, ..., 9960.
        let transport = ChainTransport::new(every_tenth, 50);
        let api = api(transport.clone());

        let shares = miner_shares(&api, "http://pool", "alice", 5, None).await.unwrap();

        let heights: Vec<u64> = shares.iter().map(|s| s.side_height).collect();
        assert_eq!(heights, vec![10_000, 9_990, 9_980, 9_970, 9_960]);
        assert_eq!(transport.call_count(), 1);
        assert!(transport.calls.lock().unwrap()[0].contains("miner=alice"));
    }

    #[tokio::test]
    async fn history_path_filters_below_cursor_and_dedupes() {
        let transport = ChainTransport::new(every_tenth, 5_000);
        let api = api(transport.clone());

        let shares = miner_shares(&api, "http://pool", "alice", 10, Some(9_950)).await.unwrap();

        let heights: Vec<u64> = shares.iter().map(|s| s.side_height).collect();
        assert_eq!(heights, (0..10).map(|i| 9_940 - i * 10).collect::<Vec<_>>());
        // First page of 200 already holds 14 matches below the cursor.
        assert_eq!(transport.call_count(), 1);
        assert!(!transport.calls.lock().unwrap()[0].contains("miner="));
    }

    fn deep_alice(height: u64) -> &'static str {
        if height <= TIP - 300 && height % 7 == 0 { "alice" } else { "bob" }
    }

    #[tokio::test]
    async fn zero_match_page_still_advances_cursor() {
        // alice has nothing in the first 200-share page; the scan must keep going.
        let limits = ScanLimits::default();
        let transport = ChainTransport::new(deep_alice, 5_000);
        let api = api(transport.clone());
        let seen_batches = Mutex::new(Vec::new());

        let result = scan_history("alice", 5, 9_950, limits, |batch| {
            seen_batches.lock().unwrap().push(batch);
            api.shares("http://pool", batch, None)
        })
        .await;

        assert_eq!(*seen_batches.lock().unwrap(), vec![200, 400]);
        assert_eq!(result.stop, ScanStop::LimitReached);
        assert_eq!(result.records.len(), 5);
        assert!(result.records.iter().all(|s| s.side_height <= TIP - 300));
        assert!(result.records.windows(2).all(|w| w[0].side_height > w[1].side_height));
    }

    fn nobody(_height: u64) -> &'static str {
        "bob"
    }

    #[tokio::test]
    async fn exhausted_chain_stops_without_progress() {
        // Only 300 shares exist: page 2 (400) bottoms out at the same height as page 3.
        let transport = ChainTransport::new(nobody, 300);
        let api = api(transport.clone());

        let result = scan_history("alice", 5, TIP, ScanLimits::default(), |batch| {
            api.shares("http://pool", batch, None)
        })
        .await;

        assert!(result.records.is_empty());
        assert_eq!(result.stop, ScanStop::NoProgress);
        assert_eq!(result.attempts, 3);
    }

    #[tokio::test]
    async fn sparse_miner_is_bounded_by_max_attempts() {
        let transport = ChainTransport::new(nobody, 1_000_000);
        let api = api(transport.clone());

        let result = scan_history("alice", 5, TIP, ScanLimits::default(), |batch| {
            api.shares("http://pool", batch, None)
        })
        .await;

        assert_eq!(result.stop, ScanStop::MaxAttempts);
        assert_eq!(result.attempts, MAX_ATTEMPTS);
        assert_eq!(transport.call_count(), MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn empty_page_ends_scan() {
        let transport = ChainTransport::new(nobody, 0);
        let api = api(transport.clone());

        let result = scan_history("alice", 5, TIP, ScanLimits::default(), |batch| {
            api.shares("http://pool", batch, None)
        })
        .await;

        assert_eq!(result.stop, ScanStop::EmptyPage);
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn failed_page_is_skipped_not_fatal() {
        let transport = Arc::new(ChainTransport {
            miner_of: deep_alice,
            depth: 5_000,
            fail_calls: vec![1],
            calls: Mutex::new(Vec::new()),
        });
        let api = api(transport.clone());

        let result = scan_history("alice", 3, 9_950, ScanLimits::default(), |batch| {
            api.shares("http://pool", batch, None)
        })
        .await;

        assert_eq!(result.records.len(), 3);
        assert!(result.attempts >= 2);
    }

    fn share_at(height: u64, template: &str) -> ShareRecord {
        ShareRecord {
            side_height: height,
            template_id: template.into(),
            miner_address: "alice".into(),
            ..ShareRecord::default()
        }
    }

    #[tokio::test]
    async fn same_height_records_split_across_pages_are_kept() {
        // The first page is cut between two shares at height 95.
        let pages = Mutex::new(VecDeque::from(vec![
            vec![share_at(100, "a100"), share_at(95, "a95")],
            vec![share_at(100, "a100"), share_at(95, "a95"), share_at(95, "b95"), share_at(90, "a90")],
            vec![],
        ]));

        let result = scan_history("alice", 10, 100, ScanLimits::default(), |_batch| {
            let page = pages.lock().unwrap().pop_front().unwrap_or_default();
            async move { Ok::<_, FetchError>(page) }
        })
        .await;

        let templates: Vec<&str> = result.records.iter().map(|s| s.template_id.as_str()).collect();
        assert_eq!(templates, vec!["a95", "b95", "a90"]);
        assert_eq!(result.stop, ScanStop::EmptyPage);
    }

    #[test]
    fn batch_sizes_grow_and_cap() {
        let limits = ScanLimits::default();
        let sizes: Vec<usize> = (0..6).map(|a| limits.batch_size(a)).collect();
        assert_eq!(sizes, vec![200, 400, 800, 1_600, 2_000, 2_000]);
    }
}
