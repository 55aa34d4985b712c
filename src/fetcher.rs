use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::config::PRICE_STALE_SECS;
use crate::fetch::{FetchClient, FetchError};
use crate::types::{
    FoundBlockRecord, MinerSnapshot, PayoutRecord, PoolSnapshot, PriceResponse, PriceSnapshot,
    ShareRecord,
};

/// Typed access to the observer and price endpoints. Every call goes through the
/// retrying `FetchClient`; miner-scoped 404s are mapped to "no data".
#[derive(Clone)]
pub struct PoolApi {
    client: Arc<FetchClient>,
    price_api_url: String,
}

impl PoolApi {
    pub fn new(client: Arc<FetchClient>, price_api_url: impl Into<String>) -> Self {
        Self {
            client,
            price_api_url: price_api_url.into(),
        }
    }

    /// `GET {base}/api/pool_info`
    pub async fn pool_info(&self, base: &str) -> Result<PoolSnapshot, FetchError> {
        self.client.get_json(base, "/api/pool_info", &[]).await
    }

    /// `GET {base}/api/miner_info/{address}`. `None` when the observer has never seen the miner.
    pub async fn miner_info(&self, base: &str, address: &str) -> Result<Option<MinerSnapshot>, FetchError> {
        let endpoint = format!("/api/miner_info/{address}");
        not_found_as(self.client.get_json(base, &endpoint, &[]).await.map(Some), None)
    }

    /// `GET {base}/api/shares?limit=&miner=`
    pub async fn shares(
        &self,
        base: &str,
        limit: usize,
        miner: Option<&str>,
    ) -> Result<Vec<ShareRecord>, FetchError> {
        let params = limit_and_miner(limit, miner);
        let res = self.client.get_json(base, "/api/shares", &params).await;
        if miner.is_some() {
            not_found_as(res, Vec::new())
        } else {
            res
        }
    }

    /// `GET {base}/api/found_blocks?limit=&miner=`
    pub async fn found_blocks(
        &self,
        base: &str,
        limit: usize,
        miner: Option<&str>,
    ) -> Result<Vec<FoundBlockRecord>, FetchError> {
        let params = limit_and_miner(limit, miner);
        let res = self.client.get_json(base, "/api/found_blocks", &params).await;
        if miner.is_some() {
            not_found_as(res, Vec::new())
        } else {
            res
        }
    }

    /// `GET {base}/api/side_blocks_in_window[/{miner}]?window=&from=`
    pub async fn side_blocks_in_window(
        &self,
        base: &str,
        miner: Option<&str>,
        window: Option<u64>,
        from: Option<u64>,
    ) -> Result<Vec<ShareRecord>, FetchError> {
        let endpoint = match miner {
            Some(m) => format!("/api/side_blocks_in_window/{m}"),
            None => "/api/side_blocks_in_window".to_string(),
        };
        let mut params = Vec::new();
        if let Some(w) = window {
            params.push(("window", w.to_string()));
        }
        if let Some(f) = from {
            params.push(("from", f.to_string()));
        }
        let res = self.client.get_json(base, &endpoint, &params).await;
        if miner.is_some() {
            not_found_as(res, Vec::new())
        } else {
            res
        }
    }

    /// `GET {base}/api/payouts/{address}?search_limit=`
    pub async fn payouts(
        &self,
        base: &str,
        address: &str,
        search_limit: usize,
    ) -> Result<Vec<PayoutRecord>, FetchError> {
        let endpoint = format!("/api/payouts/{address}");
        let params = [("search_limit", search_limit.to_string())];
        not_found_as(self.client.get_json(base, &endpoint, &params).await, Vec::new())
    }

    /// Monero/USD from the price API. A stale quote is logged, not rejected.
    pub async fn price(&self) -> Result<PriceSnapshot, FetchError> {
        let params = [
            ("ids", "monero".to_string()),
            ("vs_currencies", "usd".to_string()),
            ("include_last_updated_at", "true".to_string()),
        ];
        let resp: PriceResponse = self
            .client
            .get_json(&self.price_api_url, "/simple/price", &params)
            .await?;
        let price = resp.monero;

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let age = now.saturating_sub(price.last_updated_at);
        if price.last_updated_at > 0 && age > PRICE_STALE_SECS {
            warn!(age_secs = age, "XMR price is stale: last updated {age}s ago");
        } else {
            debug!(usd = price.usd, "XMR price updated");
        }
        Ok(price)
    }
}

fn limit_and_miner(limit: usize, miner: Option<&str>) -> Vec<(&'static str, String)> {
    let mut params = vec![("limit", limit.to_string())];
    if let Some(m) = miner {
        params.push(("miner", m.to_string()));
    }
    params
}

/// A 404 on a miner-scoped endpoint means "nothing recorded", not a failure.
fn not_found_as<T>(res: Result<T, FetchError>, empty: T) -> Result<T, FetchError> {
    match res {
        Err(e) if e.is_not_found() => Ok(empty),
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::fetch::retry::RetryPolicy;
    use crate::fetch::{HttpTransport, TransportError};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Routes by path (query ignored unless a full-URL route matches first).
    #[derive(Default)]
    pub(crate) struct RoutedTransport {
        routes: Mutex<HashMap<String, Result<serde_json::Value, TransportError>>>,
        pub urls: Mutex<Vec<String>>,
    }

    impl RoutedTransport {
        pub(crate) fn route(&self, path: &str, resp: Result<serde_json::Value, TransportError>) {
            self.routes.lock().unwrap().insert(path.to_string(), resp);
        }

        pub(crate) fn requests_to(&self, path: &str) -> usize {
            self.urls.lock().unwrap().iter().filter(|u| u.contains(path)).count()
        }
    }

    #[async_trait]
    impl HttpTransport for RoutedTransport {
        async fn get_json(&self, url: &str) -> Result<serde_json::Value, TransportError> {
            self.urls.lock().unwrap().push(url.to_string());
            let parsed = reqwest::Url::parse(url).unwrap();
            let routes = self.routes.lock().unwrap();
            routes
                .get(url)
                .or_else(|| routes.get(parsed.path()))
                .cloned()
                .unwrap_or(Err(TransportError::Status { status: 404, body: String::new() }))
        }
    }

    pub(crate) fn api_with(transport: Arc<RoutedTransport>) -> PoolApi {
        let client = FetchClient::new(transport).with_policy(RetryPolicy::no_retry());
        PoolApi::new(Arc::new(client), "http://price")
    }

    #[tokio::test]
    async fn unknown_miner_is_none() {
        let transport = Arc::new(RoutedTransport::default());
        let api = api_with(transport.clone());
        assert_eq!(api.miner_info("http://pool", "4abc").await.unwrap(), None);
    }

    #[tokio::test]
    async fn miner_scoped_404s_are_empty_lists() {
        let transport = Arc::new(RoutedTransport::default());
        let api = api_with(transport.clone());
        assert!(api.payouts("http://pool", "4abc", 10).await.unwrap().is_empty());
        assert!(api.shares("http://pool", 10, Some("4abc")).await.unwrap().is_empty());
        assert!(api
            .side_blocks_in_window("http://pool", Some("4abc"), Some(2160), None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn pool_wide_404_is_an_error() {
        let transport = Arc::new(RoutedTransport::default());
        let api = api_with(transport.clone());
        assert!(api.shares("http://pool", 10, None).await.is_err());
        assert!(api.pool_info("http://pool").await.is_err());
    }

    #[tokio::test]
    async fn shares_query_carries_limit_and_miner() {
        let transport = Arc::new(RoutedTransport::default());
        transport.route("/api/shares", Ok(serde_json::json!([])));
        let api = api_with(transport.clone());

        api.shares("http://pool", 25, Some("4abc")).await.unwrap();
        let urls = transport.urls.lock().unwrap();
        assert_eq!(urls[0], "http://pool/api/shares?limit=25&miner=4abc");
    }

    #[tokio::test]
    async fn price_is_parsed_from_nested_object() {
        let transport = Arc::new(RoutedTransport::default());
        transport.route(
            "/simple/price",
            Ok(serde_json::json!({"monero": {"usd": 162.5, "last_updated_at": 1}})),
        );
        let api = api_with(transport.clone());

        let price = api.price().await.unwrap();
        assert_eq!(price.usd, 162.5);
        assert!(transport.urls.lock().unwrap()[0].contains("include_last_updated_at=true"));
    }
}
