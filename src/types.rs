use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// `/api/pool_info` response. Only the fields the observer uses are modeled;
/// unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    #[serde(default)]
    pub sidechain: SideChainStats,
    #[serde(default)]
    pub mainchain: MainChainStats,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SideChainStats {
    pub id: String,
    pub height: u64,
    pub difficulty: u64,
    pub timestamp: u64,
    /// Target seconds between sidechain shares.
    pub block_time: u64,
    pub window_size: u64,
    pub max_window_size: u64,
    pub effort: EffortStats,
    pub window: WindowStats,
    /// Total distinct miners ever seen on the sidechain.
    pub miners: u64,
    /// Number of mainchain blocks found by the pool.
    pub found: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffortStats {
    pub current: f64,
    pub average10: f64,
    pub average50: f64,
    pub average200: f64,
}

/// PPLNS window summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowStats {
    pub miners: u64,
    pub blocks: u64,
    pub uncles: u64,
    /// Sum of difficulties of all shares and uncles in the window.
    pub weight: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MainChainStats {
    pub id: String,
    pub height: u64,
    pub difficulty: u64,
    pub reward: u64,
    pub block_time: u64,
}

// ---------------------------------------------------------------------------
// Miner
// ---------------------------------------------------------------------------

/// `/api/miner_info/{address}` response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MinerSnapshot {
    pub id: u64,
    pub address: String,
    /// Share counters split by inclusion kind (in-window, orphan, ...).
    pub shares: Vec<ShareCounter>,
    pub last_share_height: u64,
    pub last_share_timestamp: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShareCounter {
    pub shares: u64,
    pub uncles: u64,
    pub last_height: u64,
}

impl MinerSnapshot {
    pub fn total_shares(&self) -> u64 {
        self.shares.iter().map(|c| c.shares).sum()
    }

    pub fn total_uncles(&self) -> u64 {
        self.shares.iter().map(|c| c.uncles).sum()
    }
}

// ---------------------------------------------------------------------------
// Shares and blocks
// ---------------------------------------------------------------------------

/// One sidechain share as returned by `/api/shares` and `/api/side_blocks_in_window`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShareRecord {
    pub side_height: u64,
    pub template_id: String,
    pub main_height: u64,
    pub difficulty: u64,
    pub timestamp: u64,
    pub miner_address: String,
    pub uncles: Vec<UncleRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UncleRecord {
    pub template_id: String,
    pub side_height: u64,
    pub difficulty: u64,
    pub miner_address: String,
}

impl ShareRecord {
    /// Difficulty this share contributes to the PPLNS window for `address`,
    /// counting the share itself and any uncles mined by the same address.
    pub fn window_weight_for(&self, address: &str) -> u64 {
        let own = if self.miner_address == address { self.difficulty } else { 0 };
        let uncles: u64 = self
            .uncles
            .iter()
            .filter(|u| u.miner_address == address)
            .map(|u| u.difficulty)
            .sum();
        own + uncles
    }
}

/// `/api/found_blocks` entry: a mainchain block attributed to the pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FoundBlockRecord {
    pub main_block: MainBlock,
    pub side_height: u64,
    pub miner_address: String,
    pub effort: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MainBlock {
    pub id: String,
    pub height: u64,
    pub timestamp: u64,
    pub reward: u64,
}

// ---------------------------------------------------------------------------
// Payouts
// ---------------------------------------------------------------------------

/// `/api/payouts/{address}` entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PayoutRecord {
    pub main_id: String,
    pub main_height: u64,
    pub side_height: u64,
    pub template_id: String,
    pub timestamp: u64,
    pub coinbase_reward: u64,
    pub including_height: u64,
}

// ---------------------------------------------------------------------------
// Price
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub usd: f64,
    #[serde(default)]
    pub last_updated_at: u64,
}

/// `/simple/price?ids=monero&...` response shape.
#[derive(Debug, Deserialize)]
pub struct PriceResponse {
    pub monero: PriceSnapshot,
}

// ---------------------------------------------------------------------------
// Tracked target
// ---------------------------------------------------------------------------

/// The (API URL, miner address) combination the observer tracks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Target {
    pub api_url: String,
    pub address: Option<String>,
}

impl Target {
    pub fn new(api_url: impl Into<String>, address: Option<String>) -> Self {
        Self {
            api_url: crate::config::normalize_base_url(&api_url.into()),
            address: address.filter(|a| !a.trim().is_empty()),
        }
    }
}

/// Atomic units per XMR.
pub const PICONERO_PER_XMR: f64 = 1e12;

pub fn piconero_to_xmr(amount: u64) -> f64 {
    amount as f64 / PICONERO_PER_XMR
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn share_record_tolerates_extra_and_missing_fields() {
        let raw = serde_json::json!({
            "side_height": 9_000_123,
            "template_id": "abcd",
            "difficulty": 150_000,
            "timestamp": 1_700_000_000,
            "miner_address": "4Addr",
            "software_id": 0,
            "inclusion": 1
        });
        let share: ShareRecord = serde_json::from_value(raw).unwrap();
        assert_eq!(share.side_height, 9_000_123);
        assert!(share.uncles.is_empty());
        assert_eq!(share.main_height, 0);
    }

    #[test]
    fn window_weight_counts_own_uncles_only() {
        let share = ShareRecord {
            difficulty: 100,
            miner_address: "a".into(),
            uncles: vec![
                UncleRecord { difficulty: 10, miner_address: "a".into(), ..Default::default() },
                UncleRecord { difficulty: 20, miner_address: "b".into(), ..Default::default() },
            ],
            ..Default::default()
        };
        assert_eq!(share.window_weight_for("a"), 110);
        assert_eq!(share.window_weight_for("b"), 20);
    }

    #[test]
    fn miner_totals_sum_counters() {
        let miner: MinerSnapshot = serde_json::from_value(serde_json::json!({
            "address": "4abc",
            "shares": [
                {"shares": 10, "uncles": 1},
                {"shares": 3, "uncles": 2, "last_height": 99}
            ]
        }))
        .unwrap();
        assert_eq!(miner.total_shares(), 13);
        assert_eq!(miner.total_uncles(), 3);
    }

    #[test]
    fn target_drops_blank_address() {
        let t = Target::new("https://x/", Some("  ".into()));
        assert_eq!(t.api_url, "https://x");
        assert!(t.address.is_none());
    }
}
