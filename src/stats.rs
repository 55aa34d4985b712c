//! Derived pool and miner statistics. Pure functions over fetched snapshots.

use serde::Serialize;

use crate::types::{piconero_to_xmr, PayoutRecord, PoolSnapshot, PriceSnapshot, ShareRecord};

/// Sidechain hashrate in H/s: difficulty over target block time.
pub fn pool_hashrate(pool: &PoolSnapshot) -> f64 {
    per_second(pool.sidechain.difficulty, pool.sidechain.block_time)
}

/// Monero network hashrate in H/s.
pub fn network_hashrate(pool: &PoolSnapshot) -> f64 {
    per_second(pool.mainchain.difficulty, pool.mainchain.block_time)
}

fn per_second(difficulty: u64, block_time: u64) -> f64 {
    if block_time == 0 {
        0.0
    } else {
        difficulty as f64 / block_time as f64
    }
}

/// Total PPLNS weight `address` holds across `window`, own shares plus its uncles.
pub fn miner_window_weight(window: &[ShareRecord], address: &str) -> u64 {
    window.iter().map(|s| s.window_weight_for(address)).sum()
}

/// Fraction (0..=1) of the pool's window weight held by `address`.
///
/// `None` when window data is missing: no window shares were fetched, or the
/// pool reports zero window weight. Lifetime share counts are never used here.
pub fn window_share(window: Option<&[ShareRecord]>, address: &str, pool: &PoolSnapshot) -> Option<f64> {
    let window = window?;
    let pool_weight = pool.sidechain.window.weight;
    if pool_weight == 0 {
        return None;
    }
    let fraction = miner_window_weight(window, address) as f64 / pool_weight as f64;
    Some(fraction.min(1.0))
}

/// Estimated miner hashrate from its window share of the pool hashrate.
pub fn estimated_miner_hashrate(share: f64, pool: &PoolSnapshot) -> f64 {
    share * pool_hashrate(pool)
}

/// Expected seconds between sidechain shares at `hashrate`.
pub fn expected_share_interval_secs(hashrate: f64, pool: &PoolSnapshot) -> Option<f64> {
    (hashrate > 0.0).then(|| pool.sidechain.difficulty as f64 / hashrate)
}

/// Expected payout per found block given the window share, in XMR.
pub fn expected_reward_xmr(share: f64, pool: &PoolSnapshot) -> f64 {
    share * piconero_to_xmr(pool.mainchain.reward)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PayoutSummary {
    pub count: usize,
    pub total_xmr: f64,
    pub total_usd: Option<f64>,
    pub last_timestamp: Option<u64>,
}

pub fn payout_summary(payouts: &[PayoutRecord], price: Option<PriceSnapshot>) -> PayoutSummary {
    let total: u64 = payouts.iter().map(|p| p.coinbase_reward).sum();
    let total_xmr = piconero_to_xmr(total);
    PayoutSummary {
        count: payouts.len(),
        total_xmr,
        total_usd: price.map(|p| p.usd * total_xmr),
        last_timestamp: payouts.iter().map(|p| p.timestamp).max(),
    }
}

/// Human readable hashrate, e.g. `12.34 MH/s`.
pub fn format_hashrate(hs: f64) -> String {
    const UNITS: [&str; 5] = ["H/s", "kH/s", "MH/s", "GH/s", "TH/s"];
    let mut value = hs.max(0.0);
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UncleRecord;

    fn pool() -> PoolSnapshot {
        let mut p = PoolSnapshot::default();
        p.sidechain.difficulty = 1_000_000;
        p.sidechain.block_time = 10;
        p.sidechain.window.weight = 10_000;
        p.mainchain.difficulty = 360_000_000_000;
        p.mainchain.block_time = 120;
        p.mainchain.reward = 600_000_000_000;
        p
    }

    fn share(miner: &str, difficulty: u64, uncles: Vec<UncleRecord>) -> ShareRecord {
        ShareRecord {
            miner_address: miner.into(),
            difficulty,
            uncles,
            ..ShareRecord::default()
        }
    }

    #[test]
    fn hashrates_divide_difficulty_by_block_time() {
        assert_eq!(pool_hashrate(&pool()), 100_000.0);
        assert_eq!(network_hashrate(&pool()), 3_000_000_000.0);
        assert_eq!(pool_hashrate(&PoolSnapshot::default()), 0.0);
    }

    #[test]
    fn window_share_counts_own_uncles_only() {
        let uncle = |miner: &str| UncleRecord { miner_address: miner.into(), difficulty: 500, ..UncleRecord::default() };
        let window = vec![
            share("a", 1_000, vec![uncle("a"), uncle("b")]),
            share("b", 1_000, vec![]),
            share("a", 1_000, vec![]),
        ];

        assert_eq!(miner_window_weight(&window, "a"), 2_500);
        assert_eq!(window_share(Some(&window), "a", &pool()), Some(0.25));
        assert_eq!(window_share(Some(&window), "c", &pool()), Some(0.0));
    }

    #[test]
    fn window_share_absent_without_window_data() {
        assert_eq!(window_share(None, "a", &pool()), None);
        assert_eq!(window_share(Some(&[]), "a", &PoolSnapshot::default()), None);
    }

    #[test]
    fn miner_estimates_scale_with_share() {
        let p = pool();
        let hr = estimated_miner_hashrate(0.1, &p);
        assert_eq!(hr, 10_000.0);
        assert_eq!(expected_share_interval_secs(hr, &p), Some(100.0));
        assert_eq!(expected_share_interval_secs(0.0, &p), None);
        assert!((expected_reward_xmr(0.1, &p) - 0.06).abs() < 1e-12);
    }

    #[test]
    fn payout_summary_totals_and_prices() {
        let payouts = vec![
            PayoutRecord { coinbase_reward: 500_000_000_000, timestamp: 10, ..PayoutRecord::default() },
            PayoutRecord { coinbase_reward: 1_500_000_000_000, timestamp: 30, ..PayoutRecord::default() },
        ];
        let price = PriceSnapshot { usd: 150.0, last_updated_at: 0 };

        let summary = payout_summary(&payouts, Some(price));
        assert_eq!(summary.count, 2);
        assert_eq!(summary.total_xmr, 2.0);
        assert_eq!(summary.total_usd, Some(300.0));
        assert_eq!(summary.last_timestamp, Some(30));
        assert_eq!(payout_summary(&[], None), PayoutSummary::default());
    }

    #[test]
    fn hashrate_formatting() {
        assert_eq!(format_hashrate(950.0), "950.00 H/s");
        assert_eq!(format_hashrate(12_340_000.0), "12.34 MH/s");
    }
}
