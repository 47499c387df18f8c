//! Gas pricing and unit arithmetic. The engine's `fee` is the priority tip
//! per gas in wei; on legacy networks it is added on top of `eth_gasPrice`.

use core_logic::{PercentileTable, PriorityLevel};
use ethers::types::U256;

/// Reward percentiles requested from `eth_feeHistory`, one per fee tier.
pub const FEE_PERCENTILES: [f64; 6] = [0.0, 25.0, 50.0, 75.0, 95.0, 100.0];

/// Tip over `gasPrice`, in percent of it, per tier on legacy networks.
const LEGACY_MARKUP_PCT: [(PriorityLevel, u64); 6] = [
    (PriorityLevel::Min, 0),
    (PriorityLevel::Low, 5),
    (PriorityLevel::Medium, 10),
    (PriorityLevel::High, 25),
    (PriorityLevel::VeryHigh, 50),
    (PriorityLevel::UnsafeMax, 100),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GasQuote {
    Eip1559 { max_fee: U256, priority: U256 },
    Legacy { gas_price: U256 },
}

impl GasQuote {
    pub fn eip1559(base_fee: U256, tip: u64, base_fee_multiplier: f64) -> Self {
        GasQuote::Eip1559 {
            max_fee: scale(base_fee, base_fee_multiplier) + U256::from(tip),
            priority: U256::from(tip),
        }
    }

    pub fn legacy(gas_price: U256, tip: u64) -> Self {
        GasQuote::Legacy {
            gas_price: gas_price + U256::from(tip),
        }
    }

    /// Highest price per gas the transaction can be charged.
    pub fn max_price(&self) -> U256 {
        match self {
            GasQuote::Eip1559 { max_fee, .. } => *max_fee,
            GasQuote::Legacy { gas_price } => *gas_price,
        }
    }

    pub fn max_cost(&self, gas: u64) -> U256 {
        self.max_price() * U256::from(gas)
    }
}

/// `value * factor`, in thousandths to stay in integer math.
pub fn scale(value: U256, factor: f64) -> U256 {
    let per_mille = (factor.max(0.0) * 1000.0).round() as u64;
    value * U256::from(per_mille) / U256::from(1000u64)
}

pub fn saturating_u64(value: U256) -> u64 {
    if value > U256::from(u64::MAX) {
        u64::MAX
    } else {
        value.as_u64()
    }
}

/// Minimum output accepted for a quoted swap.
pub fn apply_slippage(quoted: U256, slippage_bps: u16) -> U256 {
    let keep = 10_000u64.saturating_sub(slippage_bps as u64);
    quoted * U256::from(keep) / U256::from(10_000u64)
}

pub fn confirmations_reached(head: u64, mined_in: u64, required: u64) -> bool {
    head.saturating_sub(mined_in) + 1 >= required.max(1)
}

/// Median tip per requested percentile across the sampled blocks.
pub fn reward_table(rewards: &[Vec<U256>]) -> PercentileTable {
    let mut points = Vec::with_capacity(FEE_PERCENTILES.len());
    for (column, percentile) in FEE_PERCENTILES.iter().enumerate() {
        let mut samples: Vec<U256> = rewards
            .iter()
            .filter_map(|block| block.get(column).copied())
            .collect();
        if samples.is_empty() {
            continue;
        }
        samples.sort();
        points.push((*percentile as u8, saturating_u64(samples[samples.len() / 2])));
    }
    PercentileTable::from_points(points)
}

pub fn legacy_table(gas_price: U256) -> PercentileTable {
    PercentileTable::from_levels(LEGACY_MARKUP_PCT.iter().map(|(level, pct)| {
        let tip = gas_price * U256::from(*pct) / U256::from(100u64);
        (*level, saturating_u64(tip))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gwei(n: u64) -> U256 {
        U256::from(n) * U256::exp10(9)
    }

    #[test]
    fn test_eip1559_quote_pads_base_fee() {
        let quote = GasQuote::eip1559(gwei(10), 2_000_000_000, 1.5);
        assert_eq!(
            quote,
            GasQuote::Eip1559 {
                max_fee: gwei(17),
                priority: gwei(2)
            }
        );
        assert_eq!(quote.max_cost(21_000), gwei(17) * U256::from(21_000u64));
    }

    #[test]
    fn test_legacy_quote_adds_tip() {
        let quote = GasQuote::legacy(gwei(3), 1_000_000_000);
        assert_eq!(quote.max_price(), gwei(4));
    }

    #[test]
    fn test_reward_table_takes_median_per_percentile() {
        let rewards = vec![
            vec![gwei(1), gwei(2), gwei(3), gwei(4), gwei(5), gwei(6)],
            vec![gwei(1), gwei(2), gwei(9), gwei(4), gwei(5), gwei(6)],
            vec![gwei(1), gwei(2), gwei(5), gwei(4), gwei(5), gwei(60)],
        ];
        let table = reward_table(&rewards);
        assert_eq!(table.fee_for(PriorityLevel::Min), 1_000_000_000);
        assert_eq!(table.fee_for(PriorityLevel::Medium), 5_000_000_000);
        assert_eq!(table.fee_for(PriorityLevel::UnsafeMax), 6_000_000_000);
        assert!(reward_table(&[]).is_empty());
    }

    #[test]
    fn test_legacy_table_scales_with_gas_price() {
        let table = legacy_table(gwei(5));
        assert_eq!(table.fee_for(PriorityLevel::Min), 0);
        assert_eq!(table.fee_for(PriorityLevel::Medium), 500_000_000);
        assert_eq!(table.fee_for(PriorityLevel::UnsafeMax), 5_000_000_000);
    }

    #[test]
    fn test_unit_helpers() {
        assert_eq!(saturating_u64(U256::MAX), u64::MAX);
        assert_eq!(saturating_u64(U256::from(7u64)), 7);
        assert_eq!(apply_slippage(U256::from(10_000u64), 50), U256::from(9_950u64));
        assert_eq!(scale(U256::from(1_000u64), 1.2), U256::from(1_200u64));
        assert!(confirmations_reached(100, 99, 2));
        assert!(!confirmations_reached(100, 100, 2));
        assert!(confirmations_reached(100, 100, 0));
    }
}
