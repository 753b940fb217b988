//! Volume profile
//!
//! Distribution-of-volume view over a closed footprint window: point of
//! control, value area, and high/low-volume nodes.
//!
//! - POC: the level with the greatest total volume, ties to the lowest
//!   price.
//! - Value area: smallest contiguous band around the POC holding at
//!   least `value_area_percent` of attributed volume, grown by taking
//!   the neighbor with more volume, ties to the upper side.
//! - HVN / LVN: levels above 150% / below 50% of the mean level volume.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::footprint::FootprintWindow;

/// One row of a volume profile, ascending by price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeProfileLevel {
    pub price: Decimal,
    pub buy_volume: Decimal,
    pub sell_volume: Decimal,
    pub total_volume: Decimal,
    /// Share of the profile's total volume, 0 to 100.
    pub percentage: Decimal,
    pub poc: bool,
    pub in_value_area: bool,
    pub hvn: bool,
    pub lvn: bool,
}

/// Immutable profile built once per window close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeProfile {
    pub symbol: String,
    pub high: Decimal,
    pub low: Decimal,
    /// Side-attributed volume; unknown-side trades carry no level.
    pub total_volume: Decimal,
    pub poc_price: Decimal,
    pub value_area_high: Decimal,
    pub value_area_low: Decimal,
    pub value_area_volume: Decimal,
    pub levels: Vec<VolumeProfileLevel>,
    pub built_at: i64,
}

/// Build the profile for a window. `None` when no side-attributed volume
/// traded, so callers treat an empty window as "no profile" rather than
/// an error.
pub fn build_profile(
    window: &FootprintWindow,
    value_area_percent: Decimal,
    now: i64,
) -> Option<VolumeProfile> {
    let bars: Vec<_> = window.bars.values().collect();
    let totals: Vec<Decimal> = bars.iter().map(|b| b.total_volume()).collect();
    let total: Decimal = totals.iter().copied().sum();
    if bars.is_empty() || total <= Decimal::ZERO {
        return None;
    }

    // Lowest price wins POC ties: ascending scan, strictly-greater only.
    let mut poc_idx = 0;
    for (idx, volume) in totals.iter().enumerate() {
        if *volume > totals[poc_idx] {
            poc_idx = idx;
        }
    }

    let hundred = Decimal::from(100);
    let target = total * value_area_percent / hundred;
    let mut lo = poc_idx;
    let mut hi = poc_idx;
    let mut value_area_volume = totals[poc_idx];
    while value_area_volume < target {
        let up = (hi + 1 < totals.len()).then(|| totals[hi + 1]);
        let down = (lo > 0).then(|| totals[lo - 1]);
        match (up, down) {
            (Some(u), Some(d)) if d > u => {
                lo -= 1;
                value_area_volume += d;
            }
            // Ties expand upward.
            (Some(u), _) => {
                hi += 1;
                value_area_volume += u;
            }
            (None, Some(d)) => {
                lo -= 1;
                value_area_volume += d;
            }
            (None, None) => break,
        }
    }

    let mean = total / Decimal::from(totals.len());
    let hvn_threshold = mean * Decimal::new(15, 1);
    let lvn_threshold = mean * Decimal::new(5, 1);

    let levels = bars
        .iter()
        .enumerate()
        .map(|(idx, bar)| VolumeProfileLevel {
            price: bar.price_level,
            buy_volume: bar.buy_volume,
            sell_volume: bar.sell_volume,
            total_volume: totals[idx],
            percentage: totals[idx] / total * hundred,
            poc: idx == poc_idx,
            in_value_area: idx >= lo && idx <= hi,
            hvn: totals[idx] > hvn_threshold,
            lvn: totals[idx] < lvn_threshold,
        })
        .collect();

    Some(VolumeProfile {
        symbol: window.symbol.clone(),
        high: window.high,
        low: window.low,
        total_volume: total,
        poc_price: bars[poc_idx].price_level,
        value_area_high: bars[hi].price_level,
        value_area_low: bars[lo].price_level,
        value_area_volume,
        levels,
        built_at: now,
    })
}
