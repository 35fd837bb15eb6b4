// =============================================================================
// Portfolio Guard — sector/value/cash concentration checks
// =============================================================================
//
// Fail-fast cascade: the first failing check wins and returns a descriptive
// reason. Per-sector and per-stock concentration checks, plus a regime-aware
// cash floor applied after the hypothetical purchase.
// =============================================================================

use std::collections::HashMap;

use crate::config::RiskConfig;
use crate::position_sizing::cash_floor_for_regime;
use crate::types::MarketRegime;

/// Portfolio-wide facts the guard needs, already aggregated by the caller.
pub struct PortfolioSnapshot<'a> {
    pub sector_stock_counts: &'a HashMap<String, u32>,
    pub sector_value: &'a HashMap<String, f64>,
    pub total_position_value: f64,
    pub cash: f64,
    pub total_assets: f64,
}

/// A candidate buy's intended sector/value, for the guard to check against
/// the snapshot above.
pub struct CandidateBuy<'a> {
    pub sector: &'a str,
    pub order_value: f64,
}

/// `None` if all gates pass; `Some(reason)` on the first failing gate.
///
/// `sector_cap` comes from the externally-cached sector-budget hash when
/// present, else falls back to `risk.max_sector_stocks_default`
/// `guard_disabled` models the unconditional-pass
/// escape hatch.
pub fn check(
    snapshot: &PortfolioSnapshot,
    candidate: &CandidateBuy,
    regime: MarketRegime,
    risk: &RiskConfig,
    sector_cap: Option<u32>,
    guard_disabled: bool,
) -> Option<String> {
    if guard_disabled {
        return None;
    }

    let cap = sector_cap.unwrap_or(risk.max_sector_stocks_default);
    let current_sector_count = snapshot
        .sector_stock_counts
        .get(candidate.sector)
        .copied()
        .unwrap_or(0);
    if current_sector_count >= cap {
        return Some(format!(
            "sector '{}' at stock cap ({current_sector_count}/{cap})",
            candidate.sector
        ));
    }

    let max_sector_value_pct = if regime == MarketRegime::StrongBull {
        risk.max_sector_value_pct * 1.5
    } else {
        risk.max_sector_value_pct
    };
    if snapshot.total_assets > 0.0 {
        let current_sector_value = snapshot.sector_value.get(candidate.sector).copied().unwrap_or(0.0);
        let projected_sector_pct =
            (current_sector_value + candidate.order_value) / snapshot.total_assets * 100.0;
        if projected_sector_pct > max_sector_value_pct {
            return Some(format!(
                "sector '{}' value concentration would reach {projected_sector_pct:.1}% (cap {max_sector_value_pct:.1}%)",
                candidate.sector
            ));
        }

        let projected_stock_pct = candidate.order_value / snapshot.total_assets * 100.0;
        if projected_stock_pct > risk.max_stock_value_pct {
            return Some(format!(
                "single-stock value concentration would reach {projected_stock_pct:.1}% (cap {:.1}%)",
                risk.max_stock_value_pct
            ));
        }
    }

    let cash_after = snapshot.cash - candidate.order_value;
    if snapshot.total_assets > 0.0 {
        let cash_after_pct = cash_after / snapshot.total_assets * 100.0;
        let floor = cash_floor_for_regime(risk, regime);
        if cash_after_pct < floor {
            return Some(format!(
                "cash-after-purchase {cash_after_pct:.1}% below regime floor {floor:.1}%"
            ));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_snapshot() -> (HashMap<String, u32>, HashMap<String, f64>) {
        let mut counts = HashMap::new();
        counts.insert("Semiconductors".to_string(), 1);
        let mut values = HashMap::new();
        values.insert("Semiconductors".to_string(), 5_000_000.0);
        (counts, values)
    }

    #[test]
    fn passes_when_well_within_limits() {
        let (counts, values) = base_snapshot();
        let snapshot = PortfolioSnapshot {
            sector_stock_counts: &counts,
            sector_value: &values,
            total_position_value: 5_000_000.0,
            cash: 80_000_000.0,
            total_assets: 100_000_000.0,
        };
        let candidate = CandidateBuy {
            sector: "Semiconductors",
            order_value: 1_000_000.0,
        };
        let risk = RiskConfig::default();
        assert!(check(&snapshot, &candidate, MarketRegime::Bull, &risk, None, false).is_none());
    }

    #[test]
    fn blocks_on_sector_stock_cap() {
        let mut counts = HashMap::new();
        counts.insert("Semiconductors".to_string(), 3);
        let values = HashMap::new();
        let snapshot = PortfolioSnapshot {
            sector_stock_counts: &counts,
            sector_value: &values,
            total_position_value: 0.0,
            cash: 80_000_000.0,
            total_assets: 100_000_000.0,
        };
        let candidate = CandidateBuy {
            sector: "Semiconductors",
            order_value: 1_000_000.0,
        };
        let risk = RiskConfig::default();
        let result = check(&snapshot, &candidate, MarketRegime::Bull, &risk, None, false);
        assert!(result.unwrap().contains("stock cap"));
    }

    #[test]
    fn disabled_guard_always_passes() {
        let mut counts = HashMap::new();
        counts.insert("X".to_string(), 99);
        let values = HashMap::new();
        let snapshot = PortfolioSnapshot {
            sector_stock_counts: &counts,
            sector_value: &values,
            total_position_value: 0.0,
            cash: 0.0,
            total_assets: 100_000_000.0,
        };
        let candidate = CandidateBuy {
            sector: "X",
            order_value: 100_000_000.0,
        };
        let risk = RiskConfig::default();
        assert!(check(&snapshot, &candidate, MarketRegime::Bear, &risk, None, true).is_none());
    }

    #[test]
    fn blocks_on_cash_floor() {
        let (counts, values) = base_snapshot();
        let snapshot = PortfolioSnapshot {
            sector_stock_counts: &counts,
            sector_value: &values,
            total_position_value: 90_000_000.0,
            cash: 12_000_000.0,
            total_assets: 100_000_000.0,
        };
        let candidate = CandidateBuy {
            sector: "Semiconductors",
            order_value: 5_000_000.0,
        };
        let risk = RiskConfig::default();
        let result = check(&snapshot, &candidate, MarketRegime::Sideways, &risk, None, false);
        assert!(result.unwrap().contains("cash-after-purchase"));
    }
}
