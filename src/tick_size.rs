// =============================================================================
// KRX Tick Size Ladder — limit-price alignment for momentum buy orders
// =============================================================================
//
// A limit order's price must land on a valid KRX tick boundary or the
// broker rejects it outright. Pure, table-driven function over the standard
// KRX price-band ladder, written in the same small-pure-function style as
// `indicators/sma.rs`.
// =============================================================================

/// KRX tick size for a given price, per the standard equity price-band table.
fn tick_size_for(price: f64) -> f64 {
    if price < 2_000.0 {
        1.0
    } else if price < 5_000.0 {
        5.0
    } else if price < 20_000.0 {
        10.0
    } else if price < 50_000.0 {
        50.0
    } else if price < 200_000.0 {
        100.0
    } else if price < 500_000.0 {
        500.0
    } else {
        1_000.0
    }
}

/// Round `price` down to the nearest valid tick boundary for its price band.
pub fn tick_align(price: f64) -> f64 {
    if price <= 0.0 {
        return 0.0;
    }
    let tick = tick_size_for(price);
    (price / tick).floor() * tick
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligns_within_band() {
        assert_eq!(tick_align(71_234.0), 71_200.0);
        assert_eq!(tick_align(1_234.0), 1_234.0);
        assert_eq!(tick_align(4_567.0), 4_565.0);
        assert_eq!(tick_align(19_995.0), 19_990.0);
    }

    #[test]
    fn handles_band_boundaries() {
        assert_eq!(tick_align(2_000.0), 2_000.0);
        assert_eq!(tick_align(1_999.0), 1_999.0);
    }

    #[test]
    fn non_positive_price_yields_zero() {
        assert_eq!(tick_align(0.0), 0.0);
        assert_eq!(tick_align(-5.0), 0.0);
    }

    #[test]
    fn high_price_band_uses_widest_tick() {
        assert_eq!(tick_align(612_345.0), 612_000.0);
    }
}
