// =============================================================================
// Order Book — synthetic bid/ask ladder around the mid price
// =============================================================================
//
// Rebuilt once per tick. Twenty levels per side at geometric spacing
// (~0.05% of mid per level, widened with volatility); per-level quantity
// decays as exp(-level / 5) and is scaled so the ladder carries the target
// liquidity, split evenly across the two sides.
// =============================================================================

use serde::{Deserialize, Serialize};

/// Levels per side.
pub const BOOK_DEPTH: usize = 20;
/// Base per-level geometric step as a fraction of mid.
const BASE_LEVEL_STEP: f64 = 0.0005;
/// Decay constant for the per-level quantity profile.
const QUANTITY_DECAY: f64 = 5.0;

/// One ladder level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OrderBookLevel {
    pub price: f64,
    pub quantity: f64,
}

/// Full book state for a simulation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderBookSnapshot {
    pub bids: Vec<OrderBookLevel>,
    pub asks: Vec<OrderBookLevel>,
    pub last_update_time: i64,
}

impl OrderBookSnapshot {
    /// Rebuild the ladder around `mid`. `liquidity` is the target notional
    /// carried by the whole book; `volatility` widens the spacing.
    pub fn rebuild_around(mid: f64, liquidity: f64, volatility: f64, now: i64) -> Self {
        if mid <= 0.0 || !mid.is_finite() {
            return Self {
                bids: Vec::new(),
                asks: Vec::new(),
                last_update_time: now,
            };
        }

        let step = BASE_LEVEL_STEP * (1.0 + volatility.clamp(0.0, 1.0) * 2.0);
        let side_liquidity = (liquidity.max(0.0)) / 2.0;

        // Normalising weight for the exp(-i/5) quantity profile.
        let total_weight: f64 = (0..BOOK_DEPTH)
            .map(|i| (-(i as f64) / QUANTITY_DECAY).exp())
            .sum();

        let mut bids = Vec::with_capacity(BOOK_DEPTH);
        let mut asks = Vec::with_capacity(BOOK_DEPTH);

        for i in 0..BOOK_DEPTH {
            let weight = (-(i as f64) / QUANTITY_DECAY).exp() / total_weight;
            let notional = side_liquidity * weight;

            let bid_price = mid * (1.0 - step).powi(i as i32 + 1);
            let ask_price = mid * (1.0 + step).powi(i as i32 + 1);

            bids.push(OrderBookLevel {
                price: bid_price,
                quantity: if bid_price > 0.0 { notional / bid_price } else { 0.0 },
            });
            asks.push(OrderBookLevel {
                price: ask_price,
                quantity: notional / ask_price,
            });
        }

        Self {
            bids,
            asks,
            last_update_time: now,
        }
    }

    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|l| l.price)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sides_have_twenty_levels() {
        let book = OrderBookSnapshot::rebuild_around(5.0, 100_000.0, 0.02, 1_000);
        assert_eq!(book.bids.len(), BOOK_DEPTH);
        assert_eq!(book.asks.len(), BOOK_DEPTH);
        assert_eq!(book.last_update_time, 1_000);
    }

    #[test]
    fn bids_below_mid_asks_above() {
        let mid = 5.0;
        let book = OrderBookSnapshot::rebuild_around(mid, 100_000.0, 0.02, 0);
        for level in &book.bids {
            assert!(level.price < mid);
        }
        for level in &book.asks {
            assert!(level.price > mid);
        }
    }

    #[test]
    fn sides_are_monotone() {
        let book = OrderBookSnapshot::rebuild_around(5.0, 100_000.0, 0.02, 0);
        for pair in book.bids.windows(2) {
            assert!(pair[0].price > pair[1].price, "bids must descend from mid");
        }
        for pair in book.asks.windows(2) {
            assert!(pair[0].price < pair[1].price, "asks must ascend from mid");
        }
    }

    #[test]
    fn quantities_decay_with_depth() {
        let book = OrderBookSnapshot::rebuild_around(5.0, 100_000.0, 0.02, 0);
        // Notional decays; with nearly-flat prices per side the quantity
        // profile decays too.
        let first = book.asks[0].quantity * book.asks[0].price;
        let last = book.asks[BOOK_DEPTH - 1].quantity * book.asks[BOOK_DEPTH - 1].price;
        assert!(first > last);
    }

    #[test]
    fn ladder_carries_target_liquidity() {
        let liquidity = 100_000.0;
        let book = OrderBookSnapshot::rebuild_around(5.0, liquidity, 0.02, 0);
        let notional: f64 = book
            .bids
            .iter()
            .chain(book.asks.iter())
            .map(|l| l.price * l.quantity)
            .sum();
        assert!((notional - liquidity).abs() / liquidity < 0.01);
    }

    #[test]
    fn higher_volatility_widens_spread() {
        let calm = OrderBookSnapshot::rebuild_around(5.0, 100_000.0, 0.01, 0);
        let wild = OrderBookSnapshot::rebuild_around(5.0, 100_000.0, 0.05, 0);
        let calm_spread = calm.best_ask().unwrap() - calm.best_bid().unwrap();
        let wild_spread = wild.best_ask().unwrap() - wild.best_bid().unwrap();
        assert!(wild_spread > calm_spread);
    }

    #[test]
    fn degenerate_mid_yields_empty_book() {
        let book = OrderBookSnapshot::rebuild_around(0.0, 100_000.0, 0.02, 0);
        assert!(book.bids.is_empty());
        assert!(book.asks.is_empty());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // Any positive mid yields a well-formed ladder: bids strictly
            // below mid, asks strictly above, both sides monotone.
            #[test]
            fn ladder_shape(
                mid in 1e-6f64..1e6,
                liquidity in 1f64..1e9,
                volatility in 0f64..0.05,
            ) {
                let book = OrderBookSnapshot::rebuild_around(mid, liquidity, volatility, 0);
                prop_assert_eq!(book.bids.len(), BOOK_DEPTH);
                prop_assert_eq!(book.asks.len(), BOOK_DEPTH);
                for level in &book.bids {
                    prop_assert!(level.price < mid);
                    prop_assert!(level.quantity >= 0.0);
                }
                for level in &book.asks {
                    prop_assert!(level.price > mid);
                    prop_assert!(level.quantity >= 0.0);
                }
                for pair in book.bids.windows(2) {
                    prop_assert!(pair[0].price > pair[1].price);
                }
                for pair in book.asks.windows(2) {
                    prop_assert!(pair[0].price < pair[1].price);
                }
            }
        }
    }
}
