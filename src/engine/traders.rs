// =============================================================================
// Trader Decision Engine — synthetic population entries and exits
// =============================================================================
//
// Every tick each trader rolls `trading_frequency * action_multiplier` to
// decide whether to act at all. Traders without a position consult their
// strategy for an entry; traders with a position check the strategy's exit
// thresholds (take-profit, stop-loss, timeout).
//
// Decisions are computed against an immutable `DecisionContext` snapshot so
// the high-speed path can scatter the population across worker tasks and
// gather the results before applying them sequentially.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::debug;

use crate::indicators::rsi::{latest_rsi, OVERBOUGHT, OVERSOLD};
use crate::indicators::sma::latest_sma;
use crate::types::{PositionSizing, TradeAction, TraderInfo, TraderProfile, TraderStrategy, Trend};

/// Baseline per-tick action multiplier.
pub const BASE_ACTION_MULTIPLIER: f64 = 0.05;
/// Batched mode caps the multiplier at 10x baseline.
pub const MAX_ACTION_MULTIPLIER: f64 = BASE_ACTION_MULTIPLIER * 10.0;
/// Notional base for position sizing.
const BASE_POSITION_VALUE: f64 = 10_000.0;
/// Default trader population.
pub const DEFAULT_TRADER_COUNT: usize = 118;

// ---------------------------------------------------------------------------
// Context & decisions
// ---------------------------------------------------------------------------

/// Open-position facts a trader needs for its exit check.
#[derive(Debug, Clone, Copy)]
pub struct PositionBrief {
    pub entry_price: f64,
    pub quantity: f64,
    pub entry_time: i64,
}

/// Immutable market snapshot one decision round runs against.
#[derive(Debug, Clone)]
pub struct DecisionContext {
    pub current_price: f64,
    pub volatility: f64,
    pub trend: Trend,
    /// Recent candle closes, oldest-first.
    pub closes: Vec<f64>,
    /// Virtual time in epoch ms.
    pub now: i64,
    /// Effective action multiplier: baseline x batch size x TPS mode,
    /// already capped by the caller.
    pub action_multiplier: f64,
    /// Open positions keyed by wallet address.
    pub positions: HashMap<String, PositionBrief>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DecisionAction {
    Enter { action: TradeAction },
    Exit,
}

#[derive(Debug, Clone)]
pub struct TraderDecision {
    pub wallet_address: String,
    pub action: DecisionAction,
    pub quantity: f64,
}

// ---------------------------------------------------------------------------
// Population generation
// ---------------------------------------------------------------------------

const NAME_ADJECTIVES: &[&str] = &[
    "Quiet", "Rapid", "Golden", "Iron", "Lucky", "Silent", "Crimson", "Nimble", "Bold",
    "Frozen", "Electric", "Patient", "Wild", "Sly", "Steady", "Hollow",
];

const NAME_ANIMALS: &[&str] = &[
    "Falcon", "Otter", "Viper", "Badger", "Raven", "Shark", "Mantis", "Wolf", "Heron",
    "Lynx", "Panther", "Gecko", "Orca", "Ibis", "Jackal", "Moth",
];

fn random_wallet<R: Rng>(rng: &mut R) -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    let mut addr = String::with_capacity(42);
    addr.push_str("0x");
    for _ in 0..40 {
        addr.push(HEX[rng.gen_range(0..16)] as char);
    }
    addr
}

/// Generate a synthetic trader population. Wallets are unique by
/// construction (160-bit random addresses); names may repeat.
pub fn generate_traders<R: Rng>(count: usize, rng: &mut R) -> Vec<TraderProfile> {
    let mut traders = Vec::with_capacity(count);
    for i in 0..count {
        let strategy = match rng.gen_range(0..100) {
            0..=29 => TraderStrategy::Scalper,
            30..=54 => TraderStrategy::Swing,
            55..=79 => TraderStrategy::Momentum,
            _ => TraderStrategy::Contrarian,
        };
        let position_sizing = match rng.gen_range(0..3) {
            0 => PositionSizing::Conservative,
            1 => PositionSizing::Moderate,
            _ => PositionSizing::Aggressive,
        };
        let trading_frequency = rng.gen_range(0.1..=1.0_f64);
        let rules = strategy.exit_rules();

        let risk_profile = match (position_sizing, trading_frequency) {
            (PositionSizing::Aggressive, f) if f > 0.5 => "high",
            (PositionSizing::Conservative, f) if f < 0.5 => "low",
            _ => "medium",
        };

        let adjective = NAME_ADJECTIVES[rng.gen_range(0..NAME_ADJECTIVES.len())];
        let animal = NAME_ANIMALS[rng.gen_range(0..NAME_ANIMALS.len())];

        traders.push(TraderProfile {
            trader: TraderInfo {
                wallet_address: random_wallet(rng),
                preferred_name: format!("{adjective}{animal}{}", i + 1),
                net_pnl: 0.0,
            },
            strategy,
            trading_frequency,
            position_sizing,
            stop_loss: rules.stop_loss.abs(),
            take_profit: rules.take_profit,
            risk_profile: risk_profile.to_string(),
        });
    }
    debug!(count = traders.len(), "trader population generated");
    traders
}

// ---------------------------------------------------------------------------
// Decision logic
// ---------------------------------------------------------------------------

/// One trader's decision for this round, if any. `forced` bypasses the
/// frequency gate (cold-start bootstrap).
pub fn decide<R: Rng>(
    profile: &TraderProfile,
    ctx: &DecisionContext,
    forced: bool,
    rng: &mut R,
) -> Option<TraderDecision> {
    if !forced {
        let act_probability = profile.trading_frequency * ctx.action_multiplier;
        if rng.gen::<f64>() >= act_probability {
            return None;
        }
    }

    let wallet = &profile.trader.wallet_address;
    match ctx.positions.get(wallet) {
        None => decide_entry(profile, ctx, forced, rng),
        Some(position) => decide_exit(profile, position, ctx, forced, rng),
    }
}

fn decide_entry<R: Rng>(
    profile: &TraderProfile,
    ctx: &DecisionContext,
    forced: bool,
    rng: &mut R,
) -> Option<TraderDecision> {
    if ctx.current_price <= 0.0 {
        return None;
    }

    let intent = entry_intent(profile.strategy, ctx, rng);
    let (probability, action) = match intent {
        Some(pair) => pair,
        None if forced => (1.0, random_action(rng)),
        None => return None,
    };

    if !forced && rng.gen::<f64>() >= probability {
        return None;
    }

    let value = BASE_POSITION_VALUE
        * profile.position_sizing.multiplier()
        * (0.5 + rng.gen::<f64>());
    let quantity = (value / ctx.current_price) * action.direction();

    Some(TraderDecision {
        wallet_address: profile.trader.wallet_address.clone(),
        action: DecisionAction::Enter { action },
        quantity,
    })
}

/// Strategy gate: `(entry probability, direction)` when the strategy's
/// market condition holds, `None` otherwise. Strategies that need indicator
/// history fall back to the 0.2 random entry while the series is too short.
fn entry_intent<R: Rng>(
    strategy: TraderStrategy,
    ctx: &DecisionContext,
    rng: &mut R,
) -> Option<(f64, TradeAction)> {
    match strategy {
        TraderStrategy::Scalper => {
            (ctx.volatility > 0.015).then(|| (0.3, random_action(rng)))
        }
        TraderStrategy::Swing => {
            let sma5 = match latest_sma(&ctx.closes, 5) {
                Some(v) => v,
                None => return Some((0.2, random_action(rng))),
            };
            if ctx.trend == Trend::Sideways {
                return None;
            }
            let prev_close = *ctx.closes.last()?;
            let crossed = (prev_close - sma5).signum() != (ctx.current_price - sma5).signum();
            let action = if ctx.trend == Trend::Bullish {
                TradeAction::Buy
            } else {
                TradeAction::Sell
            };
            crossed.then_some((0.4, action))
        }
        TraderStrategy::Momentum => {
            let sma20 = match latest_sma(&ctx.closes, 20) {
                Some(v) => v,
                None => return Some((0.2, random_action(rng))),
            };
            let rsi = latest_rsi(&ctx.closes, 14).unwrap_or(50.0);
            if rsi >= OVERBOUGHT || rsi <= OVERSOLD {
                return None;
            }
            match ctx.trend {
                Trend::Bullish if ctx.current_price > sma20 => {
                    Some((0.5, TradeAction::Buy))
                }
                Trend::Bearish if ctx.current_price < sma20 => {
                    Some((0.5, TradeAction::Sell))
                }
                _ => None,
            }
        }
        TraderStrategy::Contrarian => {
            let rsi = match latest_rsi(&ctx.closes, 14) {
                Some(v) => v,
                None => return Some((0.2, random_action(rng))),
            };
            if rsi > OVERBOUGHT {
                Some((0.6, TradeAction::Sell))
            } else if rsi < OVERSOLD {
                Some((0.6, TradeAction::Buy))
            } else {
                None
            }
        }
    }
}

fn decide_exit<R: Rng>(
    profile: &TraderProfile,
    position: &PositionBrief,
    ctx: &DecisionContext,
    forced: bool,
    rng: &mut R,
) -> Option<TraderDecision> {
    if position.entry_price <= 0.0 {
        return None;
    }

    let direction = if position.quantity >= 0.0 { 1.0 } else { -1.0 };
    let pnl_fraction =
        direction * (ctx.current_price - position.entry_price) / position.entry_price;
    let elapsed_minutes = ((ctx.now - position.entry_time).max(0) as f64) / 60_000.0;

    let rules = profile.strategy.exit_rules();

    let exit = if forced {
        true
    } else if pnl_fraction >= rules.take_profit || pnl_fraction <= rules.stop_loss {
        true
    } else if elapsed_minutes >= rules.max_minutes {
        let timeout_applies = !rules.timeout_profit_only || pnl_fraction > 0.0;
        timeout_applies && rng.gen::<f64>() < rules.timeout_exit_probability
    } else {
        false
    };

    exit.then(|| TraderDecision {
        wallet_address: profile.trader.wallet_address.clone(),
        action: DecisionAction::Exit,
        quantity: position.quantity.abs(),
    })
}

fn random_action<R: Rng>(rng: &mut R) -> TradeAction {
    if rng.gen::<bool>() {
        TradeAction::Buy
    } else {
        TradeAction::Sell
    }
}

// ---------------------------------------------------------------------------
// Round drivers
// ---------------------------------------------------------------------------

/// Sequential decision round over the whole population.
pub fn decide_all<R: Rng>(
    profiles: &[TraderProfile],
    ctx: &DecisionContext,
    rng: &mut R,
) -> Vec<TraderDecision> {
    profiles
        .iter()
        .filter_map(|p| decide(p, ctx, false, rng))
        .collect()
}

/// Parallel decision round: the population is scattered across up to
/// `workers` tasks and the per-chunk results gathered in chunk order, so
/// applying them stays deterministic with respect to trader order.
pub async fn decide_all_parallel(
    profiles: Arc<Vec<TraderProfile>>,
    ctx: Arc<DecisionContext>,
    workers: usize,
) -> Vec<TraderDecision> {
    let workers = workers.clamp(1, 8);
    let chunk_len = profiles.len().div_ceil(workers).max(1);

    let mut handles = Vec::with_capacity(workers);
    for chunk_index in 0..workers {
        let start = chunk_index * chunk_len;
        if start >= profiles.len() {
            break;
        }
        let end = (start + chunk_len).min(profiles.len());
        let profiles = profiles.clone();
        let ctx = ctx.clone();
        handles.push(tokio::spawn(async move {
            let mut rng = rand::thread_rng();
            profiles[start..end]
                .iter()
                .filter_map(|p| decide(p, &ctx, false, &mut rng))
                .collect::<Vec<_>>()
        }));
    }

    let mut decisions = Vec::new();
    for handle in handles {
        match handle.await {
            Ok(chunk) => decisions.extend(chunk),
            Err(e) => debug!(error = %e, "decision worker panicked — chunk dropped"),
        }
    }
    decisions
}

/// Cold-start fairness: force one decision each from three random traders.
pub fn force_bootstrap<R: Rng>(
    profiles: &[TraderProfile],
    ctx: &DecisionContext,
    rng: &mut R,
) -> Vec<TraderDecision> {
    let mut picks: Vec<&TraderProfile> = profiles.iter().collect();
    picks.shuffle(rng);
    picks
        .into_iter()
        .take(3)
        .filter_map(|p| decide(p, ctx, true, rng))
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
