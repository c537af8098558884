//! Mergeable per-window swap summary
//!
//! `SwapAccumulator` holds running sums and extrema for one `WindowKey`, plus
//! the sorted `(order, price)` points TWAP needs. All state is
//! order-independent: `merge` in any arrival order and `combine` of any
//! partition of the same events finalize to the identical record.
//!
//! ## Derivations
//!
//! - open / close: price at the smallest / largest `OrderKey`
//! - high / low: running max / min
//! - TWAP: each price weighted by the time until the next event (the last one
//!   until window end), divided by the weighted span
//! - volatility: population standard deviation, summed in `OrderKey` order so
//!   floating point rounding does not depend on arrival order
//! - volumes: unbounded exact decimal sums of `|out - in|` per token
//! - average gas price: `Σ(gasPrice × gasUsed) / ΣgasUsed`
//! - arbitrage count: per sender, `min(token0→token1 swaps, token1→token0 swaps)`

use super::error::PipelineError;
use super::types::{
    decimal_string, AggregatedAnalytics, OrderKey, ParsedSwap, SwapDirection, WindowKey,
};
use bigdecimal::{BigDecimal, ToPrimitive, Zero};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PricePoint {
    pub order: OrderKey,
    pub price: f64,
}

fn point_cmp(a: &PricePoint, b: &PricePoint) -> Ordering {
    a.order
        .cmp(&b.order)
        .then_with(|| a.price.total_cmp(&b.price))
}

/// A value tagged with the position of the event that carried it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Tagged {
    order: OrderKey,
    value: String,
}

fn earliest(current: Option<Tagged>, candidate: Option<Tagged>) -> Option<Tagged> {
    match (current, candidate) {
        (Some(a), Some(b)) => {
            if (b.order, &b.value) < (a.order, &a.value) {
                Some(b)
            } else {
                Some(a)
            }
        }
        (a, b) => a.or(b),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PairIdentity {
    order: OrderKey,
    token0: String,
    token1: String,
}

fn earliest_identity(
    current: Option<PairIdentity>,
    candidate: Option<PairIdentity>,
) -> Option<PairIdentity> {
    match (current, candidate) {
        (Some(a), Some(b)) => {
            if (b.order, &b.token0, &b.token1) < (a.order, &a.token0, &a.token1) {
                Some(b)
            } else {
                Some(a)
            }
        }
        (a, b) => a.or(b),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LargestSwap {
    value: BigDecimal,
    address: String,
}

/// Larger USD value wins; ties go to the lexicographically smaller address
fn larger(current: Option<LargestSwap>, candidate: Option<LargestSwap>) -> Option<LargestSwap> {
    match (current, candidate) {
        (Some(a), Some(b)) => match b.value.cmp(&a.value) {
            Ordering::Greater => Some(b),
            Ordering::Equal if b.address < a.address => Some(b),
            _ => Some(a),
        },
        (a, b) => a.or(b),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TraderStats {
    swaps: u64,
    zero_for_one: u64,
    one_for_zero: u64,
    first_seen: OrderKey,
}

impl TraderStats {
    fn from_swap(swap: &ParsedSwap) -> Self {
        let direction = swap.direction();
        Self {
            swaps: 1,
            zero_for_one: u64::from(direction == SwapDirection::ZeroForOne),
            one_for_zero: u64::from(direction == SwapDirection::OneForZero),
            first_seen: swap.order,
        }
    }

    fn absorb(&self, other: &TraderStats) -> Result<TraderStats, PipelineError> {
        Ok(TraderStats {
            swaps: self
                .swaps
                .checked_add(other.swaps)
                .ok_or(PipelineError::Overflow("uniqueTraders"))?,
            zero_for_one: self
                .zero_for_one
                .checked_add(other.zero_for_one)
                .ok_or(PipelineError::Overflow("arbitrageCount"))?,
            one_for_zero: self
                .one_for_zero
                .checked_add(other.one_for_zero)
                .ok_or(PipelineError::Overflow("arbitrageCount"))?,
            first_seen: self.first_seen.min(other.first_seen),
        })
    }

    fn round_trips(&self) -> u64 {
        self.zero_for_one.min(self.one_for_zero)
    }
}

fn merge_points(a: Vec<PricePoint>, b: Vec<PricePoint>) -> Vec<PricePoint> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let mut left = a.into_iter().peekable();
    let mut right = b.into_iter().peekable();
    loop {
        let take_left = match (left.peek(), right.peek()) {
            (Some(x), Some(y)) => point_cmp(x, y) != Ordering::Greater,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => break,
        };
        if take_left {
            out.extend(left.next());
        } else {
            out.extend(right.next());
        }
    }
    out
}

/// Incremental summary of all swaps merged into one window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapAccumulator {
    window: WindowKey,
    identity: Option<PairIdentity>,
    token0_symbol: Option<Tagged>,
    token1_symbol: Option<Tagged>,
    /// Sorted by `OrderKey`, then price
    points: Vec<PricePoint>,
    high: Option<f64>,
    low: Option<f64>,
    swap_count: u64,
    total_volume0: BigDecimal,
    total_volume1: BigDecimal,
    volume_usd: BigDecimal,
    largest: Option<LargestSwap>,
    traders: BTreeMap<String, TraderStats>,
    total_gas_used: u64,
    /// Σ gasPrice × gasUsed
    gas_price_weighted: BigDecimal,
}

impl SwapAccumulator {
    /// Empty accumulator; the identity element of `combine`
    pub fn new(window: WindowKey) -> Self {
        Self {
            window,
            identity: None,
            token0_symbol: None,
            token1_symbol: None,
            points: Vec::new(),
            high: None,
            low: None,
            swap_count: 0,
            total_volume0: BigDecimal::zero(),
            total_volume1: BigDecimal::zero(),
            volume_usd: BigDecimal::zero(),
            largest: None,
            traders: BTreeMap::new(),
            total_gas_used: 0,
            gas_price_weighted: BigDecimal::zero(),
        }
    }

    pub fn window(&self) -> &WindowKey {
        &self.window
    }

    pub fn swap_count(&self) -> u64 {
        self.swap_count
    }

    pub fn is_empty(&self) -> bool {
        self.swap_count == 0
    }

    /// Merge one swap
    ///
    /// Atomic: on error the accumulator is unchanged.
    pub fn merge(&mut self, swap: &ParsedSwap) -> Result<(), PipelineError> {
        if swap.pair_address != self.window.pair_address || !self.window.contains(swap.event_time())
        {
            return Err(PipelineError::WindowMismatch {
                left: self.window.to_string(),
                right: format!("{}@{}", swap.pair_address, swap.event_time()),
            });
        }

        let swap_count = self
            .swap_count
            .checked_add(1)
            .ok_or(PipelineError::Overflow("swapCount"))?;
        let total_gas_used = self
            .total_gas_used
            .checked_add(swap.gas_used)
            .ok_or(PipelineError::Overflow("totalGasUsed"))?;
        let incoming = TraderStats::from_swap(swap);
        let trader = match self.traders.get(&swap.sender) {
            Some(existing) => existing.absorb(&incoming)?,
            None => incoming,
        };

        let point = PricePoint {
            order: swap.order,
            price: swap.price,
        };
        let idx = self
            .points
            .partition_point(|p| point_cmp(p, &point) != Ordering::Greater);
        self.points.insert(idx, point);

        self.high = Some(self.high.map_or(swap.price, |h| h.max(swap.price)));
        self.low = Some(self.low.map_or(swap.price, |l| l.min(swap.price)));
        self.identity = earliest_identity(
            self.identity.take(),
            Some(PairIdentity {
                order: swap.order,
                token0: swap.token0.clone(),
                token1: swap.token1.clone(),
            }),
        );
        self.token0_symbol = earliest(
            self.token0_symbol.take(),
            swap.token0_symbol.clone().map(|value| Tagged {
                order: swap.order,
                value,
            }),
        );
        self.token1_symbol = earliest(
            self.token1_symbol.take(),
            swap.token1_symbol.clone().map(|value| Tagged {
                order: swap.order,
                value,
            }),
        );
        self.largest = larger(
            self.largest.take(),
            swap.volume_usd.clone().map(|value| LargestSwap {
                value,
                address: swap.sender.clone(),
            }),
        );
        self.traders.insert(swap.sender.clone(), trader);
        self.swap_count = swap_count;
        self.total_volume0 += swap.volume0();
        self.total_volume1 += swap.volume1();
        if let Some(usd) = &swap.volume_usd {
            self.volume_usd += usd;
        }
        self.total_gas_used = total_gas_used;
        self.gas_price_weighted += &swap.gas_price * &BigDecimal::from(swap.gas_used);
        Ok(())
    }

    /// Combine two partial accumulators of the same window
    ///
    /// Associative and commutative; an empty accumulator is the identity.
    pub fn combine(self, other: SwapAccumulator) -> Result<SwapAccumulator, PipelineError> {
        if self.window != other.window {
            return Err(PipelineError::WindowMismatch {
                left: self.window.to_string(),
                right: other.window.to_string(),
            });
        }

        let swap_count = self
            .swap_count
            .checked_add(other.swap_count)
            .ok_or(PipelineError::Overflow("swapCount"))?;
        let total_gas_used = self
            .total_gas_used
            .checked_add(other.total_gas_used)
            .ok_or(PipelineError::Overflow("totalGasUsed"))?;

        let mut traders = self.traders;
        for (address, stats) in other.traders {
            let merged = match traders.get(&address) {
                Some(existing) => existing.absorb(&stats)?,
                None => stats,
            };
            traders.insert(address, merged);
        }

        Ok(SwapAccumulator {
            window: self.window,
            identity: earliest_identity(self.identity, other.identity),
            token0_symbol: earliest(self.token0_symbol, other.token0_symbol),
            token1_symbol: earliest(self.token1_symbol, other.token1_symbol),
            points: merge_points(self.points, other.points),
            high: match (self.high, other.high) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            },
            low: match (self.low, other.low) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            },
            swap_count,
            total_volume0: self.total_volume0 + other.total_volume0,
            total_volume1: self.total_volume1 + other.total_volume1,
            volume_usd: self.volume_usd + other.volume_usd,
            largest: larger(self.largest, other.largest),
            traders,
            total_gas_used,
            gas_price_weighted: self.gas_price_weighted + other.gas_price_weighted,
        })
    }

    /// Time-weighted average price over the window
    pub fn twap(&self) -> Option<f64> {
        let (high, low) = (self.high?, self.low?);
        if high == low {
            return Some(high);
        }
        let first_time = self.points.first()?.order.event_time;
        let end = self.window.window_end;

        let mut weighted = 0.0;
        for (i, point) in self.points.iter().enumerate() {
            let next_time = self
                .points
                .get(i + 1)
                .map_or(end, |next| next.order.event_time);
            weighted += point.price * (next_time - point.order.event_time) as f64;
        }
        let twap = weighted / (end - first_time) as f64;
        Some(twap.clamp(low, high))
    }

    /// Population standard deviation of execution prices
    pub fn volatility(&self) -> Option<f64> {
        let (high, low) = (self.high?, self.low?);
        if high == low {
            return Some(0.0);
        }
        let n = self.points.len() as f64;
        let mean = self.points.iter().map(|p| p.price).sum::<f64>() / n;
        let variance = self
            .points
            .iter()
            .map(|p| {
                let d = p.price - mean;
                d * d
            })
            .sum::<f64>()
            / n;
        Some(variance.sqrt())
    }

    /// Traders with more than one swap, in first-seen order
    pub fn repeated_traders(&self) -> Vec<String> {
        let mut repeated: Vec<(&OrderKey, &String)> = self
            .traders
            .iter()
            .filter(|(_, stats)| stats.swaps > 1)
            .map(|(address, stats)| (&stats.first_seen, address))
            .collect();
        repeated.sort();
        repeated.into_iter().map(|(_, a)| a.clone()).collect()
    }

    pub fn arbitrage_count(&self) -> u64 {
        self.traders.values().map(TraderStats::round_trips).sum()
    }

    pub fn average_gas_price(&self) -> BigDecimal {
        if self.total_gas_used == 0 {
            return BigDecimal::zero();
        }
        self.gas_price_weighted.clone() / BigDecimal::from(self.total_gas_used)
    }

    /// Build the output record; `None` for an empty accumulator
    pub fn finalize(&self, processed_at: i64) -> Option<AggregatedAnalytics> {
        let open = self.points.first()?;
        let close = self.points.last()?;
        let identity = self.identity.as_ref()?;

        Some(AggregatedAnalytics {
            window_id: self.window.window_id(),
            window_start: self.window.window_start,
            window_end: self.window.window_end,
            pair_address: self.window.pair_address.clone(),
            token0: identity.token0.clone(),
            token1: identity.token1.clone(),
            token0_symbol: self.token0_symbol.as_ref().map(|t| t.value.clone()),
            token1_symbol: self.token1_symbol.as_ref().map(|t| t.value.clone()),
            twap: self.twap()?,
            open_price: open.price,
            close_price: close.price,
            high_price: self.high?,
            low_price: self.low?,
            price_volatility: self.volatility()?,
            total_volume0: decimal_string(&self.total_volume0),
            total_volume1: decimal_string(&self.total_volume1),
            volume_usd: self.volume_usd.to_f64().unwrap_or(0.0),
            swap_count: self.swap_count,
            unique_traders: self.traders.len() as u64,
            largest_swap_value: self.largest.as_ref().map(|l| decimal_string(&l.value)),
            largest_swap_address: self.largest.as_ref().map(|l| l.address.clone()),
            total_gas_used: self.total_gas_used,
            average_gas_price: decimal_string(&self.average_gas_price()),
            arbitrage_count: self.arbitrage_count(),
            repeated_traders: self.repeated_traders(),
            processed_at,
        })
    }
}
