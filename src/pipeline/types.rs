//! Core types for the windowed swap pipeline
//!
//! - `SwapEvent` is the wire record exactly as the ingester publishes it.
//! - `ParsedSwap` is the validated form the engine accumulates: unbounded
//!   exact decimals, lower-cased addresses, a total event-time ordering key.
//! - `AggregatedAnalytics` is the emitted per-window record.

use super::error::PipelineError;
use bigdecimal::{BigDecimal, Zero};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Decimal places kept for USD volumes converted from floating point
pub const USD_SCALE: i64 = 8;

/// Plain decimal string without trailing zeros or exponent
pub fn decimal_string(value: &BigDecimal) -> String {
    value.normalized().to_plain_string()
}

#[cfg(test)]
pub(crate) fn dec(raw: &str) -> BigDecimal {
    BigDecimal::from_str(raw).unwrap()
}

/// Swap event as published on the input topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapEvent {
    pub event_id: String,
    pub block_number: i64,
    /// Authoritative event time (epoch seconds)
    pub block_timestamp: i64,
    pub transaction_hash: String,
    pub log_index: i32,
    pub pair_address: String,
    pub token0: String,
    pub token1: String,
    #[serde(default)]
    pub token0_symbol: Option<String>,
    #[serde(default)]
    pub token1_symbol: Option<String>,
    pub sender: String,
    pub recipient: String,
    pub amount0_in: String,
    pub amount1_in: String,
    pub amount0_out: String,
    pub amount1_out: String,
    pub price: f64,
    #[serde(rename = "volumeUSD", default)]
    pub volume_usd: Option<f64>,
    pub gas_used: i64,
    pub gas_price: String,
    /// Ingestion wall-clock time, distinct from event time
    pub event_timestamp: i64,
}

impl SwapEvent {
    /// Parse a SwapEvent from one serialized record
    pub fn from_json(payload: &str) -> Result<Self, PipelineError> {
        let event: SwapEvent = serde_json::from_str(payload)?;
        Ok(event)
    }
}

/// Deterministic position of an event inside its window
///
/// Ordered by event time, then log index, then block number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderKey {
    pub event_time: i64,
    pub log_index: i32,
    pub block_number: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwapDirection {
    /// token0 in, token1 out
    ZeroForOne,
    /// token1 in, token0 out
    OneForZero,
    Undirected,
}

/// Validated swap ready for accumulation
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedSwap {
    pub event_id: String,
    pub transaction_hash: String,
    pub order: OrderKey,
    pub pair_address: String,
    pub token0: String,
    pub token1: String,
    pub token0_symbol: Option<String>,
    pub token1_symbol: Option<String>,
    pub sender: String,
    pub recipient: String,
    pub amount0_in: BigDecimal,
    pub amount1_in: BigDecimal,
    pub amount0_out: BigDecimal,
    pub amount1_out: BigDecimal,
    pub price: f64,
    pub volume_usd: Option<BigDecimal>,
    pub gas_used: u64,
    pub gas_price: BigDecimal,
    pub ingested_at: i64,
}

impl ParsedSwap {
    pub fn event_time(&self) -> i64 {
        self.order.event_time
    }

    pub fn direction(&self) -> SwapDirection {
        let zero = BigDecimal::zero();
        if self.amount0_in > zero && self.amount1_out > zero {
            SwapDirection::ZeroForOne
        } else if self.amount1_in > zero && self.amount0_out > zero {
            SwapDirection::OneForZero
        } else {
            SwapDirection::Undirected
        }
    }

    /// Magnitude of the token0 net flow through the pool
    pub fn volume0(&self) -> BigDecimal {
        (&self.amount0_out - &self.amount0_in).abs()
    }

    /// Magnitude of the token1 net flow through the pool
    pub fn volume1(&self) -> BigDecimal {
        (&self.amount1_out - &self.amount1_in).abs()
    }
}

/// Plain decimal literal: digits with an optional fraction, optionally signed
fn is_decimal_literal(raw: &str) -> bool {
    let unsigned = raw.strip_prefix('-').unwrap_or(raw);
    let (whole, fraction) = match unsigned.split_once('.') {
        Some((whole, fraction)) => (whole, Some(fraction)),
        None => (unsigned, None),
    };
    !whole.is_empty()
        && whole.bytes().all(|b| b.is_ascii_digit())
        && fraction.map_or(true, |f| !f.is_empty() && f.bytes().all(|b| b.is_ascii_digit()))
}

fn parse_amount(field: &str, raw: &str) -> Result<BigDecimal, PipelineError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(PipelineError::Malformed(format!("{} is empty", field)));
    }
    if !is_decimal_literal(trimmed) {
        return Err(PipelineError::Malformed(format!("{} '{}' is not a decimal", field, raw)));
    }
    let value = BigDecimal::from_str(trimmed)
        .map_err(|e| PipelineError::Malformed(format!("{} '{}': {}", field, raw, e)))?;
    if value < BigDecimal::zero() {
        return Err(PipelineError::Malformed(format!("{} is negative: {}", field, raw)));
    }
    Ok(value)
}

fn normalize_address(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}

impl TryFrom<SwapEvent> for ParsedSwap {
    type Error = PipelineError;

    fn try_from(event: SwapEvent) -> Result<Self, Self::Error> {
        if event.pair_address.trim().is_empty() {
            return Err(PipelineError::Malformed("pairAddress is empty".to_string()));
        }
        if !event.price.is_finite() {
            return Err(PipelineError::Malformed(format!(
                "price is not finite in event {}",
                event.event_id
            )));
        }
        if event.gas_used < 0 {
            return Err(PipelineError::Malformed(format!(
                "gasUsed is negative: {}",
                event.gas_used
            )));
        }

        let volume_usd = match event.volume_usd {
            None => None,
            Some(v) if v.is_finite() && v >= 0.0 => {
                // Shortest round-trip spelling of the wire value, never exponent form
                let exact = BigDecimal::from_str(&v.to_string()).map_err(|e| {
                    PipelineError::Malformed(format!("volumeUSD {}: {}", v, e))
                })?;
                Some(exact.round(USD_SCALE))
            }
            Some(v) => {
                return Err(PipelineError::Malformed(format!("volumeUSD invalid: {}", v)));
            }
        };

        Ok(Self {
            amount0_in: parse_amount("amount0In", &event.amount0_in)?,
            amount1_in: parse_amount("amount1In", &event.amount1_in)?,
            amount0_out: parse_amount("amount0Out", &event.amount0_out)?,
            amount1_out: parse_amount("amount1Out", &event.amount1_out)?,
            gas_price: parse_amount("gasPrice", &event.gas_price)?,
            order: OrderKey {
                event_time: event.block_timestamp,
                log_index: event.log_index,
                block_number: event.block_number,
            },
            pair_address: normalize_address(&event.pair_address),
            token0: normalize_address(&event.token0),
            token1: normalize_address(&event.token1),
            sender: normalize_address(&event.sender),
            recipient: normalize_address(&event.recipient),
            token0_symbol: event.token0_symbol,
            token1_symbol: event.token1_symbol,
            price: event.price,
            volume_usd,
            gas_used: event.gas_used as u64,
            event_id: event.event_id,
            transaction_hash: event.transaction_hash,
            ingested_at: event.event_timestamp,
        })
    }
}

/// Identity of one accumulator instance: a pair and a half-open window
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowKey {
    pub pair_address: String,
    pub window_start: i64,
    pub window_end: i64,
}

impl WindowKey {
    /// Deterministic id downstream consumers deduplicate on
    ///
    /// Pair addresses are hex, so `_` cannot occur inside them.
    pub fn window_id(&self) -> String {
        format!("{}_{}", self.pair_address, self.window_start)
    }

    pub fn contains(&self, event_time: i64) -> bool {
        self.window_start <= event_time && event_time < self.window_end
    }
}

impl std::fmt::Display for WindowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}, {})", self.pair_address, self.window_start, self.window_end)
    }
}

/// Per-window analytics record emitted on the output topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedAnalytics {
    pub window_id: String,
    pub window_start: i64,
    pub window_end: i64,
    pub pair_address: String,
    pub token0: String,
    pub token1: String,
    pub token0_symbol: Option<String>,
    pub token1_symbol: Option<String>,
    pub twap: f64,
    pub open_price: f64,
    pub close_price: f64,
    pub high_price: f64,
    pub low_price: f64,
    pub price_volatility: f64,
    pub total_volume0: String,
    pub total_volume1: String,
    #[serde(rename = "volumeUSD")]
    pub volume_usd: f64,
    pub swap_count: u64,
    pub unique_traders: u64,
    pub largest_swap_value: Option<String>,
    pub largest_swap_address: Option<String>,
    pub total_gas_used: u64,
    pub average_gas_price: String,
    pub arbitrage_count: u64,
    pub repeated_traders: Vec<String>,
    /// Wall-clock emission time (epoch millis)
    pub processed_at: i64,
}

impl AggregatedAnalytics {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
