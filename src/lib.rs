//! swapflow - windowed analytics over decentralized-exchange swap streams
//!
//! Consumes swap events keyed by pair address and emits one
//! [`AggregatedAnalytics`](pipeline::AggregatedAnalytics) record per pair per
//! five-minute event-time window.

pub mod pipeline;
