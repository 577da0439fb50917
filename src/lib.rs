//! Slidelimit - In-process Sliding-Window Rate Limiter
//!
//! This crate decides, per caller key, whether a new request may proceed
//! given a trailing time window and a maximum request count. Decisions for
//! one key are linearizable under concurrent callers while unrelated keys
//! are accounted on independently locked shards.

pub mod config;
pub mod error;
pub mod ratelimit;
