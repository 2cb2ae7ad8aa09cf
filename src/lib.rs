//! Turnstile - Fixed-Window Rate Limiting Service
//!
//! This crate implements per-client request throttling for HTTP services.
//! Requests are counted per key within fixed time windows, with quotas
//! chosen by endpoint category and optionally raised for privileged roles.
//! Counters live in process memory by default, or in Redis when several
//! instances must share them.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
