//! Turnstile - per-client admission control for HTTP services
//!
//! This crate decides, per client key, whether a request may proceed or must
//! be turned away because the client is sending faster than its allotted
//! rate. Each key owns an independent token bucket, created on first use and
//! refilled lazily from elapsed time. The [`http::AdmissionLayer`] puts the
//! decision in front of any tower service.

pub mod config;
pub mod error;
pub mod http;
pub mod metrics;
pub mod ratelimit;
