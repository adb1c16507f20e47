//! Turnstile - In-process Admission Control
//!
//! This crate decides, per caller key, whether a unit of work may proceed.
//! It offers a continuous-refill token bucket and an exact sliding-window
//! counter, optional blocking penalties after a denial, refunds based on the
//! outcome of admitted work, and adapters for `http` hosts and a simple
//! line protocol.

pub mod adapter;
pub mod config;
pub mod error;
pub mod protocol;
pub mod ratelimit;
