//! Warden - In-Process Admission Control
//!
//! This crate gates inbound requests per caller identity with fixed-window
//! counters. Five predefined profiles (general, auth, password reset,
//! registration, strict) share one limiter implementation over independent
//! stores, and an axum middleware plugs any of them into a router.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
