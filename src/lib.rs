//! Tollgate - Request Admission Control
//!
//! This crate implements the admission-control layer that sits in front of
//! an HTTP API. Each request is matched to a limiting policy by an ordered
//! rule table, counted under a caller identity in a shared fixed-window
//! counter store, and either admitted with standard rate limit headers or
//! rejected with a 429. Failures of the limiting infrastructure fail open.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
