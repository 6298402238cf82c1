//! kis-trader: automated overseas-stock trading backend for the Korea
//! Investment & Securities open API.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod api;
pub mod broker;
pub mod config;
pub mod scheduler;
pub mod signals;
pub mod storage;
pub mod types;
