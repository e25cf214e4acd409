//! statcache library
//!
//! A caching proxy for a remote COVID-19 statistics API: an in-memory entry
//! table, a durable snapshot store and a single-flight refresh orchestrator,
//! with derived views (rates, risk, deltas, comparisons) computed on read.

pub mod cache;
pub mod cli;
pub mod config;
pub mod data;
pub mod derived;
pub mod error;
pub mod refresh;
pub mod service;
