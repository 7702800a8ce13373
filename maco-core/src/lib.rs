//! MACO core: domain types, providers, normalization, canonical store, engines.
//!
//! This crate holds everything a job needs below the orchestration layer:
//! - Domain types (bars, features, signals, predictions, audit records)
//! - Provider adapters behind one `PriceProvider` trait (Yahoo, Finnhub, synthetic)
//! - Normalizer with validation and drift flagging
//! - Keyed, idempotent canonical store on SQLite
//! - SMA feature engine (full and incremental), crossover signal engine, predictor
//! - Pipeline configuration and the raw payload archive

pub mod archive;
pub mod config;
pub mod data;
pub mod domain;
pub mod engine;
pub mod store;

#[cfg(test)]
pub(crate) mod test_support;
