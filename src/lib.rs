//! Chaincrawl Test Suite
//!
//! Cross-crate scenario tests that run the full crawler pipeline from
//! `chaincrawl-mono` against scripted chains and the in-memory collaborators
//! from `chaincrawl-memstore`.

pub mod tests;

pub use tests::{Scenario, ScenarioBuilder};
