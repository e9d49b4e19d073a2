//! Hourly multi-region electricity reconciliation and consumption-based
//! emissions attribution.
//!
//! A reconciled electricity stage (demand, net generation, interchange per
//! balancing region) and a production stage (pollutant mass per region) are
//! combined into consumption-attributed emissions, attributed trade flows and
//! emission factors.

pub mod attribution;
pub mod config;
pub mod domain;
pub mod pipeline;
pub mod reconcile;
pub mod solver;
pub mod store;
pub mod telemetry;
