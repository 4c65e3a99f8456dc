//! FundStore application crate: the record types of the fund accounting
//! model, configuration, logging, seed data bootstrapping and the wiring
//! that assembles a [`fundstore_core::Store`] from configuration.

pub mod bootstrap;
pub mod config;
pub mod logging;
pub mod report;
pub mod types;
pub mod wiring;
