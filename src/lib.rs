//! convoy - release batch orchestrator
//!
//! An operator bundles application versions into a reviewable batch; convoy
//! seals it and drives it through the pre-production and production waves
//! via three nested state machines, honouring per-app release dependencies
//! and dispatching chart installations through pluggable drivers.
//!
//! The crate doubles as a library: the HTTP layer embedding convoy calls
//! into [`services::engine::Engine`] for commands and status reads, while
//! the `convoy` binary hosts the scanner and its batch workers.

pub mod cli;
pub mod commands;
pub mod config;
pub mod domain;
pub mod drivers;
pub mod error;
pub mod infrastructure;
pub mod services;
pub mod tools;
