//! Core library for the `mppt` maximum power point tracker.
//!
//! This library contains the instrument traits, the safety envelope, the
//! measurement protocols and the tracking state machine. It is used by the
//! `mppt` binary and by the integration tests.

pub mod adapters;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod measurement;
pub mod report;
pub mod safety;
pub mod session;
pub mod shutter;
pub mod sourcemeter;
pub mod tracker;
