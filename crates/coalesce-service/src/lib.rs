#[macro_use]
pub mod metrics;

pub mod cache;
mod chain;
pub mod config;
pub mod error;
pub mod logging;
pub mod promise;
pub mod quakes;
pub mod sources;
