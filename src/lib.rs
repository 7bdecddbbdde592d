pub mod api;
pub mod cli;
pub mod config;
pub mod error;
pub mod job;
pub mod pool;
pub mod rate;
pub mod reporter;
pub mod sensor;
pub mod spec;
pub mod stats;
pub mod strategy;
pub mod testutil;
pub mod transport;
