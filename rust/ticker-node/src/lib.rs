//! Ticker node - host process for the `ticker-core` scheduler.
//!
//! - [`config`]: layered configuration and validation
//! - [`logging`]: subscriber setup and startup timing
//! - [`jobs`]: handlers compiled into the node, including the purge seed
//! - [`server`]: store and coordination wiring, run loop
//! - [`cli`]: command-line interface
//!
//! ```rust,ignore
//! use ticker_node::{config::AppConfig, server};
//!
//! let config = AppConfig::load(None)?;
//! server::run(config, tokio::signal::ctrl_c().map(|_| ())).await?;
//! ```

pub mod cli;
pub mod config;
pub mod jobs;
pub mod logging;
pub mod server;
