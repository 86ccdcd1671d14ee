//! # tickscope-core
//!
//! Core library for tickscope, a live viewer for tick-indexed simulation
//! captures.
//!
//! This library provides:
//! - Line-oriented capture ingestion from files and HTTP sources
//! - A byte-budgeted frame cache shared by all captures
//! - The display/agent control channel
//! - Streaming derivations and user-supplied plugins
//! - SQLite persistence for capture sources, uploads, and plugins
//!
//! ## Architecture
//!
//! Data flows through three stages:
//! - **Sources:** append-only JSONL capture files, local or remote (immutable input)
//! - **Frames:** parsed per-tick records, cached and streamed to the display
//! - **Derived:** captures computed from other captures (regenerable)
//!
//! ## Example
//!
//! ```rust,no_run
//! use tickscope_core::{Config, Store};
//!
//! # async fn run() -> tickscope_core::Result<()> {
//! let config = Config::load()?;
//! let store = Store::open(config)?;
//! println!("{} captures restored", store.list_captures().len());
//! store.shutdown().await;
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use db::Database;
pub use error::{Error, Result};
pub use store::{SeriesRequest, SourceRequest, Store, StoreStatus, UploadOutcome};
pub use types::*;

// Public modules
pub mod cache;
pub mod config;
pub mod control;
pub mod db;
pub mod derive;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod plugin;
pub mod query;
pub mod registry;
pub mod store;
pub mod types;
