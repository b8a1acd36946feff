//! Signed webhook ingestion and real-time activity streaming for monitored
//! wallet addresses.

pub mod activity;
pub mod api;
pub mod broadcaster;
pub mod config;
pub mod db;
pub mod error;
pub mod extractor;
pub mod membership;
pub mod memory;
pub mod payload;
pub mod registry;
pub mod signature;
pub mod types;
