//! Optimistic query cache and remote data client for the catalog admin
//! console.

pub mod admin;
pub mod cache;
pub mod config;
pub mod logging;
