//! esports-ingest - incremental ingestion of esports data
//!
//! This crate keeps a local store of organizations, players, tournaments,
//! earnings and transfers in step with remote catalogs. It provides a bearer
//! token manager for the authenticated game-platform API and a generic,
//! rate-limited reconciliation loop that only fetches what changed.

pub mod auth;
pub mod clock;
pub mod config;
pub mod database;
pub mod error;
pub mod jobs;
pub mod logging;
pub mod models;
pub mod sync;
