//! Core modules for Vigil's governance plane.
//!
//! Shared primitives live here: the store handle, SQLite access, the write
//! broker, leases, credentials, configuration, and the error taxonomy.

pub mod auth;
pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod index;
pub mod lease;
pub mod schemas;
pub mod store;
pub mod time;
