//! Circulation rules for a college library: members, books and loans, with
//! session-gated access for students and administrators.
//!
//! Storage sits behind [`store::EntityStore`]; [`local_store::LocalStore`]
//! keeps everything as JSON in memory (optionally mirrored to a file) and
//! [`pg_store::PgStore`] uses Postgres.

pub mod access;
pub mod catalog;
pub mod circulation;
pub mod clock;
pub mod config;
pub mod error;
pub mod fine;
pub mod local_store;
pub mod models;
pub mod pg_store;
pub mod session;
pub mod store;
