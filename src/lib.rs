//! Storage layer for a Gmail sorting service: linked accounts, fetched
//! messages, and their AI categorizations, kept in SQLite and brought up to
//! date by an ordered set of schema changesets.

pub mod config;
pub mod db;
pub mod migrations;
pub mod schema;
pub mod util;
