//!
//! Restoring archived WAL for PostgreSQL's `restore_command`, with a local
//! spool of files prefetched ahead of PostgreSQL's requests.
//!
mod child_stdio_to_log;
pub mod config;
pub mod fetch;
pub mod restorer;
pub mod segment;
pub mod spool;
