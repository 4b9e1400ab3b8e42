//! Metadata engine of an erasure-coded object store.
//!
//! Tracks which objects exist, the ordered segments of each object and the
//! pieces of every segment, and reclaims expired and abandoned objects in
//! bounded batches.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;

#[cfg(test)]
pub(crate) mod testing;

pub use db::{DatabaseCollection, DbOptions};
pub use errors::{ErrorKind, MetabaseError, MetabaseResult};
pub use services::Metabase;
