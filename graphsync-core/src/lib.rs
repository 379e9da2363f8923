//! Persisted workspace state for graphsync: hidden refs, column layout and
//! dismissed banners, stored in a WAL-mode SQLite database.

pub mod db;
pub mod schema;
pub mod types;
