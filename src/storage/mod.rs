//! Storage layer.
//!
//! Two engines sit behind one query contract:
//! - **Embedded**: a single `SQLite` file connection
//! - **Relational**: a pooled PostgreSQL server (feature `postgres`)
//!
//! [`ConnectionManager`] owns the live [`Backend`]; everything else asks it
//! for a snapshot and issues queries through that.

// Dropping a connection guard slightly early gains nothing here.
#![allow(clippy::significant_drop_tightening)]

mod backend;
pub mod embedded;
mod lifecycle;
pub mod migrations;
#[cfg(feature = "postgres")]
pub mod relational;
mod value;

pub use backend::{
    Backend, BackendOptions, DEFAULT_POOL_SIZE, SERVERLESS_POOL_SIZE, SESSION_TIMEZONE,
    ScopedConnection,
};
pub use lifecycle::ConnectionManager;
pub use value::{QueryResult, Row, SqlValue, WriteSummary, row_i64, row_str};
