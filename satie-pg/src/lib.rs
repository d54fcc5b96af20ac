//! # satie-pg
//!
//! A small blocking PostgreSQL driver and synchronized connection pool for
//! the satie worker threads. Workers check a connection out, run a statement
//! or two inside one task, and hand it back.

pub mod connection;
pub mod error;
pub mod md5;
pub mod pool;
pub mod types;

pub use connection::{PgConfig, PgConnection, Row};
pub use error::{PgError, PgResult};
pub use pool::{PgGuard, PgPool};
pub use types::{PgValue, ToParam};
