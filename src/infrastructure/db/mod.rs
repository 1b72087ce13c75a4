pub mod executor;

pub use executor::{PostgresExecutor, SqlExecutor, SqliteExecutor};
