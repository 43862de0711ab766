//! Persistence layer: entity models, the `Database` trait, and the libSQL
//! backend.

pub mod libsql_backend;
pub mod migrations;
pub mod model;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::Database;
