//! Bindings from the concrete clients and database to the pipeline's traits

mod http;
mod postgres;

pub use http::{HttpCatalog, HttpSink, HttpSource};
pub use postgres::{PgCacheIndex, PgLockManager, PgTaskQueue};
