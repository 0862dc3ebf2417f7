//! File cache service
//!
//! Wires the fill pipeline to its concrete collaborators (the library,
//! downloader and files services plus Postgres) and exposes the admin API.

pub mod adapters;
pub mod config;
pub mod error;
pub mod server;

pub use config::Config;
pub use error::{AppError, Result, ServerError};
pub use server::{create_router, start_server, AppState};
