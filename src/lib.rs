pub mod api;
pub mod database;
pub mod error;
pub mod models;
pub mod pricing;
pub mod reconciler;
pub mod settings;
pub mod utils;

pub use database::{DatabaseManagerSqlx, EquityStore};
pub use error::{IngestError, Result};
