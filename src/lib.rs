//! # emsapi
//!
//! A Rust client for the EMS flight data analytics API.
//!
//! Queries against an EMS database are written with human-readable field names
//! and small comparison expressions. The crate resolves the names through a
//! [`MetadataStore`], translates each expression into the API's filter JSON
//! and sends the assembled query.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use emsapi::{cache, find_database, Aggregate, Connection, FieldTree, FltQuery, SearchType, SortOrder};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Reads credentials from ~/.config/ems/settings.conf
//!     let mut conn = Connection::new().await?;
//!     let ems_id = conn.ems_id(Some("ACME")).await?;
//!     let db = find_database(&mut conn, ems_id, "FDW Flights", SearchType::Contain).await?;
//!
//!     // Schema discovery is slow, so keep the tree around between runs.
//!     let tree = match cache::get_cached(conn.uri_root(), ems_id, &db, None) {
//!         Some(tree) => tree,
//!         None => {
//!             let mut tree = FieldTree::new(db.as_str());
//!             tree.fetch_path(&mut conn, ems_id, &["Flight Information", "Identification"]).await?;
//!             // Discrete filters need the value maps.
//!             tree.fetch_missing_discrete_values(&mut conn, ems_id).await?;
//!             cache::save_to_cache(conn.uri_root(), ems_id, &tree)?;
//!             tree
//!         }
//!     };
//!
//!     let mut query = FltQuery::new(ems_id, db.as_str(), &tree);
//!     query.select(&["Flight Record", "Flight Date (Exact)"], Aggregate::None)?;
//!     query.filter("'Flight Record' > 17000")?;
//!     query.filter("'Flight Date Confidence' in ['High', 'Low']")?;
//!     query.order_by("Flight Record", SortOrder::Asc)?;
//!     query.top(100);
//!
//!     let data = query.run(&mut conn).await?;
//!     println!("Got {} rows", data.len());
//!     data.to_csv("flights.csv")?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Filter expressions
//!
//! A filter is one of:
//! - `'Field' <op> value` with `op` one of `==`, `!=`, `<`, `<=`, `>`, `>=`,
//!   `in`, `not in`
//! - `'Field' is null` / `'Field' is not null`
//! - `low <op> 'Field' <op> high` for range checks on number fields
//!
//! What each field type accepts is listed on [`filter::build_node`].
//!
//! ## Configuration
//!
//! Credentials are read from a platform-specific config file:
//! - Linux: `~/.config/ems/settings.conf`
//! - macOS: `~/Library/Application Support/ems/settings.conf`
//! - Windows: `%LOCALAPPDATA%\ems\settings.conf`
//!
//! ```ini
//! [default]
//! username = your_username
//! password = your_password
//! server = prod
//! ```

pub mod cache;
pub mod config;
pub mod connection;
pub mod expr;
pub mod filter;
pub mod query;
pub mod schema;
pub mod types;

// Re-export main types for convenience
pub use cache::{cache_dir, cache_stats, clear_cache, CacheStats};
pub use config::Config;
pub use connection::{find_ems_system, Connection, EmsSystem};
pub use expr::{split_expr, Expression, Literal};
pub use filter::{build_filter, FilterNode, FilterOperator};
pub use query::{FltQuery, GroupOperator, QuerySet};
pub use schema::{find_database, DatabaseInfo, FieldGroup, FieldTree, MetadataStore, SearchType};
pub use types::{Aggregate, EmsError, FieldDescriptor, FieldType, QueryResult, Result, SortOrder};

// Re-export polars DataFrame for convenience
pub use polars::frame::DataFrame;

use std::path::Path;

/// Write a DataFrame to a CSV file.
pub fn write_csv(df: &DataFrame, path: impl AsRef<Path>) -> Result<()> {
    use polars::prelude::*;
    let mut file = std::fs::File::create(path.as_ref())?;
    CsvWriter::new(&mut file)
        .finish(&mut df.clone())
        .map_err(|e| EmsError::DataConversion(format!("Failed to write CSV: {}", e)))?;
    Ok(())
}

/// Write a DataFrame to a Parquet file.
pub fn write_parquet(df: &DataFrame, path: impl AsRef<Path>) -> Result<()> {
    use polars::prelude::*;
    let mut file = std::fs::File::create(path.as_ref())?;
    ParquetWriter::new(&mut file)
        .finish(&mut df.clone())
        .map_err(|e| EmsError::DataConversion(format!("Failed to write Parquet: {}", e)))?;
    Ok(())
}
