//! Data layer module
//!
//! Handles all persistence:
//! - ActivityStreams documents (`ASObject`)
//! - Stored entities, collection rows and queue jobs
//! - SQLite database operations

mod database;
mod models;
mod object;

pub use database::{Database, ItemFilter, hash_access_token};
pub use models::*;
pub use object::*;
