//! Database module for uptrail.
//!
//! SQLite storage for the target registry and the check history.

mod models;
mod store;

pub use models::*;
pub use store::*;
