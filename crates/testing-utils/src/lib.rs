//! # Broker Testing Utils
//!
//! Shared testing utilities for the broker workspace: in-memory repositories
//! honouring the same atomic contracts as the SQLite ones, scripted provider
//! mocks, entity builders and small async helpers.
//!
//! ```toml
//! [dev-dependencies]
//! broker-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod helpers;
pub mod mocks;

// Re-export commonly used items
pub use builders::*;
pub use helpers::*;
pub use mocks::*;
