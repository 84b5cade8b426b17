//! # History Testing Utils
//!
//! Shared fakes, mocks and builders for the history service crates.
//!
//! ```toml
//! [dev-dependencies]
//! history-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use helpers::*;
pub use mocks::*;
