//! # BEM IDO
//!
//! Reads current problem state from an Icinga IDO database.
//!
//! ```text
//! fetch_problems()
//!   ├── problem hosts     (hard, non-OK, no downtime, not acknowledged)
//!   ├── problem services  (same, and owning host is UP)
//!   └── enrichment        (one query for the objects' own vars,
//!                          one for the owning hosts' vars of services)
//! ```

pub mod fetcher;
#[cfg(any(test, feature = "test-support"))]
pub mod fixture;

pub use fetcher::{IdoDb, ProblemSet};
#[cfg(any(test, feature = "test-support"))]
pub use fixture::IdoFixture;
