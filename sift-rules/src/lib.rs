//! sift-rules - domain rule matching and conflict tracking
//!
//! This crate holds the pure routing-policy state of the engine:
//!
//! - [`DomainMatcher`]: a keyed rule set classifying DNS names as
//!   tunnel or direct, with exact and `*.suffix` wildcard patterns.
//! - [`ConflictDetector`]: tracks which IP addresses have been observed
//!   as answers for both tunnel and direct names within a freshness
//!   window, so the route injector can refuse ambiguous addresses.
//!
//! Both types are synchronous and `Send`; callers wrap them in the
//! locking discipline they need (the engine uses `RwLock` for the
//! matcher and `Mutex` for the detector).

mod conflict;
pub mod error;
mod matcher;

pub use conflict::{Conflict, ConflictChange, ConflictDetector, DetectorStats, Mapping};
pub use error::{Error, Result};
pub use matcher::{normalize_name, validate_pattern, DomainMatcher, MatchResult, Rule};
