//! Shared utilities for the filegate file-serving core.
//!
//! # Components
//!
//! - [`TtlMap`] - Explicit time-to-live map with lazy expiry and a background sweeper
//! - [`AsyncTtlCache`] - Moka-backed async cache with coalesced loading
//! - [`SingleFlight`] - Collapses concurrent calls sharing a key into one execution
//! - [`ErrorCategory`] - Error classification convertible to errno, HTTP, business and FTP codes
//!
//! ## TtlMap
//!
//! The download-link registry, the rate-limiter registry and the FTP session
//! cache all need the same contract: an entry is visible until its deadline,
//! expired entries are dropped when touched, and a periodic sweep reclaims the
//! ones nobody touches again. [`TtlMap`] provides exactly that on top of
//! `DashMap`, with no timer wheel of its own.
//!
//! ## ErrorCategory
//!
//! Each protocol surface needs a different error representation:
//! - HTTP: status code plus a stable business code
//! - FTP: a three digit reply code
//! - local tooling: POSIX errno values
//!
//! [`ErrorCategory`] is the intermediate representation all three derive from.

pub mod error_category;
pub mod format;
pub mod moka_cache;
pub mod single_flight;
pub mod ttl_map;

pub use error_category::{ErrorCategory, business_code};
pub use format::format_bytes;
pub use moka_cache::AsyncTtlCache;
pub use single_flight::SingleFlight;
pub use ttl_map::{SweeperHandle, TtlMap};
